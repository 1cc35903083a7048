use crate::models::{Architecture, Model};
use crate::param_tree::ParamTree;
use crate::safetensor_utils::{read_safetensors, SafetensorIoError};
use crate::tensor::NamedTensor;
use std::path::Path;
use tessera_core::{DType, LogicalAxis};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum PretrainedLoadError {
    #[error(transparent)]
    Read(#[from] SafetensorIoError),

    #[error("checkpoint at {path} has no tensor usable as {expected:?}")]
    MissingTensor { path: String, expected: String },

    #[error("tensor {name} has shape {shape:?}, expected a square logit table")]
    NotSquare { name: String, shape: Vec<usize> },
}

/// Load externally-produced weights (a bare safetensors file, e.g. a
/// converted HF checkpoint) into a model. Used only at fresh-start
/// initialization; it is independent of the trainer's own checkpoint
/// format, which carries optimizer and RNG state as well.
pub fn load_pretrained(
    architecture: Architecture,
    path: &Path,
) -> Result<Model, PretrainedLoadError> {
    let raw = read_safetensors(path)?;
    let params = match &architecture {
        Architecture::Bigram(_) => adopt_bigram(raw, path)?,
        Architecture::Fixture(_) => raw,
    };
    let model = Model::from_parts(architecture, params);
    info!(
        path = %path.display(),
        parameters = model.num_parameters(),
        "loaded pretrained weights"
    );
    Ok(model)
}

/// External files may lack our axis names; rebuild the logit table
/// under canonical axes, validating squareness.
fn adopt_bigram(raw: ParamTree, path: &Path) -> Result<ParamTree, PretrainedLoadError> {
    const LOGITS: &str = "lm_head.weight";
    let tensor = raw
        .get(LOGITS)
        .ok_or_else(|| PretrainedLoadError::MissingTensor {
            path: path.display().to_string(),
            expected: LOGITS.to_string(),
        })?;
    let shape: Vec<usize> = tensor.axes().iter().map(|a| a.size).collect();
    match shape.as_slice() {
        [rows, cols] if rows == cols => {
            let vocab = *rows;
            let rebuilt = NamedTensor::new(
                vec![
                    LogicalAxis::new("context", vocab),
                    LogicalAxis::new("vocab", vocab),
                ],
                DType::F32,
                tensor.data().to_vec(),
            )
            .expect("square table data length is consistent");
            let mut params = ParamTree::new();
            params.insert(LOGITS, rebuilt);
            Ok(params)
        }
        _ => Err(PretrainedLoadError::NotSquare {
            name: LOGITS.to_string(),
            shape,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BigramConfig;
    use crate::safetensor_utils::write_safetensors;

    #[test]
    fn loads_bare_logit_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pretrained.safetensors");

        let mut external = ParamTree::new();
        external.insert(
            "lm_head.weight",
            NamedTensor::new(
                vec![LogicalAxis::new("dim0", 3), LogicalAxis::new("dim1", 3)],
                DType::F32,
                (0..9).map(|i| i as f32).collect(),
            )
            .unwrap(),
        );
        write_safetensors(&path, &external).unwrap();

        let model =
            load_pretrained(Architecture::Bigram(BigramConfig::default()), &path).unwrap();
        let logits = model.params().get("lm_head.weight").unwrap();
        assert_eq!(logits.axes()[0].name, "context");
        assert_eq!(logits.axes()[1].name, "vocab");
        assert_eq!(logits.data()[4], 4.0);
    }

    #[test]
    fn rejects_non_square_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");
        let mut external = ParamTree::new();
        external.insert(
            "lm_head.weight",
            NamedTensor::new(
                vec![LogicalAxis::new("dim0", 2), LogicalAxis::new("dim1", 3)],
                DType::F32,
                vec![0.0; 6],
            )
            .unwrap(),
        );
        write_safetensors(&path, &external).unwrap();

        let err =
            load_pretrained(Architecture::Bigram(BigramConfig::default()), &path).unwrap_err();
        assert!(matches!(err, PretrainedLoadError::NotSquare { .. }));
    }
}
