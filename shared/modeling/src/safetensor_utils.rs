use crate::param_tree::ParamTree;
use crate::tensor::NamedTensor;
use half::{bf16, f16};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::path::Path;
use tessera_core::{DType, LogicalAxis};
use thiserror::Error;

const AXES_META_PREFIX: &str = "axes:";

#[derive(Debug, Error)]
pub enum SafetensorIoError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("safetensors error on {path}: {source}")]
    Format {
        path: String,
        #[source]
        source: safetensors::SafeTensorError,
    },

    #[error("unsupported dtype {0:?} in {1}")]
    UnsupportedDtype(Dtype, String),

    #[error("tensor {name} in {path} is malformed: {reason}")]
    Malformed {
        name: String,
        path: String,
        reason: String,
    },
}

fn dtype_to_st(dtype: DType) -> Dtype {
    match dtype {
        DType::F32 => Dtype::F32,
        DType::Bf16 => Dtype::BF16,
        DType::F16 => Dtype::F16,
    }
}

fn tensor_bytes(tensor: &NamedTensor) -> Vec<u8> {
    match tensor.dtype() {
        DType::F32 => bytemuck::cast_slice::<f32, u8>(tensor.data()).to_vec(),
        DType::Bf16 => tensor
            .data()
            .iter()
            .flat_map(|v| bf16::from_f32(*v).to_le_bytes())
            .collect(),
        DType::F16 => tensor
            .data()
            .iter()
            .flat_map(|v| f16::from_f32(*v).to_le_bytes())
            .collect(),
    }
}

fn values_from_bytes(
    dtype: Dtype,
    bytes: &[u8],
    name: &str,
    path: &str,
) -> Result<(DType, Vec<f32>), SafetensorIoError> {
    match dtype {
        Dtype::F32 => Ok((
            DType::F32,
            bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )),
        Dtype::BF16 => Ok((
            DType::Bf16,
            bytes
                .chunks_exact(2)
                .map(|c| bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
        )),
        Dtype::F16 => Ok((
            DType::F16,
            bytes
                .chunks_exact(2)
                .map(|c| f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
        )),
        other => Err(SafetensorIoError::UnsupportedDtype(
            other,
            format!("{name} in {path}"),
        )),
    }
}

/// Persist a parameter tree as a safetensors file. Logical axis names
/// are carried in the metadata block so `read_safetensors` can rebuild
/// named shapes; plain shapes are still readable by external tooling.
pub fn write_safetensors(path: &Path, tree: &ParamTree) -> Result<(), SafetensorIoError> {
    let path_str = path.display().to_string();
    let mut metadata = HashMap::new();
    let buffers: Vec<(String, Dtype, Vec<usize>, Vec<u8>)> = tree
        .iter()
        .map(|(name, tensor)| {
            let axes_desc: Vec<String> = tensor
                .axes()
                .iter()
                .map(|a| format!("{}:{}", a.name, a.size))
                .collect();
            metadata.insert(format!("{AXES_META_PREFIX}{name}"), axes_desc.join(","));
            (
                name.clone(),
                dtype_to_st(tensor.dtype()),
                tensor.axes().iter().map(|a| a.size).collect(),
                tensor_bytes(tensor),
            )
        })
        .collect();

    let views: Vec<(String, TensorView)> = buffers
        .iter()
        .map(|(name, dtype, shape, bytes)| {
            TensorView::new(*dtype, shape.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|source| SafetensorIoError::Format {
                    path: path_str.clone(),
                    source,
                })
        })
        .collect::<Result<_, _>>()?;

    // safetensors' length hint counts metadata entries rather than the
    // single `__metadata__` key, so `Some(empty)` with zero tensors hits
    // serde_json's empty-map fast path and writes a corrupt header; pass
    // `None` instead — the reader treats both the same
    let metadata = if metadata.is_empty() {
        None
    } else {
        Some(metadata)
    };
    safetensors::serialize_to_file(views, &metadata, path).map_err(|source| {
        SafetensorIoError::Format {
            path: path_str,
            source,
        }
    })
}

/// Read a safetensors file back into a parameter tree. Files written
/// by external tools lack our axis metadata; their axes come back as
/// `dim0`, `dim1`, ... with sizes from the stored shape.
pub fn read_safetensors(path: &Path) -> Result<ParamTree, SafetensorIoError> {
    let path_str = path.display().to_string();
    let buffer = std::fs::read(path).map_err(|source| SafetensorIoError::Io {
        path: path_str.clone(),
        source,
    })?;

    let (_, header) =
        SafeTensors::read_metadata(&buffer).map_err(|source| SafetensorIoError::Format {
            path: path_str.clone(),
            source,
        })?;
    let axes_meta: HashMap<String, String> = header
        .metadata()
        .as_ref()
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(AXES_META_PREFIX)
                        .map(|name| (name.to_string(), v.clone()))
                })
                .collect()
        })
        .unwrap_or_default();

    let tensors =
        SafeTensors::deserialize(&buffer).map_err(|source| SafetensorIoError::Format {
            path: path_str.clone(),
            source,
        })?;

    let mut tree = ParamTree::new();
    for (name, view) in tensors.tensors() {
        let (dtype, values) = values_from_bytes(view.dtype(), view.data(), &name, &path_str)?;
        let axes = match axes_meta.get(&name) {
            Some(desc) => parse_axes(desc, &name, &path_str)?,
            None => view
                .shape()
                .iter()
                .enumerate()
                .map(|(i, size)| LogicalAxis::new(format!("dim{i}"), *size))
                .collect(),
        };
        let tensor =
            NamedTensor::new(axes, dtype, values).map_err(|err| SafetensorIoError::Malformed {
                name: name.clone(),
                path: path_str.clone(),
                reason: err.to_string(),
            })?;
        tree.insert(name, tensor);
    }
    Ok(tree)
}

fn parse_axes(desc: &str, name: &str, path: &str) -> Result<Vec<LogicalAxis>, SafetensorIoError> {
    desc.split(',')
        .map(|part| {
            let (axis_name, size) =
                part.rsplit_once(':')
                    .ok_or_else(|| SafetensorIoError::Malformed {
                        name: name.to_string(),
                        path: path.to_string(),
                        reason: format!("bad axes metadata {desc:?}"),
                    })?;
            let size = size.parse().map_err(|_| SafetensorIoError::Malformed {
                name: name.to_string(),
                path: path.to_string(),
                reason: format!("bad axis size in {desc:?}"),
            })?;
            Ok(LogicalAxis::new(axis_name, size))
        })
        .collect()
}
