//! Per-step metrics recording in JSONL form, for run comparison and
//! convergence regression checks.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::hooks::{Hook, StepInfo};

/// Metrics recorded for a single training step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetrics {
    pub step: u64,
    pub loss: f64,
    pub lr: f64,
    /// L2 norm across all parameters.
    pub global_weight_norm: f64,
    /// Phase label for two-phase runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    /// Milliseconds since UNIX epoch.
    pub timestamp_ms: u64,
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepMetrics {
    pub fn from_step(info: &StepInfo<'_>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            step: info.step,
            loss: info.loss,
            lr: info.lr,
            global_weight_norm: info.model.params().l2_norm(),
            phase: info.phase.map(str::to_string),
            timestamp_ms,
            duration_ms: info.duration.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub output_path: PathBuf,
    /// Record every N steps (1 = every step).
    pub record_every_n_steps: u64,
}

impl MetricsConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            record_every_n_steps: 1,
        }
    }

    pub fn record_every(mut self, n: u64) -> Self {
        self.record_every_n_steps = n.max(1);
        self
    }
}

/// Appends one JSON line per recorded step.
pub struct MetricsRecorder {
    writer: BufWriter<File>,
    steps_recorded: u64,
}

impl MetricsRecorder {
    pub fn new(output_path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(output_path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            steps_recorded: 0,
        })
    }

    pub fn record(&mut self, metrics: &StepMetrics) -> std::io::Result<()> {
        let json = serde_json::to_string(metrics)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        self.steps_recorded += 1;
        Ok(())
    }

    pub fn steps_recorded(&self) -> u64 {
        self.steps_recorded
    }
}

/// Read back a JSONL metrics file.
pub fn read_metrics(path: &Path) -> Result<Vec<StepMetrics>> {
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        out.push(serde_json::from_str(&line)?);
    }
    Ok(out)
}

/// Hook adapter over [`MetricsRecorder`]. Cadence is handled by the
/// hook registry; every dispatched step is recorded.
pub struct MetricsHook {
    recorder: MetricsRecorder,
}

impl MetricsHook {
    pub fn new(config: &MetricsConfig) -> std::io::Result<Self> {
        Ok(Self {
            recorder: MetricsRecorder::new(&config.output_path)?,
        })
    }
}

impl Hook for MetricsHook {
    fn on_step(&mut self, info: &StepInfo<'_>) -> Result<()> {
        self.recorder.record(&StepMetrics::from_step(info))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut recorder = MetricsRecorder::new(&path).unwrap();

        for step in 0..3 {
            recorder
                .record(&StepMetrics {
                    step,
                    loss: step as f64 * 0.5,
                    lr: 1e-3,
                    global_weight_norm: 1.0,
                    phase: Some("pretrain".into()),
                    timestamp_ms: 0,
                    duration_ms: 0,
                })
                .unwrap();
        }
        assert_eq!(recorder.steps_recorded(), 3);

        let metrics = read_metrics(&path).unwrap();
        assert_eq!(metrics.len(), 3);
        assert_eq!(metrics[1].step, 1);
        assert_eq!(metrics[1].loss, 0.5);
        assert_eq!(metrics[2].phase.as_deref(), Some("pretrain"));
    }

    #[test]
    fn appends_across_recorders() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        for step in 0..2 {
            let mut recorder = MetricsRecorder::new(&path).unwrap();
            recorder
                .record(&StepMetrics {
                    step,
                    loss: 0.0,
                    lr: 0.0,
                    global_weight_norm: 0.0,
                    phase: None,
                    timestamp_ms: 0,
                    duration_ms: 0,
                })
                .unwrap();
        }
        assert_eq!(read_metrics(&path).unwrap().len(), 2);
    }
}
