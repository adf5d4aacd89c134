//! Scalar metrics recording
//!
//! The trainer hands every iteration's losses to a `MetricsSink`. Sinks are
//! fire-and-forget: a failed write is logged and training carries on.

use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// The four losses of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossBundle {
    pub l_rec: f32,
    pub l_sim: f32,
    pub l_adv_c: f32,
    pub l_adv_e: f32,
}

impl LossBundle {
    /// Tag/value pairs under the names used in metrics files
    pub fn entries(&self) -> [(&'static str, f32); 4] {
        [
            ("L_rec", self.l_rec),
            ("L_sim", self.l_sim),
            ("L_adv_C", self.l_adv_c),
            ("L_adv_E", self.l_adv_e),
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.entries().iter().all(|(_, v)| v.is_finite())
    }

    pub fn record_into(&self, sink: &mut dyn MetricsSink, step: usize) {
        for (tag, value) in self.entries() {
            sink.record(tag, value, step);
        }
    }
}

pub trait MetricsSink {
    fn record(&mut self, tag: &str, value: f32, step: usize);
}

/// One recorded scalar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub tag: String,
    pub value: f32,
    pub step: usize,
}

/// Appends one JSON object per scalar to `{log_dir}/metrics.jsonl`
pub struct JsonlMetricsSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlMetricsSink {
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref();
        fs::create_dir_all(log_dir)
            .with_context(|| format!("Failed to create log directory: {}", log_dir.display()))?;

        let path = log_dir.join("metrics.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open metrics file: {}", path.display()))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_record(&mut self, record: &MetricRecord) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl MetricsSink for JsonlMetricsSink {
    fn record(&mut self, tag: &str, value: f32, step: usize) {
        let record = MetricRecord {
            tag: tag.to_string(),
            value,
            step,
        };
        if let Err(e) = self.write_record(&record) {
            warn!("Dropping metric {}@{}: {:#}", tag, step, e);
        }
    }
}

/// Keeps everything in memory
#[derive(Debug, Default)]
pub struct MemoryMetricsSink {
    pub records: Vec<MetricRecord>,
}

impl MemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(step, value)` pairs for one tag, in recording order
    pub fn series(&self, tag: &str) -> Vec<(usize, f32)> {
        self.records
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| (r.step, r.value))
            .collect()
    }
}

impl MetricsSink for MemoryMetricsSink {
    fn record(&mut self, tag: &str, value: f32, step: usize) {
        self.records.push(MetricRecord {
            tag: tag.to_string(),
            value,
            step,
        });
    }
}

/// Discards everything
pub struct NullMetricsSink;

impl MetricsSink for NullMetricsSink {
    fn record(&mut self, _tag: &str, _value: f32, _step: usize) {}
}
