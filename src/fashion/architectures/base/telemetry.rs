//! Scalar time-series sinks for training telemetry.
//!
//! Series names used by the trainer: `loss` and `batch_acc` (indexed by batch),
//! `epoch_loss`, `epoch_acc` and `valid_acc` (indexed by epoch) and `test_acc`
//! (indexed by the last epoch).

use std::fs::{self, File};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::fashion::error::Result;

pub const LOSS: &str = "loss";
pub const BATCH_ACC: &str = "batch_acc";
pub const EPOCH_LOSS: &str = "epoch_loss";
pub const EPOCH_ACC: &str = "epoch_acc";
pub const VALID_ACC: &str = "valid_acc";
pub const TEST_ACC: &str = "test_acc";

/// Receiver of named scalar series.
pub trait MetricsSink {
    fn scalar(&mut self, name: &str, step: usize, value: f64) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes every point to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn scalar(&mut self, name: &str, step: usize, value: f64) -> Result<()> {
        match name {
            LOSS | BATCH_ACC => log::debug!("{} [{}] = {:.5}", name, step, value),
            _ => log::info!("{} [{}] = {:.5}", name, step, value),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub name: String,
    pub step: usize,
    pub value: f64,
}

/// Keeps points in memory; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    points: Arc<Mutex<Vec<MetricPoint>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Values of one series in insertion order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.points()
            .into_iter()
            .filter(|p| p.name == name)
            .map(|p| (p.step, p.value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn scalar(&mut self, name: &str, step: usize, value: f64) -> Result<()> {
        self.points
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(MetricPoint {
                name: name.to_string(),
                step,
                value,
            });
        Ok(())
    }
}

/// Appends `name,step,value` rows to `metrics.csv` in a log directory.
#[derive(Debug)]
pub struct CsvSink {
    writer: csv::Writer<File>,
}

impl CsvSink {
    pub const FILE_NAME: &'static str = "metrics.csv";

    pub fn create(log_dir: &Path) -> Result<Self> {
        fs::create_dir_all(log_dir)?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(log_dir.join(Self::FILE_NAME))?;
        writer.write_record(["name", "step", "value"])?;
        Ok(Self { writer })
    }
}

impl MetricsSink for CsvSink {
    fn scalar(&mut self, name: &str, step: usize, value: f64) -> Result<()> {
        self.writer.serialize((name, step, value))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every point to several sinks.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricsSink for FanoutSink {
    fn scalar(&mut self, name: &str, step: usize, value: f64) -> Result<()> {
        for sink in &mut self.sinks {
            sink.scalar(name, step, value)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in &mut self.sinks {
            sink.flush()?;
        }
        Ok(())
    }
}
