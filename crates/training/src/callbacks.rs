//! Epoch-end hooks: early stopping, best-checkpoint tracking, and the metrics sink.

use anyhow::Context;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::metrics::EvalMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorMode {
    Min,
    Max,
}

impl MonitorMode {
    /// Strictly better by more than `min_delta`. NaN never improves.
    pub fn improves(&self, value: f64, best: Option<f64>, min_delta: f64) -> bool {
        if value.is_nan() {
            return false;
        }
        match (self, best) {
            (_, None) => true,
            (MonitorMode::Max, Some(b)) => value > b + min_delta,
            (MonitorMode::Min, Some(b)) => value < b - min_delta,
        }
    }
}

/// Stops after `patience` consecutive epochs without improvement.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    monitor: String,
    mode: MonitorMode,
    patience: usize,
    min_delta: f64,
    best: Option<f64>,
    wait: usize,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    pub fn new(monitor: impl Into<String>, mode: MonitorMode, patience: usize) -> Self {
        Self {
            monitor: monitor.into(),
            mode,
            patience,
            min_delta: 0.0,
            best: None,
            wait: 0,
            stopped_epoch: None,
        }
    }

    pub fn with_min_delta(mut self, min_delta: f64) -> Self {
        self.min_delta = min_delta;
        self
    }

    /// Feed the monitored value for `epoch`; returns true when training should stop.
    pub fn update(&mut self, epoch: usize, value: f64) -> bool {
        if self.mode.improves(value, self.best, self.min_delta) {
            self.best = Some(value);
            self.wait = 0;
            return false;
        }
        self.wait += 1;
        if self.wait >= self.patience {
            self.stopped_epoch = Some(epoch);
            tracing::info!(
                monitor = %self.monitor,
                best = self.best.unwrap_or(f64::NAN),
                epoch,
                "early stopping: no improvement in {} epochs",
                self.patience
            );
            return true;
        }
        false
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn wait(&self) -> usize {
        self.wait
    }

    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }
}

/// Keeps exactly one checkpoint file: the best by the monitored value.
#[derive(Debug, Clone)]
pub struct BestCheckpoint {
    dir: PathBuf,
    mode: MonitorMode,
    best: Option<f64>,
    best_path: Option<PathBuf>,
}

impl BestCheckpoint {
    pub fn new(dir: impl Into<PathBuf>, mode: MonitorMode) -> Self {
        Self {
            dir: dir.into(),
            mode,
            best: None,
            best_path: None,
        }
    }

    /// `epoch={e}-val_loss={:.2}-cos_sims={:.2}-val_top1={:.2}.bin`
    pub fn filename(epoch: usize, metrics: &EvalMetrics) -> String {
        format!(
            "epoch={epoch}-val_loss={:.2}-cos_sims={:.2}-val_top1={:.2}.bin",
            metrics.loss, metrics.cos_sims, metrics.top1
        )
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }

    pub fn best_path(&self) -> Option<&Path> {
        self.best_path.as_deref()
    }

    /// Save through `save` when `value` beats the best so far, then drop the old file.
    pub fn update<F>(
        &mut self,
        epoch: usize,
        value: f64,
        metrics: &EvalMetrics,
        save: F,
    ) -> anyhow::Result<Option<PathBuf>>
    where
        F: FnOnce(&Path) -> anyhow::Result<()>,
    {
        if !self.mode.improves(value, self.best, 0.0) {
            return Ok(None);
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating checkpoint dir {}", self.dir.display()))?;
        let path = self.dir.join(Self::filename(epoch, metrics));
        save(&path)?;
        if let Some(old) = self.best_path.take() {
            if old != path {
                if let Err(e) = fs::remove_file(&old) {
                    tracing::warn!("failed to remove old checkpoint {}: {e}", old.display());
                }
            }
        }
        tracing::info!(epoch, value, "saved best checkpoint {}", path.display());
        self.best = Some(value);
        self.best_path = Some(path.clone());
        Ok(Some(path))
    }
}

/// Append-only JSONL sink for run metrics. Write failures are logged, never fatal.
#[derive(Debug, Clone)]
pub struct MetricsSink {
    path: Option<PathBuf>,
    run_name: String,
}

impl MetricsSink {
    pub fn new(path: Option<PathBuf>, run_name: impl Into<String>) -> Self {
        Self {
            path,
            run_name: run_name.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, "")
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn log(&self, kind: &str, fields: serde_json::Value) {
        let Some(path) = &self.path else {
            return;
        };
        let mut line = serde_json::json!({ "run": self.run_name, "kind": kind });
        if let (Some(obj), serde_json::Value::Object(extra)) = (line.as_object_mut(), fields) {
            obj.extend(extra);
        }
        if let Err(e) = append_line(path, &line.to_string()) {
            tracing::warn!("failed to write metrics to {}: {e}", path.display());
        }
    }
}

fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_stopping_fires_after_patience() {
        let mut es = EarlyStopping::new("val_top1", MonitorMode::Max, 3);
        assert!(!es.update(0, 0.5));
        assert!(!es.update(1, 0.6));
        // Equal is not an improvement.
        assert!(!es.update(2, 0.6));
        assert!(!es.update(3, 0.55));
        assert!(es.update(4, 0.6));
        assert_eq!(es.stopped_epoch(), Some(4));
        assert_eq!(es.best(), Some(0.6));
    }

    #[test]
    fn early_stopping_resets_on_improvement() {
        let mut es = EarlyStopping::new("val_loss", MonitorMode::Min, 2);
        assert!(!es.update(0, 1.0));
        assert!(!es.update(1, 1.5));
        assert!(!es.update(2, 0.9));
        assert_eq!(es.wait(), 0);
        assert!(!es.update(3, f64::NAN));
        assert!(es.update(4, 0.95));
    }

    #[test]
    fn best_checkpoint_keeps_one_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ckpt = BestCheckpoint::new(tmp.path().join("checkpoints"), MonitorMode::Max);
        let write = |p: &Path| -> anyhow::Result<()> {
            fs::write(p, b"w")?;
            Ok(())
        };
        let m = |top1: f32| EvalMetrics {
            loss: 1.234,
            cos_sims: 0.5,
            top1,
            ..Default::default()
        };

        let first = ckpt.update(0, 0.2, &m(0.2), write).unwrap().unwrap();
        assert_eq!(
            first.file_name().unwrap().to_str().unwrap(),
            "epoch=0-val_loss=1.23-cos_sims=0.50-val_top1=0.20.bin"
        );
        assert!(ckpt.update(1, 0.2, &m(0.2), write).unwrap().is_none());
        let second = ckpt.update(2, 0.4, &m(0.4), write).unwrap().unwrap();
        assert!(!first.exists());
        assert!(second.exists());
        assert_eq!(fs::read_dir(ckpt.dir()).unwrap().count(), 1);
        assert_eq!(ckpt.best_path(), Some(second.as_path()));
    }

    #[test]
    fn metrics_sink_appends_jsonl() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("logs").join("metrics.jsonl");
        let sink = MetricsSink::new(Some(path.clone()), "lr=0.001-gamma=0.01-[5]");
        sink.log("epoch", serde_json::json!({ "epoch": 0, "val_top1": 0.5 }));
        sink.log("epoch", serde_json::json!({ "epoch": 1, "val_top1": 0.6 }));
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 1);
        assert_eq!(lines[0]["run"], "lr=0.001-gamma=0.01-[5]");
        MetricsSink::disabled().log("epoch", serde_json::json!({}));
    }
}
