//! Training execution seam
//!
//! Retraining itself is an external concern; the coordinator only needs
//! something it can invoke and await. [`ProcessTrainer`] shells out to a
//! training entrypoint, [`MockTrainer`] stands in for tests and the
//! simulation binary.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Mode flag handed to the training entrypoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainMode {
    Full,
    Incremental,
}

impl TrainMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrainMode::Full => "retrain",
            TrainMode::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainReport {
    pub mode: TrainMode,
    pub duration_ms: f64,
    pub message: String,
}

#[async_trait]
pub trait ModelTrainer: Send + Sync {
    async fn train(&self, mode: TrainMode) -> Result<TrainReport>;

    fn name(&self) -> &'static str {
        "trainer"
    }
}

/// Runs an external training program with `--mode <flag>` appended.
pub struct ProcessTrainer {
    program: String,
    args: Vec<String>,
}

impl ProcessTrainer {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }
}

fn tail(text: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(text);
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[async_trait]
impl ModelTrainer for ProcessTrainer {
    async fn train(&self, mode: TrainMode) -> Result<TrainReport> {
        let started = Instant::now();
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg("--mode")
            .arg(mode.as_str())
            .output()
            .await
            .with_context(|| format!("spawn trainer {}", self.program))?;
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        if !output.status.success() {
            bail!(
                "trainer {} exited with {}: {}",
                self.program,
                output.status,
                tail(&output.stderr, 400)
            );
        }
        info!(
            program = %self.program,
            mode = mode.as_str(),
            duration_ms,
            "trainer run finished"
        );
        Ok(TrainReport {
            mode,
            duration_ms,
            message: tail(&output.stdout, 400),
        })
    }

    fn name(&self) -> &'static str {
        "process"
    }
}

/// In-memory trainer with configurable latency and failure injection.
pub struct MockTrainer {
    delay: Duration,
    fail: AtomicBool,
    calls: AtomicU64,
}

impl MockTrainer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            fail: AtomicBool::new(false),
            calls: AtomicU64::new(0),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Acquire)
    }
}

impl Default for MockTrainer {
    fn default() -> Self {
        Self::new(Duration::from_millis(5))
    }
}

#[async_trait]
impl ModelTrainer for MockTrainer {
    async fn train(&self, mode: TrainMode) -> Result<TrainReport> {
        self.calls.fetch_add(1, Ordering::AcqRel);
        tokio::time::sleep(self.delay).await;
        if self.fail.load(Ordering::Acquire) {
            bail!("injected trainer failure");
        }
        Ok(TrainReport {
            mode,
            duration_ms: self.delay.as_secs_f64() * 1000.0,
            message: format!("mock run in mode {}", mode.as_str()),
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_trainer_reports_mode() {
        let trainer = MockTrainer::new(Duration::from_millis(1));
        let report = trainer.train(TrainMode::Full).await.unwrap();
        assert_eq!(report.mode, TrainMode::Full);
        assert_eq!(trainer.calls(), 1);

        let report = trainer.train(TrainMode::Incremental).await.unwrap();
        assert!(report.message.contains("incremental"));
        assert_eq!(trainer.calls(), 2);
    }

    #[tokio::test]
    async fn test_mock_trainer_failure_injection() {
        let trainer = MockTrainer::new(Duration::from_millis(1));
        trainer.set_failing(true);
        assert!(trainer.train(TrainMode::Full).await.is_err());

        trainer.set_failing(false);
        assert!(trainer.train(TrainMode::Full).await.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_trainer_success_and_failure() {
        let ok = ProcessTrainer::new("sh")
            .with_args(["-c".to_string(), "echo trained".to_string()]);
        let report = ok.train(TrainMode::Full).await.unwrap();
        assert!(report.message.contains("trained"));

        let bad = ProcessTrainer::new("sh")
            .with_args(["-c".to_string(), "echo boom >&2; exit 3".to_string()]);
        let err = bad.train(TrainMode::Incremental).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_mode_flags() {
        assert_eq!(TrainMode::Full.as_str(), "retrain");
        assert_eq!(TrainMode::Incremental.as_str(), "incremental");
    }
}
