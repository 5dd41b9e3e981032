//! Append-only CSV log of experiment impressions and conversions
//!
//! One record per row, no header, flushed on every write so that rows
//! survive a crash. Offline analysis replays the file with
//! [`load_records`] or the aggregated [`replay_totals`].

use anyhow::{Context, Result};
use chrono::Utc;
use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatsRecordKind {
    Impression,
    Conversion,
}

/// One logged allocation outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsRecord {
    pub timestamp: i64,
    pub kind: StatsRecordKind,
    pub experiment_id: String,
    pub variant_id: String,
    pub user_id: String,
    /// Revenue for conversions, 0.0 for impressions
    pub value: f64,
}

/// Aggregated per-variant view of a replayed log
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VariantTotals {
    pub impressions: u64,
    pub conversions: u64,
    pub revenue: f64,
}

/// Durable experiment stats writer.
///
/// The writer lives behind an async lock; `None` means logging was shut
/// down, in which case writes degrade to a warning instead of an error.
pub struct ExperimentStatsPersister {
    writer: RwLock<Option<csv::Writer<File>>>,
    path: PathBuf,
}

impl ExperimentStatsPersister {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create stats dir {}", parent.display()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open stats log {}", path.display()))?;
        let writer = WriterBuilder::new().has_headers(false).from_writer(file);
        info!(path = %path.display(), "experiment stats log opened");
        Ok(Self {
            writer: RwLock::new(Some(writer)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn log_impression(
        &self,
        experiment_id: &str,
        variant_id: &str,
        user_id: &str,
    ) -> Result<()> {
        self.append(StatsRecord {
            timestamp: Utc::now().timestamp(),
            kind: StatsRecordKind::Impression,
            experiment_id: experiment_id.to_string(),
            variant_id: variant_id.to_string(),
            user_id: user_id.to_string(),
            value: 0.0,
        })
        .await
    }

    pub async fn log_conversion(
        &self,
        experiment_id: &str,
        variant_id: &str,
        user_id: &str,
        revenue: Option<f64>,
    ) -> Result<()> {
        self.append(StatsRecord {
            timestamp: Utc::now().timestamp(),
            kind: StatsRecordKind::Conversion,
            experiment_id: experiment_id.to_string(),
            variant_id: variant_id.to_string(),
            user_id: user_id.to_string(),
            value: revenue.unwrap_or(0.0),
        })
        .await
    }

    async fn append(&self, record: StatsRecord) -> Result<()> {
        let mut guard = self.writer.write().await;
        match guard.as_mut() {
            Some(writer) => {
                writer
                    .serialize(&record)
                    .context("serialize stats record")?;
                writer.flush().context("flush stats log")?;
                Ok(())
            }
            None => {
                warn!("experiment stats log closed, dropping record");
                Ok(())
            }
        }
    }

    /// Flushes and closes the writer. Later writes become no-ops.
    pub async fn close(&self) -> Result<()> {
        let mut guard = self.writer.write().await;
        if let Some(mut writer) = guard.take() {
            writer.flush().context("flush stats log on close")?;
        }
        Ok(())
    }
}

/// Reads every record from a stats log.
pub fn load_records(path: impl AsRef<Path>) -> Result<Vec<StatsRecord>> {
    let path = path.as_ref();
    let file =
        File::open(path).with_context(|| format!("open stats log {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(file);
    let mut records = Vec::new();
    for row in reader.deserialize() {
        let record: StatsRecord = row.context("parse stats record")?;
        records.push(record);
    }
    Ok(records)
}

/// Replays a stats log into per-variant totals keyed by
/// `(experiment_id, variant_id)`.
pub fn replay_totals(
    path: impl AsRef<Path>,
) -> Result<HashMap<(String, String), VariantTotals>> {
    let mut totals: HashMap<(String, String), VariantTotals> = HashMap::new();
    for record in load_records(path)? {
        let entry = totals
            .entry((record.experiment_id, record.variant_id))
            .or_default();
        match record.kind {
            StatsRecordKind::Impression => entry.impressions += 1,
            StatsRecordKind::Conversion => {
                entry.conversions += 1;
                entry.revenue += record.value;
            }
        }
    }
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_log_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");
        let persister = ExperimentStatsPersister::new(&path).unwrap();

        persister
            .log_impression("exp_abc", "control", "user_1")
            .await
            .unwrap();
        persister
            .log_impression("exp_abc", "treatment", "user_2")
            .await
            .unwrap();
        persister
            .log_conversion("exp_abc", "treatment", "user_2", Some(12.5))
            .await
            .unwrap();

        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].kind, StatsRecordKind::Impression);
        assert_eq!(records[2].kind, StatsRecordKind::Conversion);
        assert_eq!(records[2].variant_id, "treatment");
        assert!((records[2].value - 12.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_replay_totals_aggregates_per_variant() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");
        let persister = ExperimentStatsPersister::new(&path).unwrap();

        for i in 0..5 {
            persister
                .log_impression("exp_abc", "control", &format!("user_{i}"))
                .await
                .unwrap();
        }
        persister
            .log_conversion("exp_abc", "control", "user_0", Some(3.0))
            .await
            .unwrap();
        persister
            .log_conversion("exp_abc", "control", "user_1", None)
            .await
            .unwrap();

        let totals = replay_totals(&path).unwrap();
        let control = &totals[&("exp_abc".to_string(), "control".to_string())];
        assert_eq!(control.impressions, 5);
        assert_eq!(control.conversions, 2);
        assert!((control.revenue - 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_reopen_appends_instead_of_truncating() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");

        {
            let persister = ExperimentStatsPersister::new(&path).unwrap();
            persister
                .log_impression("exp_abc", "control", "user_1")
                .await
                .unwrap();
            persister.close().await.unwrap();
        }
        {
            let persister = ExperimentStatsPersister::new(&path).unwrap();
            persister
                .log_impression("exp_abc", "control", "user_2")
                .await
                .unwrap();
        }

        let records = load_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].user_id, "user_2");
    }

    #[tokio::test]
    async fn test_closed_persister_drops_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stats.csv");
        let persister = ExperimentStatsPersister::new(&path).unwrap();
        persister.close().await.unwrap();

        persister
            .log_impression("exp_abc", "control", "user_1")
            .await
            .unwrap();
        let records = load_records(&path).unwrap();
        assert!(records.is_empty());
    }
}
