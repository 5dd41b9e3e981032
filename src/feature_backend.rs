//! Feature store backend contract and shipped implementations
//!
//! Any backend implementing [`FeatureBackend`] is interchangeable behind the
//! feature cache: an in-memory map (default and fallback target) and a
//! durable append-log store are provided. Interaction recording is an
//! explicit capability on the trait with a documented default (`false` /
//! no-op) so callers never inspect concrete backend types.

use crate::events::InteractionEvent;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Entity namespace for feature vectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Item,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Item => "item",
        }
    }
}

/// How a vector came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Derived from observed interactions
    Computed,
    /// Cold-start zero vector
    Default,
}

/// A feature vector owned by the cache layer. Overwritten whole on
/// recompute, never partially updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub kind: EntityKind,
    pub entity_id: String,
    pub values: Vec<f32>,
    pub computed_at: DateTime<Utc>,
    pub provenance: Provenance,
}

impl FeatureVector {
    pub fn computed(kind: EntityKind, entity_id: impl Into<String>, values: Vec<f32>) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            values,
            computed_at: Utc::now(),
            provenance: Provenance::Computed,
        }
    }

    /// Cold-start default: all zeros
    pub fn default_for(kind: EntityKind, entity_id: impl Into<String>, dim: usize) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            values: vec![0.0; dim],
            computed_at: Utc::now(),
            provenance: Provenance::Default,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }
}

/// Health probe result
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub healthy: bool,
    pub latency_ms: f64,
}

/// Durable feature storage contract consumed by the feature cache.
#[async_trait]
pub trait FeatureBackend: Send + Sync {
    async fn get_vector(&self, kind: EntityKind, id: &str) -> Result<Option<FeatureVector>>;

    async fn put_vector(&self, vector: FeatureVector) -> Result<()>;

    async fn get_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<HashMap<String, FeatureVector>>;

    async fn health_check(&self) -> Result<BackendHealth>;

    /// Whether this backend keeps its own interaction log. Most do not;
    /// the default is `false` and `record_interaction` is then a no-op
    /// that reports nothing was recorded.
    fn supports_interaction_recording(&self) -> bool {
        false
    }

    /// Records an interaction in backend-local storage. Returns whether
    /// anything was recorded.
    async fn record_interaction(&self, _event: &InteractionEvent) -> Result<bool> {
        Ok(false)
    }

    fn name(&self) -> &'static str;
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Hash-map backend. Default implementation and the fallback target when a
/// configured backend never becomes healthy.
pub struct MemoryFeatureBackend {
    vectors: RwLock<HashMap<(EntityKind, String), FeatureVector>>,
    interactions_recorded: AtomicU64,
}

impl MemoryFeatureBackend {
    pub fn new() -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
            interactions_recorded: AtomicU64::new(0),
        }
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.read().len()
    }

    pub fn interactions_recorded(&self) -> u64 {
        self.interactions_recorded.load(Ordering::Relaxed)
    }
}

impl Default for MemoryFeatureBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FeatureBackend for MemoryFeatureBackend {
    async fn get_vector(&self, kind: EntityKind, id: &str) -> Result<Option<FeatureVector>> {
        Ok(self.vectors.read().get(&(kind, id.to_string())).cloned())
    }

    async fn put_vector(&self, vector: FeatureVector) -> Result<()> {
        self.vectors
            .write()
            .insert((vector.kind, vector.entity_id.clone()), vector);
        Ok(())
    }

    async fn get_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<HashMap<String, FeatureVector>> {
        let vectors = self.vectors.read();
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(v) = vectors.get(&(kind, id.clone())) {
                out.insert(id.clone(), v.clone());
            }
        }
        Ok(out)
    }

    async fn health_check(&self) -> Result<BackendHealth> {
        let start = Instant::now();
        let _ = self.vectors.read().len();
        Ok(BackendHealth {
            healthy: true,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn supports_interaction_recording(&self) -> bool {
        true
    }

    async fn record_interaction(&self, _event: &InteractionEvent) -> Result<bool> {
        self.interactions_recorded.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// File-backed backend
// ============================================================================

/// Feature log magic number ("FLOG")
const FEATURE_LOG_MAGIC: u32 = 0x464C_4F47;

/// Feature log format version
const FEATURE_LOG_VERSION: u32 = 1;

/// Upper bound on a single record payload; anything larger is treated as a
/// corrupt length prefix
const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024;

/// Append-log backend: every put appends a checksummed record; the log is
/// replayed on open (later records win) and can be compacted into a fresh
/// log atomically via temp file + rename.
///
/// Record framing: `[len: u32 LE | bincode(FeatureVector) | crc32: u32 LE]`.
/// A torn or corrupt tail is dropped with a warning rather than failing
/// the open, matching crash-recovery expectations for append-only logs.
pub struct FileFeatureBackend {
    path: PathBuf,
    vectors: RwLock<HashMap<(EntityKind, String), FeatureVector>>,
    writer: Mutex<BufWriter<File>>,
}

impl FileFeatureBackend {
    /// Opens (or creates) the log at `path` and replays it into memory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create feature log dir {:?}", parent))?;
        }

        let vectors = if path.exists() {
            Self::replay(&path)?
        } else {
            let file = File::create(&path)
                .with_context(|| format!("create feature log {:?}", path))?;
            let mut writer = BufWriter::new(file);
            Self::write_header(&mut writer)?;
            writer.flush().context("flush feature log header")?;
            HashMap::new()
        };

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("open feature log {:?} for append", path))?;

        info!(
            path = %path.display(),
            vectors = vectors.len(),
            "opened feature log"
        );

        Ok(Self {
            path,
            vectors: RwLock::new(vectors),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_header(writer: &mut impl Write) -> Result<()> {
        writer.write_all(&FEATURE_LOG_MAGIC.to_le_bytes())?;
        writer.write_all(&FEATURE_LOG_VERSION.to_le_bytes())?;
        Ok(())
    }

    fn replay(path: &Path) -> Result<HashMap<(EntityKind, String), FeatureVector>> {
        let file =
            File::open(path).with_context(|| format!("open feature log {:?}", path))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .context("read feature log magic")?;
        if u32::from_le_bytes(magic) != FEATURE_LOG_MAGIC {
            bail!("not a feature log: bad magic in {:?}", path);
        }
        let mut version = [0u8; 4];
        reader
            .read_exact(&mut version)
            .context("read feature log version")?;
        let version = u32::from_le_bytes(version);
        if version != FEATURE_LOG_VERSION {
            bail!("unsupported feature log version {}", version);
        }

        let mut vectors = HashMap::new();
        let mut records = 0u64;
        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).context("read record length"),
            }
            let len = u32::from_le_bytes(len_bytes) as usize;
            if len > MAX_RECORD_BYTES {
                warn!(
                    path = %path.display(),
                    len, "implausible record length in feature log; dropping remainder"
                );
                break;
            }

            let mut payload = vec![0u8; len];
            if reader.read_exact(&mut payload).is_err() {
                warn!(path = %path.display(), "torn record at feature log tail; dropping");
                break;
            }
            let mut crc_bytes = [0u8; 4];
            if reader.read_exact(&mut crc_bytes).is_err() {
                warn!(path = %path.display(), "missing checksum at feature log tail; dropping");
                break;
            }
            let stored = u32::from_le_bytes(crc_bytes);
            let computed = crc32fast::hash(&payload);
            if stored != computed {
                warn!(
                    path = %path.display(),
                    stored = format!("{:#x}", stored),
                    computed = format!("{:#x}", computed),
                    "checksum mismatch in feature log; dropping remainder"
                );
                break;
            }

            let vector: FeatureVector =
                bincode::deserialize(&payload).context("decode feature record")?;
            vectors.insert((vector.kind, vector.entity_id.clone()), vector);
            records += 1;
        }

        debug!(records, live = vectors.len(), "replayed feature log");
        Ok(vectors)
    }

    fn append_record(&self, vector: &FeatureVector) -> Result<()> {
        let payload = bincode::serialize(vector).context("encode feature record")?;
        let crc = crc32fast::hash(&payload);

        let mut writer = self.writer.lock();
        writer.write_all(&(payload.len() as u32).to_le_bytes())?;
        writer.write_all(&payload)?;
        writer.write_all(&crc.to_le_bytes())?;
        writer.flush().context("flush feature log")?;
        Ok(())
    }

    /// Rewrites the log with one record per live entry. Atomic: written to
    /// a temp file, fsynced, then renamed over the old log.
    pub fn compact(&self) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)
                .with_context(|| format!("create {:?}", tmp_path))?;
            let mut writer = BufWriter::new(file);
            Self::write_header(&mut writer)?;

            let vectors = self.vectors.read();
            for vector in vectors.values() {
                let payload = bincode::serialize(vector).context("encode feature record")?;
                let crc = crc32fast::hash(&payload);
                writer.write_all(&(payload.len() as u32).to_le_bytes())?;
                writer.write_all(&payload)?;
                writer.write_all(&crc.to_le_bytes())?;
            }
            writer.flush()?;
            writer.get_ref().sync_all().context("fsync compacted log")?;
        }

        // Swap the append handle to the new log before renaming so no
        // record lands on the file being replaced.
        let mut writer = self.writer.lock();
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("rename {:?} over {:?}", tmp_path, self.path))?;
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .context("reopen compacted feature log")?;
        *writer = BufWriter::new(file);

        info!(path = %self.path.display(), "compacted feature log");
        Ok(())
    }

    pub fn vector_count(&self) -> usize {
        self.vectors.read().len()
    }
}

#[async_trait]
impl FeatureBackend for FileFeatureBackend {
    async fn get_vector(&self, kind: EntityKind, id: &str) -> Result<Option<FeatureVector>> {
        Ok(self.vectors.read().get(&(kind, id.to_string())).cloned())
    }

    async fn put_vector(&self, vector: FeatureVector) -> Result<()> {
        self.append_record(&vector)?;
        self.vectors
            .write()
            .insert((vector.kind, vector.entity_id.clone()), vector);
        Ok(())
    }

    async fn get_batch(
        &self,
        kind: EntityKind,
        ids: &[String],
    ) -> Result<HashMap<String, FeatureVector>> {
        let vectors = self.vectors.read();
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(v) = vectors.get(&(kind, id.clone())) {
                out.insert(id.clone(), v.clone());
            }
        }
        Ok(out)
    }

    async fn health_check(&self) -> Result<BackendHealth> {
        let start = Instant::now();
        let healthy = self.path.exists();
        Ok(BackendHealth {
            healthy,
            latency_ms: start.elapsed().as_secs_f64() * 1000.0,
        })
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

// ============================================================================
// Connection with backoff + fallback
// ============================================================================

/// Probes `candidate` with bounded exponential backoff; if it never reports
/// healthy, falls back to a fresh in-memory backend with a warning. This is
/// the only place in the crate that retries anything automatically.
pub async fn connect_with_fallback(
    candidate: Arc<dyn FeatureBackend>,
    max_attempts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
) -> Arc<dyn FeatureBackend> {
    let mut backoff = base_backoff;
    for attempt in 1..=max_attempts.max(1) {
        match candidate.health_check().await {
            Ok(health) if health.healthy => {
                info!(
                    backend = candidate.name(),
                    attempt,
                    latency_ms = health.latency_ms,
                    "feature backend healthy"
                );
                return candidate;
            }
            Ok(_) => {
                warn!(
                    backend = candidate.name(),
                    attempt, "feature backend unhealthy"
                );
            }
            Err(e) => {
                warn!(
                    backend = candidate.name(),
                    attempt,
                    error = %e,
                    "feature backend probe failed"
                );
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    warn!(
        backend = candidate.name(),
        "feature backend never became healthy; falling back to in-memory store"
    );
    crate::metrics::BACKEND_FALLBACKS_TOTAL.inc();
    Arc::new(MemoryFeatureBackend::new())
}
