//! Persistent key/value store for stage state.
//!
//! All entries live in memory and are written as one JSON document. `put`
//! only marks the store dirty; [`BackendDb::process_pending`] hands a snapshot
//! to a background writer thread at most once per flush interval, so the
//! polling loop never blocks on disk. [`BackendDb::finish_pending_jobs`] is
//! the one blocking call and is meant for shutdown.
//!
//! A failed background write re-marks the store dirty and is retried on a
//! later pass. Unreadable or incompatible entries read back as `None` so
//! callers fall back to their defaults.

use crate::error::{LiveError, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default delay between background flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);

enum FlushJob {
    Write(String),
    Shutdown,
}

struct FlushResult(std::result::Result<(), String>);

struct DbInner {
    path: PathBuf,
    entries: BTreeMap<String, serde_json::Value>,
    dirty: bool,
    in_flight: usize,
    last_flush: Option<Instant>,
    flush_interval: Duration,
    job_tx: Sender<FlushJob>,
    result_rx: Receiver<FlushResult>,
    writer: Option<JoinHandle<()>>,
}

impl DbInner {
    fn collect_results(&mut self) {
        while let Ok(FlushResult(result)) = self.result_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            if let Err(e) = result {
                tracing::warn!("State flush to {:?} failed, will retry: {}", self.path, e);
                self.dirty = true;
            }
        }
    }

    fn submit(&mut self) -> Result<()> {
        let snapshot = serde_json::to_string_pretty(&self.entries)?;
        self.job_tx
            .send(FlushJob::Write(snapshot))
            .map_err(|_| LiveError::Persistence("state writer thread is gone".to_string()))?;
        self.dirty = false;
        self.in_flight += 1;
        self.last_flush = Some(Instant::now());
        Ok(())
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        let _ = self.job_tx.send(FlushJob::Shutdown);
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

fn writer_loop(path: PathBuf, jobs: Receiver<FlushJob>, results: Sender<FlushResult>) {
    for job in jobs {
        match job {
            FlushJob::Write(snapshot) => {
                let result = write_atomic(&path, &snapshot).map_err(|e| e.to_string());
                if result.is_ok() {
                    tracing::trace!("State written to {:?}", path);
                }
                if results.send(FlushResult(result)).is_err() {
                    break;
                }
            }
            FlushJob::Shutdown => break,
        }
    }
}

/// Shared handle to the state database. Clones refer to the same store.
#[derive(Clone)]
pub struct BackendDb {
    inner: Arc<Mutex<DbInner>>,
}

impl BackendDb {
    /// Open (or create) the store at `path` with the default flush interval.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_interval(path, DEFAULT_FLUSH_INTERVAL)
    }

    pub fn open_with_interval(path: impl Into<PathBuf>, flush_interval: Duration) -> Result<Self> {
        let path = path.into();
        let entries = Self::load_entries(&path)?;
        tracing::info!("Opened state database {:?} ({} entries)", path, entries.len());

        let (job_tx, job_rx) = unbounded();
        let (result_tx, result_rx) = unbounded();
        let writer_path = path.clone();
        let writer = std::thread::Builder::new()
            .name("state-db-writer".to_string())
            .spawn(move || writer_loop(writer_path, job_rx, result_tx))?;

        Ok(Self {
            inner: Arc::new(Mutex::new(DbInner {
                path,
                entries,
                dirty: false,
                in_flight: 0,
                last_flush: None,
                flush_interval,
                job_tx,
                result_rx,
                writer: Some(writer),
            })),
        })
    }

    fn load_entries(path: &Path) -> Result<BTreeMap<String, serde_json::Value>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => {
                return Err(LiveError::Persistence(format!(
                    "Failed to read state file {:?}: {}",
                    path, e
                )))
            }
        };
        match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!("State file {:?} is unreadable, starting empty: {}", path, e);
                Ok(BTreeMap::new())
            }
        }
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Deserialize the entry under `key`. Missing or incompatible entries
    /// return `None`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.inner.lock().entries.get(key).cloned()?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Ignoring incompatible state entry '{}': {}", key, e);
                None
            }
        }
    }

    pub fn get_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> T {
        self.get(key).unwrap_or_default()
    }

    /// Replace the entry under `key`. Written to disk on a later flush.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Failed to serialize state entry '{}': {}", key, e);
                return;
            }
        };
        let mut inner = self.inner.lock();
        if inner.entries.get(key) == Some(&value) {
            return;
        }
        inner.entries.insert(key.to_string(), value);
        inner.dirty = true;
    }

    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        if inner.entries.remove(key).is_some() {
            inner.dirty = true;
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().entries.keys().cloned().collect()
    }

    /// Drop every persisted entry.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.dirty = true;
        tracing::info!("State database cleared");
    }

    /// True when in-memory entries differ from what was last submitted.
    pub fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }

    /// Collect writer results and submit a new snapshot if one is due.
    /// Never blocks on disk I/O.
    pub fn process_pending(&self) {
        let mut inner = self.inner.lock();
        inner.collect_results();
        let due = inner
            .last_flush
            .map_or(true, |t| t.elapsed() >= inner.flush_interval);
        if inner.dirty && inner.in_flight == 0 && due {
            if let Err(e) = inner.submit() {
                tracing::warn!("Could not queue state flush: {}", e);
            }
        }
    }

    /// Flush everything and wait for the writer. Only the outcome of the
    /// final snapshot matters; an error here means state was not persisted.
    pub fn finish_pending_jobs(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.collect_results();
        if inner.dirty {
            inner.submit()?;
        }
        let mut last = Ok(());
        while inner.in_flight > 0 {
            match inner.result_rx.recv() {
                Ok(FlushResult(result)) => {
                    inner.in_flight -= 1;
                    last = result;
                }
                Err(_) => {
                    return Err(LiveError::Persistence(
                        "state writer thread stopped before flushing".to_string(),
                    ))
                }
            }
        }
        last.map_err(|e| {
            inner.dirty = true;
            LiveError::Persistence(format!("Failed to write {:?}: {}", inner.path, e))
        })
    }
}

impl std::fmt::Debug for BackendDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BackendDb")
            .field("path", &inner.path)
            .field("entries", &inner.entries.len())
            .field("dirty", &inner.dirty)
            .finish()
    }
}
