use crate::atomic::{read_json, write_json_atomic};
use chrono::{DateTime, Utc};
use escalor_core::{EscalorResult, Fingerprint};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// A cached execution result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    /// The successful handler output.
    pub result: String,
    pub produced_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn new(fingerprint: Fingerprint, result: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            fingerprint,
            result: result.into(),
            produced_at: Utc::now(),
            ttl_secs,
        }
    }

    /// Whether the entry has outlived its TTL at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.ttl_secs).unwrap_or(i64::MAX);
        now.signed_duration_since(self.produced_at).num_seconds() >= ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Content-addressed result cache: one JSON file per fingerprint.
///
/// Entries are published atomically, so a reader racing a writer sees
/// either the old entry or the new one. Concurrent puts for the same
/// fingerprint are last-write-wins. Expiry is lazy: an expired entry is
/// removed when a lookup finds it.
#[derive(Debug)]
pub struct ContentStore {
    dir: PathBuf,
}

impl ContentStore {
    pub async fn open(dir: PathBuf) -> EscalorResult<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn entry_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{fingerprint}.json"))
    }

    /// Look up an unexpired entry.
    pub async fn get(&self, fingerprint: &Fingerprint) -> EscalorResult<Option<CacheEntry>> {
        let path = self.entry_path(fingerprint);
        let Some(entry) = read_json::<CacheEntry>(&path).await? else {
            return Ok(None);
        };

        if entry.is_expired() {
            debug!(fingerprint = %fingerprint.short(), "evicting expired cache entry");
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Store an entry, replacing any previous one for the fingerprint.
    pub async fn put(&self, entry: &CacheEntry) -> EscalorResult<()> {
        let path = self.entry_path(&entry.fingerprint);
        write_json_atomic(&path, entry).await
    }

    /// Explicitly drop an entry. Returns whether one existed.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> EscalorResult<bool> {
        let path = self.entry_path(fingerprint);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
