//! Content-addressed module cache.
//!
//! Compiled-unit blobs are stored on disk keyed by a deterministic hash of
//! the unit's inputs. Entries are immutable once written: a given key always
//! maps to one semantically equivalent blob, so concurrent writers are safe
//! and first-writer-wins. Lookups are bounded in time and degrade to a miss
//! rather than blocking a build.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::Result;

/// Deterministic hash of a compilation unit's inputs: its own content hash,
/// its direct dependency hashes, and the toolchain version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(unit_hash: &str, dep_hashes: &[String], toolchain_version: &str) -> Self {
        let mut deps: Vec<&str> = dep_hashes.iter().map(String::as_str).collect();
        deps.sort_unstable();

        let mut hasher = Sha256::new();
        hasher.update(b"unit:");
        hasher.update(unit_hash.as_bytes());
        for dep in deps {
            hasher.update(b"\ndep:");
            hasher.update(dep.as_bytes());
        }
        hasher.update(b"\ntoolchain:");
        hasher.update(toolchain_version.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata for one cached blob. Immutable apart from `last_access`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub content_hash: String,
    pub size: u64,
    pub last_access: DateTime<Utc>,
}

/// A successful lookup: the entry plus the verified blob bytes.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub blob: Vec<u8>,
}

fn content_hash(blob: &[u8]) -> String {
    hex::encode(Sha256::digest(blob))
}

pub struct ModuleCache {
    dir: PathBuf,
    max_bytes: u64,
    lookup_timeout: std::time::Duration,
    index: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ModuleCache {
    /// Open the cache, rebuilding the index from blob/meta files on disk.
    pub async fn open(cfg: &CacheConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&cfg.dir).await?;

        let mut index = HashMap::new();
        let mut dir = tokio::fs::read_dir(&cfg.dir).await?;
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            if file.file_name().to_string_lossy().starts_with(".tmp-") {
                // Orphan left by a put that died before its rename.
                tracing::debug!(path = %path.display(), "Removing orphaned cache temp file");
                let _ = tokio::fs::remove_file(&path).await;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<CacheEntry>(&bytes) {
                    Ok(entry) => {
                        index.insert(entry.key.as_hex().to_string(), entry);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable cache meta");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable cache meta");
                }
            }
        }
        tracing::info!(dir = %cfg.dir.display(), entries = index.len(), "Module cache opened");

        Ok(Self {
            dir: cfg.dir.clone(),
            max_bytes: cfg.max_bytes,
            lookup_timeout: cfg.lookup_timeout,
            index: Mutex::new(index),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn blob_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.blob", key.as_hex()))
    }

    fn meta_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.meta", key.as_hex()))
    }

    /// Look up a blob. Bounded by the configured timeout; a slow or failed
    /// read is a miss, and a blob whose hash no longer matches its recorded
    /// content hash is evicted and never served.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheHit> {
        // An exhausted budget is a miss before the first read; `timeout`
        // would still poll the read once.
        if self.lookup_timeout.is_zero() {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        let result = tokio::time::timeout(self.lookup_timeout, self.lookup_inner(key)).await;
        match result {
            Ok(Some(hit)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(hit)
            }
            Ok(None) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(_) => {
                tracing::warn!(key = %key, "Cache lookup timed out, treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn lookup_inner(&self, key: &CacheKey) -> Option<CacheHit> {
        let expected = {
            let index = self.index.lock().await;
            index.get(key.as_hex())?.content_hash.clone()
        };

        let blob = match tokio::fs::read(self.blob_path(key)).await {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache blob unreadable, treating as miss");
                self.evict(key).await;
                return None;
            }
        };

        if content_hash(&blob) != expected {
            tracing::error!(key = %key, "Cache corruption detected, evicting entry");
            self.evict(key).await;
            return None;
        }

        let mut index = self.index.lock().await;
        let entry = index.get_mut(key.as_hex())?;
        entry.last_access = Utc::now();
        Some(CacheHit {
            entry: entry.clone(),
            blob,
        })
    }

    /// Store a blob. Idempotent: if the key is already present the existing
    /// entry is returned untouched. The blob lands via temp file + rename so
    /// concurrent writers for one key produce exactly one stored blob.
    pub async fn put(&self, key: &CacheKey, blob: &[u8]) -> Result<CacheEntry> {
        {
            let index = self.index.lock().await;
            if let Some(existing) = index.get(key.as_hex()) {
                return Ok(existing.clone());
            }
        }

        let entry = CacheEntry {
            key: key.clone(),
            content_hash: content_hash(blob),
            size: blob.len() as u64,
            last_access: Utc::now(),
        };

        let tmp = self.dir.join(format!(".tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, blob).await?;
        tokio::fs::rename(&tmp, self.blob_path(key)).await?;
        tokio::fs::write(&self.meta_path(key), serde_json::to_vec(&entry)?).await?;

        let mut index = self.index.lock().await;
        // A concurrent writer may have won the race; its entry is equivalent.
        let stored = index
            .entry(key.as_hex().to_string())
            .or_insert_with(|| entry.clone())
            .clone();
        drop(index);

        self.evict_to_budget().await;
        tracing::debug!(key = %key, size = stored.size, "Cache entry stored");
        Ok(stored)
    }

    async fn evict(&self, key: &CacheKey) {
        self.index.lock().await.remove(key.as_hex());
        let _ = tokio::fs::remove_file(self.blob_path(key)).await;
        let _ = tokio::fs::remove_file(self.meta_path(key)).await;
    }

    /// LRU eviction down to the configured budget.
    pub async fn evict_to_budget(&self) {
        let victims: Vec<CacheKey> = {
            let index = self.index.lock().await;
            let mut total: u64 = index.values().map(|e| e.size).sum();
            if total <= self.max_bytes {
                return;
            }
            let mut entries: Vec<&CacheEntry> = index.values().collect();
            entries.sort_by_key(|e| e.last_access);
            let mut victims = Vec::new();
            for entry in entries {
                if total <= self.max_bytes {
                    break;
                }
                total -= entry.size;
                victims.push(entry.key.clone());
            }
            victims
        };

        for key in victims {
            tracing::info!(key = %key, "Evicting cache entry under storage pressure");
            self.evict(&key).await;
        }
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.lock().await.is_empty()
    }

    pub async fn total_bytes(&self) -> u64 {
        self.index.lock().await.values().map(|e| e.size).sum()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
