//! Content-addressed package cache
//!
//! Downloaded artifacts are stored once under
//! `<cache_dir>/artifacts/<sha256 prefix>/<file>` and indexed by
//! `name==version` in `<cache_dir>/index.json`.
//!
//! # Design Goals:
//! - The index never points at a missing or corrupt file: artifacts are
//!   verified and hashed before they are registered.
//! - A miss is not an error.  Stale or dangling entries are evicted as a
//!   side effect of the lookup that found them.
//! - Eviction shrinks below the ceiling, not just back under it, and never
//!   evicts the entry being inserted.
//!
//! # Locking:
//! One mutex guards the entry table and counters.  Downloads happen outside
//! it.  Moving a staged artifact into place and registering it happen in one
//! critical section, so eviction of a sibling sharing the file cannot land in
//! between.  The index is serialized under the lock and written after it is
//! released; a second mutex orders the writes by revision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::installer::version::normalize_name;
use crate::util::lock;

const INDEX_FILE: &str = "index.json";
const ARTIFACT_DIR: &str = "artifacts";
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub package: String,
    pub version: String,
    pub file_path: PathBuf,
    /// Hex sha256 of the artifact
    pub hash: String,
    pub size: u64,
    pub download_time: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: u64,
}

impl CacheEntry {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.download_time).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
    revision: u64,
}

/// Serialized index at one revision.
struct IndexSnapshot {
    revision: u64,
    body: Vec<u8>,
}

impl CacheState {
    fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    /// Drop `key` and its file unless another entry shares the artifact.
    fn evict(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        let shared = self.entries.values().any(|e| e.file_path == entry.file_path);
        if !shared {
            if let Err(e) = std::fs::remove_file(&entry.file_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(key = %key, error = %e, "Failed to delete cached artifact");
                }
            }
        }
        self.evictions += 1;
        Some(entry)
    }

    /// Bump the revision and serialize the table.
    fn snapshot(&mut self) -> Result<IndexSnapshot> {
        self.revision += 1;
        let ordered: BTreeMap<&String, &CacheEntry> = self.entries.iter().collect();
        Ok(IndexSnapshot {
            revision: self.revision,
            body: serde_json::to_vec_pretty(&ordered)?,
        })
    }
}

pub struct PackageCache {
    root: PathBuf,
    config: CacheConfig,
    state: Mutex<CacheState>,
    /// Revision of the index last written to disk
    written: Mutex<u64>,
    client: reqwest::Client,
}

/// `name==version` with the name normalized.
pub fn cache_key(package: &str, version: &str) -> String {
    format!("{}=={}", normalize_name(package), version.trim())
}

impl PackageCache {
    /// Open (or create) the cache at `config.cache_dir` and load its index.
    pub fn open(config: CacheConfig) -> Result<Self> {
        let root = config.cache_dir.clone();
        std::fs::create_dir_all(root.join(ARTIFACT_DIR))?;
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .map_err(|e| Error::external("build http client", e))?;

        let cache = Self {
            root,
            config,
            state: Mutex::new(CacheState::default()),
            written: Mutex::new(0),
            client,
        };
        cache.load()?;
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(INDEX_FILE)
    }

    // ── lookup ──

    /// Path of a live artifact for `package==version`.  Missing files and
    /// entries older than the TTL are evicted and reported as a miss.
    pub fn get(&self, package: &str, version: &str) -> Option<PathBuf> {
        let key = cache_key(package, version);
        let now = Utc::now();
        let ttl = self.config.ttl();
        let mut state = lock(&self.state);

        let live = match state.entries.get(&key) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(entry) => entry.file_path.is_file() && entry.age(now) < ttl,
        };
        if !live {
            debug!(key = %key, "Stale cache entry evicted on lookup");
            state.evict(&key);
            state.misses += 1;
            let snapshot = state.snapshot();
            drop(state);
            self.persist(snapshot);
            return None;
        }

        state.hits += 1;
        let entry = state.entries.get_mut(&key)?;
        entry.last_accessed = now;
        entry.access_count += 1;
        Some(entry.file_path.clone())
    }

    /// Copy of the index record for `package==version`, if any.
    pub fn entry(&self, package: &str, version: &str) -> Option<CacheEntry> {
        lock(&self.state).entries.get(&cache_key(package, version)).cloned()
    }

    // ── insert ──

    /// Store the artifact at `source` (a local path or an `http(s)` URL)
    /// for `package==version`.  A key that is already cached with a live
    /// file is left untouched.  An artifact larger than the byte ceiling's
    /// eviction target is refused with `CapacityExceeded`.
    pub async fn put(&self, package: &str, version: &str, source: &str) -> Result<PathBuf> {
        let key = cache_key(package, version);
        {
            let state = lock(&self.state);
            if let Some(existing) = state.entries.get(&key) {
                if existing.file_path.is_file() {
                    debug!(key = %key, "Already cached");
                    return Ok(existing.file_path.clone());
                }
            }
        }

        let file_name = artifact_name(source)?;
        if !self.extension_allowed(&file_name) {
            return Err(Error::InvalidInput(format!(
                "'{file_name}' does not have an accepted artifact extension"
            )));
        }

        let bytes = self.fetch(source).await?;
        verify_artifact(&file_name, &bytes)
            .map_err(|reason| Error::external(format!("verify {key}"), reason))?;
        let size = bytes.len() as u64;
        let target = self.byte_target();
        if size > target {
            warn!(key = %key, size, target, "Artifact larger than the cache can hold");
            return Err(Error::CapacityExceeded {
                resource: format!("cache bytes for {key}"),
                limit: usize::try_from(target).unwrap_or(usize::MAX),
            });
        }
        let hash = hex::encode(Sha256::digest(&bytes));

        let dir = self.root.join(ARTIFACT_DIR).join(&hash[..12]);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(&file_name);
        let staging = dir.join(format!(".{file_name}.{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&staging, &bytes).await?;

        let now = Utc::now();
        let entry = CacheEntry {
            package: normalize_name(package),
            version: version.trim().to_string(),
            file_path: path.clone(),
            hash,
            size,
            download_time: now,
            last_accessed: now,
            access_count: 0,
        };

        let mut state = lock(&self.state);
        if let Err(e) = std::fs::rename(&staging, &path) {
            drop(state);
            let _ = std::fs::remove_file(&staging);
            return Err(e.into());
        }
        state.entries.insert(key.clone(), entry);
        info!(key = %key, size, "Cached package artifact");
        self.enforce_ceilings(&mut state, &key);
        let snapshot = state.snapshot();
        drop(state);
        self.persist(snapshot);
        Ok(path)
    }

    /// Byte total an eviction pass shrinks down to.
    fn byte_target(&self) -> u64 {
        (self.config.max_size_bytes as f64 * self.config.cleanup_threshold).floor() as u64
    }

    fn extension_allowed(&self, file_name: &str) -> bool {
        let lowered = file_name.to_ascii_lowercase();
        self.config
            .allowed_extensions
            .iter()
            .any(|ext| lowered.ends_with(&ext.to_ascii_lowercase()))
    }

    async fn fetch(&self, source: &str) -> Result<Vec<u8>> {
        if source.starts_with("http://") || source.starts_with("https://") {
            debug!(url = %source, "Downloading artifact");
            let response = self
                .client
                .get(source)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| Error::external(format!("download {source}"), e))?;
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::external(format!("download {source}"), e))?;
            return Ok(body.to_vec());
        }

        let path = source.strip_prefix("file://").unwrap_or(source);
        tokio::fs::read(path)
            .await
            .map_err(|e| Error::external(format!("read {path}"), e))
    }

    /// Evict least-recently-accessed entries once a ceiling is crossed,
    /// down to `cleanup_threshold` of each ceiling.  `keep` always stays.
    fn enforce_ceilings(&self, state: &mut CacheState, keep: &str) {
        let max_entries = self.config.max_entries;
        let max_bytes = self.config.max_size_bytes;
        if state.entries.len() <= max_entries && state.total_bytes() <= max_bytes {
            return;
        }

        let fraction = self.config.cleanup_threshold;
        let target_entries = (max_entries as f64 * fraction).floor() as usize;
        let target_bytes = self.byte_target();

        let mut order: Vec<(DateTime<Utc>, String)> = state
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != keep)
            .map(|(k, e)| (e.last_accessed, k.clone()))
            .collect();
        order.sort();

        let mut evicted = 0usize;
        let mut total = state.total_bytes();
        for (_, key) in order {
            if state.entries.len() <= target_entries && total <= target_bytes {
                break;
            }
            if let Some(entry) = state.evict(&key) {
                total = total.saturating_sub(entry.size);
                evicted += 1;
            }
        }
        info!(
            evicted,
            entries = state.entries.len(),
            bytes = total,
            "Cache eviction pass"
        );
    }

    // ── maintenance ──

    /// Re-hash the artifact and compare with the recorded hash.  A mismatch
    /// evicts the entry.
    pub async fn verify(&self, package: &str, version: &str) -> Result<bool> {
        let key = cache_key(package, version);
        let entry = self
            .entry(package, version)
            .ok_or_else(|| Error::not_found("cache entry", key.clone()))?;

        let ok = match tokio::fs::read(&entry.file_path).await {
            Ok(bytes) => hex::encode(Sha256::digest(&bytes)) == entry.hash,
            Err(_) => false,
        };
        if !ok {
            warn!(key = %key, "Cached artifact failed verification");
            let mut state = lock(&self.state);
            state.evict(&key);
            let snapshot = state.snapshot();
            drop(state);
            self.persist(snapshot);
        }
        Ok(ok)
    }

    pub fn remove(&self, package: &str, version: &str) -> bool {
        let key = cache_key(package, version);
        let mut state = lock(&self.state);
        if state.evict(&key).is_none() {
            return false;
        }
        let snapshot = state.snapshot();
        drop(state);
        self.persist(snapshot);
        true
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        for key in &keys {
            state.evict(key);
        }
        let snapshot = state.snapshot();
        drop(state);
        self.persist(snapshot);
        info!(removed = keys.len(), "Cache cleared");
    }

    /// Evict every entry older than the TTL or missing its file.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let ttl = self.config.ttl();
        let mut state = lock(&self.state);
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.age(now) >= ttl || !e.file_path.is_file())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.evict(key);
        }
        if !expired.is_empty() {
            let snapshot = state.snapshot();
            drop(state);
            self.persist(snapshot);
            info!(removed = expired.len(), "Expired cache entries removed");
        }
        expired.len()
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.total_bytes(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    // ── persistence ──

    pub fn save(&self) -> Result<()> {
        let snapshot = lock(&self.state).snapshot()?;
        self.write_snapshot(snapshot)
    }

    /// Replace the in-memory table with the on-disk index, dropping entries
    /// whose artifact is gone.
    pub fn load(&self) -> Result<usize> {
        let path = self.index_path();
        let loaded: BTreeMap<String, CacheEntry> = match std::fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        let total = loaded.len();
        let mut state = lock(&self.state);
        state.entries = loaded
            .into_iter()
            .filter(|(_, e)| e.file_path.is_file())
            .collect();
        let kept = state.entries.len();
        if kept < total {
            debug!(dropped = total - kept, "Dropped index entries without artifacts");
        }
        Ok(kept)
    }

    /// Write `snapshot` unless a newer revision is already on disk.
    fn write_snapshot(&self, snapshot: IndexSnapshot) -> Result<()> {
        let mut written = lock(&self.written);
        if *written >= snapshot.revision {
            return Ok(());
        }
        let staging = self.root.join(format!(".{INDEX_FILE}.tmp"));
        std::fs::write(&staging, &snapshot.body)?;
        std::fs::rename(&staging, self.index_path())?;
        *written = snapshot.revision;
        Ok(())
    }

    /// Save after a mutation; a failed save is logged, the in-memory table
    /// stays authoritative.
    fn persist(&self, snapshot: Result<IndexSnapshot>) {
        if let Err(e) = snapshot.and_then(|s| self.write_snapshot(s)) {
            warn!(error = %e, "Failed to save cache index");
        }
    }
}

/// File name of the artifact behind `source`.
fn artifact_name(source: &str) -> Result<String> {
    let trimmed = source.split(['?', '#']).next().unwrap_or(source);
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput(format!("cannot derive a file name from '{source}'")))
}

/// Reject empty payloads and archives whose magic bytes do not match their
/// extension.
fn verify_artifact(file_name: &str, bytes: &[u8]) -> std::result::Result<(), String> {
    if bytes.is_empty() {
        return Err("artifact is empty".to_string());
    }
    let lowered = file_name.to_ascii_lowercase();
    let magic: &[u8] = if lowered.ends_with(".whl") || lowered.ends_with(".zip") {
        b"PK"
    } else if lowered.ends_with(".tar.gz") || lowered.ends_with(".tgz") {
        &[0x1f, 0x8b]
    } else if lowered.ends_with(".tar.bz2") {
        b"BZh"
    } else {
        return Ok(());
    };
    if bytes.starts_with(magic) {
        Ok(())
    } else {
        Err(format!("'{file_name}' does not look like its archive type"))
    }
}
