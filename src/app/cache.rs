//! On-disk subscription cache, one JSON file per subscription URL.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::common::error::AgentError;
use crate::common::fs::write_atomic;
use crate::config::subscription::Server;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedSubscription {
    pub url: String,
    /// Unix seconds.
    pub fetched_at: u64,
    /// SHA-256 of the decoded text, hex.
    pub content_hash: String,
    pub raw: String,
    pub servers: Vec<Server>,
}

impl CachedSubscription {
    pub fn age_at(&self, now: u64) -> Duration {
        Duration::from_secs(now.saturating_sub(self.fetched_at))
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionCache {
    dir: PathBuf,
    ttl: Duration,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn sha256_hex(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

impl SubscriptionCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn entry_path(&self, url: &str) -> PathBuf {
        self.dir
            .join(format!("subscription_{}.json", sha256_hex(url.as_bytes())))
    }

    /// Fresh entry for `url`, or `None`. A zero TTL always misses.
    pub fn get(&self, url: &str) -> Option<CachedSubscription> {
        self.get_at(url, unix_now())
    }

    pub fn get_at(&self, url: &str, now: u64) -> Option<CachedSubscription> {
        if self.ttl.is_zero() {
            return None;
        }
        let entry = self.read_entry(url)?;
        let age = entry.age_at(now);
        if age <= self.ttl {
            debug!(age_secs = age.as_secs(), servers = entry.servers.len(), "subscription cache hit");
            Some(entry)
        } else {
            debug!(age_secs = age.as_secs(), "subscription cache expired");
            None
        }
    }

    /// Entry regardless of age; used as a fallback when a fetch fails.
    pub fn get_stale(&self, url: &str) -> Option<CachedSubscription> {
        self.read_entry(url)
    }

    pub fn put(&self, url: &str, raw: &str, servers: &[Server]) -> Result<CachedSubscription, AgentError> {
        self.put_at(url, raw, servers, unix_now())
    }

    pub fn put_at(
        &self,
        url: &str,
        raw: &str,
        servers: &[Server],
        now: u64,
    ) -> Result<CachedSubscription, AgentError> {
        let entry = CachedSubscription {
            url: url.to_string(),
            fetched_at: now,
            content_hash: sha256_hex(raw.as_bytes()),
            raw: raw.to_string(),
            servers: servers.to_vec(),
        };
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec(&entry)
            .map_err(|e| AgentError::Other(anyhow::anyhow!("cache serialize: {}", e)))?;
        write_atomic(&self.entry_path(url), &json)?;
        debug!(servers = servers.len(), hash = %&entry.content_hash[..12], "subscription cached");
        Ok(entry)
    }

    /// Delete the entry file. Returns whether one existed.
    pub fn invalidate(&self, url: &str) -> Result<bool, AgentError> {
        match std::fs::remove_file(self.entry_path(url)) {
            Ok(()) => {
                debug!("subscription cache invalidated");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn read_entry(&self, url: &str) -> Option<CachedSubscription> {
        let path = self.entry_path(url);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read subscription cache");
                return None;
            }
        };
        match serde_json::from_slice::<CachedSubscription>(&data) {
            Ok(entry) if entry.url == url => Some(entry),
            Ok(_) => {
                warn!(path = %path.display(), "subscription cache belongs to another URL, ignoring");
                None
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt subscription cache, ignoring");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::subscription::parse_vless_uri;

    const URL: &str = "https://sub.example.com/s/abc";

    fn servers() -> Vec<Server> {
        vec![parse_vless_uri(
            "vless://ec82bca8-1072-4682-822f-30306af408ea@1.2.3.4:443?security=reality#A",
        )
        .unwrap()]
    }

    #[test]
    fn put_then_get_within_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path(), Duration::from_secs(3600));
        let stored = cache.put_at(URL, "raw", &servers(), 1_000).unwrap();

        let hit = cache.get_at(URL, 1_000 + 3600).unwrap();
        assert_eq!(hit, stored);
        assert_eq!(hit.servers, servers());
        assert!(cache.get_at(URL, 1_000 + 3601).is_none());
        assert!(cache.get_stale(URL).is_some());
    }

    #[test]
    fn zero_ttl_always_misses() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path(), Duration::ZERO);
        cache.put_at(URL, "raw", &servers(), 1_000).unwrap();
        assert!(cache.get_at(URL, 1_000).is_none());
        assert!(cache.get_stale(URL).is_some());
    }

    #[test]
    fn invalidate_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path(), Duration::from_secs(60));
        cache.put(URL, "raw", &servers()).unwrap();
        assert!(cache.get(URL).is_some());
        assert!(cache.invalidate(URL).unwrap());
        assert!(cache.get(URL).is_none());
        assert!(!cache.invalidate(URL).unwrap());
    }

    #[test]
    fn corrupt_file_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path(), Duration::from_secs(60));
        std::fs::write(cache.entry_path(URL), b"{ truncated").unwrap();
        assert!(cache.get(URL).is_none());
        assert!(cache.get_stale(URL).is_none());
    }

    #[test]
    fn entries_keyed_by_url() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path(), Duration::from_secs(60));
        cache.put(URL, "raw", &servers()).unwrap();
        assert!(cache.get("https://other.example.com/").is_none());
        assert_ne!(cache.entry_path(URL), cache.entry_path("https://other.example.com/"));
        let name = cache.entry_path(URL);
        let name = name.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("subscription_") && name.ends_with(".json"));
    }

    #[test]
    fn creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path().join("nested/cache"), Duration::from_secs(60));
        cache.put(URL, "raw", &servers()).unwrap();
        assert!(cache.get(URL).is_some());
    }

    #[test]
    fn content_hash_is_sha256_of_raw() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path(), Duration::from_secs(60));
        let entry = cache.put(URL, "abc", &servers()).unwrap();
        assert_eq!(
            entry.content_hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
