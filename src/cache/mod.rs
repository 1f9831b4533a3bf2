//! Memo of (page, target description) → last coordinate that worked.
//!
//! Safe to share across runs and tasks through an `Arc<ActionCache>`.

use crate::config::CacheConfig;
use crate::coords::Coordinate;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// A remembered location for a target on a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedCoordinate {
    pub coordinate: Coordinate,
    pub success_count: u32,
    pub last_used: DateTime<Utc>,
    /// Page identity the entry belongs to.
    pub url: String,
}

/// Page identity: origin + path, query and fragment stripped.
pub fn page_identity(url: &str) -> String {
    let trimmed = url.trim();
    match Url::parse(trimmed) {
        Ok(parsed) if parsed.has_host() => {
            format!("{}{}", parsed.origin().ascii_serialization(), parsed.path())
        }
        _ => trimmed
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    }
}

fn cache_key(url: &str, target: &str) -> String {
    format!("{}|{}", page_identity(url), target.trim().to_lowercase())
}

pub struct ActionCache {
    entries: Mutex<HashMap<String, CachedCoordinate>>,
    capacity: usize,
    ttl: chrono::Duration,
    min_successes: u32,
}

impl Default for ActionCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

impl ActionCache {
    pub fn new(config: &CacheConfig) -> Self {
        let ttl_secs = i64::try_from(config.ttl_secs).unwrap_or(i64::MAX / 1_000);
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: config.capacity.max(1),
            ttl: chrono::Duration::seconds(ttl_secs),
            min_successes: config.min_successes,
        }
    }

    /// Trusted coordinate for `target` on `url`, if any.
    pub fn get(&self, url: &str, target: &str) -> Option<CachedCoordinate> {
        self.get_at(url, target, Utc::now())
    }

    pub fn get_at(&self, url: &str, target: &str, now: DateTime<Utc>) -> Option<CachedCoordinate> {
        let key = cache_key(url, target);
        let mut entries = self.entries.lock();
        let entry = entries.get(&key)?;
        if now - entry.last_used > self.ttl {
            entries.remove(&key);
            return None;
        }
        (entry.success_count >= self.min_successes).then(|| entry.clone())
    }

    /// Remember that acting at `coordinate` worked.
    pub fn record_success(&self, url: &str, target: &str, coordinate: Coordinate) {
        self.record_success_at(url, target, coordinate, Utc::now());
    }

    pub fn record_success_at(
        &self,
        url: &str,
        target: &str,
        coordinate: Coordinate,
        now: DateTime<Utc>,
    ) {
        let key = cache_key(url, target);
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&key) {
            entry.success_count = entry.success_count.saturating_add(1);
            entry.coordinate = coordinate;
            entry.last_used = now;
            return;
        }

        if entries.len() >= self.capacity {
            self.retain_fresh(&mut entries, now);
        }
        if entries.len() >= self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CachedCoordinate {
                coordinate,
                success_count: 1,
                last_used: now,
                url: page_identity(url),
            },
        );
    }

    /// Remember that acting at the cached coordinate failed.
    pub fn record_failure(&self, url: &str, target: &str) {
        let key = cache_key(url, target);
        let mut entries = self.entries.lock();
        let remove = match entries.get_mut(&key) {
            Some(entry) if entry.success_count <= 1 => true,
            Some(entry) => {
                entry.success_count -= 1;
                false
            }
            None => false,
        };
        if remove {
            entries.remove(&key);
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        self.retain_fresh(&mut entries, Utc::now())
    }

    fn retain_fresh(
        &self,
        entries: &mut HashMap<String, CachedCoordinate>,
        now: DateTime<Utc>,
    ) -> usize {
        let before = entries.len();
        entries.retain(|_, e| now - e.last_used <= self.ttl);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}
