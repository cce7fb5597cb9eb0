//! Short-lived cache of ranked match results.
//!
//! Keyed by a hash of the template slug and the sorted document ids, so any
//! re-analysis (which assigns a fresh id) misses naturally.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::schema::{DocumentMetadata, MatchResult};

struct CacheEntry {
    results: Vec<MatchResult>,
    inserted_at: Instant,
}

pub struct RelevanceCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl RelevanceCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn key(template_slug: &str, docs: &[DocumentMetadata]) -> String {
        let mut ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
        ids.sort_unstable();
        let mut hasher = Sha256::new();
        hasher.update(template_slug.as_bytes());
        for id in ids {
            hasher.update(b"\0");
            hasher.update(id.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn get(&self, key: &str) -> Option<Vec<MatchResult>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = entries
            .get(key)
            .map(|e| e.inserted_at.elapsed() < self.ttl)?;
        if fresh {
            entries.get(key).map(|e| e.results.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    pub fn insert(&self, key: String, results: Vec<MatchResult>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted_at.elapsed() < ttl);
        entries.insert(
            key,
            CacheEntry {
                results,
                inserted_at: Instant::now(),
            },
        );
        while entries.len() > self.capacity {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    debug!("Evicting relevance cache entry {}", k);
                    entries.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
