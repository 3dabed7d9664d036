//! Bounded response cache for AI calls: LRU behind a single mutex, keyed
//! by call kind + input hash + prompt version, with TTL eviction by the
//! janitor.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;

use lru::LruCache;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use super::prompts::PROMPT_VERSION;

pub fn cache_key(kind: &str, inputs: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for input in inputs {
        hasher.update(input.as_bytes());
        hasher.update([0u8]);
    }
    format!("{kind}:{PROMPT_VERSION}:{:x}", hasher.finalize())
}

pub struct ResponseCache {
    entries: Mutex<LruCache<String, (Instant, String)>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get(key) {
            Some((stored_at, value)) if stored_at.elapsed() < self.ttl => Some(value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: String, value: String) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.put(key, (Instant::now(), value));
    }

    /// Drop entries past their TTL; called from the janitor loop.
    pub fn evict_expired(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, (stored_at, _))| stored_at.elapsed() >= self.ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_kind_inputs_and_version() {
        let a = cache_key("unified", &["title", "body"]);
        let b = cache_key("unified", &["title", "body"]);
        let c = cache_key("unified", &["title", "other"]);
        let d = cache_key("selectors", &["title", "body"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert!(a.contains(PROMPT_VERSION));
    }

    #[test]
    fn key_separator_prevents_concatenation_collisions() {
        let a = cache_key("unified", &["ab", "c"]);
        let b = cache_key("unified", &["a", "bc"]);
        assert_ne!(a, b);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = ResponseCache::new(16, Duration::from_secs(60));
        cache.put("k".into(), "v".into());
        assert_eq!(cache.get("k").as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get("k").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn janitor_evicts_expired_entries() {
        let cache = ResponseCache::new(16, Duration::from_secs(30));
        cache.put("a".into(), "1".into());
        tokio::time::advance(Duration::from_secs(31)).await;
        cache.put("b".into(), "2".into());
        let evicted = cache.evict_expired();
        assert_eq!(evicted, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.put("a".into(), "1".into());
        cache.put("b".into(), "2".into());
        cache.put("c".into(), "3".into());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
    }
}
