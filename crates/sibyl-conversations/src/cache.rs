use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cached conversations-list responses, keyed by profile id.
///
/// Entries live 30 seconds and are invalidated on any send or read-mark
/// involving that profile — the list is recomputed on the next read.
pub struct ListCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (serde_json::Value, Instant)>>,
}

/// Entries beyond this are evicted oldest-first.
const MAX_CACHE_ENTRIES: usize = 1024;

impl ListCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(Duration::from_secs(30))
    }

    pub fn get(&self, profile_id: &str) -> Option<serde_json::Value> {
        let entries = self.entries.lock().unwrap();
        let (value, at) = entries.get(profile_id)?;
        if at.elapsed() < self.ttl {
            Some(value.clone())
        } else {
            None
        }
    }

    pub fn put(&self, profile_id: &str, value: serde_json::Value) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= MAX_CACHE_ENTRIES {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, at))| *at)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                entries.remove(&k);
            }
        }
        entries.insert(profile_id.to_string(), (value, Instant::now()));
    }

    pub fn invalidate(&self, profile_id: &str) {
        self.entries.lock().unwrap().remove(profile_id);
    }

    /// Drop everything. Called at shutdown.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_then_invalidate() {
        let cache = ListCache::with_default_ttl();
        cache.put("u1", serde_json::json!({"n": 1}));
        assert!(cache.get("u1").is_some());
        cache.invalidate("u1");
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn expires_after_ttl() {
        let cache = ListCache::new(Duration::from_millis(0));
        cache.put("u1", serde_json::json!(1));
        assert!(cache.get("u1").is_none());
    }

    #[test]
    fn invalidation_is_per_profile() {
        let cache = ListCache::with_default_ttl();
        cache.put("u1", serde_json::json!(1));
        cache.put("u2", serde_json::json!(2));
        cache.invalidate("u1");
        assert!(cache.get("u2").is_some());
    }
}
