use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{KvEntry, KvStore};
use crate::Result;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, KvEntry>,
    /// Remaining reads for which a freshly created key still looks absent.
    hidden: HashMap<String, usize>,
}

/// In-process `KvStore`, optionally hiding new keys for a number of reads to mimic a store with
/// delayed read-after-write visibility.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<Inner>,
    visibility_lag: usize,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// New keys stay invisible to the next `reads` point reads.
    pub fn with_visibility_lag(reads: usize) -> Self {
        Self {
            inner: Mutex::default(),
            visibility_lag: reads,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }

    fn write(inner: &mut Inner, lag: usize, key: &str, value: &str) -> i64 {
        let revision = inner.entries.get(key).map(|e| e.revision + 1).unwrap_or(1);
        if revision == 1 && lag > 0 {
            inner.hidden.insert(key.to_string(), lag);
        }
        inner.entries.insert(
            key.to_string(),
            KvEntry {
                key: key.to_string(),
                value: value.to_string(),
                revision,
                updated_at: Utc::now(),
            },
        );
        revision
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>> {
        let mut inner = self.lock()?;
        if let Some(remaining) = inner.hidden.get_mut(key) {
            *remaining -= 1;
            if *remaining == 0 {
                inner.hidden.remove(key);
            }
            return Ok(None);
        }
        Ok(inner.entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<i64> {
        let mut inner = self.lock()?;
        Ok(Self::write(&mut inner, self.visibility_lag, key, value))
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<i64>,
        value: &str,
    ) -> Result<bool> {
        let mut inner = self.lock()?;
        let current = inner.entries.get(key).map(|e| e.revision);
        if current != expected {
            return Ok(false);
        }
        Self::write(&mut inner, self.visibility_lag, key, value);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut inner = self.lock()?;
        inner.hidden.remove(key);
        Ok(inner.entries.remove(key).is_some())
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>> {
        let inner = self.lock()?;
        Ok(inner
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(key, _)| !inner.hidden.contains_key(*key))
            .map(|(_, entry)| entry.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lagging_store_hides_new_keys_for_configured_reads() {
        let kv = MemoryKv::with_visibility_lag(2);
        kv.put("plan:h:1", "body").await.unwrap();

        assert!(kv.get("plan:h:1").await.unwrap().is_none());
        assert!(kv.get("plan:h:1").await.unwrap().is_none());
        assert_eq!(kv.get("plan:h:1").await.unwrap().unwrap().value, "body");
    }

    #[tokio::test]
    async fn updates_to_visible_keys_are_immediate() {
        let kv = MemoryKv::with_visibility_lag(1);
        kv.put("host:a", "v1").await.unwrap();
        let _ = kv.get("host:a").await.unwrap();
        kv.put("host:a", "v2").await.unwrap();
        assert_eq!(kv.get("host:a").await.unwrap().unwrap().value, "v2");
    }

    #[tokio::test]
    async fn cas_matches_sqlite_semantics() {
        let kv = MemoryKv::new();
        assert!(kv.compare_and_swap("k", None, "a").await.unwrap());
        assert!(!kv.compare_and_swap("k", None, "b").await.unwrap());
        assert!(kv.compare_and_swap("k", Some(1), "b").await.unwrap());
        assert!(!kv.compare_and_swap("k", Some(1), "c").await.unwrap());
        assert_eq!(kv.list_prefix("k").await.unwrap().len(), 1);
    }
}
