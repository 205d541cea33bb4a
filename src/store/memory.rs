use async_trait::async_trait;
use dashmap::DashMap;

use super::KvStore;
use crate::error::RouterError;

/// Process-local store. Health state is visible to this instance only.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, String>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RouterError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, key: &str, value: String) -> Result<(), RouterError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_overwrites() {
        let kv = MemoryKvStore::new();
        assert!(kv.is_empty());
        kv.put("k", "v1".to_string()).await.unwrap();
        kv.put("k", "v2".to_string()).await.unwrap();
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }
}
