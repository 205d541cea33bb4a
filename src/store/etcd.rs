use async_trait::async_trait;

use super::KvStore;
use crate::error::RouterError;
use crate::etcd::EtcdClient;

/// Health records in etcd, shared by every router instance pointing at the
/// same cluster.
#[derive(Clone)]
pub struct EtcdKvStore {
    client: EtcdClient,
}

impl EtcdKvStore {
    pub fn new(client: EtcdClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, RouterError> {
        self.client
            .get(key)
            .await
            .map_err(|e| RouterError::integration(format!("etcd get \"{}\" failed", key), e))
    }

    async fn put(&self, key: &str, value: String) -> Result<(), RouterError> {
        self.client
            .put(key, &value)
            .await
            .map_err(|e| RouterError::integration(format!("etcd put \"{}\" failed", key), e))
    }

    fn kind(&self) -> &'static str {
        "etcd"
    }
}
