//! 暂存存储客户端
//!
//! 原始事件批次以 JSON 对象写入对象存储，键由租户、实体和内容哈希推导：
//! `tenant/{tenantId}/{entityType}/{entityId}/{sha256}.json`。
//! 相同内容重复写入得到相同的键，重放是幂等的。

mod memory;
mod s3;

pub use memory::InMemoryObjectStore;
pub use s3::S3ObjectStore;

use std::sync::Arc;

use async_trait::async_trait;
use ingest_shared::error::IngestError;
use ingest_shared::events::{BlobRef, EntityType, StagedBlob};
use ingest_shared::retry::{RetryPolicy, retry_transient};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

use crate::error::{PipelineError, Result};

/// 对象存储的最小接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> ingest_shared::error::Result<()>;

    /// 对象不存在时返回 None
    async fn get_object(&self, key: &str) -> ingest_shared::error::Result<Option<Vec<u8>>>;

    async fn list_keys(&self, prefix: &str) -> ingest_shared::error::Result<Vec<String>>;
}

/// 实体在暂存存储中的目录前缀
pub fn entity_prefix(tenant_id: &str, entity_type: EntityType, entity_id: &str) -> String {
    format!("tenant/{tenant_id}/{entity_type}/{entity_id}/")
}

/// 按内容哈希推导对象键
pub fn blob_key(tenant_id: &str, entity_type: EntityType, entity_id: &str, body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let hash: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{}{hash}.json", entity_prefix(tenant_id, entity_type, entity_id))
}

/// 暂存存储
///
/// 负责键推导、序列化以及瞬时故障重试；对象缺失以 `StagingMissing` 暴露。
#[derive(Clone)]
pub struct StagingStore {
    objects: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl StagingStore {
    pub fn new(objects: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { objects, retry }
    }

    /// 写入一个实体的事件批次，返回对象引用
    #[instrument(skip(self, blob), fields(tenant_id = %blob.tenant_id, entity_id = %blob.entity_id))]
    pub async fn put(&self, blob: &StagedBlob) -> Result<BlobRef> {
        let body = serde_json::to_vec(blob)?;
        let key = blob_key(&blob.tenant_id, blob.entity_type, &blob.entity_id, &body);

        retry_transient(&self.retry, "staging_put", || {
            let body = body.clone();
            let key = key.clone();
            async move { self.objects.put_object(&key, body).await }
        })
        .await?;

        debug!(key = %key, events = blob.events.len(), "事件批次已暂存");
        Ok(BlobRef {
            key,
            entity_type: blob.entity_type,
            entity_id: blob.entity_id.clone(),
        })
    }

    /// 读取事件批次
    #[instrument(skip(self))]
    pub async fn get(&self, key: &str) -> Result<StagedBlob> {
        let body = retry_transient(&self.retry, "staging_get", || async move {
            self.objects.get_object(key).await
        })
        .await?
        .ok_or_else(|| IngestError::StagingMissing {
            blob_key: key.to_string(),
        })?;

        serde_json::from_slice(&body).map_err(|e| PipelineError::MalformedBlob {
            blob_key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// 列出实体前缀下的全部对象键，按字典序
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = retry_transient(&self.retry, "staging_list", || async move {
            self.objects.list_keys(prefix).await
        })
        .await?;
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_shared::test_utils::EventBuilder;
    use std::time::Duration;

    fn blob(tenant: &str, seq: u64) -> StagedBlob {
        StagedBlob {
            tenant_id: tenant.to_string(),
            entity_type: EntityType::Trace,
            entity_id: "trace-1".to_string(),
            events: vec![EventBuilder::trace("trace-1").id("e1").raw(tenant, seq)],
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            multiplier: 1.0,
        }
    }

    #[test]
    fn test_blob_key_layout() {
        let key = blob_key("t1", EntityType::Observation, "obs-1", b"{}");
        assert!(key.starts_with("tenant/t1/observation/obs-1/"));
        assert!(key.ends_with(".json"));
        // sha256 十六进制 64 位
        let file = key.rsplit('/').next().unwrap();
        assert_eq!(file.len(), 64 + ".json".len());
        assert_eq!(key, blob_key("t1", EntityType::Observation, "obs-1", b"{}"));
    }

    #[tokio::test]
    async fn test_put_get_and_list() {
        let store = StagingStore::new(Arc::new(InMemoryObjectStore::new()), fast_retry());

        let first = store.put(&blob("t1", 1)).await.unwrap();
        let again = store.put(&blob("t1", 1)).await.unwrap();
        let second = store.put(&blob("t1", 2)).await.unwrap();
        assert_eq!(first, again);
        assert_ne!(first.key, second.key);

        let loaded = store.get(&first.key).await.unwrap();
        assert_eq!(loaded, blob("t1", 1));

        let keys = store
            .list(&entity_prefix("t1", EntityType::Trace, "trace-1"))
            .await
            .unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_blob_is_staging_missing() {
        let store = StagingStore::new(Arc::new(InMemoryObjectStore::new()), fast_retry());
        let err = store.get("tenant/t1/trace/x/none.json").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Shared(IngestError::StagingMissing { .. })
        ));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_blob_is_permanent() {
        let objects = Arc::new(InMemoryObjectStore::new());
        objects.put_object("tenant/t1/trace/x/bad.json", b"not json".to_vec()).await.unwrap();
        let store = StagingStore::new(objects, fast_retry());

        let err = store.get("tenant/t1/trace/x/bad.json").await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedBlob { .. }));
    }

    #[tokio::test]
    async fn test_transient_get_failures_are_retried() {
        let mut objects = MockObjectStore::new();
        let mut calls = 0;
        objects.expect_get_object().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(IngestError::Storage("connection reset".to_string()))
            } else {
                Ok(Some(serde_json::to_vec(&blob("t1", 1)).unwrap()))
            }
        });

        let store = StagingStore::new(Arc::new(objects), fast_retry());
        let loaded = store.get("k").await.unwrap();
        assert_eq!(loaded.events.len(), 1);
    }
}
