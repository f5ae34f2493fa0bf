//! 双存储写入
//!
//! 先同步 upsert 关系库，再把分析行交给缓冲区并等待批次落盘。
//! 两边都成功才算写入完成；关系库已提交而分析库失败时返回 `PartialWrite`，
//! 整个作业重投，由幂等的 upsert 与去重闸门保证重放安全。

pub mod buffer;
pub mod metadata;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use ingest_shared::analytics::AnalyticsRecord;
use ingest_shared::error::IngestError;
use ingest_shared::retry::{RetryPolicy, retry_transient};
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::merge::MergedEntity;

pub use buffer::{AnalyticsBuffer, FlushSettings};
pub use metadata::{InMemoryMetadataStore, MetadataRecord, MetadataStore, PgMetadataStore};

/// 合并实体到分析行的投影
pub fn analytics_record(entity: &MergedEntity) -> AnalyticsRecord {
    AnalyticsRecord {
        tenant_id: entity.tenant_id.clone(),
        id: entity.entity_id.clone(),
        entity_type: entity.entity_type.as_str().to_string(),
        trace_id: entity.trace_id().unwrap_or_default(),
        name: entity.name().unwrap_or_default(),
        payload: entity.payload().to_string(),
        event_ts: entity.last_event_at.timestamp_millis(),
        source_seq: entity.max_seq,
        inserted_at: Utc::now().timestamp_millis(),
    }
}

pub struct DualStoreWriter {
    metadata: Arc<dyn MetadataStore>,
    buffer: Arc<AnalyticsBuffer>,
    retry: RetryPolicy,
}

impl DualStoreWriter {
    pub fn new(metadata: Arc<dyn MetadataStore>, buffer: Arc<AnalyticsBuffer>) -> Self {
        Self {
            metadata,
            buffer,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 持久化一批合并实体
    #[instrument(skip(self, entities), fields(entities = entities.len()))]
    pub async fn persist(&self, entities: &[MergedEntity]) -> Result<()> {
        if entities.is_empty() {
            return Ok(());
        }

        // 1. 关系库
        let records: Vec<MetadataRecord> =
            entities.iter().map(MetadataRecord::from_entity).collect();
        retry_transient(&self.retry, "metadata_upsert", || {
            self.metadata.upsert_batch(&records)
        })
        .await?;

        // 2. 分析库，按目标表并发提交
        let mut by_table: BTreeMap<&'static str, Vec<AnalyticsRecord>> = BTreeMap::new();
        for entity in entities {
            by_table
                .entry(entity.entity_type.table())
                .or_default()
                .push(analytics_record(entity));
        }

        let submissions = by_table
            .into_iter()
            .map(|(table, rows)| async move { (table, self.buffer.submit(table, rows).await) });

        for (table, outcome) in join_all(submissions).await {
            if let Err(reason) = outcome? {
                warn!(table, error = %reason, "关系库已提交但分析库写入失败");
                return Err(IngestError::PartialWrite {
                    committed: "metadata".to_string(),
                    failed: format!("analytics:{table}"),
                    reason,
                }
                .into());
            }
        }

        info!(entities = entities.len(), "实体已写入两个存储");
        Ok(())
    }
}
