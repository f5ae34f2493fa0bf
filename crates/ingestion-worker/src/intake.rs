//! 摄取入口
//!
//! 接收已认证的事件批次：逐条校验，分配租户内摄取序列号，按实体分组写入暂存存储，
//! 再按租户分片入队一个作业。返回的是"已接受"，处理结果只能通过运维信号观察。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ingest_shared::cache::{Cache, CacheKey};
use ingest_shared::error::IngestError;
use ingest_shared::events::{EntityType, IngestionBatch, IngestionJob, RawEvent, StagedBlob};
use ingest_shared::queue::{JobQueue, JobRef, enqueue_for_tenant};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use validator::Validate;

use crate::error::Result;
use crate::staging::StagingStore;

// ---------------------------------------------------------------------------
// SequenceAllocator — 摄取序列号
// ---------------------------------------------------------------------------

/// 租户内单调递增的摄取序列号
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SequenceAllocator: Send + Sync {
    /// 预留 `count` 个连续序列号，返回第一个
    async fn allocate(&self, tenant_id: &str, count: u64) -> ingest_shared::error::Result<u64>;
}

/// Redis INCRBY 实现，多个入口实例共享同一计数器
pub struct RedisSequenceAllocator {
    cache: Cache,
}

impl RedisSequenceAllocator {
    pub fn new(cache: Cache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl SequenceAllocator for RedisSequenceAllocator {
    async fn allocate(&self, tenant_id: &str, count: u64) -> ingest_shared::error::Result<u64> {
        let end = self
            .cache
            .reserve_sequence(&CacheKey::ingestion_seq(tenant_id), count)
            .await?;
        Ok(end - count + 1)
    }
}

/// 进程内实现
#[derive(Default)]
pub struct InMemorySequenceAllocator {
    counters: DashMap<String, u64>,
}

impl InMemorySequenceAllocator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceAllocator for InMemorySequenceAllocator {
    async fn allocate(&self, tenant_id: &str, count: u64) -> ingest_shared::error::Result<u64> {
        let mut counter = self.counters.entry(tenant_id.to_string()).or_insert(0);
        let first = *counter + 1;
        *counter += count;
        Ok(first)
    }
}

// ---------------------------------------------------------------------------
// IntakeService
// ---------------------------------------------------------------------------

/// 被拒绝的单条事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEvent {
    pub index: usize,
    pub event_id: String,
    pub reason: String,
}

/// 摄取响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeResponse {
    /// 全部事件被拒绝时为空
    pub job: Option<JobRef>,
    pub accepted: usize,
    pub rejected: Vec<RejectedEvent>,
}

pub struct IntakeService {
    staging: StagingStore,
    queue: Arc<dyn JobQueue>,
    sequences: Arc<dyn SequenceAllocator>,
}

impl IntakeService {
    pub fn new(
        staging: StagingStore,
        queue: Arc<dyn JobQueue>,
        sequences: Arc<dyn SequenceAllocator>,
    ) -> Self {
        Self {
            staging,
            queue,
            sequences,
        }
    }

    /// 暂存并入队一个批次
    #[instrument(skip(self, batch), fields(tenant_id = %batch.tenant_id, events = batch.events.len()))]
    pub async fn ingest(&self, batch: IngestionBatch) -> Result<IntakeResponse> {
        batch
            .validate()
            .map_err(|e| IngestError::Validation(e.to_string()))?;

        let IngestionBatch { tenant_id, events } = batch;

        let mut rejected = Vec::new();
        let mut valid = Vec::with_capacity(events.len());
        for (index, event) in events.into_iter().enumerate() {
            match event.validate() {
                Ok(()) => valid.push(event),
                Err(e) => {
                    warn!(tenant_id = %tenant_id, event_id = %event.id, error = %e, "事件校验失败，已拒绝");
                    rejected.push(RejectedEvent {
                        index,
                        event_id: event.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if valid.is_empty() {
            return Ok(IntakeResponse {
                job: None,
                accepted: 0,
                rejected,
            });
        }

        let accepted = valid.len();
        let first_seq = self.sequences.allocate(&tenant_id, accepted as u64).await?;

        // 按实体分组，每个实体一个暂存对象
        let mut groups: BTreeMap<(EntityType, String), Vec<RawEvent>> = BTreeMap::new();
        for (offset, event) in valid.into_iter().enumerate() {
            let raw = RawEvent::from_input(&tenant_id, event, first_seq + offset as u64);
            groups
                .entry((raw.entity_type, raw.entity_id.clone()))
                .or_default()
                .push(raw);
        }

        let mut blob_refs = Vec::with_capacity(groups.len());
        for ((entity_type, entity_id), events) in groups {
            let blob = StagedBlob {
                tenant_id: tenant_id.clone(),
                entity_type,
                entity_id,
                events,
            };
            blob_refs.push(self.staging.put(&blob).await?);
        }

        let payload = serde_json::to_value(IngestionJob {
            tenant_id: tenant_id.clone(),
            blob_refs,
        })?;
        let job = enqueue_for_tenant(self.queue.as_ref(), &tenant_id, payload, None).await?;

        info!(
            tenant_id = %tenant_id,
            job_id = %job.job_id,
            shard = job.shard,
            accepted,
            rejected = rejected.len(),
            "事件批次已接受"
        );

        Ok(IntakeResponse {
            job: Some(job),
            accepted,
            rejected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::InMemoryObjectStore;
    use ingest_shared::queue::{InMemoryJobQueue, queues};
    use ingest_shared::retry::RetryPolicy;
    use ingest_shared::test_utils::{EventBuilder, batch, fast_queue_config};
    use serde_json::json;

    struct Fixture {
        intake: IntakeService,
        staging: StagingStore,
        queue: Arc<InMemoryJobQueue>,
    }

    fn fixture() -> Fixture {
        let staging = StagingStore::new(Arc::new(InMemoryObjectStore::new()), RetryPolicy::none());
        let queue = Arc::new(InMemoryJobQueue::new(queues::INGESTION, &fast_queue_config()));
        let intake = IntakeService::new(
            staging.clone(),
            queue.clone(),
            Arc::new(InMemorySequenceAllocator::new()),
        );
        Fixture {
            intake,
            staging,
            queue,
        }
    }

    #[tokio::test]
    async fn test_sequence_allocator_ranges() {
        let seq = InMemorySequenceAllocator::new();
        assert_eq!(seq.allocate("t1", 3).await.unwrap(), 1);
        assert_eq!(seq.allocate("t1", 2).await.unwrap(), 4);
        assert_eq!(seq.allocate("t2", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ingest_groups_by_entity_and_enqueues_one_job() {
        let f = fixture();
        let response = f
            .intake
            .ingest(batch(
                "t1",
                vec![
                    EventBuilder::trace("trace-1").field("name", json!("chat")),
                    EventBuilder::observation("obs-1").field("traceId", json!("trace-1")),
                    EventBuilder::trace("trace-1").at(10).field("userId", json!("u1")),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.accepted, 3);
        assert!(response.rejected.is_empty());
        let job_ref = response.job.unwrap();
        assert_eq!(f.queue.pending_count(), 1);

        let job = f.queue.claim(job_ref.shard).await.unwrap().unwrap();
        let payload: IngestionJob = job.decode().unwrap();
        assert_eq!(payload.tenant_id, "t1");
        assert_eq!(payload.blob_refs.len(), 2);

        let trace_ref = payload
            .blob_refs
            .iter()
            .find(|r| r.entity_type == EntityType::Trace)
            .unwrap();
        let blob = f.staging.get(&trace_ref.key).await.unwrap();
        let seqs: Vec<u64> = blob.events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_invalid_events_rejected_individually() {
        let f = fixture();
        let response = f
            .intake
            .ingest(batch(
                "t1",
                vec![
                    EventBuilder::trace("trace-1"),
                    EventBuilder::trace("bad/id"),
                    EventBuilder::trace("trace-2").id(""),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.accepted, 1);
        let rejected: Vec<usize> = response.rejected.iter().map(|r| r.index).collect();
        assert_eq!(rejected, vec![1, 2]);
        assert!(response.job.is_some());
    }

    #[tokio::test]
    async fn test_all_rejected_enqueues_nothing() {
        let f = fixture();
        let response = f
            .intake
            .ingest(batch("t1", vec![EventBuilder::trace("a:b")]))
            .await
            .unwrap();

        assert!(response.job.is_none());
        assert_eq!(f.queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_tenant_rejects_batch() {
        let f = fixture();
        let result = f
            .intake
            .ingest(batch("t/1", vec![EventBuilder::trace("trace-1")]))
            .await;
        assert!(result.is_err());
    }
}
