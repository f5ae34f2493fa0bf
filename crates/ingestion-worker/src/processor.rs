//! 摄取作业处理
//!
//! 一个作业的处理顺序：
//! 1. 为每个暂存引用占用去重键
//! 2. 读取引用对象及同一实体前缀下的其他对象
//! 3. 合并、富化
//! 4. 写入关系库与分析库
//! 5. 发布实体变更信号
//! 6. 提交去重键
//!
//! 去重键只在最后一步提交，之前任何一步失败都会释放占用并让作业重投。

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ingest_shared::dedup::{DedupKey, DedupStore, ReserveOutcome};
use ingest_shared::error::IngestError;
use ingest_shared::events::{BlobRef, EntityType, IngestionJob, RawEvent};
use ingest_shared::kafka::{MessagePublisher, publish_json, topics};
use ingest_shared::observability::metrics;
use ingest_shared::queue::QueueJob;
use ingest_shared::retry::{RetryPolicy, retry_transient};
use ingest_shared::worker::JobHandler;
use tracing::{debug, info, instrument, warn};

use crate::enrichment::Enricher;
use crate::error::{PipelineError, Result};
use crate::merge::{MergeEngine, MergedEntity};
use crate::staging::{StagingStore, entity_prefix};
use crate::writer::DualStoreWriter;

/// 作业处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Processed { entities: usize, events: usize },
    /// 所有引用都已在去重窗口内处理过
    Duplicate,
}

type EntityKey = (EntityType, String);

pub struct IngestionPipeline {
    staging: StagingStore,
    dedup: Arc<dyn DedupStore>,
    merger: MergeEngine,
    enricher: Enricher,
    writer: DualStoreWriter,
    publisher: Arc<dyn MessagePublisher>,
    publish_retry: RetryPolicy,
}

impl IngestionPipeline {
    pub fn new(
        staging: StagingStore,
        dedup: Arc<dyn DedupStore>,
        enricher: Enricher,
        writer: DualStoreWriter,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            staging,
            dedup,
            merger: MergeEngine::new(),
            enricher,
            writer,
            publisher,
            publish_retry: RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(2),
                multiplier: 2.0,
            },
        }
    }

    pub fn with_merge_engine(mut self, merger: MergeEngine) -> Self {
        self.merger = merger;
        self
    }

    pub fn with_publish_retry(mut self, retry: RetryPolicy) -> Self {
        self.publish_retry = retry;
        self
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, shard = job.shard, attempt = job.attempt))]
    pub async fn process(&self, job: &QueueJob) -> Result<PipelineOutcome> {
        let ingestion: IngestionJob = job.decode()?;
        if ingestion.blob_refs.is_empty() {
            return Err(PipelineError::InconsistentJob(format!(
                "作业 {} 不包含暂存引用",
                job.id
            )));
        }

        // 占位持有者取作业 ID，超时被取消的处理由重投接手
        let owner = job.id.clone();

        // 1. 占用去重键
        let mut reserved: Vec<DedupKey> = Vec::new();
        let mut pending: Vec<BlobRef> = Vec::new();
        for blob_ref in &ingestion.blob_refs {
            let key = DedupKey::for_blob(&ingestion.tenant_id, blob_ref);
            let outcome = match self.dedup.check_and_reserve(&key, &owner).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.release_all(&reserved, &owner).await;
                    return Err(e.into());
                }
            };

            match outcome {
                ReserveOutcome::Reserved => {
                    reserved.push(key);
                    pending.push(blob_ref.clone());
                }
                ReserveOutcome::AlreadyProcessed => {
                    metrics::record_dedup_hit(blob_ref.entity_type.as_str());
                    debug!(blob_key = %blob_ref.key, "暂存对象已处理过，跳过");
                }
                ReserveOutcome::InFlight => {
                    self.release_all(&reserved, &owner).await;
                    return Err(PipelineError::ReservationBusy { key: key.to_key() });
                }
            }
        }

        if reserved.is_empty() {
            info!(tenant_id = %ingestion.tenant_id, "作业内容均已处理，按重复投递确认");
            return Ok(PipelineOutcome::Duplicate);
        }

        // 2 ~ 5
        let outcome = match self.run_unit(&ingestion.tenant_id, &pending).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.release_all(&reserved, &owner).await;
                return Err(e);
            }
        };

        // 6. 两个存储都已成功，提交去重闸门
        for (index, key) in reserved.iter().enumerate() {
            if let Err(e) = self.dedup.commit(key).await {
                self.release_all(&reserved[index..], &owner).await;
                return Err(e.into());
            }
        }

        info!(tenant_id = %ingestion.tenant_id, outcome = ?outcome, "摄取作业处理完成");
        Ok(outcome)
    }

    async fn run_unit(&self, tenant_id: &str, refs: &[BlobRef]) -> Result<PipelineOutcome> {
        let groups = self.load_events(tenant_id, refs).await?;

        let mut entities: Vec<MergedEntity> = Vec::with_capacity(groups.len());
        let mut event_total = 0;
        for (events, keys) in groups.into_values() {
            event_total += events.len();
            if let Some(entity) = self.merger.merge_entity(events, &keys) {
                entities.push(entity);
            }
        }
        metrics::record_events_merged(event_total);

        for entity in &mut entities {
            self.enricher.enrich(entity).await?;
        }

        self.writer.persist(&entities).await?;
        self.publish_changes(&entities).await?;

        Ok(PipelineOutcome::Processed {
            entities: entities.len(),
            events: event_total,
        })
    }

    /// 按实体收集事件：引用对象必须存在且可解析，前缀下的其他对象缺失或损坏时跳过
    async fn load_events(
        &self,
        tenant_id: &str,
        refs: &[BlobRef],
    ) -> Result<BTreeMap<EntityKey, (Vec<RawEvent>, Vec<String>)>> {
        let mut groups: BTreeMap<EntityKey, (Vec<RawEvent>, Vec<String>)> = BTreeMap::new();
        let mut loaded: BTreeSet<String> = BTreeSet::new();

        for blob_ref in refs {
            if !loaded.insert(blob_ref.key.clone()) {
                continue;
            }
            let blob = self.staging.get(&blob_ref.key).await?;
            if blob.tenant_id != tenant_id
                || blob.entity_type != blob_ref.entity_type
                || blob.entity_id != blob_ref.entity_id
            {
                return Err(PipelineError::InconsistentJob(format!(
                    "暂存对象 {} 与作业引用的租户或实体不一致",
                    blob_ref.key
                )));
            }

            let group = groups
                .entry((blob_ref.entity_type, blob_ref.entity_id.clone()))
                .or_default();
            group.0.extend(blob.events);
            group.1.push(blob_ref.key.clone());
        }

        let entity_keys: Vec<EntityKey> = groups.keys().cloned().collect();
        for (entity_type, entity_id) in entity_keys {
            let prefix = entity_prefix(tenant_id, entity_type, &entity_id);
            for key in self.staging.list(&prefix).await? {
                if !loaded.insert(key.clone()) {
                    continue;
                }

                let blob = match self.staging.get(&key).await {
                    Ok(blob) => blob,
                    Err(PipelineError::Shared(IngestError::StagingMissing { .. })) => {
                        warn!(blob_key = %key, "前缀下的暂存对象已不存在，跳过");
                        metrics::record_staging_skipped("missing");
                        continue;
                    }
                    Err(PipelineError::MalformedBlob { reason, .. }) => {
                        warn!(blob_key = %key, reason = %reason, "前缀下的暂存对象无法解析，跳过");
                        metrics::record_staging_skipped("malformed");
                        continue;
                    }
                    Err(e) => return Err(e),
                };

                let events = blob.events.into_iter().filter(|e| {
                    e.tenant_id == tenant_id && e.entity_type == entity_type && e.entity_id == entity_id
                });
                if let Some(group) = groups.get_mut(&(entity_type, entity_id.clone())) {
                    group.0.extend(events);
                    group.1.push(key);
                }
            }
        }

        Ok(groups)
    }

    async fn publish_changes(&self, entities: &[MergedEntity]) -> Result<()> {
        for entity in entities {
            let event = entity.changed_event();
            retry_transient(&self.publish_retry, "publish_entity_changed", || {
                publish_json(
                    self.publisher.as_ref(),
                    topics::ENTITY_CHANGED,
                    &event.tenant_id,
                    &event,
                )
            })
            .await?;
        }
        Ok(())
    }

    /// 尽力释放占用，失败时等占用过期
    async fn release_all(&self, keys: &[DedupKey], owner: &str) {
        for key in keys {
            if let Err(e) = self.dedup.release(key, owner).await {
                warn!(key = %key.to_key(), error = %e, "释放去重占用失败");
            }
        }
    }
}

#[async_trait]
impl JobHandler for IngestionPipeline {
    async fn handle(&self, job: &QueueJob) -> ingest_shared::error::Result<()> {
        self.process(job).await.map(|_| ()).map_err(IngestError::from)
    }
}
