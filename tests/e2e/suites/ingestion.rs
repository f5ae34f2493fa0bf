//! 摄取全链路测试套件
//!
//! 测试从批次受理到双存储落盘、变更信号发布的完整链路。

use crate::setup::{TENANT, TestEnvironment};
use ingest_shared::analytics::EntityReader;
use ingest_shared::dlq::DeadLetterMessage;
use ingest_shared::events::{EntityChangedEvent, EntityType};
use ingest_shared::kafka::topics;
use ingest_shared::queue::JobQueue;
use ingest_shared::test_utils::{EventBuilder, batch};
use ingest_shared::worker::JobOutcome;
use ingestion_worker::PipelineOutcome;
use ingestion_worker::writer::MetadataStore;
use serde_json::json;

#[cfg(test)]
mod convergence_tests {
    use super::*;

    /// 分段上报的 observation 无论到达顺序如何都收敛为同一结果
    #[tokio::test]
    async fn test_observation_updates_converge_regardless_of_order() {
        let env = TestEnvironment::setup();

        // 结束事件先于开始事件到达
        env.intake
            .ingest(batch(
                TENANT,
                vec![
                    EventBuilder::observation("obs-1")
                        .id("end")
                        .at(900)
                        .field("traceId", json!("tr-1"))
                        .field("output", json!("Paris"))
                        .field("usageDetails", json!({"output": 3})),
                ],
            ))
            .await
            .unwrap();
        env.intake
            .ingest(batch(
                TENANT,
                vec![
                    EventBuilder::observation("obs-1")
                        .id("start")
                        .at(100)
                        .field("traceId", json!("tr-1"))
                        .field("name", json!("llm-call"))
                        .field("input", json!("Capital of France?"))
                        .field("usageDetails", json!({"input": 12})),
                ],
            ))
            .await
            .unwrap();

        let outcomes = env.drain_ingestion().await;
        assert!(outcomes.iter().all(|o| *o == JobOutcome::Acked));

        let latest = env
            .analytics
            .latest(TENANT, EntityType::Observation, "obs-1")
            .await
            .unwrap()
            .expect("observation 应已写入分析库");
        let payload = latest.payload_json().unwrap();
        assert_eq!(payload["name"], "llm-call");
        assert_eq!(payload["input"], "Capital of France?");
        assert_eq!(payload["output"], "Paris");
        assert_eq!(payload["eventCount"], 2);

        let record = env
            .metadata
            .get(TENANT, EntityType::Observation, "obs-1")
            .await
            .unwrap()
            .expect("observation 应已写入关系库");
        assert_eq!(record.trace_id.as_deref(), Some("tr-1"));
        assert_eq!(record.max_seq as u64, latest.source_seq);
    }

    /// 同一批次中的多个实体各自合并、各自发信号
    #[tokio::test]
    async fn test_mixed_batch_produces_one_signal_per_entity() {
        let env = TestEnvironment::setup();

        env.intake
            .ingest(batch(
                TENANT,
                vec![
                    EventBuilder::trace("tr-1").field("name", json!("chat-completion")),
                    EventBuilder::observation("obs-1").field("traceId", json!("tr-1")),
                    EventBuilder::observation("obs-2").field("traceId", json!("tr-1")),
                ],
            ))
            .await
            .unwrap();
        env.drain_ingestion().await;

        let signals: Vec<EntityChangedEvent> = env.publisher.decoded(topics::ENTITY_CHANGED);
        let mut ids: Vec<_> = signals.iter().map(|s| s.entity_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["obs-1", "obs-2", "tr-1"]);
        assert!(signals.iter().all(|s| s.trace_id.as_deref() == Some("tr-1")));
    }
}

#[cfg(test)]
mod idempotency_tests {
    use super::*;

    /// 重放已完成的作业不会重复写入
    #[tokio::test]
    async fn test_replayed_job_is_acknowledged_as_duplicate() {
        let env = TestEnvironment::setup();
        env.intake
            .ingest(batch(
                TENANT,
                vec![EventBuilder::trace("tr-1").field("name", json!("chat-completion"))],
            ))
            .await
            .unwrap();

        let job = env.claim_ingestion_job().await;
        let first = env.pipeline.process(&job).await.unwrap();
        assert!(matches!(first, PipelineOutcome::Processed { entities: 1, .. }));

        let second = env.pipeline.process(&job).await.unwrap();
        assert_eq!(second, PipelineOutcome::Duplicate);

        assert_eq!(env.metadata.upsert_calls(), 1);
        assert_eq!(env.analytics.row_count("traces", TENANT, "tr-1"), 1);
        assert_eq!(env.publisher.messages(topics::ENTITY_CHANGED).len(), 1);
    }

    /// 两个消费者并发处理同一作业，只有一个真正写入
    #[tokio::test]
    async fn test_concurrent_delivery_writes_once() {
        let env = TestEnvironment::setup();
        env.intake
            .ingest(batch(TENANT, vec![EventBuilder::trace("tr-race")]))
            .await
            .unwrap();

        // 同一暂存对象被另一个作业同时引用
        let job = env.claim_ingestion_job().await;
        let mut duplicate = job.clone();
        duplicate.id = format!("{}-dup", job.id);
        duplicate.lock_token = Some("other-consumer".to_string());

        let (a, b) = tokio::join!(env.pipeline.process(&job), env.pipeline.process(&duplicate));

        let processed = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Ok(PipelineOutcome::Processed { .. })))
            .count();
        assert_eq!(processed, 1, "a={a:?} b={b:?}");
        assert_eq!(env.metadata.upsert_calls(), 1);
        assert_eq!(env.publisher.messages(topics::ENTITY_CHANGED).len(), 1);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;

    /// 分析库短暂不可用时作业重投，最终只保留一行
    #[tokio::test]
    async fn test_analytics_outage_recovers_without_duplicates() {
        let env = TestEnvironment::setup();
        env.analytics.fail_next_inserts(3);

        env.intake
            .ingest(batch(TENANT, vec![EventBuilder::trace("tr-1").field("name", json!("a"))]))
            .await
            .unwrap();

        let outcomes = env.drain_ingestion().await;
        assert_eq!(outcomes.last(), Some(&JobOutcome::Acked));

        assert_eq!(env.analytics.row_count("traces", TENANT, "tr-1"), 1);
        assert_eq!(env.metadata.len(), 1);
        assert_eq!(env.publisher.messages(topics::ENTITY_CHANGED).len(), 1);
    }

    /// 暂存对象丢失时作业直接进入死信，不产生任何写入
    #[tokio::test]
    async fn test_missing_staged_blob_dead_letters() {
        let env = TestEnvironment::setup();
        env.intake
            .ingest(batch(TENANT, vec![EventBuilder::trace("tr-1")]))
            .await
            .unwrap();

        for key in env.objects.keys() {
            env.objects.remove(&key);
        }

        assert_eq!(env.drain_ingestion().await, vec![JobOutcome::DeadLettered]);
        assert_eq!(env.ingestion_queue.dead_letter_count(0).await.unwrap(), 1);
        assert!(env.metadata.is_empty());
        assert_eq!(env.analytics.insert_calls(), 0);

        let reports: Vec<DeadLetterMessage> = env.publisher.decoded(topics::DEAD_LETTER_QUEUE);
        assert_eq!(reports.len(), 1);
        assert!(reports[0].permanent);
        assert_eq!(reports[0].source_service, "ingestion-worker");
    }

    /// 批次中的无效事件被单独拒绝，其余事件照常处理
    #[tokio::test]
    async fn test_invalid_events_rejected_individually() {
        let env = TestEnvironment::setup();

        let response = env
            .intake
            .ingest(batch(
                TENANT,
                vec![
                    EventBuilder::trace("tr-ok"),
                    EventBuilder::trace(""),
                    EventBuilder::observation("obs-ok"),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.accepted, 2);
        assert_eq!(response.rejected.len(), 1);
        assert_eq!(response.rejected[0].index, 1);

        env.drain_ingestion().await;
        assert_eq!(env.metadata.len(), 2);
    }
}
