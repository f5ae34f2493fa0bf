//! 死信报告
//!
//! 队列作业重试耗尽或被判定为永久失败后，作业本身留在队列的死信列表中等待回放，
//! 同时向 `ingest.dlq` 发布一条报告供告警与人工排查。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::IngestError;
use crate::kafka::{MessagePublisher, publish_json, topics};
use crate::observability::tracing::current_trace_id;
use crate::queue::QueueJob;

// ---------------------------------------------------------------------------
// DeadLetterMessage — 死信报告信封
// ---------------------------------------------------------------------------

/// 死信报告信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 队列作业 ID
    pub message_id: String,
    /// 来源队列名
    pub source_queue: String,
    pub shard: u32,
    /// 原始作业负载
    pub payload: serde_json::Value,
    /// 最后一次失败原因
    pub error: String,
    /// 已执行次数
    pub attempts: u32,
    /// 是否为永久性失败（未耗尽重试即进入死信）
    pub permanent: bool,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    /// 来源服务
    pub source_service: String,
    /// 写入报告时所在 span 的 trace ID
    pub trace_id: Option<String>,
}

impl DeadLetterMessage {
    pub fn from_job(
        job: &QueueJob,
        error: impl Into<String>,
        permanent: bool,
        source_service: impl Into<String>,
    ) -> Self {
        Self {
            message_id: job.id.clone(),
            source_queue: job.queue.clone(),
            shard: job.shard,
            payload: job.payload.clone(),
            error: error.into(),
            attempts: job.attempt + 1,
            permanent,
            enqueued_at: job.enqueued_at,
            dead_lettered_at: Utc::now(),
            source_service: source_service.into(),
            trace_id: current_trace_id(),
        }
    }
}

// ---------------------------------------------------------------------------
// DlqProducer
// ---------------------------------------------------------------------------

/// 死信报告发布者
#[derive(Clone)]
pub struct DlqProducer {
    publisher: Arc<dyn MessagePublisher>,
    source_service: String,
}

impl DlqProducer {
    pub fn new(publisher: Arc<dyn MessagePublisher>, source_service: &str) -> Self {
        Self {
            publisher,
            source_service: source_service.to_string(),
        }
    }

    /// 发布死信报告
    ///
    /// 作业已留在队列死信列表中，报告发布失败只记录日志，不影响作业状态。
    pub async fn report(&self, job: &QueueJob, reason: &str, permanent: bool) {
        let message = DeadLetterMessage::from_job(job, reason, permanent, &self.source_service);

        match self.send(&message).await {
            Ok(()) => warn!(
                job_id = %job.id,
                queue = %job.queue,
                shard = job.shard,
                attempts = message.attempts,
                permanent,
                error = reason,
                "作业已进入死信队列"
            ),
            Err(e) => error!(
                job_id = %job.id,
                queue = %job.queue,
                error = %e,
                "死信报告发布失败"
            ),
        }
    }

    async fn send(&self, message: &DeadLetterMessage) -> Result<(), IngestError> {
        publish_json(
            self.publisher.as_ref(),
            topics::DEAD_LETTER_QUEUE,
            &message.message_id,
            message,
        )
        .await
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::InMemoryPublisher;
    use serde_json::json;

    fn job() -> QueueJob {
        QueueJob {
            id: "job-1".to_string(),
            queue: "ingestion".to_string(),
            shard: 2,
            payload: json!({"tenantId": "t1", "blobRefs": []}),
            attempt: 4,
            enqueued_at: Utc::now(),
            lock_token: Some("tok".to_string()),
            last_error: None,
        }
    }

    #[test]
    fn test_dead_letter_message_from_job() {
        let msg = DeadLetterMessage::from_job(&job(), "blob missing", true, "ingestion-worker");

        assert_eq!(msg.message_id, "job-1");
        assert_eq!(msg.source_queue, "ingestion");
        assert_eq!(msg.shard, 2);
        assert_eq!(msg.attempts, 5);
        assert!(msg.permanent);
        assert_eq!(msg.payload["tenantId"], "t1");

        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("sourceQueue").is_some());
        assert!(value.get("deadLetteredAt").is_some());
    }

    #[tokio::test]
    async fn test_report_publishes_to_dlq_topic() {
        let publisher = Arc::new(InMemoryPublisher::new());
        let producer = DlqProducer::new(publisher.clone(), "ingestion-worker");

        producer.report(&job(), "retries exhausted", false).await;

        let sent: Vec<DeadLetterMessage> = publisher.decoded(topics::DEAD_LETTER_QUEUE);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].error, "retries exhausted");
        assert_eq!(sent[0].source_service, "ingestion-worker");
    }

    #[tokio::test]
    async fn test_report_failure_is_swallowed() {
        let publisher = Arc::new(InMemoryPublisher::new());
        publisher.fail_next(1);
        let producer = DlqProducer::new(publisher.clone(), "svc");

        producer.report(&job(), "boom", true).await;
        assert!(publisher.messages(topics::DEAD_LETTER_QUEUE).is_empty());
    }
}
