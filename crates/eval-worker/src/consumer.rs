//! 实体变更信号消费者
//!
//! 订阅摄取管道发布的 `ingest.entity.changed`，逐条交给 [`EvalTrigger`] 匹配评估规则。

use std::sync::Arc;

use ingest_shared::config::KafkaConfig;
use ingest_shared::events::EntityChangedEvent;
use ingest_shared::kafka::{ConsumerMessage, KafkaConsumer, topics};
use ingest_shared::retry::{RetryPolicy, retry_transient};
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::Result;
use crate::trigger::{EvalTrigger, TriggerReport};

pub struct EntityChangedConsumer {
    consumer: KafkaConsumer,
    trigger: Arc<EvalTrigger>,
    retry: RetryPolicy,
}

impl EntityChangedConsumer {
    pub fn new(config: &KafkaConfig, trigger: Arc<EvalTrigger>) -> Result<Self> {
        let consumer = KafkaConsumer::new(config, Some("eval"))?;
        Ok(Self {
            consumer,
            trigger,
            retry: RetryPolicy::default(),
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        self.consumer.subscribe(&[topics::ENTITY_CHANGED])?;
        info!(topic = topics::ENTITY_CHANGED, "实体变更消费者已启动");

        let trigger = self.trigger;
        let retry = self.retry;

        self.consumer
            .start(shutdown, |msg| {
                let trigger = &trigger;
                let retry = &retry;
                async move {
                    if let Err(e) = handle_message(trigger, retry, &msg).await {
                        error!(
                            error = %e,
                            topic = %msg.topic,
                            partition = msg.partition,
                            offset = msg.offset,
                            key = ?msg.key,
                            "处理实体变更信号失败"
                        );
                    }
                    Ok(())
                }
            })
            .await;

        info!("实体变更消费者已停止");
        Ok(())
    }
}

/// 处理单条信号
///
/// 存储类瞬时故障在本地退避重试；无法解析的消息直接返回错误。
pub async fn handle_message(
    trigger: &EvalTrigger,
    retry: &RetryPolicy,
    msg: &ConsumerMessage,
) -> Result<TriggerReport> {
    let event: EntityChangedEvent = msg.deserialize_payload()?;

    let report = retry_transient(retry, "eval_trigger", || async {
        trigger
            .on_entity_changed(&event)
            .await
            .map_err(ingest_shared::error::IngestError::from)
    })
    .await?;
    Ok(report)
}
