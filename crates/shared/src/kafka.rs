//! Kafka 消息通道
//!
//! 两个 topic：摄取管道在双写成功后发布实体变更信号，工作池发布死信报告。
//! 发布方依赖 [`MessagePublisher`]，测试中以 [`InMemoryPublisher`] 替换。
//! 消费方按至少一次语义处理，处理完成后才存储位点。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::KafkaConfig;
use crate::error::IngestError;
use crate::observability::tracing::current_trace_id;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 携带发布方 trace ID 的消息头
pub const TRACE_HEADER: &str = "trace-id";

pub mod topics {
    /// 实体写入两个存储后发布的变更信号
    pub const ENTITY_CHANGED: &str = "ingest.entity.changed";
    /// 重试耗尽或永久失败的作业报告
    pub const DEAD_LETTER_QUEUE: &str = "ingest.dlq";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 拥有所有权的消息副本，可以跨 await 传给处理函数
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// 发布方写入的 trace ID，用于把消费日志关联回摄取链路
    pub fn trace_header(&self) -> Option<&str> {
        self.headers.get(TRACE_HEADER).map(String::as_str)
    }

    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, IngestError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| IngestError::Kafka(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// MessagePublisher
// ---------------------------------------------------------------------------

/// 消息发布抽象
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), IngestError>;
}

/// 序列化为 JSON 后发布
pub async fn publish_json<T: Serialize + ?Sized>(
    publisher: &dyn MessagePublisher,
    topic: &str,
    key: &str,
    value: &T,
) -> Result<(), IngestError> {
    let payload = serde_json::to_vec(value)?;
    publisher.publish(topic, key, &payload).await
}

/// 发布记录
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// 进程内发布器，记录所有消息，可注入连续失败
#[derive(Default)]
pub struct InMemoryPublisher {
    messages: Mutex<Vec<PublishedMessage>>,
    failures_remaining: Mutex<u32>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来的 n 次发布返回瞬时错误
    pub fn fail_next(&self, n: u32) {
        *self.failures_remaining.lock() = n;
    }

    pub fn messages(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages
            .lock()
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// 按 topic 取出并反序列化所有消息
    pub fn decoded<T: DeserializeOwned>(&self, topic: &str) -> Vec<T> {
        self.messages(topic)
            .iter()
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), IngestError> {
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestError::Kafka("注入的发布失败".to_string()));
            }
        }
        self.messages.lock().push(PublishedMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 幂等生产者
///
/// 开启 `enable.idempotence`，broker 侧对同一生产者会话内的重发去重；
/// 跨会话的重复由消费方的幂等处理兜底。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, IngestError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("linger.ms", "5")
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| IngestError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(5),
        })
    }

    /// 发送一条消息，当前 span 的 trace ID 写入消息头
    pub async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), IngestError> {
        let mut record = FutureRecord::to(topic).key(key).payload(payload);
        if let Some(trace_id) = current_trace_id() {
            record = record.headers(OwnedHeaders::new().insert(Header {
                key: TRACE_HEADER,
                value: Some(trace_id.as_str()),
            }));
        }

        let delivery = self
            .producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| IngestError::Kafka(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }
}

#[async_trait]
impl MessagePublisher for KafkaProducer {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), IngestError> {
        self.send(topic, key, payload).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 至少一次语义的消费者
///
/// 自动提交开启但关闭自动存储位点：每条消息在处理函数返回后才存储位点，
/// 进程崩溃时未处理完的消息会被重新投递。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    group_id: String,
}

impl KafkaConsumer {
    /// `group_id_suffix` 让同一份配置派生出独立的消费组，如 `trace-ingest.eval`
    pub fn new(config: &KafkaConfig, group_id_suffix: Option<&str>) -> Result<Self, IngestError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .create()
            .map_err(|e| IngestError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "Kafka 消费者已初始化");
        Ok(Self { consumer, group_id })
    }

    pub fn subscribe(&self, topics: &[&str]) -> Result<(), IngestError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| IngestError::Kafka(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, group_id = %self.group_id, "已订阅 Kafka topics");
        Ok(())
    }

    /// 消费循环，关闭信号为 `true` 时在当前消息处理完后退出
    ///
    /// 处理函数的错误只记录日志，位点照常存储：瞬时错误应在处理函数内部重试，
    /// 返回到这里的错误视为该消息无法处理，不能阻塞整个分区。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), IngestError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!(group_id = %self.group_id, "Kafka 消费循环已启动");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，Kafka 消费循环退出");
                        break;
                    }
                }

                next = stream.next() => {
                    let Some(next) = next else {
                        warn!("Kafka 消息流意外结束");
                        break;
                    };

                    let msg = match next {
                        Ok(borrowed) => ConsumerMessage::from_borrowed(&borrowed),
                        Err(e) => {
                            error!(error = %e, "接收 Kafka 消息出错");
                            continue;
                        }
                    };
                    let (topic, partition, offset) = (msg.topic.clone(), msg.partition, msg.offset);
                    debug!(
                        topic = %topic,
                        partition,
                        offset,
                        upstream_trace = msg.trace_header().unwrap_or("-"),
                        "收到 Kafka 消息"
                    );

                    if let Err(e) = handler(msg).await {
                        error!(topic = %topic, partition, offset, error = %e, "消息处理失败，跳过");
                    }

                    // 存储的是下一条待消费的位点
                    if let Err(e) = self.consumer.store_offset(&topic, partition, offset + 1) {
                        warn!(topic = %topic, partition, offset, error = %e, "存储消费位点失败");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EntityChangedEvent, EntityType};
    use chrono::Utc;
    use serde_json::json;

    fn message(payload: Vec<u8>, headers: HashMap<String, String>) -> ConsumerMessage {
        ConsumerMessage {
            topic: topics::ENTITY_CHANGED.to_string(),
            partition: 3,
            offset: 42,
            key: Some("tenant-1".to_string()),
            payload,
            timestamp: Some(1_714_550_400_000),
            headers,
        }
    }

    #[tokio::test]
    async fn test_in_memory_publisher_records_and_fails() {
        let publisher = InMemoryPublisher::new();
        publisher.fail_next(1);

        assert!(publisher.publish("t", "k", b"{}").await.is_err());
        publish_json(&publisher, "t", "k", &json!({"a": 1}))
            .await
            .unwrap();

        let decoded: Vec<serde_json::Value> = publisher.decoded("t");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0]["a"], 1);
        assert_eq!(publisher.messages("t")[0].key, "k");
        assert!(publisher.messages("other").is_empty());
    }

    #[test]
    fn test_entity_changed_signal_decodes() {
        let event = EntityChangedEvent {
            tenant_id: "tenant-1".to_string(),
            entity_type: EntityType::Observation,
            entity_id: "obs-1".to_string(),
            trace_id: Some("tr-1".to_string()),
            name: Some("llm-call".to_string()),
            tags: vec!["prod".to_string()],
            metadata: json!({"region": "eu"}),
            environment: None,
            user_id: None,
            session_id: None,
            release: None,
            version: None,
            level: None,
            max_seq: 9,
            changed_at: Utc::now(),
        };
        let msg = message(serde_json::to_vec(&event).unwrap(), HashMap::new());

        let decoded: EntityChangedEvent = msg.deserialize_payload().unwrap();
        assert_eq!(decoded.entity_id, "obs-1");
        assert_eq!(decoded.max_seq, 9);
        assert!(msg.trace_header().is_none());
    }

    #[test]
    fn test_invalid_payload_is_kafka_error() {
        let msg = message(b"not json".to_vec(), HashMap::new());
        let result: Result<EntityChangedEvent, _> = msg.deserialize_payload();
        assert!(matches!(result, Err(IngestError::Kafka(_))));
    }

    #[test]
    fn test_trace_header() {
        let headers = HashMap::from([(TRACE_HEADER.to_string(), "4bf92f35".to_string())]);
        let msg = message(b"{}".to_vec(), headers);
        assert_eq!(msg.trace_header(), Some("4bf92f35"));
    }
}
