//! 分片作业队列
//!
//! 作业按租户哈希分配到固定数量的分片，同一租户的作业总在同一分片上，
//! 单消费者处理一个分片时保持租户内顺序。消费协议：
//!
//! - `claim` 授予带期限的独占租约，租约期间其他 `claim` 取不到该作业
//! - `extend` 续约；租约过期的作业由 `reap_stalled` 重新入队或进入死信
//! - `ack` 完成；`nack` 按指数退避重新投递，重试耗尽或永久失败时进入死信
//!
//! 处理成功但未 ack 的作业会被重投，下游的去重闸门负责幂等。

mod memory;
mod redis_queue;

pub use memory::InMemoryJobQueue;
pub use redis_queue::RedisJobQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// 队列名
pub mod queues {
    pub const INGESTION: &str = "ingestion";
    pub const EVALUATION: &str = "evaluation";
}

/// 队列作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueJob {
    pub id: String,
    pub queue: String,
    pub shard: u32,
    pub payload: Value,
    /// 此前失败（含租约过期）的次数，首次投递为 0
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// 持有租约时的令牌，续约、确认都要求令牌一致
    pub lock_token: Option<String>,
    pub last_error: Option<String>,
}

impl QueueJob {
    /// 反序列化作业负载
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// 入队后返回给调用方的作业引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: String,
    pub queue: String,
    pub shard: u32,
}

/// nack 之后作业的去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDisposition {
    Retried { delay: Duration },
    DeadLettered,
}

/// 一轮租约回收的结果
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    pub requeued: usize,
    pub dead_lettered: Vec<QueueJob>,
}

/// 分片作业队列
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn name(&self) -> &str;

    fn shard_count(&self) -> u32;

    fn lease_duration(&self) -> Duration;

    /// 追加作业；`delay` 不为空时作业在延迟到期后才可被领取
    async fn enqueue(&self, shard: u32, payload: Value, delay: Option<Duration>)
    -> Result<JobRef>;

    /// 领取分片上最早到期的作业，没有可领取作业时返回 None
    async fn claim(&self, shard: u32) -> Result<Option<QueueJob>>;

    /// 续约，租约已丢失时返回 `LeaseLost`
    async fn extend(&self, job: &QueueJob) -> Result<()>;

    async fn ack(&self, job: &QueueJob) -> Result<()>;

    /// 显式失败；`permanent` 为 true 时直接进入死信
    async fn nack(&self, job: &QueueJob, reason: &str, permanent: bool)
    -> Result<NackDisposition>;

    /// 回收租约已过期的作业
    async fn reap_stalled(&self, shard: u32) -> Result<ReapReport>;

    async fn dead_letters(&self, shard: u32, limit: usize) -> Result<Vec<QueueJob>>;

    async fn dead_letter_count(&self, shard: u32) -> Result<u64>;

    /// 将死信作业重置为首次投递并重新入队
    async fn replay_dead_letter(&self, shard: u32, job_id: &str) -> Result<bool>;
}

/// 租户到分片的稳定映射
pub fn shard_for(tenant_id: &str, shards: u32) -> u32 {
    let digest = Sha256::digest(tenant_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) % u64::from(shards.max(1))) as u32
}

/// 按租户入队
pub async fn enqueue_for_tenant(
    queue: &dyn JobQueue,
    tenant_id: &str,
    payload: Value,
    delay: Option<Duration>,
) -> Result<JobRef> {
    let shard = shard_for(tenant_id, queue.shard_count());
    queue.enqueue(shard, payload, delay).await
}
