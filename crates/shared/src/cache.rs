//! Redis 客户端
//!
//! 去重闸门、分片队列、序列号分配和参考数据缓存共用同一个客户端，
//! 键名统一由 [`CacheKey`] 生成，全部带 `ns:` 前缀。

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};

use crate::config::RedisConfig;
use crate::error::{IngestError, Result};

#[derive(Clone)]
pub struct Cache {
    client: Client,
}

impl Cache {
    pub fn new(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())?;
        info!("Redis 客户端已创建");
        Ok(Self { client })
    }

    /// 多路复用连接，执行 Lua 脚本的组件直接使用
    pub async fn connection(&self) -> Result<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(IngestError::from)
    }

    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn get_raw(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    /// 读取缓存，未命中时调用 `loader` 并回写
    ///
    /// `T` 为 `Option<_>` 时空结果也会被缓存，避免不存在的参考数据反复穿透到关系库。
    pub async fn get_or_load<T, F, Fut>(&self, key: &str, ttl: Duration, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut conn = self.connection().await?;
        let cached: Option<String> = conn.get(key).await?;
        if let Some(raw) = cached {
            match serde_json::from_str(&raw) {
                Ok(value) => return Ok(value),
                // 结构变更后的旧缓存，按未命中处理
                Err(e) => debug!(key, error = %e, "缓存内容无法解析，重新加载"),
            }
        }

        let value = loader().await?;
        let serialized = serde_json::to_string(&value)?;
        let _: () = conn.set_ex(key, serialized, ttl.as_secs().max(1)).await?;
        Ok(value)
    }

    /// 原子地预留 `count` 个连续序列号，返回区间的末尾值
    pub async fn reserve_sequence(&self, key: &str, count: u64) -> Result<u64> {
        let mut conn = self.connection().await?;
        let end: i64 = conn.incr(key, count as i64).await?;
        u64::try_from(end).map_err(|_| IngestError::Internal(format!("序列号 {key} 为负值: {end}")))
    }
}

/// 缓存键生成器
pub struct CacheKey;

impl CacheKey {
    /// 去重键：`ns:dedup:{tenantId}:{entityType}:{entityId}:{sourceBlobKey}`
    pub fn dedup(tenant_id: &str, entity_type: &str, entity_id: &str, blob_key: &str) -> String {
        format!("ns:dedup:{tenant_id}:{entity_type}:{entity_id}:{blob_key}")
    }

    /// 租户级摄取序列号
    pub fn ingestion_seq(tenant_id: &str) -> String {
        format!("ns:seq:{tenant_id}")
    }

    pub fn queue_shard(queue: &str, shard: u32) -> String {
        format!("ns:queue:{queue}:{shard}")
    }

    pub fn model_price(tenant_id: &str, model: &str) -> String {
        format!("ns:ref:model:{tenant_id}:{model}")
    }

    /// 版本 0 表示最新版本
    pub fn prompt(tenant_id: &str, name: &str, version: i32) -> String {
        format!("ns:ref:prompt:{tenant_id}:{name}:{version}")
    }
}
