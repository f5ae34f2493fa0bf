//! 去重缓存
//!
//! 以 `(tenant, entityType, entityId, sourceBlobKey)` 为键的两阶段闸门：
//! `check_and_reserve` 原子地占位，`commit` 在两个存储都写入成功后写入已处理标记，
//! `release` 在失败时撤销占位。只有 commit 之后的键才算"已处理"，
//! 失败的工作单元因此可以被重投。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, warn};

use crate::cache::{Cache, CacheKey};
use crate::config::DedupConfig;
use crate::error::Result;
use crate::events::{BlobRef, EntityType};

const DONE_SENTINEL: &str = "done";
const PENDING_PREFIX: &str = "pending:";

/// 去重键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub source_blob_key: String,
}

impl DedupKey {
    pub fn for_blob(tenant_id: &str, blob: &BlobRef) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            entity_type: blob.entity_type,
            entity_id: blob.entity_id.clone(),
            source_blob_key: blob.key.clone(),
        }
    }

    pub fn to_key(&self) -> String {
        CacheKey::dedup(
            &self.tenant_id,
            self.entity_type.as_str(),
            &self.entity_id,
            &self.source_blob_key,
        )
    }
}

/// 占位结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// 当前调用者获得处理权
    Reserved,
    /// 已在保留窗口内处理过，直接跳过
    AlreadyProcessed,
    /// 其他消费者正在处理
    InFlight,
}

/// 去重存储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// 原子测试并占位，并发调用同一键时只有一个返回 `Reserved`
    ///
    /// 同一持有者再次占位会被重新授予并刷新期限，被取消的投递因此可以由重投接手
    async fn check_and_reserve(&self, key: &DedupKey, owner: &str) -> Result<ReserveOutcome>;

    /// 写入已处理标记，TTL 为保留窗口
    async fn commit(&self, key: &DedupKey) -> Result<()>;

    /// 撤销当前调用者持有的占位
    async fn release(&self, key: &DedupKey, owner: &str) -> Result<()>;

    async fn is_processed(&self, key: &DedupKey) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// Redis 实现
// ---------------------------------------------------------------------------

/// 不存在或由同一持有者占位时写入占位并返回 1；已完成返回 0；处理中返回 2
const RESERVE_SCRIPT: &str = r#"
local current = redis.call("get", KEYS[1])
if not current or current == ARGV[1] then
    redis.call("set", KEYS[1], ARGV[1], "PX", ARGV[2])
    return 1
end
if current == ARGV[3] then
    return 0
end
return 2
"#;

/// 只删除自己持有的占位
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// 基于 Redis 的去重存储
pub struct RedisDedupStore {
    cache: Cache,
    ttl: Duration,
    reservation_ttl: Duration,
}

impl RedisDedupStore {
    pub fn new(cache: Cache, config: &DedupConfig) -> Self {
        Self {
            cache,
            ttl: Duration::from_secs(config.ttl_secs),
            reservation_ttl: Duration::from_secs(config.reservation_ttl_secs),
        }
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn check_and_reserve(&self, key: &DedupKey, owner: &str) -> Result<ReserveOutcome> {
        let mut conn = self.cache.connection().await?;
        let status: i32 = redis::Script::new(RESERVE_SCRIPT)
            .key(key.to_key())
            .arg(format!("{PENDING_PREFIX}{owner}"))
            .arg(self.reservation_ttl.as_millis() as u64)
            .arg(DONE_SENTINEL)
            .invoke_async(&mut conn)
            .await?;

        let outcome = match status {
            1 => ReserveOutcome::Reserved,
            0 => ReserveOutcome::AlreadyProcessed,
            _ => ReserveOutcome::InFlight,
        };
        debug!(key = %key.to_key(), ?outcome, "去重占位");
        Ok(outcome)
    }

    async fn commit(&self, key: &DedupKey) -> Result<()> {
        let mut conn = self.cache.connection().await?;
        // 无条件覆盖：占位即使已过期被他人取得，写入结果也是幂等的
        let _: () = redis::cmd("SET")
            .arg(key.to_key())
            .arg(DONE_SENTINEL)
            .arg("PX")
            .arg(self.ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, key: &DedupKey, owner: &str) -> Result<()> {
        let mut conn = self.cache.connection().await?;
        let removed: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(key.to_key())
            .arg(format!("{PENDING_PREFIX}{owner}"))
            .invoke_async(&mut conn)
            .await?;

        if removed == 0 {
            warn!(key = %key.to_key(), owner, "占位已过期或被其他消费者持有");
        }
        Ok(())
    }

    async fn is_processed(&self, key: &DedupKey) -> Result<bool> {
        Ok(self.cache.get_raw(&key.to_key()).await?.as_deref() == Some(DONE_SENTINEL))
    }
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Marker {
    Pending(String),
    Done,
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    marker: Marker,
    expires_at: Instant,
}

/// 进程内去重存储，依靠 DashMap 分片锁保证单键原子性
pub struct InMemoryDedupStore {
    entries: DashMap<String, MemoryEntry>,
    ttl: Duration,
    reservation_ttl: Duration,
}

impl InMemoryDedupStore {
    pub fn new(config: &DedupConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            reservation_ttl: Duration::from_secs(config.reservation_ttl_secs),
        }
    }

    pub fn with_ttls(ttl: Duration, reservation_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            reservation_ttl,
        }
    }

    /// 当前已提交的键数量
    pub fn committed_count(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| matches!(e.marker, Marker::Done) && e.expires_at > now)
            .count()
    }
}

impl Default for InMemoryDedupStore {
    fn default() -> Self {
        Self::new(&DedupConfig::default())
    }
}

#[async_trait]
impl DedupStore for InMemoryDedupStore {
    async fn check_and_reserve(&self, key: &DedupKey, owner: &str) -> Result<ReserveOutcome> {
        let now = Instant::now();
        let pending = MemoryEntry {
            marker: Marker::Pending(owner.to_string()),
            expires_at: now + self.reservation_ttl,
        };

        match self.entries.entry(key.to_key()) {
            Entry::Vacant(vacant) => {
                vacant.insert(pending);
                Ok(ReserveOutcome::Reserved)
            }
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at <= now {
                    occupied.insert(pending);
                    return Ok(ReserveOutcome::Reserved);
                }
                match &occupied.get().marker {
                    Marker::Done => Ok(ReserveOutcome::AlreadyProcessed),
                    Marker::Pending(holder) if holder == owner => {
                        occupied.insert(pending);
                        Ok(ReserveOutcome::Reserved)
                    }
                    Marker::Pending(_) => Ok(ReserveOutcome::InFlight),
                }
            }
        }
    }

    async fn commit(&self, key: &DedupKey) -> Result<()> {
        self.entries.insert(
            key.to_key(),
            MemoryEntry {
                marker: Marker::Done,
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn release(&self, key: &DedupKey, owner: &str) -> Result<()> {
        self.entries.remove_if(&key.to_key(), |_, entry| {
            matches!(&entry.marker, Marker::Pending(o) if o == owner)
        });
        Ok(())
    }

    async fn is_processed(&self, key: &DedupKey) -> Result<bool> {
        Ok(self
            .entries
            .get(&key.to_key())
            .map(|e| matches!(e.marker, Marker::Done) && e.expires_at > Instant::now())
            .unwrap_or(false))
    }
}
