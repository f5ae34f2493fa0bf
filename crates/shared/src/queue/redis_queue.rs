//! Redis 分片队列
//!
//! 每个分片使用四类键（前缀 `ns:queue:{queue}:{shard}`）：
//! `:ready` 有序集合（分数为可领取时间）、`:leased` 有序集合（分数为租约截止时间）、
//! `:job:{id}` 哈希（负载、尝试次数、令牌）和 `:dead` 列表。
//! 状态迁移全部在 Lua 脚本内完成，多个消费者并发操作同一分片时保持原子性。

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::MultiplexedConnection;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{JobQueue, JobRef, NackDisposition, QueueJob, ReapReport};
use crate::cache::{Cache, CacheKey};
use crate::config::QueueConfig;
use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;

const CLAIM_SCRIPT: &str = r#"
local ids = redis.call("zrangebyscore", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, 1)
if #ids == 0 then
    return false
end
local id = ids[1]
redis.call("zrem", KEYS[1], id)
redis.call("zadd", KEYS[2], ARGV[2], id)
local jk = ARGV[4] .. id
redis.call("hset", jk, "token", ARGV[3])
return {
    id,
    redis.call("hget", jk, "payload") or "null",
    redis.call("hget", jk, "attempt") or "0",
    redis.call("hget", jk, "enqueued_at") or "0",
    redis.call("hget", jk, "last_error") or ""
}
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("hget", ARGV[4], "token") ~= ARGV[2] then
    return 0
end
if not redis.call("zscore", KEYS[1], ARGV[1]) then
    return 0
end
redis.call("zadd", KEYS[1], ARGV[3], ARGV[1])
return 1
"#;

const ACK_SCRIPT: &str = r#"
if redis.call("hget", ARGV[3], "token") ~= ARGV[2] then
    return 0
end
redis.call("zrem", KEYS[1], ARGV[1])
redis.call("del", ARGV[3])
return 1
"#;

/// 返回 -1 表示租约已丢失，0 表示进入死信，1 表示重新入队
const NACK_SCRIPT: &str = r#"
if redis.call("hget", ARGV[3], "token") ~= ARGV[2] then
    return -1
end
redis.call("zrem", KEYS[2], ARGV[1])
redis.call("hincrby", ARGV[3], "attempt", 1)
redis.call("hset", ARGV[3], "last_error", ARGV[6])
redis.call("hdel", ARGV[3], "token")
if ARGV[4] == "1" then
    redis.call("rpush", KEYS[3], ARGV[1])
    return 0
end
redis.call("zadd", KEYS[1], ARGV[5], ARGV[1])
return 1
"#;

/// 返回 `{requeued, dead_id...}`
const REAP_SCRIPT: &str = r#"
local ids = redis.call("zrangebyscore", KEYS[2], "-inf", ARGV[1])
local requeued = 0
local dead = {}
for _, id in ipairs(ids) do
    redis.call("zrem", KEYS[2], id)
    local jk = ARGV[3] .. id
    local attempt = redis.call("hincrby", jk, "attempt", 1)
    redis.call("hset", jk, "last_error", "lease expired")
    redis.call("hdel", jk, "token")
    if attempt >= tonumber(ARGV[2]) then
        redis.call("rpush", KEYS[3], id)
        table.insert(dead, id)
    else
        redis.call("zadd", KEYS[1], ARGV[1], id)
        requeued = requeued + 1
    end
end
local out = {tostring(requeued)}
for _, id in ipairs(dead) do
    table.insert(out, id)
end
return out
"#;

const REPLAY_SCRIPT: &str = r#"
if redis.call("lrem", KEYS[1], 1, ARGV[1]) == 0 then
    return 0
end
redis.call("hset", ARGV[3], "attempt", 0)
redis.call("hdel", ARGV[3], "last_error")
redis.call("zadd", KEYS[2], ARGV[2], ARGV[1])
return 1
"#;

struct ShardKeys {
    ready: String,
    leased: String,
    dead: String,
    job_prefix: String,
}

impl ShardKeys {
    fn new(queue: &str, shard: u32) -> Self {
        let base = CacheKey::queue_shard(queue, shard);
        Self {
            ready: format!("{base}:ready"),
            leased: format!("{base}:leased"),
            dead: format!("{base}:dead"),
            job_prefix: format!("{base}:job:"),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}{id}", self.job_prefix)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_enqueued_at(ms: &str) -> DateTime<Utc> {
    ms.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// 基于 Redis 的分片作业队列
#[derive(Clone)]
pub struct RedisJobQueue {
    cache: Cache,
    name: String,
    shards: u32,
    lease: Duration,
    max_attempts: u32,
    backoff: RetryPolicy,
}

impl RedisJobQueue {
    pub fn new(cache: Cache, name: &str, config: &QueueConfig) -> Self {
        info!(queue = name, shards = config.shards, "Redis 作业队列已创建");
        Self {
            cache,
            name: name.to_string(),
            shards: config.shards.max(1),
            lease: config.lease(),
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff_policy(),
        }
    }

    fn keys(&self, shard: u32) -> ShardKeys {
        ShardKeys::new(&self.name, shard)
    }

    async fn conn(&self) -> Result<MultiplexedConnection> {
        self.cache.connection().await
    }

    async fn load_job(
        &self,
        conn: &mut MultiplexedConnection,
        shard: u32,
        id: &str,
    ) -> Result<Option<QueueJob>> {
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.keys(shard).job(id))
            .query_async(conn)
            .await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let payload = fields
            .get("payload")
            .map(|p| serde_json::from_str(p))
            .transpose()?
            .unwrap_or(Value::Null);

        Ok(Some(QueueJob {
            id: id.to_string(),
            queue: self.name.clone(),
            shard,
            payload,
            attempt: fields
                .get("attempt")
                .and_then(|a| a.parse().ok())
                .unwrap_or(0),
            enqueued_at: fields
                .get("enqueued_at")
                .map(|s| parse_enqueued_at(s))
                .unwrap_or_else(Utc::now),
            lock_token: fields.get("token").cloned(),
            last_error: fields.get("last_error").cloned(),
        }))
    }

    fn lease_token<'a>(&self, job: &'a QueueJob) -> Result<&'a str> {
        job.lock_token.as_deref().ok_or_else(|| IngestError::LeaseLost {
            job_id: job.id.clone(),
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn shard_count(&self) -> u32 {
        self.shards
    }

    fn lease_duration(&self) -> Duration {
        self.lease
    }

    #[instrument(skip(self, payload), fields(queue = %self.name))]
    async fn enqueue(
        &self,
        shard: u32,
        payload: Value,
        delay: Option<Duration>,
    ) -> Result<JobRef> {
        let shard = shard % self.shards;
        let keys = self.keys(shard);
        let id = Uuid::new_v4().to_string();
        let now = now_ms();
        let ready_at = now + delay.map(|d| d.as_millis() as i64).unwrap_or(0);

        let mut conn = self.conn().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("HSET")
            .arg(keys.job(&id))
            .arg("payload")
            .arg(serde_json::to_string(&payload)?)
            .arg("attempt")
            .arg(0)
            .arg("enqueued_at")
            .arg(now)
            .ignore()
            .cmd("ZADD")
            .arg(&keys.ready)
            .arg(ready_at)
            .arg(&id)
            .ignore()
            .query_async(&mut conn)
            .await?;

        debug!(job_id = %id, shard, "作业已入队");
        Ok(JobRef {
            job_id: id,
            queue: self.name.clone(),
            shard,
        })
    }

    async fn claim(&self, shard: u32) -> Result<Option<QueueJob>> {
        let keys = self.keys(shard);
        let now = now_ms();
        let token = Uuid::new_v4().to_string();

        let mut conn = self.conn().await?;
        let claimed: Option<Vec<String>> = redis::Script::new(CLAIM_SCRIPT)
            .key(&keys.ready)
            .key(&keys.leased)
            .arg(now)
            .arg(now + self.lease.as_millis() as i64)
            .arg(&token)
            .arg(&keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;

        let Some(fields) = claimed else {
            return Ok(None);
        };
        let [id, payload, attempt, enqueued_at, last_error]: [String; 5] =
            fields.try_into().map_err(|_| {
                IngestError::Internal("claim 脚本返回字段数量异常".to_string())
            })?;

        Ok(Some(QueueJob {
            id,
            queue: self.name.clone(),
            shard,
            payload: serde_json::from_str(&payload)?,
            attempt: attempt.parse().unwrap_or(0),
            enqueued_at: parse_enqueued_at(&enqueued_at),
            lock_token: Some(token),
            last_error: (!last_error.is_empty()).then_some(last_error),
        }))
    }

    async fn extend(&self, job: &QueueJob) -> Result<()> {
        let keys = self.keys(job.shard);
        let token = self.lease_token(job)?;

        let mut conn = self.conn().await?;
        let extended: i32 = redis::Script::new(EXTEND_SCRIPT)
            .key(&keys.leased)
            .arg(&job.id)
            .arg(token)
            .arg(now_ms() + self.lease.as_millis() as i64)
            .arg(keys.job(&job.id))
            .invoke_async(&mut conn)
            .await?;

        if extended == 1 {
            Ok(())
        } else {
            Err(IngestError::LeaseLost {
                job_id: job.id.clone(),
            })
        }
    }

    async fn ack(&self, job: &QueueJob) -> Result<()> {
        let keys = self.keys(job.shard);
        let token = self.lease_token(job)?;

        let mut conn = self.conn().await?;
        let acked: i32 = redis::Script::new(ACK_SCRIPT)
            .key(&keys.leased)
            .arg(&job.id)
            .arg(token)
            .arg(keys.job(&job.id))
            .invoke_async(&mut conn)
            .await?;

        if acked == 0 {
            warn!(job_id = %job.id, "ack 时租约已丢失，作业可能被重投");
            return Err(IngestError::LeaseLost {
                job_id: job.id.clone(),
            });
        }
        Ok(())
    }

    async fn nack(
        &self,
        job: &QueueJob,
        reason: &str,
        permanent: bool,
    ) -> Result<NackDisposition> {
        let keys = self.keys(job.shard);
        let token = self.lease_token(job)?;
        let dead = permanent || job.attempt + 1 >= self.max_attempts;
        let delay = self.backoff.jittered_delay_for_attempt(job.attempt);

        let mut conn = self.conn().await?;
        let status: i32 = redis::Script::new(NACK_SCRIPT)
            .key(&keys.ready)
            .key(&keys.leased)
            .key(&keys.dead)
            .arg(&job.id)
            .arg(token)
            .arg(keys.job(&job.id))
            .arg(if dead { "1" } else { "0" })
            .arg(now_ms() + delay.as_millis() as i64)
            .arg(reason)
            .invoke_async(&mut conn)
            .await?;

        match status {
            0 => Ok(NackDisposition::DeadLettered),
            1 => Ok(NackDisposition::Retried { delay }),
            _ => Err(IngestError::LeaseLost {
                job_id: job.id.clone(),
            }),
        }
    }

    async fn reap_stalled(&self, shard: u32) -> Result<ReapReport> {
        let keys = self.keys(shard);

        let mut conn = self.conn().await?;
        let reply: Vec<String> = redis::Script::new(REAP_SCRIPT)
            .key(&keys.ready)
            .key(&keys.leased)
            .key(&keys.dead)
            .arg(now_ms())
            .arg(self.max_attempts)
            .arg(&keys.job_prefix)
            .invoke_async(&mut conn)
            .await?;

        let mut iter = reply.into_iter();
        let requeued = iter.next().and_then(|n| n.parse().ok()).unwrap_or(0);
        let mut dead_lettered = Vec::new();
        for id in iter {
            if let Some(job) = self.load_job(&mut conn, shard, &id).await? {
                dead_lettered.push(job);
            }
        }

        if requeued > 0 || !dead_lettered.is_empty() {
            info!(
                queue = %self.name,
                shard,
                requeued,
                dead_lettered = dead_lettered.len(),
                "已回收租约过期的作业"
            );
        }
        Ok(ReapReport {
            requeued,
            dead_lettered,
        })
    }

    async fn dead_letters(&self, shard: u32, limit: usize) -> Result<Vec<QueueJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let keys = self.keys(shard);
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(&keys.dead)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.load_job(&mut conn, shard, &id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn dead_letter_count(&self, shard: u32) -> Result<u64> {
        let mut conn = self.conn().await?;
        let count: u64 = redis::cmd("LLEN")
            .arg(self.keys(shard).dead)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn replay_dead_letter(&self, shard: u32, job_id: &str) -> Result<bool> {
        let keys = self.keys(shard);
        let mut conn = self.conn().await?;
        let replayed: i32 = redis::Script::new(REPLAY_SCRIPT)
            .key(&keys.dead)
            .key(&keys.ready)
            .arg(job_id)
            .arg(now_ms())
            .arg(keys.job(job_id))
            .invoke_async(&mut conn)
            .await?;

        if replayed == 1 {
            info!(queue = %self.name, shard, job_id, "死信作业已重新入队");
        }
        Ok(replayed == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_queue() -> RedisJobQueue {
        let cache = Cache::new(&crate::test_utils::test_redis_config()).unwrap();
        let config = QueueConfig {
            shards: 2,
            lease_secs: 1,
            max_attempts: 2,
            backoff_initial_ms: 1,
            backoff_max_ms: 5,
        };
        RedisJobQueue::new(cache, &format!("test-{}", Uuid::new_v4()), &config)
    }

    #[test]
    fn test_shard_key_layout() {
        let keys = ShardKeys::new("ingestion", 3);
        assert_eq!(keys.ready, "ns:queue:ingestion:3:ready");
        assert_eq!(keys.job("abc"), "ns:queue:ingestion:3:job:abc");
    }

    #[tokio::test]
    #[ignore] // 需要 Redis
    async fn test_claim_is_exclusive_and_ack_removes() {
        let queue = test_queue();
        queue.enqueue(0, json!({"k": 1}), None).await.unwrap();

        let job = queue.claim(0).await.unwrap().unwrap();
        assert_eq!(job.payload["k"], 1);
        assert!(queue.claim(0).await.unwrap().is_none());

        queue.extend(&job).await.unwrap();
        queue.ack(&job).await.unwrap();
        assert!(queue.claim(0).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // 需要 Redis
    async fn test_nack_dead_letters_after_max_attempts() {
        let queue = test_queue();
        queue.enqueue(1, json!({}), None).await.unwrap();

        let job = queue.claim(1).await.unwrap().unwrap();
        assert!(matches!(
            queue.nack(&job, "boom", false).await.unwrap(),
            NackDisposition::Retried { .. }
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let job = queue.claim(1).await.unwrap().unwrap();
        assert_eq!(job.attempt, 1);
        assert_eq!(
            queue.nack(&job, "boom", false).await.unwrap(),
            NackDisposition::DeadLettered
        );
        assert_eq!(queue.dead_letter_count(1).await.unwrap(), 1);

        assert!(queue.replay_dead_letter(1, &job.id).await.unwrap());
        assert_eq!(queue.claim(1).await.unwrap().unwrap().attempt, 0);
    }
}
