//! 进程内分片队列，语义与 Redis 实现一致，供测试与单机运行使用

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use super::{JobQueue, JobRef, NackDisposition, QueueJob, ReapReport};
use crate::config::QueueConfig;
use crate::error::{IngestError, Result};
use crate::retry::RetryPolicy;

#[derive(Default)]
struct ShardState {
    /// (可领取时间, 入队序号, 作业 ID)
    ready: BTreeSet<(Instant, u64, String)>,
    leased: HashMap<String, Instant>,
    jobs: HashMap<String, QueueJob>,
    dead: Vec<String>,
    next_seq: u64,
}

impl ShardState {
    fn push_ready(&mut self, at: Instant, id: String) {
        self.next_seq += 1;
        self.ready.insert((at, self.next_seq, id));
    }

    fn holds_lease(&self, job: &QueueJob) -> bool {
        self.leased.contains_key(&job.id)
            && job.lock_token.is_some()
            && self.jobs.get(&job.id).and_then(|j| j.lock_token.as_ref()) == job.lock_token.as_ref()
    }
}

/// 进程内分片作业队列
pub struct InMemoryJobQueue {
    name: String,
    lease: Duration,
    max_attempts: u32,
    backoff: RetryPolicy,
    shards: Vec<Mutex<ShardState>>,
}

impl InMemoryJobQueue {
    pub fn new(name: &str, config: &QueueConfig) -> Self {
        let shards = config.shards.max(1);
        Self {
            name: name.to_string(),
            lease: config.lease(),
            max_attempts: config.max_attempts.max(1),
            backoff: config.backoff_policy(),
            shards: (0..shards).map(|_| Mutex::new(ShardState::default())).collect(),
        }
    }

    fn shard(&self, shard: u32) -> &Mutex<ShardState> {
        &self.shards[(shard as usize) % self.shards.len()]
    }

    /// 所有分片上待领取与租约中的作业总数
    pub fn pending_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                let s = s.lock();
                s.ready.len() + s.leased.len()
            })
            .sum()
    }

    fn lease_lost(job: &QueueJob) -> IngestError {
        IngestError::LeaseLost {
            job_id: job.id.clone(),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    fn lease_duration(&self) -> Duration {
        self.lease
    }

    async fn enqueue(
        &self,
        shard: u32,
        payload: Value,
        delay: Option<Duration>,
    ) -> Result<JobRef> {
        let shard = shard % self.shard_count();
        let id = Uuid::new_v4().to_string();
        let job = QueueJob {
            id: id.clone(),
            queue: self.name.clone(),
            shard,
            payload,
            attempt: 0,
            enqueued_at: Utc::now(),
            lock_token: None,
            last_error: None,
        };

        let mut state = self.shard(shard).lock();
        state.jobs.insert(id.clone(), job);
        state.push_ready(Instant::now() + delay.unwrap_or_default(), id.clone());

        Ok(JobRef {
            job_id: id,
            queue: self.name.clone(),
            shard,
        })
    }

    async fn claim(&self, shard: u32) -> Result<Option<QueueJob>> {
        let now = Instant::now();
        let mut state = self.shard(shard).lock();

        let Some(first) = state.ready.first().cloned() else {
            return Ok(None);
        };
        if first.0 > now {
            return Ok(None);
        }
        state.ready.remove(&first);
        let id = first.2;

        state.leased.insert(id.clone(), now + self.lease);
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.lock_token = Some(Uuid::new_v4().to_string());
        Ok(Some(job.clone()))
    }

    async fn extend(&self, job: &QueueJob) -> Result<()> {
        let mut state = self.shard(job.shard).lock();
        if !state.holds_lease(job) {
            return Err(Self::lease_lost(job));
        }
        state
            .leased
            .insert(job.id.clone(), Instant::now() + self.lease);
        Ok(())
    }

    async fn ack(&self, job: &QueueJob) -> Result<()> {
        let mut state = self.shard(job.shard).lock();
        if !state.holds_lease(job) {
            return Err(Self::lease_lost(job));
        }
        state.leased.remove(&job.id);
        state.jobs.remove(&job.id);
        Ok(())
    }

    async fn nack(
        &self,
        job: &QueueJob,
        reason: &str,
        permanent: bool,
    ) -> Result<NackDisposition> {
        let dead = permanent || job.attempt + 1 >= self.max_attempts;
        let delay = self.backoff.jittered_delay_for_attempt(job.attempt);

        let mut state = self.shard(job.shard).lock();
        if !state.holds_lease(job) {
            return Err(Self::lease_lost(job));
        }
        state.leased.remove(&job.id);
        if let Some(stored) = state.jobs.get_mut(&job.id) {
            stored.attempt += 1;
            stored.last_error = Some(reason.to_string());
            stored.lock_token = None;
        }

        if dead {
            state.dead.push(job.id.clone());
            Ok(NackDisposition::DeadLettered)
        } else {
            state.push_ready(Instant::now() + delay, job.id.clone());
            Ok(NackDisposition::Retried { delay })
        }
    }

    async fn reap_stalled(&self, shard: u32) -> Result<ReapReport> {
        let now = Instant::now();
        let mut state = self.shard(shard).lock();

        let expired: Vec<String> = state
            .leased
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut report = ReapReport::default();
        for id in expired {
            state.leased.remove(&id);
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.attempt += 1;
            job.last_error = Some("lease expired".to_string());
            job.lock_token = None;

            if job.attempt >= self.max_attempts {
                let snapshot = job.clone();
                state.dead.push(id);
                report.dead_lettered.push(snapshot);
            } else {
                state.push_ready(now, id);
                report.requeued += 1;
            }
        }
        Ok(report)
    }

    async fn dead_letters(&self, shard: u32, limit: usize) -> Result<Vec<QueueJob>> {
        let state = self.shard(shard).lock();
        Ok(state
            .dead
            .iter()
            .take(limit)
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn dead_letter_count(&self, shard: u32) -> Result<u64> {
        Ok(self.shard(shard).lock().dead.len() as u64)
    }

    async fn replay_dead_letter(&self, shard: u32, job_id: &str) -> Result<bool> {
        let mut state = self.shard(shard).lock();
        let Some(pos) = state.dead.iter().position(|id| id == job_id) else {
            return Ok(false);
        };
        state.dead.remove(pos);
        if let Some(job) = state.jobs.get_mut(job_id) {
            job.attempt = 0;
            job.last_error = None;
        }
        state.push_ready(Instant::now(), job_id.to_string());
        Ok(true)
    }
}
