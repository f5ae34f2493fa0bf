//! 分片工作池
//!
//! 每个拥有的分片运行 `concurrency_per_shard` 个消费循环和一个租约回收循环。
//! 作业在超时限制内执行，执行期间每隔租约的三分之一续约一次；
//! 续约发现租约已丢失时立即丢弃进行中的处理，作业交由重投路径处理。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::config::WorkerConfig;
use crate::dlq::DlqProducer;
use crate::error::{IngestError, Result};
use crate::observability::metrics;
use crate::queue::{JobQueue, NackDisposition, QueueJob};

/// 作业处理器
///
/// 返回 `Ok` 即确认；可重试错误退避重投；不可重试错误直接进入死信。
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &QueueJob) -> Result<()>;
}

/// 单个作业的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Acked,
    Retried,
    DeadLettered,
    /// 租约已被回收，结果交由重投决定
    LeaseLost,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Retried => "retried",
            Self::DeadLettered => "dead_lettered",
            Self::LeaseLost => "lease_lost",
        }
    }
}

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    handler: Arc<dyn JobHandler>,
    dlq: Option<DlqProducer>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: Arc<dyn JobQueue>, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        Self {
            queue,
            handler,
            dlq: None,
            config,
        }
    }

    pub fn with_dlq(mut self, dlq: DlqProducer) -> Self {
        self.dlq = Some(dlq);
        self
    }

    fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.config.job_timeout_secs.max(1))
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.queue.lease_duration() / 3).max(Duration::from_millis(50))
    }

    /// 领取并处理分片上的一个作业，分片为空时返回 None
    pub async fn process_one(&self, shard: u32) -> Result<Option<JobOutcome>> {
        let Some(job) = self.queue.claim(shard).await? else {
            return Ok(None);
        };

        let span = info_span!(
            "job",
            queue = %job.queue,
            shard,
            job_id = %job.id,
            attempt = job.attempt
        );
        let started = Instant::now();
        let result = self.run_with_lease(&job).instrument(span.clone()).await;
        let outcome = self.settle(&job, result).instrument(span).await?;

        metrics::record_job(self.queue.name(), outcome.as_str(), started.elapsed());
        Ok(Some(outcome))
    }

    /// 执行处理器，并行续约
    async fn run_with_lease(&self, job: &QueueJob) -> Result<()> {
        let work = tokio::time::timeout(self.job_timeout(), self.handler.handle(job));
        tokio::pin!(work);

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval());
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut work => {
                    return match result {
                        Ok(inner) => inner,
                        Err(_) => Err(IngestError::Timeout {
                            operation: format!("job {}", job.id),
                        }),
                    };
                }
                _ = heartbeat.tick() => {
                    match self.queue.extend(job).await {
                        Ok(()) => debug!("租约已续期"),
                        Err(e @ IngestError::LeaseLost { .. }) => {
                            warn!("租约已丢失，放弃进行中的处理");
                            return Err(e);
                        }
                        Err(e) => warn!(error = %e, "续约失败，下个周期重试"),
                    }
                }
            }
        }
    }

    async fn settle(&self, job: &QueueJob, result: Result<()>) -> Result<JobOutcome> {
        let err = match result {
            Ok(()) => {
                return match self.queue.ack(job).await {
                    Ok(()) => {
                        debug!("作业已确认");
                        Ok(JobOutcome::Acked)
                    }
                    Err(IngestError::LeaseLost { .. }) => Ok(JobOutcome::LeaseLost),
                    Err(e) => Err(e),
                };
            }
            Err(IngestError::LeaseLost { .. }) => return Ok(JobOutcome::LeaseLost),
            Err(e) => e,
        };

        let permanent = !err.is_retryable();
        let reason = err.to_string();
        let disposition = match self.queue.nack(job, &reason, permanent).await {
            Ok(d) => d,
            Err(IngestError::LeaseLost { .. }) => return Ok(JobOutcome::LeaseLost),
            Err(e) => return Err(e),
        };

        match disposition {
            NackDisposition::Retried { delay } => {
                warn!(
                    error = %reason,
                    code = err.code(),
                    retry_in_ms = delay.as_millis() as u64,
                    "作业失败，退避后重投"
                );
                Ok(JobOutcome::Retried)
            }
            NackDisposition::DeadLettered => {
                error!(error = %reason, code = err.code(), permanent, "作业进入死信");
                metrics::record_dead_letter(self.queue.name());
                if let Some(dlq) = &self.dlq {
                    dlq.report(job, &reason, permanent).await;
                }
                Ok(JobOutcome::DeadLettered)
            }
        }
    }

    /// 回收一次分片上的过期租约
    pub async fn reap_once(&self, shard: u32) -> Result<()> {
        let report = self.queue.reap_stalled(shard).await?;
        if report.requeued > 0 {
            metrics::record_stalled_requeued(self.queue.name(), report.requeued);
        }
        for job in &report.dead_lettered {
            metrics::record_dead_letter(self.queue.name());
            if let Some(dlq) = &self.dlq {
                let reason = job.last_error.as_deref().unwrap_or("lease expired");
                dlq.report(job, reason, false).await;
            }
        }
        Ok(())
    }

    /// 启动所有消费循环，关闭信号到达后等待进行中的作业完成再返回
    pub async fn run(self: Arc<Self>, shards: Vec<u32>, shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::new();

        for shard in shards {
            for slot in 0..self.config.concurrency_per_shard.max(1) {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                handles.push(tokio::spawn(async move {
                    pool.consume_loop(shard, slot, shutdown).await;
                }));
            }

            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.reap_loop(shard, shutdown).await;
            }));
        }

        info!(
            queue = self.queue.name(),
            tasks = handles.len(),
            "工作池已启动"
        );
        futures::future::join_all(handles).await;
        info!(queue = self.queue.name(), "工作池已停止");
    }

    async fn consume_loop(&self, shard: u32, slot: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(shard, slot, "消费循环已启动");
        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.process_one(shard).await {
                Ok(Some(_)) => continue,
                Ok(None) => self.poll_delay(),
                Err(e) => {
                    error!(shard, error = %e, "领取或结算作业失败");
                    self.poll_delay() * 5
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(idle) => {}
                _ = shutdown.changed() => {}
            }
        }
        debug!(shard, slot, "消费循环已退出");
    }

    async fn reap_loop(&self, shard: u32, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.reap_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once(shard).await {
                        error!(shard, error = %e, "回收过期租约失败");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// 空闲轮询间隔，叠加抖动避免多个消费者同时轮询
    fn poll_delay(&self) -> Duration {
        let base = self.config.poll_interval_ms.max(1);
        let jitter = rand::rng().random_range(0..=base / 4);
        Duration::from_millis(base + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::kafka::{InMemoryPublisher, topics};
    use crate::queue::InMemoryJobQueue;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedHandler {
        calls: AtomicU32,
        result: fn(u32) -> Result<()>,
        delay: Duration,
    }

    #[async_trait]
    impl JobHandler for ScriptedHandler {
        async fn handle(&self, _job: &QueueJob) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            (self.result)(n)
        }
    }

    fn handler(result: fn(u32) -> Result<()>) -> Arc<ScriptedHandler> {
        Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            result,
            delay: Duration::ZERO,
        })
    }

    fn queue(max_attempts: u32, lease_secs: u64) -> Arc<InMemoryJobQueue> {
        Arc::new(InMemoryJobQueue::new(
            "ingestion",
            &QueueConfig {
                shards: 1,
                lease_secs,
                max_attempts,
                backoff_initial_ms: 1,
                backoff_max_ms: 1,
            },
        ))
    }

    fn worker_config(job_timeout_secs: u64) -> WorkerConfig {
        WorkerConfig {
            job_timeout_secs,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_success_acks() {
        let q = queue(3, 60);
        q.enqueue(0, json!({}), None).await.unwrap();
        let pool = WorkerPool::new(q.clone(), handler(|_| Ok(())), worker_config(5));

        assert_eq!(pool.process_one(0).await.unwrap(), Some(JobOutcome::Acked));
        assert_eq!(pool.process_one(0).await.unwrap(), None);
        assert_eq!(q.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_retryable_error_retries_then_dead_letters_with_report() {
        let q = queue(2, 60);
        q.enqueue(0, json!({"k": "v"}), None).await.unwrap();
        let publisher = Arc::new(InMemoryPublisher::new());
        let pool = WorkerPool::new(
            q.clone(),
            handler(|_| Err(IngestError::transient("clickhouse", "down"))),
            worker_config(5),
        )
        .with_dlq(DlqProducer::new(publisher.clone(), "test"));

        assert_eq!(pool.process_one(0).await.unwrap(), Some(JobOutcome::Retried));
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            pool.process_one(0).await.unwrap(),
            Some(JobOutcome::DeadLettered)
        );
        assert_eq!(q.dead_letter_count(0).await.unwrap(), 1);
        assert_eq!(publisher.messages(topics::DEAD_LETTER_QUEUE).len(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_dead_letters_immediately() {
        let q = queue(5, 60);
        q.enqueue(0, json!({}), None).await.unwrap();
        let pool = WorkerPool::new(
            q.clone(),
            handler(|_| {
                Err(IngestError::StagingMissing {
                    blob_key: "tenant/t1/trace/e1/x.json".to_string(),
                })
            }),
            worker_config(5),
        );

        assert_eq!(
            pool.process_one(0).await.unwrap(),
            Some(JobOutcome::DeadLettered)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retried() {
        let q = queue(3, 60);
        q.enqueue(0, json!({}), None).await.unwrap();
        let slow = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            result: |_| Ok(()),
            delay: Duration::from_secs(10),
        });
        let pool = WorkerPool::new(q.clone(), slow, worker_config(1));

        assert_eq!(pool.process_one(0).await.unwrap(), Some(JobOutcome::Retried));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_long_job_leased() {
        let q = queue(3, 3);
        q.enqueue(0, json!({}), None).await.unwrap();
        let slow = Arc::new(ScriptedHandler {
            calls: AtomicU32::new(0),
            result: |_| Ok(()),
            delay: Duration::from_secs(7),
        });
        let pool = Arc::new(WorkerPool::new(q.clone(), slow, worker_config(30)));

        let runner = pool.clone();
        let task = tokio::spawn(async move { runner.process_one(0).await });

        // 处理进行到一半时回收，租约应已被续期
        tokio::time::sleep(Duration::from_secs(5)).await;
        pool.reap_once(0).await.unwrap();

        assert_eq!(task.await.unwrap().unwrap(), Some(JobOutcome::Acked));
        assert_eq!(q.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let q = queue(3, 60);
        for _ in 0..3 {
            q.enqueue(0, json!({}), None).await.unwrap();
        }
        let h = handler(|_| Ok(()));
        let config = WorkerConfig {
            poll_interval_ms: 5,
            ..worker_config(5)
        };
        let pool = Arc::new(WorkerPool::new(q.clone(), h.clone(), config));
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(pool.run(vec![0], rx));
        for _ in 0..100 {
            if q.pending_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(h.calls.load(Ordering::SeqCst), 3);
        assert_eq!(q.pending_count(), 0);
    }
}
