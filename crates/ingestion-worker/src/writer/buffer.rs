//! 分析库写入缓冲
//!
//! 每张目标表一个后台任务，行数达到阈值或距上次刷新超过间隔时执行一次批量插入。
//! 提交方通过 oneshot 等待自己那几行所在批次的结果。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ingest_shared::analytics::{AnalyticsRecord, AnalyticsSink};
use ingest_shared::config::ClickHouseConfig;
use ingest_shared::events::EntityType;
use ingest_shared::observability::metrics;
use ingest_shared::retry::{RetryPolicy, retry_transient};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::{PipelineError, Result};

const CHANNEL_CAPACITY: usize = 10_000;

/// 批次失败时回传给每个提交方的原因
type FlushResult = std::result::Result<(), String>;

struct PendingRow {
    row: AnalyticsRecord,
    done: oneshot::Sender<FlushResult>,
}

/// 刷新参数
#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub max_rows: usize,
    pub interval: Duration,
    pub retry: RetryPolicy,
}

impl From<&ClickHouseConfig> for FlushSettings {
    fn from(config: &ClickHouseConfig) -> Self {
        Self {
            max_rows: config.flush_max_rows.max(1),
            interval: config.flush_interval(),
            retry: config.flush_retry_policy(),
        }
    }
}

pub struct AnalyticsBuffer {
    senders: Mutex<HashMap<&'static str, mpsc::Sender<PendingRow>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl AnalyticsBuffer {
    /// 为三张实体表各启动一个刷新任务，必须在 tokio 运行时内调用
    pub fn start(sink: Arc<dyn AnalyticsSink>, settings: FlushSettings) -> Self {
        let mut senders = HashMap::new();
        let mut handles = Vec::new();

        for entity_type in EntityType::ALL {
            let table = entity_type.table();
            let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
            handles.push(tokio::spawn(run_table(
                table,
                sink.clone(),
                rx,
                settings.clone(),
            )));
            senders.insert(table, tx);
        }

        info!(
            max_rows = settings.max_rows,
            interval_ms = settings.interval.as_millis() as u64,
            "分析库写入缓冲已启动"
        );

        Self {
            senders: Mutex::new(senders),
            handles: Mutex::new(handles),
        }
    }

    /// 提交若干行并等待其所在批次写入完成
    ///
    /// 外层错误表示缓冲区已关闭；内层 `Err` 是批次重试耗尽后的失败原因。
    pub async fn submit(&self, table: &str, rows: Vec<AnalyticsRecord>) -> Result<FlushResult> {
        let sender = self
            .senders
            .lock()
            .get(table)
            .cloned()
            .ok_or_else(|| PipelineError::BufferClosed {
                table: table.to_string(),
            })?;

        let mut waiters = Vec::with_capacity(rows.len());
        for row in rows {
            let (done, waiter) = oneshot::channel();
            sender
                .send(PendingRow { row, done })
                .await
                .map_err(|_| PipelineError::BufferClosed {
                    table: table.to_string(),
                })?;
            waiters.push(waiter);
        }

        for waiter in waiters {
            let outcome = waiter.await.map_err(|_| PipelineError::BufferClosed {
                table: table.to_string(),
            })?;
            if outcome.is_err() {
                return Ok(outcome);
            }
        }
        Ok(Ok(()))
    }

    /// 关闭所有通道，等待剩余数据刷出
    pub async fn shutdown(&self) {
        self.senders.lock().clear();
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "分析库刷新任务异常退出");
            }
        }
        info!("分析库写入缓冲已关闭");
    }
}

async fn run_table(
    table: &'static str,
    sink: Arc<dyn AnalyticsSink>,
    mut rx: mpsc::Receiver<PendingRow>,
    settings: FlushSettings,
) {
    let mut pending: Vec<PendingRow> = Vec::new();
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = rx.recv() => match message {
                Some(row) => {
                    pending.push(row);
                    if pending.len() >= settings.max_rows {
                        flush(table, sink.as_ref(), &mut pending, &settings.retry).await;
                    }
                }
                None => {
                    flush(table, sink.as_ref(), &mut pending, &settings.retry).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                flush(table, sink.as_ref(), &mut pending, &settings.retry).await;
            }
        }
    }

    debug!(table, "分析库刷新任务退出");
}

async fn flush(
    table: &str,
    sink: &dyn AnalyticsSink,
    pending: &mut Vec<PendingRow>,
    retry: &RetryPolicy,
) {
    if pending.is_empty() {
        return;
    }

    let batch = std::mem::take(pending);
    let rows: Vec<AnalyticsRecord> = batch.iter().map(|p| p.row.clone()).collect();

    let outcome = retry_transient(retry, "analytics_flush", || sink.insert_batch(table, &rows))
        .await
        .map_err(|e| e.to_string());

    metrics::record_analytics_flush(table, outcome.is_ok(), rows.len());
    match &outcome {
        Ok(()) => debug!(table, rows = rows.len(), "分析库批次已刷新"),
        Err(reason) => error!(table, rows = rows.len(), error = %reason, "分析库批次刷新失败"),
    }

    for row in batch {
        // 提交方可能已经放弃等待
        let _ = row.done.send(outcome.clone());
    }
}
