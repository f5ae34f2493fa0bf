//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{error, info};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics 资源守卫
pub struct MetricsHandle {
    _server_handle: tokio::task::JoinHandle<()>,
}

/// 初始化 Prometheus 指标导出，并在 `port` 上暴露 `/metrics` 与 `/health`
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_pipeline_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle {
        _server_handle: server_handle,
    })
}

fn register_pipeline_metrics(service_name: &str) {
    metrics::describe_counter!("ingest_jobs_total", "Queue jobs processed, by outcome");
    metrics::describe_histogram!(
        "ingest_job_duration_seconds",
        "Queue job processing duration in seconds"
    );
    metrics::describe_counter!("ingest_events_merged_total", "Raw events folded by the merge engine");
    metrics::describe_counter!("dedup_hits_total", "Units skipped because they were already processed");
    metrics::describe_counter!(
        "staging_blobs_skipped_total",
        "Unreferenced staged blobs skipped while loading an entity, by reason"
    );
    metrics::describe_counter!("analytics_flush_total", "Analytics buffer flushes, by table and status");
    metrics::describe_histogram!("analytics_flush_rows", "Rows per analytics flush");
    metrics::describe_counter!("queue_dead_letters_total", "Jobs moved to the dead-letter list");
    metrics::describe_counter!(
        "queue_stalled_requeued_total",
        "Jobs requeued after their lease expired"
    );
    metrics::describe_counter!("eval_executions_total", "Evaluation executions reaching a state");
    metrics::describe_histogram!(
        "eval_provider_call_duration_seconds",
        "LLM provider call duration in seconds"
    );
    metrics::describe_counter!(
        "enrichment_validation_gaps_total",
        "Entities persisted with missing reference data"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一个队列作业的处理结果
#[inline]
pub fn record_job(queue: &str, outcome: &str, duration: Duration) {
    metrics::counter!(
        "ingest_jobs_total",
        "queue" => queue.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!("ingest_job_duration_seconds", "queue" => queue.to_string())
        .record(duration.as_secs_f64());
}

#[inline]
pub fn record_events_merged(count: usize) {
    metrics::counter!("ingest_events_merged_total").increment(count as u64);
}

#[inline]
pub fn record_dedup_hit(entity_type: &str) {
    metrics::counter!("dedup_hits_total", "entity_type" => entity_type.to_string()).increment(1);
}

/// 前缀下未被作业引用的暂存对象被跳过
#[inline]
pub fn record_staging_skipped(reason: &str) {
    metrics::counter!("staging_blobs_skipped_total", "reason" => reason.to_string()).increment(1);
}

/// 记录分析库刷新
#[inline]
pub fn record_analytics_flush(table: &str, success: bool, rows: usize) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!(
        "analytics_flush_total",
        "table" => table.to_string(),
        "status" => status
    )
    .increment(1);

    metrics::histogram!("analytics_flush_rows", "table" => table.to_string()).record(rows as f64);
}

#[inline]
pub fn record_dead_letter(queue: &str) {
    metrics::counter!("queue_dead_letters_total", "queue" => queue.to_string()).increment(1);
}

#[inline]
pub fn record_stalled_requeued(queue: &str, count: usize) {
    metrics::counter!("queue_stalled_requeued_total", "queue" => queue.to_string())
        .increment(count as u64);
}

#[inline]
pub fn record_eval_execution(status: &str) {
    metrics::counter!("eval_executions_total", "status" => status.to_string()).increment(1);
}

/// 记录模型调用
#[inline]
pub fn record_provider_call(model: &str, success: bool, duration: Duration) {
    metrics::histogram!(
        "eval_provider_call_duration_seconds",
        "model" => model.to_string(),
        "success" => success.to_string()
    )
    .record(duration.as_secs_f64());
}

#[inline]
pub fn record_validation_gap(kind: &str) {
    metrics::counter!("enrichment_validation_gaps_total", "kind" => kind.to_string())
        .increment(1);
}
