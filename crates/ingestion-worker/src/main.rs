//! 摄取服务
//!
//! 同一进程内运行 HTTP 受理入口和摄取工作池。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use ingest_shared::{
    analytics::ClickHouseAnalytics,
    cache::Cache,
    config::AppConfig,
    database::Database,
    dedup::RedisDedupStore,
    dlq::DlqProducer,
    kafka::KafkaProducer,
    observability,
    queue::{RedisJobQueue, queues},
    retry::RetryPolicy,
    worker::WorkerPool,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};

use ingestion_worker::{
    IngestionPipeline, IntakeService, RedisSequenceAllocator,
    api::{self, ApiState},
    enrichment::{Enricher, PgReferenceData},
    staging::{S3ObjectStore, StagingStore},
    writer::{AnalyticsBuffer, DualStoreWriter, FlushSettings, PgMetadataStore},
};

const SERVICE_NAME: &str = "ingestion-worker";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const REFERENCE_CACHE_TTL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // 1. 加载配置
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        AppConfig::default()
    });
    config.validate()?;

    // 2. 可观测性
    let _guard = observability::init(&config.service_name, &config.observability).await?;
    info!(environment = %config.environment, "Starting ingestion-worker...");

    // 3. 关系库
    let db = Database::connect(&config.database, SERVICE_NAME).await?;
    db.run_migrations().await?;
    let pool = db.pool().clone();
    info!("Database connection established");

    // 4. Redis：队列、去重、序列号、参考数据缓存
    let cache = Cache::new(&config.redis)?;
    cache.health_check().await?;
    let queue = Arc::new(RedisJobQueue::new(
        cache.clone(),
        queues::INGESTION,
        &config.queue,
    ));
    let dedup = Arc::new(RedisDedupStore::new(cache.clone(), &config.dedup));
    info!("Redis connection established");

    // 5. 暂存存储
    let objects = S3ObjectStore::new(&config.storage).await;
    if let Err(e) = objects.health_check().await {
        warn!(bucket = %config.storage.bucket, error = %e, "暂存存储健康检查失败，继续启动");
    }
    let staging = StagingStore::new(Arc::new(objects), RetryPolicy::default());

    // 6. 分析库与双存储写入
    let clickhouse = ClickHouseAnalytics::new(&config.clickhouse);
    if let Err(e) = clickhouse.health_check().await {
        warn!(error = %e, "分析库健康检查失败，继续启动");
    }
    let buffer = Arc::new(AnalyticsBuffer::start(
        Arc::new(clickhouse),
        FlushSettings::from(&config.clickhouse),
    ));
    let writer = DualStoreWriter::new(Arc::new(PgMetadataStore::new(pool.clone())), buffer.clone());

    // 7. 富化与信号发布
    let reference = PgReferenceData::new(pool.clone()).with_cache(cache.clone(), REFERENCE_CACHE_TTL);
    let enricher = Enricher::new(Arc::new(reference));
    let producer = Arc::new(KafkaProducer::new(&config.kafka)?);

    let pipeline = IngestionPipeline::new(staging.clone(), dedup, enricher, writer, producer.clone());
    let workers = Arc::new(
        WorkerPool::new(queue.clone(), Arc::new(pipeline), config.worker.clone())
            .with_dlq(DlqProducer::new(producer, SERVICE_NAME)),
    );
    info!(shards = ?config.owned_shards(), "Ingestion pipeline initialized");

    // 8. 启动工作池与 HTTP 入口
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(workers.run(config.owned_shards(), shutdown_rx));

    let intake = IntakeService::new(staging, queue, Arc::new(RedisSequenceAllocator::new(cache)));
    let app = api::router(
        ApiState {
            intake: Arc::new(intake),
        },
        REQUEST_TIMEOUT,
    );

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 9. 停止领取新作业，等待进行中的作业与缓冲区刷出
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker_handle.await {
        error!(error = %e, "工作池异常退出");
    }
    buffer.shutdown().await;
    db.close().await;

    info!("Ingestion worker shutdown complete");
    Ok(())
}

/// 监听关闭信号
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
