//! 评估服务
//!
//! 同一进程内运行实体变更信号消费者和评估队列工作池。

use std::sync::Arc;

use anyhow::Result;
use ingest_shared::{
    analytics::ClickHouseAnalytics,
    cache::Cache,
    config::AppConfig,
    database::Database,
    dlq::DlqProducer,
    kafka::KafkaProducer,
    observability,
    queue::{RedisJobQueue, queues},
    worker::WorkerPool,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use eval_worker::{
    EntityChangedConsumer, EvalExecutor, EvalTrigger, ExecutorSettings, OpenAiCompatibleProvider,
    repository::PgEvalRepository,
};

const SERVICE_NAME: &str = "eval-worker";

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
    info!(environment = %config.environment, "Starting eval-worker...");

    // 3. 关系库：评估配置、模板、执行记录
    let db = Database::connect(&config.database, SERVICE_NAME).await?;
    db.run_migrations().await?;
    let repository = Arc::new(PgEvalRepository::new(db.pool().clone()));
    info!("Database connection established");

    // 4. 评估队列
    let cache = Cache::new(&config.redis)?;
    cache.health_check().await?;
    let queue = Arc::new(RedisJobQueue::new(cache, queues::EVALUATION, &config.queue));
    info!("Redis connection established");

    // 5. 分析库：读取实体、写入评分
    let clickhouse = Arc::new(ClickHouseAnalytics::new(&config.clickhouse));
    if let Err(e) = clickhouse.health_check().await {
        warn!(error = %e, "分析库健康检查失败，继续启动");
    }

    // 6. 触发器与执行器
    let trigger = Arc::new(EvalTrigger::new(
        repository.clone(),
        repository.clone(),
        queue.clone(),
    ));
    let provider = Arc::new(OpenAiCompatibleProvider::new(&config.eval)?);
    let executor = EvalExecutor::new(
        repository.clone(),
        repository.clone(),
        repository,
        trigger.clone(),
        clickhouse.clone(),
        clickhouse,
        provider,
        ExecutorSettings::from(&config.eval),
    )?;

    let producer = Arc::new(KafkaProducer::new(&config.kafka)?);
    let workers = Arc::new(
        WorkerPool::new(queue, Arc::new(executor), config.worker.clone())
            .with_dlq(DlqProducer::new(producer, SERVICE_NAME)),
    );
    info!(
        shards = ?config.owned_shards(),
        model = %config.eval.default_model,
        "Evaluation executor initialized"
    );

    // 7. 启动工作池与信号消费者
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker_handle = tokio::spawn(workers.run(config.owned_shards(), shutdown_rx.clone()));

    let consumer = EntityChangedConsumer::new(&config.kafka, trigger)?;
    let consumer_handle = tokio::spawn(consumer.run(shutdown_rx));

    shutdown_signal().await;

    // 8. 停止消费与领取，等待进行中的作业完成
    let _ = shutdown_tx.send(true);
    match consumer_handle.await {
        Ok(Err(e)) => error!(error = %e, "实体变更消费者异常退出"),
        Err(e) => error!(error = %e, "实体变更消费者任务异常"),
        Ok(Ok(())) => {}
    }
    if let Err(e) = worker_handle.await {
        error!(error = %e, "工作池异常退出");
    }
    db.close().await;

    info!("Eval worker shutdown complete");
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
