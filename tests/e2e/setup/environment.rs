//! 进程内测试环境

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use eval_worker::consumer::handle_message;
use eval_worker::executor::fast_settings;
use eval_worker::models::{ConfigStatus, EvalTarget, EvalTemplate, OutputSchema, VariableMapping};
use eval_worker::repository::InMemoryEvalStore;
use eval_worker::{EvalExecutor, EvalTrigger, JobConfiguration};
use filter_engine::{FieldRef, FilterNode, Operator};
use ingest_shared::analytics::InMemoryAnalytics;
use ingest_shared::config::WorkerConfig;
use ingest_shared::dedup::InMemoryDedupStore;
use ingest_shared::dlq::DlqProducer;
use ingest_shared::kafka::{ConsumerMessage, InMemoryPublisher, topics};
use ingest_shared::queue::{InMemoryJobQueue, JobQueue, QueueJob, queues};
use ingest_shared::retry::RetryPolicy;
use ingest_shared::test_utils::fast_queue_config;
use ingest_shared::worker::{JobOutcome, WorkerPool};
use ingestion_worker::enrichment::{Enricher, InMemoryReferenceData};
use ingestion_worker::staging::{InMemoryObjectStore, StagingStore};
use ingestion_worker::writer::{AnalyticsBuffer, DualStoreWriter, FlushSettings, InMemoryMetadataStore};
use ingestion_worker::{InMemorySequenceAllocator, IngestionPipeline, IntakeService};
use serde_json::json;

use super::FixedProvider;

pub const TENANT: &str = "tenant-e2e";

/// 评估模型的默认应答
const DEFAULT_REPLY: &str = r#"{"score": 0.8, "reasoning": "Answer addresses the question"}"#;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        multiplier: 1.0,
    }
}

pub struct TestEnvironment {
    pub intake: IntakeService,
    pub pipeline: Arc<IngestionPipeline>,
    pub ingestion_queue: Arc<InMemoryJobQueue>,
    pub objects: Arc<InMemoryObjectStore>,
    pub metadata: Arc<InMemoryMetadataStore>,
    pub analytics: Arc<InMemoryAnalytics>,
    pub publisher: Arc<InMemoryPublisher>,
    pub eval_store: Arc<InMemoryEvalStore>,
    pub eval_queue: Arc<InMemoryJobQueue>,
    pub provider: Arc<FixedProvider>,
    trigger: Arc<EvalTrigger>,
    ingestion_workers: WorkerPool,
    eval_workers: WorkerPool,
    /// 已转发给评估触发器的变更信号条数
    forwarded: AtomicUsize,
}

impl TestEnvironment {
    pub fn setup() -> Self {
        Self::with_reply(DEFAULT_REPLY)
    }

    pub fn with_reply(reply: &str) -> Self {
        let worker_config = WorkerConfig {
            job_timeout_secs: 5,
            ..WorkerConfig::default()
        };

        // 摄取侧
        let ingestion_queue =
            Arc::new(InMemoryJobQueue::new(queues::INGESTION, &fast_queue_config()));
        let objects = Arc::new(InMemoryObjectStore::new());
        let staging = StagingStore::new(objects.clone(), fast_retry());
        let metadata = Arc::new(InMemoryMetadataStore::new());
        let analytics = Arc::new(InMemoryAnalytics::new());
        let publisher = Arc::new(InMemoryPublisher::new());

        let buffer = Arc::new(AnalyticsBuffer::start(
            analytics.clone(),
            FlushSettings {
                max_rows: 50,
                interval: Duration::from_millis(5),
                retry: fast_retry(),
            },
        ));
        let writer = DualStoreWriter::new(metadata.clone(), buffer).with_retry(fast_retry());
        let pipeline = Arc::new(
            IngestionPipeline::new(
                staging.clone(),
                Arc::new(InMemoryDedupStore::default()),
                Enricher::new(Arc::new(InMemoryReferenceData::new())),
                writer,
                publisher.clone(),
            )
            .with_publish_retry(fast_retry()),
        );
        let ingestion_workers =
            WorkerPool::new(ingestion_queue.clone(), pipeline.clone(), worker_config.clone())
                .with_dlq(DlqProducer::new(publisher.clone(), "ingestion-worker"));

        // 评估侧
        let eval_store = Arc::new(InMemoryEvalStore::new());
        seed_evaluation(&eval_store);
        let eval_queue = Arc::new(InMemoryJobQueue::new(queues::EVALUATION, &fast_queue_config()));
        let provider = Arc::new(FixedProvider::new(reply));
        let trigger = Arc::new(EvalTrigger::new(
            eval_store.clone(),
            eval_store.clone(),
            eval_queue.clone(),
        ));
        let executor = EvalExecutor::new(
            eval_store.clone(),
            eval_store.clone(),
            eval_store.clone(),
            trigger.clone(),
            analytics.clone(),
            analytics.clone(),
            provider.clone(),
            fast_settings("gpt-4o-mini"),
        )
        .expect("评估执行器初始化失败");
        let eval_workers = WorkerPool::new(eval_queue.clone(), Arc::new(executor), worker_config)
            .with_dlq(DlqProducer::new(publisher.clone(), "eval-worker"));

        Self {
            intake: IntakeService::new(
                staging,
                ingestion_queue.clone(),
                Arc::new(InMemorySequenceAllocator::new()),
            ),
            pipeline,
            ingestion_queue,
            objects,
            metadata,
            analytics,
            publisher,
            eval_store,
            eval_queue,
            provider,
            trigger,
            ingestion_workers,
            eval_workers,
            forwarded: AtomicUsize::new(0),
        }
    }

    /// 领取一个摄取作业但不交给工作池，用于手工重放
    pub async fn claim_ingestion_job(&self) -> QueueJob {
        self.ingestion_queue
            .claim(0)
            .await
            .unwrap()
            .expect("摄取队列中没有作业")
    }

    /// 处理摄取队列直到为空
    pub async fn drain_ingestion(&self) -> Vec<JobOutcome> {
        drain(&self.ingestion_workers, &self.ingestion_queue).await
    }

    /// 把尚未转发的变更信号交给评估触发器
    pub async fn forward_signals(&self) -> usize {
        let messages = self.publisher.messages(topics::ENTITY_CHANGED);
        let start = self.forwarded.swap(messages.len(), Ordering::SeqCst);

        for (offset, message) in messages.iter().enumerate().skip(start) {
            let msg = ConsumerMessage {
                topic: message.topic.clone(),
                partition: 0,
                offset: offset as i64,
                key: Some(message.key.clone()),
                payload: message.payload.clone(),
                timestamp: None,
                headers: HashMap::new(),
            };
            handle_message(&self.trigger, &RetryPolicy::none(), &msg)
                .await
                .unwrap();
        }
        messages.len().saturating_sub(start)
    }

    /// 从头重新转发全部信号
    pub fn reset_signal_cursor(&self) {
        self.forwarded.store(0, Ordering::SeqCst);
    }

    /// 处理评估队列直到为空
    pub async fn drain_evaluation(&self) -> Vec<JobOutcome> {
        drain(&self.eval_workers, &self.eval_queue).await
    }

    /// 摄取 → 信号转发 → 评估，一次跑完
    pub async fn run_to_completion(&self) {
        self.drain_ingestion().await;
        self.forward_signals().await;
        self.drain_evaluation().await;
    }
}

async fn drain(workers: &WorkerPool, queue: &InMemoryJobQueue) -> Vec<JobOutcome> {
    let mut outcomes = Vec::new();
    for _ in 0..50 {
        match workers.process_one(0).await.unwrap() {
            Some(outcome) => outcomes.push(outcome),
            None if queue.pending_count() == 0 => break,
            None => tokio::time::sleep(Duration::from_millis(5)).await,
        }
    }
    outcomes
}

/// 对名为 chat-completion 的 trace 评估回答质量
fn seed_evaluation(store: &InMemoryEvalStore) {
    store.add_config(JobConfiguration {
        id: "cfg-quality".to_string(),
        tenant_id: TENANT.to_string(),
        target: EvalTarget::Trace,
        filter: Some(FilterNode::condition(
            FieldRef::Name,
            Operator::Equals,
            json!("chat-completion"),
        )),
        template_id: "tpl-quality".to_string(),
        variable_mapping: vec![
            VariableMapping {
                variable: "question".to_string(),
                path: "input".to_string(),
            },
            VariableMapping {
                variable: "answer".to_string(),
                path: "output".to_string(),
            },
        ],
        sampling: 1.0,
        delay_secs: 0,
        score_name: "answer-quality".to_string(),
        status: ConfigStatus::Active,
    });
    store.add_template(EvalTemplate {
        id: "tpl-quality".to_string(),
        tenant_id: TENANT.to_string(),
        name: "answer-quality".to_string(),
        prompt: "Question: {{question}}\nAnswer: {{answer}}\nRate the answer.".to_string(),
        model: None,
        model_params: json!({}),
        output_schema: OutputSchema::default(),
    });
}
