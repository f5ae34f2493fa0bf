//! 评估触发
//!
//! 收到实体变更信号后，逐条匹配租户的启用配置：
//! 过滤条件命中且采样通过的配置，立即创建执行记录，或按配置延迟后创建。

use std::sync::Arc;
use std::time::Duration;

use filter_engine::{FilterCompiler, FilterExecutor};
use ingest_shared::events::{EntityChangedEvent, EntityType};
use ingest_shared::queue::{JobQueue, enqueue_for_tenant};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::models::{
    EvalJobExecution, EvalJobPayload, EvalTarget, ExecutionStatus, ExecutionUpdate,
    JobConfiguration, entity_view,
};
use crate::repository::{CreateOutcome, ExecutionRepository, JobConfigurationRepository};

/// 单个信号的触发统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub matched: usize,
    /// 新建的执行记录
    pub created: usize,
    /// 已安排延迟创建
    pub delayed: usize,
    /// 已存在未失败的执行记录而跳过
    pub existing: usize,
    pub sampled_out: usize,
}

/// 按 (config, entity) 确定性采样，同一实体的重复信号结论一致
pub fn sampled(config_id: &str, entity_id: &str, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 || rate.is_nan() {
        return false;
    }

    let mut hasher = Sha256::new();
    hasher.update(config_id.as_bytes());
    hasher.update(b":");
    hasher.update(entity_id.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(head) as f64 / u64::MAX as f64) < rate
}

pub struct EvalTrigger {
    configs: Arc<dyn JobConfigurationRepository>,
    executions: Arc<dyn ExecutionRepository>,
    queue: Arc<dyn JobQueue>,
    compiler: FilterCompiler,
    filter: FilterExecutor,
}

impl EvalTrigger {
    pub fn new(
        configs: Arc<dyn JobConfigurationRepository>,
        executions: Arc<dyn ExecutionRepository>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            configs,
            executions,
            queue,
            compiler: FilterCompiler::new(),
            filter: FilterExecutor::new(),
        }
    }

    #[instrument(
        skip(self, event),
        fields(tenant_id = %event.tenant_id, entity_id = %event.entity_id)
    )]
    pub async fn on_entity_changed(&self, event: &EntityChangedEvent) -> Result<TriggerReport> {
        let target = match event.entity_type {
            EntityType::Trace => EvalTarget::Trace,
            EntityType::Observation => EvalTarget::Observation,
            // 评分本身不再触发评估
            EntityType::Score => return Ok(TriggerReport::default()),
        };

        let configs = self.configs.list_active(&event.tenant_id, target).await?;
        let mut report = TriggerReport::default();
        if configs.is_empty() {
            return Ok(report);
        }

        let view = entity_view(event);
        for config in &configs {
            if !self.filter_matches(config, &view) {
                continue;
            }
            report.matched += 1;

            if !sampled(&config.id, &event.entity_id, config.sampling) {
                debug!(config_id = %config.id, "未被采样");
                report.sampled_out += 1;
                continue;
            }

            if config.delay_secs > 0 {
                self.schedule_creation(config, event).await?;
                report.delayed += 1;
                continue;
            }

            match self.create_execution(config, event).await? {
                CreateOutcome::Created(_) => report.created += 1,
                CreateOutcome::Existing(_) => report.existing += 1,
            }
        }

        if report.matched > 0 {
            info!(
                matched = report.matched,
                created = report.created,
                delayed = report.delayed,
                existing = report.existing,
                "评估规则匹配完成"
            );
        }
        Ok(report)
    }

    /// 配置中的过滤条件无法编译时只跳过该配置
    fn filter_matches(&self, config: &JobConfiguration, view: &filter_engine::EntityView) -> bool {
        let Some(node) = &config.filter else {
            return true;
        };
        match self.compiler.compile(node.clone()) {
            Ok(compiled) => self.filter.matches(&compiled, view),
            Err(e) => {
                warn!(config_id = %config.id, error = %e, "评估配置的过滤条件无效，已跳过");
                false
            }
        }
    }

    async fn schedule_creation(
        &self,
        config: &JobConfiguration,
        event: &EntityChangedEvent,
    ) -> Result<()> {
        let payload = EvalJobPayload::Create {
            config_id: config.id.clone(),
            event: event.clone(),
        };
        let job = enqueue_for_tenant(
            self.queue.as_ref(),
            &event.tenant_id,
            serde_json::to_value(&payload)?,
            Some(Duration::from_secs(config.delay_secs)),
        )
        .await?;

        debug!(
            config_id = %config.id,
            job_id = %job.job_id,
            delay_secs = config.delay_secs,
            "已安排延迟评估"
        );
        Ok(())
    }

    /// 幂等创建执行记录并入队执行作业
    ///
    /// 记录已存在但仍停在 MATCHED（入队前崩溃）时补发执行作业。
    pub async fn create_execution(
        &self,
        config: &JobConfiguration,
        event: &EntityChangedEvent,
    ) -> Result<CreateOutcome> {
        let candidate = EvalJobExecution::matched(config, event);
        let outcome = self.executions.create_if_absent(&candidate).await?;

        let execution = outcome.execution();
        if execution.status == ExecutionStatus::Matched {
            self.dispatch(execution).await?;
        } else {
            debug!(
                execution_id = %execution.id,
                status = %execution.status,
                "执行记录已存在，跳过创建"
            );
        }
        Ok(outcome)
    }

    async fn dispatch(&self, execution: &EvalJobExecution) -> Result<()> {
        let payload = EvalJobPayload::Execute {
            tenant_id: execution.tenant_id.clone(),
            execution_id: execution.id.clone(),
        };
        enqueue_for_tenant(
            self.queue.as_ref(),
            &execution.tenant_id,
            serde_json::to_value(&payload)?,
            None,
        )
        .await?;

        // 并发补发时只有一方能转换成功；多出的作业在执行时遇到他人持有的 RUNNING 会跳过
        self.executions
            .transition(
                &execution.tenant_id,
                &execution.id,
                ExecutionStatus::Matched,
                execution.attempt,
                ExecutionStatus::ExecutionCreated,
                ExecutionUpdate::default(),
            )
            .await?;

        ingest_shared::observability::metrics::record_eval_execution(
            ExecutionStatus::ExecutionCreated.as_str(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfigStatus;
    use crate::repository::InMemoryEvalStore;
    use filter_engine::{FieldRef, FilterNode, Operator};
    use ingest_shared::queue::InMemoryJobQueue;
    use ingest_shared::test_utils::{fast_queue_config, ts};
    use serde_json::{Value, json};

    fn config(id: &str, filter: Option<FilterNode>) -> JobConfiguration {
        JobConfiguration {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            target: EvalTarget::Trace,
            filter,
            template_id: "tpl-1".to_string(),
            variable_mapping: vec![],
            sampling: 1.0,
            delay_secs: 0,
            score_name: "helpfulness".to_string(),
            status: ConfigStatus::Active,
        }
    }

    fn name_is(name: &str) -> Option<FilterNode> {
        Some(FilterNode::condition(FieldRef::Name, Operator::Equals, json!(name)))
    }

    fn event(entity_id: &str, name: &str) -> EntityChangedEvent {
        EntityChangedEvent {
            tenant_id: "t1".to_string(),
            entity_type: EntityType::Trace,
            entity_id: entity_id.to_string(),
            trace_id: Some(entity_id.to_string()),
            name: Some(name.to_string()),
            tags: vec!["prod".to_string()],
            metadata: Value::Null,
            environment: None,
            user_id: None,
            session_id: None,
            release: None,
            version: None,
            level: None,
            max_seq: 3,
            changed_at: ts(0),
        }
    }

    fn setup() -> (Arc<InMemoryEvalStore>, Arc<InMemoryJobQueue>, EvalTrigger) {
        let store = Arc::new(InMemoryEvalStore::new());
        let queue = Arc::new(InMemoryJobQueue::new("evaluation", &fast_queue_config()));
        let trigger = EvalTrigger::new(store.clone(), store.clone(), queue.clone());
        (store, queue, trigger)
    }

    #[tokio::test]
    async fn test_matching_config_creates_one_execution() {
        let (store, queue, trigger) = setup();
        store.add_config(config("cfg-1", name_is("chat-completion")));
        store.add_config(config("cfg-2", name_is("summarize")));

        let report = trigger
            .on_entity_changed(&event("tr-1", "chat-completion"))
            .await
            .unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(report.created, 1);
        let executions = store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].config_id, "cfg-1");
        assert_eq!(executions[0].status, ExecutionStatus::ExecutionCreated);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_signal_is_idempotent() {
        let (store, queue, trigger) = setup();
        store.add_config(config("cfg-1", None));

        trigger.on_entity_changed(&event("tr-1", "x")).await.unwrap();
        let report = trigger.on_entity_changed(&event("tr-1", "x")).await.unwrap();

        assert_eq!(report.existing, 1);
        assert_eq!(store.executions_for("cfg-1", "tr-1").len(), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_delayed_config_schedules_creation() {
        let (store, queue, trigger) = setup();
        let mut delayed = config("cfg-1", None);
        delayed.delay_secs = 30;
        store.add_config(delayed);

        let report = trigger.on_entity_changed(&event("tr-1", "x")).await.unwrap();

        assert_eq!(report.delayed, 1);
        assert!(store.executions().is_empty());
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_filter_skips_only_that_config() {
        let (store, _queue, trigger) = setup();
        store.add_config(config(
            "bad",
            Some(FilterNode::condition(FieldRef::Name, Operator::Regex, json!("(unclosed"))),
        ));
        store.add_config(config("good", None));

        let report = trigger.on_entity_changed(&event("tr-1", "x")).await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(store.executions()[0].config_id, "good");
    }

    #[tokio::test]
    async fn test_score_entities_never_trigger() {
        let (store, _queue, trigger) = setup();
        store.add_config(config("cfg-1", None));

        let mut score = event("sc-1", "x");
        score.entity_type = EntityType::Score;
        assert_eq!(
            trigger.on_entity_changed(&score).await.unwrap(),
            TriggerReport::default()
        );
    }

    #[test]
    fn test_sampling_is_deterministic() {
        assert!(sampled("cfg", "e1", 1.0));
        assert!(!sampled("cfg", "e1", 0.0));

        let first = sampled("cfg", "e1", 0.5);
        assert!((0..10).all(|_| sampled("cfg", "e1", 0.5) == first));

        let hits = (0..1000)
            .filter(|i| sampled("cfg", &format!("entity-{i}"), 0.3))
            .count();
        assert!((200..400).contains(&hits), "hits={hits}");
    }
}
