//! 评估执行
//!
//! 评估队列上的作业有两种：延迟到期的创建作业，以及执行作业。
//! 执行作业推动状态机 `EXECUTION_CREATED -> RUNNING -> SCORED | FAILED`：
//! 读取实体、渲染提示词、调用模型、解析评分、写入分析库。
//!
//! 进入 FAILED 的执行会以永久错误返回给工作池，作业进入死信并发布死信报告。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use ingest_shared::analytics::{AnalyticsRecord, AnalyticsSink, EntityReader};
use ingest_shared::config::EvalConfig;
use ingest_shared::error::IngestError;
use ingest_shared::events::{EntityChangedEvent, EntityType};
use ingest_shared::observability::metrics;
use ingest_shared::queue::QueueJob;
use ingest_shared::retry::{RetryPolicy, retry_transient};
use ingest_shared::worker::JobHandler;
use serde_json::Value;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{EvalError, Result};
use crate::models::{
    EvalJobExecution, EvalJobPayload, EvalScore, EvalTemplate, ExecutionStatus, ExecutionUpdate,
    JobConfiguration, SCORE_SOURCE_EVAL,
};
use crate::provider::{LlmProvider, ProviderRequest, ProviderResponse};
use crate::repository::{ExecutionRepository, JobConfigurationRepository, TemplateRepository};
use crate::templates::PromptRenderer;
use crate::trigger::EvalTrigger;

/// 模型输出解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedScore {
    pub value: f64,
    pub reasoning: Option<String>,
}

/// 解析模型输出 `{"score": .., "reasoning": ..}`
///
/// 接受外层 markdown 代码块；score 可以是数字、数字字符串或布尔值。
pub fn parse_output(raw: &str) -> Result<ParsedScore> {
    let malformed = |reason: &str| EvalError::MalformedOutput {
        reason: reason.to_string(),
        raw: raw.to_string(),
    };

    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: Value = serde_json::from_str(body).map_err(|_| malformed("不是合法的 JSON"))?;
    let object = value
        .as_object()
        .ok_or_else(|| malformed("不是 JSON 对象"))?;

    let score = match object.get("score") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(Value::Bool(b)) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
    .filter(|v| v.is_finite())
    .ok_or_else(|| malformed("缺少数值 score 字段"))?;

    let reasoning = object
        .get("reasoning")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ParsedScore {
        value: score,
        reasoning,
    })
}

// ---------------------------------------------------------------------------
// 执行器配置
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub default_model: String,
    /// 单次执行内的模型调用重试
    pub provider_retry: RetryPolicy,
    /// 评分写入分析库的重试
    pub write_retry: RetryPolicy,
    /// 进入 RUNNING 的次数上限，覆盖执行中途崩溃或瞬时故障导致的重投
    pub max_execution_attempts: u32,
    /// 他人持有的 RUNNING 超过该时长未推进才允许接管
    pub running_stale_after: Duration,
}

impl From<&EvalConfig> for ExecutorSettings {
    fn from(config: &EvalConfig) -> Self {
        Self {
            default_model: config.default_model.clone(),
            provider_retry: RetryPolicy {
                max_retries: config.provider_max_attempts.saturating_sub(1),
                ..RetryPolicy::default()
            },
            write_retry: RetryPolicy::default(),
            max_execution_attempts: config.max_execution_attempts.max(1),
            running_stale_after: Duration::from_secs(config.running_stale_secs),
        }
    }
}

/// 单个执行作业的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Scored { score_id: String, value: f64 },
    Failed { reason: String },
    /// 已是终态或被其他消费者处理
    Skipped(ExecutionStatus),
}

// ---------------------------------------------------------------------------
// EvalExecutor
// ---------------------------------------------------------------------------

pub struct EvalExecutor {
    configs: Arc<dyn JobConfigurationRepository>,
    templates: Arc<dyn TemplateRepository>,
    executions: Arc<dyn ExecutionRepository>,
    trigger: Arc<EvalTrigger>,
    entities: Arc<dyn EntityReader>,
    scores: Arc<dyn AnalyticsSink>,
    provider: Arc<dyn LlmProvider>,
    renderer: PromptRenderer,
    settings: ExecutorSettings,
}

impl EvalExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        configs: Arc<dyn JobConfigurationRepository>,
        templates: Arc<dyn TemplateRepository>,
        executions: Arc<dyn ExecutionRepository>,
        trigger: Arc<EvalTrigger>,
        entities: Arc<dyn EntityReader>,
        scores: Arc<dyn AnalyticsSink>,
        provider: Arc<dyn LlmProvider>,
        settings: ExecutorSettings,
    ) -> Result<Self> {
        Ok(Self {
            configs,
            templates,
            executions,
            trigger,
            entities,
            scores,
            provider,
            renderer: PromptRenderer::new()?,
            settings,
        })
    }

    /// 延迟到期后创建执行记录，配置已删除或停用时放弃
    async fn create(&self, config_id: &str, event: &EntityChangedEvent) -> Result<()> {
        let config = self.configs.get(&event.tenant_id, config_id).await?;
        match config {
            Some(config) if config.is_active() => {
                self.trigger.create_execution(&config, event).await?;
            }
            _ => info!(
                config_id,
                entity_id = %event.entity_id,
                "评估配置已停用或删除，放弃延迟评估"
            ),
        }
        Ok(())
    }

    /// 推进一条执行记录，`runner` 为承载本次执行的队列作业 ID
    ///
    /// RUNNING 只能由同一作业的重投接管；其他作业需等到记录超过
    /// `running_stale_after` 未推进，避免同一执行并发调用模型。
    #[instrument(skip(self))]
    pub async fn execute(
        &self,
        tenant_id: &str,
        execution_id: &str,
        runner: &str,
    ) -> Result<ExecutionOutcome> {
        let mut execution = self
            .executions
            .get(tenant_id, execution_id)
            .await?
            .ok_or_else(|| EvalError::ExecutionNotFound(execution_id.to_string()))?;

        if execution.status.is_terminal() {
            debug!(status = %execution.status, "执行已是终态，跳过");
            return Ok(ExecutionOutcome::Skipped(execution.status));
        }

        // 入队后、状态转换前崩溃的记录先补齐 EXECUTION_CREATED
        if execution.status == ExecutionStatus::Matched {
            self.transition(
                &execution,
                ExecutionStatus::ExecutionCreated,
                ExecutionUpdate::default(),
            )
            .await?;
            execution.status = ExecutionStatus::ExecutionCreated;
        }

        if execution.status == ExecutionStatus::Running
            && execution.runner.as_deref() != Some(runner)
            && !self.is_stale(&execution)
        {
            debug!(holder = ?execution.runner, "执行由其他作业持有，跳过");
            return Ok(ExecutionOutcome::Skipped(ExecutionStatus::Running));
        }

        let attempt = execution.attempt + 1;
        if attempt > self.settings.max_execution_attempts {
            return self
                .fail(
                    &execution,
                    format!("执行次数超过上限 {}", self.settings.max_execution_attempts),
                    None,
                )
                .await;
        }

        let running = ExecutionUpdate {
            attempt: Some(attempt),
            runner: Some(runner.to_string()),
            ..Default::default()
        };
        if !self
            .transition(&execution, ExecutionStatus::Running, running)
            .await?
        {
            let current = self
                .executions
                .get(tenant_id, execution_id)
                .await?
                .map(|e| e.status)
                .unwrap_or(execution.status);
            debug!(status = %current, "执行已被其他消费者推进");
            return Ok(ExecutionOutcome::Skipped(current));
        }
        execution.status = ExecutionStatus::Running;
        execution.attempt = attempt;
        execution.runner = Some(runner.to_string());
        metrics::record_eval_execution(ExecutionStatus::Running.as_str());

        self.run(&execution).await
    }

    /// RUNNING 之后的处理；终态错误落 FAILED，可重试错误原样返回交给队列重投
    async fn run(&self, execution: &EvalJobExecution) -> Result<ExecutionOutcome> {
        let Some(config) = self
            .configs
            .get(&execution.tenant_id, &execution.config_id)
            .await?
        else {
            let err = EvalError::ConfigNotFound(execution.config_id.clone());
            return self.fail(execution, err.to_string(), None).await;
        };

        let Some(template) = self
            .templates
            .get(&execution.tenant_id, &config.template_id)
            .await?
        else {
            let err = EvalError::TemplateNotFound(config.template_id.clone());
            return self.fail(execution, err.to_string(), None).await;
        };

        let entity = self
            .entities
            .latest(&execution.tenant_id, execution.entity_type, &execution.entity_id)
            .await?
            .ok_or_else(|| {
                IngestError::transient(
                    "analytics",
                    format!("实体尚不可读: {}", execution.entity_id),
                )
            })?;
        let payload = entity.payload_json()?;

        let prompt = match self
            .renderer
            .render(&template, &config.variable_mapping, &payload)
        {
            Ok(prompt) => prompt,
            Err(e) => return self.fail(execution, e.to_string(), None).await,
        };

        let request = ProviderRequest {
            prompt,
            model: template
                .model
                .clone()
                .unwrap_or_else(|| self.settings.default_model.clone()),
            parameters: template.model_params.clone(),
        };
        let response = match self.call_provider(&request).await {
            Ok(response) => response,
            Err(e) => return self.fail(execution, e.to_string(), None).await,
        };

        let parsed = match parse_output(&response.text) {
            Ok(parsed) => parsed,
            Err(e) => {
                return self
                    .fail(execution, e.to_string(), Some(response.text))
                    .await;
            }
        };

        let score = self.build_score(execution, &config, &template, &parsed);
        self.persist_score(&score).await?;

        let scored = ExecutionUpdate {
            score_id: Some(score.id.clone()),
            ..Default::default()
        };
        if !self
            .transition(execution, ExecutionStatus::Scored, scored)
            .await?
        {
            warn!(
                execution_id = %execution.id,
                attempt = execution.attempt,
                "评分已写入，但执行已被其他作业接管，状态未更新"
            );
        }
        metrics::record_eval_execution(ExecutionStatus::Scored.as_str());

        info!(
            execution_id = %execution.id,
            config_id = %execution.config_id,
            score = parsed.value,
            "评估完成"
        );
        Ok(ExecutionOutcome::Scored {
            score_id: score.id,
            value: parsed.value,
        })
    }

    /// 带退避的模型调用，只重试可重试的错误
    async fn call_provider(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let policy = &self.settings.provider_retry;
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = self.provider.complete(request).await;
            metrics::record_provider_call(&request.model, result.is_ok(), started.elapsed());

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && policy.should_retry(attempt) => {
                    let delay = policy.jittered_delay_for_attempt(attempt);
                    warn!(
                        model = %request.model,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "模型调用失败，退避后重试"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn build_score(
        &self,
        execution: &EvalJobExecution,
        config: &JobConfiguration,
        template: &EvalTemplate,
        parsed: &ParsedScore,
    ) -> EvalScore {
        let observation_id = match execution.entity_type {
            EntityType::Observation => Some(execution.entity_id.clone()),
            _ => None,
        };
        let trace_id = execution.trace_id.clone().or_else(|| match execution.entity_type {
            EntityType::Trace => Some(execution.entity_id.clone()),
            _ => None,
        });

        debug!(template = %template.name, "构造评分");
        EvalScore {
            id: execution.id.clone(),
            tenant_id: execution.tenant_id.clone(),
            trace_id,
            observation_id,
            name: config.score_name.clone(),
            value: parsed.value,
            comment: parsed.reasoning.clone(),
            source: SCORE_SOURCE_EVAL.to_string(),
            config_id: config.id.clone(),
            execution_id: execution.id.clone(),
            timestamp: Utc::now(),
        }
    }

    /// 评分以执行 ID 为行 ID 追加写入，重投产生的重复行在查询时折叠
    async fn persist_score(&self, score: &EvalScore) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let row = AnalyticsRecord {
            tenant_id: score.tenant_id.clone(),
            id: score.id.clone(),
            entity_type: EntityType::Score.as_str().to_string(),
            trace_id: score.trace_id.clone().unwrap_or_default(),
            name: score.name.clone(),
            payload: score.payload().to_string(),
            event_ts: score.timestamp.timestamp_millis(),
            source_seq: 1,
            inserted_at: now,
        };
        let rows = [row];
        let table = EntityType::Score.table();

        let result = retry_transient(&self.settings.write_retry, "eval_score_insert", || {
            self.scores.insert_batch(table, &rows)
        })
        .await;
        metrics::record_analytics_flush(table, result.is_ok(), rows.len());
        result.map_err(EvalError::from)
    }

    async fn transition(
        &self,
        execution: &EvalJobExecution,
        to: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<bool> {
        if !execution.status.can_transition_to(to) {
            return Err(EvalError::InvalidTransition {
                from: execution.status,
                to,
            });
        }
        self.executions
            .transition(
                &execution.tenant_id,
                &execution.id,
                execution.status,
                execution.attempt,
                to,
                update,
            )
            .await
    }

    fn is_stale(&self, execution: &EvalJobExecution) -> bool {
        (Utc::now() - execution.updated_at)
            .to_std()
            .is_ok_and(|age| age >= self.settings.running_stale_after)
    }

    async fn fail(
        &self,
        execution: &EvalJobExecution,
        reason: String,
        raw_output: Option<String>,
    ) -> Result<ExecutionOutcome> {
        let update = ExecutionUpdate {
            error: Some(reason.clone()),
            raw_output,
            ..Default::default()
        };
        self.transition(execution, ExecutionStatus::Failed, update)
            .await?;
        metrics::record_eval_execution(ExecutionStatus::Failed.as_str());

        error!(
            execution_id = %execution.id,
            config_id = %execution.config_id,
            entity_id = %execution.entity_id,
            attempt = execution.attempt,
            reason = %reason,
            "评估执行失败"
        );
        Ok(ExecutionOutcome::Failed { reason })
    }

    async fn process(&self, job: &QueueJob) -> Result<()> {
        match job.decode::<EvalJobPayload>()? {
            EvalJobPayload::Create { config_id, event } => self.create(&config_id, &event).await,
            EvalJobPayload::Execute {
                tenant_id,
                execution_id,
            } => match self.execute(&tenant_id, &execution_id, &job.id).await? {
                // FAILED 以永久错误上报，作业进入死信
                ExecutionOutcome::Failed { reason } => Err(EvalError::Shared(
                    IngestError::PermanentData(format!("评估执行 {execution_id} 失败: {reason}")),
                )),
                ExecutionOutcome::Scored { .. } | ExecutionOutcome::Skipped(_) => Ok(()),
            },
        }
    }
}

#[async_trait]
impl JobHandler for EvalExecutor {
    async fn handle(&self, job: &QueueJob) -> ingest_shared::error::Result<()> {
        self.process(job).await.map_err(IngestError::from)
    }
}

/// 测试与本地联调使用的短退避配置
pub fn fast_settings(default_model: &str) -> ExecutorSettings {
    let quick = RetryPolicy {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        multiplier: 2.0,
    };
    ExecutorSettings {
        default_model: default_model.to_string(),
        provider_retry: quick.clone(),
        write_retry: quick,
        max_execution_attempts: 3,
        running_stale_after: Duration::from_secs(60),
    }
}
