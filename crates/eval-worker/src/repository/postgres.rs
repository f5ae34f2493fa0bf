//! 基于 PostgreSQL 的评估仓储
//!
//! `job_executions` 上有 `(tenant_id, config_id, entity_id) WHERE status <> 'FAILED'`
//! 部分唯一索引，并发创建由数据库裁决。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_shared::error::IngestError;
use serde_json::Value;
use sqlx::PgPool;
use tracing::{debug, instrument};

use super::{CreateOutcome, ExecutionRepository, JobConfigurationRepository, TemplateRepository};
use crate::error::{EvalError, Result};
use crate::models::{
    ConfigStatus, EvalJobExecution, EvalTarget, EvalTemplate, ExecutionStatus, ExecutionUpdate,
    JobConfiguration,
};

fn corrupt(table: &str, id: &str, reason: impl std::fmt::Display) -> EvalError {
    EvalError::Shared(IngestError::Internal(format!(
        "{table} 记录无法解析: id={id} {reason}"
    )))
}

// ---------------------------------------------------------------------------
// 行映射
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct ConfigRow {
    id: String,
    tenant_id: String,
    target: String,
    filter: Option<Value>,
    template_id: String,
    variable_mapping: Value,
    sampling: f64,
    delay_secs: i64,
    score_name: String,
    status: String,
}

impl TryFrom<ConfigRow> for JobConfiguration {
    type Error = EvalError;

    fn try_from(row: ConfigRow) -> Result<Self> {
        let target: EvalTarget = row
            .target
            .parse()
            .map_err(|e| corrupt("job_configurations", &row.id, e))?;
        let filter = row
            .filter
            .filter(|v| !v.is_null())
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| corrupt("job_configurations", &row.id, e))?;
        let variable_mapping = serde_json::from_value(row.variable_mapping)
            .map_err(|e| corrupt("job_configurations", &row.id, e))?;
        let status = match row.status.as_str() {
            "ACTIVE" => ConfigStatus::Active,
            _ => ConfigStatus::Inactive,
        };

        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            target,
            filter,
            template_id: row.template_id,
            variable_mapping,
            sampling: row.sampling,
            delay_secs: u64::try_from(row.delay_secs).unwrap_or(0),
            score_name: row.score_name,
            status,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TemplateRow {
    id: String,
    tenant_id: String,
    name: String,
    prompt: String,
    model: Option<String>,
    model_params: Value,
    output_schema: Option<Value>,
}

impl TryFrom<TemplateRow> for EvalTemplate {
    type Error = EvalError;

    fn try_from(row: TemplateRow) -> Result<Self> {
        let output_schema = row
            .output_schema
            .filter(|v| !v.is_null())
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| corrupt("eval_templates", &row.id, e))?
            .unwrap_or_default();

        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            prompt: row.prompt,
            model: row.model,
            model_params: row.model_params,
            output_schema,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    tenant_id: String,
    config_id: String,
    entity_type: String,
    entity_id: String,
    trace_id: Option<String>,
    status: String,
    attempt: i32,
    score_id: Option<String>,
    error: Option<String>,
    raw_output: Option<String>,
    runner: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for EvalJobExecution {
    type Error = EvalError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let entity_type = row
            .entity_type
            .parse()
            .map_err(|e| corrupt("job_executions", &row.id, e))?;
        let status = row
            .status
            .parse()
            .map_err(|e| corrupt("job_executions", &row.id, e))?;

        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            config_id: row.config_id,
            entity_type,
            entity_id: row.entity_id,
            trace_id: row.trace_id,
            status,
            attempt: u32::try_from(row.attempt).unwrap_or(0),
            score_id: row.score_id,
            error: row.error,
            raw_output: row.raw_output,
            runner: row.runner,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const EXECUTION_COLUMNS: &str = "id, tenant_id, config_id, entity_type, entity_id, trace_id, \
     status, attempt, score_id, error, raw_output, runner, created_at, updated_at";

// ---------------------------------------------------------------------------
// PgEvalRepository
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgEvalRepository {
    pool: PgPool,
}

impl PgEvalRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_open_execution(
        &self,
        tenant_id: &str,
        config_id: &str,
        entity_id: &str,
    ) -> Result<Option<EvalJobExecution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions \
             WHERE tenant_id = $1 AND config_id = $2 AND entity_id = $3 AND status <> 'FAILED' \
             LIMIT 1"
        );
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(tenant_id)
            .bind(config_id)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(EvalJobExecution::try_from).transpose()
    }
}

#[async_trait]
impl JobConfigurationRepository for PgEvalRepository {
    #[instrument(skip(self))]
    async fn list_active(
        &self,
        tenant_id: &str,
        target: EvalTarget,
    ) -> Result<Vec<JobConfiguration>> {
        let rows = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT id, tenant_id, target, filter, template_id, variable_mapping,
                   sampling, delay_secs, score_name, status
            FROM job_configurations
            WHERE tenant_id = $1 AND target = $2 AND status = 'ACTIVE'
            ORDER BY id
            "#,
        )
        .bind(tenant_id)
        .bind(target.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobConfiguration::try_from).collect()
    }

    async fn get(&self, tenant_id: &str, config_id: &str) -> Result<Option<JobConfiguration>> {
        let row = sqlx::query_as::<_, ConfigRow>(
            r#"
            SELECT id, tenant_id, target, filter, template_id, variable_mapping,
                   sampling, delay_secs, score_name, status
            FROM job_configurations
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobConfiguration::try_from).transpose()
    }
}

#[async_trait]
impl TemplateRepository for PgEvalRepository {
    async fn get(&self, tenant_id: &str, template_id: &str) -> Result<Option<EvalTemplate>> {
        let row = sqlx::query_as::<_, TemplateRow>(
            r#"
            SELECT id, tenant_id, name, prompt, model, model_params, output_schema
            FROM eval_templates
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(EvalTemplate::try_from).transpose()
    }
}

#[async_trait]
impl ExecutionRepository for PgEvalRepository {
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    async fn create_if_absent(&self, execution: &EvalJobExecution) -> Result<CreateOutcome> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO job_executions (
                id, tenant_id, config_id, entity_type, entity_id, trace_id,
                status, attempt, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.tenant_id)
        .bind(&execution.config_id)
        .bind(execution.entity_type.as_str())
        .bind(&execution.entity_id)
        .bind(&execution.trace_id)
        .bind(execution.status.as_str())
        .bind(i32::try_from(execution.attempt).unwrap_or(i32::MAX))
        .bind(execution.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(CreateOutcome::Created(execution.clone()));
        }

        debug!("执行记录已存在");
        self.find_open_execution(
            &execution.tenant_id,
            &execution.config_id,
            &execution.entity_id,
        )
        .await?
        .map(CreateOutcome::Existing)
        // 冲突的记录在插入与查询之间被置为 FAILED，交由重投再次创建
        .ok_or_else(|| {
            EvalError::Shared(IngestError::transient(
                "job_executions",
                format!("执行记录冲突后未找到: {}", execution.entity_id),
            ))
        })
    }

    async fn get(&self, tenant_id: &str, execution_id: &str) -> Result<Option<EvalJobExecution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM job_executions WHERE tenant_id = $1 AND id = $2"
        );
        let row = sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(tenant_id)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(EvalJobExecution::try_from).transpose()
    }

    #[instrument(skip(self, update))]
    async fn transition(
        &self,
        tenant_id: &str,
        execution_id: &str,
        from: ExecutionStatus,
        expected_attempt: u32,
        to: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job_executions SET
                status = $5,
                attempt = COALESCE($6, attempt),
                score_id = COALESCE($7, score_id),
                error = COALESCE($8, error),
                raw_output = COALESCE($9, raw_output),
                runner = COALESCE($10, runner),
                updated_at = NOW()
            WHERE tenant_id = $1 AND id = $2 AND status = $3 AND attempt = $4
            "#,
        )
        .bind(tenant_id)
        .bind(execution_id)
        .bind(from.as_str())
        .bind(i32::try_from(expected_attempt).unwrap_or(i32::MAX))
        .bind(to.as_str())
        .bind(update.attempt.map(|a| i32::try_from(a).unwrap_or(i32::MAX)))
        .bind(update.score_id)
        .bind(update.error)
        .bind(update.raw_output)
        .bind(update.runner)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
