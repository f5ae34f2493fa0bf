//! 评估领域模型
//!
//! 执行状态机：
//!
//! ```text
//! MATCHED -> EXECUTION_CREATED -> RUNNING -> SCORED
//!    |              |               |
//!    +--------------+---------------+----> FAILED
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use filter_engine::{EntityView, FilterNode};
use ingest_shared::events::{EntityChangedEvent, EntityType};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

// ==================== 执行状态 ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// 规则已命中，执行作业尚未入队
    Matched,
    /// 执行作业已入队
    ExecutionCreated,
    Running,
    Scored,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "MATCHED",
            Self::ExecutionCreated => "EXECUTION_CREATED",
            Self::Running => "RUNNING",
            Self::Scored => "SCORED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Scored | Self::Failed)
    }

    /// RUNNING -> RUNNING 允许，对应执行中途崩溃后的重投
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Matched, ExecutionCreated)
                | (ExecutionCreated, Running)
                | (Running, Running)
                | (Running, Scored)
                | (Matched | ExecutionCreated | Running, Failed)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MATCHED" => Ok(Self::Matched),
            "EXECUTION_CREATED" => Ok(Self::ExecutionCreated),
            "RUNNING" => Ok(Self::Running),
            "SCORED" => Ok(Self::Scored),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("未知执行状态: {other}")),
        }
    }
}

// ==================== 评估配置 ====================

/// 评估对象
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalTarget {
    Trace,
    Observation,
}

impl EvalTarget {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Trace => EntityType::Trace,
            Self::Observation => EntityType::Observation,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Observation => "observation",
        }
    }
}

impl FromStr for EvalTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Self::Trace),
            "observation" => Ok(Self::Observation),
            other => Err(format!("未知评估对象: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigStatus {
    Active,
    Inactive,
}

/// 模板变量到实体字段的映射
///
/// `path` 是实体负载中的点分路径，例如 `input`、`metadata.topic`。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableMapping {
    pub variable: String,
    pub path: String,
}

/// 租户定义的评估规则，由外部管理，这里只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfiguration {
    pub id: String,
    pub tenant_id: String,
    pub target: EvalTarget,
    /// 为空表示匹配该对象类型的全部实体
    pub filter: Option<FilterNode>,
    pub template_id: String,
    #[serde(default)]
    pub variable_mapping: Vec<VariableMapping>,
    /// 采样比例，0..=1
    pub sampling: f64,
    #[serde(default)]
    pub delay_secs: u64,
    pub score_name: String,
    pub status: ConfigStatus,
}

impl JobConfiguration {
    pub fn is_active(&self) -> bool {
        self.status == ConfigStatus::Active
    }
}

/// 模型输出的字段说明，渲染进提示词尾部
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputSchema {
    pub score: String,
    pub reasoning: String,
}

impl Default for OutputSchema {
    fn default() -> Self {
        Self {
            score: "0 到 1 之间的分数".to_string(),
            reasoning: "一句话说明打分理由".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalTemplate {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// 含 `{{variable}}` 占位符的提示词
    pub prompt: String,
    /// 为空时使用配置中的默认模型
    pub model: Option<String>,
    #[serde(default)]
    pub model_params: Value,
    #[serde(default)]
    pub output_schema: OutputSchema,
}

// ==================== 执行记录 ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalJobExecution {
    pub id: String,
    pub tenant_id: String,
    pub config_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub trace_id: Option<String>,
    pub status: ExecutionStatus,
    /// 模型调用次数
    pub attempt: u32,
    pub score_id: Option<String>,
    pub error: Option<String>,
    /// 无法解析时保留的模型原始输出
    pub raw_output: Option<String>,
    /// 把记录推进到 RUNNING 的队列作业
    pub runner: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EvalJobExecution {
    pub fn matched(config: &JobConfiguration, event: &EntityChangedEvent) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            tenant_id: event.tenant_id.clone(),
            config_id: config.id.clone(),
            entity_type: event.entity_type,
            entity_id: event.entity_id.clone(),
            trace_id: event.trace_id.clone(),
            status: ExecutionStatus::Matched,
            attempt: 0,
            score_id: None,
            error: None,
            raw_output: None,
            runner: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// 状态转换时一并写入的字段
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionUpdate {
    pub attempt: Option<u32>,
    pub score_id: Option<String>,
    pub error: Option<String>,
    pub raw_output: Option<String>,
    pub runner: Option<String>,
}

// ==================== 队列负载 ====================

/// 评估队列作业
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalJobPayload {
    /// 延迟到期后创建执行记录
    Create {
        config_id: String,
        event: EntityChangedEvent,
    },
    Execute {
        tenant_id: String,
        execution_id: String,
    },
}

// ==================== 评分 ====================

pub const SCORE_SOURCE_EVAL: &str = "EVAL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvalScore {
    /// 与执行记录 ID 相同，重复写入在查询时折叠
    pub id: String,
    pub tenant_id: String,
    pub trace_id: Option<String>,
    pub observation_id: Option<String>,
    pub name: String,
    pub value: f64,
    pub comment: Option<String>,
    pub source: String,
    pub config_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,
}

impl EvalScore {
    pub fn payload(&self) -> Value {
        json!({
            "id": self.id,
            "traceId": self.trace_id,
            "observationId": self.observation_id,
            "name": self.name,
            "value": self.value,
            "comment": self.comment,
            "source": self.source,
            "configId": self.config_id,
            "executionId": self.execution_id,
            "timestamp": self.timestamp,
        })
    }
}

/// 由变更信号构造过滤视图
pub fn entity_view(event: &EntityChangedEvent) -> EntityView {
    EntityView {
        entity_type: event.entity_type.as_str().to_string(),
        entity_id: event.entity_id.clone(),
        trace_id: event.trace_id.clone(),
        name: event.name.clone(),
        tags: event.tags.clone(),
        metadata: event.metadata.clone(),
        environment: event.environment.clone(),
        user_id: event.user_id.clone(),
        session_id: event.session_id.clone(),
        release: event.release.clone(),
        version: event.version.clone(),
        level: event.level.clone(),
    }
}
