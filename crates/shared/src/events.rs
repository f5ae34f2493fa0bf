//! 事件模型
//!
//! 定义摄取边界收到的事件、暂存的原始事件批次、队列作业负载，
//! 以及持久化成功后发布的实体变更信号。

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::{Validate, ValidationError};

use crate::error::IngestError;

// ---------------------------------------------------------------------------
// EntityType — 实体类型
// ---------------------------------------------------------------------------

/// 实体类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Trace,
    Observation,
    Score,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [Self::Trace, Self::Observation, Self::Score];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Observation => "observation",
            Self::Score => "score",
        }
    }

    /// 关系库与分析库中对应的表名
    pub fn table(&self) -> &'static str {
        match self {
            Self::Trace => "traces",
            Self::Observation => "observations",
            Self::Score => "scores",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(Self::Trace),
            "observation" => Ok(Self::Observation),
            "score" => Ok(Self::Score),
            other => Err(IngestError::Validation(format!("未知实体类型: {other}"))),
        }
    }
}

/// 标识符会出现在暂存路径与去重键中，不允许包含分隔符
fn validate_path_segment(value: &str) -> Result<(), ValidationError> {
    if value.contains('/') || value.contains(':') || value.trim().is_empty() {
        return Err(ValidationError::new("invalid_path_segment"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// 摄取边界
// ---------------------------------------------------------------------------

/// SDK 上报的单条事件，已通过上游认证
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    /// 事件 ID，SDK 重试时保持不变
    #[validate(length(min = 1, max = 128, message = "事件 ID 长度必须在1-128个字符之间"))]
    pub id: String,
    pub entity_type: EntityType,
    #[validate(
        length(min = 1, max = 256, message = "实体 ID 长度必须在1-256个字符之间"),
        custom(function = "validate_path_segment")
    )]
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// 一个租户的一批事件
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct IngestionBatch {
    #[validate(
        length(min = 1, max = 128, message = "租户 ID 长度必须在1-128个字符之间"),
        custom(function = "validate_path_segment")
    )]
    pub tenant_id: String,
    pub events: Vec<EventInput>,
}

// ---------------------------------------------------------------------------
// 暂存与队列负载
// ---------------------------------------------------------------------------

/// 暂存后的原始事件，写入后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub id: String,
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub timestamp: DateTime<Utc>,
    /// 摄取时分配的租户内单调序列号，时间戳相同时用于确定顺序
    pub seq: u64,
    pub fields: Map<String, Value>,
}

impl RawEvent {
    pub fn from_input(tenant_id: &str, input: EventInput, seq: u64) -> Self {
        Self {
            id: input.id,
            tenant_id: tenant_id.to_string(),
            entity_type: input.entity_type,
            entity_id: input.entity_id,
            timestamp: input.timestamp,
            seq,
            fields: input.fields,
        }
    }
}

/// 同一实体的一批原始事件，是暂存对象的负载
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedBlob {
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub events: Vec<RawEvent>,
}

/// 指向暂存对象的引用
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    pub key: String,
    pub entity_type: EntityType,
    pub entity_id: String,
}

/// 摄取队列作业负载：`{tenantId, blobRefs[]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionJob {
    pub tenant_id: String,
    pub blob_refs: Vec<BlobRef>,
}

// ---------------------------------------------------------------------------
// EntityChangedEvent — 实体变更信号
// ---------------------------------------------------------------------------

/// 两个存储都写入成功后发布，驱动评估规则匹配
///
/// 携带规则过滤所需的实体视图字段，消费方无需回查存储即可完成匹配。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChangedEvent {
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub trace_id: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: Value,
    pub environment: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub release: Option<String>,
    pub version: Option<String>,
    pub level: Option<String>,
    pub max_seq: u64,
    pub changed_at: DateTime<Utc>,
}
