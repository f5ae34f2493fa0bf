//! 评估执行器错误类型
//!
//! 区分可重试（模型调用超时、存储故障）与终态（模板缺失、输出无法解析）两类，
//! 终态错误把执行记录置为 FAILED，而不是让队列反复重投。

use ingest_shared::error::IngestError;
use thiserror::Error;

use crate::models::ExecutionStatus;
use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("评估配置不存在: {0}")]
    ConfigNotFound(String),

    #[error("评估模板不存在: {0}")]
    TemplateNotFound(String),

    #[error("评估执行记录不存在: {0}")]
    ExecutionNotFound(String),

    #[error("提示词渲染失败: {0}")]
    TemplateRender(String),

    #[error("模型输出格式错误: {reason}")]
    MalformedOutput { reason: String, raw: String },

    #[error("执行状态不允许转换: {from} -> {to}")]
    InvalidTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("过滤条件无效: {0}")]
    Filter(#[from] filter_engine::FilterError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Shared(#[from] IngestError),
}

pub type Result<T> = std::result::Result<T, EvalError>;

impl EvalError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::Shared(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<EvalError> for IngestError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::Shared(e) => e,
            EvalError::Provider(ref e) if e.is_retryable() => {
                IngestError::transient("llm_provider", err.to_string())
            }
            other => IngestError::PermanentData(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EvalError {
    fn from(err: serde_json::Error) -> Self {
        Self::Shared(IngestError::Serialization(err))
    }
}

impl From<sqlx::Error> for EvalError {
    fn from(err: sqlx::Error) -> Self {
        Self::Shared(IngestError::Database(err))
    }
}
