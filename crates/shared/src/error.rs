//! 统一错误处理模块
//!
//! 定义摄取管道与评估执行器共享的错误分类。分类决定了错误的去向：
//! 可重试错误交给组件自身或队列重投处理，不可重试错误进入死信或 FAILED 终态。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum IngestError {
    // ==================== 基础设施错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis 错误: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Kafka 错误: {0}")]
    Kafka(String),

    #[error("ClickHouse 错误: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("对象存储错误: {0}")]
    Storage(String),

    // ==================== 管道错误 ====================
    /// 暂存、存储或外部调用的瞬时 I/O 故障
    #[error("瞬时 I/O 错误: {component} - {message}")]
    TransientIo { component: String, message: String },

    #[error("操作超时: {operation}")]
    Timeout { operation: String },

    /// 作业引用的暂存对象已不存在，数据丢失必须可观测
    #[error("暂存对象缺失: {blob_key}")]
    StagingMissing { blob_key: String },

    /// 数据本身不可处理（无法解析的 blob、格式错误的模型响应等）
    #[error("永久性数据错误: {0}")]
    PermanentData(String),

    /// 参考数据缺失，只记录标记，不阻断摄取
    #[error("参考数据缺失: {entity_id} - {reason}")]
    ValidationGap { entity_id: String, reason: String },

    /// 一个存储写入成功而另一个失败，整个工作单元需要重投
    #[error("部分写入失败: {committed} 已提交, {failed} 失败 - {reason}")]
    PartialWrite {
        committed: String,
        failed: String,
        reason: String,
    },

    #[error("作业租约已丢失: job_id={job_id}")]
    LeaseLost { job_id: String },

    // ==================== 通用错误 ====================
    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, IngestError>;

impl IngestError {
    pub fn transient(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientIo {
            component: component.into(),
            message: message.into(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Redis(_) => "REDIS_ERROR",
            Self::Kafka(_) => "KAFKA_ERROR",
            Self::ClickHouse(_) => "CLICKHOUSE_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::TransientIo { .. } => "TRANSIENT_IO",
            Self::Timeout { .. } => "TIMEOUT",
            Self::StagingMissing { .. } => "STAGING_MISSING",
            Self::PermanentData(_) => "PERMANENT_DATA",
            Self::ValidationGap { .. } => "VALIDATION_GAP",
            Self::PartialWrite { .. } => "PARTIAL_WRITE",
            Self::LeaseLost { .. } => "LEASE_LOST",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 不可重试的错误由队列层立即转入死信。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Redis(_)
                | Self::Kafka(_)
                | Self::ClickHouse(_)
                | Self::Storage(_)
                | Self::TransientIo { .. }
                | Self::Timeout { .. }
                | Self::PartialWrite { .. }
                | Self::LeaseLost { .. }
        )
    }
}
