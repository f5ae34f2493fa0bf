//! 摄取管道专用错误类型
//!
//! 在共享库 IngestError 基础上补充管道内部的错误变体，
//! 最终交给工作池时统一转换回 IngestError，由其分类决定重试还是死信。

use ingest_shared::error::IngestError;

/// 摄取管道错误
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// 暂存对象内容无法解析
    #[error("暂存对象格式错误: {blob_key} - {reason}")]
    MalformedBlob { blob_key: String, reason: String },

    /// 作业负载中的引用与暂存内容不一致
    #[error("作业引用不一致: {0}")]
    InconsistentJob(String),

    /// 去重键被其他消费者占用，稍后重投
    #[error("去重键处理中: {key}")]
    ReservationBusy { key: String },

    /// 分析库缓冲任务已停止
    #[error("分析库缓冲区已关闭: {table}")]
    BufferClosed { table: String },

    /// 透传共享库错误
    #[error(transparent)]
    Shared(#[from] IngestError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MalformedBlob { .. } | Self::InconsistentJob(_) => false,
            Self::ReservationBusy { .. } | Self::BufferClosed { .. } => true,
            Self::Shared(e) => e.is_retryable(),
        }
    }
}

impl From<PipelineError> for IngestError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Shared(e) => e,
            PipelineError::MalformedBlob { .. } | PipelineError::InconsistentJob(_) => {
                IngestError::PermanentData(err.to_string())
            }
            PipelineError::ReservationBusy { .. } => IngestError::transient("dedup", err.to_string()),
            PipelineError::BufferClosed { .. } => {
                IngestError::transient("analytics", err.to_string())
            }
        }
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Shared(IngestError::Serialization(err))
    }
}
