//! 摄取管道
//!
//! 事件批次经 [`intake`] 暂存并入队，工作池领取作业后由 [`processor`]
//! 完成去重、合并、富化与双存储写入，成功后发布实体变更信号。

pub mod api;
pub mod enrichment;
pub mod error;
pub mod intake;
pub mod merge;
pub mod processor;
pub mod staging;
pub mod writer;

pub use error::{PipelineError, Result};
pub use intake::{IntakeResponse, IntakeService, InMemorySequenceAllocator, RedisSequenceAllocator};
pub use merge::{FieldPolicy, MergeEngine, MergeSchema, MergedEntity};
pub use processor::{IngestionPipeline, PipelineOutcome};
