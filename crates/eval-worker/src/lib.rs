//! 评估执行器
//!
//! 消费实体变更信号匹配租户的评估规则（[`trigger`]），
//! 在评估队列上执行模型打分并把评分写入分析库（[`executor`]）。

pub mod consumer;
pub mod error;
pub mod executor;
pub mod models;
pub mod provider;
pub mod repository;
pub mod templates;
pub mod trigger;

pub use consumer::EntityChangedConsumer;
pub use error::{EvalError, Result};
pub use executor::{EvalExecutor, ExecutionOutcome, ExecutorSettings};
pub use models::{EvalJobExecution, EvalJobPayload, ExecutionStatus, JobConfiguration};
pub use provider::{LlmProvider, OpenAiCompatibleProvider};
pub use trigger::{EvalTrigger, TriggerReport};
