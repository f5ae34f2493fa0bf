//! 共享库
//!
//! 摄取管道与评估执行器共用的配置、错误处理、存储客户端、分片队列、
//! 去重缓存、工作池和可观测性基础设施。

pub mod analytics;
pub mod cache;
pub mod config;
pub mod database;
pub mod dedup;
pub mod dlq;
pub mod error;
pub mod events;
pub mod kafka;
pub mod observability;
pub mod queue;
pub mod retry;
pub mod test_utils;
pub mod worker;
