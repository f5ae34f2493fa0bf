//! 测试环境设置模块
//!
//! 组装摄取管道与评估执行器，并在两者之间转发实体变更信号。

mod environment;
mod provider;

pub use environment::{TENANT, TestEnvironment};
pub use provider::FixedProvider;
