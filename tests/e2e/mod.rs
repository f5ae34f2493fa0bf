//! 端到端测试
//!
//! 测试覆盖完整的数据流：
//! - 批次受理与暂存
//! - 摄取队列、去重与合并
//! - 关系库与分析库双写
//! - 实体变更信号驱动的评估规则匹配
//! - 模型调用与评分写回
//!
//! 所有外部依赖均替换为进程内实现，可直接运行。

pub mod setup;
pub mod suites;

pub use setup::TestEnvironment;
