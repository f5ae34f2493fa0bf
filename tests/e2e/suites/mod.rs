//! 测试套件模块
//!
//! 按数据流阶段组织的测试用例集合。

pub mod evaluation;
pub mod ingestion;
