//! 过滤谓词引擎
//!
//! 评估规则的过滤条件以类型化的谓词树表示，针对结构化的实体视图求值：
//! - JSON 谓词定义与解析
//! - 编译期校验与正则预编译
//! - 短路求值执行

pub mod compiler;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod models;
pub mod operators;

pub use compiler::{CompiledFilter, FilterCompiler};
pub use error::{FilterError, Result};
pub use executor::FilterExecutor;
pub use models::{Condition, EntityView, FieldRef, FilterGroup, FilterNode, FilterResult};
pub use operators::{LogicalOperator, OperandShape, Operator};
