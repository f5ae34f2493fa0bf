//! 过滤引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    /// 谓词树结构或期望值不合法
    #[error("过滤条件编译失败: {0}")]
    CompileError(String),

    /// 字段引用不在实体视图支持的范围内
    #[error("未知字段: {0}")]
    UnknownField(String),

    #[error("过滤条件格式错误: {0}")]
    Malformed(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FilterError>;
