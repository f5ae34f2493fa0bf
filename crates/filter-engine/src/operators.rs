//! 过滤操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 条件操作符
///
/// 序列化为 snake_case 字符串，与评估规则配置中的写法一致。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    /// 字符串子串或数组元素
    Contains,
    NotContains,
    ContainsAny,
    ContainsAll,
    StartsWith,
    EndsWith,
    Regex,
    /// 字段值为早于期望值的时间点
    Before,
    After,
    IsEmpty,
    IsNotEmpty,
}

/// 操作符对期望值形态的要求，编译期据此校验
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandShape {
    /// 不读取期望值
    None,
    /// 任意非 null 的 JSON 值
    Any,
    Number,
    Text,
    List,
    Timestamp,
}

impl OperandShape {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::None => "无期望值",
            Self::Any => "非空期望值",
            Self::Number => "数值",
            Self::Text => "字符串",
            Self::List => "数组",
            Self::Timestamp => "日期时间字符串",
        }
    }
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::ContainsAny => "contains_any",
            Self::ContainsAll => "contains_all",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Regex => "regex",
            Self::Before => "before",
            Self::After => "after",
            Self::IsEmpty => "is_empty",
            Self::IsNotEmpty => "is_not_empty",
        }
    }

    pub fn operand_shape(&self) -> OperandShape {
        match self {
            Self::IsEmpty | Self::IsNotEmpty => OperandShape::None,
            Self::Gt | Self::Gte | Self::Lt | Self::Lte => OperandShape::Number,
            Self::In | Self::NotIn | Self::ContainsAny | Self::ContainsAll => OperandShape::List,
            Self::StartsWith | Self::EndsWith | Self::Regex => OperandShape::Text,
            Self::Before | Self::After => OperandShape::Timestamp,
            Self::Equals | Self::NotEquals | Self::Contains | Self::NotContains => {
                OperandShape::Any
            }
        }
    }

    /// 否定类操作符在字段缺失时成立
    pub fn holds_when_missing(&self) -> bool {
        matches!(self, Self::NotEquals | Self::NotIn | Self::NotContains | Self::IsEmpty)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 逻辑组合符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    And,
    Or,
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::And => "AND",
            Self::Or => "OR",
        })
    }
}
