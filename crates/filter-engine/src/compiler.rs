//! 过滤条件编译器
//!
//! 校验谓词树结构与期望值类型，预编译正则表达式，并提取引用的字段。

use std::collections::{BTreeSet, HashMap};

use regex::Regex;
use serde_json::Value;

use crate::error::{FilterError, Result};
use crate::evaluator::ConditionEvaluator;
use crate::models::{Condition, FilterNode};
use crate::operators::{OperandShape, Operator};

/// 编译后的过滤条件
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    root: FilterNode,
    /// 按模式字符串索引的预编译正则
    regexes: HashMap<String, Regex>,
    /// 条件中引用的所有字段
    pub required_fields: BTreeSet<String>,
}

impl CompiledFilter {
    pub fn root(&self) -> &FilterNode {
        &self.root
    }

    pub fn regex(&self, pattern: &str) -> Option<&Regex> {
        self.regexes.get(pattern)
    }
}

/// 过滤条件编译器
#[derive(Debug, Default)]
pub struct FilterCompiler;

impl FilterCompiler {
    pub fn new() -> Self {
        Self
    }

    /// 从 JSON 字符串编译
    pub fn compile_json(&self, json: &str) -> Result<CompiledFilter> {
        let node: FilterNode = serde_json::from_str(json)?;
        self.compile(node)
    }

    /// 从 JSON 值编译，配置表中的 JSONB 列走这里
    pub fn compile_value(&self, value: Value) -> Result<CompiledFilter> {
        let node: FilterNode = serde_json::from_value(value)?;
        self.compile(node)
    }

    pub fn compile(&self, root: FilterNode) -> Result<CompiledFilter> {
        let mut regexes = HashMap::new();
        let mut required_fields = BTreeSet::new();
        self.compile_node(&root, "root", &mut regexes, &mut required_fields)?;

        Ok(CompiledFilter {
            root,
            regexes,
            required_fields,
        })
    }

    fn compile_node(
        &self,
        node: &FilterNode,
        path: &str,
        regexes: &mut HashMap<String, Regex>,
        fields: &mut BTreeSet<String>,
    ) -> Result<()> {
        match node {
            FilterNode::Condition(cond) => {
                self.validate_condition(cond, path)?;
                fields.insert(cond.field.to_string());

                if cond.operator == Operator::Regex
                    && let Some(pattern) = cond.value.as_str()
                    && !regexes.contains_key(pattern)
                {
                    let regex = Regex::new(pattern).map_err(|e| {
                        FilterError::CompileError(format!(
                            "条件 '{}' 的正则表达式 '{}' 无效: {}",
                            path, pattern, e
                        ))
                    })?;
                    regexes.insert(pattern.to_string(), regex);
                }
            }
            FilterNode::Group(group) => {
                if group.children.is_empty() {
                    return Err(FilterError::CompileError(format!(
                        "逻辑组 '{}' 不能为空",
                        path
                    )));
                }
                for (i, child) in group.children.iter().enumerate() {
                    let child_path = format!("{}.children[{}]", path, i);
                    self.compile_node(child, &child_path, regexes, fields)?;
                }
            }
        }
        Ok(())
    }

    /// 校验期望值是否符合操作符要求的形态
    fn validate_condition(&self, cond: &Condition, path: &str) -> Result<()> {
        let value = &cond.value;
        let shape = cond.operator.operand_shape();
        let ok = match shape {
            OperandShape::None => true,
            OperandShape::Any => !value.is_null(),
            OperandShape::Number => ConditionEvaluator::as_f64(value).is_some(),
            OperandShape::Text => value.is_string(),
            OperandShape::List => value.is_array(),
            OperandShape::Timestamp => ConditionEvaluator::parse_datetime(value).is_some(),
        };

        if ok {
            Ok(())
        } else {
            Err(FilterError::CompileError(format!(
                "条件 '{}' 的 {} 操作符需要 {}，实际为 {}",
                path,
                cond.operator,
                shape.describe(),
                ConditionEvaluator::type_name(value)
            )))
        }
    }
}
