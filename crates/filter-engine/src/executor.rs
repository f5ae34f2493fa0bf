//! 过滤条件执行器
//!
//! 对编译后的谓词树做短路求值，可选记录逐步求值追踪。

use crate::compiler::CompiledFilter;
use crate::evaluator::ConditionEvaluator;
use crate::models::{Condition, EntityView, FilterGroup, FilterNode, FilterResult};
use crate::operators::{LogicalOperator, Operator};

/// 过滤条件执行器
#[derive(Debug, Default)]
pub struct FilterExecutor {
    trace_enabled: bool,
}

impl FilterExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启用求值追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    pub fn execute(&self, filter: &CompiledFilter, view: &EntityView) -> FilterResult {
        let mut result = FilterResult::default();
        let matched = self.evaluate_node(filter, filter.root(), view, &mut result, "root");
        result.matched = matched;
        result
    }

    /// 只关心是否匹配
    pub fn matches(&self, filter: &CompiledFilter, view: &EntityView) -> bool {
        self.execute(filter, view).matched
    }

    fn evaluate_node(
        &self,
        filter: &CompiledFilter,
        node: &FilterNode,
        view: &EntityView,
        result: &mut FilterResult,
        path: &str,
    ) -> bool {
        match node {
            FilterNode::Condition(cond) => self.evaluate_condition(filter, cond, view, result, path),
            FilterNode::Group(group) => self.evaluate_group(filter, group, view, result, path),
        }
    }

    fn evaluate_condition(
        &self,
        filter: &CompiledFilter,
        cond: &Condition,
        view: &EntityView,
        result: &mut FilterResult,
        path: &str,
    ) -> bool {
        let field_value = view.resolve(&cond.field);
        let regex = match cond.operator {
            Operator::Regex => cond.value.as_str().and_then(|p| filter.regex(p)),
            _ => None,
        };

        let matched = ConditionEvaluator::evaluate(
            field_value.as_deref(),
            cond.operator,
            &cond.value,
            regex,
        );

        if self.trace_enabled {
            result.evaluation_trace.push(format!(
                "{}: {} {} {} => {}",
                path,
                cond.field,
                cond.operator,
                cond.value,
                if matched { "MATCHED" } else { "NOT_MATCHED" }
            ));
        }

        if matched {
            result
                .matched_conditions
                .push(format!("{} {} {}", cond.field, cond.operator, cond.value));
        }

        matched
    }

    fn evaluate_group(
        &self,
        filter: &CompiledFilter,
        group: &FilterGroup,
        view: &EntityView,
        result: &mut FilterResult,
        path: &str,
    ) -> bool {
        // AND 遇到不匹配即返回，OR 遇到匹配即返回
        let short_circuit_on = group.operator == LogicalOperator::Or;

        for (i, child) in group.children.iter().enumerate() {
            let child_path = format!("{}.children[{}]", path, i);
            if self.evaluate_node(filter, child, view, result, &child_path) == short_circuit_on {
                if self.trace_enabled {
                    result.evaluation_trace.push(format!(
                        "{}: {} 短路于子节点 {}",
                        path, group.operator, i
                    ));
                }
                return short_circuit_on;
            }
        }

        !short_circuit_on
    }
}
