//! 评估提示词渲染
//!
//! 模板中的 `{{variable}}` 按配置的变量映射从实体负载取值。
//! 没有映射的变量按同名路径查找；任何变量取不到值都视为渲染失败，
//! 不向模型发送残缺的提示词。

use regex::{Captures, Regex};
use serde_json::Value;

use crate::error::{EvalError, Result};
use crate::models::{EvalTemplate, OutputSchema, VariableMapping};

const PLACEHOLDER: &str = r"\{\{\s*([\w.]+)\s*\}\}";

pub struct PromptRenderer {
    placeholder: Regex,
}

impl PromptRenderer {
    pub fn new() -> Result<Self> {
        let placeholder =
            Regex::new(PLACEHOLDER).map_err(|e| EvalError::TemplateRender(e.to_string()))?;
        Ok(Self { placeholder })
    }

    /// 模板引用的全部变量名（去重，保持出现顺序）
    pub fn variables(&self, prompt: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for caps in self.placeholder.captures_iter(prompt) {
            let name = caps[1].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names
    }

    /// 渲染完整提示词，末尾附加输出格式要求
    pub fn render(
        &self,
        template: &EvalTemplate,
        mapping: &[VariableMapping],
        entity: &Value,
    ) -> Result<String> {
        let mut missing = Vec::new();

        let body = self.placeholder.replace_all(&template.prompt, |caps: &Captures| {
            let name = &caps[1];
            let path = mapping
                .iter()
                .find(|m| m.variable == name)
                .map(|m| m.path.as_str())
                .unwrap_or(name);

            match lookup(entity, path) {
                Some(value) => stringify(value),
                None => {
                    missing.push(name.to_string());
                    String::new()
                }
            }
        });

        if !missing.is_empty() {
            return Err(EvalError::TemplateRender(format!(
                "模板 {} 变量无值: {}",
                template.name,
                missing.join(", ")
            )));
        }

        Ok(format!(
            "{body}\n\n{}",
            output_instructions(&template.output_schema)
        ))
    }
}

fn output_instructions(schema: &OutputSchema) -> String {
    format!(
        "请只返回 JSON 对象，格式为 {{\"score\": <{}>, \"reasoning\": \"<{}>\"}}",
        schema.score, schema.reasoning
    )
}

/// 点分路径取值，null 视为无值
fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, segment| match node {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .filter(|v| !v.is_null())
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
