//! 过滤谓词数据模型
//!
//! 谓词树由条件节点和逻辑组组成，字段引用在反序列化时即解析为类型化的
//! `FieldRef`，求值时直接从 `EntityView` 取值，不做动态属性查找。

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FilterError;
use crate::operators::{LogicalOperator, Operator};

// ---------------------------------------------------------------------------
// 谓词树
// ---------------------------------------------------------------------------

/// 谓词节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterNode {
    Condition(Condition),
    Group(FilterGroup),
}

impl FilterNode {
    pub fn condition(field: FieldRef, operator: Operator, value: Value) -> Self {
        Self::Condition(Condition {
            field,
            operator,
            value,
        })
    }

    pub fn all(children: Vec<FilterNode>) -> Self {
        Self::Group(FilterGroup {
            operator: LogicalOperator::And,
            children,
        })
    }

    pub fn any(children: Vec<FilterNode>) -> Self {
        Self::Group(FilterGroup {
            operator: LogicalOperator::Or,
            children,
        })
    }
}

/// 条件节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: FieldRef,
    pub operator: Operator,
    /// is_empty / is_not_empty 不需要期望值
    #[serde(default)]
    pub value: Value,
}

/// 逻辑组
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub operator: LogicalOperator,
    pub children: Vec<FilterNode>,
}

// ---------------------------------------------------------------------------
// FieldRef — 字段引用
// ---------------------------------------------------------------------------

/// 可过滤的实体字段
///
/// JSON 中以字符串表示：`name`、`tags`、`metadata`、`metadata.<path>` 等。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FieldRef {
    Name,
    Tags,
    /// 空路径表示整个 metadata 对象
    Metadata(Vec<String>),
    EntityType,
    TraceId,
    Environment,
    UserId,
    SessionId,
    Release,
    Version,
    Level,
}

impl FieldRef {
    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let field = match raw {
            "name" => Self::Name,
            "tags" => Self::Tags,
            "metadata" => Self::Metadata(Vec::new()),
            "entity_type" | "entityType" => Self::EntityType,
            "trace_id" | "traceId" => Self::TraceId,
            "environment" => Self::Environment,
            "user_id" | "userId" => Self::UserId,
            "session_id" | "sessionId" => Self::SessionId,
            "release" => Self::Release,
            "version" => Self::Version,
            "level" => Self::Level,
            other => {
                let path = other
                    .strip_prefix("metadata.")
                    .ok_or_else(|| FilterError::UnknownField(other.to_string()))?;
                let segments: Vec<String> = path.split('.').map(str::to_string).collect();
                if segments.iter().any(|s| s.is_empty()) {
                    return Err(FilterError::UnknownField(other.to_string()));
                }
                Self::Metadata(segments)
            }
        };
        Ok(field)
    }

    pub fn metadata(path: &str) -> Self {
        Self::Metadata(
            path.split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

impl TryFrom<String> for FieldRef {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FieldRef> for String {
    fn from(field: FieldRef) -> Self {
        field.to_string()
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name => write!(f, "name"),
            Self::Tags => write!(f, "tags"),
            Self::Metadata(path) if path.is_empty() => write!(f, "metadata"),
            Self::Metadata(path) => write!(f, "metadata.{}", path.join(".")),
            Self::EntityType => write!(f, "entity_type"),
            Self::TraceId => write!(f, "trace_id"),
            Self::Environment => write!(f, "environment"),
            Self::UserId => write!(f, "user_id"),
            Self::SessionId => write!(f, "session_id"),
            Self::Release => write!(f, "release"),
            Self::Version => write!(f, "version"),
            Self::Level => write!(f, "level"),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityView — 求值输入
// ---------------------------------------------------------------------------

/// 供谓词求值的实体视图
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    pub entity_type: String,
    pub entity_id: String,
    pub trace_id: Option<String>,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub environment: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub release: Option<String>,
    pub version: Option<String>,
    pub level: Option<String>,
}

impl EntityView {
    /// 取字段值，字段不存在时返回 None
    pub fn resolve(&self, field: &FieldRef) -> Option<Cow<'_, Value>> {
        fn text(value: &Option<String>) -> Option<Cow<'_, Value>> {
            value.as_ref().map(|s| Cow::Owned(Value::String(s.clone())))
        }

        match field {
            FieldRef::Name => text(&self.name),
            FieldRef::Tags => Some(Cow::Owned(Value::Array(
                self.tags.iter().cloned().map(Value::String).collect(),
            ))),
            FieldRef::Metadata(path) => {
                let mut current = &self.metadata;
                for segment in path {
                    current = match current {
                        Value::Object(map) => map.get(segment)?,
                        Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                        _ => return None,
                    };
                }
                (!current.is_null()).then_some(Cow::Borrowed(current))
            }
            FieldRef::EntityType => Some(Cow::Owned(Value::String(self.entity_type.clone()))),
            FieldRef::TraceId => text(&self.trace_id),
            FieldRef::Environment => text(&self.environment),
            FieldRef::UserId => text(&self.user_id),
            FieldRef::SessionId => text(&self.session_id),
            FieldRef::Release => text(&self.release),
            FieldRef::Version => text(&self.version),
            FieldRef::Level => text(&self.level),
        }
    }
}

// ---------------------------------------------------------------------------
// FilterResult — 求值结果
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterResult {
    pub matched: bool,
    /// 命中的条件描述
    pub matched_conditions: Vec<String>,
    /// 开启追踪时的逐步求值记录
    pub evaluation_trace: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_filter_json() {
        let node: FilterNode = serde_json::from_value(json!({
            "type": "group",
            "operator": "AND",
            "children": [
                {"type": "condition", "field": "name", "operator": "equals", "value": "chat-completion"},
                {"type": "condition", "field": "metadata.customer.tier", "operator": "in", "value": ["gold", "silver"]},
                {"type": "condition", "field": "tags", "operator": "is_not_empty"}
            ]
        }))
        .unwrap();

        let FilterNode::Group(group) = node else {
            panic!("expected group");
        };
        assert_eq!(group.children.len(), 3);
        let FilterNode::Condition(cond) = &group.children[1] else {
            panic!("expected condition");
        };
        assert_eq!(
            cond.field,
            FieldRef::Metadata(vec!["customer".to_string(), "tier".to_string()])
        );
        let FilterNode::Condition(unary) = &group.children[2] else {
            panic!("expected condition");
        };
        assert_eq!(unary.value, Value::Null);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<FilterNode, _> = serde_json::from_value(json!({
            "type": "condition", "field": "input.prompt", "operator": "contains", "value": "x"
        }));
        assert!(result.is_err());
        assert!(FieldRef::parse("metadata..a").is_err());
    }

    #[test]
    fn test_field_ref_round_trip() {
        for raw in ["name", "tags", "metadata", "metadata.a.b", "user_id", "level"] {
            let field = FieldRef::parse(raw).unwrap();
            assert_eq!(field.to_string(), raw);
        }
        assert_eq!(FieldRef::parse("userId").unwrap(), FieldRef::UserId);
    }

    #[test]
    fn test_resolve_fields() {
        let view = EntityView {
            entity_type: "trace".to_string(),
            name: Some("chat".to_string()),
            tags: vec!["prod".to_string()],
            metadata: json!({"customer": {"tier": "gold"}, "steps": [{"id": 1}], "gone": null}),
            ..Default::default()
        };

        assert_eq!(view.resolve(&FieldRef::Name).unwrap().as_ref(), &json!("chat"));
        assert_eq!(view.resolve(&FieldRef::Tags).unwrap().as_ref(), &json!(["prod"]));
        assert_eq!(
            view.resolve(&FieldRef::metadata("customer.tier")).unwrap().as_ref(),
            &json!("gold")
        );
        assert_eq!(
            view.resolve(&FieldRef::metadata("steps.0.id")).unwrap().as_ref(),
            &json!(1)
        );
        assert!(view.resolve(&FieldRef::metadata("gone")).is_none());
        assert!(view.resolve(&FieldRef::metadata("customer.missing")).is_none());
        assert!(view.resolve(&FieldRef::UserId).is_none());
    }
}
