//! 条件评估器
//!
//! 单个条件的求值逻辑。实体元数据由客户端自由填写，类型与期望值不符时
//! 条件视为不匹配，而不是报错；期望值本身的合法性在编译期检查。

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde_json::Value;

use crate::operators::Operator;

/// 条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件
    ///
    /// # Arguments
    /// * `field_value` - 从实体视图取出的字段值
    /// * `operator` - 操作符
    /// * `expected_value` - 条件中定义的期望值
    /// * `regex` - regex 操作符编译期预编译的表达式
    pub fn evaluate(
        field_value: Option<&Value>,
        operator: Operator,
        expected_value: &Value,
        regex: Option<&Regex>,
    ) -> bool {
        match operator {
            Operator::IsEmpty => return Self::is_empty(field_value),
            Operator::IsNotEmpty => return !Self::is_empty(field_value),
            _ => {}
        }

        let Some(field_value) = field_value else {
            return operator.holds_when_missing();
        };

        match operator {
            Operator::Equals => Self::eq(field_value, expected_value),
            Operator::NotEquals => !Self::eq(field_value, expected_value),
            Operator::Gt => Self::compare(field_value, expected_value, |a, b| a > b),
            Operator::Gte => Self::compare(field_value, expected_value, |a, b| a >= b),
            Operator::Lt => Self::compare(field_value, expected_value, |a, b| a < b),
            Operator::Lte => Self::compare(field_value, expected_value, |a, b| a <= b),
            Operator::In => Self::in_list(field_value, expected_value),
            Operator::NotIn => !Self::in_list(field_value, expected_value),
            Operator::Contains => Self::contains(field_value, expected_value),
            Operator::NotContains => !Self::contains(field_value, expected_value),
            Operator::ContainsAny => Self::contains_any(field_value, expected_value),
            Operator::ContainsAll => Self::contains_all(field_value, expected_value),
            Operator::StartsWith => {
                Self::string_test(field_value, expected_value, |s, p| s.starts_with(p))
            }
            Operator::EndsWith => {
                Self::string_test(field_value, expected_value, |s, p| s.ends_with(p))
            }
            Operator::Regex => Self::regex_match(field_value, expected_value, regex),
            Operator::Before => Self::time_compare(field_value, expected_value, |a, b| a < b),
            Operator::After => Self::time_compare(field_value, expected_value, |a, b| a > b),
            Operator::IsEmpty | Operator::IsNotEmpty => false,
        }
    }

    fn is_empty(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(arr)) => arr.is_empty(),
            Some(Value::Object(obj)) => obj.is_empty(),
            _ => false,
        }
    }

    /// 相等比较，数值统一按 f64 比较（100 == 100.0）
    fn eq(field: &Value, expected: &Value) -> bool {
        match (field, expected) {
            (Value::Number(_), Value::Number(_)) => match (field.as_f64(), expected.as_f64()) {
                (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
                _ => false,
            },
            _ => field == expected,
        }
    }

    fn compare(field: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
        match (Self::as_f64(field), Self::as_f64(expected)) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => false,
        }
    }

    fn in_list(field: &Value, expected: &Value) -> bool {
        expected
            .as_array()
            .is_some_and(|items| items.iter().any(|item| Self::eq(field, item)))
    }

    /// 字符串子串或数组成员
    fn contains(field: &Value, expected: &Value) -> bool {
        match field {
            Value::String(s) => expected.as_str().is_some_and(|sub| s.contains(sub)),
            Value::Array(arr) => arr.iter().any(|item| Self::eq(item, expected)),
            _ => false,
        }
    }

    fn contains_any(field: &Value, expected: &Value) -> bool {
        match (field.as_array(), expected.as_array()) {
            (Some(have), Some(want)) => want
                .iter()
                .any(|w| have.iter().any(|h| Self::eq(h, w))),
            _ => false,
        }
    }

    fn contains_all(field: &Value, expected: &Value) -> bool {
        match (field.as_array(), expected.as_array()) {
            (Some(have), Some(want)) => want
                .iter()
                .all(|w| have.iter().any(|h| Self::eq(h, w))),
            _ => false,
        }
    }

    fn string_test(field: &Value, expected: &Value, test: impl Fn(&str, &str) -> bool) -> bool {
        match (field.as_str(), expected.as_str()) {
            (Some(s), Some(p)) => test(s, p),
            _ => false,
        }
    }

    /// 正则匹配；字段为数组时任一字符串元素匹配即可（如 tags）
    fn regex_match(field: &Value, expected: &Value, regex: Option<&Regex>) -> bool {
        let compiled;
        let regex = match regex {
            Some(r) => r,
            None => {
                let Some(pattern) = expected.as_str() else {
                    return false;
                };
                compiled = match Regex::new(pattern) {
                    Ok(r) => r,
                    Err(_) => return false,
                };
                &compiled
            }
        };

        match field {
            Value::String(s) => regex.is_match(s),
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .any(|s| regex.is_match(s)),
            _ => false,
        }
    }

    fn time_compare(
        field: &Value,
        expected: &Value,
        cmp: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
    ) -> bool {
        match (Self::parse_datetime(field), Self::parse_datetime(expected)) {
            (Some(a), Some(b)) => cmp(a, b),
            _ => false,
        }
    }

    /// 解析 RFC 3339 时间或纯日期
    pub fn parse_datetime(value: &Value) -> Option<DateTime<Utc>> {
        let s = value.as_str()?;
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
    }

    pub fn as_f64(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// 值的类型名称
    pub fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(field: Value, op: Operator, expected: Value) -> bool {
        ConditionEvaluator::evaluate(Some(&field), op, &expected, None)
    }

    #[test]
    fn test_equals() {
        assert!(eval(json!("chat-completion"), Operator::Equals, json!("chat-completion")));
        assert!(!eval(json!("chat"), Operator::Equals, json!("chat-completion")));
        assert!(eval(json!(100), Operator::Equals, json!(100.0)));
        assert!(!eval(json!("100"), Operator::Equals, json!(100)));
        assert!(eval(json!("a"), Operator::NotEquals, json!("b")));
    }

    #[test]
    fn test_numeric_compare() {
        assert!(eval(json!(0.8), Operator::Gt, json!(0.5)));
        assert!(eval(json!("12"), Operator::Lte, json!(12)));
        // 类型不符视为不匹配
        assert!(!eval(json!({"a": 1}), Operator::Gt, json!(0)));
    }

    #[test]
    fn test_contains_family() {
        assert!(eval(json!("hello world"), Operator::Contains, json!("world")));
        assert!(eval(json!(["prod", "beta"]), Operator::Contains, json!("beta")));
        assert!(eval(json!(["prod"]), Operator::NotContains, json!("beta")));
        assert!(eval(json!(["a", "b"]), Operator::ContainsAny, json!(["x", "b"])));
        assert!(!eval(json!(["a", "b"]), Operator::ContainsAll, json!(["a", "c"])));
        assert!(eval(json!(["a", "b", "c"]), Operator::ContainsAll, json!(["a", "c"])));
        assert!(eval(json!("gold"), Operator::In, json!(["gold", "silver"])));
        assert!(eval(json!("bronze"), Operator::NotIn, json!(["gold", "silver"])));
    }

    #[test]
    fn test_string_and_regex() {
        assert!(eval(json!("gpt-4o-mini"), Operator::StartsWith, json!("gpt-4")));
        assert!(eval(json!("gpt-4o-mini"), Operator::EndsWith, json!("mini")));
        assert!(eval(json!("chat-42"), Operator::Regex, json!(r"^chat-\d+$")));
        assert!(eval(json!(["env:prod", "x"]), Operator::Regex, json!("^env:")));
        assert!(!eval(json!("chat"), Operator::Regex, json!("(")));
    }

    #[test]
    fn test_precompiled_regex_is_used() {
        let regex = Regex::new("^a").unwrap();
        // 传入预编译表达式时忽略期望值字符串
        assert!(ConditionEvaluator::evaluate(
            Some(&json!("abc")),
            Operator::Regex,
            &json!("unused"),
            Some(&regex)
        ));
    }

    #[test]
    fn test_time_compare() {
        assert!(eval(json!("2024-01-15T10:00:00Z"), Operator::Before, json!("2024-02-01")));
        assert!(eval(json!("2024-01-15T10:00:00+08:00"), Operator::After, json!("2024-01-15")));
        assert!(!eval(json!("yesterday"), Operator::After, json!("2024-01-15")));
    }

    #[test]
    fn test_missing_field() {
        assert!(!ConditionEvaluator::evaluate(None, Operator::Equals, &json!("x"), None));
        assert!(ConditionEvaluator::evaluate(None, Operator::NotEquals, &json!("x"), None));
        assert!(ConditionEvaluator::evaluate(None, Operator::IsEmpty, &Value::Null, None));
        assert!(ConditionEvaluator::evaluate(Some(&json!([])), Operator::IsEmpty, &Value::Null, None));
        assert!(!ConditionEvaluator::evaluate(None, Operator::IsNotEmpty, &Value::Null, None));
    }
}
