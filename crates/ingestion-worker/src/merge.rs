//! 合并引擎
//!
//! 把同一实体的多条部分更新折叠成一个规范实体。折叠前按
//! `(timestamp, seq, event_id)` 全序排序并按事件 ID 去重，因此结果只取决于
//! 事件集合本身，与到达顺序、分片和重投无关。

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use ingest_shared::events::{EntityChangedEvent, EntityType, RawEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// 字段合并策略
// ---------------------------------------------------------------------------

/// 单个字段的合并策略，空值在任何策略下都不会覆盖已有值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// 后到（排序靠后）的非空值生效
    LastWins,
    /// 第一个非空值生效，如开始时间
    FirstWins,
    /// 数值累加；对象按数值子键分别累加
    Sum,
    /// 数组取并集并排序
    Union,
    /// 对象逐键合并，子键各自后到非空值生效
    DeepMerge,
}

/// 实体类型的字段策略表，未列出的字段按 `LastWins`
#[derive(Debug, Clone)]
pub struct MergeSchema {
    policies: HashMap<&'static str, FieldPolicy>,
}

impl MergeSchema {
    pub fn for_entity(entity_type: EntityType) -> Self {
        use FieldPolicy::*;

        let policies: &[(&'static str, FieldPolicy)] = match entity_type {
            EntityType::Trace => &[
                ("tags", Union),
                ("metadata", DeepMerge),
                ("timestamp", FirstWins),
            ],
            EntityType::Observation => &[
                ("startTime", FirstWins),
                ("metadata", DeepMerge),
                ("modelParameters", DeepMerge),
                ("usageDetails", Sum),
                ("costDetails", Sum),
            ],
            EntityType::Score => &[("metadata", DeepMerge)],
        };

        Self {
            policies: policies.iter().copied().collect(),
        }
    }

    /// 覆盖某个字段的策略，例如把用量改为覆盖型
    pub fn with_policy(mut self, field: &'static str, policy: FieldPolicy) -> Self {
        self.policies.insert(field, policy);
        self
    }

    pub fn policy(&self, field: &str) -> FieldPolicy {
        self.policies
            .get(field)
            .copied()
            .unwrap_or(FieldPolicy::LastWins)
    }
}

// ---------------------------------------------------------------------------
// MergedEntity
// ---------------------------------------------------------------------------

/// 合并后的规范实体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedEntity {
    pub tenant_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub fields: Map<String, Value>,
    pub first_event_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    /// 参与合并的最大摄取序列号，作为两个存储的版本号
    pub max_seq: u64,
    pub event_count: usize,
    pub source_blob_keys: Vec<String>,
}

impl MergedEntity {
    fn str_field(&self, key: &str) -> Option<String> {
        self.fields.get(key).and_then(Value::as_str).map(str::to_string)
    }

    /// 所属 trace，trace 本身返回自己的 ID
    pub fn trace_id(&self) -> Option<String> {
        match self.entity_type {
            EntityType::Trace => Some(self.entity_id.clone()),
            _ => self.str_field("traceId"),
        }
    }

    pub fn name(&self) -> Option<String> {
        self.str_field("name")
    }

    pub fn tags(&self) -> Vec<String> {
        self.fields
            .get("tags")
            .and_then(Value::as_array)
            .map(|tags| {
                tags.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 写入分析库的完整负载
    pub fn payload(&self) -> Value {
        let mut payload = self.fields.clone();
        payload.insert("id".to_string(), json!(self.entity_id));
        payload.insert("firstEventAt".to_string(), json!(self.first_event_at));
        payload.insert("lastEventAt".to_string(), json!(self.last_event_at));
        payload.insert("eventCount".to_string(), json!(self.event_count));
        Value::Object(payload)
    }

    /// 构造实体变更信号
    pub fn changed_event(&self) -> EntityChangedEvent {
        EntityChangedEvent {
            tenant_id: self.tenant_id.clone(),
            entity_type: self.entity_type,
            entity_id: self.entity_id.clone(),
            trace_id: self.trace_id(),
            name: self.name(),
            tags: self.tags(),
            metadata: self.fields.get("metadata").cloned().unwrap_or(Value::Null),
            environment: self.str_field("environment"),
            user_id: self.str_field("userId"),
            session_id: self.str_field("sessionId"),
            release: self.str_field("release"),
            version: self.str_field("version"),
            level: self.str_field("level"),
            max_seq: self.max_seq,
            changed_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// MergeEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MergeEngine {
    schemas: HashMap<EntityType, MergeSchema>,
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self {
            schemas: EntityType::ALL
                .into_iter()
                .map(|t| (t, MergeSchema::for_entity(t)))
                .collect(),
        }
    }
}

impl MergeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, entity_type: EntityType, schema: MergeSchema) -> Self {
        self.schemas.insert(entity_type, schema);
        self
    }

    /// 合并任意顺序的事件，每个不同的 `(tenant, entityType, entityId)` 输出一个实体
    pub fn merge(&self, events: Vec<RawEvent>, source_blob_keys: &[String]) -> Vec<MergedEntity> {
        let mut groups: BTreeMap<(String, EntityType, String), Vec<RawEvent>> = BTreeMap::new();
        for event in events {
            groups
                .entry((
                    event.tenant_id.clone(),
                    event.entity_type,
                    event.entity_id.clone(),
                ))
                .or_default()
                .push(event);
        }

        groups
            .into_values()
            .filter_map(|group| self.merge_entity(group, source_blob_keys))
            .collect()
    }

    /// 合并同一实体的事件，事件为空时返回 None
    pub fn merge_entity(
        &self,
        mut events: Vec<RawEvent>,
        source_blob_keys: &[String],
    ) -> Option<MergedEntity> {
        events.sort_by(|a, b| {
            (a.timestamp, a.seq, &a.id).cmp(&(b.timestamp, b.seq, &b.id))
        });

        // 同一事件被重复上报时只保留排序最靠前的一份
        let mut seen = HashSet::new();
        events.retain(|e| seen.insert(e.id.clone()));

        let first = events.first()?;
        let last = events.last()?;
        let schema = self.schemas.get(&first.entity_type)?;

        let mut merged = MergedEntity {
            tenant_id: first.tenant_id.clone(),
            entity_type: first.entity_type,
            entity_id: first.entity_id.clone(),
            fields: Map::new(),
            first_event_at: first.timestamp,
            last_event_at: last.timestamp,
            max_seq: events.iter().map(|e| e.seq).max().unwrap_or_default(),
            event_count: events.len(),
            source_blob_keys: {
                let mut keys = source_blob_keys.to_vec();
                keys.sort();
                keys.dedup();
                keys
            },
        };

        for event in &events {
            for (key, value) in &event.fields {
                if value.is_null() {
                    continue;
                }
                apply_field(&mut merged.fields, key, value, schema.policy(key));
            }
        }

        Some(merged)
    }
}

fn apply_field(fields: &mut Map<String, Value>, key: &str, value: &Value, policy: FieldPolicy) {
    match (policy, fields.get_mut(key)) {
        (_, None) => {
            let mut initial = value.clone();
            if policy == FieldPolicy::Union {
                normalize_union(&mut initial);
            }
            if policy == FieldPolicy::DeepMerge {
                strip_nulls(&mut initial);
            }
            fields.insert(key.to_string(), initial);
        }
        (FieldPolicy::FirstWins, Some(_)) => {}
        (FieldPolicy::LastWins, Some(existing)) => *existing = value.clone(),
        (FieldPolicy::Sum, Some(existing)) => sum_into(existing, value),
        (FieldPolicy::Union, Some(existing)) => union_into(existing, value),
        (FieldPolicy::DeepMerge, Some(existing)) => deep_merge_into(existing, value),
    }
}

/// 数值相加；两边都是对象时逐键相加；类型不兼容时后值覆盖
fn sum_into(existing: &mut Value, incoming: &Value) {
    match (&mut *existing, incoming) {
        (Value::Number(a), Value::Number(b)) => {
            *existing = add_numbers(a, b);
        }
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                if v.is_null() {
                    continue;
                }
                match a.get_mut(k) {
                    Some(current) => sum_into(current, v),
                    None => {
                        a.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        _ => *existing = incoming.clone(),
    }
}

/// 整数相加保持整数，溢出或含小数时按浮点
fn add_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Value {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64())
        && let Some(sum) = x.checked_add(y)
    {
        return json!(sum);
    }
    json!(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0))
}

fn union_into(existing: &mut Value, incoming: &Value) {
    match (&mut *existing, incoming) {
        (Value::Array(a), Value::Array(b)) => {
            a.extend(b.iter().filter(|v| !v.is_null()).cloned());
            normalize_union(existing);
        }
        _ => {
            *existing = incoming.clone();
            normalize_union(existing);
        }
    }
}

/// 排序去重，字符串按字面序，其余按 JSON 文本
fn normalize_union(value: &mut Value) {
    if let Value::Array(items) = value {
        items.retain(|v| !v.is_null());
        items.sort_by_key(sort_key);
        items.dedup();
    }
}

fn sort_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn deep_merge_into(existing: &mut Value, incoming: &Value) {
    match (&mut *existing, incoming) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                if v.is_null() {
                    continue;
                }
                let nested = v.is_object() && a.get(k).is_some_and(Value::is_object);
                if nested {
                    if let Some(current) = a.get_mut(k) {
                        deep_merge_into(current, v);
                    }
                } else {
                    let mut v = v.clone();
                    strip_nulls(&mut v);
                    a.insert(k.clone(), v);
                }
            }
        }
        _ => {
            *existing = incoming.clone();
            strip_nulls(existing);
        }
    }
}

fn strip_nulls(value: &mut Value) {
    if let Value::Object(map) = value {
        map.retain(|_, v| !v.is_null());
        map.values_mut().for_each(strip_nulls);
    }
}
