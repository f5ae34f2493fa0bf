//! 关系库元数据投影
//!
//! 每个实体类型一张表，主键 `(tenant_id, id)`。表之间没有外键约束，
//! observation 可以先于所属 trace 落库。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_shared::error::{IngestError, Result};
use ingest_shared::events::EntityType;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::merge::MergedEntity;

/// 写入 `refs` 列的引用字段
const REFERENCE_FIELDS: &[&str] = &[
    "sessionId",
    "userId",
    "promptId",
    "internalModelId",
    "observationId",
    "configId",
];

/// 元数据记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub tenant_id: String,
    pub id: String,
    pub entity_type: EntityType,
    pub trace_id: Option<String>,
    pub parent_id: Option<String>,
    pub name: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// 指向其他实体或参考数据的软引用
    pub refs: Value,
    pub max_seq: i64,
    pub event_count: i32,
}

impl MetadataRecord {
    pub fn from_entity(entity: &MergedEntity) -> Self {
        let time_field = |key: &str| {
            entity
                .fields
                .get(key)
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
        };

        let start_field = match entity.entity_type {
            EntityType::Observation => "startTime",
            EntityType::Trace | EntityType::Score => "timestamp",
        };

        let refs: Map<String, Value> = REFERENCE_FIELDS
            .iter()
            .filter_map(|key| {
                entity
                    .fields
                    .get(*key)
                    .filter(|v| !v.is_null())
                    .map(|v| (key.to_string(), v.clone()))
            })
            .collect();

        Self {
            tenant_id: entity.tenant_id.clone(),
            id: entity.entity_id.clone(),
            entity_type: entity.entity_type,
            trace_id: entity.trace_id(),
            parent_id: entity
                .fields
                .get("parentObservationId")
                .and_then(Value::as_str)
                .map(str::to_string),
            name: entity.name(),
            start_time: time_field(start_field).unwrap_or(entity.first_event_at),
            end_time: time_field("endTime"),
            refs: Value::Object(refs),
            max_seq: i64::try_from(entity.max_seq).unwrap_or(i64::MAX),
            event_count: i32::try_from(entity.event_count).unwrap_or(i32::MAX),
        }
    }
}

/// 元数据存储
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// 批量 upsert，重复写入同一版本是幂等的，旧版本不会覆盖新版本
    async fn upsert_batch(&self, records: &[MetadataRecord]) -> Result<()>;

    async fn get(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<MetadataRecord>>;
}

// ---------------------------------------------------------------------------
// PostgreSQL 实现
// ---------------------------------------------------------------------------

#[derive(sqlx::FromRow)]
struct MetadataRow {
    tenant_id: String,
    id: String,
    trace_id: Option<String>,
    parent_id: Option<String>,
    name: Option<String>,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    refs: Value,
    max_seq: i64,
    event_count: i32,
}

pub struct PgMetadataStore {
    pool: PgPool,
}

impl PgMetadataStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetadataStore for PgMetadataStore {
    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn upsert_batch(&self, records: &[MetadataRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for record in records {
            let table = record.entity_type.table();
            let sql = format!(
                r#"
                INSERT INTO {table} (
                    tenant_id, id, trace_id, parent_id, name, start_time, end_time,
                    refs, max_seq, event_count, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NOW(), NOW())
                ON CONFLICT (tenant_id, id) DO UPDATE SET
                    trace_id = EXCLUDED.trace_id,
                    parent_id = EXCLUDED.parent_id,
                    name = EXCLUDED.name,
                    start_time = EXCLUDED.start_time,
                    end_time = EXCLUDED.end_time,
                    refs = EXCLUDED.refs,
                    max_seq = EXCLUDED.max_seq,
                    event_count = EXCLUDED.event_count,
                    updated_at = NOW()
                WHERE {table}.max_seq <= EXCLUDED.max_seq
                "#
            );

            sqlx::query(&sql)
                .bind(&record.tenant_id)
                .bind(&record.id)
                .bind(&record.trace_id)
                .bind(&record.parent_id)
                .bind(&record.name)
                .bind(record.start_time)
                .bind(record.end_time)
                .bind(&record.refs)
                .bind(record.max_seq)
                .bind(record.event_count)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        debug!(records = records.len(), "元数据批量 upsert 完成");
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<MetadataRecord>> {
        let sql = format!(
            r#"
            SELECT tenant_id, id, trace_id, parent_id, name, start_time, end_time,
                   refs, max_seq, event_count
            FROM {}
            WHERE tenant_id = $1 AND id = $2
            "#,
            entity_type.table()
        );

        let row = sqlx::query_as::<_, MetadataRow>(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| MetadataRecord {
            tenant_id: r.tenant_id,
            id: r.id,
            entity_type,
            trace_id: r.trace_id,
            parent_id: r.parent_id,
            name: r.name,
            start_time: r.start_time,
            end_time: r.end_time,
            refs: r.refs,
            max_seq: r.max_seq,
            event_count: r.event_count,
        }))
    }
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

type RecordKey = (EntityType, String, String);

/// 进程内元数据存储，可注入 upsert 失败
#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: Mutex<HashMap<RecordKey, MetadataRecord>>,
    failures_remaining: Mutex<u32>,
    upsert_calls: Mutex<u32>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_upserts(&self, n: u32) {
        *self.failures_remaining.lock() = n;
    }

    pub fn upsert_calls(&self) -> u32 {
        *self.upsert_calls.lock()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn upsert_batch(&self, records: &[MetadataRecord]) -> Result<()> {
        *self.upsert_calls.lock() += 1;
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestError::transient("postgres", "注入的 upsert 失败"));
            }
        }

        let mut stored = self.records.lock();
        for record in records {
            let key = (record.entity_type, record.tenant_id.clone(), record.id.clone());
            let newer = stored
                .get(&key)
                .is_none_or(|existing| existing.max_seq <= record.max_seq);
            if newer {
                stored.insert(key, record.clone());
            }
        }
        Ok(())
    }

    async fn get(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<MetadataRecord>> {
        Ok(self
            .records
            .lock()
            .get(&(entity_type, tenant_id.to_string(), id.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::MergeEngine;
    use ingest_shared::test_utils::{EventBuilder, ts};
    use serde_json::json;

    fn observation(seq: u64) -> MergedEntity {
        MergeEngine::new()
            .merge_entity(
                vec![
                    EventBuilder::observation("obs-1")
                        .id(&format!("e{seq}"))
                        .at(100)
                        .field("traceId", json!("tr-1"))
                        .field("parentObservationId", json!("obs-0"))
                        .field("name", json!("llm-call"))
                        .field("startTime", json!("2024-05-01T08:00:00Z"))
                        .field("promptId", json!("prompt-1"))
                        .field("userId", Value::Null)
                        .raw("t1", seq),
                ],
                &[],
            )
            .unwrap()
    }

    #[test]
    fn test_record_projection() {
        let record = MetadataRecord::from_entity(&observation(4));

        assert_eq!(record.id, "obs-1");
        assert_eq!(record.trace_id.as_deref(), Some("tr-1"));
        assert_eq!(record.parent_id.as_deref(), Some("obs-0"));
        assert_eq!(record.name.as_deref(), Some("llm-call"));
        assert_eq!(record.start_time.to_rfc3339(), "2024-05-01T08:00:00+00:00");
        assert_eq!(record.end_time, None);
        assert_eq!(record.refs, json!({"promptId": "prompt-1"}));
        assert_eq!(record.max_seq, 4);
        assert_eq!(record.event_count, 1);
    }

    #[test]
    fn test_start_time_falls_back_to_first_event() {
        let entity = MergeEngine::new()
            .merge_entity(vec![EventBuilder::trace("tr-1").at(50).raw("t1", 1)], &[])
            .unwrap();
        let record = MetadataRecord::from_entity(&entity);
        assert_eq!(record.start_time, ts(50));
        assert_eq!(record.trace_id.as_deref(), Some("tr-1"));
    }

    #[tokio::test]
    async fn test_in_memory_upsert_keeps_newest_version() {
        let store = InMemoryMetadataStore::new();
        let newer = MetadataRecord::from_entity(&observation(9));
        let older = MetadataRecord::from_entity(&observation(3));

        store.upsert_batch(&[newer.clone()]).await.unwrap();
        store.upsert_batch(&[older]).await.unwrap();
        // 重复写入同一版本
        store.upsert_batch(&[newer.clone()]).await.unwrap();

        assert_eq!(store.len(), 1);
        let stored = store
            .get("t1", EntityType::Observation, "obs-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.max_seq, 9);
        assert_eq!(store.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn test_injected_failure_writes_nothing() {
        let store = InMemoryMetadataStore::new();
        store.fail_next_upserts(1);

        let err = store
            .upsert_batch(&[MetadataRecord::from_entity(&observation(1))])
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(store.is_empty());
    }
}
