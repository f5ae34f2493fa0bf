//! 分析库客户端
//!
//! 分析库只追加不更新：同一实体的每次持久化都写入一行新记录，
//! 以 `source_seq` 为版本列，查询时由 ReplacingMergeTree 折叠为最新行。

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use clickhouse::{Client, Row};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::config::ClickHouseConfig;
use crate::error::{IngestError, Result};
use crate::events::EntityType;

/// 分析库行
#[derive(Debug, Clone, PartialEq, Row, Serialize, Deserialize)]
pub struct AnalyticsRecord {
    pub tenant_id: String,
    pub id: String,
    pub entity_type: String,
    /// 没有所属 trace 时为空串
    pub trace_id: String,
    pub name: String,
    /// 完整实体负载（JSON）
    pub payload: String,
    /// 实体最后事件时间，毫秒
    pub event_ts: i64,
    /// 版本列：合并时看到的最大摄取序列号
    pub source_seq: u64,
    pub inserted_at: i64,
}

impl AnalyticsRecord {
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// 批量写入
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AnalyticsSink: Send + Sync {
    /// 一次批量插入，要么全部写入要么返回错误
    async fn insert_batch(&self, table: &str, rows: &[AnalyticsRecord]) -> Result<()>;
}

/// 按实体读取最新行
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EntityReader: Send + Sync {
    async fn latest(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<AnalyticsRecord>>;
}

// ---------------------------------------------------------------------------
// ClickHouse 实现
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ClickHouseAnalytics {
    client: Client,
}

impl ClickHouseAnalytics {
    pub fn new(config: &ClickHouseConfig) -> Self {
        let client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_user(&config.user)
            .with_password(&config.password);

        info!(url = %config.url, database = %config.database, "ClickHouse 客户端已创建");
        Self { client }
    }

    pub async fn health_check(&self) -> Result<()> {
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }
}

#[async_trait]
impl AnalyticsSink for ClickHouseAnalytics {
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_batch(&self, table: &str, rows: &[AnalyticsRecord]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let mut insert = self.client.insert(table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await?;

        debug!(
            table,
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "分析库批量写入完成"
        );
        Ok(())
    }
}

#[async_trait]
impl EntityReader for ClickHouseAnalytics {
    async fn latest(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<AnalyticsRecord>> {
        let sql = format!(
            "SELECT ?fields FROM {} WHERE tenant_id = ? AND id = ? \
             ORDER BY source_seq DESC, inserted_at DESC LIMIT 1",
            entity_type.table()
        );

        let row = self
            .client
            .query(&sql)
            .bind(tenant_id)
            .bind(entity_id)
            .fetch_optional::<AnalyticsRecord>()
            .await?;
        Ok(row)
    }
}

// ---------------------------------------------------------------------------
// 内存实现
// ---------------------------------------------------------------------------

/// 进程内分析库，可注入批量写入失败
#[derive(Default)]
pub struct InMemoryAnalytics {
    tables: Mutex<HashMap<String, Vec<AnalyticsRecord>>>,
    failures_remaining: Mutex<u32>,
    insert_calls: Mutex<u32>,
}

impl InMemoryAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 接下来的 n 次批量写入失败
    pub fn fail_next_inserts(&self, n: u32) {
        *self.failures_remaining.lock() = n;
    }

    pub fn rows(&self, table: &str) -> Vec<AnalyticsRecord> {
        self.tables.lock().get(table).cloned().unwrap_or_default()
    }

    /// 某实体写入的行数
    pub fn row_count(&self, table: &str, tenant_id: &str, id: &str) -> usize {
        self.tables
            .lock()
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.tenant_id == tenant_id && r.id == id)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn insert_calls(&self) -> u32 {
        *self.insert_calls.lock()
    }
}

#[async_trait]
impl AnalyticsSink for InMemoryAnalytics {
    async fn insert_batch(&self, table: &str, rows: &[AnalyticsRecord]) -> Result<()> {
        *self.insert_calls.lock() += 1;
        {
            let mut remaining = self.failures_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestError::transient("clickhouse", "注入的写入失败"));
            }
        }

        let now = Utc::now().timestamp_millis();
        let mut tables = self.tables.lock();
        let target = tables.entry(table.to_string()).or_default();
        target.extend(rows.iter().cloned().map(|mut r| {
            if r.inserted_at == 0 {
                r.inserted_at = now;
            }
            r
        }));
        Ok(())
    }
}

#[async_trait]
impl EntityReader for InMemoryAnalytics {
    async fn latest(
        &self,
        tenant_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<AnalyticsRecord>> {
        let tables = self.tables.lock();
        Ok(tables.get(entity_type.table()).and_then(|rows| {
            rows.iter()
                .filter(|r| r.tenant_id == tenant_id && r.id == entity_id)
                .max_by_key(|r| (r.source_seq, r.inserted_at))
                .cloned()
        }))
    }
}
