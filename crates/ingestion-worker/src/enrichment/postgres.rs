//! 基于 PostgreSQL 的参考数据，可选 Redis 读缓存

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use ingest_shared::cache::{Cache, CacheKey};
use ingest_shared::error::{IngestError, Result};
use sqlx::PgPool;
use tracing::instrument;

use super::reference::{ModelPrice, PromptRecord, ReferenceData};

#[derive(sqlx::FromRow)]
struct ModelPriceRow {
    id: String,
    tenant_id: Option<String>,
    model_name: String,
    match_pattern: String,
    prices: serde_json::Value,
}

impl TryFrom<ModelPriceRow> for ModelPrice {
    type Error = IngestError;

    fn try_from(row: ModelPriceRow) -> Result<Self> {
        let prices: BTreeMap<String, f64> = serde_json::from_value(row.prices)?;
        Ok(Self {
            id: row.id,
            tenant_id: row.tenant_id,
            model_name: row.model_name,
            match_pattern: row.match_pattern,
            prices,
        })
    }
}

pub struct PgReferenceData {
    pool: PgPool,
    cache: Option<(Cache, Duration)>,
}

impl PgReferenceData {
    pub fn new(pool: PgPool) -> Self {
        Self { pool, cache: None }
    }

    /// 查询结果（含未命中）缓存 `ttl`
    pub fn with_cache(mut self, cache: Cache, ttl: Duration) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    async fn load_model_price(&self, tenant_id: &str, model: &str) -> Result<Option<ModelPrice>> {
        // 租户专属排在全局之前
        let row = sqlx::query_as::<_, ModelPriceRow>(
            r#"
            SELECT id, tenant_id, model_name, match_pattern, prices
            FROM model_prices
            WHERE (tenant_id = $1 OR tenant_id IS NULL)
              AND $2 ~ match_pattern
            ORDER BY tenant_id NULLS LAST, id
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ModelPrice::try_from).transpose()
    }

    async fn load_prompt(
        &self,
        tenant_id: &str,
        name: &str,
        version: Option<i32>,
    ) -> Result<Option<PromptRecord>> {
        let prompt = sqlx::query_as::<_, PromptRecord>(
            r#"
            SELECT id, tenant_id, name, version
            FROM prompts
            WHERE tenant_id = $1 AND name = $2 AND ($3::INT IS NULL OR version = $3)
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(name)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        Ok(prompt)
    }
}

#[async_trait]
impl ReferenceData for PgReferenceData {
    #[instrument(skip(self))]
    async fn find_model_price(&self, tenant_id: &str, model: &str) -> Result<Option<ModelPrice>> {
        match &self.cache {
            Some((cache, ttl)) => {
                cache
                    .get_or_load(&CacheKey::model_price(tenant_id, model), *ttl, || {
                        self.load_model_price(tenant_id, model)
                    })
                    .await
            }
            None => self.load_model_price(tenant_id, model).await,
        }
    }

    #[instrument(skip(self))]
    async fn find_prompt(
        &self,
        tenant_id: &str,
        name: &str,
        version: Option<i32>,
    ) -> Result<Option<PromptRecord>> {
        match &self.cache {
            // 0 表示最新版本
            Some((cache, ttl)) => {
                cache
                    .get_or_load(
                        &CacheKey::prompt(tenant_id, name, version.unwrap_or(0)),
                        *ttl,
                        || self.load_prompt(tenant_id, name, version),
                    )
                    .await
            }
            None => self.load_prompt(tenant_id, name, version).await,
        }
    }
}
