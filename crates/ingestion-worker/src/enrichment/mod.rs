//! 实体富化
//!
//! 合并之后、持久化之前补充派生字段：按模型价格计算 observation 成本，
//! 把提示词名称与版本解析为提示词 ID。查不到参考数据时不阻塞写入，
//! 只在实体上记录校验标记。

pub mod postgres;
pub mod reference;

use std::sync::Arc;

use ingest_shared::error::Result;
use ingest_shared::events::EntityType;
use ingest_shared::observability::metrics;
use ingest_shared::retry::{RetryPolicy, retry_transient};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::merge::MergedEntity;

pub use postgres::PgReferenceData;
pub use reference::{InMemoryReferenceData, ModelPrice, PromptRecord, ReferenceData, select_price};

/// 富化时发现的数据缺口
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationFlag {
    MissingModelPrice,
    UnknownPrompt,
}

impl ValidationFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingModelPrice => "missing_model_price",
            Self::UnknownPrompt => "unknown_prompt",
        }
    }
}

pub struct Enricher {
    reference: Arc<dyn ReferenceData>,
    retry: RetryPolicy,
}

impl Enricher {
    pub fn new(reference: Arc<dyn ReferenceData>) -> Self {
        Self {
            reference,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// 富化单个实体，返回发现的校验标记
    ///
    /// 参考数据查询失败（重试后）时返回错误，由作业整体重投。
    pub async fn enrich(&self, entity: &mut MergedEntity) -> Result<Vec<ValidationFlag>> {
        let mut flags = Vec::new();

        if entity.entity_type == EntityType::Observation {
            self.apply_cost(entity, &mut flags).await?;
            self.resolve_prompt(entity, &mut flags).await?;
        }

        if !flags.is_empty() {
            flags.sort();
            flags.dedup();
            for flag in &flags {
                metrics::record_validation_gap(flag.as_str());
            }
            warn!(
                tenant_id = %entity.tenant_id,
                entity_id = %entity.entity_id,
                flags = ?flags,
                "实体富化存在数据缺口"
            );
            entity.fields.insert(
                "validationFlags".to_string(),
                Value::Array(flags.iter().map(|f| json!(f.as_str())).collect()),
            );
        }

        Ok(flags)
    }

    async fn apply_cost(
        &self,
        entity: &mut MergedEntity,
        flags: &mut Vec<ValidationFlag>,
    ) -> Result<()> {
        let Some(model) = entity
            .fields
            .get("model")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(());
        };

        // 客户端上报的成本优先
        if let Some(Value::Object(costs)) = entity.fields.get("costDetails") {
            let total = total_cost(costs);
            entity.fields.insert("totalCost".to_string(), json!(total));
            return Ok(());
        }

        let reference = self.reference.clone();
        let tenant_id = entity.tenant_id.clone();
        let price = retry_transient(&self.retry, "find_model_price", || {
            let reference = reference.clone();
            let tenant_id = tenant_id.clone();
            let model = model.clone();
            async move { reference.find_model_price(&tenant_id, &model).await }
        })
        .await?;

        let Some(price) = price else {
            flags.push(ValidationFlag::MissingModelPrice);
            return Ok(());
        };

        let usage = match entity.fields.get("usageDetails") {
            Some(Value::Object(usage)) => usage.clone(),
            _ => Map::new(),
        };

        let costs = compute_costs(&usage, &price);
        let total = total_cost(&costs);
        debug!(entity_id = %entity.entity_id, model = %model, total, "已按模型价格计算成本");

        entity.fields.insert("costDetails".to_string(), Value::Object(costs));
        entity.fields.insert("totalCost".to_string(), json!(total));
        entity
            .fields
            .insert("internalModelId".to_string(), json!(price.id));
        Ok(())
    }

    async fn resolve_prompt(
        &self,
        entity: &mut MergedEntity,
        flags: &mut Vec<ValidationFlag>,
    ) -> Result<()> {
        let Some(name) = entity
            .fields
            .get("promptName")
            .and_then(Value::as_str)
            .map(str::to_string)
        else {
            return Ok(());
        };
        let version = entity
            .fields
            .get("promptVersion")
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok());

        let reference = self.reference.clone();
        let tenant_id = entity.tenant_id.clone();
        let prompt = retry_transient(&self.retry, "find_prompt", || {
            let reference = reference.clone();
            let tenant_id = tenant_id.clone();
            let name = name.clone();
            async move { reference.find_prompt(&tenant_id, &name, version).await }
        })
        .await?;

        match prompt {
            Some(prompt) => {
                entity.fields.insert("promptId".to_string(), json!(prompt.id));
            }
            None => flags.push(ValidationFlag::UnknownPrompt),
        }
        Ok(())
    }
}

/// 用量乘以单价，只计算价格表里存在的用量键
fn compute_costs(usage: &Map<String, Value>, price: &ModelPrice) -> Map<String, Value> {
    usage
        .iter()
        .filter_map(|(key, amount)| {
            let amount = amount.as_f64()?;
            let unit = price.prices.get(key)?;
            Some((key.clone(), json!(amount * unit)))
        })
        .collect()
}

/// 有 `total` 键时直接使用，否则累加各分项
fn total_cost(costs: &Map<String, Value>) -> f64 {
    if let Some(total) = costs.get("total").and_then(Value::as_f64) {
        return total;
    }
    costs.values().filter_map(Value::as_f64).sum()
}
