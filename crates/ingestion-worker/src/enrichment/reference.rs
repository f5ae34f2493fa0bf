//! 参考数据：模型价格与提示词

use std::collections::BTreeMap;

use async_trait::async_trait;
use ingest_shared::error::Result;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// 模型价格
///
/// `tenant_id` 为空表示全局价格；`match_pattern` 是匹配上报模型名的正则。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub id: String,
    pub tenant_id: Option<String>,
    pub model_name: String,
    pub match_pattern: String,
    /// 用量键（input、output 等）到单价的映射
    pub prices: BTreeMap<String, f64>,
}

/// 提示词版本
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromptRecord {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub version: i32,
}

/// 参考数据查询，由外部系统维护，核心只读
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReferenceData: Send + Sync {
    /// 租户专属价格优先，其次全局价格
    async fn find_model_price(&self, tenant_id: &str, model: &str) -> Result<Option<ModelPrice>>;

    /// `version` 为空时取最新版本
    async fn find_prompt(
        &self,
        tenant_id: &str,
        name: &str,
        version: Option<i32>,
    ) -> Result<Option<PromptRecord>>;
}

/// 在候选价格中选出适用于该租户与模型的一条
pub fn select_price<'a>(
    candidates: impl IntoIterator<Item = &'a ModelPrice>,
    tenant_id: &str,
    model: &str,
) -> Option<&'a ModelPrice> {
    let mut best: Option<&ModelPrice> = None;

    for price in candidates {
        let rank = match price.tenant_id.as_deref() {
            Some(t) if t == tenant_id => 0,
            None => 1,
            Some(_) => continue,
        };

        let matched = match Regex::new(&price.match_pattern) {
            Ok(re) => re.is_match(model),
            Err(e) => {
                warn!(price_id = %price.id, pattern = %price.match_pattern, error = %e, "模型价格匹配规则无效，已跳过");
                false
            }
        };
        if !matched {
            continue;
        }

        let better = match best {
            None => true,
            Some(current) => {
                let current_rank = if current.tenant_id.is_some() { 0 } else { 1 };
                (rank, &price.id) < (current_rank, &current.id)
            }
        };
        if better {
            best = Some(price);
        }
    }

    best
}

/// 进程内参考数据
#[derive(Default)]
pub struct InMemoryReferenceData {
    prices: RwLock<Vec<ModelPrice>>,
    prompts: RwLock<Vec<PromptRecord>>,
}

impl InMemoryReferenceData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_price(&self, price: ModelPrice) {
        self.prices.write().push(price);
    }

    pub fn add_prompt(&self, prompt: PromptRecord) {
        self.prompts.write().push(prompt);
    }
}

#[async_trait]
impl ReferenceData for InMemoryReferenceData {
    async fn find_model_price(&self, tenant_id: &str, model: &str) -> Result<Option<ModelPrice>> {
        let prices = self.prices.read();
        Ok(select_price(prices.iter(), tenant_id, model).cloned())
    }

    async fn find_prompt(
        &self,
        tenant_id: &str,
        name: &str,
        version: Option<i32>,
    ) -> Result<Option<PromptRecord>> {
        let prompts = self.prompts.read();
        let candidates = prompts
            .iter()
            .filter(|p| p.tenant_id == tenant_id && p.name == name);
        Ok(match version {
            Some(v) => candidates.filter(|p| p.version == v).next().cloned(),
            None => candidates.max_by_key(|p| p.version).cloned(),
        })
    }
}
