//! 评估数据访问
//!
//! 评估配置与模板由外部维护，这里只读；执行记录由本服务写入，
//! 状态转换一律是带前置状态的条件更新。

mod memory;
mod postgres;

pub use memory::InMemoryEvalStore;
pub use postgres::PgEvalRepository;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    EvalJobExecution, EvalTarget, EvalTemplate, ExecutionStatus, ExecutionUpdate,
    JobConfiguration,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobConfigurationRepository: Send + Sync {
    /// 租户下指定评估对象的全部启用配置
    async fn list_active(&self, tenant_id: &str, target: EvalTarget)
    -> Result<Vec<JobConfiguration>>;

    async fn get(&self, tenant_id: &str, config_id: &str) -> Result<Option<JobConfiguration>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    async fn get(&self, tenant_id: &str, template_id: &str) -> Result<Option<EvalTemplate>>;
}

/// 创建执行记录的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(EvalJobExecution),
    /// (config, entity) 已有非 FAILED 的执行记录
    Existing(EvalJobExecution),
}

impl CreateOutcome {
    pub fn execution(&self) -> &EvalJobExecution {
        match self {
            Self::Created(e) | Self::Existing(e) => e,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// 同一 (config, entity) 至多一条非 FAILED 记录
    async fn create_if_absent(&self, execution: &EvalJobExecution) -> Result<CreateOutcome>;

    async fn get(&self, tenant_id: &str, execution_id: &str) -> Result<Option<EvalJobExecution>>;

    /// 仅当当前状态为 `from` 且执行次数为 `expected_attempt` 时更新为 `to`，返回是否更新成功
    async fn transition(
        &self,
        tenant_id: &str,
        execution_id: &str,
        from: ExecutionStatus,
        expected_attempt: u32,
        to: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<bool>;
}
