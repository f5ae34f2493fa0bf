use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use super::{CreateOutcome, ExecutionRepository, JobConfigurationRepository, TemplateRepository};
use crate::error::Result;
use crate::models::{
    EvalJobExecution, EvalTarget, EvalTemplate, ExecutionStatus, ExecutionUpdate,
    JobConfiguration,
};

/// 进程内评估存储，同时实现三个仓储接口
#[derive(Default)]
pub struct InMemoryEvalStore {
    configs: RwLock<Vec<JobConfiguration>>,
    templates: RwLock<Vec<EvalTemplate>>,
    executions: RwLock<HashMap<String, EvalJobExecution>>,
}

impl InMemoryEvalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_config(&self, config: JobConfiguration) {
        self.configs.write().push(config);
    }

    pub fn add_template(&self, template: EvalTemplate) {
        self.templates.write().push(template);
    }

    /// 按创建时间排序的全部执行记录
    pub fn executions(&self) -> Vec<EvalJobExecution> {
        let mut all: Vec<_> = self.executions.read().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }

    pub fn executions_for(&self, config_id: &str, entity_id: &str) -> Vec<EvalJobExecution> {
        self.executions()
            .into_iter()
            .filter(|e| e.config_id == config_id && e.entity_id == entity_id)
            .collect()
    }
}

#[async_trait]
impl JobConfigurationRepository for InMemoryEvalStore {
    async fn list_active(
        &self,
        tenant_id: &str,
        target: EvalTarget,
    ) -> Result<Vec<JobConfiguration>> {
        Ok(self
            .configs
            .read()
            .iter()
            .filter(|c| c.tenant_id == tenant_id && c.target == target && c.is_active())
            .cloned()
            .collect())
    }

    async fn get(&self, tenant_id: &str, config_id: &str) -> Result<Option<JobConfiguration>> {
        Ok(self
            .configs
            .read()
            .iter()
            .find(|c| c.tenant_id == tenant_id && c.id == config_id)
            .cloned())
    }
}

#[async_trait]
impl TemplateRepository for InMemoryEvalStore {
    async fn get(&self, tenant_id: &str, template_id: &str) -> Result<Option<EvalTemplate>> {
        Ok(self
            .templates
            .read()
            .iter()
            .find(|t| t.tenant_id == tenant_id && t.id == template_id)
            .cloned())
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryEvalStore {
    async fn create_if_absent(&self, execution: &EvalJobExecution) -> Result<CreateOutcome> {
        let mut executions = self.executions.write();

        let existing = executions.values().find(|e| {
            e.tenant_id == execution.tenant_id
                && e.config_id == execution.config_id
                && e.entity_id == execution.entity_id
                && e.status != ExecutionStatus::Failed
        });
        if let Some(existing) = existing {
            return Ok(CreateOutcome::Existing(existing.clone()));
        }

        executions.insert(execution.id.clone(), execution.clone());
        Ok(CreateOutcome::Created(execution.clone()))
    }

    async fn get(&self, tenant_id: &str, execution_id: &str) -> Result<Option<EvalJobExecution>> {
        Ok(self
            .executions
            .read()
            .get(execution_id)
            .filter(|e| e.tenant_id == tenant_id)
            .cloned())
    }

    async fn transition(
        &self,
        tenant_id: &str,
        execution_id: &str,
        from: ExecutionStatus,
        expected_attempt: u32,
        to: ExecutionStatus,
        update: ExecutionUpdate,
    ) -> Result<bool> {
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(execution_id).filter(|e| {
            e.tenant_id == tenant_id && e.status == from && e.attempt == expected_attempt
        })
        else {
            return Ok(false);
        };

        execution.status = to;
        if let Some(attempt) = update.attempt {
            execution.attempt = attempt;
        }
        if update.score_id.is_some() {
            execution.score_id = update.score_id;
        }
        if update.error.is_some() {
            execution.error = update.error;
        }
        if update.raw_output.is_some() {
            execution.raw_output = update.raw_output;
        }
        if update.runner.is_some() {
            execution.runner = update.runner;
        }
        execution.updated_at = Utc::now();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConfigStatus;
    use ingest_shared::events::{EntityChangedEvent, EntityType};
    use ingest_shared::test_utils::ts;
    use serde_json::Value;

    fn config(id: &str, status: ConfigStatus) -> JobConfiguration {
        JobConfiguration {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            target: EvalTarget::Trace,
            filter: None,
            template_id: "tpl".to_string(),
            variable_mapping: vec![],
            sampling: 1.0,
            delay_secs: 0,
            score_name: "quality".to_string(),
            status,
        }
    }

    fn event(entity_id: &str) -> EntityChangedEvent {
        EntityChangedEvent {
            tenant_id: "t1".to_string(),
            entity_type: EntityType::Trace,
            entity_id: entity_id.to_string(),
            trace_id: Some(entity_id.to_string()),
            name: None,
            tags: vec![],
            metadata: Value::Null,
            environment: None,
            user_id: None,
            session_id: None,
            release: None,
            version: None,
            level: None,
            max_seq: 1,
            changed_at: ts(0),
        }
    }

    #[tokio::test]
    async fn test_list_active_filters_status_and_target() {
        let store = InMemoryEvalStore::new();
        store.add_config(config("c1", ConfigStatus::Active));
        store.add_config(config("c2", ConfigStatus::Inactive));

        let active = store.list_active("t1", EvalTarget::Trace).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "c1");
        assert!(store.list_active("t1", EvalTarget::Observation).await.unwrap().is_empty());
        assert!(store.list_active("t2", EvalTarget::Trace).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_is_unique_per_config_and_entity() {
        let store = InMemoryEvalStore::new();
        let cfg = config("c1", ConfigStatus::Active);

        let first = EvalJobExecution::matched(&cfg, &event("tr-1"));
        assert!(matches!(
            store.create_if_absent(&first).await.unwrap(),
            CreateOutcome::Created(_)
        ));

        let second = EvalJobExecution::matched(&cfg, &event("tr-1"));
        let outcome = store.create_if_absent(&second).await.unwrap();
        assert!(matches!(&outcome, CreateOutcome::Existing(e) if e.id == first.id));

        // FAILED 之后允许重新创建
        store
            .transition(
                "t1",
                &first.id,
                ExecutionStatus::Matched,
                0,
                ExecutionStatus::Failed,
                ExecutionUpdate::default(),
            )
            .await
            .unwrap();
        assert!(matches!(
            store.create_if_absent(&second).await.unwrap(),
            CreateOutcome::Created(_)
        ));
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryEvalStore::new();
        let execution =
            EvalJobExecution::matched(&config("c1", ConfigStatus::Active), &event("tr-1"));
        store.create_if_absent(&execution).await.unwrap();

        let moved = store
            .transition(
                "t1",
                &execution.id,
                ExecutionStatus::Matched,
                0,
                ExecutionStatus::ExecutionCreated,
                ExecutionUpdate::default(),
            )
            .await
            .unwrap();
        assert!(moved);

        let stale = store
            .transition(
                "t1",
                &execution.id,
                ExecutionStatus::Matched,
                0,
                ExecutionStatus::Failed,
                ExecutionUpdate {
                    error: Some("late".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!stale);

        let current = ExecutionRepository::get(&store, "t1", &execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.status, ExecutionStatus::ExecutionCreated);
        assert!(current.error.is_none());
        assert!(ExecutionRepository::get(&store, "t2", &execution.id).await.unwrap().is_none());
    }
}
