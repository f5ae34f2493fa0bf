//! 评估全链路测试套件
//!
//! 测试从 trace 摄取到评估规则匹配、模型打分、评分写回的完整链路。

use crate::setup::{TENANT, TestEnvironment};
use eval_worker::ExecutionStatus;
use eval_worker::models::SCORE_SOURCE_EVAL;
use ingest_shared::dlq::DeadLetterMessage;
use ingest_shared::kafka::topics;
use ingest_shared::test_utils::{EventBuilder, batch};
use ingest_shared::worker::JobOutcome;
use serde_json::json;

fn chat_trace(id: &str) -> EventBuilder {
    EventBuilder::trace(id)
        .field("name", json!("chat-completion"))
        .field("input", json!("How do I rotate an API key?"))
        .field("output", json!("Open project settings and click 'Rotate'."))
        .field("environment", json!("production"))
}

#[cfg(test)]
mod scoring_tests {
    use super::*;

    /// 匹配规则的 trace 最终得到一条评分
    #[tokio::test]
    async fn test_chat_completion_trace_is_scored() {
        let env = TestEnvironment::setup();
        env.intake
            .ingest(batch(TENANT, vec![chat_trace("tr-1")]))
            .await
            .unwrap();

        assert_eq!(env.drain_ingestion().await, vec![JobOutcome::Acked]);
        assert_eq!(env.forward_signals().await, 1);
        assert_eq!(env.drain_evaluation().await, vec![JobOutcome::Acked]);

        let executions = env.eval_store.executions_for("cfg-quality", "tr-1");
        assert_eq!(executions.len(), 1);
        let execution = &executions[0];
        assert_eq!(execution.status, ExecutionStatus::Scored);
        assert_eq!(execution.attempt, 1);
        assert_eq!(execution.score_id.as_deref(), Some(execution.id.as_str()));

        let scores = env.analytics.rows("scores");
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].trace_id, "tr-1");
        let score = scores[0].payload_json().unwrap();
        assert_eq!(score["name"], "answer-quality");
        assert_eq!(score["value"], 0.8);
        assert_eq!(score["source"], SCORE_SOURCE_EVAL);
        assert_eq!(score["configId"], "cfg-quality");
        assert_eq!(score["comment"], "Answer addresses the question");

        assert_eq!(env.provider.calls(), 1);
    }

    /// 不满足过滤条件或类型不符的实体不会创建执行
    #[tokio::test]
    async fn test_non_matching_entities_are_ignored() {
        let env = TestEnvironment::setup();
        env.intake
            .ingest(batch(
                TENANT,
                vec![
                    EventBuilder::trace("tr-embed").field("name", json!("embedding")),
                    EventBuilder::observation("obs-1")
                        .field("traceId", json!("tr-embed"))
                        .field("name", json!("chat-completion")),
                ],
            ))
            .await
            .unwrap();

        env.run_to_completion().await;

        assert!(env.eval_store.executions().is_empty());
        assert!(env.analytics.rows("scores").is_empty());
        assert_eq!(env.provider.calls(), 0);
    }

    /// 模型输出无法解析时执行失败，并上报死信
    #[tokio::test]
    async fn test_malformed_model_output_fails_execution() {
        let env = TestEnvironment::with_reply("I think it's pretty good");
        env.intake
            .ingest(batch(TENANT, vec![chat_trace("tr-1")]))
            .await
            .unwrap();

        env.drain_ingestion().await;
        env.forward_signals().await;
        assert_eq!(env.drain_evaluation().await, vec![JobOutcome::DeadLettered]);

        let execution = &env.eval_store.executions()[0];
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.raw_output.as_deref(), Some("I think it's pretty good"));
        assert!(env.analytics.rows("scores").is_empty());

        let reports: Vec<DeadLetterMessage> = env.publisher.decoded(topics::DEAD_LETTER_QUEUE);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].source_service, "eval-worker");
    }
}

#[cfg(test)]
mod idempotency_tests {
    use super::*;

    /// 已评分的 trace 再次更新不会重复评估
    #[tokio::test]
    async fn test_updates_after_scoring_do_not_rescore() {
        let env = TestEnvironment::setup();
        env.intake
            .ingest(batch(TENANT, vec![chat_trace("tr-1")]))
            .await
            .unwrap();
        env.run_to_completion().await;

        env.intake
            .ingest(batch(
                TENANT,
                vec![EventBuilder::trace("tr-1").at(500).field("tags", json!(["reviewed"]))],
            ))
            .await
            .unwrap();
        env.drain_ingestion().await;
        assert_eq!(env.forward_signals().await, 1);
        assert!(env.drain_evaluation().await.is_empty());

        assert_eq!(env.eval_store.executions_for("cfg-quality", "tr-1").len(), 1);
        assert_eq!(env.analytics.rows("scores").len(), 1);
        assert_eq!(env.provider.calls(), 1);
    }

    /// 同一信号被重复投递时只创建一个执行
    #[tokio::test]
    async fn test_duplicate_signal_creates_single_execution() {
        let env = TestEnvironment::setup();
        env.intake
            .ingest(batch(
                TENANT,
                vec![chat_trace("tr-1"), chat_trace("tr-2")],
            ))
            .await
            .unwrap();
        env.drain_ingestion().await;
        env.forward_signals().await;

        // 重新投递全部信号，模拟消费者位点回退
        env.reset_signal_cursor();
        env.forward_signals().await;

        let outcomes = env.drain_evaluation().await;
        assert_eq!(outcomes, vec![JobOutcome::Acked, JobOutcome::Acked]);

        assert_eq!(env.eval_store.executions().len(), 2);
        assert_eq!(env.analytics.rows("scores").len(), 2);
        assert_eq!(env.provider.calls(), 2);
    }
}
