//! 摄取 HTTP 接口
//!
//! 认证与租户识别在上游网关完成，这里只负责暂存并入队，立即返回受理结果。

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use ingest_shared::error::IngestError;
use ingest_shared::events::IngestionBatch;
use serde::Serialize;
use serde_json::json;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::PipelineError;
use crate::intake::{IntakeResponse, IntakeService};

#[derive(Clone)]
pub struct ApiState {
    pub intake: Arc<IntakeService>,
}

/// 统一响应
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub code: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            code: "SUCCESS".to_string(),
            message: "已受理".to_string(),
            data: Some(data),
        }
    }
}

/// 接口错误
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] PipelineError);

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match &self.0 {
            PipelineError::Shared(IngestError::Validation(_)) => StatusCode::BAD_REQUEST,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match &self.0 {
            PipelineError::Shared(e) => e.code(),
            PipelineError::MalformedBlob { .. } => "MALFORMED_BLOB",
            PipelineError::InconsistentJob(_) => "INCONSISTENT_JOB",
            PipelineError::ReservationBusy { .. } => "RESERVATION_BUSY",
            PipelineError::BufferClosed { .. } => "BUFFER_CLOSED",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // 存储错误细节只写日志
        let message = if status == StatusCode::BAD_REQUEST {
            self.to_string()
        } else {
            tracing::error!(error = %self.0, "批次受理失败");
            "暂时无法受理，请稍后重试".to_string()
        };

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": message,
            "data": serde_json::Value::Null
        });

        (status, Json(body)).into_response()
    }
}

pub fn router(state: ApiState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/api/public/ingestion", post(ingest))
        .route("/health", get(health_check))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 受理一个事件批次
///
/// 部分事件校验失败时其余事件照常受理，拒绝明细在响应中返回。
async fn ingest(
    State(state): State<ApiState>,
    Json(batch): Json<IngestionBatch>,
) -> Result<(StatusCode, Json<ApiResponse<IntakeResponse>>), ApiError> {
    let response = state.intake.ingest(batch).await?;
    Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(response))))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "ingestion-worker"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intake::InMemorySequenceAllocator;
    use crate::staging::{InMemoryObjectStore, StagingStore};
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use ingest_shared::queue::{InMemoryJobQueue, JobQueue, queues};
    use ingest_shared::retry::RetryPolicy;
    use ingest_shared::test_utils::{EventBuilder, batch, fast_queue_config};
    use tower::ServiceExt;

    fn app() -> (Router, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new(queues::INGESTION, &fast_queue_config()));
        let intake = IntakeService::new(
            StagingStore::new(Arc::new(InMemoryObjectStore::new()), RetryPolicy::none()),
            queue.clone(),
            Arc::new(InMemorySequenceAllocator::new()),
        );
        (
            router(
                ApiState {
                    intake: Arc::new(intake),
                },
                Duration::from_secs(5),
            ),
            queue,
        )
    }

    fn post_json(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/public/ingestion")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ingest_returns_accepted() {
        let (app, queue) = app();
        let body = serde_json::to_value(batch("t1", vec![EventBuilder::trace("tr-1")])).unwrap();

        let response = app.oneshot(post_json(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["data"]["accepted"], 1);
        assert_eq!(queue.shard_count(), 1);
        assert_eq!(queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_batch_is_bad_request() {
        let (app, _) = app();
        let body = serde_json::to_value(batch("", vec![EventBuilder::trace("tr-1")])).unwrap();

        let response = app.oneshot(post_json(body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
