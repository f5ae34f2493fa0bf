//! 模型调用
//!
//! 评估只依赖 OpenAI 兼容的 chat completions 接口，要求模型返回 JSON 对象。

use std::time::Duration;

use async_trait::async_trait;
use ingest_shared::config::EvalConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub prompt: String,
    pub model: String,
    /// 透传给接口的模型参数（temperature 等）
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderResponse {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("模型调用超时")]
    Timeout,

    #[error("模型调用被限流")]
    RateLimited,

    #[error("模型服务错误: status={status} {body}")]
    Server { status: u16, body: String },

    #[error("模型请求被拒绝: status={status} {body}")]
    Client { status: u16, body: String },

    #[error("模型调用网络错误: {0}")]
    Transport(String),

    #[error("模型响应无法解析: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// 超时、限流、5xx 与网络错误可重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Server { .. } | Self::Transport(_)
        )
    }

    fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited,
            500..=599 => Self::Server { status, body },
            _ => Self::Client { status, body },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError>;
}

// ---------------------------------------------------------------------------
// OpenAI 兼容实现
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletion {
    model: Option<String>,
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiCompatibleProvider {
    pub fn new(config: &EvalConfig) -> std::result::Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.provider_base_url.trim_end_matches('/')
            ),
            api_key: config.provider_api_key.clone(),
        })
    }

    fn body(request: &ProviderRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": [ChatMessage { role: "user", content: &request.prompt }],
            "response_format": { "type": "json_object" },
        });

        // 模板参数不能覆盖 model/messages
        if let (Some(target), Some(params)) = (body.as_object_mut(), request.parameters.as_object())
        {
            for (key, value) in params {
                if key != "model" && key != "messages" {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatibleProvider {
    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<ProviderResponse, ProviderError> {
        let mut builder = self.client.post(&self.endpoint).json(&Self::body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let completion: ChatCompletion = response.json().await?;
        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("choices 为空".to_string()))?;

        debug!(chars = text.len(), "模型调用完成");
        Ok(ProviderResponse {
            text,
            model: completion.model.unwrap_or_else(|| request.model.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Json, Router, http::StatusCode, routing::post};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    fn config(base_url: String, timeout_secs: u64) -> EvalConfig {
        EvalConfig {
            provider_base_url: base_url,
            provider_api_key: Some("sk-test".to_string()),
            request_timeout_secs: timeout_secs,
            ..EvalConfig::default()
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            prompt: "rate this".to_string(),
            model: "gpt-4o-mini".to_string(),
            parameters: json!({"temperature": 0}),
        }
    }

    #[tokio::test]
    async fn test_complete_reads_first_choice() {
        let seen = Arc::new(parking_lot::Mutex::new(Value::Null));
        let captured = seen.clone();
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock() = body;
                    Json(json!({
                        "model": "gpt-4o-mini-2024",
                        "choices": [{"message": {"role": "assistant", "content": "{\"score\":0.8}"}}]
                    }))
                }
            }),
        );
        let provider = OpenAiCompatibleProvider::new(&config(serve(router).await, 5)).unwrap();

        let response = provider.complete(&request()).await.unwrap();
        assert_eq!(response.text, "{\"score\":0.8}");
        assert_eq!(response.model, "gpt-4o-mini-2024");

        let body = seen.lock().clone();
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["temperature"], 0);
        assert_eq!(body["messages"][0]["content"], "rate this");
    }

    #[tokio::test]
    async fn test_status_classification() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let router = Router::new().route(
            "/v1/chat/completions",
            post(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => (StatusCode::TOO_MANY_REQUESTS, "slow down"),
                        1 => (StatusCode::BAD_GATEWAY, "upstream"),
                        _ => (StatusCode::BAD_REQUEST, "bad model"),
                    }
                }
            }),
        );
        let provider = OpenAiCompatibleProvider::new(&config(serve(router).await, 5)).unwrap();

        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited) && err.is_retryable());

        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Server { status: 502, .. }) && err.is_retryable());

        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Client { status: 400, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_provider_times_out() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        );
        let provider = OpenAiCompatibleProvider::new(&config(serve(router).await, 1)).unwrap();

        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout));
    }

    #[tokio::test]
    async fn test_empty_choices_is_invalid_response() {
        let router = Router::new().route(
            "/v1/chat/completions",
            post(|| async { Json(json!({"choices": []})) }),
        );
        let provider = OpenAiCompatibleProvider::new(&config(serve(router).await, 5)).unwrap();

        let err = provider.complete(&request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
        assert!(!err.is_retryable());
    }
}
