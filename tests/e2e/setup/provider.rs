use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use eval_worker::LlmProvider;
use eval_worker::provider::{ProviderError, ProviderRequest, ProviderResponse};

/// 固定应答的模型提供方，记录调用次数
pub struct FixedProvider {
    reply: String,
    calls: AtomicUsize,
}

impl FixedProvider {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for FixedProvider {
    async fn complete(
        &self,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ProviderResponse {
            text: self.reply.clone(),
            model: request.model.clone(),
        })
    }
}
