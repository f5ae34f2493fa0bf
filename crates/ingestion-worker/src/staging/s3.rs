//! S3 兼容对象存储实现

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use ingest_shared::config::StorageConfig;
use ingest_shared::error::{IngestError, Result};
use tracing::info;

use super::ObjectStore;

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    timeout: Duration,
}

impl S3ObjectStore {
    pub async fn new(config: &StorageConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(config.force_path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            "S3 暂存客户端已创建"
        );

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            timeout: Duration::from_millis(config.request_timeout_ms),
        }
    }

    pub async fn health_check(&self) -> Result<()> {
        self.bounded("head_bucket", async {
            self.client
                .head_bucket()
                .bucket(&self.bucket)
                .send()
                .await
                .map(|_| ())
                .map_err(|e| IngestError::Storage(e.to_string()))
        })
        .await
    }

    /// 为单次请求加超时
    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| IngestError::Timeout {
                operation: format!("s3 {operation}"),
            })?
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.bounded("put_object", async {
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .content_type("application/json")
                .body(ByteStream::from(body))
                .send()
                .await
                .map_err(|e| IngestError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.bounded("get_object", async {
            let response = match self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                    return Ok(None);
                }
                Err(e) => return Err(IngestError::Storage(e.to_string())),
            };

            let body = response
                .body
                .collect()
                .await
                .map_err(|e| IngestError::Storage(e.to_string()))?;
            Ok(Some(body.into_bytes().to_vec()))
        })
        .await
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.bounded("list_objects_v2", async {
            let mut keys = Vec::new();
            let mut continuation: Option<String> = None;

            loop {
                let response = self
                    .client
                    .list_objects_v2()
                    .bucket(&self.bucket)
                    .prefix(prefix)
                    .set_continuation_token(continuation.take())
                    .send()
                    .await
                    .map_err(|e| IngestError::Storage(e.to_string()))?;

                keys.extend(
                    response
                        .contents()
                        .iter()
                        .filter_map(|obj| obj.key().map(str::to_string)),
                );

                match response.next_continuation_token() {
                    Some(token) if response.is_truncated().unwrap_or(false) => {
                        continuation = Some(token.to_string());
                    }
                    _ => break,
                }
            }

            Ok(keys)
        })
        .await
    }
}
