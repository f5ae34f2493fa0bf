//! 进程内对象存储，测试与本地运行使用

use std::collections::BTreeMap;

use async_trait::async_trait;
use ingest_shared::error::{IngestError, Result};
use parking_lot::Mutex;

use super::ObjectStore;

#[derive(Default)]
pub struct InMemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    put_failures: Mutex<u32>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 删除对象，模拟生命周期清理或误删
    pub fn remove(&self, key: &str) -> bool {
        self.objects.lock().remove(key).is_some()
    }

    /// 接下来的 n 次写入失败
    pub fn fail_next_puts(&self, n: u32) {
        *self.put_failures.lock() = n;
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        {
            let mut remaining = self.put_failures.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(IngestError::Storage("注入的写入失败".to_string()));
            }
        }
        self.objects.lock().insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
