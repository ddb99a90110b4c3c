//! C6.2 — transaction registry backed by the shared key/value store, in
//! a namespace separate from the cached artifacts.

use crate::backend::SharedStore;
use crate::error::CacheError;
use crate::registry::{TransactionRegistry, TransactionStatus};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

const NAMESPACE_SUFFIX: &str = "-transaction";

const STATE_PENDING: u8 = 0;
const STATE_COMPLETED: u8 = 1;
const STATE_FAILED: u8 = 2;

#[derive(Debug, Clone, Copy)]
pub struct SharedRegistryConfig {
    pub pending_deadline: Duration,
    pub terminal_ttl: Duration,
}

pub struct SharedRegistry {
    store: Arc<dyn SharedStore>,
    config: SharedRegistryConfig,
}

impl SharedRegistry {
    pub fn new(store: Arc<dyn SharedStore>, config: SharedRegistryConfig) -> Self {
        Self { store, config }
    }

    fn namespaced(key: &str) -> Vec<u8> {
        format!("{key}{NAMESPACE_SUFFIX}").into_bytes()
    }
}

#[async_trait]
impl TransactionRegistry for SharedRegistry {
    async fn create(&self, key: &str) -> Result<(), CacheError> {
        self.store
            .set(&Self::namespaced(key), Bytes::from_static(&[STATE_PENDING]), Some(self.config.pending_deadline))
            .await
    }

    async fn complete(&self, key: &str) -> Result<(), CacheError> {
        self.store
            .set(&Self::namespaced(key), Bytes::from_static(&[STATE_COMPLETED]), Some(self.config.terminal_ttl))
            .await
    }

    async fn fail(&self, key: &str, reason: &str) -> Result<(), CacheError> {
        let mut payload = Vec::with_capacity(1 + reason.len());
        payload.push(STATE_FAILED);
        payload.extend_from_slice(reason.as_bytes());
        self.store
            .set(&Self::namespaced(key), Bytes::from(payload), Some(self.config.terminal_ttl))
            .await
    }

    async fn status(&self, key: &str) -> Result<TransactionStatus, CacheError> {
        let Some(value) = self.store.get(&Self::namespaced(key)).await? else {
            return Ok(TransactionStatus::Absent);
        };
        let Some((&state, reason_bytes)) = value.split_first() else {
            return Ok(TransactionStatus::Absent);
        };
        match state {
            STATE_PENDING => Ok(TransactionStatus::Pending),
            STATE_COMPLETED => Ok(TransactionStatus::Completed),
            STATE_FAILED => {
                let reason = String::from_utf8_lossy(reason_bytes).into_owned();
                Ok(TransactionStatus::Failed(reason))
            }
            other => Err(CacheError::CorruptPayload(format!("unknown transaction state byte {other}"))),
        }
    }

    async fn close(&self) {}
}
