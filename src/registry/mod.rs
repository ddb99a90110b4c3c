//! C6 — the transaction registry: a durable record of `{Pending,
//! Completed, Failed(reason)}` per fingerprint, with two TTLs.

pub mod local;
pub mod shared;

use crate::error::CacheError;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed(String),
    Absent,
}

impl TransactionStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, TransactionStatus::Pending)
    }
}

#[async_trait]
pub trait TransactionRegistry: Send + Sync {
    async fn create(&self, key: &str) -> Result<(), CacheError>;
    async fn complete(&self, key: &str) -> Result<(), CacheError>;
    async fn fail(&self, key: &str, reason: &str) -> Result<(), CacheError>;
    async fn status(&self, key: &str) -> Result<TransactionStatus, CacheError>;
    async fn close(&self);
}
