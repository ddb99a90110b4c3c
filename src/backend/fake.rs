//! An in-process fake of [`SharedStore`], enabled by the `test-util`
//! feature so C5 and the shared registry (C6.2) can be exercised without
//! a live backend connection.

use crate::backend::client::SharedStore;
use crate::error::CacheError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::time::{Duration, Instant};

struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// A server-managed-TTL key/value store backed by a `DashMap`, mirroring
/// the expiry semantics C5/C6.2 expect from the real shared store.
#[derive(Default)]
pub struct FakeSharedStore {
    entries: DashMap<Vec<u8>, Entry>,
}

impl FakeSharedStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        match entry.expires_at {
            Some(at) => Instant::now() < at,
            None => true,
        }
    }
}

#[async_trait]
impl SharedStore for FakeSharedStore {
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, CacheError> {
        let live_value = self
            .entries
            .get(key)
            .and_then(|entry| Self::is_live(&entry).then(|| entry.value.clone()));
        if live_value.is_none() {
            self.entries.remove(key);
        }
        Ok(live_value)
    }

    async fn set(&self, key: &[u8], value: Bytes, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_vec(),
            Entry { value, expires_at: ttl.map(|d| Instant::now() + d) },
        );
        Ok(())
    }

    async fn append(&self, key: &[u8], chunk: Bytes) -> Result<(), CacheError> {
        let mut appended = false;
        if let Some(mut entry) = self.entries.get_mut(key) {
            if Self::is_live(&entry) {
                let mut combined = Vec::with_capacity(entry.value.len() + chunk.len());
                combined.extend_from_slice(&entry.value);
                combined.extend_from_slice(&chunk);
                entry.value = Bytes::from(combined);
                appended = true;
            }
        }
        if !appended {
            self.entries.insert(key.to_vec(), Entry { value: chunk, expires_at: None });
        }
        Ok(())
    }

    async fn del(&self, key: &[u8]) -> Result<bool, CacheError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn ttl(&self, key: &[u8]) -> Result<Option<Duration>, CacheError> {
        match self.entries.get(key) {
            Some(entry) if Self::is_live(&entry) => Ok(entry
                .expires_at
                .map(|at| at.saturating_duration_since(Instant::now()))),
            _ => Ok(None),
        }
    }

    async fn dbsize(&self) -> Result<u64, CacheError> {
        Ok(self.entries.iter().filter(|e| Self::is_live(e.value())).count() as u64)
    }

    async fn info_memory(&self) -> Result<u64, CacheError> {
        let approx: usize = self.entries.iter().map(|e| e.value().value.len()).sum();
        Ok(approx as u64)
    }
}
