//! A minimal async client for the shared key/value store that backs the
//! shared cache (C5) and the shared transaction registry (C6.2).

pub mod client;
pub mod protocol;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use client::{BackendClient, SharedStore};
