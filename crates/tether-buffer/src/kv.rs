// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Key-value persistence abstraction.
//!
//! The persisted mirror stores blobs under `(namespace, key)` pairs - the
//! model exposed by embedded non-volatile stores. [`KvStore`] is the
//! interface the buffering core consumes; the concrete driver (NVS-style
//! flash, RocksDB, memory) is an external collaborator behind it.
//!
//! [`MemoryKv`] is the always-available backend for tests and development;
//! it supports fault injection so persistence error paths can be exercised.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

use tether_core::error::BufferError;

// =============================================================================
// KV Error
// =============================================================================

/// Error from an underlying key-value driver.
#[derive(Debug, Error)]
#[error("kv driver error: {message}")]
pub struct KvError {
    /// Driver-specific failure description.
    pub message: String,
}

impl KvError {
    /// Creates a new driver error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<KvError> for BufferError {
    fn from(err: KvError) -> Self {
        BufferError::persist_io(err.message)
    }
}

// =============================================================================
// KV Store Trait
// =============================================================================

/// Namespaced blob storage consumed by the persisted mirror.
///
/// Implementations must be thread-safe; calls may block on the driver's own
/// timeouts. Blob sizes are bounded by the segment size the persist layer
/// writes (nominally 4000 bytes) plus the metadata block.
#[async_trait]
pub trait KvStore: Send + Sync + Debug {
    /// Reads a blob, returning `None` when the key is absent.
    async fn get_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Writes (or replaces) a blob.
    async fn put_blob(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// Erases every key in a namespace.
    async fn erase_namespace(&self, namespace: &str) -> Result<(), KvError>;
}

// =============================================================================
// Memory KV Store
// =============================================================================

/// In-memory [`KvStore`] for tests and development.
///
/// Contents survive for the life of the value only. Write and read failures
/// can be injected to exercise the persist-degradation paths.
#[derive(Debug, Default)]
pub struct MemoryKv {
    spaces: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryKv {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent writes fail with a driver error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    /// Makes subsequent reads fail with a driver error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    /// Number of keys currently stored in a namespace.
    pub fn key_count(&self, namespace: &str) -> usize {
        self.spaces
            .read()
            .get(namespace)
            .map(|ns| ns.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(KvError::new("injected read failure"));
        }
        Ok(self
            .spaces
            .read()
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    async fn put_blob(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(KvError::new("injected write failure"));
        }
        self.spaces
            .write()
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn erase_namespace(&self, namespace: &str) -> Result<(), KvError> {
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(KvError::new("injected erase failure"));
        }
        self.spaces.write().remove(namespace);
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_kv_roundtrip() {
        let kv = MemoryKv::new();
        kv.put_blob("ns", "meta", &[1, 2, 3]).await.unwrap();

        assert_eq!(kv.get_blob("ns", "meta").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(kv.get_blob("ns", "missing").await.unwrap(), None);
        assert_eq!(kv.get_blob("other", "meta").await.unwrap(), None);
        assert_eq!(kv.key_count("ns"), 1);
    }

    #[tokio::test]
    async fn test_memory_kv_erase_namespace() {
        let kv = MemoryKv::new();
        kv.put_blob("ns", "s00000", &[0; 16]).await.unwrap();
        kv.put_blob("ns", "s00001", &[0; 16]).await.unwrap();
        kv.put_blob("keep", "meta", &[7]).await.unwrap();

        kv.erase_namespace("ns").await.unwrap();
        assert_eq!(kv.key_count("ns"), 0);
        assert_eq!(kv.key_count("keep"), 1);
    }

    #[tokio::test]
    async fn test_memory_kv_fault_injection() {
        let kv = MemoryKv::new();
        kv.set_fail_writes(true);
        assert!(kv.put_blob("ns", "meta", &[1]).await.is_err());

        kv.set_fail_writes(false);
        kv.put_blob("ns", "meta", &[1]).await.unwrap();

        kv.set_fail_reads(true);
        assert!(kv.get_blob("ns", "meta").await.is_err());
    }

    #[test]
    fn test_kv_error_conversion() {
        let err: BufferError = KvError::new("flash worn out").into();
        assert!(matches!(err, BufferError::PersistIo { .. }));
        assert!(err.is_retryable());
    }
}
