// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! RocksDB-backed [`KvStore`].
//!
//! For gateway-class hosts where the offline mirror lives on disk instead
//! of NVS-style flash. Namespaces map to key prefixes (`<namespace>/<key>`)
//! so a single database serves every device; erasing a namespace deletes
//! its prefix range in one write batch.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{Options, WriteBatch, DB};
use tracing::{error, info};

use crate::kv::{KvError, KvStore};

/// A persistent key-value store backed by RocksDB.
///
/// The blobs written here are small (one metadata block and 4000-byte
/// segments per device), so the options favour a modest memory footprint
/// over bulk throughput.
#[derive(Debug)]
pub struct RocksKv {
    db: Arc<DB>,
}

impl RocksKv {
    /// Opens (or creates) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref().to_path_buf();
        // Open in a blocking task to keep the runtime responsive.
        let db = tokio::task::spawn_blocking(move || Self::open_db(&path))
            .await
            .map_err(|e| KvError::new(format!("open task failed: {}", e)))?
            .map_err(|e| KvError::new(format!("rocksdb open failed: {}", e)))?;

        info!(path = %db.path().display(), "RocksDB kv store opened");
        Ok(Self { db: Arc::new(db) })
    }

    fn open_db(path: &Path) -> Result<DB, rocksdb::Error> {
        if let Err(e) = std::fs::create_dir_all(path) {
            error!(path = %path.display(), error = %e, "Failed to create kv directory");
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(4 * 1024 * 1024);
        opts.set_max_background_jobs(2);
        DB::open(&opts, path)
    }

    fn full_key(namespace: &str, key: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(namespace.len() + key.len() + 1);
        out.extend_from_slice(namespace.as_bytes());
        out.push(b'/');
        out.extend_from_slice(key.as_bytes());
        out
    }
}

#[async_trait]
impl KvStore for RocksKv {
    async fn get_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.db
            .get(Self::full_key(namespace, key))
            .map_err(|e| KvError::new(format!("get failed: {}", e)))
    }

    async fn put_blob(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.db
            .put(Self::full_key(namespace, key), value)
            .map_err(|e| KvError::new(format!("put failed: {}", e)))
    }

    async fn erase_namespace(&self, namespace: &str) -> Result<(), KvError> {
        let prefix = {
            let mut p = namespace.as_bytes().to_vec();
            p.push(b'/');
            p
        };
        let mut batch = WriteBatch::default();
        let iter = self.db.prefix_iterator(&prefix);
        for item in iter {
            let (key, _) = item.map_err(|e| KvError::new(format!("scan failed: {}", e)))?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete(key);
        }
        self.db
            .write(batch)
            .map_err(|e| KvError::new(format!("erase failed: {}", e)))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rocks_kv_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let kv = RocksKv::open(dir.path()).await.unwrap();

        kv.put_blob("ob_0041", "meta", &[1, 2, 3]).await.unwrap();
        kv.put_blob("ob_0041", "s00000", &[4; 40]).await.unwrap();
        kv.put_blob("ob_0042", "meta", &[9]).await.unwrap();

        assert_eq!(kv.get_blob("ob_0041", "meta").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(kv.get_blob("ob_0041", "absent").await.unwrap(), None);

        kv.erase_namespace("ob_0041").await.unwrap();
        assert_eq!(kv.get_blob("ob_0041", "meta").await.unwrap(), None);
        assert_eq!(kv.get_blob("ob_0041", "s00000").await.unwrap(), None);
        // Other namespaces untouched.
        assert_eq!(kv.get_blob("ob_0042", "meta").await.unwrap(), Some(vec![9]));
    }
}
