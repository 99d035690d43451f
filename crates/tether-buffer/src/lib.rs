// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # tether-buffer
//!
//! Offline buffering subsystem for the tether device manager.
//!
//! Polled samples from bus devices land in fixed-budget RAM rings, are
//! mirrored into a segmented key-value log that survives power loss, and
//! drain upward to a publish pipeline under fine-grained runtime control.
//!
//! ## Architecture
//!
//! ```text
//! bus poll result
//!       |
//!       v
//! BufferingCore::handle_poll_result
//!       |
//!       v
//! DeviceBuffer::put  ----->  RingStore (RAM ring, N x P bytes)
//!       |                         |
//!       v                         | catch-up append
//! PersistStore  <-----------------+
//! (meta + sNNNNN segments in a KvStore namespace)
//!
//! publish tick: PublishDrain -> BusDevices::drain_offline_records
//!               -> JSON / binary batches + remaining-backlog hint
//! ```
//!
//! ## Module Overview
//!
//! - [`ring`]: fixed-capacity RAM ring with wrap-aware adjusted timestamps
//! - [`persist`]: segmented persisted mirror with crash recovery
//! - [`kv`]: the key-value driver abstraction (+ in-memory backend)
//! - [`device`]: per-device composition of ring + mirror + flags
//! - [`control`]: per-bus registry, tracker and control plane
//! - [`drain`]: publish-tick drain and batch formatting
//! - [`config`]: buffering configuration
//! - [`metrics`]: Prometheus metrics
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_buffer::{BufferingConfig, BufferingCore, MemoryKv, PublishDrain};
//! use tether_core::types::{BusAddr, BusName, DeviceTypeName, RecordFormat};
//!
//! let kv = Arc::new(MemoryKv::new());
//! let core = Arc::new(BufferingCore::with_kv(
//!     BusName::new("I2CA"),
//!     BufferingConfig::default(),
//!     kv,
//! ));
//! core.add_device(BusAddr::new(0x41), DeviceTypeName::new("VL53L4CD"),
//!     RecordFormat::new(6, 2, 1000)).await?;
//!
//! // Poller side
//! core.handle_poll_result(now_us, BusAddr::new(0x41), &payload).await?;
//!
//! // Publish side
//! let mut drain = PublishDrain::new(32);
//! drain.add_bus(core.clone());
//! let batch = drain.publish_json();
//! ```
//!
//! ## Feature Flags
//!
//! - `rocksdb-backend`: RocksDB-backed [`KvStore`](kv::KvStore) for
//!   gateway-class hosts

#![warn(missing_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod config;
pub mod control;
pub mod device;
pub mod drain;
pub mod kv;
pub mod metrics;
pub mod persist;
pub mod ring;

#[cfg(feature = "rocksdb-backend")]
pub mod rocksdb;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::{BufferingConfig, BufferingConfigBuilder};
pub use control::BufferingCore;
pub use device::DeviceBuffer;
pub use drain::{BinaryPublishBatch, PublishBatch, PublishDrain};
pub use kv::{KvError, KvStore, MemoryKv};
pub use metrics::BufferMetricsCollector;
pub use persist::{
    ImportOutcome, PersistStore, PERSIST_META_MAGIC, PERSIST_META_VERSION, PERSIST_SEGMENT_BYTES,
};
pub use ring::{ExportBatch, RingStore};

#[cfg(feature = "rocksdb-backend")]
pub use rocksdb::RocksKv;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Prelude
// =============================================================================

/// Re-exports of the commonly used types.
pub mod prelude {
    pub use crate::config::BufferingConfig;
    pub use crate::control::BufferingCore;
    pub use crate::device::DeviceBuffer;
    pub use crate::drain::PublishDrain;
    pub use crate::kv::{KvStore, MemoryKv};
    pub use crate::persist::PersistStore;
    pub use crate::ring::RingStore;
    pub use tether_core::bus::BusDevices;

    #[cfg(feature = "rocksdb-backend")]
    pub use crate::rocksdb::RocksKv;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
