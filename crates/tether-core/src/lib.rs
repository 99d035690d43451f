// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # tether-core
//!
//! Core abstractions and shared types for the tether embedded device
//! manager.
//!
//! This crate provides the foundational pieces used across the buffering
//! subsystem and the host application:
//!
//! - **Types**: `BusAddr`, `BusName`, `DeviceTypeName`, `RecordFormat`,
//!   record batches and stats snapshots
//! - **Error**: unified error hierarchy with retryability classification
//! - **Tracker**: online/offline address state machine with hysteresis and
//!   mark-then-sweep eviction
//! - **Bus**: the `BusDevices` capability trait concrete buses implement
//!
//! ## Example
//!
//! ```
//! use tether_core::types::{BusAddr, RecordFormat};
//! use tether_core::tracker::AddrTracker;
//!
//! let format = RecordFormat::new(6, 2, 1000);
//! assert_eq!(format.record_size(), 10);
//!
//! let mut tracker = AddrTracker::new();
//! tracker.observe(BusAddr::new(0x41), true);
//! let obs = tracker.observe(BusAddr::new(0x41), true);
//! assert!(obs.state_changed);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

// =============================================================================
// Modules
// =============================================================================

pub mod bus;
pub mod error;
pub mod tracker;
pub mod types;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use bus::{AutoResume, BusDevices, ControlSnapshot, DrainedRecord};
pub use error::{BufferError, BufferResult, ControlError, ControlResult, TetherError, TetherResult};
pub use tracker::{
    AddrStatus, AddrTracker, Observation, OnlineState, RESP_COUNT_FAIL_MAX_DEFAULT,
    RESP_COUNT_OK_MAX_DEFAULT,
};
pub use types::{
    hex_string, AllocEstimate, BusAddr, BusName, DeviceTypeName, OfflineStats, RecordBatch,
    RecordFormat, RecordMeta, META_STORAGE_BYTES,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

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
