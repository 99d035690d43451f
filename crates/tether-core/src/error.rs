// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Unified error hierarchy for tether.
//!
//! Errors are grouped per subsystem and roll up into [`TetherError`]. The
//! buffering core never aborts the process: every failure is surfaced to the
//! caller, and the helpers here distinguish retryable conditions (`Busy`,
//! persistence I/O) from configuration and contract violations.
//!
//! # Examples
//!
//! ```
//! use tether_core::error::BufferError;
//! use std::time::Duration;
//!
//! let err = BufferError::busy(Duration::from_millis(25));
//! assert!(err.is_retryable());
//! ```

use std::time::Duration;
use thiserror::Error;

use crate::types::BusAddr;

// =============================================================================
// TetherError - Root Error Type
// =============================================================================

/// The root error type for the device manager core.
#[derive(Debug, Error)]
pub enum TetherError {
    /// Offline buffer error.
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Control plane error.
    #[error("Control error: {0}")]
    Control(#[from] ControlError),
}

impl TetherError {
    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            TetherError::Buffer(e) => e.is_retryable(),
            TetherError::Control(_) => false,
        }
    }

    /// Returns the error type as a string for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            TetherError::Buffer(e) => e.error_type(),
            TetherError::Control(e) => e.error_type(),
        }
    }
}

// =============================================================================
// BufferError
// =============================================================================

/// Errors from the ring and persist stores.
#[derive(Debug, Error)]
pub enum BufferError {
    /// Invalid store configuration (zero capacity or payload size, or a
    /// record too large for a persistence segment).
    #[error("Invalid configuration: {message}")]
    ConfigInvalid {
        /// Error message.
        message: String,
    },

    /// A payload did not match the configured fixed width.
    #[error("Payload size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Configured payload size.
        expected: usize,
        /// Offered payload size.
        actual: usize,
    },

    /// The store has not been configured yet.
    #[error("Store is not configured")]
    NotConfigured,

    /// The per-store mutex could not be acquired within the bounded wait.
    /// No state was changed; the caller decides whether to retry.
    #[error("Store busy: lock not acquired within {timeout:?}")]
    Busy {
        /// The bounded wait that elapsed.
        timeout: Duration,
    },

    /// The underlying key-value driver failed. The persist layer is marked
    /// not-ready; the RAM ring continues to operate.
    #[error("Persistence I/O failed: {message}")]
    PersistIo {
        /// Error message.
        message: String,
    },

    /// Persisted metadata did not match the configured layout. The
    /// namespace is wiped and reinitialised automatically.
    #[error("Persisted metadata mismatch (store reinitialised)")]
    PersistMismatch,

    /// A sequence gap was detected when appending to the persisted log.
    /// The persisted contents are reset to restore continuity.
    #[error("Sequence gap detected: expected {expected_seq}, batch starts at {first_seq}")]
    GapDetected {
        /// The next sequence the store expected.
        expected_seq: u32,
        /// The first sequence of the offered batch.
        first_seq: u32,
    },
}

impl BufferError {
    /// Creates a configuration error.
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Creates a payload size mismatch error.
    pub fn size_mismatch(expected: usize, actual: usize) -> Self {
        Self::SizeMismatch { expected, actual }
    }

    /// Creates a busy error.
    pub fn busy(timeout: Duration) -> Self {
        Self::Busy { timeout }
    }

    /// Creates a persistence I/O error.
    pub fn persist_io(message: impl Into<String>) -> Self {
        Self::PersistIo {
            message: message.into(),
        }
    }

    /// Creates a sequence gap error.
    pub fn gap_detected(expected_seq: u32, first_seq: u32) -> Self {
        Self::GapDetected {
            expected_seq,
            first_seq,
        }
    }

    /// Returns `true` if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BufferError::Busy { .. } | BufferError::PersistIo { .. })
    }

    /// Returns the error type for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            BufferError::ConfigInvalid { .. } => "config_invalid",
            BufferError::SizeMismatch { .. } => "size_mismatch",
            BufferError::NotConfigured => "not_configured",
            BufferError::Busy { .. } => "busy",
            BufferError::PersistIo { .. } => "persist_io",
            BufferError::PersistMismatch => "persist_mismatch",
            BufferError::GapDetected { .. } => "gap_detected",
        }
    }
}

// =============================================================================
// ControlError
// =============================================================================

/// Errors from control-plane operations.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The requested address is not known on this bus.
    #[error("Unknown address: {addr}")]
    AddrUnknown {
        /// The requested address.
        addr: BusAddr,
    },

    /// The requested bus is not registered.
    #[error("Unknown bus: {bus}")]
    BusUnknown {
        /// The requested bus name.
        bus: String,
    },
}

impl ControlError {
    /// Creates an unknown-address error.
    pub fn addr_unknown(addr: BusAddr) -> Self {
        Self::AddrUnknown { addr }
    }

    /// Creates an unknown-bus error.
    pub fn bus_unknown(bus: impl Into<String>) -> Self {
        Self::BusUnknown { bus: bus.into() }
    }

    /// Returns the error type for logging/metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            ControlError::AddrUnknown { .. } => "addr_unknown",
            ControlError::BusUnknown { .. } => "bus_unknown",
        }
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// A Result type with TetherError.
pub type TetherResult<T> = Result<T, TetherError>;

/// A Result type with BufferError.
pub type BufferResult<T> = Result<T, BufferError>;

/// A Result type with ControlError.
pub type ControlResult<T> = Result<T, ControlError>;

// =============================================================================
// Tests
// =============================================================================
