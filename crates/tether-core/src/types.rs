// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Core data types for tether.
//!
//! This module provides the bus- and device-agnostic types that the rest of
//! the device manager is built on: bus addresses and names, the record
//! format shared by the RAM ring and the persisted mirror, and the stats /
//! metadata structures surfaced by the control plane.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Identifiers
// =============================================================================

/// Address of a device element on a bus (e.g. a 7-bit I2C address, possibly
/// extended with slot information in the upper bits).
///
/// Addresses are stable for the lifetime of the attached device and are the
/// key into every per-device structure in the buffering core.
///
/// # Examples
///
/// ```
/// use tether_core::types::BusAddr;
///
/// let addr = BusAddr::new(0x41);
/// assert_eq!(addr.to_string(), "0x0041");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusAddr(u32);

impl BusAddr {
    /// Creates a new bus address.
    #[inline]
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Returns the hex form used in publish/status JSON keys.
    pub fn to_hex_key(&self) -> String {
        format!("0x{:04x}", self.0)
    }
}

impl fmt::Display for BusAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl From<u32> for BusAddr {
    fn from(addr: u32) -> Self {
        Self(addr)
    }
}

impl From<u16> for BusAddr {
    fn from(addr: u16) -> Self {
        Self(addr as u32)
    }
}

/// A unique name for a bus within a gateway instance (e.g. "I2CA").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BusName(String);

impl BusName {
    /// Creates a new bus name.
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BusName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The published type name of a device (e.g. "VL53L4CD").
///
/// Type names are matched case-insensitively by the drain selection, since
/// control requests arrive through text surfaces that do not preserve case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceTypeName(String);

impl DeviceTypeName {
    /// Creates a new device type name.
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against another type name string.
    #[inline]
    pub fn matches(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

impl fmt::Display for DeviceTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DeviceTypeName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// Record Format
// =============================================================================

/// Per-record metadata storage in the ring and persisted segments: one
/// adjusted timestamp (u32 milliseconds) alongside each payload.
pub const META_STORAGE_BYTES: usize = 4;

/// The fixed layout of one polled sample for a device.
///
/// Payloads are opaque except for their leading device-local timestamp
/// counter: the first `timestamp_bytes` bytes (big-endian) tick at
/// `timestamp_resolution_us` microseconds per count and wrap at
/// `2^(8 * timestamp_bytes)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFormat {
    /// Size of each poll result payload in bytes.
    pub payload_size: usize,

    /// Number of leading payload bytes holding the device timestamp (1, 2
    /// or 4). Any other width disables timestamp extraction (raw ts reads
    /// as 0 - a documented lossy fallback, not an error).
    pub timestamp_bytes: u32,

    /// Resolution of one device timestamp count in microseconds.
    pub timestamp_resolution_us: u32,
}

impl RecordFormat {
    /// Creates a new record format.
    pub const fn new(payload_size: usize, timestamp_bytes: u32, timestamp_resolution_us: u32) -> Self {
        Self {
            payload_size,
            timestamp_bytes,
            timestamp_resolution_us,
        }
    }

    /// Bytes consumed by one record including its stored metadata.
    #[inline]
    pub const fn record_size(&self) -> usize {
        self.payload_size + META_STORAGE_BYTES
    }

    /// Timestamp resolution in integer milliseconds.
    #[inline]
    pub const fn resolution_ms(&self) -> u64 {
        (self.timestamp_resolution_us / 1000) as u64
    }

    /// Milliseconds spanned by one full wrap of the device timestamp
    /// counter: `2^(8T) * R/1000`.
    #[inline]
    pub const fn wrap_ms(&self) -> u64 {
        (1u64 << (8 * self.timestamp_bytes)) * self.resolution_ms()
    }

    /// Extracts the big-endian raw device timestamp from a payload.
    ///
    /// Widths outside {1, 2, 4} yield 0.
    pub fn raw_timestamp(&self, payload: &[u8]) -> u32 {
        match self.timestamp_bytes {
            1 if !payload.is_empty() => payload[0] as u32,
            2 if payload.len() >= 2 => u16::from_be_bytes([payload[0], payload[1]]) as u32,
            4 if payload.len() >= 4 => u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            _ => 0,
        }
    }
}

// =============================================================================
// Record Metadata & Batches
// =============================================================================

/// Metadata emitted alongside each drained or peeked record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Sequence number assigned at put time.
    pub seq: u32,

    /// Raw device timestamp extracted from the payload.
    pub ts_raw: u32,

    /// Millisecond base such that `ts_base_ms + ts_raw * R/1000` is the
    /// adjusted capture time.
    pub ts_base_ms: u64,
}

impl RecordMeta {
    /// The adjusted capture time of this record in milliseconds.
    #[inline]
    pub fn adjusted_ms(&self, format: &RecordFormat) -> u64 {
        self.ts_base_ms + self.ts_raw as u64 * format.resolution_ms()
    }
}

/// A batch of fixed-width records copied out of a store, with per-record
/// metadata.
///
/// Payload bytes are held as one contiguous allocation (`len * payload_size`)
/// to match how the stores keep them.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    payload_size: usize,
    payloads: Vec<u8>,
    metas: Vec<RecordMeta>,
}

impl RecordBatch {
    /// Creates an empty batch for the given payload size.
    pub fn new(payload_size: usize) -> Self {
        Self {
            payload_size,
            payloads: Vec::new(),
            metas: Vec::new(),
        }
    }

    /// Appends one record to the batch.
    ///
    /// # Panics
    ///
    /// Panics if `payload` does not match the batch payload size.
    pub fn push(&mut self, meta: RecordMeta, payload: &[u8]) {
        assert_eq!(payload.len(), self.payload_size, "record batch payload size mismatch");
        self.metas.push(meta);
        self.payloads.extend_from_slice(payload);
    }

    /// Number of records in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    /// Returns `true` if the batch holds no records.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Payload size of each record.
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Payload bytes of record `idx`.
    pub fn payload(&self, idx: usize) -> &[u8] {
        let off = idx * self.payload_size;
        &self.payloads[off..off + self.payload_size]
    }

    /// Per-record metadata, oldest first.
    #[inline]
    pub fn metas(&self) -> &[RecordMeta] {
        &self.metas
    }

    /// Iterates `(meta, payload)` pairs, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = (&RecordMeta, &[u8])> {
        self.metas
            .iter()
            .zip(self.payloads.chunks_exact(self.payload_size.max(1)))
    }
}

// =============================================================================
// Stats & Estimates
// =============================================================================

/// Snapshot of one device's offline buffer state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineStats {
    /// Current number of live records.
    pub depth: u32,
    /// Records discarded due to overflow (cumulative).
    pub drops: u32,
    /// Configured ring capacity in records.
    pub max_entries: u32,
    /// Payload size in bytes.
    pub payload_size: u32,
    /// Stored metadata bytes per record.
    pub meta_size: u32,
    /// Timestamp wraps observed (cumulative).
    pub ts_wrap_count: u32,
    /// Timestamp field width in bytes.
    pub timestamp_bytes: u32,
    /// Timestamp resolution in microseconds.
    pub timestamp_resolution_us: u32,
    /// Sequence number of the oldest live record.
    pub first_seq: u32,
    /// Adjusted capture time of the oldest live record (ms).
    pub oldest_capture_ms: u64,
}

impl OfflineStats {
    /// Bytes currently occupied by live records (payload + metadata).
    pub fn bytes_in_use(&self) -> u32 {
        let meta_bytes = if self.meta_size > 0 {
            self.meta_size
        } else {
            META_STORAGE_BYTES as u32
        };
        self.depth * (self.payload_size + meta_bytes)
    }
}

/// Projected RAM allocation for one device, as reported by the
/// allocation-estimate control operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocEstimate {
    /// Total bytes the device's ring would occupy.
    pub alloc_bytes: u32,
    /// Bytes per stored record (payload + metadata).
    pub bytes_per_entry: u32,
    /// Payload size in bytes.
    pub payload_size: u32,
    /// Stored metadata bytes per record.
    pub meta_size: u32,
}

// =============================================================================
// Helpers
// =============================================================================

/// Lower-case hex encoding of a byte slice, used for payloads in the
/// publish/peek JSON surfaces.
pub fn hex_string(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(s, "{:02x}", byte);
    }
    s
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_addr_display() {
        let addr = BusAddr::new(0x41);
        assert_eq!(addr.to_string(), "0x0041");
        assert_eq!(addr.to_hex_key(), "0x0041");
        assert_eq!(addr.raw(), 0x41);
    }

    #[test]
    fn test_record_format_sizes() {
        let format = RecordFormat::new(6, 2, 1000);
        assert_eq!(format.record_size(), 10);
        assert_eq!(format.resolution_ms(), 1);
        assert_eq!(format.wrap_ms(), 65536);
    }

    #[test]
    fn test_record_format_wrap_four_bytes() {
        let format = RecordFormat::new(12, 4, 1000);
        assert_eq!(format.wrap_ms(), 1u64 << 32);
    }

    #[test]
    fn test_raw_timestamp_extraction() {
        let format = RecordFormat::new(6, 2, 1000);
        assert_eq!(format.raw_timestamp(&[0x12, 0x34, 0, 0, 0, 0]), 0x1234);

        let format = RecordFormat::new(6, 1, 1000);
        assert_eq!(format.raw_timestamp(&[0xab, 0, 0, 0, 0, 0]), 0xab);

        let format = RecordFormat::new(6, 4, 1000);
        assert_eq!(format.raw_timestamp(&[0x01, 0x02, 0x03, 0x04, 0, 0]), 0x0102_0304);

        // Unsupported width reads as zero
        let format = RecordFormat::new(6, 3, 1000);
        assert_eq!(format.raw_timestamp(&[0xff, 0xff, 0xff, 0, 0, 0]), 0);
    }

    #[test]
    fn test_record_batch_roundtrip() {
        let mut batch = RecordBatch::new(4);
        batch.push(
            RecordMeta {
                seq: 7,
                ts_raw: 1,
                ts_base_ms: 100,
            },
            &[1, 2, 3, 4],
        );
        batch.push(
            RecordMeta {
                seq: 8,
                ts_raw: 2,
                ts_base_ms: 100,
            },
            &[5, 6, 7, 8],
        );

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.payload(1), &[5, 6, 7, 8]);

        let collected: Vec<u32> = batch.iter().map(|(m, _)| m.seq).collect();
        assert_eq!(collected, vec![7, 8]);
    }

    #[test]
    fn test_offline_stats_bytes_in_use() {
        let stats = OfflineStats {
            depth: 3,
            payload_size: 6,
            meta_size: 4,
            ..Default::default()
        };
        assert_eq!(stats.bytes_in_use(), 30);
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0xde, 0xad, 0x01]), "dead01");
        assert_eq!(hex_string(&[]), "");
    }

    #[test]
    fn test_type_name_matching() {
        let name = DeviceTypeName::new("VL53L4CD");
        assert!(name.matches("vl53l4cd"));
        assert!(!name.matches("LSM6DS"));
    }
}
