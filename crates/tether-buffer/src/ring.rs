// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Fixed-capacity in-RAM ring of poll results with adjusted-timestamp
//! metadata.
//!
//! The ring holds `N` fixed-width payloads in one contiguous allocation
//! plus a parallel array of `N` adjusted timestamps (u32 milliseconds).
//! Each payload carries a device-local timestamp counter in its leading
//! bytes; on put the ring derives a monotonic adjusted time from a base
//! that advances whenever the raw counter wraps.
//!
//! # Concurrency
//!
//! Every operation acquires the per-store mutex for its duration, with a
//! bounded wait: a timeout surfaces as [`BufferError::Busy`] with no
//! partial state change. Nothing is allocated under the lock on the put
//! path; `get` resizes only its output buffer.

use parking_lot::Mutex;
use std::time::Duration;
use tracing::debug;

use tether_core::error::{BufferError, BufferResult};
use tether_core::types::{OfflineStats, RecordBatch, RecordFormat, RecordMeta};

/// Bounded wait for the per-store mutex.
pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_millis(25);

// =============================================================================
// Export Batch
// =============================================================================

/// A contiguous run of records copied out of the ring for appending to the
/// persisted mirror, carrying the exact stored adjusted timestamps.
#[derive(Debug, Clone)]
pub struct ExportBatch {
    /// Sequence number of the first record in the batch.
    pub first_seq: u32,
    /// Payload size of each record.
    pub payload_size: usize,
    /// Concatenated payload bytes (`len * payload_size`).
    pub payloads: Vec<u8>,
    /// Adjusted timestamp (ms) per record.
    pub adj_ts_ms: Vec<u32>,
}

impl ExportBatch {
    /// Number of records in the batch.
    pub fn len(&self) -> usize {
        self.adj_ts_ms.len()
    }

    /// Returns `true` if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.adj_ts_ms.is_empty()
    }
}

// =============================================================================
// Ring Inner State
// =============================================================================

#[derive(Debug)]
struct RingInner {
    format: RecordFormat,
    max_entries: usize,
    payloads: Vec<u8>,
    adj_ts_ms: Vec<u32>,
    head: usize,
    count: usize,
    drops: u32,
    next_seq: u32,
    ts_base_ms: u64,
    last_ts_raw: u32,
    last_ts_valid: bool,
    ts_wrap_count: u32,
}

impl RingInner {
    fn allocate(max_entries: usize, format: RecordFormat) -> Self {
        Self {
            format,
            max_entries,
            payloads: vec![0; max_entries * format.payload_size],
            adj_ts_ms: vec![0; max_entries],
            head: 0,
            count: 0,
            drops: 0,
            next_seq: 0,
            ts_base_ms: 0,
            last_ts_raw: 0,
            last_ts_valid: false,
            ts_wrap_count: 0,
        }
    }

    fn reset_counters(&mut self) {
        self.head = 0;
        self.count = 0;
        self.drops = 0;
        self.next_seq = 0;
        self.ts_base_ms = 0;
        self.last_ts_raw = 0;
        self.last_ts_valid = false;
        self.ts_wrap_count = 0;
    }

    fn first_seq(&self) -> u32 {
        if self.next_seq as usize > self.count {
            self.next_seq - self.count as u32
        } else {
            0
        }
    }

    fn tail(&self) -> usize {
        (self.head + self.max_entries - self.count) % self.max_entries
    }

    fn put(&mut self, now_us: u64, seq: u32, data: &[u8]) {
        let raw = self.format.raw_timestamp(data);
        let res_ms = self.format.resolution_ms();
        let now_ms = now_us / 1000;

        // Seed the base on the first valid put so adjusted times line up
        // with the caller's clock.
        if !self.last_ts_valid {
            self.ts_base_ms = if res_ms > 0 && now_ms > raw as u64 * res_ms {
                now_ms - raw as u64 * res_ms
            } else {
                0
            };
        }

        // A declining raw counter means the device timestamp wrapped.
        if self.last_ts_valid && raw < self.last_ts_raw {
            self.ts_base_ms += self.format.wrap_ms();
            self.ts_wrap_count += 1;
        }
        self.last_ts_raw = raw;
        self.last_ts_valid = true;

        let off = self.head * self.format.payload_size;
        self.payloads[off..off + self.format.payload_size].copy_from_slice(data);
        self.adj_ts_ms[self.head] = (self.ts_base_ms + raw as u64 * res_ms) as u32;

        if self.count < self.max_entries {
            self.count += 1;
        } else {
            self.drops += 1;
        }
        self.head = (self.head + 1) % self.max_entries;
        self.next_seq = seq.wrapping_add(1);
    }

    fn get(&mut self, max_responses: usize, max_bytes: usize, consume: bool, start_idx: usize) -> RecordBatch {
        // A consuming read always starts at the tail.
        let start_idx = if consume { 0 } else { start_idx };

        let mut batch = RecordBatch::new(self.format.payload_size);
        if self.count == 0 || start_idx >= self.count {
            return batch;
        }

        let available = self.count - start_idx;
        let mut num = if max_responses == 0 {
            available
        } else {
            available.min(max_responses)
        };
        if max_bytes > 0 {
            let max_from_bytes = max_bytes / self.format.record_size();
            if max_from_bytes == 0 {
                return batch;
            }
            num = num.min(max_from_bytes);
        }

        let res_ms = self.format.resolution_ms();
        let mut idx = (self.tail() + start_idx) % self.max_entries;
        let seq_start = if self.next_seq as usize > self.count {
            self.next_seq - self.count as u32 + start_idx as u32
        } else {
            start_idx as u32
        };

        for i in 0..num {
            let off = idx * self.format.payload_size;
            let payload = &self.payloads[off..off + self.format.payload_size];
            let raw = self.format.raw_timestamp(payload);
            let ts_component = raw as u64 * res_ms;
            let ts_base_ms = (self.adj_ts_ms[idx] as u64).saturating_sub(ts_component);
            batch.push(
                RecordMeta {
                    seq: seq_start + i as u32,
                    ts_raw: raw,
                    ts_base_ms,
                },
                payload,
            );
            idx = (idx + 1) % self.max_entries;
        }

        if consume {
            self.count -= num;
        }
        batch
    }

    fn stats(&self) -> OfflineStats {
        let oldest_capture_ms = if self.count > 0 {
            self.adj_ts_ms[self.tail()] as u64
        } else {
            0
        };
        OfflineStats {
            depth: self.count as u32,
            drops: self.drops,
            max_entries: self.max_entries as u32,
            payload_size: self.format.payload_size as u32,
            meta_size: tether_core::types::META_STORAGE_BYTES as u32,
            ts_wrap_count: self.ts_wrap_count,
            timestamp_bytes: self.format.timestamp_bytes,
            timestamp_resolution_us: self.format.timestamp_resolution_us,
            first_seq: self.first_seq(),
            oldest_capture_ms,
        }
    }

    fn export_from(&self, from_seq: u32) -> Option<ExportBatch> {
        if self.count == 0 {
            return None;
        }
        let first_seq = self.first_seq();
        if from_seq >= self.next_seq {
            return None;
        }
        let start_seq = from_seq.max(first_seq);
        let start_idx = (start_seq - first_seq) as usize;
        let num = self.count - start_idx;

        let mut payloads = Vec::with_capacity(num * self.format.payload_size);
        let mut adj_ts_ms = Vec::with_capacity(num);
        let mut idx = (self.tail() + start_idx) % self.max_entries;
        for _ in 0..num {
            let off = idx * self.format.payload_size;
            payloads.extend_from_slice(&self.payloads[off..off + self.format.payload_size]);
            adj_ts_ms.push(self.adj_ts_ms[idx]);
            idx = (idx + 1) % self.max_entries;
        }
        Some(ExportBatch {
            first_seq: start_seq,
            payload_size: self.format.payload_size,
            payloads,
            adj_ts_ms,
        })
    }

    fn resize(&mut self, new_max: usize) {
        if new_max == self.max_entries {
            return;
        }
        let keep = self.count.min(new_max);
        let evicted = self.count - keep;

        let mut payloads = vec![0u8; new_max * self.format.payload_size];
        let mut adj_ts_ms = vec![0u32; new_max];

        // Copy the newest `keep` records, oldest first.
        let mut idx = (self.tail() + evicted) % self.max_entries;
        for slot in 0..keep {
            let src = idx * self.format.payload_size;
            let dst = slot * self.format.payload_size;
            payloads[dst..dst + self.format.payload_size]
                .copy_from_slice(&self.payloads[src..src + self.format.payload_size]);
            adj_ts_ms[slot] = self.adj_ts_ms[idx];
            idx = (idx + 1) % self.max_entries;
        }

        self.payloads = payloads;
        self.adj_ts_ms = adj_ts_ms;
        self.max_entries = new_max;
        self.head = keep % new_max;
        self.count = keep;
        self.drops += evicted as u32;
    }
}

// =============================================================================
// Ring Store
// =============================================================================

/// Thread-safe fixed-capacity ring of poll-result records.
///
/// Unconfigured until [`RingStore::configure`] succeeds. Reconfiguring
/// releases the previous backing arrays before allocating new ones, so a
/// failed configure leaves the store empty but valid.
#[derive(Debug, Default)]
pub struct RingStore {
    inner: Mutex<Option<RingInner>>,
}

impl RingStore {
    /// Creates an unconfigured ring store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> BufferResult<parking_lot::MutexGuard<'_, Option<RingInner>>> {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .ok_or(BufferError::Busy { timeout: LOCK_TIMEOUT })
    }

    /// Allocates (or reallocates) the ring for `max_entries` records of the
    /// given format and resets all counters.
    pub fn configure(&self, max_entries: usize, format: RecordFormat) -> BufferResult<()> {
        if max_entries == 0 || format.payload_size == 0 {
            return Err(BufferError::config_invalid(format!(
                "ring needs non-zero capacity and payload size (max_entries {}, payload {})",
                max_entries, format.payload_size
            )));
        }
        let mut guard = self.lock()?;
        // Release any existing storage before allocating the replacement.
        *guard = None;
        *guard = Some(RingInner::allocate(max_entries, format));
        Ok(())
    }

    /// Returns `true` once the store has been configured.
    pub fn is_configured(&self) -> bool {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .map(|g| g.is_some())
            .unwrap_or(false)
    }

    /// Inserts one poll result.
    ///
    /// `now_us` is passed in (rather than read from a clock) to seed the
    /// adjusted-timestamp base on the first put and to aid testing. On
    /// overflow the oldest record is overwritten and `drops` increments.
    pub fn put(&self, now_us: u64, seq: u32, data: &[u8]) -> BufferResult<()> {
        let mut guard = self.lock()?;
        let inner = guard.as_mut().ok_or(BufferError::NotConfigured)?;
        if data.len() != inner.format.payload_size {
            return Err(BufferError::size_mismatch(inner.format.payload_size, data.len()));
        }
        inner.put(now_us, seq, data);
        Ok(())
    }

    /// Copies up to `max_responses` records (0 = all) from `start_idx`
    /// entries past the oldest, optionally consuming them.
    ///
    /// A consuming get forces `start_idx` to 0. When `max_bytes` is
    /// non-zero the count is additionally capped by
    /// `max_bytes / (payload + meta)`.
    pub fn get(
        &self,
        max_responses: usize,
        max_bytes: usize,
        consume: bool,
        start_idx: usize,
    ) -> BufferResult<RecordBatch> {
        let mut guard = self.lock()?;
        let inner = guard.as_mut().ok_or(BufferError::NotConfigured)?;
        Ok(inner.get(max_responses, max_bytes, consume, start_idx))
    }

    /// Discards up to `n` of the oldest records, returning how many were
    /// discarded.
    pub fn consume(&self, n: usize) -> BufferResult<usize> {
        let mut guard = self.lock()?;
        let inner = guard.as_mut().ok_or(BufferError::NotConfigured)?;
        let consumed = n.min(inner.count);
        inner.count -= consumed;
        Ok(consumed)
    }

    /// Clears contents and counters, keeping the allocation.
    pub fn clear(&self) -> BufferResult<()> {
        let mut guard = self.lock()?;
        if let Some(inner) = guard.as_mut() {
            inner.reset_counters();
        }
        Ok(())
    }

    /// Snapshot of the store's stats (zeroed when unconfigured).
    pub fn stats(&self) -> OfflineStats {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .and_then(|g| g.as_ref().map(|inner| inner.stats()))
            .unwrap_or_default()
    }

    /// Current number of live records.
    pub fn depth(&self) -> usize {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .and_then(|g| g.as_ref().map(|inner| inner.count))
            .unwrap_or(0)
    }

    /// Configured capacity in records (0 when unconfigured).
    pub fn max_entries(&self) -> usize {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .and_then(|g| g.as_ref().map(|inner| inner.max_entries))
            .unwrap_or(0)
    }

    /// Configured payload size (0 when unconfigured).
    pub fn payload_size(&self) -> usize {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .and_then(|g| g.as_ref().map(|inner| inner.format.payload_size))
            .unwrap_or(0)
    }

    /// The configured record format, if any.
    pub fn format(&self) -> Option<RecordFormat> {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .and_then(|g| g.as_ref().map(|inner| inner.format))
    }

    /// Total bytes the ring occupies (payload + metadata arrays).
    pub fn capacity_bytes(&self) -> usize {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .and_then(|g| {
                g.as_ref()
                    .map(|inner| inner.max_entries * inner.format.record_size())
            })
            .unwrap_or(0)
    }

    /// The sequence number the next put will be assigned after.
    pub fn next_seq(&self) -> u32 {
        self.inner
            .try_lock_for(LOCK_TIMEOUT)
            .and_then(|g| g.as_ref().map(|inner| inner.next_seq))
            .unwrap_or(0)
    }

    /// Copies all records with sequence >= `from_seq` without consuming
    /// them, for appending to the persisted mirror.
    pub(crate) fn export_from(&self, from_seq: u32) -> BufferResult<Option<ExportBatch>> {
        let guard = self.lock()?;
        let inner = guard.as_ref().ok_or(BufferError::NotConfigured)?;
        Ok(inner.export_from(from_seq))
    }

    /// Reallocates the ring to `new_max` entries, preserving the newest
    /// `min(depth, new_max)` records (evictions count as drops).
    ///
    /// This is the rebalance path - the only operation allowed to shrink a
    /// configured ring. The new arrays are built and swapped in under the
    /// lock.
    pub(crate) fn resize(&self, new_max: usize) -> BufferResult<()> {
        if new_max == 0 {
            return Err(BufferError::config_invalid("ring resize to zero entries"));
        }
        let mut guard = self.lock()?;
        let inner = guard.as_mut().ok_or(BufferError::NotConfigured)?;
        if new_max != inner.max_entries {
            debug!(
                old_max = inner.max_entries,
                new_max,
                depth = inner.count,
                "Resizing ring store"
            );
            inner.resize(new_max);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
