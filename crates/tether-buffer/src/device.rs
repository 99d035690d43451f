// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Per-device composition of the RAM ring and its persisted mirror.
//!
//! A `DeviceBuffer` owns one [`RingStore`], an optional [`PersistStore`]
//! mirroring it, the buffer/drain pause flags the control plane toggles,
//! and the device's monotonic sequence counter. Sequence numbers are
//! assigned at put time and keep advancing even while bufferization is
//! paused, so they stay unique for the life of the device and survive
//! restarts through the mirror.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, warn};

use tether_core::error::BufferResult;
use tether_core::types::{OfflineStats, RecordBatch, RecordFormat};

use crate::persist::PersistStore;
use crate::ring::RingStore;

/// One device's offline buffer: RAM ring, optional persisted mirror, pause
/// flags and sequence counter.
///
/// Producer (bus poller), consumer (publish loop) and control plane may
/// call into the buffer concurrently; each store serialises its own
/// operations and the flags are atomics.
#[derive(Debug)]
pub struct DeviceBuffer {
    ring: RingStore,
    persist: Option<PersistStore>,
    next_seq: AtomicU32,
    buffer_paused: AtomicBool,
    drain_paused: AtomicBool,
    rate_override_us: AtomicU32,
}

impl Default for DeviceBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBuffer {
    /// Creates a RAM-only device buffer.
    pub fn new() -> Self {
        Self {
            ring: RingStore::new(),
            persist: None,
            next_seq: AtomicU32::new(0),
            buffer_paused: AtomicBool::new(false),
            drain_paused: AtomicBool::new(false),
            rate_override_us: AtomicU32::new(0),
        }
    }

    /// Creates a device buffer with a persisted mirror attached.
    pub fn with_persist(persist: PersistStore) -> Self {
        Self {
            persist: Some(persist),
            ..Self::new()
        }
    }

    /// (Re)configures the RAM ring. The pause flags are preserved so a
    /// reconfiguration cannot accidentally resume buffering.
    pub fn configure(&self, max_entries: usize, format: RecordFormat) -> BufferResult<()> {
        self.ring.configure(max_entries, format)
    }

    /// Configures the persisted mirror (no-op without one attached). The
    /// mirror may retain more records than the RAM ring; rebalancing caps
    /// it via the store's effective maximum.
    pub async fn configure_persist(&self, format: RecordFormat, persist_max: u32) -> BufferResult<()> {
        let Some(persist) = &self.persist else {
            return Ok(());
        };
        persist.configure(format, persist_max).await
    }

    /// Re-populates the ring from the persisted mirror and adopts the
    /// persisted next sequence. Returns how many records were imported.
    pub async fn restore(&self) -> BufferResult<u32> {
        let Some(persist) = &self.persist else {
            return Ok(0);
        };
        let outcome = persist.import_to(&self.ring, 0).await?;
        if outcome.next_seq > 0 {
            self.next_seq.store(outcome.next_seq, Ordering::SeqCst);
        }
        if outcome.imported > 0 {
            debug!(
                namespace = persist.namespace(),
                imported = outcome.imported,
                next_seq = outcome.next_seq,
                "Restored offline buffer from persistence"
            );
        }
        Ok(outcome.imported)
    }

    /// Stores one poll result, assigning it the next sequence number.
    ///
    /// The record lands in the ring iff the ring is configured and
    /// bufferization is not paused; it is then mirrored to persistence via
    /// a catch-up append. A persistence failure is logged and demotes the
    /// mirror - the put itself still succeeds on the RAM side.
    pub async fn put_poll_result(&self, now_us: u64, payload: &[u8]) -> BufferResult<u32> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if !self.ring.is_configured() || self.buffer_paused.load(Ordering::Relaxed) {
            return Ok(seq);
        }
        self.ring.put(now_us, seq, payload)?;
        self.sync_to_persist().await;
        Ok(seq)
    }

    /// Appends any ring records the mirror has not yet seen.
    async fn sync_to_persist(&self) {
        let Some(persist) = &self.persist else {
            return;
        };
        if !persist.is_ready().await {
            return;
        }
        let from_seq = persist.next_seq().await;
        match self.ring.export_from(from_seq) {
            Ok(Some(batch)) => {
                if let Err(e) = persist.append_batch(&batch).await {
                    warn!(
                        namespace = persist.namespace(),
                        error = %e,
                        error_type = e.error_type(),
                        "Catch-up append failed, continuing RAM-only"
                    );
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Ring export for persistence failed");
            }
        }
    }

    /// Destructively reads up to `max_responses` records (0 = all).
    /// Returns an empty batch while draining is paused or the ring is
    /// unconfigured.
    pub fn drain(&self, max_responses: usize) -> BufferResult<RecordBatch> {
        if self.drain_paused.load(Ordering::Relaxed) || !self.ring.is_configured() {
            return Ok(RecordBatch::new(self.ring.payload_size()));
        }
        self.ring.get(max_responses, 0, true, 0)
    }

    /// Non-destructive read from `start_idx` entries past the oldest.
    /// Ignores the drain pause.
    pub fn peek(&self, start_idx: usize, max_responses: usize, max_bytes: usize) -> BufferResult<RecordBatch> {
        if !self.ring.is_configured() {
            return Ok(RecordBatch::new(0));
        }
        self.ring.get(max_responses, max_bytes, false, start_idx)
    }

    /// Clears the ring and the persisted mirror.
    pub async fn reset(&self) -> BufferResult<()> {
        self.ring.clear()?;
        if let Some(persist) = &self.persist {
            persist.clear().await;
        }
        Ok(())
    }

    /// Stats snapshot of the RAM ring.
    pub fn stats(&self) -> OfflineStats {
        self.ring.stats()
    }

    /// Pauses or resumes bufferization.
    pub fn set_buffer_paused(&self, paused: bool) {
        self.buffer_paused.store(paused, Ordering::Relaxed);
    }

    /// Returns `true` while bufferization is paused.
    pub fn is_buffer_paused(&self) -> bool {
        self.buffer_paused.load(Ordering::Relaxed)
    }

    /// Pauses or resumes draining.
    pub fn set_drain_paused(&self, paused: bool) {
        self.drain_paused.store(paused, Ordering::Relaxed);
    }

    /// Returns `true` while draining is paused.
    pub fn is_drain_paused(&self) -> bool {
        self.drain_paused.load(Ordering::Relaxed)
    }

    /// Overrides the sequence counter (used when adopting a persisted
    /// sequence).
    pub fn set_next_seq(&self, seq: u32) {
        self.next_seq.store(seq, Ordering::SeqCst);
    }

    /// The sequence number the next put will be assigned.
    pub fn next_seq(&self) -> u32 {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Sets the poll-rate override in microseconds (0 clears).
    pub fn set_rate_override_us(&self, rate_us: u32) {
        self.rate_override_us.store(rate_us, Ordering::Relaxed);
    }

    /// The poll-rate override in microseconds, if one is set.
    pub fn rate_override_us(&self) -> Option<u32> {
        match self.rate_override_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(us),
        }
    }

    /// Current number of buffered records.
    pub fn depth(&self) -> usize {
        self.ring.depth()
    }

    /// Returns `true` while buffered records are waiting to drain.
    pub fn has_backlog(&self) -> bool {
        self.depth() > 0
    }

    /// Total RAM bytes the ring occupies.
    pub fn alloc_bytes(&self) -> usize {
        self.ring.capacity_bytes()
    }

    /// Configured ring capacity in records.
    pub fn max_entries(&self) -> usize {
        self.ring.max_entries()
    }

    /// The configured record format, if any.
    pub fn format(&self) -> Option<RecordFormat> {
        self.ring.format()
    }

    /// Access to the ring for rebalance resizing.
    pub(crate) fn ring(&self) -> &RingStore {
        &self.ring
    }

    /// Access to the persisted mirror, if attached.
    pub(crate) fn persist(&self) -> Option<&PersistStore> {
        self.persist.as_ref()
    }
}

// =============================================================================
// Tests
// =============================================================================
