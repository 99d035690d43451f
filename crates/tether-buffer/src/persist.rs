// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Segmented persisted mirror of a ring store.
//!
//! Each device gets one key-value namespace holding a packed metadata block
//! under `meta` and data segments under `s00000`, `s00001`, ... Every
//! segment is a single blob of `records_per_segment` packed records
//! `(adj_ts_ms: u32 LE, payload: P bytes)`, sized to stay within one
//! non-volatile storage page (4000 bytes nominal).
//!
//! The mirror receives catch-up appends while running and re-populates the
//! RAM ring on boot via [`PersistStore::import_to`]. Mismatched metadata
//! (layout change, version bump) wipes and reinitialises the namespace;
//! sequence gaps reset it so the persisted records always form a contiguous
//! suffix `[next_seq - count, next_seq)`.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tether_core::error::{BufferError, BufferResult};
use tether_core::types::RecordFormat;

use crate::kv::{KvError, KvStore};
use crate::ring::{ExportBatch, RingStore};

/// Magic tag of the persisted metadata block ("OBNV").
pub const PERSIST_META_MAGIC: u32 = 0x4f42_4e56;

/// Version of the persisted layout.
pub const PERSIST_META_VERSION: u32 = 2;

/// Nominal segment blob size - one non-volatile storage page.
pub const PERSIST_SEGMENT_BYTES: u32 = 4000;

const META_KEY: &str = "meta";

/// Records imported between cooperative yields.
const IMPORT_YIELD_INTERVAL: usize = 512;

// =============================================================================
// Persisted Metadata
// =============================================================================

/// The packed little-endian metadata block (14 x u32).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct PersistMeta {
    magic: u32,
    version: u32,
    payload_size: u32,
    record_size: u32,
    timestamp_bytes: u32,
    timestamp_resolution_us: u32,
    max_entries: u32,
    head: u32,
    count: u32,
    next_seq: u32,
    /// High-water of records already imported into RAM: the next sequence
    /// to import (0 = nothing imported yet).
    import_seq: u32,
    records_per_segment: u32,
    segment_bytes: u32,
    drops: u32,
}

impl PersistMeta {
    const ENCODED_LEN: usize = 14 * 4;

    fn fresh(format: &RecordFormat, max_entries: u32) -> Self {
        let record_size = format.record_size() as u32;
        Self {
            magic: PERSIST_META_MAGIC,
            version: PERSIST_META_VERSION,
            payload_size: format.payload_size as u32,
            record_size,
            timestamp_bytes: format.timestamp_bytes,
            timestamp_resolution_us: format.timestamp_resolution_us,
            max_entries,
            head: 0,
            count: 0,
            next_seq: 0,
            import_seq: 0,
            records_per_segment: if record_size > 0 {
                PERSIST_SEGMENT_BYTES / record_size
            } else {
                0
            },
            segment_bytes: PERSIST_SEGMENT_BYTES,
            drops: 0,
        }
    }

    fn fields(&self) -> [u32; 14] {
        [
            self.magic,
            self.version,
            self.payload_size,
            self.record_size,
            self.timestamp_bytes,
            self.timestamp_resolution_us,
            self.max_entries,
            self.head,
            self.count,
            self.next_seq,
            self.import_seq,
            self.records_per_segment,
            self.segment_bytes,
            self.drops,
        ]
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        for field in self.fields() {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out
    }

    fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != Self::ENCODED_LEN {
            return None;
        }
        let mut fields = [0u32; 14];
        for (i, chunk) in data.chunks_exact(4).enumerate() {
            fields[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Some(Self {
            magic: fields[0],
            version: fields[1],
            payload_size: fields[2],
            record_size: fields[3],
            timestamp_bytes: fields[4],
            timestamp_resolution_us: fields[5],
            max_entries: fields[6],
            head: fields[7],
            count: fields[8],
            next_seq: fields[9],
            import_seq: fields[10],
            records_per_segment: fields[11],
            segment_bytes: fields[12],
            drops: fields[13],
        })
    }

    fn is_compatible_with(&self, format: &RecordFormat) -> bool {
        self.magic == PERSIST_META_MAGIC
            && self.version == PERSIST_META_VERSION
            && self.payload_size as usize == format.payload_size
            && self.timestamp_bytes == format.timestamp_bytes
            && self.timestamp_resolution_us == format.timestamp_resolution_us
            && self.record_size as usize == format.record_size()
            && self.records_per_segment > 0
            && self.segment_bytes > 0
    }

    fn first_seq_in_store(&self) -> u32 {
        if self.next_seq >= self.count {
            self.next_seq - self.count
        } else {
            0
        }
    }
}

// =============================================================================
// Import Outcome
// =============================================================================

/// Result of importing persisted records into a RAM ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// Records imported this call.
    pub imported: u32,
    /// The persisted next sequence - the per-device counter resumes here.
    pub next_seq: u32,
}

// =============================================================================
// Persist Store
// =============================================================================

#[derive(Debug, Default)]
struct PersistState {
    meta: PersistMeta,
    meta_valid: bool,
    ready: bool,
    effective_max: u32,
}

/// Persisted append-only mirror of one device's ring store.
#[derive(Debug)]
pub struct PersistStore {
    kv: Arc<dyn KvStore>,
    namespace: String,
    state: Mutex<PersistState>,
}

impl PersistStore {
    /// Creates an unconfigured store over a namespace of the given driver.
    pub fn new(kv: Arc<dyn KvStore>, namespace: impl Into<String>) -> Self {
        Self {
            kv,
            namespace: namespace.into(),
            state: Mutex::new(PersistState::default()),
        }
    }

    /// The namespace this store persists into.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Opens the namespace and loads or initialises its metadata.
    ///
    /// Existing metadata that does not match the offered layout triggers a
    /// wipe-and-reinit (there is no migration). Returns `ConfigInvalid`
    /// when a record cannot fit a segment.
    pub async fn configure(&self, format: RecordFormat, max_entries: u32) -> BufferResult<()> {
        if format.payload_size == 0 || max_entries == 0 {
            return Err(BufferError::config_invalid(
                "persist store needs non-zero payload size and capacity",
            ));
        }

        let mut st = self.state.lock().await;
        st.ready = false;
        st.meta_valid = false;

        let loaded = match self.kv.get_blob(&self.namespace, META_KEY).await {
            Ok(Some(bytes)) => PersistMeta::decode(&bytes)
                .filter(|m| m.magic == PERSIST_META_MAGIC && m.version == PERSIST_META_VERSION),
            Ok(None) => None,
            Err(e) => {
                return Err(BufferError::persist_io(format!(
                    "meta load failed for {}: {}",
                    self.namespace, e
                )));
            }
        };

        match loaded {
            Some(meta) if meta.is_compatible_with(&format) => {
                st.meta = meta;
            }
            Some(meta) => {
                warn!(
                    namespace = %self.namespace,
                    persisted_payload = meta.payload_size,
                    offered_payload = format.payload_size,
                    error_type = BufferError::PersistMismatch.error_type(),
                    "Persisted meta mismatch, wiping namespace"
                );
                if let Err(e) = self.kv.erase_namespace(&self.namespace).await {
                    return Err(BufferError::persist_io(format!(
                        "wipe failed for {}: {}",
                        self.namespace, e
                    )));
                }
                st.meta = PersistMeta::fresh(&format, max_entries);
            }
            None => {
                st.meta = PersistMeta::fresh(&format, max_entries);
            }
        }

        if st.meta.records_per_segment == 0 {
            return Err(BufferError::config_invalid(format!(
                "record size {} does not fit segment of {} bytes",
                format.record_size(),
                PERSIST_SEGMENT_BYTES
            )));
        }

        self.save_meta(&mut st).await?;
        st.meta_valid = true;
        st.ready = true;
        st.effective_max = st.meta.max_entries;
        debug!(
            namespace = %self.namespace,
            count = st.meta.count,
            next_seq = st.meta.next_seq,
            "Persist store configured"
        );
        Ok(())
    }

    /// Caps how many records the store retains: `min(max_entries, N)`.
    ///
    /// Shrinking below the current count discards the oldest records,
    /// accounted as drops.
    pub async fn set_effective_max(&self, max_entries: u32) -> BufferResult<()> {
        let mut st = self.state.lock().await;
        if !st.meta_valid {
            return Err(BufferError::NotConfigured);
        }
        st.effective_max = if max_entries == 0 || max_entries > st.meta.max_entries {
            st.meta.max_entries
        } else {
            max_entries
        };
        if st.meta.count > st.effective_max {
            let trimmed = st.meta.count - st.effective_max;
            st.meta.drops += trimmed;
            st.meta.count = st.effective_max;
            self.save_meta(&mut st).await?;
        }
        Ok(())
    }

    /// Appends a run of records from the RAM ring.
    ///
    /// The batch's first sequence must continue the persisted suffix:
    /// already-persisted overlap is skipped, and a gap resets the store
    /// before appending. Returns the last sequence now persisted.
    pub async fn append_batch(&self, batch: &ExportBatch) -> BufferResult<Option<u32>> {
        let mut st = self.state.lock().await;
        if !st.ready || !st.meta_valid {
            return Err(BufferError::NotConfigured);
        }
        if batch.payload_size != st.meta.payload_size as usize {
            return Err(BufferError::size_mismatch(
                st.meta.payload_size as usize,
                batch.payload_size,
            ));
        }
        let count = batch.len();
        if count == 0 {
            return Ok(None);
        }
        if batch.payloads.len() < count * batch.payload_size {
            return Err(BufferError::size_mismatch(
                count * batch.payload_size,
                batch.payloads.len(),
            ));
        }

        let effective_max = if st.effective_max > 0 {
            st.effective_max
        } else {
            st.meta.max_entries
        };

        if st.meta.count == 0 {
            st.meta.next_seq = batch.first_seq;
        } else if batch.first_seq > st.meta.next_seq {
            let gap = BufferError::gap_detected(st.meta.next_seq, batch.first_seq);
            warn!(
                namespace = %self.namespace,
                expected_seq = st.meta.next_seq,
                first_seq = batch.first_seq,
                error_type = gap.error_type(),
                "Sequence gap in persisted log, resetting namespace"
            );
            let format = RecordFormat::new(
                st.meta.payload_size as usize,
                st.meta.timestamp_bytes,
                st.meta.timestamp_resolution_us,
            );
            let max_entries = st.meta.max_entries;
            if let Err(e) = self.kv.erase_namespace(&self.namespace).await {
                st.ready = false;
                return Err(BufferError::persist_io(format!(
                    "reset wipe failed for {}: {}",
                    self.namespace, e
                )));
            }
            st.meta = PersistMeta::fresh(&format, max_entries);
            self.save_meta(&mut st).await?;
            st.meta.next_seq = batch.first_seq;
        }

        let mut skip = 0usize;
        if batch.first_seq < st.meta.next_seq {
            let diff = (st.meta.next_seq - batch.first_seq) as usize;
            if diff >= count {
                // Everything already persisted.
                return Ok(Some(st.meta.next_seq.wrapping_sub(1)));
            }
            skip = diff;
        }

        let record_size = st.meta.record_size as usize;
        let seg_records = st.meta.records_per_segment as usize;
        let seg_len = seg_records * record_size;
        let mut seg_buf = vec![0u8; seg_len];
        let mut current_seg: Option<u32> = None;
        let mut dirty = false;
        let mut last_seq = None;

        for ii in skip..count {
            let seq = batch.first_seq + ii as u32;
            let write_idx = st.meta.head as usize;
            let seg_idx = (write_idx / seg_records) as u32;
            let seg_off = (write_idx % seg_records) * record_size;

            if current_seg != Some(seg_idx) {
                if dirty {
                    if let Err(e) = self.write_segment(current_seg.unwrap_or(0), &seg_buf).await {
                        st.ready = false;
                        return Err(e.into());
                    }
                    dirty = false;
                }
                current_seg = Some(seg_idx);
                if !self.read_segment(seg_idx, &mut seg_buf).await {
                    seg_buf.fill(0);
                }
            }

            seg_buf[seg_off..seg_off + 4].copy_from_slice(&batch.adj_ts_ms[ii].to_le_bytes());
            let poff = ii * batch.payload_size;
            seg_buf[seg_off + 4..seg_off + record_size]
                .copy_from_slice(&batch.payloads[poff..poff + batch.payload_size]);
            dirty = true;

            st.meta.head = (st.meta.head + 1) % st.meta.max_entries;
            if st.meta.count < effective_max {
                st.meta.count += 1;
            } else {
                st.meta.drops += 1;
            }
            st.meta.next_seq = seq.wrapping_add(1);
            last_seq = Some(seq);
        }

        if dirty {
            if let Err(e) = self.write_segment(current_seg.unwrap_or(0), &seg_buf).await {
                st.ready = false;
                return Err(e.into());
            }
        }
        self.save_meta(&mut st).await?;
        Ok(last_seq)
    }

    /// Imports persisted records into a RAM ring, oldest first.
    ///
    /// The import window covers the newest
    /// `min(import_max, dest capacity, available)` records not yet imported
    /// (`import_max` of 0 means the destination capacity), so a freshly
    /// configured ring ends up holding the last `min(N, count)` puts.
    /// Yields to the runtime every few hundred records.
    pub async fn import_to(&self, dest: &RingStore, import_max: usize) -> BufferResult<ImportOutcome> {
        let mut st = self.state.lock().await;
        if !st.ready || !st.meta_valid {
            return Err(BufferError::NotConfigured);
        }
        let next_seq = st.meta.next_seq;
        if st.meta.count == 0 {
            return Ok(ImportOutcome { imported: 0, next_seq });
        }

        let mut cap = dest.max_entries();
        if import_max > 0 {
            cap = cap.min(import_max);
        }
        if cap == 0 {
            return Err(BufferError::NotConfigured);
        }

        let first_in_store = st.meta.first_seq_in_store();
        let mut start_seq = st.meta.import_seq.max(first_in_store);
        if start_seq >= next_seq {
            return Ok(ImportOutcome { imported: 0, next_seq });
        }
        // Keep only the newest records that fit the destination.
        if (next_seq - start_seq) as usize > cap {
            start_seq = next_seq - cap as u32;
        }
        let import_count = (next_seq - start_seq) as usize;

        let record_size = st.meta.record_size as usize;
        let seg_records = st.meta.records_per_segment as usize;
        let mut seg_buf = vec![0u8; seg_records * record_size];
        let mut current_seg: Option<u32> = None;

        let max_entries = st.meta.max_entries as usize;
        let tail = (st.meta.head as usize + max_entries - st.meta.count as usize) % max_entries;
        let start_idx = (tail + (start_seq - first_in_store) as usize) % max_entries;

        for ii in 0..import_count {
            let rec_idx = (start_idx + ii) % max_entries;
            let seg_idx = (rec_idx / seg_records) as u32;
            let seg_off = (rec_idx % seg_records) * record_size;

            if current_seg != Some(seg_idx) {
                current_seg = Some(seg_idx);
                if !self.read_segment(seg_idx, &mut seg_buf).await {
                    return Err(BufferError::persist_io(format!(
                        "segment {} unreadable in {}",
                        seg_idx, self.namespace
                    )));
                }
            }

            let adj_ts_ms = u32::from_le_bytes([
                seg_buf[seg_off],
                seg_buf[seg_off + 1],
                seg_buf[seg_off + 2],
                seg_buf[seg_off + 3],
            ]);
            let payload = &seg_buf[seg_off + 4..seg_off + record_size];
            // The first record seeds the destination's timestamp base from
            // its stored adjusted time; the rest replay through the normal
            // wrap logic.
            let now_us = if ii == 0 { adj_ts_ms as u64 * 1000 } else { 0 };
            dest.put(now_us, start_seq + ii as u32, payload)?;

            if ii % IMPORT_YIELD_INTERVAL == 0 {
                tokio::task::yield_now().await;
            }
        }

        st.meta.import_seq = start_seq + import_count as u32;
        if let Err(e) = self.save_meta(&mut st).await {
            warn!(
                namespace = %self.namespace,
                error = %e,
                "Import high-water not persisted"
            );
        }
        debug!(
            namespace = %self.namespace,
            imported = import_count,
            next_seq,
            "Imported persisted records into ring"
        );
        Ok(ImportOutcome {
            imported: import_count as u32,
            next_seq,
        })
    }

    /// Erases every key in the namespace and invalidates the store.
    pub async fn clear(&self) {
        let mut st = self.state.lock().await;
        if let Err(e) = self.kv.erase_namespace(&self.namespace).await {
            warn!(namespace = %self.namespace, error = %e, "Namespace erase failed");
        }
        st.meta_valid = false;
        st.ready = false;
    }

    /// Returns `true` while the store is configured and usable.
    pub async fn is_ready(&self) -> bool {
        let st = self.state.lock().await;
        st.ready && st.meta_valid
    }

    /// Persisted record count.
    pub async fn count(&self) -> u32 {
        let st = self.state.lock().await;
        if st.meta_valid {
            st.meta.count
        } else {
            0
        }
    }

    /// Persisted next sequence.
    pub async fn next_seq(&self) -> u32 {
        let st = self.state.lock().await;
        if st.meta_valid {
            st.meta.next_seq
        } else {
            0
        }
    }

    /// Persisted drop count.
    pub async fn drops(&self) -> u32 {
        let st = self.state.lock().await;
        if st.meta_valid {
            st.meta.drops
        } else {
            0
        }
    }

    async fn save_meta(&self, st: &mut PersistState) -> BufferResult<()> {
        if let Err(e) = self
            .kv
            .put_blob(&self.namespace, META_KEY, &st.meta.encode())
            .await
        {
            st.ready = false;
            warn!(namespace = %self.namespace, error = %e, "Meta save failed, persist store demoted");
            return Err(BufferError::persist_io(format!(
                "meta save failed for {}: {}",
                self.namespace, e
            )));
        }
        Ok(())
    }

    async fn read_segment(&self, seg_idx: u32, buf: &mut [u8]) -> bool {
        match self.kv.get_blob(&self.namespace, &segment_key(seg_idx)).await {
            Ok(Some(bytes)) if bytes.len() == buf.len() => {
                buf.copy_from_slice(&bytes);
                true
            }
            Ok(Some(bytes)) => {
                warn!(
                    namespace = %self.namespace,
                    segment = seg_idx,
                    expected = buf.len(),
                    actual = bytes.len(),
                    "Segment length mismatch"
                );
                false
            }
            Ok(None) => false,
            Err(e) => {
                warn!(namespace = %self.namespace, segment = seg_idx, error = %e, "Segment read failed");
                false
            }
        }
    }

    async fn write_segment(&self, seg_idx: u32, data: &[u8]) -> Result<(), KvError> {
        self.kv
            .put_blob(&self.namespace, &segment_key(seg_idx), data)
            .await
    }
}

fn segment_key(seg_idx: u32) -> String {
    format!("s{:05}", seg_idx)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn format() -> RecordFormat {
        RecordFormat::new(6, 2, 1000)
    }

    fn export(first_seq: u32, raws: &[u32]) -> ExportBatch {
        let mut payloads = Vec::new();
        let mut adj = Vec::new();
        for (i, raw) in raws.iter().enumerate() {
            let mut p = vec![(first_seq as usize + i) as u8; 6];
            p[0..2].copy_from_slice(&(*raw as u16).to_be_bytes());
            payloads.extend_from_slice(&p);
            adj.push(*raw);
        }
        ExportBatch {
            first_seq,
            payload_size: 6,
            payloads,
            adj_ts_ms: adj,
        }
    }

    #[test]
    fn test_meta_codec_roundtrip() {
        let mut meta = PersistMeta::fresh(&format(), 32);
        meta.head = 3;
        meta.count = 7;
        meta.next_seq = 42;
        meta.import_seq = 40;
        meta.drops = 2;

        let encoded = meta.encode();
        assert_eq!(encoded.len(), PersistMeta::ENCODED_LEN);
        assert_eq!(&encoded[0..4], &PERSIST_META_MAGIC.to_le_bytes());
        assert_eq!(PersistMeta::decode(&encoded), Some(meta));
        assert_eq!(PersistMeta::decode(&encoded[1..]), None);
    }

    #[test]
    fn test_meta_fresh_segmenting() {
        let meta = PersistMeta::fresh(&format(), 32);
        // 10-byte records in a 4000-byte segment.
        assert_eq!(meta.records_per_segment, 400);
        assert_eq!(meta.segment_bytes, PERSIST_SEGMENT_BYTES);
    }

    #[test]
    fn test_segment_key_format() {
        assert_eq!(segment_key(0), "s00000");
        assert_eq!(segment_key(12), "s00012");
    }

    #[tokio::test]
    async fn test_configure_fresh_and_reload() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv.clone(), "ob_test");
        store.configure(format(), 32).await.unwrap();
        assert!(store.is_ready().await);

        store.append_batch(&export(0, &[1, 2, 3])).await.unwrap();
        assert_eq!(store.count().await, 3);

        // A second store over the same namespace sees the same contents.
        let reopened = PersistStore::new(kv, "ob_test");
        reopened.configure(format(), 32).await.unwrap();
        assert_eq!(reopened.count().await, 3);
        assert_eq!(reopened.next_seq().await, 3);
    }

    #[tokio::test]
    async fn test_configure_mismatch_wipes() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv.clone(), "ob_test");
        store.configure(format(), 32).await.unwrap();
        store.append_batch(&export(0, &[1, 2, 3])).await.unwrap();

        // Different payload size invalidates the persisted layout.
        let store = PersistStore::new(kv, "ob_test");
        store.configure(RecordFormat::new(8, 2, 1000), 32).await.unwrap();
        assert!(store.is_ready().await);
        assert_eq!(store.count().await, 0);
        assert_eq!(store.next_seq().await, 0);
    }

    #[tokio::test]
    async fn test_configure_rejects_oversized_record() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv, "ob_test");
        let err = store
            .configure(RecordFormat::new(5000, 2, 1000), 8)
            .await
            .unwrap_err();
        assert!(matches!(err, BufferError::ConfigInvalid { .. }));
        assert!(!store.is_ready().await);
    }

    #[tokio::test]
    async fn test_append_overlap_skipped() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv, "ob_test");
        store.configure(format(), 32).await.unwrap();

        store.append_batch(&export(0, &[1, 2, 3])).await.unwrap();
        // Re-offer records 1..=4: 1 and 2 are already persisted.
        let last = store.append_batch(&export(1, &[2, 3, 4, 5])).await.unwrap();
        assert_eq!(last, Some(4));
        assert_eq!(store.count().await, 5);
        assert_eq!(store.next_seq().await, 5);

        // Fully-overlapping batch is a no-op.
        let last = store.append_batch(&export(0, &[1, 2])).await.unwrap();
        assert_eq!(last, Some(4));
        assert_eq!(store.count().await, 5);
    }

    #[tokio::test]
    async fn test_append_gap_resets() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv, "ob_test");
        store.configure(format(), 32).await.unwrap();

        store.append_batch(&export(0, &[1, 2, 3])).await.unwrap();
        // Jump from next_seq 3 to 10.
        store.append_batch(&export(10, &[4, 5])).await.unwrap();
        assert_eq!(store.count().await, 2);
        assert_eq!(store.next_seq().await, 12);
    }

    #[tokio::test]
    async fn test_effective_max_trims_oldest() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv, "ob_test");
        store.configure(format(), 32).await.unwrap();
        store
            .append_batch(&export(0, &[1, 2, 3, 4, 5, 6, 7, 8]))
            .await
            .unwrap();

        store.set_effective_max(5).await.unwrap();
        assert_eq!(store.count().await, 5);
        assert_eq!(store.drops().await, 3);

        // 0 or over-capacity restores the stored maximum.
        store.set_effective_max(0).await.unwrap();
        store.set_effective_max(100).await.unwrap();
        assert_eq!(store.count().await, 5);
    }

    #[tokio::test]
    async fn test_import_newest_window() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv, "ob_test");
        store.configure(format(), 32).await.unwrap();
        let raws: Vec<u32> = (0..20).collect();
        store.append_batch(&export(0, &raws)).await.unwrap();

        let ring = RingStore::new();
        ring.configure(8, format()).unwrap();
        let outcome = store.import_to(&ring, 0).await.unwrap();
        assert_eq!(outcome.imported, 8);
        assert_eq!(outcome.next_seq, 20);

        let batch = ring.get(0, 0, false, 0).unwrap();
        let seqs: Vec<u32> = batch.metas().iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (12..20).collect::<Vec<u32>>());
        assert_eq!(ring.next_seq(), 20);
    }

    #[tokio::test]
    async fn test_import_is_incremental() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv, "ob_test");
        store.configure(format(), 32).await.unwrap();
        store.append_batch(&export(0, &[1, 2, 3])).await.unwrap();

        let ring = RingStore::new();
        ring.configure(8, format()).unwrap();
        assert_eq!(store.import_to(&ring, 0).await.unwrap().imported, 3);
        // Nothing new to import the second time.
        assert_eq!(store.import_to(&ring, 0).await.unwrap().imported, 0);

        store.append_batch(&export(3, &[4, 5])).await.unwrap();
        assert_eq!(store.import_to(&ring, 0).await.unwrap().imported, 2);
    }

    #[tokio::test]
    async fn test_multi_segment_append_and_import() {
        // 2-byte payloads -> 6-byte records -> 666 per segment; cross the
        // boundary with a capacity larger than one segment.
        let fmt = RecordFormat::new(2, 1, 1000);
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv.clone(), "ob_test");
        store.configure(fmt, 1000).await.unwrap();

        let n = 700u32;
        let mut payloads = Vec::new();
        let mut adj = Vec::new();
        for i in 0..n {
            payloads.extend_from_slice(&[(i % 251) as u8, 0]);
            adj.push(i);
        }
        let batch = ExportBatch {
            first_seq: 0,
            payload_size: 2,
            payloads,
            adj_ts_ms: adj,
        };
        store.append_batch(&batch).await.unwrap();
        assert_eq!(store.count().await, 700);
        // meta + two segments
        assert_eq!(kv.key_count("ob_test"), 3);

        let ring = RingStore::new();
        ring.configure(1000, fmt).unwrap();
        let outcome = store.import_to(&ring, 0).await.unwrap();
        assert_eq!(outcome.imported, 700);
        let got = ring.get(0, 0, false, 0).unwrap();
        assert_eq!(got.payload(699)[0], (699u32 % 251) as u8);
    }

    #[tokio::test]
    async fn test_write_failure_demotes_store() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv.clone(), "ob_test");
        store.configure(format(), 32).await.unwrap();

        kv.set_fail_writes(true);
        let err = store.append_batch(&export(0, &[1])).await.unwrap_err();
        assert!(matches!(err, BufferError::PersistIo { .. }));
        assert!(!store.is_ready().await);
    }

    #[tokio::test]
    async fn test_clear_invalidates() {
        let kv = Arc::new(MemoryKv::new());
        let store = PersistStore::new(kv.clone(), "ob_test");
        store.configure(format(), 32).await.unwrap();
        store.append_batch(&export(0, &[1, 2])).await.unwrap();

        store.clear().await;
        assert!(!store.is_ready().await);
        assert_eq!(kv.key_count("ob_test"), 0);
        assert!(matches!(
            store.append_batch(&export(2, &[3])).await,
            Err(BufferError::NotConfigured)
        ));
    }
}
