// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Builders for stores and payloads.

use std::sync::Arc;

use tether_buffer::{DeviceBuffer, MemoryKv, PersistStore, RingStore};
use tether_core::types::RecordFormat;

/// Builds a payload of the given format whose leading bytes carry `raw_ts`
/// big-endian; remaining bytes are `fill`.
pub fn payload_with_ts(format: &RecordFormat, raw_ts: u32, fill: u8) -> Vec<u8> {
    let mut payload = vec![fill; format.payload_size];
    match format.timestamp_bytes {
        1 => payload[0] = raw_ts as u8,
        2 => payload[0..2].copy_from_slice(&(raw_ts as u16).to_be_bytes()),
        4 => payload[0..4].copy_from_slice(&raw_ts.to_be_bytes()),
        _ => {}
    }
    payload
}

/// A configured ring store.
pub fn ring_store(max_entries: usize, format: RecordFormat) -> RingStore {
    let ring = RingStore::new();
    ring.configure(max_entries, format).expect("ring configure");
    ring
}

/// A device buffer with a configured ring and a persisted mirror over the
/// given in-memory KV namespace.
pub async fn device_with_persist(
    kv: Arc<MemoryKv>,
    namespace: &str,
    format: RecordFormat,
    ring_max: usize,
    persist_max: u32,
) -> DeviceBuffer {
    let buffer = DeviceBuffer::with_persist(PersistStore::new(kv, namespace));
    buffer.configure(ring_max, format).expect("ring configure");
    buffer
        .configure_persist(format, persist_max)
        .await
        .expect("persist configure");
    buffer
}
