// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! # Buffer Integration Tests
//!
//! End-to-end coverage of the offline buffering data path:
//!
//! - Ring overflow, drop accounting and sequence continuity
//! - Timestamp wrap handling across puts and drains
//! - Peek vs. drain semantics
//! - Persisted mirror crash recovery and gap reset
//! - Concurrent producer/consumer behaviour

use std::sync::Arc;

use tether_buffer::{DeviceBuffer, MemoryKv, RingStore};
use tether_core::error::BufferError;

use tether_tests::common::{
    assertions::{assert_seqs_contiguous, assert_ts_non_decreasing},
    builders::{device_with_persist, payload_with_ts, ring_store},
    fixtures::{base_now_us, small_format, wide_format},
};

// =============================================================================
// Ring Scenarios
// =============================================================================

#[tokio::test]
async fn test_wrap_on_two_byte_timestamps() {
    // N=8, P=6, T=2, R=1000us: raw sequence dips at the fourth put.
    let format = small_format();
    let buffer = DeviceBuffer::new();
    buffer.configure(8, format).unwrap();

    for (i, raw) in [0x0010u32, 0x1000, 0xf000, 0x0005, 0x0100].iter().enumerate() {
        buffer
            .put_poll_result(base_now_us() + i as u64 * 1000, &payload_with_ts(&format, *raw, 0))
            .await
            .unwrap();
    }

    assert_eq!(buffer.stats().ts_wrap_count, 1);

    let batch = buffer.drain(0).unwrap();
    assert_eq!(batch.len(), 5);
    assert_seqs_contiguous(batch.metas());
    assert_ts_non_decreasing(batch.metas(), &format);
}

#[tokio::test]
async fn test_overflow_drops() {
    let format = small_format();
    let buffer = DeviceBuffer::new();
    buffer.configure(4, format).unwrap();

    for i in 0..7u32 {
        buffer
            .put_poll_result(base_now_us(), &payload_with_ts(&format, i, 0))
            .await
            .unwrap();
    }

    let stats = buffer.stats();
    assert_eq!(stats.depth, 4);
    assert_eq!(stats.drops, 3);
    assert_eq!(stats.first_seq, 3);
    assert_eq!(buffer.next_seq(), 7);
}

#[tokio::test]
async fn test_peek_then_drain() {
    let format = small_format();
    let buffer = DeviceBuffer::new();
    buffer.configure(4, format).unwrap();
    for i in 0..4u32 {
        buffer
            .put_poll_result(base_now_us(), &payload_with_ts(&format, i, i as u8))
            .await
            .unwrap();
    }
    let first_seq = buffer.stats().first_seq;

    // Peek from the second-oldest entry: no consumption.
    let peeked = buffer.peek(1, 2, 0).unwrap();
    let seqs: Vec<u32> = peeked.metas().iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![first_seq + 1, first_seq + 2]);
    assert_eq!(buffer.depth(), 4);

    // A subsequent drain starts from the oldest entry.
    let drained = buffer.drain(2).unwrap();
    let seqs: Vec<u32> = drained.metas().iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![first_seq, first_seq + 1]);
    assert_eq!(buffer.depth(), 2);
}

#[tokio::test]
async fn test_drop_accounting_closed_form() {
    let format = small_format();
    let buffer = DeviceBuffer::new();
    buffer.configure(4, format).unwrap();

    let total_puts = 23u32;
    let mut consumed = 0u32;
    for i in 0..total_puts {
        buffer
            .put_poll_result(base_now_us(), &payload_with_ts(&format, i, 0))
            .await
            .unwrap();
        if i % 5 == 4 {
            consumed += buffer.drain(2).unwrap().len() as u32;
        }
    }

    let stats = buffer.stats();
    assert_eq!(total_puts, stats.depth + consumed + stats.drops);
}

// =============================================================================
// Persistence Scenarios
// =============================================================================

#[tokio::test]
async fn test_persist_crash_recovery() {
    // RAM N=8, persist N=32, P=10: after a restart the ring holds the
    // newest 8 records and the device sequence resumes at 20.
    let format = wide_format();
    let kv = Arc::new(MemoryKv::new());

    let buffer = device_with_persist(kv.clone(), "ob_i2ca_0041", format, 8, 32).await;
    for i in 0..20u32 {
        buffer
            .put_poll_result(base_now_us() + i as u64 * 1000, &payload_with_ts(&format, i, 0))
            .await
            .unwrap();
    }
    // The RAM ring wrapped; the wider mirror kept everything.
    assert_eq!(buffer.stats().first_seq, 12);

    // Simulated power loss: a fresh device buffer over the same namespace.
    let revived = device_with_persist(kv, "ob_i2ca_0041", format, 8, 32).await;
    assert_eq!(revived.restore().await.unwrap(), 8);
    assert_eq!(revived.next_seq(), 20);

    let batch = revived.drain(0).unwrap();
    let seqs: Vec<u32> = batch.metas().iter().map(|m| m.seq).collect();
    assert_eq!(seqs, (12..20).collect::<Vec<u32>>());
}

#[tokio::test]
async fn test_persist_roundtrip_preserves_payloads() {
    let format = small_format();
    let kv = Arc::new(MemoryKv::new());
    let buffer = device_with_persist(kv.clone(), "ob_i2ca_0041", format, 6, 32).await;

    let mut sent: Vec<Vec<u8>> = Vec::new();
    for i in 0..9u32 {
        let payload = payload_with_ts(&format, i * 3, 0x40 + i as u8);
        buffer.put_poll_result(base_now_us(), &payload).await.unwrap();
        sent.push(payload);
    }

    let revived = device_with_persist(kv, "ob_i2ca_0041", format, 6, 32).await;
    revived.restore().await.unwrap();
    assert_eq!(revived.next_seq(), 9);

    // The fresh ring holds the last min(N_ring, persisted) puts, in order,
    // with identical payloads.
    let batch = revived.drain(0).unwrap();
    assert_eq!(batch.len(), 6);
    assert_seqs_contiguous(batch.metas());
    for (i, (meta, payload)) in batch.iter().enumerate() {
        assert_eq!(meta.seq, 3 + i as u32);
        assert_eq!(payload, sent[3 + i].as_slice());
    }
}

#[tokio::test]
async fn test_persist_gap_resets_mirror() {
    let format = small_format();
    let kv = Arc::new(MemoryKv::new());
    let buffer = device_with_persist(kv.clone(), "ob_i2ca_0041", format, 4, 32).await;

    for i in 0..3u32 {
        buffer.put_poll_result(base_now_us(), &payload_with_ts(&format, i, 0)).await.unwrap();
    }

    // Persistence fails for a stretch: the mirror demotes while the ring
    // wraps well past the persisted suffix.
    kv.set_fail_writes(true);
    for i in 3..13u32 {
        buffer.put_poll_result(base_now_us(), &payload_with_ts(&format, i, 0)).await.unwrap();
    }
    kv.set_fail_writes(false);

    // Re-arming the mirror and putting again offers a batch whose first
    // sequence is beyond the persisted next_seq: full reset, then append.
    buffer.configure_persist(format, 32).await.unwrap();
    buffer.put_poll_result(base_now_us(), &payload_with_ts(&format, 13, 0)).await.unwrap();

    let revived = device_with_persist(kv, "ob_i2ca_0041", format, 4, 32).await;
    revived.restore().await.unwrap();
    let batch = revived.drain(0).unwrap();
    let seqs: Vec<u32> = batch.metas().iter().map(|m| m.seq).collect();
    assert_eq!(seqs, vec![10, 11, 12, 13]);
    assert_eq!(revived.next_seq(), 14);
}

#[tokio::test]
async fn test_persist_meta_mismatch_wipes_only_persist() {
    let format = small_format();
    let kv = Arc::new(MemoryKv::new());
    let buffer = device_with_persist(kv.clone(), "ob_i2ca_0041", format, 4, 32).await;
    for i in 0..3u32 {
        buffer.put_poll_result(base_now_us(), &payload_with_ts(&format, i, 0)).await.unwrap();
    }

    // A layout change (wider payload) must reinitialise the namespace
    // rather than try to migrate it.
    let widened = wide_format();
    let revived = device_with_persist(kv, "ob_i2ca_0041", widened, 4, 32).await;
    assert_eq!(revived.restore().await.unwrap(), 0);
    assert_eq!(revived.depth(), 0);

    // The new layout then persists normally.
    revived.put_poll_result(base_now_us(), &payload_with_ts(&widened, 1, 0)).await.unwrap();
    assert_eq!(revived.depth(), 1);
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_put_and_drain() {
    let format = small_format();
    let buffer = Arc::new(DeviceBuffer::new());
    buffer.configure(64, format).unwrap();

    let producer = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            for i in 0..500u32 {
                let payload = payload_with_ts(&format, i % 1000, 0);
                loop {
                    match buffer.put_poll_result(base_now_us() + i as u64 * 1000, &payload).await {
                        Ok(_) => break,
                        Err(BufferError::Busy { .. }) => tokio::task::yield_now().await,
                        Err(e) => panic!("put failed: {e}"),
                    }
                }
            }
        })
    };

    let consumer = {
        let buffer = buffer.clone();
        tokio::spawn(async move {
            let mut drained = 0usize;
            let mut last_seq: Option<u32> = None;
            while drained < 200 {
                match buffer.drain(16) {
                    Ok(batch) => {
                        for meta in batch.metas() {
                            if let Some(last) = last_seq {
                                assert!(meta.seq > last, "drained seqs must increase");
                            }
                            last_seq = Some(meta.seq);
                        }
                        drained += batch.len();
                    }
                    Err(BufferError::Busy { .. }) => {}
                    Err(e) => panic!("drain failed: {e}"),
                }
                tokio::task::yield_now().await;
            }
            drained
        })
    };

    producer.await.unwrap();
    let drained = consumer.await.unwrap();

    let stats = buffer.stats();
    assert_eq!(500, stats.depth as usize + drained + stats.drops as usize);
}

// =============================================================================
// Error Surfacing
// =============================================================================

#[tokio::test]
async fn test_ring_size_mismatch_is_rejected() {
    let ring = ring_store(4, small_format());
    let err = ring.put(base_now_us(), 0, &[0u8; 3]).unwrap_err();
    assert!(matches!(err, BufferError::SizeMismatch { expected: 6, actual: 3 }));
}

#[tokio::test]
async fn test_unconfigured_ring_reports_not_configured() {
    let ring = RingStore::new();
    assert!(matches!(
        ring.get(0, 0, true, 0),
        Err(BufferError::NotConfigured)
    ));
}
