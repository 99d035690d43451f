// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Prometheus metrics for the buffering subsystem.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `tether_buffer_records_stored_total` | Counter | Records put into rings |
//! | `tether_buffer_records_drained_total` | Counter | Records drained for publish |
//! | `tether_buffer_records_dropped_total` | Counter | Records lost to overflow |
//! | `tether_buffer_ts_wraps_total` | Counter | Device timestamp wraps observed |
//! | `tether_buffer_persist_errors_total` | Counter | Persistence failures by operation |
//! | `tether_buffer_ring_depth` | Gauge | Summed live records across rings |
//! | `tether_buffer_ring_bytes` | Gauge | Summed RAM bytes across rings |

use once_cell::sync::Lazy;
use prometheus::{register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Gauge};

/// Records put into ring stores (cumulative).
static RECORDS_STORED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tether_buffer_records_stored_total",
        "Total records stored into offline ring buffers"
    )
    .expect("Failed to register records_stored_total metric")
});

/// Records drained for publishing (cumulative).
static RECORDS_DRAINED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tether_buffer_records_drained_total",
        "Total records drained from offline ring buffers"
    )
    .expect("Failed to register records_drained_total metric")
});

/// Records overwritten due to overflow (cumulative).
static RECORDS_DROPPED_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tether_buffer_records_dropped_total",
        "Total records dropped due to ring overflow"
    )
    .expect("Failed to register records_dropped_total metric")
});

/// Device timestamp wraps observed (cumulative).
static TS_WRAPS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tether_buffer_ts_wraps_total",
        "Total device timestamp counter wraps observed"
    )
    .expect("Failed to register ts_wraps_total metric")
});

/// Persistence failures by operation.
static PERSIST_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tether_buffer_persist_errors_total",
        "Total persistence failures by operation",
        &["operation"]
    )
    .expect("Failed to register persist_errors metric")
});

/// Current summed ring depth.
static RING_DEPTH: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "tether_buffer_ring_depth",
        "Current number of live records across all ring buffers"
    )
    .expect("Failed to register ring_depth metric")
});

/// Current summed ring RAM usage.
static RING_BYTES: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "tether_buffer_ring_bytes",
        "Current RAM bytes allocated across all ring buffers"
    )
    .expect("Failed to register ring_bytes metric")
});

// =============================================================================
// Collector
// =============================================================================

/// Thin facade over the registered metrics, held by the buffering core.
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferMetricsCollector;

impl BufferMetricsCollector {
    /// Creates a collector (forces metric registration).
    pub fn new() -> Self {
        Lazy::force(&RECORDS_STORED_TOTAL);
        Lazy::force(&RECORDS_DRAINED_TOTAL);
        Lazy::force(&RECORDS_DROPPED_TOTAL);
        Lazy::force(&TS_WRAPS_TOTAL);
        Lazy::force(&PERSIST_ERRORS);
        Lazy::force(&RING_DEPTH);
        Lazy::force(&RING_BYTES);
        Self
    }

    /// Records one stored record.
    #[inline]
    pub fn record_store(&self) {
        RECORDS_STORED_TOTAL.inc();
    }

    /// Records `count` drained records.
    #[inline]
    pub fn record_drain(&self, count: usize) {
        RECORDS_DRAINED_TOTAL.inc_by(count as f64);
    }

    /// Records `count` dropped records.
    #[inline]
    pub fn record_dropped(&self, count: u64) {
        RECORDS_DROPPED_TOTAL.inc_by(count as f64);
    }

    /// Records `count` timestamp wraps.
    #[inline]
    pub fn record_ts_wraps(&self, count: u64) {
        TS_WRAPS_TOTAL.inc_by(count as f64);
    }

    /// Records one persistence failure.
    #[inline]
    pub fn record_persist_error(&self, operation: &str) {
        PERSIST_ERRORS.with_label_values(&[operation]).inc();
    }

    /// Updates the depth/bytes gauges from a fresh aggregate.
    #[inline]
    pub fn update_usage(&self, depth: u64, bytes: u64) {
        RING_DEPTH.set(depth as f64);
        RING_BYTES.set(bytes as f64);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_updates() {
        let collector = BufferMetricsCollector::new();
        let before = RECORDS_STORED_TOTAL.get();
        collector.record_store();
        collector.record_drain(3);
        collector.record_dropped(2);
        collector.record_ts_wraps(1);
        collector.record_persist_error("append");
        collector.update_usage(10, 100);
        assert_eq!(RECORDS_STORED_TOTAL.get(), before + 1.0);
        assert_eq!(RING_DEPTH.get(), 10.0);
    }
}
