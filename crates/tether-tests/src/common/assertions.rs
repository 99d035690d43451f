// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Assertions over drained record batches.

use tether_core::types::{RecordFormat, RecordMeta};

/// Asserts that metas carry strictly increasing, gap-free sequence
/// numbers.
pub fn assert_seqs_contiguous(metas: &[RecordMeta]) {
    for pair in metas.windows(2) {
        assert_eq!(
            pair[1].seq,
            pair[0].seq + 1,
            "sequence gap: {} then {}",
            pair[0].seq,
            pair[1].seq
        );
    }
}

/// Asserts that adjusted capture times are non-decreasing in seq order.
pub fn assert_ts_non_decreasing(metas: &[RecordMeta], format: &RecordFormat) {
    let times: Vec<u64> = metas.iter().map(|m| m.adjusted_ms(format)).collect();
    for pair in times.windows(2) {
        assert!(
            pair[1] >= pair[0],
            "adjusted timestamps decreased: {:?}",
            times
        );
    }
}
