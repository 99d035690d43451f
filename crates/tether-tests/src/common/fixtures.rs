// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Shared fixtures for buffer tests.

use tether_core::types::RecordFormat;

/// A 6-byte payload with a 2-byte timestamp at 1ms resolution - the layout
/// most scenario tests use.
pub fn small_format() -> RecordFormat {
    RecordFormat::new(6, 2, 1000)
}

/// A 10-byte payload with a 2-byte timestamp at 1ms resolution, used by
/// the persistence scenarios.
pub fn wide_format() -> RecordFormat {
    RecordFormat::new(10, 2, 1000)
}

/// A reference wall-clock for puts: 1000 ms after boot.
pub fn base_now_us() -> u64 {
    1_000_000
}
