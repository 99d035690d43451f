// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Online/offline address tracking with hysteresis.
//!
//! Bus pollers report raw responding/not-responding observations; this
//! module debounces them with a signed counter so that a device must answer
//! `ok_max` consecutive polls to come online and miss `fail_max` to go
//! offline. Transitions on addresses that were never online (scan noise)
//! are reported as *spurious* and must not be surfaced as real device
//! changes.
//!
//! Eviction is a two-phase mark-then-sweep: an offline transition only sets
//! `flag_for_deletion`, so the owner can notify listeners (and tear down
//! per-device state) before [`AddrTracker::sweep_marked`] removes the
//! record.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::BusAddr;

/// Consecutive successful responses required before declaring online.
pub const RESP_COUNT_OK_MAX_DEFAULT: u32 = 2;

/// Consecutive failed responses required before declaring offline.
pub const RESP_COUNT_FAIL_MAX_DEFAULT: u32 = 3;

// =============================================================================
// Online State
// =============================================================================

/// Lifecycle state of a bus address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlineState {
    /// Never observed responding.
    #[default]
    Initial,
    /// Currently online.
    Online,
    /// Was online (or spurious) and has gone offline.
    Offline,
}

impl OnlineState {
    /// Returns the state as a display string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OnlineState::Initial => "INITIAL",
            OnlineState::Online => "ONLINE",
            OnlineState::Offline => "OFFLINE",
        }
    }
}

// =============================================================================
// Observation Outcome
// =============================================================================

/// Outcome of feeding one responding/not-responding observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
    /// A threshold was crossed and the state changed.
    pub state_changed: bool,

    /// The transition concerned an address that was never genuinely online
    /// (or was already marked for deletion); it must not be surfaced as a
    /// real device change.
    pub spurious: bool,
}

impl Observation {
    /// No threshold crossed.
    pub const fn none() -> Self {
        Self {
            state_changed: false,
            spurious: false,
        }
    }
}

// =============================================================================
// Address Status
// =============================================================================

/// Hysteresis state for one bus address.
#[derive(Debug, Clone)]
pub struct AddrStatus {
    /// The tracked address.
    pub addr: BusAddr,

    /// Signed response counter: counts up towards online while responding,
    /// down towards offline while not.
    count: i8,

    /// Currently online.
    pub is_online: bool,

    /// Has been online at least once since creation.
    pub was_once_online: bool,

    /// Marked for eviction by a subsequent sweep.
    pub flag_for_deletion: bool,

    /// Current lifecycle state.
    pub online_state: OnlineState,
}

impl AddrStatus {
    /// Creates a fresh status record for an address.
    pub fn new(addr: BusAddr) -> Self {
        Self {
            addr,
            count: 0,
            is_online: false,
            was_once_online: false,
            flag_for_deletion: false,
            online_state: OnlineState::Initial,
        }
    }

    /// Feeds one responding observation through the hysteresis counter.
    ///
    /// Returns whether a state transition occurred and whether it was
    /// spurious. After an offline transition the record is always flagged
    /// for deletion; the caller evicts it later via the sweep so listeners
    /// see the change first.
    pub fn observe(&mut self, is_responding: bool, ok_max: u32, fail_max: u32) -> Observation {
        if is_responding {
            if !self.is_online {
                self.count = (self.count + 1).min(ok_max as i8);
                if self.count >= ok_max as i8 {
                    self.count = 0;
                    self.is_online = true;
                    self.online_state = OnlineState::Online;
                    self.was_once_online = true;
                    self.flag_for_deletion = false;
                    return Observation {
                        state_changed: true,
                        spurious: false,
                    };
                }
            }
        } else if self.is_online || !self.was_once_online || self.flag_for_deletion {
            self.count = (self.count - 1).max(-(fail_max as i8));
            if self.count <= -(fail_max as i8) {
                self.count = 0;
                let spurious = !self.was_once_online || self.flag_for_deletion;
                self.is_online = false;
                self.online_state = OnlineState::Offline;
                // Mark only; eviction happens in the sweep after listeners
                // have been notified of the offline change.
                self.flag_for_deletion = true;
                return Observation {
                    state_changed: true,
                    spurious,
                };
            }
        }
        Observation::none()
    }
}

// =============================================================================
// Address Tracker
// =============================================================================

/// Registry of [`AddrStatus`] records for one bus.
#[derive(Debug)]
pub struct AddrTracker {
    statuses: HashMap<BusAddr, AddrStatus>,
    ok_max: u32,
    fail_max: u32,
}

impl Default for AddrTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AddrTracker {
    /// Creates a tracker with the default hysteresis thresholds.
    pub fn new() -> Self {
        Self::with_thresholds(RESP_COUNT_OK_MAX_DEFAULT, RESP_COUNT_FAIL_MAX_DEFAULT)
    }

    /// Creates a tracker with explicit thresholds.
    pub fn with_thresholds(ok_max: u32, fail_max: u32) -> Self {
        Self {
            statuses: HashMap::new(),
            ok_max,
            fail_max,
        }
    }

    /// Feeds an observation for an address, creating its record on first
    /// sight.
    pub fn observe(&mut self, addr: BusAddr, is_responding: bool) -> Observation {
        let status = self.statuses.entry(addr).or_insert_with(|| AddrStatus::new(addr));
        status.observe(is_responding, self.ok_max, self.fail_max)
    }

    /// Returns the status record for an address.
    pub fn get(&self, addr: BusAddr) -> Option<&AddrStatus> {
        self.statuses.get(&addr)
    }

    /// Returns `true` if the address is currently online.
    pub fn is_online(&self, addr: BusAddr) -> bool {
        self.statuses.get(&addr).map(|s| s.is_online).unwrap_or(false)
    }

    /// All addresses currently online, in unspecified order.
    pub fn online_addresses(&self) -> Vec<BusAddr> {
        self.statuses
            .values()
            .filter(|s| s.is_online)
            .map(|s| s.addr)
            .collect()
    }

    /// Evicts all records that are offline and marked for deletion,
    /// returning the swept addresses.
    ///
    /// Call this only after offline notifications for the marked addresses
    /// have been delivered.
    pub fn sweep_marked(&mut self) -> Vec<BusAddr> {
        let swept: Vec<BusAddr> = self
            .statuses
            .values()
            .filter(|s| s.flag_for_deletion && !s.is_online)
            .map(|s| s.addr)
            .collect();
        for addr in &swept {
            self.statuses.remove(addr);
        }
        swept
    }

    /// Number of tracked addresses.
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Returns `true` if no addresses are tracked.
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
