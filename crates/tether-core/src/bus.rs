// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Bus device capability seam.
//!
//! The buffering core is consumed through [`BusDevices`]: a capability set
//! each concrete bus implementation exposes so the publish loop and the
//! control surface can operate on per-device offline buffers without
//! knowing the bus type. Implementations live with the bus (the buffering
//! subsystem provides one per managed bus); callers hold them as
//! `Arc<dyn BusDevices>`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use crate::types::{AllocEstimate, BusAddr, BusName, DeviceTypeName, OfflineStats, RecordBatch, RecordFormat};

// =============================================================================
// Control Snapshot
// =============================================================================

/// Recorded auto-resume intent: re-enable buffering on the given addresses
/// once a transient pause (e.g. the drain link returning) clears.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoResume {
    /// Whether auto-resume is armed.
    pub enabled: bool,
    /// Addresses to resume buffering on.
    pub addrs: BTreeSet<BusAddr>,
    /// Poll-rate override to re-apply on resume, in microseconds (0 = none).
    pub rate_override_us: u32,
}

/// Full snapshot of one bus's offline control state.
///
/// Every flag and map the control plane maintains, as returned by
/// [`BusDevices::offline_control_snapshot`]. Applying any control setter
/// twice with the same arguments yields the same snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlSnapshot {
    /// Global buffering pause.
    pub buffer_paused_global: bool,
    /// Global drain pause.
    pub drain_paused_global: bool,
    /// Drain pause driven by upstream link availability, OR'd into the
    /// effective drain check.
    pub drain_link_paused: bool,
    /// Per-address buffering pauses.
    pub buffer_paused: BTreeSet<BusAddr>,
    /// Per-address drain pauses.
    pub drain_paused: BTreeSet<BusAddr>,
    /// Addresses in the current drain selection.
    pub selected_addrs: BTreeSet<BusAddr>,
    /// Device type names in the current drain selection (stored lower-case).
    pub selected_types: BTreeSet<String>,
    /// When set, devices outside the selection are treated as drain-paused.
    pub drain_only_selected: bool,
    /// Per-bus cap on records per publish tick (0 = no override).
    pub max_per_publish_override: u32,
    /// Per-address poll-rate overrides in microseconds.
    pub rate_overrides_us: BTreeMap<BusAddr, u32>,
    /// Auto-resume intent.
    pub auto_resume: AutoResume,
}

// =============================================================================
// Drained Record View
// =============================================================================

/// One record as published in JSON surfaces (publish batches and peeks).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainedRecord {
    /// Sequence number assigned at put time.
    pub seq: u32,
    /// Adjusted capture time in milliseconds.
    pub ts_ms: u64,
    /// Hex-encoded payload bytes.
    pub payload: String,
}

// =============================================================================
// Bus Devices Capability Trait
// =============================================================================

/// The capability set a bus exposes over its devices' offline buffers.
///
/// All operations are idempotent and safe to call concurrently with puts
/// and drains; a mutation that races an in-flight drain takes effect on the
/// next operation.
#[async_trait]
pub trait BusDevices: Send + Sync + Debug {
    /// The bus name, used as the top-level key in publish output.
    fn bus_name(&self) -> &BusName;

    /// Addresses of all devices currently attached to the bus.
    fn device_addresses(&self) -> Vec<BusAddr>;

    /// The published type name of the device at `addr`, if known.
    fn device_type_name(&self, addr: BusAddr) -> Option<DeviceTypeName>;

    /// The record format of the device at `addr`, if known.
    fn record_format(&self, addr: BusAddr) -> Option<RecordFormat>;

    /// Offline buffer stats for one address (zeroed if unknown or
    /// unconfigured).
    fn offline_stats(&self, addr: BusAddr) -> OfflineStats;

    /// Pauses or resumes bufferization. An empty address list targets the
    /// global flag; otherwise per-address flags are set.
    fn set_offline_buffer_paused(&self, addrs: &[BusAddr], paused: bool);

    /// Pauses or resumes draining. An empty address list targets the global
    /// flag; otherwise per-address flags are set.
    fn set_offline_drain_paused(&self, addrs: &[BusAddr], paused: bool);

    /// Pauses or resumes draining based on upstream link availability.
    /// Clearing the link pause applies any armed auto-resume intent.
    fn set_offline_drain_link_paused(&self, paused: bool);

    /// Defines the drain selection. When `drain_only_selected` is set,
    /// unselected devices are treated as drain-paused (but may continue to
    /// buffer).
    fn set_offline_drain_selection(
        &self,
        addrs: &[BusAddr],
        type_names: &[DeviceTypeName],
        drain_only_selected: bool,
    );

    /// Records auto-resume intent for the given addresses.
    fn set_offline_auto_resume(&self, enabled: bool, addrs: &[BusAddr], rate_override_ms: u32);

    /// Caps records per device per publish tick for this bus (0 clears).
    fn set_offline_max_per_publish_override(&self, max_per_publish: u32);

    /// Applies a poll-rate override to the given addresses (all devices if
    /// the list is empty). A rate of 0 clears. Returns `true` if any device
    /// was affected.
    fn apply_offline_rate_override(&self, addrs: &[BusAddr], rate_ms: u32) -> bool;

    /// Clears poll-rate overrides on the given addresses (all devices if
    /// the list is empty). Returns `true` if any device was affected.
    fn clear_offline_rate_override(&self, addrs: &[BusAddr]) -> bool;

    /// Clears the RAM ring and any persisted mirror for the given addresses
    /// (all devices if the list is empty).
    async fn reset_offline_buffers(&self, addrs: &[BusAddr]);

    /// Redistributes the RAM budget across the given addresses (all devices
    /// if the list is empty). Returns `false` if the budget cannot
    /// accommodate the selection; no allocation is changed in that case.
    async fn rebalance_offline_buffers(&self, addrs: &[BusAddr]) -> bool;

    /// Pure query: the allocation a rebalance over these addresses would
    /// produce. No state is changed.
    fn estimate_offline_allocations(&self, addrs: &[BusAddr]) -> BTreeMap<BusAddr, AllocEstimate>;

    /// Snapshot of every control flag and map for this bus.
    fn offline_control_snapshot(&self) -> ControlSnapshot;

    /// Non-destructive read of buffered records as JSON keyed by hex
    /// address, plus the total records remaining beyond what was returned.
    fn peek_offline_data_json(
        &self,
        addrs: &[BusAddr],
        start_idx: usize,
        max_responses: usize,
        max_bytes: usize,
    ) -> (serde_json::Value, u32);

    /// Drains up to `max_responses` records from one device for publishing,
    /// honouring the effective buffer/drain pause flags. Returns an empty
    /// batch for ineligible or unknown devices.
    fn drain_offline_records(&self, addr: BusAddr, max_responses: usize) -> RecordBatch;

    /// Summed depth of all drain-eligible buffers (the publish backlog
    /// hint).
    fn offline_backlog(&self) -> u32;

    /// Effective bufferization pause for one address (global OR
    /// per-address).
    fn buffer_paused_effective(&self, addr: BusAddr) -> bool;

    /// Effective drain pause for one address (global OR link OR per-address
    /// OR selection exclusion).
    fn drain_paused_effective(&self, addr: BusAddr) -> bool;
}
