// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Per-bus buffering core and control plane.
//!
//! `BufferingCore` owns everything offline-buffering for one bus: the flat
//! `BusAddr -> DeviceBuffer` registry, the online/offline address tracker,
//! the control flags (pauses, selection, rate overrides, auto-resume) and
//! the RAM budget. Devices receive addresses only; the core holds exclusive
//! ownership of their buffers.
//!
//! Control operations are idempotent and safe under concurrent puts and
//! drains: flag mutations are applied to per-device atomics, so an
//! in-flight drain completes with its snapshot view and the mutation takes
//! effect on the next operation.
//!
//! Tie-breaks: explicit per-address flags override the global flag;
//! selection exclusion (when `drain_only_selected` is set) overrides a
//! clear global drain pause; a rate override of 0 clears.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use tether_core::bus::{BusDevices, ControlSnapshot, DrainedRecord};
use tether_core::error::{ControlError, TetherError, TetherResult};
use tether_core::tracker::{AddrTracker, Observation};
use tether_core::types::{
    hex_string, AllocEstimate, BusAddr, BusName, DeviceTypeName, OfflineStats, RecordBatch,
    RecordFormat, META_STORAGE_BYTES,
};

use crate::config::BufferingConfig;
use crate::device::DeviceBuffer;
use crate::kv::KvStore;
use crate::metrics::BufferMetricsCollector;
use crate::persist::PersistStore;

// =============================================================================
// Device Entry
// =============================================================================

#[derive(Debug)]
struct DeviceEntry {
    buffer: DeviceBuffer,
    type_name: DeviceTypeName,
}

// =============================================================================
// Buffering Core
// =============================================================================

/// The buffering subsystem for one bus.
#[derive(Debug)]
pub struct BufferingCore {
    bus_name: BusName,
    config: BufferingConfig,
    kv: Option<Arc<dyn KvStore>>,
    devices: DashMap<BusAddr, Arc<DeviceEntry>>,
    control: RwLock<ControlSnapshot>,
    tracker: Mutex<AddrTracker>,
    metrics: BufferMetricsCollector,
    reported_drops: AtomicU64,
    reported_wraps: AtomicU64,
}

impl BufferingCore {
    /// Creates a RAM-only buffering core for a bus.
    pub fn new(bus_name: BusName, config: BufferingConfig) -> Self {
        Self {
            bus_name,
            config,
            kv: None,
            devices: DashMap::new(),
            control: RwLock::new(ControlSnapshot::default()),
            tracker: Mutex::new(AddrTracker::new()),
            metrics: BufferMetricsCollector::new(),
            reported_drops: AtomicU64::new(0),
            reported_wraps: AtomicU64::new(0),
        }
    }

    /// Creates a buffering core whose device buffers mirror into the given
    /// key-value driver.
    pub fn with_kv(bus_name: BusName, config: BufferingConfig, kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv: Some(kv),
            ..Self::new(bus_name, config)
        }
    }

    /// The buffering configuration in effect.
    pub fn config(&self) -> &BufferingConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Device lifecycle
    // -------------------------------------------------------------------------

    /// Attaches a device buffer for a newly identified address.
    ///
    /// With a KV driver present the persisted mirror is configured and any
    /// surviving records are imported; persistence failures demote the
    /// device to RAM-only without failing the attach.
    pub async fn add_device(
        &self,
        addr: BusAddr,
        type_name: DeviceTypeName,
        format: RecordFormat,
    ) -> TetherResult<()> {
        let buffer = match &self.kv {
            Some(kv) if self.config.persist_max_entries > 0 => DeviceBuffer::with_persist(
                PersistStore::new(kv.clone(), self.persist_namespace(addr)),
            ),
            _ => DeviceBuffer::new(),
        };
        buffer
            .configure(self.config.initial_entries_per_device, format)
            .map_err(TetherError::from)?;

        if buffer.persist().is_some() {
            if let Err(e) = buffer
                .configure_persist(format, self.config.persist_max_entries)
                .await
            {
                self.metrics.record_persist_error("configure");
                warn!(bus = %self.bus_name, %addr, error = %e, "Persist configure failed, device is RAM-only");
            } else if let Err(e) = buffer.restore().await {
                self.metrics.record_persist_error("import");
                warn!(bus = %self.bus_name, %addr, error = %e, "Persist import failed");
            }
        }

        self.devices.insert(addr, Arc::new(DeviceEntry { buffer, type_name }));
        self.apply_effective_flags();
        let rate = self.control.read().rate_overrides_us.get(&addr).copied();
        if let (Some(us), Some(entry)) = (rate, self.devices.get(&addr)) {
            entry.buffer.set_rate_override_us(us);
        }
        info!(bus = %self.bus_name, %addr, "Device buffer attached");
        Ok(())
    }

    /// Detaches and destroys the buffer for an address.
    pub fn remove_device(&self, addr: BusAddr) -> bool {
        self.devices.remove(&addr).is_some()
    }

    /// Feeds a responding/not-responding observation into the address
    /// tracker.
    pub fn observe_response(&self, addr: BusAddr, is_responding: bool) -> Observation {
        let obs = self.tracker.lock().observe(addr, is_responding);
        if obs.state_changed {
            let online = self.tracker.lock().is_online(addr);
            info!(
                bus = %self.bus_name,
                %addr,
                online,
                spurious = obs.spurious,
                "Address state change"
            );
        }
        obs
    }

    /// Returns `true` while the address is online per the tracker.
    pub fn is_online(&self, addr: BusAddr) -> bool {
        self.tracker.lock().is_online(addr)
    }

    /// Evicts tracker records marked for deletion and destroys the swept
    /// addresses' device buffers. Call after offline notifications have
    /// been delivered.
    pub fn sweep_offline(&self) -> Vec<BusAddr> {
        let swept = self.tracker.lock().sweep_marked();
        for addr in &swept {
            if self.devices.remove(addr).is_some() {
                info!(bus = %self.bus_name, %addr, "Device buffer destroyed after offline sweep");
            }
        }
        swept
    }

    /// Stores one poll result for an address.
    pub async fn handle_poll_result(
        &self,
        now_us: u64,
        addr: BusAddr,
        payload: &[u8],
    ) -> TetherResult<u32> {
        let entry = self
            .devices
            .get(&addr)
            .map(|e| e.value().clone())
            .ok_or_else(|| ControlError::addr_unknown(addr))?;
        let seq = entry
            .buffer
            .put_poll_result(now_us, payload)
            .await
            .map_err(TetherError::from)?;
        self.metrics.record_store();
        Ok(seq)
    }

    /// Stats for one address, failing for unknown addresses.
    pub fn stats_for(&self, addr: BusAddr) -> TetherResult<OfflineStats> {
        self.devices
            .get(&addr)
            .map(|e| e.buffer.stats())
            .ok_or_else(|| ControlError::addr_unknown(addr).into())
    }

    /// The poll-rate override for an address, in microseconds.
    pub fn rate_override_us(&self, addr: BusAddr) -> Option<u32> {
        self.devices.get(&addr).and_then(|e| e.buffer.rate_override_us())
    }

    /// Total RAM bytes allocated to ring buffers on this bus.
    pub fn total_offline_bytes(&self) -> u64 {
        self.devices
            .iter()
            .map(|e| e.value().buffer.alloc_bytes() as u64)
            .sum()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn persist_namespace(&self, addr: BusAddr) -> String {
        format!("ob_{}_{:04x}", self.bus_name.as_str().to_ascii_lowercase(), addr.raw())
    }

    fn resolve_targets(&self, addrs: &[BusAddr]) -> Vec<BusAddr> {
        if addrs.is_empty() {
            let mut all: Vec<BusAddr> = self.devices.iter().map(|e| *e.key()).collect();
            all.sort();
            all
        } else {
            addrs
                .iter()
                .copied()
                .filter(|a| self.devices.contains_key(a))
                .collect()
        }
    }

    fn drain_paused_in(&self, st: &ControlSnapshot, addr: BusAddr, type_name: &DeviceTypeName) -> bool {
        if st.drain_paused_global || st.drain_link_paused || st.drain_paused.contains(&addr) {
            return true;
        }
        if st.drain_only_selected {
            let by_addr = st.selected_addrs.contains(&addr);
            let by_type = st
                .selected_types
                .contains(&type_name.as_str().to_ascii_lowercase());
            if !(by_addr || by_type) {
                return true;
            }
        }
        false
    }

    /// Pushes the effective pause values into every device's flags.
    fn apply_effective_flags(&self) {
        let st = self.control.read();
        for entry in self.devices.iter() {
            let addr = *entry.key();
            let device = entry.value();
            device
                .buffer
                .set_buffer_paused(st.buffer_paused_global || st.buffer_paused.contains(&addr));
            device
                .buffer
                .set_drain_paused(self.drain_paused_in(&st, addr, &device.type_name));
        }
    }

    fn compute_allocations(&self, targets: &[BusAddr]) -> BTreeMap<BusAddr, AllocEstimate> {
        let mut infos: Vec<(BusAddr, usize, usize)> = Vec::new();
        for addr in targets {
            if let Some(entry) = self.devices.get(addr) {
                if let Some(format) = entry.buffer.format() {
                    infos.push((*addr, format.payload_size, format.record_size()));
                }
            }
        }
        if infos.is_empty() {
            return BTreeMap::new();
        }

        let budget = self.config.ram_budget_bytes;
        let total_weight: usize = infos.iter().map(|(_, w, _)| *w).sum();

        // Payload-proportional shares with a per-device floor.
        let mut entries: Vec<usize> = infos
            .iter()
            .map(|(_, weight, bpe)| {
                let share = budget * weight / total_weight.max(1);
                (share / bpe).max(self.config.min_entries_per_device)
            })
            .collect();

        let cost: usize = entries.iter().zip(&infos).map(|(n, (_, _, bpe))| n * bpe).sum();
        if cost > budget {
            // Floors exceed the cap: the cap wins, shares shrink evenly.
            let per_device = budget / infos.len();
            entries = infos.iter().map(|(_, _, bpe)| (per_device / bpe).max(1)).collect();
            let cost: usize = entries.iter().zip(&infos).map(|(n, (_, _, bpe))| n * bpe).sum();
            if cost > budget {
                warn!(
                    bus = %self.bus_name,
                    budget,
                    devices = infos.len(),
                    "RAM budget cannot hold one record per device"
                );
                return BTreeMap::new();
            }
        }

        infos
            .iter()
            .zip(&entries)
            .map(|((addr, payload, bpe), n)| {
                (
                    *addr,
                    AllocEstimate {
                        alloc_bytes: (n * bpe) as u32,
                        bytes_per_entry: *bpe as u32,
                        payload_size: *payload as u32,
                        meta_size: META_STORAGE_BYTES as u32,
                    },
                )
            })
            .collect()
    }

    /// Refreshes the usage gauges and drop/wrap counters from current
    /// stats. Called once per publish tick.
    fn refresh_usage_metrics(&self) {
        let mut depth = 0u64;
        let mut bytes = 0u64;
        let mut drops = 0u64;
        let mut wraps = 0u64;
        for entry in self.devices.iter() {
            let stats = entry.value().buffer.stats();
            depth += stats.depth as u64;
            bytes += stats.bytes_in_use() as u64;
            drops += stats.drops as u64;
            wraps += stats.ts_wrap_count as u64;
        }
        self.metrics.update_usage(depth, bytes);
        let prev = self.reported_drops.swap(drops, Ordering::Relaxed);
        if drops > prev {
            self.metrics.record_dropped(drops - prev);
        }
        let prev = self.reported_wraps.swap(wraps, Ordering::Relaxed);
        if wraps > prev {
            self.metrics.record_ts_wraps(wraps - prev);
        }
    }
}

// =============================================================================
// BusDevices Implementation
// =============================================================================

#[async_trait]
impl BusDevices for BufferingCore {
    fn bus_name(&self) -> &BusName {
        &self.bus_name
    }

    fn device_addresses(&self) -> Vec<BusAddr> {
        let mut addrs: Vec<BusAddr> = self.devices.iter().map(|e| *e.key()).collect();
        addrs.sort();
        addrs
    }

    fn device_type_name(&self, addr: BusAddr) -> Option<DeviceTypeName> {
        self.devices.get(&addr).map(|e| e.type_name.clone())
    }

    fn record_format(&self, addr: BusAddr) -> Option<RecordFormat> {
        self.devices.get(&addr).and_then(|e| e.buffer.format())
    }

    fn offline_stats(&self, addr: BusAddr) -> OfflineStats {
        self.devices
            .get(&addr)
            .map(|e| e.buffer.stats())
            .unwrap_or_default()
    }

    fn set_offline_buffer_paused(&self, addrs: &[BusAddr], paused: bool) {
        {
            let mut st = self.control.write();
            if addrs.is_empty() {
                st.buffer_paused_global = paused;
            } else {
                for addr in addrs {
                    if paused {
                        st.buffer_paused.insert(*addr);
                    } else {
                        st.buffer_paused.remove(addr);
                    }
                }
            }
        }
        self.apply_effective_flags();
        debug!(bus = %self.bus_name, paused, addrs = addrs.len(), "Buffer pause updated");
    }

    fn set_offline_drain_paused(&self, addrs: &[BusAddr], paused: bool) {
        {
            let mut st = self.control.write();
            if addrs.is_empty() {
                st.drain_paused_global = paused;
            } else {
                for addr in addrs {
                    if paused {
                        st.drain_paused.insert(*addr);
                    } else {
                        st.drain_paused.remove(addr);
                    }
                }
            }
        }
        self.apply_effective_flags();
        debug!(bus = %self.bus_name, paused, addrs = addrs.len(), "Drain pause updated");
    }

    fn set_offline_drain_link_paused(&self, paused: bool) {
        let resume = {
            let mut st = self.control.write();
            if st.drain_link_paused == paused {
                return;
            }
            st.drain_link_paused = paused;
            if !paused && st.auto_resume.enabled {
                let addrs: Vec<BusAddr> = st.auto_resume.addrs.iter().copied().collect();
                let rate_us = st.auto_resume.rate_override_us;
                for addr in &addrs {
                    st.buffer_paused.remove(addr);
                }
                if rate_us > 0 {
                    for addr in &addrs {
                        st.rate_overrides_us.insert(*addr, rate_us);
                    }
                }
                Some((addrs, rate_us))
            } else {
                None
            }
        };
        if let Some((addrs, rate_us)) = resume {
            info!(bus = %self.bus_name, devices = addrs.len(), "Drain link restored, auto-resuming buffering");
            for addr in &addrs {
                if let Some(entry) = self.devices.get(addr) {
                    if rate_us > 0 {
                        entry.buffer.set_rate_override_us(rate_us);
                    }
                }
            }
        }
        self.apply_effective_flags();
    }

    fn set_offline_drain_selection(
        &self,
        addrs: &[BusAddr],
        type_names: &[DeviceTypeName],
        drain_only_selected: bool,
    ) {
        {
            let mut st = self.control.write();
            st.selected_addrs = addrs.iter().copied().collect();
            st.selected_types = type_names
                .iter()
                .map(|t| t.as_str().to_ascii_lowercase())
                .collect();
            st.drain_only_selected = drain_only_selected;
        }
        self.apply_effective_flags();
        debug!(
            bus = %self.bus_name,
            addrs = addrs.len(),
            types = type_names.len(),
            drain_only_selected,
            "Drain selection updated"
        );
    }

    fn set_offline_auto_resume(&self, enabled: bool, addrs: &[BusAddr], rate_override_ms: u32) {
        let mut st = self.control.write();
        st.auto_resume.enabled = enabled;
        st.auto_resume.addrs = if enabled {
            addrs.iter().copied().collect()
        } else {
            Default::default()
        };
        st.auto_resume.rate_override_us = if enabled {
            rate_override_ms.saturating_mul(1000)
        } else {
            0
        };
    }

    fn set_offline_max_per_publish_override(&self, max_per_publish: u32) {
        self.control.write().max_per_publish_override = max_per_publish;
    }

    fn apply_offline_rate_override(&self, addrs: &[BusAddr], rate_ms: u32) -> bool {
        if rate_ms == 0 {
            return self.clear_offline_rate_override(addrs);
        }
        let targets = self.resolve_targets(addrs);
        if targets.is_empty() {
            return false;
        }
        let rate_us = rate_ms.saturating_mul(1000);
        {
            let mut st = self.control.write();
            for addr in &targets {
                st.rate_overrides_us.insert(*addr, rate_us);
            }
        }
        for addr in &targets {
            if let Some(entry) = self.devices.get(addr) {
                entry.buffer.set_rate_override_us(rate_us);
            }
        }
        debug!(bus = %self.bus_name, rate_ms, devices = targets.len(), "Rate override applied");
        true
    }

    fn clear_offline_rate_override(&self, addrs: &[BusAddr]) -> bool {
        let targets = self.resolve_targets(addrs);
        if targets.is_empty() {
            return false;
        }
        {
            let mut st = self.control.write();
            for addr in &targets {
                st.rate_overrides_us.remove(addr);
            }
        }
        for addr in &targets {
            if let Some(entry) = self.devices.get(addr) {
                entry.buffer.set_rate_override_us(0);
            }
        }
        true
    }

    async fn reset_offline_buffers(&self, addrs: &[BusAddr]) {
        let targets = self.resolve_targets(addrs);
        let entries: Vec<(BusAddr, Arc<DeviceEntry>)> = targets
            .iter()
            .filter_map(|a| self.devices.get(a).map(|e| (*a, e.value().clone())))
            .collect();
        for (addr, entry) in entries {
            if let Err(e) = entry.buffer.reset().await {
                self.metrics.record_persist_error("reset");
                warn!(bus = %self.bus_name, %addr, error = %e, "Offline buffer reset failed");
            }
        }
        info!(bus = %self.bus_name, devices = targets.len(), "Offline buffers reset");
    }

    async fn rebalance_offline_buffers(&self, addrs: &[BusAddr]) -> bool {
        let targets = self.resolve_targets(addrs);
        if targets.is_empty() {
            return false;
        }
        let allocations = self.compute_allocations(&targets);
        if allocations.is_empty() {
            return false;
        }
        for (addr, est) in &allocations {
            let Some(entry) = self.devices.get(addr).map(|e| e.value().clone()) else {
                continue;
            };
            let entries = (est.alloc_bytes / est.bytes_per_entry) as usize;
            if let Err(e) = entry.buffer.ring().resize(entries) {
                warn!(bus = %self.bus_name, %addr, error = %e, "Ring resize failed");
                continue;
            }
            if let Some(persist) = entry.buffer.persist() {
                if persist.is_ready().await {
                    if let Err(e) = persist.set_effective_max(entries as u32).await {
                        self.metrics.record_persist_error("rebalance");
                        warn!(bus = %self.bus_name, %addr, error = %e, "Persist cap update failed");
                    }
                }
            }
        }
        debug!(bus = %self.bus_name, devices = allocations.len(), "Offline buffers rebalanced");
        true
    }

    fn estimate_offline_allocations(&self, addrs: &[BusAddr]) -> BTreeMap<BusAddr, AllocEstimate> {
        let targets = self.resolve_targets(addrs);
        self.compute_allocations(&targets)
    }

    fn offline_control_snapshot(&self) -> ControlSnapshot {
        self.control.read().clone()
    }

    fn peek_offline_data_json(
        &self,
        addrs: &[BusAddr],
        start_idx: usize,
        max_responses: usize,
        max_bytes: usize,
    ) -> (serde_json::Value, u32) {
        let targets = self.resolve_targets(addrs);
        let mut obj = serde_json::Map::new();
        let mut remaining = 0u32;
        for addr in targets {
            let Some(entry) = self.devices.get(&addr).map(|e| e.value().clone()) else {
                continue;
            };
            let Some(format) = entry.buffer.format() else {
                continue;
            };
            let batch = match entry.buffer.peek(start_idx, max_responses, max_bytes) {
                Ok(batch) => batch,
                Err(e) => {
                    warn!(bus = %self.bus_name, %addr, error = %e, "Peek failed");
                    continue;
                }
            };
            remaining += entry.buffer.depth().saturating_sub(start_idx + batch.len()) as u32;
            if batch.is_empty() {
                continue;
            }
            let records: Vec<DrainedRecord> = batch
                .iter()
                .map(|(meta, payload)| DrainedRecord {
                    seq: meta.seq,
                    ts_ms: meta.adjusted_ms(&format),
                    payload: hex_string(payload),
                })
                .collect();
            obj.insert(
                addr.to_hex_key(),
                serde_json::to_value(records).unwrap_or(serde_json::Value::Null),
            );
        }
        (serde_json::Value::Object(obj), remaining)
    }

    fn drain_offline_records(&self, addr: BusAddr, max_responses: usize) -> RecordBatch {
        let Some(entry) = self.devices.get(&addr).map(|e| e.value().clone()) else {
            return RecordBatch::new(0);
        };
        if self.drain_paused_effective(addr) {
            return RecordBatch::new(entry.buffer.ring().payload_size());
        }
        if self.buffer_paused_effective(addr) && !entry.buffer.has_backlog() {
            return RecordBatch::new(entry.buffer.ring().payload_size());
        }
        match entry.buffer.drain(max_responses) {
            Ok(batch) => {
                self.metrics.record_drain(batch.len());
                batch
            }
            Err(e) => {
                warn!(bus = %self.bus_name, %addr, error = %e, "Drain failed");
                RecordBatch::new(entry.buffer.ring().payload_size())
            }
        }
    }

    fn offline_backlog(&self) -> u32 {
        self.refresh_usage_metrics();
        let mut total = 0u32;
        for entry in self.devices.iter() {
            if !self.drain_paused_effective(*entry.key()) {
                total += entry.value().buffer.depth() as u32;
            }
        }
        total
    }

    fn buffer_paused_effective(&self, addr: BusAddr) -> bool {
        let st = self.control.read();
        st.buffer_paused_global || st.buffer_paused.contains(&addr)
    }

    fn drain_paused_effective(&self, addr: BusAddr) -> bool {
        let type_name = self
            .devices
            .get(&addr)
            .map(|e| e.type_name.clone())
            .unwrap_or_else(|| DeviceTypeName::new(""));
        let st = self.control.read();
        self.drain_paused_in(&st, addr, &type_name)
    }
}

// =============================================================================
// Tests
// =============================================================================
