// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Publish drain across buses.
//!
//! Each publish tick drains eligible device buffers through the
//! [`BusDevices`] capability seam and formats the result for the publish
//! transport: a JSON document keyed by bus name and hex address, and/or a
//! length-prefixed binary frame per device. The tick also reports the
//! summed backlog remaining so the transport can hint that more data is
//! waiting.
//!
//! A device is drained when `(not buffer-paused or it has backlog) and not
//! drain-paused`, up to `min(global max-per-publish, per-bus override)`
//! records.
//!
//! # Binary frame layout
//!
//! Per device block, all integers big-endian except the per-record
//! adjusted timestamp which stays little-endian as stored:
//!
//! ```text
//! u16 block_len | u32 addr | u16 record_count | u16 payload_size |
//!     record_count x (u32 LE adj_ts_ms, payload bytes)
//! ```

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use tether_core::bus::{BusDevices, DrainedRecord};
use tether_core::error::{ControlError, ControlResult};
use tether_core::types::hex_string;

// =============================================================================
// Publish Batches
// =============================================================================

/// One JSON publish tick's output.
#[derive(Debug, Clone)]
pub struct PublishBatch {
    /// `{"<busName>": {"<hexAddr>": [records...]}}`, or `None` when nothing
    /// drained.
    pub json: Option<Value>,
    /// Summed depth still waiting across drain-eligible buffers.
    pub remaining: u32,
}

/// One binary publish tick's output.
#[derive(Debug, Clone)]
pub struct BinaryPublishBatch {
    /// Concatenated per-device blocks (empty when nothing drained).
    pub data: Vec<u8>,
    /// Summed depth still waiting across drain-eligible buffers.
    pub remaining: u32,
}

// =============================================================================
// Publish Drain
// =============================================================================

/// Consumes drained records from selected device buffers and formats
/// publish batches.
#[derive(Debug, Default)]
pub struct PublishDrain {
    buses: Vec<Arc<dyn BusDevices>>,
    max_per_publish: usize,
}

impl PublishDrain {
    /// Creates a drain with a global per-device records-per-tick cap
    /// (0 = unlimited).
    pub fn new(max_per_publish: usize) -> Self {
        Self {
            buses: Vec::new(),
            max_per_publish,
        }
    }

    /// Registers a bus.
    pub fn add_bus(&mut self, bus: Arc<dyn BusDevices>) {
        self.buses.push(bus);
    }

    /// Number of registered buses.
    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    /// Looks up a registered bus by name (case-insensitive).
    pub fn bus(&self, name: &str) -> ControlResult<&Arc<dyn BusDevices>> {
        self.buses
            .iter()
            .find(|b| b.bus_name().as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| ControlError::bus_unknown(name))
    }

    /// The effective per-device cap for one bus: the tighter of the global
    /// cap and the bus override.
    fn effective_max(&self, bus: &Arc<dyn BusDevices>) -> usize {
        let bus_override = bus.offline_control_snapshot().max_per_publish_override as usize;
        match (self.max_per_publish, bus_override) {
            (0, 0) => 0,
            (global, 0) => global,
            (0, over) => over,
            (global, over) => global.min(over),
        }
    }

    /// Drains one tick's worth of records and formats them as JSON.
    pub fn publish_json(&self) -> PublishBatch {
        let mut root = Map::new();
        let mut remaining = 0u32;

        for bus in &self.buses {
            let max = self.effective_max(bus);
            let mut bus_obj = Map::new();

            for addr in bus.device_addresses() {
                let batch = bus.drain_offline_records(addr, max);
                if batch.is_empty() {
                    continue;
                }
                let Some(format) = bus.record_format(addr) else {
                    continue;
                };
                let records: Vec<DrainedRecord> = batch
                    .iter()
                    .map(|(meta, payload)| DrainedRecord {
                        seq: meta.seq,
                        ts_ms: meta.adjusted_ms(&format),
                        payload: hex_string(payload),
                    })
                    .collect();
                bus_obj.insert(
                    addr.to_hex_key(),
                    serde_json::to_value(records).unwrap_or(Value::Null),
                );
            }

            remaining += bus.offline_backlog();
            if !bus_obj.is_empty() {
                root.insert(bus.bus_name().as_str().to_string(), Value::Object(bus_obj));
            }
        }

        debug!(buses = self.buses.len(), remaining, "Publish drain tick (json)");
        PublishBatch {
            json: if root.is_empty() {
                None
            } else {
                Some(Value::Object(root))
            },
            remaining,
        }
    }

    /// Drains one tick's worth of records into length-prefixed binary
    /// blocks.
    pub fn publish_binary(&self) -> BinaryPublishBatch {
        let mut data = Vec::new();
        let mut remaining = 0u32;

        for bus in &self.buses {
            let max = self.effective_max(bus);
            for addr in bus.device_addresses() {
                let batch = bus.drain_offline_records(addr, max);
                if batch.is_empty() {
                    continue;
                }

                let payload_size = batch.payload_size();
                let record_len = 4 + payload_size;
                let body_len = 4 + 2 + 2 + batch.len() * record_len;

                data.extend_from_slice(&(body_len as u16).to_be_bytes());
                data.extend_from_slice(&addr.raw().to_be_bytes());
                data.extend_from_slice(&(batch.len() as u16).to_be_bytes());
                data.extend_from_slice(&(payload_size as u16).to_be_bytes());
                let res_ms = bus
                    .record_format(addr)
                    .map(|f| f.resolution_ms())
                    .unwrap_or(0);
                for (meta, payload) in batch.iter() {
                    let adj_ts = (meta.ts_base_ms + meta.ts_raw as u64 * res_ms) as u32;
                    data.extend_from_slice(&adj_ts.to_le_bytes());
                    data.extend_from_slice(payload);
                }
            }
            remaining += bus.offline_backlog();
        }

        debug!(bytes = data.len(), remaining, "Publish drain tick (binary)");
        BinaryPublishBatch { data, remaining }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferingConfig;
    use crate::control::BufferingCore;
    use tether_core::types::{BusAddr, BusName, DeviceTypeName, RecordFormat};

    fn format() -> RecordFormat {
        RecordFormat::new(6, 2, 1000)
    }

    fn payload(raw_ts: u32) -> Vec<u8> {
        let mut p = vec![0u8; 6];
        p[0..2].copy_from_slice(&(raw_ts as u16).to_be_bytes());
        p
    }

    async fn bus_with_data(name: &str, addr: BusAddr, records: u32) -> Arc<BufferingCore> {
        let core = BufferingCore::new(BusName::new(name), BufferingConfig::for_testing());
        core.add_device(addr, DeviceTypeName::new("VL53L4CD"), format())
            .await
            .unwrap();
        for i in 0..records {
            core.handle_poll_result(1_000_000 + i as u64 * 1000, addr, &payload(i))
                .await
                .unwrap();
        }
        Arc::new(core)
    }

    #[tokio::test]
    async fn test_publish_json_shape_and_remaining() {
        let addr = BusAddr::new(0x41);
        let core = bus_with_data("I2CA", addr, 5).await;

        let mut drain = PublishDrain::new(2);
        drain.add_bus(core.clone());

        let batch = drain.publish_json();
        let json = batch.json.expect("expected drained data");
        let records = json
            .get("I2CA")
            .and_then(|b| b.get("0x0041"))
            .and_then(|v| v.as_array())
            .expect("bus/addr nesting");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["seq"], 0);
        assert_eq!(batch.remaining, 3);

        // Next tick continues where the last left off.
        let batch = drain.publish_json();
        let json = batch.json.unwrap();
        let records = json["I2CA"]["0x0041"].as_array().unwrap();
        assert_eq!(records[0]["seq"], 2);
        assert_eq!(batch.remaining, 1);
    }

    #[tokio::test]
    async fn test_publish_json_empty_when_nothing_buffered() {
        let addr = BusAddr::new(0x41);
        let core = bus_with_data("I2CA", addr, 0).await;

        let mut drain = PublishDrain::new(8);
        drain.add_bus(core);

        let batch = drain.publish_json();
        assert!(batch.json.is_none());
        assert_eq!(batch.remaining, 0);
    }

    #[tokio::test]
    async fn test_per_bus_override_caps_drain() {
        let addr = BusAddr::new(0x41);
        let core = bus_with_data("I2CA", addr, 6).await;
        core.set_offline_max_per_publish_override(1);

        let mut drain = PublishDrain::new(4);
        drain.add_bus(core);

        let batch = drain.publish_json();
        let records = batch.json.unwrap()["I2CA"]["0x0041"].as_array().unwrap().len();
        assert_eq!(records, 1);
    }

    #[tokio::test]
    async fn test_drain_paused_bus_reports_no_backlog_drained() {
        let addr = BusAddr::new(0x41);
        let core = bus_with_data("I2CA", addr, 3).await;
        core.set_offline_drain_paused(&[], true);

        let mut drain = PublishDrain::new(8);
        drain.add_bus(core.clone());

        let batch = drain.publish_json();
        assert!(batch.json.is_none());
        // Paused buffers are excluded from the backlog hint as well.
        assert_eq!(batch.remaining, 0);
        assert_eq!(core.stats_for(addr).unwrap().depth, 3);
    }

    #[tokio::test]
    async fn test_publish_binary_layout() {
        let addr = BusAddr::new(0x41);
        let core = bus_with_data("I2CA", addr, 2).await;

        let mut drain = PublishDrain::new(8);
        drain.add_bus(core);

        let batch = drain.publish_binary();
        let data = &batch.data;
        assert!(!data.is_empty());

        let block_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        assert_eq!(block_len, 4 + 2 + 2 + 2 * 10);
        assert_eq!(u32::from_be_bytes([data[2], data[3], data[4], data[5]]), 0x41);
        assert_eq!(u16::from_be_bytes([data[6], data[7]]), 2);
        assert_eq!(u16::from_be_bytes([data[8], data[9]]), 6);
        assert_eq!(data.len(), 2 + block_len);
    }

    #[tokio::test]
    async fn test_multiple_buses_sectioned() {
        let a = BusAddr::new(0x41);
        let b = BusAddr::new(0x42);
        let bus1 = bus_with_data("I2CA", a, 1).await;
        let bus2 = bus_with_data("I2CB", b, 1).await;

        let mut drain = PublishDrain::new(8);
        drain.add_bus(bus1);
        drain.add_bus(bus2);
        assert_eq!(drain.bus_count(), 2);

        let json = drain.publish_json().json.unwrap();
        assert!(json.get("I2CA").is_some());
        assert!(json.get("I2CB").is_some());
    }

    #[tokio::test]
    async fn test_bus_lookup_by_name() {
        let bus = bus_with_data("I2CA", BusAddr::new(0x41), 0).await;
        let mut drain = PublishDrain::new(8);
        drain.add_bus(bus);

        assert!(drain.bus("i2ca").is_ok());
        let err = drain.bus("SPIA").unwrap_err();
        assert_eq!(err.error_type(), "bus_unknown");
    }
}
