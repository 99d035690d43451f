// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Buffering subsystem configuration.

use serde::{Deserialize, Serialize};

/// Configuration for one bus's buffering core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferingConfig {
    /// Total RAM budget across all ring stores on the bus, in bytes.
    #[serde(default = "default_ram_budget_bytes")]
    pub ram_budget_bytes: usize,

    /// Per-device minimum ring capacity the rebalancer aims for.
    #[serde(default = "default_min_entries_per_device")]
    pub min_entries_per_device: usize,

    /// Ring capacity given to a newly attached device before any
    /// rebalance.
    #[serde(default = "default_initial_entries_per_device")]
    pub initial_entries_per_device: usize,

    /// Records drained per device per publish tick.
    #[serde(default = "default_max_per_publish")]
    pub max_per_publish: usize,

    /// Retention cap for each device's persisted mirror, in records.
    /// 0 disables persistence even when a KV driver is available.
    #[serde(default = "default_persist_max_entries")]
    pub persist_max_entries: u32,
}

fn default_ram_budget_bytes() -> usize {
    96 * 1024
}

fn default_min_entries_per_device() -> usize {
    8
}

fn default_initial_entries_per_device() -> usize {
    32
}

fn default_max_per_publish() -> usize {
    32
}

fn default_persist_max_entries() -> u32 {
    256
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            ram_budget_bytes: default_ram_budget_bytes(),
            min_entries_per_device: default_min_entries_per_device(),
            initial_entries_per_device: default_initial_entries_per_device(),
            max_per_publish: default_max_per_publish(),
            persist_max_entries: default_persist_max_entries(),
        }
    }
}

impl BufferingConfig {
    /// Creates a configuration builder.
    pub fn builder() -> BufferingConfigBuilder {
        BufferingConfigBuilder::default()
    }

    /// Small limits for tests.
    pub fn for_testing() -> Self {
        Self {
            ram_budget_bytes: 4 * 1024,
            min_entries_per_device: 2,
            initial_entries_per_device: 8,
            max_per_publish: 8,
            persist_max_entries: 32,
        }
    }
}

/// Builder for [`BufferingConfig`].
#[derive(Debug, Default)]
pub struct BufferingConfigBuilder {
    config: BufferingConfig,
}

impl BufferingConfigBuilder {
    /// Sets the total RAM budget in bytes.
    pub fn ram_budget_bytes(mut self, bytes: usize) -> Self {
        self.config.ram_budget_bytes = bytes;
        self
    }

    /// Sets the per-device minimum ring capacity.
    pub fn min_entries_per_device(mut self, entries: usize) -> Self {
        self.config.min_entries_per_device = entries;
        self
    }

    /// Sets the initial per-device ring capacity.
    pub fn initial_entries_per_device(mut self, entries: usize) -> Self {
        self.config.initial_entries_per_device = entries;
        self
    }

    /// Sets the per-device records-per-publish cap.
    pub fn max_per_publish(mut self, max: usize) -> Self {
        self.config.max_per_publish = max;
        self
    }

    /// Sets the persisted retention cap in records (0 disables
    /// persistence).
    pub fn persist_max_entries(mut self, entries: u32) -> Self {
        self.config.persist_max_entries = entries;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> BufferingConfig {
        self.config
    }
}

// =============================================================================
// Tests
// =============================================================================
