// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Scheduler configuration

use std::time::Duration;

/// Priority value meaning "unset": jobs carrying it are queued FIFO.
pub const PRIORITY_DEFAULT: i32 = 0;

/// Upper bound for job priority unless overridden in [`SchedulerConfig`].
pub const PRIORITY_MAX: i32 = 6;

/// Maximum number of hardware versions reported by a version query.
pub const HW_VERSIONS_MAX: usize = 4;

/// Tunables shared by every engine of one registry
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long a SYNC commit blocks before declaring a hang
    pub sync_timeout: Duration,
    /// How long an ASYNC job may run before the sweep resets the engine
    pub async_timeout: Duration,
    /// Clamp applied to context priority at job allocation
    pub max_priority: i32,
    /// Jobs per engine (queued + running) before allocation fails
    pub queue_capacity: usize,
    /// Live contexts before `open_context` fails
    pub max_contexts: usize,
    /// Command buffers accepted per configuration
    pub max_commands: usize,
    /// Load monitor sampling period
    pub load_interval: Duration,
    /// Keep the power domain on, never calling the power collaborator
    pub power_always_on: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: Duration::from_millis(500),
            async_timeout: Duration::from_millis(500),
            max_priority: PRIORITY_MAX,
            queue_capacity: 64,
            max_contexts: 1024,
            max_commands: 16,
            load_interval: Duration::from_secs(1),
            power_always_on: false,
        }
    }
}
