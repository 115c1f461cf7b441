// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware backend contract
//!
//! The scheduler never touches registers itself. Everything that programs,
//! starts or resets an engine goes through a [`Backend`] supplied by the
//! hardware-specific layer.

use crate::error::Result;
use crate::job::Job;

/// Index of a hardware engine inside its registry
pub type CoreId = usize;

/// Hardware version as read back from an engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HwVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
    /// Human-readable form, e.g. "1.0.3"
    pub str: String,
}

impl HwVersion {
    pub fn new(major: u32, minor: u32, revision: u32) -> Self {
        Self {
            major,
            minor,
            revision,
            str: format!("{}.{}.{}", major, minor, revision),
        }
    }
}

/// Register programming and reset operations for one engine
///
/// Implementations are called without the engine lock held and may block.
pub trait Backend: Send + Sync {
    /// Prepare the register set for `job`
    fn init_reg(&self, job: &Job) -> Result<()>;

    /// Write the registers and start the hardware
    ///
    /// Once this returns `Ok`, a completion must eventually be delivered
    /// through `EngineRegistry::job_done` unless the engine is reset first.
    fn set_reg(&self, job: &Job, core: CoreId) -> Result<()>;

    /// Return the engine to idle. Must be safe on an idle engine.
    fn soft_reset(&self, core: CoreId);

    /// Read the engine's hardware version
    fn get_version(&self, core: CoreId) -> HwVersion;
}
