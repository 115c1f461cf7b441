// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Reference-counted power/clock gating around hardware use

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use log::{error, warn};

use crate::backend::CoreId;
use crate::error::Result;

/// Power and clock collaborator for an engine. Calls may block.
pub trait PowerDomain: Send + Sync {
    fn power_enable(&self, core: CoreId) -> Result<()>;
    fn power_disable(&self, core: CoreId);
}

/// Per-engine gate pairing every dispatch with exactly one release
pub struct PowerGate {
    core: CoreId,
    domain: Arc<dyn PowerDomain>,
    always_on: bool,
    refcount: AtomicI32,
}

impl PowerGate {
    pub fn new(core: CoreId, domain: Arc<dyn PowerDomain>, always_on: bool) -> Self {
        Self {
            core,
            domain,
            always_on,
            refcount: AtomicI32::new(0),
        }
    }

    /// Power the engine up, taking one reference
    pub fn acquire(&self) -> Result<()> {
        if self.always_on {
            return Ok(());
        }

        if let Err(err) = self.domain.power_enable(self.core) {
            error!("core[{}]: power enable failed: {}", self.core, err);
            return Err(err);
        }

        self.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop one reference taken by [`acquire`](Self::acquire)
    pub fn release(&self) {
        if self.always_on {
            return;
        }

        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            warn!("core[{}]: unbalanced power release", self.core);
            self.refcount.fetch_add(1, Ordering::AcqRel);
            return;
        }

        self.domain.power_disable(self.core);
    }

    /// Outstanding references
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }
}
