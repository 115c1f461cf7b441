// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Jobs and command buffers

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::backend::CoreId;
use crate::config::PRIORITY_DEFAULT;
use crate::context::{Context, ContextId, OwnerId, SyncMode};
use crate::error::{Error, Result};

/// Unique job identifier, assigned per engine
pub type JobId = u64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct JobFlags: u32 {
        /// Submitter does not wait; completion is reported through the out fence
        const ASYNC = 1 << 0;
    }
}

/// One opaque register command block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuffer {
    regs: Vec<u32>,
}

impl CommandBuffer {
    /// Copy `regs` into a new buffer
    pub fn new(regs: &[u32]) -> Result<Self> {
        if regs.is_empty() {
            return Err(Error::InvalidArgument);
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(regs.len())
            .map_err(|_| Error::OutOfMemory)?;
        buf.extend_from_slice(regs);

        Ok(Self { regs: buf })
    }

    pub fn regs(&self) -> &[u32] {
        &self.regs
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }
}

/// Allocation slot held by a live job. Returned to the engine on drop.
#[derive(Debug)]
pub(crate) struct JobSlot {
    allocated: Arc<AtomicUsize>,
}

impl JobSlot {
    /// Claim a slot if fewer than `capacity` are in use
    pub(crate) fn claim(allocated: &Arc<AtomicUsize>, capacity: usize) -> Result<Self> {
        allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                (used < capacity).then_some(used + 1)
            })
            .map_err(|_| Error::OutOfMemory)?;

        Ok(Self {
            allocated: allocated.clone(),
        })
    }
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        self.allocated.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One unit of hardware work
///
/// A job is owned by exactly one place at a time: an engine queue, an
/// engine's running slot, a pending dependency callback, or the thread
/// finishing it.
#[derive(Debug)]
pub struct Job {
    id: JobId,
    ctx: Arc<Context>,
    core: CoreId,
    pub(crate) priority: i32,
    flags: JobFlags,
    command: Arc<CommandBuffer>,
    owner: OwnerId,
    created_at: Instant,
    pub(crate) hw_started_at: Option<Instant>,
    /// Last checkpoint for load accounting
    pub(crate) hw_recorded_at: Option<Instant>,
    _slot: JobSlot,
}

impl Job {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: JobId,
        ctx: Arc<Context>,
        core: CoreId,
        command: Arc<CommandBuffer>,
        priority: i32,
        sync_mode: SyncMode,
        max_priority: i32,
        slot: JobSlot,
    ) -> Self {
        let priority = if priority > PRIORITY_DEFAULT {
            priority.min(max_priority)
        } else {
            PRIORITY_DEFAULT
        };

        let mut flags = JobFlags::empty();
        if sync_mode == SyncMode::Async {
            flags.insert(JobFlags::ASYNC);
        }

        let owner = ctx.owner();

        Self {
            id,
            ctx,
            core,
            priority,
            flags,
            command,
            owner,
            created_at: Instant::now(),
            hw_started_at: None,
            hw_recorded_at: None,
            _slot: slot,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn context_id(&self) -> ContextId {
        self.ctx.id()
    }

    /// Engine this job was allocated on
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Effective priority, including any bumps received while queued
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn flags(&self) -> JobFlags {
        self.flags
    }

    pub fn is_async(&self) -> bool {
        self.flags.contains(JobFlags::ASYNC)
    }

    pub fn command(&self) -> &CommandBuffer {
        &self.command
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn hw_started_at(&self) -> Option<Instant> {
        self.hw_started_at
    }

    /// Time on hardware so far, zero if never started
    pub fn hw_elapsed(&self) -> Duration {
        self.hw_started_at
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }
}
