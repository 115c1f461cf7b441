// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Client contexts and the handle table
//!
//! A [`Context`] holds one client's submission configuration and tracks
//! completion of its current commit. Contexts live in a [`ContextTable`]
//! keyed by a monotonically increasing handle and are reference counted:
//! the last release purges any work still outstanding on the engines
//! before the entry is removed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::Mutex;
use spin::Mutex as SpinMutex;

use crate::config::PRIORITY_DEFAULT;
use crate::error::{Error, Result};
use crate::fence::{Fence, FenceFd};
use crate::job::CommandBuffer;

/// Context handle as seen by clients
pub type ContextId = u32;

/// Identity of the client process owning a context
pub type OwnerId = u32;

/// Largest handle the table will hand out
const HANDLE_MAX: ContextId = i32::MAX as ContextId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Commit blocks until every job finishes
    Sync,
    /// Commit returns an out fence immediately
    Async,
}

/// Submission settings stored by `configure`
#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub commands: Vec<CommandBuffer>,
    pub priority: i32,
    pub sync_mode: SyncMode,
    /// Dependency the next commit must wait for
    pub in_fence: Option<FenceFd>,
}

impl ContextConfig {
    pub fn new(commands: Vec<CommandBuffer>, sync_mode: SyncMode) -> Self {
        Self {
            commands,
            priority: PRIORITY_DEFAULT,
            sync_mode,
            in_fence: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_in_fence(mut self, fd: FenceFd) -> Self {
        self.in_fence = Some(fd);
        self
    }
}

/// Timing telemetry for the jobs of one context
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextDebugInfo {
    /// Hardware time of the most recent job
    pub last_job_hw_use_time: Duration,
    /// Allocation to completion of the most recent job
    pub last_job_use_time: Duration,
    /// Hardware time accumulated over the context's lifetime
    pub hw_time_total: Duration,
    /// Largest single-job hardware time seen
    pub max_cost_time: Duration,
}

/// Snapshot returned by `EngineRegistry::context_info`
#[derive(Debug, Clone)]
pub struct ContextInfo {
    pub id: ContextId,
    pub owner: OwnerId,
    pub priority: i32,
    pub sync_mode: SyncMode,
    pub cmd_num: usize,
    pub finished: usize,
    pub dispatched: usize,
    pub is_running: bool,
    pub refcount: u32,
    pub age: Duration,
    pub debug: ContextDebugInfo,
}

/// What a commit needs after the context has been marked running
#[derive(Debug)]
pub(crate) struct CommitPlan {
    pub commands: Vec<Arc<CommandBuffer>>,
    pub priority: i32,
    pub sync_mode: SyncMode,
    pub in_fence: Option<FenceFd>,
    /// Signaled once every job of this commit finished
    pub done: Fence,
}

struct ContextState {
    configured: bool,
    priority: i32,
    sync_mode: SyncMode,
    commands: Vec<Arc<CommandBuffer>>,
    in_fence: Option<FenceFd>,
    cmd_num: usize,
    finished: usize,
    dispatched: usize,
    is_running: bool,
    first_error: Option<Error>,
    out_fence: Option<Fence>,
    done: Option<Fence>,
    debug: ContextDebugInfo,
}

/// One client's submission state
pub struct Context {
    id: ContextId,
    owner: OwnerId,
    created_at: Instant,
    refcount: AtomicU32,
    released: AtomicBool,
    interrupted: AtomicBool,
    state: SpinMutex<ContextState>,
}

impl Context {
    fn new(id: ContextId, owner: OwnerId) -> Self {
        Self {
            id,
            owner,
            created_at: Instant::now(),
            refcount: AtomicU32::new(1),
            released: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            state: SpinMutex::new(ContextState {
                configured: false,
                priority: PRIORITY_DEFAULT,
                sync_mode: SyncMode::Sync,
                commands: Vec::new(),
                in_fence: None,
                cmd_num: 0,
                finished: 0,
                dispatched: 0,
                is_running: false,
                first_error: None,
                out_fence: None,
                done: None,
                debug: ContextDebugInfo::default(),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().is_running
    }

    /// Whether the last client reference is gone
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn interrupt_flag(&self) -> &AtomicBool {
        &self.interrupted
    }

    /// Store a new configuration. Fails with `Busy` while a commit is in
    /// flight.
    pub(crate) fn configure(&self, config: ContextConfig, max_commands: usize) -> Result<()> {
        if config.commands.is_empty() || config.commands.len() > max_commands {
            error!(
                "ctx[{}]: invalid command count {} (max {})",
                self.id,
                config.commands.len(),
                max_commands
            );
            return Err(Error::InvalidArgument);
        }

        let mut commands = Vec::new();
        commands
            .try_reserve_exact(config.commands.len())
            .map_err(|_| Error::OutOfMemory)?;
        commands.extend(config.commands.into_iter().map(Arc::new));

        let mut state = self.state.lock();
        if state.is_running {
            drop(state);
            error!("ctx[{}]: can not re-config when ctx is running", self.id);
            return Err(Error::Busy);
        }

        state.configured = true;
        state.priority = config.priority;
        state.sync_mode = config.sync_mode;
        state.cmd_num = commands.len();
        state.commands = commands;
        state.in_fence = config.in_fence;

        Ok(())
    }

    /// Mark the context running and reset per-commit counters
    ///
    /// The input fence handle is handed over to the commit and forgotten,
    /// so a later commit without reconfiguration has no dependency.
    pub(crate) fn begin_commit(&self) -> Result<CommitPlan> {
        let mut state = self.state.lock();

        if self.is_released() {
            drop(state);
            error!("ctx[{}]: commit on a released ctx", self.id);
            return Err(Error::NotFound);
        }

        if state.is_running {
            drop(state);
            error!("ctx[{}]: can not re-commit when ctx is running", self.id);
            return Err(Error::Busy);
        }

        if !state.configured {
            drop(state);
            error!("ctx[{}]: commit before config", self.id);
            return Err(Error::InvalidArgument);
        }

        let done = Fence::new();

        state.cmd_num = state.commands.len();
        state.finished = 0;
        state.dispatched = 0;
        state.first_error = None;
        state.is_running = true;
        state.done = Some(done.clone());
        self.interrupted.store(false, Ordering::Release);

        Ok(CommitPlan {
            commands: state.commands.clone(),
            priority: state.priority,
            sync_mode: state.sync_mode,
            in_fence: state.in_fence.take(),
            done,
        })
    }

    /// Out fence shared by every job of the current commit, created on
    /// first use
    pub(crate) fn out_fence(&self) -> Fence {
        self.state
            .lock()
            .out_fence
            .get_or_insert_with(Fence::new)
            .clone()
    }

    pub(crate) fn note_dispatched(&self) {
        self.state.lock().dispatched += 1;
    }

    /// Record one finished job. Returns `true` if it completed the commit.
    ///
    /// On completion the out fence and the done fence are signaled with
    /// the first error any job of the commit reported.
    pub(crate) fn signal_job(&self, result: Result<()>) -> bool {
        let fences = {
            let mut state = self.state.lock();

            state.finished += 1;
            if let Err(err) = result {
                if state.first_error.is_none() {
                    state.first_error = Some(err);
                }
            }

            if state.finished < state.cmd_num {
                None
            } else {
                state.is_running = false;
                let status = state.first_error.map_or(Ok(()), Err);
                Some((status, state.out_fence.take(), state.done.take()))
            }
        };

        match fences {
            Some((status, out_fence, done)) => {
                debug!("ctx[{}]: commit finished: {:?}", self.id, status);
                if let Some(fence) = out_fence {
                    fence.signal(status);
                }
                if let Some(fence) = done {
                    fence.signal(status);
                }
                true
            }
            None => false,
        }
    }

    /// Shrink the current commit to the `created` jobs that actually
    /// exist, recording `err` as its result
    ///
    /// If every created job already finished, the commit completes here.
    pub(crate) fn truncate_commit(&self, created: usize, err: Error) {
        let fences = {
            let mut state = self.state.lock();

            state.cmd_num = created;
            if state.first_error.is_none() {
                state.first_error = Some(err);
            }

            if state.is_running && state.finished >= state.cmd_num {
                state.is_running = false;
                let status = state.first_error.map_or(Ok(()), Err);
                Some((status, state.out_fence.take(), state.done.take()))
            } else {
                None
            }
        };

        if let Some((status, out_fence, done)) = fences {
            if let Some(fence) = out_fence {
                fence.signal(status);
            }
            if let Some(fence) = done {
                fence.signal(status);
            }
        }
    }

    /// Fold one finished job's timing into the telemetry
    pub(crate) fn record_job_time(&self, hw_time: Duration, total: Duration) {
        let mut state = self.state.lock();
        let debug = &mut state.debug;

        debug.last_job_hw_use_time = hw_time;
        debug.last_job_use_time = total;
        debug.hw_time_total += hw_time;
        if hw_time > debug.max_cost_time {
            debug.max_cost_time = hw_time;
        }
    }

    /// Wake a blocked synchronous commit, which then returns `Interrupted`
    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        let done = self.state.lock().done.clone();
        if let Some(fence) = done {
            fence.kick();
        }
    }

    pub fn info(&self) -> ContextInfo {
        let state = self.state.lock();

        ContextInfo {
            id: self.id,
            owner: self.owner,
            priority: state.priority,
            sync_mode: state.sync_mode,
            cmd_num: state.cmd_num,
            finished: state.finished,
            dispatched: state.dispatched,
            is_running: state.is_running,
            refcount: self.refcount.load(Ordering::Acquire),
            age: self.created_at.elapsed(),
            debug: state.debug,
        }
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("released", &self.is_released())
            .finish()
    }
}

struct TableInner {
    contexts: BTreeMap<ContextId, Arc<Context>>,
    next_id: ContextId,
}

/// Handle table for live contexts
pub struct ContextTable {
    inner: Mutex<TableInner>,
    max_contexts: usize,
}

impl ContextTable {
    pub fn new(max_contexts: usize) -> Self {
        Self::with_first_handle(max_contexts, 1)
    }

    pub(crate) fn with_first_handle(max_contexts: usize, first: ContextId) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                contexts: BTreeMap::new(),
                next_id: first,
            }),
            max_contexts,
        }
    }

    /// Allocate a context for `owner` and return its handle
    pub fn create(&self, owner: OwnerId) -> Result<ContextId> {
        let mut inner = self.inner.lock();

        if inner.contexts.len() >= self.max_contexts {
            error!("context table full ({} entries)", inner.contexts.len());
            return Err(Error::OutOfMemory);
        }

        let id = inner.next_id;
        if id == 0 || id > HANDLE_MAX {
            error!("context handle space exhausted");
            return Err(Error::AllocationExhausted);
        }
        inner.next_id = id.wrapping_add(1);

        inner.contexts.insert(id, Arc::new(Context::new(id, owner)));
        info!("ctx[{}]: created for pid {}", id, owner);

        Ok(id)
    }

    pub fn lookup(&self, id: ContextId) -> Result<Arc<Context>> {
        match self.inner.lock().contexts.get(&id) {
            Some(ctx) => Ok(ctx.clone()),
            None => {
                error!("can not find internal ctx from id[{}]", id);
                Err(Error::NotFound)
            }
        }
    }

    /// Take an extra client reference
    pub fn retain(&self, id: ContextId) -> Result<()> {
        let ctx = self.lookup(id)?;
        ctx.refcount.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Drop one client reference. Returns whether the context was freed.
    ///
    /// On the last reference `purge` runs while the context is still in
    /// the table, then the entry is removed.
    pub fn release<F>(&self, id: ContextId, purge: F) -> Result<bool>
    where
        F: FnOnce(&Arc<Context>),
    {
        let ctx = self.lookup(id)?;

        let prev = ctx
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .map_err(|_| Error::NotFound)?;
        if prev > 1 {
            return Ok(false);
        }

        self.destroy(&ctx, purge);
        Ok(true)
    }

    fn destroy<F>(&self, ctx: &Arc<Context>, purge: F)
    where
        F: FnOnce(&Arc<Context>),
    {
        // Under the state lock so a concurrent commit either sees the flag
        // or is already running and gets purged
        let running = {
            let state = ctx.state.lock();
            ctx.released.store(true, Ordering::Release);
            state.is_running
        };

        if running {
            purge(ctx);
        }

        self.inner.lock().contexts.remove(&ctx.id);
        debug!("ctx[{}]: released", ctx.id);
    }

    /// Force-release every context regardless of its refcount
    pub fn remove_all<F>(&self, mut purge: F) -> usize
    where
        F: FnMut(&Arc<Context>),
    {
        let contexts: Vec<_> = self.inner.lock().contexts.values().cloned().collect();
        let count = contexts.len();

        for ctx in &contexts {
            self.destroy(ctx, &mut purge);
        }

        count
    }

    /// Handles of every context opened by `owner`
    pub fn owned_by(&self, owner: OwnerId) -> Vec<ContextId> {
        self.inner
            .lock()
            .contexts
            .values()
            .filter(|ctx| ctx.owner == owner)
            .map(|ctx| ctx.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
