// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Per-engine job scheduler
//!
//! Each engine owns a priority-ordered pending queue and a single running
//! slot. Dispatch pops the queue head into the slot and programs the
//! hardware without holding the engine lock; completions from the
//! interrupt path, cancellation and timeout sweeps all retire the running
//! job through the same finish path, which signals the job, dispatches the
//! next one and drops the power reference.
//!
//! ```text
//!   submit ──► queue (priority desc, FIFO within a level)
//!                │ advance()
//!                ▼
//!   Idle ──► Starting ──run ok──► Running ──job_done/timeout/cancel──► Idle
//!               │                                                       ▲
//!               └──────────run failed / event seen while starting───────┘
//! ```

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use crate::backend::{Backend, CoreId, HwVersion};
use crate::config::{SchedulerConfig, PRIORITY_DEFAULT};
use crate::context::{Context, ContextId, SyncMode};
use crate::error::{Error, Result};
use crate::job::{CommandBuffer, Job, JobId, JobSlot};
use crate::power::{PowerDomain, PowerGate};
use crate::stats::{EngineStats, StatsReport};

/// Something that happened to a job while it was still being programmed
#[derive(Debug, Clone, Copy)]
enum SlotEvent {
    /// Hardware reported completion
    Completed(Result<()>),
    /// Job was pulled off the engine
    Aborted(Error),
}

enum Slot {
    Idle,
    /// Popped from the queue, being programmed without the engine lock
    Starting {
        job_id: JobId,
        ctx_id: ContextId,
        event: Option<SlotEvent>,
    },
    Running(Job),
}

struct EngineState {
    queue: VecDeque<Job>,
    slot: Slot,
    /// Hardware time accumulated in the current load window
    busy_time: Duration,
    /// Busy time of the last complete load window
    busy_time_record: Duration,
}

/// What [`Scheduler::purge`] removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Queued jobs finished as `Cancelled`
    pub queued: usize,
    /// Whether a running (or starting) job was aborted
    pub running: bool,
}

/// Scheduler for one hardware engine
pub struct Scheduler {
    core: CoreId,
    state: Mutex<EngineState>,
    backend: Arc<dyn Backend>,
    power: PowerGate,
    version: HwVersion,
    async_timeout: Duration,
    max_priority: i32,
    queue_capacity: usize,
    load_interval: Duration,
    allocated: Arc<AtomicUsize>,
    next_job_id: AtomicU64,
    stats: EngineStats,
}

impl Scheduler {
    /// Create the scheduler for engine `core`, reading its hardware version
    pub fn new(
        core: CoreId,
        backend: Arc<dyn Backend>,
        power_domain: Arc<dyn PowerDomain>,
        config: &SchedulerConfig,
    ) -> Self {
        let power = PowerGate::new(core, power_domain, config.power_always_on);

        let version = match power.acquire() {
            Ok(()) => {
                let version = backend.get_version(core);
                power.release();
                version
            }
            Err(_) => {
                warn!("core[{}]: reading version without power", core);
                backend.get_version(core)
            }
        };
        info!("core[{}]: hardware version {}", core, version.str);

        Self {
            core,
            state: Mutex::new(EngineState {
                queue: VecDeque::with_capacity(config.queue_capacity),
                slot: Slot::Idle,
                busy_time: Duration::ZERO,
                busy_time_record: Duration::ZERO,
            }),
            backend,
            power,
            version,
            async_timeout: config.async_timeout,
            max_priority: config.max_priority,
            queue_capacity: config.queue_capacity,
            load_interval: config.load_interval,
            allocated: Arc::new(AtomicUsize::new(0)),
            next_job_id: AtomicU64::new(1),
            stats: EngineStats::new(),
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    pub fn version(&self) -> &HwVersion {
        &self.version
    }

    pub fn stats(&self) -> StatsReport {
        self.stats.snapshot()
    }

    pub fn power(&self) -> &PowerGate {
        &self.power
    }

    /// Allocate a job for this engine
    ///
    /// Fails with `OutOfMemory` once `queue_capacity` jobs are alive.
    pub(crate) fn alloc_job(
        &self,
        ctx: &Arc<Context>,
        command: Arc<CommandBuffer>,
        priority: i32,
        sync_mode: SyncMode,
    ) -> Result<Job> {
        let slot = JobSlot::claim(&self.allocated, self.queue_capacity).map_err(|err| {
            error!("core[{}]: failed to alloc job, queue full", self.core);
            err
        })?;

        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);

        Ok(Job::new(
            id,
            ctx.clone(),
            self.core,
            command,
            priority,
            sync_mode,
            self.max_priority,
            slot,
        ))
    }

    /// Queue `job` by priority and dispatch if the engine is idle
    pub fn submit(&self, job: Job) {
        self.sweep_timeouts();

        {
            let mut state = self.state.lock();
            trace!(
                "core[{}]: queue job {} of ctx[{}] at priority {}",
                self.core,
                job.id(),
                job.context_id(),
                job.priority()
            );
            insert_by_priority(&mut state.queue, job);
            self.stats.record_submit(state.queue.len());
        }

        self.advance();
    }

    /// Start queued jobs until one is running or the queue is empty
    pub fn advance(&self) {
        loop {
            let mut job = {
                let mut state = self.state.lock();
                if !matches!(state.slot, Slot::Idle) {
                    return;
                }

                let Some(job) = state.queue.pop_front() else {
                    return;
                };

                state.slot = Slot::Starting {
                    job_id: job.id(),
                    ctx_id: job.context_id(),
                    event: None,
                };
                job
            };

            let ret = self.run(&mut job);

            let event = {
                let mut state = self.state.lock();
                // Only the dispatcher moves the slot out of Starting
                let event = match mem::replace(&mut state.slot, Slot::Idle) {
                    Slot::Starting { event, .. } => event,
                    _ => None,
                };

                if let Err(err) = ret {
                    drop(state);
                    error!(
                        "core[{}]: some error on job {} ({}), fail before hardware start",
                        self.core,
                        job.id(),
                        err
                    );
                    self.signal_job(job, Err(err));
                    continue;
                }

                match event {
                    Some(event) => event,
                    None => {
                        job.hw_recorded_at = Some(Instant::now());
                        state.slot = Slot::Running(job);
                        return;
                    }
                }
            };

            match event {
                SlotEvent::Completed(result) => {
                    self.signal_job(job, result);
                }
                SlotEvent::Aborted(reason) => {
                    self.reset();
                    self.signal_job(job, Err(reason));
                }
            }
            self.power.release();
        }
    }

    /// Power up and program the hardware for `job`
    ///
    /// On error no power reference is held.
    fn run(&self, job: &mut Job) -> Result<()> {
        if let Err(err) = self.power.acquire() {
            error!("core[{}]: power on failed for job {}: {}", self.core, job.id(), err);
            return Err(Error::HardwareProgramFailure);
        }

        if let Err(err) = self.backend.init_reg(job) {
            error!("core[{}]: init reg failed for job {}: {}", self.core, job.id(), err);
            self.power.release();
            return Err(Error::HardwareProgramFailure);
        }

        job.hw_started_at = Some(Instant::now());

        if let Err(err) = self.backend.set_reg(job, self.core) {
            error!("core[{}]: set reg failed for job {}: {}", self.core, job.id(), err);
            job.hw_started_at = None;
            self.power.release();
            return Err(Error::HardwareProgramFailure);
        }

        debug!(
            "core[{}]: job {} of ctx[{}] started",
            self.core,
            job.id(),
            job.context_id()
        );

        Ok(())
    }

    /// Hardware completion for the running job
    pub fn job_done(&self, result: Result<()>) {
        let job = {
            let mut state = self.state.lock();
            let job = take_running(&mut state);

            if job.is_none() {
                let stale = match &mut state.slot {
                    Slot::Starting { event, .. } => {
                        if event.is_none() {
                            *event = Some(SlotEvent::Completed(result));
                        }
                        false
                    }
                    _ => true,
                };

                if stale {
                    drop(state);
                    warn!("core[{}]: running job is invalid on irq", self.core);
                    self.stats.record_irq(true);
                    return;
                }
            }
            job
        };

        self.stats.record_irq(false);

        if let Some(job) = job {
            self.finish(job, result);
        }
    }

    /// Retire a job that was running: signal, dispatch next, drop power
    fn finish(&self, job: Job, result: Result<()>) {
        self.signal_job(job, result);
        self.advance();
        self.power.release();
    }

    /// Record the final result of `job` on its context and drop it
    pub(crate) fn signal_job(&self, job: Job, result: Result<()>) {
        let hw_time = job.hw_started_at.map(|start| start.elapsed());
        if let Some(hw_time) = hw_time {
            job.context()
                .record_job_time(hw_time, job.created_at().elapsed());
        }

        self.stats.record_finish(&result, hw_time);
        let last = job.context().signal_job(result);

        debug!(
            "core[{}]: job {} of ctx[{}] finished: {:?} hw {:?}{}",
            self.core,
            job.id(),
            job.context_id(),
            result,
            hw_time,
            if last { ", commit done" } else { "" }
        );
    }

    fn reset(&self) {
        self.backend.soft_reset(self.core);
        self.stats.record_reset();
    }

    /// Reset the engine if an ASYNC job has run past its window
    ///
    /// Returns whether a job was timed out.
    pub fn sweep_timeouts(&self) -> bool {
        let job = {
            let mut state = self.state.lock();
            let expired = matches!(
                &state.slot,
                Slot::Running(job) if job.is_async() && job.hw_elapsed() >= self.async_timeout
            );
            if !expired {
                return false;
            }
            take_running(&mut state)
        };

        let Some(job) = job else {
            return false;
        };

        warn!(
            "core[{}]: job {} of ctx[{}] timed out after {:?}, resetting",
            self.core,
            job.id(),
            job.context_id(),
            job.hw_elapsed()
        );

        self.reset();
        self.signal_job(job, Err(Error::HardwareTimeout));
        self.power.release();
        true
    }

    /// Remove every job of `ctx_id` from this engine
    ///
    /// Queued jobs finish as `Cancelled`. With `abort_running` set, a
    /// running job of the context is pulled off the hardware with a reset
    /// and finished with that error; otherwise it is left alone.
    pub fn purge(&self, ctx_id: ContextId, abort_running: Option<Error>) -> PurgeReport {
        let mut report = PurgeReport::default();

        let (queued, running) = {
            let mut state = self.state.lock();

            let pending = mem::take(&mut state.queue);
            let (queued, kept): (VecDeque<Job>, VecDeque<Job>) = pending
                .into_iter()
                .partition(|job| job.context_id() == ctx_id);
            state.queue = kept;

            let mut running = None;
            if let Some(reason) = abort_running {
                let owns = matches!(&state.slot, Slot::Running(job) if job.context_id() == ctx_id);
                if owns {
                    running = take_running(&mut state).map(|job| (job, reason));
                } else if let Slot::Starting {
                    ctx_id: starting,
                    event,
                    ..
                } = &mut state.slot
                {
                    if *starting == ctx_id {
                        if event.is_none() {
                            *event = Some(SlotEvent::Aborted(reason));
                        }
                        report.running = true;
                    }
                }
            }

            (queued, running)
        };

        report.queued = queued.len();

        if let Some((job, reason)) = running {
            error!(
                "core[{}]: reset for ctx[{}], job {}: {}",
                self.core,
                ctx_id,
                job.id(),
                reason
            );
            report.running = true;
            self.reset();
            self.finish(job, Err(reason));
        }

        for job in queued {
            self.signal_job(job, Err(Error::Cancelled));
        }

        report
    }

    /// Close the current load window and return its busy percentage
    pub fn sample_load(&self) -> u32 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let now = Instant::now();

        if let Slot::Running(job) = &mut state.slot {
            if let Some(at) = job.hw_recorded_at.replace(now) {
                state.busy_time += now.saturating_duration_since(at);
            }
        }

        state.busy_time_record = mem::take(&mut state.busy_time);
        load_percent(state.busy_time_record, self.load_interval)
    }

    /// Busy percentage of the last complete load window
    pub fn load(&self) -> u32 {
        load_percent(self.state.lock().busy_time_record, self.load_interval)
    }

    /// Queued plus running jobs
    pub fn depth(&self) -> usize {
        let state = self.state.lock();
        state.queue.len() + usize::from(!matches!(state.slot, Slot::Idle))
    }

    pub fn is_idle(&self) -> bool {
        self.depth() == 0
    }

    /// Queued jobs in dispatch order as `(job, context, priority)`
    pub fn queued_jobs(&self) -> Vec<(JobId, ContextId, i32)> {
        self.state
            .lock()
            .queue
            .iter()
            .map(|job| (job.id(), job.context_id(), job.priority()))
            .collect()
    }

    /// Job occupying the running slot as `(job, context)`
    pub fn running_job(&self) -> Option<(JobId, ContextId)> {
        match &self.state.lock().slot {
            Slot::Idle => None,
            Slot::Starting { job_id, ctx_id, .. } => Some((*job_id, *ctx_id)),
            Slot::Running(job) => Some((job.id(), job.context_id())),
        }
    }

    /// Whether any job of `ctx_id` is queued or running here
    pub fn holds_context(&self, ctx_id: ContextId) -> bool {
        let state = self.state.lock();
        let running = match &state.slot {
            Slot::Idle => false,
            Slot::Starting { ctx_id: id, .. } => *id == ctx_id,
            Slot::Running(job) => job.context_id() == ctx_id,
        };
        running || state.queue.iter().any(|job| job.context_id() == ctx_id)
    }

    /// Jobs alive on this engine, including ones parked on a dependency
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }
}

/// Insert `job` ahead of the first queued job with strictly lower priority
///
/// Every job it passes moves one slot back and gains one priority level,
/// so a job can not be starved by a stream of higher-priority arrivals.
/// Default-priority jobs go to the tail.
fn insert_by_priority(queue: &mut VecDeque<Job>, job: Job) {
    if job.priority == PRIORITY_DEFAULT || queue.is_empty() {
        queue.push_back(job);
        return;
    }

    match queue.iter().position(|queued| job.priority > queued.priority) {
        Some(pos) => {
            for queued in queue.iter_mut().skip(pos) {
                queued.priority += 1;
            }
            queue.insert(pos, job);
        }
        None => queue.push_back(job),
    }
}

/// Move the running job out of the slot, charging its busy time
fn take_running(state: &mut EngineState) -> Option<Job> {
    match mem::replace(&mut state.slot, Slot::Idle) {
        Slot::Running(job) => {
            if let Some(at) = job.hw_recorded_at {
                state.busy_time += at.elapsed();
            }
            Some(job)
        }
        other => {
            state.slot = other;
            None
        }
    }
}

fn load_percent(busy: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 0;
    }

    let percent = busy.as_micros() * 100 / interval.as_micros().max(1);
    percent.min(100) as u32
}
