// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Shared test harness: a recording mock engine and registry builders

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use rve::{
    Backend, CommandBuffer, ContextConfig, ContextId, CoreId, EngineParts, EngineRegistry,
    HwVersion, Job, JobId, PowerDomain, Result, SchedulerConfig, SyncMode,
};

/// First command word that makes `init_reg` fail
pub const FAIL_WORD: u32 = 0xbad;

/// A job as it reached the hardware
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    pub job: JobId,
    pub ctx: ContextId,
    pub priority: i32,
    pub core: CoreId,
}

/// Mock engine recording every backend and power call
///
/// Completions are delivered by the test through
/// `EngineRegistry::job_done`, or inline from `set_reg` in auto mode.
#[derive(Default)]
pub struct MockHw {
    pub started: Mutex<Vec<Started>>,
    pub resets: AtomicUsize,
    pub enables: AtomicUsize,
    pub disables: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    auto_complete: AtomicBool,
    registry: OnceLock<Weak<EngineRegistry>>,
}

impl MockHw {
    /// Complete every job as soon as it is started
    pub fn set_auto_complete(&self, enabled: bool) {
        self.auto_complete.store(enabled, Ordering::Release);
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().len()
    }

    pub fn started_contexts(&self) -> Vec<ContextId> {
        self.started.lock().iter().map(|s| s.ctx).collect()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::Acquire)
    }

    /// Mark the oldest job on the engine as completed, if there is one
    pub fn take_in_flight(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Most jobs ever programmed without a completion in between
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::Acquire)
    }

    /// Every power enable was matched by a disable
    pub fn power_balanced(&self) -> bool {
        self.enables.load(Ordering::Acquire) == self.disables.load(Ordering::Acquire)
    }
}

impl Backend for MockHw {
    fn init_reg(&self, job: &Job) -> Result<()> {
        if job.command().regs().first() == Some(&FAIL_WORD) {
            return Err(rve::Error::InvalidArgument);
        }
        Ok(())
    }

    fn set_reg(&self, job: &Job, core: CoreId) -> Result<()> {
        self.started.lock().push(Started {
            job: job.id(),
            ctx: job.context_id(),
            priority: job.priority(),
            core,
        });

        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::AcqRel);

        if self.auto_complete.load(Ordering::Acquire) {
            if let Some(registry) = self.registry.get().and_then(Weak::upgrade) {
                self.take_in_flight();
                registry.job_done(core, Ok(())).unwrap();
            }
        }

        Ok(())
    }

    fn soft_reset(&self, _core: CoreId) {
        self.resets.fetch_add(1, Ordering::AcqRel);
    }

    fn get_version(&self, core: CoreId) -> HwVersion {
        HwVersion::new(1, 3, core as u32)
    }
}

impl PowerDomain for MockHw {
    fn power_enable(&self, _core: CoreId) -> Result<()> {
        self.enables.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn power_disable(&self, _core: CoreId) {
        self.disables.fetch_add(1, Ordering::AcqRel);
    }
}

/// Registry over `engines` mock engines
pub fn build(engines: usize, config: SchedulerConfig) -> (Arc<EngineRegistry>, Vec<Arc<MockHw>>) {
    let hws: Vec<Arc<MockHw>> = (0..engines).map(|_| Arc::new(MockHw::default())).collect();

    let parts = hws
        .iter()
        .map(|hw| -> EngineParts { (hw.clone(), hw.clone()) })
        .collect();

    let registry = Arc::new(EngineRegistry::new(config, parts).unwrap());
    for hw in &hws {
        let _ = hw.registry.set(Arc::downgrade(&registry));
    }

    (registry, hws)
}

/// `n` distinct single-word command buffers
pub fn cmds(n: usize) -> Vec<CommandBuffer> {
    (0..n)
        .map(|i| CommandBuffer::new(&[0x100 + i as u32, 0x1]).unwrap())
        .collect()
}

pub fn failing_cmd() -> CommandBuffer {
    CommandBuffer::new(&[FAIL_WORD]).unwrap()
}

/// Open a context and configure it in one go
pub fn open_configured(
    registry: &EngineRegistry,
    owner: u32,
    commands: Vec<CommandBuffer>,
    mode: SyncMode,
    priority: i32,
) -> ContextId {
    let handle = registry.open_context(owner).unwrap();
    registry
        .configure(
            handle,
            ContextConfig::new(commands, mode).with_priority(priority),
        )
        .unwrap();
    handle
}

/// Poll `cond` until it holds or `timeout` passes
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
