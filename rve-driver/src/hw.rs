// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Simulated RVE engine
//!
//! Stands in for the register block and interrupt line of one engine.
//! Starting a job posts a completion with a due time onto a lock-free
//! queue; the engine's completion worker pops it once due and reports it
//! to the registry, like an interrupt handler would.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use log::{debug, trace, warn};

use rve::{Backend, CoreId, Error, HwVersion, Job, JobId, PowerDomain, Result};

/// Largest command the register block accepts, in words
pub const CMD_WORDS_MAX: usize = 256;

/// First command word that starts the engine without it ever finishing
pub const HANG_WORD: u32 = 0xdead_beef;

/// Hardware version reported by the simulated block
const SIM_VERSION: (u32, u32, u32) = (1, 0, 3);

/// Pending completion "interrupt"
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub job: JobId,
    pub due: Instant,
    generation: u64,
}

/// One simulated engine
pub struct SimulatedRve {
    core: CoreId,
    exec_time: Duration,
    irq: ArrayQueue<Completion>,
    /// Bumped by every reset; older completions are discarded
    generation: AtomicU64,
    programmed: AtomicU64,
    resets: AtomicU64,
    power_on: AtomicU64,
    power_off: AtomicU64,
}

impl SimulatedRve {
    pub fn new(core: CoreId, exec_time: Duration, irq_depth: usize) -> Self {
        Self {
            core,
            exec_time,
            irq: ArrayQueue::new(irq_depth.max(1)),
            generation: AtomicU64::new(0),
            programmed: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            power_on: AtomicU64::new(0),
            power_off: AtomicU64::new(0),
        }
    }

    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Pop the next posted completion, if any
    pub fn take_completion(&self) -> Option<Completion> {
        self.irq.pop()
    }

    /// Whether `completion` was posted after the last reset
    pub fn is_current(&self, completion: &Completion) -> bool {
        completion.generation == self.generation.load(Ordering::Acquire)
    }

    pub fn programmed(&self) -> u64 {
        self.programmed.load(Ordering::Relaxed)
    }

    pub fn resets(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Power enables and disables seen so far
    pub fn power_counts(&self) -> (u64, u64) {
        (
            self.power_on.load(Ordering::Relaxed),
            self.power_off.load(Ordering::Relaxed),
        )
    }
}

impl Backend for SimulatedRve {
    fn init_reg(&self, job: &Job) -> Result<()> {
        let words = job.command().len();
        if words > CMD_WORDS_MAX {
            warn!(
                "rve[{}]: command of job {} too long ({} words)",
                self.core,
                job.id(),
                words
            );
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    fn set_reg(&self, job: &Job, core: CoreId) -> Result<()> {
        self.programmed.fetch_add(1, Ordering::Relaxed);

        if job.command().regs().first() == Some(&HANG_WORD) {
            debug!("rve[{}]: job {} will never complete", core, job.id());
            return Ok(());
        }

        let completion = Completion {
            job: job.id(),
            due: Instant::now() + self.exec_time,
            generation: self.generation.load(Ordering::Acquire),
        };

        if self.irq.push(completion).is_err() {
            warn!("rve[{}]: irq queue full, dropping job {}", core, job.id());
            return Err(Error::Busy);
        }

        trace!("rve[{}]: job {} due in {:?}", core, job.id(), self.exec_time);
        Ok(())
    }

    fn soft_reset(&self, core: CoreId) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.resets.fetch_add(1, Ordering::Relaxed);
        debug!("rve[{}]: soft reset", core);
    }

    fn get_version(&self, _core: CoreId) -> HwVersion {
        let (major, minor, revision) = SIM_VERSION;
        HwVersion::new(major, minor, revision)
    }
}

impl PowerDomain for SimulatedRve {
    fn power_enable(&self, _core: CoreId) -> Result<()> {
        self.power_on.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn power_disable(&self, _core: CoreId) {
        self.power_off.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use rve::{CommandBuffer, ContextConfig, EngineParts, EngineRegistry, SchedulerConfig, SyncMode};

    fn registry(hw: &Arc<SimulatedRve>) -> EngineRegistry {
        let parts: Vec<EngineParts> = vec![(hw.clone(), hw.clone())];
        EngineRegistry::new(SchedulerConfig::default(), parts).unwrap()
    }

    fn configure(registry: &EngineRegistry, regs: &[u32], mode: SyncMode) -> u32 {
        let handle = registry.open_context(1).unwrap();
        let commands = vec![CommandBuffer::new(regs).unwrap()];
        registry
            .configure(handle, ContextConfig::new(commands, mode))
            .unwrap();
        handle
    }

    #[test]
    fn test_version() {
        let hw = SimulatedRve::new(0, Duration::ZERO, 4);
        assert_eq!(hw.get_version(0).str, "1.0.3");
    }

    #[cfg(feature = "sync-file")]
    #[test]
    fn test_start_posts_completion() {
        let hw = Arc::new(SimulatedRve::new(0, Duration::from_millis(1), 4));
        let registry = registry(&hw);
        let handle = configure(&registry, &[0x1, 0x2], SyncMode::Async);

        registry.commit(handle).unwrap();

        let completion = hw.take_completion().unwrap();
        assert!(hw.is_current(&completion));
        assert!(hw.take_completion().is_none());
        assert_eq!(hw.programmed(), 1);
    }

    #[cfg(feature = "sync-file")]
    #[test]
    fn test_reset_invalidates_posted_completion() {
        let hw = Arc::new(SimulatedRve::new(0, Duration::from_millis(1), 4));
        let registry = registry(&hw);
        let handle = configure(&registry, &[0x1], SyncMode::Async);

        registry.commit(handle).unwrap();
        registry.cancel(handle).unwrap();

        let completion = hw.take_completion().unwrap();
        assert!(!hw.is_current(&completion));
        assert_eq!(hw.resets(), 1);
    }

    #[test]
    fn test_oversized_command_rejected() {
        let hw = Arc::new(SimulatedRve::new(0, Duration::ZERO, 4));
        let registry = registry(&hw);
        let regs = vec![0u32; CMD_WORDS_MAX + 1];
        let handle = configure(&registry, &regs, SyncMode::Sync);

        assert_eq!(registry.commit(handle), Err(Error::HardwareProgramFailure));
        assert_eq!(hw.programmed(), 0);

        let (on, off) = hw.power_counts();
        assert_eq!(on, off);
    }

    #[test]
    fn test_hang_word_never_completes() {
        let hw = Arc::new(SimulatedRve::new(0, Duration::ZERO, 4));
        let parts: Vec<EngineParts> = vec![(hw.clone(), hw.clone())];
        let config = SchedulerConfig {
            sync_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let registry = EngineRegistry::new(config, parts).unwrap();
        let handle = configure(&registry, &[HANG_WORD], SyncMode::Sync);

        assert_eq!(registry.commit(handle), Err(Error::HardwareTimeout));
        assert!(hw.take_completion().is_none());
        assert_eq!(hw.resets(), 1);
    }
}
