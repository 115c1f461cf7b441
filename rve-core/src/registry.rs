// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Engine registry: the client-facing entry points
//!
//! Owns every engine scheduler, the context table and (with `sync-file`)
//! the fence handle table. Commits pick the least loaded engine; all jobs
//! of one commit go to the same engine.

use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::backend::{Backend, CoreId, HwVersion};
use crate::config::{SchedulerConfig, HW_VERSIONS_MAX};
use crate::context::{
    CommitPlan, Context, ContextConfig, ContextId, ContextInfo, ContextTable, OwnerId, SyncMode,
};
use crate::error::{Error, Result};
use crate::fence::{FenceFd, WaitResult};
use crate::power::PowerDomain;
use crate::scheduler::{PurgeReport, Scheduler};
use crate::stats::StatsReport;

#[cfg(feature = "sync-file")]
use crate::fence::{Fence, FenceStatus, FenceTable};
#[cfg(feature = "sync-file")]
use crate::job::Job;

/// Driver version, same shape as a hardware version
pub type DriverVersion = HwVersion;

/// Hardware collaborators for one engine
pub type EngineParts = (Arc<dyn Backend>, Arc<dyn PowerDomain>);

/// Result of a successful commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Handle of the out fence for ASYNC commits
    pub out_fence: Option<FenceFd>,
}

pub struct EngineRegistry {
    config: SchedulerConfig,
    engines: Vec<Arc<Scheduler>>,
    contexts: ContextTable,
    #[cfg(feature = "sync-file")]
    fences: FenceTable,
}

impl EngineRegistry {
    /// Bring up one scheduler per engine
    pub fn new(config: SchedulerConfig, engines: Vec<EngineParts>) -> Result<Self> {
        if engines.is_empty() {
            error!("no engines to register");
            return Err(Error::InvalidArgument);
        }

        let engines: Vec<_> = engines
            .into_iter()
            .enumerate()
            .map(|(core, (backend, power))| Arc::new(Scheduler::new(core, backend, power, &config)))
            .collect();

        for engine in &engines {
            info!(
                "rve[{}]: driver loaded successfully, ver: {}",
                engine.core(),
                engine.version().str
            );
        }

        Ok(Self {
            contexts: ContextTable::new(config.max_contexts),
            config,
            engines,
            #[cfg(feature = "sync-file")]
            fences: FenceTable::new(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn engines(&self) -> &[Arc<Scheduler>] {
        &self.engines
    }

    pub fn engine(&self, core: CoreId) -> Option<&Arc<Scheduler>> {
        self.engines.get(core)
    }

    #[cfg(feature = "sync-file")]
    pub fn fences(&self) -> &FenceTable {
        &self.fences
    }

    /// Allocate a context for `owner`
    pub fn open_context(&self, owner: OwnerId) -> Result<ContextId> {
        self.contexts.create(owner)
    }

    /// Store a new configuration on a context
    pub fn configure(&self, handle: ContextId, config: ContextConfig) -> Result<()> {
        let ctx = self.contexts.lookup(handle)?;
        ctx.configure(config, self.config.max_commands)
    }

    /// Turn the context's configuration into jobs and submit them
    ///
    /// SYNC commits block until every job finished; ASYNC commits return
    /// an out fence handle immediately.
    pub fn commit(&self, handle: ContextId) -> Result<CommitOutcome> {
        let ctx = self.contexts.lookup(handle)?;
        let plan = ctx.begin_commit()?;
        let engine = self.select_engine();

        debug!(
            "ctx[{}]: commit {} command(s) to core[{}], {:?}",
            handle,
            plan.commands.len(),
            engine.core(),
            plan.sync_mode
        );

        match plan.sync_mode {
            SyncMode::Async => self.commit_async(&ctx, engine, plan),
            SyncMode::Sync => self
                .commit_sync(&ctx, engine, plan)
                .map(|()| CommitOutcome::default()),
        }
    }

    #[cfg(feature = "sync-file")]
    fn commit_async(
        &self,
        ctx: &Arc<Context>,
        engine: &Arc<Scheduler>,
        plan: CommitPlan,
    ) -> Result<CommitOutcome> {
        let dependency = match plan.in_fence {
            Some(fd) => match self.resolve_dependency(fd) {
                Ok(fence) => Some(fence),
                Err(err) => {
                    ctx.truncate_commit(0, err);
                    return Err(err);
                }
            },
            None => None,
        };

        let out_fence = ctx.out_fence();

        for (created, command) in plan.commands.into_iter().enumerate() {
            let job = match engine.alloc_job(ctx, command, plan.priority, SyncMode::Async) {
                Ok(job) => job,
                Err(err) => {
                    ctx.truncate_commit(created, err);
                    return Err(err);
                }
            };
            ctx.note_dispatched();

            match &dependency {
                Some(fence) if !fence.is_signaled() => self.defer(fence, engine, job),
                _ => engine.submit(job),
            }
        }
        self.purge_if_released(ctx, engine);

        Ok(CommitOutcome {
            out_fence: Some(self.fences.export(&out_fence)),
        })
    }

    #[cfg(not(feature = "sync-file"))]
    fn commit_async(
        &self,
        ctx: &Arc<Context>,
        _engine: &Arc<Scheduler>,
        _plan: CommitPlan,
    ) -> Result<CommitOutcome> {
        error!("ctx[{}]: async mode needs fence support", ctx.id());
        ctx.truncate_commit(0, Error::Unsupported);
        Err(Error::Unsupported)
    }

    fn commit_sync(&self, ctx: &Arc<Context>, engine: &Arc<Scheduler>, plan: CommitPlan) -> Result<()> {
        if let Some(fd) = plan.in_fence {
            if let Err(err) = self.wait_dependency(fd) {
                ctx.truncate_commit(0, err);
                return Err(err);
            }
        }

        for (created, command) in plan.commands.into_iter().enumerate() {
            match engine.alloc_job(ctx, command, plan.priority, SyncMode::Sync) {
                Ok(job) => {
                    ctx.note_dispatched();
                    engine.submit(job);
                }
                Err(err) => {
                    // Wait for what was submitted; the commit reports err
                    ctx.truncate_commit(created, err);
                    break;
                }
            }
        }
        self.purge_if_released(ctx, engine);

        match plan
            .done
            .wait_interruptible(self.config.sync_timeout, ctx.interrupt_flag())
        {
            WaitResult::Signaled(result) => result,
            WaitResult::Timeout => {
                error!(
                    "ctx[{}]: sync commit timed out after {:?}",
                    ctx.id(),
                    self.config.sync_timeout
                );
                let report = engine.purge(ctx.id(), Some(Error::HardwareTimeout));

                // Completed between the timeout and the purge
                match plan.done.status().result() {
                    Some(Ok(())) if report == PurgeReport::default() => Ok(()),
                    _ => Err(Error::HardwareTimeout),
                }
            }
            WaitResult::Interrupted => {
                warn!("ctx[{}]: sync commit interrupted", ctx.id());
                engine.purge(ctx.id(), None);
                Err(Error::Interrupted)
            }
        }
    }

    /// Import a client-supplied input fence, consuming its handle
    #[cfg(feature = "sync-file")]
    fn resolve_dependency(&self, fd: FenceFd) -> Result<Fence> {
        let fence = self.fences.import(fd)?;

        if let FenceStatus::Error(err) = fence.status() {
            error!("input fence {} status error: {}", fd, err);
            return Err(Error::DependencyUnavailable);
        }

        Ok(fence)
    }

    #[cfg(feature = "sync-file")]
    fn wait_dependency(&self, fd: FenceFd) -> Result<()> {
        let fence = self.resolve_dependency(fd)?;

        match fence.wait_timeout(self.config.sync_timeout) {
            FenceStatus::Signaled => Ok(()),
            FenceStatus::Unsignaled => {
                error!("input fence {} not signaled in time", fd);
                Err(Error::DependencyUnavailable)
            }
            FenceStatus::Error(_) => Err(Error::DependencyUnavailable),
        }
    }

    #[cfg(not(feature = "sync-file"))]
    fn wait_dependency(&self, fd: FenceFd) -> Result<()> {
        error!("input fence {} given without fence support", fd);
        Err(Error::Unsupported)
    }

    /// Park `job` until `fence` signals
    #[cfg(feature = "sync-file")]
    fn defer(&self, fence: &Fence, engine: &Arc<Scheduler>, job: Job) {
        debug!(
            "ctx[{}]: job {} waits for input fence",
            job.context_id(),
            job.id()
        );

        let engine = Arc::clone(engine);
        fence.on_signaled(move |status| {
            if job.context().is_released() {
                engine.signal_job(job, Err(Error::Cancelled));
                return;
            }

            match status {
                FenceStatus::Error(_) => engine.signal_job(job, Err(Error::DependencyUnavailable)),
                _ => engine.submit(job),
            }
        });
    }

    /// Cancel jobs submitted after the context was released mid-commit
    fn purge_if_released(&self, ctx: &Context, engine: &Scheduler) {
        if ctx.is_released() {
            warn!("ctx[{}]: released during commit", ctx.id());
            engine.purge(ctx.id(), Some(Error::Cancelled));
        }
    }

    /// Drop one client reference; the last one purges outstanding jobs
    pub fn cancel(&self, handle: ContextId) -> Result<()> {
        let freed = self.contexts.release(handle, |ctx| self.purge(ctx))?;
        if !freed {
            debug!("ctx[{}]: still referenced after cancel", handle);
        }
        Ok(())
    }

    /// Take an extra reference on a context
    pub fn retain(&self, handle: ContextId) -> Result<()> {
        self.contexts.retain(handle)
    }

    /// Drop the reference of every context `owner` opened, as on process
    /// exit. Returns how many contexts were released.
    pub fn release_owner(&self, owner: OwnerId) -> usize {
        let mut released = 0;

        for handle in self.contexts.owned_by(owner) {
            error!("[pid:{}] destroy ctx[{}] when the user exits", owner, handle);
            if let Ok(true) = self.contexts.release(handle, |ctx| self.purge(ctx)) {
                released += 1;
            }
        }

        released
    }

    fn purge(&self, ctx: &Arc<Context>) {
        for engine in &self.engines {
            let report = engine.purge(ctx.id(), Some(Error::Cancelled));
            if report != PurgeReport::default() {
                info!(
                    "core[{}]: purged ctx[{}]: {} queued, running {}",
                    engine.core(),
                    ctx.id(),
                    report.queued,
                    report.running
                );
            }
        }
    }

    /// Wake a context blocked in a SYNC commit
    pub fn interrupt(&self, handle: ContextId) -> Result<()> {
        self.contexts.lookup(handle)?.interrupt();
        Ok(())
    }

    /// Completion interrupt from engine `core`
    pub fn job_done(&self, core: CoreId, result: Result<()>) -> Result<()> {
        match self.engines.get(core) {
            Some(engine) => {
                engine.job_done(result);
                Ok(())
            }
            None => {
                error!("completion for unknown core[{}]", core);
                Err(Error::InvalidArgument)
            }
        }
    }

    /// Close the load window on every engine; busy percent per engine
    pub fn sample_load(&self) -> Vec<u32> {
        self.engines
            .iter()
            .map(|engine| engine.sample_load())
            .collect()
    }

    /// Busy percent of the last complete window per engine
    pub fn load(&self) -> Vec<u32> {
        self.engines.iter().map(|engine| engine.load()).collect()
    }

    /// Hardware versions, at most [`HW_VERSIONS_MAX`]
    pub fn hw_versions(&self) -> Vec<HwVersion> {
        self.engines
            .iter()
            .take(HW_VERSIONS_MAX)
            .map(|engine| engine.version().clone())
            .collect()
    }

    pub fn driver_version(&self) -> DriverVersion {
        let part = |s: &str| s.parse::<u32>().unwrap_or(0);
        HwVersion::new(
            part(env!("CARGO_PKG_VERSION_MAJOR")),
            part(env!("CARGO_PKG_VERSION_MINOR")),
            part(env!("CARGO_PKG_VERSION_PATCH")),
        )
    }

    pub fn context_info(&self, handle: ContextId) -> Result<ContextInfo> {
        Ok(self.contexts.lookup(handle)?.info())
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn engine_stats(&self) -> Vec<StatsReport> {
        self.engines.iter().map(|engine| engine.stats()).collect()
    }

    /// Force-release every context, purging its jobs
    pub fn shutdown(&self) {
        let released = self.contexts.remove_all(|ctx| self.purge(ctx));
        if released > 0 {
            info!("shutdown released {} context(s)", released);
        }
    }

    /// Engine with the fewest queued plus running jobs, lowest index on ties
    fn select_engine(&self) -> &Arc<Scheduler> {
        let mut best = &self.engines[0];
        let mut best_depth = best.depth();

        for engine in &self.engines[1..] {
            let depth = engine.depth();
            if depth < best_depth {
                best = engine;
                best_depth = depth;
            }
        }

        best
    }
}

impl Drop for EngineRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;

    struct IdleBackend;

    impl Backend for IdleBackend {
        fn init_reg(&self, _job: &Job) -> Result<()> {
            Ok(())
        }

        fn set_reg(&self, _job: &Job, _core: CoreId) -> Result<()> {
            Ok(())
        }

        fn soft_reset(&self, _core: CoreId) {}

        fn get_version(&self, core: CoreId) -> HwVersion {
            HwVersion::new(1, 0, core as u32)
        }
    }

    struct NoPower;

    impl PowerDomain for NoPower {
        fn power_enable(&self, _core: CoreId) -> Result<()> {
            Ok(())
        }

        fn power_disable(&self, _core: CoreId) {}
    }

    fn registry(engines: usize) -> EngineRegistry {
        let parts = (0..engines)
            .map(|_| -> EngineParts { (Arc::new(IdleBackend), Arc::new(NoPower)) })
            .collect();
        EngineRegistry::new(SchedulerConfig::default(), parts).unwrap()
    }

    #[test]
    fn test_requires_an_engine() {
        let err = EngineRegistry::new(SchedulerConfig::default(), Vec::new());
        assert_eq!(err.err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn test_hw_versions_bounded() {
        let registry = registry(HW_VERSIONS_MAX + 2);
        let versions = registry.hw_versions();

        assert_eq!(versions.len(), HW_VERSIONS_MAX);
        assert_eq!(versions[2].str, "1.0.2");
    }

    #[test]
    fn test_driver_version_matches_package() {
        let registry = registry(1);
        assert_eq!(registry.driver_version().str, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_unknown_handles() {
        let registry = registry(1);

        assert_eq!(registry.commit(99).err(), Some(Error::NotFound));
        assert_eq!(registry.cancel(99).err(), Some(Error::NotFound));
        assert_eq!(registry.interrupt(99).err(), Some(Error::NotFound));
        assert_eq!(registry.job_done(3, Ok(())).err(), Some(Error::InvalidArgument));
    }

    #[test]
    fn test_select_engine_prefers_idle() {
        let registry = registry(2);
        let handle = registry.open_context(1).unwrap();
        let commands = vec![crate::job::CommandBuffer::new(&[1]).unwrap()];
        registry
            .configure(handle, ContextConfig::new(commands, SyncMode::Async))
            .unwrap();

        #[cfg(feature = "sync-file")]
        {
            registry.commit(handle).unwrap();
            assert!(!registry.engines()[0].is_idle());
            assert_eq!(registry.select_engine().core(), 1);
        }
    }

    #[cfg(feature = "sync-file")]
    #[test]
    fn test_release_during_commit_cancels_jobs() {
        let registry = registry(1);
        let handle = registry.open_context(1).unwrap();
        let commands = (0..2)
            .map(|i| crate::job::CommandBuffer::new(&[i]).unwrap())
            .collect();
        registry
            .configure(handle, ContextConfig::new(commands, SyncMode::Async))
            .unwrap();

        // Cancel lands between begin_commit and the first submit
        let ctx = registry.contexts.lookup(handle).unwrap();
        let plan = ctx.begin_commit().unwrap();
        registry.cancel(handle).unwrap();

        let engine = Arc::clone(&registry.engines[0]);
        let fd = registry.commit_async(&ctx, &engine, plan).unwrap().out_fence.unwrap();

        assert!(engine.is_idle());
        assert_eq!(engine.allocated(), 0);
        assert!(!ctx.is_running());
        assert_eq!(
            registry.fences().get(fd).unwrap().status(),
            FenceStatus::Error(Error::Cancelled)
        );
    }
}
