// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! RVE Driver Server
//!
//! Hosts the RVE job scheduler on top of simulated engines and exposes it
//! through a line-oriented control surface on stdin/stdout:
//!
//! - Per-engine priority queues with aging
//! - Synchronous and fence-based asynchronous submission
//! - Hang detection with engine soft reset
//! - Load sampling and performance counters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Client Processes                              │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │ open / config / commit / cancel ...
//! ┌──────────────────────────▼──────────────────────────────────────┐
//! │                    RVE Driver Server                             │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                  RveScheme                               │    │
//! │  │  • request parsing, errno replies                       │    │
//! │  │  • client fences                                        │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                            │                                     │
//! │  ┌─────────────────────────▼───────────────────────────────┐    │
//! │  │              EngineRegistry                              │    │
//! │  │  ┌─────────┐ ┌─────────┐ ┌─────────┐                     │    │
//! │  │  │ sched 0 │ │ sched 1 │ │ sched 2 │ ...                 │    │
//! │  │  └────┬────┘ └────┬────┘ └────┬────┘                     │    │
//! │  └───────┼───────────┼───────────┼─────────────────────────┘    │
//! │          │           │           │                               │
//! │  ┌───────▼───────────▼───────────▼─────────────────────────┐    │
//! │  │              Completion Workers (poll)                   │    │
//! │  │  • one thread per engine                                │    │
//! │  │  • stale completions dropped after reset                │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │ register writes / completions
//! ┌──────────────────────────▼──────────────────────────────────────┐
//! │                    Simulated RVE Engines                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use log::{debug, error, info, trace, warn};

use rve::{EngineParts, EngineRegistry, SchedulerConfig};

mod hw;
mod scheme;

use crate::hw::SimulatedRve;
use crate::scheme::RveScheme;

/// Completions that may be pending per engine at once
const IRQ_QUEUE_DEPTH: usize = 64;

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Number of simulated engines
    pub num_cores: usize,
    /// Scheduler tunables shared by every engine
    pub scheduler: SchedulerConfig,
    /// Simulated execution time of one job
    pub exec_time_us: u64,
    /// Completion polling interval in microseconds
    pub poll_interval_us: u64,
    /// Seconds between stats reports
    pub stats_interval_s: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            num_cores: 1,
            scheduler: SchedulerConfig::default(),
            exec_time_us: 2000,
            poll_interval_us: 100,
            stats_interval_s: 10,
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Starting RVE driver v{}", env!("CARGO_PKG_VERSION"));

    let config = parse_config();
    info!("Configuration: {:?}", config);

    let exec_time = Duration::from_micros(config.exec_time_us);
    let engines: Vec<Arc<SimulatedRve>> = (0..config.num_cores)
        .map(|core| Arc::new(SimulatedRve::new(core, exec_time, IRQ_QUEUE_DEPTH)))
        .collect();

    let parts = engines
        .iter()
        .map(|hw| -> EngineParts { (hw.clone(), hw.clone()) })
        .collect();

    let registry = Arc::new(
        EngineRegistry::new(config.scheduler.clone(), parts)
            .context("failed to register RVE engines")?,
    );

    for (core, version) in registry.hw_versions().iter().enumerate() {
        info!("rve[{}]: hardware version {}", core, version.str);
    }

    let running = Arc::new(AtomicBool::new(true));

    let mut workers = Vec::with_capacity(engines.len());
    for hw in &engines {
        let hw = hw.clone();
        let registry = registry.clone();
        let running = running.clone();
        let poll_interval = Duration::from_micros(config.poll_interval_us);

        let handle = thread::Builder::new()
            .name(format!("rve-core-{}", hw.core()))
            .spawn(move || completion_worker(hw, registry, running, poll_interval))
            .context("failed to spawn completion worker")?;
        workers.push(handle);
    }

    {
        let registry = registry.clone();
        let interval = config.scheduler.load_interval;
        thread::Builder::new()
            .name("rve-load".to_string())
            .spawn(move || load_monitor(registry, interval))
            .context("failed to spawn load monitor")?;
    }

    #[cfg(feature = "performance-counters")]
    {
        let registry = registry.clone();
        let interval = Duration::from_secs(config.stats_interval_s.max(1));
        thread::Builder::new()
            .name("rve-stats".to_string())
            .spawn(move || stats_reporter(registry, interval))
            .context("failed to spawn stats reporter")?;
    }

    info!("RVE driver ready with {} engines", engines.len());

    let scheme = RveScheme::new(registry.clone(), std::process::id());
    serve(&scheme, io::stdin().lock(), io::stdout().lock())?;

    info!("RVE driver shutting down");
    registry.shutdown();
    running.store(false, Ordering::Release);

    for worker in workers {
        if worker.join().is_err() {
            error!("rve: completion worker panicked");
        }
    }

    for hw in &engines {
        let (on, off) = hw.power_counts();
        info!(
            "rve[{}]: {} jobs programmed, {} resets, power on/off {}/{}",
            hw.core(),
            hw.programmed(),
            hw.resets(),
            on,
            off
        );
    }

    Ok(())
}

/// Answer requests until the input closes
fn serve<R: BufRead, W: Write>(scheme: &RveScheme, input: R, mut output: W) -> anyhow::Result<()> {
    for line in input.lines() {
        let line = line.context("failed to read request")?;
        if line.trim().is_empty() {
            continue;
        }

        trace!("rve: request '{}'", line);
        let response = scheme.handle_line(&line);
        writeln!(output, "{}", response).context("failed to write response")?;
        output.flush()?;
    }

    Ok(())
}

/// Deliver simulated completions to the scheduler once they are due
fn completion_worker(
    hw: Arc<SimulatedRve>,
    registry: Arc<EngineRegistry>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    let core = hw.core();

    while running.load(Ordering::Acquire) {
        let Some(completion) = hw.take_completion() else {
            // No work, sleep briefly
            thread::sleep(poll_interval);
            continue;
        };

        let now = Instant::now();
        if completion.due > now {
            thread::sleep(completion.due - now);
        }

        if !hw.is_current(&completion) {
            debug!("rve[{}]: dropping completion of job {} from before reset", core, completion.job);
            continue;
        }

        if let Err(err) = registry.job_done(core, Ok(())) {
            warn!("rve[{}]: completion of job {} rejected: {}", core, completion.job, err);
        }
    }
}

/// Close a load window on every engine each interval
fn load_monitor(registry: Arc<EngineRegistry>, interval: Duration) {
    loop {
        thread::sleep(interval);

        let loads = registry.sample_load();
        debug!("rve: load {:?}", loads);
    }
}

/// Statistics reporter thread
#[cfg(feature = "performance-counters")]
fn stats_reporter(registry: Arc<EngineRegistry>, interval: Duration) {
    loop {
        thread::sleep(interval);

        let loads = registry.load();
        for (core, stats) in registry.engine_stats().iter().enumerate() {
            info!("RVE[{}] Performance Stats:", core);
            info!("  Jobs/s:         {:>12.2}", stats.jobs_per_sec);
            info!("  Submitted:      {:>12}", stats.submitted);
            info!("  Completed:      {:>12}", stats.completed);
            info!("  Failed:         {:>12}", stats.failed);
            info!("  Timeouts:       {:>12}", stats.timeouts);
            info!("  Cancelled:      {:>12}", stats.cancelled);
            info!("  Resets:         {:>12}", stats.resets);
            info!("  Avg HW Time:    {:>12?}", stats.avg_hw_time);
            info!("  P99 HW Time:    {:>12?}", stats.p99_hw_time);
            info!("  Max Queue:      {:>12}", stats.max_queue_depth);
            info!("  Load:           {:>11}%", loads.get(core).copied().unwrap_or(0));
        }
    }
}

/// Parse configuration from environment
fn parse_config() -> DriverConfig {
    parse_config_from(|key| std::env::var(key).ok())
}

fn parse_config_from<F>(var: F) -> DriverConfig
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = DriverConfig::default();

    if let Some(val) = var("RVE_NUM_CORES") {
        if let Ok(n) = val.parse::<usize>() {
            if n == 0 {
                warn!("RVE_NUM_CORES=0, using one engine");
            }
            config.num_cores = n.max(1);
        }
    }

    if let Some(val) = var("RVE_SYNC_TIMEOUT_MS") {
        if let Ok(n) = val.parse() {
            config.scheduler.sync_timeout = Duration::from_millis(n);
        }
    }

    if let Some(val) = var("RVE_ASYNC_TIMEOUT_MS") {
        if let Ok(n) = val.parse() {
            config.scheduler.async_timeout = Duration::from_millis(n);
        }
    }

    if let Some(val) = var("RVE_MAX_PRIORITY") {
        if let Ok(n) = val.parse::<i32>() {
            config.scheduler.max_priority = n.max(0);
        }
    }

    if let Some(val) = var("RVE_QUEUE_CAPACITY") {
        if let Ok(n) = val.parse::<usize>() {
            config.scheduler.queue_capacity = n.max(1);
        }
    }

    if let Some(val) = var("RVE_LOAD_INTERVAL_MS") {
        if let Ok(n) = val.parse::<u64>() {
            config.scheduler.load_interval = Duration::from_millis(n.max(1));
        }
    }

    if let Some(val) = var("RVE_PD_ALWAYS_ON") {
        config.scheduler.power_always_on = val == "1" || val.to_lowercase() == "true";
    }

    if let Some(val) = var("RVE_EXEC_TIME_US") {
        if let Ok(n) = val.parse() {
            config.exec_time_us = n;
        }
    }

    if let Some(val) = var("RVE_POLL_INTERVAL_US") {
        if let Ok(n) = val.parse::<u64>() {
            config.poll_interval_us = n.max(1);
        }
    }

    if let Some(val) = var("RVE_STATS_INTERVAL_S") {
        if let Ok(n) = val.parse() {
            config.stats_interval_s = n;
        }
    }

    config
}
