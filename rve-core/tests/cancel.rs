// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{build, cmds, open_configured, wait_until};
use rve::{Error, SchedulerConfig, SyncMode};

#[cfg(feature = "sync-file")]
#[test]
fn cancel_purges_queued_and_running() {
    let (registry, hws) = build(1, SchedulerConfig::default());

    let victim = open_configured(&registry, 1, cmds(3), SyncMode::Async, 0);
    let fd = registry.commit(victim).unwrap().out_fence.unwrap();
    let fence = registry.fences().get(fd).unwrap();

    let bystander = open_configured(&registry, 2, cmds(1), SyncMode::Async, 0);
    registry.commit(bystander).unwrap();

    registry.cancel(victim).unwrap();

    let engine = &registry.engines()[0];
    assert!(!engine.holds_context(victim));
    assert_eq!(fence.status().result(), Some(Err(Error::Cancelled)));
    assert_eq!(hws[0].resets(), 1);
    assert_eq!(engine.running_job().map(|(_, ctx)| ctx), Some(bystander));
    assert_eq!(registry.context_info(victim).err(), Some(Error::NotFound));
    assert_eq!(registry.engine_stats()[0].cancelled, 3);

    registry.job_done(0, Ok(())).unwrap();
    assert!(engine.is_idle());
    assert!(hws[0].power_balanced());
    assert_eq!(hws[0].started_contexts(), vec![victim, bystander]);
}

#[test]
fn cancel_idle_context() {
    let (registry, hws) = build(1, SchedulerConfig::default());
    let handle = open_configured(&registry, 1, cmds(1), SyncMode::Sync, 0);

    registry.cancel(handle).unwrap();

    assert_eq!(hws[0].resets(), 0);
    assert_eq!(registry.cancel(handle), Err(Error::NotFound));
    assert_eq!(registry.commit(handle).err(), Some(Error::NotFound));
    assert_eq!(registry.context_count(), 0);
}

#[test]
fn retained_context_survives_one_cancel() {
    let (registry, _hws) = build(1, SchedulerConfig::default());
    let handle = open_configured(&registry, 1, cmds(1), SyncMode::Sync, 0);

    registry.retain(handle).unwrap();
    registry.cancel(handle).unwrap();
    assert_eq!(registry.context_info(handle).unwrap().refcount, 1);

    registry.cancel(handle).unwrap();
    assert_eq!(registry.context_info(handle).err(), Some(Error::NotFound));
}

#[test]
fn cancel_wakes_sync_waiter() {
    let config = SchedulerConfig {
        sync_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let (registry, hws) = build(1, config);
    let handle = open_configured(&registry, 1, cmds(1), SyncMode::Sync, 0);

    // Keep our own reference so the waiter's context outlives the cancel
    registry.retain(handle).unwrap();

    let client = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.commit(handle))
    };
    assert!(wait_until(Duration::from_secs(5), || hws[0].started_count() == 1));

    registry.cancel(handle).unwrap();
    assert!(registry.context_info(handle).is_ok());
    assert_eq!(hws[0].resets(), 0);

    registry.cancel(handle).unwrap();
    assert_eq!(client.join().unwrap(), Err(Error::Cancelled));
    assert_eq!(hws[0].resets(), 1);
    assert!(registry.engines()[0].is_idle());
}

#[cfg(feature = "sync-file")]
#[test]
fn owner_exit_releases_only_its_contexts() {
    let (registry, hws) = build(1, SchedulerConfig::default());

    let mine_a = open_configured(&registry, 10, cmds(2), SyncMode::Async, 0);
    let mine_b = open_configured(&registry, 10, cmds(1), SyncMode::Sync, 0);
    let theirs = open_configured(&registry, 11, cmds(1), SyncMode::Async, 0);

    registry.commit(mine_a).unwrap();
    registry.commit(theirs).unwrap();

    assert_eq!(registry.release_owner(10), 2);

    assert_eq!(registry.context_info(mine_a).err(), Some(Error::NotFound));
    assert_eq!(registry.context_info(mine_b).err(), Some(Error::NotFound));
    assert!(registry.context_info(theirs).unwrap().is_running);

    let engine = &registry.engines()[0];
    assert_eq!(engine.running_job().map(|(_, ctx)| ctx), Some(theirs));
    assert!(!engine.holds_context(mine_a));

    registry.job_done(0, Ok(())).unwrap();
    assert!(!registry.context_info(theirs).unwrap().is_running);
    assert_eq!(hws[0].started_contexts(), vec![mine_a, theirs]);
    assert_eq!(registry.release_owner(10), 0);
}

#[test]
fn stale_completion_after_cancel_ignored() {
    let config = SchedulerConfig {
        sync_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let (registry, hws) = build(1, config);
    let handle = open_configured(&registry, 1, cmds(1), SyncMode::Sync, 0);

    let client = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.commit(handle))
    };
    assert!(wait_until(Duration::from_secs(5), || hws[0].started_count() == 1));

    registry.cancel(handle).unwrap();
    assert_eq!(client.join().unwrap(), Err(Error::Cancelled));

    registry.job_done(0, Ok(())).unwrap();

    let stats = &registry.engine_stats()[0];
    assert_eq!(stats.stale_irqs, 1);
    assert_eq!(stats.completed, 0);
    assert_eq!(stats.cancelled, 1);
}

#[cfg(feature = "sync-file")]
#[test]
fn shutdown_releases_everything() {
    let (registry, hws) = build(2, SchedulerConfig::default());

    for owner in 0..4 {
        let handle = open_configured(&registry, owner, cmds(2), SyncMode::Async, 0);
        registry.commit(handle).unwrap();
    }
    assert_eq!(registry.context_count(), 4);

    registry.shutdown();

    assert_eq!(registry.context_count(), 0);
    for (engine, hw) in registry.engines().iter().zip(&hws) {
        assert!(engine.is_idle());
        assert_eq!(engine.allocated(), 0);
        assert!(hw.power_balanced());
    }
}
