// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! RVE job scheduler
//!
//! Schedules work onto one or more RVE accelerator engines and reports
//! completion back to clients.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                   EngineRegistry                       │
//! │  open_context / configure / commit / cancel / ...      │
//! ├──────────────────┬──────────────────┬──────────────────┤
//! │   ContextTable   │  Scheduler[0..n] │    FenceTable    │
//! │ handle -> ctx    │ queue + running  │ fd -> Fence      │
//! │ refcount, fences │ power gate, load │ (sync-file)      │
//! └──────────────────┴────────┬─────────┴──────────────────┘
//!                             │ Backend / PowerDomain
//!                             ▼
//!                      hardware engine(s)
//! ```
//!
//! A client opens a context, configures it with one or more command
//! buffers and commits. Each command becomes a job on the least loaded
//! engine. SYNC commits block until the jobs finish; ASYNC commits return
//! a fence handle that signals once the last job finishes.
//!
//! # Features
//!
//! - `sync-file` (default): fence handles, input dependencies and ASYNC
//!   commits.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod fence;
pub mod job;
pub mod power;
pub mod registry;
pub mod scheduler;
pub mod stats;

pub use self::backend::{Backend, CoreId, HwVersion};
pub use self::config::{SchedulerConfig, HW_VERSIONS_MAX, PRIORITY_DEFAULT, PRIORITY_MAX};
pub use self::context::{
    ContextConfig, ContextDebugInfo, ContextId, ContextInfo, OwnerId, SyncMode,
};
pub use self::error::{Error, Result};
pub use self::fence::{Fence, FenceFd, FenceStatus, WaitResult};
pub use self::job::{CommandBuffer, Job, JobFlags, JobId};
pub use self::power::{PowerDomain, PowerGate};
pub use self::registry::{CommitOutcome, DriverVersion, EngineParts, EngineRegistry};
pub use self::scheduler::{PurgeReport, Scheduler};
pub use self::stats::StatsReport;

#[cfg(feature = "sync-file")]
pub use self::fence::FenceTable;
