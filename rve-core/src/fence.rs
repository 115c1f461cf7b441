// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Completion fences
//!
//! A [`Fence`] is a single-writer, multi-reader completion signal. The
//! scheduler signals it once when a commit finishes; any number of waiters
//! can block on it with a timeout or poll its status. Callbacks registered
//! with [`Fence::on_signaled`] run on the signaling thread after the fence
//! lock is dropped, which is how deferred jobs wait for an input dependency.
//!
//! With the `sync-file` feature, a [`FenceTable`] exports fences as numeric
//! handles so another client can poll or wait on them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::warn;
use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Exported fence handle. Valid handles are positive.
pub type FenceFd = u32;

/// Observable state of a fence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// Not signaled yet
    Unsignaled,
    /// Signaled, work succeeded
    Signaled,
    /// Signaled, work failed
    Error(Error),
}

impl FenceStatus {
    /// Completion result, or `None` while unsignaled
    pub fn result(self) -> Option<Result<()>> {
        match self {
            FenceStatus::Unsignaled => None,
            FenceStatus::Signaled => Some(Ok(())),
            FenceStatus::Error(err) => Some(Err(err)),
        }
    }
}

impl From<Result<()>> for FenceStatus {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => FenceStatus::Signaled,
            Err(err) => FenceStatus::Error(err),
        }
    }
}

/// Outcome of an interruptible wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled(Result<()>),
    Timeout,
    Interrupted,
}

type FenceCallback = Box<dyn FnOnce(FenceStatus) + Send>;

struct FenceState {
    status: FenceStatus,
    callbacks: Vec<FenceCallback>,
}

struct FenceInner {
    state: Mutex<FenceState>,
    cond: Condvar,
}

// A fence dropped unsignaled can never resolve its dependents
impl Drop for FenceInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.callbacks.is_empty() {
            return;
        }

        warn!(
            "fence dropped unsignaled with {} pending callback(s)",
            state.callbacks.len()
        );

        let status = FenceStatus::Error(Error::DependencyUnavailable);
        state.status = status;
        for callback in std::mem::take(&mut state.callbacks) {
            callback(status);
        }
    }
}

/// Shared completion signal. Clones refer to the same fence.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    /// Create an unsignaled fence
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState {
                    status: FenceStatus::Unsignaled,
                    callbacks: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Current status (non-blocking)
    pub fn status(&self) -> FenceStatus {
        self.inner.state.lock().status
    }

    pub fn is_signaled(&self) -> bool {
        self.status() != FenceStatus::Unsignaled
    }

    /// Signal the fence with `result`
    ///
    /// Returns `false` if it was already signaled; the first writer wins.
    pub fn signal(&self, result: Result<()>) -> bool {
        let (status, callbacks) = {
            let mut state = self.inner.state.lock();
            if state.status != FenceStatus::Unsignaled {
                return false;
            }
            state.status = result.into();
            (state.status, std::mem::take(&mut state.callbacks))
        };

        self.inner.cond.notify_all();

        for callback in callbacks {
            callback(status);
        }

        true
    }

    /// Run `callback` once the fence is signaled
    ///
    /// If it is already signaled the callback runs immediately on the
    /// calling thread.
    pub fn on_signaled<F>(&self, callback: F)
    where
        F: FnOnce(FenceStatus) + Send + 'static,
    {
        let status = {
            let mut state = self.inner.state.lock();
            if state.status == FenceStatus::Unsignaled {
                state.callbacks.push(Box::new(callback));
                return;
            }
            state.status
        };

        callback(status);
    }

    /// Block until signaled or `timeout` elapses
    ///
    /// Returns [`FenceStatus::Unsignaled`] on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> FenceStatus {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();

        while state.status == FenceStatus::Unsignaled {
            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }

        state.status
    }

    /// Like [`wait_timeout`](Self::wait_timeout), but gives up early when
    /// `interrupt` is raised. The flag is consumed when observed.
    pub fn wait_interruptible(&self, timeout: Duration, interrupt: &AtomicBool) -> WaitResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();

        loop {
            if let Some(result) = state.status.result() {
                return WaitResult::Signaled(result);
            }

            if interrupt.swap(false, Ordering::AcqRel) {
                return WaitResult::Interrupted;
            }

            if self.inner.cond.wait_until(&mut state, deadline).timed_out() {
                return match state.status.result() {
                    Some(result) => WaitResult::Signaled(result),
                    None => WaitResult::Timeout,
                };
            }
        }
    }

    /// Wake every waiter without signaling, so they re-check their
    /// interrupt flags
    pub fn kick(&self) {
        let _state = self.inner.state.lock();
        self.inner.cond.notify_all();
    }

    /// Whether two handles refer to the same fence
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for Fence {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Fence {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Fence")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(feature = "sync-file")]
pub use self::table::FenceTable;

#[cfg(feature = "sync-file")]
mod table {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use log::{debug, error};
    use parking_lot::Mutex;

    use super::{Fence, FenceFd};
    use crate::error::{Error, Result};

    /// Handle table for fences visible outside the submitting client
    pub struct FenceTable {
        fences: Mutex<HashMap<FenceFd, Fence>>,
        next_fd: AtomicU32,
    }

    impl FenceTable {
        pub fn new() -> Self {
            Self {
                fences: Mutex::new(HashMap::new()),
                next_fd: AtomicU32::new(1),
            }
        }

        /// Publish `fence` under a fresh handle
        pub fn export(&self, fence: &Fence) -> FenceFd {
            let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
            self.fences.lock().insert(fd, fence.clone());
            debug!("exported fence {}", fd);
            fd
        }

        /// Take ownership of the fence behind `fd`, closing the handle
        ///
        /// The handle is consumed whether or not the caller can use the
        /// fence afterwards.
        pub fn import(&self, fd: FenceFd) -> Result<Fence> {
            match self.fences.lock().remove(&fd) {
                Some(fence) => Ok(fence),
                None => {
                    error!("failed to get input fence {}", fd);
                    Err(Error::DependencyUnavailable)
                }
            }
        }

        /// Look up `fd` without consuming it
        pub fn get(&self, fd: FenceFd) -> Result<Fence> {
            self.fences.lock().get(&fd).cloned().ok_or(Error::NotFound)
        }

        /// Close a handle. Returns whether it existed.
        pub fn close(&self, fd: FenceFd) -> bool {
            // Dropped after the table lock; the last reference may run callbacks
            let removed = self.fences.lock().remove(&fd);
            removed.is_some()
        }

        /// Number of open handles
        pub fn len(&self) -> usize {
            self.fences.lock().len()
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }
    }

    impl Default for FenceTable {
        fn default() -> Self {
            Self::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_fence_unsignaled() {
        let fence = Fence::new();
        assert_eq!(fence.status(), FenceStatus::Unsignaled);
        assert!(!fence.is_signaled());
        assert_eq!(fence.status().result(), None);
    }

    #[test]
    fn test_first_signal_wins() {
        let fence = Fence::new();
        assert!(fence.signal(Err(Error::HardwareTimeout)));
        assert!(!fence.signal(Ok(())));
        assert_eq!(fence.status(), FenceStatus::Error(Error::HardwareTimeout));
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let fence = Fence::new();
        let signaler = fence.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaler.signal(Ok(()));
        });

        assert_eq!(fence.wait_timeout(Duration::from_secs(5)), FenceStatus::Signaled);
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_timeout_expires() {
        let fence = Fence::new();
        assert_eq!(
            fence.wait_timeout(Duration::from_millis(10)),
            FenceStatus::Unsignaled
        );
    }

    #[test]
    fn test_callbacks_run_once_on_signal() {
        let fence = Fence::new();
        let hits = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            fence.on_signaled(move |status| {
                assert_eq!(status, FenceStatus::Signaled);
                hits.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(hits.load(Ordering::Relaxed), 0);

        fence.signal(Ok(()));
        fence.signal(Ok(()));
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_callback_on_signaled_fence_runs_inline() {
        let fence = Fence::new();
        fence.signal(Err(Error::Cancelled));

        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        fence.on_signaled(move |status| *slot.lock() = Some(status));

        assert_eq!(*seen.lock(), Some(FenceStatus::Error(Error::Cancelled)));
    }

    #[test]
    fn test_dropped_fence_fails_pending_callbacks() {
        let fence = Fence::new();
        let seen = Arc::new(Mutex::new(None));

        let slot = seen.clone();
        fence.on_signaled(move |status| *slot.lock() = Some(status));

        let other = fence.clone();
        drop(fence);
        assert_eq!(*seen.lock(), None);

        drop(other);
        assert_eq!(
            *seen.lock(),
            Some(FenceStatus::Error(Error::DependencyUnavailable))
        );
    }

    #[test]
    fn test_wait_interrupted() {
        let fence = Fence::new();
        let interrupt = Arc::new(AtomicBool::new(false));

        let kicker = fence.clone();
        let flag = interrupt.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            flag.store(true, Ordering::Release);
            kicker.kick();
        });

        let result = fence.wait_interruptible(Duration::from_secs(5), &interrupt);
        assert_eq!(result, WaitResult::Interrupted);
        assert!(!interrupt.load(Ordering::Acquire));
        handle.join().unwrap();
    }

    #[cfg(feature = "sync-file")]
    #[test]
    fn test_table_import_consumes_handle() {
        let table = FenceTable::new();
        let fence = Fence::new();
        let fd = table.export(&fence);

        assert!(fd > 0);
        assert!(table.get(fd).unwrap().ptr_eq(&fence));

        let imported = table.import(fd).unwrap();
        assert!(imported.ptr_eq(&fence));
        assert_eq!(table.import(fd).err(), Some(Error::DependencyUnavailable));
        assert!(table.is_empty());
    }
}
