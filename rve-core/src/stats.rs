// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Per-engine job statistics
//!
//! Counts job outcomes and tracks hardware time, throughput and queue depth.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Hardware time histogram bucket boundaries (in microseconds)
const HW_TIME_BUCKETS: [u64; 12] = [
    64,        // 64 μs
    128,       // 128 μs
    256,       // 256 μs
    512,       // 512 μs
    1_000,     // 1 ms
    2_000,     // 2 ms
    4_000,     // 4 ms
    8_000,     // 8 ms
    16_000,    // 16 ms
    64_000,    // 64 ms
    256_000,   // 256 ms
    u64::MAX,  // 256+ ms
];

/// Job statistics for one engine
pub struct EngineStats {
    // Outcomes
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,

    // Engine events
    resets: AtomicU64,
    irqs: AtomicU64,
    stale_irqs: AtomicU64,

    // Hardware time tracking
    total_hw_time_us: AtomicU64,
    max_hw_time_us: AtomicU64,
    hw_time_histogram: [AtomicU64; 12],

    max_queue_depth: AtomicU32,

    // Rate calculation
    last_snapshot: Mutex<Option<(Instant, u64)>>,
}

/// Human-readable stats report
#[derive(Debug, Clone, Default)]
pub struct StatsReport {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeouts: u64,
    pub cancelled: u64,
    pub resets: u64,
    pub irqs: u64,
    pub stale_irqs: u64,
    /// Jobs finished per second since the previous snapshot
    pub jobs_per_sec: f64,
    pub avg_hw_time: Duration,
    pub max_hw_time: Duration,
    pub p50_hw_time: Duration,
    pub p99_hw_time: Duration,
    pub max_queue_depth: u32,
}

impl StatsReport {
    /// Jobs that reached a final state
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.timeouts + self.cancelled
    }
}

impl EngineStats {
    pub const fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            irqs: AtomicU64::new(0),
            stale_irqs: AtomicU64::new(0),
            total_hw_time_us: AtomicU64::new(0),
            max_hw_time_us: AtomicU64::new(0),
            hw_time_histogram: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
            max_queue_depth: AtomicU32::new(0),
            last_snapshot: Mutex::new(None),
        }
    }

    /// Record a job entering the queue, `depth` being the queue length after
    pub fn record_submit(&self, depth: usize) {
        self.submitted.fetch_add(1, Ordering::Relaxed);

        let depth = depth.min(u32::MAX as usize) as u32;
        let mut current_max = self.max_queue_depth.load(Ordering::Relaxed);
        while depth > current_max {
            match self.max_queue_depth.compare_exchange_weak(
                current_max,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    /// Record a job reaching its final state
    pub fn record_finish(&self, result: &Result<()>, hw_time: Option<Duration>) {
        let counter = match result {
            Ok(()) => &self.completed,
            Err(Error::HardwareTimeout) => &self.timeouts,
            Err(Error::Cancelled) => &self.cancelled,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let Some(hw_time) = hw_time else {
            return;
        };

        let hw_us = hw_time.as_micros().min(u64::MAX as u128) as u64;
        self.total_hw_time_us.fetch_add(hw_us, Ordering::Relaxed);
        self.max_hw_time_us.fetch_max(hw_us, Ordering::Relaxed);

        for (i, &bucket) in HW_TIME_BUCKETS.iter().enumerate() {
            if hw_us <= bucket {
                self.hw_time_histogram[i].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }

    pub fn record_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion interrupt; `stale` when no job was running
    pub fn record_irq(&self, stale: bool) {
        self.irqs.fetch_add(1, Ordering::Relaxed);
        if stale {
            self.stale_irqs.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Get statistics snapshot
    pub fn snapshot(&self) -> StatsReport {
        let now = Instant::now();

        let completed = self.completed.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let timeouts = self.timeouts.load(Ordering::Relaxed);
        let cancelled = self.cancelled.load(Ordering::Relaxed);
        let finished = completed + failed + timeouts + cancelled;

        let jobs_per_sec = {
            let mut last = self.last_snapshot.lock();
            let rate = match *last {
                Some((time, prev)) => {
                    let elapsed = now.duration_since(time).as_secs_f64();
                    if elapsed > 0.0 {
                        finished.saturating_sub(prev) as f64 / elapsed
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            *last = Some((now, finished));
            rate
        };

        let timed = self.hw_time_histogram
            .iter()
            .map(|bucket| bucket.load(Ordering::Relaxed))
            .sum::<u64>();
        let avg_hw_time = if timed > 0 {
            Duration::from_micros(self.total_hw_time_us.load(Ordering::Relaxed) / timed)
        } else {
            Duration::ZERO
        };

        let (p50, p99) = self.calculate_percentiles();

        StatsReport {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed,
            failed,
            timeouts,
            cancelled,
            resets: self.resets.load(Ordering::Relaxed),
            irqs: self.irqs.load(Ordering::Relaxed),
            stale_irqs: self.stale_irqs.load(Ordering::Relaxed),
            jobs_per_sec,
            avg_hw_time,
            max_hw_time: Duration::from_micros(self.max_hw_time_us.load(Ordering::Relaxed)),
            p50_hw_time: p50,
            p99_hw_time: p99,
            max_queue_depth: self.max_queue_depth.load(Ordering::Relaxed),
        }
    }

    /// Calculate percentile hardware times from histogram
    fn calculate_percentiles(&self) -> (Duration, Duration) {
        let mut total: u64 = 0;
        let mut histogram = [0u64; 12];

        for (i, bucket) in self.hw_time_histogram.iter().enumerate() {
            histogram[i] = bucket.load(Ordering::Relaxed);
            total += histogram[i];
        }

        if total == 0 {
            return (Duration::ZERO, Duration::ZERO);
        }

        let p50_threshold = total.div_ceil(2);
        let p99_threshold = (total * 99).div_ceil(100);

        let mut cumulative = 0u64;
        let mut p50 = None;
        let mut p99 = None;

        for (i, &count) in histogram.iter().enumerate() {
            cumulative += count;

            if p50.is_none() && cumulative >= p50_threshold {
                p50 = Some(Duration::from_micros(HW_TIME_BUCKETS[i]));
            }
            if p99.is_none() && cumulative >= p99_threshold {
                p99 = Some(Duration::from_micros(HW_TIME_BUCKETS[i]));
                break;
            }
        }

        (p50.unwrap_or_default(), p99.unwrap_or_default())
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_counted() {
        let stats = EngineStats::new();
        stats.record_submit(1);
        stats.record_submit(3);
        stats.record_submit(2);

        stats.record_finish(&Ok(()), Some(Duration::from_micros(100)));
        stats.record_finish(&Err(Error::HardwareTimeout), Some(Duration::from_millis(600)));
        stats.record_finish(&Err(Error::Cancelled), None);
        stats.record_finish(&Err(Error::HardwareProgramFailure), None);

        let report = stats.snapshot();
        assert_eq!(report.submitted, 3);
        assert_eq!(report.completed, 1);
        assert_eq!(report.timeouts, 1);
        assert_eq!(report.cancelled, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.finished(), 4);
        assert_eq!(report.max_queue_depth, 3);
        assert_eq!(report.max_hw_time, Duration::from_millis(600));
    }

    #[test]
    fn test_percentiles() {
        let stats = EngineStats::new();
        for _ in 0..99 {
            stats.record_finish(&Ok(()), Some(Duration::from_micros(50)));
        }
        stats.record_finish(&Ok(()), Some(Duration::from_millis(10)));

        let report = stats.snapshot();
        assert_eq!(report.p50_hw_time, Duration::from_micros(64));
        assert_eq!(report.p99_hw_time, Duration::from_micros(64));
        assert_eq!(report.max_hw_time, Duration::from_millis(10));
    }

    #[test]
    fn test_irq_counters() {
        let stats = EngineStats::new();
        stats.record_irq(false);
        stats.record_irq(true);
        stats.record_reset();

        let report = stats.snapshot();
        assert_eq!(report.irqs, 2);
        assert_eq!(report.stale_irqs, 1);
        assert_eq!(report.resets, 1);
    }
}
