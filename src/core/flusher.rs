//! Periodic journal force and commit durability waits.

use crate::core::alert::{AlertLevel, Event, FLUSH_CATEGORY, JOURNAL_CATEGORY};
use crate::core::constants::IO_MEASUREMENT_CYCLES;
use crate::core::errors::*;
use crate::core::journal::JournalManager;
use crate::core::task::Pollable;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

fn nanos_now() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

#[derive(Debug, Default)]
struct IoRing {
    samples: [u64; IO_MEASUREMENT_CYCLES],
    next: usize,
    filled: usize,
}

impl IoRing {
    fn record(&mut self, nanos: u64) -> u64 {
        self.samples[self.next] = nanos;
        self.next = (self.next + 1) % IO_MEASUREMENT_CYCLES;
        self.filled = (self.filled + 1).min(IO_MEASUREMENT_CYCLES);
        self.samples[..self.filled].iter().sum::<u64>() / self.filled as u64
    }
}

/// Timestamps bracketing the most recent flush cycle.
///
/// A commit with timestamp `t` is durable once a cycle that started after
/// `t` has also ended.
#[derive(Debug, Default)]
pub struct FlushClock {
    start_timestamp: AtomicU64,
    end_timestamp: AtomicU64,
    start_nanos: AtomicU64,
    end_nanos: AtomicU64,
    expected_io_nanos: AtomicU64,
    flushing: AtomicBool,
    io: Mutex<IoRing>,
    last_error: Mutex<Option<(u64, Error)>>,
}

#[derive(Debug, Clone, Copy)]
struct ClockSnapshot {
    start_timestamp: u64,
    end_timestamp: u64,
    start_nanos: u64,
    end_nanos: u64,
}

impl FlushClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> ClockSnapshot {
        loop {
            let start_timestamp = self.start_timestamp.load(Ordering::Acquire);
            let end_timestamp = self.end_timestamp.load(Ordering::Acquire);
            let start_nanos = self.start_nanos.load(Ordering::Acquire);
            let end_nanos = self.end_nanos.load(Ordering::Acquire);
            if start_timestamp == self.start_timestamp.load(Ordering::Acquire)
                && end_timestamp == self.end_timestamp.load(Ordering::Acquire)
            {
                return ClockSnapshot {
                    start_timestamp,
                    end_timestamp,
                    start_nanos,
                    end_nanos,
                };
            }
        }
    }

    /// Average duration of recent forces.
    pub fn expected_io(&self) -> Duration {
        Duration::from_nanos(self.expected_io_nanos.load(Ordering::Relaxed))
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn last_flush_timestamp(&self) -> u64 {
        self.end_timestamp.load(Ordering::Acquire)
    }
}

impl JournalManager {
    /// Forces the journal and records when the force started and ended.
    pub fn flusher_cycle(&self) -> Result<()> {
        let clock = &self.flush_clock;
        clock.flushing.store(true, Ordering::Release);
        let started = Instant::now();
        clock.start_nanos.store(nanos_now(), Ordering::Release);
        clock
            .start_timestamp
            .store(self.timestamps.update_timestamp(), Ordering::Release);

        let result = if self.is_closed() { Ok(()) } else { self.force() };

        clock.end_nanos.store(nanos_now(), Ordering::Release);
        clock
            .end_timestamp
            .store(self.timestamps.update_timestamp(), Ordering::Release);
        clock.flushing.store(false, Ordering::Release);

        match result {
            Ok(()) => {
                let elapsed = started.elapsed();
                let average = clock.io.lock().recover_poison().record(elapsed.as_nanos() as u64);
                clock.expected_io_nanos.store(average, Ordering::Relaxed);
                self.metrics.flush_cycle(elapsed);
                let threshold = self.options.slow_io_alert_threshold_ms;
                if elapsed.as_millis() as u64 > threshold {
                    tracing::warn!(millis = elapsed.as_millis() as u64, threshold, "slow journal flush");
                    self.alerts.post(
                        Event::new(AlertLevel::Warn, format!("journal flush took {}ms", elapsed.as_millis())),
                        FLUSH_CATEGORY,
                    );
                }
                Ok(())
            }
            Err(e) => {
                let timestamp = clock.end_timestamp.load(Ordering::Acquire);
                *clock.last_error.lock().recover_poison() = Some((timestamp, e.clone()));
                self.metrics.io_error();
                self.alerts.post(
                    Event::new(AlertLevel::Error, format!("journal flush failed: {}", e)),
                    JOURNAL_CATEGORY,
                );
                Err(e)
            }
        }
    }

    /// Blocks until everything written up to timestamp `flushed` is durable.
    ///
    /// Returns early once the remaining wait is within `lead_ms`. When no
    /// flush is in progress the caller stalls for `stall_ms` so concurrent
    /// commits can share the next force, then kicks the flusher. Without a
    /// running flusher the journal is forced directly.
    pub fn wait_for_durability(&self, flushed: u64, lead_ms: u64, stall_ms: u64) -> Result<()> {
        let started = Instant::now();
        if !self.flusher_running() {
            self.force()?;
            self.metrics.commit_waited(started.elapsed());
            return Ok(());
        }
        let clock = &self.flush_clock;
        let interval_nanos = self.options.flush_interval_ms * 1_000_000;
        let lead_nanos = lead_ms * 1_000_000;
        let mut kicked = false;
        loop {
            if self.is_closed() {
                return Err(Error::JournalClosed);
            }
            let snapshot = clock.snapshot();
            if snapshot.start_timestamp > flushed && snapshot.end_timestamp > snapshot.start_timestamp {
                break;
            }
            let now = nanos_now();
            let expected = clock.expected_io_nanos.load(Ordering::Relaxed);
            let in_progress = snapshot.start_timestamp > snapshot.end_timestamp;
            let to_finish = if in_progress && snapshot.start_timestamp > flushed {
                (snapshot.start_nanos + expected).saturating_sub(now)
            } else {
                let next_start = snapshot.end_nanos.max(snapshot.start_nanos) + interval_nanos;
                next_start.saturating_sub(now) + expected
            };
            if lead_nanos > 0 && lead_nanos >= to_finish {
                break;
            }
            if !in_progress && !kicked {
                if stall_ms > 0 {
                    thread::sleep(Duration::from_millis(stall_ms));
                }
                self.kick_flusher();
                kicked = true;
            } else {
                thread::sleep(Duration::from_micros(10));
            }
        }
        if let Some((timestamp, error)) = clock.last_error.lock().recover_poison().as_ref() {
            if *timestamp > flushed {
                return Err(error.clone());
            }
        }
        self.metrics.commit_waited(started.elapsed());
        Ok(())
    }
}

/// Background task forcing the journal every flush interval.
pub struct JournalFlusher {
    journal: Weak<JournalManager>,
}

impl JournalFlusher {
    pub fn new(journal: Weak<JournalManager>) -> Self {
        Self { journal }
    }
}

impl Pollable for JournalFlusher {
    fn run_task(&self) -> Result<()> {
        match self.journal.upgrade() {
            Some(journal) => journal.flusher_cycle(),
            None => Ok(()),
        }
    }

    fn should_stop(&self) -> bool {
        self.journal.upgrade().map_or(true, |j| j.is_closed())
    }
}
