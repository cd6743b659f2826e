//! Background task runner shared by the journal flusher, the page copier
//! and the cleanup manager.

use crate::core::errors::*;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Work performed by a [`PollableTask`] once per cycle.
pub trait Pollable: Send + Sync + 'static {
    fn run_task(&self) -> Result<()>;

    /// Wait before the next cycle. Returning zero runs the next cycle
    /// immediately.
    fn poll_interval(&self, configured: Duration) -> Duration {
        configured
    }

    fn should_stop(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct Signal {
    kicked: bool,
    stopped: bool,
}

struct TaskShared {
    name: String,
    signal: Mutex<Signal>,
    cond: Condvar,
    interval_millis: AtomicU64,
    cycles: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<Error>>,
}

/// A named thread that runs a [`Pollable`] every poll interval, or sooner
/// when kicked.
pub struct PollableTask {
    shared: Arc<TaskShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PollableTask {
    pub fn start(name: &str, interval: Duration, work: Arc<dyn Pollable>) -> Result<Self> {
        let shared = Arc::new(TaskShared {
            name: name.to_string(),
            signal: Mutex::new(Signal::default()),
            cond: Condvar::new(),
            interval_millis: AtomicU64::new(interval.as_millis() as u64),
            cycles: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_error: Mutex::new(None),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(thread_shared, work))
            .map_err(|e| Error::Io(format!("failed to start {}: {}", name, e)))?;
        tracing::debug!(task = name, interval_ms = interval.as_millis() as u64, "task started");
        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(shared: Arc<TaskShared>, work: Arc<dyn Pollable>) {
        loop {
            {
                let configured = Duration::from_millis(shared.interval_millis.load(Ordering::Relaxed));
                let wait = work.poll_interval(configured);
                let mut signal = shared.signal.lock().recover_poison();
                if !signal.kicked && !signal.stopped && !wait.is_zero() {
                    signal = match shared.cond.wait_timeout(signal, wait) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                if signal.stopped {
                    break;
                }
                signal.kicked = false;
            }
            if work.should_stop() {
                break;
            }
            shared.cycles.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = work.run_task() {
                shared.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(task = %shared.name, error = %e, "task cycle failed");
                *shared.last_error.lock().recover_poison() = Some(e);
            }
        }
        tracing::debug!(task = %shared.name, "task stopped");
    }

    /// Wakes the task so it runs a cycle without waiting out its interval.
    pub fn kick(&self) {
        let mut signal = self.shared.signal.lock().recover_poison();
        signal.kicked = true;
        self.shared.cond.notify_all();
    }

    /// Stops the task and waits for its current cycle to finish.
    pub fn stop(&self) {
        {
            let mut signal = self.shared.signal.lock().recover_poison();
            signal.stopped = true;
            self.shared.cond.notify_all();
        }
        let handle = self.handle.lock().recover_poison().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!(task = %self.shared.name, "task panicked");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.lock().recover_poison().is_none()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn set_poll_interval(&self, interval: Duration) {
        self.shared.interval_millis.store(interval.as_millis() as u64, Ordering::Relaxed);
        self.kick();
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.shared.interval_millis.load(Ordering::Relaxed))
    }

    pub fn cycle_count(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u64 {
        self.shared.errors.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<Error> {
        self.shared.last_error.lock().recover_poison().clone()
    }
}

impl Drop for PollableTask {
    fn drop(&mut self) {
        self.stop();
    }
}
