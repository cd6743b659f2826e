use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters maintained by the journal manager and its background tasks.
/// All fields use atomic types for lock-free updates.
#[derive(Debug, Default)]
pub struct JournalMetrics {
    // Page traffic
    pages_written: AtomicU64,
    pages_read: AtomicU64,
    pages_copied: AtomicU64,
    pages_dropped: AtomicU64,

    // Records
    transaction_records: AtomicU64,
    bytes_written: AtomicU64,
    checkpoints: AtomicU64,

    // File management
    flushes: AtomicU64,
    forces: AtomicU64,
    rollovers: AtomicU64,
    files_deleted: AtomicU64,

    // Durability waits
    commits: AtomicU64,
    commit_wait_nanos: AtomicU64,
    flush_cycles: AtomicU64,
    flush_io_nanos: AtomicU64,

    io_errors: AtomicU64,
}

/// Snapshot of journal metrics at a point in time.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct JournalMetricsSnapshot {
    pub pages_written: u64,
    pub pages_read: u64,
    pub pages_copied: u64,
    pub pages_dropped: u64,

    pub transaction_records: u64,
    pub bytes_written: u64,
    pub checkpoints: u64,

    pub flushes: u64,
    pub forces: u64,
    pub rollovers: u64,
    pub files_deleted: u64,

    pub commits: u64,
    pub avg_commit_wait_micros: f64,
    pub flush_cycles: u64,
    pub avg_flush_io_micros: f64,

    pub io_errors: u64,
}

impl JournalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn page_written(&self, bytes: usize) {
        self.pages_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn page_read(&self) {
        self.pages_read.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn pages_copied(&self, count: usize) {
        self.pages_copied.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn pages_dropped(&self, count: usize) {
        self.pages_dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn transaction_written(&self, bytes: usize) {
        self.transaction_records.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_written(&self, bytes: usize) {
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn checkpoint_written(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn flushed(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn forced(&self) {
        self.forces.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn rolled_over(&self) {
        self.rollovers.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn files_deleted(&self, count: usize) {
        self.files_deleted.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn commit_waited(&self, elapsed: Duration) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.commit_wait_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn flush_cycle(&self, elapsed: Duration) {
        self.flush_cycles.fetch_add(1, Ordering::Relaxed);
        self.flush_io_nanos.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Uses Relaxed ordering since monitoring does not need strict consistency.
    pub fn snapshot(&self) -> JournalMetricsSnapshot {
        let commits = self.commits.load(Ordering::Relaxed);
        let commit_wait = self.commit_wait_nanos.load(Ordering::Relaxed);
        let flush_cycles = self.flush_cycles.load(Ordering::Relaxed);
        let flush_io = self.flush_io_nanos.load(Ordering::Relaxed);

        JournalMetricsSnapshot {
            pages_written: self.pages_written.load(Ordering::Relaxed),
            pages_read: self.pages_read.load(Ordering::Relaxed),
            pages_copied: self.pages_copied.load(Ordering::Relaxed),
            pages_dropped: self.pages_dropped.load(Ordering::Relaxed),

            transaction_records: self.transaction_records.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),

            flushes: self.flushes.load(Ordering::Relaxed),
            forces: self.forces.load(Ordering::Relaxed),
            rollovers: self.rollovers.load(Ordering::Relaxed),
            files_deleted: self.files_deleted.load(Ordering::Relaxed),

            commits,
            avg_commit_wait_micros: if commits > 0 {
                commit_wait as f64 / commits as f64 / 1000.0
            } else {
                0.0
            },
            flush_cycles,
            avg_flush_io_micros: if flush_cycles > 0 {
                flush_io as f64 / flush_cycles as f64 / 1000.0
            } else {
                0.0
            },

            io_errors: self.io_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        let snapshot = JournalMetrics::new().snapshot();
        assert_eq!(snapshot.pages_written, 0);
        assert_eq!(snapshot.avg_commit_wait_micros, 0.0);
    }

    #[test]
    fn test_page_and_byte_counts() {
        let metrics = JournalMetrics::new();
        metrics.page_written(1000);
        metrics.page_written(500);
        metrics.transaction_written(100);
        metrics.pages_copied(2);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.pages_written, 2);
        assert_eq!(snapshot.transaction_records, 1);
        assert_eq!(snapshot.bytes_written, 1600);
        assert_eq!(snapshot.pages_copied, 2);
    }

    #[test]
    fn test_average_waits() {
        let metrics = JournalMetrics::new();
        metrics.commit_waited(Duration::from_micros(10));
        metrics.commit_waited(Duration::from_micros(30));
        metrics.flush_cycle(Duration::from_micros(8));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commits, 2);
        assert_eq!(snapshot.avg_commit_wait_micros, 20.0);
        assert_eq!(snapshot.avg_flush_io_micros, 8.0);
        assert!(serde_json::to_string(&snapshot).unwrap().contains("\"rollovers\":0"));
    }
}
