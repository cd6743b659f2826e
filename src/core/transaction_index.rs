use crate::core::constants::{ABORTED, UNCOMMITTED};
use crate::core::errors::*;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Version handles carry the start timestamp in the high bits and a step
/// counter in the low byte.
#[inline]
pub fn ts_to_vh(ts: u64) -> u64 {
    ts << 8
}

#[inline]
pub fn vh_to_ts(vh: u64) -> u64 {
    vh >> 8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitStatus {
    Uncommitted,
    Aborted,
    Committed(u64),
}

/// Status of one transaction as seen by pruning and rollback.
#[derive(Debug)]
pub struct TransactionStatus {
    start_ts: u64,
    tc: AtomicU64,
    mvv_count: AtomicI64,
    notified: AtomicBool,
}

impl TransactionStatus {
    pub fn new(start_ts: u64) -> Self {
        Self {
            start_ts,
            tc: AtomicU64::new(UNCOMMITTED),
            mvv_count: AtomicI64::new(0),
            notified: AtomicBool::new(false),
        }
    }

    pub fn start_ts(&self) -> u64 {
        self.start_ts
    }

    /// Commit timestamp; `UNCOMMITTED` while running, `ABORTED` after rollback.
    pub fn tc(&self) -> u64 {
        self.tc.load(Ordering::Acquire)
    }

    pub fn is_aborted(&self) -> bool {
        self.tc() == ABORTED
    }

    pub fn is_committed(&self) -> bool {
        let tc = self.tc();
        tc != UNCOMMITTED && tc != ABORTED
    }

    pub fn mvv_count(&self) -> i64 {
        self.mvv_count.load(Ordering::Acquire)
    }

    pub fn increment_mvv_count(&self) {
        self.mvv_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement_mvv_count(&self) {
        self.mvv_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    pub fn set_notified(&self) {
        self.notified.store(true, Ordering::Release);
    }
}

/// Source of the timestamps stamped on pages, transaction records and
/// checkpoints. Values only grow.
#[derive(Debug, Default)]
pub struct TimestampAllocator {
    timestamp: AtomicU64,
}

impl TimestampAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(timestamp: u64) -> Self {
        Self {
            timestamp: AtomicU64::new(timestamp),
        }
    }

    /// Allocates and returns the next timestamp.
    pub fn update_timestamp(&self) -> u64 {
        self.timestamp.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    /// Raises the counter to at least `timestamp`, as after recovery.
    pub fn bump_to(&self, timestamp: u64) {
        self.timestamp.fetch_max(timestamp, Ordering::AcqRel);
    }
}

/// Oracle answering visibility questions about version handles.
pub trait TransactionIndex: Send + Sync {
    fn status(&self, start_ts: u64) -> Option<Arc<TransactionStatus>>;

    fn commit_status(&self, version_handle: u64) -> CommitStatus;

    /// Smallest start timestamp of any running transaction, `u64::MAX` when
    /// nothing is running. Versions committed before it are visible to every
    /// active snapshot.
    fn active_floor(&self) -> u64;
}

/// In-process transaction table.
#[derive(Default)]
pub struct MemoryTransactionIndex {
    statuses: RwLock<BTreeMap<u64, Arc<TransactionStatus>>>,
}

impl MemoryTransactionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, start_ts: u64) -> Result<Arc<TransactionStatus>> {
        let mut statuses = self.statuses.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "transaction_index.statuses".to_string() })?;
        let status = statuses
            .entry(start_ts)
            .or_insert_with(|| Arc::new(TransactionStatus::new(start_ts)))
            .clone();
        Ok(status)
    }

    pub fn commit(&self, start_ts: u64, commit_ts: u64) -> Result<()> {
        if commit_ts == UNCOMMITTED || commit_ts == ABORTED || commit_ts < start_ts {
            return Err(Error::IllegalArgument(format!(
                "invalid commit timestamp {} for transaction {}",
                commit_ts, start_ts
            )));
        }
        let status = self.status(start_ts).ok_or_else(|| {
            Error::IllegalState(format!("no transaction started at {}", start_ts))
        })?;
        status.tc.store(commit_ts, Ordering::Release);
        Ok(())
    }

    pub fn abort(&self, start_ts: u64) -> Result<()> {
        let status = self.status(start_ts).ok_or_else(|| {
            Error::IllegalState(format!("no transaction started at {}", start_ts))
        })?;
        status.tc.store(ABORTED, Ordering::Release);
        Ok(())
    }

    /// Restores a status from a journal snapshot.
    pub fn restore(&self, start_ts: u64, commit_ts: u64) -> Result<Arc<TransactionStatus>> {
        let status = self.begin(start_ts)?;
        status.tc.store(commit_ts, Ordering::Release);
        Ok(status)
    }

    pub fn remove(&self, start_ts: u64) -> Result<()> {
        let mut statuses = self.statuses.write()
            .map_err(|_| Error::LockPoisoned { lock_name: "transaction_index.statuses".to_string() })?;
        statuses.remove(&start_ts);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.statuses.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TransactionIndex for MemoryTransactionIndex {
    fn status(&self, start_ts: u64) -> Option<Arc<TransactionStatus>> {
        let statuses = self.statuses.read().ok()?;
        statuses.get(&start_ts).cloned()
    }

    fn commit_status(&self, version_handle: u64) -> CommitStatus {
        // Primordial versions predate every transaction
        if version_handle == 0 {
            return CommitStatus::Committed(0);
        }
        match self.status(vh_to_ts(version_handle)) {
            // Forgotten transactions were fully checkpointed, which requires a commit
            None => CommitStatus::Committed(vh_to_ts(version_handle)),
            Some(status) => match status.tc() {
                UNCOMMITTED => CommitStatus::Uncommitted,
                ABORTED => CommitStatus::Aborted,
                tc => CommitStatus::Committed(tc),
            },
        }
    }

    fn active_floor(&self) -> u64 {
        let statuses = match self.statuses.read() {
            Ok(s) => s,
            Err(_) => return 0,
        };
        statuses
            .values()
            .filter(|s| s.tc() == UNCOMMITTED)
            .map(|s| s.start_ts())
            .min()
            .unwrap_or(u64::MAX)
    }
}
