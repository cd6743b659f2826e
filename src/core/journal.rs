//! Journal writer and reader.
//!
//! Records are appended to a single in-memory write buffer and flushed to
//! numbered journal files of `block_size` bytes each. A journal address is a
//! byte offset into that sequence of files: the generation is
//! `address / block_size`, the file offset `address % block_size`. Every new
//! file starts with a JH record followed by a snapshot of the handle maps, the
//! page map, the live transaction map and the last valid checkpoint, so the
//! newest file is always enough to rebuild the manager's state.

use crate::core::alert::{AlertMonitor, Event, AlertLevel, JOURNAL_CATEGORY};
use crate::core::buffer::{Buffer, PruneContext};
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::exchange::ExchangeProvider;
use crate::core::flusher::{FlushClock, JournalFlusher};
use crate::core::copier::JournalCopier;
use crate::core::journal_record::*;
use crate::core::metrics::JournalMetrics;
use crate::core::page_node::*;
use crate::core::player::{
    PlayerStats, ProactiveRollbackListener, PruneCommittedListener, TransactionPlayer, TransactionPlayerListener,
    TransactionPlayerSupport,
};
use crate::core::recovery::{journal_file_path, recover, RecoveryReport};
use crate::core::task::PollableTask;
use crate::core::transaction_index::{TimestampAllocator, TransactionIndex};
use crate::core::volume::{Volume, VolumeSpecification};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalOptions {
    /// Size of each journal file. Ignored when an existing journal is
    /// recovered; its JH record decides.
    pub block_size: u64,
    pub write_buffer_size: usize,
    pub flush_interval_ms: u64,
    pub copier_interval_ms: u64,
    pub copies_per_cycle: usize,
    pub urgent_file_count_threshold: usize,
    pub append_only: bool,
    pub ignore_missing_volumes: bool,
    pub copy_fast: bool,
    pub rollback_pruning: bool,
    pub write_page_pruning: bool,
    pub slow_io_alert_threshold_ms: u64,
}

impl Default for JournalOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            copier_interval_ms: DEFAULT_COPIER_INTERVAL_MS,
            copies_per_cycle: DEFAULT_COPIES_PER_CYCLE,
            urgent_file_count_threshold: DEFAULT_URGENT_FILE_COUNT_THRESHOLD,
            append_only: false,
            ignore_missing_volumes: false,
            copy_fast: false,
            rollback_pruning: true,
            write_page_pruning: true,
            slow_io_alert_threshold_ms: DEFAULT_SLOW_IO_ALERT_THRESHOLD_MS,
        }
    }
}

impl JournalOptions {
    pub fn validate(&self) -> Result<()> {
        if !(MINIMUM_BLOCK_SIZE..=MAXIMUM_BLOCK_SIZE).contains(&self.block_size) {
            return Err(Error::InvalidConfig {
                field: "block_size".to_string(),
                reason: format!(
                    "{} is outside {}..={}",
                    self.block_size, MINIMUM_BLOCK_SIZE, MAXIMUM_BLOCK_SIZE
                ),
            });
        }
        if self.write_buffer_size < MINIMUM_WRITE_BUFFER_SIZE || self.write_buffer_size as u64 > self.block_size {
            return Err(Error::InvalidConfig {
                field: "write_buffer_size".to_string(),
                reason: format!(
                    "{} must be at least {} and no larger than the block size",
                    self.write_buffer_size, MINIMUM_WRITE_BUFFER_SIZE
                ),
            });
        }
        if self.copies_per_cycle == 0 {
            return Err(Error::InvalidConfig {
                field: "copies_per_cycle".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::InvalidConfig {
                field: "flush_interval_ms".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// Handles assigned to volumes and trees for the life of the journal.
#[derive(Debug, Default)]
pub(crate) struct HandleTable {
    counter: u32,
    volume_handles: HashMap<String, u32>,
    pub(crate) volumes: BTreeMap<u32, VolumeSpecification>,
    tree_handles: HashMap<TreeDescriptor, u32>,
    pub(crate) trees: BTreeMap<u32, TreeDescriptor>,
}

impl HandleTable {
    fn restore(
        counter: u32,
        volumes: BTreeMap<u32, VolumeSpecification>,
        trees: BTreeMap<u32, TreeDescriptor>,
    ) -> Self {
        Self {
            counter,
            volume_handles: volumes.iter().map(|(h, s)| (s.name.clone(), *h)).collect(),
            volumes,
            tree_handles: trees.iter().map(|(h, t)| (t.clone(), *h)).collect(),
            trees,
        }
    }

    fn next_handle(&mut self) -> u32 {
        self.counter += 1;
        self.counter
    }

    fn volume_handle(&self, name: &str) -> Option<u32> {
        self.volume_handles.get(name).copied()
    }

    fn tree_handle(&self, tree: &TreeDescriptor) -> Option<u32> {
        self.tree_handles.get(tree).copied()
    }

    fn add_volume(&mut self, handle: u32, specification: VolumeSpecification) {
        self.volume_handles.insert(specification.name.clone(), handle);
        self.volumes.insert(handle, specification);
    }

    fn add_tree(&mut self, handle: u32, tree: TreeDescriptor) {
        self.tree_handles.insert(tree.clone(), handle);
        self.trees.insert(handle, tree);
    }
}

/// Journal state guarded by the journal lock.
pub(crate) struct JournalInner {
    pub(crate) block_size: u64,
    write_buffer: Vec<u8>,
    write_buffer_capacity: usize,
    /// Journal address of the first byte in `write_buffer`. Everything before
    /// it has been written to a file.
    write_buffer_address: JournalAddress,
    pub(crate) files: HashMap<u64, File>,
    pub(crate) base_address: JournalAddress,
    /// Base address recorded in the JH record of the current file.
    pub(crate) file_base_address: JournalAddress,
    journal_created: u64,

    pub(crate) page_map: BTreeMap<PageKey, PageChain>,
    pub(crate) branch_map: BTreeMap<PageKey, PageChain>,
    /// Every page version written, in journal order. Entries whose version
    /// has left its chain are dropped by the copier.
    pub(crate) page_list: Vec<PageNode>,
    pub(crate) live_transactions: BTreeMap<u64, TransactionMapItem>,
    pub(crate) handles: HandleTable,

    pub(crate) last_valid_checkpoint: Checkpoint,
    pub(crate) last_valid_checkpoint_address: JournalAddress,
    pub(crate) last_valid_checkpoint_base_address: JournalAddress,
    proposed_checkpoint_timestamp: u64,
    earliest_committed_timestamp: u64,
    earliest_aborted_timestamp: u64,
    pub(crate) delete_boundary_address: JournalAddress,
    pub(crate) copier_timestamp_limit: u64,
    pub(crate) last_reported_level: AlertLevel,
}

impl JournalInner {
    pub(crate) fn current_address(&self) -> JournalAddress {
        self.write_buffer_address + self.write_buffer.len() as u64
    }

    /// Bytes written to the current journal file.
    pub(crate) fn current_journal_size(&self) -> u64 {
        self.current_address() % self.block_size
    }

    pub(crate) fn journal_file_count(&self) -> u64 {
        self.current_address() / self.block_size - self.base_address / self.block_size + 1
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn file_for<'a>(path: &Path, files: &'a mut HashMap<u64, File>, generation: u64, create: bool) -> Result<&'a mut File> {
    match files.entry(generation) {
        Entry::Occupied(entry) => Ok(entry.into_mut()),
        Entry::Vacant(entry) => {
            let file_path = journal_file_path(path, generation);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(&file_path)
                .map_err(|e| Error::Io(format!("{}: {}", file_path.display(), e)))?;
            if create {
                file.try_lock_exclusive().map_err(|e| {
                    Error::Io(format!("journal file {} is locked: {}", file_path.display(), e))
                })?;
            }
            Ok(entry.insert(file))
        }
    }
}

/// Appends pages and transactions to the journal, tracks where the newest
/// version of every page lives, and copies page images back to their volumes.
pub struct JournalManager {
    path: PathBuf,
    pub(crate) options: JournalOptions,
    inner: Mutex<JournalInner>,
    pub(crate) index: Arc<dyn TransactionIndex>,
    pub(crate) timestamps: Arc<TimestampAllocator>,
    volumes: RwLock<HashMap<String, Arc<dyn Volume>>>,
    exchange_provider: RwLock<Option<Arc<dyn ExchangeProvider>>>,

    player: TransactionPlayer,
    player_lock: Mutex<()>,
    pub(crate) copy_lock: Mutex<()>,

    pub(crate) metrics: JournalMetrics,
    pub(crate) alerts: AlertMonitor,
    pub(crate) flush_clock: FlushClock,

    pub(crate) append_only: AtomicBool,
    pub(crate) copy_fast: AtomicBool,
    pub(crate) ignore_missing_volumes: AtomicBool,
    rollback_pruning: AtomicBool,
    pub(crate) closed: AtomicBool,
    pub(crate) copying: AtomicBool,
    pub(crate) throttle_sleep_millis: AtomicU64,
    pub(crate) last_cycle_pages_written: AtomicU64,

    copier_task: Mutex<Option<PollableTask>>,
    flusher_task: Mutex<Option<PollableTask>>,
    recovery_report: RecoveryReport,
}

impl JournalManager {
    /// Opens the journal whose files are named `<path>.<generation>`,
    /// recovering any existing state, and starts a new journal file.
    ///
    /// Background tasks are not started; see [`JournalManager::start_background`].
    pub fn open(
        path: impl AsRef<Path>,
        options: JournalOptions,
        index: Arc<dyn TransactionIndex>,
        timestamps: Arc<TimestampAllocator>,
        volumes: Vec<Arc<dyn Volume>>,
    ) -> Result<Arc<Self>> {
        options.validate()?;
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let recovered = recover(&path, options.block_size)?;
        timestamps.bump_to(recovered.max_timestamp);
        let counter = recovered.max_handle();
        let block_size = recovered.block_size;
        let mut page_list: Vec<PageNode> = recovered
            .page_map
            .values()
            .flat_map(|chain| chain.versions().iter().copied())
            .collect();
        page_list.sort_by_key(|n| n.journal_address);

        let inner = JournalInner {
            block_size,
            write_buffer: Vec::with_capacity(options.write_buffer_size),
            write_buffer_capacity: options.write_buffer_size,
            write_buffer_address: recovered.next_address,
            files: HashMap::new(),
            base_address: recovered.base_address,
            file_base_address: recovered.base_address,
            journal_created: if recovered.journal_created == 0 {
                now_millis()
            } else {
                recovered.journal_created
            },
            page_map: recovered.page_map,
            branch_map: recovered.branch_map,
            page_list,
            live_transactions: recovered.live_transactions,
            handles: HandleTable::restore(counter, recovered.volumes, recovered.trees),
            last_valid_checkpoint: recovered.last_valid_checkpoint,
            last_valid_checkpoint_address: recovered.last_valid_checkpoint_address,
            last_valid_checkpoint_base_address: recovered.last_valid_checkpoint_base_address,
            proposed_checkpoint_timestamp: recovered.last_valid_checkpoint.timestamp,
            earliest_committed_timestamp: u64::MAX,
            earliest_aborted_timestamp: u64::MAX,
            delete_boundary_address: recovered.first_generation * block_size,
            copier_timestamp_limit: u64::MAX,
            last_reported_level: AlertLevel::Normal,
        };

        let journal = Arc::new(Self {
            append_only: AtomicBool::new(options.append_only),
            copy_fast: AtomicBool::new(options.copy_fast),
            ignore_missing_volumes: AtomicBool::new(options.ignore_missing_volumes),
            rollback_pruning: AtomicBool::new(options.rollback_pruning),
            path,
            options,
            inner: Mutex::new(inner),
            index,
            timestamps,
            volumes: RwLock::new(HashMap::new()),
            exchange_provider: RwLock::new(None),
            player: TransactionPlayer::new(),
            player_lock: Mutex::new(()),
            copy_lock: Mutex::new(()),
            metrics: JournalMetrics::new(),
            alerts: AlertMonitor::new(),
            flush_clock: FlushClock::new(),
            closed: AtomicBool::new(false),
            copying: AtomicBool::new(false),
            throttle_sleep_millis: AtomicU64::new(0),
            last_cycle_pages_written: AtomicU64::new(0),
            copier_task: Mutex::new(None),
            flusher_task: Mutex::new(None),
            recovery_report: recovered.report,
        });
        for volume in volumes {
            journal.add_volume(volume);
        }
        {
            let mut guard = journal.lock_inner();
            let inner = &mut *guard;
            journal.start_journal_file(inner)?;
            journal.force_locked(inner)?;
        }
        tracing::info!(
            path = %journal.path.display(),
            block_size,
            current = journal.current_address(),
            "journal opened"
        );
        Ok(journal)
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, JournalInner> {
        self.inner.lock().recover_poison()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &JournalOptions {
        &self.options
    }

    /// Starts the flusher and copier threads.
    pub fn start_background(self: &Arc<Self>) -> Result<()> {
        let mut flusher = self.flusher_task.lock().recover_poison();
        if flusher.is_none() {
            *flusher = Some(PollableTask::start(
                "JOURNAL_FLUSHER",
                Duration::from_millis(self.options.flush_interval_ms),
                Arc::new(JournalFlusher::new(Arc::downgrade(self))),
            )?);
        }
        let mut copier = self.copier_task.lock().recover_poison();
        if copier.is_none() {
            *copier = Some(PollableTask::start(
                "JOURNAL_COPIER",
                Duration::from_millis(self.options.copier_interval_ms),
                Arc::new(JournalCopier::new(Arc::downgrade(self))),
            )?);
        }
        Ok(())
    }

    pub(crate) fn flusher_running(&self) -> bool {
        self.flusher_task.lock().recover_poison().is_some()
    }

    pub(crate) fn kick_flusher(&self) {
        if let Some(task) = self.flusher_task.lock().recover_poison().as_ref() {
            task.kick();
        }
    }

    pub fn kick_copier(&self) {
        if let Some(task) = self.copier_task.lock().recover_poison().as_ref() {
            task.kick();
        }
    }

    fn stop_tasks(&self) {
        let copier = self.copier_task.lock().recover_poison().take();
        if let Some(task) = copier {
            task.stop();
        }
        let flusher = self.flusher_task.lock().recover_poison().take();
        if let Some(task) = flusher {
            task.stop();
        }
    }

    // Low-level writing

    /// Makes room for a record of `size` bytes, starting a new journal file
    /// or rolling over to one when needed. Returns true if a new file was
    /// started.
    fn prepare_write_buffer(&self, inner: &mut JournalInner, size: usize) -> Result<bool> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::JournalClosed);
        }
        let mut new_file = false;
        if inner.current_journal_size() == 0 {
            self.start_journal_file(inner)?;
            new_file = true;
        }
        let remaining = inner.block_size - inner.current_journal_size();
        if remaining <= (size + JE_OVERHEAD) as u64 {
            self.rollover_locked(inner, false, true)?;
            new_file = true;
        }
        if inner.write_buffer.len() + size > inner.write_buffer_capacity {
            self.flush_locked(inner)?;
        }
        Ok(new_file)
    }

    /// Copies `record` into the write buffer. The caller has made room.
    fn put(&self, inner: &mut JournalInner, record: &[u8]) -> Result<JournalAddress> {
        if inner.write_buffer.len() + record.len() > inner.write_buffer_capacity {
            self.flush_locked(inner)?;
        }
        let address = inner.current_address();
        inner.write_buffer.extend_from_slice(record);
        Ok(address)
    }

    fn append(&self, inner: &mut JournalInner, record: &[u8]) -> Result<JournalAddress> {
        self.prepare_write_buffer(inner, record.len())?;
        self.put(inner, record)
    }

    /// Writes the JH record and the state snapshot that open every file.
    fn start_journal_file(&self, inner: &mut JournalInner) -> Result<()> {
        let address = inner.current_address();
        let timestamp = self.timestamps.current();
        let mut record = Vec::new();
        JournalHeader {
            timestamp,
            version: JOURNAL_VERSION,
            block_size: inner.block_size,
            base_address: inner.base_address,
            current_address: address,
            created: inner.journal_created,
            path: self.path.display().to_string(),
        }
        .encode(&mut record);
        self.put(inner, &record)?;
        inner.file_base_address = inner.base_address;

        let volumes: Vec<(u32, VolumeSpecification)> =
            inner.handles.volumes.iter().map(|(h, s)| (*h, s.clone())).collect();
        for (handle, specification) in volumes {
            record.clear();
            IdentifyVolume { timestamp, handle, specification }.encode(&mut record)?;
            self.put(inner, &record)?;
        }
        let trees: Vec<(u32, TreeDescriptor)> = inner.handles.trees.iter().map(|(h, t)| (*h, t.clone())).collect();
        for (handle, tree) in trees {
            record.clear();
            IdentifyTree {
                timestamp,
                handle,
                volume_handle: tree.volume_handle,
                tree_name: tree.tree_name,
            }
            .encode(&mut record);
            self.put(inner, &record)?;
        }

        let pages = self.write_page_map(inner, timestamp)?;
        let transactions = self.write_transaction_map(inner, timestamp)?;

        if inner.last_valid_checkpoint.timestamp > 0 {
            record.clear();
            CheckpointRecord {
                timestamp: inner.last_valid_checkpoint.timestamp,
                system_time_millis: inner.last_valid_checkpoint.system_time_millis,
                base_address: inner.base_address,
            }
            .encode(&mut record);
            let checkpoint_address = self.put(inner, &record)?;
            inner.last_valid_checkpoint_address = checkpoint_address;
            inner.last_valid_checkpoint_base_address = inner.base_address;
        }
        self.metrics.record_written((inner.current_address() - address) as usize);
        tracing::debug!(
            generation = address / inner.block_size,
            base = inner.base_address,
            pages,
            transactions,
            "journal file started"
        );
        Ok(())
    }

    /// Writes every valid page version as PM records, each filling at most a
    /// quarter of the write buffer. Returns the number of versions written.
    fn write_page_map(&self, inner: &mut JournalInner, timestamp: u64) -> Result<usize> {
        let per_record = (inner.write_buffer_capacity / 4 / PM_ENTRY_SIZE).max(1);
        let nodes: Vec<PageNode> = inner
            .page_map
            .values()
            .chain(inner.branch_map.values())
            .flat_map(|chain| chain.versions().iter().copied())
            .filter(|node| !node.is_invalid())
            .collect();
        let mut record = Vec::new();
        for chunk in nodes.chunks(per_record) {
            record.clear();
            encode_page_map(&mut record, timestamp, chunk);
            self.put(inner, &record)?;
        }
        Ok(nodes.len())
    }

    fn write_transaction_map(&self, inner: &mut JournalInner, timestamp: u64) -> Result<usize> {
        let per_record = (inner.write_buffer_capacity / 4 / TM_ENTRY_SIZE).max(1);
        let items: Vec<TransactionMapItem> = inner.live_transactions.values().copied().collect();
        let mut record = Vec::new();
        for chunk in items.chunks(per_record) {
            record.clear();
            encode_transaction_map(&mut record, timestamp, chunk);
            self.put(inner, &record)?;
        }
        Ok(items.len())
    }

    /// Ends the current file with a JE record and moves the current address
    /// to the start of the next generation. With `new_base` the base address
    /// moves there too.
    pub(crate) fn rollover_locked(&self, inner: &mut JournalInner, new_base: bool, new_file: bool) -> Result<()> {
        if inner.current_journal_size() > 0 {
            let current = inner.current_address();
            let mut record = Vec::with_capacity(JE_OVERHEAD);
            JournalEnd {
                timestamp: self.timestamps.current(),
                current_address: current,
                base_address: inner.base_address,
                created: inner.journal_created,
            }
            .encode(&mut record);
            self.put(inner, &record)?;
            self.metrics.record_written(record.len());
            self.flush_locked(inner)?;
            let generation = current / inner.block_size;
            if let Some(file) = inner.files.remove(&generation) {
                file.sync_all()?;
            }
            inner.write_buffer_address = (generation + 1) * inner.block_size;
            self.metrics.rolled_over();
            tracing::debug!(generation, "journal rolled over");
        }
        if new_base {
            inner.base_address = inner.current_address();
        }
        if new_file {
            self.start_journal_file(inner)?;
        }
        Ok(())
    }

    fn flush_locked(&self, inner: &mut JournalInner) -> Result<()> {
        if inner.write_buffer.is_empty() {
            return Ok(());
        }
        let address = inner.write_buffer_address;
        let generation = address / inner.block_size;
        let file = file_for(&self.path, &mut inner.files, generation, true)?;
        file.seek(SeekFrom::Start(address % inner.block_size))?;
        file.write_all(&inner.write_buffer)?;
        inner.write_buffer_address += inner.write_buffer.len() as u64;
        inner.write_buffer.clear();
        self.metrics.flushed();
        Ok(())
    }

    pub(crate) fn force_locked(&self, inner: &mut JournalInner) -> Result<()> {
        self.flush_locked(inner)?;
        let generation = inner.write_buffer_address / inner.block_size;
        if let Some(file) = inner.files.get_mut(&generation) {
            file.sync_data()?;
        }
        self.metrics.forced();
        Ok(())
    }

    /// Writes buffered records to the current file.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.lock_inner();
        self.flush_locked(&mut guard)
    }

    /// Writes buffered records and syncs the current file.
    pub fn force(&self) -> Result<()> {
        let mut guard = self.lock_inner();
        self.force_locked(&mut guard)
    }

    /// Reads `size` bytes at `address`, from the write buffer if they have
    /// not been written out yet.
    pub(crate) fn read_fully(&self, inner: &mut JournalInner, address: JournalAddress, size: usize) -> Result<Vec<u8>> {
        let end = address + size as u64;
        if end > inner.current_address() {
            return Err(Error::corrupt_journal(
                address,
                format!("read of {} bytes beyond end of journal {}", size, inner.current_address()),
            ));
        }
        if address >= inner.write_buffer_address {
            let start = (address - inner.write_buffer_address) as usize;
            return Ok(inner.write_buffer[start..start + size].to_vec());
        }
        let generation = address / inner.block_size;
        let file = file_for(&self.path, &mut inner.files, generation, false)?;
        file.seek(SeekFrom::Start(address % inner.block_size))?;
        let mut bytes = vec![0u8; size];
        file.read_exact(&mut bytes).map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                Error::corrupt_journal(address, format!("journal file ends inside a record of {} bytes", size))
            } else {
                Error::from(e)
            }
        })?;
        Ok(bytes)
    }

    // Handles

    pub fn add_volume(&self, volume: Arc<dyn Volume>) {
        let name = volume.name().to_string();
        self.volumes.write().recover_poison().insert(name, volume);
    }

    /// Detaches a volume. Its handle stays assigned; pages journaled for it
    /// can no longer be copied.
    pub fn remove_volume(&self, name: &str) -> Option<Arc<dyn Volume>> {
        self.volumes.write().recover_poison().remove(name)
    }

    /// Handle of `volume`, assigning one and writing an IV record on first
    /// use.
    pub fn handle_for_volume(&self, volume: &Arc<dyn Volume>) -> Result<u32> {
        if !self.volumes.read().recover_poison().contains_key(volume.name()) {
            self.add_volume(volume.clone());
        }
        let mut guard = self.lock_inner();
        self.handle_for_volume_locked(&mut guard, volume.specification())
    }

    fn handle_for_volume_locked(&self, inner: &mut JournalInner, specification: &VolumeSpecification) -> Result<u32> {
        if let Some(handle) = inner.handles.volume_handle(&specification.name) {
            return Ok(handle);
        }
        let mut record = Vec::new();
        let handle = inner.handles.counter + 1;
        IdentifyVolume {
            timestamp: self.timestamps.current(),
            handle,
            specification: specification.clone(),
        }
        .encode(&mut record)?;
        self.prepare_write_buffer(inner, record.len())?;
        let handle = inner.handles.next_handle();
        inner.handles.add_volume(handle, specification.clone());
        self.put(inner, &record)?;
        self.metrics.record_written(record.len());
        tracing::debug!(volume = %specification.name, handle, "volume handle assigned");
        Ok(handle)
    }

    /// Handle of the tree `tree_name` in `volume`, assigning one and writing
    /// an IT record on first use.
    pub fn handle_for_tree(&self, volume: &Arc<dyn Volume>, tree_name: &str) -> Result<u32> {
        if !self.volumes.read().recover_poison().contains_key(volume.name()) {
            self.add_volume(volume.clone());
        }
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let volume_handle = self.handle_for_volume_locked(inner, volume.specification())?;
        let tree = TreeDescriptor::new(volume_handle, tree_name);
        if let Some(handle) = inner.handles.tree_handle(&tree) {
            return Ok(handle);
        }
        let mut record = Vec::new();
        IdentifyTree {
            timestamp: self.timestamps.current(),
            handle: inner.handles.counter + 1,
            volume_handle,
            tree_name: tree_name.to_string(),
        }
        .encode(&mut record);
        self.prepare_write_buffer(inner, record.len())?;
        let handle = inner.handles.next_handle();
        inner.handles.add_tree(handle, tree);
        self.put(inner, &record)?;
        self.metrics.record_written(record.len());
        Ok(handle)
    }

    /// The volume registered under `handle`. Fails with
    /// [`Error::VolumeNotFound`] for an unknown handle and with
    /// [`Error::MissingVolume`] when the volume is known but not attached.
    pub fn volume_for_handle(&self, handle: u32) -> Result<Arc<dyn Volume>> {
        let name = self
            .lock_inner()
            .handles
            .volumes
            .get(&handle)
            .map(|s| s.name.clone())
            .ok_or(Error::VolumeNotFound { handle })?;
        self.volumes
            .read()
            .recover_poison()
            .get(&name)
            .cloned()
            .ok_or(Error::MissingVolume { name })
    }

    pub fn tree_for_handle(&self, handle: u32) -> Option<TreeDescriptor> {
        self.lock_inner().handles.trees.get(&handle).cloned()
    }

    pub fn set_exchange_provider(&self, provider: Arc<dyn ExchangeProvider>) {
        *self.exchange_provider.write().recover_poison() = Some(provider);
    }

    pub fn exchange_provider(&self) -> Option<Arc<dyn ExchangeProvider>> {
        self.exchange_provider.read().recover_poison().clone()
    }

    // Pages

    /// Appends a PA record holding the in-use parts of `buffer` and makes it
    /// the newest version of the page.
    pub fn write_page_to_journal(&self, buffer: &mut Buffer) -> Result<JournalAddress> {
        let volume = buffer
            .volume()
            .cloned()
            .ok_or_else(|| Error::IllegalState(format!("page {} is not bound to a volume", buffer.page())))?;
        if self.options.write_page_pruning && buffer.is_data_page() {
            let mut context = PruneContext::new(&*self.index, buffer.timestamp());
            if let Err(e) = buffer.prune_mvv_values(&mut context) {
                tracing::warn!(page = buffer.page(), error = %e, "pruning before journal write failed");
            }
        }
        buffer.prepare_write()?;
        if !self.volumes.read().recover_poison().contains_key(volume.name()) {
            self.add_volume(volume.clone());
        }

        let timestamp = buffer.timestamp();
        let page = buffer.page();
        let (left_size, right_size) = buffer.journal_extents();
        let mut record = Vec::with_capacity(PA_OVERHEAD + left_size + right_size);

        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        let volume_handle = self.handle_for_volume_locked(inner, volume.specification())?;
        if timestamp < inner.last_valid_checkpoint.timestamp {
            tracing::warn!(
                page,
                timestamp,
                checkpoint = inner.last_valid_checkpoint.timestamp,
                "late write of page older than last checkpoint"
            );
        }
        encode_page_image(&mut record, timestamp, volume_handle, page, buffer.bytes(), left_size, right_size);
        let address = self.append(inner, &record)?;

        let node = PageNode::new(volume_handle, page, address, timestamp);
        let proposed = inner.proposed_checkpoint_timestamp;
        match inner.page_map.get_mut(&node.key()) {
            Some(chain) => match chain.current().copied() {
                Some(old) if timestamp < old.timestamp => {
                    chain.merge(node);
                }
                Some(old) if old.timestamp > proposed && timestamp > proposed => chain.push(node, true),
                _ => chain.push(node, false),
            },
            None => {
                inner.page_map.insert(node.key(), PageChain::new(node));
            }
        }
        inner.page_list.push(node);
        drop(guard);

        buffer.clear_dirty();
        self.metrics.page_written(record.len());
        Ok(address)
    }

    /// Reads the PA record of `node` and rebuilds the full page image.
    pub(crate) fn read_page_image(&self, inner: &mut JournalInner, node: &PageNode) -> Result<Vec<u8>> {
        let address = node.journal_address;
        let prefix = self.read_fully(inner, address, PA_OVERHEAD)?;
        let header = PageImageHeader::decode(&prefix).map_err(|e| at_address(e, address))?;
        if header.length < PA_OVERHEAD
            || header.page_address != node.page_address
            || header.volume_handle != node.volume_handle
            || header.left_size > header.payload_size()
            || header.payload_size() > header.buffer_size
        {
            return Err(Error::corrupt_journal(
                address,
                format!(
                    "PA record for page {} handle {} does not match page {} handle {}",
                    header.page_address, header.volume_handle, node.page_address, node.volume_handle
                ),
            ));
        }
        let record = self.read_fully(inner, address, header.length)?;
        let left = header.left_size;
        let right = header.right_size();
        let mut image = vec![0u8; header.buffer_size];
        image[..left].copy_from_slice(&record[PA_OVERHEAD..PA_OVERHEAD + left]);
        image[header.buffer_size - right..].copy_from_slice(&record[PA_OVERHEAD + left..PA_OVERHEAD + left + right]);
        Ok(image)
    }

    /// Loads the newest journaled version of a page into `buffer`. Returns
    /// false if the journal holds no version of the page.
    pub fn read_page_from_journal(&self, volume_handle: u32, page: PageAddress, buffer: &mut Buffer) -> Result<bool> {
        let image = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let key = PageKey { volume_handle, page_address: page };
            let Some(node) = inner.page_map.get(&key).and_then(|c| c.current()).copied() else {
                return Ok(false);
            };
            if node.is_invalid() {
                return Ok(false);
            }
            let image = self.read_page_image(inner, &node)?;
            if image.len() != buffer.buffer_size() {
                return Err(Error::corrupt_journal(
                    node.journal_address,
                    format!("page image of {} bytes for buffer of {}", image.len(), buffer.buffer_size()),
                ));
            }
            image
        };
        buffer.load_image(page, &image)?;
        self.metrics.page_read();
        Ok(true)
    }

    // Transactions

    /// Appends a TX record and updates the live transaction map. A record
    /// with `backchain_address == 0` starts a transaction; later records
    /// link back to the previous one. Records carrying `ABORTED` are written
    /// but leave the map alone.
    pub fn write_transaction_to_journal(
        &self,
        updates: &[u8],
        start_timestamp: u64,
        commit_timestamp: u64,
        backchain_address: JournalAddress,
    ) -> Result<JournalAddress> {
        if updates.len() > TRANSACTION_BUFFER_SIZE {
            return Err(Error::IllegalArgument(format!(
                "transaction updates of {} bytes exceed {}",
                updates.len(),
                TRANSACTION_BUFFER_SIZE
            )));
        }
        let mut record = Vec::with_capacity(TX_OVERHEAD + updates.len());
        encode_transaction(&mut record, start_timestamp, commit_timestamp, backchain_address, updates);

        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if commit_timestamp != ABORTED {
            match inner.live_transactions.get(&start_timestamp) {
                None if backchain_address != 0 => {
                    return Err(Error::IllegalState(format!(
                        "missing back-chained transaction for start timestamp {}",
                        start_timestamp
                    )));
                }
                Some(item) if backchain_address == 0 => {
                    return Err(Error::IllegalState(format!("duplicate transaction {}", item)));
                }
                Some(item) if item.is_committed() => {
                    return Err(Error::IllegalState(format!("transaction already committed {}", item)));
                }
                _ => {}
            }
        }
        let address = self.append(inner, &record)?;
        if commit_timestamp != ABORTED {
            match inner.live_transactions.get_mut(&start_timestamp) {
                Some(item) => {
                    item.last_record_address = address;
                    item.commit_timestamp = commit_timestamp;
                }
                None => {
                    let mut item = TransactionMapItem::new(start_timestamp, address);
                    item.commit_timestamp = commit_timestamp;
                    inner.live_transactions.insert(start_timestamp, item);
                }
            }
        }
        drop(guard);
        self.metrics.transaction_written(record.len());
        Ok(address)
    }

    // Checkpoints

    /// Allocates the timestamp of the next checkpoint. Page versions written
    /// after it replace, rather than stack on, versions also written after it.
    pub fn propose_checkpoint(&self) -> Checkpoint {
        let checkpoint = Checkpoint::new(self.timestamps.update_timestamp(), now_millis());
        self.lock_inner().proposed_checkpoint_timestamp = checkpoint.timestamp;
        checkpoint
    }

    /// Forces the journal, appends a CP record and forces again. History the
    /// checkpoint makes unnecessary is then pruned from the page maps.
    pub fn write_checkpoint_to_journal(&self, checkpoint: &Checkpoint) -> Result<JournalAddress> {
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if checkpoint.timestamp <= inner.last_valid_checkpoint.timestamp {
            tracing::warn!(
                timestamp = checkpoint.timestamp,
                last = inner.last_valid_checkpoint.timestamp,
                "checkpoint does not advance"
            );
        }
        self.force_locked(inner)?;
        let base_address = inner.base_address;
        let mut record = Vec::with_capacity(CP_OVERHEAD);
        CheckpointRecord {
            timestamp: checkpoint.timestamp,
            system_time_millis: checkpoint.system_time_millis,
            base_address,
        }
        .encode(&mut record);
        let address = self.append(inner, &record)?;
        self.force_locked(inner)?;
        inner.last_valid_checkpoint = *checkpoint;
        inner.last_valid_checkpoint_address = address;
        inner.last_valid_checkpoint_base_address = base_address;
        Self::checkpoint_written(inner, checkpoint);
        drop(guard);
        self.metrics.record_written(record.len());
        self.metrics.checkpoint_written();
        tracing::debug!(timestamp = checkpoint.timestamp, address, "checkpoint written");
        Ok(address)
    }

    /// Drops page versions no recovery can need: in each chain everything
    /// older than the newest version before the recovery timestamp.
    fn checkpoint_written(inner: &mut JournalInner, checkpoint: &Checkpoint) {
        let recovery_timestamp = checkpoint
            .timestamp
            .min(inner.earliest_committed_timestamp)
            .min(inner.earliest_aborted_timestamp);
        for chain in inner.page_map.values_mut() {
            if let Some(at) = chain.versions().iter().position(|n| n.timestamp < recovery_timestamp) {
                chain.remove_history_after(at);
            }
        }
        inner
            .branch_map
            .retain(|_, chain| chain.current().is_some_and(|n| n.timestamp >= recovery_timestamp));
    }

    /// Removes transactions the journal no longer has to replay.
    ///
    /// Transactions committed before the last checkpoint are replayed once
    /// through [`PruneCommittedListener`] and dropped. Aborted transactions
    /// whose versions are gone are dropped; those still holding versions are
    /// rolled back through [`ProactiveRollbackListener`] when
    /// `rollback_pruning` is set.
    pub fn prune_obsolete_transactions(&self, rollback_pruning: bool) -> Result<()> {
        let mut to_prune_committed = Vec::new();
        let mut to_prune = Vec::new();
        {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            let checkpoint = inner.last_valid_checkpoint.timestamp;
            let mut earliest_committed = u64::MAX;
            let mut earliest_aborted = u64::MAX;
            let index = &self.index;
            inner.live_transactions.retain(|_, item| {
                if item.is_committed() {
                    if item.commit_timestamp < checkpoint {
                        to_prune_committed.push(*item);
                    } else {
                        earliest_committed = earliest_committed.min(item.start_timestamp);
                    }
                    return true;
                }
                match index.status(item.start_timestamp) {
                    None => false,
                    Some(status) if status.start_ts() != item.start_timestamp => false,
                    Some(status) if status.is_aborted() && status.is_notified() => {
                        if status.mvv_count() <= 0 {
                            false
                        } else {
                            earliest_aborted = earliest_aborted.min(item.start_timestamp);
                            if rollback_pruning {
                                to_prune.push(*item);
                            }
                            true
                        }
                    }
                    Some(_) => true,
                }
            });
            inner.earliest_committed_timestamp = earliest_committed;
            inner.earliest_aborted_timestamp = earliest_aborted;
        }

        to_prune_committed.sort();
        let mut pruned = Vec::with_capacity(to_prune_committed.len());
        for item in &to_prune_committed {
            let _player = self.player_lock.lock().recover_poison();
            match self.player.apply_transaction(self, item, &mut PruneCommittedListener) {
                Ok(()) => pruned.push(item.start_timestamp),
                Err(e) => tracing::warn!(transaction = %item, error = %e, "pruning committed transaction failed"),
            }
        }
        if !pruned.is_empty() {
            let mut inner = self.lock_inner();
            for start in &pruned {
                inner.live_transactions.remove(start);
            }
            tracing::debug!(count = pruned.len(), "committed transactions pruned");
        }

        to_prune.sort();
        for item in &to_prune {
            let Some(status) = self.index.status(item.start_timestamp) else {
                continue;
            };
            if !(status.is_aborted() && status.is_notified() && status.mvv_count() > 0) {
                continue;
            }
            let _player = self.player_lock.lock().recover_poison();
            let mut listener = ProactiveRollbackListener::new(self.index.clone());
            if let Err(e) = self.player.apply_transaction(self, item, &mut listener) {
                tracing::warn!(transaction = %item, error = %e, "rollback pruning failed");
            }
        }
        Ok(())
    }

    /// Replays recovered transactions: those committed after the last valid
    /// checkpoint through `committed`, unfinished ones through `rollback`
    /// after which they are marked aborted. Returns both counts.
    pub fn apply_recovered(
        &self,
        committed: &mut dyn TransactionPlayerListener,
        rollback: &mut dyn TransactionPlayerListener,
    ) -> Result<(usize, usize)> {
        let (checkpoint, mut items) = {
            let inner = self.lock_inner();
            (
                inner.last_valid_checkpoint.timestamp,
                inner.live_transactions.values().copied().collect::<Vec<_>>(),
            )
        };
        items.sort();
        let _player = self.player_lock.lock().recover_poison();
        let (mut replayed, mut rolled_back) = (0, 0);
        for item in &items {
            if item.is_committed() {
                if item.commit_timestamp > checkpoint {
                    self.player.apply_transaction(self, item, committed)?;
                    replayed += 1;
                }
            } else {
                self.player.apply_transaction(self, item, rollback)?;
                if let Some(live) = self.lock_inner().live_transactions.get_mut(&item.start_timestamp) {
                    live.commit_timestamp = ABORTED;
                }
                rolled_back += 1;
            }
        }
        tracing::info!(replayed, rolled_back, "recovered transactions applied");
        Ok((replayed, rolled_back))
    }

    // Copier control

    /// 0 when the journal is comfortably small, rising to [`URGENT`] as the
    /// file count approaches the configured threshold.
    pub fn urgency(&self) -> u32 {
        if self.copy_fast.load(Ordering::Relaxed) {
            return URGENT;
        }
        let count = self.journal_file_count() as i64;
        let threshold = self.options.urgent_file_count_threshold as i64;
        (URGENT as i64 - (threshold - count)).clamp(0, URGENT as i64) as u32
    }

    pub(crate) fn update_throttle(&self) {
        let millis = if self.append_only.load(Ordering::Relaxed) {
            0
        } else {
            match self.urgency() {
                u if u >= URGENT => URGENT_COMMIT_DELAY_MILLIS,
                u if u > ALMOST_URGENT => GENTLE_COMMIT_DELAY_MILLIS,
                _ => 0,
            }
        };
        self.throttle_sleep_millis.store(millis, Ordering::Relaxed);
    }

    /// Delays the caller when the copier is falling behind.
    pub fn throttle(&self) {
        let millis = self.throttle_sleep_millis.load(Ordering::Relaxed);
        if millis > 0 {
            std::thread::sleep(Duration::from_millis(millis));
        }
    }

    /// Copies every page version older than the last checkpoint back to its
    /// volume.
    pub fn copy_back(&self) -> Result<()> {
        if self.append_only.load(Ordering::Relaxed) {
            return Err(Error::AppendOnly {
                operation: "copy_back".to_string(),
            });
        }
        self.copy_fast.store(true, Ordering::Relaxed);
        let result = loop {
            match self.copier_cycle() {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }
        };
        self.copy_fast.store(false, Ordering::Relaxed);
        result
    }

    pub fn set_append_only(&self, append_only: bool) {
        self.append_only.store(append_only, Ordering::Relaxed);
    }

    pub fn set_copy_fast(&self, copy_fast: bool) {
        self.copy_fast.store(copy_fast, Ordering::Relaxed);
        if copy_fast {
            self.kick_copier();
        }
    }

    pub fn set_ignore_missing_volumes(&self, ignore: bool) {
        self.ignore_missing_volumes.store(ignore, Ordering::Relaxed);
    }

    pub fn set_rollback_pruning(&self, enabled: bool) {
        self.rollback_pruning.store(enabled, Ordering::Relaxed);
    }

    /// Page versions at or after `timestamp` are not copied.
    pub fn set_copier_timestamp_limit(&self, timestamp: u64) {
        self.lock_inner().copier_timestamp_limit = timestamp;
    }

    pub fn is_copying(&self) -> bool {
        self.copying.load(Ordering::Relaxed)
    }

    // Queries

    pub fn query_page_node(&self, volume_handle: u32, page: PageAddress) -> Option<PageNode> {
        let key = PageKey { volume_handle, page_address: page };
        self.lock_inner().page_map.get(&key).and_then(|c| c.current()).copied()
    }

    pub fn query_page_chain(&self, volume_handle: u32, page: PageAddress) -> Vec<PageNode> {
        let key = PageKey { volume_handle, page_address: page };
        self.lock_inner()
            .page_map
            .get(&key)
            .map(|c| c.versions().to_vec())
            .unwrap_or_default()
    }

    pub fn query_transaction_map(&self, start_timestamp: u64) -> Option<TransactionMapItem> {
        self.lock_inner().live_transactions.get(&start_timestamp).copied()
    }

    /// Newest valid version of every page in the page map, in key order.
    pub fn page_map_snapshot(&self) -> Vec<PageNode> {
        self.lock_inner()
            .page_map
            .values()
            .filter_map(|c| c.current().copied())
            .filter(|n| !n.is_invalid())
            .collect()
    }

    /// Newest version of each page recovered after the last checkpoint.
    pub fn branch_map_snapshot(&self) -> Vec<PageNode> {
        self.lock_inner()
            .branch_map
            .values()
            .filter_map(|c| c.current().copied())
            .collect()
    }

    pub fn transaction_map_snapshot(&self) -> Vec<TransactionMapItem> {
        self.lock_inner().live_transactions.values().copied().collect()
    }

    pub fn page_map_size(&self) -> usize {
        self.lock_inner().page_map.len()
    }

    pub fn branch_map_size(&self) -> usize {
        self.lock_inner().branch_map.len()
    }

    pub fn journal_file_count(&self) -> u64 {
        self.lock_inner().journal_file_count()
    }

    pub fn current_address(&self) -> JournalAddress {
        self.lock_inner().current_address()
    }

    pub fn base_address(&self) -> JournalAddress {
        self.lock_inner().base_address
    }

    pub fn block_size(&self) -> u64 {
        self.lock_inner().block_size
    }

    pub fn last_valid_checkpoint(&self) -> Checkpoint {
        self.lock_inner().last_valid_checkpoint
    }

    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery_report
    }

    pub fn metrics(&self) -> &JournalMetrics {
        &self.metrics
    }

    pub fn alerts(&self) -> &AlertMonitor {
        &self.alerts
    }

    pub fn player_stats(&self) -> PlayerStats {
        self.player.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops the background tasks. With `flush` set the current file is
    /// ended with a JE record and synced first; otherwise buffered records
    /// are discarded.
    pub fn close(&self, flush: bool) -> Result<()> {
        self.stop_tasks();
        let mut guard = self.lock_inner();
        let inner = &mut *guard;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = if flush {
            self.rollover_locked(inner, false, false)
        } else {
            Ok(())
        };
        inner.write_buffer.clear();
        inner.files.clear();
        if let Err(e) = &result {
            self.alerts
                .post(Event::new(AlertLevel::Error, format!("journal close failed: {}", e)), JOURNAL_CATEGORY);
        }
        tracing::info!(path = %self.path.display(), flush, "journal closed");
        result
    }
}

impl Drop for JournalManager {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

impl TransactionPlayerSupport for JournalManager {
    fn read_journal(&self, address: JournalAddress, size: usize) -> Result<Vec<u8>> {
        let mut guard = self.lock_inner();
        self.read_fully(&mut guard, address, size)
    }

    fn tree_for_handle(&self, handle: u32) -> Option<TreeDescriptor> {
        JournalManager::tree_for_handle(self, handle)
    }

    fn volume_for_handle(&self, handle: u32) -> Result<Arc<dyn Volume>> {
        JournalManager::volume_for_handle(self, handle)
    }

    fn exchange_provider(&self) -> Option<Arc<dyn ExchangeProvider>> {
        JournalManager::exchange_provider(self)
    }

    fn ignore_missing_volumes(&self) -> bool {
        self.ignore_missing_volumes.load(Ordering::Relaxed)
    }

    fn alert_monitor(&self) -> Option<&AlertMonitor> {
        Some(&self.alerts)
    }
}

impl crate::core::cleanup::CleanupTarget for JournalManager {
    fn tree_for_handle(&self, handle: u32) -> Option<TreeDescriptor> {
        JournalManager::tree_for_handle(self, handle)
    }

    fn exchange_provider(&self) -> Option<Arc<dyn ExchangeProvider>> {
        JournalManager::exchange_provider(self)
    }

    fn prune_obsolete_transactions(&self) -> Result<()> {
        JournalManager::prune_obsolete_transactions(self, self.rollback_pruning.load(Ordering::Relaxed))
    }

    fn alert_monitor(&self) -> Option<&AlertMonitor> {
        Some(&self.alerts)
    }
}
