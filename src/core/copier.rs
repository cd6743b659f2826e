//! Copies journaled page images back to their volumes and reclaims journal
//! files nothing refers to any more.

use crate::core::alert::{AlertLevel, Event, JOURNAL_CATEGORY, MANY_JOURNAL_FILES_CATEGORY, MISSING_VOLUME_CATEGORY};
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::journal::JournalManager;
use crate::core::journal_record::CP_OVERHEAD;
use crate::core::page_node::{PageKey, PageNode};
use crate::core::recovery::journal_file_path;
use crate::core::task::Pollable;
use crate::core::volume::Volume;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

struct CopyItem {
    node: PageNode,
    volume: Option<Arc<dyn Volume>>,
    image: Option<Vec<u8>>,
}

impl JournalManager {
    /// Runs one copy cycle. Returns the number of page versions removed from
    /// the page map.
    pub fn copier_cycle(&self) -> Result<usize> {
        let _copy = self.copy_lock.lock().recover_poison();
        self.copying.store(true, Ordering::Release);
        let result = self.copy_and_clean();
        self.copying.store(false, Ordering::Release);
        self.update_throttle();
        result
    }

    fn copy_and_clean(&self) -> Result<usize> {
        if self.append_only.load(Ordering::Relaxed) {
            self.report_journal_file_count();
            return Ok(0);
        }
        let selected = self.select_for_copy();
        let copied = self
            .read_for_copy(selected)
            .and_then(|items| self.write_for_copy(items));
        let cleanup = match &copied {
            Ok((nodes, _)) => self.cleanup_for_copy(nodes),
            Err(_) => self.cleanup_for_copy(&[]),
        };
        self.report_journal_file_count();
        let (nodes, written) = copied?;
        cleanup?;

        self.last_cycle_pages_written.store(written as u64, Ordering::Relaxed);
        if written == 0 {
            self.copy_fast.store(false, Ordering::Relaxed);
        }
        if !nodes.is_empty() {
            tracing::debug!(removed = nodes.len(), written, "copier cycle");
        }
        Ok(nodes.len())
    }

    /// Picks, per page, the newest version older than both the last valid
    /// checkpoint and the copier timestamp limit.
    fn select_for_copy(&self) -> Vec<PageNode> {
        let inner = self.lock_inner();
        let bound = inner
            .last_valid_checkpoint
            .timestamp
            .min(inner.copier_timestamp_limit);
        let limit = self.options.copies_per_cycle;
        let mut selected: HashMap<PageKey, PageNode> = HashMap::new();
        for node in &inner.page_list {
            if selected.len() >= limit {
                break;
            }
            let key = node.key();
            if selected.contains_key(&key) {
                continue;
            }
            let Some(chain) = inner.page_map.get(&key) else {
                continue;
            };
            if chain.position_of(node.journal_address).is_none() {
                continue;
            }
            if let Some(version) = chain.versions().iter().find(|v| v.timestamp < bound) {
                selected.insert(key, *version);
            }
        }
        selected.into_values().collect()
    }

    fn read_for_copy(&self, mut nodes: Vec<PageNode>) -> Result<Vec<CopyItem>> {
        nodes.sort_by(PageNode::read_order);
        let mut items = Vec::with_capacity(nodes.len());
        for node in nodes {
            if node.is_invalid() {
                items.push(CopyItem { node, volume: None, image: None });
                continue;
            }
            let volume = match self.volume_for_handle(node.volume_handle) {
                Ok(volume) => volume,
                Err(_) => {
                    items.push(CopyItem { node, volume: None, image: None });
                    continue;
                }
            };
            let image = {
                let mut inner = self.lock_inner();
                self.read_page_image(&mut inner, &node)
            };
            let image = image.and_then(|image| {
                if image.len() == volume.page_size() {
                    Ok(image)
                } else {
                    Err(Error::corrupt_journal(
                        node.journal_address,
                        format!(
                            "page image of {} bytes for volume {} with {} byte pages",
                            image.len(),
                            volume.name(),
                            volume.page_size()
                        ),
                    ))
                }
            });
            match image {
                Ok(image) => items.push(CopyItem {
                    node,
                    volume: Some(volume),
                    image: Some(image),
                }),
                Err(e) => {
                    self.metrics.io_error();
                    self.alerts.post(
                        Event::new(AlertLevel::Error, format!("copier failed to read {}: {}", node, e)),
                        JOURNAL_CATEGORY,
                    );
                    return Err(e);
                }
            }
        }
        Ok(items)
    }

    /// Writes images in volume and page order. Returns the nodes that may
    /// leave the page map along with the number of pages written.
    fn write_for_copy(&self, mut items: Vec<CopyItem>) -> Result<(Vec<PageNode>, usize)> {
        items.sort_by(|a, b| PageNode::write_order(&a.node, &b.node));
        let ignore_missing = self.ignore_missing_volumes.load(Ordering::Relaxed);
        let mut copied = Vec::with_capacity(items.len());
        let mut touched: Vec<Arc<dyn Volume>> = Vec::new();
        let mut written = 0;
        for item in items {
            let node = item.node;
            match (item.volume, item.image) {
                (Some(volume), Some(image)) => {
                    let result = volume
                        .extend(node.page_address)
                        .and_then(|_| volume.write_page(node.page_address, &image));
                    if let Err(e) = result {
                        self.metrics.io_error();
                        self.alerts.post(
                            Event::new(AlertLevel::Error, format!("copier failed to write {}: {}", node, e)),
                            JOURNAL_CATEGORY,
                        );
                        return Err(e);
                    }
                    if !touched.iter().any(|v| Arc::ptr_eq(v, &volume)) {
                        touched.push(volume);
                    }
                    written += 1;
                    copied.push(node);
                }
                (None, _) if !node.is_invalid() => {
                    self.alerts.post(
                        Event::new(
                            AlertLevel::Warn,
                            format!("volume for handle {} is not attached; page {} not copied", node.volume_handle, node.page_address),
                        ),
                        MISSING_VOLUME_CATEGORY,
                    );
                    if ignore_missing {
                        copied.push(node);
                    }
                }
                _ => copied.push(node),
            }
        }
        for volume in &touched {
            volume.force()?;
        }
        self.metrics.pages_copied(written);
        Ok((copied, written))
    }

    /// Removes copied versions from the page map, advances the base address
    /// and deletes journal files wholly below it.
    fn cleanup_for_copy(&self, copied: &[PageNode]) -> Result<()> {
        let (generations, block_size) = {
            let mut guard = self.lock_inner();
            let inner = &mut *guard;
            for node in copied {
                let key = node.key();
                let remove = match inner.page_map.get_mut(&key) {
                    Some(chain) => match chain.position_of(node.journal_address) {
                        Some(0) => true,
                        Some(at) => {
                            chain.remove_history_after(at - 1);
                            false
                        }
                        None => false,
                    },
                    None => false,
                };
                if remove {
                    inner.page_map.remove(&key);
                }
            }

            let before = inner.page_list.len();
            let page_map = &inner.page_map;
            inner.page_list.retain(|n| {
                page_map
                    .get(&n.key())
                    .is_some_and(|chain| chain.position_of(n.journal_address).is_some())
            });
            self.metrics
                .pages_dropped((before - inner.page_list.len()).saturating_sub(copied.len()));

            let current = inner.current_address();
            let mut boundary = current;
            for chain in inner.page_map.values().chain(inner.branch_map.values()) {
                for node in chain.versions() {
                    if !node.is_invalid() {
                        boundary = boundary.min(node.journal_address);
                    }
                }
            }
            for item in inner.live_transactions.values() {
                boundary = boundary.min(item.start_address);
            }
            if boundary < inner.base_address {
                return Err(Error::IllegalState(format!(
                    "retrograde base address {} below {}",
                    boundary, inner.base_address
                )));
            }
            inner.base_address = boundary;

            if boundary == current
                && inner.last_valid_checkpoint_address + CP_OVERHEAD as u64 == current
                && inner.current_journal_size() > ROLLOVER_THRESHOLD
            {
                self.rollover_locked(inner, true, true)?;
            }

            let block_size = inner.block_size;
            let limit = inner
                .last_valid_checkpoint_base_address
                .min(inner.file_base_address);
            let mut generations = Vec::new();
            let mut generation = inner.delete_boundary_address / block_size;
            while (generation + 1) * block_size <= limit {
                inner.files.remove(&generation);
                generations.push(generation);
                generation += 1;
            }
            (generations, block_size)
        };

        if generations.is_empty() {
            return Ok(());
        }
        let mut deleted = 0;
        for generation in &generations {
            let path = journal_file_path(self.path(), *generation);
            match std::fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => deleted += 1,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to delete journal file");
                    break;
                }
            }
        }
        if deleted > 0 {
            self.lock_inner().delete_boundary_address = (generations[deleted - 1] + 1) * block_size;
        }
        self.metrics.files_deleted(deleted);
        tracing::debug!(deleted, "journal files deleted");
        Ok(())
    }

    /// Posts an alert when the journal file count crosses a warning level.
    pub(crate) fn report_journal_file_count(&self) {
        let count = self.journal_file_count();
        let threshold = self.options.urgent_file_count_threshold as u64;
        let level = if count > threshold + TOO_MANY_ERROR_THRESHOLD as u64 {
            AlertLevel::Error
        } else if count > threshold + TOO_MANY_WARN_THRESHOLD as u64 {
            AlertLevel::Warn
        } else {
            AlertLevel::Normal
        };
        let changed = {
            let mut inner = self.lock_inner();
            let changed = inner.last_reported_level != level;
            inner.last_reported_level = level;
            changed
        };
        if changed {
            if level != AlertLevel::Normal {
                tracing::warn!(count, "journal has too many files");
            }
            self.alerts.post(
                Event::new(level, format!("journal has {} files", count)),
                MANY_JOURNAL_FILES_CATEGORY,
            );
        }
    }
}

/// Background page copier.
pub struct JournalCopier {
    journal: Weak<JournalManager>,
}

impl JournalCopier {
    pub fn new(journal: Weak<JournalManager>) -> Self {
        Self { journal }
    }
}

impl Pollable for JournalCopier {
    fn run_task(&self) -> Result<()> {
        match self.journal.upgrade() {
            Some(journal) => journal.copier_cycle().map(|_| ()),
            None => Ok(()),
        }
    }

    fn poll_interval(&self, configured: Duration) -> Duration {
        let Some(journal) = self.journal.upgrade() else {
            return configured;
        };
        if journal.append_only.load(Ordering::Relaxed) {
            return configured;
        }
        let busy = journal.last_cycle_pages_written.load(Ordering::Relaxed) > 0;
        if busy && (journal.copy_fast.load(Ordering::Relaxed) || journal.urgency() >= PAGE_COPIER_URGENT) {
            Duration::ZERO
        } else {
            configured
        }
    }

    fn should_stop(&self) -> bool {
        self.journal.upgrade().map_or(true, |j| j.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::Buffer;
    use crate::core::journal::JournalOptions;
    use crate::core::page_node::Checkpoint;
    use crate::core::page_source::FixedPageSource;
    use crate::core::transaction_index::{MemoryTransactionIndex, TimestampAllocator};
    use crate::core::volume::MemoryVolume;
    use tempfile::TempDir;

    const PAGE_SIZE: usize = 1024;

    fn setup(dir: &TempDir) -> (Arc<JournalManager>, Arc<MemoryVolume>) {
        let volume = Arc::new(MemoryVolume::new("data", 1, PAGE_SIZE).unwrap());
        let journal = JournalManager::open(
            dir.path().join("journal"),
            JournalOptions {
                block_size: MINIMUM_BLOCK_SIZE,
                ..JournalOptions::default()
            },
            Arc::new(MemoryTransactionIndex::new()),
            Arc::new(TimestampAllocator::starting_at(1000)),
            vec![volume.clone() as Arc<dyn Volume>],
        )
        .unwrap();
        (journal, volume)
    }

    fn write_page(journal: &JournalManager, volume: &Arc<MemoryVolume>, page: u64, timestamp: u64) {
        let mut buffer = Buffer::new(PAGE_SIZE, Arc::new(FixedPageSource::new())).unwrap();
        buffer.set_volume(volume.clone());
        buffer.set_page(page);
        buffer.init(PAGE_TYPE_DATA).unwrap();
        buffer.set_dirty_at_timestamp(timestamp);
        journal.write_page_to_journal(&mut buffer).unwrap();
    }

    #[test]
    fn test_nothing_copied_before_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (journal, volume) = setup(&dir);
        write_page(&journal, &volume, 4, 1001);
        assert_eq!(journal.copier_cycle().unwrap(), 0);
        assert!(!volume.contains(4));
        assert_eq!(journal.page_map_size(), 1);
    }

    #[test]
    fn test_copy_after_checkpoint_empties_page_map() {
        let dir = TempDir::new().unwrap();
        let (journal, volume) = setup(&dir);
        for page in 1..=3 {
            write_page(&journal, &volume, page, 1000 + page);
        }
        journal
            .write_checkpoint_to_journal(&Checkpoint::new(1010, 0))
            .unwrap();

        assert_eq!(journal.copier_cycle().unwrap(), 3);
        for page in 1..=3 {
            assert!(volume.contains(page));
        }
        assert_eq!(journal.page_map_size(), 0);
        assert_eq!(journal.base_address(), journal.current_address());
        assert_eq!(journal.metrics().snapshot().pages_copied, 3);
        assert_eq!(journal.copier_cycle().unwrap(), 0);
    }

    #[test]
    fn test_copier_timestamp_limit_holds_back_pages() {
        let dir = TempDir::new().unwrap();
        let (journal, volume) = setup(&dir);
        write_page(&journal, &volume, 1, 1001);
        write_page(&journal, &volume, 2, 1003);
        journal
            .write_checkpoint_to_journal(&Checkpoint::new(1010, 0))
            .unwrap();
        journal.set_copier_timestamp_limit(1002);
        assert_eq!(journal.copier_cycle().unwrap(), 1);
        assert!(volume.contains(1));
        assert!(!volume.contains(2));
    }

    #[test]
    fn test_missing_volume_is_retained_unless_ignored() {
        let dir = TempDir::new().unwrap();
        let (journal, volume) = setup(&dir);
        write_page(&journal, &volume, 1, 1001);
        journal
            .write_checkpoint_to_journal(&Checkpoint::new(1010, 0))
            .unwrap();
        assert!(journal.remove_volume("data").is_some());

        assert_eq!(journal.copier_cycle().unwrap(), 0);
        assert_eq!(journal.page_map_size(), 1);
        assert!(journal.alerts().history(MISSING_VOLUME_CATEGORY).is_some());

        journal.set_ignore_missing_volumes(true);
        assert_eq!(journal.copier_cycle().unwrap(), 1);
        assert_eq!(journal.page_map_size(), 0);
        assert!(!volume.contains(1));
    }

    #[test]
    fn test_append_only_copies_nothing() {
        let dir = TempDir::new().unwrap();
        let (journal, volume) = setup(&dir);
        write_page(&journal, &volume, 1, 1001);
        journal
            .write_checkpoint_to_journal(&Checkpoint::new(1010, 0))
            .unwrap();
        journal.set_append_only(true);
        assert_eq!(journal.copier_cycle().unwrap(), 0);
        assert!(!volume.contains(1));
        journal.set_append_only(false);
        journal.copy_back().unwrap();
        assert!(volume.contains(1));
    }
}
