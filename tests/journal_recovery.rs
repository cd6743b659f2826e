mod common;

use common::*;
use pagejournal::core::buffer::Buffer;
use pagejournal::core::journal_record::{encode_updates, Update};
use pagejournal::core::page_node::PageNode;
use pagejournal::core::page_source::FixedPageSource;
use pagejournal::core::recovery::journal_file_path;
use pagejournal::core::transaction_index::TimestampAllocator;
use pagejournal::{JournalManager, JournalOptions, MemoryTransactionIndex, MemoryVolume, Volume};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    index: Arc<MemoryTransactionIndex>,
    timestamps: Arc<TimestampAllocator>,
    volume: Arc<dyn Volume>,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        Self {
            index: Arc::new(MemoryTransactionIndex::new()),
            timestamps: Arc::new(TimestampAllocator::new()),
            volume: Arc::new(MemoryVolume::new("data", 1, PAGE_SIZE).unwrap()),
        }
    }

    fn open(&self, path: &Path, options: JournalOptions) -> Arc<JournalManager> {
        JournalManager::open(
            path,
            options,
            self.index.clone(),
            self.timestamps.clone(),
            vec![self.volume.clone()],
        )
        .unwrap()
    }

    fn page(&self, page: u64, content: &[u8]) -> Buffer {
        let mut buffer = data_page(PAGE_SIZE, page);
        buffer.set_volume(self.volume.clone());
        assert!(put(&mut buffer, b"v", content));
        buffer.set_dirty_at_timestamp(self.timestamps.update_timestamp());
        buffer
    }

    fn checkpoint(&self, journal: &JournalManager) -> u64 {
        let checkpoint = journal.propose_checkpoint();
        journal.write_checkpoint_to_journal(&checkpoint).unwrap();
        journal.prune_obsolete_transactions(true).unwrap();
        checkpoint.timestamp
    }
}

fn options(block_size: u64) -> JournalOptions {
    JournalOptions {
        block_size,
        ..JournalOptions::default()
    }
}

fn image(journal: &JournalManager, volume_handle: u32, page: u64) -> Vec<u8> {
    let mut buffer = Buffer::new(PAGE_SIZE, Arc::new(FixedPageSource::new())).unwrap();
    assert!(journal.read_page_from_journal(volume_handle, page, &mut buffer).unwrap());
    buffer.bytes().to_vec()
}

#[test]
fn test_scenario_three_pages_and_checkpoint_survive_crash() {
    let fx = Fixture::new();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal");

    let journal = fx.open(&path, options(10_000_000));
    let mut addresses = Vec::new();
    for page in 1..=3 {
        addresses.push(journal.write_page_to_journal(&mut fx.page(page, &[page as u8; 16])).unwrap());
    }
    let checkpoint = fx.checkpoint(&journal);
    let vh = journal.handle_for_volume(&fx.volume).unwrap();
    drop(journal);

    let journal = fx.open(&path, options(10_000_000));
    let nodes = journal.page_map_snapshot();
    assert_eq!(nodes.len(), 3);
    for (node, (page, address)) in nodes.iter().zip((1..=3u64).zip(&addresses)) {
        assert_eq!(node.volume_handle, vh);
        assert_eq!(node.page_address, page);
        assert_eq!(node.journal_address, *address);
    }
    assert_eq!(journal.last_valid_checkpoint().timestamp, checkpoint);
    assert_eq!(journal.branch_map_size(), 0);
    assert!(journal.recovery_report().clean_end);
    assert!(fx.timestamps.current() >= checkpoint);

    let mut page = Buffer::new(PAGE_SIZE, Arc::new(FixedPageSource::new())).unwrap();
    assert!(journal.read_page_from_journal(vh, 2, &mut page).unwrap());
    assert_eq!(get(&page, b"v"), Some(vec![2u8; 16]));
}

#[test]
fn test_pages_after_last_checkpoint_recover_into_branch_map() {
    let fx = Fixture::new();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal");

    let journal = fx.open(&path, options(10_000_000));
    journal.write_page_to_journal(&mut fx.page(1, b"before")).unwrap();
    fx.checkpoint(&journal);
    journal.write_page_to_journal(&mut fx.page(2, b"after")).unwrap();
    journal.force().unwrap();
    drop(journal);

    let journal = fx.open(&path, options(10_000_000));
    assert_eq!(journal.page_map_size(), 1);
    assert_eq!(journal.branch_map_size(), 1);
    assert_eq!(journal.recovery_report().branch_pages, 1);
}

#[test]
fn test_copied_pages_stay_retired_after_crash() {
    let fx = Fixture::new();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal");

    let journal = fx.open(&path, options(10_000_000));
    journal.write_page_to_journal(&mut fx.page(31, b"copied")).unwrap();
    fx.checkpoint(&journal);
    journal.copier_cycle().unwrap();
    assert_eq!(journal.page_map_size(), 0);
    let base = journal.base_address();

    journal.write_page_to_journal(&mut fx.page(5, b"live")).unwrap();
    fx.checkpoint(&journal);
    let pages = journal.page_map_snapshot();
    assert_eq!(pages.len(), 1);
    drop(journal);

    let journal = fx.open(&path, options(10_000_000));
    assert_eq!(journal.base_address(), base);
    assert_eq!(journal.page_map_snapshot(), pages);
    assert_eq!(journal.branch_map_size(), 0);
    assert!(journal.page_map_snapshot().iter().all(|n| n.journal_address >= base));
}

/// Runs a random mix of page writes, transactions, checkpoints and copier
/// cycles, stops at a random point and reopens. The recovered maps must match
/// the maps held in memory when the journal was dropped. A copied version
/// only comes back when the base address recorded in the journal had not yet
/// moved past it.
#[test]
fn test_recovery_matches_state_at_crash() {
    const BLOCK_SIZE: u64 = 100_000_000;
    for seed in 0..24u64 {
        let fx = Fixture::new();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");
        let mut rng = StdRng::seed_from_u64(seed);

        let journal = fx.open(&path, options(BLOCK_SIZE));
        let tree = journal.handle_for_tree(&fx.volume, "accounts").unwrap();
        let mut copied: Vec<PageNode> = Vec::new();
        let mut running: Vec<(u64, u64)> = Vec::new();
        for _ in 0..rng.gen_range(10..240) {
            match rng.gen_range(0..10) {
                0..=4 => {
                    let content: Vec<u8> = (0..16).map(|_| rng.gen_range(0..0xFE)).collect();
                    let mut page = fx.page(rng.gen_range(1..24), &content);
                    journal.write_page_to_journal(&mut page).unwrap();
                }
                5 | 6 => {
                    let value: Vec<u8> = (0..rng.gen_range(1..64)).map(|_| rng.gen()).collect();
                    let updates = encode_updates(&[Update::Store {
                        tree_handle: tree,
                        key: b"k".to_vec(),
                        value,
                    }]);
                    if !running.is_empty() && rng.gen_bool(0.5) {
                        let (start, last) = running.swap_remove(rng.gen_range(0..running.len()));
                        if rng.gen_bool(0.5) {
                            let commit = fx.timestamps.update_timestamp();
                            fx.index.commit(start, commit).unwrap();
                            journal.write_transaction_to_journal(&updates, start, commit, last).unwrap();
                        } else {
                            let next = journal.write_transaction_to_journal(&updates, start, 0, last).unwrap();
                            running.push((start, next));
                        }
                    } else {
                        let start = fx.timestamps.update_timestamp();
                        fx.index.begin(start).unwrap();
                        if rng.gen_bool(0.5) {
                            let commit = fx.timestamps.update_timestamp();
                            fx.index.commit(start, commit).unwrap();
                            journal.write_transaction_to_journal(&updates, start, commit, 0).unwrap();
                        } else {
                            let first = journal.write_transaction_to_journal(&updates, start, 0, 0).unwrap();
                            running.push((start, first));
                        }
                    }
                }
                7 => {
                    fx.checkpoint(&journal);
                }
                8 => {
                    let before = journal.page_map_snapshot();
                    journal.copier_cycle().unwrap();
                    let after = journal.page_map_snapshot();
                    copied.extend(before.into_iter().filter(|n| !after.contains(n)));
                }
                _ => journal.force().unwrap(),
            }
        }
        journal.force().unwrap();

        let vh = journal.handle_for_volume(&fx.volume).unwrap();
        let pages = journal.page_map_snapshot();
        let transactions = journal.transaction_map_snapshot();
        let checkpoint = journal.last_valid_checkpoint().timestamp;
        let base_at_crash = journal.base_address();
        let last_file = journal_file_path(&path, journal.current_address() / BLOCK_SIZE);
        let images: Vec<Vec<u8>> = pages.iter().map(|n| image(&journal, vh, n.page_address)).collect();
        drop(journal);

        let torn = rng.gen_bool(0.5);
        if torn {
            let mut file = OpenOptions::new().append(true).open(&last_file).unwrap();
            file.write_all(&[0xAB; 7]).unwrap();
        }

        let journal = fx.open(&path, options(BLOCK_SIZE));
        let base = journal.base_address();
        assert!(base <= base_at_crash, "seed {}", seed);
        assert_eq!(journal.recovery_report().clean_end, !torn, "seed {}", seed);
        assert_eq!(journal.last_valid_checkpoint().timestamp, checkpoint, "seed {}", seed);

        let mut expected: BTreeMap<(u32, u64), PageNode> =
            pages.iter().map(|n| ((n.volume_handle, n.page_address), *n)).collect();
        for node in copied.iter().filter(|n| n.journal_address >= base) {
            let slot = expected.entry((node.volume_handle, node.page_address)).or_insert(*node);
            if node.journal_address > slot.journal_address {
                *slot = *node;
            }
        }

        let mut recovered: BTreeMap<(u32, u64), PageNode> = BTreeMap::new();
        for node in journal.page_map_snapshot() {
            assert!(node.journal_address >= base, "seed {}", seed);
            assert!(node.timestamp <= checkpoint, "seed {}", seed);
            recovered.insert((node.volume_handle, node.page_address), node);
        }
        for node in journal.branch_map_snapshot() {
            assert!(node.journal_address >= base, "seed {}", seed);
            assert!(node.timestamp > checkpoint, "seed {}", seed);
            recovered.insert((node.volume_handle, node.page_address), node);
        }
        assert_eq!(recovered, expected, "seed {}", seed);
        assert_eq!(journal.transaction_map_snapshot(), transactions, "seed {}", seed);
        assert!(transactions.iter().all(|t| t.start_address >= base), "seed {}", seed);

        for (node, expected) in pages.iter().zip(&images) {
            if node.timestamp <= checkpoint {
                assert_eq!(&image(&journal, vh, node.page_address), expected, "seed {}", seed);
            }
        }
        assert_eq!(journal.handle_for_tree(&fx.volume, "accounts").unwrap(), tree);
    }
}

#[test]
fn test_rollover_and_file_deletion() {
    let fx = Fixture::new();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("journal");
    let journal = fx.open(&path, options(1_000_000));
    let tree = journal.handle_for_tree(&fx.volume, "blobs").unwrap();
    let updates = encode_updates(&[Update::Store {
        tree_handle: tree,
        key: b"k".to_vec(),
        value: vec![7u8; 60_000],
    }]);
    let commit_one = || {
        let start = fx.timestamps.update_timestamp();
        fx.index.begin(start).unwrap();
        let commit = fx.timestamps.update_timestamp();
        fx.index.commit(start, commit).unwrap();
        journal.write_transaction_to_journal(&updates, start, commit, 0).unwrap();
    };

    for _ in 0..40 {
        commit_one();
    }
    assert!(journal.journal_file_count() >= 3);
    assert!(journal.metrics().snapshot().rollovers >= 2);

    fx.checkpoint(&journal);
    assert!(journal.transaction_map_snapshot().is_empty());
    journal.copier_cycle().unwrap();
    assert_eq!(journal.base_address(), journal.current_address());
    assert!(journal_file_path(&path, 0).exists());

    for _ in 0..20 {
        commit_one();
    }
    fx.checkpoint(&journal);
    journal.copier_cycle().unwrap();

    assert!(!journal_file_path(&path, 0).exists());
    assert!(!journal_file_path(&path, 1).exists());
    assert!(journal_file_path(&path, 2).exists());
    assert_eq!(journal.metrics().snapshot().files_deleted, 2);
    assert_eq!(journal.base_address(), journal.current_address());
    drop(journal);

    let journal = fx.open(&path, options(1_000_000));
    assert!(journal.transaction_map_snapshot().is_empty());
    assert_eq!(journal.page_map_size(), 0);
    assert!(journal.last_valid_checkpoint().timestamp > 0);
}

#[test]
fn test_background_copier_drains_page_map() {
    let fx = Fixture::new();
    let dir = TempDir::new().unwrap();
    let journal = fx.open(
        &dir.path().join("journal"),
        JournalOptions {
            block_size: 1_000_000,
            flush_interval_ms: 5,
            copier_interval_ms: 10,
            ..JournalOptions::default()
        },
    );
    journal.start_background().unwrap();
    for page in 1..=5 {
        journal.write_page_to_journal(&mut fx.page(page, b"payload")).unwrap();
    }
    fx.checkpoint(&journal);
    journal.kick_copier();

    let deadline = Instant::now() + Duration::from_secs(10);
    while journal.page_map_size() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(journal.page_map_size(), 0);
    assert_eq!(fx.volume.page_count(), 6);
    journal.close(true).unwrap();
    assert!(journal.is_closed());
}
