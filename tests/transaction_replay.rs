mod common;

use common::*;
use pagejournal::core::buffer::Buffer;
use pagejournal::core::journal_record::{encode_updates, Update};
use pagejournal::core::mvv;
use pagejournal::core::player::{ProactiveRollbackListener, ReplayListener};
use pagejournal::core::transaction_index::{ts_to_vh, TimestampAllocator};
use pagejournal::core::value::MvvValueWriter;
use pagejournal::{
    Error, JournalManager, JournalOptions, Key, MemoryTransactionIndex, MemoryVolume, TransactionIndex, Volume,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    index: Arc<MemoryTransactionIndex>,
    timestamps: Arc<TimestampAllocator>,
    volume: Arc<dyn Volume>,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().unwrap(),
            index: Arc::new(MemoryTransactionIndex::new()),
            timestamps: Arc::new(TimestampAllocator::starting_at(100)),
            volume: Arc::new(MemoryVolume::new("data", 1, PAGE_SIZE).unwrap()),
        }
    }

    fn path(&self) -> std::path::PathBuf {
        self.dir.path().join("journal")
    }

    fn open_with(&self, path: &Path, volumes: Vec<Arc<dyn Volume>>) -> Arc<JournalManager> {
        JournalManager::open(
            path,
            JournalOptions {
                block_size: 1_000_000,
                ..JournalOptions::default()
            },
            self.index.clone(),
            self.timestamps.clone(),
            volumes,
        )
        .unwrap()
    }

    fn open(&self) -> Arc<JournalManager> {
        self.open_with(&self.path(), vec![self.volume.clone()])
    }
}

fn put_version(b: &mut Buffer, key: &str, ts: u64, value: &[u8]) {
    let key = Key::from(key);
    let found = b.find_key(&key);
    let helper = MvvValueWriter {
        version_handle: ts_to_vh(ts),
        value,
    };
    b.put_value(&key, &helper, found).unwrap().unwrap();
}

/// A page holding committed values for c, d and x plus four versions written
/// by the transaction started at `start`: stores of a and b and removals of
/// c and d.
fn page_with_tentative_versions(fx: &Fixture, start: u64) -> Buffer {
    let mut page = data_page(PAGE_SIZE, 1);
    assert!(put(&mut page, b"c", b"old-c"));
    assert!(put(&mut page, b"d", b"old-d"));
    assert!(put(&mut page, b"x", b"keep"));
    let status = fx.index.begin(start).unwrap();
    put_version(&mut page, "a", start, b"A");
    put_version(&mut page, "b", start, b"B");
    put_version(&mut page, "c", start, &mvv::ANTI_VALUE);
    put_version(&mut page, "d", start, &mvv::ANTI_VALUE);
    for _ in 0..4 {
        status.increment_mvv_count();
    }
    page
}

fn tentative_updates(tree: u32) -> Vec<u8> {
    encode_updates(&[
        Update::Store {
            tree_handle: tree,
            key: b"a".to_vec(),
            value: b"A".to_vec(),
        },
        Update::Store {
            tree_handle: tree,
            key: b"b".to_vec(),
            value: b"B".to_vec(),
        },
        Update::RemoveRange {
            tree_handle: tree,
            key1: b"c".to_vec(),
            key2: b"e".to_vec(),
        },
    ])
}

fn assert_rolled_back(provider: &LeafProvider) {
    let page = provider.page("accounts").unwrap();
    let page = page.lock().unwrap();
    assert_eq!(get(&page, b"a"), None);
    assert_eq!(get(&page, b"b"), None);
    assert_eq!(get(&page, b"c"), Some(b"old-c".to_vec()));
    assert_eq!(get(&page, b"d"), Some(b"old-d".to_vec()));
    assert_eq!(get(&page, b"x"), Some(b"keep".to_vec()));
    page.verify().unwrap();
}

#[test]
fn test_scenario_aborted_transaction_rolled_back_at_recovery() {
    let fx = Fixture::new();
    let journal = fx.open();
    let tree = journal.handle_for_tree(&fx.volume, "accounts").unwrap();
    let start = fx.timestamps.update_timestamp();
    let page = page_with_tentative_versions(&fx, start);
    journal
        .write_transaction_to_journal(&tentative_updates(tree), start, 0, 0)
        .unwrap();
    journal.force().unwrap();
    drop(journal);

    fx.index.abort(start).unwrap();
    let status = fx.index.status(start).unwrap();
    let journal = fx.open();
    assert_eq!(journal.recovery_report().uncommitted_transactions, 1);
    let provider = Arc::new(LeafProvider::new(fx.index.clone()));
    provider.insert("accounts", page);
    journal.set_exchange_provider(provider.clone());

    let mut replay = ReplayListener::new();
    let mut rollback = ProactiveRollbackListener::new(fx.index.clone());
    let (replayed, rolled_back) = journal.apply_recovered(&mut replay, &mut rollback).unwrap();
    assert_eq!((replayed, rolled_back), (0, 1));
    assert_eq!(provider.calls(), vec!["prune a", "prune b", "prune_range c..e"]);
    assert_eq!(status.mvv_count(), 0);
    assert_rolled_back(&provider);
    assert!(journal.query_transaction_map(start).unwrap().is_aborted());

    status.set_notified();
    journal.prune_obsolete_transactions(true).unwrap();
    assert!(journal.query_transaction_map(start).is_none());
}

#[test]
fn test_aborted_transaction_pruned_while_running() {
    let fx = Fixture::new();
    let journal = fx.open();
    let tree = journal.handle_for_tree(&fx.volume, "accounts").unwrap();
    let provider = Arc::new(LeafProvider::new(fx.index.clone()));
    journal.set_exchange_provider(provider.clone());

    let start = fx.timestamps.update_timestamp();
    provider.insert("accounts", page_with_tentative_versions(&fx, start));
    journal
        .write_transaction_to_journal(&tentative_updates(tree), start, 0, 0)
        .unwrap();
    fx.index.abort(start).unwrap();
    let status = fx.index.status(start).unwrap();
    status.set_notified();

    journal.prune_obsolete_transactions(false).unwrap();
    assert!(provider.calls().is_empty());
    assert_eq!(status.mvv_count(), 4);
    assert!(journal.query_transaction_map(start).is_some());

    journal.prune_obsolete_transactions(true).unwrap();
    assert_eq!(provider.calls(), vec!["prune a", "prune b", "prune_range c..e"]);
    assert_eq!(status.mvv_count(), 0);
    assert_rolled_back(&provider);

    journal.prune_obsolete_transactions(true).unwrap();
    assert!(journal.query_transaction_map(start).is_none());
}

#[test]
fn test_committed_after_checkpoint_replayed_at_recovery() {
    let fx = Fixture::new();
    let journal = fx.open();
    let tree = journal.handle_for_tree(&fx.volume, "accounts").unwrap();
    let checkpoint = journal.propose_checkpoint();
    journal.write_checkpoint_to_journal(&checkpoint).unwrap();

    let start = fx.timestamps.update_timestamp();
    fx.index.begin(start).unwrap();
    let updates = encode_updates(&[
        Update::Store {
            tree_handle: tree,
            key: b"k1".to_vec(),
            value: b"v1".to_vec(),
        },
        Update::Store {
            tree_handle: tree,
            key: b"k2".to_vec(),
            value: b"v2".to_vec(),
        },
        Update::RemoveRange {
            tree_handle: tree,
            key1: b"k2".to_vec(),
            key2: b"k3".to_vec(),
        },
    ]);
    let commit = fx.timestamps.update_timestamp();
    fx.index.commit(start, commit).unwrap();
    journal.write_transaction_to_journal(&updates, start, commit, 0).unwrap();
    journal.force().unwrap();
    drop(journal);

    let journal = fx.open();
    assert_eq!(journal.recovery_report().committed_transactions, 1);
    let provider = Arc::new(LeafProvider::new(fx.index.clone()));
    journal.set_exchange_provider(provider.clone());

    let mut replay = ReplayListener::new();
    let mut rollback = ProactiveRollbackListener::new(fx.index.clone());
    assert_eq!(journal.apply_recovered(&mut replay, &mut rollback).unwrap(), (1, 0));
    assert_eq!(replay.transactions(), 1);
    assert_eq!(provider.calls(), vec!["store k1", "store k2", "remove k2..k3"]);
    assert_eq!(journal.player_stats().applied, 3);

    let page = provider.page("accounts").unwrap();
    let page = page.lock().unwrap();
    assert_eq!(get(&page, b"k1"), Some(b"v1".to_vec()));
    assert_eq!(get(&page, b"k2"), None);
}

#[test]
fn test_committed_before_checkpoint_compacts_removed_ranges() {
    let fx = Fixture::new();
    let journal = fx.open();
    let tree = journal.handle_for_tree(&fx.volume, "accounts").unwrap();
    let provider = Arc::new(LeafProvider::new(fx.index.clone()));
    provider.insert("accounts", data_page(PAGE_SIZE, 1));
    journal.set_exchange_provider(provider.clone());

    let start = fx.timestamps.update_timestamp();
    fx.index.begin(start).unwrap();
    let updates = encode_updates(&[
        Update::Store {
            tree_handle: tree,
            key: b"m".to_vec(),
            value: b"1".to_vec(),
        },
        Update::RemoveRange {
            tree_handle: tree,
            key1: b"p".to_vec(),
            key2: b"q".to_vec(),
        },
    ]);
    let commit = fx.timestamps.update_timestamp();
    fx.index.commit(start, commit).unwrap();
    journal.write_transaction_to_journal(&updates, start, commit, 0).unwrap();

    journal.prune_obsolete_transactions(true).unwrap();
    assert!(journal.query_transaction_map(start).is_some());

    let checkpoint = journal.propose_checkpoint();
    journal.write_checkpoint_to_journal(&checkpoint).unwrap();
    journal.prune_obsolete_transactions(true).unwrap();
    assert_eq!(provider.calls(), vec!["prune_range p..q"]);
    assert!(journal.query_transaction_map(start).is_none());
}

#[test]
fn test_updates_for_missing_volume() {
    let fx = Fixture::new();
    let journal = fx.open();
    let tree = journal.handle_for_tree(&fx.volume, "accounts").unwrap();
    let checkpoint = journal.propose_checkpoint();
    journal.write_checkpoint_to_journal(&checkpoint).unwrap();
    let start = fx.timestamps.update_timestamp();
    fx.index.begin(start).unwrap();
    let commit = fx.timestamps.update_timestamp();
    fx.index.commit(start, commit).unwrap();
    let updates = encode_updates(&[Update::Store {
        tree_handle: tree,
        key: b"k".to_vec(),
        value: b"v".to_vec(),
    }]);
    journal.write_transaction_to_journal(&updates, start, commit, 0).unwrap();
    journal.force().unwrap();
    drop(journal);

    let journal = fx.open_with(&fx.path(), Vec::new());
    let mut replay = ReplayListener::new();
    let mut rollback = ProactiveRollbackListener::new(fx.index.clone());
    assert!(matches!(
        journal.apply_recovered(&mut replay, &mut rollback),
        Err(Error::MissingVolume { .. })
    ));
    assert_eq!(journal.player_stats().failed, 1);

    journal.set_ignore_missing_volumes(true);
    assert_eq!(journal.apply_recovered(&mut replay, &mut rollback).unwrap(), (1, 0));
    assert_eq!(journal.player_stats().ignored, 1);
}

#[test]
fn test_page_write_prunes_aborted_versions() {
    let fx = Fixture::new();
    let journal = fx.open();
    let mut page = data_page(PAGE_SIZE, 4);
    page.set_volume(fx.volume.clone());
    let start = fx.timestamps.update_timestamp();
    let status = fx.index.begin(start).unwrap();
    put_version(&mut page, "a", start, b"tentative");
    status.increment_mvv_count();
    assert!(put(&mut page, b"z", b"kept"));
    fx.index.abort(start).unwrap();
    page.set_dirty_at_timestamp(fx.timestamps.update_timestamp());

    journal.write_page_to_journal(&mut page).unwrap();
    assert_eq!(get(&page, b"a"), None);
    assert_eq!(get(&page, b"z"), Some(b"kept".to_vec()));
    assert_eq!(status.mvv_count(), 0);

    let vh = journal.handle_for_volume(&fx.volume).unwrap();
    let mut copy = data_page(PAGE_SIZE, 4);
    assert!(journal.read_page_from_journal(vh, 4, &mut copy).unwrap());
    assert_eq!(entries(&copy), entries(&page));
}
