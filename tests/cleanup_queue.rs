mod common;

use common::*;
use pagejournal::core::buffer::Buffer;
use pagejournal::core::cleanup::CleanupAction;
use pagejournal::core::transaction_index::{ts_to_vh, TimestampAllocator};
use pagejournal::core::value::MvvValueWriter;
use pagejournal::{
    CleanupManager, CleanupOptions, CleanupTarget, JournalManager, JournalOptions, Key, MemoryTransactionIndex,
    MemoryVolume, Volume,
};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    index: Arc<MemoryTransactionIndex>,
    timestamps: Arc<TimestampAllocator>,
    journal: Arc<JournalManager>,
    provider: Arc<LeafProvider>,
    tree: u32,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let index = Arc::new(MemoryTransactionIndex::new());
        let timestamps = Arc::new(TimestampAllocator::starting_at(10));
        let volume: Arc<dyn Volume> = Arc::new(MemoryVolume::new("data", 1, PAGE_SIZE).unwrap());
        let journal = JournalManager::open(
            dir.path().join("journal"),
            JournalOptions {
                block_size: 1_000_000,
                ..JournalOptions::default()
            },
            index.clone(),
            timestamps.clone(),
            vec![volume.clone()],
        )
        .unwrap();
        let tree = journal.handle_for_tree(&volume, "accounts").unwrap();
        let provider = Arc::new(LeafProvider::new(index.clone()));
        journal.set_exchange_provider(provider.clone());
        Self {
            _dir: dir,
            index,
            timestamps,
            journal,
            provider,
            tree,
        }
    }

    /// Installs a page holding one committed key and one key written by an
    /// aborted transaction.
    fn install_page(&self) -> Arc<Mutex<Buffer>> {
        let mut page = data_page(PAGE_SIZE, 1);
        assert!(put(&mut page, b"kept", b"1"));
        let start = self.timestamps.update_timestamp();
        let status = self.index.begin(start).unwrap();
        let key = Key::from("gone");
        let found = page.find_key(&key);
        let helper = MvvValueWriter {
            version_handle: ts_to_vh(start),
            value: b"2",
        };
        page.put_value(&key, &helper, found).unwrap().unwrap();
        status.increment_mvv_count();
        self.index.abort(start).unwrap();
        self.provider.insert("accounts", page)
    }
}

#[test]
fn test_queued_prune_reaches_tree_through_journal() {
    let fx = Fixture::new();
    let page = fx.install_page();
    let manager = CleanupManager::new(CleanupOptions::default());

    let action = CleanupAction::Prune {
        tree_handle: fx.tree,
        page: 1,
    };
    assert!(manager.offer(action));
    assert!(manager.offer(action));
    assert_eq!(manager.queued(), 1);

    manager.poll(&*fx.journal).unwrap();
    assert_eq!(manager.queued(), 0);
    assert_eq!(manager.stats().performed, 1);
    let page = page.lock().unwrap();
    assert_eq!(get(&page, b"gone"), None);
    assert_eq!(get(&page, b"kept"), Some(b"1".to_vec()));
}

#[test]
fn test_action_for_unknown_tree_is_skipped() {
    let fx = Fixture::new();
    let manager = CleanupManager::new(CleanupOptions::default());
    manager.offer(CleanupAction::Prune {
        tree_handle: fx.tree + 100,
        page: 1,
    });
    manager.poll(&*fx.journal).unwrap();
    assert_eq!(manager.stats().performed, 1);
    assert_eq!(manager.stats().errors, 0);
    assert!(fx.provider.calls().is_empty());
}

#[test]
fn test_background_poller_drains_queue() {
    let fx = Fixture::new();
    let page = fx.install_page();
    let manager = Arc::new(CleanupManager::new(CleanupOptions {
        poll_interval_ms: 10,
        ..CleanupOptions::default()
    }));
    let target: Arc<dyn CleanupTarget> = fx.journal.clone();
    manager.start(Arc::downgrade(&target)).unwrap();
    manager.offer(CleanupAction::Prune {
        tree_handle: fx.tree,
        page: 1,
    });
    manager.kick();

    let deadline = Instant::now() + Duration::from_secs(10);
    while manager.stats().performed == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(manager.stats().performed, 1);
    assert_eq!(get(&page.lock().unwrap(), b"gone"), None);
    manager.close();
}
