// Shared fixtures for the integration tests: a single-page tree reachable
// through the exchange traits and helpers for journal directories.

#![allow(dead_code)]

use pagejournal::core::buffer::{Buffer, FoundAt};
use pagejournal::core::cleanup::CleanupAction;
use pagejournal::core::constants::*;
use pagejournal::core::exchange::{ExchangeProvider, TreeExchange};
use pagejournal::core::page_source::FixedPageSource;
use pagejournal::core::transaction_index::TransactionIndex;
use pagejournal::core::value::RawValueWriter;
use pagejournal::core::PruneContext;
use pagejournal::{Error, Key, Result, TreeDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const PAGE_SIZE: usize = 1024;

/// Timestamp handed to pruning by [`LeafTree`].
pub const PRUNE_TIMESTAMP: u64 = 1_000_000;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn data_page(size: usize, page: u64) -> Buffer {
    let mut b = Buffer::new(size, Arc::new(FixedPageSource::new())).unwrap();
    b.set_page(page);
    b.init(PAGE_TYPE_DATA).unwrap();
    b
}

/// Inserts or replaces `key`. Returns false when the page is full.
pub fn put(b: &mut Buffer, key: &[u8], value: &[u8]) -> bool {
    let key = Key::from_bytes(key).unwrap();
    let found = b.find_key(&key);
    b.put_value(&key, &RawValueWriter(value), found).unwrap().is_some()
}

pub fn get(b: &Buffer, key: &[u8]) -> Option<Vec<u8>> {
    let found = b.find_key(&Key::from_bytes(key).unwrap());
    if found.is_exact() {
        b.fetch(found).map(|v| v.to_vec())
    } else {
        None
    }
}

pub fn entries(b: &Buffer) -> Vec<(Vec<u8>, Vec<u8>)> {
    b.records()
        .into_iter()
        .map(|r| (r.key.encoded_bytes().to_vec(), r.value))
        .collect()
}

/// Removes `[from, to)` from the page.
pub fn remove_range(b: &mut Buffer, from: &[u8], to: &[u8]) -> bool {
    let f1 = b.find_key(&Key::from_bytes(from).unwrap());
    let f2 = b.find_key(&Key::from_bytes(to).unwrap());
    if f1.position() >= f2.position() {
        return false;
    }
    let mut spare = Key::new();
    b.remove_keys(f1, FoundAt::new(f2.position(), 0, false, false), &mut spare)
        .unwrap()
}

/// A tree that fits in one data page.
pub struct LeafTree {
    tree: TreeDescriptor,
    page: Arc<Mutex<Buffer>>,
    index: Arc<dyn TransactionIndex>,
    log: Arc<Mutex<Vec<String>>>,
}

impl LeafTree {
    fn with_page<T>(&self, f: impl FnOnce(&mut Buffer) -> Result<T>) -> Result<T> {
        let mut page = self.page.lock().map_err(|_| Error::LockPoisoned {
            lock_name: "leaf".to_string(),
        })?;
        f(&mut page)
    }

    fn record(&self, call: String) {
        if let Ok(mut log) = self.log.lock() {
            log.push(call);
        }
    }

    fn prune_page_now(&self) -> Result<bool> {
        let index = self.index.clone();
        self.with_page(|b| {
            let mut ctx = PruneContext::new(&*index, PRUNE_TIMESTAMP);
            b.prune_mvv_values(&mut ctx)
        })
    }
}

impl TreeExchange for LeafTree {
    fn tree(&self) -> &TreeDescriptor {
        &self.tree
    }

    fn store(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        self.record(format!("store {}", String::from_utf8_lossy(key.encoded_bytes())));
        self.with_page(|b| {
            let found = b.find_key(key);
            match b.put_value(key, &RawValueWriter(value), found)? {
                Some(_) => Ok(()),
                None => Err(Error::Other("leaf page is full".to_string())),
            }
        })
    }

    fn remove_key_range(&mut self, from: &Key, to: &Key) -> Result<bool> {
        self.record(format!(
            "remove {}..{}",
            String::from_utf8_lossy(from.encoded_bytes()),
            String::from_utf8_lossy(to.encoded_bytes())
        ));
        self.with_page(|b| Ok(remove_range(b, from.encoded_bytes(), to.encoded_bytes())))
    }

    fn remove_tree(&mut self) -> Result<()> {
        self.record("remove_tree".to_string());
        self.with_page(|b| b.init(PAGE_TYPE_DATA))
    }

    fn prune(&mut self, key: &Key) -> Result<bool> {
        self.record(format!("prune {}", String::from_utf8_lossy(key.encoded_bytes())));
        self.prune_page_now()
    }

    fn prune_range(&mut self, from: &Key, to: &Key) -> Result<bool> {
        self.record(format!(
            "prune_range {}..{}",
            String::from_utf8_lossy(from.encoded_bytes()),
            String::from_utf8_lossy(to.encoded_bytes())
        ));
        self.prune_page_now()
    }

    fn prune_page(&mut self, _page: PageAddress, _consequent: &mut Vec<CleanupAction>) -> Result<bool> {
        self.prune_page_now()
    }

    fn prune_left_edge_value(&mut self, _page: PageAddress, _consequent: &mut Vec<CleanupAction>) -> Result<bool> {
        Ok(false)
    }

    fn fix_index_hole(&mut self, _page: PageAddress, _level: u32) -> Result<()> {
        Ok(())
    }
}

/// Hands out [`LeafTree`] exchanges, one page per tree name.
pub struct LeafProvider {
    pages: Mutex<HashMap<String, Arc<Mutex<Buffer>>>>,
    index: Arc<dyn TransactionIndex>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl LeafProvider {
    pub fn new(index: Arc<dyn TransactionIndex>) -> Self {
        Self {
            pages: Mutex::new(HashMap::new()),
            index,
            log: Arc::default(),
        }
    }

    /// Installs `page` as the contents of tree `name`.
    pub fn insert(&self, name: &str, page: Buffer) -> Arc<Mutex<Buffer>> {
        let page = Arc::new(Mutex::new(page));
        self.pages.lock().unwrap().insert(name.to_string(), page.clone());
        page
    }

    pub fn page(&self, name: &str) -> Option<Arc<Mutex<Buffer>>> {
        self.pages.lock().unwrap().get(name).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl ExchangeProvider for LeafProvider {
    fn exchange(&self, tree: &TreeDescriptor, create: bool) -> Result<Option<Box<dyn TreeExchange>>> {
        let mut pages = self.pages.lock().map_err(|_| Error::LockPoisoned {
            lock_name: "leaf_provider".to_string(),
        })?;
        let page = match pages.get(&tree.tree_name) {
            Some(page) => page.clone(),
            None if create => {
                let page = Arc::new(Mutex::new(data_page(PAGE_SIZE, 1)));
                pages.insert(tree.tree_name.clone(), page.clone());
                page
            }
            None => return Ok(None),
        };
        Ok(Some(Box::new(LeafTree {
            tree: tree.clone(),
            page,
            index: self.index.clone(),
            log: self.log.clone(),
        })))
    }
}
