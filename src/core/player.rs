//! Replays the updates of one journaled transaction through a listener.
//!
//! A transaction may span several TX records linked by backchain addresses,
//! newest first. The player walks the chain back to the first record, then
//! dispatches every update in journal order.

use crate::core::alert::{AlertLevel, AlertMonitor, Event, MISSING_VOLUME_CATEGORY};
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::exchange::{ExchangeProvider, TreeExchange};
use crate::core::journal_record::{at_address, decode_updates, TransactionHeader, Update, TX_OVERHEAD};
use crate::core::key::Key;
use crate::core::page_node::{TransactionMapItem, TreeDescriptor};
use crate::core::transaction_index::{TransactionIndex, TransactionStatus};
use crate::core::volume::Volume;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Receives the updates of a replayed transaction.
pub trait TransactionPlayerListener {
    fn start_transaction(&mut self, address: JournalAddress, start_timestamp: u64, commit_timestamp: u64) -> Result<()>;

    fn store(
        &mut self,
        address: JournalAddress,
        timestamp: u64,
        exchange: &mut dyn TreeExchange,
        key: &Key,
        value: &[u8],
    ) -> Result<()>;

    fn remove_key_range(
        &mut self,
        address: JournalAddress,
        timestamp: u64,
        exchange: &mut dyn TreeExchange,
        from: &Key,
        to: &Key,
    ) -> Result<()>;

    fn remove_tree(&mut self, address: JournalAddress, timestamp: u64, exchange: &mut dyn TreeExchange) -> Result<()>;

    /// D0 records pass the commit timestamp, D1 records the start timestamp.
    fn delta(
        &mut self,
        address: JournalAddress,
        timestamp: u64,
        exchange: &mut dyn TreeExchange,
        index: u16,
        accumulator_type: u16,
        value: i64,
    ) -> Result<()>;

    fn end_transaction(&mut self, address: JournalAddress, timestamp: u64) -> Result<()>;

    /// Whether a tree named by an update may be created if it is missing.
    fn create_tree(&self, timestamp: u64) -> bool;
}

/// What the player needs from the journal.
pub trait TransactionPlayerSupport {
    /// Reads `size` bytes at `address`.
    fn read_journal(&self, address: JournalAddress, size: usize) -> Result<Vec<u8>>;

    fn tree_for_handle(&self, handle: u32) -> Option<TreeDescriptor>;

    /// Fails with [`Error::VolumeNotFound`] or [`Error::MissingVolume`] when
    /// the volume cannot be reached.
    fn volume_for_handle(&self, handle: u32) -> Result<Arc<dyn Volume>>;

    fn exchange_provider(&self) -> Option<Arc<dyn ExchangeProvider>>;

    fn ignore_missing_volumes(&self) -> bool;

    fn alert_monitor(&self) -> Option<&AlertMonitor> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlayerStats {
    pub applied: u64,
    pub ignored: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
pub struct TransactionPlayer {
    applied: AtomicU64,
    ignored: AtomicU64,
    failed: AtomicU64,
}

impl TransactionPlayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> PlayerStats {
        PlayerStats {
            applied: self.applied.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Replays every update of `item`'s transaction through `listener`.
    pub fn apply_transaction(
        &self,
        support: &dyn TransactionPlayerSupport,
        item: &TransactionMapItem,
        listener: &mut dyn TransactionPlayerListener,
    ) -> Result<()> {
        let mut chained = Vec::new();
        let mut address = item.last_record_address;
        let first = loop {
            let header = Self::read_header(support, address)?;
            if header.start_timestamp != item.start_timestamp {
                return Err(Error::corrupt_journal(
                    address,
                    format!("transaction record has invalid start timestamp {}", header.start_timestamp),
                ));
            }
            if header.backchain_address == 0 {
                if address != item.start_address {
                    return Err(Error::corrupt_journal(
                        address,
                        format!("transaction record does not match start address {}", item.start_address),
                    ));
                }
                break header;
            }
            chained.insert(0, address);
            address = header.backchain_address;
        };

        listener.start_transaction(address, first.start_timestamp, first.commit_timestamp)?;
        let commit = if item.is_committed() { item.commit_timestamp } else { first.commit_timestamp };
        self.apply_updates(support, address, first.length, first.start_timestamp, commit, listener)?;
        for continuation in chained {
            address = continuation;
            let header = Self::read_header(support, address)?;
            self.apply_updates(support, address, header.length, first.start_timestamp, commit, listener)?;
        }
        listener.end_transaction(address, first.start_timestamp)
    }

    fn read_header(support: &dyn TransactionPlayerSupport, address: JournalAddress) -> Result<TransactionHeader> {
        let bytes = support.read_journal(address, TX_OVERHEAD)?;
        let header = TransactionHeader::decode(&bytes).map_err(|e| at_address(e, address))?;
        if header.length < TX_OVERHEAD || header.length > TRANSACTION_BUFFER_SIZE + TX_OVERHEAD {
            return Err(Error::corrupt_journal(
                address,
                format!("transaction record has invalid length {}", header.length),
            ));
        }
        Ok(header)
    }

    fn apply_updates(
        &self,
        support: &dyn TransactionPlayerSupport,
        address: JournalAddress,
        length: usize,
        start: u64,
        commit: u64,
        listener: &mut dyn TransactionPlayerListener,
    ) -> Result<()> {
        let record = support.read_journal(address, length)?;
        if record.len() < length {
            return Err(Error::corrupt_journal(address, "transaction record is truncated"));
        }
        let updates = decode_updates(&record[TX_OVERHEAD..length]).map_err(|e| at_address(e, address))?;
        for update in updates {
            match self.apply_update(support, address, start, commit, &update, listener) {
                Ok(()) => {}
                Err(e @ (Error::MissingVolume { .. } | Error::VolumeNotFound { .. })) => {
                    if support.ignore_missing_volumes() {
                        let message = format!("update at {} skipped: {}", address, e);
                        match support.alert_monitor() {
                            Some(alerts) => alerts.post(Event::new(AlertLevel::Warn, message), MISSING_VOLUME_CATEGORY),
                            None => tracing::warn!(address, start, error = %e, "update for missing volume skipped"),
                        }
                        self.ignored.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        return Err(e);
                    }
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn apply_update(
        &self,
        support: &dyn TransactionPlayerSupport,
        address: JournalAddress,
        start: u64,
        commit: u64,
        update: &Update,
        listener: &mut dyn TransactionPlayerListener,
    ) -> Result<()> {
        let exchange = Self::exchange(support, update.tree_handle(), address, start, listener)?;
        match (update, exchange) {
            (Update::Store { key, value, .. }, Some(mut exchange)) => {
                let key = Key::from_bytes(key)?;
                listener.store(address, start, exchange.as_mut(), &key, value)?;
            }
            (Update::RemoveRange { key1, key2, .. }, Some(mut exchange)) => {
                let from = Key::from_bytes(key1)?;
                let to = Key::from_bytes(key2)?;
                listener.remove_key_range(address, start, exchange.as_mut(), &from, &to)?;
            }
            (Update::RemoveTree { .. }, Some(mut exchange)) => {
                listener.remove_tree(address, start, exchange.as_mut())?;
            }
            (Update::DeltaOne { index, accumulator_type, .. }, Some(mut exchange)) => {
                listener.delta(address, commit, exchange.as_mut(), *index, *accumulator_type, 1)?;
            }
            (Update::Delta { index, accumulator_type, value, .. }, Some(mut exchange)) => {
                listener.delta(address, start, exchange.as_mut(), *index, *accumulator_type, *value)?;
            }
            // A delta against a tree that no longer exists is not counted
            (Update::DeltaOne { .. }, None) => return Ok(()),
            (_, None) => {}
        }
        self.applied.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn exchange(
        support: &dyn TransactionPlayerSupport,
        tree_handle: u32,
        address: JournalAddress,
        timestamp: u64,
        listener: &dyn TransactionPlayerListener,
    ) -> Result<Option<Box<dyn TreeExchange>>> {
        let tree = support
            .tree_for_handle(tree_handle)
            .ok_or_else(|| Error::corrupt_journal(address, format!("tree handle {} is undefined", tree_handle)))?;
        support.volume_for_handle(tree.volume_handle)?;
        match support.exchange_provider() {
            Some(provider) => provider.exchange(&tree, listener.create_tree(timestamp)),
            None => Ok(None),
        }
    }
}

/// Physically removes the versions written by an aborted transaction.
pub struct ProactiveRollbackListener {
    index: Arc<dyn TransactionIndex>,
    status: Option<Arc<TransactionStatus>>,
}

impl ProactiveRollbackListener {
    pub fn new(index: Arc<dyn TransactionIndex>) -> Self {
        Self { index, status: None }
    }
}

impl TransactionPlayerListener for ProactiveRollbackListener {
    fn start_transaction(&mut self, _address: JournalAddress, start_timestamp: u64, _commit_timestamp: u64) -> Result<()> {
        self.status = self.index.status(start_timestamp);
        Ok(())
    }

    fn store(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        exchange: &mut dyn TreeExchange,
        key: &Key,
        _value: &[u8],
    ) -> Result<()> {
        exchange.prune(key)?;
        Ok(())
    }

    fn remove_key_range(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        exchange: &mut dyn TreeExchange,
        from: &Key,
        to: &Key,
    ) -> Result<()> {
        match exchange.prune_range(from, to) {
            Ok(_) | Err(Error::Rebalance) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn remove_tree(&mut self, _address: JournalAddress, _timestamp: u64, _exchange: &mut dyn TreeExchange) -> Result<()> {
        Ok(())
    }

    fn delta(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        _exchange: &mut dyn TreeExchange,
        _index: u16,
        _accumulator_type: u16,
        _value: i64,
    ) -> Result<()> {
        Ok(())
    }

    fn end_transaction(&mut self, address: JournalAddress, timestamp: u64) -> Result<()> {
        if let Some(status) = self.status.take() {
            if status.mvv_count() > 0 {
                tracing::warn!(
                    address,
                    start = timestamp,
                    mvv_count = status.mvv_count(),
                    "pruning incomplete for aborted transaction"
                );
            }
        }
        Ok(())
    }

    fn create_tree(&self, _timestamp: u64) -> bool {
        false
    }
}

/// Compacts the obsolete versions left by a transaction that committed
/// before the last checkpoint. Only range removals leave such versions.
#[derive(Debug, Default)]
pub struct PruneCommittedListener;

impl TransactionPlayerListener for PruneCommittedListener {
    fn start_transaction(&mut self, _address: JournalAddress, _start: u64, _commit: u64) -> Result<()> {
        Ok(())
    }

    fn store(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        _exchange: &mut dyn TreeExchange,
        _key: &Key,
        _value: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    fn remove_key_range(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        exchange: &mut dyn TreeExchange,
        from: &Key,
        to: &Key,
    ) -> Result<()> {
        match exchange.prune_range(from, to) {
            Ok(_) | Err(Error::Rebalance) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn remove_tree(&mut self, _address: JournalAddress, _timestamp: u64, _exchange: &mut dyn TreeExchange) -> Result<()> {
        Ok(())
    }

    fn delta(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        _exchange: &mut dyn TreeExchange,
        _index: u16,
        _accumulator_type: u16,
        _value: i64,
    ) -> Result<()> {
        Ok(())
    }

    fn end_transaction(&mut self, _address: JournalAddress, _timestamp: u64) -> Result<()> {
        Ok(())
    }

    fn create_tree(&self, _timestamp: u64) -> bool {
        false
    }
}

/// Re-applies the updates of a transaction that committed after the last
/// valid checkpoint.
#[derive(Debug, Default)]
pub struct ReplayListener {
    transactions: u64,
}

impl ReplayListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transactions(&self) -> u64 {
        self.transactions
    }
}

impl TransactionPlayerListener for ReplayListener {
    fn start_transaction(&mut self, _address: JournalAddress, _start: u64, _commit: u64) -> Result<()> {
        Ok(())
    }

    fn store(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        exchange: &mut dyn TreeExchange,
        key: &Key,
        value: &[u8],
    ) -> Result<()> {
        exchange.store(key, value)
    }

    fn remove_key_range(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        exchange: &mut dyn TreeExchange,
        from: &Key,
        to: &Key,
    ) -> Result<()> {
        exchange.remove_key_range(from, to)?;
        Ok(())
    }

    fn remove_tree(&mut self, _address: JournalAddress, _timestamp: u64, exchange: &mut dyn TreeExchange) -> Result<()> {
        exchange.remove_tree()
    }

    fn delta(
        &mut self,
        _address: JournalAddress,
        _timestamp: u64,
        exchange: &mut dyn TreeExchange,
        index: u16,
        accumulator_type: u16,
        value: i64,
    ) -> Result<()> {
        exchange.delta(index, accumulator_type, value)
    }

    fn end_transaction(&mut self, _address: JournalAddress, _timestamp: u64) -> Result<()> {
        self.transactions += 1;
        Ok(())
    }

    fn create_tree(&self, _timestamp: u64) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cleanup::CleanupAction;
    use crate::core::journal_record::{encode_transaction, encode_updates};
    use crate::core::volume::MemoryVolume;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Calls = Arc<Mutex<Vec<String>>>;

    struct RecordingExchange {
        tree: TreeDescriptor,
        calls: Calls,
    }

    impl TreeExchange for RecordingExchange {
        fn tree(&self) -> &TreeDescriptor {
            &self.tree
        }
        fn store(&mut self, key: &Key, value: &[u8]) -> Result<()> {
            self.calls.lock().unwrap().push(format!("store {:?}={:?}", key.encoded_bytes(), value));
            Ok(())
        }
        fn remove_key_range(&mut self, from: &Key, to: &Key) -> Result<bool> {
            self.calls.lock().unwrap().push(format!("remove {:?}..{:?}", from.encoded_bytes(), to.encoded_bytes()));
            Ok(true)
        }
        fn remove_tree(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("remove_tree".to_string());
            Ok(())
        }
        fn prune(&mut self, key: &Key) -> Result<bool> {
            self.calls.lock().unwrap().push(format!("prune {:?}", key.encoded_bytes()));
            Ok(true)
        }
        fn prune_range(&mut self, _from: &Key, _to: &Key) -> Result<bool> {
            self.calls.lock().unwrap().push("prune_range".to_string());
            Err(Error::Rebalance)
        }
        fn prune_page(&mut self, _page: PageAddress, _consequent: &mut Vec<CleanupAction>) -> Result<bool> {
            Ok(false)
        }
        fn prune_left_edge_value(&mut self, _page: PageAddress, _consequent: &mut Vec<CleanupAction>) -> Result<bool> {
            Ok(false)
        }
        fn fix_index_hole(&mut self, _page: PageAddress, _level: u32) -> Result<()> {
            Ok(())
        }
        fn delta(&mut self, index: u16, _accumulator_type: u16, value: i64) -> Result<()> {
            self.calls.lock().unwrap().push(format!("delta {} {}", index, value));
            Ok(())
        }
    }

    struct Provider {
        calls: Calls,
    }

    impl ExchangeProvider for Provider {
        fn exchange(&self, tree: &TreeDescriptor, _create: bool) -> Result<Option<Box<dyn TreeExchange>>> {
            if tree.tree_name == "gone" {
                return Ok(None);
            }
            Ok(Some(Box::new(RecordingExchange {
                tree: tree.clone(),
                calls: self.calls.clone(),
            })))
        }
    }

    /// Journal held in memory: records keyed by address.
    struct Support {
        records: HashMap<JournalAddress, Vec<u8>>,
        trees: HashMap<u32, TreeDescriptor>,
        volume: Option<Arc<dyn Volume>>,
        ignore_missing: bool,
        provider: Arc<Provider>,
        alerts: AlertMonitor,
    }

    impl Support {
        fn new(calls: Calls) -> Self {
            let volume: Arc<dyn Volume> = Arc::new(MemoryVolume::new("data", 1, 1024).unwrap());
            let mut trees = HashMap::new();
            trees.insert(7, TreeDescriptor::new(1, "accounts"));
            trees.insert(8, TreeDescriptor::new(1, "gone"));
            Self {
                records: HashMap::new(),
                trees,
                volume: Some(volume),
                ignore_missing: false,
                provider: Arc::new(Provider { calls }),
                alerts: AlertMonitor::new(),
            }
        }

        fn put(&mut self, address: JournalAddress, start: u64, commit: u64, backchain: JournalAddress, updates: &[Update]) {
            let mut record = Vec::new();
            encode_transaction(&mut record, start, commit, backchain, &encode_updates(updates));
            self.records.insert(address, record);
        }
    }

    impl TransactionPlayerSupport for Support {
        fn read_journal(&self, address: JournalAddress, size: usize) -> Result<Vec<u8>> {
            let record = self
                .records
                .get(&address)
                .ok_or_else(|| Error::corrupt_journal(address, "no record"))?;
            Ok(record[..size.min(record.len())].to_vec())
        }
        fn tree_for_handle(&self, handle: u32) -> Option<TreeDescriptor> {
            self.trees.get(&handle).cloned()
        }
        fn volume_for_handle(&self, _handle: u32) -> Result<Arc<dyn Volume>> {
            self.volume.clone().ok_or_else(|| Error::MissingVolume { name: "data".to_string() })
        }
        fn exchange_provider(&self) -> Option<Arc<dyn ExchangeProvider>> {
            Some(self.provider.clone())
        }
        fn ignore_missing_volumes(&self) -> bool {
            self.ignore_missing
        }
        fn alert_monitor(&self) -> Option<&AlertMonitor> {
            Some(&self.alerts)
        }
    }

    fn store(key: &[u8], value: &[u8]) -> Update {
        Update::Store { tree_handle: 7, key: key.to_vec(), value: value.to_vec() }
    }

    fn item(start: u64, start_address: JournalAddress, last: JournalAddress, commit: u64) -> TransactionMapItem {
        TransactionMapItem {
            start_timestamp: start,
            start_address,
            commit_timestamp: commit,
            last_record_address: last,
        }
    }

    #[test]
    fn test_chain_replays_in_journal_order() {
        let calls: Calls = Arc::default();
        let mut support = Support::new(calls.clone());
        support.put(100, 10, UNCOMMITTED, 0, &[store(b"a", b"1")]);
        support.put(300, 10, UNCOMMITTED, 100, &[store(b"b", b"2")]);
        support.put(
            500,
            10,
            20,
            300,
            &[
                Update::Delta { tree_handle: 7, index: 2, accumulator_type: 0, value: 5 },
                Update::RemoveTree { tree_handle: 7 },
            ],
        );

        let player = TransactionPlayer::new();
        let mut listener = ReplayListener::new();
        player.apply_transaction(&support, &item(10, 100, 500, 20), &mut listener).unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "store [97]=[49]".to_string(),
                "store [98]=[50]".to_string(),
                "delta 2 5".to_string(),
                "remove_tree".to_string(),
            ]
        );
        assert_eq!(listener.transactions(), 1);
        assert_eq!(player.stats(), PlayerStats { applied: 4, ignored: 0, failed: 0 });
    }

    #[test]
    fn test_wrong_start_address_is_corrupt() {
        let calls: Calls = Arc::default();
        let mut support = Support::new(calls);
        support.put(100, 10, 20, 0, &[store(b"a", b"1")]);
        let player = TransactionPlayer::new();
        let err = player
            .apply_transaction(&support, &item(10, 50, 100, 20), &mut ReplayListener::new())
            .unwrap_err();
        assert!(matches!(err, Error::CorruptJournal { address: 100, .. }));

        let err = player
            .apply_transaction(&support, &item(11, 100, 100, 20), &mut ReplayListener::new())
            .unwrap_err();
        assert!(matches!(err, Error::CorruptJournal { .. }));
    }

    #[test]
    fn test_unknown_tree_handle_is_corrupt() {
        let calls: Calls = Arc::default();
        let mut support = Support::new(calls);
        support.put(100, 10, 20, 0, &[Update::RemoveTree { tree_handle: 99 }]);
        let player = TransactionPlayer::new();
        let err = player
            .apply_transaction(&support, &item(10, 100, 100, 20), &mut ReplayListener::new())
            .unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(player.stats().failed, 1);
    }

    #[test]
    fn test_missing_volume_skipped_when_ignored() {
        let calls: Calls = Arc::default();
        let mut support = Support::new(calls.clone());
        support.volume = None;
        support.put(100, 10, 20, 0, &[store(b"a", b"1"), store(b"b", b"2")]);
        let player = TransactionPlayer::new();

        let err = player
            .apply_transaction(&support, &item(10, 100, 100, 20), &mut ReplayListener::new())
            .unwrap_err();
        assert!(matches!(err, Error::MissingVolume { .. }));
        assert_eq!(player.stats().failed, 1);

        support.ignore_missing = true;
        player
            .apply_transaction(&support, &item(10, 100, 100, 20), &mut ReplayListener::new())
            .unwrap();
        assert_eq!(player.stats().ignored, 2);
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(support.alerts.history(MISSING_VOLUME_CATEGORY).unwrap().count, 2);
    }

    #[test]
    fn test_missing_tree_counts_all_but_delta_one() {
        let calls: Calls = Arc::default();
        let mut support = Support::new(calls.clone());
        support.put(
            100,
            10,
            20,
            0,
            &[
                Update::Store { tree_handle: 8, key: b"k".to_vec(), value: b"v".to_vec() },
                Update::DeltaOne { tree_handle: 8, index: 0, accumulator_type: 0 },
            ],
        );
        let player = TransactionPlayer::new();
        player
            .apply_transaction(&support, &item(10, 100, 100, 20), &mut ReplayListener::new())
            .unwrap();
        assert_eq!(player.stats().applied, 1);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_rollback_listener_prunes_and_ignores_rebalance() {
        let calls: Calls = Arc::default();
        let mut support = Support::new(calls.clone());
        support.put(
            100,
            10,
            ABORTED,
            0,
            &[
                store(b"a", b"1"),
                Update::RemoveRange { tree_handle: 7, key1: b"b".to_vec(), key2: b"c".to_vec() },
            ],
        );
        let index = Arc::new(crate::core::transaction_index::MemoryTransactionIndex::new());
        index.begin(10).unwrap();
        let mut listener = ProactiveRollbackListener::new(index);
        TransactionPlayer::new()
            .apply_transaction(&support, &item(10, 100, 100, ABORTED), &mut listener)
            .unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["prune [97]".to_string(), "prune_range".to_string()]);
    }
}
