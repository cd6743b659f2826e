use crate::core::constants::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Journal address of a page version that may no longer be read.
pub const INVALID_JOURNAL_ADDRESS: JournalAddress = u64::MAX;

/// Identity of a page in the page map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageKey {
    pub volume_handle: u32,
    pub page_address: PageAddress,
}

/// One journaled version of a page.
///
/// Older versions of the same page live behind it in a [`PageChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageNode {
    pub volume_handle: u32,
    pub page_address: PageAddress,
    pub journal_address: JournalAddress,
    pub timestamp: u64,
}

impl PageNode {
    pub fn new(volume_handle: u32, page_address: PageAddress, journal_address: JournalAddress, timestamp: u64) -> Self {
        Self {
            volume_handle,
            page_address,
            journal_address,
            timestamp,
        }
    }

    pub fn key(&self) -> PageKey {
        PageKey {
            volume_handle: self.volume_handle,
            page_address: self.page_address,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.journal_address == INVALID_JOURNAL_ADDRESS
    }

    pub fn invalidate(&mut self) {
        self.journal_address = INVALID_JOURNAL_ADDRESS;
    }

    /// Order in which page images are read back from the journal: invalid
    /// nodes first, then by journal address.
    pub fn read_order(a: &PageNode, b: &PageNode) -> Ordering {
        match (a.is_invalid(), b.is_invalid()) {
            (false, false) => a.journal_address.cmp(&b.journal_address),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (true, true) => a.key().cmp(&b.key()),
        }
    }

    /// Order in which page images are written to volumes.
    pub fn write_order(a: &PageNode, b: &PageNode) -> Ordering {
        a.key().cmp(&b.key())
    }
}

impl fmt::Display for PageNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "[{}]{}@invalid{{{}}}", self.volume_handle, self.page_address, self.timestamp)
        } else {
            write!(
                f,
                "[{}]{}@{}{{{}}}",
                self.volume_handle, self.page_address, self.journal_address, self.timestamp
            )
        }
    }
}

/// Versions of one page, newest first. Timestamps never increase along the
/// chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageChain {
    versions: Vec<PageNode>,
}

impl PageChain {
    pub fn new(node: PageNode) -> Self {
        Self { versions: vec![node] }
    }

    pub fn current(&self) -> Option<&PageNode> {
        self.versions.first()
    }

    pub fn current_mut(&mut self) -> Option<&mut PageNode> {
        self.versions.first_mut()
    }

    pub fn versions(&self) -> &[PageNode] {
        &self.versions
    }

    pub fn versions_mut(&mut self) -> &mut [PageNode] {
        &mut self.versions
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Makes `node` the current version. When `replace_current` is set the
    /// old current version is dropped instead of kept as history.
    pub fn push(&mut self, node: PageNode, replace_current: bool) {
        if replace_current && !self.versions.is_empty() {
            self.versions[0] = node;
        } else {
            self.versions.insert(0, node);
        }
    }

    /// Inserts a version recovered out of order, keeping the chain sorted by
    /// timestamp. Returns false if a version at the same journal address is
    /// already present.
    pub fn merge(&mut self, node: PageNode) -> bool {
        if self.versions.iter().any(|n| n.journal_address == node.journal_address) {
            return false;
        }
        let at = self
            .versions
            .iter()
            .position(|n| n.timestamp < node.timestamp || (n.timestamp == node.timestamp && n.journal_address < node.journal_address))
            .unwrap_or(self.versions.len());
        self.versions.insert(at, node);
        true
    }

    /// Drops every version older than the one at `index`.
    pub fn remove_history_after(&mut self, index: usize) {
        self.versions.truncate(index + 1);
    }

    /// Drops versions written to the journal below `address`.
    pub fn remove_below(&mut self, address: JournalAddress) {
        self.versions.retain(|n| n.journal_address >= address);
    }

    pub fn position_of(&self, journal_address: JournalAddress) -> Option<usize> {
        self.versions.iter().position(|n| n.journal_address == journal_address)
    }
}

/// Status of one transaction in the live transaction map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMapItem {
    pub start_timestamp: u64,
    pub start_address: JournalAddress,
    /// `UNCOMMITTED`, `ABORTED` or the commit timestamp.
    pub commit_timestamp: u64,
    pub last_record_address: JournalAddress,
}

impl TransactionMapItem {
    pub fn new(start_timestamp: u64, address: JournalAddress) -> Self {
        Self {
            start_timestamp,
            start_address: address,
            commit_timestamp: UNCOMMITTED,
            last_record_address: address,
        }
    }

    pub fn is_committed(&self) -> bool {
        self.commit_timestamp != UNCOMMITTED && self.commit_timestamp != ABORTED
    }

    pub fn is_aborted(&self) -> bool {
        self.commit_timestamp == ABORTED
    }

    /// Order used when replaying several transactions: by last record
    /// address, which approximates journal order.
    pub fn replay_order(a: &TransactionMapItem, b: &TransactionMapItem) -> Ordering {
        a.last_record_address.cmp(&b.last_record_address)
    }
}

impl Ord for TransactionMapItem {
    /// Committed transactions sort after uncommitted ones, in commit order.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_committed(), other.is_committed()) {
            (true, true) => self.commit_timestamp.cmp(&other.commit_timestamp),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => self.start_timestamp.cmp(&other.start_timestamp),
        }
        .then(self.start_timestamp.cmp(&other.start_timestamp))
        .then(self.commit_timestamp.cmp(&other.commit_timestamp))
        .then(self.start_address.cmp(&other.start_address))
        .then(self.last_record_address.cmp(&other.last_record_address))
    }
}

impl PartialOrd for TransactionMapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TransactionMapItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_committed() {
            "c"
        } else if self.is_aborted() {
            "a"
        } else {
            "u"
        };
        write!(f, "TStatus {}{{{}}}{}", self.start_address, self.commit_timestamp, state)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeDescriptor {
    pub volume_handle: u32,
    pub tree_name: String,
}

impl TreeDescriptor {
    pub fn new(volume_handle: u32, tree_name: &str) -> Self {
        Self {
            volume_handle,
            tree_name: tree_name.to_string(),
        }
    }
}

impl fmt::Display for TreeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.volume_handle, self.tree_name)
    }
}

/// A point in time at which every page version and every committed
/// transaction with an earlier timestamp is recoverable from the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: u64,
    pub system_time_millis: u64,
}

impl Checkpoint {
    pub fn new(timestamp: u64, system_time_millis: u64) -> Self {
        Self {
            timestamp,
            system_time_millis,
        }
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_push_and_replace() {
        let mut chain = PageChain::new(PageNode::new(1, 5, 100, 10));
        chain.push(PageNode::new(1, 5, 200, 20), false);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.current().unwrap().journal_address, 200);

        chain.push(PageNode::new(1, 5, 300, 30), true);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.versions()[0].journal_address, 300);
        assert_eq!(chain.versions()[1].journal_address, 100);

        chain.remove_history_after(0);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_chain_merge_keeps_timestamp_order() {
        let mut chain = PageChain::new(PageNode::new(1, 5, 300, 30));
        assert!(chain.merge(PageNode::new(1, 5, 100, 10)));
        assert!(chain.merge(PageNode::new(1, 5, 400, 40)));
        assert!(!chain.merge(PageNode::new(1, 5, 100, 10)));
        let ts: Vec<u64> = chain.versions().iter().map(|n| n.timestamp).collect();
        assert_eq!(ts, vec![40, 30, 10]);
    }

    #[test]
    fn test_read_order_puts_invalid_first() {
        let mut a = PageNode::new(1, 9, 50, 1);
        let b = PageNode::new(1, 2, 10, 1);
        assert_eq!(PageNode::read_order(&a, &b), Ordering::Greater);
        a.invalidate();
        assert_eq!(PageNode::read_order(&a, &b), Ordering::Less);
        assert_eq!(PageNode::write_order(&a, &b), Ordering::Greater);
    }

    #[test]
    fn test_transaction_item_ordering() {
        let mut committed = TransactionMapItem::new(10, 1000);
        committed.commit_timestamp = 15;
        let running = TransactionMapItem::new(20, 2000);
        let mut aborted = TransactionMapItem::new(5, 500);
        aborted.commit_timestamp = ABORTED;
        assert!(running > aborted);
        assert!(committed > running);
        assert!(aborted.is_aborted() && !aborted.is_committed());
    }
}
