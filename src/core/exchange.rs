//! Tree access used by transaction replay and deferred cleanup.
//!
//! The B-tree itself lives above this crate. Replay and cleanup reach it
//! only through these traits, one [`TreeExchange`] per tree.

use crate::core::cleanup::CleanupAction;
use crate::core::constants::PageAddress;
use crate::core::errors::*;
use crate::core::key::Key;
use crate::core::page_node::TreeDescriptor;

/// Cursor over one tree.
pub trait TreeExchange: Send {
    fn tree(&self) -> &TreeDescriptor;

    fn store(&mut self, key: &Key, value: &[u8]) -> Result<()>;

    /// Removes `[from, to)`. Returns true if anything was removed.
    fn remove_key_range(&mut self, from: &Key, to: &Key) -> Result<bool>;

    fn remove_tree(&mut self) -> Result<()>;

    /// Prunes MVVs on the page holding `key`.
    fn prune(&mut self, key: &Key) -> Result<bool>;

    /// Prunes MVVs on every page intersecting `[from, to)`. May fail with
    /// [`Error::Rebalance`] when removing collapsed records would require a
    /// rebalance the tree cannot perform.
    fn prune_range(&mut self, from: &Key, to: &Key) -> Result<bool>;

    /// Prunes one page by address. Follow-up work goes into `consequent`.
    fn prune_page(&mut self, page: PageAddress, consequent: &mut Vec<CleanupAction>) -> Result<bool>;

    /// Removes an anti-value left at the first key of `page`, adjusting the
    /// index above it.
    fn prune_left_edge_value(&mut self, page: PageAddress, consequent: &mut Vec<CleanupAction>) -> Result<bool>;

    /// Repairs an index level that lost its pointer to `page`.
    fn fix_index_hole(&mut self, page: PageAddress, level: u32) -> Result<()>;

    /// Applies an accumulator delta.
    fn delta(&mut self, _index: u16, _accumulator_type: u16, _value: i64) -> Result<()> {
        Ok(())
    }

    /// True if the tree existed at the version `version_handle` belongs to.
    fn has_version(&self, _version_handle: u64) -> bool {
        true
    }
}

pub trait ExchangeProvider: Send + Sync {
    /// Opens a cursor over `tree`. Returns `None` when the tree does not
    /// exist and `create` is false.
    fn exchange(&self, tree: &TreeDescriptor, create: bool) -> Result<Option<Box<dyn TreeExchange>>>;
}
