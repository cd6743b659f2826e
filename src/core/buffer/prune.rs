use super::*;
use crate::core::cleanup::{CleanupAction, CleanupManager};
use crate::core::mvv::PrunedVersion;
use crate::core::transaction_index::{vh_to_ts, TransactionIndex};
use crate::core::value::is_long_mvv;
use std::time::{SystemTime, UNIX_EPOCH};

/// Inputs to a prune pass over one data page.
pub struct PruneContext<'a> {
    pub index: &'a dyn TransactionIndex,
    /// Handle of the owning tree. Temporary trees have none, so anti-values
    /// at the left edge of their pages are left alone.
    pub tree_handle: Option<u32>,
    /// Also prune MVVs stored as long records.
    pub prune_long: bool,
    /// When set, follow-up work is collected here instead of being offered
    /// to `cleanup`.
    pub cleanup_actions: Option<&'a mut Vec<CleanupAction>>,
    pub cleanup: Option<&'a CleanupManager>,
    /// Timestamp the page is dirtied at if anything changes.
    pub timestamp: u64,
}

impl<'a> PruneContext<'a> {
    pub fn new(index: &'a dyn TransactionIndex, timestamp: u64) -> Self {
        Self {
            index,
            tree_handle: None,
            prune_long: false,
            cleanup_actions: None,
            cleanup: None,
            timestamp,
        }
    }

    pub fn tree(mut self, tree_handle: u32) -> Self {
        self.tree_handle = Some(tree_handle);
        self
    }

    pub fn prune_long(mut self, prune_long: bool) -> Self {
        self.prune_long = prune_long;
        self
    }

    pub fn collect_into(mut self, actions: &'a mut Vec<CleanupAction>) -> Self {
        self.cleanup_actions = Some(actions);
        self
    }

    pub fn cleanup_manager(mut self, cleanup: &'a CleanupManager) -> Self {
        self.cleanup = Some(cleanup);
        self
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Buffer {
    /// Removes MVV versions no active transaction can see and drops records
    /// that have collapsed to anti-values. Returns true if the page changed.
    ///
    /// A data page whose MVV count is known to be zero is skipped. The count
    /// is rebuilt during the pass.
    pub fn prune_mvv_values(&mut self, ctx: &mut PruneContext<'_>) -> Result<bool> {
        self.check_editable("prune_mvv_values")?;
        if !self.is_data_page() || self.mvv_count.is_zero() {
            return Ok(false);
        }
        self.mvv_count = MvvCount::Exact(0);
        let (mut changed, has_long) = self.prune_mvv_values_helper(ctx)?;
        if changed {
            self.set_dirty_at_timestamp(ctx.timestamp);
        }

        if ctx.prune_long && has_long {
            let mut pruned = Vec::new();
            let mut old_chains = Vec::new();
            let mut deferred = Vec::new();

            // Long records are pruned on a copy so a failed fetch leaves the
            // page untouched.
            let mut copy = self.clone();
            let copy_changed =
                copy.prune_long_mvv_values(ctx, &mut pruned, &mut old_chains, &mut deferred)?;
            if copy_changed {
                changed = true;
                self.bytes.copy_from_slice(&copy.bytes);
                self.alloc = copy.alloc;
                self.slack = copy.slack;
                self.mvv_count = copy.mvv_count;
                self.enqueued_for_anti_value_pruning = copy.enqueued_for_anti_value_pruning;
                self.key_block_end = copy.key_block_end;
                self.invalidate();
                self.set_dirty_at_timestamp(ctx.timestamp);
                self.deallocate_pruned_versions(ctx.index, &mut pruned);
                for chain in old_chains {
                    if let Err(e) = self.source.deallocate_chain(chain) {
                        tracing::warn!(page = self.page, chain, error = %e, "failed to release long record chain");
                    }
                }
            }
            if let Some(e) = deferred.into_iter().next() {
                self.mvv_count.increment();
                return Err(e);
            }
        }

        if changed {
            self.generation += 1;
            self.assert_verify();
            tracing::trace!(page = self.page, mvv_count = ?self.mvv_count, "pruned page");
        }
        Ok(changed)
    }

    /// Offers a prune action to the cleanup manager, at most once per
    /// pruning delay.
    pub fn enqueue_pruning_action(&mut self, tree_handle: u32, cleanup: &CleanupManager) -> bool {
        if self.mvv_count.is_zero() {
            return false;
        }
        let delay = cleanup.minimum_pruning_delay_millis();
        if delay == 0 {
            return false;
        }
        let now = now_millis();
        if now.saturating_sub(self.last_prune_millis) <= delay {
            return false;
        }
        self.last_prune_millis = now;
        cleanup.offer(CleanupAction::Prune {
            tree_handle,
            page: self.page,
        })
    }

    /// Returns the flags (changed, has long MVVs).
    fn prune_mvv_values_helper(&mut self, ctx: &mut PruneContext<'_>) -> Result<(bool, bool)> {
        let mut changed = false;
        let mut has_long = false;
        let mut pruned: Vec<PrunedVersion> = Vec::new();
        let hdr = self.tail_header_size;

        let mut p = KEY_BLOCK_START;
        while p < self.key_block_end {
            let tail = decode_key_block_tail(self.get_int(p));
            let tb = self.get_int(tail);
            let klength = decode_tail_block_klength(tb);
            let old_tail_size = decode_tail_block_size(tb);
            let offset = tail + hdr + klength;
            let old_size = old_tail_size - klength - hdr;
            if old_size == 0 {
                p += KEYBLOCK_LENGTH;
                continue;
            }

            if is_long_mvv(&self.bytes[offset..offset + old_size]) {
                has_long = true;
                self.mvv_count.increment();
            }
            let mut new_size = old_size;
            if mvv::is_array_mvv(&self.bytes[offset..offset + old_size]) {
                new_size = mvv::prune(&mut self.bytes[offset..offset + old_size], ctx.index, &mut pruned)?;
                if new_size != old_size {
                    changed = true;
                    self.shrink_tail(tail, old_tail_size, klength + new_size + hdr, klength);
                }
                if mvv::is_array_mvv(&self.bytes[offset..offset + new_size]) {
                    self.mvv_count.increment();
                }
            }
            let anti_value = mvv::is_anti_value(&self.bytes[offset..offset + new_size]);

            if anti_value && self.prune_anti_value(p, ctx)? {
                changed = true;
                continue;
            }
            p += KEYBLOCK_LENGTH;
        }
        self.deallocate_pruned_versions(ctx.index, &mut pruned);
        if changed {
            self.invalidate();
        }
        Ok((changed, has_long))
    }

    fn prune_long_mvv_values(
        &mut self,
        ctx: &mut PruneContext<'_>,
        pruned: &mut Vec<PrunedVersion>,
        old_chains: &mut Vec<u64>,
        deferred: &mut Vec<Error>,
    ) -> Result<bool> {
        let mut changed = false;
        let hdr = self.tail_header_size;

        let mut p = KEY_BLOCK_START;
        while p < self.key_block_end {
            let tail = decode_key_block_tail(self.get_int(p));
            let tb = self.get_int(tail);
            let klength = decode_tail_block_klength(tb);
            let old_tail_size = decode_tail_block_size(tb);
            let offset = tail + hdr + klength;
            let old_size = old_tail_size - klength - hdr;

            let mut anti_value = false;
            if old_size > 0 && is_long_mvv(&self.bytes[offset..offset + old_size]) {
                let descriptor = self.bytes[offset..offset + old_size].to_vec();
                match self.prune_long_mvv(&descriptor, ctx.index, pruned, old_chains) {
                    Ok(Some(value)) => {
                        changed = true;
                        let new_size = value.len();
                        self.bytes[offset..offset + new_size].copy_from_slice(&value);
                        self.shrink_tail(tail, old_tail_size, klength + new_size + hdr, klength);
                        anti_value = mvv::is_anti_value(&value);
                        if !is_value_mvv(&value) {
                            self.mvv_count.decrement();
                        }
                    }
                    Ok(None) => {}
                    Err(e) => deferred.push(e),
                }
            }

            if anti_value && self.prune_anti_value(p, ctx)? {
                changed = true;
                continue;
            }
            p += KEYBLOCK_LENGTH;
        }
        if changed {
            self.invalidate();
            self.assert_verify();
        }
        Ok(changed)
    }

    /// Prunes the MVV a long-record descriptor refers to. Returns the bytes
    /// to store inline in place of the descriptor, or `None` when nothing
    /// was pruned.
    fn prune_long_mvv(
        &self,
        descriptor: &[u8],
        index: &dyn TransactionIndex,
        pruned: &mut Vec<PrunedVersion>,
        old_chains: &mut Vec<u64>,
    ) -> Result<Option<Vec<u8>>> {
        let old_chain = decode_long_record_pointer(descriptor)?;
        let mut full = self.source.fetch_long_record(descriptor)?;
        if !mvv::verify(&full) {
            return Err(Error::corrupt_page(
                old_chain,
                format!("long record on page {} is not a valid MVV", self.page),
            ));
        }
        let mut provisional = Vec::new();
        let new_len = mvv::prune(&mut full, index, &mut provisional)?;
        if new_len == full.len() {
            return Ok(None);
        }
        full.truncate(new_len);
        let replacement = if new_len > descriptor.len() {
            self.source.store_long_record(&full)?
        } else {
            full
        };
        if old_chain != 0 {
            old_chains.push(old_chain);
        }
        pruned.extend(provisional);
        Ok(Some(replacement))
    }

    /// Rewrites the header of the tail block at `tail` for a smaller value,
    /// freeing the rounded-off remainder.
    fn shrink_tail(&mut self, tail: usize, old_tail_size: usize, new_tail_size: usize, klength: usize) {
        let old_next = tail + round_up(old_tail_size);
        let new_next = tail + round_up(new_tail_size);
        if new_next < old_next {
            self.dealloc_tail(new_next, old_next - new_next);
        }
        self.put_int(tail, encode_tail_block(new_tail_size, klength));
    }

    /// Handles a record whose value is a bare anti-value. Records after the
    /// first are removed outright; returns true in that case. An anti-value
    /// at the left edge can only go once the index above is adjusted, so it
    /// is handed to the cleanup manager.
    fn prune_anti_value(&mut self, p: usize, ctx: &mut PruneContext<'_>) -> Result<bool> {
        if p != KEY_BLOCK_START {
            let at = FoundAt::new(p, 0, true, false);
            let mut spare = Key::new();
            return self.remove_keys(at, at, &mut spare);
        }
        match ctx.tree_handle {
            Some(tree_handle) => {
                let action = CleanupAction::PruneAntiValue {
                    tree_handle,
                    page: self.page,
                };
                if let Some(actions) = &mut ctx.cleanup_actions {
                    actions.push(action);
                } else if !self.enqueued_for_anti_value_pruning {
                    if let Some(cleanup) = ctx.cleanup {
                        if cleanup.offer(action) {
                            self.enqueued_for_anti_value_pruning = true;
                        }
                    }
                }
            }
            None => self.mvv_count.increment(),
        }
        Ok(false)
    }

    fn deallocate_pruned_versions(&self, index: &dyn TransactionIndex, pruned: &mut Vec<PrunedVersion>) {
        for pv in pruned.drain(..) {
            let status = index.status(vh_to_ts(pv.handle));
            if pv.aborted {
                if let Some(status) = &status {
                    if status.is_aborted() {
                        status.decrement_mvv_count();
                    }
                }
            }
            if pv.long_record_page != 0 {
                if let Err(e) = self.source.deallocate_chain(pv.long_record_page) {
                    tracing::warn!(
                        page = self.page,
                        chain = pv.long_record_page,
                        version = pv.handle,
                        error = %e,
                        "failed to release pruned long record"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cleanup::CleanupOptions;
    use crate::core::page_source::FixedPageSource;
    use crate::core::transaction_index::{ts_to_vh, MemoryTransactionIndex};
    use crate::core::value::{MvvValueWriter, RawValueWriter};

    fn data_page(source: Arc<FixedPageSource>) -> Buffer {
        let mut b = Buffer::new(1024, source).unwrap();
        b.set_page(7);
        b.init(PAGE_TYPE_DATA).unwrap();
        b
    }

    fn put_version(b: &mut Buffer, k: &str, ts: u64, v: &[u8]) {
        let key = Key::from(k);
        let found = b.find_key(&key);
        let helper = MvvValueWriter { version_handle: ts_to_vh(ts), value: v };
        b.put_value(&key, &helper, found).unwrap().unwrap();
    }

    fn value(b: &Buffer, k: &str) -> Option<Vec<u8>> {
        let found = b.find_key(&Key::from(k));
        if found.is_exact() {
            b.fetch(found).map(|v| v.to_vec())
        } else {
            None
        }
    }

    #[test]
    fn test_prune_collapses_committed_versions() {
        let index = MemoryTransactionIndex::new();
        let mut b = data_page(Arc::new(FixedPageSource::new()));
        index.begin(10).unwrap();
        put_version(&mut b, "a", 10, b"one");
        index.commit(10, 11).unwrap();
        index.begin(20).unwrap();
        put_version(&mut b, "a", 20, b"two");
        index.commit(20, 21).unwrap();
        assert_eq!(b.mvv_count(), MvvCount::Exact(1));

        let mut ctx = PruneContext::new(&index, 100);
        assert!(b.prune_mvv_values(&mut ctx).unwrap());
        assert_eq!(value(&b, "a"), Some(b"two".to_vec()));
        assert_eq!(b.mvv_count(), MvvCount::Exact(0));
        assert!(b.is_dirty());
        assert_eq!(b.timestamp(), 100);
        b.verify().unwrap();

        // Nothing left to do
        assert!(!b.prune_mvv_values(&mut ctx).unwrap());
    }

    #[test]
    fn test_prune_keeps_versions_visible_to_running_transactions() {
        let index = MemoryTransactionIndex::new();
        let mut b = data_page(Arc::new(FixedPageSource::new()));
        index.begin(10).unwrap();
        put_version(&mut b, "k", 10, b"old");
        index.commit(10, 11).unwrap();
        index.begin(15).unwrap();
        index.begin(20).unwrap();
        put_version(&mut b, "k", 20, b"new");
        index.commit(20, 21).unwrap();

        let before = value(&b, "k").unwrap();
        let mut ctx = PruneContext::new(&index, 5);
        assert!(!b.prune_mvv_values(&mut ctx).unwrap());
        assert_eq!(value(&b, "k").unwrap(), before);
        assert_eq!(b.mvv_count(), MvvCount::Exact(1));
    }

    #[test]
    fn test_aborted_removal_drops_record_and_counts_down() {
        let index = MemoryTransactionIndex::new();
        let mut b = data_page(Arc::new(FixedPageSource::new()));
        b.put_value(&Key::from("a"), &RawValueWriter(b"keep"), b.find_key(&Key::from("a")))
            .unwrap()
            .unwrap();
        let status = index.begin(30).unwrap();
        put_version(&mut b, "b", 30, b"tentative");
        status.increment_mvv_count();
        index.abort(30).unwrap();

        let mut ctx = PruneContext::new(&index, 40).tree(3);
        assert!(b.prune_mvv_values(&mut ctx).unwrap());
        assert_eq!(value(&b, "b"), None);
        assert_eq!(value(&b, "a"), Some(b"keep".to_vec()));
        assert_eq!(status.mvv_count(), 0);
        b.verify().unwrap();
    }

    #[test]
    fn test_left_edge_anti_value_becomes_cleanup_action() {
        let index = MemoryTransactionIndex::new();
        let mut b = data_page(Arc::new(FixedPageSource::new()));
        index.begin(50).unwrap();
        put_version(&mut b, "a", 50, &mvv::ANTI_VALUE);
        index.commit(50, 51).unwrap();
        b.put_value(&Key::from("b"), &RawValueWriter(b"x"), b.find_key(&Key::from("b")))
            .unwrap()
            .unwrap();

        let mut actions = Vec::new();
        let mut ctx = PruneContext::new(&index, 60).tree(9).collect_into(&mut actions);
        assert!(b.prune_mvv_values(&mut ctx).unwrap());
        assert_eq!(actions, vec![CleanupAction::PruneAntiValue { tree_handle: 9, page: 7 }]);
        assert_eq!(value(&b, "a"), Some(mvv::ANTI_VALUE.to_vec()));

        // Without a tree the page stays marked for another pass
        let mut c = data_page(Arc::new(FixedPageSource::new()));
        index.begin(70).unwrap();
        put_version(&mut c, "a", 70, &mvv::ANTI_VALUE);
        index.commit(70, 71).unwrap();
        let mut ctx = PruneContext::new(&index, 80);
        c.prune_mvv_values(&mut ctx).unwrap();
        assert!(!c.mvv_count().is_zero());
    }

    #[test]
    fn test_anti_value_offered_once_to_cleanup_manager() {
        let index = MemoryTransactionIndex::new();
        let cleanup = CleanupManager::new(CleanupOptions::default());
        let mut b = data_page(Arc::new(FixedPageSource::new()));
        index.begin(50).unwrap();
        put_version(&mut b, "a", 50, &mvv::ANTI_VALUE);
        index.commit(50, 51).unwrap();

        let mut ctx = PruneContext::new(&index, 60).tree(2).cleanup_manager(&cleanup);
        b.prune_mvv_values(&mut ctx).unwrap();
        assert_eq!(cleanup.queued(), 1);
        b.mvv_count = MvvCount::Unknown;
        b.prune_mvv_values(&mut ctx).unwrap();
        assert_eq!(cleanup.queued(), 1);
    }

    #[test]
    fn test_long_mvv_pruned_inline() {
        let index = MemoryTransactionIndex::new();
        let source = Arc::new(FixedPageSource::new());
        let mut b = data_page(source.clone());

        index.begin(10).unwrap();
        index.commit(10, 11).unwrap();
        index.begin(20).unwrap();
        index.commit(20, 21).unwrap();
        let mut full = mvv::store_version(&[], ts_to_vh(10), &[1u8; 300]).unwrap();
        full = mvv::store_version(&full, ts_to_vh(20), b"short").unwrap();
        let descriptor = source.store_long_record(&full).unwrap();
        b.put_value(&Key::from("big"), &RawValueWriter(&descriptor), b.find_key(&Key::from("big")))
            .unwrap()
            .unwrap();
        assert_eq!(source.chain_count(), 1);

        b.mvv_count = MvvCount::Unknown;
        let mut ctx = PruneContext::new(&index, 99).prune_long(true);
        assert!(b.prune_mvv_values(&mut ctx).unwrap());
        assert_eq!(value(&b, "big"), Some(b"short".to_vec()));
        assert_eq!(source.chain_count(), 0);
        assert_eq!(b.mvv_count(), MvvCount::Exact(0));
        b.verify().unwrap();
    }
}
