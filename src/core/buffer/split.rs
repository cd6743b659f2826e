use super::*;
use crate::core::policy::{JoinPolicy, RebalanceCandidate, Sequence, SplitCandidate, SplitPolicy};

/// Page that received the inserted or replaced record during a split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitSide {
    Left(FoundAt),
    Right(FoundAt),
}

impl SplitSide {
    pub fn found_at(self) -> FoundAt {
        match self {
            SplitSide::Left(f) | SplitSide::Right(f) => f,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Everything now lives in the left page; the right page is empty and
    /// unlinked from the sibling chain.
    Rejoined,
    /// Both pages still hold records; `index_key` holds the right page's new
    /// first key.
    Rebalanced,
}

struct JoinMeasure {
    min_ebc: usize,
    size: usize,
}

enum RebalancePoint {
    /// Records from this left-page offset onward move right.
    Left(usize),
    /// Records of the right page before this offset move left.
    Right(usize),
}

impl Buffer {
    /// Splits this page into itself and the empty page `right` while
    /// inserting or replacing `key`. The split point is the candidate
    /// `policy` scores highest. On return `index_key` holds the first key of
    /// the right page and the left page ends with an edge key equal to it,
    /// carrying no value. Linking the sibling chain is left to the caller.
    #[allow(clippy::too_many_arguments)]
    pub fn split(
        &mut self,
        right: &mut Buffer,
        key: &Key,
        helper: &dyn ValueHelper,
        found_at: FoundAt,
        index_key: &mut Key,
        sequence: Sequence,
        policy: &dyn SplitPolicy,
    ) -> Result<SplitSide> {
        self.check_editable("split")?;
        helper.check()?;
        if right.page_type != self.page_type || right.buffer_size != self.buffer_size {
            return Err(Error::IllegalArgument(format!(
                "split into incompatible page: {}",
                right.summarize()
            )));
        }
        if right.key_block_end != KEY_BLOCK_START || right.alloc != right.buffer_size {
            return Err(Error::IllegalArgument(format!(
                "right sibling is not empty: {}",
                right.summarize()
            )));
        }
        if key.is_empty() {
            return Err(Error::IllegalArgument("cannot store an empty key".to_string()));
        }
        self.assert_verify();
        if !self.mvv_count.is_zero() {
            right.mvv_count = MvvCount::Unknown;
        }

        let current_size = self.in_use_size();
        let found_pos = found_at.position();
        let exact = found_at.is_exact();
        let depth = found_at.depth();
        let fixup = found_at.needs_fixup();
        let hdr = self.tail_header_size;
        let key_size = key.encoded_size();
        if found_pos < KEY_BLOCK_START
            || found_pos > self.key_block_end
            || ((exact || fixup) && found_pos >= self.key_block_end)
        {
            return Err(Error::IllegalArgument(format!("{:?} outside {}", found_at, self.summarize())));
        }

        let mut ebc_new = depth;
        let mut delta_successor_ebc = 0;
        let mut delta_successor_tail = 0;
        if fixup {
            let kb = self.get_int(found_pos);
            let size = decode_tail_block_size(self.get_int(decode_key_block_tail(kb)));
            ebc_new = decode_key_block_ebc(kb);
            delta_successor_ebc = depth.saturating_sub(ebc_new);
            delta_successor_tail = round_up(size) - round_up(size - delta_successor_ebc);
        }

        let mut kb_delta = KEYBLOCK_LENGTH;
        let mut old_tail_block_size = 0;
        let value_size = if exact {
            let kb = self.get_int(found_pos);
            ebc_new = decode_key_block_ebc(kb);
            kb_delta = 0;
            old_tail_block_size = round_up(decode_tail_block_size(self.get_int(decode_key_block_tail(kb))));
            let (offset, length) = self.value_span(found_pos);
            if self.is_index_page() {
                0
            } else {
                helper.required_length(&self.bytes[offset..offset + length])
            }
        } else if self.is_index_page() {
            0
        } else {
            helper.required_length(&[])
        };
        if ebc_new >= key_size {
            return Err(Error::IllegalArgument(format!("{:?} does not fit key of length {}", found_at, key_size)));
        }

        let new_tail_block_size = round_up(value_size + hdr + key_size - ebc_new - 1);
        let virtual_size =
            (current_size + new_tail_block_size + kb_delta).saturating_sub(old_tail_block_size + delta_successor_tail);
        let capacity = self.buffer_size - KEY_BLOCK_START;

        // Score every split point; the first key of the right page loses
        // its elided bytes, the left page gains an edge key.
        let mut split_best = 0u32;
        let mut split_at = 0usize;
        let mut last_left = false;
        let mut left_size = 0usize;
        let mut armed = true;
        let right_key_block = self.key_block_end - KEYBLOCK_LENGTH;
        let mut p = KEY_BLOCK_START;
        while p < right_key_block {
            let mut candidate = 0;
            if p == found_pos && armed {
                left_size += new_tail_block_size + KEYBLOCK_LENGTH;
                if exact {
                    p += KEYBLOCK_LENGTH;
                }
                let kb = self.get_int(p);
                let tb = self.get_int(decode_key_block_tail(kb));
                let size = decode_tail_block_size(tb);
                let tb_size_delta = round_up(size + decode_key_block_ebc(kb)) - round_up(size);
                let edge_tail_block_size =
                    round_up(decode_tail_block_klength(tb).saturating_sub(delta_successor_ebc) + hdr);
                if p < right_key_block {
                    candidate = policy.split_fit(&SplitCandidate {
                        key_block: p,
                        insert_at: found_pos,
                        replace: exact,
                        left_size: left_size + KEYBLOCK_LENGTH + edge_tail_block_size,
                        right_size: virtual_size.saturating_sub(left_size) + tb_size_delta,
                        current_size,
                        virtual_size,
                        capacity,
                        split_best,
                        sequence,
                    });
                    if candidate > split_best {
                        split_best = candidate;
                        split_at = p;
                        last_left = true;
                    }
                }
                armed = false;
            } else {
                let kb = self.get_int(p);
                let tb = self.get_int(decode_key_block_tail(kb));
                left_size += round_up(decode_tail_block_size(tb)) + KEYBLOCK_LENGTH;
                p += KEYBLOCK_LENGTH;

                let (tb_size_delta, edge_tail_block_size) = if p == found_pos && armed {
                    (
                        round_up(value_size + hdr + key_size) - new_tail_block_size,
                        round_up(key_size - depth + hdr),
                    )
                } else {
                    let kb = self.get_int(p);
                    let tb = self.get_int(decode_key_block_tail(kb));
                    let size = decode_tail_block_size(tb);
                    (
                        round_up(size + decode_key_block_ebc(kb)) - round_up(size),
                        round_up(decode_tail_block_klength(tb) + hdr),
                    )
                };
                if p < right_key_block {
                    candidate = policy.split_fit(&SplitCandidate {
                        key_block: p,
                        insert_at: found_pos,
                        replace: exact,
                        left_size: left_size + KEYBLOCK_LENGTH + edge_tail_block_size,
                        right_size: virtual_size.saturating_sub(left_size) + tb_size_delta,
                        current_size,
                        virtual_size,
                        capacity,
                        split_best,
                        sequence,
                    });
                    if candidate > split_best {
                        split_best = candidate;
                        split_at = p;
                        last_left = false;
                    }
                }
            }
            if candidate == 0 && split_best != 0 {
                break;
            }
        }

        if split_best == 0 {
            return Err(Error::corrupt_page(
                self.page,
                format!(
                    "no split point: policy={} exact={} insert_at={} current_size={} virtual_size={}",
                    policy.name(),
                    exact,
                    found_pos,
                    current_size,
                    virtual_size
                ),
            ));
        }

        let first_right = !last_left && split_at == found_pos;
        let split_ebc = decode_key_block_ebc(self.get_int(split_at));

        // Rebuild the full key that will lead the right page
        let mut ik: Vec<u8> = Vec::new();
        let mut scan_start = KEY_BLOCK_START;
        if found_pos <= split_at {
            scan_start = found_pos;
            ik.extend_from_slice(key.encoded_bytes());
        }
        if !first_right {
            for q in (scan_start..=split_at).step_by(KEYBLOCK_LENGTH) {
                let kb = self.get_int(q);
                let ebc = decode_key_block_ebc(kb);
                if ebc > ik.len() {
                    return Err(Error::corrupt_page(self.page, format!("ebc {} at {} exceeds prior key", ebc, q)));
                }
                ik.truncate(ebc);
                ik.push(decode_key_block_db(kb));
                ik.extend_from_slice(self.tail_key_bytes(decode_key_block_tail(kb)));
            }
        }
        index_key.set_encoded(&ik);

        // Move records from the split point onward into the right page
        let shift = split_at - KEY_BLOCK_START;
        right.key_block_end = self.key_block_end - shift;
        let mut right_p = KEY_BLOCK_START;
        for q in (split_at..self.key_block_end).step_by(KEYBLOCK_LENGTH) {
            let kb = self.get_int(q);
            let ebc = decode_key_block_ebc(kb);
            let db = decode_key_block_db(kb);
            let tail = decode_key_block_tail(kb);
            let tb = self.get_int(tail);
            let klength = decode_tail_block_klength(tb);
            let tail_block_size = decode_tail_block_size(tb);
            let data_size = tail_block_size - hdr - klength;

            let (new_klength, new_ebc, new_db) = if q == split_at {
                (klength + ebc, 0, if ebc > 0 { ik[0] } else { db })
            } else {
                (klength, ebc, db)
            };
            let new_size = new_klength + data_size + hdr;
            let new_tail = right.alloc_tail(new_size).ok_or_else(|| {
                Error::Fatal(format!("right sibling overflow while splitting {}", self.summarize()))
            })?;
            right.put_int(new_tail, encode_tail_block(new_size, new_klength));
            let dst = new_tail + hdr;
            let src = tail + hdr;
            if q == split_at && ebc > 0 {
                right.bytes[dst..dst + ebc - 1].copy_from_slice(&ik[1..ebc]);
                right.bytes[dst + ebc - 1] = db;
                right.bytes[dst + ebc..dst + ebc + klength].copy_from_slice(&self.bytes[src..src + klength]);
            } else {
                right.bytes[dst..dst + klength].copy_from_slice(&self.bytes[src..src + klength]);
            }
            if self.is_data_page() {
                right.bytes[dst + new_klength..dst + new_klength + data_size]
                    .copy_from_slice(&self.bytes[src + klength..src + klength + data_size]);
            } else {
                let pointer = self.get_int(tail + TAILBLOCK_POINTER);
                right.put_int(new_tail + TAILBLOCK_POINTER, pointer);
            }
            right.put_int(right_p, encode_key_block(new_ebc, new_db, new_tail));
            right_p += KEYBLOCK_LENGTH;

            if q != split_at || (first_right && !exact) {
                self.dealloc_tail(tail, tail_block_size);
            } else if self.is_data_page() {
                // The split key stays behind as the edge key, without a value
                let current = round_up(tail_block_size);
                let stripped = round_up(tail_block_size - data_size);
                if stripped != current {
                    self.dealloc_tail(tail + stripped, current - stripped);
                }
                self.put_int(tail, encode_tail_block(hdr + klength, klength));
            } else {
                self.put_int(tail + TAILBLOCK_POINTER, u32::MAX);
            }
        }

        self.key_block_end = split_at + KEYBLOCK_LENGTH;
        if first_right && !exact {
            // The inserted key leads the right page, so it is also the edge
            let edge_depth = if fixup { split_ebc } else { depth };
            if edge_depth >= ik.len() {
                return Err(Error::corrupt_page(self.page, format!("edge depth {} beyond key", edge_depth)));
            }
            let db = ik[edge_depth];
            let edge_klength = ik.len() - edge_depth - 1;
            let edge_size = edge_klength + hdr;
            let edge_tail = match self.alloc_tail(edge_size) {
                Some(t) => t,
                None => {
                    self.repack()?;
                    self.alloc_tail(edge_size).ok_or_else(|| {
                        Error::Fatal(format!("no room for edge key at {} in {}", split_at, self.summarize()))
                    })?
                }
            };
            self.put_int(edge_tail, encode_tail_block(edge_size, edge_klength));
            self.bytes[edge_tail + hdr..edge_tail + hdr + edge_klength].copy_from_slice(&ik[edge_depth + 1..]);
            self.put_int(split_at, encode_key_block(edge_depth, db, edge_tail));
        }
        if self.is_index_page() {
            let edge_tail = decode_key_block_tail(self.get_int(split_at));
            self.put_int(edge_tail + TAILBLOCK_POINTER, u32::MAX);
        }
        self.invalidate();
        right.invalidate();

        let no_room = |page: &Buffer| Error::Fatal(format!("record does not fit after split: {}", page.summarize()));
        let side = if !exact {
            if found_pos >= split_at && (!last_left || found_pos > split_at) {
                let target = if first_right && !fixup {
                    FoundAt::new(KEY_BLOCK_START, split_ebc, false, split_ebc > 0)
                } else {
                    FoundAt::new(found_pos - shift, depth, false, fixup)
                };
                let inserted = right.put_value(key, helper, target)?.ok_or_else(|| no_room(right))?;
                SplitSide::Right(inserted)
            } else {
                let inserted = self.put_value(key, helper, found_at)?.ok_or_else(|| no_room(self))?;
                SplitSide::Left(inserted)
            }
        } else if found_pos < split_at {
            let replaced = self.replace_value(key, helper, found_pos)?.ok_or_else(|| no_room(self))?;
            SplitSide::Left(replaced)
        } else {
            let replaced = right
                .replace_value(key, helper, found_pos - shift)?
                .ok_or_else(|| no_room(right))?;
            SplitSide::Right(replaced)
        };

        tracing::trace!(
            page = self.page,
            right = right.page,
            split_at,
            left_keys = self.key_count(),
            right_keys = right.key_count(),
            "page split"
        );
        self.assert_verify();
        right.assert_verify();
        Ok(side)
    }

    /// Removes the records from `found_at1` to the end of this page and
    /// from the start of `right` up to `found_at2`, then either merges the
    /// survivors into this page or redistributes them across both.
    ///
    /// When `found_at2` is the first key block of `right`, nothing is
    /// removed from `right`; this reverses a split when `found_at1` is the
    /// left page's edge key.
    pub fn join(
        &mut self,
        right: &mut Buffer,
        found_at1: FoundAt,
        found_at2: FoundAt,
        index_key: &mut Key,
        spare_key: &mut Key,
        policy: &dyn JoinPolicy,
    ) -> Result<JoinOutcome> {
        self.check_editable("join")?;
        if right.page_type != self.page_type || right.buffer_size != self.buffer_size {
            return Err(Error::IllegalArgument(format!("join with incompatible page: {}", right.summarize())));
        }
        let f1 = found_at1.position();
        let f2 = found_at2.position();
        if f1 <= KEY_BLOCK_START || f1 >= self.key_block_end || f2 < KEY_BLOCK_START || f2 >= right.key_block_end {
            return Err(Error::IllegalArgument(format!(
                "found_at1={} found_at2={} key_block_end={} right.key_block_end={}",
                f1, f2, self.key_block_end, right.key_block_end
            )));
        }
        self.assert_verify();
        right.assert_verify();

        let has_mvv = !self.mvv_count.is_zero() || !right.mvv_count.is_zero();
        right.key_at_position(f2, spare_key);
        if f2 == KEY_BLOCK_START {
            return self.join_whole_right(right, f1, index_key, spare_key, policy, has_mvv);
        }

        let measure_left = self.join_measure(f1, self.key_block_end);
        let measure_right = right.join_measure(KEY_BLOCK_START, f2);
        let kb2 = right.get_int(f2);
        let old_ebc = decode_key_block_ebc(kb2);
        let mut new_ebc = old_ebc.min(measure_left.min_ebc).min(measure_right.min_ebc);
        if self.right_sibling != right.page {
            // Not adjacent: the left edge key is not a copy of right's first key
            self.key_at_position(f1, index_key);
            new_ebc = new_ebc.min(index_key.first_unique_byte_index(spare_key));
        }

        let old_size = decode_tail_block_size(right.get_int(decode_key_block_tail(kb2)));
        let adjustment = round_up(old_size + old_ebc - new_ebc) - round_up(old_size);
        let virtual_size = (self.in_use_size() + right.in_use_size() + adjustment + KEY_BLOCK_START)
            .saturating_sub(measure_left.size + measure_right.size);
        let virtual_key_count = (f1 - KEY_BLOCK_START + right.key_block_end - f2) / KEYBLOCK_LENGTH;

        if virtual_key_count < self.max_keys() && policy.accept_join(self.buffer_size, virtual_size) {
            let kb_end = self.key_block_end;
            self.join_deallocate_tails(f1, kb_end);
            if new_ebc < old_ebc {
                right.join_deallocate_tails(KEY_BLOCK_START, f2);
                right.clear_bytes(KEY_BLOCK_START, f2);
                right.reduce_ebc(f2, new_ebc, spare_key.encoded_bytes())?;
            }
            self.clear_bytes(f1, kb_end);
            self.key_block_end = f1;
            let right_end = right.key_block_end;
            self.move_records(right, f2, right_end, f1, false)?;
            right.clear_page();
            self.right_sibling = right.right_sibling;
            if has_mvv {
                self.mvv_count = MvvCount::Unknown;
            }
            self.invalidate();
            self.assert_verify();
            return Ok(JoinOutcome::Rejoined);
        }

        let point = self
            .join_measure_rebalance_offset(right, virtual_size, f1, f2, adjustment, policy)
            .ok_or(Error::Rebalance)?;
        let kb_end = self.key_block_end;
        match point {
            RebalancePoint::Right(p) => {
                right.key_at_position(p, index_key);
                self.join_deallocate_tails(f1, kb_end);
                self.clear_bytes(f1, kb_end);
                self.key_block_end = f1;

                right.join_deallocate_tails(KEY_BLOCK_START, f2);
                right.clear_bytes(KEY_BLOCK_START, f2);
                right.reduce_ebc(f2, new_ebc, spare_key.encoded_bytes())?;
                let right_size = right.key_block_end - p;

                let insert_at = self.key_block_end;
                self.move_records(right, f2, p, insert_at, true)?;

                right.bytes.copy_within(p..p + right_size, KEY_BLOCK_START);
                let stale_end = right.key_block_end;
                right.clear_bytes(KEY_BLOCK_START + right_size, stale_end);
                right.key_block_end = KEY_BLOCK_START + right_size;
                right.reduce_ebc(KEY_BLOCK_START, 0, index_key.encoded_bytes())?;
            }
            RebalancePoint::Left(p) => {
                self.key_at_position(p, index_key);
                self.join_deallocate_tails(f1, kb_end);
                self.clear_bytes(f1, kb_end);
                self.key_block_end = f1;

                right.join_deallocate_tails(KEY_BLOCK_START, f2);
                let right_size = right.key_block_end - f2;
                right.bytes.copy_within(f2..f2 + right_size, KEY_BLOCK_START);
                let stale_end = right.key_block_end;
                right.clear_bytes(KEY_BLOCK_START + right_size, stale_end);
                right.key_block_end = KEY_BLOCK_START + right_size;
                right.reduce_ebc(KEY_BLOCK_START, new_ebc, spare_key.encoded_bytes())?;

                if p != f1 {
                    right.move_records(self, p, f1, KEY_BLOCK_START, false)?;
                    self.key_block_end = p;
                }
                self.move_records(right, KEY_BLOCK_START, KEY_BLOCK_START, p, true)?;
                right.reduce_ebc(KEY_BLOCK_START, 0, index_key.encoded_bytes())?;
            }
        }

        self.right_sibling = right.page;
        self.invalidate();
        right.invalidate();
        if has_mvv {
            self.mvv_count = MvvCount::Unknown;
            right.mvv_count = MvvCount::Unknown;
        }
        self.assert_verify();
        right.assert_verify();
        Ok(JoinOutcome::Rebalanced)
    }

    /// Join where every record of `right` survives. `spare_key` holds the
    /// first key of `right`.
    fn join_whole_right(
        &mut self,
        right: &mut Buffer,
        f1: usize,
        index_key: &mut Key,
        spare_key: &Key,
        policy: &dyn JoinPolicy,
        has_mvv: bool,
    ) -> Result<JoinOutcome> {
        let mut last_left = Key::new();
        self.key_at_position(f1 - KEYBLOCK_LENGTH, &mut last_left);
        let prefix = last_left.first_unique_byte_index(spare_key);
        let measure_left = self.join_measure(f1, self.key_block_end);
        let virtual_size =
            (self.in_use_size() + right.in_use_size() + KEY_BLOCK_START).saturating_sub(measure_left.size);
        let virtual_key_count = (f1 - KEY_BLOCK_START + right.key_block_end - KEY_BLOCK_START) / KEYBLOCK_LENGTH;

        if virtual_key_count < self.max_keys() && policy.accept_join(self.buffer_size, virtual_size) {
            let kb_end = self.key_block_end;
            self.join_deallocate_tails(f1, kb_end);
            self.clear_bytes(f1, kb_end);
            self.key_block_end = f1;
            let right_end = right.key_block_end;
            self.move_records(right, KEY_BLOCK_START, right_end, f1, false)?;
            self.increase_ebc(f1, prefix);
            right.clear_page();
            self.right_sibling = right.right_sibling;
            if has_mvv {
                self.mvv_count = MvvCount::Unknown;
            }
            self.invalidate();
            self.assert_verify();
            return Ok(JoinOutcome::Rejoined);
        }

        // Keep the edge key, which still matches right's first key
        let edge = self.key_block_end - KEYBLOCK_LENGTH;
        if f1 < edge {
            let mut scratch = Key::new();
            self.remove_keys(
                FoundAt::new(f1, 0, false, false),
                FoundAt::new(edge, 0, false, false),
                &mut scratch,
            )?;
        }
        index_key.set_encoded(spare_key.encoded_bytes());
        self.right_sibling = right.page;
        Ok(JoinOutcome::Rebalanced)
    }

    fn join_measure(&self, from: usize, to: usize) -> JoinMeasure {
        let mut min_ebc = usize::MAX;
        let mut size = 0;
        for p in (from..to).step_by(KEYBLOCK_LENGTH) {
            let kb = self.get_int(p);
            if p != KEY_BLOCK_START {
                min_ebc = min_ebc.min(decode_key_block_ebc(kb));
            }
            let tb = self.get_int(decode_key_block_tail(kb));
            size += round_up(decode_tail_block_size(tb)) + KEYBLOCK_LENGTH;
        }
        JoinMeasure { min_ebc, size }
    }

    fn join_deallocate_tails(&mut self, from: usize, to: usize) {
        for p in (from..to).step_by(KEYBLOCK_LENGTH) {
            let tail = decode_key_block_tail(self.get_int(p));
            let size = decode_tail_block_size(self.get_int(tail));
            self.dealloc_tail(tail, size);
        }
    }

    /// Picks the key that becomes the right page's first key after a
    /// rebalance. The left page always keeps its first key plus an edge.
    fn join_measure_rebalance_offset(
        &self,
        right: &Buffer,
        virtual_size: usize,
        f1: usize,
        f2: usize,
        adjustment: usize,
        policy: &dyn JoinPolicy,
    ) -> Option<RebalancePoint> {
        let capacity = self.buffer_size - KEY_BLOCK_START;
        let max_keys = self.max_keys();
        let hdr = self.tail_header_size;
        let mut best = 0u32;
        let mut point = None;
        let mut left_size = 0usize;

        for p in (KEY_BLOCK_START..f1).step_by(KEYBLOCK_LENGTH) {
            let kb = self.get_int(p);
            let tb = self.get_int(decode_key_block_tail(kb));
            let size = decode_tail_block_size(tb);
            if p > KEY_BLOCK_START {
                let delta = round_up(size + decode_key_block_ebc(kb)) - round_up(size);
                let candidate = RebalanceCandidate {
                    key_block: p,
                    found_at1: f1,
                    found_at2: f2,
                    virtual_size,
                    left_size: left_size + KEYBLOCK_LENGTH + round_up(decode_tail_block_klength(tb)) + hdr,
                    right_size: (virtual_size + delta).saturating_sub(left_size),
                    capacity,
                };
                let right_key_count = ((right.key_block_end - f2) + (f1 - p)) / KEYBLOCK_LENGTH;
                let fit = policy.rebalance_fit(&candidate);
                if fit > best && right_key_count < max_keys {
                    best = fit;
                    point = Some(RebalancePoint::Left(p));
                }
            }
            left_size += KEYBLOCK_LENGTH + round_up(size);
        }

        for p in (f2..right.key_block_end).step_by(KEYBLOCK_LENGTH) {
            let kb = right.get_int(p);
            let tb = right.get_int(decode_key_block_tail(kb));
            let size = decode_tail_block_size(tb);
            let delta = round_up(size + decode_key_block_ebc(kb)) - round_up(size);
            let adjust = if p == f2 { adjustment } else { 0 };
            let candidate = RebalanceCandidate {
                key_block: p,
                found_at1: f1,
                found_at2: f2,
                virtual_size,
                left_size: left_size + round_up(decode_tail_block_klength(tb)) + adjust + hdr + KEYBLOCK_LENGTH,
                right_size: (virtual_size + delta).saturating_sub(left_size),
                capacity,
            };
            let left_key_count = ((f1 - KEY_BLOCK_START) + (p - f2)) / KEYBLOCK_LENGTH;
            let fit = policy.rebalance_fit(&candidate);
            if fit > best && left_key_count < max_keys {
                best = fit;
                point = Some(RebalancePoint::Right(p));
            }
            left_size += KEYBLOCK_LENGTH + round_up(size) + adjust;
        }
        point
    }

    /// Moves the records of `source` between key blocks `p1` and `p2` into
    /// this page at `insert_at`. With `includes_right_edge` the key at `p2`
    /// is also copied, without its value, as an edge key; it stays in
    /// `source`.
    fn move_records(
        &mut self,
        source: &mut Buffer,
        p1: usize,
        p2: usize,
        mut insert_at: usize,
        includes_right_edge: bool,
    ) -> Result<()> {
        let count = (p2 - p1) + if includes_right_edge { KEYBLOCK_LENGTH } else { 0 };
        if self.key_block_end + count > self.alloc {
            self.repack()?;
        }
        if self.key_block_end + count > self.alloc {
            return Err(Error::Fatal(format!(
                "no room for {} key blocks in {}",
                count / KEYBLOCK_LENGTH,
                self.summarize()
            )));
        }
        let kb_end = self.key_block_end;
        if insert_at < kb_end {
            self.bytes.copy_within(insert_at..kb_end, insert_at + count);
        }
        self.clear_bytes(insert_at, insert_at + count);
        self.key_block_end += count;

        let hdr = self.tail_header_size;
        let mut p = p1;
        while p < p2 || (includes_right_edge && p == p2) {
            let kb = source.get_int(p);
            let tail = decode_key_block_tail(kb);
            let tb = source.get_int(tail);
            let size = decode_tail_block_size(tb);
            let klength = decode_tail_block_klength(tb);
            let edge = includes_right_edge && p == p2;
            let new_size = if edge { hdr + klength } else { size };

            let new_tail = match self.alloc_tail(new_size) {
                Some(t) => t,
                None => {
                    self.repack()?;
                    self.alloc_tail(new_size).ok_or_else(|| {
                        Error::Fatal(format!("no room to move record from {} into {}", source.page, self.summarize()))
                    })?
                }
            };
            self.bytes[new_tail + 4..new_tail + new_size].copy_from_slice(&source.bytes[tail + 4..tail + new_size]);
            self.put_int(new_tail, encode_tail_block(new_size, klength));
            if edge && self.is_index_page() {
                self.put_int(new_tail + TAILBLOCK_POINTER, u32::MAX);
            }
            self.put_int(
                insert_at,
                encode_key_block(decode_key_block_ebc(kb), decode_key_block_db(kb), new_tail),
            );
            insert_at += KEYBLOCK_LENGTH;

            if !edge {
                source.dealloc_tail(tail, size);
                source.put_int(p, 0);
            }
            p += KEYBLOCK_LENGTH;
        }
        Ok(())
    }

    /// Empties the page, keeping its type and address.
    fn clear_page(&mut self) {
        self.key_block_end = KEY_BLOCK_START;
        self.bytes[KEY_BLOCK_START..].fill(0);
        self.alloc = self.buffer_size;
        self.slack = 0;
        self.mvv_count = MvvCount::Exact(0);
        self.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::page_source::FixedPageSource;
    use crate::core::policy::{EvenJoin, EvenSplit};
    use crate::core::value::{PointerValue, RawValueWriter};

    fn page(page_type: u8, address: u64) -> Buffer {
        let mut b = Buffer::new(1024, Arc::new(FixedPageSource::new())).unwrap();
        b.set_page(address);
        b.init(page_type).unwrap();
        b
    }

    fn fill(b: &mut Buffer, prefix: &str, value_len: usize) -> Vec<String> {
        let mut stored = Vec::new();
        for i in 0.. {
            let k = format!("{}{:04}", prefix, i * 10);
            let key = Key::from(k.as_str());
            let found = b.find_key(&key);
            if b.put_value(&key, &RawValueWriter(&vec![i as u8; value_len]), found).unwrap().is_none() {
                break;
            }
            stored.push(k);
        }
        stored
    }

    fn keys(b: &Buffer) -> Vec<String> {
        b.records()
            .iter()
            .map(|r| String::from_utf8(r.key.encoded_bytes().to_vec()).unwrap())
            .collect()
    }

    #[test]
    fn test_split_keeps_order_and_edge_key() {
        let mut left = page(PAGE_TYPE_DATA, 1);
        let stored = fill(&mut left, "key", 30);
        let mut right = page(PAGE_TYPE_DATA, 2);
        let key = Key::from("key0055");
        let found = left.find_key(&key);
        let mut index_key = Key::new();
        let side = left
            .split(&mut right, &key, &RawValueWriter(b"new"), found, &mut index_key, Sequence::None, &EvenSplit)
            .unwrap();

        let left_keys = keys(&left);
        let right_keys = keys(&right);
        assert_eq!(left_keys.last(), right_keys.first());
        assert_eq!(index_key.encoded_bytes(), right_keys[0].as_bytes());
        assert_eq!(right.records()[0].ebc, 0);
        assert!(left.records().last().unwrap().value.is_empty());

        let mut all: Vec<String> = left_keys[..left_keys.len() - 1].to_vec();
        all.extend(right_keys.iter().cloned());
        let mut expected = stored.clone();
        expected.push("key0055".to_string());
        expected.sort();
        assert_eq!(all, expected);

        let holder = match side {
            SplitSide::Left(_) => &left,
            SplitSide::Right(_) => &right,
        };
        assert_eq!(holder.fetch(holder.find_key(&key)), Some(&b"new"[..]));
        assert!(left.key_count() > 3 && right.key_count() > 3);
    }

    #[test]
    fn test_split_then_join_restores_single_page() {
        let mut left = page(PAGE_TYPE_DATA, 1);
        let stored = fill(&mut left, "k", 20);
        let mut right = page(PAGE_TYPE_DATA, 2);
        let key = Key::from("k9999");
        let found = left.find_key(&key);
        let mut index_key = Key::new();
        left.split(&mut right, &key, &RawValueWriter(b"tail"), found, &mut index_key, Sequence::None, &EvenSplit)
            .unwrap();
        left.set_right_sibling(right.page());

        // Drop enough records that everything fits again
        let mut spare = Key::new();
        for k in stored.iter().skip(1).step_by(2) {
            for b in [&mut left, &mut right] {
                let found = b.find_key(&Key::from(k.as_str()));
                let edge = found.position() + KEYBLOCK_LENGTH == b.key_block_end() && b.page() == 1;
                if found.is_exact() && !edge && found.position() != KEY_BLOCK_START {
                    b.remove_keys(found, found, &mut spare).unwrap();
                }
            }
        }

        let f1 = FoundAt::new(left.key_block_end() - KEYBLOCK_LENGTH, 0, true, false);
        let f2 = FoundAt::new(KEY_BLOCK_START, 0, false, false);
        let outcome = left.join(&mut right, f1, f2, &mut index_key, &mut spare, &EvenJoin).unwrap();
        assert_eq!(outcome, JoinOutcome::Rejoined);
        assert_eq!(right.key_count(), 0);
        assert_eq!(left.right_sibling(), 0);

        let joined = keys(&left);
        let mut sorted = joined.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(joined, sorted);
        assert!(joined.contains(&"k9999".to_string()));
        assert_eq!(left.fetch(left.find_key(&Key::from("k9999"))), Some(&b"tail"[..]));
        left.verify().unwrap();
    }

    #[test]
    fn test_join_removing_range_rebalances_full_pages() {
        let mut left = page(PAGE_TYPE_DATA, 1);
        let left_keys = fill(&mut left, "a", 30);
        let mut right = page(PAGE_TYPE_DATA, 2);
        let right_keys = fill(&mut right, "b", 30);

        // Replace the last left record with an edge key mirroring right's first key
        let mut spare = Key::new();
        let last = FoundAt::new(left.key_block_end() - KEYBLOCK_LENGTH, 0, true, false);
        left.remove_keys(last, last, &mut spare).unwrap();
        let edge = Key::from(right_keys[0].as_str());
        let found = left.find_key(&edge);
        left.put_value(&edge, &RawValueWriter(b""), found).unwrap().unwrap();
        left.set_right_sibling(2);

        // Remove three keys plus the edge on the left, three keys on the right
        let f1 = FoundAt::new(left.key_block_end() - 4 * KEYBLOCK_LENGTH, 0, false, false);
        let f2 = FoundAt::new(KEY_BLOCK_START + 3 * KEYBLOCK_LENGTH, 0, false, false);
        let mut index_key = Key::new();
        let outcome = left.join(&mut right, f1, f2, &mut index_key, &mut spare, &EvenJoin).unwrap();
        assert_eq!(outcome, JoinOutcome::Rebalanced);
        assert_eq!(left.right_sibling(), 2);

        let l = keys(&left);
        let r = keys(&right);
        assert_eq!(l.last(), r.first());
        assert_eq!(index_key.encoded_bytes(), r[0].as_bytes());
        assert_eq!(right.records()[0].ebc, 0);

        let mut survivors: Vec<String> = l[..l.len() - 1].to_vec();
        survivors.extend(r.iter().cloned());
        let mut expected: Vec<String> = left_keys[..left_keys.len() - 4].to_vec();
        expected.extend(right_keys[3..].iter().cloned());
        assert_eq!(survivors, expected);
        left.verify().unwrap();
        right.verify().unwrap();
    }

    #[test]
    fn test_index_page_split_marks_edge_pointer() {
        let mut left = page(PAGE_TYPE_INDEX_MIN, 1);
        let mut i = 0;
        loop {
            let key = Key::from(format!("idx{:05}", i * 7).as_str());
            let found = left.find_key(&key);
            if left.put_value(&key, &PointerValue(100 + i), found).unwrap().is_none() {
                break;
            }
            i += 1;
        }
        let mut right = page(PAGE_TYPE_INDEX_MIN, 2);
        let key = Key::from("idx00003");
        let found = left.find_key(&key);
        let mut index_key = Key::new();
        left.split(&mut right, &key, &PointerValue(5), found, &mut index_key, Sequence::None, &EvenSplit)
            .unwrap();
        let edge = FoundAt::new(left.key_block_end() - KEYBLOCK_LENGTH, 0, true, false);
        assert_eq!(left.get_pointer(edge).unwrap(), -1);
        let first_right = FoundAt::new(KEY_BLOCK_START, 0, true, false);
        assert!(right.get_pointer(first_right).unwrap() >= 100);
        let inserted = left.find_key(&key);
        assert_eq!(left.get_pointer(inserted).unwrap(), 5);
    }
}
