//! Slotted page image with front-coded keys.
//!
//! Layout of a data or index page:
//!
//! ```text
//! [header 32][key blocks ->        free        <- tail blocks]
//!            ^START       ^key_block_end       ^alloc        ^buffer_size
//! ```
//!
//! Each key block is a u32 holding the elided byte count (ebc), the
//! discriminator byte (db) and the offset of the record's tail block. A key
//! is rebuilt from its predecessor's first `ebc` bytes, then `db`, then the
//! key bytes stored in the tail block. Tail blocks are 4-byte aligned and
//! carry a header with their size, key length and an in-use bit; index
//! pages add a child pointer after the header.

mod prune;
mod split;

pub use prune::PruneContext;
pub use split::{JoinOutcome, SplitSide};

use crate::core::constants::*;
use crate::core::endian::Endian;
use crate::core::errors::*;
use crate::core::fast_index::FastIndex;
use crate::core::key::Key;
use crate::core::mvv;
use crate::core::page_source::PageSource;
use crate::core::value::{decode_long_record_pointer, is_long_record, is_value_mvv, ValueHelper};
use crate::core::volume::{validate_page_size, Volume};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// Bit-field codecs

#[inline]
pub fn encode_key_block(ebc: usize, db: u8, tail: usize) -> u32 {
    (((ebc as u32) << EBC_SHIFT) & EBC_MASK) | (db as u32 & DB_MASK) | (((tail as u32) << TAIL_SHIFT) & TAIL_MASK)
}

#[inline]
pub fn encode_key_block_tail(kb: u32, tail: usize) -> u32 {
    (kb & !TAIL_MASK) | (((tail as u32) << TAIL_SHIFT) & TAIL_MASK)
}

#[inline]
pub fn decode_key_block_ebc(kb: u32) -> usize {
    ((kb & EBC_MASK) >> EBC_SHIFT) as usize
}

#[inline]
pub fn decode_key_block_db(kb: u32) -> u8 {
    (kb & DB_MASK) as u8
}

#[inline]
pub fn decode_key_block_tail(kb: u32) -> usize {
    ((kb & TAIL_MASK) >> TAIL_SHIFT) as usize
}

#[inline]
pub fn encode_tail_block(size: usize, klength: usize) -> u32 {
    (size as u32 & TAILBLOCK_SIZE_MASK)
        | (((klength as u32) << TAILBLOCK_KLENGTH_SHIFT) & TAILBLOCK_KLENGTH_MASK)
        | TAILBLOCK_INUSE_MASK
}

#[inline]
fn encode_free_block(size: usize) -> u32 {
    size as u32 & TAILBLOCK_SIZE_MASK
}

#[inline]
pub fn decode_tail_block_size(tb: u32) -> usize {
    (tb & TAILBLOCK_SIZE_MASK) as usize
}

#[inline]
pub fn decode_tail_block_klength(tb: u32) -> usize {
    ((tb & TAILBLOCK_KLENGTH_MASK) >> TAILBLOCK_KLENGTH_SHIFT) as usize
}

#[inline]
pub fn decode_tail_block_inuse(tb: u32) -> bool {
    tb & TAILBLOCK_INUSE_MASK != 0
}

#[inline]
fn round_up(size: usize) -> usize {
    (size + (TAILBLOCK_FACTOR - 1)) & !(TAILBLOCK_FACTOR - 1)
}

#[inline]
fn is_index_type(page_type: u8) -> bool {
    (PAGE_TYPE_INDEX_MIN..=PAGE_TYPE_INDEX_MAX).contains(&page_type)
}

/// Packed result of a key search: a key block offset, the number of leading
/// key bytes known to match, and flags.
///
/// Exact means the key block holds the key. Otherwise the offset is where the
/// key would be inserted, and fixup means the record currently there shares
/// more than its ebc with the searched key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FoundAt(u32);

impl FoundAt {
    pub fn new(position: usize, depth: usize, exact: bool, fixup: bool) -> Self {
        let mut raw = (position as u32 & P_MASK) | (((depth as u32) << DEPTH_SHIFT) & DEPTH_MASK);
        if exact {
            raw |= EXACT_MASK;
        }
        if fixup {
            raw |= FIXUP_MASK;
        }
        Self(raw)
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn position(self) -> usize {
        (self.0 & P_MASK) as usize
    }

    #[inline]
    pub fn depth(self) -> usize {
        ((self.0 & DEPTH_MASK) >> DEPTH_SHIFT) as usize
    }

    #[inline]
    pub fn is_exact(self) -> bool {
        self.0 & EXACT_MASK != 0
    }

    #[inline]
    pub fn needs_fixup(self) -> bool {
        self.0 & FIXUP_MASK != 0
    }
}

impl fmt::Debug for FoundAt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FoundAt(p={}, depth={}{}{})",
            self.position(),
            self.depth(),
            if self.is_exact() { ", exact" } else { "" },
            if self.needs_fixup() { ", fixup" } else { "" }
        )
    }
}

/// Count of MVV values on a page. Pages read from disk start `Unknown` so
/// the first prune pass examines them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MvvCount {
    Exact(u32),
    Unknown,
}

impl MvvCount {
    #[inline]
    pub fn is_zero(self) -> bool {
        matches!(self, MvvCount::Exact(0))
    }

    fn increment(&mut self) {
        if let MvvCount::Exact(n) = self {
            *n = n.saturating_add(1);
        }
    }

    fn decrement(&mut self) {
        if let MvvCount::Exact(n) = self {
            *n = n.saturating_sub(1);
        }
    }
}

/// Decoded view of one record, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub key_block: usize,
    pub tail: usize,
    pub ebc: usize,
    pub db: u8,
    pub klength: usize,
    pub size: usize,
    pub key: Key,
    pub value: Vec<u8>,
    pub pointer: Option<i32>,
}

#[derive(Clone)]
pub struct Buffer {
    bytes: Vec<u8>,
    endian: Endian,
    buffer_size: usize,
    page_type: u8,
    page: PageAddress,
    right_sibling: PageAddress,
    timestamp: u64,
    key_block_end: usize,
    alloc: usize,
    slack: usize,
    tail_header_size: usize,
    mvv_count: MvvCount,
    fast_index: OnceCell<FastIndex>,
    source: Arc<dyn PageSource>,
    volume: Option<Arc<dyn Volume>>,
    dirty: bool,
    enqueued_for_anti_value_pruning: bool,
    last_prune_millis: u64,
    generation: u64,
}

impl Buffer {
    pub fn new(buffer_size: usize, source: Arc<dyn PageSource>) -> Result<Self> {
        Self::with_endian(buffer_size, Endian::default(), source)
    }

    pub fn with_endian(buffer_size: usize, endian: Endian, source: Arc<dyn PageSource>) -> Result<Self> {
        validate_page_size(buffer_size)?;
        Ok(Self {
            bytes: vec![0u8; buffer_size],
            endian,
            buffer_size,
            page_type: PAGE_TYPE_UNALLOCATED,
            page: 0,
            right_sibling: 0,
            timestamp: 0,
            key_block_end: KEY_BLOCK_START,
            alloc: buffer_size,
            slack: 0,
            tail_header_size: TAILBLOCK_HDR_SIZE_DATA,
            mvv_count: MvvCount::Exact(0),
            fast_index: OnceCell::new(),
            source,
            volume: None,
            dirty: false,
            enqueued_for_anti_value_pruning: false,
            last_prune_millis: 0,
            generation: 0,
        })
    }

    /// Formats the buffer as an empty page of `page_type`.
    pub fn init(&mut self, page_type: u8) -> Result<()> {
        if page_type > PAGE_TYPE_HEAD {
            return Err(Error::InvalidPageType {
                found: page_type,
                operation: "init".to_string(),
            });
        }
        self.page_type = page_type;
        self.tail_header_size = if is_index_type(page_type) {
            TAILBLOCK_HDR_SIZE_INDEX
        } else {
            TAILBLOCK_HDR_SIZE_DATA
        };
        self.bytes.fill(0);
        self.key_block_end = KEY_BLOCK_START;
        self.alloc = self.buffer_size;
        self.slack = 0;
        self.right_sibling = 0;
        self.mvv_count = MvvCount::Exact(0);
        self.enqueued_for_anti_value_pruning = false;
        self.invalidate();
        self.save();
        Ok(())
    }

    /// Reads `page` from `volume` and decodes its header.
    pub fn load(&mut self, volume: Arc<dyn Volume>, page: PageAddress) -> Result<()> {
        volume.read_page(page, &mut self.bytes)?;
        self.page = page;
        self.volume = Some(volume);
        self.dirty = false;
        self.load_header()
    }

    /// Installs a page image taken from somewhere other than the volume,
    /// such as a journal PA record.
    pub fn load_image(&mut self, page: PageAddress, image: &[u8]) -> Result<()> {
        if image.len() != self.buffer_size {
            return Err(Error::IllegalArgument(format!(
                "image of {} bytes for buffer of {}",
                image.len(),
                self.buffer_size
            )));
        }
        self.bytes.copy_from_slice(image);
        self.page = page;
        self.load_header()
    }

    fn load_header(&mut self) -> Result<()> {
        self.enqueued_for_anti_value_pruning = false;
        self.invalidate();
        let page_type = self.bytes[TYPE_OFFSET];
        if page_type == PAGE_TYPE_UNALLOCATED {
            self.page_type = PAGE_TYPE_UNALLOCATED;
            self.tail_header_size = TAILBLOCK_HDR_SIZE_DATA;
            self.key_block_end = KEY_BLOCK_START;
            self.alloc = self.buffer_size;
            self.slack = 0;
            self.right_sibling = 0;
            self.timestamp = 0;
            self.mvv_count = MvvCount::Exact(0);
            return Ok(());
        }
        if page_type > PAGE_TYPE_HEAD {
            return Err(Error::corrupt_page(self.page, format!("invalid page type {}", page_type)));
        }
        let size = self.bytes[BUFFER_LENGTH_OFFSET] as usize * 256;
        if size != self.buffer_size {
            return Err(Error::corrupt_page(
                self.page,
                format!("page claims size {} in buffer of {}", size, self.buffer_size),
            ));
        }
        let stored = self.endian.get_u64(&self.bytes, PAGE_ADDRESS_OFFSET);
        if stored != self.page {
            return Err(Error::corrupt_page(self.page, format!("page image carries address {}", stored)));
        }
        self.page_type = page_type;
        self.right_sibling = self.endian.get_u64(&self.bytes, RIGHT_SIBLING_OFFSET);
        self.timestamp = self.endian.get_u64(&self.bytes, TIMESTAMP_OFFSET);
        self.key_block_end = self.endian.get_u16(&self.bytes, KEY_BLOCK_END_OFFSET) as usize;
        self.alloc = self.endian.get_u16(&self.bytes, FREE_OFFSET) as usize;
        self.slack = self.endian.get_u16(&self.bytes, SLACK_OFFSET) as usize;

        if self.is_data_page() || self.is_index_page() {
            if self.key_block_end < KEY_BLOCK_START
                || self.key_block_end > self.alloc
                || self.alloc > self.buffer_size
                || self.key_block_end % KEYBLOCK_LENGTH != 0
            {
                return Err(Error::corrupt_page(
                    self.page,
                    format!("key_block_end={} alloc={}", self.key_block_end, self.alloc),
                ));
            }
        }
        if self.is_index_page() {
            self.tail_header_size = TAILBLOCK_HDR_SIZE_INDEX;
            self.mvv_count = MvvCount::Exact(0);
        } else {
            self.tail_header_size = TAILBLOCK_HDR_SIZE_DATA;
            self.mvv_count = if self.is_data_page() {
                MvvCount::Unknown
            } else {
                MvvCount::Exact(0)
            };
        }
        Ok(())
    }

    /// Writes the header fields into the page image.
    pub fn save(&mut self) {
        let e = self.endian;
        self.bytes[TYPE_OFFSET] = self.page_type;
        self.bytes[BUFFER_LENGTH_OFFSET] = (self.buffer_size / 256) as u8;
        e.put_u16(&mut self.bytes, KEY_BLOCK_END_OFFSET, self.key_block_end as u16);
        e.put_u16(&mut self.bytes, FREE_OFFSET, self.alloc as u16);
        e.put_u16(&mut self.bytes, SLACK_OFFSET, self.slack as u16);
        e.put_u64(&mut self.bytes, PAGE_ADDRESS_OFFSET, self.page);
        e.put_u64(&mut self.bytes, RIGHT_SIBLING_OFFSET, self.right_sibling);
        e.put_u64(&mut self.bytes, TIMESTAMP_OFFSET, self.timestamp);
    }

    /// Compacts the page, zeroes the free gap and saves the header, leaving
    /// an image suitable for the journal or the volume.
    pub fn prepare_write(&mut self) -> Result<()> {
        if self.is_data_page() || self.is_index_page() {
            self.clear_slack()?;
        }
        self.save();
        Ok(())
    }

    pub fn write_page(&mut self) -> Result<()> {
        let volume = self
            .volume
            .clone()
            .ok_or_else(|| Error::IllegalState(format!("page {} is not bound to a volume", self.page)))?;
        self.prepare_write()?;
        volume.write_page(self.page, &self.bytes)?;
        self.dirty = false;
        Ok(())
    }

    /// Sizes of the leading and trailing regions of the image that carry
    /// data. A journaled page image may omit the bytes between them.
    pub fn journal_extents(&self) -> (usize, usize) {
        if self.is_data_page() || self.is_index_page() {
            (self.key_block_end, self.buffer_size - self.alloc)
        } else {
            (self.buffer_size, 0)
        }
    }

    fn clear_slack(&mut self) -> Result<()> {
        if self.slack > 0 {
            self.repack()?;
        }
        let (start, end) = (self.key_block_end, self.alloc);
        self.bytes[start..end].fill(0);
        Ok(())
    }

    // Accessors

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn page_type(&self) -> u8 {
        self.page_type
    }

    pub fn page(&self) -> PageAddress {
        self.page
    }

    pub fn set_page(&mut self, page: PageAddress) {
        self.page = page;
    }

    pub fn right_sibling(&self) -> PageAddress {
        self.right_sibling
    }

    pub fn set_right_sibling(&mut self, page: PageAddress) {
        self.right_sibling = page;
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn key_block_end(&self) -> usize {
        self.key_block_end
    }

    pub fn alloc(&self) -> usize {
        self.alloc
    }

    pub fn slack(&self) -> usize {
        self.slack
    }

    pub fn mvv_count(&self) -> MvvCount {
        self.mvv_count
    }

    /// Bumped by every structural change; lets holders of a `FoundAt`
    /// detect that it went stale.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn volume(&self) -> Option<&Arc<dyn Volume>> {
        self.volume.as_ref()
    }

    pub fn set_volume(&mut self, volume: Arc<dyn Volume>) {
        self.volume = Some(volume);
    }

    pub fn source(&self) -> &Arc<dyn PageSource> {
        &self.source
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty_at_timestamp(&mut self, timestamp: u64) {
        self.dirty = true;
        self.timestamp = self.timestamp.max(timestamp);
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn is_data_page(&self) -> bool {
        self.page_type == PAGE_TYPE_DATA
    }

    pub fn is_index_page(&self) -> bool {
        is_index_type(self.page_type)
    }

    pub fn is_long_record_page(&self) -> bool {
        self.page_type == PAGE_TYPE_LONG_RECORD
    }

    pub fn key_count(&self) -> usize {
        (self.key_block_end - KEY_BLOCK_START) / KEYBLOCK_LENGTH
    }

    pub fn max_keys(&self) -> usize {
        self.source.max_keys(self.buffer_size)
    }

    /// Bytes a new record could use, counting free blocks a repack would
    /// reclaim.
    pub fn available_size(&self) -> usize {
        self.alloc - self.key_block_end + self.slack
    }

    /// Bytes occupied by key blocks and live tail blocks.
    pub fn in_use_size(&self) -> usize {
        self.buffer_size - self.alloc - self.slack + self.key_block_end - KEY_BLOCK_START
    }

    pub fn is_before_left_edge(&self, found_at: FoundAt) -> bool {
        found_at.position() < KEY_BLOCK_START
            || (found_at.position() == KEY_BLOCK_START && !found_at.is_exact())
    }

    pub fn is_after_right_edge(&self, found_at: FoundAt) -> bool {
        found_at.position() >= self.key_block_end
    }

    pub fn summarize(&self) -> String {
        format!(
            "page={} type={} right_sibling={} key_block_end={} alloc={} slack={} timestamp={} generation={}",
            self.page,
            self.page_type,
            self.right_sibling,
            self.key_block_end,
            self.alloc,
            self.slack,
            self.timestamp,
            self.generation
        )
    }

    // Raw access

    #[inline]
    pub(crate) fn get_int(&self, at: usize) -> u32 {
        self.endian.get_u32(&self.bytes, at)
    }

    #[inline]
    pub(crate) fn put_int(&mut self, at: usize, value: u32) {
        self.endian.put_u32(&mut self.bytes, at, value);
    }

    #[inline]
    fn get_db(&self, p: usize) -> usize {
        self.bytes[self.endian.low_byte_offset(p)] as usize
    }

    fn fast_index(&self) -> &FastIndex {
        self.fast_index.get_or_init(|| {
            let ebcs: Vec<u16> = (KEY_BLOCK_START..self.key_block_end)
                .step_by(KEYBLOCK_LENGTH)
                .map(|p| decode_key_block_ebc(self.get_int(p)) as u16)
                .collect();
            FastIndex::build(&ebcs)
        })
    }

    fn invalidate(&mut self) {
        self.fast_index = OnceCell::new();
        self.generation += 1;
    }

    fn check_editable(&self, operation: &str) -> Result<()> {
        if self.is_data_page() || self.is_index_page() {
            Ok(())
        } else {
            Err(Error::InvalidPageType {
                found: self.page_type,
                operation: operation.to_string(),
            })
        }
    }

    fn tail_key_bytes(&self, tail: usize) -> &[u8] {
        let klength = decode_tail_block_klength(self.get_int(tail));
        let start = tail + self.tail_header_size;
        &self.bytes[start..start + klength]
    }

    /// Offset and length of the value stored at key block `p`.
    fn value_span(&self, p: usize) -> (usize, usize) {
        let tail = decode_key_block_tail(self.get_int(p));
        let tb = self.get_int(tail);
        let klength = decode_tail_block_klength(tb);
        let size = decode_tail_block_size(tb);
        let offset = tail + self.tail_header_size + klength;
        (offset, size.saturating_sub(self.tail_header_size + klength))
    }

    // Search

    /// Locates `key` among the page's key blocks.
    ///
    /// Runs of key blocks with equal ebc are crossed with the fast index and
    /// searched by discriminator byte, binary when the run is long. Deeper
    /// keys between runs are skipped without reading their tails.
    pub fn find_key(&self, key: &Key) -> FoundAt {
        let kbytes = key.encoded_bytes();
        let klength = kbytes.len();
        if klength == 0 {
            return FoundAt::new(KEY_BLOCK_START, 0, false, false);
        }
        let fast_index = self.fast_index();
        let start = KEY_BLOCK_START;
        let mut depth = 0usize;
        let mut right = self.key_block_end;
        let mut p = start;

        while p < right {
            let kb = self.get_int(p);
            let index = (p - start) >> 2;
            let run_count = fast_index.run_count(index);
            let ebc = decode_key_block_ebc(kb);

            if depth < ebc {
                p += KEYBLOCK_LENGTH * (run_count.unsigned_abs() as usize + 1);
                continue;
            }
            if depth > ebc {
                return FoundAt::new(p, depth, false, false);
            }

            let db = decode_key_block_db(kb) as usize;
            let key_byte = kbytes[depth] as usize;
            if key_byte < db {
                return FoundAt::new(p, depth, false, false);
            }
            if key_byte > db {
                if run_count <= 0 {
                    p += KEYBLOCK_LENGTH * (run_count.unsigned_abs() as usize + 1);
                    continue;
                }
                let p2 = p + KEYBLOCK_LENGTH * run_count as usize;
                let db2 = self.get_db(p2);
                if db2 == key_byte {
                    p = p2;
                } else if db2 < key_byte {
                    let run_count2 = fast_index.run_count((p2 - start) >> 2);
                    p = p2 + KEYBLOCK_LENGTH * (run_count2.unsigned_abs() as usize + 1);
                    continue;
                } else if run_count == 1 {
                    return FoundAt::new(p2, depth, false, false);
                } else {
                    let mut left = p;
                    right = p2;
                    if run_count > BINARY_SEARCH_THRESHOLD {
                        // Discriminator bytes strictly increase along a run
                        let distance = (right - left) >> 2;
                        let old_right = right;
                        if distance > key_byte - db + 1 {
                            right = left + ((key_byte - db + 1) << 2);
                        }
                        if distance > db2 - key_byte + 1 {
                            left = old_right - ((db2 - key_byte + 1) << 2);
                        }
                    }
                    loop {
                        let mid = ((left + right) >> 1) & P_MASK as usize;
                        if mid == left {
                            return FoundAt::new(right, depth, false, false);
                        }
                        let db1 = self.get_db(mid);
                        if db1 == key_byte {
                            p = mid;
                            break;
                        } else if db1 > key_byte {
                            right = mid;
                        } else {
                            left = mid;
                        }
                    }
                }
            }

            // The discriminator matches; compare the tail's key bytes
            let tail = decode_key_block_tail(self.get_int(p));
            let tb = self.get_int(tail);
            let tlength = decode_tail_block_klength(tb) + depth + 1;
            let qlength = tlength.min(klength);
            depth += 1;
            let mut matched = true;
            let mut q = tail + self.tail_header_size;
            while depth < qlength {
                let key_byte = kbytes[depth];
                let tail_byte = self.bytes[q];
                if key_byte != tail_byte {
                    if key_byte < tail_byte {
                        return FoundAt::new(p, depth, false, true);
                    }
                    matched = false;
                    break;
                }
                depth += 1;
                q += 1;
            }
            if matched {
                if qlength == tlength {
                    if qlength == klength {
                        return FoundAt::new(p, depth, true, false);
                    }
                } else {
                    // The searched key is a strict prefix of this one
                    return FoundAt::new(p, depth, false, true);
                }
            }
            p += KEYBLOCK_LENGTH;
        }
        FoundAt::new(right, depth, false, false)
    }

    /// Value stored under an exact match.
    pub fn fetch(&self, found_at: FoundAt) -> Option<&[u8]> {
        let p = found_at.position();
        if !found_at.is_exact() || p < KEY_BLOCK_START || p >= self.key_block_end {
            return None;
        }
        let (offset, length) = self.value_span(p);
        Some(&self.bytes[offset..offset + length])
    }

    pub fn fetch_long_record_pointer(&self, found_at: FoundAt) -> Result<u64> {
        match self.fetch(found_at) {
            Some(value) if is_long_record(value) => decode_long_record_pointer(value),
            _ => Ok(0),
        }
    }

    pub fn get_pointer(&self, found_at: FoundAt) -> Result<i32> {
        if !self.is_index_page() {
            return Err(Error::InvalidPageType {
                found: self.page_type,
                operation: "get_pointer".to_string(),
            });
        }
        let p = found_at.position();
        if p < KEY_BLOCK_START || p >= self.key_block_end {
            return Err(Error::IllegalArgument(format!("no key block at {} in {}", p, self.summarize())));
        }
        let tail = decode_key_block_tail(self.get_int(p));
        Ok(self.get_int(tail + TAILBLOCK_POINTER) as i32)
    }

    /// Rebuilds into `key` the full key stored at `found_at`.
    pub fn key_at(&self, found_at: FoundAt, key: &mut Key) {
        self.key_at_position(found_at.position(), key);
    }

    fn key_at_position(&self, p: usize, key: &mut Key) {
        key.clear();
        let mut q = KEY_BLOCK_START;
        while q <= p && q < self.key_block_end {
            let kb = self.get_int(q);
            let tail = decode_key_block_tail(kb);
            key.splice(decode_key_block_ebc(kb), decode_key_block_db(kb), self.tail_key_bytes(tail));
            q += KEYBLOCK_LENGTH;
        }
    }

    /// Advances to the key after `found_at`, rewriting `key` in place. The
    /// caller's key must match the page's keys up to the found depth, which
    /// holds for any `FoundAt` returned by `find_key` for that key.
    pub fn next_key(&self, key: &mut Key, found_at: FoundAt) -> Option<FoundAt> {
        let mut p = found_at.position();
        if found_at.is_exact() {
            p += KEYBLOCK_LENGTH;
        }
        if p < KEY_BLOCK_START || p >= self.key_block_end {
            return None;
        }
        let kb = self.get_int(p);
        let tail = decode_key_block_tail(kb);
        key.splice(decode_key_block_ebc(kb), decode_key_block_db(kb), self.tail_key_bytes(tail));
        Some(FoundAt::new(p, key.encoded_size(), true, false))
    }

    /// Steps back to the key before `found_at`, rewriting `key` in place.
    pub fn previous_key(&self, key: &mut Key, found_at: FoundAt) -> Option<FoundAt> {
        let p = found_at.position().checked_sub(KEYBLOCK_LENGTH)?;
        if p < KEY_BLOCK_START || p >= self.key_block_end {
            return None;
        }
        let depth = found_at.depth().min(key.encoded_size());
        // Bytes of `key` known to agree with the key at p
        let later_ebc = if p + KEYBLOCK_LENGTH < self.key_block_end {
            decode_key_block_ebc(self.get_int(p + KEYBLOCK_LENGTH))
        } else {
            depth
        };
        let mut known_good = depth.min(later_ebc);

        let kb = self.get_int(p);
        let ebc = decode_key_block_ebc(kb);
        let mut bytes = key.encoded_bytes().to_vec();
        bytes.truncate(known_good);
        if ebc < known_good {
            known_good = ebc;
        }
        // Walk back until a key block supplies every byte below known_good
        let mut suffixes: Vec<(usize, u8, usize)> = Vec::new();
        let mut q = p;
        let mut need = usize::MAX;
        loop {
            let kbq = self.get_int(q);
            let ebcq = decode_key_block_ebc(kbq);
            if ebcq < need {
                suffixes.push((ebcq, decode_key_block_db(kbq), decode_key_block_tail(kbq)));
                need = ebcq;
            }
            if need <= known_good || q == KEY_BLOCK_START {
                break;
            }
            q -= KEYBLOCK_LENGTH;
        }
        bytes.truncate(need.min(bytes.len()));
        bytes.resize(need, 0);
        for (ebcq, db, tail) in suffixes.into_iter().rev() {
            bytes.truncate(ebcq);
            bytes.push(db);
            bytes.extend_from_slice(self.tail_key_bytes(tail));
        }
        key.set_encoded(&bytes);
        Some(FoundAt::new(p, key.encoded_size(), true, false))
    }

    pub fn records(&self) -> Vec<RecordInfo> {
        let mut records = Vec::with_capacity(self.key_count());
        if !(self.is_data_page() || self.is_index_page()) {
            return records;
        }
        let mut key = Key::new();
        for p in (KEY_BLOCK_START..self.key_block_end).step_by(KEYBLOCK_LENGTH) {
            let kb = self.get_int(p);
            let tail = decode_key_block_tail(kb);
            let tb = self.get_int(tail);
            let ebc = decode_key_block_ebc(kb);
            let db = decode_key_block_db(kb);
            key.splice(ebc, db, self.tail_key_bytes(tail));
            let (offset, length) = self.value_span(p);
            let pointer = if self.is_index_page() {
                Some(self.get_int(tail + TAILBLOCK_POINTER) as i32)
            } else {
                None
            };
            records.push(RecordInfo {
                key_block: p,
                tail,
                ebc,
                db,
                klength: decode_tail_block_klength(tb),
                size: decode_tail_block_size(tb),
                key: key.clone(),
                value: self.bytes[offset..offset + length].to_vec(),
                pointer,
            });
        }
        records
    }

    // Mutation

    /// Inserts or replaces the record for `key` at `found_at`, which must
    /// come from `find_key` on the current page state. Returns `None` when
    /// the page lacks room; the caller then splits.
    pub fn put_value(&mut self, key: &Key, helper: &dyn ValueHelper, found_at: FoundAt) -> Result<Option<FoundAt>> {
        self.check_editable("put_value")?;
        helper.check()?;
        if key.is_empty() {
            return Err(Error::IllegalArgument("cannot store an empty key".to_string()));
        }
        self.assert_verify();
        let p = found_at.position();
        if p < KEY_BLOCK_START || p > self.key_block_end {
            return Err(Error::IllegalArgument(format!("{:?} outside {}", found_at, self.summarize())));
        }
        if found_at.is_exact() {
            return self.replace_value(key, helper, p);
        }

        let kbytes = key.encoded_bytes();
        let klength = kbytes.len();
        let hdr = self.tail_header_size;
        let length = if self.is_index_page() { 0 } else { helper.required_length(&[]) };
        let depth = found_at.depth();
        let fixup = found_at.needs_fixup();

        let mut ebc_new = depth;
        let mut reclaimed = 0;
        if fixup {
            if p >= self.key_block_end {
                return Err(Error::IllegalArgument(format!("fixup {:?} past last key", found_at)));
            }
            let kb = self.get_int(p);
            let tb = self.get_int(decode_key_block_tail(kb));
            ebc_new = decode_key_block_ebc(kb);
            let delta = depth.checked_sub(ebc_new).ok_or_else(|| {
                Error::corrupt_page(self.page, format!("fixup depth {} below successor ebc {}", depth, ebc_new))
            })?;
            let size = decode_tail_block_size(tb);
            reclaimed = round_up(size) - round_up(size - delta);
        }
        if ebc_new >= klength {
            return Err(Error::IllegalArgument(format!("{:?} does not fit key of length {}", found_at, klength)));
        }

        let suffix_length = klength - ebc_new - 1;
        let new_tail_size = suffix_length + length + hdr;
        if self.key_count() >= self.max_keys()
            || !self.will_fit((round_up(new_tail_size) + KEYBLOCK_LENGTH).saturating_sub(reclaimed))
        {
            return Ok(None);
        }

        if fixup {
            self.increase_ebc(p, depth);
        }

        let db_new = kbytes[ebc_new];
        self.key_block_end += KEYBLOCK_LENGTH;
        let new_tail = match self.alloc_tail(new_tail_size) {
            Some(tail) => tail,
            None => {
                self.key_block_end -= KEYBLOCK_LENGTH;
                self.repack()?;
                self.key_block_end += KEYBLOCK_LENGTH;
                self.alloc_tail(new_tail_size).ok_or_else(|| {
                    Error::Fatal(format!(
                        "no room for {} byte tail block after repack: {}",
                        new_tail_size,
                        self.summarize()
                    ))
                })?
            }
        };

        let kb_end = self.key_block_end;
        if p + KEYBLOCK_LENGTH < kb_end {
            self.bytes.copy_within(p..kb_end - KEYBLOCK_LENGTH, p + KEYBLOCK_LENGTH);
        }
        self.put_int(p, encode_key_block(ebc_new, db_new, new_tail));
        self.put_int(new_tail, encode_tail_block(new_tail_size, suffix_length));
        self.bytes[new_tail + hdr..new_tail + hdr + suffix_length].copy_from_slice(&kbytes[ebc_new + 1..]);

        if self.is_index_page() {
            self.put_int(new_tail + TAILBLOCK_POINTER, helper.pointer_value() as u32);
        } else {
            let offset = new_tail + hdr + suffix_length;
            let stored = helper.store_version(&[], &mut self.bytes[offset..offset + length])?;
            if stored != length {
                return Err(Error::Fatal(format!("value helper wrote {} of {} bytes", stored, length)));
            }
            if is_value_mvv(&self.bytes[offset..offset + length]) {
                self.mvv_count.increment();
            }
        }
        self.invalidate();
        self.assert_verify();
        Ok(Some(FoundAt::new(p, klength, true, false)))
    }

    fn replace_value(&mut self, key: &Key, helper: &dyn ValueHelper, p: usize) -> Result<Option<FoundAt>> {
        if p >= self.key_block_end {
            return Err(Error::IllegalArgument(format!("no key block at {} in {}", p, self.summarize())));
        }
        let kb = self.get_int(p);
        let tail = decode_key_block_tail(kb);
        let tb = self.get_int(tail);
        let klength = decode_tail_block_klength(tb);
        let old_tail_size = decode_tail_block_size(tb);
        let hdr = self.tail_header_size;
        let index_page = self.is_index_page();

        let existing: Vec<u8> = if index_page {
            Vec::new()
        } else {
            self.bytes[tail + hdr + klength..tail + old_tail_size].to_vec()
        };
        let length = if index_page { 0 } else { helper.required_length(&existing) };
        let was_mvv = !index_page && is_value_mvv(&existing);

        let new_tail_size = klength + length + hdr;
        let old_next = round_up(tail + old_tail_size);
        let new_next = round_up(tail + new_tail_size);
        let mut new_tail = tail;

        if new_next < old_next {
            self.dealloc_tail(new_next, old_next - new_next);
        } else if new_next > old_next {
            if !self.will_fit(new_next - old_next) {
                return Ok(None);
            }
            self.dealloc_tail(tail, old_tail_size);
            new_tail = match self.alloc_tail(new_tail_size) {
                Some(t) => t,
                None => {
                    self.repack()?;
                    self.alloc_tail(new_tail_size).ok_or_else(|| {
                        Error::Fatal(format!(
                            "no room to grow record to {} bytes after repack: {}",
                            new_tail_size,
                            self.summarize()
                        ))
                    })?
                }
            };
            self.put_int(p, encode_key_block_tail(kb, new_tail));
        }

        self.put_int(new_tail, encode_tail_block(new_tail_size, klength));
        if new_tail != tail {
            let kbytes = key.encoded_bytes();
            let from = kbytes.len().checked_sub(klength).ok_or_else(|| {
                Error::IllegalArgument(format!("key of length {} does not match record at {}", kbytes.len(), p))
            })?;
            self.bytes[new_tail + hdr..new_tail + hdr + klength].copy_from_slice(&kbytes[from..]);
        }

        if index_page {
            self.put_int(new_tail + TAILBLOCK_POINTER, helper.pointer_value() as u32);
        } else {
            let offset = new_tail + hdr + klength;
            let stored = helper.store_version(&existing, &mut self.bytes[offset..offset + length])?;
            if stored != length {
                return Err(Error::Fatal(format!("value helper wrote {} of {} bytes", stored, length)));
            }
            let is_mvv = is_value_mvv(&self.bytes[offset..offset + length]);
            if is_mvv && !was_mvv {
                self.mvv_count.increment();
            } else if was_mvv && !is_mvv {
                self.mvv_count.decrement();
            }
        }
        self.generation += 1;
        self.assert_verify();
        Ok(Some(FoundAt::new(p, key.encoded_size(), true, false)))
    }

    /// Removes the key blocks from `found_at1` up to `found_at2` (inclusive
    /// when `found_at2` is exact). The first surviving key after the range
    /// is re-coded against the key before it. `spare_key` is scratch space.
    pub fn remove_keys(&mut self, found_at1: FoundAt, found_at2: FoundAt, spare_key: &mut Key) -> Result<bool> {
        self.check_editable("remove_keys")?;
        self.assert_verify();
        let p1 = found_at1.position();
        let mut p2 = found_at2.position();
        if found_at2.is_exact() {
            p2 += KEYBLOCK_LENGTH;
        }
        let kb_end = self.key_block_end;
        if p1 < KEY_BLOCK_START || p1 > kb_end || p2 < KEY_BLOCK_START || p2 > kb_end {
            return Err(Error::IllegalArgument(format!(
                "remove range {}..{} outside {}",
                p1,
                p2,
                self.summarize()
            )));
        }
        if p2 <= p1 {
            return Ok(false);
        }

        if p1 > KEY_BLOCK_START {
            self.key_at_position(p1 - KEYBLOCK_LENGTH, spare_key);
        } else {
            spare_key.clear();
        }
        let hdr = self.tail_header_size;
        let mut ebc = usize::MAX;
        for p in (p1..p2).step_by(KEYBLOCK_LENGTH) {
            let kb = self.get_int(p);
            let this_ebc = decode_key_block_ebc(kb);
            ebc = ebc.min(this_ebc);
            let tail = decode_key_block_tail(kb);
            let tb = self.get_int(tail);
            let klength = decode_tail_block_klength(tb);
            spare_key.splice(this_ebc, decode_key_block_db(kb), &self.bytes[tail + hdr..tail + hdr + klength]);
            self.dealloc_tail(tail, decode_tail_block_size(tb));
        }

        self.bytes.copy_within(p2..kb_end, p1);
        self.key_block_end -= p2 - p1;

        if p1 < self.key_block_end {
            self.recode_successor(p1, ebc, spare_key)?;
        }
        self.invalidate();
        self.assert_verify();
        Ok(true)
    }

    /// After a removal, lowers the ebc of the key at `p` to `ebc`, moving
    /// the bytes it no longer shares into its tail. `removed` holds the last
    /// removed key, whose prefix supplies those bytes.
    fn recode_successor(&mut self, p: usize, ebc: usize, removed: &Key) -> Result<()> {
        let mut kb_next = self.get_int(p);
        let ebc_next = decode_key_block_ebc(kb_next);
        if ebc_next <= ebc {
            return Ok(());
        }
        let removed_bytes = removed.encoded_bytes();
        if removed_bytes.len() < ebc_next {
            return Err(Error::corrupt_page(
                self.page,
                format!("ebc {} at {} exceeds removed key length {}", ebc_next, p, removed_bytes.len()),
            ));
        }
        let hdr = self.tail_header_size;
        let mut tail_next = decode_key_block_tail(kb_next);
        let db_next = decode_key_block_db(kb_next);
        let tb_next = self.get_int(tail_next);
        let next_tail_size = decode_tail_block_size(tb_next);
        let grow = ebc_next - ebc;
        let delta = round_up(next_tail_size + grow) - round_up(next_tail_size);

        let mut new_tail = tail_next;
        let mut free_old = false;
        if delta > 0 {
            match self.alloc_tail(next_tail_size + grow) {
                Some(t) => {
                    new_tail = t;
                    free_old = true;
                }
                None => {
                    new_tail = match self.wedge_tail(tail_next, delta) {
                        Some(t) => t,
                        None => {
                            self.repack()?;
                            kb_next = self.get_int(p);
                            tail_next = decode_key_block_tail(kb_next);
                            self.wedge_tail(tail_next, delta).ok_or_else(|| {
                                Error::Fatal(format!("no room to re-code key at {}: {}", p, self.summarize()))
                            })?
                        }
                    };
                }
            }
        }

        if self.is_index_page() && new_tail != tail_next {
            let pointer = self.get_int(tail_next + TAILBLOCK_POINTER);
            self.put_int(new_tail + TAILBLOCK_POINTER, pointer);
        }
        self.bytes
            .copy_within(tail_next + hdr..tail_next + next_tail_size, new_tail + hdr + grow);
        self.bytes[new_tail + hdr + grow - 1] = db_next;
        self.bytes[new_tail + hdr..new_tail + hdr + grow - 1].copy_from_slice(&removed_bytes[ebc + 1..ebc_next]);
        self.put_int(
            new_tail,
            encode_tail_block(next_tail_size + grow, decode_tail_block_klength(tb_next) + grow),
        );
        if free_old {
            self.dealloc_tail(tail_next, next_tail_size);
        }
        self.put_int(p, encode_key_block(ebc, removed_bytes[ebc], new_tail));
        Ok(())
    }

    /// Raises the ebc of the key at `p` to `new_ebc`, dropping the newly
    /// elided bytes from its tail.
    fn increase_ebc(&mut self, p: usize, new_ebc: usize) {
        let kb = self.get_int(p);
        let old_ebc = decode_key_block_ebc(kb);
        if new_ebc <= old_ebc {
            return;
        }
        let delta = new_ebc - old_ebc;
        let hdr = self.tail_header_size;
        let tail = decode_key_block_tail(kb);
        let tb = self.get_int(tail);
        let size = decode_tail_block_size(tb);
        let klength = decode_tail_block_klength(tb);
        let db = self.bytes[tail + hdr + delta - 1];
        self.put_int(tail, encode_tail_block(size - delta, klength - delta));
        self.bytes.copy_within(tail + hdr + delta..tail + size, tail + hdr);
        let old_block = round_up(size);
        let new_block = round_up(size - delta);
        if new_block < old_block {
            self.dealloc_tail(tail + new_block, old_block - new_block);
        }
        self.put_int(p, encode_key_block(new_ebc, db, tail));
    }

    /// Lowers the ebc of the key at `p` to `new_ebc`. `key_bytes` is a key
    /// sharing at least the old ebc with it and supplies the restored bytes.
    fn reduce_ebc(&mut self, p: usize, new_ebc: usize, key_bytes: &[u8]) -> Result<()> {
        let kb = self.get_int(p);
        let old_ebc = decode_key_block_ebc(kb);
        if new_ebc >= old_ebc {
            return Ok(());
        }
        if key_bytes.len() < old_ebc {
            return Err(Error::corrupt_page(
                self.page,
                format!("cannot restore {} elided bytes from key of length {}", old_ebc, key_bytes.len()),
            ));
        }
        let hdr = self.tail_header_size;
        let grow = old_ebc - new_ebc;
        let mut tail = decode_key_block_tail(kb);
        let tb = self.get_int(tail);
        let size = decode_tail_block_size(tb);
        let klength = decode_tail_block_klength(tb);
        let delta = round_up(size + grow) - round_up(size);

        let mut new_tail = tail;
        let mut wedged = false;
        if delta > 0 {
            match self.alloc_tail(size + grow) {
                Some(t) => new_tail = t,
                None => {
                    wedged = true;
                    new_tail = match self.wedge_tail(tail, delta) {
                        Some(t) => t,
                        None => {
                            self.repack()?;
                            tail = decode_key_block_tail(self.get_int(p));
                            self.wedge_tail(tail, delta).ok_or_else(|| {
                                Error::Fatal(format!("no room to reduce ebc at {}: {}", p, self.summarize()))
                            })?
                        }
                    };
                }
            }
        }

        if self.is_index_page() && new_tail != tail {
            let pointer = self.get_int(tail + TAILBLOCK_POINTER);
            self.put_int(new_tail + TAILBLOCK_POINTER, pointer);
        }
        let old_db = decode_key_block_db(kb);
        self.bytes.copy_within(tail + hdr..tail + size, new_tail + hdr + grow);
        self.bytes[new_tail + hdr + grow - 1] = old_db;
        self.bytes[new_tail + hdr..new_tail + hdr + grow - 1].copy_from_slice(&key_bytes[new_ebc + 1..old_ebc]);
        self.put_int(new_tail, encode_tail_block(size + grow, klength + grow));
        if new_tail != tail && !wedged {
            self.dealloc_tail(tail, size);
        }
        self.put_int(p, encode_key_block(new_ebc, key_bytes[new_ebc], new_tail));
        Ok(())
    }

    // Tail block space

    fn will_fit(&self, needed: usize) -> bool {
        needed <= self.alloc - self.key_block_end + self.slack
    }

    fn alloc_tail(&mut self, size: usize) -> Option<usize> {
        let size = round_up(size);
        if self.alloc < size || self.alloc - size < self.key_block_end {
            return None;
        }
        self.alloc -= size;
        Some(self.alloc)
    }

    fn dealloc_tail(&mut self, tail: usize, size: usize) {
        let mut size = round_up(size);
        if tail == self.alloc {
            // Absorb free blocks directly above into the free gap
            while tail + size < self.buffer_size {
                let next = self.get_int(tail + size);
                let next_size = decode_tail_block_size(next);
                if decode_tail_block_inuse(next) || next_size == 0 {
                    break;
                }
                self.slack = self.slack.saturating_sub(next_size);
                self.put_int(tail + size, 0);
                size += next_size;
            }
            self.alloc += size;
        } else {
            self.put_int(tail, encode_free_block(size));
            self.slack += size;
        }
    }

    /// Opens `delta` bytes directly below `tail` by sliding every tail block
    /// between `alloc` and `tail` down. Returns the new start of the block
    /// ending where `tail`'s block ends.
    fn wedge_tail(&mut self, tail: usize, delta: usize) -> Option<usize> {
        let delta = round_up(delta);
        if delta == 0 {
            return Some(tail);
        }
        if self.alloc - self.key_block_end < delta {
            return None;
        }
        let alloc = self.alloc;
        self.bytes.copy_within(alloc..tail, alloc - delta);
        self.alloc -= delta;
        for p in (KEY_BLOCK_START..self.key_block_end).step_by(KEYBLOCK_LENGTH) {
            let kb = self.get_int(p);
            let t = decode_key_block_tail(kb);
            if kb != 0 && t < tail {
                self.put_int(p, encode_key_block_tail(kb, t - delta));
            }
        }
        Some(tail - delta)
    }

    /// Slides every live tail block to the top of the page, folding all
    /// free blocks into the gap.
    fn repack(&mut self) -> Result<()> {
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut tail = self.alloc;
        while tail < self.buffer_size {
            let tb = self.get_int(tail);
            let size = round_up(decode_tail_block_size(tb));
            if size == 0 || tail + size > self.buffer_size {
                return Err(Error::Fatal(format!(
                    "invalid tail block length {} at {} while repacking {}",
                    size,
                    tail,
                    self.summarize()
                )));
            }
            if decode_tail_block_inuse(tb) {
                live.push((tail, size));
            }
            tail += size;
        }

        let mut moved: HashMap<usize, usize> = HashMap::new();
        let mut alloc = self.buffer_size;
        for &(tail, size) in live.iter().rev() {
            alloc -= size;
            if alloc != tail {
                self.bytes.copy_within(tail..tail + size, alloc);
                moved.insert(tail, alloc);
            }
        }
        self.alloc = alloc;
        self.slack = 0;

        if !moved.is_empty() {
            for p in (KEY_BLOCK_START..self.key_block_end).step_by(KEYBLOCK_LENGTH) {
                let kb = self.get_int(p);
                if kb == 0 {
                    continue;
                }
                if let Some(&new_tail) = moved.get(&decode_key_block_tail(kb)) {
                    self.put_int(p, encode_key_block_tail(kb, new_tail));
                }
            }
        }
        Ok(())
    }

    fn clear_bytes(&mut self, from: usize, to: usize) {
        if from < to {
            self.bytes[from..to].fill(0);
        }
    }

    // Verification

    /// Checks every structural invariant of a data or index page.
    pub fn verify(&self) -> Result<()> {
        if !(self.is_data_page() || self.is_index_page()) {
            return Ok(());
        }
        let corrupt = |details: String| Error::corrupt_page(self.page, details);
        let kb_end = self.key_block_end;
        if kb_end < KEY_BLOCK_START
            || kb_end > self.alloc
            || self.alloc > self.buffer_size
            || kb_end % KEYBLOCK_LENGTH != 0
            || self.alloc % TAILBLOCK_FACTOR != 0
        {
            return Err(corrupt(format!("bad header: {}", self.summarize())));
        }
        if self.key_count() > self.max_keys() {
            return Err(corrupt(format!("{} keys exceed maximum {}", self.key_count(), self.max_keys())));
        }

        let hdr = self.tail_header_size;
        let mut referenced: HashMap<usize, usize> = HashMap::new();
        let mut previous = Key::new();
        let mut key = Key::new();
        for p in (KEY_BLOCK_START..kb_end).step_by(KEYBLOCK_LENGTH) {
            let kb = self.get_int(p);
            let ebc = decode_key_block_ebc(kb);
            let tail = decode_key_block_tail(kb);
            if p == KEY_BLOCK_START && ebc != 0 {
                return Err(corrupt(format!("first key has ebc {}", ebc)));
            }
            if tail < self.alloc || tail % TAILBLOCK_FACTOR != 0 || tail + hdr > self.buffer_size {
                return Err(corrupt(format!("key block at {} points to invalid tail {}", p, tail)));
            }
            let tb = self.get_int(tail);
            let size = decode_tail_block_size(tb);
            let klength = decode_tail_block_klength(tb);
            if !decode_tail_block_inuse(tb) {
                return Err(corrupt(format!("tail block at {} for key block {} is not in use", tail, p)));
            }
            if size < hdr + klength || tail + size > self.buffer_size {
                return Err(corrupt(format!("tail block at {} has size {} klength {}", tail, size, klength)));
            }
            if let Some(other) = referenced.insert(tail, p) {
                return Err(corrupt(format!("tail block {} shared by key blocks {} and {}", tail, other, p)));
            }

            key.splice(ebc, decode_key_block_db(kb), &self.bytes[tail + hdr..tail + hdr + klength]);
            if p > KEY_BLOCK_START && (key <= previous || previous.first_unique_byte_index(&key) != ebc) {
                return Err(corrupt(format!(
                    "key {:?} at {} does not follow {:?} with ebc {}",
                    key, p, previous, ebc
                )));
            }

            if self.is_index_page() {
                let pointer = self.get_int(tail + TAILBLOCK_POINTER) as i32;
                if pointer == -1 && p + KEYBLOCK_LENGTH != kb_end {
                    return Err(corrupt(format!("missing child pointer at {}", p)));
                }
            } else {
                let (offset, length) = self.value_span(p);
                if !mvv::verify(&self.bytes[offset..offset + length]) {
                    return Err(corrupt(format!("invalid MVV at {}", p)));
                }
            }
            previous.set_encoded(key.encoded_bytes());
        }

        let mut tail = self.alloc;
        let mut live = 0;
        let mut free = 0;
        while tail < self.buffer_size {
            let tb = self.get_int(tail);
            let size = round_up(decode_tail_block_size(tb));
            if size < TAILBLOCK_FACTOR || tail + size > self.buffer_size {
                return Err(corrupt(format!("tail block at {} has invalid size {}", tail, size)));
            }
            if decode_tail_block_inuse(tb) {
                if !referenced.contains_key(&tail) {
                    return Err(corrupt(format!("orphan tail block at {}", tail)));
                }
                live += 1;
            } else {
                if referenced.contains_key(&tail) {
                    return Err(corrupt(format!("free tail block at {} is referenced", tail)));
                }
                free += size;
            }
            tail += size;
        }
        if live != referenced.len() {
            return Err(corrupt(format!("{} live tail blocks for {} keys", live, referenced.len())));
        }
        if free != self.slack {
            return Err(corrupt(format!("free blocks total {} but slack is {}", free, self.slack)));
        }
        Ok(())
    }

    #[inline]
    fn assert_verify(&self) {
        #[cfg(debug_assertions)]
        if let Err(e) = self.verify() {
            panic!("{}", e);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({})", self.summarize())
    }
}
