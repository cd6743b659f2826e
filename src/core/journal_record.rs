//! Journal record codecs.
//!
//! Every record starts with the same 16-byte prefix, all fields big-endian:
//!
//! ```text
//! +0  length     u32  whole record, prefix included
//! +4  type       u16  two ASCII characters
//! +6  reserved   u16
//! +8  timestamp  u64
//! ```
//!
//! TX records carry a sequence of update sub-records with a 6-byte prefix
//! (length u32, type u16).

use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::page_node::{PageNode, TransactionMapItem};
use crate::core::volume::VolumeSpecification;

pub const OVERHEAD: usize = 16;

const fn code(tag: &[u8; 2]) -> u16 {
    ((tag[0] as u16) << 8) | tag[1] as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    JournalHeader,
    JournalEnd,
    IdentifyVolume,
    IdentifyTree,
    PageImage,
    PageMap,
    TransactionMap,
    Transaction,
    Checkpoint,
}

impl RecordType {
    pub const ALL: [RecordType; 9] = [
        RecordType::JournalHeader,
        RecordType::JournalEnd,
        RecordType::IdentifyVolume,
        RecordType::IdentifyTree,
        RecordType::PageImage,
        RecordType::PageMap,
        RecordType::TransactionMap,
        RecordType::Transaction,
        RecordType::Checkpoint,
    ];

    pub const fn code(self) -> u16 {
        match self {
            RecordType::JournalHeader => code(b"JH"),
            RecordType::JournalEnd => code(b"JE"),
            RecordType::IdentifyVolume => code(b"IV"),
            RecordType::IdentifyTree => code(b"IT"),
            RecordType::PageImage => code(b"PA"),
            RecordType::PageMap => code(b"PM"),
            RecordType::TransactionMap => code(b"TM"),
            RecordType::Transaction => code(b"TX"),
            RecordType::Checkpoint => code(b"CP"),
        }
    }

    pub fn from_code(value: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.code() == value)
    }

    /// Fixed part of the record, prefix included.
    pub const fn overhead(self) -> usize {
        match self {
            RecordType::JournalHeader => JH_OVERHEAD,
            RecordType::JournalEnd => JE_OVERHEAD,
            RecordType::IdentifyVolume => IV_OVERHEAD,
            RecordType::IdentifyTree => IT_OVERHEAD,
            RecordType::PageImage => PA_OVERHEAD,
            RecordType::PageMap | RecordType::TransactionMap => OVERHEAD,
            RecordType::Transaction => TX_OVERHEAD,
            RecordType::Checkpoint => CP_OVERHEAD,
        }
    }

    pub fn tag(self) -> String {
        let c = self.code().to_be_bytes();
        String::from_utf8_lossy(&c).into_owned()
    }
}

pub const JH_OVERHEAD: usize = OVERHEAD + 36;
pub const JE_OVERHEAD: usize = OVERHEAD + 24;
pub const IV_OVERHEAD: usize = OVERHEAD + 12;
pub const IT_OVERHEAD: usize = OVERHEAD + 8;
pub const PA_OVERHEAD: usize = OVERHEAD + 20;
pub const PM_ENTRY_SIZE: usize = 28;
pub const TM_ENTRY_SIZE: usize = 32;
pub const TX_OVERHEAD: usize = OVERHEAD + 16;
pub const CP_OVERHEAD: usize = OVERHEAD + 16;

/// Largest record the reader accepts; bounds reads of a damaged length field.
pub const MAX_RECORD_SIZE: usize = MAX_BUFFER_SIZE + PA_OVERHEAD + TRANSACTION_BUFFER_SIZE;

const _: () = assert!(MINIMUM_WRITE_BUFFER_SIZE >= MAX_RECORD_SIZE);

// Field access

pub(crate) fn get_u16(bytes: &[u8], at: usize) -> Result<u16> {
    bytes
        .get(at..at + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| short_record(at + 2, bytes.len()))
}

pub(crate) fn get_u32(bytes: &[u8], at: usize) -> Result<u32> {
    Ok(u32::from_be_bytes(field::<4>(bytes, at)?))
}

pub(crate) fn get_u64(bytes: &[u8], at: usize) -> Result<u64> {
    Ok(u64::from_be_bytes(field::<8>(bytes, at)?))
}

fn field<const N: usize>(bytes: &[u8], at: usize) -> Result<[u8; N]> {
    let slice = bytes.get(at..at + N).ok_or_else(|| short_record(at + N, bytes.len()))?;
    Ok(slice.try_into()?)
}

fn short_record(needed: usize, len: usize) -> Error {
    Error::corrupt_journal(0, format!("record of {} bytes is too short, need {}", len, needed))
}

/// Attaches `address` to a corruption error raised while decoding a record.
pub(crate) fn at_address(err: Error, address: JournalAddress) -> Error {
    match err {
        Error::CorruptJournal { address: 0, details } => Error::CorruptJournal { address, details },
        other => other,
    }
}

fn put_prefix(out: &mut Vec<u8>, record_type: RecordType, length: usize, timestamp: u64) {
    out.extend_from_slice(&(length as u32).to_be_bytes());
    out.extend_from_slice(&record_type.code().to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
}

/// The common prefix of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub length: usize,
    pub type_code: u16,
    pub timestamp: u64,
}

impl RecordHeader {
    pub fn read(bytes: &[u8]) -> Result<Self> {
        Ok(Self {
            length: get_u32(bytes, 0)? as usize,
            type_code: get_u16(bytes, 4)?,
            timestamp: get_u64(bytes, 8)?,
        })
    }

    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_code(self.type_code)
    }

    /// Checks the length and type of the record at `address`.
    pub fn validate(&self, address: JournalAddress) -> Result<RecordType> {
        let record_type = self.record_type().ok_or_else(|| {
            Error::corrupt_journal(address, format!("invalid record type {:#06x}", self.type_code))
        })?;
        if self.length < record_type.overhead() || self.length > MAX_RECORD_SIZE {
            return Err(Error::corrupt_journal(
                address,
                format!("{} record has invalid length {}", record_type.tag(), self.length),
            ));
        }
        Ok(record_type)
    }
}

fn expect_type(bytes: &[u8], expected: RecordType) -> Result<RecordHeader> {
    let header = RecordHeader::read(bytes)?;
    if header.type_code != expected.code() {
        return Err(Error::corrupt_journal(
            0,
            format!("expected {} record, found type {:#06x}", expected.tag(), header.type_code),
        ));
    }
    if header.length < expected.overhead() || header.length > bytes.len() {
        return Err(Error::corrupt_journal(
            0,
            format!("{} record length {} does not fit {} bytes", expected.tag(), header.length, bytes.len()),
        ));
    }
    Ok(header)
}

fn text(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec()).map_err(|e| Error::corrupt_journal(0, format!("invalid UTF-8 text: {}", e)))
}

/// JH: first record of every journal file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalHeader {
    pub timestamp: u64,
    pub version: u32,
    pub block_size: u64,
    pub base_address: JournalAddress,
    pub current_address: JournalAddress,
    pub created: u64,
    pub path: String,
}

impl JournalHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_prefix(out, RecordType::JournalHeader, JH_OVERHEAD + self.path.len(), self.timestamp);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.block_size.to_be_bytes());
        out.extend_from_slice(&self.base_address.to_be_bytes());
        out.extend_from_slice(&self.current_address.to_be_bytes());
        out.extend_from_slice(&self.created.to_be_bytes());
        out.extend_from_slice(self.path.as_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = expect_type(bytes, RecordType::JournalHeader)?;
        Ok(Self {
            timestamp: header.timestamp,
            version: get_u32(bytes, 16)?,
            block_size: get_u64(bytes, 20)?,
            base_address: get_u64(bytes, 28)?,
            current_address: get_u64(bytes, 36)?,
            created: get_u64(bytes, 44)?,
            path: text(&bytes[JH_OVERHEAD..header.length])?,
        })
    }
}

/// JE: last record of a journal file that was closed or rolled over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalEnd {
    pub timestamp: u64,
    pub current_address: JournalAddress,
    pub base_address: JournalAddress,
    pub created: u64,
}

impl JournalEnd {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_prefix(out, RecordType::JournalEnd, JE_OVERHEAD, self.timestamp);
        out.extend_from_slice(&self.current_address.to_be_bytes());
        out.extend_from_slice(&self.base_address.to_be_bytes());
        out.extend_from_slice(&self.created.to_be_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = expect_type(bytes, RecordType::JournalEnd)?;
        Ok(Self {
            timestamp: header.timestamp,
            current_address: get_u64(bytes, 16)?,
            base_address: get_u64(bytes, 24)?,
            created: get_u64(bytes, 32)?,
        })
    }
}

/// IV: binds a volume handle to a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyVolume {
    pub timestamp: u64,
    pub handle: u32,
    pub specification: VolumeSpecification,
}

impl IdentifyVolume {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let json = self.specification.to_json()?;
        put_prefix(out, RecordType::IdentifyVolume, IV_OVERHEAD + json.len(), self.timestamp);
        out.extend_from_slice(&self.handle.to_be_bytes());
        out.extend_from_slice(&self.specification.id.to_be_bytes());
        out.extend_from_slice(json.as_bytes());
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = expect_type(bytes, RecordType::IdentifyVolume)?;
        let id = get_u64(bytes, 20)?;
        let specification = VolumeSpecification::from_json(&text(&bytes[IV_OVERHEAD..header.length])?)?;
        if specification.id != id {
            return Err(Error::corrupt_journal(
                0,
                format!("IV record id {} does not match specification id {}", id, specification.id),
            ));
        }
        Ok(Self {
            timestamp: header.timestamp,
            handle: get_u32(bytes, 16)?,
            specification,
        })
    }
}

/// IT: binds a tree handle to a tree name within a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyTree {
    pub timestamp: u64,
    pub handle: u32,
    pub volume_handle: u32,
    pub tree_name: String,
}

impl IdentifyTree {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_prefix(out, RecordType::IdentifyTree, IT_OVERHEAD + self.tree_name.len(), self.timestamp);
        out.extend_from_slice(&self.handle.to_be_bytes());
        out.extend_from_slice(&self.volume_handle.to_be_bytes());
        out.extend_from_slice(self.tree_name.as_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = expect_type(bytes, RecordType::IdentifyTree)?;
        Ok(Self {
            timestamp: header.timestamp,
            handle: get_u32(bytes, 16)?,
            volume_handle: get_u32(bytes, 20)?,
            tree_name: text(&bytes[IT_OVERHEAD..header.length])?,
        })
    }
}

/// Fixed part of a PA record. The payload that follows holds `left_size`
/// bytes from the front of the page, then the bytes from the page's tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageImageHeader {
    pub length: usize,
    pub timestamp: u64,
    pub volume_handle: u32,
    pub left_size: usize,
    pub buffer_size: usize,
    pub page_address: PageAddress,
}

impl PageImageHeader {
    pub fn payload_size(&self) -> usize {
        self.length - PA_OVERHEAD
    }

    pub fn right_size(&self) -> usize {
        self.payload_size() - self.left_size
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = RecordHeader::read(bytes)?;
        if header.type_code != RecordType::PageImage.code() {
            return Err(Error::corrupt_journal(
                0,
                format!("expected PA record, found type {:#06x}", header.type_code),
            ));
        }
        Ok(Self {
            length: header.length,
            timestamp: header.timestamp,
            volume_handle: get_u32(bytes, 16)?,
            left_size: get_u32(bytes, 20)? as usize,
            buffer_size: get_u32(bytes, 24)? as usize,
            page_address: get_u64(bytes, 28)?,
        })
    }
}

/// Encodes a PA record for `page`, omitting the bytes between `left_size`
/// and `page.len() - right_size`.
pub fn encode_page_image(
    out: &mut Vec<u8>,
    timestamp: u64,
    volume_handle: u32,
    page_address: PageAddress,
    page: &[u8],
    left_size: usize,
    right_size: usize,
) {
    let length = PA_OVERHEAD + left_size + right_size;
    put_prefix(out, RecordType::PageImage, length, timestamp);
    out.extend_from_slice(&volume_handle.to_be_bytes());
    out.extend_from_slice(&(left_size as u32).to_be_bytes());
    out.extend_from_slice(&(page.len() as u32).to_be_bytes());
    out.extend_from_slice(&page_address.to_be_bytes());
    out.extend_from_slice(&page[..left_size]);
    out.extend_from_slice(&page[page.len() - right_size..]);
}

/// PM: snapshot of page map entries.
pub fn encode_page_map(out: &mut Vec<u8>, timestamp: u64, entries: &[PageNode]) {
    put_prefix(out, RecordType::PageMap, OVERHEAD + entries.len() * PM_ENTRY_SIZE, timestamp);
    for node in entries {
        out.extend_from_slice(&node.timestamp.to_be_bytes());
        out.extend_from_slice(&node.journal_address.to_be_bytes());
        out.extend_from_slice(&node.volume_handle.to_be_bytes());
        out.extend_from_slice(&node.page_address.to_be_bytes());
    }
}

pub fn decode_page_map(bytes: &[u8]) -> Result<Vec<PageNode>> {
    let header = expect_type(bytes, RecordType::PageMap)?;
    let body = &bytes[OVERHEAD..header.length];
    if body.len() % PM_ENTRY_SIZE != 0 {
        return Err(Error::corrupt_journal(0, format!("PM record body of {} bytes", body.len())));
    }
    body.chunks_exact(PM_ENTRY_SIZE)
        .map(|e| {
            Ok(PageNode::new(
                get_u32(e, 16)?,
                get_u64(e, 20)?,
                get_u64(e, 8)?,
                get_u64(e, 0)?,
            ))
        })
        .collect()
}

/// TM: snapshot of the live transaction map.
pub fn encode_transaction_map(out: &mut Vec<u8>, timestamp: u64, entries: &[TransactionMapItem]) {
    put_prefix(out, RecordType::TransactionMap, OVERHEAD + entries.len() * TM_ENTRY_SIZE, timestamp);
    for item in entries {
        out.extend_from_slice(&item.start_timestamp.to_be_bytes());
        out.extend_from_slice(&item.commit_timestamp.to_be_bytes());
        out.extend_from_slice(&item.start_address.to_be_bytes());
        out.extend_from_slice(&item.last_record_address.to_be_bytes());
    }
}

pub fn decode_transaction_map(bytes: &[u8]) -> Result<Vec<TransactionMapItem>> {
    let header = expect_type(bytes, RecordType::TransactionMap)?;
    let body = &bytes[OVERHEAD..header.length];
    if body.len() % TM_ENTRY_SIZE != 0 {
        return Err(Error::corrupt_journal(0, format!("TM record body of {} bytes", body.len())));
    }
    body.chunks_exact(TM_ENTRY_SIZE)
        .map(|e| {
            Ok(TransactionMapItem {
                start_timestamp: get_u64(e, 0)?,
                commit_timestamp: get_u64(e, 8)?,
                start_address: get_u64(e, 16)?,
                last_record_address: get_u64(e, 24)?,
            })
        })
        .collect()
}

/// Fixed part of a TX record. The record timestamp is the transaction's
/// start timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionHeader {
    pub length: usize,
    pub start_timestamp: u64,
    pub commit_timestamp: u64,
    pub backchain_address: JournalAddress,
}

impl TransactionHeader {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = RecordHeader::read(bytes)?;
        if header.type_code != RecordType::Transaction.code() {
            return Err(Error::corrupt_journal(
                0,
                format!("expected TX record, found type {:#06x}", header.type_code),
            ));
        }
        Ok(Self {
            length: header.length,
            start_timestamp: header.timestamp,
            commit_timestamp: get_u64(bytes, 16)?,
            backchain_address: get_u64(bytes, 24)?,
        })
    }
}

pub fn encode_transaction(
    out: &mut Vec<u8>,
    start_timestamp: u64,
    commit_timestamp: u64,
    backchain_address: JournalAddress,
    updates: &[u8],
) {
    put_prefix(out, RecordType::Transaction, TX_OVERHEAD + updates.len(), start_timestamp);
    out.extend_from_slice(&commit_timestamp.to_be_bytes());
    out.extend_from_slice(&backchain_address.to_be_bytes());
    out.extend_from_slice(updates);
}

/// CP: a completed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub timestamp: u64,
    pub system_time_millis: u64,
    pub base_address: JournalAddress,
}

impl CheckpointRecord {
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_prefix(out, RecordType::Checkpoint, CP_OVERHEAD, self.timestamp);
        out.extend_from_slice(&self.system_time_millis.to_be_bytes());
        out.extend_from_slice(&self.base_address.to_be_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = expect_type(bytes, RecordType::Checkpoint)?;
        Ok(Self {
            timestamp: header.timestamp,
            system_time_millis: get_u64(bytes, 16)?,
            base_address: get_u64(bytes, 24)?,
        })
    }
}

// Update sub-records carried inside TX records

pub const UPDATE_PREFIX: usize = 6;
pub const SR_OVERHEAD: usize = UPDATE_PREFIX + 6;
pub const DR_OVERHEAD: usize = UPDATE_PREFIX + 8;
pub const DT_OVERHEAD: usize = UPDATE_PREFIX + 4;
pub const D0_OVERHEAD: usize = UPDATE_PREFIX + 8;
pub const D1_OVERHEAD: usize = UPDATE_PREFIX + 16;

pub const SR_TYPE: u16 = code(b"SR");
pub const DR_TYPE: u16 = code(b"DR");
pub const DT_TYPE: u16 = code(b"DT");
pub const D0_TYPE: u16 = code(b"D0");
pub const D1_TYPE: u16 = code(b"D1");

/// One update carried by a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    Store { tree_handle: u32, key: Vec<u8>, value: Vec<u8> },
    /// Removes `[key1, key2)`.
    RemoveRange { tree_handle: u32, key1: Vec<u8>, key2: Vec<u8> },
    RemoveTree { tree_handle: u32 },
    /// Accumulator increment by one.
    DeltaOne { tree_handle: u32, index: u16, accumulator_type: u16 },
    Delta { tree_handle: u32, index: u16, accumulator_type: u16, value: i64 },
}

impl Update {
    pub fn tree_handle(&self) -> u32 {
        match *self {
            Update::Store { tree_handle, .. }
            | Update::RemoveRange { tree_handle, .. }
            | Update::RemoveTree { tree_handle }
            | Update::DeltaOne { tree_handle, .. }
            | Update::Delta { tree_handle, .. } => tree_handle,
        }
    }

    pub fn encoded_size(&self) -> usize {
        match self {
            Update::Store { key, value, .. } => SR_OVERHEAD + key.len() + value.len(),
            Update::RemoveRange { key1, key2, .. } => {
                DR_OVERHEAD + key1.len() + key2.len() - common_prefix(key1, key2)
            }
            Update::RemoveTree { .. } => DT_OVERHEAD,
            Update::DeltaOne { .. } => D0_OVERHEAD,
            Update::Delta { .. } => D1_OVERHEAD,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        let length = self.encoded_size() as u32;
        out.extend_from_slice(&length.to_be_bytes());
        match self {
            Update::Store { tree_handle, key, value } => {
                out.extend_from_slice(&SR_TYPE.to_be_bytes());
                out.extend_from_slice(&tree_handle.to_be_bytes());
                out.extend_from_slice(&(key.len() as u16).to_be_bytes());
                out.extend_from_slice(key);
                out.extend_from_slice(value);
            }
            Update::RemoveRange { tree_handle, key1, key2 } => {
                let elision = common_prefix(key1, key2);
                out.extend_from_slice(&DR_TYPE.to_be_bytes());
                out.extend_from_slice(&tree_handle.to_be_bytes());
                out.extend_from_slice(&(key1.len() as u16).to_be_bytes());
                out.extend_from_slice(&(elision as u16).to_be_bytes());
                out.extend_from_slice(key1);
                out.extend_from_slice(&key2[elision..]);
            }
            Update::RemoveTree { tree_handle } => {
                out.extend_from_slice(&DT_TYPE.to_be_bytes());
                out.extend_from_slice(&tree_handle.to_be_bytes());
            }
            Update::DeltaOne { tree_handle, index, accumulator_type } => {
                out.extend_from_slice(&D0_TYPE.to_be_bytes());
                out.extend_from_slice(&tree_handle.to_be_bytes());
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&accumulator_type.to_be_bytes());
            }
            Update::Delta { tree_handle, index, accumulator_type, value } => {
                out.extend_from_slice(&D1_TYPE.to_be_bytes());
                out.extend_from_slice(&tree_handle.to_be_bytes());
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&accumulator_type.to_be_bytes());
                out.extend_from_slice(&value.to_be_bytes());
            }
        }
    }

    /// Decodes the sub-record at the front of `bytes`, returning it with its
    /// encoded size.
    pub fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let length = get_u32(bytes, 0)? as usize;
        let type_code = get_u16(bytes, 4)?;
        let minimum = match type_code {
            SR_TYPE => SR_OVERHEAD,
            DR_TYPE => DR_OVERHEAD,
            DT_TYPE => DT_OVERHEAD,
            D0_TYPE => D0_OVERHEAD,
            D1_TYPE => D1_OVERHEAD,
            other => {
                return Err(Error::corrupt_journal(0, format!("invalid update type {:#06x}", other)));
            }
        };
        if length < minimum || length > bytes.len() {
            return Err(Error::corrupt_journal(
                0,
                format!("update of type {:#06x} has invalid length {}", type_code, length),
            ));
        }
        let body = &bytes[..length];
        let tree_handle = get_u32(body, 6)?;
        let update = match type_code {
            SR_TYPE => {
                let key_size = get_u16(body, 10)? as usize;
                if SR_OVERHEAD + key_size > length {
                    return Err(Error::corrupt_journal(0, format!("store key size {} overruns update", key_size)));
                }
                Update::Store {
                    tree_handle,
                    key: body[SR_OVERHEAD..SR_OVERHEAD + key_size].to_vec(),
                    value: body[SR_OVERHEAD + key_size..].to_vec(),
                }
            }
            DR_TYPE => {
                let key1_size = get_u16(body, 10)? as usize;
                let elision = get_u16(body, 12)? as usize;
                if DR_OVERHEAD + key1_size > length || elision > key1_size {
                    return Err(Error::corrupt_journal(
                        0,
                        format!("remove range key sizes {}/{} overrun update", key1_size, elision),
                    ));
                }
                let key1 = body[DR_OVERHEAD..DR_OVERHEAD + key1_size].to_vec();
                let mut key2 = key1[..elision].to_vec();
                key2.extend_from_slice(&body[DR_OVERHEAD + key1_size..]);
                Update::RemoveRange { tree_handle, key1, key2 }
            }
            DT_TYPE => Update::RemoveTree { tree_handle },
            D0_TYPE => Update::DeltaOne {
                tree_handle,
                index: get_u16(body, 10)?,
                accumulator_type: get_u16(body, 12)?,
            },
            _ => Update::Delta {
                tree_handle,
                index: get_u16(body, 10)?,
                accumulator_type: get_u16(body, 12)?,
                value: get_u64(body, 14)? as i64,
            },
        };
        Ok((update, length))
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count().min(u16::MAX as usize)
}

/// Encodes a list of updates as the body of a TX record.
pub fn encode_updates(updates: &[Update]) -> Vec<u8> {
    let mut out = Vec::with_capacity(updates.iter().map(Update::encoded_size).sum());
    for update in updates {
        update.encode(&mut out);
    }
    out
}

pub fn decode_updates(mut bytes: &[u8]) -> Result<Vec<Update>> {
    let mut updates = Vec::new();
    while !bytes.is_empty() {
        let (update, size) = Update::decode(bytes)?;
        updates.push(update);
        bytes = &bytes[size..];
    }
    Ok(updates)
}
