//! Journal recovery scan.
//!
//! The newest journal file with a readable JH record is the keystone. Every
//! file starts with a snapshot of the journal manager's state (handles, page
//! map, transaction map, last checkpoint), so the scan starts at the keystone
//! and reads forward to the end of the last file. A torn record at the end of
//! the last file ends the scan; anywhere else it is corruption.

use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::journal_record::*;
use crate::core::page_node::*;
use crate::core::volume::VolumeSpecification;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

/// Name of the journal file holding `generation`.
pub fn journal_file_path(path: &Path, generation: u64) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{:0width$}", generation, width = JOURNAL_GENERATION_DIGITS));
    PathBuf::from(name)
}

/// Generations of the journal files present on disk, oldest first.
pub fn list_generations(path: &Path) -> Result<Vec<u64>> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let prefix = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => format!("{}.", name),
        None => {
            return Err(Error::InvalidConfig {
                field: "path".to_string(),
                reason: format!("{} does not name a file", path.display()),
            })
        }
    };
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut generations = Vec::new();
    for entry in fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(&prefix) else { continue };
        if suffix.len() == JOURNAL_GENERATION_DIGITS && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(generation) = suffix.parse::<u64>() {
                generations.push(generation);
            }
        }
    }
    generations.sort_unstable();
    Ok(generations)
}

/// Summary of what recovery found, kept for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub files_scanned: usize,
    pub records: u64,
    pub keystone_address: JournalAddress,
    pub base_address: JournalAddress,
    pub end_address: JournalAddress,
    pub pages: usize,
    pub branch_pages: usize,
    pub committed_transactions: usize,
    pub aborted_transactions: usize,
    pub uncommitted_transactions: usize,
    pub last_valid_checkpoint: Checkpoint,
    /// False when the scan stopped at a torn record.
    pub clean_end: bool,
}

/// State rebuilt by the scan, installed into a fresh journal manager.
#[derive(Debug, Default)]
pub(crate) struct RecoveredJournal {
    pub(crate) block_size: u64,
    pub(crate) base_address: JournalAddress,
    pub(crate) next_address: JournalAddress,
    pub(crate) first_generation: u64,
    pub(crate) journal_created: u64,
    pub(crate) volumes: BTreeMap<u32, VolumeSpecification>,
    pub(crate) trees: BTreeMap<u32, TreeDescriptor>,
    pub(crate) page_map: BTreeMap<PageKey, PageChain>,
    pub(crate) branch_map: BTreeMap<PageKey, PageChain>,
    pub(crate) live_transactions: BTreeMap<u64, TransactionMapItem>,
    pub(crate) last_valid_checkpoint: Checkpoint,
    pub(crate) last_valid_checkpoint_address: JournalAddress,
    pub(crate) last_valid_checkpoint_base_address: JournalAddress,
    pub(crate) max_timestamp: u64,
    pub(crate) report: RecoveryReport,
}

enum Fill {
    Full,
    Empty,
    Partial,
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(match filled {
        0 => Fill::Empty,
        n if n == buf.len() => Fill::Full,
        _ => Fill::Partial,
    })
}

/// Reads the JH record at the front of a journal file. Returns `None` when
/// the file has no readable header.
fn read_journal_header(file_path: &Path) -> Result<Option<JournalHeader>> {
    let mut reader = BufReader::new(File::open(file_path)?);
    let mut prefix = [0u8; OVERHEAD];
    if !matches!(read_or_eof(&mut reader, &mut prefix)?, Fill::Full) {
        return Ok(None);
    }
    let header = RecordHeader::read(&prefix)?;
    if header.type_code != RecordType::JournalHeader.code() || header.validate(0).is_err() {
        return Ok(None);
    }
    let mut record = vec![0u8; header.length];
    record[..OVERHEAD].copy_from_slice(&prefix);
    if !matches!(read_or_eof(&mut reader, &mut record[OVERHEAD..])?, Fill::Full) {
        return Ok(None);
    }
    Ok(JournalHeader::decode(&record).ok())
}

struct Scanner<'a> {
    path: &'a Path,
    state: RecoveredJournal,
}

/// Runs the recovery scan over the journal files at `path`. A journal with
/// no files recovers to an empty state using `block_size`.
pub(crate) fn recover(path: &Path, block_size: u64) -> Result<RecoveredJournal> {
    let generations = list_generations(path)?;
    let mut state = RecoveredJournal {
        block_size,
        report: RecoveryReport {
            clean_end: true,
            ..RecoveryReport::default()
        },
        ..RecoveredJournal::default()
    };
    let (Some(&first), Some(&last)) = (generations.first(), generations.last()) else {
        tracing::debug!(path = %path.display(), "no journal files, starting empty");
        return Ok(state);
    };

    let mut keystone = None;
    for &generation in generations.iter().rev() {
        match read_journal_header(&journal_file_path(path, generation))? {
            Some(header) => {
                keystone = Some((generation, header));
                break;
            }
            None => tracing::warn!(generation, "journal file has no valid header"),
        }
    }
    let (keystone_generation, header) = keystone
        .ok_or_else(|| Error::corrupt_journal(first * block_size, "no journal file has a valid JH record"))?;
    if header.version != JOURNAL_VERSION {
        return Err(Error::corrupt_journal(
            header.current_address,
            format!("unsupported journal version {}", header.version),
        ));
    }
    if !(MINIMUM_BLOCK_SIZE..=MAXIMUM_BLOCK_SIZE).contains(&header.block_size) {
        return Err(Error::corrupt_journal(
            header.current_address,
            format!("invalid block size {}", header.block_size),
        ));
    }
    let block_size = header.block_size;
    if header.current_address != keystone_generation * block_size {
        return Err(Error::corrupt_journal(
            header.current_address,
            format!("JH record does not belong to generation {}", keystone_generation),
        ));
    }
    for generation in header.base_address / block_size..=last {
        if !generations.contains(&generation) {
            return Err(Error::corrupt_journal(
                generation * block_size,
                format!("missing journal file {}", journal_file_path(path, generation).display()),
            ));
        }
    }

    state.block_size = block_size;
    state.base_address = header.base_address;
    state.journal_created = header.created;
    state.first_generation = first;
    state.next_address = (last + 1) * block_size;
    state.report.keystone_address = header.current_address;

    let mut scanner = Scanner { path, state };
    for generation in keystone_generation..=last {
        let more = scanner.scan_file(generation, generation == last)?;
        scanner.state.report.files_scanned += 1;
        if !more {
            break;
        }
    }
    let mut state = scanner.state;
    state.finish();
    tracing::info!(
        path = %path.display(),
        base = state.base_address,
        end = state.report.end_address,
        pages = state.report.pages,
        transactions = state.live_transactions.len(),
        checkpoint = state.last_valid_checkpoint.timestamp,
        "journal recovered"
    );
    Ok(state)
}

impl Scanner<'_> {
    /// Scans one file. Returns false when the scan must stop.
    fn scan_file(&mut self, generation: u64, is_last: bool) -> Result<bool> {
        let block_size = self.state.block_size;
        let file_path = journal_file_path(self.path, generation);
        let mut reader = BufReader::with_capacity(64 * 1024, File::open(&file_path)?);
        let mut offset = 0u64;
        loop {
            let address = generation * block_size + offset;
            let mut prefix = [0u8; OVERHEAD];
            match read_or_eof(&mut reader, &mut prefix)? {
                Fill::Empty => return Ok(true),
                Fill::Partial => return self.torn(address, is_last, "truncated record prefix"),
                Fill::Full => {}
            }
            let header = RecordHeader::read(&prefix)?;
            let record_type = match header.validate(address) {
                Ok(t) => t,
                Err(e) => return self.torn(address, is_last, &e.to_string()),
            };
            if offset == 0 && record_type != RecordType::JournalHeader {
                return self.torn(address, is_last, "file does not start with a JH record");
            }
            if offset + header.length as u64 > block_size {
                return self.torn(address, is_last, "record crosses the end of the file");
            }
            let mut record = vec![0u8; header.length];
            record[..OVERHEAD].copy_from_slice(&prefix);
            if !matches!(read_or_eof(&mut reader, &mut record[OVERHEAD..])?, Fill::Full) {
                return self.torn(address, is_last, "truncated record body");
            }

            self.apply(record_type, address, &record).map_err(|e| at_address(e, address))?;
            self.state.report.records += 1;
            self.state.report.end_address = address + header.length as u64;
            if record_type == RecordType::JournalEnd {
                return Ok(true);
            }
            offset += header.length as u64;
        }
    }

    fn torn(&mut self, address: JournalAddress, is_last: bool, reason: &str) -> Result<bool> {
        if !is_last {
            return Err(Error::corrupt_journal(address, reason.to_string()));
        }
        tracing::info!(address, reason, "journal ends at torn record");
        self.state.report.clean_end = false;
        Ok(false)
    }

    fn apply(&mut self, record_type: RecordType, address: JournalAddress, record: &[u8]) -> Result<()> {
        let state = &mut self.state;
        match record_type {
            RecordType::JournalHeader => {
                let header = JournalHeader::decode(record)?;
                if header.block_size != state.block_size {
                    return Err(Error::corrupt_journal(
                        address,
                        format!("block size {} differs from {}", header.block_size, state.block_size),
                    ));
                }
                state.base_address = state.base_address.max(header.base_address);
                state.max_timestamp = state.max_timestamp.max(header.timestamp);
            }
            RecordType::JournalEnd => {}
            RecordType::IdentifyVolume => {
                let iv = IdentifyVolume::decode(record)?;
                state.volumes.insert(iv.handle, iv.specification);
            }
            RecordType::IdentifyTree => {
                let it = IdentifyTree::decode(record)?;
                state
                    .trees
                    .insert(it.handle, TreeDescriptor::new(it.volume_handle, &it.tree_name));
            }
            RecordType::PageImage => {
                let pa = PageImageHeader::decode(record)?;
                if pa.left_size > pa.payload_size() || pa.payload_size() > pa.buffer_size {
                    return Err(Error::corrupt_journal(
                        address,
                        format!("PA record sizes {}/{}/{}", pa.left_size, pa.payload_size(), pa.buffer_size),
                    ));
                }
                state.max_timestamp = state.max_timestamp.max(pa.timestamp);
                merge_node(
                    &mut state.page_map,
                    PageNode::new(pa.volume_handle, pa.page_address, address, pa.timestamp),
                );
            }
            RecordType::PageMap => {
                for node in decode_page_map(record)? {
                    state.max_timestamp = state.max_timestamp.max(node.timestamp);
                    merge_node(&mut state.page_map, node);
                }
            }
            RecordType::TransactionMap => {
                for item in decode_transaction_map(record)? {
                    state.max_timestamp = state.max_timestamp.max(item.start_timestamp);
                    if item.is_committed() {
                        state.max_timestamp = state.max_timestamp.max(item.commit_timestamp);
                    }
                    state.live_transactions.insert(item.start_timestamp, item);
                }
            }
            RecordType::Transaction => {
                let tx = TransactionHeader::decode(record)?;
                state.max_timestamp = state.max_timestamp.max(tx.start_timestamp);
                if tx.commit_timestamp == ABORTED {
                    return Ok(());
                }
                state.max_timestamp = state.max_timestamp.max(tx.commit_timestamp);
                match state.live_transactions.get_mut(&tx.start_timestamp) {
                    Some(item) => {
                        if tx.backchain_address != 0 {
                            item.last_record_address = address;
                        }
                        item.commit_timestamp = tx.commit_timestamp;
                    }
                    None => {
                        let mut item = TransactionMapItem::new(tx.start_timestamp, address);
                        item.commit_timestamp = tx.commit_timestamp;
                        state.live_transactions.insert(tx.start_timestamp, item);
                    }
                }
            }
            RecordType::Checkpoint => {
                let cp = CheckpointRecord::decode(record)?;
                state.max_timestamp = state.max_timestamp.max(cp.timestamp);
                state.last_valid_checkpoint = Checkpoint::new(cp.timestamp, cp.system_time_millis);
                state.last_valid_checkpoint_address = address;
                state.last_valid_checkpoint_base_address = cp.base_address;
                state.base_address = state.base_address.max(cp.base_address);
                // Transactions committed before the checkpoint are in the page images
                state
                    .live_transactions
                    .retain(|_, item| !(item.is_committed() && item.commit_timestamp < cp.timestamp));
            }
        }
        Ok(())
    }
}

fn merge_node(map: &mut BTreeMap<PageKey, PageChain>, node: PageNode) {
    match map.get_mut(&node.key()) {
        Some(chain) => {
            chain.merge(node);
        }
        None => {
            map.insert(node.key(), PageChain::new(node));
        }
    }
}

impl RecoveredJournal {
    /// Drops state the copier already retired, moves page versions newer
    /// than the last valid checkpoint into the branch map and fills in the
    /// report.
    fn finish(&mut self) {
        // Everything below the base address was copied or pruned before the crash
        let base = self.base_address;
        for chain in self.page_map.values_mut() {
            chain.remove_below(base);
        }
        self.page_map.retain(|_, chain| !chain.is_empty());
        self.live_transactions.retain(|_, item| item.start_address >= base);

        let checkpoint = self.last_valid_checkpoint.timestamp;
        let mut emptied = Vec::new();
        for (key, chain) in self.page_map.iter_mut() {
            let newer = chain.versions().iter().take_while(|n| n.timestamp > checkpoint).count();
            if newer == 0 {
                continue;
            }
            let mut branch: Option<PageChain> = None;
            for node in chain.versions()[..newer].iter().rev() {
                match branch.as_mut() {
                    Some(b) => b.push(*node, false),
                    None => branch = Some(PageChain::new(*node)),
                }
            }
            if let Some(branch) = branch {
                self.branch_map.insert(*key, branch);
            }
            let kept: Vec<PageNode> = chain.versions()[newer..].to_vec();
            let mut rebuilt: Option<PageChain> = None;
            for node in kept.iter().rev() {
                match rebuilt.as_mut() {
                    Some(c) => c.push(*node, false),
                    None => rebuilt = Some(PageChain::new(*node)),
                }
            }
            match rebuilt {
                Some(c) => *chain = c,
                None => emptied.push(*key),
            }
        }
        for key in emptied {
            self.page_map.remove(&key);
        }

        let report = &mut self.report;
        report.base_address = self.base_address;
        report.pages = self.page_map.len();
        report.branch_pages = self.branch_map.len();
        report.last_valid_checkpoint = self.last_valid_checkpoint;
        for item in self.live_transactions.values() {
            if item.is_committed() {
                report.committed_transactions += 1;
            } else if item.is_aborted() {
                report.aborted_transactions += 1;
            } else {
                report.uncommitted_transactions += 1;
            }
        }
    }

    /// Largest handle assigned by any recovered IV or IT record.
    pub(crate) fn max_handle(&self) -> u32 {
        let volumes = self.volumes.keys().next_back().copied().unwrap_or(0);
        let trees = self.trees.keys().next_back().copied().unwrap_or(0);
        volumes.max(trees)
    }
}
