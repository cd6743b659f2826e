//! Multi-version values.
//!
//! An MVV is a `TYPE_MVV` marker byte followed by versions in ascending
//! version-handle order, each encoded as `[handle u64][length u16][bytes]`
//! in big-endian. A version whose content is the single byte
//! `TYPE_ANTIVALUE` records a removal. Handle 0 is the primordial version:
//! the plain value that existed before the first transactional update.

use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::transaction_index::{CommitStatus, TransactionIndex};

pub const VERSION_OVERHEAD: usize = 10;

pub const ANTI_VALUE: [u8; 1] = [TYPE_ANTIVALUE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub handle: u64,
    pub offset: usize,
    pub length: usize,
}

/// A version removed by `prune`. Aborted versions let the owning transaction
/// decrement its outstanding MVV count; long-record versions carry the chain
/// that must be released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunedVersion {
    pub handle: u64,
    pub aborted: bool,
    pub long_record_page: u64,
}

#[inline]
pub fn is_array_mvv(bytes: &[u8]) -> bool {
    !bytes.is_empty() && bytes[0] == TYPE_MVV
}

#[inline]
pub fn is_anti_value(bytes: &[u8]) -> bool {
    bytes.len() == 1 && bytes[0] == TYPE_ANTIVALUE
}

pub fn versions(bytes: &[u8]) -> Result<Vec<Version>> {
    if !is_array_mvv(bytes) {
        return Err(Error::IllegalArgument("value is not a multi-version value".to_string()));
    }
    let mut result = Vec::new();
    let mut offset = 1;
    while offset < bytes.len() {
        if offset + VERSION_OVERHEAD > bytes.len() {
            return Err(Error::corrupt_page(0, format!("truncated MVV version header at {}", offset)));
        }
        let handle = u64::from_be_bytes(bytes[offset..offset + 8].try_into()?);
        let length = u16::from_be_bytes(bytes[offset + 8..offset + 10].try_into()?) as usize;
        let start = offset + VERSION_OVERHEAD;
        if start + length > bytes.len() {
            return Err(Error::corrupt_page(0, format!("MVV version at {} overruns value", offset)));
        }
        result.push(Version { handle, offset: start, length });
        offset = start + length;
    }
    Ok(result)
}

/// True when `bytes` is either not an MVV or a well-formed one with strictly
/// ascending handles.
pub fn verify(bytes: &[u8]) -> bool {
    if !is_array_mvv(bytes) {
        return true;
    }
    match versions(bytes) {
        Ok(vs) => vs.windows(2).all(|w| w[0].handle < w[1].handle),
        Err(_) => false,
    }
}

fn encode(out: &mut Vec<u8>, handle: u64, content: &[u8]) {
    out.extend_from_slice(&handle.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.extend_from_slice(content);
}

/// Length of the value that `store_version` would produce.
pub fn required_length(existing: &[u8], handle: u64, value_len: usize) -> usize {
    if existing.is_empty() {
        return 1 + VERSION_OVERHEAD + value_len;
    }
    if !is_array_mvv(existing) {
        return 1 + 2 * VERSION_OVERHEAD + existing.len() + value_len;
    }
    match versions(existing) {
        Ok(vs) => match vs.iter().find(|v| v.handle == handle) {
            Some(v) => existing.len() - v.length + value_len,
            None => existing.len() + VERSION_OVERHEAD + value_len,
        },
        Err(_) => existing.len() + VERSION_OVERHEAD + value_len,
    }
}

/// Adds or replaces the version `handle` in `existing`. A plain existing value
/// becomes the primordial version.
pub fn store_version(existing: &[u8], handle: u64, value: &[u8]) -> Result<Vec<u8>> {
    if value.len() > u16::MAX as usize {
        return Err(Error::IllegalArgument(format!("version of {} bytes is too large", value.len())));
    }
    let mut out = Vec::with_capacity(required_length(existing, handle, value.len()));
    out.push(TYPE_MVV);
    if existing.is_empty() {
        encode(&mut out, handle, value);
        return Ok(out);
    }
    if !is_array_mvv(existing) {
        encode(&mut out, 0, existing);
        encode(&mut out, handle, value);
        return Ok(out);
    }
    let mut placed = false;
    for v in versions(existing)? {
        if !placed && v.handle >= handle {
            encode(&mut out, handle, value);
            placed = true;
            if v.handle == handle {
                continue;
            }
        }
        encode(&mut out, v.handle, &existing[v.offset..v.offset + v.length]);
    }
    if !placed {
        encode(&mut out, handle, value);
    }
    Ok(out)
}

/// The value a snapshot started at `snapshot_ts` reads. `None` means the key
/// is absent for that snapshot.
pub fn visible_version<'a>(bytes: &'a [u8], snapshot_ts: u64, index: &dyn TransactionIndex) -> Result<Option<&'a [u8]>> {
    if !is_array_mvv(bytes) {
        if bytes.is_empty() || is_anti_value(bytes) {
            return Ok(None);
        }
        return Ok(Some(bytes));
    }
    let mut best: Option<(u64, &[u8])> = None;
    for v in versions(bytes)? {
        if let CommitStatus::Committed(tc) = index.commit_status(v.handle) {
            if tc < snapshot_ts && best.map_or(true, |(b, _)| tc >= b) {
                best = Some((tc, &bytes[v.offset..v.offset + v.length]));
            }
        }
    }
    Ok(match best {
        Some((_, content)) if !is_anti_value(content) => Some(content),
        _ => None,
    })
}

fn long_record_page(content: &[u8]) -> u64 {
    if content.len() == LONGREC_SIZE && content[0] == LONGREC_TYPE {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&content[LONGREC_PAGE_OFFSET..LONGREC_PAGE_OFFSET + 8]);
        u64::from_be_bytes(raw)
    } else {
        0
    }
}

/// Removes versions no active transaction can read, rewriting `bytes` in
/// place. Returns the new length, which never exceeds the old one.
///
/// Kept: uncommitted versions, versions committed at or after the active
/// floor, and the newest version committed before it. A lone surviving
/// version older than the floor collapses to a plain value; when nothing
/// survives the value becomes an anti-value.
pub fn prune(bytes: &mut [u8], index: &dyn TransactionIndex, pruned: &mut Vec<PrunedVersion>) -> Result<usize> {
    if !is_array_mvv(bytes) {
        return Ok(bytes.len());
    }
    let floor = index.active_floor();
    let all = versions(bytes)?;

    let mut keep: Vec<Version> = Vec::with_capacity(all.len());
    let mut newest_old: Option<(Version, u64)> = None;
    let mut dropped: Vec<PrunedVersion> = Vec::new();

    for v in all.iter().copied() {
        let content = &bytes[v.offset..v.offset + v.length];
        match index.commit_status(v.handle) {
            CommitStatus::Aborted => dropped.push(PrunedVersion {
                handle: v.handle,
                aborted: true,
                long_record_page: long_record_page(content),
            }),
            CommitStatus::Uncommitted => keep.push(v),
            CommitStatus::Committed(tc) if tc < floor => {
                if let Some((prev, prev_tc)) = newest_old {
                    if tc >= prev_tc {
                        dropped.push(PrunedVersion {
                            handle: prev.handle,
                            aborted: false,
                            long_record_page: long_record_page(&bytes[prev.offset..prev.offset + prev.length]),
                        });
                        newest_old = Some((v, tc));
                    } else {
                        dropped.push(PrunedVersion {
                            handle: v.handle,
                            aborted: false,
                            long_record_page: long_record_page(content),
                        });
                    }
                } else {
                    newest_old = Some((v, tc));
                }
            }
            CommitStatus::Committed(_) => keep.push(v),
        }
    }

    if dropped.is_empty() && !(keep.is_empty() && newest_old.is_some()) {
        return Ok(bytes.len());
    }

    let rebuilt = match (newest_old, keep.is_empty()) {
        (Some((v, _)), true) => bytes[v.offset..v.offset + v.length].to_vec(),
        (None, true) => ANTI_VALUE.to_vec(),
        (old, false) => {
            let mut survivors = keep;
            if let Some((v, _)) = old {
                survivors.push(v);
            }
            survivors.sort_by_key(|v| v.handle);
            let mut out = vec![TYPE_MVV];
            for v in survivors {
                encode(&mut out, v.handle, &bytes[v.offset..v.offset + v.length]);
            }
            out
        }
    };

    if rebuilt.len() > bytes.len() {
        return Err(Error::Fatal(format!(
            "pruned MVV grew from {} to {} bytes",
            bytes.len(),
            rebuilt.len()
        )));
    }
    bytes[..rebuilt.len()].copy_from_slice(&rebuilt);
    pruned.extend(dropped);
    Ok(rebuilt.len())
}
