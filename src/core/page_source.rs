use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::value::{decode_long_record_pointer, decode_long_record_size, long_record_descriptor};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Ratio between usable page bytes and the most key blocks a page may hold.
pub const MAX_KEY_RATIO: usize = 16;

/// The slice of the buffer pool a page editor needs.
pub trait PageSource: Send + Sync {
    fn max_keys(&self, buffer_size: usize) -> usize;

    /// Reads the full value a long-record descriptor refers to.
    fn fetch_long_record(&self, descriptor: &[u8]) -> Result<Vec<u8>>;

    /// Stores `value` in a new chain and returns its descriptor.
    fn store_long_record(&self, value: &[u8]) -> Result<Vec<u8>>;

    fn deallocate_chain(&self, page: u64) -> Result<()>;
}

/// Page source with a fixed key limit and long-record chains held in memory.
pub struct FixedPageSource {
    max_keys: Option<usize>,
    chains: Mutex<HashMap<u64, Vec<u8>>>,
    next_page: AtomicU64,
}

impl FixedPageSource {
    pub fn new() -> Self {
        Self {
            max_keys: None,
            chains: Mutex::new(HashMap::new()),
            next_page: AtomicU64::new(1),
        }
    }

    pub fn with_max_keys(max_keys: usize) -> Self {
        Self {
            max_keys: Some(max_keys),
            ..Self::new()
        }
    }

    pub fn chain_count(&self) -> usize {
        self.chains.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl Default for FixedPageSource {
    fn default() -> Self {
        Self::new()
    }
}

impl PageSource for FixedPageSource {
    fn max_keys(&self, buffer_size: usize) -> usize {
        self.max_keys
            .unwrap_or((buffer_size - HEADER_SIZE) / MAX_KEY_RATIO)
    }

    fn fetch_long_record(&self, descriptor: &[u8]) -> Result<Vec<u8>> {
        let page = decode_long_record_pointer(descriptor)?;
        let size = decode_long_record_size(descriptor)? as usize;
        let chains = self.chains.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "page_source.chains".to_string() })?;
        let bytes = chains.get(&page).ok_or_else(|| Error::InvalidPageAddress {
            page,
            details: "long record chain not found".to_string(),
        })?;
        if bytes.len() != size {
            return Err(Error::corrupt_page(page, format!(
                "long record chain holds {} bytes, descriptor says {}",
                bytes.len(),
                size
            )));
        }
        Ok(bytes.clone())
    }

    fn store_long_record(&self, value: &[u8]) -> Result<Vec<u8>> {
        let page = self.next_page.fetch_add(1, Ordering::SeqCst);
        let mut chains = self.chains.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "page_source.chains".to_string() })?;
        chains.insert(page, value.to_vec());
        Ok(long_record_descriptor(value, page).to_vec())
    }

    fn deallocate_chain(&self, page: u64) -> Result<()> {
        let mut chains = self.chains.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "page_source.chains".to_string() })?;
        chains.remove(&page);
        Ok(())
    }
}
