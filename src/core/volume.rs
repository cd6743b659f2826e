use crate::core::constants::*;
use crate::core::errors::*;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Identity of a volume as recorded in IV journal records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeSpecification {
    pub name: String,
    pub id: u64,
    pub page_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl VolumeSpecification {
    pub fn new(name: &str, id: u64, page_size: usize) -> Self {
        Self {
            name: name.to_string(),
            id,
            page_size,
            path: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&page_size) {
        return Err(Error::InvalidConfig {
            field: "page_size".to_string(),
            reason: format!("{} is not a power of two in {}..={}", page_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE),
        });
    }
    Ok(())
}

/// Page-granular storage the copier writes journaled images back into.
pub trait Volume: Send + Sync {
    fn specification(&self) -> &VolumeSpecification;

    fn read_page(&self, page: PageAddress, buf: &mut [u8]) -> Result<()>;

    fn write_page(&self, page: PageAddress, buf: &[u8]) -> Result<()>;

    /// Grows the volume so `page` is addressable.
    fn extend(&self, page: PageAddress) -> Result<()>;

    fn force(&self) -> Result<()>;

    fn page_count(&self) -> u64;

    fn name(&self) -> &str {
        &self.specification().name
    }

    fn page_size(&self) -> usize {
        self.specification().page_size
    }
}

/// Volume backed by one file, locked exclusively while open.
pub struct FileVolume {
    spec: VolumeSpecification,
    file: Mutex<File>,
}

impl FileVolume {
    pub fn open(path: &Path, name: &str, id: u64, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        file.try_lock_exclusive()
            .map_err(|e| Error::Io(format!("volume {} is locked by another process: {}", path.display(), e)))?;

        let mut spec = VolumeSpecification::new(name, id, page_size);
        spec.path = Some(path.to_path_buf());
        tracing::debug!(volume = name, path = %path.display(), page_size, "volume opened");
        Ok(Self {
            spec,
            file: Mutex::new(file),
        })
    }

    fn check_buffer(&self, page: PageAddress, len: usize) -> Result<()> {
        if len != self.spec.page_size {
            return Err(Error::InvalidPageAddress {
                page,
                details: format!("buffer of {} bytes for volume with page size {}", len, self.spec.page_size),
            });
        }
        Ok(())
    }
}

impl Volume for FileVolume {
    fn specification(&self) -> &VolumeSpecification {
        &self.spec
    }

    fn read_page(&self, page: PageAddress, buf: &mut [u8]) -> Result<()> {
        self.check_buffer(page, buf.len())?;
        let mut file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "volume.file".to_string() })?;
        let offset = page * self.spec.page_size as u64;
        if offset + buf.len() as u64 > file.metadata()?.len() {
            return Err(Error::InvalidPageAddress {
                page,
                details: format!("beyond end of volume {}", self.spec.name),
            });
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_page(&self, page: PageAddress, buf: &[u8]) -> Result<()> {
        self.check_buffer(page, buf.len())?;
        let mut file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "volume.file".to_string() })?;
        file.seek(SeekFrom::Start(page * self.spec.page_size as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn extend(&self, page: PageAddress) -> Result<()> {
        let file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "volume.file".to_string() })?;
        let needed = (page + 1) * self.spec.page_size as u64;
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        Ok(())
    }

    fn force(&self) -> Result<()> {
        let file = self.file.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "volume.file".to_string() })?;
        file.sync_data()?;
        Ok(())
    }

    fn page_count(&self) -> u64 {
        match self.file.lock() {
            Ok(file) => file.metadata().map(|m| m.len() / self.spec.page_size as u64).unwrap_or(0),
            Err(_) => 0,
        }
    }
}

impl Drop for FileVolume {
    fn drop(&mut self) {
        if let Ok(file) = self.file.lock() {
            let _ = FileExt::unlock(&*file);
        }
    }
}

/// Volume held entirely in memory.
pub struct MemoryVolume {
    spec: VolumeSpecification,
    pages: Mutex<HashMap<PageAddress, Vec<u8>>>,
}

impl MemoryVolume {
    pub fn new(name: &str, id: u64, page_size: usize) -> Result<Self> {
        validate_page_size(page_size)?;
        Ok(Self {
            spec: VolumeSpecification::new(name, id, page_size),
            pages: Mutex::new(HashMap::new()),
        })
    }

    pub fn contains(&self, page: PageAddress) -> bool {
        self.pages.lock().map(|p| p.contains_key(&page)).unwrap_or(false)
    }
}

impl Volume for MemoryVolume {
    fn specification(&self) -> &VolumeSpecification {
        &self.spec
    }

    fn read_page(&self, page: PageAddress, buf: &mut [u8]) -> Result<()> {
        if buf.len() != self.spec.page_size {
            return Err(Error::InvalidPageAddress {
                page,
                details: format!("buffer of {} bytes for page size {}", buf.len(), self.spec.page_size),
            });
        }
        let pages = self.pages.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "volume.pages".to_string() })?;
        match pages.get(&page) {
            Some(bytes) => buf.copy_from_slice(bytes),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, page: PageAddress, buf: &[u8]) -> Result<()> {
        if buf.len() != self.spec.page_size {
            return Err(Error::InvalidPageAddress {
                page,
                details: format!("buffer of {} bytes for page size {}", buf.len(), self.spec.page_size),
            });
        }
        let mut pages = self.pages.lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "volume.pages".to_string() })?;
        pages.insert(page, buf.to_vec());
        Ok(())
    }

    fn extend(&self, _page: PageAddress) -> Result<()> {
        Ok(())
    }

    fn force(&self) -> Result<()> {
        Ok(())
    }

    fn page_count(&self) -> u64 {
        self.pages
            .lock()
            .map(|p| p.keys().max().map_or(0, |m| m + 1))
            .unwrap_or(0)
    }
}
