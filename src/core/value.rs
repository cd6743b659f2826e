use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::mvv;

/// Supplies the bytes stored for a record.
///
/// `existing` is the value currently stored under the key (empty when the
/// key is new). Data pages store `store_version`'s output; index pages store
/// only `pointer_value`.
pub trait ValueHelper {
    fn required_length(&self, existing: &[u8]) -> usize;

    /// Writes exactly `required_length(existing)` bytes into `target` and
    /// returns the count written.
    fn store_version(&self, existing: &[u8], target: &mut [u8]) -> Result<usize>;

    fn pointer_value(&self) -> i32 {
        -1
    }

    fn is_mvv(&self) -> bool {
        false
    }

    /// Rejects a value the page could not store, before anything is moved.
    fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// Stores a plain value, replacing whatever was there.
#[derive(Debug, Clone, Copy)]
pub struct RawValueWriter<'a>(pub &'a [u8]);

impl ValueHelper for RawValueWriter<'_> {
    fn required_length(&self, _existing: &[u8]) -> usize {
        self.0.len()
    }

    fn store_version(&self, _existing: &[u8], target: &mut [u8]) -> Result<usize> {
        target[..self.0.len()].copy_from_slice(self.0);
        Ok(self.0.len())
    }

    fn check(&self) -> Result<()> {
        if self.0.first() == Some(&TYPE_MVV) {
            return Err(Error::IllegalArgument(
                "plain value cannot start with the MVV marker".to_string(),
            ));
        }
        Ok(())
    }
}

/// Child pointer for an index-page record.
#[derive(Debug, Clone, Copy)]
pub struct PointerValue(pub i32);

impl ValueHelper for PointerValue {
    fn required_length(&self, _existing: &[u8]) -> usize {
        0
    }

    fn store_version(&self, _existing: &[u8], _target: &mut [u8]) -> Result<usize> {
        Ok(0)
    }

    fn pointer_value(&self) -> i32 {
        self.0
    }
}

/// Adds a transactional version to the existing value, turning it into an
/// MVV if it was not one already.
#[derive(Debug, Clone, Copy)]
pub struct MvvValueWriter<'a> {
    pub version_handle: u64,
    pub value: &'a [u8],
}

impl ValueHelper for MvvValueWriter<'_> {
    fn required_length(&self, existing: &[u8]) -> usize {
        mvv::required_length(existing, self.version_handle, self.value.len())
    }

    fn store_version(&self, existing: &[u8], target: &mut [u8]) -> Result<usize> {
        let bytes = mvv::store_version(existing, self.version_handle, self.value)?;
        if bytes.len() > target.len() {
            return Err(Error::Fatal(format!(
                "MVV of {} bytes does not fit target of {}",
                bytes.len(),
                target.len()
            )));
        }
        target[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    fn is_mvv(&self) -> bool {
        true
    }
}

// Long record descriptors

#[inline]
pub fn is_long_record(value: &[u8]) -> bool {
    !value.is_empty() && value[0] == LONGREC_TYPE
}

/// A long record whose stored prefix shows the full value is an MVV.
pub fn is_long_mvv(value: &[u8]) -> bool {
    is_long_record(value) && value.len() > LONGREC_PREFIX_OFFSET && mvv::is_array_mvv(&value[LONGREC_PREFIX_OFFSET..])
}

pub fn is_value_mvv(value: &[u8]) -> bool {
    mvv::is_array_mvv(value) || is_long_mvv(value)
}

/// Builds the fixed-size descriptor stored in place of a value too large for
/// a data page. The first `LONGREC_PREFIX_SIZE` bytes of the value are kept
/// inline so type checks work without reading the chain.
pub fn long_record_descriptor(value: &[u8], chain_page: u64) -> [u8; LONGREC_SIZE] {
    let mut descriptor = [0u8; LONGREC_SIZE];
    descriptor[0] = LONGREC_TYPE;
    descriptor[2..4].copy_from_slice(&(LONGREC_PREFIX_SIZE as u16).to_be_bytes());
    descriptor[LONGREC_SIZE_OFFSET..LONGREC_SIZE_OFFSET + 8].copy_from_slice(&(value.len() as u64).to_be_bytes());
    descriptor[LONGREC_PAGE_OFFSET..LONGREC_PAGE_OFFSET + 8].copy_from_slice(&chain_page.to_be_bytes());
    let prefix = value.len().min(LONGREC_PREFIX_SIZE);
    descriptor[LONGREC_PREFIX_OFFSET..LONGREC_PREFIX_OFFSET + prefix].copy_from_slice(&value[..prefix]);
    descriptor
}

pub fn decode_long_record_size(descriptor: &[u8]) -> Result<u64> {
    check_descriptor(descriptor)?;
    Ok(u64::from_be_bytes(
        descriptor[LONGREC_SIZE_OFFSET..LONGREC_SIZE_OFFSET + 8].try_into()?,
    ))
}

pub fn decode_long_record_pointer(descriptor: &[u8]) -> Result<u64> {
    check_descriptor(descriptor)?;
    Ok(u64::from_be_bytes(
        descriptor[LONGREC_PAGE_OFFSET..LONGREC_PAGE_OFFSET + 8].try_into()?,
    ))
}

fn check_descriptor(descriptor: &[u8]) -> Result<()> {
    if descriptor.len() != LONGREC_SIZE || descriptor[0] != LONGREC_TYPE {
        return Err(Error::IllegalArgument(format!(
            "bad long record descriptor of {} bytes",
            descriptor.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction_index::ts_to_vh;

    #[test]
    fn test_descriptor_fields() {
        let value = vec![7u8; 500];
        let d = long_record_descriptor(&value, 4242);
        assert!(is_long_record(&d));
        assert!(!is_long_mvv(&d));
        assert_eq!(decode_long_record_size(&d).unwrap(), 500);
        assert_eq!(decode_long_record_pointer(&d).unwrap(), 4242);
        assert_eq!(&d[LONGREC_PREFIX_OFFSET..], &value[..LONGREC_PREFIX_SIZE]);
    }

    #[test]
    fn test_long_mvv_detected_from_prefix() {
        let full = mvv::store_version(&[], ts_to_vh(3), &vec![1u8; 300]).unwrap();
        let d = long_record_descriptor(&full, 9);
        assert!(is_long_mvv(&d));
        assert!(is_value_mvv(&d));
        assert!(is_value_mvv(&full));
    }

    #[test]
    fn test_mvv_writer_matches_required_length() {
        let writer = MvvValueWriter { version_handle: ts_to_vh(8), value: b"hello" };
        let existing = b"plain";
        let mut target = vec![0u8; writer.required_length(existing)];
        let n = writer.store_version(existing, &mut target).unwrap();
        assert_eq!(n, target.len());
        assert!(mvv::is_array_mvv(&target));
    }
}
