use crate::core::constants::MAX_KEY_LENGTH;
use crate::core::errors::*;
use std::fmt;

/// An encoded key. Keys order by unsigned lexicographic comparison of their
/// encoded bytes, which is the order key blocks keep inside a page.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_KEY_LENGTH {
            return Err(Error::IllegalArgument(format!(
                "key length {} exceeds maximum {}",
                bytes.len(),
                MAX_KEY_LENGTH
            )));
        }
        Ok(Self { bytes: bytes.to_vec() })
    }

    #[inline]
    pub fn encoded_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn encoded_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    pub fn set_encoded(&mut self, bytes: &[u8]) {
        self.bytes.clear();
        self.bytes.extend_from_slice(bytes);
    }

    /// Replaces everything from `ebc` onward with `db` followed by `suffix`.
    /// This is how a front-coded key block is expanded on top of its
    /// predecessor.
    pub(crate) fn splice(&mut self, ebc: usize, db: u8, suffix: &[u8]) {
        self.bytes.truncate(ebc);
        // A damaged page can claim more elided bytes than the predecessor had
        self.bytes.resize(ebc, 0);
        self.bytes.push(db);
        self.bytes.extend_from_slice(suffix);
    }

    /// Count of leading bytes shared with `other`.
    pub fn first_unique_byte_index(&self, other: &Key) -> usize {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        let mut bytes = s.as_bytes().to_vec();
        bytes.truncate(MAX_KEY_LENGTH);
        Self { bytes }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) if s.chars().all(|c| !c.is_control()) => write!(f, "Key({:?})", s),
            _ => write!(f, "Key({:02x?})", self.bytes),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
