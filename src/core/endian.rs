/// Byte order used for every multi-byte field inside a page image.
///
/// Pages written with one order cannot be read with the other, so the order
/// is chosen once per store and handed to each `Buffer` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

impl Endian {
    #[inline]
    pub fn get_u16(self, bytes: &[u8], at: usize) -> u16 {
        let raw = [bytes[at], bytes[at + 1]];
        match self {
            Endian::Big => u16::from_be_bytes(raw),
            Endian::Little => u16::from_le_bytes(raw),
        }
    }

    #[inline]
    pub fn put_u16(self, bytes: &mut [u8], at: usize, value: u16) {
        let raw = match self {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        };
        bytes[at..at + 2].copy_from_slice(&raw);
    }

    #[inline]
    pub fn get_u32(self, bytes: &[u8], at: usize) -> u32 {
        let raw = [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        match self {
            Endian::Big => u32::from_be_bytes(raw),
            Endian::Little => u32::from_le_bytes(raw),
        }
    }

    #[inline]
    pub fn put_u32(self, bytes: &mut [u8], at: usize, value: u32) {
        let raw = match self {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        };
        bytes[at..at + 4].copy_from_slice(&raw);
    }

    #[inline]
    pub fn get_u64(self, bytes: &[u8], at: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[at..at + 8]);
        match self {
            Endian::Big => u64::from_be_bytes(raw),
            Endian::Little => u64::from_le_bytes(raw),
        }
    }

    #[inline]
    pub fn put_u64(self, bytes: &mut [u8], at: usize, value: u64) {
        let raw = match self {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        };
        bytes[at..at + 8].copy_from_slice(&raw);
    }

    /// Offset of the least significant byte of the u32 stored at `at`.
    /// Key blocks keep the discriminator byte there so a search can probe it
    /// without decoding the whole block.
    #[inline]
    pub fn low_byte_offset(self, at: usize) -> usize {
        match self {
            Endian::Big => at + 3,
            Endian::Little => at,
        }
    }
}
