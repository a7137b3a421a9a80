//! Fixed-size record header encode/decode (§3.1).
//!
//! Generalizes `credential_store.rs`'s fixed-offset `MAGIC`/`CRC_OFFSET`/... layout from a single
//! static record into a repeatable header prefixing every appended record.

use crate::crc::crc32_mpeg2;
use crate::error::{Error, Result};
use crate::kv::internal::InternalFlags;
use crate::kv::Flags;

pub const MAGIC: u32 = 0x5444_4253; // "TDBS"
pub const REVISION: u16 = 1;
pub const HEADER_SIZE: usize = 22;

const DATA_SIZE_MASK: u32 = 0x000F_FFFF;
const FLAGS_SHIFT: u32 = 20;

/// One record's fixed-size header, covering both user-visible and internal flags.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    pub revision: u16,
    pub user_flags: Flags,
    pub internal_flags: InternalFlags,
    pub key_size: u16,
    pub data_size: u32,
    pub crc: u32,
}

impl RecordHeader {
    pub fn new(
        user_flags: Flags,
        internal_flags: InternalFlags,
        key_size: u16,
        data_size: u32,
    ) -> Result<Self> {
        if data_size > DATA_SIZE_MASK {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            revision: REVISION,
            user_flags,
            internal_flags,
            key_size,
            data_size,
            crc: 0,
        })
    }

    /// Encodes the header (with `crc` left as whatever is currently set) into `buf`.
    pub fn encode(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&(HEADER_SIZE as u16).to_le_bytes());
        buf[6..8].copy_from_slice(&self.revision.to_le_bytes());
        buf[8..12].copy_from_slice(&self.user_flags.bits().to_le_bytes());
        let packed = (self.data_size & DATA_SIZE_MASK)
            | (u32::from(self.internal_flags.bits()) << FLAGS_SHIFT);
        buf[12..16].copy_from_slice(&packed.to_le_bytes());
        buf[16..18].copy_from_slice(&self.key_size.to_le_bytes());
        buf[18..22].copy_from_slice(&self.crc.to_le_bytes());
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != MAGIC {
            return Err(Error::DataCorrupt);
        }
        let header_size = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if header_size as usize != HEADER_SIZE {
            return Err(Error::DataCorrupt);
        }
        let revision = u16::from_le_bytes(buf[6..8].try_into().unwrap());
        let user_flags_bits = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let user_flags = Flags::from_bits_truncate(user_flags_bits);
        let packed = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let data_size = packed & DATA_SIZE_MASK;
        let internal_bits = (packed >> FLAGS_SHIFT) as u8;
        let internal_flags = InternalFlags::from_bits_truncate(internal_bits);
        let key_size = u16::from_le_bytes(buf[16..18].try_into().unwrap());
        let crc = u32::from_le_bytes(buf[18..22].try_into().unwrap());
        Ok(Self {
            revision,
            user_flags,
            internal_flags,
            key_size,
            data_size,
            crc,
        })
    }

    /// Total on-flash size of header + key + data, before program-alignment padding.
    #[must_use]
    pub const fn unaligned_len(&self) -> u32 {
        HEADER_SIZE as u32 + self.key_size as u32 + self.data_size
    }
}

/// Computes the record CRC over header-minus-crc, key bytes, and data bytes.
#[must_use]
pub fn compute_record_crc(header_without_crc: &[u8], key: &[u8], data: &[u8]) -> u32 {
    // crc32_mpeg2 needs one contiguous buffer; the streaming path in gc.rs/mod.rs instead
    // drives `crate::crc::RollingCrc` directly over the three regions in sequence.
    let mut combined = Vec::with_capacity(header_without_crc.len() + key.len() + data.len());
    combined.extend_from_slice(header_without_crc);
    combined.extend_from_slice(key);
    combined.extend_from_slice(data);
    crc32_mpeg2(&combined)
}

/// Rounds `len` up to the next multiple of `align` (`align` must be a power of two).
#[must_use]
pub const fn align_up(len: u32, align: u32) -> u32 {
    (len + align - 1) & !(align - 1)
}
