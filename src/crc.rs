//! CRC-32/MPEG-2 helper matching the on-flash checksum used by every record header.
//!
//! The teacher crate's `credential_store.rs`/`clock_offset_store.rs` compute a checksum with
//! `crc32fast::Hasher` over a fixed byte range; that crate only implements the reflected
//! CRC-32/ISO-HDLC variant. The on-flash format here needs the non-reflected MPEG-2 variant
//! (poly 0x04C11DB7, init 0xFFFFFFFF, no final XOR), so the `crc` crate's catalog algorithm
//! is used instead.

use crc::{Crc, CRC_32_MPEG_2};

static MPEG2: Crc<u32> = Crc::<u32>::new(&CRC_32_MPEG_2);

/// Computes the CRC-32/MPEG-2 checksum of `data`.
#[must_use]
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    MPEG2.checksum(data)
}

/// A rolling digest for streaming CRC computation over chunks too large to buffer at once.
pub struct RollingCrc {
    digest: crc::Digest<'static, u32>,
}

impl RollingCrc {
    #[must_use]
    pub fn new() -> Self {
        Self {
            digest: MPEG2.digest(),
        }
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.digest.update(chunk);
    }

    #[must_use]
    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }
}

impl Default for RollingCrc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rolling_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let oneshot = crc32_mpeg2(data);
        let mut rolling = RollingCrc::new();
        for chunk in data.chunks(7) {
            rolling.update(chunk);
        }
        assert_eq!(oneshot, rolling.finalize());
    }
}
