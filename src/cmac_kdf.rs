//! AES-CMAC counter-mode key derivation (NIST SP 800-108 §5.1), used by `DeviceKey` to derive
//! per-purpose subkeys from the persisted root of trust (§3.5, §4.2).

use aes::Aes128;
use cmac::{Cmac, Mac};

use crate::error::{Error, Result};

/// Derives `out.len()` bytes of key material from `key` (the KDF key, i.e. the RoT or a prior
/// subkey) and `label`/`context` (concatenated as the single "data" input of the counter-mode
/// construction, matching the original implementation's single-`salt` calling convention).
///
/// Splits `out` into 16-byte CMAC blocks; each iteration's PRF input is `counter (1 byte, BE) ||
/// label || 0x00 || context || length_in_bits (2 bytes, BE)` per SP 800-108 §5.1. `key` must be
/// exactly 16 bytes (AES-128).
pub fn cmac_kdf(key: &[u8; 16], label: &[u8], context: &[u8], out: &mut [u8]) -> Result<()> {
    if out.is_empty() {
        return Err(Error::InvalidArgument);
    }
    let length_bits = u16::try_from(out.len().saturating_mul(8)).map_err(|_| Error::InvalidArgument)?;

    let mut counter: u8 = 1;
    for chunk in out.chunks_mut(16) {
        let mut mac = Cmac::<Aes128>::new_from_slice(key).map_err(|_| Error::InvalidArgument)?;
        mac.update(&[counter]);
        mac.update(label);
        mac.update(&[0u8]);
        mac.update(context);
        mac.update(&length_bits.to_be_bytes());
        let tag = mac.finalize().into_bytes();
        chunk.copy_from_slice(&tag[..chunk.len()]);
        counter = counter.checked_add(1).ok_or(Error::InvalidArgument)?;
    }
    Ok(())
}
