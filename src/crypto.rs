//! AES-CTR streaming cipher helper shared by `DeviceKey` and `SecureStore` (§3.5, §4.5).
//!
//! Generalizes the non-block-aligned XOR loop idea the original storage layer needs for partial
//! writes: the counter mode keystream is generated block by block and XORed into `data` in place,
//! so `data` need not be a multiple of 16 bytes and can be driven incrementally across multiple
//! calls that share a running counter (`CtrCursor`).

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::{Error, Result};

const BLOCK_SIZE: usize = 16;

/// A resumable AES-CTR keystream cursor, letting `SecureStore`'s `set_add_data` streaming API
/// encrypt/decrypt a payload across several non-block-aligned chunks.
pub struct CtrCursor {
    cipher: Aes128,
    counter_block: [u8; BLOCK_SIZE],
    keystream: [u8; BLOCK_SIZE],
    pos_in_block: usize,
}

impl CtrCursor {
    /// `key` is the 128-bit record key; `nonce` is the 16-byte initial counter block (typically
    /// a per-record random IV with the low bytes reserved as the counter).
    #[must_use]
    pub fn new(key: &[u8; 16], nonce: &[u8; 16]) -> Self {
        let cipher = Aes128::new(key.into());
        let mut cursor = Self {
            cipher,
            counter_block: *nonce,
            keystream: [0u8; BLOCK_SIZE],
            pos_in_block: BLOCK_SIZE,
        };
        cursor.refill();
        cursor
    }

    fn refill(&mut self) {
        let mut block = self.counter_block.into();
        self.cipher.encrypt_block(&mut block);
        self.keystream.copy_from_slice(&block);
        self.pos_in_block = 0;
        increment_counter(&mut self.counter_block);
    }

    /// XORs the keystream into `data` in place, consuming and regenerating blocks as needed.
    pub fn apply(&mut self, data: &mut [u8]) {
        let mut offset = 0;
        while offset < data.len() {
            if self.pos_in_block == BLOCK_SIZE {
                self.refill();
            }
            let available = BLOCK_SIZE - self.pos_in_block;
            let take = available.min(data.len() - offset);
            for i in 0..take {
                data[offset + i] ^= self.keystream[self.pos_in_block + i];
            }
            self.pos_in_block += take;
            offset += take;
        }
    }
}

fn increment_counter(block: &mut [u8; BLOCK_SIZE]) {
    for byte in block.iter_mut().rev() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// One-shot helper for callers that already hold the whole buffer (used by `DeviceKey`'s RoT
/// wrap/unwrap, which never streams).
pub fn aes_ctr_xor(key: &[u8; 16], nonce: &[u8; 16], data: &mut [u8]) -> Result<()> {
    if key.iter().all(|&b| b == 0) {
        return Err(Error::InvalidArgument);
    }
    let mut cursor = CtrCursor::new(key, nonce);
    cursor.apply(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_is_its_own_inverse() {
        let key = [0x7eu8; 16];
        let nonce = [0u8; 16];
        let plaintext = b"the quick brown fox jumps".to_vec();
        let mut buf = plaintext.clone();
        aes_ctr_xor(&key, &nonce, &mut buf).unwrap();
        assert_ne!(buf, plaintext);
        aes_ctr_xor(&key, &nonce, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn streaming_matches_one_shot() {
        let key = [0x11u8; 16];
        let nonce = [0x22u8; 16];
        let mut whole = (0u8..40).collect::<Vec<u8>>();
        aes_ctr_xor(&key, &nonce, &mut whole).unwrap();

        let mut streamed = (0u8..40).collect::<Vec<u8>>();
        let mut cursor = CtrCursor::new(&key, &nonce);
        let (a, b) = streamed.split_at_mut(7);
        cursor.apply(a);
        cursor.apply(b);
        assert_eq!(whole, streamed);
    }

    #[test]
    fn counter_increments_across_blocks() {
        let key = [0x01u8; 16];
        let nonce = [0xFFu8; 16];
        let mut data = vec![0u8; 33];
        aes_ctr_xor(&key, &nonce, &mut data).unwrap();
        assert!(data.iter().any(|&b| b != 0));
    }
}
