//! Confidentiality + integrity + rollback-protection envelope over an underlying [`KvStore`]
//! (§3.4, §4.5).
//!
//! Every record is wrapped in a fixed [`EnvelopeHeader`] followed by the AES-CTR ciphertext (same
//! length as the plaintext) before being handed to the underlying store. Keys requesting
//! [`Flags::REQUIRE_REPLAY_PROTECTION`] additionally pin their CMAC tag in a separate [`NvStore`]
//! domain, so that restoring the underlying store to an older snapshot (a "rollback") is detected
//! even though the underlying store's own CRC/structure stays perfectly valid.

use std::cell::RefCell;
use std::sync::Arc;

use aes::Aes128;
use cmac::{Cmac, Mac};
use parking_lot::{Mutex, ReentrantMutex};
use rand_core::{CryptoRng, RngCore};

use crate::block_device::BlockDevice;
use crate::crypto::CtrCursor;
use crate::device_key::DeviceKey;
use crate::error::{Error, Result};
use crate::kv::{Flags, GetInfo, IteratorHandle, KvStore};
use crate::nvstore::NvStore;

const ENVELOPE_MAGIC: u32 = 0x5343_454e; // "SCEN"
const ENVELOPE_VERSION: u8 = 1;
const NONCE_SIZE: usize = 16;
const TAG_SIZE: usize = 16;
const HEADER_SIZE: usize = 4 + 1 + 1 + 2 + 4 + 4 + NONCE_SIZE + TAG_SIZE;

/// Owner tag this store uses when allocating rollback-protection slots, so `reset()` can free
/// exactly the slots it allocated via [`NvStore::free_all_keys_by_owner`].
const RP_OWNER: u8 = 2;

/// Record metadata (§3.4): `create_flags` and `rp_slot` are covered by the CMAC alongside the
/// ciphertext, so an attacker who can only tamper the underlying store's bytes (protected there
/// by a plain CRC, not a MAC) cannot strip the confidentiality or replay-protection bit from a
/// record by forging the envelope header in isolation.
#[derive(Debug, Clone, Copy)]
struct EnvelopeHeader {
    rp_slot: Option<u16>,
    create_flags: Flags,
    data_len: u32,
    nonce: [u8; NONCE_SIZE],
    tag: [u8; TAG_SIZE],
}

impl EnvelopeHeader {
    fn encode(&self, buf: &mut [u8; HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&ENVELOPE_MAGIC.to_le_bytes());
        buf[4] = ENVELOPE_VERSION;
        buf[5] = u8::from(self.rp_slot.is_some());
        buf[6..8].copy_from_slice(&self.rp_slot.unwrap_or(0).to_le_bytes());
        buf[8..12].copy_from_slice(&self.create_flags.bits().to_le_bytes());
        buf[12..16].copy_from_slice(&self.data_len.to_le_bytes());
        buf[16..16 + NONCE_SIZE].copy_from_slice(&self.nonce);
        buf[16 + NONCE_SIZE..HEADER_SIZE].copy_from_slice(&self.tag);
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if magic != ENVELOPE_MAGIC || buf[4] != ENVELOPE_VERSION {
            return Err(Error::DataCorrupt);
        }
        let rp_slot = if buf[5] != 0 {
            Some(u16::from_le_bytes(buf[6..8].try_into().unwrap()))
        } else {
            None
        };
        let create_flags = Flags::from_bits(u32::from_le_bytes(buf[8..12].try_into().unwrap()))
            .ok_or(Error::DataCorrupt)?;
        let data_len = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&buf[16..16 + NONCE_SIZE]);
        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&buf[16 + NONCE_SIZE..HEADER_SIZE]);
        Ok(Self {
            rp_slot,
            create_flags,
            data_len,
            nonce,
            tag,
        })
    }

    /// Bytes covered by the CMAC besides the ciphertext itself: everything in the header except
    /// the tag field, so no header field can be forged independently of the ciphertext.
    fn mac_prefix(&self) -> [u8; HEADER_SIZE - TAG_SIZE] {
        let mut out = [0u8; HEADER_SIZE - TAG_SIZE];
        out[0] = u8::from(self.rp_slot.is_some());
        out[1..3].copy_from_slice(&self.rp_slot.unwrap_or(0).to_le_bytes());
        out[3..7].copy_from_slice(&self.create_flags.bits().to_le_bytes());
        out[7..11].copy_from_slice(&self.data_len.to_le_bytes());
        out[11..11 + NONCE_SIZE].copy_from_slice(&self.nonce);
        out
    }
}

/// In-progress streaming write, guarded by [`SecureStore`]'s single recursive mutex so only one
/// caller can be mid-stream at a time, matching §5's single-mutex-per-store model.
struct StreamState {
    key: String,
    flags: Flags,
    final_size: u32,
    cursor: Option<CtrCursor>,
    nonce: [u8; NONCE_SIZE],
    ciphertext: Vec<u8>,
}

/// Confidentiality/integrity/rollback-protection wrapper over any [`KvStore`] (typically a
/// `TdbStore`). Generic over the RNG `R` used to draw fresh per-write nonces, so callers supply
/// whatever entropy source fits their platform (a hardware TRNG, or a seeded PRNG in tests),
/// mirroring how [`DeviceKey::ensure_root_of_trust`] takes its RNG from the caller.
pub struct SecureStore<U: KvStore, D: BlockDevice, R: RngCore + CryptoRng> {
    underlying: Arc<U>,
    rp_store: Option<Arc<NvStore<D>>>,
    device_key: Arc<DeviceKey<D>>,
    stream: ReentrantMutex<RefCell<Option<StreamState>>>,
    rng: Mutex<R>,
}

impl<U: KvStore, D: BlockDevice, R: RngCore + CryptoRng> SecureStore<U, D, R> {
    #[must_use]
    pub fn new(
        underlying: Arc<U>,
        rp_store: Option<Arc<NvStore<D>>>,
        device_key: Arc<DeviceKey<D>>,
        rng: R,
    ) -> Self {
        Self {
            underlying,
            rp_store,
            device_key,
            stream: ReentrantMutex::new(RefCell::new(None)),
            rng: Mutex::new(rng),
        }
    }

    /// Draws a fresh random nonce for one envelope write. Per spec.md §2/§3.4, the nonce must be
    /// randomly generated per write, never derived deterministically from the key or record
    /// contents — reusing a nonce under the same record key collapses AES-CTR to a two-time pad.
    fn fresh_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut out = [0u8; NONCE_SIZE];
        self.rng.lock().fill_bytes(&mut out);
        out
    }

    fn record_key(&self, key: &str) -> Result<[u8; 16]> {
        let mut out = [0u8; 16];
        self.device_key
            .generate_derived_key(b"securestore-record", key.as_bytes(), &mut out)?;
        Ok(out)
    }

    /// Per-record rollback-protection MAC key (§3.4: "The CMAC covers: key bytes ∥ metadata ∥
    /// ciphertext"). Binding `key` into the KDF context, on top of MACing the raw key bytes in
    /// [`Self::compute_tag`], means a same-length ciphertext blob stored under one key cannot be
    /// substituted in for another key's record without invalidating the tag.
    fn rp_key(&self, key: &str) -> Result<[u8; 16]> {
        let mut out = [0u8; 16];
        self.device_key
            .generate_derived_key(b"securestore-rp-mac", key.as_bytes(), &mut out)?;
        Ok(out)
    }

    fn compute_tag(
        &self,
        rp_mac_key: &[u8; 16],
        key: &str,
        header: &EnvelopeHeader,
        ciphertext: &[u8],
    ) -> Result<[u8; TAG_SIZE]> {
        let mut mac = Cmac::<Aes128>::new_from_slice(rp_mac_key).map_err(|_| Error::InvalidArgument)?;
        mac.update(key.as_bytes());
        mac.update(&header.mac_prefix());
        mac.update(ciphertext);
        let tag = mac.finalize().into_bytes();
        let mut out = [0u8; TAG_SIZE];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    /// Returns the full envelope header a key currently carries in the underlying store, if any
    /// and if it decodes cleanly.
    fn existing_header(&self, key: &str) -> Option<EnvelopeHeader> {
        let info = self.underlying.get_info(key).ok()?;
        let mut blob = vec![0u8; info.size as usize];
        self.underlying.get(key, &mut blob, 0).ok()?;
        if blob.len() < HEADER_SIZE {
            return None;
        }
        let mut header_buf = [0u8; HEADER_SIZE];
        header_buf.copy_from_slice(&blob[..HEADER_SIZE]);
        EnvelopeHeader::decode(&header_buf).ok()
    }

    /// Returns the rollback-protection slot a key's envelope already uses, if any, by decoding
    /// whatever is currently stored under `key` in the underlying store.
    fn existing_rp_slot(&self, key: &str) -> Option<u16> {
        self.existing_header(key).and_then(|h| h.rp_slot)
    }

    /// Rejects attempts to weaken a previously-written record's confidentiality or
    /// replay-protection bits (§4.5 flag-stability invariant). Once set, those bits are immutable
    /// until the key is fully removed or the store is reset.
    fn check_flag_stability(&self, key: &str, flags: Flags) -> Result<()> {
        let Some(existing) = self.existing_header(key) else {
            return Ok(());
        };
        let sticky = Flags::REQUIRE_CONFIDENTIALITY | Flags::REQUIRE_REPLAY_PROTECTION;
        if (existing.create_flags & sticky) & !(flags & sticky) != Flags::empty() {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    /// Resolves the rollback-protection slot to pin a new write's tag under: reuses the slot a
    /// prior write of this key already allocated (so updating the tag invalidates any rolled-back
    /// snapshot of the old envelope), or allocates a fresh one on first write.
    fn resolve_rp_slot(&self, key: &str, flags: Flags) -> Result<Option<u16>> {
        if !flags.contains(Flags::REQUIRE_REPLAY_PROTECTION) {
            return Ok(None);
        }
        let rp_store = self.rp_store.as_ref().ok_or(Error::InvalidArgument)?;
        Ok(Some(match self.existing_rp_slot(key) {
            Some(slot) => slot,
            None => rp_store.allocate_key(RP_OWNER)?,
        }))
    }

    /// Encrypts `data` for `key` under `flags` and returns the full envelope blob ready to hand
    /// to the underlying store, pinning the rollback-protection tag first if requested.
    fn seal(&self, key: &str, data: &[u8], flags: Flags) -> Result<Vec<u8>> {
        let nonce = self.fresh_nonce();

        let mut ciphertext = data.to_vec();
        if flags.contains(Flags::REQUIRE_CONFIDENTIALITY) {
            let record_key = self.record_key(key)?;
            CtrCursor::new(&record_key, &nonce).apply(&mut ciphertext);
        }

        let rp_slot = self.resolve_rp_slot(key, flags)?;
        let mut header = EnvelopeHeader {
            rp_slot,
            create_flags: flags,
            data_len: ciphertext.len() as u32,
            nonce,
            tag: [0u8; TAG_SIZE],
        };
        let rp_mac_key = self.rp_key(key)?;
        header.tag = self.compute_tag(&rp_mac_key, key, &header, &ciphertext)?;

        if let Some(slot) = rp_slot {
            self.rp_store.as_ref().ok_or(Error::InvalidArgument)?.set(slot, &header.tag)?;
        }

        let mut blob = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
        let mut header_buf = [0u8; HEADER_SIZE];
        header.encode(&mut header_buf);
        blob.extend_from_slice(&header_buf);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn unseal(&self, key: &str, blob: &[u8]) -> Result<(EnvelopeHeader, Vec<u8>)> {
        if blob.len() < HEADER_SIZE {
            return Err(Error::DataCorrupt);
        }
        let mut header_buf = [0u8; HEADER_SIZE];
        header_buf.copy_from_slice(&blob[..HEADER_SIZE]);
        let header = EnvelopeHeader::decode(&header_buf)?;
        let ciphertext = &blob[HEADER_SIZE..];
        if ciphertext.len() != header.data_len as usize {
            return Err(Error::DataCorrupt);
        }

        let rp_mac_key = self.rp_key(key)?;
        let recomputed_tag = self.compute_tag(&rp_mac_key, key, &header, ciphertext)?;
        if !constant_time_eq(&recomputed_tag, &header.tag) {
            return Err(Error::AuthenticationFailed);
        }

        if let (Some(slot), Some(rp_store)) = (header.rp_slot, self.rp_store.as_ref()) {
            let mut pinned = [0u8; TAG_SIZE];
            let n = rp_store.get(slot, &mut pinned)?;
            if n as usize != TAG_SIZE || !constant_time_eq(&pinned, &header.tag) {
                return Err(Error::RbpAuthenticationFailed);
            }
        }

        let mut plaintext = ciphertext.to_vec();
        if header.create_flags.contains(Flags::REQUIRE_CONFIDENTIALITY) {
            let record_key = self.record_key(key)?;
            CtrCursor::new(&record_key, &header.nonce).apply(&mut plaintext);
        }
        Ok((header, plaintext))
    }

    /// Begins a streaming write. Only one stream may be open at a time per store instance.
    /// `final_size` is the total plaintext length the caller commits to delivering across
    /// subsequent `set_add_data` calls; `set_finalize` rejects a mismatch (§4.4, §6.1).
    pub fn set_start(&self, key: &str, final_size: u32, flags: Flags) -> Result<()> {
        crate::kv::validate_key(key)?;
        self.check_flag_stability(key, flags)?;
        let guard = self.stream.lock();
        let mut slot = guard.borrow_mut();
        if slot.is_some() {
            return Err(Error::OsError);
        }
        let nonce = self.fresh_nonce();
        let cursor = if flags.contains(Flags::REQUIRE_CONFIDENTIALITY) {
            let record_key = self.record_key(key)?;
            Some(CtrCursor::new(&record_key, &nonce))
        } else {
            None
        };
        *slot = Some(StreamState {
            key: key.to_string(),
            flags,
            final_size,
            cursor,
            nonce,
            ciphertext: Vec::new(),
        });
        Ok(())
    }

    /// Feeds the next chunk of plaintext into the in-progress stream started by [`Self::set_start`].
    pub fn set_add_data(&self, chunk: &[u8]) -> Result<()> {
        let guard = self.stream.lock();
        let mut slot = guard.borrow_mut();
        let state = slot.as_mut().ok_or(Error::NotReady)?;
        let mut buf = chunk.to_vec();
        if let Some(cursor) = state.cursor.as_mut() {
            cursor.apply(&mut buf);
        }
        state.ciphertext.extend_from_slice(&buf);
        Ok(())
    }

    /// Completes the in-progress stream, committing the sealed envelope to the underlying store.
    pub fn set_finalize(&self) -> Result<()> {
        let state = {
            let guard = self.stream.lock();
            guard.borrow_mut().take().ok_or(Error::NotReady)?
        };
        if state.ciphertext.len() as u32 != state.final_size {
            return Err(Error::InvalidArgument);
        }

        let rp_slot = self.resolve_rp_slot(&state.key, state.flags)?;
        let mut header = EnvelopeHeader {
            rp_slot,
            create_flags: state.flags,
            data_len: state.ciphertext.len() as u32,
            nonce: state.nonce,
            tag: [0u8; TAG_SIZE],
        };
        let rp_mac_key = self.rp_key(&state.key)?;
        header.tag = self.compute_tag(&rp_mac_key, &state.key, &header, &state.ciphertext)?;

        if let Some(slot) = rp_slot {
            self.rp_store.as_ref().ok_or(Error::InvalidArgument)?.set(slot, &header.tag)?;
        }

        let mut blob = Vec::with_capacity(HEADER_SIZE + state.ciphertext.len());
        let mut header_buf = [0u8; HEADER_SIZE];
        header.encode(&mut header_buf);
        blob.extend_from_slice(&header_buf);
        blob.extend_from_slice(&state.ciphertext);

        self.underlying.set(&state.key, &blob, state.flags)
    }
}

/// Constant-time byte comparison, avoiding a timing side channel on tag/token verification.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.ct_eq(b).into()
}

impl<U: KvStore, D: BlockDevice, R: RngCore + CryptoRng> KvStore for SecureStore<U, D, R> {
    fn init(&self) -> Result<()> {
        self.underlying.init()
    }

    fn deinit(&self) -> Result<()> {
        self.underlying.deinit()
    }

    fn reset(&self) -> Result<()> {
        if let Some(rp_store) = &self.rp_store {
            rp_store.free_all_keys_by_owner(RP_OWNER)?;
        }
        self.underlying.reset()
    }

    fn get(&self, key: &str, buf: &mut [u8], offset: u32) -> Result<u32> {
        let info = self.underlying.get_info(key)?;
        let mut blob = vec![0u8; info.size as usize];
        self.underlying.get(key, &mut blob, 0)?;
        let (_, plaintext) = self.unseal(key, &blob)?;

        let offset = offset as usize;
        if offset > plaintext.len() {
            return Err(Error::InvalidArgument);
        }
        let to_copy = (plaintext.len() - offset).min(buf.len());
        buf[..to_copy].copy_from_slice(&plaintext[offset..offset + to_copy]);
        Ok(to_copy as u32)
    }

    fn get_info(&self, key: &str) -> Result<GetInfo> {
        let info = self.underlying.get_info(key)?;
        let mut blob = vec![0u8; info.size as usize];
        self.underlying.get(key, &mut blob, 0)?;
        let (header, _) = self.unseal(key, &blob)?;
        Ok(GetInfo {
            size: header.data_len,
            flags: info.flags,
        })
    }

    fn set(&self, key: &str, data: &[u8], flags: Flags) -> Result<()> {
        crate::kv::validate_key(key)?;
        self.check_flag_stability(key, flags)?;
        let blob = self.seal(key, data, flags)?;
        self.underlying.set(key, &blob, flags)
    }

    fn remove(&self, key: &str) -> Result<()> {
        if let Some(slot) = self.existing_rp_slot(key) {
            if let Some(rp_store) = self.rp_store.as_ref() {
                let _ = rp_store.remove(slot);
            }
        }
        self.underlying.remove(key)
    }

    fn iterator_open(&self, prefix: Option<&str>) -> Result<IteratorHandle> {
        self.underlying.iterator_open(prefix)
    }

    fn iterator_next(&self, it: IteratorHandle, out_key: &mut [u8]) -> Result<Option<u32>> {
        self.underlying.iterator_next(it, out_key)
    }

    fn iterator_close(&self, it: IteratorHandle) -> Result<()> {
        self.underlying.iterator_close(it)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::RamBlockDevice;
    use crate::tdbstore::TdbStore;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn test_rng() -> ChaCha20Rng {
        ChaCha20Rng::seed_from_u64(42)
    }

    fn fresh_stores() -> (
        Arc<TdbStore<RamBlockDevice>>,
        Arc<NvStore<RamBlockDevice>>,
        Arc<DeviceKey<RamBlockDevice>>,
    ) {
        let data_dev = RamBlockDevice::new(64 * 1024, 4096, 1);
        let tdb = Arc::new(TdbStore::new(data_dev, 0, 64 * 1024).unwrap());
        tdb.init().unwrap();

        let rp_dev = RamBlockDevice::new(16 * 1024, 4096, 1);
        let rp = Arc::new(NvStore::new(rp_dev, 0, 16 * 1024, 64).unwrap());
        rp.init().unwrap();

        let dk_dev = RamBlockDevice::new(16 * 1024, 4096, 1);
        let dk_nv = Arc::new(NvStore::new(dk_dev, 0, 16 * 1024, 8).unwrap());
        dk_nv.init().unwrap();
        let dk = Arc::new(DeviceKey::new(dk_nv));
        dk.inject_root_of_trust(&[0x99u8; 16]).unwrap();

        (tdb, rp, dk)
    }

    #[test]
    fn round_trips_plaintext() {
        let (tdb, rp, dk) = fresh_stores();
        let store = SecureStore::new(tdb, Some(rp), dk, test_rng());
        store.set("secret", b"hunter2", Flags::empty()).unwrap();
        let mut buf = [0u8; 16];
        let n = store.get("secret", &mut buf, 0).unwrap();
        assert_eq!(&buf[..n as usize], b"hunter2");
    }

    #[test]
    fn detects_replayed_ciphertext() {
        let (tdb, rp, dk) = fresh_stores();
        let store = SecureStore::new(Arc::clone(&tdb), Some(Arc::clone(&rp)), Arc::clone(&dk), test_rng());
        store
            .set("counter", b"1", Flags::REQUIRE_REPLAY_PROTECTION)
            .unwrap();
        let info = tdb.get_info("counter").unwrap();
        let mut snapshot = vec![0u8; info.size as usize];
        tdb.get("counter", &mut snapshot, 0).unwrap();

        store
            .set("counter", b"2", Flags::REQUIRE_REPLAY_PROTECTION)
            .unwrap();

        // Roll the underlying record back to the first snapshot: the RP-pinned tag no longer
        // matches, so reads must fail rather than silently return the stale value.
        tdb.set("counter", &snapshot, Flags::REQUIRE_REPLAY_PROTECTION).unwrap();
        let mut buf = [0u8; 4];
        let err = store.get("counter", &mut buf, 0).unwrap_err();
        assert!(matches!(err, Error::RbpAuthenticationFailed));
    }

    #[test]
    fn streaming_write_matches_one_shot() {
        let (tdb, rp, dk) = fresh_stores();
        let store = SecureStore::new(tdb, Some(rp), dk, test_rng());
        store.set_start("streamed", 11, Flags::empty()).unwrap();
        store.set_add_data(b"hello ").unwrap();
        store.set_add_data(b"world").unwrap();
        store.set_finalize().unwrap();

        let mut buf = [0u8; 16];
        let n = store.get("streamed", &mut buf, 0).unwrap();
        assert_eq!(&buf[..n as usize], b"hello world");
    }

    #[test]
    fn streaming_write_rejects_size_mismatch() {
        let (tdb, rp, dk) = fresh_stores();
        let store = SecureStore::new(tdb, Some(rp), dk, test_rng());
        store.set_start("short", 99, Flags::empty()).unwrap();
        store.set_add_data(b"too short").unwrap();
        assert!(matches!(store.set_finalize(), Err(Error::InvalidArgument)));
    }

    #[test]
    fn same_length_overwrites_use_distinct_nonces() {
        let (tdb, rp, dk) = fresh_stores();
        let store = SecureStore::new(Arc::clone(&tdb), Some(rp), dk, test_rng());
        store
            .set("rekeyed", b"AAAAAAAAAAAAAAAA", Flags::REQUIRE_CONFIDENTIALITY)
            .unwrap();
        let info1 = tdb.get_info("rekeyed").unwrap();
        let mut blob1 = vec![0u8; info1.size as usize];
        tdb.get("rekeyed", &mut blob1, 0).unwrap();

        store
            .set("rekeyed", b"BBBBBBBBBBBBBBBB", Flags::REQUIRE_CONFIDENTIALITY)
            .unwrap();
        let info2 = tdb.get_info("rekeyed").unwrap();
        let mut blob2 = vec![0u8; info2.size as usize];
        tdb.get("rekeyed", &mut blob2, 0).unwrap();

        // Same key, same-length plaintext: if the nonce repeated, the ciphertext bytes would
        // differ by exactly the plaintext XOR delta. A random nonce makes the ciphertexts
        // unrelated instead.
        assert_ne!(blob1, blob2);
        let ct1 = &blob1[blob1.len() - 16..];
        let ct2 = &blob2[blob2.len() - 16..];
        assert_ne!(ct1, ct2);
    }

    #[test]
    fn confidentiality_flag_gates_encryption() {
        let (tdb, rp, dk) = fresh_stores();
        let store = SecureStore::new(Arc::clone(&tdb), Some(rp), dk, test_rng());
        store.set("plain", b"visible", Flags::empty()).unwrap();
        store
            .set("enc", b"visible", Flags::REQUIRE_CONFIDENTIALITY)
            .unwrap();

        let info_plain = tdb.get_info("plain").unwrap();
        let mut plain_blob = vec![0u8; info_plain.size as usize];
        tdb.get("plain", &mut plain_blob, 0).unwrap();
        assert!(plain_blob.ends_with(b"visible"));

        let info_enc = tdb.get_info("enc").unwrap();
        let mut enc_blob = vec![0u8; info_enc.size as usize];
        tdb.get("enc", &mut enc_blob, 0).unwrap();
        assert!(!enc_blob.ends_with(b"visible"));
    }

    #[test]
    fn weakening_flags_on_reset_is_rejected() {
        let (tdb, rp, dk) = fresh_stores();
        let store = SecureStore::new(tdb, Some(rp), dk, test_rng());
        store
            .set("guarded", b"v1", Flags::REQUIRE_REPLAY_PROTECTION)
            .unwrap();
        let err = store.set("guarded", b"v2", Flags::empty()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument));
        let mut buf = [0u8; 8];
        let n = store.get("guarded", &mut buf, 0).unwrap();
        assert_eq!(&buf[..n as usize], b"v1");
    }

    #[test]
    fn tampered_ciphertext_fails_authentication() {
        let (tdb, rp, dk) = fresh_stores();
        let store = SecureStore::new(Arc::clone(&tdb), Some(rp), dk, test_rng());
        store.set("k", b"payload", Flags::empty()).unwrap();
        let info = tdb.get_info("k").unwrap();
        let mut blob = vec![0u8; info.size as usize];
        tdb.get("k", &mut blob, 0).unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        tdb.set("k", &blob, Flags::empty()).unwrap();

        let mut buf = [0u8; 16];
        let err = store.get("k", &mut buf, 0).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed));
    }
}
