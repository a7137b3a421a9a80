//! Root-of-trust persistence and subkey derivation (§3.5, §4.2).
//!
//! The root of trust (RoT) is injected once — either supplied by the caller (a provisioning step,
//! e.g. from a secure enclave) or generated on first use from a TRNG — and persisted in a single
//! reserved [`NvStore`] slot. Every other key this crate needs (SecureStore's per-record keys, its
//! rollback-protection MAC key) is derived from the RoT via [`cmac_kdf`], never stored itself.

use std::sync::Arc;

use parking_lot::Mutex;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::block_device::BlockDevice;
use crate::cmac_kdf::cmac_kdf;
use crate::error::{Error, Result};
use crate::nvstore::NvStore;

/// Object-safe union of `RngCore + CryptoRng + Send`, letting [`DeviceKey`] hold a boxed entropy
/// source without becoming generic over its concrete RNG type.
trait DeviceRng: RngCore + CryptoRng + Send {}
impl<T: RngCore + CryptoRng + Send> DeviceRng for T {}

/// Reserved NVStore key holding the wrapped root of trust. Distinct from any key an
/// `allocate_key` caller could receive, since [`NvStore::new`] rejects `max_keys` that would let
/// an owner-allocated key collide with it.
const ROOT_OF_TRUST_KEY: u16 = 0;

/// Owner tag used for NVStore bookkeeping; DeviceKey never calls `allocate_key` itself (it owns
/// exactly the one fixed slot above) but shares the owner-tag convention so `free_all_keys_by_owner`
/// sweeps stay meaningful if this store and a `SecureStore` RP-token store are ever colocated.
pub const OWNER_TAG: u8 = 1;

pub const ROOT_KEY_SIZE: usize = 16;

/// Persists and derives keys from a single root of trust backed by an [`NvStore`].
pub struct DeviceKey<D: BlockDevice> {
    nvstore: Arc<NvStore<D>>,
    rng: Option<Mutex<Box<dyn DeviceRng>>>,
}

impl<D: BlockDevice> DeviceKey<D> {
    /// No entropy source wired in: [`Self::generate_derived_key`] fails with `NoKeyInjected`
    /// until a root of trust is supplied via [`Self::inject_root_of_trust`] or
    /// [`Self::ensure_root_of_trust`].
    #[must_use]
    pub fn new(nvstore: Arc<NvStore<D>>) -> Self {
        Self { nvstore, rng: None }
    }

    /// Same as [`Self::new`], but wires in a hardware/OS entropy source so
    /// [`Self::generate_derived_key`] can auto-provision a root of trust the first time it's
    /// called with none present, rather than failing (spec.md §4.2: "on first call when no RoT
    /// is present, if a hardware TRNG is available, fills and injects a fresh RoT").
    #[must_use]
    pub fn new_with_rng<R: RngCore + CryptoRng + Send + 'static>(
        nvstore: Arc<NvStore<D>>,
        rng: R,
    ) -> Self {
        Self {
            nvstore,
            rng: Some(Mutex::new(Box::new(rng))),
        }
    }

    fn has_root_of_trust(&self) -> bool {
        let mut buf = [0u8; ROOT_KEY_SIZE];
        self.nvstore.get(ROOT_OF_TRUST_KEY, &mut buf).is_ok()
    }

    /// Persists a caller-supplied root of trust. Fails with [`Error::KeyAlreadyExists`] if one is
    /// already present — the RoT is injected exactly once over the life of the device.
    pub fn inject_root_of_trust(&self, rot: &[u8; ROOT_KEY_SIZE]) -> Result<()> {
        if self.has_root_of_trust() {
            return Err(Error::KeyAlreadyExists);
        }
        self.nvstore.set_once(ROOT_OF_TRUST_KEY, rot)
    }

    /// Generates a fresh root of trust from `rng` and persists it, if none is present yet.
    /// No-op (returns `Ok`) if a root of trust already exists.
    pub fn ensure_root_of_trust<R: RngCore + CryptoRng>(&self, rng: &mut R) -> Result<()> {
        if self.has_root_of_trust() {
            return Ok(());
        }
        let mut rot = Zeroizing::new([0u8; ROOT_KEY_SIZE]);
        rng.fill_bytes(rot.as_mut());
        match self.inject_root_of_trust(&rot) {
            Ok(()) | Err(Error::KeyAlreadyExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Derives `out.len()` bytes of key material bound to `label`/`context` from the persisted
    /// root of trust. If none is present yet and an entropy source was wired in via
    /// [`Self::new_with_rng`], auto-provisions a fresh one on this first call (spec.md §4.2);
    /// otherwise fails with [`Error::NoKeyInjected`].
    pub fn generate_derived_key(&self, label: &[u8], context: &[u8], out: &mut [u8]) -> Result<()> {
        if !self.has_root_of_trust() {
            match &self.rng {
                Some(rng) => {
                    let mut rot = Zeroizing::new([0u8; ROOT_KEY_SIZE]);
                    rng.lock().fill_bytes(rot.as_mut());
                    match self.inject_root_of_trust(&rot) {
                        Ok(()) | Err(Error::KeyAlreadyExists) => {}
                        Err(e) => return Err(e),
                    }
                }
                None => return Err(Error::NoKeyInjected),
            }
        }

        let mut rot = Zeroizing::new([0u8; ROOT_KEY_SIZE]);
        let read = self
            .nvstore
            .get(ROOT_OF_TRUST_KEY, rot.as_mut())
            .map_err(|e| if matches!(e, Error::NotFound) { Error::NoKeyInjected } else { e })?;
        if read as usize != ROOT_KEY_SIZE {
            return Err(Error::DataCorrupt);
        }
        cmac_kdf(&rot, label, context, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::RamBlockDevice;
    use rand_chacha::ChaCha20Rng;
    use rand_core::SeedableRng;

    fn fresh_device_key() -> DeviceKey<RamBlockDevice> {
        let dev = RamBlockDevice::new(16 * 1024, 4096, 1);
        let nv = Arc::new(NvStore::new(dev, 0, 16 * 1024, 32).unwrap());
        nv.init().unwrap();
        DeviceKey::new(nv)
    }

    #[test]
    fn inject_then_derive_is_deterministic() {
        let dk = fresh_device_key();
        dk.inject_root_of_trust(&[0x5Au8; ROOT_KEY_SIZE]).unwrap();
        let mut a = [0u8; 16];
        let mut b = [0u8; 16];
        dk.generate_derived_key(b"securestore-record", b"", &mut a).unwrap();
        dk.generate_derived_key(b"securestore-record", b"", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn second_injection_is_rejected() {
        let dk = fresh_device_key();
        dk.inject_root_of_trust(&[1u8; ROOT_KEY_SIZE]).unwrap();
        assert!(matches!(
            dk.inject_root_of_trust(&[2u8; ROOT_KEY_SIZE]),
            Err(Error::KeyAlreadyExists)
        ));
    }

    #[test]
    fn derive_before_injection_fails() {
        let dk = fresh_device_key();
        let mut out = [0u8; 16];
        assert!(matches!(
            dk.generate_derived_key(b"x", b"", &mut out),
            Err(Error::NoKeyInjected)
        ));
    }

    #[test]
    fn ensure_generates_once_from_rng() {
        let dk = fresh_device_key();
        let mut rng = ChaCha20Rng::seed_from_u64(7);
        dk.ensure_root_of_trust(&mut rng).unwrap();
        let mut a = [0u8; 16];
        dk.generate_derived_key(b"label", b"", &mut a).unwrap();

        // Calling again must not regenerate the RoT (derived key stays stable).
        dk.ensure_root_of_trust(&mut rng).unwrap();
        let mut b = [0u8; 16];
        dk.generate_derived_key(b"label", b"", &mut b).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn generate_derived_key_auto_provisions_when_rng_is_wired_in() {
        let dev = RamBlockDevice::new(16 * 1024, 4096, 1);
        let nv = Arc::new(NvStore::new(dev, 0, 16 * 1024, 32).unwrap());
        nv.init().unwrap();
        let dk = DeviceKey::new_with_rng(nv, ChaCha20Rng::seed_from_u64(3));

        let mut a = [0u8; 16];
        dk.generate_derived_key(b"label", b"", &mut a).unwrap();

        // The auto-provisioned RoT must stick: a second call derives the same key rather than
        // silently re-provisioning.
        let mut b = [0u8; 16];
        dk.generate_derived_key(b"label", b"", &mut b).unwrap();
        assert_eq!(a, b);
    }
}
