//! Secure, rollback-protected, log-structured key-value storage over raw flash.
//!
//! [`TdbStore`] is the general-purpose string-keyed store; [`NvStore`] is a smaller
//! fixed-integer-key store used for low-level device bookkeeping (including, here, backing
//! [`DeviceKey`]'s root of trust and [`SecureStore`]'s rollback-protection tokens);
//! [`SecureStore`] wraps either in a confidentiality/integrity/anti-rollback envelope.

pub mod block_device;
pub mod cmac_kdf;
pub mod crc;
pub mod crypto;
pub mod device_key;
mod error;
pub mod geometry;
pub mod kv;
pub mod nvstore;
pub mod securestore;
pub mod tdbstore;

pub use block_device::BlockDevice;
#[cfg(any(test, feature = "testing"))]
pub use block_device::RamBlockDevice;
pub use device_key::DeviceKey;
pub use error::{Error, Result, Status};
pub use kv::{Flags, GetInfo, IteratorHandle, KvStore};
pub use nvstore::NvStore;
pub use securestore::SecureStore;
pub use tdbstore::TdbStore;
