//! Shared KVStore contract used by `TdbStore` and `SecureStore` (§6.1).

use bitflags::bitflags;

use crate::error::Result;

/// Maximum key length in bytes (§6.1).
pub const MAX_KEY_SIZE: usize = 127;

/// Maximum record payload size, per §3.1 (20 low bits of the data-size field).
pub const MAX_DATA_SIZE: u32 = 1024 * 1024 - 1;

const RESERVED_KEY_CHARS: &[char] = &['*', '/', '?', ':', ';', '\\', '"', '|', ' ', '<', '>'];

bitflags! {
    /// Per-record flags (§4.4, §4.5, §9A.5).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Flags: u32 {
        /// Record may never be overwritten or removed except by `reset()`.
        const WRITE_ONCE = 1 << 0;
        /// Payload must be encrypted at rest (SecureStore only).
        const REQUIRE_CONFIDENTIALITY = 1 << 1;
        /// Record is CMAC-authenticated (SecureStore; always implicitly set there).
        const REQUIRE_INTEGRITY = 1 << 2;
        /// Record's CMAC is additionally pinned in a rollback-protection store.
        const REQUIRE_REPLAY_PROTECTION = 1 << 3;
        /// Record survives `TdbStore::factory_reset` (copied in GC pass 1).
        const UPDATE_BACKUP = 1 << 4;
    }
}

/// Internal-only record state, distinct from caller-visible [`Flags`].
pub(crate) mod internal {
    use bitflags::bitflags;

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct InternalFlags: u8 {
            const HAS_BACKUP = 1 << 0;
            const IS_BACKUP  = 1 << 1;
            const RB_PROTECT = 1 << 2;
            const DELETE     = 1 << 3;
        }
    }
}

/// Metadata returned by `get_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetInfo {
    pub size: u32,
    pub flags: Flags,
}

/// Opaque iterator handle returned by `iterator_open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IteratorHandle(pub(crate) usize);

/// Validates a key per §6.1: non-empty, at most [`MAX_KEY_SIZE`] bytes, none of the reserved
/// characters.
pub fn validate_key(key: &str) -> Result<()> {
    use crate::error::Error;
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(Error::InvalidArgument);
    }
    if key.chars().any(|c| RESERVED_KEY_CHARS.contains(&c)) {
        return Err(Error::InvalidArgument);
    }
    Ok(())
}

/// Common operations implemented by both `TdbStore` and `SecureStore`.
///
/// Takes `&self` rather than `&mut self`: per §5, every store guards its state with a single
/// internal recursive mutex so it can be shared across threads as `Arc<Store>` without an
/// outer lock, matching the preemptive-multithreaded-host concurrency model.
pub trait KvStore {
    fn init(&self) -> Result<()>;
    fn deinit(&self) -> Result<()>;
    fn reset(&self) -> Result<()>;

    fn get(&self, key: &str, buf: &mut [u8], offset: u32) -> Result<u32>;
    fn get_info(&self, key: &str) -> Result<GetInfo>;
    fn set(&self, key: &str, data: &[u8], flags: Flags) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    fn iterator_open(&self, prefix: Option<&str>) -> Result<IteratorHandle>;
    fn iterator_next(&self, it: IteratorHandle, out_key: &mut [u8]) -> Result<Option<u32>>;
    fn iterator_close(&self, it: IteratorHandle) -> Result<()>;
}
