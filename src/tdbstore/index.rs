//! RAM index mapping a 32-bit key hash to its record's offset and flags (§3.2).

use sha2::{Digest, Sha256};

use crate::kv::internal::InternalFlags;

/// One live key's cached location.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    pub hash: u32,
    pub offset: u32,
    pub flags: InternalFlags,
}

/// Linear-scan RAM index, matching the spec's "RAM table, one entry per live key" design —
/// a hash table would over-engineer what is, in practice, a few hundred entries at most.
#[derive(Debug, Default)]
pub struct RamIndex {
    entries: Vec<IndexEntry>,
}

impl RamIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Candidate offsets whose cached hash matches `key`'s hash; caller must still confirm by
    /// comparing the actual key bytes, since hashes may collide.
    pub fn candidates(&self, key: &str) -> impl Iterator<Item = &IndexEntry> {
        let hash = hash_key(key);
        self.entries.iter().filter(move |e| e.hash == hash)
    }

    /// Inserts a new entry for `key` at `offset`. Callers that are overwriting an existing
    /// key's value must `remove_offset` the prior entry first (resolved via `candidates` + a
    /// key-byte comparison against the stored record) — this store never guesses which
    /// candidate to replace, since hashes may collide.
    pub fn insert(&mut self, key: &str, offset: u32, flags: InternalFlags) {
        self.entries.push(IndexEntry {
            hash: hash_key(key),
            offset,
            flags,
        });
    }

    pub fn remove_offset(&mut self, offset: u32) {
        self.entries.retain(|e| e.offset != offset);
    }
}

/// Hashes a key to the 32-bit value stored in the RAM index, using the low 4 bytes of its
/// SHA-256 digest (§3.2).
#[must_use]
pub fn hash_key(key: &str) -> u32 {
    let digest = Sha256::digest(key.as_bytes());
    u32::from_le_bytes(digest[0..4].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }

    #[test]
    fn insert_then_candidates_finds_entry() {
        let mut idx = RamIndex::new();
        idx.insert("k", 128, InternalFlags::empty());
        let found: Vec<_> = idx.candidates("k").collect();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].offset, 128);
    }
}
