//! NVStore: fixed 12-bit-integer-keyed log-structured store (§3.3, §4.3).
//!
//! Smaller sibling of `TdbStore`: same two-area ping-pong idea, but keys are small integers
//! looked up via a fixed RAM array rather than a hash table, and each slot additionally tracks
//! an `owner` byte for ownership-tagged allocation (§9A.5).

use std::cell::RefCell;

use log::{debug, info, warn};
use parking_lot::ReentrantMutex;

use crate::block_device::{BlockDevice, PagedBlockDevice};
use crate::crc::crc32_mpeg2;
use crate::error::{Error, Result};
use crate::geometry::AreaLayout;

/// Reserved key identifying the master record; never allocatable to callers.
pub const MASTER_KEY: u16 = 0x0FFE;
const MAX_KEY_VALUE: u16 = 0x0FFD;
const HEADER_SIZE: usize = 12; // key|flags(2) + size|owner(4) + crc(4) + reserved(2)
const FLASH_PROGRAM_RETRIES: u32 = 16;

const fn align_up(len: u32, align: u32) -> u32 {
    (len + align - 1) & !(align - 1)
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct SlotFlags: u16 {
        const SET_ONCE  = 1 << 0;
        const ALLOCATED = 1 << 1;
        const DELETE    = 1 << 2;
    }
}

#[derive(Debug, Clone)]
struct Slot {
    offset: u32,
    area: usize,
    flags: SlotFlags,
    owner: u8,
    size: u32,
}

struct Header {
    key: u16,
    flags: SlotFlags,
    owner: u8,
    size: u32,
    crc: u32,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.key.to_le_bytes());
        buf[2..4].copy_from_slice(&self.flags.bits().to_le_bytes());
        let size_owner = (self.size & 0x00FF_FFFF) | (u32::from(self.owner) << 24);
        buf[4..8].copy_from_slice(&size_owner.to_le_bytes());
        buf[8..12].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        let key = u16::from_le_bytes(buf[0..2].try_into().unwrap());
        let flags = SlotFlags::from_bits_truncate(u16::from_le_bytes(buf[2..4].try_into().unwrap()));
        let size_owner = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let size = size_owner & 0x00FF_FFFF;
        let owner = (size_owner >> 24) as u8;
        let crc = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        Self {
            key,
            flags,
            owner,
            size,
            crc,
        }
    }
}

struct Inner<D: BlockDevice> {
    dev: PagedBlockDevice<D>,
    layout: AreaLayout,
    active: usize,
    free_offset: u32,
    version: u16,
    slots: std::collections::HashMap<u16, Slot>,
    initialized: bool,
}

impl<D: BlockDevice> Inner<D> {
    fn area_addr(&self, area: usize, offset: u32) -> u32 {
        self.layout.areas[area].base + offset
    }

    fn program_size(&self) -> u32 {
        self.dev.program_size()
    }

    fn erase_area(&mut self, area: usize) -> Result<()> {
        let a = self.layout.areas[area];
        self.dev.erase(a.base, a.size)
    }

    fn program_with_retry(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.dev.program(addr, buf) {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < FLASH_PROGRAM_RETRIES => {
                    attempt += 1;
                    warn!("nvstore: program at {addr:#x} failed, retry {attempt}: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn write_slot(
        &mut self,
        area: usize,
        offset: u32,
        key: u16,
        data: &[u8],
        flags: SlotFlags,
        owner: u8,
    ) -> Result<u32> {
        let unaligned = HEADER_SIZE as u32 + data.len() as u32;
        let area_size = self.layout.areas[area].size;
        if u64::from(offset) + u64::from(unaligned) > u64::from(area_size) {
            return Err(Error::MediaFull);
        }
        let mut header = Header {
            key,
            flags,
            owner,
            size: data.len() as u32,
            crc: 0,
        };
        let mut header_bytes = header.encode();
        header.crc = crc32_mpeg2(&[&header_bytes[..HEADER_SIZE - 4], data].concat());
        header_bytes = header.encode();

        let aligned_len = align_up(unaligned, self.program_size());
        let mut buf = vec![0xAAu8; aligned_len as usize];
        buf[..HEADER_SIZE].copy_from_slice(&header_bytes);
        buf[HEADER_SIZE..HEADER_SIZE + data.len()].copy_from_slice(data);

        let addr = self.area_addr(area, offset);
        self.program_with_retry(addr, &buf)?;
        Ok(aligned_len)
    }

    fn read_slot(&mut self, area: usize, offset: u32) -> Result<(Header, Vec<u8>)> {
        let area_size = self.layout.areas[area].size;
        let mut header_bytes = [0u8; HEADER_SIZE];
        let addr = self.area_addr(area, offset);
        self.dev.read(addr, &mut header_bytes)?;
        let header = Header::decode(&header_bytes);
        if u64::from(offset) + u64::from(HEADER_SIZE as u32) + u64::from(header.size)
            > u64::from(area_size)
        {
            return Err(Error::DataCorrupt);
        }
        let mut data = vec![0u8; header.size as usize];
        let data_addr = self.area_addr(area, offset + HEADER_SIZE as u32);
        self.dev.read(data_addr, &mut data)?;
        let expect = crc32_mpeg2(&[&header_bytes[..HEADER_SIZE - 4], &data[..]].concat());
        if expect != header.crc {
            return Err(Error::DataCorrupt);
        }
        Ok((header, data))
    }

    fn scan_area(&mut self, area: usize) -> Result<Vec<(u32, Header, Vec<u8>)>> {
        let area_size = self.layout.areas[area].size;
        let mut out = Vec::new();
        let mut offset = 0u32;
        // master record always occupies slot 0
        let (master_header, _) = self.read_slot(area, 0)?;
        offset += align_up(
            HEADER_SIZE as u32 + master_header.size,
            self.program_size(),
        );
        while offset + HEADER_SIZE as u32 <= area_size {
            let Ok((header, data)) = self.read_slot(area, offset) else {
                break;
            };
            let aligned =
                align_up(HEADER_SIZE as u32 + header.size, self.program_size());
            out.push((offset, header, data));
            offset += aligned;
        }
        Ok(out)
    }

    fn rebuild(&mut self, area: usize) -> Result<()> {
        let all = self.scan_area(area)?;
        self.slots.clear();
        for (offset, header, data) in all {
            if header.key == MASTER_KEY {
                continue;
            }
            if header.flags.contains(SlotFlags::DELETE) {
                self.slots.remove(&header.key);
                continue;
            }
            self.slots.insert(
                header.key,
                Slot {
                    offset,
                    area,
                    flags: header.flags,
                    owner: header.owner,
                    size: data.len() as u32,
                },
            );
        }
        Ok(())
    }
}

/// A fixed-integer-key log-structured store, used for rollback-protection tokens and the
/// device root-of-trust.
pub struct NvStore<D: BlockDevice> {
    inner: ReentrantMutex<RefCell<Inner<D>>>,
    max_keys: u16,
}

impl<D: BlockDevice> NvStore<D> {
    pub fn new(dev: D, base: u32, total_size: u32, max_keys: u16) -> Result<Self> {
        if max_keys == 0 || max_keys > MAX_KEY_VALUE {
            return Err(Error::InvalidArgument);
        }
        let layout = AreaLayout::compute(&dev, base, total_size)?;
        Ok(Self {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                dev: PagedBlockDevice::new(dev),
                layout,
                active: 0,
                free_offset: 0,
                version: 1,
                slots: std::collections::HashMap::new(),
                initialized: false,
            })),
            max_keys,
        })
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<D>) -> Result<R>) -> Result<R> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if !inner.initialized {
            return Err(Error::NotReady);
        }
        f(&mut inner)
    }

    /// Total configured size in bytes, summed across both areas (§4.3).
    pub fn size(&self) -> Result<u32> {
        self.with_inner(|inner| {
            Ok(inner.layout.areas[0].size + inner.layout.areas[1].size)
        })
    }

    /// The number of allocatable keys this instance was constructed with (§4.3's `get_max_keys`).
    /// Growing this bound requires constructing a new `NvStore` over the same range and
    /// re-`init`ing (§9 "dynamic max-keys growth"); shrinking additionally requires `reset()`
    /// first, since a smaller bound could otherwise orphan keys above it.
    #[must_use]
    pub fn max_keys(&self) -> u16 {
        self.max_keys
    }

    /// The largest `max_keys` this store could ever be constructed with, fixed by the 12-bit key
    /// space reserving `MASTER_KEY` (§4.3's `get_max_possible_keys`).
    #[must_use]
    pub const fn max_possible_keys() -> u16 {
        MAX_KEY_VALUE
    }

    pub fn init(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.initialized {
            return Ok(());
        }
        if inner.dev.erase_value().is_none() {
            return Err(Error::NotReady);
        }
        inner.dev.init()?;

        let m0 = inner.read_slot(0, 0).ok();
        let m1 = inner.read_slot(1, 0).ok();

        let version_of = |pair: &Option<(Header, Vec<u8>)>| -> Option<u16> {
            pair.as_ref()
                .filter(|(h, _)| h.key == MASTER_KEY)
                .and_then(|(_, data)| data.get(0..2))
                .map(|b| u16::from_le_bytes([b[0], b[1]]))
        };
        let ver0 = version_of(&m0);
        let ver1 = version_of(&m1);

        let active = match (ver0, ver1) {
            (Some(a), Some(b)) => {
                let diff = b.wrapping_sub(a);
                usize::from(diff != 0 && diff < u16::MAX / 2)
            }
            (Some(_), None) => 0,
            (None, Some(_)) => 1,
            (None, None) => {
                inner.active = 0;
                inner.erase_area(0)?;
                inner.erase_area(1)?;
                let written = inner.write_slot(0, 0, MASTER_KEY, &1u16.to_le_bytes(), SlotFlags::empty(), 0)?;
                inner.free_offset = written;
                inner.version = 1;
                inner.slots.clear();
                inner.initialized = true;
                info!("nvstore: formatted fresh device");
                return Ok(());
            }
        };
        inner.active = active;
        inner.version = if active == 0 { ver0 } else { ver1 }.unwrap_or(1);
        inner.rebuild(active)?;
        let live_max = inner
            .slots
            .values()
            .map(|s| s.offset + HEADER_SIZE as u32 + s.size)
            .max()
            .unwrap_or(0);
        let master_len =
            align_up(HEADER_SIZE as u32 + 2, inner.program_size());
        inner.free_offset = live_max.max(master_len);
        inner.initialized = true;
        info!("nvstore: init complete, active area {active}");
        Ok(())
    }

    pub fn deinit(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.dev.sync()?;
        inner.dev.deinit()?;
        inner.initialized = false;
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.erase_area(0)?;
        inner.erase_area(1)?;
        inner.active = 0;
        inner.version = 1;
        let written = inner.write_slot(0, 0, MASTER_KEY, &1u16.to_le_bytes(), SlotFlags::empty(), 0)?;
        inner.free_offset = written;
        inner.slots.clear();
        Ok(())
    }

    fn check_key(&self, key: u16) -> Result<()> {
        if key >= self.max_keys {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }

    pub fn set(&self, key: u16, data: &[u8]) -> Result<()> {
        self.set_impl(key, data, false, 0)
    }

    pub fn set_once(&self, key: u16, data: &[u8]) -> Result<()> {
        self.set_impl(key, data, true, 0)
    }

    fn set_impl(&self, key: u16, data: &[u8], set_once: bool, owner: u8) -> Result<()> {
        self.check_key(key)?;
        self.with_inner(|inner| {
            if let Some(existing) = inner.slots.get(&key) {
                if existing.flags.contains(SlotFlags::SET_ONCE) {
                    return Err(Error::WriteProtected);
                }
            }
            let flags = if set_once {
                SlotFlags::SET_ONCE | SlotFlags::ALLOCATED
            } else {
                SlotFlags::ALLOCATED
            };
            let written = match inner.write_slot(inner.active, inner.free_offset, key, data, flags, owner) {
                Ok(n) => n,
                Err(Error::MediaFull) => {
                    debug!("nvstore: area full, GC before set({key})");
                    inner.run_gc()?;
                    inner.write_slot(inner.active, inner.free_offset, key, data, flags, owner)?
                }
                Err(e) => return Err(e),
            };
            inner.slots.insert(
                key,
                Slot {
                    offset: inner.free_offset,
                    area: inner.active,
                    flags,
                    owner,
                    size: data.len() as u32,
                },
            );
            inner.free_offset += written;
            inner.dev.sync()?;
            Ok(())
        })
    }

    pub fn get(&self, key: u16, buf: &mut [u8]) -> Result<u32> {
        self.check_key(key)?;
        self.with_inner(|inner| {
            let Some(slot) = inner.slots.get(&key).cloned() else {
                return Err(Error::NotFound);
            };
            if buf.len() < slot.size as usize {
                return Err(Error::BuffTooSmall);
            }
            let (_, data) = inner.read_slot(slot.area, slot.offset)?;
            buf[..data.len()].copy_from_slice(&data);
            Ok(data.len() as u32)
        })
    }

    pub fn get_item_size(&self, key: u16) -> Result<u32> {
        self.check_key(key)?;
        self.with_inner(|inner| {
            inner
                .slots
                .get(&key)
                .map(|s| s.size)
                .ok_or(Error::NotFound)
        })
    }

    pub fn remove(&self, key: u16) -> Result<()> {
        self.check_key(key)?;
        self.with_inner(|inner| {
            let Some(existing) = inner.slots.get(&key).cloned() else {
                return Err(Error::NotFound);
            };
            if existing.flags.contains(SlotFlags::SET_ONCE) {
                return Err(Error::WriteProtected);
            }
            let written = match inner.write_slot(
                inner.active,
                inner.free_offset,
                key,
                &[],
                SlotFlags::DELETE,
                existing.owner,
            ) {
                Ok(n) => n,
                Err(Error::MediaFull) => {
                    debug!("nvstore: area full, GC before remove({key})");
                    inner.run_gc()?;
                    inner.write_slot(
                        inner.active,
                        inner.free_offset,
                        key,
                        &[],
                        SlotFlags::DELETE,
                        existing.owner,
                    )?
                }
                Err(e) => return Err(e),
            };
            inner.free_offset += written;
            inner.slots.remove(&key);
            inner.dev.sync()?;
            Ok(())
        })
    }

    /// Allocates the lowest unused key and tags it with `owner` (§9A.5).
    pub fn allocate_key(&self, owner: u8) -> Result<u16> {
        self.with_inner(|inner| {
            for candidate in 0..self.max_keys {
                if !inner.slots.contains_key(&candidate) {
                    return Ok(candidate);
                }
            }
            Err(Error::MediaFull)
        })
        .and_then(|key| {
            // Reserve it immediately with an empty value so a concurrent caller won't reuse it.
            self.set_impl(key, &[], false, owner)?;
            Ok(key)
        })
    }

    /// Removes every key currently tagged with `owner` (§9A.5).
    pub fn free_all_keys_by_owner(&self, owner: u8) -> Result<()> {
        let keys: Vec<u16> = self.with_inner(|inner| {
            Ok(inner
                .slots
                .iter()
                .filter(|(_, s)| s.owner == owner)
                .map(|(k, _)| *k)
                .collect())
        })?;
        for key in keys {
            self.remove(key)?;
        }
        Ok(())
    }
}

impl<D: BlockDevice> Inner<D> {
    fn run_gc(&mut self) -> Result<()> {
        let from = self.active;
        let to = self.layout.other(from);
        debug!("nvstore: GC area {from} -> {to}");
        self.erase_area(to)?;
        let next_version = if self.version == u16::MAX {
            1
        } else {
            self.version + 1
        };
        let mut write_offset =
            self.write_slot(to, 0, MASTER_KEY, &next_version.to_le_bytes(), SlotFlags::empty(), 0)?;

        let mut new_slots = std::collections::HashMap::new();
        let live: Vec<(u16, Slot)> = self
            .slots
            .iter()
            .map(|(k, s)| (*k, s.clone()))
            .collect();
        for (key, slot) in live {
            let (_, data) = self.read_slot(slot.area, slot.offset)?;
            let written = self.write_slot(to, write_offset, key, &data, slot.flags, slot.owner)?;
            new_slots.insert(
                key,
                Slot {
                    offset: write_offset,
                    area: to,
                    flags: slot.flags,
                    owner: slot.owner,
                    size: data.len() as u32,
                },
            );
            write_offset += written;
        }

        self.dev.sync()?;
        self.active = to;
        self.free_offset = write_offset;
        self.version = next_version;
        self.slots = new_slots;
        self.erase_area(from)?;
        self.dev.sync()?;
        Ok(())
    }
}
