//! TDBStore: a log-structured, two-area, copy-on-write key/value engine (§3.1-3.2, §4.4).
//!
//! Generalizes `credential_store.rs`'s single fixed-offset record (magic/crc/version/payload)
//! into an append-only log of many such records per area, with a RAM index for O(1)-ish lookup
//! and GC-driven area compaction in place of the teacher's single always-overwrite slot.

mod gc;
mod index;
mod master;
mod record;

use std::cell::RefCell;

use log::{debug, info, trace, warn};
use parking_lot::ReentrantMutex;

use crate::block_device::{BlockDevice, PagedBlockDevice};
use crate::error::{Error, Result};
use crate::geometry::AreaLayout;
use crate::kv::internal::InternalFlags;
use crate::kv::{validate_key, Flags, GetInfo, IteratorHandle, KvStore, MAX_DATA_SIZE};

use index::RamIndex;
use master::MasterRecord;
use record::{align_up, compute_record_crc, RecordHeader, HEADER_SIZE};

const FLASH_PROGRAM_RETRIES: u32 = 16;

/// In-progress streaming write, guarded by [`TdbStore`]'s own recursive mutex (separate from
/// `Inner`'s) so only one caller can be mid-stream at a time, matching §5's single-mutex-per-store
/// model and mirroring `SecureStore`'s streaming design.
struct StreamState {
    key: String,
    flags: Flags,
    final_size: u32,
    buffer: Vec<u8>,
}

/// A decoded, in-RAM copy of one live record, used while copying during GC.
struct RecordView {
    key: String,
    data: Vec<u8>,
    user_flags: Flags,
    internal_flags: InternalFlags,
    offset: u32,
}

struct Inner<D: BlockDevice> {
    dev: PagedBlockDevice<D>,
    layout: AreaLayout,
    active: usize,
    free_offset: u32,
    master: MasterRecord,
    index: RamIndex,
    initialized: bool,
    open_iterators: Vec<Vec<String>>,
}

impl<D: BlockDevice> Inner<D> {
    fn program_size(&self) -> u32 {
        self.dev.program_size()
    }

    fn area_addr(&self, area: usize, offset: u32) -> u32 {
        self.layout.areas[area].base + offset
    }

    fn erase_area(&mut self, area: usize) -> Result<()> {
        let a = self.layout.areas[area];
        self.dev.erase(a.base, a.size)
    }

    /// Writes one record at `(area, offset)`. Returns the aligned length consumed.
    fn append_record_raw(
        &mut self,
        area: usize,
        offset: u32,
        key: &str,
        data: &[u8],
        user_flags: Flags,
        internal_flags: InternalFlags,
    ) -> Result<u32> {
        let key_bytes = key.as_bytes();
        let header = RecordHeader::new(
            user_flags,
            internal_flags,
            key_bytes.len() as u16,
            data.len() as u32,
        )?;
        let unaligned = header.unaligned_len();
        let area_size = self.layout.areas[area].size;
        if offset as u64 + unaligned as u64 > area_size as u64 {
            return Err(Error::MediaFull);
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        header.encode(&mut header_bytes);
        let crc = compute_record_crc(&header_bytes[..HEADER_SIZE - 4], key_bytes, data);
        let mut header = header;
        header.crc = crc;
        header.encode(&mut header_bytes);

        let aligned_len = align_up(unaligned, self.program_size());
        let mut buf = vec![0xAAu8; aligned_len as usize];
        buf[..HEADER_SIZE].copy_from_slice(&header_bytes);
        buf[HEADER_SIZE..HEADER_SIZE + key_bytes.len()].copy_from_slice(key_bytes);
        buf[HEADER_SIZE + key_bytes.len()..HEADER_SIZE + key_bytes.len() + data.len()]
            .copy_from_slice(data);

        let addr = self.area_addr(area, offset);
        self.program_with_retry(addr, &buf)?;
        Ok(aligned_len)
    }

    fn program_with_retry(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.dev.program(addr, buf) {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < FLASH_PROGRAM_RETRIES => {
                    attempt += 1;
                    warn!("tdbstore: program at {addr:#x} failed, retry {attempt}: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads and CRC-verifies a single record at `(area, offset)`.
    fn read_record(&mut self, area: usize, offset: u32) -> Result<(RecordHeader, String, Vec<u8>)> {
        let area_size = self.layout.areas[area].size;
        let mut header_bytes = [0u8; HEADER_SIZE];
        self.dev
            .read(self.area_addr(area, offset), &mut header_bytes)?;
        let header = RecordHeader::decode(&header_bytes)?;
        let unaligned = header.unaligned_len();
        if offset as u64 + u64::from(unaligned) > u64::from(area_size) {
            return Err(Error::DataCorrupt);
        }

        let key_start = offset + HEADER_SIZE as u32;
        let mut key_buf = vec![0u8; header.key_size as usize];
        self.dev.read(self.area_addr(area, key_start), &mut key_buf)?;
        let data_start = key_start + header.key_size as u32;
        let mut data_buf = vec![0u8; header.data_size as usize];
        self.dev
            .read(self.area_addr(area, data_start), &mut data_buf)?;

        let expect_crc = compute_record_crc(&header_bytes[..HEADER_SIZE - 4], &key_buf, &data_buf);
        if expect_crc != header.crc {
            return Err(Error::DataCorrupt);
        }
        let key = String::from_utf8(key_buf).map_err(|_| Error::DataCorrupt)?;
        Ok((header, key, data_buf))
    }

    /// Reads the master record for `area`, or `None` if the area is blank or corrupt.
    fn read_master(&mut self, area: usize) -> Option<MasterRecord> {
        let (_, key, data) = self.read_record(area, 0).ok()?;
        if key != master::MASTER_RECORD_KEY {
            return None;
        }
        MasterRecord::decode(&data).ok()
    }

    /// Scans an area from its first record (after the master record) to the first blank or
    /// corrupt slot, returning every record encountered (including tombstones and overwritten
    /// copies — callers collapse to "live" via `collect_live_records`).
    fn scan_area(&mut self, area: usize) -> Result<Vec<(u32, RecordHeader, String, Vec<u8>)>> {
        let area_size = self.layout.areas[area].size;
        let mut results = Vec::new();

        let (master_header, _, _) = self.read_record(area, 0)?;
        let mut offset = align_up(master_header.unaligned_len(), self.program_size());

        while offset + HEADER_SIZE as u32 <= area_size {
            let Ok((header, key, data)) = self.read_record(area, offset) else {
                break; // blank or torn tail
            };
            let aligned = align_up(header.unaligned_len(), self.program_size());
            results.push((offset, header, key, data));
            offset += aligned;
        }
        Ok(results)
    }

    fn read_header(&mut self, area: usize, offset: u32) -> Result<RecordHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        self.dev.read(self.area_addr(area, offset), &mut buf)?;
        RecordHeader::decode(&buf)
    }

    fn collect_live_records(&mut self, area: usize) -> Result<Vec<RecordView>> {
        let all = self.scan_area(area)?;
        let mut latest: std::collections::HashMap<String, (u32, RecordHeader, Vec<u8>)> =
            std::collections::HashMap::new();
        for (offset, header, key, data) in all {
            if key == master::MASTER_RECORD_KEY {
                continue;
            }
            latest.insert(key, (offset, header, data));
        }
        Ok(latest
            .into_iter()
            .filter(|(_, (_, header, _))| !header.internal_flags.contains(InternalFlags::DELETE))
            .map(|(key, (offset, header, data))| RecordView {
                key,
                data,
                user_flags: header.user_flags,
                internal_flags: header.internal_flags,
                offset,
            })
            .collect())
    }

    fn rebuild_index_from_area(&mut self, area: usize) -> Result<()> {
        let live = self.collect_live_records(area)?;
        self.index.clear();
        for record in &live {
            self.index
                .insert(&record.key, record.offset, record.internal_flags);
        }
        Ok(())
    }

    fn find_current(&mut self, key: &str) -> Result<Option<(u32, RecordHeader)>> {
        let candidate_offsets: Vec<u32> = self.index.candidates(key).map(|e| e.offset).collect();
        for offset in candidate_offsets {
            let header = self.read_header(self.active, offset)?;
            let key_start = offset + HEADER_SIZE as u32;
            let mut key_buf = vec![0u8; header.key_size as usize];
            let addr = self.area_addr(self.active, key_start);
            self.dev.read(addr, &mut key_buf)?;
            if key_buf == key.as_bytes() {
                if header.internal_flags.contains(InternalFlags::DELETE) {
                    return Ok(None);
                }
                return Ok(Some((offset, header)));
            }
        }
        Ok(None)
    }
}

/// A log-structured key/value store over a raw flash-like block device.
///
/// Cheap to clone via `Arc`; internally serializes all operations through a single recursive
/// mutex (§5), so a single instance may be shared across threads.
pub struct TdbStore<D: BlockDevice> {
    inner: ReentrantMutex<RefCell<Inner<D>>>,
    stream: ReentrantMutex<RefCell<Option<StreamState>>>,
}

impl<D: BlockDevice> TdbStore<D> {
    /// Creates a store over `[base, base + total_size)` of `dev`. Call [`KvStore::init`] before
    /// use.
    pub fn new(dev: D, base: u32, total_size: u32) -> Result<Self> {
        let layout = AreaLayout::compute(&dev, base, total_size)?;
        Ok(Self {
            inner: ReentrantMutex::new(RefCell::new(Inner {
                dev: PagedBlockDevice::new(dev),
                layout,
                active: 0,
                free_offset: 0,
                master: MasterRecord::first(),
                index: RamIndex::new(),
                initialized: false,
                open_iterators: Vec::new(),
            })),
            stream: ReentrantMutex::new(RefCell::new(None)),
        })
    }

    /// Begins a streaming write. Only one stream may be open at a time per store instance.
    /// `final_size` is the total byte length the caller commits to delivering across subsequent
    /// `set_add_data` calls; `set_finalize` rejects a mismatch with `InvalidArgument` (§4.4, §6.1).
    pub fn set_start(&self, key: &str, final_size: u32, flags: Flags) -> Result<()> {
        validate_key(key)?;
        if final_size > MAX_DATA_SIZE {
            return Err(Error::InvalidArgument);
        }
        let guard = self.stream.lock();
        let mut slot = guard.borrow_mut();
        if slot.is_some() {
            return Err(Error::OsError);
        }
        *slot = Some(StreamState {
            key: key.to_string(),
            flags,
            final_size,
            buffer: Vec::new(),
        });
        Ok(())
    }

    /// Feeds the next chunk of data into the in-progress stream started by [`Self::set_start`].
    pub fn set_add_data(&self, chunk: &[u8]) -> Result<()> {
        let guard = self.stream.lock();
        let mut slot = guard.borrow_mut();
        let state = slot.as_mut().ok_or(Error::NotReady)?;
        state.buffer.extend_from_slice(chunk);
        Ok(())
    }

    /// Completes the in-progress stream, committing the buffered record to flash.
    pub fn set_finalize(&self) -> Result<()> {
        let state = {
            let guard = self.stream.lock();
            guard.borrow_mut().take().ok_or(Error::NotReady)?
        };
        if state.buffer.len() as u32 != state.final_size {
            return Err(Error::InvalidArgument);
        }
        self.set_record(&state.key, &state.buffer, state.flags)
    }

    /// Shared append-with-GC-retry path used by both the one-shot [`KvStore::set`] and
    /// [`Self::set_finalize`].
    fn set_record(&self, key: &str, data: &[u8], flags: Flags) -> Result<()> {
        validate_key(key)?;
        if data.len() as u32 > MAX_DATA_SIZE {
            return Err(Error::InvalidArgument);
        }
        self.with_inner(|inner| {
            if let Some((old_offset, old_header)) = inner.find_current(key)? {
                if old_header.user_flags.contains(Flags::WRITE_ONCE) {
                    return Err(Error::WriteProtected);
                }
                inner.index.remove_offset(old_offset);
            }

            let internal = InternalFlags::empty();
            let written = match inner.append_record_raw(
                inner.active,
                inner.free_offset,
                key,
                data,
                flags,
                internal,
            ) {
                Ok(n) => n,
                Err(Error::MediaFull) => {
                    debug!("tdbstore: area full, running GC before set({key})");
                    inner.run_gc(false)?;
                    // GC scans flash directly, so it just copied forward whatever on-flash
                    // copy of `key` still existed before this write landed; drop that stale
                    // index entry so it doesn't shadow the fresh one inserted below.
                    if let Some((dup_offset, _)) = inner.find_current(key)? {
                        inner.index.remove_offset(dup_offset);
                    }
                    inner.append_record_raw(inner.active, inner.free_offset, key, data, flags, internal)?
                }
                Err(e) => return Err(e),
            };
            inner
                .index
                .insert(key, inner.free_offset, internal);
            inner.free_offset += written;
            inner.dev.sync()?;
            info!("tdbstore: set {key} ({} bytes)", data.len());
            Ok(())
        })
    }

    /// Total configured size in bytes, summed across both areas (§4.3).
    pub fn size(&self) -> Result<u32> {
        self.with_inner(|inner| {
            Ok(inner.layout.areas[0].size + inner.layout.areas[1].size)
        })
    }

    /// Runs GC in factory-reset mode: keeps only `UPDATE_BACKUP`-flagged records.
    pub fn factory_reset(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if !inner.initialized {
            return Err(Error::NotReady);
        }
        info!("tdbstore: factory_reset");
        inner.run_gc(true)
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner<D>) -> Result<R>) -> Result<R> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if !inner.initialized {
            return Err(Error::NotReady);
        }
        f(&mut inner)
    }
}

impl<D: BlockDevice> KvStore for TdbStore<D> {
    fn init(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if inner.initialized {
            return Ok(());
        }
        if inner.dev.erase_value().is_none() {
            return Err(Error::NotReady);
        }
        inner.dev.init()?;

        let master0 = inner.read_master(0);
        let master1 = inner.read_master(1);

        let active = match (master0, master1) {
            (Some(m0), Some(m1)) => usize::from(m1.is_newer_than(m0)),
            (Some(_), None) => 0,
            (None, Some(_)) => 1,
            (None, None) => {
                // Fresh device: format area 0.
                inner.active = 0;
                inner.erase_area(0)?;
                inner.erase_area(1)?;
                let written =
                    inner.write_master_public(0, MasterRecord::first())?;
                inner.free_offset = written;
                inner.index.clear();
                inner.initialized = true;
                info!("tdbstore: formatted fresh device");
                return Ok(());
            }
        };

        inner.active = active;
        inner.master = if active == 0 { master0 } else { master1 }
            .unwrap_or_else(MasterRecord::first);

        match inner.rebuild_index_from_area(active) {
            Ok(()) => {}
            Err(_) => {
                warn!("tdbstore: torn record found at init, running GC to salvage");
                inner.run_gc(false)?;
            }
        }
        let area_size = inner.layout.areas[inner.active].size;
        let live = inner.collect_live_records(inner.active)?;
        let master_len = align_up(
            HEADER_SIZE as u32
                + master::MASTER_RECORD_KEY.len() as u32
                + master::MASTER_PAYLOAD_SIZE as u32,
            inner.program_size(),
        );
        let mut used = master_len;
        for record in &live {
            used = used.max(
                record.offset
                    + align_up(
                        HEADER_SIZE as u32 + record.key.len() as u32 + record.data.len() as u32,
                        inner.program_size(),
                    ),
            );
        }
        inner.free_offset = used.min(area_size);
        inner.initialized = true;
        info!("tdbstore: init complete, active area {active}");
        Ok(())
    }

    fn deinit(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.dev.sync()?;
        inner.dev.deinit()?;
        inner.initialized = false;
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        inner.erase_area(0)?;
        inner.erase_area(1)?;
        inner.active = 0;
        inner.master = MasterRecord::first();
        let written = inner.write_master_public(0, inner.master)?;
        inner.free_offset = written;
        inner.index.clear();
        info!("tdbstore: reset");
        Ok(())
    }

    fn get(&self, key: &str, buf: &mut [u8], offset: u32) -> Result<u32> {
        validate_key(key)?;
        self.with_inner(|inner| {
            let Some((rec_offset, header)) = inner.find_current(key)? else {
                return Err(Error::NotFound);
            };
            if offset > header.data_size {
                return Err(Error::InvalidArgument);
            }
            let avail = header.data_size - offset;
            if (buf.len() as u32) < avail {
                return Err(Error::BuffTooSmall);
            }
            let to_copy = avail;
            let data_start = rec_offset
                + HEADER_SIZE as u32
                + header.key_size as u32
                + offset;
            trace!("tdbstore: get {key} -> {to_copy} bytes at offset {offset}");
            let addr = inner.area_addr(inner.active, data_start);
            inner.dev.read(addr, &mut buf[..to_copy as usize])?;
            Ok(to_copy)
        })
    }

    fn get_info(&self, key: &str) -> Result<GetInfo> {
        validate_key(key)?;
        self.with_inner(|inner| {
            let Some((_, header)) = inner.find_current(key)? else {
                return Err(Error::NotFound);
            };
            Ok(GetInfo {
                size: header.data_size,
                flags: header.user_flags,
            })
        })
    }

    fn set(&self, key: &str, data: &[u8], flags: Flags) -> Result<()> {
        self.set_record(key, data, flags)
    }

    fn remove(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.with_inner(|inner| {
            let Some((old_offset, old_header)) = inner.find_current(key)? else {
                return Err(Error::NotFound);
            };
            if old_header.user_flags.contains(Flags::WRITE_ONCE) {
                return Err(Error::WriteProtected);
            }
            inner.index.remove_offset(old_offset);
            let written = match inner.append_record_raw(
                inner.active,
                inner.free_offset,
                key,
                &[],
                old_header.user_flags,
                InternalFlags::DELETE,
            ) {
                Ok(n) => n,
                Err(Error::MediaFull) => {
                    debug!("tdbstore: area full, running GC before remove({key})");
                    inner.run_gc(false)?;
                    if let Some((dup_offset, _)) = inner.find_current(key)? {
                        inner.index.remove_offset(dup_offset);
                    }
                    inner.append_record_raw(
                        inner.active,
                        inner.free_offset,
                        key,
                        &[],
                        old_header.user_flags,
                        InternalFlags::DELETE,
                    )?
                }
                Err(e) => return Err(e),
            };
            inner.free_offset += written;
            inner.dev.sync()?;
            info!("tdbstore: removed {key}");
            Ok(())
        })
    }

    fn iterator_open(&self, prefix: Option<&str>) -> Result<IteratorHandle> {
        self.with_inner(|inner| {
            let live = inner.collect_live_records(inner.active)?;
            let mut keys: Vec<String> = live
                .into_iter()
                .map(|r| r.key)
                .filter(|k| prefix.is_none_or(|p| k.starts_with(p)))
                .collect();
            keys.sort();
            inner.open_iterators.push(keys);
            Ok(IteratorHandle(inner.open_iterators.len() - 1))
        })
    }

    fn iterator_next(&self, it: IteratorHandle, out_key: &mut [u8]) -> Result<Option<u32>> {
        self.with_inner(|inner| {
            let Some(keys) = inner.open_iterators.get_mut(it.0) else {
                return Err(Error::InvalidArgument);
            };
            let Some(key) = keys.pop() else {
                return Ok(None);
            };
            let bytes = key.as_bytes();
            if bytes.len() > out_key.len() {
                keys.push(key);
                return Err(Error::BuffTooSmall);
            }
            out_key[..bytes.len()].copy_from_slice(bytes);
            Ok(Some(bytes.len() as u32))
        })
    }

    fn iterator_close(&self, it: IteratorHandle) -> Result<()> {
        self.with_inner(|inner| {
            if it.0 >= inner.open_iterators.len() {
                return Err(Error::InvalidArgument);
            }
            inner.open_iterators[it.0].clear();
            Ok(())
        })
    }
}

impl<D: BlockDevice> Inner<D> {
    /// Public-ish helper used both by `init`'s fresh-format path and by `reset`.
    fn write_master_public(&mut self, area: usize, master: MasterRecord) -> Result<u32> {
        self.append_record_raw(
            area,
            0,
            master::MASTER_RECORD_KEY,
            &master.encode(),
            Flags::empty(),
            InternalFlags::empty(),
        )
    }
}
