//! Block-device abstraction (§4.1) and the in-memory test double used throughout the test suite.
//!
//! Generalizes the teacher's `blocking_read`/`blocking_write`/`blocking_erase` calls over a
//! concrete `embassy_rp::flash::Flash` peripheral (see `flash.rs`/`flash_block.rs`) into a plain
//! trait so the stores can run against any backing media, including host-side RAM for tests.

use crate::error::{Error, Result};

/// A raw, byte-addressable flash-like block device.
///
/// Implementors need not guarantee uniform erase-unit size across the address space; callers
/// must query [`BlockDevice::erase_size`] per address rather than assume a single sector size.
pub trait BlockDevice {
    /// Initializes the underlying media. Must be idempotent.
    fn init(&mut self) -> Result<()>;

    /// Releases any resources acquired by `init`.
    fn deinit(&mut self) -> Result<()>;

    /// Reads `buf.len()` bytes starting at `addr`.
    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()>;

    /// Programs `buf` at `addr`. `buf.len()` must be a multiple of [`BlockDevice::program_size`].
    fn program(&mut self, addr: u32, buf: &[u8]) -> Result<()>;

    /// Erases the erase unit(s) covering `[addr, addr + len)`.
    fn erase(&mut self, addr: u32, len: u32) -> Result<()>;

    /// Flushes any buffered state to media.
    fn sync(&mut self) -> Result<()>;

    /// Total addressable size in bytes.
    fn size(&self) -> u32;

    /// Smallest erasable unit covering `addr`.
    fn erase_size(&self, addr: u32) -> u32;

    /// Smallest programmable unit, uniform across the device.
    fn program_size(&self) -> u32;

    /// The byte value an erase leaves behind (commonly `0xFF`), or `None` for devices that do
    /// not expose a stable erase value and must be wrapped in a simulator (§9 non-flash block
    /// devices).
    fn erase_value(&self) -> Option<u8>;
}

/// Buffers sub-page programs so callers can patch a single field (e.g. a record's trailing CRC)
/// without re-supplying a whole page, coalescing writes up to `program_size()`.
///
/// Mirrors the role the teacher's fixed-size `buffer` arrays play in `flash.rs::save`, generalized
/// into an adapter usable by any `BlockDevice` whose program granularity exceeds a record header.
pub struct PagedBlockDevice<D: BlockDevice> {
    inner: D,
    page: Vec<u8>,
    page_addr: Option<u32>,
    dirty: bool,
}

impl<D: BlockDevice> PagedBlockDevice<D> {
    pub fn new(inner: D) -> Self {
        let page_size = inner.program_size() as usize;
        Self {
            inner,
            page: vec![0u8; page_size],
            page_addr: None,
            dirty: false,
        }
    }

    fn page_size(&self) -> u32 {
        self.page.len() as u32
    }

    fn load_page(&mut self, page_addr: u32) -> Result<()> {
        if self.page_addr == Some(page_addr) {
            return Ok(());
        }
        self.flush()?;
        self.inner.read(page_addr, &mut self.page)?;
        self.page_addr = Some(page_addr);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            if let Some(addr) = self.page_addr {
                self.inner.program(addr, &self.page)?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    /// Patches `data` at `addr` without requiring `addr`/`data.len()` to be page-aligned.
    pub fn patch(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        let page_size = self.page_size();
        let mut remaining = data;
        let mut cur = addr;
        while !remaining.is_empty() {
            let page_addr = cur - (cur % page_size);
            self.load_page(page_addr)?;
            let offset = (cur - page_addr) as usize;
            let n = remaining.len().min(self.page.len() - offset);
            self.page[offset..offset + n].copy_from_slice(&remaining[..n]);
            self.dirty = true;
            remaining = &remaining[n..];
            cur += n as u32;
        }
        Ok(())
    }
}

impl<D: BlockDevice> BlockDevice for PagedBlockDevice<D> {
    fn init(&mut self) -> Result<()> {
        self.inner.init()
    }

    fn deinit(&mut self) -> Result<()> {
        self.flush()?;
        self.inner.deinit()
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.flush()?;
        self.inner.read(addr, buf)
    }

    fn program(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        self.patch(addr, buf)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        self.flush()?;
        self.page_addr = None;
        self.inner.erase(addr, len)
    }

    fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.inner.sync()
    }

    fn size(&self) -> u32 {
        self.inner.size()
    }

    fn erase_size(&self, addr: u32) -> u32 {
        self.inner.erase_size(addr)
    }

    fn program_size(&self) -> u32 {
        self.inner.program_size()
    }

    fn erase_value(&self) -> Option<u8> {
        self.inner.erase_value()
    }
}

/// In-memory [`BlockDevice`] test double (§9A.4). Plays the role the teacher's `host` feature
/// played for board-independent testing: it is the device every store in this crate is actually
/// validated against, since no physical flash part is available in this environment.
#[cfg(any(test, feature = "testing"))]
pub struct RamBlockDevice {
    data: Vec<u8>,
    erase_unit: u32,
    program_unit: u32,
    erase_value: u8,
    initialized: bool,
}

#[cfg(any(test, feature = "testing"))]
impl RamBlockDevice {
    #[must_use]
    pub fn new(size: u32, erase_unit: u32, program_unit: u32) -> Self {
        assert!(size % erase_unit == 0, "size must be erase-unit aligned");
        Self {
            data: vec![0xFFu8; size as usize],
            erase_unit,
            program_unit,
            erase_value: 0xFF,
            initialized: false,
        }
    }

    /// Corrupts a single byte, for crash/tamper-injection tests (§8).
    pub fn corrupt_byte(&mut self, addr: u32, value: u8) {
        self.data[addr as usize] = value;
    }

    /// Truncates the device's effective write history at `addr`, simulating a power loss mid
    /// program by reverting everything from `addr` onward to the erase value.
    pub fn simulate_power_loss_after(&mut self, addr: u32) {
        for byte in &mut self.data[addr as usize..] {
            *byte = self.erase_value;
        }
    }
}

#[cfg(any(test, feature = "testing"))]
impl BlockDevice for RamBlockDevice {
    fn init(&mut self) -> Result<()> {
        self.initialized = true;
        Ok(())
    }

    fn deinit(&mut self) -> Result<()> {
        self.initialized = false;
        Ok(())
    }

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotReady);
        }
        let start = addr as usize;
        let end = start + buf.len();
        let Some(src) = self.data.get(start..end) else {
            return Err(Error::ReadError);
        };
        buf.copy_from_slice(src);
        Ok(())
    }

    fn program(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotReady);
        }
        if buf.len() as u32 % self.program_unit != 0 {
            return Err(Error::InvalidArgument);
        }
        let start = addr as usize;
        let end = start + buf.len();
        let Some(dst) = self.data.get_mut(start..end) else {
            return Err(Error::WriteError);
        };
        // A real NOR part can only clear bits, never set them, on program; emulate that so
        // tests catch accidental re-programs of already-written regions.
        for (d, s) in dst.iter_mut().zip(buf) {
            *d &= *s;
        }
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<()> {
        if !self.initialized {
            return Err(Error::NotReady);
        }
        let start = addr as usize;
        let end = start + len as usize;
        let Some(region) = self.data.get_mut(start..end) else {
            return Err(Error::WriteError);
        };
        region.fill(self.erase_value);
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn erase_size(&self, _addr: u32) -> u32 {
        self.erase_unit
    }

    fn program_size(&self) -> u32 {
        self.program_unit
    }

    fn erase_value(&self) -> Option<u8> {
        Some(self.erase_value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paged_patch_preserves_neighbors() {
        let mut dev = RamBlockDevice::new(4096, 4096, 256);
        dev.init().unwrap();
        let mut paged = PagedBlockDevice::new(dev);
        paged.program(0, &[0u8; 256]).unwrap();
        paged.patch(4, &[0xAA, 0xBB]).unwrap();
        paged.sync().unwrap();
        let mut out = [0xFFu8; 256];
        paged.read(0, &mut out).unwrap();
        assert_eq!(out[4], 0xAA);
        assert_eq!(out[5], 0xBB);
        assert_eq!(out[0], 0x00);
    }

    #[test]
    fn ram_device_blocks_before_init() {
        let mut dev = RamBlockDevice::new(4096, 4096, 256);
        assert!(matches!(dev.read(0, &mut [0u8; 1]), Err(Error::NotReady)));
    }

    #[test]
    fn power_loss_reverts_tail_to_erase_value() {
        let mut dev = RamBlockDevice::new(4096, 4096, 1);
        dev.init().unwrap();
        dev.program(0, &[0x11, 0x22, 0x33, 0x44]).unwrap();
        dev.simulate_power_loss_after(2);
        let mut out = [0u8; 4];
        dev.read(0, &mut out).unwrap();
        assert_eq!(out, [0x11, 0x22, 0xFF, 0xFF]);
    }

    #[test]
    fn corrupt_byte_flips_exactly_one_byte() {
        let mut dev = RamBlockDevice::new(4096, 4096, 1);
        dev.init().unwrap();
        dev.program(0, &[0xAA, 0xAA]).unwrap();
        dev.corrupt_byte(1, 0x00);
        let mut out = [0u8; 2];
        dev.read(0, &mut out).unwrap();
        assert_eq!(out, [0xAA, 0x00]);
    }

    #[test]
    fn program_can_only_clear_bits_not_set_them() {
        let mut dev = RamBlockDevice::new(4096, 4096, 1);
        dev.init().unwrap();
        dev.program(0, &[0x0F]).unwrap();
        // Re-programming with a value that would need to set already-cleared bits back to 1
        // must not actually set them, matching real NOR flash program semantics.
        dev.program(0, &[0xF0]).unwrap();
        let mut out = [0u8; 1];
        dev.read(0, &mut out).unwrap();
        assert_eq!(out[0], 0x00);
    }
}
