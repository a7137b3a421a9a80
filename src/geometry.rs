//! Two-area layout computation (§3.1, §4.1, §9 Open Question).
//!
//! Walks the device's per-address erase sizes rather than assuming a single uniform sector
//! size, following `flash-layout`'s `Region`/`EraseBlock` walking pattern. This sidesteps the
//! monotonic-erase-size assumption the original implementation's `offset_in_erase_unit` makes:
//! each area boundary is found by actually summing erase units from the base address, not by a
//! closed-form division.

use crate::block_device::BlockDevice;
use crate::error::{Error, Result};

/// The address range and size of one of the two ping-pong areas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub base: u32,
    pub size: u32,
}

impl Area {
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.base + self.size
    }
}

/// The computed geometry for a store spanning `[base, base + total_size)` of a block device.
#[derive(Debug, Clone, Copy)]
pub struct AreaLayout {
    pub areas: [Area; 2],
}

impl AreaLayout {
    /// Computes area boundaries by walking forward from `base`, summing erase units until at
    /// least half of `total_size` has been covered; the remainder becomes area 1. Both areas
    /// always start on an erase-unit boundary, even when erase sizes vary across the range.
    pub fn compute(dev: &impl BlockDevice, base: u32, total_size: u32) -> Result<Self> {
        if total_size == 0 || base + total_size > dev.size() {
            return Err(Error::InvalidArgument);
        }
        let half = total_size / 2;
        let mut covered = 0u32;
        let mut addr = base;
        while covered < half {
            let unit = dev.erase_size(addr);
            if unit == 0 {
                return Err(Error::InvalidArgument);
            }
            covered += unit;
            addr += unit;
        }
        let area0_size = addr - base;
        let area1_size = total_size - area0_size;
        if area1_size == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(Self {
            areas: [
                Area {
                    base,
                    size: area0_size,
                },
                Area {
                    base: addr,
                    size: area1_size,
                },
            ],
        })
    }

    #[must_use]
    pub const fn other(&self, area_index: usize) -> usize {
        1 - area_index
    }
}

/// Offset of `addr` from the start of its containing erase unit.
pub fn offset_in_erase_unit(dev: &impl BlockDevice, area_base: u32, addr: u32) -> Result<u32> {
    if addr < area_base {
        return Err(Error::InvalidArgument);
    }
    let mut cur = area_base;
    while cur <= addr {
        let unit = dev.erase_size(cur);
        if unit == 0 {
            return Err(Error::InvalidArgument);
        }
        if addr < cur + unit {
            return Ok(addr - cur);
        }
        cur += unit;
    }
    Err(Error::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::RamBlockDevice;

    #[test]
    fn even_split_on_uniform_device() {
        let mut dev = RamBlockDevice::new(8192, 4096, 256);
        dev.init().unwrap();
        let layout = AreaLayout::compute(&dev, 0, 8192).unwrap();
        assert_eq!(layout.areas[0], Area { base: 0, size: 4096 });
        assert_eq!(
            layout.areas[1],
            Area {
                base: 4096,
                size: 4096
            }
        );
    }
}
