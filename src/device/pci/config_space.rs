//! Emulation of the PCI Configuration Space.
//!
//! Only the pieces the xHCI model needs: the standard header with memory
//! BARs (including the BAR sizing protocol), the class triple, the USB
//! revision byte, and a single-vector MSI capability.

use tracing::{debug, warn};

use crate::device::bus::Request;

const CONFIG_SPACE_SIZE: usize = 0x100;

const OFFSET_VENDOR: usize = 0x00;
const OFFSET_DEVICE: usize = 0x02;
const OFFSET_COMMAND: usize = 0x04;
const OFFSET_STATUS: usize = 0x06;
const OFFSET_CLASS: usize = 0x08;
const OFFSET_HEADER_TYPE: usize = 0x0E;
const OFFSET_BAR0: usize = 0x10;
const OFFSET_CAP_PTR: usize = 0x34;
const OFFSET_INTR_PIN: usize = 0x3D;

const STATUS_CAP_LIST: u16 = 1 << 4;

const BAR_COUNT: usize = 6;

/// Location and size of a BAR region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarInfo {
    pub addr: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Bar {
    size: u64,
}

/// The 256-byte configuration space of a device.
#[derive(Debug)]
pub struct ConfigSpace {
    data: [u8; CONFIG_SPACE_SIZE],
    bars: [Option<Bar>; BAR_COUNT],
}

impl ConfigSpace {
    fn read_bytes(&self, offset: usize, len: usize) -> u64 {
        let mut value = 0u64;
        for i in (0..len).rev() {
            value <<= 8;
            value |= u64::from(*self.data.get(offset + i).unwrap_or(&0));
        }
        value
    }

    fn write_bytes(&mut self, offset: usize, len: usize, value: u64) {
        for i in 0..len {
            if let Some(byte) = self.data.get_mut(offset + i) {
                *byte = (value >> (8 * i)) as u8;
            }
        }
    }

    pub fn read(&self, req: Request) -> u64 {
        let value = self.read_bytes(req.addr as usize, req.size as usize);
        debug!("config space read {:#x} -> {:#x}", req.addr, value);
        value
    }

    pub fn write(&mut self, req: Request, value: u64) {
        let offset = req.addr as usize;
        let len = req.size as usize;

        // Writes into the BAR area follow the sizing protocol: writing
        // all-ones yields the (negated) size mask on the next read.
        if (OFFSET_BAR0..OFFSET_BAR0 + 4 * BAR_COUNT).contains(&offset) && len == 4 {
            let bar_no = (offset - OFFSET_BAR0) / 4;
            if let Some(bar) = self.bars[bar_no] {
                let value = value as u32;
                let new = if value == u32::MAX {
                    !(bar.size as u32 - 1)
                } else {
                    value & !(bar.size as u32 - 1)
                };
                self.write_bytes(offset, 4, u64::from(new));
                return;
            }
        }

        match offset {
            OFFSET_COMMAND => self.write_bytes(offset, len.min(2), value),
            OFFSET_VENDOR | OFFSET_DEVICE | OFFSET_CLASS | OFFSET_STATUS => {
                warn!("ignoring write to read-only config field {offset:#x}");
            }
            _ => self.write_bytes(offset, len, value),
        }
    }

    /// Describe the given BAR.
    #[must_use]
    pub fn bar(&self, bar_no: u8) -> Option<BarInfo> {
        let bar = self.bars.get(bar_no as usize).copied().flatten()?;
        let addr = u64::from(self.read_bytes(OFFSET_BAR0 + 4 * bar_no as usize, 4) as u32)
            & !(bar.size - 1);
        Some(BarInfo {
            addr,
            size: bar.size,
        })
    }
}

/// Builder for [`ConfigSpace`].
#[derive(Debug)]
pub struct ConfigSpaceBuilder {
    space: ConfigSpace,
    next_cap: usize,
}

impl ConfigSpaceBuilder {
    #[must_use]
    pub fn new(vendor: u16, device: u16) -> Self {
        let mut space = ConfigSpace {
            data: [0; CONFIG_SPACE_SIZE],
            bars: [None; BAR_COUNT],
        };
        space.write_bytes(OFFSET_VENDOR, 2, u64::from(vendor));
        space.write_bytes(OFFSET_DEVICE, 2, u64::from(device));
        space.data[OFFSET_HEADER_TYPE] = 0x00;
        space.data[OFFSET_INTR_PIN] = 0x01; /* INTA# */
        Self {
            space,
            next_cap: 0x40,
        }
    }

    #[must_use]
    pub fn class(mut self, class: u8, subclass: u8, progif: u8) -> Self {
        self.space.data[OFFSET_CLASS] = 0; /* revision */
        self.space.data[OFFSET_CLASS + 1] = progif;
        self.space.data[OFFSET_CLASS + 2] = subclass;
        self.space.data[OFFSET_CLASS + 3] = class;
        self
    }

    /// Set an arbitrary read-only byte, e.g. the USB revision register.
    #[must_use]
    pub fn readonly_byte(mut self, offset: usize, value: u8) -> Self {
        self.space.data[offset] = value;
        self
    }

    /// Claim a 32-bit non-prefetchable memory BAR of `size` bytes.
    ///
    /// `size` must be a power of two.
    #[must_use]
    pub fn mem32_nonprefetchable_bar(mut self, bar_no: usize, size: u64) -> Self {
        assert!(size.is_power_of_two(), "BAR size must be a power of two");
        self.space.bars[bar_no] = Some(Bar { size });
        self.space.write_bytes(OFFSET_BAR0 + 4 * bar_no, 4, 0);
        self
    }

    /// Append a single-vector MSI capability.
    #[must_use]
    pub fn msi_capability(mut self) -> Self {
        let cap = self.next_cap;
        self.next_cap += 0x10;

        // Chain into the capability list.
        let prev = self.space.data[OFFSET_CAP_PTR] as usize;
        self.space.data[OFFSET_CAP_PTR] = cap as u8;
        self.space.data[cap] = 0x05; /* MSI capability id */
        self.space.data[cap + 1] = prev as u8;
        // Message control: 64-bit capable, one vector.
        self.space.write_bytes(cap + 2, 2, 0x0080);

        let status = self.space.read_bytes(OFFSET_STATUS, 2) as u16 | STATUS_CAP_LIST;
        self.space.write_bytes(OFFSET_STATUS, 2, u64::from(status));
        self
    }

    #[must_use]
    pub fn config_space(self) -> ConfigSpace {
        self.space
    }
}
