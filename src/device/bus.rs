//! Abstraction for devices that live on a memory bus.
//!
//! The xHCI controller performs DMA on guest memory: every guest-resident
//! structure (DCBAA, device contexts, rings, data buffers) is read and
//! written through a [`BusDevice`]. Accesses are never cached across
//! operations; each structural field access re-resolves through the bus.

use std::fmt::Debug;
use std::sync::Arc;

use arc_swap::ArcSwap;
use memmap2::MmapMut;
use thiserror::Error;
use tracing::warn;

/// Upper bound for a single bulk access window.
///
/// Large guest structures (rings can span 64k) are accessed in chunks of at
/// most one page so a single resolve never crosses more guest memory than
/// the mapping layer can hand out at once.
pub const ACCESS_WINDOW: usize = 4096;

/// The width of a single register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestSize {
    Size1 = 1,
    Size2 = 2,
    Size4 = 4,
    Size8 = 8,
}

impl RequestSize {
    /// Mask a value to the bits covered by this access size.
    #[must_use]
    pub const fn mask(self, value: u64) -> u64 {
        match self {
            Self::Size1 => value & 0xFF,
            Self::Size2 => value & 0xFFFF,
            Self::Size4 => value & 0xFFFF_FFFF,
            Self::Size8 => value,
        }
    }
}

/// A single read or write request on the bus.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub addr: u64,
    pub size: RequestSize,
}

impl Request {
    #[must_use]
    pub const fn new(addr: u64, size: RequestSize) -> Self {
        Self { addr, size }
    }
}

/// A device attached to a memory bus.
///
/// Beyond the sized register accessors, implementations provide bulk
/// accessors used for DMA. Callers must keep individual bulk accesses at or
/// below [`ACCESS_WINDOW`] bytes; the copy helpers below take care of
/// splitting larger transfers.
pub trait BusDevice: Debug + Send + Sync {
    /// Size of the address window this device claims.
    fn size(&self) -> u64;

    fn read(&self, req: Request) -> u64 {
        let mut buf = [0u8; 8];
        let len = req.size as usize;
        self.read_bulk(req.addr, &mut buf[..len]);
        u64::from_le_bytes(buf)
    }

    fn write(&self, req: Request, value: u64) {
        let len = req.size as usize;
        self.write_bulk(req.addr, &value.to_le_bytes()[..len]);
    }

    fn read_bulk(&self, offset: u64, data: &mut [u8]);
    fn write_bulk(&self, offset: u64, data: &[u8]);
}

/// Shared reference to a bus device.
pub type BusDeviceRef = Arc<dyn BusDevice>;

/// Convenience accessors for guest-resident little-endian fields.
///
/// These always issue fresh bulk accesses; nothing is cached.
pub trait GuestAccess {
    fn read_u32(&self, addr: u64) -> u32;
    fn write_u32(&self, addr: u64, value: u32);
    fn read_u64(&self, addr: u64) -> u64;
    fn write_u64(&self, addr: u64, value: u64);
}

impl<T: BusDevice + ?Sized> GuestAccess for T {
    fn read_u32(&self, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_bulk(addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u32(&self, addr: u64, value: u32) {
        self.write_bulk(addr, &value.to_le_bytes());
    }

    fn read_u64(&self, addr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_bulk(addr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&self, addr: u64, value: u64) {
        self.write_bulk(addr, &value.to_le_bytes());
    }
}

/// Copy from guest memory into `data`, splitting into [`ACCESS_WINDOW`]
/// chunks.
pub fn copy_from_guest(bus: &dyn BusDevice, mut addr: u64, data: &mut [u8]) {
    for chunk in data.chunks_mut(ACCESS_WINDOW) {
        bus.read_bulk(addr, chunk);
        addr += chunk.len() as u64;
    }
}

/// Copy `data` into guest memory, splitting into [`ACCESS_WINDOW`] chunks.
pub fn copy_to_guest(bus: &dyn BusDevice, mut addr: u64, data: &[u8]) {
    for chunk in data.chunks(ACCESS_WINDOW) {
        bus.write_bulk(addr, chunk);
        addr += chunk.len() as u64;
    }
}

/// A bus whose backing memory can be installed or replaced at runtime.
///
/// The controller is constructed before the VMM hands us guest memory, so
/// the DMA bus reference it holds must be indirected. Accesses before a
/// backing device is installed read as zero and are logged.
#[derive(Debug)]
pub struct DynamicBus {
    inner: ArcSwap<Option<BusDeviceRef>>,
}

impl DynamicBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(None),
        }
    }

    /// Install or replace the backing device.
    pub fn set_backing(&self, device: BusDeviceRef) {
        self.inner.store(Arc::new(Some(device)));
    }
}

impl Default for DynamicBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusDevice for DynamicBus {
    fn size(&self) -> u64 {
        self.inner.load().as_ref().as_ref().map_or(0, |dev| dev.size())
    }

    fn read_bulk(&self, offset: u64, data: &mut [u8]) {
        match self.inner.load().as_ref() {
            Some(dev) => dev.read_bulk(offset, data),
            None => {
                warn!("DMA read at {offset:#x} before guest memory was installed");
                data.fill(0);
            }
        }
    }

    fn write_bulk(&self, offset: u64, data: &[u8]) {
        match self.inner.load().as_ref() {
            Some(dev) => dev.write_bulk(offset, data),
            None => warn!(
                "DMA write of {} bytes at {offset:#x} before guest memory was installed",
                data.len()
            ),
        }
    }
}

#[derive(Error, Debug)]
pub enum MemorySegmentError {
    #[error("failed to map memory backing")]
    Map(#[from] std::io::Error),
}

/// A region of guest memory backed by a memory mapping.
pub struct MemorySegment {
    map: MmapMut,
}

impl MemorySegment {
    /// Map `size` bytes of anonymous memory.
    pub fn new_anonymous(size: usize) -> Result<Self, MemorySegmentError> {
        Ok(Self {
            map: MmapMut::map_anon(size)?,
        })
    }

    /// Map the given file as guest memory.
    pub fn from_file(file: &std::fs::File) -> Result<Self, MemorySegmentError> {
        // SAFETY: the caller hands us the canonical guest memory backing
        // file; the VMM side coordinates concurrent access.
        let map = unsafe { MmapMut::map_mut(file)? };
        Ok(Self { map })
    }

    fn checked_range(&self, offset: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.map.len()).then_some(start..end)
    }
}

impl Debug for MemorySegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySegment")
            .field("len", &self.map.len())
            .finish()
    }
}

impl BusDevice for MemorySegment {
    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_bulk(&self, offset: u64, data: &mut [u8]) {
        match self.checked_range(offset, data.len()) {
            Some(range) => data.copy_from_slice(&self.map[range]),
            None => {
                warn!("out-of-range guest read at {offset:#x}");
                data.fill(0);
            }
        }
    }

    fn write_bulk(&self, offset: u64, data: &[u8]) {
        match self.checked_range(offset, data.len()) {
            Some(range) => {
                // SAFETY: MmapMut hands out exclusive mutable access only
                // through &mut self; we go through a raw pointer because the
                // bus trait is &self and guest memory is inherently shared
                // with the guest anyway.
                unsafe {
                    let dst = self.map.as_ptr().cast_mut().add(range.start);
                    std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
                }
            }
            None => warn!("out-of-range guest write at {offset:#x}"),
        }
    }
}

pub mod testutils {
    //! An in-memory bus device for unit tests.

    use std::sync::Mutex;

    use super::{BusDevice, Request};

    #[derive(Debug)]
    pub struct TestBusDevice {
        data: Mutex<Vec<u8>>,
    }

    impl TestBusDevice {
        #[must_use]
        pub fn new(data: &[u8]) -> Self {
            Self {
                data: Mutex::new(data.to_vec()),
            }
        }

        #[must_use]
        pub fn zeroed(size: usize) -> Self {
            Self {
                data: Mutex::new(vec![0; size]),
            }
        }
    }

    impl BusDevice for TestBusDevice {
        fn size(&self) -> u64 {
            self.data.lock().unwrap().len() as u64
        }

        fn read(&self, req: Request) -> u64 {
            let mut buf = [0u8; 8];
            let len = req.size as usize;
            self.read_bulk(req.addr, &mut buf[..len]);
            u64::from_le_bytes(buf)
        }

        fn read_bulk(&self, offset: u64, data: &mut [u8]) {
            let offset: usize = offset.try_into().unwrap();
            data.copy_from_slice(&self.data.lock().unwrap()[offset..(offset + data.len())]);
        }

        fn write_bulk(&self, offset: u64, data: &[u8]) {
            let offset: usize = offset.try_into().unwrap();
            self.data.lock().unwrap()[offset..(offset + data.len())].copy_from_slice(data);
        }
    }
}
