//! Traits implemented by emulated PCI devices.

use std::fmt::Debug;

use crate::device::bus::Request;

use super::config_space::BarInfo;

/// An emulated PCI device.
///
/// The transport (the VMM side of the world) routes configuration space
/// accesses and BAR accesses here.
pub trait PciDevice: Debug + Send + Sync {
    fn write_cfg(&self, req: Request, value: u64);
    fn read_cfg(&self, req: Request) -> u64;

    /// Access to a memory or I/O region claimed by a BAR.
    fn write_io(&self, region: u32, req: Request, value: u64);
    fn read_io(&self, region: u32, req: Request) -> u64;

    /// Describe the given BAR, if the device implements it.
    fn bar(&self, bar_no: u8) -> Option<BarInfo>;
}
