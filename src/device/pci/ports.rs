//! The native-port table and the virtual-port allocator.
//!
//! Host devices are identified by their physical topology path. The table
//! records which paths were handed to this controller instance (ASSIGNED),
//! which of them currently have a device present (CONNECTED), and which
//! the guest has started driving (EMULATED). Virtual ports are allocated
//! out of two disjoint halves: USB3 ports first, USB2 ports second.

use std::fmt;

use tracing::{debug, warn};

use super::backend::Speed;
use super::constants::xhci::{MAX_NATIVE_PORTS, MAX_PORTS, USB2_PORT_START, USB3_PORT_START};

/// Maximum topology depth of a device path (root port plus hub tiers).
pub const MAX_TIERS: usize = 7;

/// Physical location of a device on the host: bus number plus the port
/// numbers along the hub chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevicePath {
    pub bus: u8,
    depth: u8,
    path: [u8; MAX_TIERS],
}

impl DevicePath {
    #[must_use]
    pub fn new(bus: u8, ports: &[u8]) -> Self {
        assert!(ports.len() <= MAX_TIERS, "device path too deep");
        let mut path = [0; MAX_TIERS];
        path[..ports.len()].copy_from_slice(ports);
        Self {
            bus,
            depth: ports.len() as u8,
            path,
        }
    }

    /// The path of a child port hanging off this (hub) path.
    #[must_use]
    pub fn child(&self, port: u8) -> Self {
        let mut path = self.path;
        let depth = self.depth as usize;
        assert!(depth < MAX_TIERS, "hub chain too deep");
        path[depth] = port;
        Self {
            bus: self.bus,
            depth: self.depth + 1,
            path,
        }
    }

    /// The root-hub port this path enters through.
    #[must_use]
    pub fn root_port(&self) -> u8 {
        self.path[0]
    }
}

impl fmt::Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.path[0])?;
        for tier in &self.path[1..self.depth as usize] {
            write!(f, ".{tier}")?;
        }
        Ok(())
    }
}

/// What kind of native device sits at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeDeviceType {
    Device,
    /// An external hub with the given number of downstream ports.
    Hub { num_ports: u8 },
}

/// Identity of a host device as reported by the discovery layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: DevicePath,
    pub vendor_id: u16,
    pub product_id: u16,
    /// BCD USB version; below 0x300 the device lands on a USB2 port.
    pub bcd_usb: u16,
    pub speed: Speed,
    pub device_type: NativeDeviceType,
}

impl DeviceInfo {
    #[must_use]
    pub const fn is_usb2(&self) -> bool {
        self.bcd_usb < 0x300
    }
}

/// Mapping state of one native port entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    Free,
    /// Declared on the command line (or synthesized for a hub child), but
    /// no device seen yet.
    Assigned,
    /// The host reported a device on the path.
    Connected,
    /// The guest issued Address Device for it.
    Emulated,
}

/// One entry of the native-port table.
#[derive(Debug, Clone, Copy)]
pub struct NativePortSlot {
    pub info: Option<DeviceInfo>,
    /// Path key; valid whenever `state != Free`.
    pub path: DevicePath,
    /// Assigned virtual port, 0 when none.
    pub vport: u8,
    pub state: PortState,
}

impl NativePortSlot {
    const fn empty() -> Self {
        Self {
            info: None,
            path: DevicePath {
                bus: 0,
                depth: 0,
                path: [0; MAX_TIERS],
            },
            vport: 0,
            state: PortState::Free,
        }
    }
}

/// Records the command-line assigned native root-hub ports and their
/// external-hub child ports.
#[derive(Debug)]
pub struct NativePortTable {
    slots: [NativePortSlot; MAX_NATIVE_PORTS],
}

impl NativePortTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: [NativePortSlot::empty(); MAX_NATIVE_PORTS],
        }
    }

    /// Record a path as assigned to this controller instance.
    pub fn set_assigned(&mut self, path: DevicePath) -> Option<usize> {
        let index = self.slots.iter().position(|s| s.state == PortState::Free)?;
        self.slots[index] = NativePortSlot {
            info: None,
            path,
            vport: 0,
            state: PortState::Assigned,
        };
        debug!("assigned native port {path} at index {index}");
        Some(index)
    }

    pub fn clear_assigned(&mut self, path: &DevicePath) {
        if let Some(index) = self.index_by_path(path) {
            self.slots[index] = NativePortSlot::empty();
        }
    }

    #[must_use]
    pub fn index_by_path(&self, path: &DevicePath) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state != PortState::Free && s.path == *path)
    }

    #[must_use]
    pub fn index_by_vport(&self, vport: u8) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state != PortState::Free && s.vport == vport && vport != 0)
    }

    #[must_use]
    pub fn slot(&self, index: usize) -> &NativePortSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut NativePortSlot {
        &mut self.slots[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &NativePortSlot> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NativePortSlot> {
        self.slots.iter_mut()
    }

    /// Pick a free virtual port for a device.
    ///
    /// USB2 devices draw from the USB2 half of the port range, USB3
    /// devices from the USB3 half. Ports already mapped in the table and
    /// ports reserved by in-flight suspend bookkeeping are skipped.
    #[must_use]
    pub fn free_vport(&self, info: &DeviceInfo, reserved: impl Fn(u8) -> bool) -> Option<u8> {
        let start = if info.is_usb2() {
            USB2_PORT_START
        } else {
            USB3_PORT_START
        };
        let half = MAX_PORTS as usize / 2;
        (start..start + half)
            .map(|p| p as u8)
            .find(|&p| self.index_by_vport(p).is_none() && !reserved(p))
    }

    /// Register every child port of an external hub as assigned.
    pub fn assign_hub_ports(&mut self, info: &DeviceInfo) -> Option<()> {
        let NativeDeviceType::Hub { num_ports } = info.device_type else {
            return None;
        };
        let index = self.index_by_path(&info.path)?;
        self.slots[index].info = Some(*info);

        debug!("found USB hub {} with {} port(s)", info.path, num_ports);
        for child in 1..=num_ports {
            let path = info.path.child(child);
            if self.set_assigned(path).is_none() {
                warn!("too many USB devices, cannot assign {path}");
                return None;
            }
        }
        Some(())
    }

    /// Drop the assignments created for an external hub's child ports.
    pub fn unassign_hub_ports(&mut self, info: &DeviceInfo) -> Option<()> {
        let index = self.index_by_path(&info.path)?;
        let old = self.slots[index].info?;
        let NativeDeviceType::Hub { num_ports } = old.device_type else {
            return None;
        };
        debug!("disconnect USB hub {} with {} port(s)", old.path, num_ports);
        for child in 1..=num_ports {
            self.clear_assigned(&old.path.child(child));
        }
        Some(())
    }
}

impl Default for NativePortTable {
    fn default() -> Self {
        Self::new()
    }
}
