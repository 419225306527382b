//! Extended capability registers.
//!
//! The capability array is a list of non-overlapping MMIO windows, each
//! backed by a byte buffer. The default layout exposes the USB2 and USB3
//! Supported Protocol capabilities; the Apollo Lake layout additionally
//! exposes the vendor Dual-Role-Device capability whose config register
//! drives the host's role switch.

use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use super::constants::xhci::{offset::EXCAP_BASE, MAX_PORTS, USB2_PORT_START, USB3_PORT_START};

/// Capability ids.
const CAP_ID_SUPPORTED_PROTOCOL: u8 = 0x02;
const CAP_ID_VENDOR_DRD: u8 = 0xC0;

/// DRD register block layout within its window.
const DRDCFG0_OFFSET: u64 = 104;
const DRDCFG1_OFFSET: u64 = 108;

/// DRDCFG0: software controls the ID pin.
pub const DRDCFG0_IDPIN_EN: u64 = 1 << 21;
/// DRDCFG0: ID pin value; zero selects host mode.
pub const DRDCFG0_IDPIN: u64 = 1 << 20;
/// DRDCFG1: controller currently in host mode.
pub const DRDCFG1_HOST_MODE: u64 = 1 << 24;

/// Where the host exposes the role switch.
pub const DRD_SWITCH_PATH: &str = "/sys/class/usb_role/intel_xhci_usb_sw/role";

const DRD_HOST_MODE: &str = "host";
const DRD_DEVICE_MODE: &str = "device";

#[derive(Error, Debug)]
pub enum ExcapError {
    #[error("no writable extended capability at offset {0:#x}")]
    NotWritable(u64),
    #[error("failed to drive the host role switch")]
    Switch(#[from] std::io::Error),
}

/// One `[start, end)` window backed by a byte buffer.
#[derive(Debug)]
struct ExcapWindow {
    start: u64,
    end: u64,
    data: Vec<u8>,
}

impl ExcapWindow {
    fn contains(&self, offset: u64) -> bool {
        (self.start..self.end).contains(&offset)
    }

    fn read_dword(&self, offset: u64) -> u32 {
        let rel = ((offset - self.start) & !0x3) as usize;
        let mut bytes = [0u8; 4];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = *self.data.get(rel + i).unwrap_or(&0);
        }
        u32::from_le_bytes(bytes)
    }

    fn write_dword(&mut self, offset: u64, value: u32) {
        let rel = ((offset - self.start) & !0x3) as usize;
        self.data[rel..rel + 4].copy_from_slice(&value.to_le_bytes());
    }
}

/// A USB2/USB3 Supported Protocol capability record.
///
/// The resulting header dwords match the native layout, e.g.
/// `0x02000802` for USB 2.0 and `0x03001402` for USB 3.0.
fn protocol_capability(
    next_pointer: u8,
    major_revision: u8,
    port_offset: u8,
    port_count: u8,
) -> Vec<u8> {
    let mut data = vec![0u8; 16];
    data[0] = CAP_ID_SUPPORTED_PROTOCOL;
    data[1] = next_pointer;
    data[2] = 0; /* minor revision */
    data[3] = major_revision;
    data[4..8].copy_from_slice(b"USB ");
    data[8] = port_offset;
    data[9] = port_count;
    data
}

fn drd_capability() -> Vec<u8> {
    let mut data = vec![0u8; 0x70];
    data[0] = CAP_ID_VENDOR_DRD;
    data[1] = 0; /* end of capability list */
    data
}

/// The extended capability array of the controller.
#[derive(Debug)]
pub struct ExtendedCapabilities {
    windows: Vec<ExcapWindow>,
    /// Index of the DRD window, when the layout has one.
    drd: Option<usize>,
    drd_switch_path: PathBuf,
}

impl ExtendedCapabilities {
    /// The default layout: two Supported Protocol capabilities.
    #[must_use]
    pub fn new_default() -> Self {
        let half = MAX_PORTS as u8 / 2;
        Self {
            windows: vec![
                ExcapWindow {
                    start: EXCAP_BASE,
                    end: EXCAP_BASE + 0x10,
                    data: protocol_capability(0x08, 2, USB2_PORT_START as u8, half),
                },
                ExcapWindow {
                    start: EXCAP_BASE + 0x20,
                    end: EXCAP_BASE + 0x30,
                    data: protocol_capability(0x14, 3, USB3_PORT_START as u8, half),
                },
            ],
            drd: None,
            drd_switch_path: PathBuf::from(DRD_SWITCH_PATH),
        }
    }

    /// The Apollo Lake layout: protocol capabilities plus the DRD block.
    #[must_use]
    pub fn new_apl() -> Self {
        let mut caps = Self::new_default();
        caps.windows.push(ExcapWindow {
            start: EXCAP_BASE + 0x70,
            end: EXCAP_BASE + 0xE0,
            data: drd_capability(),
        });
        caps.drd = Some(caps.windows.len() - 1);
        caps
    }

    /// Override where role-switch writes go. Used by tests.
    pub fn set_drd_switch_path(&mut self, path: impl AsRef<Path>) {
        self.drd_switch_path = path.as_ref().to_path_buf();
    }

    /// First register offset covered by the capability array.
    #[must_use]
    pub fn excap_offset(&self) -> u64 {
        self.windows.first().map_or(EXCAP_BASE, |w| w.start)
    }

    /// One past the last register offset covered by the array.
    #[must_use]
    pub fn registers_end(&self) -> u64 {
        self.windows.last().map_or(EXCAP_BASE, |w| w.end)
    }

    #[must_use]
    pub fn has_drd(&self) -> bool {
        self.drd.is_some()
    }

    /// Serve a read anywhere in the capability region.
    #[must_use]
    pub fn read(&self, offset: u64) -> u64 {
        match self.windows.iter().find(|w| w.contains(offset)) {
            Some(window) => u64::from(window.read_dword(offset)),
            None => {
                warn!("extended capability {offset:#x} can't be found");
                0
            }
        }
    }

    /// Dispatch a write; the only writable register is DRDCFG0.
    pub fn write(&mut self, offset: u64, value: u64) -> Result<(), ExcapError> {
        let Some(drd) = self.drd else {
            return Err(ExcapError::NotWritable(offset));
        };
        let window = &mut self.windows[drd];
        if !window.contains(offset) || offset - window.start != DRDCFG0_OFFSET {
            return Err(ExcapError::NotWritable(offset));
        }

        let value = value & 0xFFFF_FFFF;
        if u64::from(window.read_dword(offset)) == value {
            let host = u64::from(window.read_dword(window.start + DRDCFG1_OFFSET))
                & DRDCFG1_HOST_MODE
                != 0;
            debug!(
                "no mode switch action, current drd: {} mode",
                if host { DRD_HOST_MODE } else { DRD_DEVICE_MODE }
            );
            return Ok(());
        }

        window.write_dword(offset, value as u32);

        if value & DRDCFG0_IDPIN_EN == 0 {
            return Ok(());
        }

        let (mode, drdcfg1) = if value & DRDCFG0_IDPIN == 0 {
            (DRD_HOST_MODE, DRDCFG1_HOST_MODE)
        } else {
            (DRD_DEVICE_MODE, 0)
        };

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.drd_switch_path)?;
        file.write_all(mode.as_bytes())?;

        // DRDCFG1 reflects the new role only after the host accepted it.
        let cfg1_offset = self.windows[drd].start + DRDCFG1_OFFSET;
        self.windows[drd].write_dword(cfg1_offset, drdcfg1 as u32);
        debug!("switched DRD role to {mode} mode");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_capability_headers_match_native_layout() {
        let caps = ExtendedCapabilities::new_default();
        assert_eq!(caps.read(EXCAP_BASE), 0x0200_0802);
        assert_eq!(caps.read(EXCAP_BASE + 0x20), 0x0300_1402);
        // name string "USB "
        assert_eq!(caps.read(EXCAP_BASE + 4), u64::from(u32::from_le_bytes(*b"USB ")));
        // USB2 ports 11..=20, USB3 ports 1..=10
        assert_eq!(caps.read(EXCAP_BASE + 8) & 0xFFFF, 0x0A0B);
        assert_eq!(caps.read(EXCAP_BASE + 0x28) & 0xFFFF, 0x0A01);
        assert_eq!(caps.registers_end(), EXCAP_BASE + 0x30);
    }

    #[test]
    fn reads_outside_windows_return_zero() {
        let caps = ExtendedCapabilities::new_default();
        assert_eq!(caps.read(EXCAP_BASE + 0x18), 0);
    }

    #[test]
    fn default_layout_rejects_writes() {
        let mut caps = ExtendedCapabilities::new_default();
        assert!(matches!(
            caps.write(EXCAP_BASE, 1),
            Err(ExcapError::NotWritable(_))
        ));
    }

    #[test]
    fn apl_layout_exposes_drd_block() {
        let caps = ExtendedCapabilities::new_apl();
        assert_eq!(caps.read(EXCAP_BASE + 0x70), 0x0000_00C0);
        assert_eq!(caps.registers_end(), EXCAP_BASE + 0xE0);
        assert!(caps.has_drd());
    }

    #[test]
    fn drd_switch_writes_role_and_updates_cfg1() {
        let dir = std::env::temp_dir().join(format!("vxhcid-drd-{}", std::process::id()));
        std::fs::write(&dir, b"").unwrap();

        let mut caps = ExtendedCapabilities::new_apl();
        caps.set_drd_switch_path(&dir);

        let cfg0 = EXCAP_BASE + 0x70 + 104;
        let cfg1 = EXCAP_BASE + 0x70 + 108;

        caps.write(cfg0, DRDCFG0_IDPIN_EN).unwrap();
        assert_eq!(std::fs::read_to_string(&dir).unwrap(), "host");
        assert_ne!(caps.read(cfg1) & DRDCFG1_HOST_MODE, 0);

        caps.write(cfg0, DRDCFG0_IDPIN_EN | DRDCFG0_IDPIN).unwrap();
        assert_eq!(std::fs::read_to_string(&dir).unwrap(), "device");
        assert_eq!(caps.read(cfg1) & DRDCFG1_HOST_MODE, 0);

        // same value again: no action, still fine
        caps.write(cfg0, DRDCFG0_IDPIN_EN | DRDCFG0_IDPIN).unwrap();

        std::fs::remove_file(&dir).unwrap();
    }

    #[test]
    fn drd_cfg1_untouched_when_switch_write_fails() {
        let mut caps = ExtendedCapabilities::new_apl();
        caps.set_drd_switch_path("/nonexistent/vxhcid/role");

        let cfg0 = EXCAP_BASE + 0x70 + 104;
        let cfg1 = EXCAP_BASE + 0x70 + 108;
        assert!(caps.write(cfg0, DRDCFG0_IDPIN_EN).is_err());
        assert_eq!(caps.read(cfg1) & DRDCFG1_HOST_MODE, 0);
    }
}
