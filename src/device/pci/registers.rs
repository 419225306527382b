//! Port register sets.
//!
//! Each root-hub port owns four 32-bit registers (PORTSC, PORTPMSC,
//! PORTLI, PORTHLPMC). PORTSC carries the write-mask rules: read-only
//! bits are preserved across guest writes and the status-change bits
//! clear when the guest writes one to them.

use super::constants::xhci::operational::portsc;

/// Side effect of a guest PORTSC write that the controller has to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortscWriteEffect {
    None,
    /// Write to an unpowered port, ignored.
    Ignored,
    /// PR or WPR was set; the controller issues a port reset.
    ResetRequested { warm: bool },
    /// A LWS link-state write moved the port to U0 from a non-U0 state.
    /// PLC has been latched; a Port Status Change event is due.
    ResumedToU0,
}

/// One port register set.
#[derive(Debug, Clone, Copy)]
pub struct PortRegisterSet {
    portsc: u64,
    portpmsc: u64,
    porthlpmc: u64,
}

impl PortRegisterSet {
    /// A powered, empty port in the RxDetect link state.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            portsc: portsc::PP | (portsc::PLS_RX_DETECT << portsc::PLS_SHIFT),
            portpmsc: 0,
            porthlpmc: 0,
        }
    }

    #[must_use]
    pub const fn portsc(&self) -> u64 {
        self.portsc
    }

    #[must_use]
    pub const fn portpmsc(&self) -> u64 {
        self.portpmsc
    }

    /// PORTLI is read-as-zero on this controller.
    #[must_use]
    pub const fn portli(&self) -> u64 {
        0
    }

    #[must_use]
    pub const fn porthlpmc(&self) -> u64 {
        self.porthlpmc
    }

    #[must_use]
    pub const fn link_state(&self) -> u64 {
        (self.portsc & portsc::PLS_MASK) >> portsc::PLS_SHIFT
    }

    /// Replace PORTSC wholesale. Used by connect/disconnect/reset paths
    /// that own the register, not by guest writes.
    pub fn set_portsc(&mut self, value: u64) {
        self.portsc = value;
    }

    pub fn portsc_set_bits(&mut self, bits: u64) {
        self.portsc |= bits;
    }

    pub fn portsc_clear_bits(&mut self, bits: u64) {
        self.portsc &= !bits;
    }

    pub fn write_portpmsc(&mut self, value: u64) {
        self.portpmsc = value & 0xFFFF_FFFF;
    }

    pub fn write_porthlpmc(&mut self, value: u64) {
        self.porthlpmc = value & 0xFFFF_FFFF;
    }

    /// Apply a guest PORTSC write.
    ///
    /// `device_connected` keeps CCS asserted for occupied ports no matter
    /// what the guest writes.
    pub fn write_portsc(&mut self, value: u64, device_connected: bool) -> PortscWriteEffect {
        if value & (portsc::PR | portsc::WPR) != 0 {
            return PortscWriteEffect::ResetRequested {
                warm: value & portsc::WPR != 0,
            };
        }

        if self.portsc & portsc::PP == 0 {
            return PortscWriteEffect::Ignored;
        }

        let old_pls = self.link_state();
        let new_pls = (value & portsc::PLS_MASK) >> portsc::PLS_SHIFT;

        // Read-only bits survive the write.
        self.portsc &=
            portsc::PED | portsc::PLS_MASK | portsc::SPEED_MASK | portsc::PIC_MASK;
        if device_connected {
            self.portsc |= portsc::CCS;
        }

        self.portsc |= value
            & !(portsc::OCA
                | portsc::PR
                | portsc::PED
                | portsc::PLS_MASK
                | portsc::SPEED_MASK
                | portsc::PIC_MASK
                | portsc::LWS
                | portsc::DR
                | portsc::WPR);

        // Status-change bits clear on write-1.
        self.portsc &= !(value & portsc::RW1C_MASK);

        if value & portsc::LWS == 0 {
            return PortscWriteEffect::None;
        }

        match new_pls {
            portsc::PLS_U0 | portsc::PLS_U3 if old_pls != new_pls => {
                self.portsc &= !portsc::PLS_MASK;
                self.portsc |= new_pls << portsc::PLS_SHIFT;
                if new_pls == portsc::PLS_U0 {
                    self.portsc |= portsc::PLC;
                    return PortscWriteEffect::ResumedToU0;
                }
                PortscWriteEffect::None
            }
            _ => PortscWriteEffect::None,
        }
    }
}

impl Default for PortRegisterSet {
    fn default() -> Self {
        Self::new()
    }
}
