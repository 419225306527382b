//! Emulation of a USB3 Host (XHCI) controller.
//!
//! See XHCI specification Section 3 for an overview about the scope of the
//! xHC. The controller decodes MMIO accesses into its capability,
//! operational, doorbell, runtime, and extended-capability regions, runs
//! the command and transfer state machines against guest-resident rings,
//! and reports back through the event ring and the interrupt line.
//!
//! A single mutex around the whole controller serializes the guest's MMIO
//! accesses, hot-plug callbacks, backend completions, and the VBDP
//! poller; `PciDevice` is therefore implemented for
//! `Mutex<XhciController>`.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::cli::XhciConfig;
use crate::device::{
    bus::{BusDeviceRef, GuestAccess, Request},
    interrupt_line::{DummyInterruptLine, InterruptLine},
};

use super::{
    backend::{DeviceKind, Direction, NativeDeviceSource, Speed, UsbBackend, UsbError},
    config_space::{BarInfo, ConfigSpace, ConfigSpaceBuilder},
    constants::config_space as cfg,
    constants::xhci::{
        capability, doorbell, offset,
        operational::{portsc, usbcmd, usbsts},
        rings::TRB_SIZE,
        MAX_NATIVE_PORTS, MAX_PORTS, MAX_SLOTS, MAX_STREAMS, USB2_PORT_START,
    },
    device_slots::{endpoint_state, slot_state, DeviceContext, DeviceSlotManager, InputContext},
    excap::ExtendedCapabilities,
    ports::{DeviceInfo, DevicePath, NativeDeviceType, NativePortTable, PortState},
    registers::{PortRegisterSet, PortscWriteEffect},
    rings::{CommandRing, EventRing, TrbRing},
    tablet::{Tablet, TabletHandle},
    traits::PciDevice,
    trb::{
        trb_types, CommandTrb, CommandTrbVariant, CompletionCode, EventTrb,
        InputContextCommandTrbData, SetTrDequeueCommandTrbData, TransferTrbVariant, Trb,
    },
    vbdp::{VbdpSignal, VbdpTracker},
    xfer::{BlockBuffer, BlockState, DeviceRequest, XferBlock, XferQueue},
};

/// Only one controller instance may exist per process.
static XHCI_IN_USE: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug)]
pub enum XhciError {
    #[error("an xHCI controller instance already exists in this process")]
    AlreadyInUse,
    #[error("device path {0} is not assigned to this controller")]
    PortNotAssigned(DevicePath),
    #[error("no free virtual port for device {0}")]
    NoFreePort(DevicePath),
    #[error("no device known at path {0}")]
    UnknownDevice(DevicePath),
    #[error("a device is already attached at path {0}")]
    AlreadyAttached(DevicePath),
}

/// Claims the process-wide controller slot.
#[derive(Debug)]
pub struct InstanceGuard(());

impl InstanceGuard {
    pub fn claim() -> Result<Self, XhciError> {
        if XHCI_IN_USE.swap(true, Ordering::AcqRel) {
            return Err(XhciError::AlreadyInUse);
        }
        Ok(Self(()))
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        XHCI_IN_USE.store(false, Ordering::Release);
    }
}

/// Make a fixed size array index start at one (instead of zero).
/// This is a common pattern within XHCI for port and slot IDs, and
/// manually handling the difference is error-prone.
#[derive(Debug)]
struct OneIndexed<T, const S: usize> {
    array: [T; S],
}

impl<T, const S: usize> OneIndexed<T, S> {
    fn get(&self, index: usize) -> Option<&T> {
        self.array.get(index.wrapping_sub(1))
    }

    /// Enumerating elements with the correct one-based index.
    fn enumerate(&self) -> impl Iterator<Item = (usize, &T)> {
        self.array.iter().enumerate().map(|(i, e)| (i + 1, e))
    }
}

impl<T, const S: usize> std::convert::From<[T; S]> for OneIndexed<T, S> {
    fn from(val: [T; S]) -> Self {
        Self { array: val }
    }
}

impl<T, const S: usize> std::ops::Index<usize> for OneIndexed<T, S> {
    type Output = T;
    fn index(&self, index: usize) -> &T {
        &self.array[index.wrapping_sub(1)]
    }
}

impl<T, const S: usize> std::ops::IndexMut<usize> for OneIndexed<T, S> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.array[index.wrapping_sub(1)]
    }
}

/// Per-endpoint stream bookkeeping (single primary stream array).
#[derive(Debug)]
struct StreamState {
    /// Guest address of the stream context array.
    context_base: u64,
    /// Ring cursors indexed by stream id.
    rings: Vec<TrbRing>,
}

/// Controller-side endpoint state. The authoritative endpoint context
/// lives in guest memory; this holds the ring cursor and transfer queue.
#[derive(Debug)]
struct Endpoint {
    ring: TrbRing,
    xfer: XferQueue,
    streams: Option<StreamState>,
}

impl Endpoint {
    fn cursor(&self, streamid: u32) -> Option<TrbRing> {
        match &self.streams {
            Some(streams) => streams.rings.get(streamid as usize).copied(),
            None => Some(self.ring),
        }
    }

    fn set_cursor(&mut self, streamid: u32, ring: TrbRing) {
        match &mut self.streams {
            Some(streams) => {
                if let Some(slot) = streams.rings.get_mut(streamid as usize) {
                    *slot = ring;
                }
            }
            None => self.ring = ring,
        }
    }
}

/// An emulated device instance occupying a virtual port.
#[derive(Debug)]
struct EmulatedDevice {
    backend: Box<dyn UsbBackend>,
    /// Identity of the native device behind it; None for internal devices.
    info: Option<DeviceInfo>,
    slot_state: u32,
    address: u8,
    eps: [Option<Endpoint>; 32],
}

impl EmulatedDevice {
    fn new(backend: Box<dyn UsbBackend>, info: Option<DeviceInfo>) -> Self {
        Self {
            backend,
            info,
            slot_state: slot_state::DISABLED_ENABLED,
            address: 0,
            eps: std::array::from_fn(|_| None),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FetchResult {
    reached_ioc: bool,
}

/// The emulation of a XHCI controller.
#[derive(Debug)]
pub struct XhciController {
    /// A reference to the VM memory to perform DMA on.
    dma_bus: BusDeviceRef,

    /// The PCI Configuration Space of the controller.
    config_space: ConfigSpace,

    /// USBCMD shadow.
    usbcmd: u64,
    /// USBSTS shadow.
    usbsts: u64,
    /// Device notification control register.
    dnctl: u64,
    /// CONFIG register (number of enabled slots).
    config_reg: u64,

    /// The Command Ring.
    command_ring: CommandRing,

    /// The Event Ring of the single Interrupt Register Set.
    event_ring: EventRing,

    /// Device Slot Management.
    device_slot_manager: DeviceSlotManager,

    /// The interrupt line triggered to signal device events.
    interrupt_line: Arc<dyn InterruptLine>,

    /// PORTSC register sets.
    portsc: OneIndexed<PortRegisterSet, { MAX_PORTS as usize }>,

    /// Emulated device instances, indexed by virtual port.
    devices: OneIndexed<Option<EmulatedDevice>, { MAX_PORTS as usize }>,

    /// Slot-to-port mapping.
    slot_to_port: OneIndexed<Option<usize>, { MAX_SLOTS as usize }>,

    /// Native ports declared for this controller and their mapping state.
    native_ports: NativePortTable,

    /// Openers for attached host devices, parallel to `native_ports`.
    attachments: Vec<Option<Box<dyn NativeDeviceSource>>>,

    /// S3 suspend/resume bookkeeping.
    vbdp: VbdpTracker,
    vbdp_signal: Arc<VbdpSignal>,

    /// Extended capability registers.
    excap: ExtendedCapabilities,
    /// End of the decoded register space.
    regs_end: u64,

    /// Reference point for the synthetic MFINDEX counter.
    started_at: Instant,

    /// Handle to ourselves for asynchronous backend completions.
    self_handle: Weak<Mutex<XhciController>>,

    /// Input handles of internal tablets created from the configuration.
    tablet_handles: Vec<TabletHandle>,
}

impl XhciController {
    /// Create a new XHCI controller from the parsed configuration.
    ///
    /// `dma_bus` is the device on which we will perform DMA operations.
    /// This is typically VM guest memory.
    #[must_use]
    pub fn new(config: &XhciConfig, dma_bus: BusDeviceRef) -> Self {
        let (vendor, device, excap) = if config.apl {
            (
                cfg::vendor::INTEL,
                cfg::device::INTEL_APL_XHCI,
                ExtendedCapabilities::new_apl(),
            )
        } else {
            (
                cfg::vendor::REDHAT,
                cfg::device::REDHAT_XHCI,
                ExtendedCapabilities::new_default(),
            )
        };
        let regs_end = excap.registers_end();

        let mut controller = Self {
            dma_bus: dma_bus.clone(),
            config_space: ConfigSpaceBuilder::new(vendor, device)
                .class(
                    cfg::class::SERIAL,
                    cfg::class::SUBCLASS_USB,
                    cfg::class::PROGIF_XHCI,
                )
                .readonly_byte(cfg::USBREV_OFFSET, cfg::USBREV_3_0)
                .mem32_nonprefetchable_bar(0, 0x10000)
                .msi_capability()
                .config_space(),
            usbcmd: 0,
            usbsts: usbsts::HCH,
            dnctl: 0,
            config_reg: 0,
            command_ring: CommandRing::new(dma_bus.clone()),
            event_ring: EventRing::new(dma_bus.clone()),
            device_slot_manager: DeviceSlotManager::new(MAX_SLOTS, dma_bus),
            interrupt_line: Arc::new(DummyInterruptLine::default()),
            portsc: [PortRegisterSet::new(); MAX_PORTS as usize].into(),
            devices: [const { None }; MAX_PORTS as usize].into(),
            slot_to_port: [None; MAX_SLOTS as usize].into(),
            native_ports: NativePortTable::new(),
            attachments: (0..MAX_NATIVE_PORTS).map(|_| None).collect(),
            vbdp: VbdpTracker::new(),
            vbdp_signal: Arc::new(VbdpSignal::new()),
            excap,
            regs_end,
            started_at: Instant::now(),
            self_handle: Weak::new(),
            tablet_handles: Vec::new(),
        };

        for host_port in &config.ports {
            let path = DevicePath::new(host_port.bus, &[host_port.port]);
            if controller.native_ports.set_assigned(path).is_none() {
                warn!("too many assigned ports, dropping {path}");
            }
        }

        if config.tablet {
            controller.attach_tablet();
        }

        controller
    }

    /// Configure the interrupt line for the controller.
    ///
    /// The [`XhciController`] uses this to issue interrupts for events.
    pub fn connect_irq(&mut self, irq: Arc<dyn InterruptLine>) {
        self.interrupt_line = irq;
    }

    /// Install the back-reference used by asynchronous backend
    /// completions and input handles.
    pub fn connect_self(&mut self, handle: Weak<Mutex<XhciController>>) {
        for tablet in &self.tablet_handles {
            tablet.connect_controller(handle.clone());
        }
        self.self_handle = handle;
    }

    /// A weak handle to the controller for notify callbacks.
    #[must_use]
    pub fn self_handle(&self) -> Weak<Mutex<XhciController>> {
        self.self_handle.clone()
    }

    /// The wakeup channel shared with the VBDP poller task.
    #[must_use]
    pub fn vbdp_signal(&self) -> Arc<VbdpSignal> {
        self.vbdp_signal.clone()
    }

    /// Take the input handles of the tablets created at parse time.
    pub fn take_tablet_handles(&mut self) -> Vec<TabletHandle> {
        std::mem::take(&mut self.tablet_handles)
    }

    fn attach_tablet(&mut self) {
        // The internal tablet is a full-speed device; it occupies the
        // first port of the USB2 half.
        let vport = USB2_PORT_START;
        let (tablet, handle) = Tablet::new(self.dma_bus.clone(), vport as u8);
        let speed = tablet.info().speed;
        self.devices[vport] = Some(EmulatedDevice::new(Box::new(tablet), None));
        self.portsc[vport].set_portsc(
            portsc::CCS | portsc::PP | portsc::CSC | (speed.portsc_value() << portsc::SPEED_SHIFT),
        );
        self.tablet_handles.push(handle);
        info!("attached internal tablet to virtual port {vport}");
    }

    // ------------------------------------------------------------------
    // Events and interrupts

    fn assert_interrupt(&mut self) {
        self.event_ring.set_busy_and_pending();
        self.usbsts |= usbsts::EINT;

        // only trigger the interrupt if permitted
        if self.usbcmd & usbcmd::INTE != 0 && self.event_ring.interrupts_enabled() {
            self.interrupt_line.interrupt();
        }
    }

    fn insert_event(&mut self, trb: EventTrb, do_intr: bool) -> CompletionCode {
        let result = self.event_ring.insert(&trb);
        if do_intr || result.force_interrupt {
            self.assert_interrupt();
        }
        result.code
    }

    // ------------------------------------------------------------------
    // Port lifecycle

    const fn running(&self) -> bool {
        self.usbcmd & usbcmd::RS != 0
    }

    fn port_change(&mut self, vport: usize, connected: Option<Speed>, need_intr: bool) {
        match connected {
            Some(speed) => self.portsc[vport].set_portsc(
                portsc::CCS
                    | portsc::PP
                    | portsc::CSC
                    | (speed.portsc_value() << portsc::SPEED_SHIFT),
            ),
            None => {
                self.portsc[vport]
                    .portsc_clear_bits(portsc::CCS | portsc::PED | portsc::PLS_MASK);
                self.portsc[vport]
                    .portsc_set_bits(portsc::CSC | (portsc::PLS_RX_DETECT << portsc::PLS_SHIFT));
            }
        }

        if !need_intr || !self.running() {
            return;
        }

        let code = self.insert_event(
            EventTrb::new_port_status_change_event_trb(vport as u8),
            true,
        );
        if code != CompletionCode::Success {
            warn!("fail to report port change for port {vport}");
        }
        trace!(
            "port {} PORTSC now {:#x}",
            vport,
            self.portsc[vport].portsc()
        );
    }

    fn connect_port(&mut self, vport: usize, speed: Speed, need_intr: bool) {
        self.port_change(vport, Some(speed), need_intr);
    }

    fn disconnect_port(&mut self, vport: usize, need_intr: bool) {
        self.port_change(vport, None, need_intr);
    }

    /// Handle PR/WPR writes: port reset.
    fn reset_port(&mut self, vport: usize, warm: bool) {
        let device_identity = self.devices[vport]
            .as_ref()
            .map(|dev| {
                let info = dev.backend.info();
                (info.speed, info.usb_version)
            })
            .or_else(|| {
                self.native_ports
                    .index_by_vport(vport as u8)
                    .and_then(|i| self.native_ports.slot(i).info)
                    .map(|info| (info.speed, info.bcd_usb))
            });
        let Some((speed, bcd)) = device_identity else {
            warn!("cannot reset port {vport} without a connected device");
            return;
        };

        let regs = &mut self.portsc[vport];
        regs.portsc_clear_bits(portsc::PLS_MASK | portsc::PR | portsc::PRC);
        regs.portsc_set_bits(portsc::PED | (speed.portsc_value() << portsc::SPEED_SHIFT));
        if warm && bcd >= 0x300 {
            regs.portsc_set_bits(portsc::WRC);
        }
        regs.portsc_set_bits(portsc::PRC);

        let code = self.insert_event(
            EventTrb::new_port_status_change_event_trb(vport as u8),
            true,
        );
        if code != CompletionCode::Success {
            warn!("reset port {vport}: reporting the reset failed");
        }
    }

    // ------------------------------------------------------------------
    // Hot-plug entry points

    /// A device appeared on the host.
    ///
    /// `source` opens the backend when the guest later addresses the
    /// device; external hubs carry no source.
    pub fn device_connected(
        &mut self,
        info: DeviceInfo,
        source: Option<Box<dyn NativeDeviceSource>>,
    ) -> Result<(), XhciError> {
        debug!(
            "{:04x}:{:04x} {} connecting",
            info.vendor_id, info.product_id, info.path
        );

        let Some(index) = self.native_ports.index_by_path(&info.path) else {
            debug!("{} doesn't belong to this vm, bye", info.path);
            return Err(XhciError::PortNotAssigned(info.path));
        };

        if let NativeDeviceType::Hub { .. } = info.device_type {
            if self.native_ports.assign_hub_ports(&info).is_none() {
                warn!("fail to assign ports of hub {}", info.path);
            }
            return Ok(());
        }

        if matches!(
            self.native_ports.slot(index).state,
            PortState::Connected | PortState::Emulated
        ) {
            return Err(XhciError::AlreadyAttached(info.path));
        }

        self.attachments[index] = source;

        // A device reappearing while its S3 record is open keeps its old
        // virtual port; the connect event is replayed by the poller once
        // the guest has released the slot.
        let s3_reconnect = self.vbdp.is_start(&info.path);
        let vport = if let Some(vport) = self.vbdp.start_vport(&info.path) {
            info!(
                "defer connect event for {} until resume completes",
                info.path
            );
            vport
        } else {
            let vbdp = &self.vbdp;
            self.native_ports
                .free_vport(&info, |p| vbdp.reserves_vport(p))
                .ok_or(XhciError::NoFreePort(info.path))?
        };

        let slot = self.native_ports.slot_mut(index);
        slot.info = Some(info);
        slot.vport = vport;
        slot.state = PortState::Connected;

        debug!(
            "{:04X}:{:04X} {} is attached to virtual port {}",
            info.vendor_id, info.product_id, info.path, vport
        );

        if s3_reconnect {
            self.vbdp_signal.post();
            return Ok(());
        }

        self.connect_port(vport as usize, info.speed, true);
        Ok(())
    }

    /// A device disappeared from the host.
    pub fn device_disconnected(&mut self, path: DevicePath) -> Result<(), XhciError> {
        let Some(index) = self.native_ports.index_by_path(&path) else {
            warn!("fail to find physical port for {path}");
            return Err(XhciError::UnknownDevice(path));
        };

        let entry = *self.native_ports.slot(index);
        if let Some(info) = entry.info {
            if let NativeDeviceType::Hub { .. } = info.device_type {
                if self.native_ports.unassign_hub_ports(&info).is_none() {
                    warn!("fail to unassign the ports of hub {path}");
                }
                return Ok(());
            }
        }

        let vport = entry.vport;
        if entry.state == PortState::Connected && vport > 0 {
            // The device left before the guest ever addressed it; clear
            // the mapping so the path can connect again later.
            info!("disconnect device {path} on virtual port {vport} before emulation");
            self.disconnect_port(vport as usize, true);
            let slot = self.native_ports.slot_mut(index);
            slot.state = PortState::Assigned;
            slot.vport = 0;
            self.attachments[index] = None;
            return Ok(());
        }

        if self.vbdp.is_start(&path) {
            // Part of an S3 cycle; nothing to report to the guest.
            return Ok(());
        }

        let slot = self.native_ports.slot_mut(index);
        slot.state = PortState::Assigned;
        slot.vport = 0;

        debug!("report virtual port {vport} disconnect");
        self.disconnect_port(vport as usize, true);

        // The emulated-device resources stay alive; the guest's Disable
        // Slot releases them.
        Ok(())
    }

    /// An internal device raised an interrupt on one of its endpoints.
    pub fn device_interrupt(&mut self, vport: u8, endpoint_id: u8) {
        let vport = vport as usize;
        if !self.event_ring.is_configured() || !self.running() {
            return;
        }
        let Some(device) = &self.devices[vport] else {
            return;
        };
        let slot = device.address;
        if slot == 0 {
            return;
        }

        // Wake a suspended port before delivering data.
        if self.portsc[vport].link_state() == portsc::PLS_U3 {
            self.portsc[vport].portsc_clear_bits(portsc::PLS_MASK);
            self.portsc[vport].portsc_set_bits(portsc::PLS_RESUME << portsc::PLS_SHIFT);
            if self.portsc[vport].portsc() & portsc::PLC != 0 {
                return;
            }
            self.portsc[vport].portsc_set_bits(portsc::PLC);
            let code = self.insert_event(
                EventTrb::new_port_status_change_event_trb(vport as u8),
                false,
            );
            if code != CompletionCode::Success {
                return;
            }
        }

        if self.devices[vport]
            .as_ref()
            .is_none_or(|dev| dev.eps[endpoint_id as usize].is_none())
        {
            warn!("device interrupt on disabled endpoint {endpoint_id}");
            return;
        }

        debug!("device interrupt on endpoint {endpoint_id}");
        self.device_doorbell(u32::from(slot), u32::from(endpoint_id), 0);
    }

    /// The host devices currently visible on the controller, as
    /// (bus, root port) pairs.
    #[must_use]
    pub fn attached_devices(&self) -> Vec<(u8, u8)> {
        self.native_ports
            .iter()
            .filter(|slot| {
                matches!(slot.state, PortState::Connected | PortState::Emulated)
            })
            .map(|slot| (slot.path.bus, slot.path.root_port()))
            .collect()
    }

    /// Replay one deferred S3 connect event; called by the poller.
    pub fn vbdp_poll_once(&mut self) {
        let Some(record) = self.vbdp.take_end() else {
            return;
        };
        let Some(index) = self.native_ports.index_by_path(&record.path) else {
            return;
        };
        let entry = *self.native_ports.slot(index);
        if entry.state != PortState::Connected {
            return;
        }
        let Some(info) = entry.info else {
            return;
        };
        info!(
            "replay connect event for {} on port {}",
            record.path, entry.vport
        );
        self.connect_port(entry.vport as usize, info.speed, true);
    }

    // ------------------------------------------------------------------
    // Operational register handlers

    fn write_usbcmd(&mut self, value: u64) {
        let mut cmd = value & usbcmd::MASK;

        if cmd & usbcmd::RS != 0 {
            self.usbsts &= !usbsts::HCH;
            self.usbsts |= usbsts::PCD;
            debug!("controller started with cmd {value:#x}");
        } else {
            self.usbsts |= usbsts::HCH;
            self.usbsts &= !usbsts::PCD;
            debug!("controller stopped with cmd {value:#x}");
        }

        if cmd & usbcmd::HCRST != 0 {
            self.reset_controller();
            cmd &= !usbcmd::HCRST;
        }

        if cmd & usbcmd::CSS != 0 {
            self.save_state();
        }

        // The save/restore bits always read as zero.
        cmd &= !(usbcmd::CSS | usbcmd::CRS);
        self.usbcmd = cmd;
    }

    /// Full controller reset (USBCMD.HCRST).
    fn reset_controller(&mut self) {
        debug!("resetting the controller");
        self.event_ring.reset();
        for slot in 1..=MAX_SLOTS as usize {
            self.reset_slot(slot);
            self.slot_to_port[slot] = None;
        }
        self.device_slot_manager.free_all_slots();
    }

    /// Reset the device at a slot and the data structures related to it.
    fn reset_slot(&mut self, slot: usize) {
        let Some(port) = self.slot_to_port[slot] else {
            trace!("reset unassigned slot ({slot})?");
            return;
        };
        if let Some(device) = &mut self.devices[port] {
            device.slot_state = slot_state::DISABLED_ENABLED;
            device.address = 0;
            for ep in &mut device.eps {
                *ep = None;
            }
        }
    }

    /// USBCMD.CSS: snapshot every emulated port for the S3 cycle.
    fn save_state(&mut self) {
        self.vbdp.clear();

        let mut saved = Vec::new();
        for port_slot in self.native_ports.iter_mut() {
            if port_slot.state != PortState::Emulated {
                continue;
            }
            saved.push((port_slot.path, port_slot.vport));
            port_slot.vport = 0;
            port_slot.state = PortState::Assigned;
        }

        for (path, vport) in saved {
            self.vbdp.record_start(path, vport);
            // Clear PORTSC so the guest comes back to a quiet port.
            self.portsc[vport as usize] = PortRegisterSet::new();
        }
    }

    fn write_usbsts(&mut self, value: u64) {
        // clear bits on write
        self.usbsts &= !(value & usbsts::RW1C_MASK);
    }

    /// The synthetic microframe counter, 125 us per tick.
    fn mfindex(&self) -> u64 {
        (self.started_at.elapsed().as_micros() / 125) as u64 & 0xFFFF_FFFF
    }

    // ------------------------------------------------------------------
    // Doorbells

    fn write_doorbell(&mut self, db_offset: u64, value: u64) {
        if self.usbsts & usbsts::HCH != 0 {
            warn!("doorbell write while the controller is halted");
            return;
        }

        let index = db_offset / 4;
        if index == 0 {
            debug!("Ding Dong!");
            self.complete_commands();
        } else {
            let value = value as u32;
            self.device_doorbell(
                index as u32,
                doorbell::target(value),
                doorbell::stream_id(value),
            );
        }
    }

    // ------------------------------------------------------------------
    // Command ring

    fn complete_commands(&mut self) {
        self.command_ring.set_running(true);
        while let Some(cmd) = self.command_ring.next_command_trb() {
            self.handle_command(&cmd);
        }
        self.command_ring.set_running(false);
    }

    fn handle_command(&mut self, cmd: &CommandTrb) {
        debug!("handling command {:?} at {:#x}", cmd.variant, cmd.address);

        let (code, slot_id) = match &cmd.variant {
            CommandTrbVariant::EnableSlot => self.cmd_enable_slot(),
            CommandTrbVariant::DisableSlot(data) => {
                (self.cmd_disable_slot(data.slot_id), data.slot_id)
            }
            CommandTrbVariant::AddressDevice(data) => {
                (self.cmd_address_device(data), data.slot_id)
            }
            CommandTrbVariant::ConfigureEndpoint(data) => (
                self.cmd_configure_endpoint(
                    data.slot_id,
                    data.input_context_pointer,
                    data.deconfigure,
                ),
                data.slot_id,
            ),
            CommandTrbVariant::EvaluateContext(data) => {
                (self.cmd_evaluate_context(data), data.slot_id)
            }
            CommandTrbVariant::ResetEndpoint(data) => (
                self.cmd_reset_endpoint(data.slot_id, data.endpoint_id),
                data.slot_id,
            ),
            CommandTrbVariant::StopEndpoint(data) => (
                self.cmd_stop_endpoint(data.slot_id, data.endpoint_id),
                data.slot_id,
            ),
            CommandTrbVariant::SetTrDequeuePointer(data) => {
                (self.cmd_set_tr_dequeue(data), data.slot_id)
            }
            CommandTrbVariant::ResetDevice(data) => {
                (self.cmd_reset_device(data.slot_id), data.slot_id)
            }
            CommandTrbVariant::NoOp(data) => (CompletionCode::Success, data.slot_id),
            CommandTrbVariant::Unrecognized(trb, error) => {
                warn!("unsupported command ({error}), completing as no-op");
                (CompletionCode::Success, trb.slot_id())
            }
            // Link TRBs are consumed inside the ring walker.
            CommandTrbVariant::Link(_) => unreachable!(),
        };

        // Command handlers might have performed stores to guest memory.
        // The stores have to be finished before the command completion
        // event is written (essentially releasing the data to the driver).
        fence(Ordering::Release);

        debug!("command at {:#x} completed with {:?}", cmd.address, code);
        self.insert_event(
            EventTrb::new_command_completion_event_trb(cmd.address, code, slot_id),
            true,
        );
    }

    fn cmd_enable_slot(&mut self) -> (CompletionCode, u8) {
        self.device_slot_manager.reserve_slot().map_or_else(
            || {
                debug!("answering driver that no free slot is available");
                (CompletionCode::NoSlotsAvailableError, 0)
            },
            |slot_id| {
                debug!("answering driver to use Slot ID {slot_id}");
                (CompletionCode::Success, slot_id as u8)
            },
        )
    }

    fn cmd_disable_slot(&mut self, slot_id: u8) -> CompletionCode {
        debug!("disable slot {slot_id}");
        let slot = u64::from(slot_id);
        if !self.device_slot_manager.is_reserved(slot) {
            return CompletionCode::SlotNotEnabledError;
        }

        let Some(port) = self.slot_to_port[slot_id as usize] else {
            // Slot was enabled but never addressed.
            self.device_slot_manager.free_slot(slot);
            return CompletionCode::Success;
        };

        self.slot_to_port[slot_id as usize] = None;
        self.device_slot_manager.free_slot(slot);

        let Some(device) = &mut self.devices[port] else {
            warn!("disable slot {slot_id}: no device on port {port}");
            return CompletionCode::Success;
        };

        if device.info.is_none() {
            // Internal devices stay attached to their port; only the
            // slot-level state is released.
            device.slot_state = slot_state::DISABLED_ENABLED;
            device.address = 0;
            for ep in &mut device.eps {
                *ep = None;
            }
            return CompletionCode::Success;
        }

        // Native device: tear down the instance and quiet the port.
        self.portsc[port]
            .portsc_clear_bits(portsc::CSC | portsc::CCS | portsc::PED | portsc::PP);
        let device = self.devices[port].take();
        let path = device.and_then(|d| d.info).map(|info| info.path);

        let Some(path) = path else {
            return CompletionCode::Success;
        };

        if self.native_ports.index_by_path(&path).is_none() {
            // The device may have been unplugged in the middle of the
            // resume process; give the poller a chance to look.
            self.vbdp_signal.post();
            return CompletionCode::SlotNotEnabledError;
        }

        if self.vbdp.mark_end(&path) {
            self.vbdp_signal.post();
            info!("signal device {path} to connect");
        }
        info!("disabled slot {slot_id} for native device {path}");
        CompletionCode::Success
    }

    fn cmd_address_device(&mut self, data: &InputContextCommandTrbData) -> CompletionCode {
        let slot_id = data.slot_id;
        let input = InputContext::new(self.dma_bus.clone(), data.input_context_pointer);

        // when setting the address: drop-ctx=0, add-ctx=slot+ep0
        if input.drop_flags() != 0 || input.add_flags() & 0x3 != 0x3 {
            debug!("address device: invalid input control context");
            return CompletionCode::TrbError;
        }

        if !self.device_slot_manager.is_reserved(u64::from(slot_id)) {
            debug!("address device: invalid slot {slot_id}");
            return CompletionCode::SlotNotEnabledError;
        }

        let rh_port = input.root_hub_port() as usize;
        if !(1..=MAX_PORTS as usize).contains(&rh_port) {
            warn!("address device reported invalid root hub port number: {rh_port}");
            return CompletionCode::TrbError;
        }

        if self.devices[rh_port].is_none() {
            // Create the backend instance for the native device behind
            // the virtual port.
            let Some(index) = self.native_ports.index_by_vport(rh_port as u8) else {
                warn!("address device: no native device behind port {rh_port}");
                return CompletionCode::TrbError;
            };
            if self.native_ports.slot(index).state != PortState::Connected {
                warn!("address device: port {rh_port} has no connected device");
                return CompletionCode::TrbError;
            }
            let Some(info) = self.native_ports.slot(index).info else {
                return CompletionCode::TrbError;
            };
            let Some(attachment) = self.attachments[index].as_ref() else {
                warn!("address device: device {} has no backend source", info.path);
                return CompletionCode::TrbError;
            };
            let backend = match attachment.create_backend(self.dma_bus.clone(), slot_id) {
                Ok(backend) => backend,
                Err(error) => {
                    warn!("fail to create device for {}: {error}", info.path);
                    return CompletionCode::from(error);
                }
            };
            debug!("created virtual device for {} on port {rh_port}", info.path);
            self.devices[rh_port] = Some(EmulatedDevice::new(backend, Some(info)));
            self.native_ports.slot_mut(index).state = PortState::Emulated;
        }

        let Some(dev_ctx) = self
            .device_slot_manager
            .get_device_context(u64::from(slot_id))
        else {
            return CompletionCode::ContextStateError;
        };

        self.slot_to_port[slot_id as usize] = Some(rh_port);

        let device = self.devices[rh_port].as_mut().unwrap();
        if device.backend.reset().is_err() {
            return CompletionCode::EndpointNotEnabledError;
        }

        // In this emulation the slot id is the device address.
        dev_ctx.copy_slot_from_input(&input);
        dev_ctx.set_slot_state(slot_state::ADDRESSED);
        dev_ctx.set_usb_device_address(slot_id);

        dev_ctx.copy_ep_from_input(&input, 1);
        dev_ctx.set_ep_state(1, endpoint_state::RUNNING);

        device.address = slot_id;
        device.slot_state = slot_state::ADDRESSED;
        device.eps[1] = Some(Endpoint {
            ring: TrbRing::from_pointer_and_cycle(dev_ctx.ep_tr_dequeue(1)),
            xfer: XferQueue::new(),
            streams: None,
        });

        debug!("addressed device on slot {slot_id}, port {rh_port}");
        CompletionCode::Success
    }

    /// Build the controller-side endpoint state from its context.
    fn init_endpoint(&mut self, port: usize, endpoint_id: u8, dev_ctx: &DeviceContext) {
        let pstreams = dev_ctx.ep_max_pstreams(endpoint_id);
        let streams = if pstreams > 0 {
            debug!("init endpoint {endpoint_id} with {pstreams} primary streams");
            let context_base = dev_ctx.ep_tr_dequeue(endpoint_id) & !0xF;
            let count = pstreams.min(MAX_STREAMS) as usize + 1;
            let rings = (0..count)
                .map(|i| {
                    let sctx = self.dma_bus.read_u64(context_base + 16 * i as u64);
                    TrbRing::from_pointer_and_cycle(sctx)
                })
                .collect();
            Some(StreamState {
                context_base,
                rings,
            })
        } else {
            debug!("init endpoint {endpoint_id} with no streams");
            None
        };

        if let Some(device) = &mut self.devices[port] {
            device.eps[endpoint_id as usize] = Some(Endpoint {
                ring: TrbRing::from_pointer_and_cycle(dev_ctx.ep_tr_dequeue(endpoint_id)),
                xfer: XferQueue::new(),
                streams,
            });
        }
    }

    fn disable_endpoint(&mut self, port: usize, endpoint_id: u8, dev_ctx: &DeviceContext) {
        dev_ctx.set_ep_state(endpoint_id, endpoint_state::DISABLED);
        if let Some(device) = &mut self.devices[port] {
            device.eps[endpoint_id as usize] = None;
        }
    }

    fn cmd_configure_endpoint(
        &mut self,
        slot_id: u8,
        input_context_pointer: u64,
        deconfigure: bool,
    ) -> CompletionCode {
        debug!("configure endpoint for slot {slot_id}");

        let Some(port) = self.slot_to_port[slot_id as usize] else {
            return CompletionCode::SlotNotEnabledError;
        };
        if self.devices[port].is_none() {
            return CompletionCode::SlotNotEnabledError;
        }
        let Some(dev_ctx) = self
            .device_slot_manager
            .get_device_context(u64::from(slot_id))
        else {
            return CompletionCode::TrbError;
        };

        if deconfigure {
            debug!("configure endpoint: deconfigure slot {slot_id}");
            let device = self.devices[port].as_mut().unwrap();
            device.backend.stop();
            device.slot_state = slot_state::ADDRESSED;

            dev_ctx.set_context_entries(1);
            dev_ctx.set_slot_state(slot_state::ADDRESSED);
            for ep in 2..=31 {
                self.disable_endpoint(port, ep, &dev_ctx);
            }
            return CompletionCode::Success;
        }

        if self.devices[port].as_ref().unwrap().slot_state < slot_state::ADDRESSED {
            warn!("configure endpoint: slot {slot_id} is not addressed");
            return CompletionCode::SlotNotEnabledError;
        }

        let input = InputContext::new(self.dma_bus.clone(), input_context_pointer);
        let drop_flags = input.drop_flags();
        let add_flags = input.add_flags();

        for ep in 2..=31u8 {
            if drop_flags & (1 << ep) != 0 {
                debug!("configure endpoint: dropping endpoint {ep}");
                self.disable_endpoint(port, ep, &dev_ctx);
            }
            if add_flags & (1 << ep) != 0 {
                debug!("configure endpoint: enabling endpoint {ep}");
                dev_ctx.copy_ep_from_input(&input, ep);
                self.init_endpoint(port, ep, &dev_ctx);
                dev_ctx.set_ep_state(ep, endpoint_state::RUNNING);
                if let Some(device) = &mut self.devices[port] {
                    device.backend.configure_endpoint(ep, dev_ctx.ep_type(ep));
                }
            }
        }

        // slot state to configured; context entries follow the input
        dev_ctx.set_slot_state(slot_state::CONFIGURED);
        dev_ctx.set_context_entries(input.slot_dword(0) >> 27);
        self.devices[port].as_mut().unwrap().slot_state = slot_state::CONFIGURED;

        CompletionCode::Success
    }

    fn cmd_evaluate_context(&mut self, data: &InputContextCommandTrbData) -> CompletionCode {
        let input = InputContext::new(self.dma_bus.clone(), data.input_context_pointer);

        // this command expects drop-ctx=0 and at least slot or ep0 added
        if input.drop_flags() != 0 || input.add_flags() & 0x3 == 0 {
            warn!("evaluate context: invalid input control context");
            return CompletionCode::TrbError;
        }

        let Some(dev_ctx) = self
            .device_slot_manager
            .get_device_context(u64::from(data.slot_id))
        else {
            return CompletionCode::CommandAborted;
        };

        if input.add_flags() & 0x1 != 0 {
            // max exit latency
            let dword = dev_ctx.slot_dword(1);
            dev_ctx.set_slot_dword(1, (dword & !0xFFFF) | (input.slot_dword(1) & 0xFFFF));
            // interrupter target
            let dword = dev_ctx.slot_dword(2);
            dev_ctx.set_slot_dword(
                2,
                (dword & !(0x3FF << 22)) | (input.slot_dword(2) & (0x3FF << 22)),
            );
        }
        if input.add_flags() & 0x2 != 0 {
            // max packet size of the default endpoint
            let dword = dev_ctx.ep_dword(1, 1);
            dev_ctx.set_ep_dword(
                1,
                1,
                (dword & !(0xFFFF << 16)) | (input.ep_dword(1, 1) & (0xFFFF << 16)),
            );
        }

        CompletionCode::Success
    }

    fn cmd_reset_endpoint(&mut self, slot_id: u8, endpoint_id: u8) -> CompletionCode {
        debug!("reset endpoint {endpoint_id} on slot {slot_id}");

        if !(1..=31).contains(&endpoint_id) {
            return CompletionCode::TrbError;
        }
        let Some(port) = self.slot_to_port[slot_id as usize] else {
            return CompletionCode::SlotNotEnabledError;
        };
        let Some(dev_ctx) = self
            .device_slot_manager
            .get_device_context(u64::from(slot_id))
        else {
            return CompletionCode::TrbError;
        };

        if dev_ctx.ep_state(endpoint_id) != endpoint_state::HALTED {
            return CompletionCode::ContextStateError;
        }

        if let Some(device) = &mut self.devices[port] {
            if let Some(ep) = &mut device.eps[endpoint_id as usize] {
                ep.xfer.reset();
                if ep.streams.is_none() {
                    dev_ctx.set_ep_tr_dequeue(endpoint_id, ep.ring.to_pointer_and_cycle());
                }
            }
        }

        dev_ctx.set_ep_state(endpoint_id, endpoint_state::STOPPED);
        CompletionCode::Success
    }

    /// Stop Endpoint: flush the pending queue, completing in-flight TRBs
    /// with a Stopped code, and move the endpoint to the stopped state.
    fn cmd_stop_endpoint(&mut self, slot_id: u8, endpoint_id: u8) -> CompletionCode {
        debug!("stop endpoint {endpoint_id} on slot {slot_id}");

        if !(1..=31).contains(&endpoint_id) {
            return CompletionCode::TrbError;
        }
        let Some(port) = self.slot_to_port[slot_id as usize] else {
            return CompletionCode::SlotNotEnabledError;
        };
        let Some(dev_ctx) = self
            .device_slot_manager
            .get_device_context(u64::from(slot_id))
        else {
            return CompletionCode::TrbError;
        };

        if let Some(mut device) = self.devices[port].take() {
            let has_pending = device.eps[endpoint_id as usize]
                .as_ref()
                .is_some_and(|ep| !ep.xfer.is_empty());
            if has_pending {
                if let Some(ep) = &mut device.eps[endpoint_id as usize] {
                    for block in ep.xfer.iter_mut() {
                        if block.processed == BlockState::Free {
                            block.processed = BlockState::Done;
                        }
                    }
                }
                self.xfer_complete(&mut device, slot_id, endpoint_id, Err(UsbError::Cancelled));
                if let Some(ep) = &mut device.eps[endpoint_id as usize] {
                    ep.xfer.reset();
                }
            }
            self.devices[port] = Some(device);
        }

        dev_ctx.set_ep_state(endpoint_id, endpoint_state::STOPPED);
        CompletionCode::Success
    }

    fn cmd_set_tr_dequeue(&mut self, data: &SetTrDequeueCommandTrbData) -> CompletionCode {
        let (slot_id, endpoint_id) = (data.slot_id, data.endpoint_id);
        debug!(
            "set tr dequeue: slot {slot_id} ep {endpoint_id} stream {} ptr {:#x}",
            data.stream_id, data.pointer_and_cycle
        );

        if !(1..=31).contains(&endpoint_id) {
            return CompletionCode::TrbError;
        }
        let Some(port) = self.slot_to_port[slot_id as usize] else {
            return CompletionCode::SlotNotEnabledError;
        };
        let Some(dev_ctx) = self
            .device_slot_manager
            .get_device_context(u64::from(slot_id))
        else {
            return CompletionCode::TrbError;
        };

        match dev_ctx.ep_state(endpoint_id) {
            endpoint_state::STOPPED | endpoint_state::ERROR => {}
            state => {
                debug!("set tr dequeue: invalid endpoint state {state:#x}");
                return CompletionCode::ContextStateError;
            }
        }

        let Some(device) = &mut self.devices[port] else {
            return CompletionCode::SlotNotEnabledError;
        };
        let Some(ep) = &mut device.eps[endpoint_id as usize] else {
            return CompletionCode::EndpointNotEnabledError;
        };

        if dev_ctx.ep_max_pstreams(endpoint_id) > 0 {
            let code = Self::check_stream(&dev_ctx, endpoint_id, data.stream_id);
            if code != CompletionCode::Success {
                return code;
            }
            let Some(streams) = &mut ep.streams else {
                return CompletionCode::ContextStateError;
            };
            self.dma_bus.write_u64(
                streams.context_base + 16 * u64::from(data.stream_id),
                data.pointer_and_cycle,
            );
            if let Some(ring) = streams.rings.get_mut(data.stream_id as usize) {
                *ring = TrbRing::from_pointer_and_cycle(data.pointer_and_cycle);
            }
        } else {
            if data.stream_id != 0 {
                debug!(
                    "set tr dequeue: stream id {} on a stream-less endpoint",
                    data.stream_id
                );
            }
            ep.ring = TrbRing::from_pointer_and_cycle(data.pointer_and_cycle);
            dev_ctx.set_ep_tr_dequeue(endpoint_id, data.pointer_and_cycle & !0xF);
        }

        dev_ctx.set_ep_state(endpoint_id, endpoint_state::STOPPED);
        CompletionCode::Success
    }

    /// Validate a stream id against an endpoint context with streams.
    fn check_stream(dev_ctx: &DeviceContext, endpoint_id: u8, stream_id: u32) -> CompletionCode {
        let max_pstreams = dev_ctx.ep_max_pstreams(endpoint_id);
        if max_pstreams == 0 {
            return CompletionCode::TrbError;
        }
        if max_pstreams > MAX_STREAMS {
            return CompletionCode::InvalidStreamIdError;
        }
        if !dev_ctx.ep_lsa(endpoint_id) {
            warn!("no secondary stream support (LSA not set)");
            return CompletionCode::InvalidStreamIdError;
        }
        if stream_id == 0 || stream_id > max_pstreams {
            return CompletionCode::InvalidStreamTypeError;
        }
        CompletionCode::Success
    }

    fn cmd_reset_device(&mut self, slot_id: u8) -> CompletionCode {
        debug!("reset device on slot {slot_id}");

        let Some(port) = self.slot_to_port[slot_id as usize] else {
            return CompletionCode::SlotNotEnabledError;
        };
        let Some(device) = &mut self.devices[port] else {
            return CompletionCode::SlotNotEnabledError;
        };
        if device.slot_state == slot_state::DISABLED_ENABLED {
            return CompletionCode::SlotNotEnabledError;
        }

        device.slot_state = slot_state::DEFAULT;
        device.address = 0;
        for ep in device.eps[2..].iter_mut() {
            *ep = None;
        }

        let Some(dev_ctx) = self
            .device_slot_manager
            .get_device_context(u64::from(slot_id))
        else {
            return CompletionCode::SlotNotEnabledError;
        };
        dev_ctx.set_slot_state(slot_state::DEFAULT);
        dev_ctx.set_usb_device_address(0);
        dev_ctx.set_context_entries(1);
        for ep in 2..=31 {
            dev_ctx.set_ep_state(ep, endpoint_state::DISABLED);
        }

        CompletionCode::Success
    }

    // ------------------------------------------------------------------
    // Transfers

    fn device_doorbell(&mut self, slot: u32, endpoint_id: u32, stream_id: u32) {
        debug!("doorbell slot {slot} epid {endpoint_id} stream {stream_id}");

        if slot == 0
            || slot > MAX_SLOTS as u32
            || !self.device_slot_manager.is_reserved(u64::from(slot))
        {
            warn!("invalid doorbell slot {slot}");
            return;
        }
        if !(1..=31).contains(&endpoint_id) {
            warn!("invalid doorbell target {endpoint_id}");
            return;
        }

        let slot_id = slot as u8;
        let endpoint_id = endpoint_id as u8;
        let Some(port) = self.slot_to_port[slot as usize] else {
            return;
        };
        let Some(device) = &self.devices[port] else {
            return;
        };
        if device.eps[endpoint_id as usize].is_none() {
            warn!("doorbell for uninitialized endpoint {endpoint_id}");
            return;
        }
        let Some(dev_ctx) = self.device_slot_manager.get_device_context(u64::from(slot)) else {
            return;
        };
        if dev_ctx.ep_tr_dequeue(endpoint_id) == 0 {
            return;
        }

        self.handle_transfer(slot_id, endpoint_id, stream_id, &dev_ctx);
    }

    /// Write a ring cursor back into the endpoint (or stream) context.
    fn update_ep_ring(
        device: &mut EmulatedDevice,
        dev_ctx: &DeviceContext,
        dma_bus: &BusDeviceRef,
        endpoint_id: u8,
        streamid: u32,
        ring: TrbRing,
    ) {
        let Some(ep) = &mut device.eps[endpoint_id as usize] else {
            return;
        };
        ep.set_cursor(streamid, ring);
        match &ep.streams {
            Some(streams) => {
                dma_bus.write_u64(
                    streams.context_base + 16 * u64::from(streamid),
                    ring.to_pointer_and_cycle(),
                );
                let qw = dev_ctx.ep_tr_dequeue(endpoint_id);
                dev_ctx.set_ep_tr_dequeue(endpoint_id, (qw & !0x1) | ring.cycle_state as u64);
            }
            None => dev_ctx.set_ep_tr_dequeue(endpoint_id, ring.to_pointer_and_cycle()),
        }
    }

    fn handle_transfer(
        &mut self,
        slot_id: u8,
        endpoint_id: u8,
        streamid: u32,
        dev_ctx: &DeviceContext,
    ) {
        let Some(port) = self.slot_to_port[slot_id as usize] else {
            return;
        };
        let Some(mut device) = self.devices[port].take() else {
            return;
        };

        if dev_ctx.ep_max_pstreams(endpoint_id) > 0 {
            let code = Self::check_stream(dev_ctx, endpoint_id, streamid);
            if code != CompletionCode::Success {
                warn!("doorbell names an invalid stream id {streamid}");
                self.devices[port] = Some(device);
                return;
            }
        }

        loop {
            let fetched = self.fetch_transfer_trbs(&mut device, dev_ctx, endpoint_id, streamid);

            let pending = device.eps[endpoint_id as usize]
                .as_ref()
                .map_or(0, |ep| ep.xfer.len());
            if pending == 0 {
                break;
            }

            dev_ctx.set_ep_state(endpoint_id, endpoint_state::RUNNING);

            // Dispatch to the backend.
            let status = {
                let ep = device.eps[endpoint_id as usize].as_mut().unwrap();
                if endpoint_id == 1 {
                    device.backend.request(&mut ep.xfer)
                } else {
                    let dir = if endpoint_id & 1 != 0 {
                        Direction::In
                    } else {
                        Direction::Out
                    };
                    device.backend.data(&mut ep.xfer, dir, endpoint_id / 2)
                }
            };

            if status == Err(UsbError::Nak) {
                // Not yet; the transfer stays queued and is retried on
                // the next doorbell.
                trace!("backend NAKed, transfer stays queued");
                break;
            }

            let async_completion = device.backend.kind() == DeviceKind::PortMapper
                && status.is_ok()
                && device.eps[endpoint_id as usize].as_ref().is_some_and(|ep| {
                    ep.xfer
                        .peek_head()
                        .is_some_and(|b| b.processed == BlockState::Free)
                });
            if async_completion {
                // The port mapper completes through the notify path.
                break;
            }

            let code = self.xfer_complete(&mut device, slot_id, endpoint_id, status);

            if endpoint_id == 1 {
                if let Some(ep) = &mut device.eps[endpoint_id as usize] {
                    ep.xfer.reset();
                }
            }

            if code == CompletionCode::EventRingFullError {
                // The guest will retry once it advances ERDP.
                break;
            }

            if !fetched.reached_ioc {
                break;
            }
            debug!("retry: continuing with the next TRBs on the ring");
        }

        self.devices[port] = Some(device);
    }

    /// Walk the transfer ring and append blocks until an IOC boundary.
    fn fetch_transfer_trbs(
        &mut self,
        device: &mut EmulatedDevice,
        dev_ctx: &DeviceContext,
        endpoint_id: u8,
        streamid: u32,
    ) -> FetchResult {
        let mut result = FetchResult { reached_ioc: false };
        let mut setup_seen = false;

        loop {
            let Some(ep) = &device.eps[endpoint_id as usize] else {
                break;
            };
            let Some(mut cursor) = ep.cursor(streamid) else {
                break;
            };

            let raw = cursor.current_trb(&self.dma_bus);
            let variant = TransferTrbVariant::parse(raw.to_bytes());

            if !matches!(variant, TransferTrbVariant::Link(_)) && raw.cycle() != cursor.cycle_state
            {
                trace!("cycle bit mismatch, ring is drained");
                break;
            }

            let address = cursor.dequeue_pointer;
            let mut block = XferBlock {
                processed: BlockState::Free,
                buffer: BlockBuffer::None,
                requested: 0,
                done: 0,
                trb_addr: address,
                trbnext: 0,
                ccs: cursor.cycle_state,
                streamid,
            };
            let mut next = address.wrapping_add(TRB_SIZE as u64);
            let mut ioc = false;

            match variant {
                TransferTrbVariant::Link(link) => {
                    if link.toggle_cycle {
                        cursor.cycle_state = !cursor.cycle_state;
                    }
                    next = link.ring_segment_pointer;
                    block.processed = BlockState::Handled;
                }
                TransferTrbVariant::SetupStage(setup) => {
                    if !setup.immediate_data || setup.transfer_length != 8 {
                        warn!("invalid setup stage TRB");
                        break;
                    }
                    if let Some(ep) = &mut device.eps[endpoint_id as usize] {
                        ep.xfer.ureq = Some(DeviceRequest::from_raw(setup.request));
                    }
                    block.processed = BlockState::Handled;
                    ioc = setup.interrupt_on_completion;
                    setup_seen = true;
                }
                TransferTrbVariant::Normal(data) | TransferTrbVariant::Isoch(data) => {
                    if setup_seen {
                        warn!("normal TRB inside a control sequence");
                        break;
                    }
                    block.buffer = if data.immediate_data {
                        BlockBuffer::Immediate(data.data_pointer.to_le_bytes())
                    } else {
                        BlockBuffer::Guest(data.data_pointer)
                    };
                    block.requested = data.transfer_length;
                    ioc = data.interrupt_on_completion;
                }
                TransferTrbVariant::DataStage(data) => {
                    block.buffer = if data.immediate_data {
                        BlockBuffer::Immediate(data.data_pointer.to_le_bytes())
                    } else {
                        BlockBuffer::Guest(data.data_pointer)
                    };
                    block.requested = data.transfer_length;
                    ioc = data.interrupt_on_completion;
                }
                TransferTrbVariant::StatusStage {
                    interrupt_on_completion,
                } => {
                    ioc = interrupt_on_completion;
                }
                TransferTrbVariant::EventData(data) => {
                    block.processed = BlockState::Handled;
                    ioc = data.interrupt_on_completion;
                }
                TransferTrbVariant::NoOp {
                    interrupt_on_completion,
                } => {
                    block.processed = BlockState::Handled;
                    ioc = interrupt_on_completion;
                }
                TransferTrbVariant::Unrecognized(trb, error) => {
                    warn!("unexpected TRB on transfer ring ({error}): {trb:?}");
                    break;
                }
            }

            block.trbnext = next;
            cursor.dequeue_pointer = next;

            let Some(ep) = &mut device.eps[endpoint_id as usize] else {
                break;
            };
            if ep.xfer.append(block).is_err() {
                warn!("transfer queue full, stopping TRB fetch");
                break;
            }

            Self::update_ep_ring(device, dev_ctx, &self.dma_bus, endpoint_id, streamid, cursor);

            if ioc {
                trace!("TRB with IOC, closing the batch");
                result.reached_ioc = true;
                break;
            }
        }

        result
    }

    /// Drain completed transfer blocks: write cycle bits back into the
    /// guest TRBs and emit transfer events.
    fn xfer_complete(
        &mut self,
        device: &mut EmulatedDevice,
        slot_id: u8,
        endpoint_id: u8,
        status: Result<(), UsbError>,
    ) -> CompletionCode {
        let code = match status {
            Ok(()) => CompletionCode::Success,
            Err(error) => {
                if error == UsbError::Stalled {
                    // A stall halts the endpoint.
                    if let Some(dev_ctx) = self
                        .device_slot_manager
                        .get_device_context(u64::from(slot_id))
                    {
                        dev_ctx.set_ep_state(endpoint_id, endpoint_state::HALTED);
                    }
                }
                CompletionCode::from(error)
            }
        };

        let Some(ep) = device.eps[endpoint_id as usize].as_mut() else {
            return code;
        };

        let mut edtla: u32 = 0;
        let mut do_intr = false;
        let mut result = code;

        while let Some(head) = ep.xfer.peek_head() {
            if head.processed < BlockState::Handled {
                break;
            }
            let block = ep.xfer.pop_head().unwrap();
            edtla = edtla.wrapping_add(block.done);

            // Hand the TRB back to the driver by updating its cycle bit.
            let control = self.dma_bus.read_u32(block.trb_addr + 12);
            let control = (control & !0x1) | u32::from(block.ccs);
            self.dma_bus.write_u32(block.trb_addr + 12, control);

            let trb = Trb {
                parameter: self.dma_bus.read_u64(block.trb_addr),
                status: self.dma_bus.read_u32(block.trb_addr + 8),
                control,
            };

            let ioc = control & (1 << 5) != 0;
            let isp = control & (1 << 2) != 0;
            // Only interrupt on IOC or a short packet with ISP.
            if !ioc && !(code == CompletionCode::ShortPacket && isp) {
                continue;
            }

            let event = if trb.trb_type() == trb_types::EVENT_DATA {
                let event = EventTrb::new_transfer_event_trb(
                    trb.parameter,
                    edtla & 0xF_FFFF,
                    code,
                    true,
                    endpoint_id,
                    slot_id,
                );
                trace!("event data TRB with accumulated length {edtla}");
                edtla = 0;
                event
            } else {
                let residual = block.requested.saturating_sub(block.done);
                EventTrb::new_transfer_event_trb(
                    block.trb_addr,
                    residual,
                    code,
                    false,
                    endpoint_id,
                    slot_id,
                )
            };

            do_intr = true;
            let insert = self.event_ring.insert(&event);
            if insert.code != CompletionCode::Success {
                // Stop; the guest will retry once it advances ERDP.
                result = insert.code;
                break;
            }
        }

        if do_intr {
            self.assert_interrupt();
        }
        result
    }

    /// Completion entry point for asynchronous (port-mapped) backends.
    ///
    /// The worker reports per-TRB byte counts; blocks are matched by the
    /// guest address of their TRB.
    pub fn transfer_completed(
        &mut self,
        slot_id: u8,
        endpoint_id: u8,
        results: &[(u64, u32)],
        status: Result<(), UsbError>,
    ) {
        let Some(port) = self.slot_to_port[slot_id as usize] else {
            return;
        };
        let Some(mut device) = self.devices[port].take() else {
            return;
        };

        if let Some(ep) = device.eps[endpoint_id as usize].as_mut() {
            for block in ep.xfer.iter_mut() {
                if block.processed != BlockState::Free {
                    continue;
                }
                if let Some((_, done)) = results.iter().find(|(addr, _)| *addr == block.trb_addr) {
                    block.done = *done;
                    block.processed = BlockState::Done;
                }
            }
        }

        self.xfer_complete(&mut device, slot_id, endpoint_id, status);
        self.devices[port] = Some(device);
    }

    // ------------------------------------------------------------------
    // MMIO decoding

    fn capability_read(&self, reg: u64) -> u64 {
        match reg {
            offset::CAPLENGTH => capability::CAPLENGTH_HCIVERSION,
            offset::HCSPARAMS1 => capability::HCSPARAMS1,
            offset::HCSPARAMS2 => capability::HCSPARAMS2,
            offset::HCSPARAMS3 => capability::HCSPARAMS3,
            offset::HCCPARAMS1 => capability::HCCPARAMS1,
            offset::DBOFF => offset::DB_BASE,
            offset::RTSOFF => offset::RT_BASE,
            offset::HCCPARAMS2 => capability::HCCPARAMS2,
            _ => 0,
        }
    }

    const fn port_register(reg: u64) -> Option<(usize, u64)> {
        if reg < offset::PORTREGS_BASE {
            return None;
        }
        let rel = reg - offset::PORTREGS_BASE;
        let port = (rel / offset::PORT_STRIDE) as usize + 1;
        if port > MAX_PORTS as usize {
            return None;
        }
        Some((port, rel % offset::PORT_STRIDE))
    }

    fn operational_read(&self, reg: u64) -> u64 {
        if let Some((port, field)) = Self::port_register(reg) {
            let regs = &self.portsc[port];
            return match field {
                offset::PORTSC => regs.portsc(),
                offset::PORTPMSC => regs.portpmsc(),
                offset::PORTLI => regs.portli(),
                offset::PORTHLPMC => regs.porthlpmc(),
                _ => 0,
            };
        }

        match reg - offset::OP_BASE {
            offset::USBCMD => self.usbcmd,
            offset::USBSTS => self.usbsts,
            offset::PAGESIZE => capability::PAGESIZE,
            offset::DNCTL => self.dnctl,
            offset::CRCR_LO => self.command_ring.status(),
            offset::CRCR_HI => 0,
            offset::DCBAAP_LO => self.device_slot_manager.get_dcbaap() & 0xFFFF_FFFF,
            offset::DCBAAP_HI => self.device_slot_manager.get_dcbaap() >> 32,
            offset::CONFIG => self.config_reg,
            reg => {
                debug!("read of unknown operational register {reg:#x}");
                0
            }
        }
    }

    fn operational_write(&mut self, reg: u64, value: u64) {
        if let Some((port, field)) = Self::port_register(reg) {
            self.port_register_write(port, field, value);
            return;
        }

        match reg - offset::OP_BASE {
            offset::USBCMD => self.write_usbcmd(value),
            offset::USBSTS => self.write_usbsts(value),
            offset::DNCTL => self.dnctl = value & 0xFFFF,
            offset::CRCR_LO => self.command_ring.write_lo(value),
            offset::CRCR_HI => self.command_ring.write_hi(value),
            offset::DCBAAP_LO => {
                let dcbaap = self.device_slot_manager.get_dcbaap();
                self.device_slot_manager
                    .set_dcbaap((dcbaap & !0xFFFF_FFFF) | (value & 0xFFFF_FFC0));
            }
            offset::DCBAAP_HI => {
                let dcbaap = self.device_slot_manager.get_dcbaap();
                self.device_slot_manager
                    .set_dcbaap((dcbaap & 0xFFFF_FFFF) | (value << 32));
                debug!(
                    "device context base array at {:#x}",
                    self.device_slot_manager.get_dcbaap()
                );
            }
            offset::PAGESIZE => { /* read only */ }
            offset::CONFIG => self.config_reg = value & 0x3FF,
            reg => debug!("write to unknown operational register {reg:#x}"),
        }
    }

    fn port_register_write(&mut self, port: usize, field: u64, value: u64) {
        trace!("port {port} register {field:#x} write {value:#x}");
        match field {
            offset::PORTSC => {
                let connected = self.devices[port].is_some();
                match self.portsc[port].write_portsc(value, connected) {
                    PortscWriteEffect::ResetRequested { warm } => self.reset_port(port, warm),
                    PortscWriteEffect::ResumedToU0 => {
                        let code = self.insert_event(
                            EventTrb::new_port_status_change_event_trb(port as u8),
                            true,
                        );
                        if code != CompletionCode::Success {
                            warn!("fail to report the port {port} link transition");
                        }
                    }
                    PortscWriteEffect::Ignored => {
                        warn!("PORTSC write to unpowered port {port}");
                    }
                    PortscWriteEffect::None => {}
                }
            }
            offset::PORTPMSC => self.portsc[port].write_portpmsc(value),
            offset::PORTLI => debug!("attempted write to PORTLI, port {port}"),
            offset::PORTHLPMC => self.portsc[port].write_porthlpmc(value),
            _ => {}
        }
    }

    fn runtime_read(&mut self, reg: u64) -> u64 {
        match reg - offset::RT_BASE {
            offset::MFINDEX => self.mfindex(),
            offset::IMAN => self.event_ring.read_iman(),
            offset::IMOD => self.event_ring.read_imod(),
            offset::ERSTSZ => self.event_ring.read_erstsz(),
            offset::ERSTBA_LO => self.event_ring.read_erstba() & 0xFFFF_FFFF,
            offset::ERSTBA_HI => self.event_ring.read_erstba() >> 32,
            offset::ERDP_LO => self.event_ring.read_erdp() & 0xFFFF_FFFF,
            offset::ERDP_HI => self.event_ring.read_erdp() >> 32,
            reg => {
                debug!("read of unknown runtime register {reg:#x}");
                0
            }
        }
    }

    fn runtime_write(&mut self, reg: u64, value: u64) {
        match reg - offset::RT_BASE {
            offset::MFINDEX => warn!("attempted write to MFINDEX"),
            offset::IMAN => self.event_ring.write_iman(value),
            offset::IMOD => self.event_ring.write_imod(value),
            offset::ERSTSZ => self.event_ring.write_erstsz(value),
            offset::ERSTBA_LO => self.event_ring.write_erstba_lo(value),
            offset::ERSTBA_HI => self.event_ring.write_erstba_hi(value),
            offset::ERDP_LO => self.event_ring.write_erdp_lo(value),
            offset::ERDP_HI => self.event_ring.write_erdp_hi(value),
            reg => warn!("attempted write to runtime register {reg:#x}"),
        }
    }

    fn mmio_read(&mut self, req: Request) -> u64 {
        let reg = req.addr;
        let value = if reg < capability::CAPLENGTH {
            self.capability_read(reg)
        } else if reg < offset::DB_BASE {
            self.operational_read(reg)
        } else if reg < offset::RT_BASE {
            // read doorbell always returns 0
            0
        } else if reg < offset::EXCAP_BASE {
            self.runtime_read(reg)
        } else if reg < self.regs_end {
            self.excap.read(reg)
        } else {
            debug!("read of invalid offset {reg:#x}");
            0
        };
        req.size.mask(value)
    }

    fn mmio_write(&mut self, req: Request, value: u64) {
        let reg = req.addr;
        if reg < capability::CAPLENGTH {
            warn!("write to read-only capability register {reg:#x}");
        } else if reg < offset::DB_BASE {
            self.operational_write(reg, value);
        } else if reg < offset::RT_BASE {
            self.write_doorbell(reg - offset::DB_BASE, value);
        } else if reg < offset::EXCAP_BASE {
            self.runtime_write(reg, value);
        } else if reg < self.regs_end {
            if let Err(error) = self.excap.write(reg, value) {
                warn!("extended capability write at {reg:#x} failed: {error}");
            }
        } else {
            warn!("write to invalid offset {reg:#x}");
        }
    }
}

impl PciDevice for Mutex<XhciController> {
    fn write_cfg(&self, req: Request, value: u64) {
        self.lock().unwrap().config_space.write(req, value);
    }

    fn read_cfg(&self, req: Request) -> u64 {
        self.lock().unwrap().config_space.read(req)
    }

    fn write_io(&self, region: u32, req: Request, value: u64) {
        // The XHCI Controller has a single MMIO BAR.
        assert_eq!(region, 0);
        self.lock().unwrap().mmio_write(req, value);
    }

    fn read_io(&self, region: u32, req: Request) -> u64 {
        assert_eq!(region, 0);
        self.lock().unwrap().mmio_read(req)
    }

    fn bar(&self, bar_no: u8) -> Option<BarInfo> {
        self.lock().unwrap().config_space.bar(bar_no)
    }
}
