#![allow(dead_code)]

//! Shared plumbing for the controller integration tests: an in-memory
//! guest, MMIO helpers, ring builders, and a scriptable device backend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use vxhcid::cli::XhciConfig;
use vxhcid::device::bus::{
    testutils::TestBusDevice, BusDevice, BusDeviceRef, GuestAccess, Request, RequestSize,
};
use vxhcid::device::interrupt_line::DummyInterruptLine;
use vxhcid::device::pci::backend::{
    BackendInfo, DeviceKind, Direction, NativeDeviceSource, Speed, UsbBackend, UsbError,
};
use vxhcid::device::pci::constants::xhci::offset;
use vxhcid::device::pci::ports::{DeviceInfo, DevicePath, NativeDeviceType};
use vxhcid::device::pci::traits::PciDevice;
use vxhcid::device::pci::trb::{trb_types, Trb};
use vxhcid::device::pci::xfer::{BlockState, XferQueue};
use vxhcid::device::pci::xhci::XhciController;

pub const GUEST_MEMORY_SIZE: usize = 0x10_0000;

/// Fixed guest-memory layout used by the tests.
pub const ERST_ADDR: u64 = 0x1000;
pub const EVENT_RING_ADDR: u64 = 0x2000;
pub const CMD_RING_ADDR: u64 = 0x4000;
pub const DCBAA_ADDR: u64 = 0x6000;
pub const DEV_CTX_ADDR: u64 = 0x7000;
pub const INPUT_CTX_ADDR: u64 = 0x8000;
pub const XFER_RING_ADDR: u64 = 0xA000;
pub const DATA_BUFFER_ADDR: u64 = 0x2_0000;

pub const TRB_CYCLE: u32 = 1 << 0;
pub const TRB_TC: u32 = 1 << 1;
pub const TRB_ISP: u32 = 1 << 2;
pub const TRB_IOC: u32 = 1 << 5;
pub const TRB_IDT: u32 = 1 << 6;

pub const USBCMD_RS: u64 = 1 << 0;
pub const USBCMD_HCRST: u64 = 1 << 1;
pub const USBCMD_INTE: u64 = 1 << 2;
pub const USBCMD_CSS: u64 = 1 << 8;
pub const USBSTS_HCH: u64 = 1 << 0;
pub const IMAN_IE: u64 = 1 << 1;
pub const IMAN_IP: u64 = 1 << 0;

pub const PORTSC_CCS: u64 = 1 << 0;
pub const PORTSC_PED: u64 = 1 << 1;
pub const PORTSC_PR: u64 = 1 << 4;
pub const PORTSC_PP: u64 = 1 << 9;
pub const PORTSC_CSC: u64 = 1 << 17;
pub const PORTSC_PRC: u64 = 1 << 21;
pub const PLS_RX_DETECT: u64 = 5;

pub const USB2_FIRST_PORT: usize = 11;
pub const USB3_FIRST_PORT: usize = 1;

/// A controller under test with its guest memory and interrupt counter.
pub struct TestXhci {
    pub mem: Arc<TestBusDevice>,
    pub controller: Arc<Mutex<XhciController>>,
    pub irq: Arc<DummyInterruptLine>,
    /// Consumer-side cursor of the event ring.
    event_deq: u32,
    event_cycle: bool,
    event_ring_size: u32,
    /// Producer-side cursor of the command ring.
    cmd_enq: u64,
    cmd_cycle: bool,
}

impl TestXhci {
    pub fn new(config: &str) -> Self {
        let mem: Arc<TestBusDevice> = Arc::new(TestBusDevice::zeroed(GUEST_MEMORY_SIZE));
        let dma_bus: BusDeviceRef = mem.clone();
        let config = XhciConfig::parse(config).expect("invalid test configuration");
        let controller = Arc::new(Mutex::new(XhciController::new(&config, dma_bus)));
        let irq = Arc::new(DummyInterruptLine::default());
        {
            let mut guard = controller.lock().unwrap();
            guard.connect_irq(irq.clone());
            guard.connect_self(Arc::downgrade(&controller));
        }
        Self {
            mem,
            controller,
            irq,
            event_deq: 0,
            event_cycle: true,
            event_ring_size: 0,
            cmd_enq: CMD_RING_ADDR,
            cmd_cycle: true,
        }
    }

    pub fn weak(&self) -> Weak<Mutex<XhciController>> {
        Arc::downgrade(&self.controller)
    }

    pub fn read32(&self, reg: u64) -> u32 {
        self.controller
            .read_io(0, Request::new(reg, RequestSize::Size4)) as u32
    }

    pub fn write32(&self, reg: u64, value: u32) {
        self.controller
            .write_io(0, Request::new(reg, RequestSize::Size4), u64::from(value));
    }

    pub fn op_read(&self, reg: u64) -> u32 {
        self.read32(offset::OP_BASE + reg)
    }

    pub fn op_write(&self, reg: u64, value: u32) {
        self.write32(offset::OP_BASE + reg, value);
    }

    pub fn rt_write(&self, reg: u64, value: u32) {
        self.write32(offset::RT_BASE + reg, value);
    }

    pub fn rt_read(&self, reg: u64) -> u32 {
        self.read32(offset::RT_BASE + reg)
    }

    pub fn portsc_addr(port: usize) -> u64 {
        offset::PORTREGS_BASE + (port as u64 - 1) * offset::PORT_STRIDE
    }

    pub fn read_portsc(&self, port: usize) -> u32 {
        self.read32(Self::portsc_addr(port))
    }

    pub fn write_portsc(&self, port: usize, value: u32) {
        self.write32(Self::portsc_addr(port), value);
    }

    /// Program a single-segment event ring of `size` TRBs.
    pub fn setup_event_ring(&mut self, size: u32) {
        self.mem.write_u64(ERST_ADDR, EVENT_RING_ADDR);
        self.mem.write_u32(ERST_ADDR + 8, size);

        self.rt_write(offset::ERSTSZ, 1);
        self.rt_write(offset::ERSTBA_LO, ERST_ADDR as u32);
        self.rt_write(offset::ERSTBA_HI, 0);
        self.rt_write(offset::ERDP_LO, EVENT_RING_ADDR as u32);
        self.rt_write(offset::ERDP_HI, 0);
        self.rt_write(offset::IMAN, IMAN_IE as u32);

        self.event_deq = 0;
        self.event_cycle = true;
        self.event_ring_size = size;
    }

    /// Program the command ring dequeue pointer.
    pub fn setup_command_ring(&mut self) {
        self.op_write(offset::CRCR_LO, CMD_RING_ADDR as u32 | 1);
        self.op_write(offset::CRCR_HI, 0);
        self.cmd_enq = CMD_RING_ADDR;
        self.cmd_cycle = true;
    }

    pub fn set_dcbaap(&self) {
        self.op_write(offset::DCBAAP_LO, DCBAA_ADDR as u32);
        self.op_write(offset::DCBAAP_HI, 0);
    }

    /// Start the controller with interrupts enabled.
    pub fn run(&self) {
        self.op_write(offset::USBCMD, (USBCMD_RS | USBCMD_INTE) as u32);
    }

    /// Standard bring-up: event ring, command ring, DCBAA, run.
    pub fn bring_up(&mut self) {
        self.setup_event_ring(32);
        self.setup_command_ring();
        self.set_dcbaap();
        self.run();
    }

    pub fn mem_write_u32(&self, addr: u64, value: u32) {
        self.mem.write_u32(addr, value);
    }

    pub fn read_mem(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.mem.read_bulk(addr, &mut data);
        data
    }

    pub fn mem_write_u64(&self, addr: u64, value: u64) {
        self.mem.write_u64(addr, value);
    }

    pub fn write_trb(&self, addr: u64, trb: Trb) {
        self.mem.write_bulk(addr, &trb.to_bytes());
    }

    pub fn read_trb(&self, addr: u64) -> Trb {
        let mut buf = [0u8; 16];
        self.mem.read_bulk(addr, &mut buf);
        Trb::from_bytes(buf)
    }

    /// Place a command on the command ring and ring doorbell 0.
    pub fn push_command(&mut self, mut trb: Trb) {
        trb.control = (trb.control & !TRB_CYCLE) | u32::from(self.cmd_cycle);
        self.write_trb(self.cmd_enq, trb);
        self.cmd_enq += 16;
        self.write32(offset::DB_BASE, 0);
    }

    /// Write a Link TRB with toggle-cycle back to the ring start.
    pub fn push_link_back_to_ring_start(&mut self) {
        let trb = Trb {
            parameter: CMD_RING_ADDR,
            status: 0,
            control: (u32::from(trb_types::LINK) << 10) | TRB_TC | u32::from(self.cmd_cycle),
        };
        self.write_trb(self.cmd_enq, trb);
        self.cmd_enq = CMD_RING_ADDR;
        self.cmd_cycle = !self.cmd_cycle;
    }

    /// Pop the next event the controller produced, advancing ERDP.
    pub fn next_event(&mut self) -> Option<Trb> {
        let addr = EVENT_RING_ADDR + u64::from(self.event_deq) * 16;
        let trb = self.read_trb(addr);
        if trb.cycle() != self.event_cycle {
            return None;
        }
        self.event_deq += 1;
        if self.event_deq == self.event_ring_size {
            self.event_deq = 0;
            self.event_cycle = !self.event_cycle;
        }
        let erdp = EVENT_RING_ADDR + u64::from(self.event_deq) * 16;
        // acknowledge with EHB
        self.rt_write(offset::ERDP_LO, erdp as u32 | 0x8);
        self.rt_write(offset::ERDP_HI, 0);
        Some(trb)
    }

    /// Drain events until one of the wanted type shows up.
    pub fn expect_event(&mut self, trb_type: u8) -> Trb {
        while let Some(event) = self.next_event() {
            if event.trb_type() == trb_type {
                return event;
            }
        }
        panic!("no event of type {trb_type} on the event ring");
    }

    /// Enable a slot through the command interface, returning the id.
    pub fn enable_slot(&mut self) -> u8 {
        self.push_command(Trb {
            parameter: 0,
            status: 0,
            control: u32::from(trb_types::ENABLE_SLOT) << 10,
        });
        let event = self.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
        assert_eq!(event.status >> 24, 1, "enable slot should succeed");
        event.slot_id()
    }

    /// Prepare DCBAA entry and an input context for Address Device.
    pub fn prepare_address_contexts(&self, slot: u8, rh_port: u8) {
        self.mem
            .write_u64(DCBAA_ADDR + 8 * u64::from(slot), DEV_CTX_ADDR);
        // input control context: drop nothing, add slot+ep0
        self.mem.write_u32(INPUT_CTX_ADDR, 0);
        self.mem.write_u32(INPUT_CTX_ADDR + 4, 0x3);
        // slot context: root hub port
        self.mem
            .write_u32(INPUT_CTX_ADDR + 32 + 4, u32::from(rh_port) << 16);
        // ep0 context: control endpoint, max packet 64, ring with DCS=1
        self.mem.write_u32(INPUT_CTX_ADDR + 64 + 4, (4 << 3) | (64 << 16));
        self.mem.write_u64(INPUT_CTX_ADDR + 64 + 8, XFER_RING_ADDR | 1);
    }

    pub fn address_device(&mut self, slot: u8, rh_port: u8) -> Trb {
        self.prepare_address_contexts(slot, rh_port);
        self.push_command(Trb {
            parameter: INPUT_CTX_ADDR,
            status: 0,
            control: (u32::from(trb_types::ADDRESS_DEVICE) << 10) | (u32::from(slot) << 24),
        });
        self.expect_event(trb_types::COMMAND_COMPLETION_EVENT)
    }

    /// Configure one additional endpoint with the given context type.
    pub fn configure_endpoint(&mut self, slot: u8, epid: u8, ep_type: u32, ring: u64) -> Trb {
        self.mem.write_u32(INPUT_CTX_ADDR, 0);
        self.mem.write_u32(INPUT_CTX_ADDR + 4, 1 << epid);
        let ep_off = INPUT_CTX_ADDR + 32 * (1 + u64::from(epid));
        self.mem.write_u32(ep_off + 4, (ep_type << 3) | (512 << 16));
        self.mem.write_u64(ep_off + 8, ring | 1);

        self.push_command(Trb {
            parameter: INPUT_CTX_ADDR,
            status: 0,
            control: (u32::from(trb_types::CONFIGURE_ENDPOINT) << 10) | (u32::from(slot) << 24),
        });
        self.expect_event(trb_types::COMMAND_COMPLETION_EVENT)
    }

    pub fn ring_doorbell(&self, slot: u8, target: u32) {
        self.write32(offset::DB_BASE + 4 * u64::from(slot), target);
    }

    /// Read a dword of the output device context.
    pub fn dev_ctx_dword(&self, index: u64) -> u32 {
        self.mem.read_u32(DEV_CTX_ADDR + 4 * index)
    }

    pub fn ep_ctx_dword(&self, epid: u8, index: u64) -> u32 {
        self.mem.read_u32(DEV_CTX_ADDR + 32 * u64::from(epid) + 4 * index)
    }
}

// ----------------------------------------------------------------------
// A scriptable emulated backend.

/// What the scripted backend does on the next data call.
#[derive(Debug, Clone)]
pub enum ScriptedAction {
    /// Fill every free IN block with this repeating byte.
    Fill(u8),
    /// Deliver only this many bytes into the first free block.
    Short(usize),
    Stall,
    Nak,
}

#[derive(Debug, Default)]
pub struct ScriptedState {
    pub actions: VecDeque<ScriptedAction>,
    pub data_calls: Vec<(Direction, u8)>,
    pub reset_count: usize,
}

#[derive(Debug, Clone)]
pub struct ScriptedHandle(pub Arc<Mutex<ScriptedState>>);

impl ScriptedHandle {
    pub fn push(&self, action: ScriptedAction) {
        self.0.lock().unwrap().actions.push_back(action);
    }

    pub fn data_calls(&self) -> Vec<(Direction, u8)> {
        self.0.lock().unwrap().data_calls.clone()
    }
}

#[derive(Debug)]
pub struct ScriptedBackend {
    dma_bus: BusDeviceRef,
    state: Arc<Mutex<ScriptedState>>,
    speed: Speed,
}

impl UsbBackend for ScriptedBackend {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Emulated
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            usb_version: if self.speed.is_usb2_speed() { 0x200 } else { 0x300 },
            speed: self.speed,
        }
    }

    fn reset(&mut self) -> Result<(), UsbError> {
        self.state.lock().unwrap().reset_count += 1;
        Ok(())
    }

    fn request(&mut self, xfer: &mut XferQueue) -> Result<(), UsbError> {
        for block in xfer.iter_mut() {
            if block.processed == BlockState::Free {
                block.processed = BlockState::Done;
            }
        }
        Ok(())
    }

    fn data(&mut self, xfer: &mut XferQueue, dir: Direction, epidx: u8) -> Result<(), UsbError> {
        let mut state = self.state.lock().unwrap();
        state.data_calls.push((dir, epidx));
        let action = state
            .actions
            .pop_front()
            .unwrap_or(ScriptedAction::Fill(0xAB));
        drop(state);

        match action {
            ScriptedAction::Nak => Err(UsbError::Nak),
            ScriptedAction::Stall => {
                for block in xfer.iter_mut() {
                    if block.processed == BlockState::Free {
                        block.processed = BlockState::Done;
                    }
                }
                Err(UsbError::Stalled)
            }
            ScriptedAction::Fill(byte) => {
                for block in xfer.iter_mut() {
                    if block.processed != BlockState::Free {
                        continue;
                    }
                    if dir == Direction::In {
                        let data = vec![byte; block.requested as usize];
                        block.done = block.write_data(self.dma_bus.as_ref(), &data) as u32;
                    } else {
                        block.done = block.requested;
                    }
                    block.processed = BlockState::Done;
                }
                Ok(())
            }
            ScriptedAction::Short(len) => {
                let mut delivered = false;
                for block in xfer.iter_mut() {
                    if block.processed != BlockState::Free {
                        continue;
                    }
                    if !delivered {
                        let data = vec![0x5A; len];
                        block.done = block.write_data(self.dma_bus.as_ref(), &data) as u32;
                        delivered = true;
                    }
                    block.processed = BlockState::Done;
                }
                Err(UsbError::ShortTransfer)
            }
        }
    }
}

#[derive(Debug)]
pub struct ScriptedSource {
    state: Arc<Mutex<ScriptedState>>,
    speed: Speed,
}

impl ScriptedSource {
    pub fn new(speed: Speed) -> (Self, ScriptedHandle) {
        let state = Arc::new(Mutex::new(ScriptedState::default()));
        (
            Self {
                state: state.clone(),
                speed,
            },
            ScriptedHandle(state),
        )
    }
}

impl NativeDeviceSource for ScriptedSource {
    fn create_backend(
        &self,
        dma_bus: BusDeviceRef,
        _slot_id: u8,
    ) -> Result<Box<dyn UsbBackend>, UsbError> {
        Ok(Box::new(ScriptedBackend {
            dma_bus,
            state: self.state.clone(),
            speed: self.speed,
        }))
    }
}

/// Identity for a scripted USB3 device on the given host bus-port.
pub fn scripted_device_info(bus: u8, port: u8, speed: Speed) -> DeviceInfo {
    DeviceInfo {
        path: DevicePath::new(bus, &[port]),
        vendor_id: 0x1d6b,
        product_id: 0x0003,
        bcd_usb: if speed.is_usb2_speed() { 0x210 } else { 0x300 },
        speed,
        device_type: NativeDeviceType::Device,
    }
}
