//! Controller bring-up through the MMIO surface: capability registers,
//! reset behavior, event ring programming, and PORTSC access rules.

use vxhcid::device::bus::{Request, RequestSize};
use vxhcid::device::pci::constants::xhci::{offset, MAX_PORTS, MAX_SLOTS};
use vxhcid::device::pci::traits::PciDevice;
use vxhcid::device::pci::trb::{trb_types, CompletionCode, EventTrb};

mod util;
use util::*;

#[test]
fn capability_registers_describe_the_controller() {
    let xhci = TestXhci::new("");

    let caplength = xhci.read32(offset::CAPLENGTH);
    assert_eq!(caplength & 0xFF, offset::OP_BASE as u32);
    assert_eq!(caplength >> 16, 0x0100, "HCIVERSION 1.0");

    let hcsparams1 = xhci.read32(offset::HCSPARAMS1);
    assert_eq!(hcsparams1 & 0xFF, MAX_SLOTS as u32);
    assert_eq!(hcsparams1 >> 24, MAX_PORTS as u32);

    assert_eq!(xhci.read32(offset::DBOFF), offset::DB_BASE as u32);
    assert_eq!(xhci.read32(offset::RTSOFF), offset::RT_BASE as u32);

    // PAGESIZE advertises 4k pages.
    assert_eq!(xhci.op_read(offset::PAGESIZE), 1);
}

#[test]
fn mmio_reads_mask_to_access_size() {
    let xhci = TestXhci::new("");
    let full = xhci.read32(offset::CAPLENGTH);
    let byte = xhci
        .controller
        .read_io(0, Request::new(offset::CAPLENGTH, RequestSize::Size1));
    let word = xhci
        .controller
        .read_io(0, Request::new(offset::CAPLENGTH, RequestSize::Size2));
    assert_eq!(byte, u64::from(full & 0xFF));
    assert_eq!(word, u64::from(full & 0xFFFF));
}

#[test]
fn reads_and_writes_outside_the_register_file_are_ignored() {
    let xhci = TestXhci::new("");
    // far beyond the extended capabilities
    assert_eq!(xhci.read32(0x9000), 0);
    xhci.write32(0x9000, 0xFFFF_FFFF);
    // writes to the read-only capability region are dropped
    xhci.write32(offset::HCSPARAMS1, 0);
    assert_ne!(xhci.read32(offset::HCSPARAMS1), 0);
}

#[test]
fn controller_reset_clears_ring_state_and_halts() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    assert_eq!(xhci.op_read(offset::USBSTS) as u64 & USBSTS_HCH, 0);

    // S1: HCRST alone also stops the controller.
    xhci.op_write(offset::USBCMD, USBCMD_HCRST as u32);

    let sts = u64::from(xhci.op_read(offset::USBSTS));
    assert_ne!(sts & USBSTS_HCH, 0, "HCH set after reset");

    // The producer starts over at index 0 with PCS=1: re-program the
    // ring and check that the first event lands at the segment base
    // with the cycle bit set.
    xhci.setup_event_ring(4);
    xhci.bring_up();
    let tablet_port = USB2_FIRST_PORT;
    xhci.write_portsc(tablet_port, (PORTSC_PP | PORTSC_PR) as u32);

    let event = xhci.expect_event(trb_types::PORT_STATUS_CHANGE_EVENT);
    assert!(event.cycle(), "event PCS restarts at 1");
}

#[test]
fn event_ring_bring_up_and_overflow() {
    // S2: a single-segment ring with three TRB slots. Port status change
    // events are produced by hot-plug attach of scripted devices on
    // assigned ports.
    let mut xhci = TestXhci::new("1-1,1-2,1-3");
    xhci.setup_event_ring(3);
    xhci.run();

    for port in 1..=3u8 {
        let (source, _handle) = ScriptedSource::new(vxhcid::device::pci::backend::Speed::Super);
        let info = scripted_device_info(1, port, vxhcid::device::pci::backend::Speed::Super);
        let result = xhci
            .controller
            .lock()
            .unwrap()
            .device_connected(info, Some(Box::new(source)));
        result.unwrap();
    }

    // Two events fit; their cycle bits are set.
    let first = xhci.read_trb(EVENT_RING_ADDR);
    let second = xhci.read_trb(EVENT_RING_ADDR + 16);
    assert_eq!(first.trb_type(), trb_types::PORT_STATUS_CHANGE_EVENT);
    assert_eq!(second.trb_type(), trb_types::PORT_STATUS_CHANGE_EVENT);
    assert!(first.cycle());
    assert!(second.cycle());

    // The third insert filled the ring: the final slot carries the
    // synthetic host-controller event with the ring-full code.
    let last = xhci.read_trb(EVENT_RING_ADDR + 32);
    assert_eq!(last.trb_type(), trb_types::HOST_CONTROLLER_EVENT);
    assert_eq!(
        last.status >> 24,
        CompletionCode::EventRingFullError as u32
    );
}

#[test]
fn event_insertion_raises_interrupts_and_sets_busy_bits() {
    let mut xhci = TestXhci::new("tablet");
    xhci.setup_event_ring(8);
    xhci.run();

    let before = xhci.irq.assert_count();
    // A port reset posts a port status change event.
    xhci.write_portsc(USB2_FIRST_PORT, (PORTSC_PP | PORTSC_PR) as u32);
    assert!(xhci.irq.assert_count() > before);

    // ERDP busy and IMAN pending are latched until acknowledged.
    assert_ne!(xhci.rt_read(offset::ERDP_LO) & 0x8, 0, "EHB latched");
    assert_ne!(xhci.rt_read(offset::IMAN) as u64 & IMAN_IP, 0);

    let event = xhci.expect_event(trb_types::PORT_STATUS_CHANGE_EVENT);
    assert_eq!(event.parameter >> 24, USB2_FIRST_PORT as u64);

    // next_event acknowledged via ERDP.EHB; both latches clear.
    assert_eq!(xhci.rt_read(offset::ERDP_LO) & 0x8, 0);
    assert_eq!(xhci.rt_read(offset::IMAN) as u64 & IMAN_IP, 0);
}

#[test]
fn usbsts_event_interrupt_bit_is_write_one_to_clear() {
    let mut xhci = TestXhci::new("tablet");
    xhci.setup_event_ring(8);
    xhci.run();
    xhci.write_portsc(USB2_FIRST_PORT, (PORTSC_PP | PORTSC_PR) as u32);

    let eint = 1 << 3;
    assert_ne!(xhci.op_read(offset::USBSTS) & eint, 0);
    xhci.op_write(offset::USBSTS, eint);
    assert_eq!(xhci.op_read(offset::USBSTS) & eint, 0);
}

#[test]
fn ports_come_up_powered_in_rx_detect() {
    let xhci = TestXhci::new("");
    for port in 1..=MAX_PORTS as usize {
        let portsc = u64::from(xhci.read_portsc(port));
        assert_ne!(portsc & PORTSC_PP, 0, "port {port} powered");
        assert_eq!((portsc >> 5) & 0xF, PLS_RX_DETECT, "port {port} in RxDetect");
        assert_eq!(portsc & PORTSC_CCS, 0, "port {port} empty");
    }
}

#[test]
fn tablet_port_reports_a_connected_device() {
    let xhci = TestXhci::new("tablet");
    let portsc = u64::from(xhci.read_portsc(USB2_FIRST_PORT));
    assert_ne!(portsc & PORTSC_CCS, 0);
    assert_ne!(portsc & PORTSC_CSC, 0);

    // write-1-to-clear on the connect-status-change bit
    xhci.write_portsc(USB2_FIRST_PORT, (PORTSC_PP | PORTSC_CSC) as u32);
    let portsc = u64::from(xhci.read_portsc(USB2_FIRST_PORT));
    assert_eq!(portsc & PORTSC_CSC, 0);
    assert_ne!(portsc & PORTSC_CCS, 0, "CCS stays while connected");
}

#[test]
fn port_reset_enables_the_port_and_latches_prc() {
    let mut xhci = TestXhci::new("tablet");
    xhci.setup_event_ring(8);
    xhci.run();

    xhci.write_portsc(USB2_FIRST_PORT, (PORTSC_PP | PORTSC_PR) as u32);
    let portsc = u64::from(xhci.read_portsc(USB2_FIRST_PORT));
    assert_ne!(portsc & PORTSC_PED, 0, "port enabled after reset");
    assert_ne!(portsc & PORTSC_PRC, 0, "port reset change latched");
    assert_eq!(portsc & PORTSC_PR, 0, "reset completed immediately");

    let event = xhci.expect_event(trb_types::PORT_STATUS_CHANGE_EVENT);
    assert_eq!(event.parameter >> 24, USB2_FIRST_PORT as u64);
}

#[test]
fn mfindex_is_monotonic() {
    let xhci = TestXhci::new("");
    let first = xhci.rt_read(offset::MFINDEX);
    std::thread::sleep(std::time::Duration::from_millis(2));
    let second = xhci.rt_read(offset::MFINDEX);
    assert!(second >= first);
    assert!(second > 0, "counter advances at 125us granularity");
}

#[test]
fn doorbells_are_ignored_while_halted() {
    let mut xhci = TestXhci::new("tablet");
    xhci.setup_event_ring(8);
    xhci.setup_command_ring();
    // controller not running: HCH is set
    xhci.push_command(vxhcid::device::pci::trb::Trb {
        parameter: 0,
        status: 0,
        control: u32::from(trb_types::ENABLE_SLOT) << 10,
    });
    assert!(
        xhci.next_event().is_none(),
        "no command processing while halted"
    );
}

#[test]
fn dropped_events_before_ring_configuration_do_not_crash() {
    let xhci = TestXhci::new("tablet");
    // run without an event ring; a port reset tries to post an event
    xhci.op_write(offset::USBCMD, (USBCMD_RS | USBCMD_INTE) as u32);
    xhci.write_portsc(USB2_FIRST_PORT, (PORTSC_PP | PORTSC_PR) as u32);
    // nothing to assert beyond "no panic"; the event was dropped
    let _ = EventTrb::new_ring_full_event_trb();
}
