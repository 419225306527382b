//! Transfer-ring coverage: normal transfers, event-data accumulation,
//! short packets, stalls, and the NAK retry path.

use vxhcid::device::pci::backend::{Direction, Speed};
use vxhcid::device::pci::device_slots::{endpoint_state, endpoint_type};
use vxhcid::device::pci::tablet::TabletReport;
use vxhcid::device::pci::trb::{trb_types, CompletionCode, Trb};

mod util;
use util::*;

const EP_RING: u64 = XFER_RING_ADDR + 0x1000;

/// Bring up a controller with a scripted super-speed device addressed on
/// the first USB3 port, bulk-IN endpoint 3 configured.
fn scripted_setup(config: &str) -> (TestXhci, ScriptedHandle, u8) {
    let mut xhci = TestXhci::new(config);
    xhci.bring_up();

    let (source, handle) = ScriptedSource::new(Speed::Super);
    let info = scripted_device_info(1, 4, Speed::Super);
    xhci.controller
        .lock()
        .unwrap()
        .device_connected(info, Some(Box::new(source)))
        .unwrap();

    let slot = xhci.enable_slot();
    let event = xhci.address_device(slot, USB3_FIRST_PORT as u8);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);

    let event = xhci.configure_endpoint(slot, 3, endpoint_type::BULK_IN, EP_RING);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    (xhci, handle, slot)
}

fn normal_trb(buffer: u64, length: u32, flags: u32) -> Trb {
    Trb {
        parameter: buffer,
        status: length & 0x1_FFFF,
        control: (u32::from(trb_types::NORMAL) << 10) | flags | TRB_CYCLE,
    }
}

#[test]
fn bulk_in_transfer_completes_with_event() {
    // S4: one Normal TRB of 64 bytes with IOC; the backend fills it.
    let (mut xhci, handle, slot) = scripted_setup("1-4");

    handle.push(ScriptedAction::Fill(0x7E));
    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 64, TRB_IOC));
    xhci.ring_doorbell(slot, 3);

    assert_eq!(
        handle.data_calls(),
        vec![(Direction::In, 1)],
        "bulk-IN endpoint 3 dispatches as data(IN, 1)"
    );

    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(event.status & 0xFF_FFFF, 0, "no residual");
    assert_eq!(event.slot_id(), slot);
    assert_eq!(event.endpoint_id(), 3);
    assert_eq!(event.parameter, EP_RING, "event points at the TRB");

    // The data landed in the guest buffer.
    let data = xhci.read_mem(DATA_BUFFER_ADDR, 64);
    assert!(data.iter().all(|&b| b == 0x7E));

    // The in-guest TRB's cycle bit matches the consumer cycle state at
    // fetch time.
    let trb = xhci.read_trb(EP_RING);
    assert_eq!(trb.control & TRB_CYCLE, 1);
}

#[test]
fn event_data_trb_accumulates_transfer_length() {
    // S5: two Normal TRBs (32 + 16 bytes, no IOC) followed by an Event
    // Data TRB with IOC.
    let (mut xhci, handle, slot) = scripted_setup("1-4");
    handle.push(ScriptedAction::Fill(0x11));

    let payload = 0xDEAD_BEEF_CAFE_0001u64;
    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 32, 0));
    xhci.write_trb(EP_RING + 16, normal_trb(DATA_BUFFER_ADDR + 32, 16, 0));
    xhci.write_trb(
        EP_RING + 32,
        Trb {
            parameter: payload,
            status: 0,
            control: (u32::from(trb_types::EVENT_DATA) << 10) | TRB_IOC | TRB_CYCLE,
        },
    );
    xhci.ring_doorbell(slot, 3);

    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(event.status & 0xFF_FFFF, 48, "EDTLA covers both TRBs");
    assert_ne!(event.control & (1 << 2), 0, "ED flag set");
    assert_eq!(event.parameter, payload, "driver payload surfaced");
    assert_eq!(event.slot_id(), slot);

    // exactly one transfer event
    assert!(xhci.next_event().is_none());
}

#[test]
fn short_transfer_reports_residual_with_isp() {
    let (mut xhci, handle, slot) = scripted_setup("1-4");
    handle.push(ScriptedAction::Short(40));

    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 64, TRB_IOC | TRB_ISP));
    xhci.ring_doorbell(slot, 3);

    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::ShortPacket as u32);
    assert_eq!(event.status & 0xFF_FFFF, 24, "residual = requested - done");
}

#[test]
fn stall_halts_the_endpoint_and_reset_endpoint_recovers() {
    let (mut xhci, handle, slot) = scripted_setup("1-4");
    handle.push(ScriptedAction::Stall);

    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 8, TRB_IOC));
    xhci.ring_doorbell(slot, 3);

    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::StallError as u32);
    assert_eq!(
        xhci.ep_ctx_dword(3, 0) & 0x7,
        endpoint_state::HALTED,
        "stall moves the endpoint to HALTED"
    );

    // Reset Endpoint requires the halted state and leaves it stopped.
    xhci.push_command(Trb {
        parameter: 0,
        status: 0,
        control: (u32::from(trb_types::RESET_ENDPOINT) << 10)
            | (3 << 16)
            | (u32::from(slot) << 24),
    });
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(xhci.ep_ctx_dword(3, 0) & 0x7, endpoint_state::STOPPED);

    // A second Reset Endpoint now fails the context-state check.
    xhci.push_command(Trb {
        parameter: 0,
        status: 0,
        control: (u32::from(trb_types::RESET_ENDPOINT) << 10)
            | (3 << 16)
            | (u32::from(slot) << 24),
    });
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::ContextStateError as u32);
}

#[test]
fn nak_keeps_the_transfer_queued_until_the_next_doorbell() {
    let (mut xhci, handle, slot) = scripted_setup("1-4");
    handle.push(ScriptedAction::Nak);
    handle.push(ScriptedAction::Fill(0x42));

    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 16, TRB_IOC));
    xhci.ring_doorbell(slot, 3);

    // NAK: nothing completed yet
    assert!(xhci.next_event().is_none());

    // The retry on the next doorbell succeeds without re-reading TRBs.
    xhci.ring_doorbell(slot, 3);
    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(handle.data_calls().len(), 2);
}

#[test]
fn stop_endpoint_flushes_pending_transfers() {
    let (mut xhci, handle, slot) = scripted_setup("1-4");
    handle.push(ScriptedAction::Nak);

    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 16, TRB_IOC));
    xhci.ring_doorbell(slot, 3);
    assert!(xhci.next_event().is_none(), "transfer parked after NAK");

    xhci.push_command(Trb {
        parameter: 0,
        status: 0,
        control: (u32::from(trb_types::STOP_ENDPOINT) << 10)
            | (3 << 16)
            | (u32::from(slot) << 24),
    });

    // The parked TRB completes with Stopped, then the command completes.
    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Stopped as u32);
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(xhci.ep_ctx_dword(3, 0) & 0x7, endpoint_state::STOPPED);
}

#[test]
fn set_tr_dequeue_moves_the_ring_cursor() {
    let (mut xhci, handle, slot) = scripted_setup("1-4");

    // Stop the endpoint so Set TR Dequeue is legal.
    xhci.push_command(Trb {
        parameter: 0,
        status: 0,
        control: (u32::from(trb_types::STOP_ENDPOINT) << 10)
            | (3 << 16)
            | (u32::from(slot) << 24),
    });
    xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);

    let new_ring = EP_RING + 0x800;
    xhci.push_command(Trb {
        parameter: new_ring | 1,
        status: 0,
        control: (u32::from(trb_types::SET_TR_DEQUEUE) << 10)
            | (3 << 16)
            | (u32::from(slot) << 24),
    });
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(
        u64::from(xhci.ep_ctx_dword(3, 2)) | (u64::from(xhci.ep_ctx_dword(3, 3)) << 32),
        new_ring,
        "endpoint context points at the new ring"
    );

    // Transfers continue from the new cursor.
    handle.push(ScriptedAction::Fill(0x33));
    xhci.write_trb(new_ring, normal_trb(DATA_BUFFER_ADDR, 8, TRB_IOC));
    xhci.ring_doorbell(slot, 3);
    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.parameter, new_ring);
}

#[test]
fn transfer_ring_follows_link_trbs_with_toggle() {
    let (mut xhci, handle, slot) = scripted_setup("1-4");
    handle.push(ScriptedAction::Fill(0x01));
    handle.push(ScriptedAction::Fill(0x02));

    // one normal TRB, then a link back to the ring base with TC
    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 8, TRB_IOC));
    xhci.write_trb(
        EP_RING + 16,
        Trb {
            parameter: EP_RING,
            status: 0,
            control: (u32::from(trb_types::LINK) << 10) | TRB_TC | TRB_CYCLE,
        },
    );
    xhci.ring_doorbell(slot, 3);
    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.parameter, EP_RING);

    // After the wrap the cycle state toggled: a TRB with cycle=0 is
    // fresh now.
    xhci.write_trb(
        EP_RING,
        Trb {
            parameter: DATA_BUFFER_ADDR,
            status: 8,
            control: u32::from(trb_types::NORMAL) << 10 | TRB_IOC,
        },
    );
    xhci.ring_doorbell(slot, 3);
    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
}

#[test]
fn control_requests_reach_the_tablet() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    let slot = xhci.enable_slot();
    xhci.address_device(slot, USB2_FIRST_PORT as u8);

    // GET_DESCRIPTOR(device): setup + data + status on the EP0 ring.
    let setup_raw = 0x0012_0000_0100_0680u64;
    xhci.write_trb(
        XFER_RING_ADDR,
        Trb {
            parameter: setup_raw,
            status: 8,
            control: (u32::from(trb_types::SETUP_STAGE) << 10) | TRB_IDT | TRB_CYCLE,
        },
    );
    xhci.write_trb(
        XFER_RING_ADDR + 16,
        Trb {
            parameter: DATA_BUFFER_ADDR,
            status: 18,
            control: (u32::from(trb_types::DATA_STAGE) << 10) | TRB_CYCLE,
        },
    );
    xhci.write_trb(
        XFER_RING_ADDR + 32,
        Trb {
            parameter: 0,
            status: 0,
            control: (u32::from(trb_types::STATUS_STAGE) << 10) | TRB_IOC | TRB_CYCLE,
        },
    );
    xhci.ring_doorbell(slot, 1);

    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(event.endpoint_id(), 1);

    let descriptor = xhci.read_mem(DATA_BUFFER_ADDR, 18);
    assert_eq!(descriptor[0], 18, "bLength");
    assert_eq!(descriptor[1], 1, "device descriptor type");
}

#[test]
fn tablet_reports_flow_through_the_interrupt_endpoint() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    let slot = xhci.enable_slot();
    xhci.address_device(slot, USB2_FIRST_PORT as u8);
    xhci.configure_endpoint(slot, 3, endpoint_type::INTERRUPT_IN, EP_RING);

    let tablets = xhci.controller.lock().unwrap().take_tablet_handles();
    let tablet = &tablets[0];

    // A pending TRB NAKs while there is no input.
    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 8, TRB_IOC));
    xhci.ring_doorbell(slot, 3);
    assert!(xhci.next_event().is_none());

    // Pushing input kicks the endpoint through the interrupt path.
    tablet.push_event(TabletReport {
        buttons: 1,
        x: 100,
        y: 200,
        wheel: 0,
    });

    let event = xhci.expect_event(trb_types::TRANSFER_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);

    let report = xhci.read_mem(DATA_BUFFER_ADDR, 6);
    assert_eq!(report[0], 1);
    assert_eq!(u16::from_le_bytes([report[1], report[2]]), 100);
    assert_eq!(u16::from_le_bytes([report[3], report[4]]), 200);
}

#[test]
fn transfer_events_stop_when_the_event_ring_fills() {
    let (mut xhci, handle, slot) = scripted_setup("1-4");
    // shrink the event ring to 2 slots: one insert fills it
    xhci.setup_event_ring(2);

    handle.push(ScriptedAction::Fill(0x10));
    handle.push(ScriptedAction::Fill(0x20));

    // Two batches produce two transfer events; the second insert lands
    // in the final slot and is replaced by the synthetic ring-full
    // event.
    xhci.write_trb(EP_RING, normal_trb(DATA_BUFFER_ADDR, 8, TRB_IOC));
    xhci.write_trb(EP_RING + 16, normal_trb(DATA_BUFFER_ADDR + 8, 8, TRB_IOC));
    xhci.ring_doorbell(slot, 3);

    let first = xhci.read_trb(EVENT_RING_ADDR);
    assert_eq!(first.trb_type(), trb_types::TRANSFER_EVENT);
    let second = xhci.read_trb(EVENT_RING_ADDR + 16);
    assert_eq!(second.trb_type(), trb_types::HOST_CONTROLLER_EVENT);
    assert_eq!(
        second.status >> 24,
        CompletionCode::EventRingFullError as u32
    );
}
