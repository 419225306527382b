//! Command-ring coverage: slot lifecycle, device addressing, endpoint
//! configuration, and the context-touching commands.

use vxhcid::device::pci::backend::Speed;
use vxhcid::device::pci::constants::xhci::MAX_SLOTS;
use vxhcid::device::pci::device_slots::{endpoint_state, endpoint_type, slot_state};
use vxhcid::device::pci::trb::{trb_types, CompletionCode, Trb};

mod util;
use util::*;

fn command(trb_type: u8, slot: u8) -> Trb {
    Trb {
        parameter: 0,
        status: 0,
        control: (u32::from(trb_type) << 10) | (u32::from(slot) << 24),
    }
}

#[test]
fn enable_slot_hands_out_ascending_slots() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();

    assert_eq!(xhci.enable_slot(), 1);
    assert_eq!(xhci.enable_slot(), 2);
}

#[test]
fn enable_then_disable_restores_the_allocation() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();

    let slot = xhci.enable_slot();
    xhci.push_command(command(trb_types::DISABLE_SLOT, slot));
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);

    // The same slot id comes back on the next Enable Slot.
    assert_eq!(xhci.enable_slot(), slot);
}

#[test]
fn slot_exhaustion_reports_no_slots() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();

    for _ in 0..MAX_SLOTS {
        xhci.enable_slot();
    }
    xhci.push_command(command(trb_types::ENABLE_SLOT, 0));
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(
        event.status >> 24,
        CompletionCode::NoSlotsAvailableError as u32
    );
}

#[test]
fn disable_of_a_never_enabled_slot_fails() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();

    xhci.push_command(command(trb_types::DISABLE_SLOT, 5));
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(
        event.status >> 24,
        CompletionCode::SlotNotEnabledError as u32
    );
}

#[test]
fn address_device_for_the_tablet() {
    // S3: enable then address the tablet on the first USB2 port.
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();

    let slot = xhci.enable_slot();
    assert_eq!(slot, 1);

    let event = xhci.address_device(slot, USB2_FIRST_PORT as u8);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(event.slot_id(), slot);

    // Output slot context: state ADDRESSED, address equals the slot id.
    assert_eq!(xhci.dev_ctx_dword(3) >> 27, slot_state::ADDRESSED);
    assert_eq!(xhci.dev_ctx_dword(3) & 0xFF, u32::from(slot));

    // EP0 is running.
    assert_eq!(xhci.ep_ctx_dword(1, 0) & 0x7, endpoint_state::RUNNING);
}

#[test]
fn address_device_validates_the_input_control_context() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    let slot = xhci.enable_slot();

    xhci.prepare_address_contexts(slot, USB2_FIRST_PORT as u8);
    // corrupt the add flags: slot context missing
    xhci.mem_write_u32(INPUT_CTX_ADDR + 4, 0x2);

    xhci.push_command(Trb {
        parameter: INPUT_CTX_ADDR,
        status: 0,
        control: (u32::from(trb_types::ADDRESS_DEVICE) << 10) | (u32::from(slot) << 24),
    });
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::TrbError as u32);
}

#[test]
fn address_device_requires_a_connected_port() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    let slot = xhci.enable_slot();

    // port 1 (USB3 half) has nothing connected
    let event = xhci.address_device(slot, 1);
    assert_eq!(event.status >> 24, CompletionCode::TrbError as u32);
}

#[test]
fn configure_endpoint_enables_and_drops_endpoints() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    let slot = xhci.enable_slot();
    xhci.address_device(slot, USB2_FIRST_PORT as u8);

    let event = xhci.configure_endpoint(slot, 3, endpoint_type::INTERRUPT_IN, XFER_RING_ADDR + 0x100);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(xhci.dev_ctx_dword(3) >> 27, slot_state::CONFIGURED);
    assert_eq!(xhci.ep_ctx_dword(3, 0) & 0x7, endpoint_state::RUNNING);

    // Drop it again.
    xhci.mem_write_u32(INPUT_CTX_ADDR, 1 << 3);
    xhci.mem_write_u32(INPUT_CTX_ADDR + 4, 0);
    xhci.push_command(Trb {
        parameter: INPUT_CTX_ADDR,
        status: 0,
        control: (u32::from(trb_types::CONFIGURE_ENDPOINT) << 10) | (u32::from(slot) << 24),
    });
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(xhci.ep_ctx_dword(3, 0) & 0x7, endpoint_state::DISABLED);
}

#[test]
fn deconfigure_returns_the_slot_to_addressed() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    let slot = xhci.enable_slot();
    xhci.address_device(slot, USB2_FIRST_PORT as u8);
    xhci.configure_endpoint(slot, 3, endpoint_type::INTERRUPT_IN, XFER_RING_ADDR + 0x100);

    // Configure Endpoint with the deconfigure bit set.
    xhci.push_command(Trb {
        parameter: INPUT_CTX_ADDR,
        status: 0,
        control: (u32::from(trb_types::CONFIGURE_ENDPOINT) << 10)
            | (1 << 9)
            | (u32::from(slot) << 24),
    });
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(xhci.dev_ctx_dword(3) >> 27, slot_state::ADDRESSED);
    assert_eq!(xhci.ep_ctx_dword(3, 0) & 0x7, endpoint_state::DISABLED);
}

#[test]
fn evaluate_context_updates_latency_and_max_packet_size() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    let slot = xhci.enable_slot();
    xhci.address_device(slot, USB2_FIRST_PORT as u8);

    // Input: add slot + ep0; MEL 0x123, interrupter target 3, EP0 max
    // packet size 512.
    xhci.mem_write_u32(INPUT_CTX_ADDR, 0);
    xhci.mem_write_u32(INPUT_CTX_ADDR + 4, 0x3);
    xhci.mem_write_u32(INPUT_CTX_ADDR + 32 + 4, 0x123);
    xhci.mem_write_u32(INPUT_CTX_ADDR + 32 + 8, 3 << 22);
    xhci.mem_write_u32(INPUT_CTX_ADDR + 64 + 4, 512 << 16);

    xhci.push_command(Trb {
        parameter: INPUT_CTX_ADDR,
        status: 0,
        control: (u32::from(trb_types::EVALUATE_CONTEXT) << 10) | (u32::from(slot) << 24),
    });
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);

    assert_eq!(xhci.dev_ctx_dword(1) & 0xFFFF, 0x123);
    assert_eq!(xhci.dev_ctx_dword(2) >> 22, 3);
    assert_eq!(xhci.ep_ctx_dword(1, 1) >> 16, 512);
}

#[test]
fn reset_device_returns_the_slot_to_default() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();
    let slot = xhci.enable_slot();
    xhci.address_device(slot, USB2_FIRST_PORT as u8);
    xhci.configure_endpoint(slot, 3, endpoint_type::INTERRUPT_IN, XFER_RING_ADDR + 0x100);

    xhci.push_command(command(trb_types::RESET_DEVICE, slot));
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);

    assert_eq!(xhci.dev_ctx_dword(3) >> 27, slot_state::DEFAULT);
    assert_eq!(xhci.dev_ctx_dword(3) & 0xFF, 0, "address cleared");
    assert_eq!(xhci.ep_ctx_dword(3, 0) & 0x7, endpoint_state::DISABLED);
}

#[test]
fn unsupported_commands_succeed_as_noops() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();

    for trb_type in [
        trb_types::FORCE_EVENT,
        trb_types::NEGOTIATE_BW,
        trb_types::SET_LATENCY_TOLERANCE,
        trb_types::GET_PORT_BANDWIDTH,
        trb_types::FORCE_HEADER,
        trb_types::NOOP_COMMAND,
    ] {
        xhci.push_command(command(trb_type, 0));
        let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
        assert_eq!(
            event.status >> 24,
            CompletionCode::Success as u32,
            "command type {trb_type} should complete as a no-op"
        );
    }
}

#[test]
fn command_ring_follows_link_trbs() {
    let mut xhci = TestXhci::new("tablet");
    xhci.bring_up();

    // three commands, then a link back to the ring base
    xhci.push_command(command(trb_types::NOOP_COMMAND, 0));
    xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    xhci.push_command(command(trb_types::NOOP_COMMAND, 0));
    xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);

    xhci.push_link_back_to_ring_start();
    xhci.push_command(command(trb_types::NOOP_COMMAND, 0));
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(
        event.parameter, CMD_RING_ADDR,
        "completion points at the first slot after the link wrap"
    );
}

#[test]
fn address_then_reset_device_round_trip() {
    let mut xhci = TestXhci::new("1-4");
    xhci.bring_up();

    let (source, handle) = ScriptedSource::new(Speed::Super);
    let info = scripted_device_info(1, 4, Speed::Super);
    xhci.controller
        .lock()
        .unwrap()
        .device_connected(info, Some(Box::new(source)))
        .unwrap();
    let vport = USB3_FIRST_PORT as u8;

    let slot = xhci.enable_slot();
    let event = xhci.address_device(slot, vport);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(handle.0.lock().unwrap().reset_count, 1, "backend was reset");

    xhci.push_command(command(trb_types::RESET_DEVICE, slot));
    let event = xhci.expect_event(trb_types::COMMAND_COMPLETION_EVENT);
    assert_eq!(event.status >> 24, CompletionCode::Success as u32);
    assert_eq!(xhci.dev_ctx_dword(3) >> 27, slot_state::DEFAULT);
}
