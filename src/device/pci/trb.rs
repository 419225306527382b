//! Transfer Request Blocks.
//!
//! TRBs are the 16-byte descriptors that commands, transfers, and events
//! travel in. Layout per the xHCI specification, section 6.4: a 64-bit
//! parameter, a 32-bit status word, and a 32-bit control word holding the
//! cycle bit (bit 0) and the TRB type (bits 15:10).

use thiserror::Error;

/// Raw wire representation of a single TRB.
pub type RawTrbBuffer = [u8; 16];

#[must_use]
pub const fn zeroed_trb_buffer() -> RawTrbBuffer {
    [0; 16]
}

/// A TRB split into its three architectural fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    #[must_use]
    pub fn from_bytes(buffer: RawTrbBuffer) -> Self {
        Self {
            parameter: u64::from_le_bytes(buffer[0..8].try_into().unwrap()),
            status: u32::from_le_bytes(buffer[8..12].try_into().unwrap()),
            control: u32::from_le_bytes(buffer[12..16].try_into().unwrap()),
        }
    }

    #[must_use]
    pub fn to_bytes(self) -> RawTrbBuffer {
        let mut buffer = zeroed_trb_buffer();
        buffer[0..8].copy_from_slice(&self.parameter.to_le_bytes());
        buffer[8..12].copy_from_slice(&self.status.to_le_bytes());
        buffer[12..16].copy_from_slice(&self.control.to_le_bytes());
        buffer
    }

    #[must_use]
    pub const fn trb_type(self) -> u8 {
        ((self.control >> 10) & 0x3F) as u8
    }

    #[must_use]
    pub const fn cycle(self) -> bool {
        self.control & 0x1 != 0
    }

    #[must_use]
    pub const fn slot_id(self) -> u8 {
        (self.control >> 24) as u8
    }

    #[must_use]
    pub const fn endpoint_id(self) -> u8 {
        ((self.control >> 16) & 0x1F) as u8
    }
}

/// TRB type ids used by this controller.
pub mod trb_types {
    pub const NORMAL: u8 = 1;
    pub const SETUP_STAGE: u8 = 2;
    pub const DATA_STAGE: u8 = 3;
    pub const STATUS_STAGE: u8 = 4;
    pub const ISOCH: u8 = 5;
    pub const LINK: u8 = 6;
    pub const EVENT_DATA: u8 = 7;
    pub const NOOP: u8 = 8;
    pub const ENABLE_SLOT: u8 = 9;
    pub const DISABLE_SLOT: u8 = 10;
    pub const ADDRESS_DEVICE: u8 = 11;
    pub const CONFIGURE_ENDPOINT: u8 = 12;
    pub const EVALUATE_CONTEXT: u8 = 13;
    pub const RESET_ENDPOINT: u8 = 14;
    pub const STOP_ENDPOINT: u8 = 15;
    pub const SET_TR_DEQUEUE: u8 = 16;
    pub const RESET_DEVICE: u8 = 17;
    pub const FORCE_EVENT: u8 = 18;
    pub const NEGOTIATE_BW: u8 = 19;
    pub const SET_LATENCY_TOLERANCE: u8 = 20;
    pub const GET_PORT_BANDWIDTH: u8 = 21;
    pub const FORCE_HEADER: u8 = 22;
    pub const NOOP_COMMAND: u8 = 23;

    pub const TRANSFER_EVENT: u8 = 32;
    pub const COMMAND_COMPLETION_EVENT: u8 = 33;
    pub const PORT_STATUS_CHANGE_EVENT: u8 = 34;
    pub const HOST_CONTROLLER_EVENT: u8 = 37;
}

/// xHCI completion codes (specification section 6.4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferError = 2,
    BabbleDetectedError = 3,
    UsbTransactionError = 4,
    TrbError = 5,
    StallError = 6,
    ResourceError = 7,
    NoSlotsAvailableError = 9,
    InvalidStreamTypeError = 10,
    SlotNotEnabledError = 11,
    EndpointNotEnabledError = 12,
    ShortPacket = 13,
    ParameterError = 17,
    ContextStateError = 19,
    EventRingFullError = 21,
    IncompatibleDeviceError = 22,
    CommandAborted = 25,
    Stopped = 26,
    InvalidStreamIdError = 34,
    Undefined = 33,
}

/// Control bits shared by several transfer TRB types.
mod control_bits {
    pub const ISP: u32 = 1 << 2;
    pub const CH: u32 = 1 << 4;
    pub const IOC: u32 = 1 << 5;
    pub const IDT: u32 = 1 << 6;
    pub const TC: u32 = 1 << 1;
    pub const DCEP: u32 = 1 << 9;
    pub const ED: u32 = 1 << 2;
}

/// An event TRB ready for insertion into the event ring.
///
/// The cycle bit is left clear; the event ring owns it and patches in the
/// producer cycle state at insertion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTrb(pub Trb);

impl EventTrb {
    #[must_use]
    pub const fn new_port_status_change_event_trb(port_id: u8) -> Self {
        Self(Trb {
            parameter: (port_id as u64) << 24,
            status: (CompletionCode::Success as u32) << 24,
            control: (trb_types::PORT_STATUS_CHANGE_EVENT as u32) << 10,
        })
    }

    #[must_use]
    pub const fn new_command_completion_event_trb(
        command_trb_pointer: u64,
        completion_code: CompletionCode,
        slot_id: u8,
    ) -> Self {
        Self(Trb {
            parameter: command_trb_pointer,
            status: (completion_code as u32) << 24,
            control: ((trb_types::COMMAND_COMPLETION_EVENT as u32) << 10)
                | ((slot_id as u32) << 24),
        })
    }

    #[must_use]
    pub const fn new_transfer_event_trb(
        trb_pointer: u64,
        transfer_length: u32,
        completion_code: CompletionCode,
        event_data: bool,
        endpoint_id: u8,
        slot_id: u8,
    ) -> Self {
        Self(Trb {
            parameter: trb_pointer,
            status: (transfer_length & 0xFF_FFFF) | ((completion_code as u32) << 24),
            control: ((trb_types::TRANSFER_EVENT as u32) << 10)
                | if event_data { control_bits::ED } else { 0 }
                | ((endpoint_id as u32) << 16)
                | ((slot_id as u32) << 24),
        })
    }

    /// The synthetic Host Controller event reporting a full event ring.
    #[must_use]
    pub const fn new_ring_full_event_trb() -> Self {
        Self(Trb {
            parameter: 0,
            status: (CompletionCode::EventRingFullError as u32) << 24,
            control: (trb_types::HOST_CONTROLLER_EVENT as u32) << 10,
        })
    }

    /// Wire representation with the producer cycle state patched in.
    #[must_use]
    pub fn to_bytes(self, cycle_state: bool) -> RawTrbBuffer {
        let mut trb = self.0;
        trb.control = (trb.control & !0x1) | u32::from(cycle_state);
        trb.to_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTrbData {
    pub ring_segment_pointer: u64,
    pub toggle_cycle: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCommandTrbData {
    pub slot_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputContextCommandTrbData {
    pub slot_id: u8,
    pub input_context_pointer: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigureEndpointCommandTrbData {
    pub slot_id: u8,
    pub input_context_pointer: u64,
    pub deconfigure: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointCommandTrbData {
    pub slot_id: u8,
    pub endpoint_id: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetTrDequeueCommandTrbData {
    pub slot_id: u8,
    pub endpoint_id: u8,
    pub stream_id: u32,
    /// New dequeue pointer with the DCS bit in bit 0.
    pub pointer_and_cycle: u64,
}

/// A parsed command TRB together with its guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTrb {
    pub address: u64,
    pub variant: CommandTrbVariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTrbVariant {
    Link(LinkTrbData),
    EnableSlot,
    DisableSlot(SlotCommandTrbData),
    AddressDevice(InputContextCommandTrbData),
    ConfigureEndpoint(ConfigureEndpointCommandTrbData),
    EvaluateContext(InputContextCommandTrbData),
    ResetEndpoint(EndpointCommandTrbData),
    StopEndpoint(EndpointCommandTrbData),
    SetTrDequeuePointer(SetTrDequeueCommandTrbData),
    ResetDevice(SlotCommandTrbData),
    /// Commands we accept and complete successfully without action.
    NoOp(SlotCommandTrbData),
    Unrecognized(Trb, TrbParseError),
}

impl CommandTrbVariant {
    #[must_use]
    pub fn parse(buffer: RawTrbBuffer) -> Self {
        let trb = Trb::from_bytes(buffer);
        let slot = SlotCommandTrbData {
            slot_id: trb.slot_id(),
        };
        let input = InputContextCommandTrbData {
            slot_id: trb.slot_id(),
            input_context_pointer: trb.parameter & !0xF,
        };
        match trb.trb_type() {
            trb_types::LINK => Self::Link(LinkTrbData {
                ring_segment_pointer: trb.parameter & !0xF,
                toggle_cycle: trb.control & control_bits::TC != 0,
            }),
            trb_types::ENABLE_SLOT => Self::EnableSlot,
            trb_types::DISABLE_SLOT => Self::DisableSlot(slot),
            trb_types::ADDRESS_DEVICE => Self::AddressDevice(input),
            trb_types::CONFIGURE_ENDPOINT => Self::ConfigureEndpoint(ConfigureEndpointCommandTrbData {
                slot_id: trb.slot_id(),
                input_context_pointer: trb.parameter & !0xF,
                deconfigure: trb.control & control_bits::DCEP != 0,
            }),
            trb_types::EVALUATE_CONTEXT => Self::EvaluateContext(input),
            trb_types::RESET_ENDPOINT => Self::ResetEndpoint(EndpointCommandTrbData {
                slot_id: trb.slot_id(),
                endpoint_id: trb.endpoint_id(),
            }),
            trb_types::STOP_ENDPOINT => Self::StopEndpoint(EndpointCommandTrbData {
                slot_id: trb.slot_id(),
                endpoint_id: trb.endpoint_id(),
            }),
            trb_types::SET_TR_DEQUEUE => Self::SetTrDequeuePointer(SetTrDequeueCommandTrbData {
                slot_id: trb.slot_id(),
                endpoint_id: trb.endpoint_id(),
                stream_id: (trb.status >> 16) & 0xFFFF,
                pointer_and_cycle: trb.parameter,
            }),
            trb_types::RESET_DEVICE => Self::ResetDevice(slot),
            trb_types::FORCE_EVENT
            | trb_types::NEGOTIATE_BW
            | trb_types::SET_LATENCY_TOLERANCE
            | trb_types::GET_PORT_BANDWIDTH
            | trb_types::FORCE_HEADER
            | trb_types::NOOP_COMMAND => Self::NoOp(slot),
            unknown => Self::Unrecognized(trb, TrbParseError::UnknownCommandType(unknown)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalTrbData {
    /// Guest buffer address, or the immediate payload when `immediate_data`.
    pub data_pointer: u64,
    pub transfer_length: u32,
    pub immediate_data: bool,
    pub interrupt_on_completion: bool,
    pub interrupt_on_short_packet: bool,
    pub chain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupStageTrbData {
    /// The raw 8-byte device request carried inline.
    pub request: u64,
    pub immediate_data: bool,
    pub transfer_length: u32,
    pub interrupt_on_completion: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventDataTrbData {
    /// Driver-chosen payload surfaced in the transfer event.
    pub event_data: u64,
    pub interrupt_on_completion: bool,
}

/// A parsed transfer TRB together with its guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferTrb {
    pub address: u64,
    pub variant: TransferTrbVariant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferTrbVariant {
    Normal(NormalTrbData),
    SetupStage(SetupStageTrbData),
    DataStage(NormalTrbData),
    StatusStage { interrupt_on_completion: bool },
    Isoch(NormalTrbData),
    Link(LinkTrbData),
    EventData(EventDataTrbData),
    NoOp { interrupt_on_completion: bool },
    Unrecognized(Trb, TrbParseError),
}

impl TransferTrbVariant {
    #[must_use]
    pub fn parse(buffer: RawTrbBuffer) -> Self {
        let trb = Trb::from_bytes(buffer);
        let ioc = trb.control & control_bits::IOC != 0;
        let normal = NormalTrbData {
            data_pointer: trb.parameter,
            transfer_length: trb.status & 0x1_FFFF,
            immediate_data: trb.control & control_bits::IDT != 0,
            interrupt_on_completion: ioc,
            interrupt_on_short_packet: trb.control & control_bits::ISP != 0,
            chain: trb.control & control_bits::CH != 0,
        };
        match trb.trb_type() {
            trb_types::NORMAL => Self::Normal(normal),
            trb_types::SETUP_STAGE => Self::SetupStage(SetupStageTrbData {
                request: trb.parameter,
                immediate_data: trb.control & control_bits::IDT != 0,
                transfer_length: trb.status & 0x1_FFFF,
                interrupt_on_completion: ioc,
            }),
            trb_types::DATA_STAGE => Self::DataStage(normal),
            trb_types::STATUS_STAGE => Self::StatusStage {
                interrupt_on_completion: ioc,
            },
            trb_types::ISOCH => Self::Isoch(normal),
            trb_types::LINK => Self::Link(LinkTrbData {
                ring_segment_pointer: trb.parameter & !0xF,
                toggle_cycle: trb.control & control_bits::TC != 0,
            }),
            trb_types::EVENT_DATA => Self::EventData(EventDataTrbData {
                event_data: trb.parameter,
                interrupt_on_completion: ioc,
            }),
            trb_types::NOOP => Self::NoOp {
                interrupt_on_completion: ioc,
            },
            unknown => Self::Unrecognized(trb, TrbParseError::UnknownTransferType(unknown)),
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrbParseError {
    #[error("unknown command TRB type {0}")]
    UnknownCommandType(u8),
    #[error("unknown transfer TRB type {0}")]
    UnknownTransferType(u8),
}
