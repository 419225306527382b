//! The interface between the controller and USB device backends.
//!
//! Two families of backends exist: internally emulated devices (the
//! tablet), which complete transfers synchronously while the controller
//! lock is held, and port-mapped host devices, which accept the transfer
//! and complete it later from a worker via the controller's notify entry
//! point. [`DeviceKind`] is the tag that gates the synchronous path.

use std::fmt::{self, Debug};

use thiserror::Error;

use crate::device::bus::BusDeviceRef;

use super::trb::CompletionCode;
use super::xfer::XferQueue;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speed {
    Full = 1,
    Low = 2,
    High = 3,
    Super = 4,
}

impl Speed {
    /// The PORTSC speed field value.
    #[must_use]
    pub const fn portsc_value(self) -> u64 {
        self as u64
    }

    #[must_use]
    pub const fn is_usb2_speed(self) -> bool {
        self as u8 <= 3
    }
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "Low Speed (1.5 Mbps)",
            Self::Full => "Full Speed (12 Mbps)",
            Self::High => "High Speed (480 Mbps)",
            Self::Super => "SuperSpeed (5 Gbps)",
        };
        write!(f, "{name}")
    }
}

/// Direction of a data transfer, seen from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Distinguishes internally emulated devices from host-mapped ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Fully emulated in-process; transfers complete in-line.
    Emulated,
    /// Backed by a physical device on the host; transfers complete
    /// asynchronously through the notify path.
    PortMapper,
}

/// Errors a backend reports for a transfer or request.
///
/// The conversion into [`CompletionCode`] is the controller's fixed
/// mapping of backend errors to the codes the guest sees.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    #[error("short transfer")]
    ShortTransfer,
    #[error("endpoint stalled")]
    Stalled,
    #[error("transfer timed out")]
    Timeout,
    #[error("host I/O error")]
    IoError,
    #[error("bad buffer size")]
    BadBufsize,
    #[error("transfer cancelled")]
    Cancelled,
    /// The device has nothing to deliver right now; the transfer stays
    /// queued and is retried on the next doorbell.
    #[error("device NAK")]
    Nak,
    #[error("invalid argument")]
    Invalid,
    #[error("bad address")]
    BadAddress,
    #[error("bad flag")]
    BadFlag,
    #[error("out of memory")]
    NoMem,
    #[error("resource in use")]
    InUse,
    #[error("no address assigned")]
    NoAddr,
    #[error("no such pipe")]
    NoPipe,
    #[error("DMA load failed")]
    DmaLoadFailed,
    #[error("bad context")]
    BadContext,
    #[error("TRB-level I/O error")]
    IoErrorTrb,
    #[error("set-address failed")]
    SetAddrFailed,
}

impl From<UsbError> for CompletionCode {
    fn from(error: UsbError) -> Self {
        match error {
            UsbError::ShortTransfer => Self::ShortPacket,
            UsbError::Stalled => Self::StallError,
            UsbError::Timeout | UsbError::IoError => Self::UsbTransactionError,
            UsbError::BadBufsize => Self::BabbleDetectedError,
            UsbError::Cancelled | UsbError::Nak => Self::Stopped,
            UsbError::Invalid | UsbError::BadAddress | UsbError::BadFlag => Self::ParameterError,
            UsbError::NoMem
            | UsbError::InUse
            | UsbError::NoAddr
            | UsbError::NoPipe
            | UsbError::SetAddrFailed => Self::ResourceError,
            UsbError::DmaLoadFailed => Self::DataBufferError,
            UsbError::BadContext | UsbError::IoErrorTrb => Self::TrbError,
        }
    }
}

/// Static facts about a backend device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendInfo {
    /// BCD USB version (0x200, 0x300, ...).
    pub usb_version: u16,
    pub speed: Speed,
}

/// A USB device backend driven by the transfer handler.
///
/// Construction is `init`, dropping the box is `deinit`.
pub trait UsbBackend: Debug + Send {
    fn kind(&self) -> DeviceKind;

    fn info(&self) -> BackendInfo;

    /// Device reset, issued from Address Device.
    fn reset(&mut self) -> Result<(), UsbError>;

    /// Execute a control request on the default endpoint. The setup packet
    /// and the data/status blocks are on the queue.
    fn request(&mut self, xfer: &mut XferQueue) -> Result<(), UsbError>;

    /// Execute data transfers for a non-control endpoint.
    ///
    /// `epidx` is the endpoint number (endpoint id divided by two).
    fn data(&mut self, xfer: &mut XferQueue, dir: Direction, epidx: u8) -> Result<(), UsbError>;

    /// Announce an endpoint the guest configured, with its context type
    /// field. Port-mapped backends use this to pick the matching host
    /// pipe; emulated devices usually don't care.
    fn configure_endpoint(&mut self, _endpoint_id: u8, _ep_type: u32) {}

    /// Quiesce outstanding work, e.g. on deconfigure.
    fn stop(&mut self) {}
}

/// Opens the backend for a host device once the guest addresses it.
///
/// The discovery layer hands one of these to the controller together
/// with the device identity; the controller calls it from Address Device.
pub trait NativeDeviceSource: Debug + Send {
    fn create_backend(
        &self,
        dma_bus: BusDeviceRef,
        slot_id: u8,
    ) -> Result<Box<dyn UsbBackend>, UsbError>;
}
