//! The internally emulated HID tablet.
//!
//! An absolute-pointer device on the USB2 half of the root hub. Pointer
//! events are pushed in through a [`TabletHandle`] (typically from the
//! VMM's input layer) and delivered to the guest over interrupt endpoint
//! 1 as 6-byte HID reports. With no pending event the endpoint NAKs, so
//! the transfer stays queued until the next doorbell or input kick.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tracing::{debug, trace, warn};

use crate::device::bus::BusDeviceRef;

use super::backend::{BackendInfo, DeviceKind, Direction, Speed, UsbBackend, UsbError};
use super::xfer::{BlockState, DeviceRequest, XferQueue};
use super::xhci::XhciController;

const VENDOR_ID: u16 = 0x0627;
const PRODUCT_ID: u16 = 0x0001;

/// Endpoint id of the interrupt IN endpoint (EP 1 IN).
pub const TABLET_INTR_EPID: u8 = 3;

const DESC_TYPE_DEVICE: u8 = 1;
const DESC_TYPE_CONFIG: u8 = 2;
const DESC_TYPE_STRING: u8 = 3;
const DESC_TYPE_HID_REPORT: u8 = 0x22;

const REQ_GET_STATUS: u8 = 0;
const REQ_SET_CONFIGURATION: u8 = 9;
const REQ_GET_CONFIGURATION: u8 = 8;
const REQ_GET_DESCRIPTOR: u8 = 6;
const REQ_SET_INTERFACE: u8 = 11;
const REQ_HID_GET_REPORT: u8 = 1;
const REQ_HID_SET_IDLE: u8 = 0x0A;
const REQ_HID_SET_PROTOCOL: u8 = 0x0B;

#[rustfmt::skip]
const DEVICE_DESCRIPTOR: [u8; 18] = [
    18, DESC_TYPE_DEVICE,
    0x00, 0x02,             /* bcdUSB 2.00 */
    0, 0, 0,                /* class/subclass/protocol from interface */
    8,                      /* bMaxPacketSize0 */
    (VENDOR_ID & 0xFF) as u8, (VENDOR_ID >> 8) as u8,
    (PRODUCT_ID & 0xFF) as u8, (PRODUCT_ID >> 8) as u8,
    0x00, 0x01,             /* bcdDevice */
    1, 2, 3,                /* manufacturer/product/serial strings */
    1,                      /* bNumConfigurations */
];

#[rustfmt::skip]
const REPORT_DESCRIPTOR: &[u8] = &[
    0x05, 0x01,             /* Usage Page (Generic Desktop) */
    0x09, 0x02,             /* Usage (Mouse) */
    0xA1, 0x01,             /* Collection (Application) */
    0x09, 0x01,             /*   Usage (Pointer) */
    0xA1, 0x00,             /*   Collection (Physical) */
    0x05, 0x09,             /*     Usage Page (Button) */
    0x19, 0x01,             /*     Usage Minimum (1) */
    0x29, 0x03,             /*     Usage Maximum (3) */
    0x15, 0x00,             /*     Logical Minimum (0) */
    0x25, 0x01,             /*     Logical Maximum (1) */
    0x95, 0x03,             /*     Report Count (3) */
    0x75, 0x01,             /*     Report Size (1) */
    0x81, 0x02,             /*     Input (Data, Var, Abs) */
    0x95, 0x01,             /*     Report Count (1) */
    0x75, 0x05,             /*     Report Size (5) */
    0x81, 0x01,             /*     Input (Const) */
    0x05, 0x01,             /*     Usage Page (Generic Desktop) */
    0x09, 0x30,             /*     Usage (X) */
    0x09, 0x31,             /*     Usage (Y) */
    0x15, 0x00,             /*     Logical Minimum (0) */
    0x26, 0xFF, 0x7F,       /*     Logical Maximum (32767) */
    0x35, 0x00,             /*     Physical Minimum (0) */
    0x46, 0xFF, 0x7F,       /*     Physical Maximum (32767) */
    0x75, 0x10,             /*     Report Size (16) */
    0x95, 0x02,             /*     Report Count (2) */
    0x81, 0x02,             /*     Input (Data, Var, Abs) */
    0x09, 0x38,             /*     Usage (Wheel) */
    0x15, 0x81,             /*     Logical Minimum (-127) */
    0x25, 0x7F,             /*     Logical Maximum (127) */
    0x35, 0x00,             /*     Physical Minimum (0) */
    0x45, 0x00,             /*     Physical Maximum (0) */
    0x75, 0x08,             /*     Report Size (8) */
    0x95, 0x01,             /*     Report Count (1) */
    0x81, 0x06,             /*     Input (Data, Var, Rel) */
    0xC0,                   /*   End Collection */
    0xC0,                   /* End Collection */
];

const STRINGS: [&str; 4] = ["", "vxhcid", "USB Tablet", "1"];

fn config_descriptor() -> Vec<u8> {
    let report_len = REPORT_DESCRIPTOR.len() as u16;
    let mut desc = Vec::with_capacity(34);
    #[rustfmt::skip]
    desc.extend_from_slice(&[
        9, DESC_TYPE_CONFIG,
        34, 0,              /* wTotalLength */
        1,                  /* bNumInterfaces */
        1,                  /* bConfigurationValue */
        0,                  /* iConfiguration */
        0xA0,               /* bus powered, remote wakeup */
        50,                 /* bMaxPower, 100 mA */
        /* interface */
        9, 4, 0, 0, 1, 3, 0, 0, 0,
        /* HID descriptor */
        9, 0x21, 0x11, 0x01, 0, 1, DESC_TYPE_HID_REPORT,
        (report_len & 0xFF) as u8, (report_len >> 8) as u8,
        /* interrupt IN endpoint 1 */
        7, 5, 0x81, 0x03, 8, 0, 10,
    ]);
    desc
}

fn string_descriptor(index: u8) -> Option<Vec<u8>> {
    if index == 0 {
        // language id table: US English
        return Some(vec![4, DESC_TYPE_STRING, 0x09, 0x04]);
    }
    let string = STRINGS.get(index as usize)?;
    let mut desc = vec![(2 + 2 * string.len()) as u8, DESC_TYPE_STRING];
    for unit in string.encode_utf16() {
        desc.extend_from_slice(&unit.to_le_bytes());
    }
    Some(desc)
}

/// One pointer state snapshot, already encoded as the 6-byte HID report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletReport {
    pub buttons: u8,
    pub x: u16,
    pub y: u16,
    pub wheel: i8,
}

impl TabletReport {
    fn encode(self) -> [u8; 6] {
        [
            self.buttons & 0x7,
            (self.x & 0xFF) as u8,
            (self.x >> 8) as u8,
            (self.y & 0xFF) as u8,
            (self.y >> 8) as u8,
            self.wheel as u8,
        ]
    }
}

#[derive(Debug, Default)]
struct SharedState {
    reports: VecDeque<TabletReport>,
}

/// Input side of the tablet, handed to whoever produces pointer events.
#[derive(Debug, Clone)]
pub struct TabletHandle {
    state: Arc<Mutex<SharedState>>,
    controller: Arc<OnceLock<Weak<Mutex<XhciController>>>>,
    /// Virtual port the tablet sits on.
    vport: u8,
}

impl TabletHandle {
    /// Wire the handle to the controller so queued input kicks the
    /// interrupt endpoint.
    pub fn connect_controller(&self, controller: Weak<Mutex<XhciController>>) {
        let _ = self.controller.set(controller);
    }

    /// Queue a pointer event and wake the guest.
    pub fn push_event(&self, report: TabletReport) {
        self.state.lock().unwrap().reports.push_back(report);
        if let Some(controller) = self.controller.get().and_then(Weak::upgrade) {
            controller
                .lock()
                .unwrap()
                .device_interrupt(self.vport, TABLET_INTR_EPID);
        }
    }
}

/// The tablet device backend.
#[derive(Debug)]
pub struct Tablet {
    dma_bus: BusDeviceRef,
    state: Arc<Mutex<SharedState>>,
    configuration: u8,
    idle: u8,
    protocol: u8,
}

impl Tablet {
    /// Create the tablet and its input handle.
    ///
    /// `vport` is the virtual port the controller placed the tablet on.
    pub fn new(dma_bus: BusDeviceRef, vport: u8) -> (Self, TabletHandle) {
        let state = Arc::new(Mutex::new(SharedState::default()));
        let handle = TabletHandle {
            state: state.clone(),
            controller: Arc::new(OnceLock::new()),
            vport,
        };
        (
            Self {
                dma_bus,
                state,
                configuration: 0,
                idle: 0,
                protocol: 1,
            },
            handle,
        )
    }

    fn descriptor(&self, value: u16) -> Option<Vec<u8>> {
        let (desc_type, index) = ((value >> 8) as u8, value as u8);
        match desc_type {
            DESC_TYPE_DEVICE => Some(DEVICE_DESCRIPTOR.to_vec()),
            DESC_TYPE_CONFIG => Some(config_descriptor()),
            DESC_TYPE_STRING => string_descriptor(index),
            DESC_TYPE_HID_REPORT => Some(REPORT_DESCRIPTOR.to_vec()),
            _ => None,
        }
    }

    /// Build the IN response for a control request, or None for no data.
    fn control_in(&mut self, req: &DeviceRequest) -> Result<Option<Vec<u8>>, UsbError> {
        match (req.request_type, req.request) {
            (0x80, REQ_GET_DESCRIPTOR) | (0x81, REQ_GET_DESCRIPTOR) => self
                .descriptor(req.value)
                .map(Some)
                .ok_or(UsbError::Stalled),
            (0x80, REQ_GET_STATUS) => Ok(Some(vec![0, 0])),
            (0x80, REQ_GET_CONFIGURATION) => Ok(Some(vec![self.configuration])),
            (0xA1, REQ_HID_GET_REPORT) => {
                let report = self
                    .state
                    .lock()
                    .unwrap()
                    .reports
                    .front()
                    .copied()
                    .unwrap_or(TabletReport {
                        buttons: 0,
                        x: 0,
                        y: 0,
                        wheel: 0,
                    });
                Ok(Some(report.encode().to_vec()))
            }
            (0x00, REQ_SET_CONFIGURATION) => {
                self.configuration = req.value as u8;
                debug!("tablet configured with configuration {}", self.configuration);
                Ok(None)
            }
            (0x01, REQ_SET_INTERFACE) => Ok(None),
            (0x21, REQ_HID_SET_IDLE) => {
                self.idle = (req.value >> 8) as u8;
                Ok(None)
            }
            (0x21, REQ_HID_SET_PROTOCOL) => {
                self.protocol = req.value as u8;
                Ok(None)
            }
            _ => {
                warn!(
                    "tablet stalls unknown request type {:#x} request {:#x}",
                    req.request_type, req.request
                );
                Err(UsbError::Stalled)
            }
        }
    }
}

impl UsbBackend for Tablet {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Emulated
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            usb_version: 0x200,
            speed: Speed::Full,
        }
    }

    fn reset(&mut self) -> Result<(), UsbError> {
        self.configuration = 0;
        self.idle = 0;
        self.protocol = 1;
        self.state.lock().unwrap().reports.clear();
        Ok(())
    }

    fn request(&mut self, xfer: &mut XferQueue) -> Result<(), UsbError> {
        let Some(ureq) = xfer.ureq else {
            return Err(UsbError::IoErrorTrb);
        };

        let response = self.control_in(&ureq);
        let mut short = false;
        let mut result = Ok(());

        match response {
            Ok(data) => {
                let mut payload = data.unwrap_or_default();
                payload.truncate(ureq.length as usize);
                let wanted = payload.len();
                let mut delivered = 0;
                for block in xfer.iter_mut() {
                    if block.processed != BlockState::Free {
                        continue;
                    }
                    if ureq.is_device_to_host() && delivered < wanted {
                        let n = block.write_data(self.dma_bus.as_ref(), &payload[delivered..]);
                        delivered += n;
                        if n < block.requested as usize {
                            short = true;
                        }
                        block.done = n as u32;
                    }
                    block.processed = BlockState::Done;
                }
                if ureq.is_device_to_host() && wanted < ureq.length as usize {
                    short = true;
                }
                trace!(
                    "tablet control request {:#x}/{:#x}: {delivered} of {} bytes",
                    ureq.request_type,
                    ureq.request,
                    ureq.length
                );
                if short {
                    result = Err(UsbError::ShortTransfer);
                }
            }
            Err(error) => {
                for block in xfer.iter_mut() {
                    if block.processed == BlockState::Free {
                        block.processed = BlockState::Done;
                    }
                }
                result = Err(error);
            }
        }
        result
    }

    fn data(&mut self, xfer: &mut XferQueue, dir: Direction, epidx: u8) -> Result<(), UsbError> {
        if dir != Direction::In || epidx != 1 {
            warn!("tablet has no endpoint {epidx} {dir:?}");
            return Err(UsbError::NoPipe);
        }

        let Some(report) = self.state.lock().unwrap().reports.pop_front() else {
            trace!("tablet has no pending report, NAK");
            return Err(UsbError::Nak);
        };

        let encoded = report.encode();
        for block in xfer.iter_mut() {
            if block.processed != BlockState::Free {
                continue;
            }
            block.done = block.write_data(self.dma_bus.as_ref(), &encoded) as u32;
            block.processed = BlockState::Done;
            return Ok(());
        }
        Ok(())
    }
}
