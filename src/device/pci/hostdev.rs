//! Port-mapped backend for physical USB devices, built on nusb.
//!
//! Control requests execute synchronously while the controller lock is
//! held (they are short and bounded by a timeout). Bulk and interrupt
//! data goes through per-endpoint worker tasks on the shared runtime;
//! the workers complete transfers through the controller's notify entry
//! point, taking the controller mutex like every other actor.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, Weak};
use std::time::Duration;

use nusb::transfer::{
    Buffer, Bulk, BulkOrInterrupt, ControlIn, ControlOut, ControlType, In, Interrupt, Out,
    Recipient,
};
use nusb::{Interface, MaybeFuture};
use tokio::select;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::async_runtime::runtime;
use crate::device::bus::{copy_to_guest, BusDeviceRef};

use super::backend::{
    BackendInfo, DeviceKind, Direction, NativeDeviceSource, Speed, UsbBackend, UsbError,
};
use super::device_slots::endpoint_type;
use super::ports::DeviceInfo;
use super::xfer::{BlockBuffer, BlockState, XferQueue};
use super::xhci::XhciController;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(200);

impl From<nusb::Speed> for Speed {
    fn from(value: nusb::Speed) -> Self {
        match value {
            nusb::Speed::Low => Self::Low,
            nusb::Speed::Full => Self::Full,
            nusb::Speed::High => Self::High,
            _ => Self::Super,
        }
    }
}

/// Creates [`HostDevice`] backends for one attached nusb device.
pub struct HostDeviceSource {
    device: nusb::Device,
    info: DeviceInfo,
    controller: Weak<Mutex<XhciController>>,
}

impl HostDeviceSource {
    #[must_use]
    pub fn new(
        device: nusb::Device,
        info: DeviceInfo,
        controller: Weak<Mutex<XhciController>>,
    ) -> Self {
        Self {
            device,
            info,
            controller,
        }
    }
}

impl Debug for HostDeviceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDeviceSource")
            .field("info", &self.info)
            .finish()
    }
}

impl NativeDeviceSource for HostDeviceSource {
    fn create_backend(
        &self,
        dma_bus: BusDeviceRef,
        slot_id: u8,
    ) -> Result<Box<dyn UsbBackend>, UsbError> {
        let backend = HostDevice::open(
            self.device.clone(),
            self.info,
            dma_bus,
            slot_id,
            self.controller.clone(),
        )?;
        Ok(Box::new(backend))
    }
}

/// One block of a data job handed to an endpoint worker.
#[derive(Debug)]
struct JobBlock {
    trb_addr: u64,
    guest_addr: Option<u64>,
    requested: u32,
    /// OUT payload, copied out of guest memory while the lock was held.
    out_data: Option<Vec<u8>>,
}

#[derive(Debug)]
struct TransferJob {
    blocks: Vec<JobBlock>,
}

#[derive(Debug)]
struct EndpointWorker {
    sender: mpsc::UnboundedSender<TransferJob>,
}

/// The pass-through device backend.
pub struct HostDevice {
    device: nusb::Device,
    interfaces: Vec<Interface>,
    info: DeviceInfo,
    dma_bus: BusDeviceRef,
    slot_id: u8,
    controller: Weak<Mutex<XhciController>>,
    /// Endpoint context types announced via configure, by endpoint id.
    ep_types: HashMap<u8, u32>,
    workers: HashMap<u8, EndpointWorker>,
    cancel: CancellationToken,
}

impl Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The active configuration is either cached or not available for
        // unconfigured devices. There is no I/O for this.
        f.debug_struct("HostDevice")
            .field("info", &self.info)
            .field("interfaces", &self.interfaces.len())
            .finish()
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        debug!("HostDevice dropped, stopping all endpoint workers");
        self.cancel.cancel();
    }
}

impl HostDevice {
    fn open(
        device: nusb::Device,
        info: DeviceInfo,
        dma_bus: BusDeviceRef,
        slot_id: u8,
        controller: Weak<Mutex<XhciController>>,
    ) -> Result<Self, UsbError> {
        // Claim all interfaces of the active configuration.
        let mut interfaces = vec![];
        let desc = device.active_configuration().map_err(|error| {
            warn!("host device has no active configuration: {error}");
            UsbError::NoPipe
        })?;
        for interface in desc.interfaces() {
            let interface_number = interface.interface_number();
            debug!("claiming interface {interface_number}");
            interfaces.push(
                device
                    .detach_and_claim_interface(interface_number)
                    .wait()
                    .map_err(|error| {
                        warn!("failed to claim interface {interface_number}: {error}");
                        UsbError::InUse
                    })?,
            );
        }

        Ok(Self {
            device,
            interfaces,
            info,
            dma_bus,
            slot_id,
            controller,
            ep_types: HashMap::new(),
            workers: HashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    fn interface_containing_endpoint(&self, endpoint_address: u8) -> Option<&Interface> {
        self.interfaces.iter().find(|interface| {
            interface
                .descriptor()
                .is_some_and(|desc| desc.endpoints().any(|ep| ep.address() == endpoint_address))
        })
    }

    /// Lazily create the worker task servicing an endpoint.
    fn ensure_worker(&mut self, endpoint_id: u8, dir: Direction) -> Result<(), UsbError> {
        if self.workers.contains_key(&endpoint_id) {
            return Ok(());
        }

        let number = endpoint_id / 2;
        let address = match dir {
            Direction::In => 0x80 | number,
            Direction::Out => number,
        };
        let interface = self
            .interface_containing_endpoint(address)
            .ok_or(UsbError::NoPipe)?;

        let ep_type = self.ep_types.get(&endpoint_id).copied().unwrap_or_else(|| {
            warn!("endpoint {endpoint_id} was never configured, assuming bulk");
            if dir == Direction::In {
                endpoint_type::BULK_IN
            } else {
                endpoint_type::BULK_OUT
            }
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        let ctx = WorkerContext {
            dma_bus: self.dma_bus.clone(),
            controller: self.controller.clone(),
            slot_id: self.slot_id,
            endpoint_id,
            cancel: self.cancel.clone(),
        };

        match (ep_type, dir) {
            (endpoint_type::BULK_IN, Direction::In) => {
                let endpoint = interface
                    .endpoint::<Bulk, In>(address)
                    .map_err(|_| UsbError::NoPipe)?;
                runtime().spawn(transfer_in_worker(endpoint, receiver, ctx));
            }
            (endpoint_type::INTERRUPT_IN, Direction::In) => {
                let endpoint = interface
                    .endpoint::<Interrupt, In>(address)
                    .map_err(|_| UsbError::NoPipe)?;
                runtime().spawn(transfer_in_worker(endpoint, receiver, ctx));
            }
            (endpoint_type::BULK_OUT, Direction::Out) => {
                let endpoint = interface
                    .endpoint::<Bulk, Out>(address)
                    .map_err(|_| UsbError::NoPipe)?;
                runtime().spawn(transfer_out_worker(endpoint, receiver, ctx));
            }
            (ep_type, dir) => {
                warn!("unsupported endpoint type {ep_type} ({dir:?}) on pass-through device");
                return Err(UsbError::NoPipe);
            }
        }

        self.workers.insert(endpoint_id, EndpointWorker { sender });
        debug!("started worker for endpoint id {endpoint_id}");
        Ok(())
    }

    fn control_request(&mut self, xfer: &mut XferQueue) -> Result<(), UsbError> {
        let Some(request) = xfer.ureq else {
            return Err(UsbError::IoErrorTrb);
        };

        debug!(
            "forwarding control request: request_type={:#x}, request={:#x}, value={:#x}, \
             index={}, length={}",
            request.request_type, request.request, request.value, request.index, request.length
        );

        let (recipient, control_type) = extract_recipient_and_type(request.request_type);

        if request.is_device_to_host() {
            let control = ControlIn {
                control_type,
                recipient,
                request: request.request,
                value: request.value,
                index: request.index,
                length: request.length,
            };
            let data = self
                .device
                .control_in(control, CONTROL_TIMEOUT)
                .wait()
                .map_err(map_transfer_error)?;

            let mut short = data.len() < request.length as usize;
            let mut offset = 0;
            for block in xfer.iter_mut() {
                if block.processed != BlockState::Free {
                    continue;
                }
                if offset < data.len() {
                    let n = block.write_data(self.dma_bus.as_ref(), &data[offset..]);
                    offset += n;
                    block.done = n as u32;
                    if n < block.requested as usize {
                        short = true;
                    }
                }
                block.processed = BlockState::Done;
            }
            if short {
                return Err(UsbError::ShortTransfer);
            }
        } else {
            let mut payload = Vec::new();
            for block in xfer.iter_mut() {
                if block.processed != BlockState::Free {
                    continue;
                }
                if !matches!(block.buffer, BlockBuffer::None) {
                    payload.extend_from_slice(&block.read_data(self.dma_bus.as_ref()));
                    block.done = block.requested;
                }
                block.processed = BlockState::Done;
            }
            let control = ControlOut {
                control_type,
                recipient,
                request: request.request,
                value: request.value,
                index: request.index,
                data: &payload,
            };
            self.device
                .control_out(control, CONTROL_TIMEOUT)
                .wait()
                .map_err(map_transfer_error)?;
        }

        Ok(())
    }
}

impl UsbBackend for HostDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::PortMapper
    }

    fn info(&self) -> BackendInfo {
        BackendInfo {
            usb_version: self.info.bcd_usb,
            speed: self.info.speed,
        }
    }

    fn reset(&mut self) -> Result<(), UsbError> {
        // A real port reset would invalidate the open device handle; the
        // hot-attach path already reset the device before handing it over.
        debug!("reset requested for {}", self.info.path);
        Ok(())
    }

    fn request(&mut self, xfer: &mut XferQueue) -> Result<(), UsbError> {
        self.control_request(xfer)
    }

    fn data(&mut self, xfer: &mut XferQueue, dir: Direction, epidx: u8) -> Result<(), UsbError> {
        let endpoint_id = epidx * 2 + u8::from(dir == Direction::In);
        self.ensure_worker(endpoint_id, dir)?;

        let mut blocks = Vec::new();
        for block in xfer.iter_mut() {
            if block.processed != BlockState::Free {
                continue;
            }
            let (guest_addr, out_data) = match (dir, block.buffer) {
                (Direction::In, BlockBuffer::Guest(addr)) => (Some(addr), None),
                (Direction::Out, _) => (None, Some(block.read_data(self.dma_bus.as_ref()))),
                _ => (None, None),
            };
            blocks.push(JobBlock {
                trb_addr: block.trb_addr,
                guest_addr,
                requested: block.requested,
                out_data,
            });
        }

        if blocks.is_empty() {
            return Ok(());
        }

        let worker = self.workers.get(&endpoint_id).unwrap();
        worker
            .sender
            .send(TransferJob { blocks })
            .map_err(|_| UsbError::IoError)?;
        trace!("queued transfer job for endpoint id {endpoint_id}");
        Ok(())
    }

    fn configure_endpoint(&mut self, endpoint_id: u8, ep_type: u32) {
        debug!("endpoint id {endpoint_id} configured with type {ep_type}");
        self.ep_types.insert(endpoint_id, ep_type);
    }

    fn stop(&mut self) {
        self.cancel.cancel();
        self.workers.clear();
        self.cancel = CancellationToken::new();
    }
}

fn extract_recipient_and_type(request_type: u8) -> (Recipient, ControlType) {
    let recipient = match request_type & 0x1f {
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => Recipient::Device,
    };
    let control_type = match (request_type >> 5) & 0x3 {
        1 => ControlType::Class,
        2 => ControlType::Vendor,
        _ => ControlType::Standard,
    };
    (recipient, control_type)
}

fn map_transfer_error(error: nusb::transfer::TransferError) -> UsbError {
    match error {
        nusb::transfer::TransferError::Stall => UsbError::Stalled,
        nusb::transfer::TransferError::Cancelled => UsbError::Cancelled,
        nusb::transfer::TransferError::Disconnected => UsbError::IoError,
        _ => UsbError::IoError,
    }
}

#[derive(Debug)]
struct WorkerContext {
    dma_bus: BusDeviceRef,
    controller: Weak<Mutex<XhciController>>,
    slot_id: u8,
    endpoint_id: u8,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn complete(&self, results: &[(u64, u32)], status: Result<(), UsbError>) {
        let Some(controller) = self.controller.upgrade() else {
            return;
        };
        controller.lock().unwrap().transfer_completed(
            self.slot_id,
            self.endpoint_id,
            results,
            status,
        );
        debug!(
            "completed transfer batch on endpoint id {} ({} blocks)",
            self.endpoint_id,
            results.len()
        );
    }
}

const fn determine_buffer_size(guest_transfer_length: usize, max_packet_size: usize) -> usize {
    if guest_transfer_length <= max_packet_size {
        max_packet_size
    } else {
        guest_transfer_length.div_ceil(max_packet_size) * max_packet_size
    }
}

async fn transfer_in_worker<EpType: BulkOrInterrupt>(
    mut endpoint: nusb::Endpoint<EpType, In>,
    mut receiver: mpsc::UnboundedReceiver<TransferJob>,
    ctx: WorkerContext,
) {
    loop {
        let job = select! {
            job = receiver.recv() => match job {
                Some(job) => job,
                None => return,
            },
            _ = ctx.cancel.cancelled() => {
                debug!("worker for ep {}: stopped by cancel token", ctx.endpoint_id);
                return;
            }
        };

        let mut results = Vec::with_capacity(job.blocks.len());
        let mut status = Ok(());

        for block in &job.blocks {
            let requested = block.requested as usize;
            // The device delivers whole packets; round the host buffer up
            // and clamp the guest copy to what was asked for.
            let buffer_size = determine_buffer_size(requested, endpoint.max_packet_size());
            endpoint.submit(Buffer::new(buffer_size));
            let buffer = select! {
                buffer = endpoint.next_complete() => buffer,
                _ = ctx.cancel.cancelled() => return,
            };

            let byte_count = buffer.actual_len.min(requested);
            if let Some(addr) = block.guest_addr {
                copy_to_guest(ctx.dma_bus.as_ref(), addr, &buffer.buffer[..byte_count]);
            }
            if byte_count < requested {
                status = Err(UsbError::ShortTransfer);
            }
            results.push((block.trb_addr, byte_count as u32));
        }

        ctx.complete(&results, status);
    }
}

async fn transfer_out_worker(
    mut endpoint: nusb::Endpoint<Bulk, Out>,
    mut receiver: mpsc::UnboundedReceiver<TransferJob>,
    ctx: WorkerContext,
) {
    loop {
        let job = select! {
            job = receiver.recv() => match job {
                Some(job) => job,
                None => return,
            },
            _ = ctx.cancel.cancelled() => {
                debug!("worker for ep {}: stopped by cancel token", ctx.endpoint_id);
                return;
            }
        };

        let mut results = Vec::with_capacity(job.blocks.len());

        for block in &job.blocks {
            let data = block.out_data.clone().unwrap_or_default();
            let len = data.len() as u32;
            endpoint.submit(data.into());
            select! {
                _ = endpoint.next_complete() => {}
                _ = ctx.cancel.cancelled() => return,
            }
            results.push((block.trb_addr, len));
        }

        ctx.complete(&results, Ok(()));
    }
}
