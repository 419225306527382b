//! Transfer bookkeeping between the transfer rings and the backends.
//!
//! A doorbell turns a chain of transfer TRBs into a queue of transfer
//! blocks. Backends consume the blocks (filling in delivered byte counts),
//! and the completion path walks the queue again to write cycle bits back
//! into the guest TRBs and emit transfer events.

use thiserror::Error;

use crate::device::bus::{copy_from_guest, copy_to_guest, BusDevice};

/// Upper bound of queued blocks per endpoint.
pub const USB_MAX_XFER_BLOCKS: usize = 1024;

/// Processing state of a single block.
///
/// `Free` blocks are waiting for the backend. `Handled` blocks need no
/// backend action (setup/status/link bookkeeping). `Done` blocks carry a
/// backend result. The completion path drains blocks that reached at
/// least `Handled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BlockState {
    Free,
    Handled,
    Done,
}

/// Where the block's data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockBuffer {
    /// No data stage (status, link, bookkeeping blocks).
    None,
    /// Guest physical buffer.
    Guest(u64),
    /// Immediate data carried in the TRB itself.
    Immediate([u8; 8]),
}

/// One unit of transfer work, derived from one TRB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XferBlock {
    pub processed: BlockState,
    pub buffer: BlockBuffer,
    /// Bytes the guest asked for.
    pub requested: u32,
    /// Bytes the backend delivered.
    pub done: u32,
    /// Guest address of the originating TRB.
    pub trb_addr: u64,
    /// Guest address of the TRB following this one.
    pub trbnext: u64,
    /// Consumer cycle state to write back into the TRB on completion.
    pub ccs: bool,
    pub streamid: u32,
}

impl XferBlock {
    /// Read the block's OUT payload from guest memory.
    #[must_use]
    pub fn read_data(&self, bus: &dyn BusDevice) -> Vec<u8> {
        let len = self.requested as usize;
        match self.buffer {
            BlockBuffer::None => Vec::new(),
            BlockBuffer::Guest(addr) => {
                let mut data = vec![0; len];
                copy_from_guest(bus, addr, &mut data);
                data
            }
            BlockBuffer::Immediate(bytes) => bytes[..len.min(8)].to_vec(),
        }
    }

    /// Write IN payload towards the guest, returning the number of bytes
    /// that fit the block.
    pub fn write_data(&mut self, bus: &dyn BusDevice, data: &[u8]) -> usize {
        let len = data.len().min(self.requested as usize);
        if let BlockBuffer::Guest(addr) = self.buffer {
            copy_to_guest(bus, addr, &data[..len]);
            len
        } else {
            0
        }
    }
}

/// The 8-byte USB device request from a Setup Stage TRB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl DeviceRequest {
    /// Decode from the TRB parameter holding the request inline.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            request_type: raw as u8,
            request: (raw >> 8) as u8,
            value: (raw >> 16) as u16,
            index: (raw >> 32) as u16,
            length: (raw >> 48) as u16,
        }
    }

    /// Device-to-host direction bit of `bmRequestType`.
    #[must_use]
    pub const fn is_device_to_host(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transfer queue full")]
pub struct QueueFull;

/// Bounded queue of transfer blocks for one endpoint (or stream).
#[derive(Debug)]
pub struct XferQueue {
    blocks: std::collections::VecDeque<XferBlock>,
    /// Pending control request, captured from the Setup Stage TRB.
    pub ureq: Option<DeviceRequest>,
}

impl XferQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks: std::collections::VecDeque::new(),
            ureq: None,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Append a block at the tail.
    pub fn append(&mut self, block: XferBlock) -> Result<&mut XferBlock, QueueFull> {
        if self.blocks.len() >= USB_MAX_XFER_BLOCKS {
            return Err(QueueFull);
        }
        self.blocks.push_back(block);
        Ok(self.blocks.back_mut().unwrap())
    }

    /// The block at the head of the queue.
    #[must_use]
    pub fn peek_head(&self) -> Option<&XferBlock> {
        self.blocks.front()
    }

    /// Remove and return the head block.
    pub fn pop_head(&mut self) -> Option<XferBlock> {
        self.blocks.pop_front()
    }

    /// Iterate the queued blocks from head to tail.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut XferBlock> {
        self.blocks.iter_mut()
    }

    /// Drop all queued work, e.g. on Reset Endpoint.
    pub fn reset(&mut self) {
        self.blocks.clear();
        self.ureq = None;
    }
}

impl Default for XferQueue {
    fn default() -> Self {
        Self::new()
    }
}
