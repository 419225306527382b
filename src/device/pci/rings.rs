//! Abstractions of the rings (Event Ring, Command Ring, Transfer Rings) of
//! a USB3 Host (XHCI) controller.
//!
//! All ring storage lives in guest memory; the structures here hold the
//! register state and cursors and go through the DMA bus for every TRB.

use tracing::{debug, trace, warn};

use crate::device::bus::{BusDeviceRef, GuestAccess};

use super::constants::xhci::{
    operational::crcr,
    rings::{event_ring::segments_table_entry_offsets, TRB_SIZE},
    runtime::{erdp, iman},
};
use super::trb::{
    zeroed_trb_buffer, CommandTrb, CommandTrbVariant, CompletionCode, EventTrb, RawTrbBuffer, Trb,
};

/// The Event Ring: a unidirectional means of communication, allowing the
/// controller to send events to the driver.
///
/// This struct owns the single interrupter register set as well, because
/// ERDP and IMAN are tightly coupled with the ring state: acknowledging
/// the dequeue pointer recomputes the fill level and clears the pending
/// latch.
///
/// The Event Ring Segment Table is limited to a single segment
/// (HCSPARAMS2.ERSTMAX = 0).
#[derive(Debug)]
pub struct EventRing {
    /// Access to guest memory.
    dma_bus: BusDeviceRef,
    /// Interrupter management register.
    iman: u64,
    /// Interrupter moderation register; a delay hint only, no batching.
    imod: u64,
    /// Number of ERST entries the driver programmed.
    erstsz: u64,
    /// Guest address of the Event Ring Segment Table.
    erstba: u64,
    /// Event Ring Dequeue Pointer register, including the EHB bit.
    erdp: u64,
    /// Guest address of the first (and only) ring segment.
    segment_base: u64,
    /// TRB capacity of the segment.
    segment_size: u32,
    /// Enqueue index within the segment.
    enq_idx: u32,
    /// Number of events the guest has not consumed yet.
    events_cnt: u32,
    /// Producer cycle state.
    pcs: bool,
}

/// What an event insertion did, beyond the completion code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertResult {
    pub code: CompletionCode,
    /// The ring just became full; an interrupt is forced.
    pub force_interrupt: bool,
}

impl EventRing {
    pub fn new(dma_bus: BusDeviceRef) -> Self {
        Self {
            dma_bus,
            iman: 0,
            imod: super::constants::xhci::runtime::IMOD_DEFAULT,
            erstsz: 0,
            erstba: 0,
            erdp: 0,
            segment_base: 0,
            segment_size: 0,
            enq_idx: 0,
            events_cnt: 0,
            pcs: true,
        }
    }

    /// Controller reset: forget position and fill level, producer cycle
    /// state returns to one.
    pub fn reset(&mut self) {
        self.enq_idx = 0;
        self.events_cnt = 0;
        self.pcs = true;
    }

    #[must_use]
    pub const fn read_iman(&self) -> u64 {
        self.iman
    }

    /// Handle an IMAN write. Writing one to IP clears the pending latch.
    pub fn write_iman(&mut self, value: u64) {
        let mut pending = self.iman & iman::IP;
        if value & iman::IP != 0 {
            pending = 0;
        }
        self.iman = (value & iman::IE) | pending;
    }

    #[must_use]
    pub const fn read_imod(&self) -> u64 {
        self.imod
    }

    pub fn write_imod(&mut self, value: u64) {
        self.imod = value & 0xFFFF_FFFF;
    }

    #[must_use]
    pub const fn read_erstsz(&self) -> u64 {
        self.erstsz
    }

    pub fn write_erstsz(&mut self, value: u64) {
        self.erstsz = value & 0xFFFF;
    }

    #[must_use]
    pub const fn read_erstba(&self) -> u64 {
        self.erstba
    }

    pub fn write_erstba_lo(&mut self, value: u64) {
        self.erstba = (self.erstba & !0xFFFF_FFFF) | (value & 0xFFFF_FFC0);
    }

    /// The high half completes the base address; resolve the first segment
    /// table entry.
    pub fn write_erstba_hi(&mut self, value: u64) {
        self.erstba = (self.erstba & 0xFFFF_FFFF) | (value << 32);
        self.configure();
    }

    fn configure(&mut self) {
        let entry = self.erstba & !0x3F;
        self.segment_base = self
            .dma_bus
            .read_u64(entry + segments_table_entry_offsets::BASE_ADDR)
            & !0x3F;
        self.segment_size = self
            .dma_bus
            .read_u32(entry + segments_table_entry_offsets::SIZE)
            & 0xFFFF;
        debug!(
            "event ring segment at {:#x} with space for {} TRBs",
            self.segment_base, self.segment_size
        );
    }

    /// Whether the driver has programmed a segment table entry yet.
    #[must_use]
    pub const fn is_configured(&self) -> bool {
        self.segment_size != 0
    }

    #[must_use]
    pub const fn read_erdp(&self) -> u64 {
        self.erdp
    }

    /// Handle a write to the low half of ERDP.
    ///
    /// Writing one to the busy bit (EHB) acknowledges the interrupt: both
    /// EHB and IMAN.IP clear. The fill level is recomputed from the new
    /// dequeue position.
    pub fn write_erdp_lo(&mut self, value: u64) {
        self.erdp = (self.erdp & !0xFFFF_FFFF) | (self.erdp & erdp::EHB) | (value & 0xFFFF_FFF0);
        if value & erdp::EHB != 0 {
            self.erdp &= !erdp::EHB;
            self.iman &= !iman::IP;
        }
        self.recompute_events();
    }

    pub fn write_erdp_hi(&mut self, value: u64) {
        self.erdp = (self.erdp & 0xFFFF_FFFF) | (value << 32);
        self.recompute_events();
    }

    fn recompute_events(&mut self) {
        if self.events_cnt == 0 || self.segment_size == 0 {
            return;
        }
        let pointer = self.erdp & erdp::POINTER_MASK;
        if pointer < self.segment_base {
            return;
        }
        let deq_idx = ((pointer - self.segment_base) / TRB_SIZE as u64) as u32;
        if deq_idx >= self.segment_size {
            return;
        }
        self.events_cnt = if deq_idx <= self.enq_idx {
            self.enq_idx - deq_idx
        } else {
            self.segment_size - (deq_idx - self.enq_idx)
        };
        debug!("erdp {:#x}, events count now {}", pointer, self.events_cnt);
    }

    /// Latch the "event pending" state: ERDP.EHB and IMAN.IP.
    pub fn set_busy_and_pending(&mut self) {
        self.erdp |= erdp::EHB;
        self.iman |= iman::IP;
    }

    /// Whether this interrupter may raise interrupts.
    #[must_use]
    pub const fn interrupts_enabled(&self) -> bool {
        self.iman & iman::IE != 0
    }

    /// Number of unconsumed events.
    #[must_use]
    pub const fn events_cnt(&self) -> u32 {
        self.events_cnt
    }

    #[must_use]
    pub const fn enqueue_index(&self) -> u32 {
        self.enq_idx
    }

    #[must_use]
    pub const fn producer_cycle_state(&self) -> bool {
        self.pcs
    }

    fn write_at_enqueue(&mut self, trb: &EventTrb) {
        let addr = self.segment_base + u64::from(self.enq_idx) * TRB_SIZE as u64;
        self.dma_bus.write_bulk(addr, &trb.to_bytes(self.pcs));
        trace!("enqueued event TRB at {:#x} ({:?})", addr, trb);
        self.enq_idx = (self.enq_idx + 1) % self.segment_size;
        if self.enq_idx == 0 {
            self.pcs = !self.pcs;
        }
        self.events_cnt += 1;
    }

    /// Insert an event TRB.
    ///
    /// When the insert lands in the last free slot, a synthetic Host
    /// Controller event reporting `EventRingFullError` is written in its
    /// place and an interrupt is forced; further inserts fail until the
    /// guest advances ERDP.
    pub fn insert(&mut self, trb: &EventTrb) -> InsertResult {
        if self.segment_size == 0 {
            warn!("dropping event, event ring not configured");
            return InsertResult {
                code: CompletionCode::Undefined,
                force_interrupt: false,
            };
        }

        if self.events_cnt >= self.segment_size {
            warn!("cannot insert event, ring full");
            return InsertResult {
                code: CompletionCode::EventRingFullError,
                force_interrupt: false,
            };
        }

        if self.events_cnt == self.segment_size - 1 {
            warn!("event ring filled up, reporting ring-full to the driver");
            self.write_at_enqueue(&EventTrb::new_ring_full_event_trb());
            return InsertResult {
                code: CompletionCode::EventRingFullError,
                force_interrupt: true,
            };
        }

        self.write_at_enqueue(trb);
        InsertResult {
            code: CompletionCode::Success,
            force_interrupt: false,
        }
    }
}

/// The Command Ring: a unidirectional means of communication, allowing the
/// driver to send commands to the controller.
#[derive(Debug)]
pub struct CommandRing {
    /// Access to guest memory.
    dma_bus: BusDeviceRef,
    /// Set while the command interpreter runs (CRCR.CRR).
    running: bool,
    /// The Command Ring Dequeue Pointer, advanced as commands complete.
    dequeue_pointer: u64,
    /// The controller's consumer cycle state.
    cycle_state: bool,
}

impl CommandRing {
    pub fn new(dma_bus: BusDeviceRef) -> Self {
        Self {
            dma_bus,
            running: false,
            dequeue_pointer: 0,
            cycle_state: false,
        }
    }

    /// Handle a write to the low half of CRCR.
    ///
    /// While the ring runs, only the stop/abort control bits are accepted.
    /// Otherwise the driver installs a new dequeue pointer and consumer
    /// cycle state.
    pub fn write_lo(&mut self, value: u64) {
        if self.running {
            if value & (crcr::CA | crcr::CS) != 0 {
                warn!("stopping/aborting a running command ring is not implemented");
            }
            return;
        }
        self.dequeue_pointer = (self.dequeue_pointer & !0xFFFF_FFFF) | (value & 0xFFFF_FFC0);
        self.cycle_state = value & crcr::RCS != 0;
        debug!(
            "configuring command ring with dp={:#x} and cs={}",
            self.dequeue_pointer, self.cycle_state as u8
        );
    }

    pub fn write_hi(&mut self, value: u64) {
        if self.running {
            return;
        }
        self.dequeue_pointer = (self.dequeue_pointer & 0xFFFF_FFFF) | (value << 32);
    }

    /// Current CRCR read value: everything reads zero except CRR.
    #[must_use]
    pub const fn status(&self) -> u64 {
        if self.running {
            crcr::CRR
        } else {
            0
        }
    }

    /// Mark command processing as started/finished (CRCR.CRR).
    pub fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    /// Try to retrieve a new command from the command ring.
    ///
    /// This function only returns `CommandTrb`s that represent commands,
    /// i.e., it will not return Link TRBs. Instead, Link TRBs are handled
    /// in place, which is the reason why the function might read two TRBs
    /// to return a single one.
    pub fn next_command_trb(&mut self) -> Option<CommandTrb> {
        let first_trb_buffer = self.next_trb_buffer()?;
        let first_trb = CommandTrbVariant::parse(first_trb_buffer);

        let final_trb = match first_trb {
            CommandTrbVariant::Link(link_data) => {
                self.dequeue_pointer = link_data.ring_segment_pointer;
                if link_data.toggle_cycle {
                    self.cycle_state = !self.cycle_state;
                }
                // look at the first TRB of the new memory segment
                let second_trb_buffer = self.next_trb_buffer()?;
                let second_trb = CommandTrbVariant::parse(second_trb_buffer);
                if matches!(second_trb, CommandTrbVariant::Link(_)) {
                    warn!("Link TRB directly follows another Link TRB, stopping");
                    return None;
                }
                second_trb
            }
            _ => first_trb,
        };

        let address = self.dequeue_pointer;
        self.dequeue_pointer = self.dequeue_pointer.wrapping_add(TRB_SIZE as u64);

        Some(CommandTrb {
            address,
            variant: final_trb,
        })
    }

    /// Try to retrieve a fresh command TRB buffer from the command ring.
    fn next_trb_buffer(&self) -> Option<RawTrbBuffer> {
        let mut trb_buffer = zeroed_trb_buffer();
        self.dma_bus
            .read_bulk(self.dequeue_pointer, &mut trb_buffer);

        trace!(
            "interpreting TRB at dequeue pointer; cycle state = {}, TRB = {:?}",
            self.cycle_state as u8,
            trb_buffer
        );

        let cycle_bit = trb_buffer[12] & 0x1 != 0;
        if cycle_bit != self.cycle_state {
            // cycle-bit mismatch: no new command TRB available
            return None;
        }

        Some(trb_buffer)
    }
}

/// Dequeue cursor of a transfer ring (one per endpoint, or per stream).
///
/// All ring contents live in guest memory; this is only the position and
/// the consumer cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrbRing {
    pub dequeue_pointer: u64,
    pub cycle_state: bool,
}

impl TrbRing {
    #[must_use]
    pub const fn new(dequeue_pointer: u64, cycle_state: bool) -> Self {
        Self {
            dequeue_pointer,
            cycle_state,
        }
    }

    /// Build a cursor from a TR dequeue pointer qword with DCS in bit 0.
    #[must_use]
    pub const fn from_pointer_and_cycle(value: u64) -> Self {
        Self {
            dequeue_pointer: value & !0xF,
            cycle_state: value & 0x1 != 0,
        }
    }

    /// The qword representation with DCS in bit 0.
    #[must_use]
    pub const fn to_pointer_and_cycle(self) -> u64 {
        self.dequeue_pointer | self.cycle_state as u64
    }

    /// Read the raw TRB at the cursor.
    #[must_use]
    pub fn current_trb(&self, dma_bus: &BusDeviceRef) -> Trb {
        let mut buffer = zeroed_trb_buffer();
        dma_bus.read_bulk(self.dequeue_pointer, &mut buffer);
        Trb::from_bytes(buffer)
    }
}
