//! Producer side of the guest event ring.
//!
//! A single event-ring segment is supported (ERSTMax = 0); the segment
//! table is read once when ERSTBA is programmed.

use tracing::warn;

use crate::mem::MemoryBus;
use crate::xhci::trb::{CompletionCode, Trb, TrbType, TRB_LEN};

/// Outcome of an event insertion attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventInsert {
    Inserted,
    /// The ring just went full: a HOST_CONTROLLER / EV_RING_FULL event
    /// was produced in the last usable slot. An interrupt must follow.
    RingFullReported,
    /// The ring is (still) full or unconfigured; nothing was written.
    Refused,
}

impl EventInsert {
    /// Whether the caller's event actually reached the ring.
    pub fn ok(self) -> bool {
        matches!(self, EventInsert::Inserted)
    }
}

#[derive(Clone, Debug, Default)]
pub struct EventRing {
    /// Segment table GPA as programmed via ERSTBA.
    pub(crate) erstba: u64,
    /// Segment 0 base and size (in TRBs), latched from the table.
    pub(crate) seg_base: u64,
    pub(crate) seg_size: u32,
    pub(crate) enq_idx: u32,
    pub(crate) events_cnt: u32,
    /// Producer cycle state; toggles every wrap past index 0.
    pub(crate) pcs: bool,
}

impl EventRing {
    pub fn new() -> Self {
        Self {
            pcs: true,
            ..Self::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        self.seg_size != 0
    }

    pub fn events_cnt(&self) -> u32 {
        self.events_cnt
    }

    pub fn enqueue_index(&self) -> u32 {
        self.enq_idx
    }

    pub fn producer_cycle_state(&self) -> bool {
        self.pcs
    }

    pub fn segment_base(&self) -> u64 {
        self.seg_base
    }

    pub fn segment_size(&self) -> u32 {
        self.seg_size
    }

    /// Controller reset: indices and cycle state return to power-on
    /// values, the segment mapping is dropped.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Latch segment 0 from the table at `erstba` and restart the
    /// producer (an ERSTBA write re-initializes the ring).
    pub fn configure(&mut self, mem: &mut dyn MemoryBus, erstba: u64) {
        self.erstba = erstba;
        self.seg_base = mem.read_u64(erstba) & !0x3F;
        self.seg_size = mem.read_u32(erstba + 8) & 0xFFFF;
        self.enq_idx = 0;
        self.events_cnt = 0;
        self.pcs = true;
    }

    fn slot_gpa(&self, idx: u32) -> u64 {
        self.seg_base + u64::from(idx) * TRB_LEN as u64
    }

    fn push(&mut self, mem: &mut dyn MemoryBus, evt: &Trb) {
        let mut evt = *evt;
        evt.set_cycle(self.pcs);
        evt.write_to(mem, self.slot_gpa(self.enq_idx));
        self.enq_idx = (self.enq_idx + 1) % self.seg_size;
        if self.enq_idx == 0 {
            self.pcs = !self.pcs;
        }
        self.events_cnt += 1;
    }

    /// Enqueue one event TRB with the producer cycle bit applied.
    pub fn insert(&mut self, mem: &mut dyn MemoryBus, evt: &Trb) -> EventInsert {
        if !self.is_configured() {
            warn!("event insert with no event ring segment configured");
            return EventInsert::Refused;
        }
        if self.events_cnt >= self.seg_size {
            return EventInsert::Refused;
        }
        if self.events_cnt == self.seg_size - 1 {
            // Last usable slot: report the overflow instead of the
            // caller's event. Insertions fail until ERDP advances.
            let mut full = Trb::default();
            full.set_trb_type(TrbType::HostControllerEvent);
            full.set_completion_code(CompletionCode::EventRingFull);
            self.push(mem, &full);
            return EventInsert::RingFullReported;
        }
        self.push(mem, evt);
        EventInsert::Inserted
    }

    /// Recompute the occupancy count from a new guest dequeue pointer.
    pub fn erdp_update(&mut self, erdp: u64) {
        if self.events_cnt == 0 || !self.is_configured() {
            return;
        }
        let erdp = erdp & !0xF;
        if erdp < self.seg_base
            || erdp >= self.seg_base + u64::from(self.seg_size) * TRB_LEN as u64
        {
            warn!(erdp, "ERDP outside the configured event ring segment");
            return;
        }
        let erdp_idx = ((erdp - self.seg_base) / TRB_LEN as u64) as u32;
        self.events_cnt = if erdp_idx <= self.enq_idx {
            self.enq_idx - erdp_idx
        } else {
            self.seg_size - (erdp_idx - self.enq_idx)
        };
    }
}
