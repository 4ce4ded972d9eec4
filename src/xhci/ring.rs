//! Consumer-side cursor over a guest TRB ring.

use thiserror::Error;

use crate::mem::MemoryBus;
use crate::xhci::trb::{Trb, TrbType, TRB_LEN};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum RingError {
    /// A LINK chain exceeded the caller's step budget; the ring is
    /// treated as malformed and iteration stops.
    #[error("TRB ring step budget exceeded")]
    StepBudgetExceeded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingItem {
    pub paddr: u64,
    pub trb: Trb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingPoll {
    Ready(RingItem),
    /// The TRB at the cursor carries the producer's previous cycle
    /// state: the ring is empty.
    NotReady,
    Err(RingError),
}

/// Dequeue pointer plus consumer cycle state.
///
/// LINK TRBs are followed transparently (toggling the cycle state when
/// TC is set); they are never returned to the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingCursor {
    dequeue_ptr: u64,
    cycle_state: bool,
}

impl RingCursor {
    pub fn new(dequeue_ptr: u64, cycle_state: bool) -> Self {
        Self {
            dequeue_ptr: dequeue_ptr & !0xF,
            cycle_state,
        }
    }

    pub fn dequeue_ptr(&self) -> u64 {
        self.dequeue_ptr
    }

    pub fn cycle_state(&self) -> bool {
        self.cycle_state
    }

    /// Overwrite cursor position (Set TR Dequeue Pointer).
    pub fn seek(&mut self, dequeue_ptr: u64, cycle_state: bool) {
        self.dequeue_ptr = dequeue_ptr & !0xF;
        self.cycle_state = cycle_state;
    }

    /// Fetch the next TRB whose cycle bit matches, following at most
    /// `step_budget` LINK hops.
    pub fn poll(&mut self, mem: &mut dyn MemoryBus, step_budget: usize) -> RingPoll {
        for _ in 0..step_budget {
            let trb = Trb::read_from(mem, self.dequeue_ptr);
            if trb.cycle() != self.cycle_state {
                return RingPoll::NotReady;
            }
            if trb.trb_type() == TrbType::Link {
                if trb.link_toggle_cycle() {
                    self.cycle_state = !self.cycle_state;
                }
                self.dequeue_ptr = trb.pointer();
                continue;
            }
            let item = RingItem {
                paddr: self.dequeue_ptr,
                trb,
            };
            self.dequeue_ptr += TRB_LEN as u64;
            return RingPoll::Ready(item);
        }
        RingPoll::Err(RingError::StepBudgetExceeded)
    }
}
