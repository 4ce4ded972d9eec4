//! Per-slot and per-endpoint controller-side state.
//!
//! Guest-visible state (context blocks) lives in guest memory; these
//! structures carry the hot copies: the slot state machine, the cached
//! transfer-ring cursors, and the in-flight transfer batch. Slots and
//! devices reference each other by index, never by pointer; backend
//! completion paths carry `(slot_id, epid)`.

use crate::usb::{UsbDevice, Xfer};
use crate::xhci::regs::MAX_ENDPOINTS;
use crate::xhci::ring::RingCursor;

/// Slot state machine (xHCI figure 4-1), driven by the command engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Disabled,
    Enabled,
    Default,
    Addressed,
    Configured,
}

/// Controller-side endpoint state: the cached ring cursor (kept in
/// lockstep with the endpoint context's TR dequeue field) and the
/// pending batch, if any.
#[derive(Debug, Default)]
pub(crate) struct Endpoint {
    pub ring: Option<RingCursor>,
    /// Per-stream cursors, indexed by stream id (entry 0 unused).
    pub streams: Vec<RingCursor>,
    pub xfer: Option<Xfer>,
}

impl Endpoint {
    /// Drop any in-flight batch; its outcome is discarded.
    pub fn reset_transfer(&mut self) {
        self.xfer = None;
    }

    pub fn clear(&mut self) {
        self.ring = None;
        self.streams.clear();
        self.xfer = None;
    }
}

/// One device slot: state, root-hub port binding and endpoint table.
#[derive(Debug)]
pub(crate) struct DeviceSlot {
    pub state: SlotState,
    /// Bound vport (1-based); zero until ADDRESS_DEVICE resolves one.
    pub vport: u8,
    pub eps: Vec<Endpoint>,
}

impl DeviceSlot {
    pub fn new() -> Self {
        Self {
            state: SlotState::Enabled,
            vport: 0,
            eps: (0..MAX_ENDPOINTS).map(|_| Endpoint::default()).collect(),
        }
    }

    pub fn ep(&self, epid: u8) -> &Endpoint {
        &self.eps[usize::from(epid)]
    }

    pub fn ep_mut(&mut self, epid: u8) -> &mut Endpoint {
        &mut self.eps[usize::from(epid)]
    }
}

/// A backend device attached to a virtual root-hub port.
pub(crate) struct AttachedDevice {
    pub model: Box<dyn UsbDevice>,
    /// Owning slot id once the device has been addressed; 0 otherwise.
    pub slot_id: u8,
}

impl AttachedDevice {
    pub fn new(model: Box<dyn UsbDevice>) -> Self {
        Self { model, slot_id: 0 }
    }
}
