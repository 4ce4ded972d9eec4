//! Command-ring consumer.
//!
//! Doorbell 0 kicks [`XhciController::process_command_ring`]: TRBs are
//! consumed while their cycle bit matches, each non-LINK command is
//! dispatched and answered with a Command Completion Event carrying the
//! command TRB's address.

use tracing::{debug, warn};

use crate::mem::MemoryBus;
use crate::usb::DevInfo;
use crate::xhci::context::{
    device_ep_context_gpa, input_ep_context_gpa, input_slot_context_gpa, EndpointContext,
    EpCtxState, InputControlContext, SlotContext, SlotCtxState, StreamContext, CONTEXT_SIZE,
};
use crate::xhci::device::{AttachedDevice, DeviceSlot, SlotState};
use crate::xhci::port_mapper::VportState;
use crate::xhci::regs::{CRCR_CA, CRCR_CRR, CRCR_RCS, MAX_SLOTS, MAX_STREAMS};
use crate::xhci::ring::{RingCursor, RingPoll};
use crate::xhci::trb::{command_completion, CompletionCode, Trb, TrbType};
use crate::xhci::XhciController;

/// LINK hops tolerated per dequeue before the ring counts as malformed.
pub(crate) const RING_STEP_BUDGET: usize = 32;

/// Copy one 32-byte context record between guest locations.
fn copy_context(mem: &mut dyn MemoryBus, src: u64, dst: u64) {
    let mut raw = [0u8; CONTEXT_SIZE];
    mem.read_physical(src, &mut raw);
    mem.write_physical(dst, &raw);
}

impl XhciController {
    /// Run the command ring until it is empty or `budget` commands have
    /// been processed.
    pub fn process_command_ring(&mut self, mem: &mut dyn MemoryBus, budget: usize) {
        if self.crcr & CRCR_CRR != 0 {
            return;
        }
        if self.crcr & !0xF == 0 {
            warn!("doorbell 0 with no command ring programmed");
            return;
        }
        self.crcr |= CRCR_CRR;

        let mut cursor = RingCursor::new(self.crcr & !0xF, self.crcr & CRCR_RCS != 0);
        for _ in 0..budget {
            let item = match cursor.poll(mem, RING_STEP_BUDGET) {
                RingPoll::Ready(item) => item,
                RingPoll::NotReady => break,
                RingPoll::Err(err) => {
                    warn!(?err, "command ring walk aborted");
                    break;
                }
            };

            let trb = item.trb;
            let ty = trb.trb_type();
            debug!(?ty, paddr = item.paddr, "command");

            let slot_arg = trb.slot_id();
            let (slot_for_event, code) = match ty {
                TrbType::EnableSlotCommand => self.cmd_enable_slot(),
                TrbType::DisableSlotCommand => (slot_arg, self.cmd_disable_slot(slot_arg)),
                TrbType::AddressDeviceCommand => {
                    (slot_arg, self.cmd_address_device(mem, slot_arg, &trb))
                }
                TrbType::ConfigureEndpointCommand => {
                    (slot_arg, self.cmd_configure_endpoint(mem, slot_arg, &trb))
                }
                TrbType::EvaluateContextCommand => {
                    (slot_arg, self.cmd_evaluate_context(mem, slot_arg, &trb))
                }
                TrbType::ResetEndpointCommand => {
                    (slot_arg, self.cmd_reset_endpoint(mem, slot_arg, &trb))
                }
                TrbType::StopEndpointCommand => {
                    (slot_arg, self.cmd_stop_endpoint(mem, slot_arg, &trb))
                }
                TrbType::SetTrDequeuePointerCommand => {
                    (slot_arg, self.cmd_set_tr_dequeue(mem, slot_arg, &trb))
                }
                TrbType::ResetDeviceCommand => (slot_arg, self.cmd_reset_device(mem, slot_arg)),
                TrbType::NoOpCommand => (0, CompletionCode::Success),
                other => {
                    warn!(?other, "unsupported command");
                    (0, CompletionCode::TrbError)
                }
            };

            let evt = command_completion(item.paddr, slot_for_event, code);
            self.insert_event(mem, &evt, true);
        }

        self.crcr = cursor.dequeue_ptr()
            | (self.crcr & CRCR_CA)
            | u64::from(cursor.cycle_state());
        self.crcr &= !CRCR_CRR;
    }

    fn cmd_enable_slot(&mut self) -> (u8, CompletionCode) {
        for slot_id in 1..=MAX_SLOTS {
            let idx = usize::from(slot_id);
            if !self.slot_allocated[idx] {
                self.slot_allocated[idx] = true;
                self.slots[idx] = Some(DeviceSlot::new());
                debug!(slot_id, "enable slot");
                return (slot_id, CompletionCode::Success);
            }
        }
        (0, CompletionCode::NoSlotsAvailable)
    }

    fn cmd_disable_slot(&mut self, slot_id: u8) -> CompletionCode {
        if !self.is_valid_slot(slot_id) {
            return CompletionCode::SlotNotEnabled;
        }
        let idx = usize::from(slot_id);
        match self.slots[idx].take() {
            None => CompletionCode::SlotNotEnabled,
            Some(slot) if slot.state == SlotState::Disabled => {
                self.slots[idx] = Some(slot);
                CompletionCode::SlotNotEnabled
            }
            Some(slot) => {
                self.slot_allocated[idx] = false;
                self.release_slot_device(slot.vport, slot_id);
                debug!(slot_id, "disable slot");
                CompletionCode::Success
            }
        }
    }

    /// Free the device binding owned by a disabled slot. The model is
    /// destroyed only when the port no longer reports a connection; a
    /// still-connected device stays attached for a later ADDRESS_DEVICE.
    fn release_slot_device(&mut self, vport: u8, slot_id: u8) {
        if vport == 0 {
            return;
        }
        if let Some(dev) = self.devices[usize::from(vport)].as_mut() {
            if dev.slot_id == slot_id {
                dev.slot_id = 0;
            }
        }
        let connected =
            self.ports.portsc(vport) & crate::xhci::regs::PORTSC_CCS != 0;
        if !connected {
            if let Some(mut dev) = self.devices[usize::from(vport)].take() {
                dev.model.deinit();
            }
        }
    }

    fn cmd_address_device(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        trb: &Trb,
    ) -> CompletionCode {
        let input_ctx = trb.pointer();
        let icc = InputControlContext::read_from(mem, input_ctx);

        // Address Device requires exactly slot + EP0 added, nothing dropped.
        if icc.drop_flags != 0 || icc.add_flags & 0x3 != 0x3 {
            warn!(
                drop = icc.drop_flags,
                add = icc.add_flags,
                "address device: bad input control context"
            );
            return CompletionCode::TrbError;
        }
        if !self.is_valid_slot(slot_id) || self.slots[usize::from(slot_id)].is_none() {
            return CompletionCode::SlotNotEnabled;
        }

        let islot = SlotContext::read_from(mem, input_slot_context_gpa(input_ctx));

        // Resolve the root-hub port and make sure a backend device is
        // bound there, instantiating a passthrough model on first use.
        let vport = {
            let bound = self.slots[usize::from(slot_id)].as_ref().unwrap().vport;
            if bound != 0 {
                bound
            } else {
                let rh_port = islot.root_hub_port_number();
                if !(1..=crate::xhci::regs::MAX_PORTS).contains(&rh_port) {
                    warn!(rh_port, "address device: bad root hub port");
                    return CompletionCode::TrbError;
                }
                if self.devices[usize::from(rh_port)].is_none() {
                    match self.instantiate_native_device(rh_port) {
                        Some(dev) => self.devices[usize::from(rh_port)] = Some(dev),
                        None => {
                            warn!(rh_port, "address device: no device behind port");
                            return CompletionCode::TrbError;
                        }
                    }
                }
                rh_port
            }
        };

        if self.devices[usize::from(vport)].is_none() {
            warn!(vport, "address device: port has no backend device");
            return CompletionCode::TrbError;
        }

        let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) else {
            return CompletionCode::ContextStateError;
        };

        if let Some(index) = self.mapper.index_by_vport(vport) {
            if let Some(entry) = self.mapper.entry_mut(index) {
                entry.state = VportState::Emulated;
            }
        }
        self.slots[usize::from(slot_id)].as_mut().unwrap().vport = vport;
        self.devices[usize::from(vport)].as_mut().unwrap().slot_id = slot_id;

        if self.devices[usize::from(vport)]
            .as_mut()
            .unwrap()
            .model
            .reset()
            .is_err()
        {
            return CompletionCode::EndpointNotEnabled;
        }

        // Copy slot + EP0 contexts to the output and stamp our state.
        copy_context(mem, input_slot_context_gpa(input_ctx), dev_ctx);
        let mut oslot = SlotContext::read_from(mem, dev_ctx);
        oslot.set_slot_state(SlotCtxState::Addressed);
        oslot.set_usb_device_address(slot_id);
        oslot.write_to(mem, dev_ctx);

        let ep0_src = input_ep_context_gpa(input_ctx, 1);
        let ep0_dst = device_ep_context_gpa(dev_ctx, 1);
        copy_context(mem, ep0_src, ep0_dst);
        let mut ep0 = EndpointContext::read_from(mem, ep0_dst);
        ep0.set_state(EpCtxState::Running);
        ep0.write_to(mem, ep0_dst);

        let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
        slot.ep_mut(1).clear();
        slot.ep_mut(1).ring = Some(RingCursor::new(
            ep0.tr_dequeue_pointer(),
            ep0.dequeue_cycle_state(),
        ));
        slot.state = SlotState::Addressed;

        debug!(slot_id, vport, "address device");
        CompletionCode::Success
    }

    /// Create the backend model for the connected native device behind
    /// `vport`, if the mapper knows one and a factory is installed.
    fn instantiate_native_device(&mut self, vport: u8) -> Option<AttachedDevice> {
        let index = self.mapper.index_by_vport(vport)?;
        let info: DevInfo = {
            let entry = self.mapper.entry(index)?;
            if entry.state != VportState::Connected {
                return None;
            }
            entry.info.clone()
        };
        let factory = self.dev_factory.as_mut()?;
        let model = factory.create(&info)?;
        Some(AttachedDevice::new(model))
    }

    fn cmd_configure_endpoint(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        trb: &Trb,
    ) -> CompletionCode {
        if !self.is_valid_slot(slot_id) || self.slots[usize::from(slot_id)].is_none() {
            return CompletionCode::SlotNotEnabled;
        }
        let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) else {
            return CompletionCode::ContextStateError;
        };

        if trb.control & Trb::CONTROL_DC_BIT != 0 {
            // Deconfigure: back to Addressed with only EP0 alive.
            if let Some(vport) = self.slot_vport(slot_id) {
                if let Some(dev) = self.devices[usize::from(vport)].as_mut() {
                    dev.model.stop();
                }
            }
            let mut oslot = SlotContext::read_from(mem, dev_ctx);
            oslot.set_context_entries(1);
            oslot.set_slot_state(SlotCtxState::Addressed);
            oslot.write_to(mem, dev_ctx);

            for epid in 2..crate::xhci::regs::MAX_ENDPOINTS {
                self.disable_endpoint(mem, slot_id, dev_ctx, epid);
            }
            let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
            slot.state = SlotState::Addressed;
            debug!(slot_id, "deconfigure endpoints");
            return CompletionCode::Success;
        }

        {
            let slot = self.slots[usize::from(slot_id)].as_ref().unwrap();
            if !matches!(slot.state, SlotState::Addressed | SlotState::Configured) {
                return CompletionCode::SlotNotEnabled;
            }
        }

        let input_ctx = trb.pointer();
        let icc = InputControlContext::read_from(mem, input_ctx);

        for epid in 2..crate::xhci::regs::MAX_ENDPOINTS {
            if icc.drops(epid) {
                self.disable_endpoint(mem, slot_id, dev_ctx, epid);
            }
            if icc.adds(epid) {
                let src = input_ep_context_gpa(input_ctx, epid);
                let dst = device_ep_context_gpa(dev_ctx, epid);
                copy_context(mem, src, dst);
                let mut ep = EndpointContext::read_from(mem, dst);
                ep.set_state(EpCtxState::Running);
                ep.write_to(mem, dst);

                let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
                let endpoint = slot.ep_mut(epid);
                endpoint.clear();
                if ep.max_pstreams() == 0 {
                    endpoint.ring = Some(RingCursor::new(
                        ep.tr_dequeue_pointer(),
                        ep.dequeue_cycle_state(),
                    ));
                }
                debug!(slot_id, epid, "configure endpoint");
            }
        }

        let islot = SlotContext::read_from(mem, input_slot_context_gpa(input_ctx));
        let mut oslot = SlotContext::read_from(mem, dev_ctx);
        oslot.set_context_entries(islot.context_entries());
        oslot.set_slot_state(SlotCtxState::Configured);
        oslot.write_to(mem, dev_ctx);

        self.slots[usize::from(slot_id)].as_mut().unwrap().state = SlotState::Configured;
        CompletionCode::Success
    }

    fn disable_endpoint(&mut self, mem: &mut dyn MemoryBus, slot_id: u8, dev_ctx: u64, epid: u8) {
        let gpa = device_ep_context_gpa(dev_ctx, epid);
        let mut ep = EndpointContext::read_from(mem, gpa);
        ep.set_state(EpCtxState::Disabled);
        ep.write_to(mem, gpa);
        if let Some(slot) = self.slots[usize::from(slot_id)].as_mut() {
            slot.ep_mut(epid).clear();
        }
    }

    fn cmd_evaluate_context(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        trb: &Trb,
    ) -> CompletionCode {
        if !self.is_valid_slot(slot_id) || self.slots[usize::from(slot_id)].is_none() {
            return CompletionCode::SlotNotEnabled;
        }
        let input_ctx = trb.pointer();
        let icc = InputControlContext::read_from(mem, input_ctx);
        if icc.drop_flags != 0 || icc.add_flags & 0x3 == 0 {
            warn!("evaluate context: bad input control context");
            return CompletionCode::TrbError;
        }
        let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) else {
            return CompletionCode::ContextStateError;
        };

        if icc.adds(0) {
            let islot = SlotContext::read_from(mem, input_slot_context_gpa(input_ctx));
            let mut oslot = SlotContext::read_from(mem, dev_ctx);
            oslot.set_max_exit_latency(islot.max_exit_latency());
            oslot.set_interrupter_target(islot.interrupter_target());
            oslot.write_to(mem, dev_ctx);
        }
        if icc.adds(1) {
            let iep0 = EndpointContext::read_from(mem, input_ep_context_gpa(input_ctx, 1));
            let gpa = device_ep_context_gpa(dev_ctx, 1);
            let mut oep0 = EndpointContext::read_from(mem, gpa);
            oep0.set_max_packet_size(iep0.max_packet_size());
            oep0.write_to(mem, gpa);
        }
        CompletionCode::Success
    }

    /// RESET_EP recovers a halted endpoint: Halted -> Stopped plus a
    /// backend reset.
    fn cmd_reset_endpoint(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        trb: &Trb,
    ) -> CompletionCode {
        let epid = trb.endpoint_id();
        if !(1..crate::xhci::regs::MAX_ENDPOINTS).contains(&epid) {
            return CompletionCode::TrbError;
        }
        if !self.is_valid_slot(slot_id) || self.slots[usize::from(slot_id)].is_none() {
            return CompletionCode::SlotNotEnabled;
        }
        let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) else {
            return CompletionCode::ContextStateError;
        };
        let gpa = device_ep_context_gpa(dev_ctx, epid);
        let mut ep_ctx = EndpointContext::read_from(mem, gpa);
        if ep_ctx.state() != EpCtxState::Halted {
            return CompletionCode::ContextStateError;
        }
        self.stop_endpoint_common(mem, slot_id, epid, gpa, &mut ep_ctx);

        if let Some(vport) = self.slot_vport(slot_id) {
            if let Some(dev) = self.devices[usize::from(vport)].as_mut() {
                if dev.model.reset().is_err() {
                    return CompletionCode::EndpointNotEnabled;
                }
            }
        }
        CompletionCode::Success
    }

    /// STOP_EP parks a running endpoint; in-flight work is discarded.
    fn cmd_stop_endpoint(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        trb: &Trb,
    ) -> CompletionCode {
        let epid = trb.endpoint_id();
        if !(1..crate::xhci::regs::MAX_ENDPOINTS).contains(&epid) {
            return CompletionCode::TrbError;
        }
        if !self.is_valid_slot(slot_id) || self.slots[usize::from(slot_id)].is_none() {
            return CompletionCode::SlotNotEnabled;
        }
        let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) else {
            return CompletionCode::ContextStateError;
        };
        let gpa = device_ep_context_gpa(dev_ctx, epid);
        let mut ep_ctx = EndpointContext::read_from(mem, gpa);
        self.stop_endpoint_common(mem, slot_id, epid, gpa, &mut ep_ctx);
        CompletionCode::Success
    }

    /// Shared RESET_EP/STOP_EP tail: drop the pending batch, park the
    /// endpoint and resync the guest-visible dequeue pointer from the
    /// cached cursor.
    fn stop_endpoint_common(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        epid: u8,
        ep_ctx_gpa: u64,
        ep_ctx: &mut EndpointContext,
    ) {
        let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
        let endpoint = slot.ep_mut(epid);
        endpoint.reset_transfer();

        ep_ctx.set_state(EpCtxState::Stopped);
        if ep_ctx.max_pstreams() == 0 {
            if let Some(ring) = endpoint.ring {
                ep_ctx.set_tr_dequeue(ring.dequeue_ptr(), ring.cycle_state());
            }
        }
        ep_ctx.write_to(mem, ep_ctx_gpa);
    }

    fn cmd_set_tr_dequeue(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        trb: &Trb,
    ) -> CompletionCode {
        let epid = trb.endpoint_id();
        if !(1..crate::xhci::regs::MAX_ENDPOINTS).contains(&epid) {
            return CompletionCode::TrbError;
        }
        if !self.is_valid_slot(slot_id) || self.slots[usize::from(slot_id)].is_none() {
            return CompletionCode::SlotNotEnabled;
        }
        let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) else {
            return CompletionCode::ContextStateError;
        };
        let gpa = device_ep_context_gpa(dev_ctx, epid);
        let mut ep_ctx = EndpointContext::read_from(mem, gpa);
        if !matches!(ep_ctx.state(), EpCtxState::Stopped | EpCtxState::Error) {
            return CompletionCode::ContextStateError;
        }

        let new_ptr = trb.pointer();
        let new_dcs = trb.parameter & 1 != 0;
        let stream_id = trb.stream_id();

        if ep_ctx.max_pstreams() > 0 {
            let sctx_gpa = match self.find_stream(mem, &ep_ctx, stream_id) {
                Ok(gpa) => gpa,
                Err(code) => return code,
            };
            StreamContext { qw0: trb.parameter }.write_to(mem, sctx_gpa);
            let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
            let endpoint = slot.ep_mut(epid);
            let idx = usize::from(stream_id);
            if endpoint.streams.len() <= idx {
                endpoint
                    .streams
                    .resize_with(idx + 1, || RingCursor::new(0, false));
            }
            endpoint.streams[idx].seek(new_ptr, new_dcs);
        } else {
            if stream_id != 0 {
                warn!(stream_id, "set TR dequeue with stream id on non-stream endpoint");
            }
            ep_ctx.set_tr_dequeue(new_ptr, new_dcs);
            let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
            let endpoint = slot.ep_mut(epid);
            match endpoint.ring.as_mut() {
                Some(ring) => ring.seek(new_ptr, new_dcs),
                None => endpoint.ring = Some(RingCursor::new(new_ptr, new_dcs)),
            }
        }

        ep_ctx.set_state(EpCtxState::Stopped);
        ep_ctx.write_to(mem, gpa);
        CompletionCode::Success
    }

    fn cmd_reset_device(&mut self, mem: &mut dyn MemoryBus, slot_id: u8) -> CompletionCode {
        if !self.is_valid_slot(slot_id) || self.slots[usize::from(slot_id)].is_none() {
            return CompletionCode::SlotNotEnabled;
        }
        if self.slots[usize::from(slot_id)].as_ref().unwrap().state == SlotState::Disabled {
            return CompletionCode::SlotNotEnabled;
        }
        let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) else {
            return CompletionCode::ContextStateError;
        };

        let mut oslot = SlotContext::read_from(mem, dev_ctx);
        oslot.set_slot_state(SlotCtxState::Default);
        oslot.set_context_entries(1);
        oslot.set_usb_device_address(0);
        oslot.write_to(mem, dev_ctx);

        for epid in 2..crate::xhci::regs::MAX_ENDPOINTS {
            self.disable_endpoint(mem, slot_id, dev_ctx, epid);
        }
        let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
        slot.state = SlotState::Default;
        debug!(slot_id, "reset device");
        CompletionCode::Success
    }

    /// Locate the stream context for `stream_id`, validating the
    /// endpoint's stream configuration. Only primary stream 1 exists.
    pub(crate) fn find_stream(
        &mut self,
        mem: &mut dyn MemoryBus,
        ep_ctx: &EndpointContext,
        stream_id: u16,
    ) -> Result<u64, CompletionCode> {
        let max_pstreams = ep_ctx.max_pstreams();
        if max_pstreams == 0 {
            return Err(CompletionCode::TrbError);
        }
        if max_pstreams > u32::from(MAX_STREAMS) {
            return Err(CompletionCode::InvalidStreamId);
        }
        if !ep_ctx.linear_stream_array() {
            return Err(CompletionCode::InvalidStreamId);
        }
        if stream_id == 0 || u32::from(stream_id) > max_pstreams {
            return Err(CompletionCode::InvalidStreamType);
        }
        let gpa = ep_ctx.tr_dequeue_pointer() + u64::from(stream_id) * 16;
        let sctx = StreamContext::read_from(mem, gpa);
        if sctx.sct() == 0 {
            return Err(CompletionCode::InvalidStreamType);
        }
        Ok(gpa)
    }
}
