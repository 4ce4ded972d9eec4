//! Transfer-ring consumer and completion path.
//!
//! A doorbell (or a device interrupt) either re-submits the endpoint's
//! pending batch or walks its transfer ring, assembling TRBs into an
//! [`Xfer`] chain that is handed to the backend. Completion maps the
//! backend status onto xHCI completion codes and emits Transfer Events
//! for IOC TRBs and short packets, then advances the guest-visible
//! dequeue pointer.

use tracing::{debug, warn};

use crate::mem::MemoryBus;
use crate::usb::{SetupPacket, UsbDir, UsbStatus, Xfer, XferBlock};
use crate::xhci::command::RING_STEP_BUDGET;
use crate::xhci::context::{
    device_ep_context_gpa, EndpointContext, EpCtxState, EpCtxType, StreamContext,
};
use crate::xhci::regs::{
    pls_field, pls_value, PLS_RESUME, PLS_U3, PORTSC_PLC, PORTSC_PLS_MASK, MAX_ENDPOINTS,
    USBCMD_RUN,
};
use crate::xhci::ring::{RingCursor, RingPoll};
use crate::xhci::trb::{transfer_event, CompletionCode, Trb, TrbType};
use crate::xhci::XhciController;

/// Batch size caps per endpoint type, bounding one ring walk.
fn max_blocks(ep_type: EpCtxType) -> Option<usize> {
    match ep_type {
        EpCtxType::Control | EpCtxType::InterruptIn | EpCtxType::InterruptOut => Some(128),
        EpCtxType::BulkIn | EpCtxType::BulkOut => Some(1024),
        EpCtxType::IsochIn | EpCtxType::IsochOut => Some(2048),
        EpCtxType::Invalid => None,
    }
}

fn block_dir(epid: u8, setup: Option<SetupPacket>) -> UsbDir {
    if epid == 1 {
        match setup {
            Some(s) if s.is_device_to_host() => UsbDir::In,
            _ => UsbDir::Out,
        }
    } else if epid % 2 == 1 {
        UsbDir::In
    } else {
        UsbDir::Out
    }
}

impl XhciController {
    /// Doorbell N>0: start or continue transfers for `(slot, endpoint,
    /// stream)`.
    pub fn device_doorbell(&mut self, mem: &mut dyn MemoryBus, slot_id: u8, epid: u8, stream_id: u16) {
        if !self.is_valid_slot(slot_id) || self.slots[usize::from(slot_id)].is_none() {
            warn!(slot_id, "doorbell for invalid slot");
            return;
        }
        if !(1..MAX_ENDPOINTS).contains(&epid) {
            warn!(epid, "doorbell for invalid endpoint");
            return;
        }
        let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) else {
            return;
        };
        let ep_gpa = device_ep_context_gpa(dev_ctx, epid);
        let ep_ctx = EndpointContext::read_from(mem, ep_gpa);
        if ep_ctx.qw2 == 0 {
            return;
        }

        let pending = self.slots[usize::from(slot_id)]
            .as_ref()
            .unwrap()
            .ep(epid)
            .xfer
            .as_ref()
            .is_some_and(|x| x.is_pending());
        if pending {
            self.retry_pending_xfer(mem, slot_id, epid, ep_gpa);
            return;
        }

        // Resolve the ring cursor for this doorbell target.
        let cursor = if ep_ctx.max_pstreams() > 0 {
            // Stream ids 0, 65534 (prime) and 65535 (any) are invalid.
            if stream_id == 0 || stream_id >= 65534 {
                warn!(stream_id, "doorbell with invalid stream id");
                return;
            }
            let sctx_gpa = match self.find_stream(mem, &ep_ctx, stream_id) {
                Ok(gpa) => gpa,
                Err(code) => {
                    warn!(stream_id, ?code, "doorbell stream lookup failed");
                    return;
                }
            };
            let sctx = StreamContext::read_from(mem, sctx_gpa);
            let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
            let endpoint = slot.ep_mut(epid);
            let idx = usize::from(stream_id);
            if endpoint.streams.len() <= idx {
                endpoint
                    .streams
                    .resize_with(idx + 1, || RingCursor::new(0, false));
            }
            if endpoint.streams[idx].dequeue_ptr() == 0 {
                endpoint.streams[idx] =
                    RingCursor::new(sctx.tr_dequeue_pointer(), sctx.dequeue_cycle_state());
            }
            endpoint.streams[idx]
        } else {
            if stream_id != 0 {
                warn!(stream_id, "doorbell with stream id on non-stream endpoint");
                return;
            }
            let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
            let endpoint = slot.ep_mut(epid);
            *endpoint.ring.get_or_insert_with(|| {
                RingCursor::new(ep_ctx.tr_dequeue_pointer(), ep_ctx.dequeue_cycle_state())
            })
        };

        self.run_transfer(mem, slot_id, epid, stream_id, ep_gpa, ep_ctx, cursor);
    }

    /// Walk the ring at `cursor`, submit the assembled batch, complete
    /// it toward the guest. EP0 control TDs with a mid-TD IOC complete
    /// the stage and continue assembling.
    #[allow(clippy::too_many_arguments)]
    fn run_transfer(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        epid: u8,
        stream_id: u16,
        ep_gpa: u64,
        mut ep_ctx: EndpointContext,
        mut cursor: RingCursor,
    ) {
        let Some(block_cap) = max_blocks(ep_ctx.ep_type()) else {
            warn!(epid, "doorbell on endpoint with invalid type");
            return;
        };

        ep_ctx.set_state(EpCtxState::Running);
        ep_ctx.write_to(mem, ep_gpa);

        let mut xfer = Xfer::new(slot_id, epid);

        loop {
            let mut control_retry = false;
            let mut in_control_td = xfer.setup.is_some();

            loop {
                if xfer.blocks.len() >= block_cap {
                    break;
                }
                let item = match cursor.poll(mem, RING_STEP_BUDGET) {
                    RingPoll::Ready(item) => item,
                    RingPoll::NotReady => break,
                    RingPoll::Err(err) => {
                        warn!(?err, slot_id, epid, "transfer ring walk aborted");
                        return;
                    }
                };
                let trb = item.trb;
                let control = trb.control;
                let ty = trb.trb_type();

                let mut block = XferBlock {
                    trb_gpa: item.paddr,
                    trb_next: cursor.dequeue_ptr(),
                    ccs: cursor.cycle_state(),
                    trb_control: control,
                    stream_id,
                    ..XferBlock::default()
                };

                match ty {
                    TrbType::SetupStage => {
                        if !trb.immediate_data() || trb.transfer_len() != 8 {
                            warn!(slot_id, "malformed SETUP stage TRB");
                            return;
                        }
                        xfer.setup = Some(SetupPacket::from_bytes(trb.parameter.to_le_bytes()));
                        in_control_td = true;
                        block.processed = true;
                        xfer.append(block);
                    }
                    TrbType::Normal | TrbType::Isoch if in_control_td => {
                        warn!(slot_id, epid, "NORMAL/ISOCH TRB inside a control TD");
                        return;
                    }
                    TrbType::Normal | TrbType::Isoch | TrbType::DataStage => {
                        let len = trb.transfer_len();
                        if trb.immediate_data() {
                            let mut data = trb.parameter.to_le_bytes().to_vec();
                            data.truncate(len.min(8) as usize);
                            block.data = data;
                        } else {
                            block.gpa = trb.parameter;
                            match block_dir(epid, xfer.setup) {
                                UsbDir::Out => {
                                    let mut data = vec![0u8; len as usize];
                                    mem.read_physical(trb.parameter, &mut data);
                                    block.data = data;
                                }
                                UsbDir::In => block.data = vec![0u8; len as usize],
                            }
                        }
                        block.len = len;
                        xfer.append(block);
                    }
                    TrbType::StatusStage => {
                        xfer.append(block);
                    }
                    TrbType::NoOp => {
                        block.processed = true;
                        xfer.append(block);
                    }
                    TrbType::EventData => {
                        // Event Data payload travels in the parameter.
                        block.gpa = trb.parameter;
                        block.processed = epid > 1 && trb.ioc();
                        xfer.append(block);
                    }
                    other => {
                        warn!(?other, slot_id, epid, "unexpected TRB on transfer ring");
                        return;
                    }
                }

                if trb.ioc() {
                    if epid == 1 {
                        control_retry = true;
                    }
                    break;
                }
                if !in_control_td && !trb.chain() {
                    break;
                }
            }

            if xfer.blocks.is_empty() {
                return;
            }

            let status = self.submit_to_backend(&mut xfer);
            xfer.status = status;

            if status == UsbStatus::Cancelled && xfer.blocks[xfer.head].nak {
                // Batch stays parked at the head of the ring; a later
                // doorbell or device interrupt retries it.
                let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
                slot.ep_mut(epid).xfer = Some(xfer);
                return;
            }

            let consumed = self.complete_xfer(mem, &mut xfer);
            if control_retry && consumed {
                xfer.reset();
                continue;
            }

            if epid != 1 && !consumed {
                let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
                slot.ep_mut(epid).xfer = Some(xfer);
            }
            return;
        }
    }

    /// Re-submit a previously NAKed (or partially completed) batch.
    fn retry_pending_xfer(&mut self, mem: &mut dyn MemoryBus, slot_id: u8, epid: u8, ep_gpa: u64) {
        let mut ep_ctx = EndpointContext::read_from(mem, ep_gpa);
        ep_ctx.set_state(EpCtxState::Running);
        ep_ctx.write_to(mem, ep_gpa);

        let Some(mut xfer) = self.slots[usize::from(slot_id)]
            .as_mut()
            .unwrap()
            .ep_mut(epid)
            .xfer
            .take()
        else {
            return;
        };

        let status = self.submit_to_backend(&mut xfer);
        xfer.status = status;

        if status == UsbStatus::Cancelled && xfer.blocks[xfer.head].nak {
            let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
            slot.ep_mut(epid).xfer = Some(xfer);
            return;
        }

        let consumed = self.complete_xfer(mem, &mut xfer);
        if !consumed {
            let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
            slot.ep_mut(epid).xfer = Some(xfer);
        }
    }

    /// Hand the batch to the backend bound to the owning port.
    fn submit_to_backend(&mut self, xfer: &mut Xfer) -> UsbStatus {
        let slot_id = xfer.slot_id;
        let epid = xfer.epid;
        let Some(vport) = self.slot_vport(slot_id) else {
            return UsbStatus::NotStarted;
        };
        let Some(dev) = self.devices[usize::from(vport)].as_mut() else {
            return UsbStatus::NotStarted;
        };
        if epid == 1 {
            let Some(setup) = xfer.setup else {
                return UsbStatus::NotStarted;
            };
            dev.model.request(setup, xfer)
        } else {
            let dir = block_dir(epid, None);
            dev.model.data(dir, epid / 2, xfer)
        }
    }

    /// Deliver a completed (or partially completed) batch to the guest:
    /// per-TRB events, residuals, EDTLA, halt-on-stall, and the dequeue
    /// pointer advance. Returns true when every block was consumed.
    pub(crate) fn complete_xfer(&mut self, mem: &mut dyn MemoryBus, xfer: &mut Xfer) -> bool {
        let slot_id = xfer.slot_id;
        let epid = xfer.epid;
        let base_code = CompletionCode::from_usb(xfer.status);

        let ep_gpa = self
            .device_context_gpa(mem, slot_id)
            .map(|ctx| device_ep_context_gpa(ctx, epid));

        if xfer.status == UsbStatus::Stalled {
            if let Some(gpa) = ep_gpa {
                let mut ep_ctx = EndpointContext::read_from(mem, gpa);
                ep_ctx.set_state(EpCtxState::Halted);
                ep_ctx.write_to(mem, gpa);
            }
        }

        let dir = block_dir(epid, xfer.setup);
        let mut edtla: u32 = 0;
        let mut rem_len: u32 = 0;
        let mut do_intr = false;
        let mut i = xfer.head;

        while i < xfer.blocks.len() {
            let block = &xfer.blocks[i];
            if !block.processed && !block.handled {
                break;
            }

            if dir == UsbDir::In && block.gpa != 0 && block.done > 0 {
                let n = (block.done as usize).min(block.data.len());
                mem.write_physical(block.gpa, &block.data[..n]);
            }

            edtla = edtla.wrapping_add(block.done);
            rem_len += block.remaining();

            let ty = TrbType::from_raw(((block.trb_control >> 10) & 0x3F) as u8);
            let chained = block.trb_control & Trb::CONTROL_CHAIN_BIT != 0 && ty != TrbType::EventData;
            if chained {
                // Mid-TD: accumulate the residual, delay any IOC until
                // the TD's terminal TRB.
                i += 1;
                continue;
            }

            let mut code = base_code;
            if code == CompletionCode::Success && rem_len > 0 {
                code = CompletionCode::ShortPacket;
            }

            let ioc = block.trb_control & Trb::CONTROL_IOC_BIT != 0;
            let isp = block.trb_control & Trb::CONTROL_ISP_BIT != 0;
            if !ioc && !(code == CompletionCode::ShortPacket && isp) {
                i += 1;
                continue;
            }

            let evt = if ty == TrbType::EventData {
                let mut evt = Trb::new(block.gpa, edtla & Trb::STATUS_EDTLA_MASK, 0);
                evt.set_trb_type(TrbType::TransferEvent);
                evt.set_completion_code(code);
                evt.set_slot_id(slot_id);
                evt.set_endpoint_id(epid);
                evt.control |= Trb::CONTROL_ED_BIT;
                edtla = 0;
                evt
            } else {
                transfer_event(block.trb_gpa, slot_id, epid, code, rem_len)
            };

            do_intr = true;
            if !self.insert_event(mem, &evt, false).ok() {
                warn!(slot_id, epid, "event ring full during transfer completion");
                break;
            }
            rem_len = 0;
            i += 1;
        }
        xfer.head = i;

        let consumed = i >= xfer.blocks.len();
        if consumed {
            if let Some(last) = xfer.blocks.last() {
                self.commit_dequeue(mem, slot_id, epid, ep_gpa, last.trb_next, last.ccs, last.stream_id);
            }
        }

        if do_intr {
            self.assert_interrupt();
        }
        debug!(
            slot_id,
            epid,
            status = ?xfer.status,
            consumed,
            "transfer completion"
        );
        consumed
    }

    /// Advance the cached cursor and the guest-visible dequeue pointer
    /// past a fully consumed batch.
    #[allow(clippy::too_many_arguments)]
    fn commit_dequeue(
        &mut self,
        mem: &mut dyn MemoryBus,
        slot_id: u8,
        epid: u8,
        ep_gpa: Option<u64>,
        next: u64,
        ccs: bool,
        stream_id: u16,
    ) {
        let slot = self.slots[usize::from(slot_id)].as_mut().unwrap();
        let endpoint = slot.ep_mut(epid);
        endpoint.xfer = None;

        if stream_id != 0 {
            let idx = usize::from(stream_id);
            if let Some(cursor) = endpoint.streams.get_mut(idx) {
                cursor.seek(next, ccs);
            }
            if let Some(gpa) = ep_gpa {
                let ep_ctx = EndpointContext::read_from(mem, gpa);
                let sctx_gpa = ep_ctx.tr_dequeue_pointer() + u64::from(stream_id) * 16;
                let mut sctx = StreamContext::read_from(mem, sctx_gpa);
                sctx.qw0 = (next & !0xF) | (sctx.qw0 & 0xE) | u64::from(ccs);
                sctx.write_to(mem, sctx_gpa);
            }
        } else {
            match endpoint.ring.as_mut() {
                Some(cursor) => cursor.seek(next, ccs),
                None => endpoint.ring = Some(RingCursor::new(next, ccs)),
            }
            if let Some(gpa) = ep_gpa {
                let mut ep_ctx = EndpointContext::read_from(mem, gpa);
                ep_ctx.set_tr_dequeue(next, ccs);
                ep_ctx.write_to(mem, gpa);
            }
        }
    }

    /// Backend-initiated activity on `vport` / endpoint address
    /// `ep_addr` (bit 7 = IN). Wakes a suspended link, then services
    /// the endpoint as if its doorbell had been rung.
    pub fn device_interrupt(&mut self, mem: &mut dyn MemoryBus, vport: u8, ep_addr: u8) {
        if !crate::xhci::ports::PortTable::is_valid_vport(vport) {
            return;
        }
        // The guest has to finish bring-up before device events matter.
        if !self.interrupter().ring().is_configured() || self.usbcmd() & USBCMD_RUN == 0 {
            return;
        }
        let Some(slot_id) = self.devices[usize::from(vport)]
            .as_ref()
            .map(|d| d.slot_id)
            .filter(|&s| s != 0)
        else {
            return;
        };
        if self.device_context_gpa(mem, slot_id).is_none() {
            return;
        }

        let portsc = self.ports.portsc(vport);
        if pls_value(portsc) == PLS_U3 {
            let regs = self.ports.regs_mut(vport);
            regs.portsc = (regs.portsc & !PORTSC_PLS_MASK) | pls_field(PLS_RESUME);
            if portsc & PORTSC_PLC != 0 {
                return;
            }
            regs.portsc |= PORTSC_PLC;
            let evt = crate::xhci::trb::port_status_change(vport);
            self.insert_event(mem, &evt, false);
        }

        let epnum = ep_addr & 0x7F;
        if epnum > 15 {
            return;
        }
        let epid = epnum * 2 + u8::from(ep_addr & 0x80 != 0);
        if !(1..MAX_ENDPOINTS).contains(&epid) {
            return;
        }
        if let Some(dev_ctx) = self.device_context_gpa(mem, slot_id) {
            let ep_ctx = EndpointContext::read_from(mem, device_ep_context_gpa(dev_ctx, epid));
            if ep_ctx.state() == EpCtxState::Disabled {
                return;
            }
        }
        self.device_doorbell(mem, slot_id, epid, 0);
    }
}
