#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use virt_usb::xhci::context::CONTEXT_SIZE;
use virt_usb::xhci::regs;
use virt_usb::xhci::trb::{Trb, TrbType, TRB_LEN};
use virt_usb::xhci::XhciController;
use virt_usb::{
    MemoryBus, PciBus, SetupPacket, UsbDevice, UsbDir, UsbSpeed, UsbStatus, UsbVersion, Xfer,
};

pub struct TestMemory {
    pub data: Vec<u8>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) {
        let addr = addr as usize;
        buf.copy_from_slice(&self.data[addr..addr + buf.len()]);
    }

    pub fn write(&mut self, addr: u64, buf: &[u8]) {
        let addr = addr as usize;
        self.data[addr..addr + buf.len()].copy_from_slice(buf);
    }
}

impl MemoryBus for TestMemory {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]) {
        let Ok(start) = usize::try_from(paddr) else {
            buf.fill(0);
            return;
        };
        let Some(end) = start.checked_add(buf.len()) else {
            buf.fill(0);
            return;
        };
        if end > self.data.len() {
            buf.fill(0);
            return;
        }
        buf.copy_from_slice(&self.data[start..end]);
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) {
        let Ok(start) = usize::try_from(paddr) else {
            return;
        };
        let Some(end) = start.checked_add(buf.len()) else {
            return;
        };
        if end > self.data.len() {
            return;
        }
        self.data[start..end].copy_from_slice(buf);
    }
}

/// Bump allocator for laying out guest structures in test memory.
#[derive(Default)]
pub struct Alloc {
    next: u64,
}

impl Alloc {
    pub fn new(base: u64) -> Self {
        Self { next: base }
    }

    pub fn alloc(&mut self, size: u64, align: u64) -> u64 {
        let align = align.max(1);
        let mask = align - 1;
        let aligned = (self.next + mask) & !mask;
        self.next = aligned + size;
        aligned
    }
}

/// PCI seam that records interrupt deliveries.
#[derive(Clone, Default)]
pub struct TestPci {
    pub msi_enabled: Rc<Cell<bool>>,
    pub msi_count: Rc<Cell<u32>>,
    pub line_asserts: Rc<Cell<u32>>,
}

impl PciBus for TestPci {
    fn msi_enabled(&self) -> bool {
        self.msi_enabled.get()
    }

    fn raise_msi(&mut self) {
        self.msi_count.set(self.msi_count.get() + 1);
    }

    fn assert_intr(&mut self) {
        self.line_asserts.set(self.line_asserts.get() + 1);
    }

    fn deassert_intr(&mut self) {}

    fn set_cfg_byte(&mut self, _offset: u16, _value: u8) {}

    fn set_cfg_word(&mut self, _offset: u16, _value: u16) {}

    fn set_cfg_dword(&mut self, _offset: u16, _value: u32) {}
}

/// Scriptable backend device.
///
/// Control IN requests answer from `control_data`; bulk/interrupt IN
/// transfers pop `in_source` (NAK when empty); OUT payloads accumulate
/// in `out_sink`.
#[derive(Clone)]
pub struct TestDevice {
    pub version: UsbVersion,
    pub speed: UsbSpeed,
    pub control_data: Rc<RefCell<Vec<u8>>>,
    pub in_source: Rc<RefCell<VecDeque<Vec<u8>>>>,
    pub out_sink: Rc<RefCell<Vec<u8>>>,
    pub reset_count: Rc<Cell<u32>>,
    pub stall_next: Rc<Cell<bool>>,
}

impl TestDevice {
    pub fn usb3() -> Self {
        Self::with_version(UsbVersion::Usb3, UsbSpeed::Super)
    }

    pub fn usb2() -> Self {
        Self::with_version(UsbVersion::Usb2, UsbSpeed::High)
    }

    fn with_version(version: UsbVersion, speed: UsbSpeed) -> Self {
        Self {
            version,
            speed,
            control_data: Rc::new(RefCell::new(Vec::new())),
            in_source: Rc::new(RefCell::new(VecDeque::new())),
            out_sink: Rc::new(RefCell::new(Vec::new())),
            reset_count: Rc::new(Cell::new(0)),
            stall_next: Rc::new(Cell::new(false)),
        }
    }
}

impl UsbDevice for TestDevice {
    fn version(&self) -> UsbVersion {
        self.version
    }

    fn speed(&self) -> UsbSpeed {
        self.speed
    }

    fn reset(&mut self) -> Result<(), UsbStatus> {
        self.reset_count.set(self.reset_count.get() + 1);
        Ok(())
    }

    fn request(&mut self, setup: SetupPacket, xfer: &mut Xfer) -> UsbStatus {
        if self.stall_next.replace(false) {
            for block in xfer.unprocessed_mut() {
                block.handled = true;
            }
            return UsbStatus::Stalled;
        }

        let mut short = false;
        if setup.is_device_to_host() {
            let source = self.control_data.borrow();
            let mut offset = 0usize;
            for block in xfer.unprocessed_mut() {
                if block.len > 0 {
                    let want = block.len as usize;
                    let avail = source.len().saturating_sub(offset);
                    let n = want.min(avail);
                    block.data[..n].copy_from_slice(&source[offset..offset + n]);
                    block.done = n as u32;
                    offset += n;
                    if n < want {
                        short = true;
                    }
                }
                block.handled = true;
            }
        } else {
            for block in xfer.unprocessed_mut() {
                block.done = block.len;
                block.handled = true;
            }
        }
        if short {
            UsbStatus::ShortXfer
        } else {
            UsbStatus::NormalCompletion
        }
    }

    fn data(&mut self, dir: UsbDir, _epnum: u8, xfer: &mut Xfer) -> UsbStatus {
        if self.stall_next.replace(false) {
            for block in xfer.unprocessed_mut() {
                block.handled = true;
            }
            return UsbStatus::Stalled;
        }

        match dir {
            UsbDir::In => {
                let Some(payload) = self.in_source.borrow_mut().pop_front() else {
                    if let Some(head) = xfer.blocks.get_mut(xfer.head) {
                        head.nak = true;
                    }
                    return UsbStatus::Cancelled;
                };
                let mut offset = 0usize;
                for block in xfer.unprocessed_mut() {
                    if block.len > 0 {
                        let want = block.len as usize;
                        let avail = payload.len().saturating_sub(offset);
                        let n = want.min(avail);
                        block.data[..n].copy_from_slice(&payload[offset..offset + n]);
                        block.done = n as u32;
                        offset += n;
                    }
                    block.handled = true;
                }
            }
            UsbDir::Out => {
                let mut sink = self.out_sink.borrow_mut();
                for block in xfer.unprocessed_mut() {
                    sink.extend_from_slice(&block.data[..block.len as usize]);
                    block.done = block.len;
                    block.handled = true;
                }
            }
        }
        UsbStatus::NormalCompletion
    }
}

pub fn write_erst_entry(mem: &mut TestMemory, erstba: u64, seg_base: u64, seg_size_trbs: u32) {
    MemoryBus::write_u64(mem, erstba, seg_base);
    MemoryBus::write_u32(mem, erstba + 8, seg_size_trbs);
    MemoryBus::write_u32(mem, erstba + 12, 0);
}

pub fn configure_event_ring(
    ctrl: &mut XhciController,
    mem: &mut TestMemory,
    erstba: u64,
    ring_base: u64,
    ring_size_trbs: u32,
) {
    write_erst_entry(mem, erstba, ring_base, ring_size_trbs);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERSTSZ, 4, 1);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERSTBA_LO, 4, erstba & 0xFFFF_FFFF);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERSTBA_HI, 4, erstba >> 32);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERDP_LO, 4, ring_base & 0xFFFF_FFFF);
    ctrl.mmio_write(mem, regs::REG_INTR0_ERDP_HI, 4, ring_base >> 32);
    ctrl.mmio_write(mem, regs::REG_INTR0_IMAN, 4, u64::from(regs::IMAN_IE));
}

/// Put the controller in run state with interrupts enabled.
pub fn start_controller(ctrl: &mut XhciController, mem: &mut TestMemory) {
    ctrl.mmio_write(
        mem,
        regs::REG_USBCMD,
        4,
        u64::from(regs::USBCMD_RUN | regs::USBCMD_INTE),
    );
}

pub fn set_dcbaap(ctrl: &mut XhciController, mem: &mut TestMemory, dcbaa: u64) {
    ctrl.mmio_write(mem, regs::REG_DCBAAP_LO, 4, dcbaa & 0xFFFF_FFFF);
    ctrl.mmio_write(mem, regs::REG_DCBAAP_HI, 4, dcbaa >> 32);
}

pub fn set_command_ring(ctrl: &mut XhciController, mem: &mut TestMemory, base: u64) {
    ctrl.mmio_write(mem, regs::REG_CRCR_LO, 4, (base & 0xFFFF_FFFF) | 1);
    ctrl.mmio_write(mem, regs::REG_CRCR_HI, 4, base >> 32);
}

pub fn ring_doorbell(ctrl: &mut XhciController, mem: &mut TestMemory, slot_id: u8, target: u32) {
    let doorbell = regs::DB_OFF + u64::from(slot_id) * 4;
    ctrl.mmio_write(mem, doorbell, 4, u64::from(target));
}

pub fn configure_dcbaa_entry(mem: &mut TestMemory, dcbaa: u64, slot_id: u8, dev_ctx: u64) {
    MemoryBus::write_u64(mem, dcbaa + u64::from(slot_id) * 8, dev_ctx);
}

/// Input context for ADDRESS_DEVICE: add slot + EP0, root-hub port and
/// an EP0 control endpoint whose ring starts at `ep0_ring`.
pub fn write_address_input_ctx(mem: &mut TestMemory, input_ctx: u64, vport: u8, ep0_ring: u64) {
    MemoryBus::write_u32(mem, input_ctx, 0);
    MemoryBus::write_u32(mem, input_ctx + 4, 0x3);
    // Slot context: root hub port in dword1 bits 23:16.
    MemoryBus::write_u32(mem, input_ctx + 0x20 + 4, u32::from(vport) << 16);
    // EP0: control endpoint, max packet 64, ring with DCS=1.
    let ep0 = input_ctx + 2 * CONTEXT_SIZE as u64;
    MemoryBus::write_u32(mem, ep0 + 4, (4 << 3) | (64 << 16));
    MemoryBus::write_u64(mem, ep0 + 8, ep0_ring | 1);
}

pub fn ep_ctx_addr(dev_ctx: u64, epid: u8) -> u64 {
    dev_ctx + u64::from(epid) * CONTEXT_SIZE as u64
}

/// Seed a device-context endpoint entry directly (bypassing
/// CONFIGURE_EP) the way bring-up tests do.
pub fn write_endpoint_context(
    mem: &mut TestMemory,
    dev_ctx: u64,
    epid: u8,
    ep_type_raw: u8,
    max_packet_size: u16,
    ring_base: u64,
    dcs: bool,
) {
    let base = ep_ctx_addr(dev_ctx, epid);
    MemoryBus::write_u32(mem, base, 1); // Running
    MemoryBus::write_u32(
        mem,
        base + 4,
        (u32::from(ep_type_raw) << 3) | (u32::from(max_packet_size) << 16),
    );
    MemoryBus::write_u64(mem, base + 8, (ring_base & !0xF) | u64::from(dcs));
}

pub fn make_command(ty: TrbType, slot_id: u8) -> Trb {
    let mut trb = Trb::default();
    trb.set_trb_type(ty);
    trb.set_cycle(true);
    trb.set_slot_id(slot_id);
    trb
}

pub fn make_link(target: u64, toggle: bool) -> Trb {
    let mut trb = Trb::new(target, 0, 0);
    trb.set_trb_type(TrbType::Link);
    trb.set_cycle(true);
    trb.set_link_toggle_cycle(toggle);
    trb
}

pub fn make_normal(buf: u64, len: u32, ioc: bool) -> Trb {
    let mut trb = Trb::new(buf, len & Trb::STATUS_TRANSFER_LEN_MASK, 0);
    trb.set_trb_type(TrbType::Normal);
    trb.set_cycle(true);
    if ioc {
        trb.control |= Trb::CONTROL_IOC_BIT;
    }
    trb
}

pub fn read_event(mem: &mut TestMemory, ring_base: u64, index: u64) -> Trb {
    Trb::read_from(mem, ring_base + index * TRB_LEN as u64)
}

/// Fully enabled + addressed device on `vport`: returns the slot id and
/// the device context GPA installed in the DCBAA.
pub fn enable_and_address(
    ctrl: &mut XhciController,
    mem: &mut TestMemory,
    alloc: &mut Alloc,
    cmd_ring: u64,
    event_ring: u64,
    dcbaa: u64,
    vport: u8,
) -> (u8, u64) {
    enable_and_address_at(ctrl, mem, alloc, cmd_ring, event_ring, dcbaa, vport, 0)
}

/// [`enable_and_address`] with the completion events expected at
/// `evt_base` and `evt_base + 1` of the event ring.
#[allow(clippy::too_many_arguments)]
pub fn enable_and_address_at(
    ctrl: &mut XhciController,
    mem: &mut TestMemory,
    alloc: &mut Alloc,
    cmd_ring: u64,
    event_ring: u64,
    dcbaa: u64,
    vport: u8,
    evt_base: u64,
) -> (u8, u64) {
    let dev_ctx = alloc.alloc(0x400, 0x40);
    let input_ctx = alloc.alloc(0x420, 0x40);
    let ep0_ring = alloc.alloc(0x100, 0x10);
    write_address_input_ctx(mem, input_ctx, vport, ep0_ring);

    // Enable Slot.
    make_command(TrbType::EnableSlotCommand, 0).write_to(mem, cmd_ring);
    ring_doorbell(ctrl, mem, 0, 0);
    let evt = read_event(mem, event_ring, evt_base);
    assert_eq!(evt.trb_type(), TrbType::CommandCompletionEvent);
    assert_eq!(evt.completion_code_raw(), 1);
    let slot_id = evt.slot_id();
    assert_ne!(slot_id, 0);

    configure_dcbaa_entry(mem, dcbaa, slot_id, dev_ctx);

    // Address Device.
    let mut addr = make_command(TrbType::AddressDeviceCommand, slot_id);
    addr.parameter = input_ctx;
    addr.write_to(mem, cmd_ring + TRB_LEN as u64);
    ring_doorbell(ctrl, mem, 0, 0);
    let evt = read_event(mem, event_ring, evt_base + 1);
    assert_eq!(evt.trb_type(), TrbType::CommandCompletionEvent);
    assert_eq!(
        evt.completion_code_raw(),
        1,
        "ADDRESS_DEVICE should succeed"
    );

    (slot_id, dev_ctx)
}
