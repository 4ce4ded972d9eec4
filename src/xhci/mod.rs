//! xHCI host-controller model.
//!
//! [`XhciController`] owns every register file and all slot/endpoint
//! state and is driven from the outside: MMIO accesses, host hotplug
//! notifications, backend device interrupts. It is single-threaded by
//! construction; [`crate::host::HostEventLoop`] serializes the callers.

pub mod context;
pub mod event_ring;
pub mod interrupter;
pub mod port_mapper;
pub mod ports;
pub mod regs;
pub mod ring;
pub mod trb;

mod command;
mod device;
mod snapshot;
mod transfer;

use tracing::{debug, trace, warn};

use crate::mem::MemoryBus;
use crate::pci::{cfg, NullPciBus, PciBus};
use crate::usb::{DevInfo, DevKind, UsbDevice, UsbDeviceFactory, UsbVersion};
use crate::xhci::device::{AttachedDevice, DeviceSlot};
use crate::xhci::event_ring::{EventInsert, EventRing};
use crate::xhci::interrupter::Interrupter;
use crate::xhci::port_mapper::{PortMapper, VportState};
use crate::xhci::ports::PortTable;
use crate::xhci::trb::{port_status_change, Trb};

pub use crate::xhci::device::SlotState;
pub use crate::xhci::regs::{
    MMIO_SIZE, PORTSC_CCS, PORTSC_CEC, PORTSC_CSC, PORTSC_OCC, PORTSC_PEC, PORTSC_PED,
    PORTSC_PLC, PORTSC_PP, PORTSC_PR, PORTSC_PRC, PORTSC_WRC,
};
pub use crate::xhci::ring::RingCursor;

use regs::*;

/// Commands consumed per doorbell-0 ring before yielding.
const COMMAND_RING_BUDGET: usize = 256;

pub struct XhciController {
    pci: Box<dyn PciBus>,
    pub(crate) dev_factory: Option<Box<dyn UsbDeviceFactory>>,

    usbcmd: u32,
    usbsts: u32,
    dnctrl: u32,
    pub(crate) crcr: u64,
    dcbaap: u64,
    config: u32,

    intr: Interrupter,
    pub(crate) ports: PortTable,
    pub(crate) slots: Vec<Option<DeviceSlot>>,
    pub(crate) slot_allocated: Vec<bool>,
    /// Backend devices by 1-based vport.
    pub(crate) devices: Vec<Option<AttachedDevice>>,
    pub(crate) mapper: PortMapper,

    /// Pending wakeups for the VBDP worker.
    vbdp_wakeups: usize,
}

impl XhciController {
    pub fn new() -> Self {
        Self::with_pci(Box::new(NullPciBus))
    }

    pub fn with_pci(mut pci: Box<dyn PciBus>) -> Self {
        pci.set_cfg_word(cfg::PCIR_VENDOR, cfg::VENDOR_INTEL);
        pci.set_cfg_word(cfg::PCIR_DEVICE, cfg::DEVICE_PANTHER_POINT_XHCI);
        pci.set_cfg_byte(cfg::PCIR_CLASS, cfg::CLASS_SERIAL_BUS);
        pci.set_cfg_byte(cfg::PCIR_SUBCLASS, cfg::SUBCLASS_USB);
        pci.set_cfg_byte(cfg::PCIR_PROGIF, cfg::PROGIF_XHCI);
        pci.set_cfg_byte(cfg::PCIR_USBREV, cfg::USBREV_3_0);

        Self {
            pci,
            dev_factory: None,
            usbcmd: 0,
            usbsts: USBSTS_HCH,
            dnctrl: 0,
            crcr: 0,
            dcbaap: 0,
            config: 0,
            intr: Interrupter::new(),
            ports: PortTable::new(),
            slots: (0..=usize::from(MAX_SLOTS)).map(|_| None).collect(),
            slot_allocated: vec![false; usize::from(MAX_SLOTS) + 1],
            devices: (0..=usize::from(MAX_PORTS)).map(|_| None).collect(),
            mapper: PortMapper::new(),
            vbdp_wakeups: 0,
        }
    }

    /// Install the factory used to build passthrough device models when
    /// the guest addresses a connected native device.
    pub fn set_device_factory(&mut self, factory: Box<dyn UsbDeviceFactory>) {
        self.dev_factory = Some(factory);
    }

    pub fn usbcmd(&self) -> u32 {
        self.usbcmd
    }

    pub fn interrupter(&self) -> &Interrupter {
        &self.intr
    }

    pub fn event_ring(&self) -> &EventRing {
        self.intr.ring()
    }

    pub fn read_portsc(&self, vport: u8) -> u32 {
        self.ports.portsc(vport)
    }

    pub fn slot_state(&self, slot_id: u8) -> Option<SlotState> {
        self.slots
            .get(usize::from(slot_id))
            .and_then(Option::as_ref)
            .map(|s| s.state)
    }

    pub fn endpoint_ring(&self, slot_id: u8, epid: u8) -> Option<RingCursor> {
        if epid >= MAX_ENDPOINTS {
            return None;
        }
        self.slots
            .get(usize::from(slot_id))
            .and_then(Option::as_ref)
            .and_then(|s| s.ep(epid).ring)
    }

    /// Line-level view of the interrupt output, after all gates.
    pub fn irq_level(&self) -> bool {
        self.intr.interrupt_pending()
            && self.intr.interrupt_enabled()
            && self.usbcmd & USBCMD_INTE != 0
            && self.usbcmd & USBCMD_RUN != 0
    }

    pub(crate) fn is_valid_slot(&self, slot_id: u8) -> bool {
        (1..=MAX_SLOTS).contains(&slot_id) && self.slot_allocated[usize::from(slot_id)]
    }

    pub(crate) fn slot_vport(&self, slot_id: u8) -> Option<u8> {
        self.slots
            .get(usize::from(slot_id))
            .and_then(Option::as_ref)
            .map(|s| s.vport)
            .filter(|&v| v != 0)
    }

    /// Output device context GPA for an allocated slot, via the DCBAA.
    pub(crate) fn device_context_gpa(&mut self, mem: &mut dyn MemoryBus, slot_id: u8) -> Option<u64> {
        if !self.is_valid_slot(slot_id) || self.dcbaap == 0 {
            return None;
        }
        let entry = mem.read_u64(self.dcbaap + u64::from(slot_id) * 8) & !0x3F;
        (entry != 0).then_some(entry)
    }

    pub(crate) fn insert_event(
        &mut self,
        mem: &mut dyn MemoryBus,
        evt: &Trb,
        do_intr: bool,
    ) -> EventInsert {
        let outcome = self.intr.ring_mut().insert(mem, evt);
        match outcome {
            EventInsert::RingFullReported => self.assert_interrupt(),
            EventInsert::Inserted if do_intr => self.assert_interrupt(),
            _ => {}
        }
        outcome
    }

    pub(crate) fn assert_interrupt(&mut self) {
        self.intr.latch_pending();
        self.usbsts |= USBSTS_EINT;
        if self.usbcmd & USBCMD_RUN != 0
            && self.usbcmd & USBCMD_INTE != 0
            && self.intr.interrupt_enabled()
        {
            if self.pci.msi_enabled() {
                self.pci.raise_msi();
            } else {
                self.pci.assert_intr();
            }
        }
    }

    // ----- device attachment ---------------------------------------------

    /// Cold-attach an emulated device to a vport (device-option
    /// placement at startup): the port shows a connected, trained link
    /// but latches no change bit. Run/stop resync announces it.
    pub fn attach_device(&mut self, vport: u8, model: Box<dyn UsbDevice>) {
        if !PortTable::is_valid_vport(vport) {
            warn!(vport, "attach to invalid vport");
            return;
        }
        let usb3 = model.version() == UsbVersion::Usb3;
        let speed = model.speed().port_speed();
        self.devices[usize::from(vport)] = Some(AttachedDevice::new(model));
        self.ports.set_connected(vport, speed, usb3);
        // Cold attach predates the guest: no change latched yet.
        let regs = self.ports.regs_mut(vport);
        regs.portsc &= !PORTSC_CSC;
        debug!(vport, usb3, "cold-attached device");
    }

    /// Remove the device on `vport` outright (emulated device teardown).
    pub fn detach_device(&mut self, mem: &mut dyn MemoryBus, vport: u8) {
        if let Some(mut dev) = self.devices[usize::from(vport)].take() {
            dev.model.deinit();
        }
        self.disconnect_port(mem, vport, true);
    }

    fn connect_port(&mut self, mem: &mut dyn MemoryBus, vport: u8, speed: u32, usb3: bool) {
        self.ports.set_connected(vport, speed, usb3);
        if self.usbcmd & USBCMD_RUN != 0 {
            let evt = port_status_change(vport);
            if self.insert_event(mem, &evt, true) != EventInsert::Inserted {
                warn!(vport, "failed to report port connect");
            }
        }
    }

    fn disconnect_port(&mut self, mem: &mut dyn MemoryBus, vport: u8, intr: bool) {
        self.ports.set_disconnected(vport);
        if self.usbcmd & USBCMD_RUN != 0 {
            let evt = port_status_change(vport);
            if self.insert_event(mem, &evt, intr) != EventInsert::Inserted {
                warn!(vport, "failed to report port disconnect");
            }
        }
    }

    // ----- host discovery ------------------------------------------------

    /// Reserve a host device path (device-option passthrough entry).
    pub fn assign_native_path(&mut self, info: DevInfo) -> bool {
        self.mapper.assign(info).is_some()
    }

    /// Host stack reports a device appearing on an assigned path.
    pub fn handle_host_connect(&mut self, mem: &mut dyn MemoryBus, info: DevInfo) {
        let Some(index) = self.mapper.index_by_path(&info.path) else {
            debug!(path = %info.path, "connect for a path not assigned here");
            return;
        };

        if info.kind == DevKind::ExtHub {
            if self.mapper.assign_hub_ports(&info).is_err() {
                warn!(path = %info.path, "failed to assign hub ports");
            }
            return;
        }

        // A device returning mid-resume keeps its cached vport; the
        // VBDP worker announces it once the guest finishes restoring.
        let deferred = self.mapper.vbdp_cached_vport(&info.path);
        let vport = match deferred.or_else(|| self.mapper.free_vport(info.bcd)) {
            Some(vport) => vport,
            None => {
                warn!(path = %info.path, "no free virtual port");
                return;
            }
        };

        let usb3 = info.bcd >= 0x300;
        let speed = info.speed.port_speed();
        if let Some(entry) = self.mapper.entry_mut(index) {
            entry.vport = vport;
            entry.info = info;
            entry.state = VportState::Connected;
        }

        if deferred.is_some() {
            debug!(vport, "connect deferred until resume completes");
            return;
        }
        self.connect_port(mem, vport, speed, usb3);
    }

    /// Host stack reports a device leaving. Slot resources stay put;
    /// DISABLE_SLOT frees them.
    pub fn handle_host_disconnect(&mut self, mem: &mut dyn MemoryBus, info: DevInfo) {
        let Some(index) = self.mapper.index_by_path(&info.path) else {
            warn!(path = %info.path, "disconnect for unknown path");
            return;
        };

        if info.kind == DevKind::ExtHub {
            if self.mapper.unassign_hub_ports(&info).is_err() {
                warn!(path = %info.path, "failed to unassign hub ports");
            }
            return;
        }

        let (state, vport) = match self.mapper.entry(index) {
            Some(entry) => (entry.state, entry.vport),
            None => return,
        };

        if state == VportState::Connected && vport > 0 {
            // Gone before the guest ever addressed it.
            self.disconnect_port(mem, vport, false);
            if let Some(entry) = self.mapper.entry_mut(index) {
                entry.state = VportState::Assigned;
                entry.vport = 0;
            }
            return;
        }

        if self.mapper.vbdp_cached_vport(&info.path).is_some() {
            // Expected drop during suspend; nothing to report.
            debug!(path = %info.path, "disconnect absorbed by suspend cache");
            return;
        }

        if let Some(entry) = self.mapper.entry_mut(index) {
            entry.state = VportState::Assigned;
            entry.vport = 0;
        }
        if vport > 0 {
            self.disconnect_port(mem, vport, true);
        }
    }

    // ----- VBDP worker ---------------------------------------------------

    /// Wakeups queued for the VBDP worker since the last call.
    pub fn take_vbdp_wakeups(&mut self) -> usize {
        std::mem::take(&mut self.vbdp_wakeups)
    }

    /// One VBDP worker iteration: replay a single deferred connect on
    /// its cached vport. Returns whether anything was replayed.
    pub fn vbdp_service_once(&mut self, mem: &mut dyn MemoryBus) -> bool {
        let Some(path) = self.mapper.vbdp_take_ended() else {
            return false;
        };
        let Some(index) = self.mapper.index_by_path(&path) else {
            return false;
        };
        let (state, vport, speed, usb3) = match self.mapper.entry(index) {
            Some(e) => (
                e.state,
                e.vport,
                e.info.speed.port_speed(),
                e.info.bcd >= 0x300,
            ),
            None => return false,
        };
        if state != VportState::Connected || vport == 0 {
            return false;
        }
        debug!(path = %path, vport, "replaying deferred connect after resume");
        self.connect_port(mem, vport, speed, usb3);
        true
    }

    // ----- MMIO ----------------------------------------------------------

    pub fn mmio_read_u32(&mut self, mem: &mut dyn MemoryBus, offset: u64) -> u32 {
        self.mmio_read(mem, offset, 4) as u32
    }

    pub fn mmio_read(&mut self, _mem: &mut dyn MemoryBus, offset: u64, size: u8) -> u64 {
        let aligned = offset & !0x3;
        let value = self.read_reg(aligned);
        let value = if size == 8 {
            u64::from(value) | (u64::from(self.read_reg(aligned + 4)) << 32)
        } else {
            let shift = (offset & 0x3) * 8;
            let v = u64::from(value) >> shift;
            match size {
                1 => v & 0xFF,
                2 => v & 0xFFFF,
                _ => v & 0xFFFF_FFFF,
            }
        };
        trace!(offset, size, value, "mmio read");
        value
    }

    fn read_reg(&self, offset: u64) -> u32 {
        match offset {
            o if o < OP_BASE => match o {
                cap::CAPLENGTH => CAPLENGTH_REG,
                cap::HCSPARAMS1 => HCSPARAMS1,
                cap::HCSPARAMS2 => HCSPARAMS2,
                cap::HCSPARAMS3 => HCSPARAMS3,
                cap::HCCPARAMS1 => HCCPARAMS1,
                cap::DBOFF => DB_OFF as u32,
                cap::RTSOFF => RTS_OFF as u32,
                cap::HCCPARAMS2 => HCCPARAMS2,
                _ => 0,
            },
            o if o < DB_OFF => self.read_op_reg(o - OP_BASE),
            o if o < RTS_OFF => 0, // doorbells read as zero
            o if o < REGS_END => self.read_runtime_reg(o - RTS_OFF),
            o if o < MMIO_SIZE => self.read_xecp_reg(o - REGS_END),
            o => {
                warn!(offset = o, "mmio read outside register file");
                0
            }
        }
    }

    fn read_op_reg(&self, offset: u64) -> u32 {
        match offset {
            op::USBCMD => self.usbcmd,
            op::USBSTS => self.usbsts,
            op::PAGESIZE => PAGESIZE_4K,
            op::DNCTRL => self.dnctrl,
            // The command ring pointer is write-only; only CRR is visible.
            op::CRCR_LO => (self.crcr & CRCR_CRR) as u32,
            op::CRCR_HI => 0,
            op::DCBAAP_LO => self.dcbaap as u32,
            op::DCBAAP_HI => (self.dcbaap >> 32) as u32,
            op::CONFIG => self.config,
            o if o >= op::PORTREGS => self.read_port_reg(o - op::PORTREGS),
            _ => 0,
        }
    }

    fn read_port_reg(&self, offset: u64) -> u32 {
        let port = (offset / port::SET_SIZE) as u8 + 1;
        if !PortTable::is_valid_vport(port) {
            // Unused port slots decode as a SuperSpeed-capable stub.
            return speed_field(3);
        }
        let regs = self.ports.regs(port);
        match offset % port::SET_SIZE {
            port::PORTSC => regs.portsc,
            port::PORTPMSC => regs.portpmsc,
            port::PORTLI => regs.portli,
            port::PORTHLPMC => regs.porthlpmc,
            _ => 0,
        }
    }

    fn read_runtime_reg(&self, offset: u64) -> u32 {
        match offset {
            // Microframe fidelity is out of scope; the index stays 0.
            runtime::MFINDEX => 0,
            o if o >= runtime::IR0 => match o - runtime::IR0 {
                runtime::IR_IMAN => self.intr.iman,
                runtime::IR_IMOD => self.intr.imod,
                runtime::IR_ERSTSZ => self.intr.erstsz,
                runtime::IR_ERSTBA_LO => self.intr.erstba as u32,
                runtime::IR_ERSTBA_HI => (self.intr.erstba >> 32) as u32,
                runtime::IR_ERDP_LO => self.intr.erdp as u32,
                runtime::IR_ERDP_HI => (self.intr.erdp >> 32) as u32,
                _ => 0,
            },
            _ => 0,
        }
    }

    /// Two Supported Protocol capabilities: USB2 over the high half of
    /// the port space, then USB3 (terminating the list) over the low.
    fn read_xecp_reg(&self, offset: u64) -> u32 {
        let half = u32::from(MAX_PORTS / 2);
        match offset {
            0 => {
                (u32::from(USB_REVISION_2_0) << 16)
                    | (4 << 8)
                    | u32::from(EXT_CAP_ID_SUPPORTED_PROTOCOL)
            }
            4 => PROTOCOL_NAME_USB,
            8 => (half << 8) | u32::from(USB2_PORT_START),
            16 => (u32::from(USB_REVISION_3_0) << 16) | u32::from(EXT_CAP_ID_SUPPORTED_PROTOCOL),
            20 => PROTOCOL_NAME_USB,
            24 => (half << 8) | u32::from(USB3_PORT_START),
            _ => 0,
        }
    }

    pub fn mmio_write(&mut self, mem: &mut dyn MemoryBus, offset: u64, size: u8, value: u64) {
        trace!(offset, size, value, "mmio write");
        match offset {
            o if o < OP_BASE => {
                warn!(offset = o, "write to read-only capability register");
            }
            o if o < DB_OFF => {
                self.write_op_reg(mem, o - OP_BASE, size, value);
            }
            o if o < RTS_OFF => self.write_doorbell(mem, o - DB_OFF, value as u32),
            o if o < REGS_END => self.write_runtime_reg(mem, o - RTS_OFF, size, value),
            o if o < MMIO_SIZE => {
                warn!(offset = o, "write to read-only extended capability");
            }
            o => warn!(offset = o, "mmio write outside register file"),
        }
    }

    fn write_op_reg(&mut self, mem: &mut dyn MemoryBus, offset: u64, size: u8, value: u64) {
        match offset {
            op::USBCMD => self.write_usbcmd(mem, value as u32 & USBCMD_WRITE_MASK),
            op::USBSTS => {
                // Write-1-to-clear; HCH/HCE are controller-owned.
                self.usbsts &= !(value as u32
                    & (USBSTS_HSE | USBSTS_EINT | USBSTS_PCD | USBSTS_SSS | USBSTS_RSS
                        | USBSTS_SRE | USBSTS_CNR));
                if value as u32 & USBSTS_EINT != 0 {
                    self.intr.clear_pending();
                }
            }
            op::PAGESIZE => {}
            op::DNCTRL => self.dnctrl = value as u32 & 0xFFFF,
            op::CRCR_LO => {
                self.write_crcr_lo(mem, value as u32);
                if size == 8 {
                    self.write_crcr_hi(mem, (value >> 32) as u32);
                }
            }
            op::CRCR_HI => self.write_crcr_hi(mem, value as u32),
            op::DCBAAP_LO => {
                self.dcbaap = (self.dcbaap & !0xFFFF_FFFF) | (value & 0xFFFF_FFC0);
                if size == 8 {
                    self.dcbaap = value & !0x3F;
                }
            }
            op::DCBAAP_HI => {
                self.dcbaap = (self.dcbaap & 0xFFFF_FFFF) | ((value & 0xFFFF_FFFF) << 32);
            }
            op::CONFIG => self.config = value as u32 & 0x03FF,
            o if o >= op::PORTREGS => self.write_port_reg(mem, o - op::PORTREGS, value as u32),
            _ => {
                warn!(offset, "unhandled operational register write");
            }
        }
    }

    fn write_crcr_lo(&mut self, _mem: &mut dyn MemoryBus, value: u32) {
        let value = u64::from(value);
        if self.crcr & CRCR_CRR != 0 {
            // While the ring runs only stop/abort requests are latched.
            self.crcr &= !(CRCR_CS | CRCR_CA);
            self.crcr |= value & (CRCR_CS | CRCR_CA);
        } else {
            self.crcr = (self.crcr & !0xFFFF_FFFF) | (value & (0xFFFF_FFC0 | CRCR_RCS));
        }
    }

    fn write_crcr_hi(&mut self, _mem: &mut dyn MemoryBus, value: u32) {
        if self.crcr & CRCR_CRR == 0 {
            self.crcr = (u64::from(value) << 32) | (self.crcr & 0xFFFF_FFFF);
        }
    }

    fn write_usbcmd(&mut self, mem: &mut dyn MemoryBus, mut cmd: u32) {
        let mut do_intr = false;

        if cmd & USBCMD_RUN != 0 {
            let started = self.usbcmd & USBCMD_RUN == 0;
            self.usbcmd |= USBCMD_RUN;
            self.usbsts &= !USBSTS_HCH;
            self.usbsts |= USBSTS_PCD;
            if started {
                do_intr = true;
                self.resync_ports_on_run(mem);
            }
        } else {
            self.usbcmd &= !USBCMD_RUN;
            self.usbsts |= USBSTS_HCH;
            self.usbsts &= !USBSTS_PCD;
        }
        cmd = (cmd & !USBCMD_RUN) | (self.usbcmd & USBCMD_RUN);

        if cmd & USBCMD_HCRST != 0 {
            self.reset_controller();
            cmd &= !(USBCMD_HCRST | USBCMD_RUN);
        }

        if cmd & USBCMD_CSS != 0 {
            // Save state: cache every emulated binding for resume.
            for vport in self.mapper.suspend_emulated() {
                self.ports.init_empty(vport);
            }
        }
        if cmd & USBCMD_CRS != 0 {
            let finished = self.mapper.vbdp_finish_resume();
            if finished > 0 {
                self.vbdp_wakeups += finished;
            }
        }
        cmd &= !(USBCMD_CSS | USBCMD_CRS);

        self.usbcmd = cmd;
        if do_intr {
            self.assert_interrupt();
        }
    }

    /// Run-from-stop: re-announce every occupied port (xHCI 4.19.3:
    /// USB2 links re-enter Polling, USB3 links report U0).
    fn resync_ports_on_run(&mut self, mem: &mut dyn MemoryBus) {
        for vport in 1..=MAX_PORTS {
            let usb3 = match self.devices[usize::from(vport)].as_ref() {
                Some(dev) => dev.model.version() == UsbVersion::Usb3,
                None => continue,
            };
            let regs = self.ports.regs_mut(vport);
            regs.portsc |= PORTSC_CSC | PORTSC_CCS;
            regs.portsc &= !PORTSC_PLS_MASK;
            regs.portsc |= pls_field(if usb3 { PLS_U0 } else { PLS_POLLING });

            let evt = port_status_change(vport);
            if self.insert_event(mem, &evt, false) == EventInsert::Refused {
                break;
            }
        }
    }

    /// Host-controller reset: rings, slots and operational registers
    /// return to power-on values; port attachment state is rebuilt.
    fn reset_controller(&mut self) {
        debug!("controller reset");
        self.usbcmd = 0;
        self.usbsts = USBSTS_HCH;
        self.dnctrl = 0;
        self.crcr = 0;
        self.dcbaap = 0;
        self.config = 0;
        self.intr.reset();

        for idx in 1..=usize::from(MAX_SLOTS) {
            self.slots[idx] = None;
            self.slot_allocated[idx] = false;
        }
        for vport in 1..=MAX_PORTS {
            match self.devices[usize::from(vport)].as_mut() {
                Some(dev) => {
                    dev.slot_id = 0;
                    let usb3 = dev.model.version() == UsbVersion::Usb3;
                    let speed = dev.model.speed().port_speed();
                    self.ports.set_connected(vport, speed, usb3);
                    let regs = self.ports.regs_mut(vport);
                    regs.portsc &= !PORTSC_CSC;
                }
                None => self.ports.init_empty(vport),
            }
        }
    }

    fn write_doorbell(&mut self, mem: &mut dyn MemoryBus, offset: u64, value: u32) {
        if self.usbsts & USBSTS_HCH != 0 {
            warn!("doorbell write while halted");
            return;
        }
        let index = offset / 4;
        if index == 0 {
            self.process_command_ring(mem, COMMAND_RING_BUDGET);
        } else if index <= u64::from(MAX_SLOTS) {
            let slot_id = index as u8;
            let target = (value & DB_TARGET_MASK) as u8;
            let stream_id = (value >> DB_SID_SHIFT) as u16;
            self.device_doorbell(mem, slot_id, target, stream_id);
        } else {
            warn!(index, "doorbell out of range");
        }
    }

    fn write_runtime_reg(&mut self, mem: &mut dyn MemoryBus, offset: u64, size: u8, value: u64) {
        if offset == runtime::MFINDEX {
            warn!("write to read-only MFINDEX");
            return;
        }
        if offset < runtime::IR0 {
            return;
        }
        match offset - runtime::IR0 {
            runtime::IR_IMAN => {
                let disabled = self.intr.write_iman(value as u32);
                if disabled && !self.pci.msi_enabled() {
                    self.pci.deassert_intr();
                }
            }
            runtime::IR_IMOD => self.intr.imod = value as u32,
            runtime::IR_ERSTSZ => self.intr.erstsz = value as u32 & 0xFFFF,
            runtime::IR_ERSTBA_LO => {
                self.intr.erstba =
                    (self.intr.erstba & !0xFFFF_FFFF) | (value & 0xFFFF_FFC0);
                if size == 8 {
                    self.intr.erstba = value & !0x3F;
                    let erstba = self.intr.erstba;
                    self.intr.ring_mut().configure(mem, erstba);
                }
            }
            runtime::IR_ERSTBA_HI => {
                self.intr.erstba =
                    ((value & 0xFFFF_FFFF) << 32) | (self.intr.erstba & 0xFFFF_FFFF);
                let erstba = self.intr.erstba;
                self.intr.ring_mut().configure(mem, erstba);
            }
            runtime::IR_ERDP_LO => {
                self.intr.write_erdp_lo(value as u32);
                if size == 8 {
                    self.intr.write_erdp_hi((value >> 32) as u32);
                }
            }
            runtime::IR_ERDP_HI => self.intr.write_erdp_hi(value as u32),
            other => warn!(offset = other, "unhandled runtime register write"),
        }
    }

    fn write_port_reg(&mut self, mem: &mut dyn MemoryBus, offset: u64, value: u32) {
        let vport = (offset / port::SET_SIZE) as u8 + 1;
        if !PortTable::is_valid_vport(vport) {
            warn!(vport, "port register write out of range");
            return;
        }
        match offset % port::SET_SIZE {
            port::PORTSC => self.write_portsc(mem, vport, value),
            port::PORTPMSC => self.ports.regs_mut(vport).portpmsc = value,
            port::PORTLI => warn!(vport, "write to read-only PORTLI"),
            port::PORTHLPMC => self.ports.regs_mut(vport).porthlpmc = value,
            _ => {}
        }
    }

    fn write_portsc(&mut self, mem: &mut dyn MemoryBus, vport: u8, value: u32) {
        if value & (PORTSC_PR | PORTSC_WPR) != 0 {
            self.reset_port(mem, vport, value & PORTSC_WPR != 0);
            return;
        }

        let portsc = self.ports.portsc(vport);
        if portsc & PORTSC_PP == 0 {
            warn!(vport, "write to unpowered port");
            return;
        }

        let oldpls = pls_value(portsc);
        let newpls = pls_value(value);

        let occupied = self.devices[usize::from(vport)].is_some()
            || self.mapper.index_by_vport(vport).is_some();

        {
            let regs = self.ports.regs_mut(vport);
            regs.portsc &=
                PORTSC_PED | PORTSC_PLS_MASK | PORTSC_SPEED_MASK | PORTSC_PIC_MASK;
            if occupied {
                regs.portsc |= PORTSC_CCS;
            }
            regs.portsc |= value
                & !(PORTSC_OCA
                    | PORTSC_PR
                    | PORTSC_PED
                    | PORTSC_PLS_MASK
                    | PORTSC_SPEED_MASK
                    | PORTSC_PIC_MASK
                    | PORTSC_LWS
                    | PORTSC_DR
                    | PORTSC_WPR);
            // Change bits are write-1-to-clear.
            regs.portsc &= !(value & (PORTSC_CHANGE_BITS | PORTSC_CAS));
        }

        if value & PORTSC_PED != 0 {
            debug!(vport, "port disable request ignored");
        }

        if value & PORTSC_LWS == 0 {
            return;
        }

        match newpls {
            PLS_U0 | PLS_U3 => {
                if oldpls != newpls {
                    let regs = self.ports.regs_mut(vport);
                    regs.portsc &= !PORTSC_PLS_MASK;
                    regs.portsc |= pls_field(newpls) | PORTSC_PLC;
                    if oldpls != PLS_U0 && newpls == PLS_U0 {
                        // Wake from suspend: tell the guest.
                        let evt = port_status_change(vport);
                        self.insert_event(mem, &evt, true);
                    }
                }
            }
            other => {
                debug!(vport, pls = other, "unhandled link state request");
            }
        }
    }

    fn reset_port(&mut self, mem: &mut dyn MemoryBus, vport: u8, warm: bool) {
        let Some(dev) = self.devices[usize::from(vport)].as_ref() else {
            return;
        };
        let speed = dev.model.speed().port_speed();
        let warm_usb3 = warm && dev.model.version() == UsbVersion::Usb3;
        if self.ports.complete_reset(vport, speed, warm_usb3) {
            let evt = port_status_change(vport);
            if self.insert_event(mem, &evt, true) != EventInsert::Inserted {
                warn!(vport, "failed to report port reset completion");
            }
        }
    }
}

impl Default for XhciController {
    fn default() -> Self {
        Self::new()
    }
}
