mod util;

use virt_usb::xhci::regs;
use virt_usb::xhci::trb::TrbType;
use virt_usb::xhci::{SlotState, XhciController};

use util::{
    make_command, read_event, ring_doorbell, set_command_ring, start_controller, Alloc,
    TestDevice, TestMemory,
};

#[test]
fn caplength_and_offsets_are_plausible() {
    let mut ctrl = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    let cap0 = ctrl.mmio_read(&mut mem, regs::cap::CAPLENGTH, 4);
    assert_eq!((cap0 & 0xFF) as u8, regs::CAPLENGTH_VALUE);
    assert_eq!((cap0 >> 16) as u16, regs::HCIVERSION_VALUE);

    let hcs1 = ctrl.mmio_read(&mut mem, regs::cap::HCSPARAMS1, 4) as u32;
    assert_eq!(hcs1 & 0xFF, u32::from(regs::MAX_SLOTS));
    assert_eq!((hcs1 >> 8) & 0x7FF, 1, "one interrupter");
    assert_eq!(hcs1 >> 24, u32::from(regs::MAX_PORTS));

    let dboff = ctrl.mmio_read(&mut mem, regs::cap::DBOFF, 4);
    assert_eq!(dboff, regs::DB_OFF);
    assert_eq!(dboff & 0x3, 0, "DBOFF must be dword aligned");

    let rtsoff = ctrl.mmio_read(&mut mem, regs::cap::RTSOFF, 4);
    assert_eq!(rtsoff, regs::RTS_OFF);
    assert_eq!(rtsoff & 0x1F, 0, "RTSOFF must be 32-byte aligned");

    let pagesize = ctrl.mmio_read(&mut mem, regs::OP_BASE + regs::op::PAGESIZE, 4);
    assert_eq!(pagesize, u64::from(regs::PAGESIZE_4K));
}

#[test]
fn capability_registers_ignore_writes() {
    let mut ctrl = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    let before = ctrl.mmio_read(&mut mem, regs::cap::HCSPARAMS1, 4);
    ctrl.mmio_write(&mut mem, regs::cap::HCSPARAMS1, 4, 0xFFFF_FFFF);
    assert_eq!(ctrl.mmio_read(&mut mem, regs::cap::HCSPARAMS1, 4), before);
}

#[test]
fn sub_dword_reads_mask_correctly() {
    let mut ctrl = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    let caplen = ctrl.mmio_read(&mut mem, regs::cap::CAPLENGTH, 1);
    assert_eq!(caplen, u64::from(regs::CAPLENGTH_VALUE));

    // HCIVERSION is the upper half of the same dword.
    let version = ctrl.mmio_read(&mut mem, regs::cap::CAPLENGTH + 2, 2);
    assert_eq!(version, u64::from(regs::HCIVERSION_VALUE));
}

#[test]
fn run_stop_toggles_halted_bit() {
    let mut ctrl = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    assert_ne!(
        ctrl.mmio_read(&mut mem, regs::REG_USBSTS, 4) as u32 & regs::USBSTS_HCH,
        0,
        "controller should start halted"
    );

    ctrl.mmio_write(&mut mem, regs::REG_USBCMD, 4, u64::from(regs::USBCMD_RUN));
    assert_eq!(
        ctrl.mmio_read(&mut mem, regs::REG_USBSTS, 4) as u32 & regs::USBSTS_HCH,
        0
    );

    ctrl.mmio_write(&mut mem, regs::REG_USBCMD, 4, 0);
    assert_ne!(
        ctrl.mmio_read(&mut mem, regs::REG_USBSTS, 4) as u32 & regs::USBSTS_HCH,
        0
    );
}

#[test]
fn hcrst_halts_and_resets_ports_and_slots() {
    let mut ctrl = XhciController::new();
    let mut mem = TestMemory::new(0x20_000);
    let mut alloc = Alloc::new(0x1000);

    // Enable a slot so reset has something to tear down.
    let cmd_ring = alloc.alloc(0x100, 0x40);
    let erstba = alloc.alloc(0x40, 0x40);
    let event_ring = alloc.alloc(16 * 16, 0x40);
    start_controller(&mut ctrl, &mut mem);
    util::configure_event_ring(&mut ctrl, &mut mem, erstba, event_ring, 16);
    set_command_ring(&mut ctrl, &mut mem, cmd_ring);
    make_command(TrbType::EnableSlotCommand, 0).write_to(&mut mem, cmd_ring);
    ring_doorbell(&mut ctrl, &mut mem, 0, 0);
    let evt = read_event(&mut mem, event_ring, 0);
    assert_eq!(evt.trb_type(), TrbType::CommandCompletionEvent);
    let slot_id = evt.slot_id();
    assert_eq!(ctrl.slot_state(slot_id), Some(SlotState::Enabled));

    // Dirty more operational state.
    ctrl.mmio_write(&mut mem, regs::REG_DCBAAP_LO, 4, 0x4000);
    ctrl.mmio_write(&mut mem, regs::REG_CONFIG, 4, 5);

    ctrl.mmio_write(&mut mem, regs::REG_USBCMD, 4, u64::from(regs::USBCMD_HCRST));

    let sts = ctrl.mmio_read(&mut mem, regs::REG_USBSTS, 4) as u32;
    assert_ne!(sts & regs::USBSTS_HCH, 0, "reset leaves the controller halted");
    let cmd = ctrl.mmio_read(&mut mem, regs::REG_USBCMD, 4) as u32;
    assert_eq!(cmd & (regs::USBCMD_RUN | regs::USBCMD_HCRST), 0);

    assert_eq!(ctrl.mmio_read(&mut mem, regs::REG_DCBAAP_LO, 4), 0);
    assert_eq!(ctrl.mmio_read(&mut mem, regs::REG_CONFIG, 4), 0);
    assert_eq!(ctrl.slot_state(slot_id), None, "slots are disabled by reset");

    // Empty ports read PP | PLS(RxDetect).
    for vport in 1..=regs::MAX_PORTS {
        assert_eq!(
            ctrl.mmio_read(&mut mem, regs::port::portsc_offset(vport), 4),
            0x02A0,
            "empty port {vport} after reset"
        );
    }
}

#[test]
fn hcrst_preserves_cold_attached_devices() {
    let mut ctrl = XhciController::new();
    let mut mem = TestMemory::new(0x1000);

    ctrl.attach_device(1, Box::new(TestDevice::usb3()));
    ctrl.mmio_write(&mut mem, regs::REG_USBCMD, 4, u64::from(regs::USBCMD_HCRST));

    let portsc = ctrl.read_portsc(1);
    assert_ne!(portsc & regs::PORTSC_CCS, 0, "device still connected");
    assert_eq!(portsc & regs::PORTSC_CSC, 0, "no change latched by reset");
}

#[test]
fn doorbells_are_ignored_while_halted() {
    let mut ctrl = XhciController::new();
    let mut mem = TestMemory::new(0x10_000);
    let mut alloc = Alloc::new(0x1000);

    let cmd_ring = alloc.alloc(0x100, 0x40);
    let erstba = alloc.alloc(0x40, 0x40);
    let event_ring = alloc.alloc(16 * 8, 0x40);
    util::configure_event_ring(&mut ctrl, &mut mem, erstba, event_ring, 8);
    set_command_ring(&mut ctrl, &mut mem, cmd_ring);
    make_command(TrbType::EnableSlotCommand, 0).write_to(&mut mem, cmd_ring);

    // Controller halted: the doorbell must not run commands.
    ring_doorbell(&mut ctrl, &mut mem, 0, 0);
    let evt = read_event(&mut mem, event_ring, 0);
    assert_ne!(evt.trb_type(), TrbType::CommandCompletionEvent);
}
