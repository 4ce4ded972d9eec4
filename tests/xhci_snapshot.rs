mod util;

use virt_usb::snapshot::codec::Encoder;
use virt_usb::snapshot::{IoSnapshot, SnapshotError, SnapshotReader, SnapshotWriter};
use virt_usb::xhci::regs;
use virt_usb::xhci::trb::TrbType;
use virt_usb::xhci::XhciController;
use virt_usb::{DevInfo, DevKind, DevPath, UsbDevice, UsbDeviceFactory, UsbSpeed};

use util::{
    configure_event_ring, enable_and_address_at, make_command, read_event, ring_doorbell,
    set_command_ring, set_dcbaap, start_controller, Alloc, TestDevice, TestMemory,
};

// Keep in sync with `src/xhci/snapshot.rs`.
const TAG_PORTS: u16 = 7;
const TAG_EVENT_RING: u16 = 9;

struct Factory;

impl UsbDeviceFactory for Factory {
    fn create(&mut self, _info: &DevInfo) -> Option<Box<dyn UsbDevice>> {
        Some(Box::new(TestDevice::usb3()))
    }
}

#[test]
fn xhci_snapshot_roundtrips_byte_for_byte() {
    let mut mem = TestMemory::new(0x10_000);
    let mut ctrl = XhciController::new();

    // Mutate registers so the snapshot is not all-default.
    ctrl.mmio_write(
        &mut mem,
        regs::OP_BASE + regs::op::DNCTRL,
        4,
        0x1234,
    );
    ctrl.mmio_write(&mut mem, regs::REG_DCBAAP_LO, 4, 0x4000);
    ctrl.mmio_write(&mut mem, regs::REG_CONFIG, 4, 8);
    ctrl.attach_device(1, Box::new(TestDevice::usb3()));

    let snap1 = ctrl.save_state();

    // Mutate again so restore has something to do.
    ctrl.mmio_write(&mut mem, regs::OP_BASE + regs::op::DNCTRL, 4, 0xBEEF);
    ctrl.mmio_write(&mut mem, regs::REG_CONFIG, 4, 2);

    ctrl.load_state(&snap1).expect("load_state");

    let snap2 = ctrl.save_state();
    if snap1 != snap2 {
        let r1 = SnapshotReader::parse(&snap1, XhciController::DEVICE_ID).unwrap();
        let r2 = SnapshotReader::parse(&snap2, XhciController::DEVICE_ID).unwrap();
        for (tag, bytes1) in r1.iter_fields() {
            match r2.bytes(tag) {
                None => eprintln!("tag {tag} missing after restore"),
                Some(bytes2) if bytes1 != bytes2 => {
                    eprintln!("tag {tag} differs: len1={} len2={}", bytes1.len(), bytes2.len());
                }
                Some(_) => {}
            }
        }
    }
    assert_eq!(snap1, snap2, "snapshot should roundtrip byte-for-byte");
}

#[test]
fn xhci_snapshot_preserves_event_ring_producer_cursor() {
    let mut mem = TestMemory::new(0x20_000);
    let mut ctrl = XhciController::new();
    let mut alloc = Alloc::new(0x1000);

    let cmd_ring = alloc.alloc(0x100, 0x40);
    let erstba = alloc.alloc(0x40, 0x40);
    let event_ring = alloc.alloc(16 * 8, 0x40);

    start_controller(&mut ctrl, &mut mem);
    configure_event_ring(&mut ctrl, &mut mem, erstba, event_ring, 8);
    set_command_ring(&mut ctrl, &mut mem, cmd_ring);

    make_command(TrbType::NoOpCommand, 0).write_to(&mut mem, cmd_ring);
    make_command(TrbType::NoOpCommand, 0).write_to(&mut mem, cmd_ring + 16);
    ring_doorbell(&mut ctrl, &mut mem, 0, 0);
    assert_eq!(ctrl.event_ring().enqueue_index(), 2);

    let bytes = ctrl.save_state();
    let mut restored = XhciController::new();
    restored.load_state(&bytes).expect("load snapshot");

    // The restored producer continues at slot 2 with the preserved
    // cycle state rather than restarting at the segment base.
    make_command(TrbType::NoOpCommand, 0).write_to(&mut mem, cmd_ring + 32);
    ring_doorbell(&mut restored, &mut mem, 0, 0);

    let evt = read_event(&mut mem, event_ring, 2);
    assert_eq!(evt.trb_type(), TrbType::CommandCompletionEvent);
    assert!(evt.cycle(), "producer cycle state preserved across snapshot");
    assert_eq!(evt.parameter & !0xF, cmd_ring + 32);

    // Older entries were not overwritten.
    assert_eq!(read_event(&mut mem, event_ring, 0).parameter & !0xF, cmd_ring);
}

#[test]
fn snapshot_restore_rejects_truncated_bytes() {
    let ctrl = XhciController::new();
    let snap = ctrl.save_state();

    for len in [0usize, 1, 15, snap.len() - 1] {
        let mut restored = XhciController::new();
        let err = restored.load_state(&snap[..len]).unwrap_err();
        assert!(matches!(err, SnapshotError::UnexpectedEof), "len {len}");
    }
}

#[test]
fn snapshot_device_id_mismatch_returns_error() {
    let ctrl = XhciController::new();
    let mut corrupted = ctrl.save_state();
    corrupted[8..12].copy_from_slice(b"NOPE");

    let mut restored = XhciController::new();
    let err = restored.load_state(&corrupted).unwrap_err();
    assert!(matches!(err, SnapshotError::DeviceIdMismatch { .. }));
}

#[test]
fn snapshot_major_version_mismatch_returns_error() {
    let ctrl = XhciController::new();
    let mut corrupted = ctrl.save_state();
    corrupted[12..14].copy_from_slice(&2u16.to_le_bytes());

    let mut restored = XhciController::new();
    let err = restored.load_state(&corrupted).unwrap_err();
    assert!(matches!(
        err,
        SnapshotError::UnsupportedDeviceMajorVersion {
            found: 2,
            supported: 1
        }
    ));
}

#[test]
fn snapshot_minor_version_mismatch_is_accepted() {
    let ctrl = XhciController::new();
    let mut corrupted = ctrl.save_state();
    corrupted[14..16].copy_from_slice(&42u16.to_le_bytes());

    let mut restored = XhciController::new();
    restored
        .load_state(&corrupted)
        .expect("minor version mismatch should be accepted");
}

#[test]
fn snapshot_unknown_fields_are_ignored() {
    let mut mem = TestMemory::new(0x1000);
    let mut ctrl = XhciController::new();
    ctrl.mmio_write(&mut mem, regs::REG_CONFIG, 4, 5);
    let snap = ctrl.save_state();

    let r = SnapshotReader::parse(&snap, XhciController::DEVICE_ID).unwrap();
    let mut w = SnapshotWriter::new(XhciController::DEVICE_ID, XhciController::DEVICE_VERSION);
    for (tag, field) in r.iter_fields() {
        w.field_bytes(tag, field.to_vec());
    }
    w.field_u32(999, 0xDEAD_BEEF);
    let extended = w.finish();

    let mut restored = XhciController::new();
    restored.load_state(&extended).expect("unknown field ignored");
    assert_eq!(restored.mmio_read(&mut mem, regs::REG_CONFIG, 4), 5);
}

#[test]
fn snapshot_with_wrong_port_count_is_rejected() {
    let ctrl = XhciController::new();
    let snap = ctrl.save_state();

    // Patch the port field down to three records.
    let r = SnapshotReader::parse(&snap, XhciController::DEVICE_ID).unwrap();
    let mut w = SnapshotWriter::new(XhciController::DEVICE_ID, XhciController::DEVICE_VERSION);
    for (tag, field) in r.iter_fields() {
        if tag == TAG_PORTS {
            let bogus: Vec<Vec<u8>> = (0..3)
                .map(|_| Encoder::new().u32(0).u32(0).u32(0).u32(0).finish())
                .collect();
            w.field_bytes(tag, Encoder::new().vec_bytes(&bogus).finish());
        } else {
            w.field_bytes(tag, field.to_vec());
        }
    }
    let patched = w.finish();

    let mut restored = XhciController::new();
    let err = restored.load_state(&patched).unwrap_err();
    assert_eq!(
        err,
        SnapshotError::InvalidFieldEncoding("root hub port count mismatch")
    );

    // The rejected load left the controller untouched: every port
    // still decodes (empty: PP | PLS RxDetect).
    for vport in 1..=regs::MAX_PORTS {
        assert_eq!(restored.read_portsc(vport), 0x02A0);
    }
}

#[test]
fn corrupt_event_ring_cursor_is_dropped_on_restore() {
    let ctrl = XhciController::new();
    let snap = ctrl.save_state();

    // Patch in a producer cursor past the end of its segment.
    let r = SnapshotReader::parse(&snap, XhciController::DEVICE_ID).unwrap();
    let mut w = SnapshotWriter::new(XhciController::DEVICE_ID, XhciController::DEVICE_VERSION);
    for (tag, field) in r.iter_fields() {
        if tag == TAG_EVENT_RING {
            let corrupt = Encoder::new()
                .u64(0x1000) // erstba
                .u64(0x2000) // segment base
                .u32(8) // segment size
                .u32(9) // enqueue index out of range
                .u32(0)
                .bool(true)
                .finish();
            w.field_bytes(tag, corrupt);
        } else {
            w.field_bytes(tag, field.to_vec());
        }
    }
    let patched = w.finish();

    let mut restored = XhciController::new();
    restored
        .load_state(&patched)
        .expect("corrupt cursor is sanitized, not fatal");
    assert!(
        !restored.event_ring().is_configured(),
        "out-of-range producer cursor must be dropped on restore"
    );
}

#[test]
fn suspend_cache_survives_save_restore() {
    let mut ctrl = XhciController::new();
    ctrl.set_device_factory(Box::new(Factory));
    let mut mem = TestMemory::new(0x40_000);
    let mut alloc = Alloc::new(0x1000);

    let cmd_ring = alloc.alloc(0x200, 0x40);
    let erstba = alloc.alloc(0x40, 0x40);
    let event_ring = alloc.alloc(16 * 32, 0x40);
    let dcbaa = alloc.alloc(0x800, 0x40);

    start_controller(&mut ctrl, &mut mem);
    configure_event_ring(&mut ctrl, &mut mem, erstba, event_ring, 32);
    set_command_ring(&mut ctrl, &mut mem, cmd_ring);
    set_dcbaap(&mut ctrl, &mut mem, dcbaa);

    let di = DevInfo {
        vid: 1,
        pid: 2,
        bcd: 0x0310,
        speed: UsbSpeed::Super,
        kind: DevKind::Device,
        path: DevPath::root(2, 1),
        maxchild: 0,
    };
    assert!(ctrl.assign_native_path(di.clone()));
    ctrl.handle_host_connect(&mut mem, di.clone());
    let vport = regs::USB3_PORT_START;

    let erdp = event_ring + 16;
    ctrl.mmio_write(&mut mem, regs::REG_INTR0_ERDP_LO, 4, erdp & 0xFFFF_FFFF);
    ctrl.mmio_write(&mut mem, regs::REG_INTR0_ERDP_HI, 4, erdp >> 32);
    enable_and_address_at(
        &mut ctrl, &mut mem, &mut alloc, cmd_ring, event_ring, dcbaa, vport, 1,
    );

    // Suspend, then snapshot the controller mid-resume-window.
    ctrl.mmio_write(
        &mut mem,
        regs::REG_USBCMD,
        4,
        u64::from(regs::USBCMD_RUN | regs::USBCMD_INTE | regs::USBCMD_CSS),
    );
    let bytes = ctrl.save_state();

    // Restore into a fresh controller; the host re-assigns its paths.
    let mut restored = XhciController::new();
    restored.set_device_factory(Box::new(Factory));
    restored.load_state(&bytes).expect("load snapshot");
    assert!(restored.assign_native_path(di.clone()));

    // The device reappears: still deferred, because the suspend cache
    // came back with the snapshot.
    restored.handle_host_connect(&mut mem, di);
    assert_eq!(
        restored.read_portsc(vport) & regs::PORTSC_CCS,
        0,
        "reconnect stays deferred after restore"
    );

    // Finishing the resume replays the connect on the cached vport.
    restored.mmio_write(
        &mut mem,
        regs::REG_USBCMD,
        4,
        u64::from(regs::USBCMD_RUN | regs::USBCMD_INTE | regs::USBCMD_CRS),
    );
    assert_eq!(restored.take_vbdp_wakeups(), 1);
    assert!(restored.vbdp_service_once(&mut mem));
    assert_ne!(restored.read_portsc(vport) & regs::PORTSC_CCS, 0);
}
