//! Controller snapshot encoding.
//!
//! Registers, ports, the interrupter with its event-ring producer
//! cursor, and the suspend/resume (VBDP) cache are saved as tagged
//! fields. Slot and in-flight transfer state is guest-reconstructible
//! and deliberately excluded. Loading validates every field before any
//! controller state is touched; a corrupt event-ring cursor is dropped
//! rather than trusted.

use tracing::warn;

use crate::snapshot::codec::{Decoder, Encoder};
use crate::snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotVersion, SnapshotWriter,
};
use crate::usb::{DevPath, USB_MAX_TIERS};
use crate::xhci::event_ring::EventRing;
use crate::xhci::port_mapper::{VbdpDev, VbdpState};
use crate::xhci::ports::{PortRegs, PortTable};
use crate::xhci::regs::{CRCR_CRR, MAX_PORTS, USBSTS_HCH};
use crate::xhci::XhciController;

const TAG_USBCMD: u16 = 1;
const TAG_USBSTS: u16 = 2;
const TAG_DNCTRL: u16 = 3;
const TAG_CRCR: u16 = 4;
const TAG_DCBAAP: u16 = 5;
const TAG_CONFIG: u16 = 6;
const TAG_PORTS: u16 = 7;
const TAG_INTERRUPTER: u16 = 8;
const TAG_EVENT_RING: u16 = 9;
const TAG_VBDP_DEVS: u16 = 10;

impl XhciController {
    pub const DEVICE_ID: [u8; 4] = *b"XHCI";
    pub const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);
}

fn encode_vbdp_dev(dev: &VbdpDev) -> Vec<u8> {
    let state = match dev.state {
        VbdpState::Start => 0u8,
        VbdpState::End => 1,
    };
    Encoder::new()
        .u8(dev.path.bus)
        .u8(dev.path.depth)
        .bytes(&dev.path.chain)
        .u8(dev.vport)
        .u8(state)
        .finish()
}

fn decode_ports(raw: &[u8]) -> Result<PortTable, SnapshotError> {
    let mut d = Decoder::new(raw);
    let records = d.vec_bytes()?;
    if records.len() != usize::from(MAX_PORTS) {
        return Err(SnapshotError::InvalidFieldEncoding(
            "root hub port count mismatch",
        ));
    }
    let mut table = PortTable::new();
    for (i, record) in records.iter().enumerate() {
        let mut d = Decoder::new(record);
        *table.regs_mut(i as u8 + 1) = PortRegs {
            portsc: d.u32()?,
            portpmsc: d.u32()?,
            portli: d.u32()?,
            porthlpmc: d.u32()?,
        };
    }
    Ok(table)
}

fn decode_interrupter(raw: &[u8]) -> Result<(u32, u32, u32, u64, u64), SnapshotError> {
    let mut d = Decoder::new(raw);
    Ok((d.u32()?, d.u32()?, d.u32()?, d.u64()?, d.u64()?))
}

fn decode_event_ring(raw: &[u8]) -> Result<EventRing, SnapshotError> {
    let mut d = Decoder::new(raw);
    let erstba = d.u64()?;
    let seg_base = d.u64()?;
    let seg_size = d.u32()?;
    let enq_idx = d.u32()?;
    let events_cnt = d.u32()?;
    let pcs = d.bool()?;
    if seg_size != 0 && (enq_idx >= seg_size || events_cnt > seg_size) {
        // Producer cursor outside the segment: the saved ring cannot be
        // trusted, so restore it unconfigured.
        warn!(enq_idx, events_cnt, seg_size, "dropping corrupt event ring cursor");
        return Ok(EventRing::new());
    }
    Ok(EventRing {
        erstba,
        seg_base,
        seg_size,
        enq_idx,
        events_cnt,
        pcs,
    })
}

fn decode_vbdp_devs(raw: &[u8]) -> Result<Vec<VbdpDev>, SnapshotError> {
    let mut d = Decoder::new(raw);
    let records = d.vec_bytes()?;
    let mut devs = Vec::with_capacity(records.len());
    for record in &records {
        let mut d = Decoder::new(record);
        let bus = d.u8()?;
        let depth = d.u8()?;
        let chain: [u8; USB_MAX_TIERS] = d.bytes(USB_MAX_TIERS)?.try_into().unwrap();
        let vport = d.u8()?;
        let state = match d.u8()? {
            0 => VbdpState::Start,
            1 => VbdpState::End,
            _ => return Err(SnapshotError::InvalidFieldEncoding("vbdp state")),
        };
        if usize::from(depth) > USB_MAX_TIERS {
            return Err(SnapshotError::InvalidFieldEncoding(
                "device path depth out of range",
            ));
        }
        if vport == 0 || vport > MAX_PORTS {
            return Err(SnapshotError::InvalidFieldEncoding(
                "cached vport out of range",
            ));
        }
        devs.push(VbdpDev {
            path: DevPath { bus, depth, chain },
            vport,
            state,
        });
    }
    Ok(devs)
}

impl IoSnapshot for XhciController {
    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u32(TAG_USBCMD, self.usbcmd);
        w.field_u32(TAG_USBSTS, self.usbsts);
        w.field_u32(TAG_DNCTRL, self.dnctrl);
        w.field_u64(TAG_CRCR, self.crcr);
        w.field_u64(TAG_DCBAAP, self.dcbaap);
        w.field_u32(TAG_CONFIG, self.config);

        let ports: Vec<Vec<u8>> = (1..=MAX_PORTS)
            .map(|vport| {
                let regs = self.ports.regs(vport);
                Encoder::new()
                    .u32(regs.portsc)
                    .u32(regs.portpmsc)
                    .u32(regs.portli)
                    .u32(regs.porthlpmc)
                    .finish()
            })
            .collect();
        w.field_bytes(TAG_PORTS, Encoder::new().vec_bytes(&ports).finish());

        w.field_bytes(
            TAG_INTERRUPTER,
            Encoder::new()
                .u32(self.intr.iman)
                .u32(self.intr.imod)
                .u32(self.intr.erstsz)
                .u64(self.intr.erstba)
                .u64(self.intr.erdp)
                .finish(),
        );

        let ring = self.intr.ring();
        w.field_bytes(
            TAG_EVENT_RING,
            Encoder::new()
                .u64(ring.erstba)
                .u64(ring.seg_base)
                .u32(ring.seg_size)
                .u32(ring.enq_idx)
                .u32(ring.events_cnt)
                .bool(ring.pcs)
                .finish(),
        );

        let vbdp: Vec<Vec<u8>> = self.mapper.vbdp_state().iter().map(encode_vbdp_dev).collect();
        w.field_bytes(TAG_VBDP_DEVS, Encoder::new().vec_bytes(&vbdp).finish());

        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError> {
        let r = SnapshotReader::parse_versioned(bytes, Self::DEVICE_ID, Self::DEVICE_VERSION)?;

        // Decode everything up front; nothing is committed on error.
        let usbcmd = r.u32(TAG_USBCMD)?.unwrap_or(0);
        let usbsts = r.u32(TAG_USBSTS)?.unwrap_or(USBSTS_HCH);
        let dnctrl = r.u32(TAG_DNCTRL)?.unwrap_or(0);
        let crcr = r.u64(TAG_CRCR)?.unwrap_or(0) & !CRCR_CRR;
        let dcbaap = r.u64(TAG_DCBAAP)?.unwrap_or(0);
        let config = r.u32(TAG_CONFIG)?.unwrap_or(0);
        let ports = match r.bytes(TAG_PORTS) {
            Some(raw) => decode_ports(raw)?,
            None => PortTable::new(),
        };
        let (iman, imod, erstsz, erstba, erdp) = match r.bytes(TAG_INTERRUPTER) {
            Some(raw) => decode_interrupter(raw)?,
            None => (0, 0, 0, 0, 0),
        };
        let ring = match r.bytes(TAG_EVENT_RING) {
            Some(raw) => decode_event_ring(raw)?,
            None => EventRing::new(),
        };
        let vbdp = match r.bytes(TAG_VBDP_DEVS) {
            Some(raw) => decode_vbdp_devs(raw)?,
            None => Vec::new(),
        };

        self.usbcmd = usbcmd;
        self.usbsts = usbsts;
        self.dnctrl = dnctrl;
        self.crcr = crcr;
        self.dcbaap = dcbaap;
        self.config = config;
        self.ports = ports;
        self.intr.iman = iman;
        self.intr.imod = imod;
        self.intr.erstsz = erstsz;
        self.intr.erstba = erstba;
        self.intr.erdp = erdp;
        *self.intr.ring_mut() = ring;
        self.mapper.restore_vbdp_state(vbdp);
        Ok(())
    }
}
