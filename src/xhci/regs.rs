//! Register map of the controller's 32-bit MMIO BAR.
//!
//! Layout: `[capability | operational | ports | doorbells | runtime | xECP]`.
//! All offsets are fixed at build time; the capability registers publish
//! them to the guest.

/// Virtual root-hub ports (low half USB3, high half USB2).
pub const MAX_PORTS: u8 = 8;
/// Device slots (the minimum Windows xHCI drivers accept).
pub const MAX_SLOTS: u8 = 64;
/// Endpoint contexts per device, including the unused index 0.
pub const MAX_ENDPOINTS: u8 = 32;
/// Primary streams supported per endpoint.
pub const MAX_STREAMS: u16 = 1;

/// First vport of the USB3 range.
pub const USB3_PORT_START: u8 = 1;
/// First vport of the USB2 range.
pub const USB2_PORT_START: u8 = MAX_PORTS / 2 + 1;

pub const CAPLENGTH_VALUE: u8 = 0x20;
pub const HCIVERSION_VALUE: u16 = 0x0100;

/// Capability register offsets.
pub mod cap {
    pub const CAPLENGTH: u64 = 0x00;
    pub const HCSPARAMS1: u64 = 0x04;
    pub const HCSPARAMS2: u64 = 0x08;
    pub const HCSPARAMS3: u64 = 0x0C;
    pub const HCCPARAMS1: u64 = 0x10;
    pub const DBOFF: u64 = 0x14;
    pub const RTSOFF: u64 = 0x18;
    pub const HCCPARAMS2: u64 = 0x1C;
}

/// Operational register offsets, relative to [`OP_BASE`](super::regs::OP_BASE).
pub mod op {
    pub const USBCMD: u64 = 0x00;
    pub const USBSTS: u64 = 0x04;
    pub const PAGESIZE: u64 = 0x08;
    pub const DNCTRL: u64 = 0x14;
    pub const CRCR_LO: u64 = 0x18;
    pub const CRCR_HI: u64 = 0x1C;
    pub const DCBAAP_LO: u64 = 0x30;
    pub const DCBAAP_HI: u64 = 0x34;
    pub const CONFIG: u64 = 0x38;
    /// Port register file, relative to the operational base.
    pub const PORTREGS: u64 = 0x400;
}

/// Runtime register offsets, relative to [`RTS_OFF`].
pub mod runtime {
    pub const MFINDEX: u64 = 0x00;
    pub const MFINDEX_MASK: u32 = 0x3FFF;
    /// Interrupter 0 register set.
    pub const IR0: u64 = 0x20;
    pub const IR_IMAN: u64 = 0x00;
    pub const IR_IMOD: u64 = 0x04;
    pub const IR_ERSTSZ: u64 = 0x08;
    pub const IR_ERSTBA_LO: u64 = 0x10;
    pub const IR_ERSTBA_HI: u64 = 0x14;
    pub const IR_ERDP_LO: u64 = 0x18;
    pub const IR_ERDP_HI: u64 = 0x1C;
}

/// Per-port register set offsets.
pub mod port {
    pub const PORTSC: u64 = 0x00;
    pub const PORTPMSC: u64 = 0x04;
    pub const PORTLI: u64 = 0x08;
    pub const PORTHLPMC: u64 = 0x0C;
    pub const SET_SIZE: u64 = 0x10;

    /// Absolute BAR offset of `PORTSC` for a 1-based vport.
    pub fn portsc_offset(vport: u8) -> u64 {
        super::PORT_BASE + u64::from(vport - 1) * SET_SIZE
    }
}

pub const OP_BASE: u64 = CAPLENGTH_VALUE as u64;
pub const PORT_BASE: u64 = OP_BASE + op::PORTREGS;

/// Doorbell array offset: the port file ends dword-aligned.
pub const DB_OFF: u64 = PORT_BASE + MAX_PORTS as u64 * port::SET_SIZE;
/// Runtime registers: doorbells for slot 0..=MAX_SLOTS, 32-byte aligned.
pub const RTS_OFF: u64 = (DB_OFF + (MAX_SLOTS as u64 + 1) * 32 + 0x1F) & !0x1F;
/// End of the standard register file; the xECP list starts here.
pub const REGS_END: u64 = RTS_OFF + runtime::IR0 + 32;
/// Total BAR size: registers plus the extended-capability list.
pub const MMIO_SIZE: u64 = REGS_END + 4 * 32;

// Absolute offsets for the registers tests poke most.
pub const REG_USBCMD: u64 = OP_BASE + op::USBCMD;
pub const REG_USBSTS: u64 = OP_BASE + op::USBSTS;
pub const REG_CRCR_LO: u64 = OP_BASE + op::CRCR_LO;
pub const REG_CRCR_HI: u64 = OP_BASE + op::CRCR_HI;
pub const REG_DCBAAP_LO: u64 = OP_BASE + op::DCBAAP_LO;
pub const REG_DCBAAP_HI: u64 = OP_BASE + op::DCBAAP_HI;
pub const REG_CONFIG: u64 = OP_BASE + op::CONFIG;
pub const REG_DBOFF: u64 = cap::DBOFF;
pub const REG_MFINDEX: u64 = RTS_OFF + runtime::MFINDEX;
pub const REG_INTR0_IMAN: u64 = RTS_OFF + runtime::IR0 + runtime::IR_IMAN;
pub const REG_INTR0_IMOD: u64 = RTS_OFF + runtime::IR0 + runtime::IR_IMOD;
pub const REG_INTR0_ERSTSZ: u64 = RTS_OFF + runtime::IR0 + runtime::IR_ERSTSZ;
pub const REG_INTR0_ERSTBA_LO: u64 = RTS_OFF + runtime::IR0 + runtime::IR_ERSTBA_LO;
pub const REG_INTR0_ERSTBA_HI: u64 = RTS_OFF + runtime::IR0 + runtime::IR_ERSTBA_HI;
pub const REG_INTR0_ERDP_LO: u64 = RTS_OFF + runtime::IR0 + runtime::IR_ERDP_LO;
pub const REG_INTR0_ERDP_HI: u64 = RTS_OFF + runtime::IR0 + runtime::IR_ERDP_HI;

// USBCMD bits.
pub const USBCMD_RUN: u32 = 1 << 0;
pub const USBCMD_HCRST: u32 = 1 << 1;
pub const USBCMD_INTE: u32 = 1 << 2;
pub const USBCMD_HSEE: u32 = 1 << 3;
pub const USBCMD_LHCRST: u32 = 1 << 7;
pub const USBCMD_CSS: u32 = 1 << 8;
pub const USBCMD_CRS: u32 = 1 << 9;
pub const USBCMD_EWE: u32 = 1 << 10;
pub const USBCMD_EU3S: u32 = 1 << 11;
/// Bits a guest write may touch.
pub const USBCMD_WRITE_MASK: u32 = 0x3F0F;

// USBSTS bits.
pub const USBSTS_HCH: u32 = 1 << 0;
pub const USBSTS_HSE: u32 = 1 << 2;
pub const USBSTS_EINT: u32 = 1 << 3;
pub const USBSTS_PCD: u32 = 1 << 4;
pub const USBSTS_SSS: u32 = 1 << 8;
pub const USBSTS_RSS: u32 = 1 << 9;
pub const USBSTS_SRE: u32 = 1 << 10;
pub const USBSTS_CNR: u32 = 1 << 11;
pub const USBSTS_HCE: u32 = 1 << 12;

// CRCR bits.
pub const CRCR_RCS: u64 = 1 << 0;
pub const CRCR_CS: u64 = 1 << 1;
pub const CRCR_CA: u64 = 1 << 2;
pub const CRCR_CRR: u64 = 1 << 3;

pub const PAGESIZE_4K: u32 = 1;

// PORTSC bits.
pub const PORTSC_CCS: u32 = 1 << 0;
pub const PORTSC_PED: u32 = 1 << 1;
pub const PORTSC_OCA: u32 = 1 << 3;
pub const PORTSC_PR: u32 = 1 << 4;
pub const PORTSC_PLS_SHIFT: u32 = 5;
pub const PORTSC_PLS_MASK: u32 = 0xF << PORTSC_PLS_SHIFT;
pub const PORTSC_PP: u32 = 1 << 9;
pub const PORTSC_SPEED_SHIFT: u32 = 10;
pub const PORTSC_SPEED_MASK: u32 = 0xF << PORTSC_SPEED_SHIFT;
pub const PORTSC_PIC_MASK: u32 = 0x3 << 14;
pub const PORTSC_LWS: u32 = 1 << 16;
pub const PORTSC_CSC: u32 = 1 << 17;
pub const PORTSC_PEC: u32 = 1 << 18;
pub const PORTSC_WRC: u32 = 1 << 19;
pub const PORTSC_OCC: u32 = 1 << 20;
pub const PORTSC_PRC: u32 = 1 << 21;
pub const PORTSC_PLC: u32 = 1 << 22;
pub const PORTSC_CEC: u32 = 1 << 23;
pub const PORTSC_CAS: u32 = 1 << 24;
pub const PORTSC_DR: u32 = 1 << 30;
pub const PORTSC_WPR: u32 = 1u32 << 31;
/// All write-1-to-clear change bits.
pub const PORTSC_CHANGE_BITS: u32 = PORTSC_CSC
    | PORTSC_PEC
    | PORTSC_WRC
    | PORTSC_OCC
    | PORTSC_PRC
    | PORTSC_PLC
    | PORTSC_CEC;

// Port link states.
pub const PLS_U0: u32 = 0;
pub const PLS_U3: u32 = 3;
pub const PLS_RX_DETECT: u32 = 5;
pub const PLS_POLLING: u32 = 7;
pub const PLS_RESUME: u32 = 15;

pub fn pls_value(portsc: u32) -> u32 {
    (portsc & PORTSC_PLS_MASK) >> PORTSC_PLS_SHIFT
}

pub fn pls_field(pls: u32) -> u32 {
    (pls << PORTSC_PLS_SHIFT) & PORTSC_PLS_MASK
}

pub fn speed_field(speed: u32) -> u32 {
    (speed << PORTSC_SPEED_SHIFT) & PORTSC_SPEED_MASK
}

// Doorbell register fields.
pub const DB_TARGET_MASK: u32 = 0xFF;
pub const DB_SID_SHIFT: u32 = 16;

// Interrupter register bits.
pub const IMAN_IP: u32 = 1 << 0;
pub const IMAN_IE: u32 = 1 << 1;
pub const ERDP_DESI_MASK: u64 = 0x7;
pub const ERDP_EHB: u64 = 1 << 3;

// Extended capabilities.
pub const EXT_CAP_ID_SUPPORTED_PROTOCOL: u8 = 2;
/// "USB " protocol name string.
pub const PROTOCOL_NAME_USB: u32 = 0x2042_5355;
pub const USB_REVISION_2_0: u16 = 0x0200;
pub const USB_REVISION_3_0: u16 = 0x0300;

// Capability register values.
pub const CAPLENGTH_REG: u32 =
    (CAPLENGTH_VALUE as u32) | ((HCIVERSION_VALUE as u32) << 16);
pub const HCSPARAMS1: u32 =
    (MAX_SLOTS as u32) | (1 << 8) | ((MAX_PORTS as u32) << 24);
/// IST = 4 microframes, ERST max = 2^0 segments.
pub const HCSPARAMS2: u32 = 0x4;
pub const HCSPARAMS3: u32 = 0;
/// NSS + SPC + MAXPSA(1) + xECP pointer (in dwords).
pub const HCCPARAMS1: u32 =
    (1 << 7) | (1 << 9) | ((MAX_STREAMS as u32) << 12) | (((REGS_END / 4) as u32) << 16);
/// U3C + LEC.
pub const HCCPARAMS2: u32 = (1 << 0) | (1 << 4);
