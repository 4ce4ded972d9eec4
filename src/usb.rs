use std::fmt;

/// Maximum hub nesting depth in a host device path.
pub const USB_MAX_TIERS: usize = 7;

/// Status reported by a USB backend for a transfer or control request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbStatus {
    NormalCompletion,
    PendingRequests,
    NotStarted,
    Invalid,
    NoMem,
    Cancelled,
    BadAddress,
    BadBufsize,
    BadFlag,
    NoCallback,
    InUse,
    NoAddr,
    NoPipe,
    ZeroNframes,
    ZeroMaxp,
    SetAddrFailed,
    NoPower,
    TooDeep,
    IoError,
    NotConfigured,
    Timeout,
    ShortXfer,
    Stalled,
    Interrupted,
    DmaLoadFailed,
    BadContext,
    NoRootHub,
    NoIntrThread,
    NotLocked,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbDir {
    Out,
    In,
}

/// Device speed as reported by the host stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
}

impl UsbSpeed {
    /// PORTSC / slot-context speed ID (xHCI table 7-13; zero = undefined).
    pub fn port_speed(self) -> u32 {
        match self {
            UsbSpeed::Low => 2,
            UsbSpeed::Full => 1,
            UsbSpeed::High => 3,
            UsbSpeed::Super => 4,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbVersion {
    Usb2,
    Usb3,
}

/// The 8-byte SETUP packet of a control transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn from_bytes(raw: [u8; 8]) -> Self {
        Self {
            bm_request_type: raw[0],
            b_request: raw[1],
            w_value: u16::from_le_bytes([raw[2], raw[3]]),
            w_index: u16::from_le_bytes([raw[4], raw[5]]),
            w_length: u16::from_le_bytes([raw[6], raw[7]]),
        }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut raw = [0u8; 8];
        raw[0] = self.bm_request_type;
        raw[1] = self.b_request;
        raw[2..4].copy_from_slice(&self.w_value.to_le_bytes());
        raw[4..6].copy_from_slice(&self.w_index.to_le_bytes());
        raw[6..8].copy_from_slice(&self.w_length.to_le_bytes());
        raw
    }

    pub fn is_device_to_host(self) -> bool {
        self.bm_request_type & 0x80 != 0
    }
}

/// One transfer descriptor inside an [`Xfer`] chain.
///
/// Blocks map 1:1 onto the transfer TRBs that produced them. `data` is the
/// staging buffer: OUT payloads are copied in from guest memory before
/// submission, IN payloads are copied out after the backend fills them.
#[derive(Debug, Default)]
pub struct XferBlock {
    pub data: Vec<u8>,
    /// Guest buffer address; zero for immediate-data and empty blocks.
    pub gpa: u64,
    /// Bytes requested.
    pub len: u32,
    /// Bytes the backend actually moved.
    pub done: u32,
    /// No backend I/O required (LINK, SETUP, NOOP, EVENT_DATA).
    pub processed: bool,
    /// Backend has consumed/filled this block.
    pub handled: bool,
    /// Backend NAKed at this block; only meaningful at the chain head.
    pub nak: bool,
    /// GPA of the TRB this block was assembled from.
    pub trb_gpa: u64,
    /// Ring position just past this block's TRB.
    pub trb_next: u64,
    /// Consumer cycle state after this block's TRB.
    pub ccs: bool,
    /// Cached TRB control word (type, IOC, ISP, CH, ED).
    pub trb_control: u32,
    pub stream_id: u16,
}

impl XferBlock {
    pub fn remaining(&self) -> u32 {
        self.len.saturating_sub(self.done)
    }
}

/// An in-flight transfer batch for one (slot, endpoint, stream).
///
/// At most one batch exists per endpoint at a time; a NAKed batch stays
/// parked at the head of the ring and is re-submitted on the next
/// doorbell or device interrupt.
#[derive(Debug)]
pub struct Xfer {
    pub blocks: Vec<XferBlock>,
    pub setup: Option<SetupPacket>,
    pub status: UsbStatus,
    pub slot_id: u8,
    pub epid: u8,
    /// Index of the first block not yet completed toward the guest.
    pub head: usize,
}

impl Xfer {
    pub fn new(slot_id: u8, epid: u8) -> Self {
        Self {
            blocks: Vec::new(),
            setup: None,
            status: UsbStatus::NormalCompletion,
            slot_id,
            epid,
            head: 0,
        }
    }

    pub fn reset(&mut self) {
        self.blocks.clear();
        self.setup = None;
        self.status = UsbStatus::NormalCompletion;
        self.head = 0;
    }

    pub fn append(&mut self, block: XferBlock) -> &mut XferBlock {
        self.blocks.push(block);
        self.blocks.last_mut().unwrap()
    }

    /// Blocks still waiting on the backend or on event delivery.
    pub fn is_pending(&self) -> bool {
        self.head < self.blocks.len()
    }

    /// Total bytes requested across data-bearing blocks.
    pub fn total_requested(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.len)).sum()
    }

    /// Blocks the backend is expected to service.
    pub fn unprocessed_mut(&mut self) -> impl Iterator<Item = &mut XferBlock> {
        self.blocks.iter_mut().filter(|b| !b.processed && !b.handled)
    }
}

/// A host-owned USB device (passthrough adapter or synthetic emulation)
/// bound to a virtual root-hub port.
///
/// `request`/`data` are the only operations allowed to block; they run a
/// whole batch and record per-block results in the chain.
pub trait UsbDevice {
    fn version(&self) -> UsbVersion;
    fn speed(&self) -> UsbSpeed;

    fn reset(&mut self) -> Result<(), UsbStatus>;

    /// EP0 control transfer: SETUP plus the batch's data/status blocks.
    fn request(&mut self, setup: SetupPacket, xfer: &mut Xfer) -> UsbStatus;

    /// Non-control transfer on endpoint `epnum` (1..=15).
    fn data(&mut self, dir: UsbDir, epnum: u8, xfer: &mut Xfer) -> UsbStatus;

    /// Deconfigure notification (CONFIGURE_EP with DC flag).
    fn stop(&mut self) {}

    fn deinit(&mut self) {}
}

/// Physical location of a host device: bus number plus the chain of hub
/// port numbers leading to it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DevPath {
    pub bus: u8,
    pub depth: u8,
    pub chain: [u8; USB_MAX_TIERS],
}

impl DevPath {
    pub fn root(bus: u8, port: u8) -> Self {
        let mut chain = [0u8; USB_MAX_TIERS];
        chain[0] = port;
        Self { bus, depth: 1, chain }
    }

    /// Path of the device behind `port` of the hub at `self`.
    pub fn child(&self, port: u8) -> Option<Self> {
        let depth = usize::from(self.depth);
        if depth >= USB_MAX_TIERS {
            return None;
        }
        let mut chain = self.chain;
        chain[depth] = port;
        Some(Self {
            bus: self.bus,
            depth: self.depth + 1,
            chain,
        })
    }

    pub fn root_port(&self) -> u8 {
        self.chain[0]
    }
}

impl fmt::Display for DevPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-", self.bus)?;
        for (i, port) in self.chain[..usize::from(self.depth)].iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            write!(f, "{port}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevKind {
    Device,
    ExtHub,
}

/// Host-side description of a device delivered with connect/disconnect
/// notifications.
#[derive(Clone, Debug)]
pub struct DevInfo {
    pub vid: u16,
    pub pid: u16,
    /// bcdUSB; `< 0x300` selects the USB2 port range.
    pub bcd: u16,
    pub speed: UsbSpeed,
    pub kind: DevKind,
    pub path: DevPath,
    /// Downstream port count for external hubs.
    pub maxchild: u8,
}

/// Builds backend models for native devices when the guest first
/// addresses them (the passthrough adapter seam).
pub trait UsbDeviceFactory {
    fn create(&mut self, info: &DevInfo) -> Option<Box<dyn UsbDevice>>;
}

/// Host USB discovery notifications consumed by the controller.
pub trait PortBackend {
    fn on_connect(&mut self, info: DevInfo);
    fn on_disconnect(&mut self, info: DevInfo);
}
