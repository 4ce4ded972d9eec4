//! Transfer Request Block: the 16-byte record moved over every ring.

use crate::mem::MemoryBus;
use crate::usb::UsbStatus;

pub const TRB_LEN: usize = 16;

/// Raw TRB: a 64-bit parameter, a 32-bit status and a 32-bit control
/// word. Typed accessors below; unknown fields stay accessible raw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrbType {
    Reserved,
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    EnableSlotCommand,
    DisableSlotCommand,
    AddressDeviceCommand,
    ConfigureEndpointCommand,
    EvaluateContextCommand,
    ResetEndpointCommand,
    StopEndpointCommand,
    SetTrDequeuePointerCommand,
    ResetDeviceCommand,
    NoOpCommand,
    TransferEvent,
    CommandCompletionEvent,
    PortStatusChangeEvent,
    HostControllerEvent,
    Unknown(u8),
}

impl TrbType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => TrbType::Reserved,
            1 => TrbType::Normal,
            2 => TrbType::SetupStage,
            3 => TrbType::DataStage,
            4 => TrbType::StatusStage,
            5 => TrbType::Isoch,
            6 => TrbType::Link,
            7 => TrbType::EventData,
            8 => TrbType::NoOp,
            9 => TrbType::EnableSlotCommand,
            10 => TrbType::DisableSlotCommand,
            11 => TrbType::AddressDeviceCommand,
            12 => TrbType::ConfigureEndpointCommand,
            13 => TrbType::EvaluateContextCommand,
            14 => TrbType::ResetEndpointCommand,
            15 => TrbType::StopEndpointCommand,
            16 => TrbType::SetTrDequeuePointerCommand,
            17 => TrbType::ResetDeviceCommand,
            23 => TrbType::NoOpCommand,
            32 => TrbType::TransferEvent,
            33 => TrbType::CommandCompletionEvent,
            34 => TrbType::PortStatusChangeEvent,
            37 => TrbType::HostControllerEvent,
            other => TrbType::Unknown(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            TrbType::Reserved => 0,
            TrbType::Normal => 1,
            TrbType::SetupStage => 2,
            TrbType::DataStage => 3,
            TrbType::StatusStage => 4,
            TrbType::Isoch => 5,
            TrbType::Link => 6,
            TrbType::EventData => 7,
            TrbType::NoOp => 8,
            TrbType::EnableSlotCommand => 9,
            TrbType::DisableSlotCommand => 10,
            TrbType::AddressDeviceCommand => 11,
            TrbType::ConfigureEndpointCommand => 12,
            TrbType::EvaluateContextCommand => 13,
            TrbType::ResetEndpointCommand => 14,
            TrbType::StopEndpointCommand => 15,
            TrbType::SetTrDequeuePointerCommand => 16,
            TrbType::ResetDeviceCommand => 17,
            TrbType::NoOpCommand => 23,
            TrbType::TransferEvent => 32,
            TrbType::CommandCompletionEvent => 33,
            TrbType::PortStatusChangeEvent => 34,
            TrbType::HostControllerEvent => 37,
            TrbType::Unknown(raw) => raw,
        }
    }
}

/// Completion codes carried in event TRBs (xHCI table 6-90).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CompletionCode {
    Invalid = 0,
    Success = 1,
    DataBufferError = 2,
    BabbleDetected = 3,
    UsbTransactionError = 4,
    TrbError = 5,
    StallError = 6,
    ResourceError = 7,
    NoSlotsAvailable = 9,
    InvalidStreamType = 10,
    SlotNotEnabled = 11,
    EndpointNotEnabled = 12,
    ShortPacket = 13,
    ParameterError = 17,
    ContextStateError = 19,
    EventRingFull = 21,
    CommandAborted = 25,
    Stopped = 26,
    Undefined = 33,
    InvalidStreamId = 34,
}

impl CompletionCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Fixed backend-status mapping (the only place a `UsbStatus`
    /// becomes guest-visible).
    pub fn from_usb(status: UsbStatus) -> Self {
        match status {
            UsbStatus::NormalCompletion => CompletionCode::Success,
            UsbStatus::ShortXfer => CompletionCode::ShortPacket,
            UsbStatus::Stalled | UsbStatus::NoCallback => CompletionCode::StallError,
            UsbStatus::BadBufsize => CompletionCode::BabbleDetected,
            UsbStatus::Timeout | UsbStatus::Interrupted => CompletionCode::CommandAborted,
            UsbStatus::IoError | UsbStatus::BadContext => CompletionCode::TrbError,
            UsbStatus::DmaLoadFailed => CompletionCode::DataBufferError,
            UsbStatus::NoMem
            | UsbStatus::InUse
            | UsbStatus::NoAddr
            | UsbStatus::NoPipe
            | UsbStatus::PendingRequests
            | UsbStatus::SetAddrFailed
            | UsbStatus::TooDeep => CompletionCode::ResourceError,
            UsbStatus::NotStarted | UsbStatus::NoPower | UsbStatus::NotConfigured => {
                CompletionCode::EndpointNotEnabled
            }
            UsbStatus::Invalid | UsbStatus::BadAddress | UsbStatus::BadFlag => {
                CompletionCode::ParameterError
            }
            UsbStatus::Cancelled => CompletionCode::Stopped,
            UsbStatus::ZeroNframes
            | UsbStatus::ZeroMaxp
            | UsbStatus::NoRootHub
            | UsbStatus::NoIntrThread
            | UsbStatus::NotLocked => CompletionCode::Undefined,
        }
    }
}

impl Trb {
    pub const CONTROL_CYCLE_BIT: u32 = 1 << 0;
    /// Toggle Cycle on LINK TRBs (Evaluate Next on transfer TRBs).
    pub const CONTROL_TC_BIT: u32 = 1 << 1;
    pub const CONTROL_ISP_BIT: u32 = 1 << 2;
    /// Event Data flag on Transfer Event TRBs.
    pub const CONTROL_ED_BIT: u32 = 1 << 2;
    pub const CONTROL_CHAIN_BIT: u32 = 1 << 4;
    pub const CONTROL_IOC_BIT: u32 = 1 << 5;
    pub const CONTROL_IDT_BIT: u32 = 1 << 6;
    /// Deconfigure flag on Configure Endpoint commands.
    pub const CONTROL_DC_BIT: u32 = 1 << 9;
    /// Suspend flag on Stop Endpoint commands.
    pub const CONTROL_SUSPEND_BIT: u32 = 1 << 23;

    pub const STATUS_TRANSFER_LEN_MASK: u32 = 0x1_FFFF;
    pub const STATUS_EVENT_REMAINDER_MASK: u32 = 0x00FF_FFFF;
    pub const STATUS_EDTLA_MASK: u32 = 0x000F_FFFF;

    pub fn new(parameter: u64, status: u32, control: u32) -> Self {
        Self {
            parameter,
            status,
            control,
        }
    }

    pub fn from_bytes(bytes: [u8; TRB_LEN]) -> Self {
        Self {
            parameter: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            status: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            control: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
        }
    }

    pub fn to_bytes(&self) -> [u8; TRB_LEN] {
        let mut bytes = [0u8; TRB_LEN];
        bytes[0..8].copy_from_slice(&self.parameter.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.status.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.control.to_le_bytes());
        bytes
    }

    pub fn read_from(mem: &mut dyn MemoryBus, paddr: u64) -> Self {
        let mut bytes = [0u8; TRB_LEN];
        mem.read_physical(paddr, &mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn write_to(&self, mem: &mut dyn MemoryBus, paddr: u64) {
        mem.write_physical(paddr, &self.to_bytes());
    }

    pub fn trb_type(&self) -> TrbType {
        TrbType::from_raw(self.trb_type_raw())
    }

    pub fn trb_type_raw(&self) -> u8 {
        ((self.control >> 10) & 0x3F) as u8
    }

    pub fn set_trb_type(&mut self, ty: TrbType) {
        self.control = (self.control & !(0x3F << 10)) | (u32::from(ty.raw()) << 10);
    }

    pub fn cycle(&self) -> bool {
        self.control & Self::CONTROL_CYCLE_BIT != 0
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= Self::CONTROL_CYCLE_BIT;
        } else {
            self.control &= !Self::CONTROL_CYCLE_BIT;
        }
    }

    pub fn link_toggle_cycle(&self) -> bool {
        self.control & Self::CONTROL_TC_BIT != 0
    }

    pub fn set_link_toggle_cycle(&mut self, tc: bool) {
        if tc {
            self.control |= Self::CONTROL_TC_BIT;
        } else {
            self.control &= !Self::CONTROL_TC_BIT;
        }
    }

    pub fn chain(&self) -> bool {
        self.control & Self::CONTROL_CHAIN_BIT != 0
    }

    pub fn ioc(&self) -> bool {
        self.control & Self::CONTROL_IOC_BIT != 0
    }

    pub fn immediate_data(&self) -> bool {
        self.control & Self::CONTROL_IDT_BIT != 0
    }

    pub fn slot_id(&self) -> u8 {
        (self.control >> 24) as u8
    }

    pub fn set_slot_id(&mut self, slot_id: u8) {
        self.control = (self.control & 0x00FF_FFFF) | (u32::from(slot_id) << 24);
    }

    /// Endpoint (DCI) field of command and transfer-event TRBs.
    pub fn endpoint_id(&self) -> u8 {
        ((self.control >> 16) & 0x1F) as u8
    }

    pub fn set_endpoint_id(&mut self, epid: u8) {
        self.control = (self.control & !(0x1F << 16)) | ((u32::from(epid) & 0x1F) << 16);
    }

    /// Stream ID of doorbell-adjacent command TRBs (status dword).
    pub fn stream_id(&self) -> u16 {
        (self.status >> 16) as u16
    }

    pub fn transfer_len(&self) -> u32 {
        self.status & Self::STATUS_TRANSFER_LEN_MASK
    }

    pub fn completion_code_raw(&self) -> u8 {
        (self.status >> 24) as u8
    }

    pub fn set_completion_code(&mut self, code: CompletionCode) {
        self.status = (self.status & 0x00FF_FFFF) | (u32::from(code.as_u8()) << 24);
    }

    /// 16-byte-aligned pointer payload (ring addresses, contexts).
    pub fn pointer(&self) -> u64 {
        self.parameter & !0xF
    }

    pub fn dword0(&self) -> u32 {
        self.parameter as u32
    }
}

/// Command Completion Event for the command TRB at `cmd_gpa`.
pub fn command_completion(cmd_gpa: u64, slot_id: u8, code: CompletionCode) -> Trb {
    let mut trb = Trb::new(cmd_gpa & !0xF, 0, 0);
    trb.set_trb_type(TrbType::CommandCompletionEvent);
    trb.set_completion_code(code);
    trb.set_slot_id(slot_id);
    trb
}

/// Port Status Change Event for a 1-based root-hub port.
pub fn port_status_change(vport: u8) -> Trb {
    let mut trb = Trb::new(u64::from(vport) << 24, 0, 0);
    trb.set_trb_type(TrbType::PortStatusChangeEvent);
    trb.set_completion_code(CompletionCode::Success);
    trb
}

/// Transfer Event carrying a completion code and residual byte count.
pub fn transfer_event(
    trb_gpa: u64,
    slot_id: u8,
    epid: u8,
    code: CompletionCode,
    remainder: u32,
) -> Trb {
    let mut trb = Trb::new(
        trb_gpa,
        remainder & Trb::STATUS_EVENT_REMAINDER_MASK,
        0,
    );
    trb.set_trb_type(TrbType::TransferEvent);
    trb.set_completion_code(code);
    trb.set_slot_id(slot_id);
    trb.set_endpoint_id(epid);
    trb
}
