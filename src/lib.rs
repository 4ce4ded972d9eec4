//! USB host-controller device models for a hardware virtualization
//! environment.
//!
//! The crate currently provides an xHCI (USB 3.0) controller model: the
//! guest sees a memory-mapped xHCI register file and rings; behind it,
//! transfers are routed to host-owned USB backends through the
//! [`UsbDevice`] trait and host hotplug events arrive through
//! [`PortBackend`].

pub mod config;
pub mod host;
mod mem;
pub mod pci;
pub mod snapshot;
mod usb;
pub mod xhci;

pub use config::{place_devices, ConfigError, ControllerOpts, DeviceOpt};
pub use host::HostEventLoop;
pub use mem::MemoryBus;
pub use pci::{NullPciBus, PciBus};
pub use usb::{
    DevInfo, DevKind, DevPath, PortBackend, SetupPacket, UsbDevice, UsbDeviceFactory, UsbDir,
    UsbSpeed, UsbStatus, UsbVersion, Xfer, XferBlock, USB_MAX_TIERS,
};
