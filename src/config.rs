//! Device-option string parsing.
//!
//! The controller accepts a comma-separated option string naming the
//! devices present at boot: `tablet` (or another registered emulation
//! name, optionally `name=config`), or `<bus>-<port>` to assign a host
//! device path for passthrough. Emulated devices are placed into the
//! USB2 or USB3 vport range according to their USB version; each range
//! holds four devices.

use thiserror::Error;

use crate::usb::{DevInfo, DevKind, DevPath, UsbDevice, UsbSpeed, UsbVersion};
use crate::xhci::regs::{MAX_PORTS, USB2_PORT_START, USB3_PORT_START};
use crate::xhci::XhciController;

/// Highest host bus / root-port numbers accepted in `<bus>-<port>`.
const MAX_NATIVE_BUS: u32 = 255;
const MAX_NATIVE_PORT: u32 = 254;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid device option {0:?}")]
    BadSyntax(String),
    #[error("unknown emulated device {0:?}")]
    UnknownDevice(String),
    #[error("USB{0} port range exhausted")]
    TooManyDevices(u8),
}

/// One emulated-device option, e.g. `tablet` or `tablet=abs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceOpt {
    pub name: String,
    pub config: String,
}

/// Parsed device-option string: emulated devices with their chosen
/// vports plus host paths reserved for passthrough.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerOpts {
    pub emulated: Vec<(u8, DeviceOpt)>,
    pub passthrough: Vec<DevPath>,
}

impl ControllerOpts {
    /// Parse `opts`, consulting `device_version` for the USB revision
    /// of each named emulation (to pick the right port range).
    pub fn parse(
        opts: &str,
        device_version: impl Fn(&str) -> Option<UsbVersion>,
    ) -> Result<Self, ConfigError> {
        let mut out = ControllerOpts::default();
        let mut next_usb2 = USB2_PORT_START;
        let mut next_usb3 = USB3_PORT_START;
        let usb2_end = USB2_PORT_START + MAX_PORTS / 2;
        let usb3_end = USB3_PORT_START + MAX_PORTS / 2;

        for raw in opts.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (name, config) = match raw.split_once('=') {
                Some((name, config)) => (name, config),
                None => (raw, ""),
            };

            if name.starts_with(|c: char| c.is_ascii_digit()) {
                out.passthrough.push(parse_bus_port(name)?);
                continue;
            }

            let version = device_version(name)
                .ok_or_else(|| ConfigError::UnknownDevice(name.to_string()))?;
            let vport = match version {
                UsbVersion::Usb2 => {
                    if next_usb2 >= usb2_end {
                        return Err(ConfigError::TooManyDevices(2));
                    }
                    let v = next_usb2;
                    next_usb2 += 1;
                    v
                }
                UsbVersion::Usb3 => {
                    if next_usb3 >= usb3_end {
                        return Err(ConfigError::TooManyDevices(3));
                    }
                    let v = next_usb3;
                    next_usb3 += 1;
                    v
                }
            };
            out.emulated.push((
                vport,
                DeviceOpt {
                    name: name.to_string(),
                    config: config.to_string(),
                },
            ));
        }
        Ok(out)
    }
}

/// `<bus>-<port>`, both decimal; the stored root port is 1-based.
fn parse_bus_port(opt: &str) -> Result<DevPath, ConfigError> {
    let bad = || ConfigError::BadSyntax(opt.to_string());
    let (bus, port) = opt.split_once('-').ok_or_else(bad)?;
    let bus: u32 = bus.parse().map_err(|_| bad())?;
    let port: u32 = port.parse().map_err(|_| bad())?;
    if bus > MAX_NATIVE_BUS || port > MAX_NATIVE_PORT {
        return Err(bad());
    }
    Ok(DevPath::root(bus as u8, (port + 1) as u8))
}

/// Apply parsed options to a controller: cold-attach each emulated
/// device built by `make`, reserve each passthrough path.
pub fn place_devices(
    ctrl: &mut XhciController,
    opts: &ControllerOpts,
    make: &mut dyn FnMut(&DeviceOpt) -> Option<Box<dyn UsbDevice>>,
) -> Result<(), ConfigError> {
    for (vport, opt) in &opts.emulated {
        let model = make(opt).ok_or_else(|| ConfigError::UnknownDevice(opt.name.clone()))?;
        ctrl.attach_device(*vport, model);
    }
    for path in &opts.passthrough {
        ctrl.assign_native_path(DevInfo {
            vid: 0,
            pid: 0,
            bcd: 0,
            speed: UsbSpeed::Full,
            kind: DevKind::Device,
            path: *path,
            maxchild: 0,
        });
    }
    Ok(())
}
