//! Host-device to virtual-port mapping.
//!
//! An administrator (or the device-option string) *assigns* host device
//! paths to the controller. When the host stack reports one of those
//! paths as connected, a free vport is chosen from the range matching
//! the device's USB revision; ADDRESS_DEVICE later promotes the binding
//! to Emulated. The VBDP cache preserves vport bindings across guest
//! suspend/resume so a device reappears on the port the guest knew.

use tracing::debug;

use crate::usb::{DevInfo, DevKind, DevPath};
use crate::xhci::regs::{MAX_PORTS, USB2_PORT_START, USB3_PORT_START};

/// Assigned-table capacity: hubs can fan one path out into several.
pub const MAX_ASSIGNED: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VportState {
    Assigned,
    Connected,
    Emulated,
}

#[derive(Clone, Debug)]
pub(crate) struct NativePort {
    pub info: DevInfo,
    pub vport: u8,
    pub state: VportState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VbdpState {
    Start,
    End,
}

/// One suspended device binding: replayed on `vport` once the resume
/// handshake reaches `End`.
#[derive(Clone, Debug)]
pub struct VbdpDev {
    pub path: DevPath,
    pub vport: u8,
    pub state: VbdpState,
}

#[derive(Debug, Default)]
pub(crate) struct PortMapper {
    assigned: Vec<Option<NativePort>>,
    vbdp_devs: Vec<VbdpDev>,
}

impl PortMapper {
    pub fn new() -> Self {
        Self {
            assigned: (0..MAX_ASSIGNED).map(|_| None).collect(),
            vbdp_devs: Vec::new(),
        }
    }

    pub fn index_by_path(&self, path: &DevPath) -> Option<usize> {
        self.assigned
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.info.path == *path))
    }

    pub fn index_by_vport(&self, vport: u8) -> Option<usize> {
        self.assigned
            .iter()
            .position(|p| p.as_ref().is_some_and(|p| p.vport == vport))
    }

    pub fn entry(&self, index: usize) -> Option<&NativePort> {
        self.assigned.get(index).and_then(Option::as_ref)
    }

    pub fn entry_mut(&mut self, index: usize) -> Option<&mut NativePort> {
        self.assigned.get_mut(index).and_then(Option::as_mut)
    }

    /// Reserve a table slot for a host path.
    pub fn assign(&mut self, info: DevInfo) -> Option<usize> {
        if self.index_by_path(&info.path).is_some() {
            return None;
        }
        let slot = self.assigned.iter().position(Option::is_none)?;
        debug!(path = %info.path, "assign host device path");
        self.assigned[slot] = Some(NativePort {
            info,
            vport: 0,
            state: VportState::Assigned,
        });
        Some(slot)
    }

    pub fn unassign(&mut self, path: &DevPath) {
        if let Some(index) = self.index_by_path(path) {
            debug!(path = %path, "unassign host device path");
            self.assigned[index] = None;
        }
    }

    /// A known hub connected: reserve one path per downstream port.
    /// The hub itself never occupies a vport.
    pub fn assign_hub_ports(&mut self, info: &DevInfo) -> Result<(), ()> {
        if info.kind != DevKind::ExtHub {
            return Err(());
        }
        let index = self.index_by_path(&info.path).ok_or(())?;
        if let Some(entry) = self.entry_mut(index) {
            entry.info = info.clone();
        }
        for port in 1..=info.maxchild {
            let Some(child) = info.path.child(port) else {
                return Err(());
            };
            let child_info = DevInfo {
                path: child,
                kind: DevKind::Device,
                maxchild: 0,
                ..info.clone()
            };
            if self.assign(child_info).is_none() {
                return Err(());
            }
        }
        Ok(())
    }

    pub fn unassign_hub_ports(&mut self, info: &DevInfo) -> Result<(), ()> {
        if info.kind != DevKind::ExtHub {
            return Err(());
        }
        let index = self.index_by_path(&info.path).ok_or(())?;
        let maxchild = self.entry(index).map(|e| e.info.maxchild).unwrap_or(0);
        let base = self.entry(index).map(|e| e.info.path).ok_or(())?;
        for port in 1..=maxchild {
            if let Some(child) = base.child(port) {
                self.unassign(&child);
            }
        }
        Ok(())
    }

    /// Pick a free vport for a connecting device: USB2 devices land in
    /// the high half, USB3 in the low half. Ports cached by an
    /// in-progress suspend/resume cycle are not free.
    pub fn free_vport(&self, bcd: u16) -> Option<u8> {
        let start = if bcd < 0x300 {
            USB2_PORT_START
        } else {
            USB3_PORT_START
        };
        let end = start + MAX_PORTS / 2 - 1;
        (start..=end).find(|&vport| {
            self.index_by_vport(vport).is_none()
                && !self
                    .vbdp_devs
                    .iter()
                    .any(|d| d.state == VbdpState::Start && d.vport == vport)
        })
    }

    /// CSS snapshot: record every emulated binding for resume replay and
    /// demote it to Assigned. Returns the vports that were vacated.
    pub fn suspend_emulated(&mut self) -> Vec<u8> {
        self.vbdp_devs.clear();
        let mut vacated = Vec::new();
        for entry in self.assigned.iter_mut().flatten() {
            if entry.state != VportState::Emulated {
                continue;
            }
            debug!(path = %entry.info.path, vport = entry.vport, "suspend: cache device binding");
            self.vbdp_devs.push(VbdpDev {
                path: entry.info.path,
                vport: entry.vport,
                state: VbdpState::Start,
            });
            vacated.push(entry.vport);
            entry.vport = 0;
            entry.state = VportState::Assigned;
        }
        vacated
    }

    /// Cached vport for a path still inside the suspend/resume window.
    pub fn vbdp_cached_vport(&self, path: &DevPath) -> Option<u8> {
        self.vbdp_devs
            .iter()
            .find(|d| d.state == VbdpState::Start && d.path == *path)
            .map(|d| d.vport)
    }

    /// CRS: the resume handshake is over for every cached device.
    /// Returns how many entries moved to `End`.
    pub fn vbdp_finish_resume(&mut self) -> usize {
        let mut moved = 0;
        for dev in &mut self.vbdp_devs {
            if dev.state == VbdpState::Start {
                dev.state = VbdpState::End;
                moved += 1;
            }
        }
        moved
    }

    /// Worker side: consume one `End` entry.
    pub fn vbdp_take_ended(&mut self) -> Option<DevPath> {
        let index = self
            .vbdp_devs
            .iter()
            .position(|d| d.state == VbdpState::End)?;
        Some(self.vbdp_devs.remove(index).path)
    }

    pub fn vbdp_state(&self) -> &[VbdpDev] {
        &self.vbdp_devs
    }

    pub fn restore_vbdp_state(&mut self, devs: Vec<VbdpDev>) {
        self.vbdp_devs = devs;
    }
}
