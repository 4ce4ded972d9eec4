//! Root-hub port register file.
//!
//! Pure register state and transitions; event generation and backend
//! reset calls are sequenced by the controller.

use crate::xhci::regs::{
    pls_field, speed_field, MAX_PORTS, PLS_POLLING, PLS_RX_DETECT, PLS_U0, PORTSC_CCS,
    PORTSC_CSC, PORTSC_PED, PORTSC_PLS_MASK, PORTSC_PP, PORTSC_PR, PORTSC_PRC, PORTSC_SPEED_MASK,
    PORTSC_WRC,
};

#[derive(Clone, Copy, Debug, Default)]
pub struct PortRegs {
    pub portsc: u32,
    pub portpmsc: u32,
    pub portli: u32,
    pub porthlpmc: u32,
}

/// All root-hub ports, indexed by 1-based vport.
#[derive(Clone, Debug)]
pub struct PortTable {
    ports: Vec<PortRegs>,
}

impl PortTable {
    pub fn new() -> Self {
        let mut table = Self {
            ports: vec![PortRegs::default(); usize::from(MAX_PORTS) + 1],
        };
        for vport in 1..=MAX_PORTS {
            table.init_empty(vport);
        }
        table
    }

    pub fn is_valid_vport(vport: u8) -> bool {
        vport >= 1 && vport <= MAX_PORTS
    }

    pub fn regs(&self, vport: u8) -> &PortRegs {
        &self.ports[usize::from(vport)]
    }

    pub fn regs_mut(&mut self, vport: u8) -> &mut PortRegs {
        &mut self.ports[usize::from(vport)]
    }

    pub fn portsc(&self, vport: u8) -> u32 {
        self.ports[usize::from(vport)].portsc
    }

    /// Powered, empty port: nothing connected, link in RxDetect.
    pub fn init_empty(&mut self, vport: u8) {
        self.ports[usize::from(vport)] = PortRegs {
            portsc: PORTSC_PP | pls_field(PLS_RX_DETECT),
            ..PortRegs::default()
        };
    }

    /// Device appeared on `vport`. USB3 links train straight to U0 and
    /// enable; USB2 links sit in Polling until the guest resets the port.
    pub fn set_connected(&mut self, vport: u8, speed: u32, usb3: bool) {
        let regs = &mut self.ports[usize::from(vport)];
        regs.portsc = PORTSC_CCS | PORTSC_PP | PORTSC_CSC | speed_field(speed);
        if usb3 {
            regs.portsc |= PORTSC_PED | pls_field(PLS_U0);
        } else {
            regs.portsc |= pls_field(PLS_POLLING);
        }
    }

    /// Device left `vport`: connect + enable drop, CSC latches, the
    /// link falls back to RxDetect.
    pub fn set_disconnected(&mut self, vport: u8) {
        let regs = &mut self.ports[usize::from(vport)];
        regs.portsc &= !(PORTSC_CCS | PORTSC_PED | PORTSC_PLS_MASK | PORTSC_SPEED_MASK);
        regs.portsc |= PORTSC_CSC | pls_field(PLS_RX_DETECT);
    }

    /// Complete a port reset on an occupied port. Returns true when PRC
    /// was newly latched (a status-change event is due).
    pub fn complete_reset(&mut self, vport: u8, speed: u32, warm_usb3: bool) -> bool {
        let regs = &mut self.ports[usize::from(vport)];
        regs.portsc &= !(PORTSC_PLS_MASK | PORTSC_PR);
        regs.portsc |= PORTSC_PED | speed_field(speed);
        if warm_usb3 {
            regs.portsc |= PORTSC_WRC;
        }
        let newly = regs.portsc & PORTSC_PRC == 0;
        if newly {
            regs.portsc |= PORTSC_PRC;
        }
        newly
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}
