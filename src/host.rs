//! Serialization layer around the controller.
//!
//! The controller itself is a plain `&mut self` state machine; this
//! wrapper owns it (together with the guest-memory capability) behind a
//! single mutex and funnels the concurrent entry points through it:
//! vCPU MMIO traps, host USB hotplug callbacks, backend device
//! interrupts, and the suspend/resume (VBDP) worker. The worker blocks
//! on a condvar signaled by the register path when a cached device
//! binding finishes its resume handshake.

use std::sync::{Arc, Condvar, Mutex};

use crate::mem::MemoryBus;
use crate::usb::{DevInfo, PortBackend};
use crate::xhci::XhciController;

struct Inner<M: MemoryBus> {
    ctrl: XhciController,
    mem: M,
}

#[derive(Default)]
struct VbdpSignal {
    pending: usize,
    shutdown: bool,
}

pub struct HostEventLoop<M: MemoryBus> {
    inner: Mutex<Inner<M>>,
    vbdp: Mutex<VbdpSignal>,
    vbdp_cv: Condvar,
}

impl<M: MemoryBus> HostEventLoop<M> {
    pub fn new(ctrl: XhciController, mem: M) -> Self {
        Self {
            inner: Mutex::new(Inner { ctrl, mem }),
            vbdp: Mutex::new(VbdpSignal::default()),
            vbdp_cv: Condvar::new(),
        }
    }

    /// Run `f` with the controller and guest memory, serialized against
    /// every other entry point.
    pub fn with<R>(&self, f: impl FnOnce(&mut XhciController, &mut M) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        let Inner { ctrl, mem } = &mut *inner;
        f(ctrl, mem)
    }

    pub fn mmio_read(&self, offset: u64, size: u8) -> u64 {
        self.with(|ctrl, mem| ctrl.mmio_read(mem, offset, size))
    }

    pub fn mmio_write(&self, offset: u64, size: u8, value: u64) {
        self.with(|ctrl, mem| ctrl.mmio_write(mem, offset, size, value));
        self.forward_vbdp_wakeups();
    }

    /// Backend-initiated endpoint activity (interrupt transfers).
    pub fn device_interrupt(&self, vport: u8, ep_addr: u8) {
        self.with(|ctrl, mem| ctrl.device_interrupt(mem, vport, ep_addr));
    }

    pub fn on_connect(&self, info: DevInfo) {
        self.with(|ctrl, mem| ctrl.handle_host_connect(mem, info));
    }

    pub fn on_disconnect(&self, info: DevInfo) {
        self.with(|ctrl, mem| ctrl.handle_host_disconnect(mem, info));
    }

    fn forward_vbdp_wakeups(&self) {
        let wakeups = self.with(|ctrl, _| ctrl.take_vbdp_wakeups());
        if wakeups > 0 {
            let mut sig = self.vbdp.lock().unwrap();
            sig.pending += wakeups;
            self.vbdp_cv.notify_all();
        }
    }

    /// One non-blocking worker iteration; true when a deferred connect
    /// was replayed.
    pub fn vbdp_service_once(&self) -> bool {
        {
            let mut sig = self.vbdp.lock().unwrap();
            if sig.pending == 0 {
                return false;
            }
            sig.pending -= 1;
        }
        self.with(|ctrl, mem| ctrl.vbdp_service_once(mem))
    }

    /// Blocking worker loop; runs until [`shutdown`](Self::shutdown).
    pub fn vbdp_worker(&self) {
        loop {
            {
                let mut sig = self.vbdp.lock().unwrap();
                while sig.pending == 0 && !sig.shutdown {
                    sig = self.vbdp_cv.wait(sig).unwrap();
                }
                if sig.shutdown {
                    return;
                }
                sig.pending -= 1;
            }
            self.with(|ctrl, mem| ctrl.vbdp_service_once(mem));
        }
    }

    pub fn shutdown(&self) {
        self.vbdp.lock().unwrap().shutdown = true;
        self.vbdp_cv.notify_all();
    }
}

impl<M: MemoryBus> PortBackend for Arc<HostEventLoop<M>> {
    fn on_connect(&mut self, info: DevInfo) {
        HostEventLoop::on_connect(self, info);
    }

    fn on_disconnect(&mut self, info: DevInfo) {
        HostEventLoop::on_disconnect(self, info);
    }
}
