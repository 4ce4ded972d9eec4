/// Guest physical memory as seen by the controller's DMA engine.
///
/// Implementations must tolerate arbitrary addresses: the guest programs
/// ring and context pointers, so an access outside backing storage has to
/// degrade (zero-fill reads, dropped writes), never panic.
pub trait MemoryBus {
    fn read_physical(&mut self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&mut self, paddr: u64, buf: &[u8]);

    fn read_u32(&mut self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_physical(paddr, &value.to_le_bytes());
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_physical(paddr, &value.to_le_bytes());
    }
}
