//! Linear memory access used by the protection core.
//!
//! Descriptor tables, TSS images and stacks all live in guest memory; the core
//! never caches them and re-reads through [`CpuBus`] on every access.

use crate::exception::{CpuFault, Exception};
use crate::paging::PagingControl;

pub trait CpuBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, CpuFault>;
    fn read_u16(&mut self, addr: u32) -> Result<u16, CpuFault>;
    fn read_u32(&mut self, addr: u32) -> Result<u32, CpuFault>;

    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), CpuFault>;
    fn write_u16(&mut self, addr: u32, val: u16) -> Result<(), CpuFault>;
    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), CpuFault>;

    /// Toggled around accesses to system structures (GDT/LDT/IDT/TSS) that
    /// must be performed with supervisor rights regardless of CPL.
    ///
    /// Buses without user/supervisor page checks can ignore this.
    fn set_supervisor_override(&mut self, _enabled: bool) {}
}

/// Identity-mapped memory bus used by tests.
///
/// Accesses outside the backing buffer raise `#PF(0)`. Paging control calls
/// are recorded so tests can observe CR3 reloads and PG toggles.
#[derive(Debug, Clone)]
pub struct FlatTestBus {
    mem: Vec<u8>,
    directory_base: u32,
    paging_enabled: bool,
    supervisor_override: bool,
    /// Every value passed to [`PagingControl::set_directory_base`], in order.
    pub directory_base_loads: Vec<u32>,
    /// Number of supervisor-override windows opened so far.
    pub supervisor_windows: usize,
}

impl FlatTestBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            directory_base: 0,
            paging_enabled: false,
            supervisor_override: false,
            directory_base_loads: Vec::new(),
            supervisor_windows: 0,
        }
    }

    /// Copy `N` bytes out of memory without going through the fault path.
    /// Returns `None` past the end of the buffer.
    pub fn peek<const N: usize>(&self, addr: u32) -> Option<[u8; N]> {
        let bytes = self.span(addr, N)?;
        let mut out = [0; N];
        out.copy_from_slice(&self.mem[bytes]);
        Some(out)
    }

    /// Store `data` at `addr` without going through the fault path. Returns
    /// `false` (and writes nothing) if it does not fit.
    pub fn poke(&mut self, addr: u32, data: &[u8]) -> bool {
        match self.span(addr, data.len()) {
            Some(bytes) => {
                self.mem[bytes].copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    fn span(&self, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = addr as usize;
        let end = start.checked_add(len)?;
        (end <= self.mem.len()).then_some(start..end)
    }

    fn load<const N: usize>(&self, addr: u32) -> Result<[u8; N], CpuFault> {
        self.peek(addr).ok_or_else(Self::page_fault)
    }

    fn store(&mut self, addr: u32, data: &[u8]) -> Result<(), CpuFault> {
        if self.poke(addr, data) {
            Ok(())
        } else {
            Err(Self::page_fault())
        }
    }

    fn page_fault() -> CpuFault {
        CpuFault::new(Exception::PageFault, 0)
    }
}

// Accesses that straddle the end of memory fault as a whole and write nothing.
impl CpuBus for FlatTestBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, CpuFault> {
        self.load::<1>(addr).map(|[b]| b)
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, CpuFault> {
        self.load(addr).map(u16::from_le_bytes)
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, CpuFault> {
        self.load(addr).map(u32::from_le_bytes)
    }

    fn write_u8(&mut self, addr: u32, val: u8) -> Result<(), CpuFault> {
        self.store(addr, &[val])
    }

    fn write_u16(&mut self, addr: u32, val: u16) -> Result<(), CpuFault> {
        self.store(addr, &val.to_le_bytes())
    }

    fn write_u32(&mut self, addr: u32, val: u32) -> Result<(), CpuFault> {
        self.store(addr, &val.to_le_bytes())
    }

    fn set_supervisor_override(&mut self, enabled: bool) {
        if enabled && !self.supervisor_override {
            self.supervisor_windows += 1;
        }
        self.supervisor_override = enabled;
    }
}

impl PagingControl for FlatTestBus {
    fn set_directory_base(&mut self, value: u32) {
        self.directory_base = value;
        self.directory_base_loads.push(value);
    }

    fn directory_base(&self) -> u32 {
        self.directory_base
    }

    fn set_paging_enabled(&mut self, enabled: bool) {
        self.paging_enabled = enabled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn straddling_write_faults_without_storing() {
        let mut bus = FlatTestBus::new(0x10);
        assert_eq!(
            bus.write_u32(0x0e, 0xdead_beef),
            Err(CpuFault::new(Exception::PageFault, 0))
        );
        assert_eq!(bus.peek::<2>(0x0e), Some([0, 0]));
        bus.write_u16(0x0e, 0x1234).unwrap();
        assert_eq!(bus.read_u16(0x0e), Ok(0x1234));
        assert_eq!(bus.peek::<4>(0x0e), None);
    }
}
