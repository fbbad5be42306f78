//! GDT/LDT/IDT lookups.
//!
//! Table entries live in guest memory; these helpers only know where the
//! tables are (GDTR, LDTR, IDTR) and re-read the entry on every call.

use crate::descriptor::{Descriptor, Selector};
use crate::exception::CpuFault;
use crate::mem::CpuBus;
use crate::state::{CpuState, DescriptorTableReg, LdtRegister};

/// Run `f` with the memory privilege lowered to 0.
///
/// Reads of the GDT, LDT, IDT and TSS are system accesses: they must not be
/// subject to user/supervisor page checks even when the interrupted code ran
/// at CPL 3. The override is dropped again whether or not `f` succeeds.
pub(crate) fn with_supervisor_access<B: CpuBus, R>(
    bus: &mut B,
    state: &mut CpuState,
    f: impl FnOnce(&mut B) -> R,
) -> R {
    state.mpl = 0;
    bus.set_supervisor_override(true);
    let res = f(bus);
    bus.set_supervisor_override(false);
    state.mpl = 3;
    res
}

/// Type field (bits 8..12) of a descriptor's high dword.
const DESC_TYPE_MASK: u32 = 0x0000_1f00;

fn entry_address(base: u32, limit: u32, offset: u32) -> Option<u32> {
    // The whole 8-byte entry has to fit below the limit.
    if offset.checked_add(7)? > limit {
        None
    } else {
        Some(base.wrapping_add(offset))
    }
}

impl DescriptorTableReg {
    /// Linear address of the entry selected by `selector`, ignoring TI/RPL.
    pub fn entry_address(&self, selector: Selector) -> Option<u32> {
        entry_address(self.base, self.limit, selector.table_offset())
    }

    /// Linear address of IDT entry `vector`.
    pub fn gate_address(&self, vector: u8) -> Option<u32> {
        entry_address(self.base, self.limit, vector as u32 * 8)
    }
}

impl LdtRegister {
    pub fn entry_address(&self, selector: Selector) -> Option<u32> {
        entry_address(self.base, self.limit, selector.table_offset())
    }
}

fn read_entry<B: CpuBus>(
    bus: &mut B,
    state: &mut CpuState,
    addr: u32,
) -> Result<Descriptor, CpuFault> {
    with_supervisor_access(bus, state, |bus| {
        let lo = bus.read_u32(addr)?;
        let hi = bus.read_u32(addr.wrapping_add(4))?;
        Ok(Descriptor::from_parts(lo, hi))
    })
}

impl CpuState {
    fn selector_address(&self, selector: Selector) -> Option<u32> {
        if selector.is_ldt() {
            self.ldtr.entry_address(selector)
        } else {
            self.gdtr.entry_address(selector)
        }
    }

    /// Fetch the GDT or LDT entry named by `selector`.
    ///
    /// `Ok(None)` means the entry lies outside the table limit; memory faults
    /// while reading the entry are propagated.
    pub fn fetch_descriptor<B: CpuBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
    ) -> Result<Option<Descriptor>, CpuFault> {
        match self.selector_address(Selector(selector)) {
            Some(addr) => read_entry(bus, self, addr).map(Some),
            None => Ok(None),
        }
    }

    /// Write a full descriptor back to the GDT/LDT. Returns `false` if the
    /// selector is outside its table.
    pub fn store_descriptor<B: CpuBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
        desc: Descriptor,
    ) -> Result<bool, CpuFault> {
        let Some(addr) = self.selector_address(Selector(selector)) else {
            return Ok(false);
        };
        with_supervisor_access(bus, self, |bus| {
            bus.write_u32(addr, desc.low())?;
            bus.write_u32(addr.wrapping_add(4), desc.high())
        })?;
        Ok(true)
    }

    /// Replace the type field of the entry named by `selector` with the one in
    /// `desc` (used to flip a TSS busy bit). The rest of the entry is re-read
    /// from memory and kept as the guest left it.
    pub fn store_descriptor_type<B: CpuBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
        desc: Descriptor,
    ) -> Result<bool, CpuFault> {
        let Some(addr) = self.selector_address(Selector(selector)) else {
            return Ok(false);
        };
        let addr = addr.wrapping_add(4);
        with_supervisor_access(bus, self, |bus| {
            let current = bus.read_u32(addr)?;
            let hi = (current & !DESC_TYPE_MASK) | (desc.high() & DESC_TYPE_MASK);
            bus.write_u32(addr, hi)
        })?;
        Ok(true)
    }

    /// Fetch IDT entry `vector` (protected mode layout).
    pub fn fetch_gate<B: CpuBus>(
        &mut self,
        bus: &mut B,
        vector: u8,
    ) -> Result<Option<Descriptor>, CpuFault> {
        match self.idtr.gate_address(vector) {
            Some(addr) => read_entry(bus, self, addr).map(Some),
            None => Ok(None),
        }
    }
}
