//! Task state segment handle.
//!
//! The handle caches the shape of the current TSS (base, limit, 16/32-bit)
//! and its descriptor so the busy bit can be flipped and written back. It is
//! re-validated on every `LTR` and task switch.

use tracing::{debug, warn};

use crate::cpu::Cpu;
use crate::descriptor::{Descriptor, DescriptorKind, Selector};
use crate::exception::CpuFault;
use crate::mem::CpuBus;
use crate::state::CpuState;
use crate::tables::with_supervisor_access;

/// Byte offsets inside a 32-bit TSS.
pub mod tss32 {
    pub const BACK_LINK: u32 = 0x00;
    pub const ESP0: u32 = 0x04;
    pub const SS0: u32 = 0x08;
    pub const CR3: u32 = 0x1c;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const EAX: u32 = 0x28;
    pub const ECX: u32 = 0x2c;
    pub const EDX: u32 = 0x30;
    pub const EBX: u32 = 0x34;
    pub const ESP: u32 = 0x38;
    pub const EBP: u32 = 0x3c;
    pub const ESI: u32 = 0x40;
    pub const EDI: u32 = 0x44;
    pub const ES: u32 = 0x48;
    pub const CS: u32 = 0x4c;
    pub const SS: u32 = 0x50;
    pub const DS: u32 = 0x54;
    pub const FS: u32 = 0x58;
    pub const GS: u32 = 0x5c;
    pub const LDT: u32 = 0x60;
    pub const IO_MAP_BASE: u32 = 0x66;

    /// Distance between the per-level ESPn/SSn pairs.
    pub const STACK_STRIDE: u32 = 8;
}

/// Byte offsets inside a 16-bit TSS.
pub mod tss16 {
    pub const SP0: u32 = 0x02;
    pub const SS0: u32 = 0x04;
    pub const STACK_STRIDE: u32 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TssHandle {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub is386: bool,
    /// The selector resolved to a present TSS descriptor.
    pub valid: bool,
    /// Descriptor as last read or written back; carries the busy bit.
    pub desc: Descriptor,
}

impl TssHandle {
    /// Validate `selector` against the GDT.
    ///
    /// A null selector yields an empty (but usable, 32-bit shaped) handle.
    /// `Ok(None)` means the selector does not name a present TSS.
    pub fn resolve<B: CpuBus>(
        state: &mut CpuState,
        bus: &mut B,
        selector: u16,
    ) -> Result<Option<TssHandle>, CpuFault> {
        let sel = Selector(selector);
        if sel.is_null() {
            return Ok(Some(TssHandle {
                is386: true,
                ..TssHandle::default()
            }));
        }
        if sel.is_ldt() {
            return Ok(None);
        }
        let Some(desc) = state.fetch_descriptor(bus, selector)? else {
            return Ok(None);
        };
        let DescriptorKind::Tss { is386, .. } = desc.kind() else {
            return Ok(None);
        };
        if !desc.present() {
            return Ok(None);
        }
        Ok(Some(TssHandle {
            selector,
            base: desc.base(),
            limit: desc.limit(),
            is386,
            valid: true,
            desc,
        }))
    }

    /// SS:ESP for privilege `level` (0..=2).
    pub fn stack_for_level<B: CpuBus>(
        &self,
        state: &mut CpuState,
        bus: &mut B,
        level: u8,
    ) -> Result<(u16, u32), CpuFault> {
        let level = level as u32;
        let (is386, base) = (self.is386, self.base);
        with_supervisor_access(bus, state, |bus| {
            if is386 {
                let at = base.wrapping_add(tss32::ESP0 + level * tss32::STACK_STRIDE);
                let esp = bus.read_u32(at)?;
                let ss = bus.read_u16(at.wrapping_add(tss32::SS0 - tss32::ESP0))?;
                Ok((ss, esp))
            } else {
                let at = base.wrapping_add(tss16::SP0 + level * tss16::STACK_STRIDE);
                let sp = bus.read_u16(at)?;
                let ss = bus.read_u16(at.wrapping_add(tss16::SS0 - tss16::SP0))?;
                Ok((ss, sp as u32))
            }
        })
    }

    pub fn back_link<B: CpuBus>(&self, state: &mut CpuState, bus: &mut B) -> Result<u16, CpuFault> {
        let base = self.base;
        with_supervisor_access(bus, state, |bus| bus.read_u16(base.wrapping_add(tss32::BACK_LINK)))
    }

    /// Flip the cached busy bit and write the descriptor back.
    pub fn set_busy<B: CpuBus>(
        &mut self,
        state: &mut CpuState,
        bus: &mut B,
        busy: bool,
    ) -> Result<(), CpuFault> {
        self.desc.set_busy(busy);
        state.store_descriptor_type(bus, self.selector, self.desc)?;
        Ok(())
    }

    pub(crate) fn read_u32<B: CpuBus>(
        &self,
        state: &mut CpuState,
        bus: &mut B,
        offset: u32,
    ) -> Result<u32, CpuFault> {
        let addr = self.base.wrapping_add(offset);
        with_supervisor_access(bus, state, |bus| bus.read_u32(addr))
    }

    pub(crate) fn read_u16<B: CpuBus>(
        &self,
        state: &mut CpuState,
        bus: &mut B,
        offset: u32,
    ) -> Result<u16, CpuFault> {
        let addr = self.base.wrapping_add(offset);
        with_supervisor_access(bus, state, |bus| bus.read_u16(addr))
    }

    pub(crate) fn write_u32<B: CpuBus>(
        &self,
        state: &mut CpuState,
        bus: &mut B,
        offset: u32,
        value: u32,
    ) -> Result<(), CpuFault> {
        let addr = self.base.wrapping_add(offset);
        with_supervisor_access(bus, state, |bus| bus.write_u32(addr, value))
    }
}

impl Cpu {
    /// `LTR`: load the task register.
    ///
    /// Only an available (non-busy) TSS can be loaded; it is marked busy.
    /// A null selector empties the task register.
    pub(crate) fn load_task_register<B: CpuBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
    ) -> Result<(), CpuFault> {
        let sel = Selector(selector);
        if sel.is_null() {
            self.tss = TssHandle::resolve(&mut self.state, bus, selector)?.unwrap_or_default();
            return Ok(());
        }
        let desc = if sel.is_ldt() {
            None
        } else {
            self.state.fetch_descriptor(bus, selector)?
        };
        let Some(desc) = desc else {
            warn!(selector, "LTR failed");
            return Err(CpuFault::gp(selector as u32));
        };

        match desc.kind() {
            DescriptorKind::Tss { busy: false, .. } => {
                if !desc.present() {
                    warn!(selector, "LTR failed (not present)");
                    return Err(CpuFault::np(selector as u32));
                }
                let Some(mut handle) = TssHandle::resolve(&mut self.state, bus, selector)? else {
                    return Err(CpuFault::gp(selector as u32));
                };
                handle.set_busy(&mut self.state, bus, true)?;
                debug!(selector, base = handle.base, limit = handle.limit, "task register loaded");
                self.tss = handle;
                Ok(())
            }
            _ => {
                debug!(selector, desc_type = desc.desc_type(), "LTR failed (not an available TSS)");
                Err(CpuFault::gp(selector as u32))
            }
        }
    }
}
