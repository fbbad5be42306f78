//! SS:ESP push/pop honoring the active stack width.
//!
//! A push writes memory before ESP moves, so a faulting write leaves ESP
//! untouched.

use crate::exception::CpuFault;
use crate::mem::CpuBus;
use crate::state::{CpuState, SegReg};

impl CpuState {
    pub fn push16<B: CpuBus>(&mut self, bus: &mut B, value: u16) -> Result<(), CpuFault> {
        let new_esp = self.stack.offset(self.esp(), -2);
        let addr = self.seg(SegReg::Ss).base.wrapping_add(new_esp & self.stack.mask);
        bus.write_u16(addr, value)?;
        self.set_esp(new_esp);
        Ok(())
    }

    pub fn push32<B: CpuBus>(&mut self, bus: &mut B, value: u32) -> Result<(), CpuFault> {
        let new_esp = self.stack.offset(self.esp(), -4);
        let addr = self.seg(SegReg::Ss).base.wrapping_add(new_esp & self.stack.mask);
        bus.write_u32(addr, value)?;
        self.set_esp(new_esp);
        Ok(())
    }

    pub fn pop16<B: CpuBus>(&mut self, bus: &mut B) -> Result<u16, CpuFault> {
        let val = bus.read_u16(self.stack_top())?;
        self.set_esp(self.stack.offset(self.esp(), 2));
        Ok(val)
    }

    pub fn pop32<B: CpuBus>(&mut self, bus: &mut B) -> Result<u32, CpuFault> {
        let val = bus.read_u32(self.stack_top())?;
        self.set_esp(self.stack.offset(self.esp(), 4));
        Ok(val)
    }

    /// Push a 16- or 32-bit value depending on `wide`.
    pub(crate) fn push_sized<B: CpuBus>(
        &mut self,
        bus: &mut B,
        wide: bool,
        value: u32,
    ) -> Result<(), CpuFault> {
        if wide {
            self.push32(bus, value)
        } else {
            self.push16(bus, value as u16)
        }
    }

    pub(crate) fn pop_sized<B: CpuBus>(&mut self, bus: &mut B, wide: bool) -> Result<u32, CpuFault> {
        if wide {
            self.pop32(bus)
        } else {
            self.pop16(bus).map(u32::from)
        }
    }
}

/// Reads successive stack slots without committing ESP.
///
/// Used to inspect a return frame before the privilege checks have passed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StackReader {
    esp: u32,
}

impl StackReader {
    pub(crate) fn new(state: &CpuState) -> Self {
        Self { esp: state.esp() }
    }

    pub(crate) fn esp(&self) -> u32 {
        self.esp
    }

    /// Skip `bytes` without wrapping to the stack width (far RET's
    /// parameter release adds to the full ESP).
    pub(crate) fn release(&mut self, bytes: u32) {
        self.esp = self.esp.wrapping_add(bytes);
    }

    pub(crate) fn pop<B: CpuBus>(
        &mut self,
        state: &CpuState,
        bus: &mut B,
        wide: bool,
    ) -> Result<u32, CpuFault> {
        let addr = state
            .seg(SegReg::Ss)
            .base
            .wrapping_add(self.esp & state.stack.mask);
        let (val, size) = if wide {
            (bus.read_u32(addr)?, 4)
        } else {
            (bus.read_u16(addr)? as u32, 2)
        };
        self.esp = state.stack.offset(self.esp, size);
        Ok(val)
    }
}
