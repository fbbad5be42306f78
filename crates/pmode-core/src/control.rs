//! Control, debug and test registers, descriptor-table registers and the
//! EFLAGS instructions that depend on privilege.

use tracing::{debug, trace, warn};

use crate::cpu::Cpu;
use crate::descriptor::{DescriptorKind, Selector};
use crate::exception::CpuFault;
use crate::mem::CpuBus;
use crate::paging::CpuPlatform;
use crate::privilege;
use crate::state::{
    DescriptorTableReg, LdtRegister, CR0_ET, CR0_PE, CR0_PG, FLAG_DF, FLAG_IF, FLAG_IOPL,
    FLAG_RESERVED1, FMASK_ALL, FMASK_NORMAL,
};
use crate::tables::with_supervisor_access;
use crate::tss::tss32;

impl Cpu {
    /// Replace the EFLAGS bits in `mask` (plus the model's toggleable bits)
    /// with those from `word`.
    pub fn set_flags(&mut self, word: u32, mask: u32) {
        let mask = mask | self.config().arch.toggleable_flags();
        let flags = (self.state.eflags() & !mask) | (word & mask) | FLAG_RESERVED1;
        self.state.set_eflags_raw(flags);
    }

    /// 32-bit flag load at the current privilege (`POPFD`-style masking).
    pub fn set_flags_d(&mut self, word: u32) {
        let mask = if self.state.cpl > 0 { FMASK_NORMAL } else { FMASK_ALL };
        self.set_flags(word, mask);
    }

    /// 16-bit flag load at the current privilege.
    pub fn set_flags_w(&mut self, word: u32) {
        let mask = if self.state.cpl > 0 { FMASK_NORMAL } else { FMASK_ALL };
        self.set_flags(word, mask & 0xffff);
    }

    /// CLI/STI are refused when IOPL does not cover the current privilege
    /// (CPL outside V86, 3 inside).
    fn interrupt_flag_privileged(&self) -> bool {
        let st = &self.state;
        if !st.pmode {
            return true;
        }
        let level = if st.is_v86() { 3 } else { st.cpl };
        privilege::io_privileged(level, st.iopl())
    }

    pub fn cli(&mut self) -> Result<(), CpuFault> {
        if !self.interrupt_flag_privileged() {
            return Err(CpuFault::gp0());
        }
        self.state.set_flag(FLAG_IF, false);
        Ok(())
    }

    pub fn sti(&mut self) -> Result<(), CpuFault> {
        if !self.interrupt_flag_privileged() {
            return Err(CpuFault::gp0());
        }
        self.state.set_flag(FLAG_IF, true);
        Ok(())
    }

    fn v86_flags_sensitive(&self) -> bool {
        self.state.pmode && self.state.is_v86() && self.state.iopl() != 3
    }

    pub fn pushf<B: CpuBus>(&mut self, bus: &mut B, use32: bool) -> Result<(), CpuFault> {
        if self.v86_flags_sensitive() {
            return Err(CpuFault::gp0());
        }
        self.atomically(bus, |cpu, bus| {
            let st = &mut cpu.state;
            if use32 {
                // VM and RF never appear in the pushed image.
                st.push32(bus, st.eflags() & 0x00fc_ffff)
            } else {
                st.push16(bus, st.eflags() as u16)
            }
        })
    }

    pub fn popf<B: CpuBus>(&mut self, bus: &mut B, use32: bool) -> Result<(), CpuFault> {
        if self.v86_flags_sensitive() {
            return Err(CpuFault::gp0());
        }
        let st = &self.state;
        let mut mask = FMASK_ALL;
        // IOPL only changes at CPL 0 (or in real mode).
        if st.pmode && st.cpl > 0 {
            mask &= !FLAG_IOPL;
        }
        if st.pmode && !st.is_v86() && st.iopl() < st.cpl {
            mask &= !FLAG_IF;
        }
        self.atomically(bus, |cpu, bus| {
            if use32 {
                let word = cpu.state.pop32(bus)?;
                cpu.set_flags(word, mask);
            } else {
                let word = cpu.state.pop16(bus)? as u32;
                cpu.set_flags(word, mask & 0xffff);
            }
            Ok(())
        })
    }

    /// Direction flag as a string-instruction step sign.
    pub fn direction(&self) -> i32 {
        if self.state.flag(FLAG_DF) {
            -1
        } else {
            1
        }
    }

    /// Check `IN`/`OUT` of `size` bytes at `port` against IOPL and the TSS
    /// I/O permission bitmap.
    pub fn io_permission<B: CpuBus>(
        &mut self,
        bus: &mut B,
        port: u16,
        size: u8,
    ) -> Result<(), CpuFault> {
        let st = &self.state;
        if !st.pmode || (privilege::io_privileged(st.cpl, st.iopl()) && !st.is_v86()) {
            return Ok(());
        }
        let tss = self.tss;
        let allowed = tss.is386
            && with_supervisor_access(bus, &mut self.state, |bus| -> Result<bool, CpuFault> {
                let map_base = bus.read_u16(tss.base.wrapping_add(tss32::IO_MAP_BASE))? as u32;
                if map_base > tss.limit {
                    return Ok(false);
                }
                let at = tss.base.wrapping_add(map_base + port as u32 / 8);
                let map = bus.read_u16(at)? as u32;
                let mask = (0xffff_u32 >> (16 - u32::from(size.min(16)))) << (port & 7);
                Ok(map & mask == 0)
            })?;
        if !allowed {
            debug!(port, size, "I/O permission denied");
            return Err(CpuFault::gp0());
        }
        Ok(())
    }

    fn require_cpl0(&self) -> Result<(), CpuFault> {
        if self.state.pmode && self.state.cpl > 0 {
            return Err(CpuFault::gp0());
        }
        Ok(())
    }

    fn require_protected(&self) -> Result<(), CpuFault> {
        if !self.state.pmode || self.state.is_v86() {
            return Err(CpuFault::ud());
        }
        Ok(())
    }

    pub fn lgdt(&mut self, limit: u32, base: u32) -> Result<(), CpuFault> {
        self.require_cpl0()?;
        debug!(base, limit, "GDT set");
        self.state.gdtr = DescriptorTableReg { base, limit };
        Ok(())
    }

    pub fn lidt(&mut self, limit: u32, base: u32) -> Result<(), CpuFault> {
        self.require_cpl0()?;
        debug!(base, limit, "IDT set");
        self.state.idtr = DescriptorTableReg { base, limit };
        Ok(())
    }

    pub fn sgdt(&self) -> DescriptorTableReg {
        self.state.gdtr
    }

    pub fn sidt(&self) -> DescriptorTableReg {
        self.state.idtr
    }

    pub fn lldt<B: CpuBus>(&mut self, bus: &mut B, selector: u16) -> Result<(), CpuFault> {
        self.require_protected()?;
        self.require_cpl0()?;
        self.atomically(bus, |cpu, bus| cpu.load_ldt(bus, selector))
    }

    pub fn sldt(&self) -> u16 {
        self.state.ldtr.selector
    }

    pub(crate) fn load_ldt<B: CpuBus>(&mut self, bus: &mut B, selector: u16) -> Result<(), CpuFault> {
        let sel = Selector(selector);
        if sel.is_null() {
            self.state.ldtr = LdtRegister::default();
            return Ok(());
        }
        let fail = |fault: CpuFault| {
            warn!(selector, "LLDT failed");
            fault
        };
        let Some(desc) = self.state.fetch_descriptor(bus, selector)? else {
            return Err(fail(CpuFault::gp(selector as u32)));
        };
        if !matches!(desc.kind(), DescriptorKind::Ldt) {
            return Err(fail(CpuFault::gp(selector as u32)));
        }
        if !desc.present() {
            return Err(fail(CpuFault::np(selector as u32)));
        }
        self.state.ldtr = LdtRegister {
            selector,
            base: desc.base(),
            limit: desc.limit(),
        };
        debug!(selector, "LDT set");
        Ok(())
    }

    pub fn ltr<B: CpuBus>(&mut self, bus: &mut B, selector: u16) -> Result<(), CpuFault> {
        self.require_protected()?;
        self.require_cpl0()?;
        self.atomically(bus, |cpu, bus| cpu.load_task_register(bus, selector))
    }

    pub fn str(&self) -> u16 {
        self.tss.selector
    }

    pub fn smsw(&self) -> u16 {
        self.state.cr0 as u16
    }

    /// `LMSW`: load the low four CR0 bits. PE can be set but not cleared.
    pub fn lmsw<B: CpuPlatform>(&mut self, bus: &mut B, word: u16) -> Result<(), CpuFault> {
        self.require_cpl0()?;
        let mut value = u32::from(word) & 0xf;
        value |= self.state.cr0 & CR0_PE;
        value |= self.state.cr0 & 0xffff_fff0;
        self.set_cr0(bus, value);
        Ok(())
    }

    /// `MOV CRn, r32`.
    pub fn write_cr<B: CpuPlatform>(&mut self, bus: &mut B, cr: u8, value: u32) -> Result<(), CpuFault> {
        self.require_cpl0()?;
        match cr {
            0 => self.set_cr0(bus, value),
            2 => self.state.cr2 = value,
            3 => bus.set_directory_base(value),
            4 if self.config().arch.has_cr4() => {
                trace!(value, "CR4 write ignored");
            }
            _ => {
                warn!(cr, "unhandled MOV CR, r32");
                return Err(CpuFault::ud());
            }
        }
        Ok(())
    }

    /// `MOV r32, CRn`.
    pub fn read_cr<B: CpuPlatform>(&mut self, bus: &mut B, cr: u8) -> Result<u32, CpuFault> {
        self.require_cpl0()?;
        match cr {
            0 => Ok(self.config().arch.cr0_read_back(self.state.cr0)),
            2 => Ok(self.state.cr2),
            3 => Ok(bus.directory_base() & 0xffff_f000),
            4 => Ok(0),
            _ => {
                warn!(cr, "unhandled MOV r32, CR");
                Err(CpuFault::ud())
            }
        }
    }

    fn set_cr0<B: CpuPlatform>(&mut self, bus: &mut B, value: u32) {
        let value = value | CR0_ET;
        if value == self.state.cr0 {
            return;
        }
        self.state.cr0 = value;
        if value & CR0_PE != 0 {
            let entering = !self.state.pmode;
            self.state.pmode = true;
            bus.set_paging_enabled(value & CR0_PG != 0);
            if entering {
                debug!("protected mode");
                self.notify_protected_mode();
            }
        } else {
            self.state.pmode = false;
            if value & CR0_PG != 0 {
                warn!("paging requested without PE=1");
            }
            bus.set_paging_enabled(false);
            debug!("real mode");
        }
    }

    /// `MOV DRn, r32`. DR4/DR5 alias DR6/DR7.
    pub fn write_dr(&mut self, dr: u8, value: u32) -> Result<(), CpuFault> {
        self.require_cpl0()?;
        match dr {
            0..=3 => self.state.drx[dr as usize] = value,
            4 | 6 => self.state.drx[6] = (value | 0xffff_0ff0) & 0xffff_efff,
            5 | 7 => self.state.drx[7] = self.config().arch.dr7_write(value),
            _ => {
                warn!(dr, "unhandled MOV DR, r32");
                return Err(CpuFault::ud());
            }
        }
        Ok(())
    }

    pub fn read_dr(&self, dr: u8) -> Result<u32, CpuFault> {
        self.require_cpl0()?;
        match dr {
            0..=3 | 6 | 7 => Ok(self.state.drx[dr as usize]),
            4 => Ok(self.state.drx[6]),
            5 => Ok(self.state.drx[7]),
            _ => {
                warn!(dr, "unhandled MOV r32, DR");
                Err(CpuFault::ud())
            }
        }
    }

    /// `MOV TRn, r32`. Only the cache test registers TR6/TR7 exist.
    pub fn write_tr(&mut self, tr: u8, value: u32) -> Result<(), CpuFault> {
        self.require_cpl0()?;
        match tr {
            6 | 7 => {
                self.state.trx[tr as usize] = value;
                Ok(())
            }
            _ => {
                warn!(tr, "unhandled MOV TR, r32");
                Err(CpuFault::ud())
            }
        }
    }

    pub fn read_tr(&self, tr: u8) -> Result<u32, CpuFault> {
        self.require_cpl0()?;
        match tr {
            6 | 7 => Ok(self.state.trx[tr as usize]),
            _ => {
                warn!(tr, "unhandled MOV r32, TR");
                Err(CpuFault::ud())
            }
        }
    }
}
