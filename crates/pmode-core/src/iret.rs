//! `IRET` in all its shapes: real mode, V86, nested task return, return to
//! V86 from a protected-mode handler, and same/outer-level returns.

use tracing::{debug, error};

use crate::cpu::Cpu;
use crate::descriptor::{Descriptor, DescriptorKind, Selector};
use crate::exception::{CpuFault, InternalError};
use crate::paging::CpuPlatform;
use crate::privilege;
use crate::stack::StackReader;
use crate::state::{
    SegReg, SegmentRegister, StackMode, FLAG_IF, FLAG_NT, FLAG_VM, FMASK_ALL, FMASK_NORMAL,
};
use crate::task::TaskSwitchKind;

/// Return frame popped by a far `RET` or `IRET` before it is committed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ReturnFrame {
    pub eip: u32,
    pub cs: u16,
}

impl Cpu {
    /// `IRET` / `IRETD`. `return_eip` is the address of the IRET itself, used
    /// as the saved EIP when it triggers a task switch.
    pub fn iret<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.do_iret(bus, use32, return_eip))
    }

    fn do_iret<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        if !self.state.pmode {
            let st = &mut self.state;
            st.eip = st.pop_sized(bus, use32)?;
            let cs = st.pop_sized(bus, use32)? as u16;
            let flags = st.pop_sized(bus, use32)?;
            st.set_seg(SegReg::Cs, SegmentRegister::real(cs));
            st.code_big = false;
            let mask = if use32 { FMASK_ALL } else { FMASK_ALL & 0xffff };
            self.set_flags(flags, mask);
            return Ok(());
        }

        if self.state.is_v86() {
            if self.state.iopl() != 3 {
                return Err(CpuFault::gp0());
            }
            let mut reader = StackReader::new(&self.state);
            let eip = reader.pop(&self.state, bus, use32)?;
            let cs = reader.pop(&self.state, bus, use32)? as u16;
            let flags = reader.pop(&self.state, bus, use32)?;

            let st = &mut self.state;
            st.set_esp(reader.esp());
            st.eip = eip;
            st.set_seg(SegReg::Cs, SegmentRegister::real(cs));
            st.code_big = false;
            // IOPL is not writable from V86.
            self.set_flags(flags, FMASK_NORMAL | FLAG_NT);
            return Ok(());
        }

        if self.state.flag(FLAG_NT) {
            return self.iret_to_task(bus, return_eip);
        }

        let mut reader = StackReader::new(&self.state);
        let eip = reader.pop(&self.state, bus, use32)?;
        let cs = reader.pop(&self.state, bus, use32)? as u16;
        let mut flags = reader.pop(&self.state, bus, use32)?;
        if use32 {
            if flags & FLAG_VM != 0 {
                if self.state.cpl == 0 {
                    return self.iret_to_v86(bus, reader, eip, cs, flags);
                }
                error!(cpl = self.state.cpl, "IRET to V86 from non-zero CPL");
                return Err(InternalError::IretToV86FromCpl {
                    cpl: self.state.cpl,
                }
                .into());
            }
        } else {
            flags |= self.state.eflags() & 0xffff_0000;
            if flags & FLAG_VM != 0 {
                return Err(InternalError::VmFlagIn16BitIret.into());
            }
        }

        let frame = ReturnFrame { eip, cs };
        let cs_desc = self.return_code_segment(bus, frame.cs, "IRET")?;
        let rpl = Selector(frame.cs).rpl();

        let cpl = self.state.cpl;
        let mut mask = if cpl > 0 {
            FMASK_NORMAL | FLAG_NT
        } else {
            FMASK_ALL
        };
        if self.state.iopl() < cpl {
            mask &= !FLAG_IF;
        }

        if rpl == cpl {
            // Commit: same level.
            self.state.set_esp(reader.esp());
            self.load_return_cs(frame, &cs_desc, frame.cs);
            self.set_flags(flags, mask);
            debug!(cs = frame.cs, eip = frame.eip, big = self.state.code_big, "IRET: same level");
            return Ok(());
        }

        let outer_esp = reader.pop(&self.state, bus, use32)?;
        let outer_ss = reader.pop(&self.state, bus, use32)? as u16;
        let ss_desc = self.outer_stack(bus, outer_ss, rpl, "IRET")?;

        // Commit: outer level.
        self.load_return_cs(frame, &cs_desc, frame.cs);
        self.set_flags(flags, mask);
        self.state.cpl = rpl;
        self.load_outer_stack(outer_ss, &ss_desc, outer_esp);
        self.check_segments(bus)?;
        debug!(cs = frame.cs, eip = frame.eip, big = self.state.code_big, "IRET: outer level");
        Ok(())
    }

    fn iret_to_task<B: CpuPlatform>(&mut self, bus: &mut B, return_eip: u32) -> Result<(), CpuFault> {
        let tss = self.tss;
        if !tss.valid {
            return Err(CpuFault::ts(Selector(tss.selector).error_code()));
        }
        if !tss.desc.is_busy() {
            error!(selector = tss.selector, "task IRET: TSS not busy");
            return Err(InternalError::CurrentTssNotBusy {
                selector: tss.selector,
            }
            .into());
        }
        let back_link = tss.back_link(&mut self.state, bus)?;
        self.switch_task(bus, back_link, TaskSwitchKind::Iret, return_eip)
    }

    fn iret_to_v86<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        reader: StackReader,
        eip: u32,
        cs: u16,
        flags: u32,
    ) -> Result<(), CpuFault> {
        let mut reader = reader;
        let esp = reader.pop(&self.state, bus, true)?;
        let mut segs = [0u16; 5];
        for slot in &mut segs {
            *slot = reader.pop(&self.state, bus, true)? as u16;
        }
        let [ss, es, ds, fs, gs] = segs;

        // Commit: the frame is fully read.
        self.state.set_esp(reader.esp());
        self.state.eip = eip & 0xffff;
        self.set_flags(flags, FMASK_ALL | FLAG_VM);
        self.state.cpl = 3;
        for (seg, value) in [
            (SegReg::Ss, ss),
            (SegReg::Es, es),
            (SegReg::Ds, ds),
            (SegReg::Fs, fs),
            (SegReg::Gs, gs),
        ] {
            self.set_segment(bus, seg, value)?;
        }
        self.state.set_esp(esp);
        self.state.code_big = false;
        self.state.set_seg(SegReg::Cs, SegmentRegister::real(cs));
        debug!(
            cs,
            eip = self.state.eip,
            ss,
            esp,
            flags = self.state.eflags(),
            "IRET: back to V86"
        );
        Ok(())
    }

    /// Validate the code segment a far RET / IRET returns to.
    ///
    /// The return may not raise privilege; RPL selects the new CPL.
    pub(crate) fn return_code_segment<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        cs: u16,
        op: &'static str,
    ) -> Result<Descriptor, CpuFault> {
        let sel = Selector(cs);
        if sel.is_null() {
            return Err(CpuFault::gp0());
        }
        let Some(desc) = self.state.fetch_descriptor(bus, cs)? else {
            return Err(CpuFault::gp(sel.error_code()));
        };
        if sel.rpl() < self.state.cpl {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !desc.is_code() {
            error!(op, selector = cs, desc_type = desc.desc_type(), "return to illegal descriptor");
            return Err(InternalError::IllegalDescriptor {
                op,
                selector: cs,
                desc_type: desc.desc_type(),
            }
            .into());
        }
        if !privilege::return_target_allowed(sel.rpl(), &desc) {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code()));
        }
        Ok(desc)
    }

    /// Validate the SS popped by an outer-level return to privilege `level`.
    pub(crate) fn outer_stack<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        ss: u16,
        level: u8,
        op: &'static str,
    ) -> Result<Descriptor, CpuFault> {
        let sel = Selector(ss);
        if sel.is_null() {
            return Err(CpuFault::gp0());
        }
        if sel.rpl() != level {
            return Err(CpuFault::gp(sel.error_code()));
        }
        let Some(desc) = self.state.fetch_descriptor(bus, ss)? else {
            return Err(CpuFault::gp(sel.error_code()));
        };
        if !privilege::stack_matches_level(sel.rpl(), &desc, level) {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !matches!(desc.kind(), DescriptorKind::Data { writable: true }) {
            error!(op, selector = ss, "outer level stack segment not writable");
            return Err(InternalError::StackNotWritable { op, selector: ss }.into());
        }
        if !desc.present() {
            return Err(CpuFault::ss(sel.error_code()));
        }
        Ok(desc)
    }

    pub(crate) fn load_return_cs(&mut self, frame: ReturnFrame, desc: &Descriptor, selector: u16) {
        let st = &mut self.state;
        st.set_seg(
            SegReg::Cs,
            SegmentRegister {
                selector,
                base: desc.base(),
            },
        );
        st.code_big = desc.big();
        st.eip = frame.eip;
    }

    pub(crate) fn load_outer_stack(&mut self, ss: u16, desc: &Descriptor, esp: u32) {
        let st = &mut self.state;
        st.set_seg(
            SegReg::Ss,
            SegmentRegister {
                selector: ss,
                base: desc.base(),
            },
        );
        st.stack = StackMode::from_big(desc.big());
        st.load_stack_pointer(esp);
    }
}
