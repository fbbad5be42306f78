//! Far `JMP`, `CALL` and `RET`.

use tracing::{debug, error};

use crate::cpu::Cpu;
use crate::descriptor::{types, Descriptor, DescriptorKind, Selector};
use crate::exception::{CpuFault, InternalError};
use crate::iret::ReturnFrame;
use crate::paging::CpuPlatform;
use crate::privilege;
use crate::stack::StackReader;
use crate::state::{SegReg, SegmentRegister};
use crate::task::TaskSwitchKind;

/// Parameter count field of a call gate is five bits wide.
const PARAM_COUNT_MASK: u8 = 31;

impl Cpu {
    /// Far `JMP selector:offset`.
    pub fn far_jmp<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        selector: u16,
        offset: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.do_far_jmp(bus, use32, selector, offset, return_eip))
    }

    /// Far `CALL selector:offset`.
    pub fn far_call<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        selector: u16,
        offset: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.do_far_call(bus, use32, selector, offset, return_eip))
    }

    /// Far `RET` / `RET imm16`; `bytes` of parameters are released from the
    /// caller's stack.
    pub fn far_ret<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        bytes: u32,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.do_far_ret(bus, use32, bytes))
    }

    fn real_far_target(&mut self, use32: bool, selector: u16, offset: u32) {
        let st = &mut self.state;
        st.eip = if use32 { offset } else { offset & 0xffff };
        st.set_seg(SegReg::Cs, SegmentRegister::real(selector));
        st.code_big = false;
    }

    /// Look up the target of a protected-mode far JMP/CALL.
    fn far_target<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        selector: u16,
    ) -> Result<Descriptor, CpuFault> {
        let sel = Selector(selector);
        if sel.is_null() {
            return Err(CpuFault::gp0());
        }
        match self.state.fetch_descriptor(bus, selector)? {
            Some(desc) => Ok(desc),
            None => Err(CpuFault::gp(sel.error_code())),
        }
    }

    /// Load CS for a direct transfer at the current CPL.
    fn enter_code_segment(&mut self, selector: u16, desc: &Descriptor, eip: u32) {
        let st = &mut self.state;
        st.set_seg(
            SegReg::Cs,
            SegmentRegister {
                selector: Selector(selector).with_rpl(st.cpl).0,
                base: desc.base(),
            },
        );
        st.code_big = desc.big();
        st.eip = eip;
    }

    fn check_direct_transfer(&self, selector: u16, desc: &Descriptor) -> Result<(), CpuFault> {
        let sel = Selector(selector);
        if !privilege::direct_transfer_allowed(self.state.cpl, sel.rpl(), desc) {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code()));
        }
        Ok(())
    }

    fn check_tss_target(&self, selector: u16, desc: &Descriptor) -> Result<(), CpuFault> {
        let sel = Selector(selector);
        if !privilege::gate_accessible(self.state.cpl, sel.rpl(), desc.dpl()) {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code()));
        }
        Ok(())
    }

    fn do_far_jmp<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        selector: u16,
        offset: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        if !self.state.pmode || self.state.is_v86() {
            self.real_far_target(use32, selector, offset);
            return Ok(());
        }
        let desc = self.far_target(bus, selector)?;
        match desc.kind() {
            DescriptorKind::Code { .. } => {
                self.check_direct_transfer(selector, &desc)?;
                self.enter_code_segment(selector, &desc, offset);
                debug!(selector, offset, big = desc.big(), "JMP: code");
                Ok(())
            }
            DescriptorKind::Tss {
                is386: true,
                busy: false,
            } => {
                self.check_tss_target(selector, &desc)?;
                debug!(selector, "JMP: TSS");
                self.switch_task(bus, selector, TaskSwitchKind::Jmp, return_eip)
            }
            _ => Err(illegal_target("JMP", selector, &desc)),
        }
    }

    fn do_far_call<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        selector: u16,
        offset: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        if !self.state.pmode || self.state.is_v86() {
            let st = &mut self.state;
            st.push_sized(bus, use32, st.selector(SegReg::Cs) as u32)?;
            st.push_sized(bus, use32, return_eip)?;
            self.real_far_target(use32, selector, offset);
            return Ok(());
        }
        let desc = self.far_target(bus, selector)?;
        match desc.kind() {
            DescriptorKind::Code { .. } => {
                self.check_direct_transfer(selector, &desc)?;
                let st = &mut self.state;
                st.push_sized(bus, use32, st.selector(SegReg::Cs) as u32)?;
                st.push_sized(bus, use32, return_eip)?;
                let eip = if use32 { offset } else { offset & 0xffff };
                self.enter_code_segment(selector, &desc, eip);
                debug!(selector, offset, "CALL: code");
                Ok(())
            }
            DescriptorKind::CallGate { is386 } => {
                self.call_through_gate(bus, use32, selector, &desc, is386, return_eip)
            }
            DescriptorKind::Tss {
                is386: true,
                busy: false,
            } => {
                self.check_tss_target(selector, &desc)?;
                debug!(selector, "CALL: TSS");
                self.switch_task(bus, selector, TaskSwitchKind::CallInt, return_eip)
            }
            _ if matches!(desc.desc_type(), types::DATA_RW | types::INVALID) => {
                Err(CpuFault::gp(Selector(selector).error_code()))
            }
            _ => Err(illegal_target("CALL", selector, &desc)),
        }
    }

    fn call_through_gate<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        selector: u16,
        gate: &Descriptor,
        is386: bool,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        let sel = Selector(selector);
        if !privilege::gate_accessible(self.state.cpl, sel.rpl(), gate.dpl()) {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !gate.present() {
            return Err(CpuFault::np(sel.error_code()));
        }

        let cs = gate.gate_selector();
        let cs_sel = Selector(cs);
        if cs_sel.is_null() {
            return Err(CpuFault::gp0());
        }
        let Some(cs_desc) = self.state.fetch_descriptor(bus, cs)? else {
            return Err(CpuFault::gp(cs_sel.error_code()));
        };
        let cpl = self.state.cpl;
        if cs_desc.dpl() > cpl {
            return Err(CpuFault::gp(cs_sel.error_code()));
        }
        if !cs_desc.present() {
            return Err(CpuFault::np(cs_sel.error_code()));
        }
        if !cs_desc.is_code() {
            error!(selector = cs, desc_type = cs_desc.desc_type(), "CALL gate to non-code");
            return Err(InternalError::IllegalDescriptor {
                op: "CALL",
                selector: cs,
                desc_type: cs_desc.desc_type(),
            }
            .into());
        }

        let mut eip = gate.gate_offset();
        if !use32 {
            eip &= 0xffff;
        }
        let old_cs = self.state.selector(SegReg::Cs) as u32;

        if privilege::is_inner_level(cpl, &cs_desc) {
            let level = cs_desc.dpl();
            let stack = self.inner_stack(bus, level, 0, "CALL")?;

            // Copy the parameters before the stack changes under us; a page
            // fault here must still leave everything untouched.
            let count = (gate.param_count() & PARAM_COUNT_MASK) as usize;
            let mut reader = StackReader::new(&self.state);
            let mut params = Vec::with_capacity(count);
            for _ in 0..count {
                params.push(reader.pop(&self.state, bus, is386)?);
            }

            // Commit: inner level.
            let o_ss = self.state.selector(SegReg::Ss) as u32;
            let o_esp = self.state.esp();
            self.switch_stack(stack);
            self.state.cpl = level;
            self.enter_code_segment(cs, &cs_desc, eip);

            let st = &mut self.state;
            st.push_sized(bus, is386, o_ss)?;
            st.push_sized(bus, is386, o_esp)?;
            for &param in params.iter().rev() {
                st.push_sized(bus, is386, param)?;
            }
            st.push_sized(bus, is386, old_cs)?;
            st.push_sized(bus, is386, return_eip)?;
            debug!(cs, eip, params = count, "CALL: gate to inner level");
            return Ok(());
        }

        let st = &mut self.state;
        st.push_sized(bus, is386, old_cs)?;
        st.push_sized(bus, is386, return_eip)?;
        self.enter_code_segment(cs, &cs_desc, eip);
        debug!(cs, eip, "CALL: gate, same level");
        Ok(())
    }

    fn do_far_ret<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        use32: bool,
        bytes: u32,
    ) -> Result<(), CpuFault> {
        if !self.state.pmode || self.state.is_v86() {
            let st = &mut self.state;
            let eip = st.pop_sized(bus, use32)?;
            let cs = st.pop_sized(bus, use32)? as u16;
            st.set_esp(st.esp().wrapping_add(bytes));
            st.set_seg(SegReg::Cs, SegmentRegister::real(cs));
            st.eip = eip;
            st.code_big = false;
            return Ok(());
        }

        let mut reader = StackReader::new(&self.state);
        let eip = reader.pop(&self.state, bus, use32)?;
        let cs = reader.pop(&self.state, bus, use32)? as u16;
        let frame = ReturnFrame { eip, cs };
        let rpl = Selector(cs).rpl();
        if rpl < self.state.cpl {
            return Err(CpuFault::gp(Selector(cs).error_code()));
        }
        let cs_desc = self.return_code_segment(bus, cs, "RET")?;

        if rpl == self.state.cpl {
            // Commit: same level.
            self.load_return_cs(frame, &cs_desc, cs);
            self.state
                .load_stack_pointer(reader.esp().wrapping_add(bytes));
            debug!(cs, eip, rpl, dpl = cs_desc.dpl(), "RET: same level");
            return Ok(());
        }

        reader.release(bytes);
        let outer_esp = reader.pop(&self.state, bus, use32)?;
        let outer_ss = reader.pop(&self.state, bus, use32)? as u16;
        let ss_desc = self.outer_stack(bus, outer_ss, rpl, "RET")?;

        // Commit: outer level.
        self.state.cpl = rpl;
        self.load_return_cs(frame, &cs_desc, Selector(cs).with_rpl(rpl).0);
        self.load_outer_stack(outer_ss, &ss_desc, outer_esp.wrapping_add(bytes));
        self.check_segments(bus)?;
        debug!(cs, eip, ss = outer_ss, esp = self.state.esp(), "RET: outer level");
        Ok(())
    }
}

fn illegal_target(op: &'static str, selector: u16, desc: &Descriptor) -> CpuFault {
    error!(op, selector, desc_type = desc.desc_type(), "far transfer to illegal descriptor");
    InternalError::IllegalDescriptor {
        op,
        selector,
        desc_type: desc.desc_type(),
    }
    .into()
}
