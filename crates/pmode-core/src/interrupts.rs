//! Interrupt and exception delivery through the IVT (real mode) or the IDT
//! (protected and V86 mode), including inner-level stack switches and task
//! gates.

use bitflags::bitflags;
use tracing::{debug, error, trace};

use crate::cpu::Cpu;
use crate::descriptor::{Descriptor, DescriptorKind, Selector};
use crate::exception::{CpuFault, Exception, InternalError};
use crate::paging::CpuPlatform;
use crate::privilege;
use crate::state::{SegReg, SegmentRegister, StackMode, FLAG_IF, FLAG_NT, FLAG_TF, FLAG_VM};
use crate::task::TaskSwitchKind;

bitflags! {
    /// How an event entered the dispatcher.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InterruptKind: u8 {
        /// `INT n` / `INT3` / `INTO`: gate DPL is checked against CPL.
        const SOFTWARE = 1 << 0;
        /// A CPU exception.
        const EXCEPTION = 1 << 1;
        /// An error code is pushed after the return address.
        const HAS_ERROR = 1 << 2;
        /// Skip the V86 IOPL check for software interrupts (host callbacks).
        const NO_IOPL_CHECK = 1 << 3;
    }
}

/// New SS:ESP picked from the TSS for an inner-level transfer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InnerStack {
    pub selector: u16,
    pub desc: Descriptor,
    pub esp: u32,
}

impl Cpu {
    /// Deliver interrupt `vector`. `return_eip` is the EIP saved in the frame.
    ///
    /// Events that carry an error code should go through [`Cpu::exception`];
    /// a `HAS_ERROR` request made here pushes an error code of 0.
    pub fn raise_interrupt<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        vector: u8,
        kind: InterruptKind,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.interrupt(bus, vector, kind, 0, return_eip))
    }

    /// Deliver a CPU exception with `error_code` (ignored for vectors that
    /// do not push one).
    pub fn exception<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        exception: Exception,
        error_code: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        let mut kind = InterruptKind::EXCEPTION;
        if exception.pushes_error_code() {
            kind |= InterruptKind::HAS_ERROR;
        }
        self.atomically(bus, |cpu, bus| {
            cpu.interrupt(bus, exception.vector(), kind, error_code, return_eip)
        })
    }

    /// Deliver a fault returned by another operation. Internal errors are
    /// handed back unchanged.
    pub fn deliver_fault<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        fault: CpuFault,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        match fault {
            CpuFault::Exception {
                exception,
                error_code,
            } => self.exception(bus, exception, error_code.unwrap_or(0), return_eip),
            CpuFault::Internal(_) => Err(fault),
        }
    }

    /// Raise `#DB` after recording `triggers` (B0-B3/BD/BS/BT) in DR6.
    pub fn debug_exception<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        triggers: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.debug_trap(bus, triggers, return_eip))
    }

    fn debug_trap<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        triggers: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        self.state.drx[6] = (self.state.drx[6] & 0xffff_1ff0) | triggers;
        self.interrupt(
            bus,
            Exception::Debug.vector(),
            InterruptKind::EXCEPTION,
            0,
            return_eip,
        )
    }

    /// Vector 1 without [`InterruptKind::EXCEPTION`] (`INT 1`, `ICEBP`) is
    /// delivered as `#DB` after the DR6 update, not reported as internal.
    pub(crate) fn interrupt<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        vector: u8,
        kind: InterruptKind,
        error_code: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        if vector == Exception::Debug.vector() && !kind.contains(InterruptKind::EXCEPTION) {
            return self.debug_trap(bus, 0, return_eip);
        }
        if !self.state.pmode {
            return self.interrupt_real_mode(bus, vector, return_eip);
        }

        let software = kind.contains(InterruptKind::SOFTWARE);
        let ext = u32::from(!software);
        let st = &mut self.state;
        if st.is_v86() && software && !kind.contains(InterruptKind::NO_IOPL_CHECK) && st.iopl() != 3
        {
            return Err(CpuFault::gp0());
        }

        let idt_code = vector as u32 * 8 + 2;
        let Some(gate) = st.fetch_gate(bus, vector)? else {
            return Err(CpuFault::gp(idt_code + ext));
        };
        if software && gate.dpl() < st.cpl {
            return Err(CpuFault::gp(idt_code));
        }

        match gate.kind() {
            DescriptorKind::InterruptGate { is386 } | DescriptorKind::TrapGate { is386 } => {
                if !gate.present() {
                    return Err(CpuFault::np(idt_code + ext));
                }
                self.interrupt_through_gate(bus, gate, is386, kind, ext, error_code, return_eip)
            }
            DescriptorKind::TaskGate => {
                if !gate.present() {
                    return Err(CpuFault::np(idt_code + ext));
                }
                self.switch_task(bus, gate.gate_selector(), TaskSwitchKind::CallInt, return_eip)?;
                if kind.contains(InterruptKind::HAS_ERROR) {
                    let wide = self.tss.is386;
                    self.state.push_sized(bus, wide, error_code)?;
                }
                Ok(())
            }
            _ => {
                error!(vector, desc_type = gate.desc_type(), "illegal IDT descriptor");
                Err(InternalError::IllegalGate {
                    vector,
                    desc_type: gate.desc_type(),
                }
                .into())
            }
        }
    }

    fn interrupt_real_mode<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        vector: u8,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        let st = &mut self.state;
        let entry = st.idtr.base.wrapping_add(vector as u32 * 4);
        let offset = bus.read_u16(entry)?;
        let segment = bus.read_u16(entry.wrapping_add(2))?;

        st.push16(bus, st.eflags() as u16)?;
        st.push16(bus, st.selector(SegReg::Cs))?;
        st.push16(bus, return_eip as u16)?;
        st.set_flag(FLAG_IF, false);
        st.set_flag(FLAG_TF, false);

        st.eip = offset as u32;
        st.set_seg(SegReg::Cs, SegmentRegister::real(segment));
        st.code_big = false;
        trace!(vector, segment, offset, "real mode interrupt");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn interrupt_through_gate<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        gate: Descriptor,
        is386: bool,
        kind: InterruptKind,
        ext: u32,
        error_code: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        let gate_sel = Selector(gate.gate_selector());
        let gate_off = gate.gate_offset();
        if gate_sel.is_null() {
            return Err(CpuFault::gp(ext));
        }
        let sel_code = gate_sel.error_code() + ext;
        let Some(cs_desc) = self.state.fetch_descriptor(bus, gate_sel.0)? else {
            return Err(CpuFault::gp(sel_code));
        };
        let cpl = self.state.cpl;
        let cs_dpl = cs_desc.dpl();
        if cs_dpl > cpl {
            return Err(CpuFault::gp(sel_code));
        }
        if !cs_desc.is_code() {
            error!(selector = gate_sel.0, desc_type = cs_desc.desc_type(), "INT gate to non-code");
            return Err(InternalError::IllegalDescriptor {
                op: "INT",
                selector: gate_sel.0,
                desc_type: cs_desc.desc_type(),
            }
            .into());
        }
        if !cs_desc.present() {
            return Err(CpuFault::np(sel_code));
        }

        let v86 = self.state.is_v86();
        if privilege::is_inner_level(cpl, &cs_desc) {
            if v86 && cs_dpl != 0 {
                return Err(CpuFault::gp(gate_sel.error_code()));
            }
            if v86 && !is386 {
                return Err(InternalError::V86To16BitGate.into());
            }
            let stack = self.inner_stack(bus, cs_dpl, ext, "INT")?;

            // Commit: switch to the inner stack.
            let o_ss = self.state.selector(SegReg::Ss);
            let o_esp = self.state.esp();
            self.switch_stack(stack);
            self.state.cpl = cs_dpl;

            let st = &mut self.state;
            if is386 {
                if v86 {
                    for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                        st.push32(bus, st.selector(seg) as u32)?;
                        st.set_seg(seg, SegmentRegister::null());
                    }
                }
                st.push32(bus, o_ss as u32)?;
                st.push32(bus, o_esp)?;
            } else {
                st.push16(bus, o_ss)?;
                st.push16(bus, o_esp as u16)?;
            }
            debug!(ss = stack.selector, esp = stack.esp, "INT: gate to inner level");
        } else if v86 && cs_dpl < cpl {
            return Err(InternalError::V86SameLevelInterrupt.into());
        }

        self.push_interrupt_frame(bus, is386, kind, error_code, return_eip)?;

        let st = &mut self.state;
        st.set_seg(
            SegReg::Cs,
            SegmentRegister {
                selector: gate_sel.with_rpl(st.cpl).0,
                base: cs_desc.base(),
            },
        );
        st.code_big = cs_desc.big();
        st.eip = gate_off;
        if matches!(gate.kind(), DescriptorKind::InterruptGate { .. }) {
            st.set_flag(FLAG_IF, false);
        }
        st.set_flag(FLAG_TF, false);
        st.set_flag(FLAG_NT, false);
        st.set_flag(FLAG_VM, false);
        debug!(
            selector = gate_sel.0,
            offset = gate_off,
            big = st.code_big,
            gate = if is386 { "386" } else { "286" },
            "INT: gate taken"
        );
        Ok(())
    }

    /// FLAGS, CS, return EIP and the optional error code, sized by the gate.
    fn push_interrupt_frame<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        is386: bool,
        kind: InterruptKind,
        error_code: u32,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        let st = &mut self.state;
        st.push_sized(bus, is386, st.eflags())?;
        st.push_sized(bus, is386, st.selector(SegReg::Cs) as u32)?;
        st.push_sized(bus, is386, return_eip)?;
        if kind.contains(InterruptKind::HAS_ERROR) {
            st.push_sized(bus, is386, error_code)?;
        }
        Ok(())
    }

    /// Fetch and validate the TSS stack for privilege `level`.
    ///
    /// `ext` is added to error codes (1 for externally generated events).
    pub(crate) fn inner_stack<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        level: u8,
        ext: u32,
        op: &'static str,
    ) -> Result<InnerStack, CpuFault> {
        let tss = self.tss;
        let (ss, esp) = tss.stack_for_level(&mut self.state, bus, level)?;
        let sel = Selector(ss);
        if sel.is_null() {
            return Err(CpuFault::ts(ext));
        }
        let Some(desc) = self.state.fetch_descriptor(bus, ss)? else {
            return Err(CpuFault::ts(sel.error_code() + ext));
        };
        if !privilege::stack_matches_level(sel.rpl(), &desc, level) {
            return Err(CpuFault::ts(sel.error_code() + ext));
        }
        if !desc.is_writable_data() {
            error!(op, selector = ss, "inner level stack segment not writable");
            return Err(InternalError::StackNotWritable { op, selector: ss }.into());
        }
        if !desc.present() {
            return Err(CpuFault::ss(sel.error_code() + ext));
        }
        Ok(InnerStack {
            selector: ss,
            desc,
            esp,
        })
    }

    pub(crate) fn switch_stack(&mut self, stack: InnerStack) {
        let st = &mut self.state;
        st.set_seg(
            SegReg::Ss,
            SegmentRegister {
                selector: stack.selector,
                base: stack.desc.base(),
            },
        );
        st.stack = StackMode::from_big(stack.desc.big());
        st.load_stack_pointer(stack.esp);
    }
}
