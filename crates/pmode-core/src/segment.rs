//! Segment register loads and the segment inspection instructions
//! (`ARPL`, `LAR`, `LSL`, `VERR`, `VERW`).

use tracing::trace;

use crate::cpu::Cpu;
use crate::descriptor::{Descriptor, DescriptorKind, Selector};
use crate::exception::CpuFault;
use crate::mem::CpuBus;
use crate::privilege;
use crate::state::{SegReg, SegmentRegister, StackMode, FLAG_ZF};

impl Cpu {
    /// `MOV Sreg` / `LDS`-family load of `seg` with `value`.
    ///
    /// Real mode and V86 just shift the selector into the base. In protected
    /// mode the descriptor is fetched and checked; on failure the segment
    /// cache is left as it was.
    pub fn load_segment<B: CpuBus>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        value: u16,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.set_segment(bus, seg, value))
    }

    /// `POP Sreg`. ESP only moves once the load has succeeded.
    pub fn pop_segment<B: CpuBus>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        use32: bool,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| {
            let st = &cpu.state;
            let value = bus.read_u16(st.stack_top())?;
            // The load may change the stack width, so step with the old one.
            let new_esp = st.stack.offset(st.esp(), if use32 { 4 } else { 2 });
            cpu.set_segment(bus, seg, value)?;
            cpu.state.set_esp(new_esp);
            Ok(())
        })
    }

    pub(crate) fn set_segment<B: CpuBus>(
        &mut self,
        bus: &mut B,
        seg: SegReg,
        value: u16,
    ) -> Result<(), CpuFault> {
        if seg == SegReg::Cs {
            // CS only changes through far transfers.
            return Err(CpuFault::ud());
        }
        let st = &mut self.state;
        if !st.pmode || st.is_v86() {
            st.set_seg(seg, SegmentRegister::real(value));
            if seg == SegReg::Ss {
                st.stack = StackMode::BITS16;
            }
            return Ok(());
        }

        let sel = Selector(value);
        if seg == SegReg::Ss {
            if sel.is_null() {
                return Err(CpuFault::gp0());
            }
            let Some(desc) = st.fetch_descriptor(bus, value)? else {
                return Err(CpuFault::gp(sel.error_code()));
            };
            if !privilege::stack_segment_loadable(st.cpl, sel.rpl(), &desc) {
                return Err(CpuFault::gp(sel.error_code()));
            }
            if !desc.present() {
                return Err(CpuFault::ss(sel.error_code()));
            }
            st.set_seg(
                SegReg::Ss,
                SegmentRegister {
                    selector: value,
                    base: desc.base(),
                },
            );
            st.stack = StackMode::from_big(desc.big());
            return Ok(());
        }

        if sel.is_null() {
            st.set_seg(
                seg,
                SegmentRegister {
                    selector: value,
                    base: 0,
                },
            );
            return Ok(());
        }
        let Some(desc) = st.fetch_descriptor(bus, value)? else {
            return Err(CpuFault::gp(sel.error_code()));
        };
        if !privilege::data_segment_loadable(st.cpl, sel.rpl(), &desc) {
            return Err(CpuFault::gp(sel.error_code()));
        }
        if !desc.present() {
            return Err(CpuFault::np(sel.error_code()));
        }
        st.set_seg(
            seg,
            SegmentRegister {
                selector: value,
                base: desc.base(),
            },
        );
        Ok(())
    }

    /// After a return to an outer level, null any data segment register the
    /// new CPL may no longer use.
    pub(crate) fn check_segments<B: CpuBus>(&mut self, bus: &mut B) -> Result<(), CpuFault> {
        for seg in SegReg::DATA {
            let selector = self.state.selector(seg);
            let stale = match self.state.fetch_descriptor(bus, selector)? {
                None => true,
                Some(desc) => privilege::invalid_after_return(self.state.cpl, &desc),
            };
            if stale {
                trace!(?seg, selector, "segment invalidated on outer return");
                self.set_segment(bus, seg, 0)?;
            }
        }
        Ok(())
    }

    fn inspect_descriptor<B: CpuBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
    ) -> Result<Option<Descriptor>, CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.state.fetch_descriptor(bus, selector))
    }

    /// `ARPL`: raise the RPL of `dest` to that of `src`. Sets ZF when adjusted.
    pub fn arpl(&mut self, dest: u16, src: u16) -> u16 {
        if (dest & 3) < (src & 3) {
            self.state.set_flag(FLAG_ZF, true);
            (dest & 0xfffc) | (src & 3)
        } else {
            self.state.set_flag(FLAG_ZF, false);
            dest
        }
    }

    /// `LAR`: access rights of `selector`, or `None` (ZF clear) if the
    /// descriptor is not visible at the current privilege.
    pub fn lar<B: CpuBus>(&mut self, bus: &mut B, selector: u16) -> Result<Option<u32>, CpuFault> {
        let res = self.visible_descriptor(bus, selector, |kind| {
            !matches!(
                kind,
                DescriptorKind::InterruptGate { .. } | DescriptorKind::TrapGate { .. }
            )
        })?;
        Ok(res.map(|desc| desc.access_rights()))
    }

    /// `LSL`: byte-granular limit of `selector`, or `None` (ZF clear).
    pub fn lsl<B: CpuBus>(&mut self, bus: &mut B, selector: u16) -> Result<Option<u32>, CpuFault> {
        let res = self.visible_descriptor(bus, selector, |kind| {
            matches!(
                kind,
                DescriptorKind::Ldt
                    | DescriptorKind::Tss { .. }
                    | DescriptorKind::Data { .. }
                    | DescriptorKind::Code { .. }
            )
        })?;
        Ok(res.map(|desc| desc.limit()))
    }

    fn visible_descriptor<B: CpuBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
        type_ok: impl Fn(DescriptorKind) -> bool,
    ) -> Result<Option<Descriptor>, CpuFault> {
        let sel = Selector(selector);
        let mut found = None;
        if !sel.is_null() {
            if let Some(desc) = self.inspect_descriptor(bus, selector)? {
                let kind = desc.kind();
                let visible = match kind {
                    DescriptorKind::Invalid => false,
                    DescriptorKind::Code {
                        conforming: true, ..
                    } => true,
                    _ => desc.dpl() >= self.state.cpl && desc.dpl() >= sel.rpl(),
                };
                if visible && type_ok(kind) {
                    found = Some(desc);
                }
            }
        }
        self.state.set_flag(FLAG_ZF, found.is_some());
        Ok(found)
    }

    /// `VERR`: whether `selector` is readable at the current privilege.
    pub fn verr<B: CpuBus>(&mut self, bus: &mut B, selector: u16) -> Result<bool, CpuFault> {
        self.verify(bus, selector, |desc| match desc.kind() {
            DescriptorKind::Code {
                readable: true,
                conforming: true,
            } => Some(true),
            DescriptorKind::Data { .. }
            | DescriptorKind::Code {
                readable: true,
                conforming: false,
            } => None,
            _ => Some(false),
        })
    }

    /// `VERW`: whether `selector` is writable at the current privilege.
    pub fn verw<B: CpuBus>(&mut self, bus: &mut B, selector: u16) -> Result<bool, CpuFault> {
        self.verify(bus, selector, |desc| {
            if desc.is_writable_data() {
                None
            } else {
                Some(false)
            }
        })
    }

    /// `decide` returns a final answer, or `None` to apply the DPL check.
    fn verify<B: CpuBus>(
        &mut self,
        bus: &mut B,
        selector: u16,
        decide: impl Fn(&Descriptor) -> Option<bool>,
    ) -> Result<bool, CpuFault> {
        let ok = if selector == 0 {
            false
        } else {
            match self.inspect_descriptor(bus, selector)? {
                None => false,
                Some(desc) => decide(&desc).unwrap_or_else(|| {
                    desc.dpl() >= self.state.cpl && desc.dpl() >= Selector(selector).rpl()
                }),
            }
        };
        self.state.set_flag(FLAG_ZF, ok);
        Ok(ok)
    }
}
