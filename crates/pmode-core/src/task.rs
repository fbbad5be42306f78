//! Hardware task switching through a 32-bit TSS.

use tracing::{debug, warn};

use crate::cpu::Cpu;
use crate::descriptor::DescriptorKind;
use crate::exception::{CpuFault, Exception, InternalError};
use crate::paging::CpuPlatform;
use crate::state::{Gpr, SegReg, SegmentRegister, FLAG_NT, FLAG_VM, FMASK_ALL};
use crate::tss::{tss32, TssHandle};

/// What initiated a task switch. Decides how the busy bits and the
/// back-link are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchKind {
    /// Far `JMP` to a TSS or task gate: outgoing task is released.
    Jmp,
    /// Far `CALL`, `INT` or exception through a task gate: the new task
    /// links back to the outgoing one, which stays busy.
    CallInt,
    /// `IRET` with NT set: return along the back-link.
    Iret,
}

/// Register file of the incoming task as stored in its TSS.
#[derive(Debug, Clone, Copy)]
struct TaskSnapshot {
    cr3: u32,
    eip: u32,
    eflags: u32,
    gprs: [u32; 8],
    segs: [u16; 6],
    ldt: u16,
}

const GPR_SLOTS: [(Gpr, u32); 8] = [
    (Gpr::Eax, tss32::EAX),
    (Gpr::Ecx, tss32::ECX),
    (Gpr::Edx, tss32::EDX),
    (Gpr::Ebx, tss32::EBX),
    (Gpr::Esp, tss32::ESP),
    (Gpr::Ebp, tss32::EBP),
    (Gpr::Esi, tss32::ESI),
    (Gpr::Edi, tss32::EDI),
];

const SEG_SLOTS: [(SegReg, u32); 6] = [
    (SegReg::Es, tss32::ES),
    (SegReg::Cs, tss32::CS),
    (SegReg::Ss, tss32::SS),
    (SegReg::Ds, tss32::DS),
    (SegReg::Fs, tss32::FS),
    (SegReg::Gs, tss32::GS),
];

impl Cpu {
    /// Switch to the task whose TSS descriptor is `selector`.
    ///
    /// `return_eip` is saved as the outgoing task's EIP.
    pub fn task_switch<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        selector: u16,
        kind: TaskSwitchKind,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        self.atomically(bus, |cpu, bus| cpu.switch_task(bus, selector, kind, return_eip))
    }

    pub(crate) fn switch_task<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        selector: u16,
        kind: TaskSwitchKind,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        let illegal = InternalError::IllegalTss { selector, kind };
        let Some(mut new_tss) = TssHandle::resolve(&mut self.state, bus, selector)? else {
            return Err(illegal.into());
        };
        if !new_tss.valid {
            return Err(illegal.into());
        }
        match (kind, new_tss.desc.is_busy()) {
            (TaskSwitchKind::Iret, false) => {
                return Err(InternalError::TssNotBusy { selector }.into())
            }
            (TaskSwitchKind::Jmp | TaskSwitchKind::CallInt, true) => {
                return Err(InternalError::TssBusy { selector }.into())
            }
            _ => {}
        }
        if !new_tss.is386 {
            return Err(InternalError::Task16Bit { selector }.into());
        }
        let mut old_tss = self.tss;
        if old_tss.valid && !old_tss.is386 {
            return Err(InternalError::Task16Bit {
                selector: old_tss.selector,
            }
            .into());
        }

        let mut next = self.read_task_snapshot(bus, &new_tss)?;

        // Busy bits live in guest memory and are not rolled back, so every
        // other store of the outgoing phase happens first.
        if old_tss.valid {
            self.save_task_context(bus, &old_tss, kind, return_eip)?;
        } else {
            debug!(selector, "task switch without a current TSS, outgoing context dropped");
        }

        if kind == TaskSwitchKind::CallInt {
            new_tss.write_u32(
                &mut self.state,
                bus,
                tss32::BACK_LINK,
                old_tss.selector as u32,
            )?;
            next.eflags |= FLAG_NT;
        }
        self.update_busy_bits(bus, kind, &mut old_tss, &mut new_tss)?;

        // The outgoing task is stored; from here on faults belong to the new
        // task and nothing is rolled back.
        self.task_switch_committed = true;

        if selector == old_tss.selector {
            self.state.eip = return_eip;
            for (seg, _) in SEG_SLOTS {
                next.segs[seg as usize] = self.state.selector(seg);
            }
        } else {
            bus.set_directory_base(next.cr3);
            self.state.eip = next.eip;
            self.set_flags(next.eflags, FMASK_ALL | FLAG_VM);
            for (reg, _) in GPR_SLOTS {
                self.state.set_gpr32(reg, next.gprs[reg as usize]);
            }
        }

        // TR names the incoming task before its segments are loaded, so a
        // fault there is delivered in the new task.
        match TssHandle::resolve(&mut self.state, bus, selector)? {
            Some(handle) => self.tss = handle,
            None => {
                warn!(selector, "task switch: TSS selector no longer resolves");
                self.tss.valid = false;
            }
        }

        self.load_task_segments(bus, &next)?;
        debug!(
            selector,
            ?kind,
            cs = self.state.selector(SegReg::Cs),
            eip = self.state.eip,
            cpl = self.state.cpl,
            "task switch"
        );
        Ok(())
    }

    /// Release the outgoing task (`JMP`/`IRET`) and claim the incoming one
    /// (`JMP`/`CALL`). If the second store faults the first is undone.
    fn update_busy_bits<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        kind: TaskSwitchKind,
        old_tss: &mut TssHandle,
        new_tss: &mut TssHandle,
    ) -> Result<(), CpuFault> {
        let release = old_tss.valid && matches!(kind, TaskSwitchKind::Jmp | TaskSwitchKind::Iret);
        if release {
            old_tss.set_busy(&mut self.state, bus, false)?;
        }
        if matches!(kind, TaskSwitchKind::Jmp | TaskSwitchKind::CallInt) {
            if let Err(fault) = new_tss.set_busy(&mut self.state, bus, true) {
                if release && old_tss.set_busy(&mut self.state, bus, true).is_err() {
                    warn!(selector = old_tss.selector, "task switch: busy bit not restored");
                }
                return Err(fault);
            }
        }
        Ok(())
    }

    fn read_task_snapshot<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        tss: &TssHandle,
    ) -> Result<TaskSnapshot, CpuFault> {
        let st = &mut self.state;
        let mut snap = TaskSnapshot {
            cr3: tss.read_u32(st, bus, tss32::CR3)?,
            eip: tss.read_u32(st, bus, tss32::EIP)?,
            eflags: tss.read_u32(st, bus, tss32::EFLAGS)?,
            gprs: [0; 8],
            segs: [0; 6],
            ldt: tss.read_u16(st, bus, tss32::LDT)?,
        };
        for (reg, offset) in GPR_SLOTS {
            snap.gprs[reg as usize] = tss.read_u32(st, bus, offset)?;
        }
        for (seg, offset) in SEG_SLOTS {
            snap.segs[seg as usize] = tss.read_u16(st, bus, offset)?;
        }
        Ok(snap)
    }

    fn save_task_context<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        tss: &TssHandle,
        kind: TaskSwitchKind,
        return_eip: u32,
    ) -> Result<(), CpuFault> {
        let mut eflags = self.state.eflags();
        if kind == TaskSwitchKind::Iret {
            eflags &= !FLAG_NT;
        }
        let st = &mut self.state;
        tss.write_u32(st, bus, tss32::EFLAGS, eflags)?;
        tss.write_u32(st, bus, tss32::EIP, return_eip)?;
        for (reg, offset) in GPR_SLOTS {
            let value = st.gpr32(reg);
            tss.write_u32(st, bus, offset, value)?;
        }
        for (seg, offset) in SEG_SLOTS {
            let value = st.selector(seg) as u32;
            tss.write_u32(st, bus, offset, value)?;
        }
        Ok(())
    }

    fn load_task_segments<B: CpuPlatform>(
        &mut self,
        bus: &mut B,
        next: &TaskSnapshot,
    ) -> Result<(), CpuFault> {
        match self.load_ldt(bus, next.ldt) {
            Ok(()) => {}
            Err(fault)
                if matches!(
                    fault.exception(),
                    Some(Exception::GeneralProtection | Exception::SegmentNotPresent)
                ) =>
            {
                warn!(ldt = next.ldt, %fault, "task switch: LDT not loadable");
            }
            Err(fault) => return Err(fault),
        }

        let cs = next.segs[SegReg::Cs as usize];
        if self.state.is_v86() {
            self.state.set_seg(SegReg::Cs, SegmentRegister::real(cs));
            self.state.code_big = false;
            self.state.cpl = 3;
        } else {
            self.load_task_cs(bus, cs)?;
        }

        for seg in [SegReg::Es, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            self.set_segment(bus, seg, next.segs[seg as usize])?;
        }
        Ok(())
    }

    fn load_task_cs<B: CpuPlatform>(&mut self, bus: &mut B, cs: u16) -> Result<(), CpuFault> {
        let cpl = (cs & 3) as u8;
        self.state.cpl = cpl;
        let Some(desc) = self.state.fetch_descriptor(bus, cs)? else {
            return Err(InternalError::TaskCsBeyondLimit { selector: cs }.into());
        };
        if !desc.present() {
            return Err(InternalError::TaskCsNotPresent { selector: cs }.into());
        }
        match desc.kind() {
            DescriptorKind::Code { conforming, .. } => {
                let ok = if conforming {
                    cpl >= desc.dpl()
                } else {
                    cpl == desc.dpl()
                };
                if !ok {
                    return Err(InternalError::TaskCsPrivilege {
                        selector: cs,
                        rpl: cpl,
                        dpl: desc.dpl(),
                    }
                    .into());
                }
            }
            _ => {
                return Err(InternalError::TaskCsType {
                    desc_type: desc.desc_type(),
                }
                .into())
            }
        }
        self.state.set_seg(
            SegReg::Cs,
            SegmentRegister {
                selector: cs,
                base: desc.base(),
            },
        );
        self.state.code_big = desc.big();
        Ok(())
    }
}
