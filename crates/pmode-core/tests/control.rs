mod common;

use std::cell::Cell;
use std::rc::Rc;

use common::*;
use pmode_core::descriptor::types;
use pmode_core::state::{
    CR0_ET, CR0_PE, CR0_PG, FLAG_AC, FLAG_DF, FLAG_ID, FLAG_IF, FLAG_IOPL, FLAG_VM,
};
use pmode_core::{CpuArch, CpuConfig, CpuFault, CycleGovernor, Descriptor, SegReg};

struct CountingGovernor(Rc<Cell<u32>>);

impl CycleGovernor for CountingGovernor {
    fn protected_mode_entered(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

#[test]
fn ltr_marks_tss_busy_and_refuses_a_second_load() {
    let mut m = Machine::with_task();
    assert_eq!(m.cpu.str(), TSS_A);
    assert!(m.cpu.tss().valid);
    assert_eq!(m.cpu.tss().base, TSS_A_BASE);
    assert_eq!(m.cpu.tss().limit, TSS_A_LIMIT);
    assert_eq!(m.gdt(TSS_A).desc_type(), types::TSS_386_BUSY);

    let res = m.cpu.ltr(&mut m.bus, TSS_A);
    assert_fault(res, CpuFault::gp(u32::from(TSS_A)));
    let res = m.cpu.ltr(&mut m.bus, DATA0);
    assert_fault(res, CpuFault::gp(u32::from(DATA0)));
    let res = m.cpu.ltr(&mut m.bus, 0x0400);
    assert_fault(res, CpuFault::gp(0x400));
    assert_eq!(m.cpu.str(), TSS_A);
}

#[test]
fn ltr_of_absent_tss_is_np() {
    let mut m = Machine::protected();
    m.set_gdt(
        TSS_B,
        Descriptor::segment(TSS_B_BASE, TSS_B_LIMIT, types::TSS_386_AVAILABLE, 0, false, false, false),
    );
    let res = m.cpu.ltr(&mut m.bus, TSS_B);
    assert_fault(res, CpuFault::np(u32::from(TSS_B)));
    assert!(!m.gdt(TSS_B).is_busy());
}

#[test]
fn system_instructions_check_mode_and_privilege() {
    let mut m = Machine::real_mode();
    assert_fault(m.cpu.ltr(&mut m.bus, TSS_A), CpuFault::ud());
    assert_fault(m.cpu.lldt(&mut m.bus, LDT_SEL), CpuFault::ud());

    let mut m = Machine::with_task();
    m.enter_ring3();
    assert_fault(m.cpu.ltr(&mut m.bus, TSS_B), CpuFault::gp0());
    assert_fault(m.cpu.lldt(&mut m.bus, LDT_SEL), CpuFault::gp0());
    assert_fault(m.cpu.lgdt(0, 0), CpuFault::gp0());
    assert_fault(m.cpu.lidt(0, 0), CpuFault::gp0());
    assert_fault(m.cpu.write_cr(&mut m.bus, 0, 0), CpuFault::gp0());
    assert_eq!(m.cpu.read_cr(&mut m.bus, 0), Err(CpuFault::gp0()));
    assert_eq!(m.cpu.read_dr(7), Err(CpuFault::gp0()));
    assert_fault(m.cpu.write_tr(6, 0), CpuFault::gp0());
    assert_fault(m.cpu.lmsw(&mut m.bus, 0), CpuFault::gp0());

    m.cpu.state.set_flag(FLAG_VM, true);
    assert_fault(m.cpu.lldt(&mut m.bus, 0), CpuFault::ud());
}

#[test]
fn descriptor_table_registers() {
    let mut m = Machine::protected();
    assert_eq!(m.cpu.sgdt().base, GDT_BASE);
    assert_eq!(m.cpu.sgdt().limit, GDT_LIMIT);
    m.cpu.lidt(0x3ff, 0x0).unwrap();
    assert_eq!(m.cpu.sidt().limit, 0x3ff);
    assert_eq!(m.cpu.sidt().base, 0);
}

#[test]
fn lldt_validates_the_descriptor() {
    let mut m = Machine::protected();
    m.cpu.lldt(&mut m.bus, LDT_SEL).unwrap();
    assert_eq!(m.cpu.state.ldtr.base, LDT_BASE);
    assert_eq!(m.cpu.state.ldtr.limit, LDT_LIMIT);

    assert_fault(m.cpu.lldt(&mut m.bus, DATA0), CpuFault::gp(u32::from(DATA0)));
    assert_eq!(m.cpu.sldt(), LDT_SEL);

    m.set_gdt(
        SCRATCH,
        Descriptor::segment(LDT_BASE, LDT_LIMIT, types::LDT, 0, false, false, false),
    );
    assert_fault(m.cpu.lldt(&mut m.bus, SCRATCH), CpuFault::np(u32::from(SCRATCH)));

    m.cpu.lldt(&mut m.bus, 0).unwrap();
    assert_eq!(m.cpu.sldt(), 0);
    assert_eq!(m.cpu.state.ldtr.limit, 0);
}

#[test]
fn cr0_enters_protected_mode_once() {
    let mut m = Machine::real_mode();
    let entered = Rc::new(Cell::new(0));
    m.cpu.set_governor(Box::new(CountingGovernor(entered.clone())));

    m.cpu.write_cr(&mut m.bus, 0, CR0_PE).unwrap();
    assert!(m.cpu.is_protected_mode());
    assert_eq!(m.cpu.state.cr0, CR0_PE | CR0_ET);
    assert_eq!(entered.get(), 1);

    // Turning paging on while already protected is not a new entry.
    m.cpu.write_cr(&mut m.bus, 0, CR0_PE | CR0_PG).unwrap();
    assert!(m.bus.paging_enabled());
    assert_eq!(entered.get(), 1);

    m.cpu.write_cr(&mut m.bus, 0, 0).unwrap();
    assert!(!m.cpu.is_protected_mode());
    assert!(!m.bus.paging_enabled());

    m.cpu.lmsw(&mut m.bus, 1).unwrap();
    assert!(m.cpu.is_protected_mode());
    assert_eq!(entered.get(), 2);
    // LMSW cannot clear PE.
    m.cpu.lmsw(&mut m.bus, 0).unwrap();
    assert!(m.cpu.is_protected_mode());
    assert_eq!(m.cpu.smsw() & 1, 1);
}

#[test]
fn cr0_read_back_depends_on_model() {
    let mut m = Machine::protected();
    assert_eq!(m.cpu.read_cr(&mut m.bus, 0), Ok(CR0_PE | CR0_ET));

    let mut m = Machine::protected_with(CpuConfig::with_arch(CpuArch::I386Fast));
    assert_eq!(m.cpu.read_cr(&mut m.bus, 0), Ok(0x7fff_fff1));

    let mut m = Machine::protected_with(CpuConfig::with_arch(CpuArch::I486Slow));
    m.cpu.write_cr(&mut m.bus, 0, 0x6000_0001 | 0x100).unwrap();
    assert_eq!(m.cpu.read_cr(&mut m.bus, 0), Ok(0x6000_0011));
}

#[test]
fn cr2_cr3_and_cr4() {
    let mut m = Machine::protected();
    m.cpu.write_cr(&mut m.bus, 2, 0xdead_beef).unwrap();
    assert_eq!(m.cpu.read_cr(&mut m.bus, 2), Ok(0xdead_beef));

    m.cpu.write_cr(&mut m.bus, 3, 0x0012_3456).unwrap();
    assert_eq!(m.bus.directory_base_loads, vec![0x0012_3456]);
    assert_eq!(m.cpu.read_cr(&mut m.bus, 3), Ok(0x0012_3000));

    m.cpu.write_cr(&mut m.bus, 4, 0x10).unwrap();
    assert_eq!(m.cpu.read_cr(&mut m.bus, 4), Ok(0));

    assert_fault(m.cpu.write_cr(&mut m.bus, 1, 0), CpuFault::ud());
    assert_eq!(m.cpu.read_cr(&mut m.bus, 5), Err(CpuFault::ud()));

    let mut m = Machine::protected_with(CpuConfig::with_arch(CpuArch::I386Slow));
    assert_fault(m.cpu.write_cr(&mut m.bus, 4, 0), CpuFault::ud());
}

#[test]
fn debug_registers() {
    let mut m = Machine::protected();
    assert_eq!(m.cpu.read_dr(6), Ok(0xffff_1ff0));
    assert_eq!(m.cpu.read_dr(7), Ok(0x400));

    m.cpu.write_dr(0, 0x1234).unwrap();
    assert_eq!(m.cpu.read_dr(0), Ok(0x1234));

    m.cpu.write_dr(6, 0).unwrap();
    assert_eq!(m.cpu.read_dr(6), Ok(0xffff_0ff0));
    m.cpu.write_dr(4, 0x1001).unwrap();
    assert_eq!(m.cpu.read_dr(6), Ok(0xffff_0ff1));
    assert_eq!(m.cpu.read_dr(4), Ok(0xffff_0ff1));

    m.cpu.write_dr(7, 0x3001).unwrap();
    assert_eq!(m.cpu.read_dr(7), Ok(0x3401));
    assert_eq!(m.cpu.read_dr(5), Ok(0x3401));

    assert_fault(m.cpu.write_dr(8, 0), CpuFault::ud());

    let mut m = Machine::protected_with(CpuConfig::with_arch(CpuArch::I486Slow));
    m.cpu.write_dr(5, 0x3001).unwrap();
    assert_eq!(m.cpu.read_dr(7), Ok(0x2401));

    let m = Machine::real_mode_with(CpuConfig::with_arch(CpuArch::PentiumSlow));
    assert_eq!(m.cpu.state.drx[6], 0xffff_0ff0);
}

#[test]
fn test_registers() {
    let mut m = Machine::protected();
    m.cpu.write_tr(6, 0xaaaa).unwrap();
    m.cpu.write_tr(7, 0xbbbb).unwrap();
    assert_eq!(m.cpu.read_tr(6), Ok(0xaaaa));
    assert_eq!(m.cpu.read_tr(7), Ok(0xbbbb));
    assert_fault(m.cpu.write_tr(5, 0), CpuFault::ud());
    assert_eq!(m.cpu.read_tr(3), Err(CpuFault::ud()));
}

#[test]
fn cli_and_sti_follow_iopl() {
    let mut m = Machine::real_mode();
    m.cpu.cli().unwrap();
    assert!(!m.cpu.state.flag(FLAG_IF));

    let mut m = Machine::with_task();
    m.enter_ring3();
    assert_fault(m.cpu.cli(), CpuFault::gp0());
    assert!(m.cpu.state.flag(FLAG_IF));

    m.cpu.state.set_flag(FLAG_IOPL, true);
    m.cpu.cli().unwrap();
    assert!(!m.cpu.state.flag(FLAG_IF));
    m.cpu.sti().unwrap();
    assert!(m.cpu.state.flag(FLAG_IF));

    // V86 compares IOPL against 3.
    m.cpu.state.set_flag(FLAG_VM, true);
    m.cpu.state.set_flag(FLAG_IOPL, false);
    m.cpu.state.set_flag(1 << 12, true);
    assert_fault(m.cpu.sti(), CpuFault::gp0());
}

#[test]
fn pushf_and_popf() {
    let mut m = Machine::with_task();
    m.enter_ring3();
    m.cpu.state.set_flag(FLAG_VM, true);
    m.cpu.load_segment(&mut m.bus, SegReg::Ss, 0x0700).unwrap();
    m.cpu.state.set_esp(0x1000);
    assert_fault(m.cpu.pushf(&mut m.bus, true), CpuFault::gp0());
    assert_fault(m.cpu.popf(&mut m.bus, true), CpuFault::gp0());

    m.cpu.state.set_flag(FLAG_IOPL, true);
    m.cpu.pushf(&mut m.bus, true).unwrap();
    let image = peek_u32(&m.bus, 0x7ffc);
    assert_eq!(image & FLAG_VM, 0);
    assert_eq!(image & FLAG_IOPL, FLAG_IOPL);

    // Protected mode ring 3 without IOPL: IOPL and IF are frozen.
    let mut m = Machine::with_task();
    m.enter_ring3();
    m.cpu.state.push32(&mut m.bus, FLAG_IOPL | FLAG_DF).unwrap();
    m.cpu.popf(&mut m.bus, true).unwrap();
    assert_eq!(m.cpu.state.iopl(), 0);
    assert!(m.cpu.state.flag(FLAG_IF));
    assert!(m.cpu.state.flag(FLAG_DF));
    assert_eq!(m.cpu.direction(), -1);
    assert_eq!(m.cpu.state.esp(), RING3_STACK_TOP);

    // CPL 0 may change both.
    let mut m = Machine::protected();
    m.cpu.state.push16(&mut m.bus, 0x3002).unwrap();
    m.cpu.popf(&mut m.bus, false).unwrap();
    assert_eq!(m.cpu.state.iopl(), 3);
    assert!(!m.cpu.state.flag(FLAG_IF));
    assert_eq!(m.cpu.direction(), 1);
}

#[test]
fn toggleable_flags_depend_on_model() {
    let mut m = Machine::real_mode();
    m.cpu.set_flags(FLAG_AC | FLAG_ID, 0);
    assert!(m.cpu.state.flag(FLAG_AC));
    assert!(m.cpu.state.flag(FLAG_ID));

    let mut m = Machine::real_mode_with(CpuConfig::with_arch(CpuArch::I486Slow));
    m.cpu.set_flags(FLAG_AC | FLAG_ID, 0);
    assert!(m.cpu.state.flag(FLAG_AC));
    assert!(!m.cpu.state.flag(FLAG_ID));

    let mut m = Machine::real_mode_with(CpuConfig::with_arch(CpuArch::I386Fast));
    m.cpu.set_flags(FLAG_AC | FLAG_ID, 0);
    assert!(!m.cpu.state.flag(FLAG_AC));
    assert_eq!(m.cpu.state.eflags() & 2, 2);
}

#[test]
fn io_permission_bitmap() {
    let mut m = Machine::with_task();
    // Port 0x64 denied: byte 12 of the bitmap, bit 4.
    put_u16(&mut m.bus, TSS_A_BASE + IO_MAP_OFFSET + 12, 1 << 4);

    // CPL 0 with IOPL 0 is still privileged.
    m.cpu.io_permission(&mut m.bus, 0x64, 1).unwrap();

    m.enter_ring3();
    m.cpu.io_permission(&mut m.bus, 0x60, 1).unwrap();
    m.cpu.io_permission(&mut m.bus, 0x60, 4).unwrap();
    assert_fault(m.cpu.io_permission(&mut m.bus, 0x64, 1), CpuFault::gp0());
    assert_fault(m.cpu.io_permission(&mut m.bus, 0x62, 4), CpuFault::gp0());
    m.cpu.io_permission(&mut m.bus, 0x65, 2).unwrap();

    m.cpu.state.set_flag(FLAG_IOPL, true);
    m.cpu.io_permission(&mut m.bus, 0x64, 1).unwrap();

    // V86 consults the bitmap even with IOPL 3.
    m.cpu.state.set_flag(FLAG_VM, true);
    assert_fault(m.cpu.io_permission(&mut m.bus, 0x64, 1), CpuFault::gp0());

    // A bitmap offset beyond the TSS limit denies everything.
    m.cpu.state.set_flag(FLAG_VM, false);
    m.cpu.state.set_flag(FLAG_IOPL, false);
    put_u16(&mut m.bus, TSS_A_BASE + 0x66, 0x3000);
    assert_fault(m.cpu.io_permission(&mut m.bus, 0x60, 1), CpuFault::gp0());
}

#[test]
fn io_permission_without_task_denies_unprivileged_access() {
    let mut m = Machine::protected();
    m.enter_ring3();
    assert_fault(m.cpu.io_permission(&mut m.bus, 0x80, 1), CpuFault::gp0());
    let mut m = Machine::real_mode();
    m.cpu.io_permission(&mut m.bus, 0x80, 1).unwrap();
}
