#![allow(dead_code)]

use pmode_core::descriptor::types;
use pmode_core::state::{SegmentRegister, CR0_PE};
use pmode_core::tss::tss32;
use pmode_core::{Cpu, CpuConfig, CpuFault, CpuState, Descriptor, FlatTestBus, SegReg};

pub const MEM_SIZE: usize = 0x10_0000;

pub const GDT_BASE: u32 = 0x1000;
pub const GDT_LIMIT: u32 = 0xff;
pub const IDT_BASE: u32 = 0x2000;
pub const IDT_LIMIT: u32 = 0x7ff;

/// TSS A carries a full I/O permission bitmap after the 0x68-byte image.
pub const TSS_A_BASE: u32 = 0x3000;
pub const IO_MAP_OFFSET: u32 = 0x68;
pub const TSS_A_LIMIT: u32 = IO_MAP_OFFSET + 0x2000;
pub const TSS_B_BASE: u32 = 0x6000;
pub const TSS_B_LIMIT: u32 = 0x67;
pub const LDT_BASE: u32 = 0x6800;
pub const LDT_LIMIT: u32 = 0x3f;

pub const RING3_STACK_TOP: u32 = 0x8000;
pub const RING0_STACK_TOP: u32 = 0x9000;

pub const CODE0: u16 = 0x08;
pub const DATA0: u16 = 0x10;
pub const CODE3: u16 = 0x1b;
pub const DATA3: u16 = 0x23;
pub const TSS_A: u16 = 0x28;
pub const TSS_B: u16 = 0x30;
pub const CONFORMING0: u16 = 0x38;
pub const LDT_SEL: u16 = 0x40;
/// Free GDT slots for individual tests.
pub const SCRATCH: u16 = 0x48;
pub const SCRATCH2: u16 = 0x50;
pub const SCRATCH3: u16 = 0x58;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// 4 GiB flat segment with 32-bit default size.
pub fn flat(desc_type: u8, dpl: u8) -> Descriptor {
    Descriptor::segment(0, 0xfffff, desc_type, dpl, true, true, true)
}

pub fn put_u16(bus: &mut FlatTestBus, addr: u32, value: u16) {
    assert!(bus.poke(addr, &value.to_le_bytes()), "write past end of memory at {addr:#x}");
}

pub fn put_u32(bus: &mut FlatTestBus, addr: u32, value: u32) {
    assert!(bus.poke(addr, &value.to_le_bytes()), "write past end of memory at {addr:#x}");
}

pub fn peek_u16(bus: &FlatTestBus, addr: u32) -> u16 {
    u16::from_le_bytes(bus.peek(addr).unwrap())
}

pub fn peek_u32(bus: &FlatTestBus, addr: u32) -> u32 {
    u32::from_le_bytes(bus.peek(addr).unwrap())
}

pub fn put_descriptor(bus: &mut FlatTestBus, table_base: u32, selector: u16, desc: Descriptor) {
    let at = table_base + u32::from(selector & !7);
    put_u32(bus, at, desc.low());
    put_u32(bus, at + 4, desc.high());
}

pub fn read_descriptor(bus: &FlatTestBus, table_base: u32, selector: u16) -> Descriptor {
    let at = table_base + u32::from(selector & !7);
    Descriptor::from_parts(peek_u32(bus, at), peek_u32(bus, at + 4))
}

/// Contents of a 32-bit TSS.
#[derive(Debug, Clone, Default)]
pub struct TssImage {
    pub back_link: u16,
    pub esp0: u32,
    pub ss0: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldt: u16,
    pub io_map_base: u16,
}

impl TssImage {
    pub fn write(&self, bus: &mut FlatTestBus, base: u32) {
        put_u32(bus, base + tss32::BACK_LINK, self.back_link.into());
        put_u32(bus, base + tss32::ESP0, self.esp0);
        put_u32(bus, base + tss32::SS0, self.ss0.into());
        put_u32(bus, base + tss32::CR3, self.cr3);
        put_u32(bus, base + tss32::EIP, self.eip);
        put_u32(bus, base + tss32::EFLAGS, self.eflags);
        put_u32(bus, base + tss32::EAX, self.eax);
        put_u32(bus, base + tss32::ECX, self.ecx);
        put_u32(bus, base + tss32::EDX, self.edx);
        put_u32(bus, base + tss32::EBX, self.ebx);
        put_u32(bus, base + tss32::ESP, self.esp);
        put_u32(bus, base + tss32::EBP, self.ebp);
        put_u32(bus, base + tss32::ESI, self.esi);
        put_u32(bus, base + tss32::EDI, self.edi);
        put_u32(bus, base + tss32::ES, self.es.into());
        put_u32(bus, base + tss32::CS, self.cs.into());
        put_u32(bus, base + tss32::SS, self.ss.into());
        put_u32(bus, base + tss32::DS, self.ds.into());
        put_u32(bus, base + tss32::FS, self.fs.into());
        put_u32(bus, base + tss32::GS, self.gs.into());
        put_u32(bus, base + tss32::LDT, self.ldt.into());
        put_u16(bus, base + tss32::IO_MAP_BASE, self.io_map_base);
    }
}

/// A CPU plus flat memory with a small GDT/IDT already laid out.
pub struct Machine {
    pub cpu: Cpu,
    pub bus: FlatTestBus,
}

impl Machine {
    pub fn real_mode() -> Self {
        Self::real_mode_with(CpuConfig::default())
    }

    pub fn real_mode_with(config: CpuConfig) -> Self {
        init_tracing();
        Self {
            cpu: Cpu::new(config),
            bus: FlatTestBus::new(MEM_SIZE),
        }
    }

    /// Protected mode at CPL 0: CS=CODE0, SS/DS/ES=DATA0, ESP at the ring 0
    /// stack top. No task register yet.
    pub fn protected() -> Self {
        Self::protected_with(CpuConfig::default())
    }

    pub fn protected_with(config: CpuConfig) -> Self {
        let mut m = Self::real_mode_with(config);
        m.install_tables();
        m.cpu.lgdt(GDT_LIMIT, GDT_BASE).unwrap();
        m.cpu.lidt(IDT_LIMIT, IDT_BASE).unwrap();
        m.cpu.write_cr(&mut m.bus, 0, CR0_PE).unwrap();
        m.cpu.state.set_seg(
            SegReg::Cs,
            SegmentRegister {
                selector: CODE0,
                base: 0,
            },
        );
        m.cpu.state.code_big = true;
        for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
            m.cpu.load_segment(&mut m.bus, seg, DATA0).unwrap();
        }
        m.cpu.state.set_esp(RING0_STACK_TOP);
        m
    }

    /// Protected mode with TSS A loaded into the task register.
    pub fn with_task() -> Self {
        let mut m = Self::protected();
        TssImage {
            esp0: RING0_STACK_TOP,
            ss0: DATA0,
            io_map_base: IO_MAP_OFFSET as u16,
            ..TssImage::default()
        }
        .write(&mut m.bus, TSS_A_BASE);
        m.cpu.ltr(&mut m.bus, TSS_A).unwrap();
        m
    }

    fn install_tables(&mut self) {
        let bus = &mut self.bus;
        put_descriptor(bus, GDT_BASE, CODE0, flat(types::CODE_READ, 0));
        put_descriptor(bus, GDT_BASE, DATA0, flat(types::DATA_RW, 0));
        put_descriptor(bus, GDT_BASE, CODE3, flat(types::CODE_READ, 3));
        put_descriptor(bus, GDT_BASE, DATA3, flat(types::DATA_RW, 3));
        put_descriptor(
            bus,
            GDT_BASE,
            TSS_A,
            Descriptor::segment(TSS_A_BASE, TSS_A_LIMIT, types::TSS_386_AVAILABLE, 0, true, false, false),
        );
        put_descriptor(
            bus,
            GDT_BASE,
            TSS_B,
            Descriptor::segment(TSS_B_BASE, TSS_B_LIMIT, types::TSS_386_AVAILABLE, 0, true, false, false),
        );
        put_descriptor(bus, GDT_BASE, CONFORMING0, flat(types::CODE_READ_CONFORMING, 0));
        put_descriptor(
            bus,
            GDT_BASE,
            LDT_SEL,
            Descriptor::segment(LDT_BASE, LDT_LIMIT, types::LDT, 0, true, false, false),
        );
    }

    /// Drop to CPL 3 with CS=CODE3, SS/DS/ES=DATA3 and ESP at the ring 3
    /// stack top.
    pub fn enter_ring3(&mut self) {
        self.cpu.state.cpl = 3;
        self.cpu.state.set_seg(
            SegReg::Cs,
            SegmentRegister {
                selector: CODE3,
                base: 0,
            },
        );
        for seg in [SegReg::Ss, SegReg::Ds, SegReg::Es] {
            self.cpu.load_segment(&mut self.bus, seg, DATA3).unwrap();
        }
        self.cpu.state.set_esp(RING3_STACK_TOP);
    }

    pub fn set_gdt(&mut self, selector: u16, desc: Descriptor) {
        put_descriptor(&mut self.bus, GDT_BASE, selector, desc);
    }

    pub fn gdt(&self, selector: u16) -> Descriptor {
        read_descriptor(&self.bus, GDT_BASE, selector)
    }

    pub fn set_ldt(&mut self, selector: u16, desc: Descriptor) {
        put_descriptor(&mut self.bus, LDT_BASE, selector, desc);
    }

    pub fn set_idt(&mut self, vector: u8, desc: Descriptor) {
        put_descriptor(&mut self.bus, IDT_BASE, u16::from(vector) << 3, desc);
    }

    /// Dword at `ESP + 4 * slot` on the current stack.
    pub fn stack_u32(&self, slot: u32) -> u32 {
        let st = &self.cpu.state;
        let addr = st.seg(SegReg::Ss).base + st.esp() + 4 * slot;
        peek_u32(&self.bus, addr)
    }

    pub fn stack_u16(&self, slot: u32) -> u16 {
        let st = &self.cpu.state;
        let addr = st.seg(SegReg::Ss).base + (st.esp() & 0xffff) + 2 * slot;
        peek_u16(&self.bus, addr)
    }

    pub fn snapshot(&self) -> CpuState {
        self.cpu.state.clone()
    }
}

pub fn assert_fault(res: Result<(), CpuFault>, expected: CpuFault) {
    match res {
        Err(fault) => assert_eq!(fault, expected),
        Ok(()) => panic!("expected {expected}, operation succeeded"),
    }
}
