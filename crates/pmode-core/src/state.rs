//! Architectural register file.
//!
//! Everything here is plain data: the protection logic lives in the sibling
//! modules and operates on [`CpuState`] through [`crate::Cpu`].

pub const CR0_PE: u32 = 1 << 0;
/// Extension type bit; always reads back as set (387-class FPU present).
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_PG: u32 = 1 << 31;

pub const FLAG_CF: u32 = 1 << 0;
pub const FLAG_RESERVED1: u32 = 1 << 1;
pub const FLAG_PF: u32 = 1 << 2;
pub const FLAG_AF: u32 = 1 << 4;
pub const FLAG_ZF: u32 = 1 << 6;
pub const FLAG_SF: u32 = 1 << 7;
pub const FLAG_TF: u32 = 1 << 8;
pub const FLAG_IF: u32 = 1 << 9;
pub const FLAG_DF: u32 = 1 << 10;
pub const FLAG_OF: u32 = 1 << 11;
pub const FLAG_IOPL: u32 = 3 << 12;
pub const FLAG_NT: u32 = 1 << 14;
pub const FLAG_VM: u32 = 1 << 17;
pub const FLAG_AC: u32 = 1 << 18;
pub const FLAG_ID: u32 = 1 << 21;

/// Arithmetic status flags.
pub const FMASK_TEST: u32 = FLAG_CF | FLAG_PF | FLAG_AF | FLAG_ZF | FLAG_SF | FLAG_OF;
/// Flags any privilege level may load.
pub const FMASK_NORMAL: u32 = FMASK_TEST | FLAG_DF | FLAG_TF | FLAG_IF;
/// Flags loadable at CPL 0 (VM excluded; it only changes through IRET/task switch).
pub const FMASK_ALL: u32 = FMASK_NORMAL | FLAG_IOPL | FLAG_NT;

/// One 32-bit general purpose register with its narrower views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Reg32(u32);

impl Reg32 {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0 as u16
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self.0 as u8
    }

    /// Bits 8..16 (AH/CH/DH/BH).
    #[inline]
    pub const fn as_u8h(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn set_u32(&mut self, value: u32) {
        self.0 = value;
    }

    pub fn set_u16(&mut self, value: u16) {
        self.0 = (self.0 & 0xffff_0000) | value as u32;
    }

    pub fn set_u8(&mut self, value: u8) {
        self.0 = (self.0 & 0xffff_ff00) | value as u32;
    }

    pub fn set_u8h(&mut self, value: u8) {
        self.0 = (self.0 & 0xffff_00ff) | ((value as u32) << 8);
    }
}

/// General purpose registers in hardware encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];
}

/// Segment registers in hardware encoding order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    /// The registers nulled when returning to an outer privilege level.
    pub const DATA: [SegReg; 4] = [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs];
}

/// Visible selector plus the base derived from the last successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentRegister {
    pub selector: u16,
    pub base: u32,
}

impl SegmentRegister {
    pub fn null() -> Self {
        Self::default()
    }

    /// Real-mode / V86 style value: base is `selector << 4`.
    pub fn real(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
        }
    }
}

/// Stack addressing width. `mask` selects the bits of ESP that move,
/// `notmask` the bits preserved on push/pop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackMode {
    pub mask: u32,
    pub notmask: u32,
    pub big: bool,
}

impl StackMode {
    pub const BITS16: StackMode = StackMode {
        mask: 0x0000_ffff,
        notmask: 0xffff_0000,
        big: false,
    };
    pub const BITS32: StackMode = StackMode {
        mask: 0xffff_ffff,
        notmask: 0,
        big: true,
    };

    pub fn from_big(big: bool) -> Self {
        if big {
            Self::BITS32
        } else {
            Self::BITS16
        }
    }

    /// `esp` moved by `delta` bytes within the active width.
    #[inline]
    pub fn offset(self, esp: u32, delta: i32) -> u32 {
        (esp & self.notmask) | (esp.wrapping_add(delta as u32) & self.mask)
    }
}

impl Default for StackMode {
    fn default() -> Self {
        Self::BITS16
    }
}

/// GDTR / IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTableReg {
    pub base: u32,
    pub limit: u32,
}

/// LDTR: the selector that was loaded plus the table it resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LdtRegister {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuState {
    gprs: [Reg32; 8],
    pub eip: u32,
    eflags: u32,

    segs: [SegmentRegister; 6],
    /// CS default operand size (D bit).
    pub code_big: bool,
    pub stack: StackMode,

    pub cpl: u8,
    /// Privilege used for memory accesses; dropped to 0 while walking
    /// system tables.
    pub mpl: u8,
    pub pmode: bool,

    pub cr0: u32,
    pub cr2: u32,
    pub drx: [u32; 8],
    pub trx: [u32; 8],

    pub gdtr: DescriptorTableReg,
    pub idtr: DescriptorTableReg,
    pub ldtr: LdtRegister,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            gprs: [Reg32::default(); 8],
            eip: 0,
            eflags: FLAG_RESERVED1 | FLAG_IF,
            segs: [SegmentRegister::null(); 6],
            code_big: false,
            stack: StackMode::BITS16,
            cpl: 0,
            mpl: 3,
            pmode: false,
            cr0: CR0_ET,
            cr2: 0,
            drx: [0, 0, 0, 0, 0, 0, 0xffff_1ff0, 0x400],
            trx: [0; 8],
            gdtr: DescriptorTableReg::default(),
            idtr: DescriptorTableReg {
                base: 0,
                limit: 1023,
            },
            ldtr: LdtRegister::default(),
        }
    }
}

impl CpuState {
    pub fn reg(&self, reg: Gpr) -> Reg32 {
        self.gprs[reg as usize]
    }

    pub fn reg_mut(&mut self, reg: Gpr) -> &mut Reg32 {
        &mut self.gprs[reg as usize]
    }

    pub fn gpr32(&self, reg: Gpr) -> u32 {
        self.gprs[reg as usize].as_u32()
    }

    pub fn set_gpr32(&mut self, reg: Gpr, val: u32) {
        self.gprs[reg as usize].set_u32(val);
    }

    pub fn esp(&self) -> u32 {
        self.gpr32(Gpr::Esp)
    }

    pub fn set_esp(&mut self, val: u32) {
        self.set_gpr32(Gpr::Esp, val);
    }

    /// Load ESP from a stack-switch source, respecting the current width:
    /// a 16-bit stack only replaces SP.
    pub fn load_stack_pointer(&mut self, val: u32) {
        if self.stack.big {
            self.set_esp(val);
        } else {
            self.reg_mut(Gpr::Esp).set_u16(val as u16);
        }
    }

    pub fn eflags(&self) -> u32 {
        self.eflags
    }

    /// Raw EFLAGS store; bit 1 always reads as set.
    pub fn set_eflags_raw(&mut self, val: u32) {
        self.eflags = val | FLAG_RESERVED1;
    }

    pub fn flag(&self, bit: u32) -> bool {
        self.eflags & bit != 0
    }

    pub fn set_flag(&mut self, bit: u32, on: bool) {
        if on {
            self.eflags |= bit;
        } else {
            self.eflags &= !bit;
        }
    }

    pub fn iopl(&self) -> u8 {
        ((self.eflags & FLAG_IOPL) >> 12) as u8
    }

    pub fn is_v86(&self) -> bool {
        self.flag(FLAG_VM)
    }

    pub fn seg(&self, seg: SegReg) -> SegmentRegister {
        self.segs[seg as usize]
    }

    pub fn selector(&self, seg: SegReg) -> u16 {
        self.segs[seg as usize].selector
    }

    pub fn set_seg(&mut self, seg: SegReg, value: SegmentRegister) {
        self.segs[seg as usize] = value;
    }

    /// Linear address of the current stack top.
    pub fn stack_top(&self) -> u32 {
        self.seg(SegReg::Ss)
            .base
            .wrapping_add(self.esp() & self.stack.mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg32_views_share_storage() {
        let mut r = Reg32::new(0x1234_5678);
        assert_eq!(r.as_u16(), 0x5678);
        assert_eq!(r.as_u8(), 0x78);
        assert_eq!(r.as_u8h(), 0x56);
        r.set_u8h(0xab);
        assert_eq!(r.as_u32(), 0x1234_ab78);
        r.set_u16(0xffff);
        assert_eq!(r.as_u32(), 0x1234_ffff);
        r.set_u8(0);
        assert_eq!(r.as_u32(), 0x1234_ff00);
    }

    #[test]
    fn sixteen_bit_stack_wraps_inside_sp() {
        let m = StackMode::BITS16;
        assert_eq!(m.offset(0xabcd_0000, -2), 0xabcd_fffe);
        assert_eq!(m.offset(0xabcd_fffe, 4), 0xabcd_0002);
        assert_eq!(StackMode::BITS32.offset(0, -4), 0xffff_fffc);
    }
}
