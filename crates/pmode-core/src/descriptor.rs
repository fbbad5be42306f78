//! Descriptor and selector value types.
//!
//! A [`Descriptor`] is a decoded copy of one 8-byte table entry. It is only
//! meaningful for the access that fetched it; guests may rewrite table memory
//! at any time, so callers re-fetch instead of holding on to one.

/// Five-bit descriptor type codes (the S bit is bit 4).
pub mod types {
    pub const INVALID: u8 = 0x00;
    pub const TSS_286_AVAILABLE: u8 = 0x01;
    pub const LDT: u8 = 0x02;
    pub const TSS_286_BUSY: u8 = 0x03;
    pub const CALL_GATE_286: u8 = 0x04;
    pub const TASK_GATE: u8 = 0x05;
    pub const INT_GATE_286: u8 = 0x06;
    pub const TRAP_GATE_286: u8 = 0x07;
    pub const TSS_386_AVAILABLE: u8 = 0x09;
    pub const TSS_386_BUSY: u8 = 0x0b;
    pub const CALL_GATE_386: u8 = 0x0c;
    pub const INT_GATE_386: u8 = 0x0e;
    pub const TRAP_GATE_386: u8 = 0x0f;

    pub const DATA_RO: u8 = 0x10;
    pub const DATA_RO_ACCESSED: u8 = 0x11;
    pub const DATA_RW: u8 = 0x12;
    pub const DATA_RW_ACCESSED: u8 = 0x13;
    pub const DATA_RO_EXPAND_DOWN: u8 = 0x14;
    pub const DATA_RO_EXPAND_DOWN_ACCESSED: u8 = 0x15;
    pub const DATA_RW_EXPAND_DOWN: u8 = 0x16;
    pub const DATA_RW_EXPAND_DOWN_ACCESSED: u8 = 0x17;

    pub const CODE_EXEC: u8 = 0x18;
    pub const CODE_EXEC_ACCESSED: u8 = 0x19;
    pub const CODE_READ: u8 = 0x1a;
    pub const CODE_READ_ACCESSED: u8 = 0x1b;
    pub const CODE_EXEC_CONFORMING: u8 = 0x1c;
    pub const CODE_EXEC_CONFORMING_ACCESSED: u8 = 0x1d;
    pub const CODE_READ_CONFORMING: u8 = 0x1e;
    pub const CODE_READ_CONFORMING_ACCESSED: u8 = 0x1f;

    /// TSS busy bit within the type field.
    pub const TSS_BUSY_BIT: u8 = 0x02;
}

/// Broad classification of a descriptor type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Data { writable: bool },
    Code { readable: bool, conforming: bool },
    Tss { is386: bool, busy: bool },
    Ldt,
    CallGate { is386: bool },
    TaskGate,
    InterruptGate { is386: bool },
    TrapGate { is386: bool },
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    lo: u32,
    hi: u32,
}

impl Descriptor {
    pub const fn from_parts(lo: u32, hi: u32) -> Self {
        Self { lo, hi }
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self {
            lo: raw as u32,
            hi: (raw >> 32) as u32,
        }
    }

    pub const fn raw(self) -> u64 {
        (self.lo as u64) | ((self.hi as u64) << 32)
    }

    pub const fn low(self) -> u32 {
        self.lo
    }

    pub const fn high(self) -> u32 {
        self.hi
    }

    /// Encode a code/data/system segment descriptor. `limit` is the raw
    /// 20-bit field; `granular` scales it by 4 KiB.
    pub fn segment(
        base: u32,
        limit: u32,
        desc_type: u8,
        dpl: u8,
        present: bool,
        big: bool,
        granular: bool,
    ) -> Self {
        let lo = (limit & 0xffff) | ((base & 0xffff) << 16);
        let hi = ((base >> 16) & 0xff)
            | (((desc_type & 0x1f) as u32) << 8)
            | (((dpl & 3) as u32) << 13)
            | ((present as u32) << 15)
            | (limit & 0x000f_0000)
            | ((big as u32) << 22)
            | ((granular as u32) << 23)
            | (base & 0xff00_0000);
        Self { lo, hi }
    }

    /// Encode a gate descriptor.
    pub fn gate(
        selector: u16,
        offset: u32,
        desc_type: u8,
        dpl: u8,
        present: bool,
        param_count: u8,
    ) -> Self {
        let lo = (offset & 0xffff) | ((selector as u32) << 16);
        let hi = ((param_count & 0x1f) as u32)
            | (((desc_type & 0x1f) as u32) << 8)
            | (((dpl & 3) as u32) << 13)
            | ((present as u32) << 15)
            | (offset & 0xffff_0000);
        Self { lo, hi }
    }

    pub fn base(self) -> u32 {
        (self.lo >> 16) | ((self.hi & 0xff) << 16) | (self.hi & 0xff00_0000)
    }

    /// Byte limit after granularity scaling.
    pub fn limit(self) -> u32 {
        let raw = (self.lo & 0xffff) | (self.hi & 0x000f_0000);
        if self.granular() {
            (raw << 12) | 0xfff
        } else {
            raw
        }
    }

    pub fn desc_type(self) -> u8 {
        ((self.hi >> 8) & 0x1f) as u8
    }

    pub fn dpl(self) -> u8 {
        ((self.hi >> 13) & 3) as u8
    }

    pub fn present(self) -> bool {
        self.hi & (1 << 15) != 0
    }

    /// D/B bit: 32-bit operand size for code, 32-bit stack for data.
    pub fn big(self) -> bool {
        self.hi & (1 << 22) != 0
    }

    pub fn granular(self) -> bool {
        self.hi & (1 << 23) != 0
    }

    pub fn gate_selector(self) -> u16 {
        (self.lo >> 16) as u16
    }

    pub fn gate_offset(self) -> u32 {
        (self.lo & 0xffff) | (self.hi & 0xffff_0000)
    }

    pub fn param_count(self) -> u8 {
        (self.hi & 0x1f) as u8
    }

    /// Whether a gate or TSS uses the 32-bit shape (type bit 3).
    pub fn is386(self) -> bool {
        self.desc_type() & 0x08 != 0
    }

    pub fn is_busy(self) -> bool {
        self.desc_type() & types::TSS_BUSY_BIT != 0
    }

    pub fn set_busy(&mut self, busy: bool) {
        let bit = (types::TSS_BUSY_BIT as u32) << 8;
        if busy {
            self.hi |= bit;
        } else {
            self.hi &= !bit;
        }
    }

    /// Access-rights dword as reported by `LAR`.
    pub fn access_rights(self) -> u32 {
        self.hi & 0x00ff_ff00
    }

    pub fn kind(self) -> DescriptorKind {
        let t = self.desc_type();
        if t & 0x10 != 0 {
            if t & 0x08 != 0 {
                DescriptorKind::Code {
                    readable: t & 0x02 != 0,
                    conforming: t & 0x04 != 0,
                }
            } else {
                DescriptorKind::Data {
                    writable: t & 0x02 != 0,
                }
            }
        } else {
            match t {
                types::TSS_286_AVAILABLE | types::TSS_286_BUSY => DescriptorKind::Tss {
                    is386: false,
                    busy: t & types::TSS_BUSY_BIT != 0,
                },
                types::TSS_386_AVAILABLE | types::TSS_386_BUSY => DescriptorKind::Tss {
                    is386: true,
                    busy: t & types::TSS_BUSY_BIT != 0,
                },
                types::LDT => DescriptorKind::Ldt,
                types::CALL_GATE_286 => DescriptorKind::CallGate { is386: false },
                types::CALL_GATE_386 => DescriptorKind::CallGate { is386: true },
                types::TASK_GATE => DescriptorKind::TaskGate,
                types::INT_GATE_286 => DescriptorKind::InterruptGate { is386: false },
                types::INT_GATE_386 => DescriptorKind::InterruptGate { is386: true },
                types::TRAP_GATE_286 => DescriptorKind::TrapGate { is386: false },
                types::TRAP_GATE_386 => DescriptorKind::TrapGate { is386: true },
                _ => DescriptorKind::Invalid,
            }
        }
    }

    pub fn is_code(self) -> bool {
        matches!(self.kind(), DescriptorKind::Code { .. })
    }

    pub fn is_conforming_code(self) -> bool {
        matches!(
            self.kind(),
            DescriptorKind::Code {
                conforming: true,
                ..
            }
        )
    }

    pub fn is_data(self) -> bool {
        matches!(self.kind(), DescriptorKind::Data { .. })
    }

    pub fn is_writable_data(self) -> bool {
        matches!(self.kind(), DescriptorKind::Data { writable: true })
    }
}

/// 16-bit segment selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Selector(pub u16);

impl Selector {
    pub const fn index(self) -> u16 {
        self.0 >> 3
    }

    /// Table indicator: set for LDT selectors.
    pub const fn is_ldt(self) -> bool {
        self.0 & 4 != 0
    }

    pub const fn rpl(self) -> u8 {
        (self.0 & 3) as u8
    }

    /// Index 0 in the GDT, whatever the RPL.
    pub const fn is_null(self) -> bool {
        self.0 & 0xfffc == 0
    }

    /// Byte offset of the entry inside its table.
    pub const fn table_offset(self) -> u32 {
        (self.0 & !7) as u32
    }

    /// The selector with RPL cleared, as used in error codes.
    pub const fn error_code(self) -> u32 {
        (self.0 & 0xfffc) as u32
    }

    pub const fn with_rpl(self, rpl: u8) -> Self {
        Self((self.0 & 0xfffc) | (rpl as u16 & 3))
    }
}

impl From<u16> for Selector {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_fields_round_trip_through_encoding() {
        let d = Descriptor::segment(0x1234_5678, 0xabcde, types::CODE_READ, 2, true, true, false);
        assert_eq!(d.base(), 0x1234_5678);
        assert_eq!(d.limit(), 0xabcde);
        assert_eq!(d.desc_type(), types::CODE_READ);
        assert_eq!(d.dpl(), 2);
        assert!(d.present());
        assert!(d.big());
        assert_eq!(
            d.kind(),
            DescriptorKind::Code {
                readable: true,
                conforming: false
            }
        );
    }

    #[test]
    fn granular_limit_scales_by_page() {
        let d = Descriptor::segment(0, 0xfffff, types::DATA_RW, 0, true, true, true);
        assert_eq!(d.limit(), 0xffff_ffff);
        let d = Descriptor::segment(0, 0x1, types::DATA_RW, 0, true, true, true);
        assert_eq!(d.limit(), 0x1fff);
    }

    #[test]
    fn known_flat_descriptor_decodes() {
        // Classic flat ring-0 code segment.
        let d = Descriptor::from_raw(0x00cf_9a00_0000_ffff);
        assert_eq!(d.base(), 0);
        assert_eq!(d.limit(), 0xffff_ffff);
        assert_eq!(d.desc_type(), types::CODE_READ);
        assert!(d.big());
        assert_eq!(d.access_rights(), 0x00cf_9a00);
    }

    #[test]
    fn gate_fields() {
        let g = Descriptor::gate(0x0008, 0xdead_beef, types::CALL_GATE_386, 3, true, 5);
        assert_eq!(g.gate_selector(), 0x0008);
        assert_eq!(g.gate_offset(), 0xdead_beef);
        assert_eq!(g.param_count(), 5);
        assert_eq!(g.dpl(), 3);
        assert!(g.is386());
    }

    #[test]
    fn busy_bit_toggles_tss_type() {
        let mut d = Descriptor::segment(0x1000, 0x67, types::TSS_386_AVAILABLE, 0, true, false, false);
        assert!(!d.is_busy());
        d.set_busy(true);
        assert_eq!(d.desc_type(), types::TSS_386_BUSY);
        d.set_busy(false);
        assert_eq!(d.desc_type(), types::TSS_386_AVAILABLE);
    }

    #[test]
    fn selector_parts() {
        let s = Selector(0x002f);
        assert_eq!(s.index(), 5);
        assert!(s.is_ldt());
        assert_eq!(s.rpl(), 3);
        assert_eq!(s.error_code(), 0x2c);
        assert_eq!(s.table_offset(), 0x28);
        assert!(Selector(3).is_null());
        assert_eq!(Selector(0x10).with_rpl(2).0, 0x12);
    }
}
