//! Privilege predicates shared by segment loads, gates and far transfers.
//!
//! All functions are pure: they look at CPL/RPL and the descriptor only.
//! Presence is checked separately by callers because it maps to a different
//! exception (#NP / #SS) than the privilege violation (#GP / #TS).

use crate::descriptor::{Descriptor, DescriptorKind};

/// DS/ES/FS/GS load.
///
/// Data segments and readable non-conforming code need
/// `max(CPL, RPL) <= DPL`. Readable conforming code is always accessible.
/// Everything else (execute-only code, system descriptors) is refused.
pub fn data_segment_loadable(cpl: u8, rpl: u8, desc: &Descriptor) -> bool {
    match desc.kind() {
        DescriptorKind::Data { .. }
        | DescriptorKind::Code {
            readable: true,
            conforming: false,
        } => cpl.max(rpl) <= desc.dpl(),
        DescriptorKind::Code {
            readable: true,
            conforming: true,
        } => true,
        _ => false,
    }
}

/// SS load: a writable data segment with `RPL == CPL == DPL`.
pub fn stack_segment_loadable(cpl: u8, rpl: u8, desc: &Descriptor) -> bool {
    desc.is_writable_data() && rpl == cpl && desc.dpl() == cpl
}

/// Stack selected during a privilege change: its RPL and DPL must both equal
/// the new privilege level.
pub fn stack_matches_level(ss_rpl: u8, desc: &Descriptor, level: u8) -> bool {
    ss_rpl == level && desc.dpl() == level
}

/// Direct far JMP/CALL to a code segment (no gate).
///
/// Non-conforming targets need `RPL <= CPL` and `DPL == CPL`; conforming
/// targets need `DPL <= CPL` and execution stays at the caller's CPL.
/// Returns `false` for non-code descriptors.
pub fn direct_transfer_allowed(cpl: u8, rpl: u8, desc: &Descriptor) -> bool {
    match desc.kind() {
        DescriptorKind::Code {
            conforming: false, ..
        } => rpl <= cpl && desc.dpl() == cpl,
        DescriptorKind::Code {
            conforming: true, ..
        } => desc.dpl() <= cpl,
        _ => false,
    }
}

/// Code segment reached by a far RET or IRET at privilege `rpl`.
///
/// Non-conforming targets need `DPL == RPL`, conforming targets `DPL <= RPL`.
pub fn return_target_allowed(rpl: u8, desc: &Descriptor) -> bool {
    match desc.kind() {
        DescriptorKind::Code {
            conforming: false, ..
        } => desc.dpl() == rpl,
        DescriptorKind::Code {
            conforming: true, ..
        } => desc.dpl() <= rpl,
        _ => false,
    }
}

/// A gate (or TSS selector) named by a far CALL/JMP or software INT is
/// usable when `DPL >= max(CPL, RPL)`.
pub fn gate_accessible(cpl: u8, rpl: u8, gate_dpl: u8) -> bool {
    gate_dpl >= cpl && gate_dpl >= rpl
}

/// Whether a transfer through a gate into `target` raises the privilege
/// level (and therefore switches stacks).
pub fn is_inner_level(cpl: u8, target: &Descriptor) -> bool {
    !target.is_conforming_code() && target.dpl() < cpl
}

/// Segments that must be nulled after returning to an outer level: data and
/// non-conforming code whose DPL is now numerically below CPL.
pub fn invalid_after_return(cpl: u8, desc: &Descriptor) -> bool {
    match desc.kind() {
        DescriptorKind::Data { .. }
        | DescriptorKind::Code {
            conforming: false, ..
        } => cpl > desc.dpl(),
        _ => false,
    }
}

/// I/O instructions and CLI/STI need the IOPL check in protected mode.
pub fn io_privileged(cpl: u8, iopl: u8) -> bool {
    iopl >= cpl
}
