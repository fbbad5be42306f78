//! Architectural exception vectors and the fault type returned by every
//! protection-checked operation.
//!
//! Guest-visible faults ([`CpuFault::Exception`]) are expected and recovered by
//! the guest's own handlers: the caller re-enters the core through
//! [`crate::Cpu::exception`] with the reported vector and error code.
//! [`CpuFault::Internal`] marks configurations this core deliberately does not
//! model; the enclosing emulator should stop the session with the diagnostic.

use std::fmt;

use thiserror::Error;

use crate::task::TaskSwitchKind;

/// Exception vectors a 386/486 can raise. Vector 15 is reserved and the
/// SIMD/virtualization vectors do not exist on these models.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exception {
    DivideError = 0,
    Debug = 1,
    NonMaskableInterrupt = 2,
    Breakpoint = 3,
    Overflow = 4,
    BoundRangeExceeded = 5,
    InvalidOpcode = 6,
    DeviceNotAvailable = 7,
    DoubleFault = 8,
    CoprocessorSegmentOverrun = 9,
    InvalidTss = 10,
    SegmentNotPresent = 11,
    StackFault = 12,
    GeneralProtection = 13,
    PageFault = 14,
    X87Fpu = 16,
    AlignmentCheck = 17,
    MachineCheck = 18,
}

impl Exception {
    pub const fn vector(self) -> u8 {
        self as u8
    }

    /// `#DF`, `#TS`, `#NP`, `#SS`, `#GP`, `#PF` and `#AC` push an error code.
    pub const fn pushes_error_code(self) -> bool {
        matches!(self.vector(), 8 | 10..=14 | 17)
    }

    pub const fn mnemonic(self) -> &'static str {
        match self {
            Exception::DivideError => "#DE",
            Exception::Debug => "#DB",
            Exception::NonMaskableInterrupt => "NMI",
            Exception::Breakpoint => "#BP",
            Exception::Overflow => "#OF",
            Exception::BoundRangeExceeded => "#BR",
            Exception::InvalidOpcode => "#UD",
            Exception::DeviceNotAvailable => "#NM",
            Exception::DoubleFault => "#DF",
            Exception::CoprocessorSegmentOverrun => "#CSO",
            Exception::InvalidTss => "#TS",
            Exception::SegmentNotPresent => "#NP",
            Exception::StackFault => "#SS",
            Exception::GeneralProtection => "#GP",
            Exception::PageFault => "#PF",
            Exception::X87Fpu => "#MF",
            Exception::AlignmentCheck => "#AC",
            Exception::MachineCheck => "#MC",
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Outcome of a protection-checked operation that did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CpuFault {
    /// A guest-visible exception. The instruction must be aborted and the
    /// vector delivered instead.
    #[error("{exception} exception (error code {error_code:?})")]
    Exception {
        exception: Exception,
        error_code: Option<u32>,
    },

    /// An emulator-fatal condition.
    #[error("internal CPU error: {0}")]
    Internal(#[from] InternalError),
}

impl CpuFault {
    /// Build a guest fault, attaching `code` only for vectors that push one.
    pub fn new(exception: Exception, code: u32) -> Self {
        let error_code = exception.pushes_error_code().then_some(code);
        CpuFault::Exception {
            exception,
            error_code,
        }
    }

    pub fn gp(code: u32) -> Self {
        Self::new(Exception::GeneralProtection, code)
    }

    pub fn gp0() -> Self {
        Self::gp(0)
    }

    pub fn np(code: u32) -> Self {
        Self::new(Exception::SegmentNotPresent, code)
    }

    pub fn ss(code: u32) -> Self {
        Self::new(Exception::StackFault, code)
    }

    pub fn ts(code: u32) -> Self {
        Self::new(Exception::InvalidTss, code)
    }

    pub fn ud() -> Self {
        Self::new(Exception::InvalidOpcode, 0)
    }

    /// The exception vector, or `None` for internal errors.
    pub fn exception(&self) -> Option<Exception> {
        match self {
            CpuFault::Exception { exception, .. } => Some(*exception),
            CpuFault::Internal(_) => None,
        }
    }

    pub fn error_code(&self) -> Option<u32> {
        match self {
            CpuFault::Exception { error_code, .. } => *error_code,
            CpuFault::Internal(_) => None,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, CpuFault::Internal(_))
    }
}

/// Conditions that real hardware either leaves undefined or that no supported
/// guest exercises. These are reported instead of guessing a fault code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InternalError {
    #[error("illegal TSS for switch, selector={selector:#06x}, switch type {kind:?}")]
    IllegalTss { selector: u16, kind: TaskSwitchKind },

    #[error("TSS {selector:#06x} busy for JMP/CALL/INT")]
    TssBusy { selector: u16 },

    #[error("TSS {selector:#06x} not busy for IRET")]
    TssNotBusy { selector: u16 },

    #[error("task IRET while current TSS {selector:#06x} is not busy")]
    CurrentTssNotBusy { selector: u16 },

    #[error("16-bit task switch (TSS selector {selector:#06x})")]
    Task16Bit { selector: u16 },

    #[error("task switch with CS {selector:#06x} beyond limits")]
    TaskCsBeyondLimit { selector: u16 },

    #[error("task switch with non present code segment {selector:#06x}")]
    TaskCsNotPresent { selector: u16 },

    #[error("task CS {selector:#06x} privilege mismatch (RPL {rpl}, DPL {dpl})")]
    TaskCsPrivilege { selector: u16, rpl: u8, dpl: u8 },

    #[error("task switch CS type {desc_type:#x}")]
    TaskCsType { desc_type: u8 },

    #[error("illegal descriptor type {desc_type:#x} for int {vector:#x}")]
    IllegalGate { vector: u8, desc_type: u8 },

    #[error("{op}: selector {selector:#06x} points to illegal descriptor type {desc_type:#x}")]
    IllegalDescriptor {
        op: &'static str,
        selector: u16,
        desc_type: u8,
    },

    #[error("{op}: stack segment {selector:#06x} not writable")]
    StackNotWritable { op: &'static str, selector: u16 },

    #[error("V86 interrupt doesn't change to PL0")]
    V86SameLevelInterrupt,

    #[error("V86 to 16-bit gate")]
    V86To16BitGate,

    #[error("IRET from pmode to V86 with CPL {cpl}")]
    IretToV86FromCpl { cpl: u8 },

    #[error("VM flag in 16-bit IRET")]
    VmFlagIn16BitIret,
}
