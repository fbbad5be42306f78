#![forbid(unsafe_code)]

//! x86 protected-mode execution core.
//!
//! Implements the parts of the 386/486 protection model that an instruction
//! decoder delegates rather than executes inline:
//! - segment register loads with descriptor and privilege checks
//! - interrupt and exception delivery through the IVT/IDT, including
//!   inner-level stack switches and task gates
//! - far `JMP`/`CALL`/`RET` (call gates with parameter copying) and `IRET`
//! - hardware task switching through 32-bit TSSs
//! - control/debug/test registers, `LGDT`/`LIDT`/`LLDT`/`LTR` and friends
//!
//! Every operation on [`Cpu`] returns `Result<_, CpuFault>`. A
//! [`CpuFault::Exception`] is a guest-visible fault the caller re-delivers
//! with [`Cpu::deliver_fault`]; a [`CpuFault::Internal`] marks a situation the
//! core deliberately does not model and should end the session. On `Err` the
//! register file is left as it was before the call, except after a task
//! switch has stored the outgoing task.
//!
//! Guest memory and the paging unit are reached through [`CpuBus`] and
//! [`PagingControl`]; [`FlatTestBus`] implements both over a flat buffer.

mod control;
mod far;
mod iret;
mod segment;
mod stack;
mod tables;

pub mod config;
pub mod cpu;
pub mod descriptor;
pub mod exception;
pub mod interrupts;
pub mod mem;
pub mod paging;
pub mod privilege;
pub mod state;
pub mod task;
pub mod tss;

pub use config::{CpuArch, CpuConfig, ParseCpuArchError};
pub use cpu::Cpu;
pub use descriptor::{Descriptor, DescriptorKind, Selector};
pub use exception::{CpuFault, Exception, InternalError};
pub use interrupts::InterruptKind;
pub use mem::{CpuBus, FlatTestBus};
pub use paging::{CpuPlatform, CycleGovernor, NoGovernor, PagingControl};
pub use state::{CpuState, Gpr, Reg32, SegReg};
pub use task::TaskSwitchKind;
pub use tss::TssHandle;
