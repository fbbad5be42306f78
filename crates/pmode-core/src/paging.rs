//! Paging-unit and scheduler collaborators.
//!
//! The core does not translate addresses itself; it only tells the paging unit
//! when CR0.PG or CR3 change.

use crate::mem::CpuBus;

/// Control surface of the paging unit.
pub trait PagingControl {
    /// Reload the page directory base (CR3).
    fn set_directory_base(&mut self, value: u32);

    fn directory_base(&self) -> u32;

    fn set_paging_enabled(&mut self, enabled: bool);
}

/// Everything the core needs from the surrounding machine.
pub trait CpuPlatform: CpuBus + PagingControl {}

impl<T: CpuBus + PagingControl> CpuPlatform for T {}

/// Notified when the guest enters protected mode.
///
/// Used by hosts to switch execution cores or cycle budgets; never queried.
pub trait CycleGovernor {
    fn protected_mode_entered(&mut self);
}

/// Governor that ignores notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGovernor;

impl CycleGovernor for NoGovernor {
    fn protected_mode_entered(&mut self) {}
}
