use std::fmt;

use crate::config::CpuConfig;
use crate::exception::CpuFault;
use crate::paging::CycleGovernor;
use crate::state::CpuState;
use crate::tss::TssHandle;

/// One logical x86 CPU: architectural state plus the current TSS handle.
///
/// Every public operation either completes or returns `Err` with the register
/// file, segment caches, CPL and stack mode exactly as they were before the
/// call. The one exception is a hardware task switch that has already stored
/// the outgoing task: faults raised after that point (typically while loading
/// the incoming task's segments) are reported in the new task's context.
pub struct Cpu {
    pub state: CpuState,
    pub(crate) tss: TssHandle,
    config: CpuConfig,
    governor: Option<Box<dyn CycleGovernor>>,
    pub(crate) task_switch_committed: bool,
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("state", &self.state)
            .field("tss", &self.tss)
            .field("config", &self.config)
            .field("governor", &self.governor.is_some())
            .finish()
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(CpuConfig::default())
    }
}

impl Cpu {
    pub fn new(config: CpuConfig) -> Self {
        let mut cpu = Self {
            state: CpuState::default(),
            tss: TssHandle::default(),
            config,
            governor: None,
            task_switch_committed: false,
        };
        cpu.reset();
        cpu
    }

    /// Power-on state: real mode, IF set, CR0.ET set, IVT at 0 with limit
    /// 1023, 16-bit stack and an empty task register.
    pub fn reset(&mut self) {
        self.state = CpuState::default();
        self.state.drx[6] = self.config.arch.reset_dr6();
        self.tss = TssHandle::default();
        self.task_switch_committed = false;
    }

    pub fn config(&self) -> CpuConfig {
        self.config
    }

    pub fn set_governor(&mut self, governor: Box<dyn CycleGovernor>) {
        self.governor = Some(governor);
    }

    pub(crate) fn notify_protected_mode(&mut self) {
        if let Some(governor) = self.governor.as_mut() {
            governor.protected_mode_entered();
        }
    }

    pub fn cpl(&self) -> u8 {
        self.state.cpl
    }

    pub fn is_protected_mode(&self) -> bool {
        self.state.pmode
    }

    pub fn tss(&self) -> &TssHandle {
        &self.tss
    }

    /// Run `op`, rolling back the register file and TSS handle if it fails
    /// before a task switch commits.
    pub(crate) fn atomically<B, R>(
        &mut self,
        bus: &mut B,
        op: impl FnOnce(&mut Self, &mut B) -> Result<R, CpuFault>,
    ) -> Result<R, CpuFault> {
        let saved_state = self.state.clone();
        let saved_tss = self.tss;
        self.task_switch_committed = false;

        let res = op(self, bus);
        if res.is_err() && !self.task_switch_committed {
            self.state = saved_state;
            self.tss = saved_tss;
        }
        self.task_switch_committed = false;
        res
    }
}
