//! CPU model selection.
//!
//! The protection model itself is identical across supported models; the
//! model only changes a handful of register masks (toggleable EFLAGS bits,
//! CR0 read-back, CR4 availability and DR6/DR7 reserved bits).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::state::{FLAG_AC, FLAG_ID};

/// Emulated CPU generation, ordered by capability. [`CpuArch::Auto`] compares
/// greater than every concrete model and therefore behaves like the newest one.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum CpuArch {
    I386Slow = 0x30,
    I386Fast = 0x35,
    I486Slow = 0x40,
    I486Prefetch = 0x45,
    PentiumSlow = 0x50,
    #[default]
    Auto = 0xff,
}

impl CpuArch {
    /// EFLAGS bits that flag-loading instructions may change in addition to
    /// the caller's mask.
    pub fn toggleable_flags(self) -> u32 {
        if self >= CpuArch::I486Prefetch {
            FLAG_ID | FLAG_AC
        } else if self >= CpuArch::I486Slow {
            FLAG_AC
        } else {
            0
        }
    }

    /// Value observed by `MOV r32, CR0` for the stored `cr0`.
    pub fn cr0_read_back(self, cr0: u32) -> u32 {
        if self >= CpuArch::PentiumSlow {
            cr0
        } else if self >= CpuArch::I486Slow {
            cr0 & 0xe005_003f
        } else {
            cr0 | 0x7fff_fff0
        }
    }

    pub fn has_cr4(self) -> bool {
        self >= CpuArch::I486Slow
    }

    pub fn dr7_write(self, value: u32) -> u32 {
        if self < CpuArch::PentiumSlow {
            (value | 0x400) & 0xffff_2fff
        } else {
            value | 0x400
        }
    }

    pub fn reset_dr6(self) -> u32 {
        if self == CpuArch::PentiumSlow {
            0xffff_0ff0
        } else {
            0xffff_1ff0
        }
    }

    fn name(self) -> &'static str {
        match self {
            CpuArch::I386Slow => "386_slow",
            CpuArch::I386Fast => "386",
            CpuArch::I486Slow => "486_slow",
            CpuArch::I486Prefetch => "486_prefetch",
            CpuArch::PentiumSlow => "pentium_slow",
            CpuArch::Auto => "auto",
        }
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown cputype {0:?}")]
pub struct ParseCpuArchError(String);

impl FromStr for CpuArch {
    type Err = ParseCpuArchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(CpuArch::Auto),
            "386" | "386_prefetch" => Ok(CpuArch::I386Fast),
            "386_slow" => Ok(CpuArch::I386Slow),
            "486_slow" => Ok(CpuArch::I486Slow),
            "486_prefetch" => Ok(CpuArch::I486Prefetch),
            "pentium_slow" => Ok(CpuArch::PentiumSlow),
            _ => Err(ParseCpuArchError(s.to_string())),
        }
    }
}

/// Construction-time configuration for [`crate::Cpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuConfig {
    /// CPU generation whose register quirks are emulated.
    pub arch: CpuArch,
}

impl CpuConfig {
    pub fn with_arch(arch: CpuArch) -> Self {
        Self { arch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_config_names() {
        assert_eq!("auto".parse::<CpuArch>(), Ok(CpuArch::Auto));
        assert_eq!("386_prefetch".parse::<CpuArch>(), Ok(CpuArch::I386Fast));
        assert_eq!("Pentium_Slow".parse::<CpuArch>(), Ok(CpuArch::PentiumSlow));
        assert!("z80".parse::<CpuArch>().is_err());
    }

    #[test]
    fn auto_behaves_like_newest_model() {
        assert_eq!(CpuArch::Auto.toggleable_flags(), FLAG_ID | FLAG_AC);
        assert_eq!(CpuArch::Auto.cr0_read_back(0x8000_0011), 0x8000_0011);
        assert_eq!(CpuArch::I486Slow.toggleable_flags(), FLAG_AC);
        assert_eq!(CpuArch::I386Fast.toggleable_flags(), 0);
        assert_eq!(CpuArch::I386Fast.cr0_read_back(0x11), 0x7fff_fff1);
        assert!(!CpuArch::I386Slow.has_cr4());
    }
}
