//! Target and compilation-option flags.
//!
//! The target selects the object file format, the calling convention, and
//! the default encoder bitness; the options carry the optimization level
//! and the orthogonal debug/PGO switches.

use target_lexicon::{Architecture, OperatingSystem, Triple};

use crate::encoder::Reg;
use crate::error::CodegenError;

/// A compilation target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// ELF object, SysV AMD64 calling convention.
    LinuxX64,
    /// COFF object, Windows x64 calling convention.
    WindowsX64,
    /// COFF object, 32-bit cdecl with all arguments on the stack.
    DosX86,
}

/// Object file machine identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Machine {
    I386,
    Amd64,
}

impl Machine {
    /// The COFF `Machine` field value.
    pub fn coff_machine(self) -> u16 {
        match self {
            Machine::I386 => 0x014c,
            Machine::Amd64 => 0x8664,
        }
    }
}

impl Target {
    /// Derive a target from a `target_lexicon` triple.
    pub fn from_triple(triple: &Triple) -> Result<Self, CodegenError> {
        match (triple.architecture, triple.operating_system) {
            (Architecture::X86_64, OperatingSystem::Linux) => Ok(Target::LinuxX64),
            (Architecture::X86_64, OperatingSystem::Windows) => Ok(Target::WindowsX64),
            (Architecture::X86_32(_), _) => Ok(Target::DosX86),
            _ => Err(CodegenError::Unsupported {
                what: format!("target triple {}", triple),
                line: 0,
            }),
        }
    }

    pub fn machine(self) -> Machine {
        match self {
            Target::DosX86 => Machine::I386,
            _ => Machine::Amd64,
        }
    }

    pub fn is_64(self) -> bool {
        self.machine() == Machine::Amd64
    }

    /// Object format: true for ELF, false for COFF.
    pub fn is_elf(self) -> bool {
        self == Target::LinuxX64
    }

    /// Stack slot size in bytes.
    pub fn slot_size(self) -> u32 {
        if self.is_64() {
            8
        } else {
            4
        }
    }

    /// Caller-reserved shadow space below the call, in bytes.
    pub fn shadow_space(self) -> u32 {
        match self {
            Target::WindowsX64 => 32,
            _ => 0,
        }
    }

    /// Integer argument registers, in call order.
    pub fn int_arg_regs(self) -> &'static [Reg] {
        use crate::encoder::regs::*;
        match self {
            Target::WindowsX64 => &[RCX, RDX, R8, R9],
            Target::LinuxX64 => &[RDI, RSI, RDX, RCX, R8, R9],
            Target::DosX86 => &[],
        }
    }

    /// Number of XMM argument registers (`xmm0..xmmN`), in call order.
    pub fn float_arg_count(self) -> usize {
        match self {
            Target::WindowsX64 => 4,
            Target::LinuxX64 => 8,
            Target::DosX86 => 0,
        }
    }

    /// Callee-saved registers available for local-variable promotion.
    pub fn callee_saved_pool(self) -> &'static [Reg] {
        use crate::encoder::regs::*;
        match self {
            Target::DosX86 => &[RBX, RSI, RDI],
            _ => &[RBX, R12, R13],
        }
    }
}

/// Optimization level as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    O0,
    #[default]
    O1,
    O2,
    O3,
    Os,
    Og,
}

impl OptLevel {
    /// The level used for optimization gating. `Os` gates like `O2`,
    /// `Og` like `O1`.
    pub fn gate(self) -> u8 {
        match self {
            OptLevel::O0 => 0,
            OptLevel::O1 | OptLevel::Og => 1,
            OptLevel::O2 | OptLevel::Os => 2,
            OptLevel::O3 => 3,
        }
    }

    pub fn prefer_size(self) -> bool {
        self == OptLevel::Os
    }

    pub fn preserve_debug(self) -> bool {
        self == OptLevel::Og
    }
}

/// Per-compilation options, orthogonal to the target.
#[derive(Debug, Clone, Default)]
pub struct CompileOpts {
    pub opt: OptLevel,
    pub debug_info: bool,
    pub pgo_generate: bool,
    pub source_file: String,
    pub comp_dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn triple_selection() {
        let t = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        assert_eq!(Target::from_triple(&t).unwrap(), Target::LinuxX64);
        let t = Triple::from_str("x86_64-pc-windows-msvc").unwrap();
        assert_eq!(Target::from_triple(&t).unwrap(), Target::WindowsX64);
    }

    #[test]
    fn gates() {
        assert_eq!(OptLevel::Os.gate(), 2);
        assert!(OptLevel::Os.prefer_size());
        assert_eq!(OptLevel::Og.gate(), 1);
        assert!(OptLevel::Og.preserve_debug());
    }

    #[test]
    fn abi_tables() {
        assert_eq!(Target::WindowsX64.int_arg_regs().len(), 4);
        assert_eq!(Target::LinuxX64.int_arg_regs().len(), 6);
        assert_eq!(Target::WindowsX64.shadow_space(), 32);
        assert_eq!(Target::DosX86.slot_size(), 4);
    }
}
