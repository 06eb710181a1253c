//! Register identities and textual alias tables.

use std::fmt;

/// Operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Size {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Size {
    pub fn bytes(self) -> u32 {
        match self {
            Size::Byte => 1,
            Size::Word => 2,
            Size::Dword => 4,
            Size::Qword => 8,
        }
    }

    /// The width used for a scalar of `bytes` bytes.
    pub fn for_bytes(bytes: u32) -> Size {
        match bytes {
            1 => Size::Byte,
            2 => Size::Word,
            4 => Size::Dword,
            _ => Size::Qword,
        }
    }

    /// AT&T mnemonic suffix.
    pub fn suffix(self) -> char {
        match self {
            Size::Byte => 'b',
            Size::Word => 'w',
            Size::Dword => 'l',
            Size::Qword => 'q',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegClass {
    Gp,
    Xmm,
    Ymm,
}

/// A machine register. General-purpose registers carry their access width;
/// `high` marks the legacy AH/CH/DH/BH byte halves (encoded as ids 4-7
/// and incompatible with a REX prefix).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Reg {
    pub class: RegClass,
    pub id: u8,
    pub size: Size,
    pub high: bool,
}

static GP64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
static GP32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
static GP16: [&str; 16] = [
    "ax", "cx", "dx", "bx", "sp", "bp", "si", "di", "r8w", "r9w", "r10w", "r11w", "r12w", "r13w",
    "r14w", "r15w",
];
static GP8: [&str; 16] = [
    "al", "cl", "dl", "bl", "spl", "bpl", "sil", "dil", "r8b", "r9b", "r10b", "r11b", "r12b",
    "r13b", "r14b", "r15b",
];
static GP8H: [&str; 4] = ["ah", "ch", "dh", "bh"];

impl Reg {
    pub const fn gp(id: u8, size: Size) -> Reg {
        Reg {
            class: RegClass::Gp,
            id,
            size,
            high: false,
        }
    }

    /// AH/CH/DH/BH; `id` is the underlying 0-3 register.
    pub const fn gp_high(id: u8) -> Reg {
        Reg {
            class: RegClass::Gp,
            id,
            size: Size::Byte,
            high: true,
        }
    }

    pub const fn xmm(id: u8) -> Reg {
        Reg {
            class: RegClass::Xmm,
            id,
            size: Size::Qword,
            high: false,
        }
    }

    pub const fn ymm(id: u8) -> Reg {
        Reg {
            class: RegClass::Ymm,
            id,
            size: Size::Qword,
            high: false,
        }
    }

    /// The same register at a different access width.
    pub fn with_size(self, size: Size) -> Reg {
        debug_assert_eq!(self.class, RegClass::Gp);
        Reg {
            size,
            high: false,
            ..self
        }
    }

    pub fn is_gp(self) -> bool {
        self.class == RegClass::Gp
    }

    /// Value used in ModR/M / SIB / opcode register fields.
    pub fn enc(self) -> u8 {
        if self.high {
            self.id + 4
        } else {
            self.id
        }
    }

    /// True for the ids that require a REX.R/X/B extension bit.
    pub fn needs_ext(self) -> bool {
        self.id >= 8
    }

    /// SPL/BPL/SIL/DIL need a REX prefix (even an empty 0x40 one) to be
    /// addressable as bytes.
    pub fn byte_needs_rex(self) -> bool {
        self.class == RegClass::Gp
            && self.size == Size::Byte
            && !self.high
            && (4..=7).contains(&self.id)
    }

    /// Parse a textual register name in any alias table.
    pub fn parse(name: &str) -> Option<Reg> {
        if let Some(id) = GP64.iter().position(|&n| n == name) {
            return Some(Reg::gp(id as u8, Size::Qword));
        }
        if let Some(id) = GP32.iter().position(|&n| n == name) {
            return Some(Reg::gp(id as u8, Size::Dword));
        }
        if let Some(id) = GP16.iter().position(|&n| n == name) {
            return Some(Reg::gp(id as u8, Size::Word));
        }
        if let Some(id) = GP8.iter().position(|&n| n == name) {
            return Some(Reg::gp(id as u8, Size::Byte));
        }
        if let Some(id) = GP8H.iter().position(|&n| n == name) {
            return Some(Reg::gp_high(id as u8));
        }
        if let Some(rest) = name.strip_prefix("xmm") {
            if let Ok(id) = rest.parse::<u8>() {
                if id < 16 {
                    return Some(Reg::xmm(id));
                }
            }
        }
        if let Some(rest) = name.strip_prefix("ymm") {
            if let Ok(id) = rest.parse::<u8>() {
                if id < 16 {
                    return Some(Reg::ymm(id));
                }
            }
        }
        None
    }

    pub fn name(self) -> String {
        match self.class {
            RegClass::Xmm => format!("xmm{}", self.id),
            RegClass::Ymm => format!("ymm{}", self.id),
            RegClass::Gp => {
                if self.high {
                    GP8H[self.id as usize].to_string()
                } else {
                    let table = match self.size {
                        Size::Byte => &GP8,
                        Size::Word => &GP16,
                        Size::Dword => &GP32,
                        Size::Qword => &GP64,
                    };
                    table[self.id as usize].to_string()
                }
            }
        }
    }
}

impl fmt::Debug for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name())
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name())
    }
}

/// Common register constants.
pub mod regs {
    use super::{Reg, Size};

    pub const RAX: Reg = Reg::gp(0, Size::Qword);
    pub const RCX: Reg = Reg::gp(1, Size::Qword);
    pub const RDX: Reg = Reg::gp(2, Size::Qword);
    pub const RBX: Reg = Reg::gp(3, Size::Qword);
    pub const RSP: Reg = Reg::gp(4, Size::Qword);
    pub const RBP: Reg = Reg::gp(5, Size::Qword);
    pub const RSI: Reg = Reg::gp(6, Size::Qword);
    pub const RDI: Reg = Reg::gp(7, Size::Qword);
    pub const R8: Reg = Reg::gp(8, Size::Qword);
    pub const R9: Reg = Reg::gp(9, Size::Qword);
    pub const R10: Reg = Reg::gp(10, Size::Qword);
    pub const R11: Reg = Reg::gp(11, Size::Qword);
    pub const R12: Reg = Reg::gp(12, Size::Qword);
    pub const R13: Reg = Reg::gp(13, Size::Qword);
    pub const R14: Reg = Reg::gp(14, Size::Qword);
    pub const R15: Reg = Reg::gp(15, Size::Qword);

    pub const EAX: Reg = Reg::gp(0, Size::Dword);
    pub const ECX: Reg = Reg::gp(1, Size::Dword);
    pub const EDX: Reg = Reg::gp(2, Size::Dword);
    pub const EBX: Reg = Reg::gp(3, Size::Dword);
    pub const ESP: Reg = Reg::gp(4, Size::Dword);
    pub const EBP: Reg = Reg::gp(5, Size::Dword);
    pub const ESI: Reg = Reg::gp(6, Size::Dword);
    pub const EDI: Reg = Reg::gp(7, Size::Dword);

    pub const AL: Reg = Reg::gp(0, Size::Byte);
    pub const CL: Reg = Reg::gp(1, Size::Byte);

    pub const XMM0: Reg = Reg::xmm(0);
    pub const XMM1: Reg = Reg::xmm(1);
    pub const XMM2: Reg = Reg::xmm(2);
    pub const XMM3: Reg = Reg::xmm(3);
    pub const YMM0: Reg = Reg::ymm(0);
    pub const YMM1: Reg = Reg::ymm(1);
}

#[cfg(test)]
mod tests {
    use super::regs::*;
    use super::*;

    #[test]
    fn alias_tables() {
        assert_eq!(Reg::parse("rax"), Some(RAX));
        assert_eq!(Reg::parse("eax"), Some(EAX));
        assert_eq!(Reg::parse("r13"), Some(R13));
        assert_eq!(Reg::parse("sil"), Some(Reg::gp(6, Size::Byte)));
        assert_eq!(Reg::parse("ah"), Some(Reg::gp_high(0)));
        assert_eq!(Reg::parse("xmm15"), Some(Reg::xmm(15)));
        assert_eq!(Reg::parse("ymm3"), Some(Reg::ymm(3)));
        assert_eq!(Reg::parse("zmm0"), None);
    }

    #[test]
    fn high_byte_encoding() {
        assert_eq!(Reg::parse("ah").unwrap().enc(), 4);
        assert_eq!(Reg::parse("bh").unwrap().enc(), 7);
        assert!(Reg::parse("spl").unwrap().byte_needs_rex());
        assert!(!Reg::parse("ah").unwrap().byte_needs_rex());
    }

    #[test]
    fn resizing() {
        assert_eq!(RAX.with_size(Size::Dword), EAX);
        assert_eq!(RAX.with_size(Size::Dword).name(), "eax");
        assert_eq!(R8.with_size(Size::Byte).name(), "r8b");
    }
}
