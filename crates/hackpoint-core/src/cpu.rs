//! Register state captured by the breakpoint entry stub.

use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// General-purpose registers as laid out by `pushfd` after `pushad`,
/// followed by the return address pushed by the redirect call.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuState {
    pub flags: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub retaddr: u32,
}

/// Size of the captured block on the stack
pub const CPU_STATE_SIZE: usize = std::mem::size_of::<CpuState>();

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Register {
    Eax,
    Ecx,
    Edx,
    Ebx,
    Esp,
    Ebp,
    Esi,
    Edi,
}

impl Register {
    /// Parse a register name at the start of `text`.
    ///
    /// The name must not be followed by another identifier character, so
    /// `eaxy` is not a register.
    pub fn parse_prefix(text: &str) -> Option<Self> {
        let name = text.get(..3)?;
        let register = name.parse().ok()?;
        match text.as_bytes().get(3) {
            Some(c) if c.is_ascii_alphanumeric() || *c == b'_' => None,
            _ => Some(register),
        }
    }
}

impl CpuState {
    pub fn get(&self, register: Register) -> u32 {
        match register {
            Register::Eax => self.eax,
            Register::Ecx => self.ecx,
            Register::Edx => self.edx,
            Register::Ebx => self.ebx,
            Register::Esp => self.esp,
            Register::Ebp => self.ebp,
            Register::Esi => self.esi,
            Register::Edi => self.edi,
        }
    }

    pub fn get_mut(&mut self, register: Register) -> &mut u32 {
        match register {
            Register::Eax => &mut self.eax,
            Register::Ecx => &mut self.ecx,
            Register::Edx => &mut self.edx,
            Register::Ebx => &mut self.ebx,
            Register::Esp => &mut self.esp,
            Register::Ebp => &mut self.ebp,
            Register::Esi => &mut self.esi,
            Register::Edi => &mut self.edi,
        }
    }

    pub fn set(&mut self, register: Register, value: u32) {
        *self.get_mut(register) = value;
    }
}
