use core::fmt;

/// Condition code carried in the `a` operand of a `CJMP`.
///
/// The code generator emits the *negated* condition toward else/exit
/// labels; the backend maps the code onto signed or unsigned x86 jumps
/// depending on whether the preceding compare was integer or float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
pub enum Cond {
    /// Equal.
    Eq = 0x00,
    /// Not equal.
    Ne = 0x01,
    /// Less than.
    Lt = 0x02,
    /// Less than or equal.
    Le = 0x03,
    /// Greater than.
    Gt = 0x04,
    /// Greater than or equal.
    Ge = 0x05,
}

impl Cond {
    /// The condition that holds exactly when `self` does not.
    pub const fn negate(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Lt => Self::Ge,
            Self::Le => Self::Gt,
            Self::Gt => Self::Le,
            Self::Ge => Self::Lt,
        }
    }

    /// The condition with its operands swapped (`a < b` ⇔ `b > a`).
    pub const fn swap(self) -> Self {
        match self {
            Self::Eq => Self::Eq,
            Self::Ne => Self::Ne,
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
        }
    }

    /// Mnemonic suffix, as printed in manifest comments.
    pub const fn mnemonic(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
        }
    }
}

impl TryFrom<u8> for Cond {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0x00 => Ok(Self::Eq),
            0x01 => Ok(Self::Ne),
            0x02 => Ok(Self::Lt),
            0x03 => Ok(Self::Le),
            0x04 => Ok(Self::Gt),
            0x05 => Ok(Self::Ge),
            _ => Err(byte),
        }
    }
}

impl fmt::Display for Cond {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}
