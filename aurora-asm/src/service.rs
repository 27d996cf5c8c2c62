use core::fmt;

/// Runtime service selected by the immediate of an `SVC` instruction.
///
/// Services take their argument in `r0` (floats in `xmm6`) and are
/// expanded inline by the native backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[repr(u8)]
pub enum ServiceCode {
    /// Writes the NUL-terminated string whose address is in `r0`.
    PrintString = 0x01,
    /// Terminates the process with the exit code in `r0`.
    Exit = 0x02,
    /// Prints the exit code, waits for Enter, then exits.
    Pause = 0x03,
    /// Waits for Enter, then exits with the code in `r0`.
    PauseSilent = 0x04,
    /// Writes the signed decimal rendering of `r0` and a newline.
    PrintInt = 0x05,
    /// Reads a signed decimal integer from standard input into `r0`.
    InputInt = 0x06,
    /// Writes `xmm6` with nine fractional digits and a newline.
    PrintFloat = 0x07,
}

impl ServiceCode {
    /// Service name, as printed in manifest comments.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::PrintString => "print_string",
            Self::Exit => "exit",
            Self::Pause => "pause",
            Self::PauseSilent => "pause_silent",
            Self::PrintInt => "print_int",
            Self::InputInt => "input_int",
            Self::PrintFloat => "print_float",
        }
    }
}

impl TryFrom<u8> for ServiceCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0x01 => Ok(Self::PrintString),
            0x02 => Ok(Self::Exit),
            0x03 => Ok(Self::Pause),
            0x04 => Ok(Self::PauseSilent),
            0x05 => Ok(Self::PrintInt),
            0x06 => Ok(Self::InputInt),
            0x07 => Ok(Self::PrintFloat),
            _ => Err(byte),
        }
    }
}

impl fmt::Display for ServiceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
