//! Labels, sections, and relocation records.
//!
//! Labels live in a flat table indexed by id (the manifest's
//! definition-order ids, extended with backend-internal labels) and
//! carry absolute section offsets once placed. Relocations are deferred
//! patches into `.text`, resolved in a single fix-up pass once section
//! addresses are final.

use aurora_asm::LabelId;

use crate::error::BuildError;

/// Which section a label's offset refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    /// Executable code.
    Text,
    /// Read-only data (strings, runtime messages, import machinery).
    RData,
    /// Writable data (shared cells, cached std handles).
    Data,
}

/// A label with its eventual place.
#[derive(Debug, Clone)]
pub struct LabelDef {
    /// Label name, unique per image.
    pub name: String,
    /// Section and offset once placed.
    pub place: Option<(SectionId, u64)>,
}

/// Flat label table.
#[derive(Debug, Default)]
pub struct LabelTable {
    entries: Vec<LabelDef>,
}

impl LabelTable {
    /// A table seeded with the manifest's label names, in id order.
    pub fn from_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            entries: names
                .into_iter()
                .map(|name| LabelDef {
                    name: name.to_owned(),
                    place: None,
                })
                .collect(),
        }
    }

    /// Appends a backend-internal label, returning its id.
    pub fn add(&mut self, name: impl Into<String>) -> LabelId {
        let id = self.entries.len() as LabelId;
        self.entries.push(LabelDef {
            name: name.into(),
            place: None,
        });
        id
    }

    /// Binds a label to a section offset.
    pub fn place(&mut self, id: LabelId, section: SectionId, offset: u64) -> Result<(), BuildError> {
        let entry = self
            .entries
            .get_mut(id as usize)
            .ok_or_else(|| BuildError::link(format!("label id {id} out of range")))?;
        if entry.place.is_some() {
            return Err(BuildError::link(format!(
                "label `{}` defined twice",
                entry.name
            )));
        }
        entry.place = Some((section, offset));
        Ok(())
    }

    /// The placed location of a label.
    pub fn resolve(&self, id: LabelId) -> Result<(SectionId, u64), BuildError> {
        let entry = self
            .entries
            .get(id as usize)
            .ok_or_else(|| BuildError::link(format!("label id {id} out of range")))?;
        entry
            .place
            .ok_or_else(|| BuildError::link(format!("label `{}` never defined", entry.name)))
    }

    /// Name of a label.
    pub fn name(&self, id: LabelId) -> Option<&str> {
        self.entries.get(id as usize).map(|e| e.name.as_str())
    }

    /// Finds a label by name.
    pub fn find(&self, name: &str) -> Option<LabelId> {
        self.entries
            .iter()
            .position(|e| e.name == name)
            .map(|i| i as LabelId)
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The eight `kernel32.dll` imports of a Windows image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
#[allow(missing_docs)]
pub enum ImportSymbol {
    ExitProcess = 0,
    GetStdHandle = 1,
    WriteFile = 2,
    ReadFile = 3,
    ReadConsoleA = 4,
    CreateThread = 5,
    WaitForSingleObject = 6,
    CloseHandle = 7,
}

impl ImportSymbol {
    /// All imports in IAT order.
    pub const ALL: [ImportSymbol; 8] = [
        Self::ExitProcess,
        Self::GetStdHandle,
        Self::WriteFile,
        Self::ReadFile,
        Self::ReadConsoleA,
        Self::CreateThread,
        Self::WaitForSingleObject,
        Self::CloseHandle,
    ];

    /// The exported name in `kernel32.dll`.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ExitProcess => "ExitProcess",
            Self::GetStdHandle => "GetStdHandle",
            Self::WriteFile => "WriteFile",
            Self::ReadFile => "ReadFile",
            Self::ReadConsoleA => "ReadConsoleA",
            Self::CreateThread => "CreateThread",
            Self::WaitForSingleObject => "WaitForSingleObject",
            Self::CloseHandle => "CloseHandle",
        }
    }

    /// Index into the IAT.
    pub const fn index(&self) -> usize {
        *self as usize
    }
}

/// A deferred patch into the text section.
#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    /// Offset of the patch field within `.text`.
    pub at: u64,
    /// What gets written there.
    pub kind: RelocKind,
}

/// Relocation kinds.
#[derive(Debug, Clone, Copy)]
pub enum RelocKind {
    /// 32-bit displacement to a code label, relative to the end of the
    /// field.
    Rel32(LabelId),
    /// 32-bit RIP-relative displacement to a data label.
    Rel32Data(LabelId),
    /// 64-bit absolute virtual address of a data label.
    Abs64Data(LabelId),
    /// 32-bit displacement to an IAT slot.
    Rel32Iat(ImportSymbol),
}

/// Final section addresses, for relocation resolution.
#[derive(Debug, Clone, Copy)]
pub struct SectionAddrs {
    /// VA of `.text`.
    pub text: u64,
    /// VA of `.rdata`.
    pub rdata: u64,
    /// VA of `.data`.
    pub data: u64,
    /// VA of the IAT (8-byte slots in [`ImportSymbol`] order); zero on
    /// targets without imports.
    pub iat: u64,
}

impl SectionAddrs {
    /// Absolute virtual address of a placed label.
    pub fn va_of(&self, section: SectionId, offset: u64) -> u64 {
        let base = match section {
            SectionId::Text => self.text,
            SectionId::RData => self.rdata,
            SectionId::Data => self.data,
        };
        base + offset
    }
}

/// Patches every relocation into `text`.
pub fn resolve(
    text: &mut [u8],
    relocs: &[Reloc],
    labels: &LabelTable,
    addrs: &SectionAddrs,
) -> Result<(), BuildError> {
    for reloc in relocs {
        let at = reloc.at as usize;
        match reloc.kind {
            RelocKind::Rel32(label) | RelocKind::Rel32Data(label) => {
                let (section, offset) = labels.resolve(label)?;
                let target = addrs.va_of(section, offset);
                let source = addrs.text + reloc.at + 4;
                let disp = target.wrapping_sub(source) as i64;
                let disp = i32::try_from(disp as i64).map_err(|_| {
                    BuildError::link(format!(
                        "label `{}` out of rel32 range",
                        labels.name(label).unwrap_or("?")
                    ))
                })?;
                text[at..at + 4].copy_from_slice(&disp.to_le_bytes());
            }
            RelocKind::Abs64Data(label) => {
                let (section, offset) = labels.resolve(label)?;
                let target = addrs.va_of(section, offset);
                text[at..at + 8].copy_from_slice(&target.to_le_bytes());
            }
            RelocKind::Rel32Iat(symbol) => {
                let target = addrs.iat + 8 * symbol.index() as u64;
                let source = addrs.text + reloc.at + 4;
                let disp = i32::try_from(target.wrapping_sub(source) as i64).map_err(|_| {
                    BuildError::link(format!("import `{}` out of rel32 range", symbol.name()))
                })?;
                text[at..at + 4].copy_from_slice(&disp.to_le_bytes());
            }
        }
    }
    Ok(())
}
