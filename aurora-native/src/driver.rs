//! Manifest-driven native compilation.
//!
//! Re-parses the textual manifest, discovers functions and frame
//! sizes, lowers the instruction stream, lays out sections, resolves
//! relocations, and hands the final bytes to an image writer.

use std::collections::{HashMap, HashSet};

use aurora_asm::{Directive, Instruction, LabelId, Manifest, Opcode, SharedType};
use tracing::debug;

use crate::error::BuildError;
use crate::image::{elf, pe};
use crate::layout::{self, LabelTable, SectionAddrs, SectionId};
use crate::lower::Emitter;

/// Executable format to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// PE64 with kernel32 imports.
    Windows,
    /// ELF64 with raw syscalls.
    Linux,
}

impl Target {
    /// The build host's native target.
    pub fn host() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Linux
        }
    }

    /// Conventional executable extension.
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Windows => "exe",
            Self::Linux => "",
        }
    }
}

/// End-to-end manifest-to-image compiler.
#[derive(Debug, Clone, Copy)]
pub struct NativeCompiler {
    target: Target,
}

impl NativeCompiler {
    /// A compiler for the given target.
    pub const fn new(target: Target) -> Self {
        Self { target }
    }

    /// The configured target.
    pub const fn target(&self) -> Target {
        self.target
    }

    /// Parses manifest text and compiles it to an executable image.
    pub fn compile_text(&self, text: &str) -> Result<Vec<u8>, BuildError> {
        let manifest = Manifest::parse(text)?;
        self.compile(&manifest)
    }

    /// Compiles a parsed manifest to an executable image.
    pub fn compile(&self, manifest: &Manifest) -> Result<Vec<u8>, BuildError> {
        let sections = classify(manifest);
        let main = manifest
            .find_label("main")
            .ok_or_else(|| BuildError::link("manifest has no `main` label"))?;
        let functions = function_labels(manifest, main);
        let frames = frame_sizes(manifest, &sections, &functions, main);

        let mut emitter = Emitter::new(self.target, LabelTable::from_names(
            manifest.labels().iter().map(String::as_str),
        ));
        for directive in &manifest.directives {
            if let Directive::Shared {
                label,
                ty: SharedType::Float,
                ..
            } = directive
            {
                emitter.shared_float.insert(*label);
            }
        }
        if self.target == Target::Windows {
            emitter.stdout_cell = Some(emitter.labels.add("__stdout"));
            emitter.stdin_cell = Some(emitter.labels.add("__stdin"));
        }

        // Code: entry preamble first, then the lowered stream.
        emitter.emit_entry(main);
        for (idx, directive) in manifest.directives.iter().enumerate() {
            if sections[idx] != SectionId::Text {
                continue;
            }
            match directive {
                Directive::Label(id) => {
                    emitter.bind_here(*id)?;
                    if functions.contains(id) {
                        let frame = frames.get(id).copied().unwrap_or(0);
                        debug!(label = %manifest.label_name(*id).unwrap_or("?"), frame, "function");
                        emitter.emit_prologue(frame);
                    }
                }
                Directive::Instr(instr) => emitter.lower(instr)?,
                Directive::Pad(align) => {
                    while emitter.asm.len() % (*align as usize) != 0 {
                        emitter.asm.nop();
                    }
                }
                _ => unreachable!("classified as text"),
            }
        }

        // Data sections.
        let mut rdata: Vec<u8> = Vec::new();
        let mut data: Vec<u8> = Vec::new();
        for (idx, directive) in manifest.directives.iter().enumerate() {
            let section = sections[idx];
            if section == SectionId::Text {
                continue;
            }
            let buf = match section {
                SectionId::RData => &mut rdata,
                _ => &mut data,
            };
            match directive {
                Directive::Label(id) => {
                    emitter.labels.place(*id, section, buf.len() as u64)?;
                }
                Directive::Ascii(bytes) => buf.extend_from_slice(bytes),
                Directive::Pad(align) => {
                    while buf.len() % (*align as usize) != 0 {
                        buf.push(0);
                    }
                }
                Directive::Shared { label, value, .. } => {
                    while buf.len() % 8 != 0 {
                        buf.push(0);
                    }
                    emitter.labels.place(*label, section, buf.len() as u64)?;
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                Directive::Instr(_) => unreachable!("classified as data"),
            }
        }

        // Backend-internal read-only data (runtime messages).
        for (label, bytes) in std::mem::take(&mut emitter.aux_rdata) {
            emitter.labels.place(label, SectionId::RData, rdata.len() as u64)?;
            rdata.extend_from_slice(&bytes);
        }

        // Cached std handle cells.
        if self.target == Target::Windows {
            for cell in [emitter.stdout_cell, emitter.stdin_cell].into_iter().flatten() {
                while data.len() % 8 != 0 {
                    data.push(0);
                }
                emitter.labels.place(cell, SectionId::Data, data.len() as u64)?;
                data.extend_from_slice(&0u64.to_le_bytes());
            }
        }

        let mut text = emitter.asm.into_bytes();
        debug!(
            text = text.len(),
            rdata = rdata.len(),
            data = data.len(),
            relocs = emitter.relocs.len(),
            "layout"
        );

        match self.target {
            Target::Windows => {
                let import = pe::ImportData::build(&mut rdata, text.len());
                let layout = pe::Layout::compute(text.len(), rdata.len(), data.len());
                let addrs = SectionAddrs {
                    text: layout.image_base + layout.text_rva,
                    rdata: layout.image_base + layout.rdata_rva,
                    data: layout.image_base + layout.data_rva,
                    iat: layout.image_base + layout.rdata_rva + import.iat_offset,
                };
                layout::resolve(&mut text, &emitter.relocs, &emitter.labels, &addrs)?;
                pe::write_image(&layout, &import, &text, &rdata, &data)
            }
            Target::Linux => {
                let layout = elf::Layout::compute(text.len(), rdata.len(), data.len());
                let addrs = SectionAddrs {
                    text: layout.text_va,
                    rdata: layout.rdata_va,
                    data: layout.data_va,
                    iat: 0,
                };
                layout::resolve(&mut text, &emitter.relocs, &emitter.labels, &addrs)?;
                elf::write_image(&layout, &text, &rdata, &data)
            }
        }
    }
}

/// Section of each directive: instructions are text, data directives
/// are rdata/data, and labels/pads belong to whatever content follows
/// them.
fn classify(manifest: &Manifest) -> Vec<SectionId> {
    let mut sections = vec![SectionId::Text; manifest.directives.len()];
    let mut next = SectionId::Text;
    for (idx, directive) in manifest.directives.iter().enumerate().rev() {
        sections[idx] = match directive {
            Directive::Instr(_) => {
                next = SectionId::Text;
                SectionId::Text
            }
            Directive::Ascii(_) => {
                next = SectionId::RData;
                SectionId::RData
            }
            Directive::Shared { .. } => {
                next = SectionId::Data;
                SectionId::Data
            }
            Directive::Label(_) | Directive::Pad(_) => next,
        };
    }
    sections
}

/// `main` plus every `CALL`/`SPAWN` target.
fn function_labels(manifest: &Manifest, main: LabelId) -> HashSet<LabelId> {
    let mut functions = HashSet::from([main]);
    for directive in &manifest.directives {
        if let Directive::Instr(instr) = directive {
            if matches!(instr.opcode(), Opcode::CALL | Opcode::SPAWN) {
                if let Some(target) = instr.label() {
                    functions.insert(target);
                }
            }
        }
    }
    functions
}

/// Frame sizes per function from the slot usage between function
/// labels. Frames are `max(0x58, 0x50 + 8·slots)` rounded to
/// `≡ 8 (mod 16)`; `main` runs frameless into its terminal `HALT`.
fn frame_sizes(
    manifest: &Manifest,
    sections: &[SectionId],
    functions: &HashSet<LabelId>,
    main: LabelId,
) -> HashMap<LabelId, i64> {
    let mut frames = HashMap::new();
    let mut current: Option<LabelId> = None;
    let mut slots: u32 = 0;

    let mut finish = |current: &mut Option<LabelId>, slots: &mut u32, frames: &mut HashMap<LabelId, i64>| {
        if let Some(label) = current.take() {
            let frame = if label == main {
                0
            } else {
                let mut k = 0x50 + 8 * i64::from((*slots).max(1));
                if k % 16 != 8 {
                    k += 8;
                }
                k.max(0x58)
            };
            frames.insert(label, frame);
        }
        *slots = 0;
    };

    for (idx, directive) in manifest.directives.iter().enumerate() {
        if sections[idx] != SectionId::Text {
            continue;
        }
        match directive {
            Directive::Label(id) if functions.contains(id) => {
                finish(&mut current, &mut slots, &mut frames);
                current = Some(*id);
            }
            Directive::Instr(instr) => slots = slots.max(slot_extent(instr)),
            _ => {}
        }
    }
    finish(&mut current, &mut slots, &mut frames);
    frames
}

fn slot_extent(instr: &Instruction) -> u32 {
    match instr.opcode() {
        Opcode::STORE_STACK | Opcode::LOAD_STACK => instr.imm() + 1,
        Opcode::ARRAY_ALLOC => {
            let count = instr.a() as u32 | (instr.b() as u32) << 8;
            instr.imm() + count
        }
        Opcode::ARRAY_STORE | Opcode::ARRAY_LOAD => instr.imm() + 1,
        _ => 0,
    }
}
