//! ELF64 image writer.
//!
//! A single `PT_LOAD` segment maps the whole file at a fixed base;
//! code, read-only data, and writable data follow the headers in that
//! order. Services are raw syscalls, so no dynamic linking machinery
//! is present.

use byteorder::{LittleEndian as LE, WriteBytesExt};

use crate::error::BuildError;
use crate::image::align_up;

const BASE_VA: u64 = 0x40_0000;
const EHDR_SIZE: u64 = 64;
const PHDR_SIZE: u64 = 56;

/// Virtual addresses of a laid-out image.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Entry point (start of the text region).
    pub entry: u64,
    /// VA of the code.
    pub text_va: u64,
    /// VA of the read-only data.
    pub rdata_va: u64,
    /// VA of the writable data.
    pub data_va: u64,
}

impl Layout {
    /// Computes region addresses from final region sizes.
    pub fn compute(text: usize, rdata: usize, _data: usize) -> Self {
        let text_va = BASE_VA + EHDR_SIZE + PHDR_SIZE;
        let rdata_va = align_up(text_va + text as u64, 8);
        let data_va = align_up(rdata_va + rdata as u64, 8);
        Self {
            entry: text_va,
            text_va,
            rdata_va,
            data_va,
        }
    }
}

/// Assembles the final ELF64 file.
pub fn write_image(
    layout: &Layout,
    text: &[u8],
    rdata: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, BuildError> {
    let file_size = layout.data_va - BASE_VA + data.len() as u64;
    let mut out = Vec::with_capacity(file_size as usize);

    // ELF header.
    out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.resize(16, 0);
    out.write_u16::<LE>(2)?; // ET_EXEC
    out.write_u16::<LE>(0x3e)?; // EM_X86_64
    out.write_u32::<LE>(1)?; // EV_CURRENT
    out.write_u64::<LE>(layout.entry)?;
    out.write_u64::<LE>(EHDR_SIZE)?; // program header offset
    out.write_u64::<LE>(0)?; // no section headers
    out.write_u32::<LE>(0)?; // flags
    out.write_u16::<LE>(EHDR_SIZE as u16)?;
    out.write_u16::<LE>(PHDR_SIZE as u16)?;
    out.write_u16::<LE>(1)?; // one program header
    out.write_u16::<LE>(0)?;
    out.write_u16::<LE>(0)?;
    out.write_u16::<LE>(0)?;

    // The single PT_LOAD covering text and data.
    out.write_u32::<LE>(1)?; // PT_LOAD
    out.write_u32::<LE>(0x7)?; // RWX
    out.write_u64::<LE>(0)?; // file offset
    out.write_u64::<LE>(BASE_VA)?;
    out.write_u64::<LE>(BASE_VA)?;
    out.write_u64::<LE>(file_size)?;
    out.write_u64::<LE>(file_size)?;
    out.write_u64::<LE>(0x1000)?; // alignment

    out.extend_from_slice(text);
    out.resize((layout.rdata_va - BASE_VA) as usize, 0);
    out.extend_from_slice(rdata);
    out.resize((layout.data_va - BASE_VA) as usize, 0);
    out.extend_from_slice(data);

    Ok(out)
}
