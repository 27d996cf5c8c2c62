//! PE64 image writer.
//!
//! DOS stub, COFF header, PE32+ optional header, three sections
//! (`.text`, `.rdata`, `.data`), and a kernel32 import directory whose
//! IAT carries exactly the eight symbols of
//! [`ImportSymbol`](crate::layout::ImportSymbol).

use byteorder::{LittleEndian as LE, WriteBytesExt};

use crate::error::BuildError;
use crate::image::align_up;
use crate::layout::ImportSymbol;

const IMAGE_BASE: u64 = 0x1_4000_0000;
const SECTION_ALIGN: u64 = 0x1000;
const FILE_ALIGN: u64 = 0x200;
const HEADERS_SIZE: u64 = 0x200;

bitflags::bitflags! {
    struct SectionFlags: u32 {
        const CODE = 0x0000_0020;
        const INITIALIZED_DATA = 0x0000_0040;
        const EXECUTE = 0x2000_0000;
        const READ = 0x4000_0000;
        const WRITE = 0x8000_0000;
    }
}

/// Section addresses of a laid-out image.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    /// Preferred load address.
    pub image_base: u64,
    /// RVA of `.text` (also the entry point).
    pub text_rva: u64,
    /// RVA of `.rdata`.
    pub rdata_rva: u64,
    /// RVA of `.data`.
    pub data_rva: u64,
}

impl Layout {
    /// RVA of the first section.
    pub const TEXT_RVA: u64 = 0x1000;

    /// Computes section RVAs from final section sizes.
    pub fn compute(text: usize, rdata: usize, _data: usize) -> Self {
        let text_rva = Self::TEXT_RVA;
        let rdata_rva = text_rva + align_up(text.max(1) as u64, SECTION_ALIGN);
        let data_rva = rdata_rva + align_up(rdata.max(1) as u64, SECTION_ALIGN);
        Self {
            image_base: IMAGE_BASE,
            text_rva,
            rdata_rva,
            data_rva,
        }
    }
}

/// The import machinery appended to `.rdata`.
#[derive(Debug, Clone, Copy)]
pub struct ImportData {
    /// Offset of the IAT within `.rdata`.
    pub iat_offset: u64,
    /// Size of the IAT directory entry.
    pub iat_size: u32,
    /// Offset of the import descriptor table within `.rdata`.
    pub dir_offset: u64,
    /// Size of the import directory entry.
    pub dir_size: u32,
}

fn push_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

impl ImportData {
    /// Appends the import descriptor, ILT, IAT, and hint/name table to
    /// `rdata`, which already holds the program's read-only data.
    pub fn build(rdata: &mut Vec<u8>, text_len: usize) -> Self {
        let rdata_rva = Layout::TEXT_RVA + align_up(text_len.max(1) as u64, SECTION_ALIGN);
        while rdata.len() % 8 != 0 {
            rdata.push(0);
        }
        let dir_offset = rdata.len() as u64;
        let idata_rva = (rdata_rva + dir_offset) as u32;

        let symbols = ImportSymbol::ALL;
        let ilt_rva = idata_rva + 0x28;
        let iat_rva = idata_rva + 0x28 + 8 * (symbols.len() as u32 + 1);

        // Import descriptor for kernel32.dll plus the null terminator.
        let mut idata = Vec::new();
        push_u32(&mut idata, ilt_rva); // OriginalFirstThunk
        push_u32(&mut idata, 0); // TimeDateStamp
        push_u32(&mut idata, 0); // ForwarderChain
        let name_fixup = idata.len();
        push_u32(&mut idata, 0); // Name (patched below)
        push_u32(&mut idata, iat_rva); // FirstThunk
        idata.resize(idata.len() + 20, 0);

        // ILT and IAT start as identical hint/name references.
        let ilt_start = idata.len();
        idata.resize(idata.len() + 2 * 8 * (symbols.len() + 1), 0);

        // Hint/name entries, shared by both tables.
        for (i, symbol) in symbols.into_iter().enumerate() {
            if idata.len() % 2 == 1 {
                idata.push(0);
            }
            let entry_rva = idata_rva + idata.len() as u32;
            push_u16(&mut idata, 0); // hint
            idata.extend_from_slice(symbol.name().as_bytes());
            idata.push(0);

            let ilt_at = ilt_start + 8 * i;
            let iat_at = ilt_start + 8 * (symbols.len() + 1) + 8 * i;
            idata[ilt_at..ilt_at + 8].copy_from_slice(&(entry_rva as u64).to_le_bytes());
            idata[iat_at..iat_at + 8].copy_from_slice(&(entry_rva as u64).to_le_bytes());
        }

        // DLL name.
        if idata.len() % 2 == 1 {
            idata.push(0);
        }
        let name_rva = idata_rva + idata.len() as u32;
        idata.extend_from_slice(b"kernel32.dll\0");
        idata[name_fixup..name_fixup + 4].copy_from_slice(&name_rva.to_le_bytes());

        rdata.extend_from_slice(&idata);

        Self {
            iat_offset: dir_offset + (iat_rva - idata_rva) as u64,
            iat_size: 8 * (symbols.len() as u32 + 1),
            dir_offset,
            dir_size: 40,
        }
    }
}

/// Assembles the final PE64 file.
pub fn write_image(
    layout: &Layout,
    import: &ImportData,
    text: &[u8],
    rdata: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, BuildError> {
    let mut out = Vec::with_capacity(HEADERS_SIZE as usize + text.len() + rdata.len() + data.len());

    let text_raw = align_up(text.len().max(1) as u64, FILE_ALIGN);
    let rdata_raw = align_up(rdata.len().max(1) as u64, FILE_ALIGN);
    let data_raw = align_up(data.len().max(1) as u64, FILE_ALIGN);
    let size_of_image = layout.data_rva + align_up(data.len().max(1) as u64, SECTION_ALIGN);

    // DOS header with the PE pointer at 0x3c.
    out.write_u16::<LE>(0x5a4d)?; // "MZ"
    out.resize(0x3c, 0);
    out.write_u32::<LE>(0x80)?;
    out.resize(0x80, 0);

    // PE signature and COFF header.
    out.extend_from_slice(b"PE\0\0");
    out.write_u16::<LE>(0x8664)?; // machine
    out.write_u16::<LE>(3)?; // sections
    out.write_u32::<LE>(0)?; // timestamp
    out.write_u32::<LE>(0)?; // symbol table
    out.write_u32::<LE>(0)?; // symbol count
    out.write_u16::<LE>(0xf0)?; // optional header size
    out.write_u16::<LE>(0x0022)?; // executable, large address aware

    // Optional header, PE32+.
    out.write_u16::<LE>(0x020b)?;
    out.write_u8(14)?; // linker major
    out.write_u8(0)?; // linker minor
    out.write_u32::<LE>(text_raw as u32)?;
    out.write_u32::<LE>((rdata_raw + data_raw) as u32)?;
    out.write_u32::<LE>(0)?; // uninitialized data
    out.write_u32::<LE>(layout.text_rva as u32)?; // entry point
    out.write_u32::<LE>(layout.text_rva as u32)?; // base of code
    out.write_u64::<LE>(layout.image_base)?;
    out.write_u32::<LE>(SECTION_ALIGN as u32)?;
    out.write_u32::<LE>(FILE_ALIGN as u32)?;
    out.write_u16::<LE>(6)?; // OS major
    out.write_u16::<LE>(0)?;
    out.write_u16::<LE>(0)?; // image version
    out.write_u16::<LE>(0)?;
    out.write_u16::<LE>(6)?; // subsystem version
    out.write_u16::<LE>(0)?;
    out.write_u32::<LE>(0)?; // win32 version
    out.write_u32::<LE>(size_of_image as u32)?;
    out.write_u32::<LE>(HEADERS_SIZE as u32)?;
    out.write_u32::<LE>(0)?; // checksum
    out.write_u16::<LE>(3)?; // console subsystem
    out.write_u16::<LE>(0x8100)?; // NX compatible, terminal server aware
    out.write_u64::<LE>(0x10_0000)?; // stack reserve
    out.write_u64::<LE>(0x1000)?; // stack commit
    out.write_u64::<LE>(0x10_0000)?; // heap reserve
    out.write_u64::<LE>(0x1000)?; // heap commit
    out.write_u32::<LE>(0)?; // loader flags
    out.write_u32::<LE>(16)?; // directory count

    // Data directories: only imports and the IAT.
    for index in 0..16u32 {
        match index {
            1 => {
                out.write_u32::<LE>((layout.rdata_rva + import.dir_offset) as u32)?;
                out.write_u32::<LE>(import.dir_size)?;
            }
            12 => {
                out.write_u32::<LE>((layout.rdata_rva + import.iat_offset) as u32)?;
                out.write_u32::<LE>(import.iat_size)?;
            }
            _ => {
                out.write_u32::<LE>(0)?;
                out.write_u32::<LE>(0)?;
            }
        }
    }

    // Section table.
    let mut raw_ptr = HEADERS_SIZE;
    let mut section = |out: &mut Vec<u8>,
                       name: &[u8; 8],
                       vsize: u64,
                       rva: u64,
                       raw_size: u64,
                       flags: SectionFlags|
     -> Result<u64, BuildError> {
        out.extend_from_slice(name);
        out.write_u32::<LE>(vsize as u32)?;
        out.write_u32::<LE>(rva as u32)?;
        out.write_u32::<LE>(raw_size as u32)?;
        out.write_u32::<LE>(raw_ptr as u32)?;
        out.write_u32::<LE>(0)?; // relocations
        out.write_u32::<LE>(0)?; // line numbers
        out.write_u16::<LE>(0)?;
        out.write_u16::<LE>(0)?;
        out.write_u32::<LE>(flags.bits())?;
        raw_ptr += raw_size;
        Ok(raw_ptr)
    };

    section(
        &mut out,
        b".text\0\0\0",
        text.len() as u64,
        layout.text_rva,
        text_raw,
        SectionFlags::CODE | SectionFlags::EXECUTE | SectionFlags::READ,
    )?;
    section(
        &mut out,
        b".rdata\0\0",
        rdata.len() as u64,
        layout.rdata_rva,
        rdata_raw,
        SectionFlags::INITIALIZED_DATA | SectionFlags::READ,
    )?;
    section(
        &mut out,
        b".data\0\0\0",
        data.len() as u64,
        layout.data_rva,
        data_raw,
        SectionFlags::INITIALIZED_DATA | SectionFlags::READ | SectionFlags::WRITE,
    )?;

    if out.len() as u64 > HEADERS_SIZE {
        return Err(BuildError::link("headers overflow the reserved space"));
    }
    out.resize(HEADERS_SIZE as usize, 0);

    out.extend_from_slice(text);
    out.resize((HEADERS_SIZE + text_raw) as usize, 0);
    out.extend_from_slice(rdata);
    out.resize((HEADERS_SIZE + text_raw + rdata_raw) as usize, 0);
    out.extend_from_slice(data);
    out.resize((HEADERS_SIZE + text_raw + rdata_raw + data_raw) as usize, 0);

    Ok(out)
}
