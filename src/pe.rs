//! PE32+ plumbing: a bounds-checked view over a captured image, the header
//! layout offsets the rebuilder needs, and the section header codec.
//!
//! A dumped image arrives as raw bytes read out of another process, so
//! nothing here trusts a length field. Every access goes through
//! [`ImageBuffer`], which turns an out-of-range offset into
//! `Error::MalformedImage` instead of a panic.

use crate::error::{Error, Result};

pub const DOS_MAGIC: u16 = 0x5A4D; // "MZ"
pub const PE_SIGNATURE: u32 = 0x0000_4550; // "PE\0\0"
pub const OPTIONAL_MAGIC_PE64: u16 = 0x20B;

pub const E_LFANEW_OFFSET: usize = 0x3C;
pub const FILE_HEADER_SIZE: usize = 20;
pub const SECTION_HEADER_SIZE: usize = 40;
pub const OPTIONAL_HEADER64_SIZE: u16 = 240;
pub const NUM_DATA_DIRECTORIES: u32 = 16;
pub const DATA_DIRECTORY_SIZE: usize = 8;

/// Alignment the rebuilt file is packed to, regardless of what the header
/// claimed in memory.
pub const FILE_ALIGNMENT: u32 = 0x200;

/// Data directory slots referenced by the rebuilder.
pub const DIRECTORY_BOUND_IMPORT: usize = 11;
pub const DIRECTORY_IAT: usize = 12;

pub const IMAGE_SCN_MEM_READ: u32 = 0x4000_0000;
pub const IMAGE_SCN_MEM_WRITE: u32 = 0x8000_0000;

/// Round `value` up to the next multiple of `alignment`. Alignment values
/// come out of captured headers, so a zero alignment and a result past
/// `u32::MAX` are both `MalformedImage`, not a panic.
pub fn align_up(value: u32, alignment: u32) -> Result<u32> {
    if alignment == 0 {
        return Err(Error::MalformedImage("alignment of zero".into()));
    }
    let a = u64::from(alignment);
    let aligned = (u64::from(value) + a - 1) / a * a;
    u32::try_from(aligned).map_err(|_| {
        Error::MalformedImage(format!("aligned value {aligned:#x} exceeds 32 bits"))
    })
}

/// Mutable little-endian view over a captured image.
pub struct ImageBuffer<'a> {
    data: &'a mut [u8],
}

impl<'a> ImageBuffer<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.data
            .get(offset..offset.checked_add(len).ok_or_else(Self::overflow)?)
            .ok_or_else(|| {
                Error::MalformedImage(format!(
                    "read of {len} bytes at {offset:#x} past end of {:#x}-byte image",
                    self.data.len()
                ))
            })
    }

    fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let total = self.data.len();
        self.data
            .get_mut(offset..offset.checked_add(len).ok_or_else(Self::overflow)?)
            .ok_or_else(|| {
                Error::MalformedImage(format!(
                    "write of {len} bytes at {offset:#x} past end of {total:#x}-byte image"
                ))
            })
    }

    fn overflow() -> Error {
        Error::MalformedImage("offset arithmetic overflow".into())
    }

    pub fn read_u16(&self, offset: usize) -> Result<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64> {
        let b = self.slice(offset, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        self.slice_mut(offset, 2)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.slice_mut(offset, 4)?.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn write_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.slice_mut(offset, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }
}

/// Resolved offsets of the headers inside a PE32+ image.
#[derive(Debug, Clone, Copy)]
pub struct PeLayout {
    /// Offset of the NT signature (`e_lfanew`).
    pub nt_offset: usize,
    pub number_of_sections: u16,
    pub size_of_optional_header: u16,
}

impl PeLayout {
    /// Validate the DOS and NT headers and resolve the layout.
    pub fn parse(image: &ImageBuffer<'_>) -> Result<Self> {
        if image.read_u16(0)? != DOS_MAGIC {
            return Err(Error::MalformedImage("missing MZ signature".into()));
        }
        let nt_offset = image.read_u32(E_LFANEW_OFFSET)? as usize;
        if image.read_u32(nt_offset)? != PE_SIGNATURE {
            return Err(Error::MalformedImage(format!(
                "missing PE signature at {nt_offset:#x}"
            )));
        }

        let layout = Self {
            nt_offset,
            number_of_sections: image.read_u16(nt_offset + 4 + 2)?,
            size_of_optional_header: image.read_u16(nt_offset + 4 + 16)?,
        };

        if image.read_u16(layout.optional_header_offset())? != OPTIONAL_MAGIC_PE64 {
            return Err(Error::MalformedImage("not a PE32+ optional header".into()));
        }

        Ok(layout)
    }

    pub fn file_header_offset(&self) -> usize {
        self.nt_offset + 4
    }

    pub fn optional_header_offset(&self) -> usize {
        self.file_header_offset() + FILE_HEADER_SIZE
    }

    pub fn section_table_offset(&self) -> usize {
        self.optional_header_offset() + self.size_of_optional_header as usize
    }

    pub fn section_offset(&self, index: usize) -> usize {
        self.section_table_offset() + index * SECTION_HEADER_SIZE
    }

    pub fn directory_offset(&self, index: usize) -> usize {
        self.optional_header_offset() + 112 + index * DATA_DIRECTORY_SIZE
    }

    // Optional header fields, PE32+ layout.
    pub fn entry_point_offset(&self) -> usize {
        self.optional_header_offset() + 16
    }

    pub fn image_base_offset(&self) -> usize {
        self.optional_header_offset() + 24
    }

    pub fn section_alignment_offset(&self) -> usize {
        self.optional_header_offset() + 32
    }

    pub fn file_alignment_offset(&self) -> usize {
        self.optional_header_offset() + 36
    }

    pub fn size_of_image_offset(&self) -> usize {
        self.optional_header_offset() + 56
    }

    pub fn size_of_headers_offset(&self) -> usize {
        self.optional_header_offset() + 60
    }

    pub fn number_of_rva_and_sizes_offset(&self) -> usize {
        self.optional_header_offset() + 108
    }

    pub fn number_of_sections_offset(&self) -> usize {
        self.file_header_offset() + 2
    }

    pub fn size_of_optional_header_offset(&self) -> usize {
        self.file_header_offset() + 16
    }
}

/// One decoded IMAGE_SECTION_HEADER. All ten fields round-trip through the
/// codec; the rebuilder re-slots whole headers, so the relocation and line
/// number fields must travel with their section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

impl SectionHeader {
    pub fn decode(image: &ImageBuffer<'_>, offset: usize) -> Result<Self> {
        let mut name = [0u8; 8];
        name.copy_from_slice(image.slice(offset, 8)?);
        Ok(Self {
            name,
            virtual_size: image.read_u32(offset + 8)?,
            virtual_address: image.read_u32(offset + 12)?,
            size_of_raw_data: image.read_u32(offset + 16)?,
            pointer_to_raw_data: image.read_u32(offset + 20)?,
            pointer_to_relocations: image.read_u32(offset + 24)?,
            pointer_to_linenumbers: image.read_u32(offset + 28)?,
            number_of_relocations: image.read_u16(offset + 32)?,
            number_of_linenumbers: image.read_u16(offset + 34)?,
            characteristics: image.read_u32(offset + 36)?,
        })
    }

    pub fn encode(&self, image: &mut ImageBuffer<'_>, offset: usize) -> Result<()> {
        image.write_bytes(offset, &self.name)?;
        image.write_u32(offset + 8, self.virtual_size)?;
        image.write_u32(offset + 12, self.virtual_address)?;
        image.write_u32(offset + 16, self.size_of_raw_data)?;
        image.write_u32(offset + 20, self.pointer_to_raw_data)?;
        image.write_u32(offset + 24, self.pointer_to_relocations)?;
        image.write_u32(offset + 28, self.pointer_to_linenumbers)?;
        image.write_u16(offset + 32, self.number_of_relocations)?;
        image.write_u16(offset + 34, self.number_of_linenumbers)?;
        image.write_u32(offset + 36, self.characteristics)?;
        Ok(())
    }

    /// Section name with trailing NULs stripped, lossy for the rare
    /// non-UTF-8 name.
    pub fn display_name(&self) -> String {
        let end = self.name.iter().position(|&c| c == 0).unwrap_or(8);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Whether `rva` falls inside this section's virtual range.
    pub fn contains_rva(&self, rva: u32) -> bool {
        rva >= self.virtual_address
            && (rva as u64) < self.virtual_address as u64 + self.virtual_size as u64
    }
}

/// Minimal PE32+ header image for test fixtures: DOS stub, NT headers,
/// `sections` zeroed section headers.
#[cfg(test)]
pub(crate) fn minimal_image(sections: u16) -> Vec<u8> {
    let nt = 0x80usize;
    let size = nt
        + 4
        + FILE_HEADER_SIZE
        + OPTIONAL_HEADER64_SIZE as usize
        + sections as usize * SECTION_HEADER_SIZE;
    let mut data = vec![0u8; size];
    data[0] = b'M';
    data[1] = b'Z';
    data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&(nt as u32).to_le_bytes());
    data[nt..nt + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
    data[nt + 6..nt + 8].copy_from_slice(&sections.to_le_bytes());
    data[nt + 20..nt + 22].copy_from_slice(&OPTIONAL_HEADER64_SIZE.to_le_bytes());
    data[nt + 24..nt + 26].copy_from_slice(&OPTIONAL_MAGIC_PE64.to_le_bytes());
    data
}
