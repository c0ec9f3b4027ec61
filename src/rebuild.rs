//! Header realignment for a captured module image.
//!
//! A module dumped straight out of memory carries its in-memory geometry:
//! section raw pointers mean nothing on disk, the entry point is an absolute
//! address, and the IAT directory points at patched slots. [`rebuild_image`]
//! rewrites the headers so the buffer can be treated as a static PE file.
//! Section bodies are not re-captured; only a small fixed prefix of each
//! section is accounted for in the on-disk geometry, so the output is a
//! best-effort reconstruction, not a loadable binary.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::pe::{
    align_up, ImageBuffer, PeLayout, SectionHeader, DIRECTORY_BOUND_IMPORT, DIRECTORY_IAT,
    FILE_ALIGNMENT, FILE_HEADER_SIZE, IMAGE_SCN_MEM_READ, IMAGE_SCN_MEM_WRITE,
    NUM_DATA_DIRECTORIES, OPTIONAL_HEADER64_SIZE, SECTION_HEADER_SIZE,
};
use crate::process::MemoryReader;
use crate::snapshot::ModuleInfo;

/// Per-section cap on how much raw data the geometry accounts for.
pub const SECTION_READ_CEILING: u32 = 100;

/// How much of a module to read back when only its headers are wanted. One
/// page always covers the DOS stub, NT headers and section table.
pub const HEADER_PROBE_SIZE: usize = 0x1000;

/// The module being reconstructed, as reported by the live process.
#[derive(Debug, Clone)]
pub struct ModuleTarget {
    /// Runtime base address.
    pub base: u64,
    /// Absolute runtime entry point address.
    pub entry_point: u64,
    /// Backing file on disk, when the module has one.
    pub disk_path: Option<PathBuf>,
    /// Size of the backing file; needed to detect an overlay.
    pub disk_size: Option<u64>,
}

impl ModuleTarget {
    /// Build a target from a snapshot entry, reading the entry point out of
    /// the module's in-memory headers and the file size off disk.
    pub fn resolve<R: MemoryReader + ?Sized>(module: &ModuleInfo, reader: &R) -> Result<Self> {
        let mut header = vec![0u8; HEADER_PROBE_SIZE];
        if reader.read_memory(module.address, &mut header) == 0 {
            return Err(Error::MalformedImage(format!(
                "headers of {} at {:#x} are unreadable",
                module.name, module.address
            )));
        }

        let image = ImageBuffer::new(&mut header);
        let layout = PeLayout::parse(&image)?;
        let entry_rva = image.read_u32(layout.entry_point_offset())?;

        let disk_size = match &module.path {
            Some(path) => Some(std::fs::metadata(path)?.len()),
            None => None,
        };

        Ok(Self {
            base: module.address,
            entry_point: module.address + entry_rva as u64,
            disk_path: module.path.clone(),
            disk_size,
        })
    }
}

/// What the realignment did, for reporting.
#[derive(Debug, Clone, Copy)]
pub struct RebuildReport {
    pub sections: usize,
    pub size_of_image: u32,
    /// File size implied by the corrected section table.
    pub implied_file_size: u64,
    /// Overlay bytes appended from process memory, 0 when there is none.
    pub overlay_bytes: u64,
}

/// Rewrite `bytes` (a captured module image, headers at offset 0) so its
/// headers describe a disk-aligned file, appending any overlay read back out
/// of the process.
pub fn rebuild_image<R: MemoryReader + ?Sized>(
    bytes: &mut Vec<u8>,
    target: &ModuleTarget,
    reader: &R,
) -> Result<RebuildReport> {
    let (report, overlay) = {
        let mut image = ImageBuffer::new(bytes);
        let layout = PeLayout::parse(&image)?;

        image.write_u32(layout.file_alignment_offset(), FILE_ALIGNMENT)?;

        let entry_rva = target
            .entry_point
            .checked_sub(target.base)
            .ok_or_else(|| Error::MalformedImage("entry point below module base".into()))?;
        image.write_u32(layout.entry_point_offset(), entry_rva as u32)?;

        let section_alignment = image.read_u32(layout.section_alignment_offset())?;
        if section_alignment == 0 {
            return Err(Error::MalformedImage("SectionAlignment of zero".into()));
        }
        let count = layout.number_of_sections as usize;
        let mut sections = Vec::with_capacity(count);
        for i in 0..count {
            sections.push(SectionHeader::decode(&image, layout.section_offset(i))?);
        }

        // Lay sections out on disk in their raw-pointer order, packed back to
        // back behind the headers.
        sections.sort_by_key(|s| s.pointer_to_raw_data);

        let mut running_file_size = (layout.nt_offset
            + 4
            + FILE_HEADER_SIZE
            + layout.size_of_optional_header as usize
            + count * SECTION_HEADER_SIZE) as u32;
        for section in &mut sections {
            let data_size = section.virtual_size.min(SECTION_READ_CEILING);
            section.virtual_address = align_up(section.virtual_address, section_alignment)?;
            section.virtual_size = align_up(section.size_of_raw_data, section_alignment)?;
            section.pointer_to_raw_data = align_up(running_file_size, FILE_ALIGNMENT)?;
            section.size_of_raw_data = align_up(data_size, FILE_ALIGNMENT)?;
            running_file_size = section
                .pointer_to_raw_data
                .checked_add(section.size_of_raw_data)
                .ok_or_else(|| {
                    Error::MalformedImage("section table exceeds a 32-bit file size".into())
                })?;
        }

        // Consumers expect the table in virtual-address order.
        sections.sort_by_key(|s| s.virtual_address);

        image.write_u32(layout.directory_offset(DIRECTORY_BOUND_IMPORT), 0)?;
        image.write_u32(layout.directory_offset(DIRECTORY_BOUND_IMPORT) + 4, 0)?;

        let declared_directories = image.read_u32(layout.number_of_rva_and_sizes_offset())?;
        for i in declared_directories..NUM_DATA_DIRECTORIES {
            image.write_u32(layout.directory_offset(i as usize), 0)?;
            image.write_u32(layout.directory_offset(i as usize) + 4, 0)?;
        }
        image.write_u32(layout.number_of_rva_and_sizes_offset(), NUM_DATA_DIRECTORIES)?;
        image.write_u16(
            layout.size_of_optional_header_offset(),
            OPTIONAL_HEADER64_SIZE,
        )?;

        let size_of_image = sections
            .iter()
            .map(|s| u64::from(s.virtual_address) + u64::from(s.virtual_size))
            .max()
            .unwrap_or(0);
        let size_of_image = u32::try_from(size_of_image).map_err(|_| {
            Error::MalformedImage(format!("SizeOfImage {size_of_image:#x} exceeds 32 bits"))
        })?;
        image.write_u32(layout.size_of_image_offset(), size_of_image)?;

        if target.base != 0 {
            image.write_bytes(layout.image_base_offset(), &target.base.to_le_bytes())?;
        }

        let size_of_headers = align_up(
            (layout.nt_offset
                + 4
                + FILE_HEADER_SIZE
                + OPTIONAL_HEADER64_SIZE as usize
                + count * SECTION_HEADER_SIZE) as u32,
            FILE_ALIGNMENT,
        )?;
        image.write_u32(layout.size_of_headers_offset(), size_of_headers)?;

        // A relocated IAT only makes sense at runtime: mark the section that
        // holds it writable and drop the directory entry.
        let iat_address = image.read_u32(layout.directory_offset(DIRECTORY_IAT))?;
        image.write_u32(layout.directory_offset(DIRECTORY_IAT), 0)?;
        image.write_u32(layout.directory_offset(DIRECTORY_IAT) + 4, 0)?;
        if iat_address > 0 {
            for section in &mut sections {
                if section.contains_rva(iat_address) {
                    section.characteristics |= IMAGE_SCN_MEM_READ | IMAGE_SCN_MEM_WRITE;
                }
            }
        }

        for (i, section) in sections.iter().enumerate() {
            section.encode(&mut image, layout.section_offset(i))?;
        }

        let implied_file_size = sections
            .iter()
            .map(|s| s.pointer_to_raw_data as u64 + s.size_of_raw_data as u64)
            .max()
            .unwrap_or(0);

        let mut report = RebuildReport {
            sections: count,
            size_of_image,
            implied_file_size,
            overlay_bytes: 0,
        };

        let overlay = match target.disk_size {
            Some(disk_size) if disk_size > implied_file_size => {
                let overlay_size = disk_size - implied_file_size;
                let mut buffer = vec![0u8; overlay_size as usize];
                let read = reader.read_memory(target.base + implied_file_size, &mut buffer);
                if read == 0 {
                    warn!(
                        bytes = overlay_size,
                        "overlay unreadable, appending zeros"
                    );
                }
                report.overlay_bytes = overlay_size;
                Some(buffer)
            }
            _ => None,
        };

        (report, overlay)
    };

    if let Some(overlay) = overlay {
        bytes.extend_from_slice(&overlay);
    }

    debug!(
        sections = report.sections,
        size_of_image = report.size_of_image,
        implied_file_size = report.implied_file_size,
        overlay_bytes = report.overlay_bytes,
        "image realigned"
    );
    Ok(report)
}
