//! Grouping of memory regions into dumpable chunks.
//!
//! A chunk is the unit of output: one module's memory, or one region that no
//! module claims. Regions are processed in ascending address order and the
//! first module whose range contains a region's base address claims it.
//! First match wins by module iteration order, deliberately not the
//! tightest enclosing range.

use std::collections::BTreeMap;

use crate::region::MemoryRegion;
use crate::snapshot::ModuleInfo;

/// The name used in output files for chunks no module claimed.
pub const UNKNOWN_CHUNK_NAME: &str = "UNKNOWN";

/// One module's memory (or one unassociated region) destined for one file.
#[derive(Clone, Debug)]
pub struct DumpableChunk {
    /// Module name, `None` for unassociated regions.
    pub name: Option<String>,
    /// Base address; every segment offset is relative to this.
    pub address: u64,
    /// Nominal size: the module's size, or the first region's size.
    pub size: u64,
    /// Member regions in the order they were assembled (ascending address).
    pub segments: Vec<MemoryRegion>,
}

impl DumpableChunk {
    /// File-name stem for this chunk: `{baseAddressHex}-{name-or-UNKNOWN}`.
    pub fn file_stem(&self) -> String {
        format!(
            "{:X}-{}",
            self.address,
            self.name.as_deref().unwrap_or(UNKNOWN_CHUNK_NAME)
        )
    }
}

/// Correlate committed regions with module metadata.
///
/// Exactly one chunk exists per distinct base address; regions mapping to an
/// existing chunk append to it. `regions` must already be sorted by address.
pub fn assemble_chunks(
    regions: &[MemoryRegion],
    modules: &[ModuleInfo],
) -> BTreeMap<u64, DumpableChunk> {
    let mut chunks: BTreeMap<u64, DumpableChunk> = BTreeMap::new();

    for region in regions {
        let module = modules.iter().find(|m| m.contains(region.address));

        let (key, name, size) = match module {
            Some(m) => (m.address, Some(m.name.clone()), m.size),
            None => (region.address, None, region.size),
        };

        chunks
            .entry(key)
            .or_insert_with(|| DumpableChunk {
                name,
                address: key,
                size,
                segments: Vec::new(),
            })
            .segments
            .push(region.clone());
    }

    chunks
}
