//! Virtual address space enumeration.
//!
//! Walks a target process's address space one query at a time, yielding every
//! region (committed, reserved and free alike) in ascending address order.
//! Downstream consumers filter by state.

use crate::error::{Error, Result};
use crate::process::RegionQuery;

/// Highest user-mode address the walk will probe.
pub const MAX_REGION_ADDRESS: u64 = 0x7FFF_FFFF_FFFF;

/// State of a memory region as reported by one query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionState {
    Committed,
    Reserved,
    Free,
}

/// Backing type of a region. Free regions report no type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionKind {
    Image,
    Mapped,
    Private,
}

/// A contiguous range of virtual address space with uniform protection and
/// state. Immutable once yielded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Base address of the region.
    pub address: u64,
    /// Size of the region in bytes.
    pub size: u64,
    /// OS protection flags, raw.
    pub protect: u32,
    /// Allocation state.
    pub state: RegionState,
    /// Backing type, `None` for free regions.
    pub kind: Option<RegionKind>,
}

impl MemoryRegion {
    /// End address (exclusive).
    pub fn end(&self) -> u64 {
        self.address + self.size
    }
}

/// Lazy, restartable walk over a process's regions.
///
/// Starts at address 0 and advances by `base + size` of each query result.
/// Terminates when the walk passes [`MAX_REGION_ADDRESS`], when two
/// consecutive queries return the same base address (stall guard), when the
/// query reports no region, or when a region reports `size == 0` (natural
/// end, that region is not yielded).
pub struct RegionIter<'a, Q: RegionQuery + ?Sized> {
    query: &'a Q,
    next_address: u64,
    previous_address: Option<u64>,
    done: bool,
}

impl<'a, Q: RegionQuery + ?Sized> RegionIter<'a, Q> {
    pub fn new(query: &'a Q) -> Self {
        Self {
            query,
            next_address: 0,
            previous_address: None,
            done: false,
        }
    }
}

impl<'a, Q: RegionQuery + ?Sized> Iterator for RegionIter<'a, Q> {
    type Item = Result<MemoryRegion>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next_address > MAX_REGION_ADDRESS {
            return None;
        }

        let region = match self.query.query_region(self.next_address) {
            Some(r) => r,
            None => {
                self.done = true;
                // Nothing enumerable at all means the handle is dead, not
                // that we walked past the last region.
                if self.previous_address.is_none() {
                    return Some(Err(Error::RegionQuery { address: 0 }));
                }
                return None;
            }
        };

        // Stall guard: a query that no longer advances ends the walk.
        if self.previous_address == Some(region.address) {
            self.done = true;
            return None;
        }

        if region.size == 0 {
            self.done = true;
            return None;
        }

        self.previous_address = Some(region.address);
        self.next_address = region.address + region.size;
        Some(Ok(region))
    }
}

/// Collect every committed region of the target, in address order.
pub fn committed_regions<Q: RegionQuery + ?Sized>(query: &Q) -> Result<Vec<MemoryRegion>> {
    let mut regions = Vec::new();
    for region in RegionIter::new(query) {
        let region = region?;
        if region.state == RegionState::Committed {
            regions.push(region);
        }
    }
    Ok(regions)
}
