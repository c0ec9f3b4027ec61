//! Module and heap enumeration via process snapshots.
//!
//! The OS exposes both as first/next call pairs over a one-shot snapshot
//! handle. The walk logic here is written against the [`SnapshotWalk`] trait
//! so it can be exercised without a live target; the Windows toolhelp
//! implementation lives in [`crate::process`].

use std::path::PathBuf;

use crate::error::{Error, Result, SnapshotStep};

/// OS error code meaning "no more entries / invalid access past the last
/// element". Translated into normal sequence termination, never surfaced.
pub const ERROR_NO_MORE_ENTRIES: u32 = 0x12;

/// A loaded module as reported by one snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    pub address: u64,
    pub size: u64,
    /// Backing file on disk, when the snapshot reports one.
    pub path: Option<PathBuf>,
}

impl ModuleInfo {
    /// Whether `address` falls within `[self.address, self.address + size)`.
    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.address + self.size
    }
}

/// One heap of the target process, identifying a run of heap entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapList {
    pub process_id: u32,
    pub heap_id: u64,
}

/// One heap block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapEntry {
    pub address: u64,
    pub size: u64,
}

/// Outcome of a single first/next snapshot call.
pub enum WalkStep<T> {
    Item(T),
    End,
    Failed(u32),
}

/// The raw first/next surface of a process snapshot.
///
/// `next_heap_entry` continues from the entry most recently returned by
/// `first_heap_entry`/`next_heap_entry`, matching the underlying API which
/// threads its cursor through the entry structure itself.
pub trait SnapshotWalk {
    fn first_module(&mut self) -> WalkStep<ModuleInfo>;
    fn next_module(&mut self) -> WalkStep<ModuleInfo>;
    fn first_heap_list(&mut self) -> WalkStep<HeapList>;
    fn next_heap_list(&mut self) -> WalkStep<HeapList>;
    fn first_heap_entry(&mut self, list: &HeapList) -> WalkStep<HeapEntry>;
    fn next_heap_entry(&mut self) -> WalkStep<HeapEntry>;
}

/// Translate one walk step: the no-more-entries sentinel ends the sequence,
/// every other failure is fatal and names the failing step.
fn advance<T>(step: SnapshotStep, outcome: WalkStep<T>) -> Result<Option<T>> {
    match outcome {
        WalkStep::Item(item) => Ok(Some(item)),
        WalkStep::End => Ok(None),
        WalkStep::Failed(ERROR_NO_MORE_ENTRIES) => Ok(None),
        WalkStep::Failed(code) => Err(Error::Snapshot { step, code }),
    }
}

/// Enumerate every module entry in the snapshot.
pub fn enumerate_modules<W: SnapshotWalk>(walk: &mut W) -> Result<Vec<ModuleInfo>> {
    let mut modules = Vec::new();
    let mut module = advance(SnapshotStep::ModuleFirst, walk.first_module())?;
    while let Some(m) = module {
        modules.push(m);
        module = advance(SnapshotStep::ModuleNext, walk.next_module())?;
    }
    tracing::debug!(count = modules.len(), "enumerated modules");
    Ok(modules)
}

/// Enumerate every heap entry, heap list by heap list.
pub fn enumerate_heap_entries<W: SnapshotWalk>(walk: &mut W) -> Result<Vec<HeapEntry>> {
    let mut entries = Vec::new();
    let mut list = advance(SnapshotStep::HeapListFirst, walk.first_heap_list())?;
    while let Some(l) = list {
        let mut entry = advance(SnapshotStep::HeapEntryFirst, walk.first_heap_entry(&l))?;
        while let Some(e) = entry {
            entries.push(e);
            entry = advance(SnapshotStep::HeapEntryNext, walk.next_heap_entry())?;
        }
        list = advance(SnapshotStep::HeapListNext, walk.next_heap_list())?;
    }
    tracing::debug!(count = entries.len(), "enumerated heap entries");
    Ok(entries)
}
