//! # memmirror
//!
//! A process-memory capture tool that mirrors a live process's committed
//! address space into per-chunk dump files and reconstructs loaded PE
//! modules into disk-shaped images.
//!
//! ## Overview
//!
//! A running process holds state that never exists on disk: decrypted or
//! unpacked module bytes, heap contents, remapped sections. This tool:
//!
//! 1. Suspends every thread of the target so the address space stops moving
//! 2. Walks the committed regions and groups them into chunks, one per
//!    module base (regions outside any module become their own chunks)
//! 3. Streams each chunk to a `.dmp` file at stable intra-chunk offsets
//! 4. Optionally realigns a captured module's PE headers so the dump can be
//!    treated as a static file
//!
//! The capture pipeline is written against capability traits
//! ([`process::MemoryReader`], [`process::RegionQuery`],
//! [`process::ProcessController`], [`process::SnapshotSource`]), with the
//! Windows implementations kept at the edge in [`process`].

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

pub mod chunk;
pub mod dumper;
pub mod error;
pub mod freeze;
pub mod pe;
pub mod process;
pub mod rebuild;
pub mod region;
pub mod snapshot;
pub mod writer;

pub use chunk::{assemble_chunks, DumpableChunk};
pub use dumper::{
    CaptureConfig, CaptureSession, CaptureSummary, ProgressCallback, ProgressInfo, ProgressStage,
};
pub use error::{Error, Result};
pub use freeze::FreezeGuard;
pub use rebuild::{rebuild_image, ModuleTarget, RebuildReport};
pub use region::{committed_regions, MemoryRegion, RegionIter, RegionKind, RegionState};
pub use snapshot::{HeapEntry, HeapList, ModuleInfo};
