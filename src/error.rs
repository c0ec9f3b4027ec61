//! Error types for memmirror.

use thiserror::Error;

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

/// The enumeration step that failed while walking a process snapshot.
///
/// Surfaced in [`Error::Snapshot`] so a caller can tell exactly where a
/// toolhelp walk broke (first-list vs next-list vs first-entry vs next-entry).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotStep {
    CreateSnapshot,
    ModuleFirst,
    ModuleNext,
    HeapListFirst,
    HeapListNext,
    HeapEntryFirst,
    HeapEntryNext,
}

impl SnapshotStep {
    /// Human-readable name of the failing call.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateSnapshot => "create snapshot",
            Self::ModuleFirst => "first module entry",
            Self::ModuleNext => "next module entry",
            Self::HeapListFirst => "first heap list",
            Self::HeapListNext => "next heap list",
            Self::HeapEntryFirst => "first heap entry",
            Self::HeapEntryNext => "next heap entry",
        }
    }
}

impl std::fmt::Display for SnapshotStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors that can occur during capture and reconstruction.
#[derive(Error, Debug)]
pub enum Error {
    #[error("process {pid} is unavailable (exited or inaccessible)")]
    ProcessUnavailable { pid: u32 },

    #[error("snapshot enumeration failed at {step} (os error {code})")]
    Snapshot { step: SnapshotStep, code: u32 },

    #[error("failed to query memory region at 0x{address:X}")]
    RegionQuery { address: u64 },

    #[error("malformed image: {0}")]
    MalformedImage(String),

    #[error("segment 0x{segment:X} lies below its chunk base 0x{chunk:X}")]
    ChunkGeometry { chunk: u64, segment: u64 },

    #[error("module '{0}' not found in capture")]
    ModuleNotFound(String),

    #[cfg(target_os = "windows")]
    #[error("windows API error: {0}")]
    WindowsApi(#[from] windows::core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
