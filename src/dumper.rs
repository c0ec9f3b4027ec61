//! Capture session orchestration.
//!
//! Ties the pieces together: freeze the target, enumerate its address space
//! and snapshot views, assemble chunks, stream them to disk, and optionally
//! realign a module's headers in place. The session is generic over the
//! capability traits in [`crate::process`], so everything here runs against a
//! fake process in tests.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::chunk::{assemble_chunks, DumpableChunk};
use crate::error::{Error, Result};
use crate::freeze::FreezeGuard;
use crate::process::{MemoryReader, ProcessController, RegionQuery, SnapshotSource};
use crate::rebuild::{rebuild_image, ModuleTarget, RebuildReport, HEADER_PROBE_SIZE};
use crate::region::{committed_regions, MemoryRegion, RegionState};
use crate::snapshot::ModuleInfo;
use crate::writer::write_chunk;

/// Progress stage during a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStage {
    Freezing,
    Enumerating,
    WritingChunks,
    Rebuilding,
    Complete,
}

impl ProgressStage {
    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Freezing => "Freezing target",
            Self::Enumerating => "Enumerating memory",
            Self::WritingChunks => "Writing chunks",
            Self::Rebuilding => "Rebuilding image",
            Self::Complete => "Complete",
        }
    }
}

/// Progress information during a capture.
#[derive(Clone, Debug)]
pub struct ProgressInfo {
    /// Current stage.
    pub stage: ProgressStage,
    /// Current item being processed (e.g. a chunk's file stem).
    pub current_item: Option<String>,
    /// Chunks processed so far.
    pub current: usize,
    /// Total chunks.
    pub total: usize,
    /// Bytes written so far.
    pub bytes_written: u64,
}

impl Default for ProgressInfo {
    fn default() -> Self {
        Self {
            stage: ProgressStage::Freezing,
            current_item: None,
            current: 0,
            total: 0,
            bytes_written: 0,
        }
    }
}

/// Progress callback type.
pub type ProgressCallback = Box<dyn Fn(&ProgressInfo) + Send + Sync>;

/// Configuration for a capture session.
pub struct CaptureConfig {
    /// Directory the `.dmp` files are written into.
    pub output_dir: PathBuf,
    /// Progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl CaptureConfig {
    pub fn new<P: Into<PathBuf>>(output_dir: P) -> Self {
        Self {
            output_dir: output_dir.into(),
            progress_callback: None,
        }
    }
}

impl std::fmt::Debug for CaptureConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureConfig")
            .field("output_dir", &self.output_dir)
            .field("progress_callback", &self.progress_callback.is_some())
            .finish()
    }
}

/// What a capture produced.
#[derive(Debug, Default)]
pub struct CaptureSummary {
    pub chunks: usize,
    pub bytes: u64,
    pub files: Vec<PathBuf>,
}

/// One in-flight capture of a single target process.
///
/// Owns no OS resources itself; the borrowed process carries the handles.
/// Captures of the same target must not run concurrently.
pub struct CaptureSession<'p, P: ?Sized> {
    process: &'p P,
    config: CaptureConfig,
}

impl<'p, P> CaptureSession<'p, P>
where
    P: MemoryReader + RegionQuery + ProcessController + SnapshotSource + ?Sized,
{
    pub fn new(process: &'p P, config: CaptureConfig) -> Self {
        Self { process, config }
    }

    fn report(&self, progress: &ProgressInfo) {
        if let Some(ref cb) = self.config.progress_callback {
            cb(progress);
        }
    }

    /// Full capture: every committed region, grouped by module, one `.dmp`
    /// per chunk.
    pub fn capture_chunks(&self) -> Result<CaptureSummary> {
        fs::create_dir_all(&self.config.output_dir)?;
        let mut progress = ProgressInfo::default();
        self.report(&progress);

        let guard = FreezeGuard::freeze(self.process)?;

        progress.stage = ProgressStage::Enumerating;
        self.report(&progress);
        let regions = committed_regions(self.process)?;
        let modules = self.process.modules()?;
        let chunks = assemble_chunks(&regions, &modules);
        info!(
            regions = regions.len(),
            modules = modules.len(),
            chunks = chunks.len(),
            "capture plan assembled"
        );

        let summary = self.write_chunks(chunks.values(), chunks.len(), &mut progress)?;
        drop(guard);

        progress.stage = ProgressStage::Complete;
        self.report(&progress);
        Ok(summary)
    }

    /// Heap-granularity capture: one singleton chunk per heap block.
    pub fn capture_heaps(&self) -> Result<CaptureSummary> {
        fs::create_dir_all(&self.config.output_dir)?;
        let mut progress = ProgressInfo::default();
        self.report(&progress);

        let guard = FreezeGuard::freeze(self.process)?;

        progress.stage = ProgressStage::Enumerating;
        self.report(&progress);
        let entries = self.process.heap_entries()?;
        let chunks: Vec<DumpableChunk> = entries
            .iter()
            .map(|entry| DumpableChunk {
                name: None,
                address: entry.address,
                size: entry.size,
                segments: vec![MemoryRegion {
                    address: entry.address,
                    size: entry.size,
                    protect: 0,
                    state: RegionState::Committed,
                    kind: None,
                }],
            })
            .collect();
        info!(entries = entries.len(), "heap capture plan assembled");

        let summary = self.write_chunks(chunks.iter(), chunks.len(), &mut progress)?;
        drop(guard);

        progress.stage = ProgressStage::Complete;
        self.report(&progress);
        Ok(summary)
    }

    fn write_chunks<'c, I>(
        &self,
        chunks: I,
        total: usize,
        progress: &mut ProgressInfo,
    ) -> Result<CaptureSummary>
    where
        I: Iterator<Item = &'c DumpableChunk>,
    {
        progress.stage = ProgressStage::WritingChunks;
        progress.total = total;
        self.report(progress);

        let mut summary = CaptureSummary::default();
        for chunk in chunks {
            progress.current_item = Some(chunk.file_stem());
            self.report(progress);

            let path = write_chunk(chunk, self.process, &self.config.output_dir)?;
            info!("written dump to {} ({} bytes)", path.display(), chunk.size);
            summary.chunks += 1;
            summary.bytes += chunk.size;
            summary.files.push(path);

            progress.current = summary.chunks;
            progress.bytes_written = summary.bytes;
            self.report(progress);
        }
        Ok(summary)
    }

    /// Find a snapshot module by name, case-insensitively.
    pub fn find_module(&self, name: &str) -> Result<ModuleInfo> {
        let modules = self.process.modules()?;
        modules
            .into_iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::ModuleNotFound(name.to_string()))
    }

    /// Resolve a snapshot module into a rebuild target.
    pub fn module_target(&self, module: &ModuleInfo) -> Result<ModuleTarget> {
        ModuleTarget::resolve(module, self.process)
    }

    /// Realign a previously written module dump in place: re-read the
    /// module's headers from the target, run the reconstructor over them,
    /// rewrite the dump file's header region at offset 0 and append any
    /// overlay.
    pub fn rebuild_module(&self, target: &ModuleTarget, dump_path: &Path) -> Result<RebuildReport> {
        let mut progress = ProgressInfo {
            stage: ProgressStage::Rebuilding,
            current_item: dump_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
            ..Default::default()
        };
        self.report(&progress);

        let mut header = vec![0u8; HEADER_PROBE_SIZE];
        if self.process.read_memory(target.base, &mut header) == 0 {
            return Err(Error::MalformedImage(format!(
                "headers at {:#x} are unreadable",
                target.base
            )));
        }

        let report = rebuild_image(&mut header, target, self.process)?;

        let mut file = OpenOptions::new().read(true).write(true).open(dump_path)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header[..HEADER_PROBE_SIZE])?;
        if header.len() > HEADER_PROBE_SIZE {
            file.seek(SeekFrom::End(0))?;
            file.write_all(&header[HEADER_PROBE_SIZE..])?;
        }

        progress.stage = ProgressStage::Complete;
        self.report(&progress);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_stage_names() {
        assert_eq!(ProgressStage::Freezing.name(), "Freezing target");
        assert_eq!(ProgressStage::Complete.name(), "Complete");
    }

    #[test]
    fn config_debug_hides_the_callback() {
        let mut config = CaptureConfig::new("/tmp/out");
        config.progress_callback = Some(Box::new(|_| {}));
        let rendered = format!("{config:?}");
        assert!(rendered.contains("progress_callback: true"));
    }
}
