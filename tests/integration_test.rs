//! End-to-end capture and rebuild against a simulated target process.
//!
//! The simulated layout:
//! - a module "m.dll" at 0x1000 spanning 0x2000 bytes, with one committed
//!   region inside it
//! - an orphan committed region at 0x5000 belonging to no module
//! - two heap blocks for the heap-granularity capture
//! - a PE32+ module image at 0x1000_0000 for the header rebuild

use std::cell::{Cell, RefCell};
use std::sync::Mutex;

use memmirror::pe::{
    ImageBuffer, SectionHeader, E_LFANEW_OFFSET, FILE_HEADER_SIZE, IMAGE_SCN_MEM_READ,
    OPTIONAL_HEADER64_SIZE, OPTIONAL_MAGIC_PE64, PE_SIGNATURE, SECTION_HEADER_SIZE,
};
use memmirror::error::SnapshotStep;
use memmirror::process::{MemoryReader, ProcessController, RegionQuery, SnapshotSource};
use memmirror::{
    CaptureConfig, CaptureSession, Error, HeapEntry, MemoryRegion, ModuleInfo, ModuleTarget,
    ProgressStage, RegionKind, RegionState, Result,
};

const MODULE_BASE: u64 = 0x1000;
const MODULE_SIZE: u64 = 0x2000;
const ORPHAN_BASE: u64 = 0x5000;

const PE_MODULE_BASE: u64 = 0x1000_0000;
const PE_ENTRY_RVA: u32 = 0x1520;

/// A scripted process: a fixed region map, module/heap snapshots, and
/// byte-addressable memory where explicit blobs override a deterministic
/// per-address pattern.
struct FakeProcess {
    regions: Vec<MemoryRegion>,
    modules: Vec<ModuleInfo>,
    heaps: Vec<HeapEntry>,
    blobs: Vec<(u64, Vec<u8>)>,
    fail_modules: Cell<bool>,
    events: RefCell<Vec<&'static str>>,
}

impl FakeProcess {
    fn new() -> Self {
        Self {
            regions: Vec::new(),
            modules: Vec::new(),
            heaps: Vec::new(),
            blobs: Vec::new(),
            fail_modules: Cell::new(false),
            events: RefCell::new(Vec::new()),
        }
    }

    fn events(&self) -> Vec<&'static str> {
        self.events.borrow().clone()
    }
}

impl MemoryReader for FakeProcess {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> usize {
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = (address + i as u64) as u8;
        }
        for (base, data) in &self.blobs {
            let end = base + data.len() as u64;
            if address < end && address + buf.len() as u64 > *base {
                let from = address.max(*base);
                let to = (address + buf.len() as u64).min(end);
                for a in from..to {
                    buf[(a - address) as usize] = data[(a - base) as usize];
                }
            }
        }
        buf.len()
    }
}

impl RegionQuery for FakeProcess {
    fn query_region(&self, address: u64) -> Option<MemoryRegion> {
        self.regions
            .iter()
            .find(|r| address >= r.address && address < r.end())
            .cloned()
    }
}

impl ProcessController for FakeProcess {
    fn suspend(&self) -> Result<()> {
        self.events.borrow_mut().push("suspend");
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.events.borrow_mut().push("resume");
        Ok(())
    }
}

impl SnapshotSource for FakeProcess {
    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        if self.fail_modules.get() {
            return Err(Error::Snapshot {
                step: SnapshotStep::CreateSnapshot,
                code: 5,
            });
        }
        Ok(self.modules.clone())
    }

    fn heap_entries(&self) -> Result<Vec<HeapEntry>> {
        Ok(self.heaps.clone())
    }
}

fn region(address: u64, size: u64, state: RegionState) -> MemoryRegion {
    MemoryRegion {
        address,
        size,
        protect: 0x04,
        state,
        kind: match state {
            RegionState::Free => None,
            _ => Some(RegionKind::Private),
        },
    }
}

/// The two-region, one-module scenario.
fn scenario_process() -> FakeProcess {
    let mut process = FakeProcess::new();
    process.regions = vec![
        region(0x0, MODULE_BASE, RegionState::Free),
        region(MODULE_BASE, 0x1000, RegionState::Committed),
        region(0x2000, 0x3000, RegionState::Free),
        region(ORPHAN_BASE, 0x1000, RegionState::Committed),
    ];
    process.modules = vec![ModuleInfo {
        name: "m.dll".into(),
        address: MODULE_BASE,
        size: MODULE_SIZE,
        path: None,
    }];
    process
}

#[test]
fn capture_produces_one_file_per_chunk() {
    let process = scenario_process();
    let dir = tempfile::tempdir().unwrap();

    let session = CaptureSession::new(&process, CaptureConfig::new(dir.path()));
    let summary = session.capture_chunks().unwrap();

    assert_eq!(summary.chunks, 2);
    assert_eq!(summary.bytes, MODULE_SIZE + 0x1000);

    let module_dump = dir.path().join("1000-m.dll.dmp");
    let orphan_dump = dir.path().join("5000-UNKNOWN.dmp");
    assert!(module_dump.exists());
    assert!(orphan_dump.exists());

    // Contents come from the simulated memory pattern at the region's own
    // address, laid out at chunk-relative offsets.
    let data = std::fs::read(&module_dump).unwrap();
    assert_eq!(data.len(), 0x1000);
    assert_eq!(data[0], MODULE_BASE as u8);
    assert_eq!(data[0xFF], (MODULE_BASE + 0xFF) as u8);

    let data = std::fs::read(&orphan_dump).unwrap();
    assert_eq!(data[0], ORPHAN_BASE as u8);
}

#[test]
fn target_is_resumed_after_a_successful_capture() {
    let process = scenario_process();
    let dir = tempfile::tempdir().unwrap();

    let session = CaptureSession::new(&process, CaptureConfig::new(dir.path()));
    session.capture_chunks().unwrap();

    assert_eq!(process.events(), vec!["suspend", "resume"]);
}

#[test]
fn target_is_resumed_when_enumeration_fails() {
    let process = scenario_process();
    process.fail_modules.set(true);
    let dir = tempfile::tempdir().unwrap();

    let session = CaptureSession::new(&process, CaptureConfig::new(dir.path()));
    assert!(session.capture_chunks().is_err());

    // The freeze guard must release the target on the error path too.
    assert_eq!(process.events(), vec!["suspend", "resume"]);
}

#[test]
fn progress_runs_from_freezing_to_complete() {
    let process = scenario_process();
    let dir = tempfile::tempdir().unwrap();

    let stages: &'static Mutex<Vec<ProgressStage>> = Box::leak(Box::new(Mutex::new(Vec::new())));
    let mut config = CaptureConfig::new(dir.path());
    config.progress_callback = Some(Box::new(|info| {
        stages.lock().unwrap().push(info.stage);
    }));

    let session = CaptureSession::new(&process, config);
    session.capture_chunks().unwrap();

    let stages = stages.lock().unwrap();
    assert_eq!(*stages.first().unwrap(), ProgressStage::Freezing);
    assert_eq!(*stages.last().unwrap(), ProgressStage::Complete);
    assert!(stages.contains(&ProgressStage::WritingChunks));
}

#[test]
fn heap_capture_writes_one_file_per_block() {
    let mut process = scenario_process();
    process.heaps = vec![
        HeapEntry {
            address: 0x8000,
            size: 0x40,
        },
        HeapEntry {
            address: 0x9000,
            size: 0x20,
        },
    ];
    let dir = tempfile::tempdir().unwrap();

    let session = CaptureSession::new(&process, CaptureConfig::new(dir.path()));
    let summary = session.capture_heaps().unwrap();

    assert_eq!(summary.chunks, 2);
    assert_eq!(summary.bytes, 0x60);
    assert!(dir.path().join("8000-UNKNOWN.dmp").exists());
    assert!(dir.path().join("9000-UNKNOWN.dmp").exists());
    assert_eq!(process.events(), vec!["suspend", "resume"]);
}

/// A valid PE32+ image with two sections, built through the public header
/// codec.
fn pe_module_image() -> Vec<u8> {
    let nt = 0x80usize;
    let mut data = vec![0u8; 0x1000];
    data[0] = b'M';
    data[1] = b'Z';
    data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].copy_from_slice(&(nt as u32).to_le_bytes());
    data[nt..nt + 4].copy_from_slice(&PE_SIGNATURE.to_le_bytes());
    data[nt + 6..nt + 8].copy_from_slice(&2u16.to_le_bytes());
    data[nt + 20..nt + 22].copy_from_slice(&OPTIONAL_HEADER64_SIZE.to_le_bytes());

    let opt = nt + 4 + FILE_HEADER_SIZE;
    let mut image = ImageBuffer::new(&mut data);
    image.write_u16(opt, OPTIONAL_MAGIC_PE64).unwrap();
    image.write_u32(opt + 16, PE_ENTRY_RVA).unwrap(); // AddressOfEntryPoint
    image.write_u32(opt + 32, 0x1000).unwrap(); // SectionAlignment
    image.write_u32(opt + 36, 0x1000).unwrap(); // FileAlignment (in-memory)
    image.write_u32(opt + 108, 16).unwrap(); // NumberOfRvaAndSizes

    let table = opt + OPTIONAL_HEADER64_SIZE as usize;
    for i in 0..2usize {
        let header = SectionHeader {
            name: *b".sect\0\0\0",
            virtual_size: 0x800,
            virtual_address: 0x1000 * (i as u32 + 1),
            size_of_raw_data: 0x800,
            pointer_to_raw_data: 0x1000 * (i as u32 + 1),
            pointer_to_relocations: 0,
            pointer_to_linenumbers: 0,
            number_of_relocations: 0,
            number_of_linenumbers: 0,
            characteristics: IMAGE_SCN_MEM_READ,
        };
        header
            .encode(&mut image, table + i * SECTION_HEADER_SIZE)
            .unwrap();
    }
    data
}

#[test]
fn module_rebuild_rewrites_the_dump_header_in_place() {
    let mut process = scenario_process();
    process.blobs = vec![(PE_MODULE_BASE, pe_module_image())];

    // The persisted dump the capture would have produced, filled with a
    // marker so untouched bytes are recognizable.
    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("10000000-game.exe.dmp");
    std::fs::write(&dump_path, vec![0xEEu8; 0x3000]).unwrap();

    let target = ModuleTarget {
        base: PE_MODULE_BASE,
        entry_point: PE_MODULE_BASE + PE_ENTRY_RVA as u64,
        disk_path: None,
        disk_size: None,
    };

    let session = CaptureSession::new(&process, CaptureConfig::new(dir.path()));
    let report = session.rebuild_module(&target, &dump_path).unwrap();
    assert_eq!(report.sections, 2);
    assert_eq!(report.overlay_bytes, 0);

    let data = std::fs::read(&dump_path).unwrap();
    assert_eq!(data.len(), 0x3000);
    assert_eq!(&data[..2], b"MZ");

    // FileAlignment forced to 0x200 and the entry point kept as an RVA.
    let nt = u32::from_le_bytes(data[E_LFANEW_OFFSET..E_LFANEW_OFFSET + 4].try_into().unwrap())
        as usize;
    let opt = nt + 4 + FILE_HEADER_SIZE;
    assert_eq!(
        u32::from_le_bytes(data[opt + 36..opt + 40].try_into().unwrap()),
        0x200
    );
    assert_eq!(
        u32::from_le_bytes(data[opt + 16..opt + 20].try_into().unwrap()),
        PE_ENTRY_RVA
    );

    // Bytes beyond the header page are untouched.
    assert!(data[0x1000..].iter().all(|&b| b == 0xEE));
}

#[test]
fn module_rebuild_appends_the_overlay_from_process_memory() {
    let mut process = scenario_process();
    process.blobs = vec![(PE_MODULE_BASE, pe_module_image())];

    let dir = tempfile::tempdir().unwrap();
    let dump_path = dir.path().join("10000000-game.exe.dmp");
    std::fs::write(&dump_path, vec![0xEEu8; 0x3000]).unwrap();

    // First pass to learn the implied file size, then pretend the on-disk
    // module is 0x40 bytes longer.
    let mut target = ModuleTarget {
        base: PE_MODULE_BASE,
        entry_point: PE_MODULE_BASE + PE_ENTRY_RVA as u64,
        disk_path: None,
        disk_size: None,
    };
    let session = CaptureSession::new(&process, CaptureConfig::new(dir.path()));
    let implied = session
        .rebuild_module(&target, &dump_path)
        .unwrap()
        .implied_file_size;
    target.disk_size = Some(implied + 0x40);

    let report = session.rebuild_module(&target, &dump_path).unwrap();
    assert_eq!(report.overlay_bytes, 0x40);

    let data = std::fs::read(&dump_path).unwrap();
    assert_eq!(data.len(), 0x3000 + 0x40);
    // The overlay came out of process memory at base + impliedFileSize,
    // which the fixture image covers.
    let expected: Vec<u8> = pe_module_image()
        [implied as usize..implied as usize + 0x40]
        .to_vec();
    assert_eq!(&data[0x3000..], &expected[..]);
}

#[test]
fn module_target_resolves_entry_point_and_disk_size() {
    let mut process = scenario_process();
    process.blobs = vec![(PE_MODULE_BASE, pe_module_image())];

    let dir = tempfile::tempdir().unwrap();
    let disk_file = dir.path().join("game.exe");
    std::fs::write(&disk_file, vec![0u8; 0x1234]).unwrap();

    let info = ModuleInfo {
        name: "game.exe".into(),
        address: PE_MODULE_BASE,
        size: 0x3000,
        path: Some(disk_file),
    };

    let target = ModuleTarget::resolve(&info, &process).unwrap();
    assert_eq!(target.base, PE_MODULE_BASE);
    assert_eq!(target.entry_point, PE_MODULE_BASE + PE_ENTRY_RVA as u64);
    assert_eq!(target.disk_size, Some(0x1234));
}
