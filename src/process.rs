//! Target process access.
//!
//! The enumerators, assembler and writer never touch the OS directly; they
//! work against the capability traits below so the whole capture pipeline can
//! run against a fake process image in tests. [`WindowsProcess`] is the one
//! real implementation, backed by VirtualQueryEx, ReadProcessMemory and the
//! toolhelp snapshot API.

use crate::error::Result;
use crate::region::MemoryRegion;
use crate::snapshot::{HeapEntry, ModuleInfo};

#[cfg(target_os = "windows")]
use crate::error::{Error, SnapshotStep};
#[cfg(target_os = "windows")]
use crate::snapshot::{self, HeapList, SnapshotWalk, WalkStep};
#[cfg(target_os = "windows")]
use crate::region::{RegionKind, RegionState};

#[cfg(target_os = "windows")]
use std::ffi::c_void;

#[cfg(target_os = "windows")]
use windows::Win32::{
    Foundation::{CloseHandle, HANDLE},
    System::Diagnostics::Debug::ReadProcessMemory,
    System::Diagnostics::ToolHelp::{
        CreateToolhelp32Snapshot, Heap32First, Heap32ListFirst, Heap32ListNext, Heap32Next,
        Module32FirstW, Module32NextW, Thread32First, Thread32Next,
        CREATE_TOOLHELP_SNAPSHOT_FLAGS, HEAPENTRY32, HEAPLIST32, MODULEENTRY32W,
        TH32CS_SNAPHEAPLIST, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPTHREAD,
        THREADENTRY32,
    },
    System::Memory::{
        VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT, MEM_FREE, MEM_IMAGE, MEM_MAPPED,
        MEM_PRIVATE, MEM_RESERVE,
    },
    System::Threading::{
        OpenProcess, OpenThread, ResumeThread, SuspendThread, PROCESS_QUERY_INFORMATION,
        PROCESS_VM_READ, THREAD_SUSPEND_RESUME,
    },
};

/// Reads raw bytes out of the target's address space.
pub trait MemoryReader {
    /// Read up to `buf.len()` bytes at `address`; returns the number of bytes
    /// actually read. A failed read returns 0 rather than an error; callers
    /// substitute zeroed bytes so output offsets stay stable.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> usize;
}

/// One VirtualQuery-style probe of the target's address space.
pub trait RegionQuery {
    /// The region containing `address`, or `None` when no region is
    /// enumerable there.
    fn query_region(&self, address: u64) -> Option<MemoryRegion>;
}

/// Suspends and resumes every thread of the target.
pub trait ProcessController {
    fn suspend(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
}

/// Point-in-time module and heap views of the target.
pub trait SnapshotSource {
    fn modules(&self) -> Result<Vec<ModuleInfo>>;
    fn heap_entries(&self) -> Result<Vec<HeapEntry>>;
}

/// Owning wrapper around a raw OS handle, closed on drop.
#[cfg(target_os = "windows")]
struct OwnedHandle(HANDLE);

#[cfg(target_os = "windows")]
impl OwnedHandle {
    fn as_raw(&self) -> HANDLE {
        self.0
    }
}

#[cfg(target_os = "windows")]
impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

/// Extract the Win32 error code from a windows-crate error.
#[cfg(target_os = "windows")]
fn win32_code(err: &windows::core::Error) -> u32 {
    (err.code().0 & 0xFFFF) as u32
}

#[cfg(target_os = "windows")]
fn utf16_until_nul(raw: &[u16]) -> String {
    let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..end])
}

/// A live target process opened for querying and reading.
#[cfg(target_os = "windows")]
pub struct WindowsProcess {
    pid: u32,
    handle: OwnedHandle,
}

#[cfg(target_os = "windows")]
impl WindowsProcess {
    /// Open the target for query and read access. An exited or inaccessible
    /// target fails with `ProcessUnavailable` before any enumeration starts.
    pub fn open(pid: u32) -> Result<Self> {
        let handle = unsafe {
            OpenProcess(PROCESS_QUERY_INFORMATION | PROCESS_VM_READ, false, pid)
        }
        .map_err(|_| Error::ProcessUnavailable { pid })?;

        Ok(Self {
            pid,
            handle: OwnedHandle(handle),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Run `f` over an open handle to every thread of the target. Threads
    /// that cannot be opened (exited, access denied) are skipped. Returns how
    /// many threads were touched.
    fn for_each_thread(&self, mut f: impl FnMut(HANDLE)) -> Result<usize> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) }
            .map_err(|_| Error::ProcessUnavailable { pid: self.pid })?;
        let snapshot = OwnedHandle(snapshot);

        let mut entry = THREADENTRY32 {
            dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
            ..Default::default()
        };

        let mut touched = 0;
        let mut more = unsafe { Thread32First(snapshot.as_raw(), &mut entry) }.is_ok();
        while more {
            if entry.th32OwnerProcessID == self.pid {
                if let Ok(thread) =
                    unsafe { OpenThread(THREAD_SUSPEND_RESUME, false, entry.th32ThreadID) }
                {
                    let thread = OwnedHandle(thread);
                    f(thread.as_raw());
                    touched += 1;
                }
            }
            more = unsafe { Thread32Next(snapshot.as_raw(), &mut entry) }.is_ok();
        }

        Ok(touched)
    }
}

#[cfg(target_os = "windows")]
impl RegionQuery for WindowsProcess {
    fn query_region(&self, address: u64) -> Option<MemoryRegion> {
        let mut info = MEMORY_BASIC_INFORMATION::default();
        let written = unsafe {
            VirtualQueryEx(
                self.handle.as_raw(),
                Some(address as *const c_void),
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            return None;
        }

        let state = match info.State {
            s if s == MEM_COMMIT => RegionState::Committed,
            s if s == MEM_RESERVE => RegionState::Reserved,
            s if s == MEM_FREE => RegionState::Free,
            _ => RegionState::Free,
        };
        let kind = match info.Type {
            t if t == MEM_IMAGE => Some(RegionKind::Image),
            t if t == MEM_MAPPED => Some(RegionKind::Mapped),
            t if t == MEM_PRIVATE => Some(RegionKind::Private),
            _ => None,
        };

        Some(MemoryRegion {
            address: info.BaseAddress as u64,
            size: info.RegionSize as u64,
            protect: info.Protect.0,
            state,
            kind,
        })
    }
}

#[cfg(target_os = "windows")]
impl MemoryReader for WindowsProcess {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }

        let mut bytes_read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.handle.as_raw(),
                address as *const c_void,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                Some(&mut bytes_read),
            )
        }
        .is_ok();

        if ok {
            bytes_read
        } else {
            0
        }
    }
}

#[cfg(target_os = "windows")]
impl ProcessController for WindowsProcess {
    fn suspend(&self) -> Result<()> {
        let touched = self.for_each_thread(|thread| unsafe {
            SuspendThread(thread);
        })?;

        // A live process always has at least one thread.
        if touched == 0 {
            return Err(Error::ProcessUnavailable { pid: self.pid });
        }
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        self.for_each_thread(|thread| {
            // Drain the suspend count: a thread may have been suspended more
            // than once, by this tool or by the OS. The call returns the
            // previous count; stop once it reaches zero (or errors).
            loop {
                let previous = unsafe { ResumeThread(thread) };
                if previous == 0 || previous == u32::MAX {
                    break;
                }
            }
        })?;
        Ok(())
    }
}

/// Toolhelp snapshot handle plus the cursor structures the first/next API
/// threads its state through.
#[cfg(target_os = "windows")]
struct ToolhelpWalk {
    handle: OwnedHandle,
    module_entry: MODULEENTRY32W,
    heap_list: HEAPLIST32,
    heap_entry: HEAPENTRY32,
}

#[cfg(target_os = "windows")]
impl ToolhelpWalk {
    fn open(flags: CREATE_TOOLHELP_SNAPSHOT_FLAGS, pid: u32) -> Result<Self> {
        let handle = unsafe { CreateToolhelp32Snapshot(flags, pid) }.map_err(|e| Error::Snapshot {
            step: SnapshotStep::CreateSnapshot,
            code: win32_code(&e),
        })?;

        Ok(Self {
            handle: OwnedHandle(handle),
            module_entry: MODULEENTRY32W {
                dwSize: std::mem::size_of::<MODULEENTRY32W>() as u32,
                ..Default::default()
            },
            heap_list: HEAPLIST32 {
                dwSize: std::mem::size_of::<HEAPLIST32>(),
                ..Default::default()
            },
            heap_entry: HEAPENTRY32 {
                dwSize: std::mem::size_of::<HEAPENTRY32>(),
                ..Default::default()
            },
        })
    }

    fn current_module(&self) -> ModuleInfo {
        let name = utf16_until_nul(&self.module_entry.szModule);
        let path = utf16_until_nul(&self.module_entry.szExePath);
        ModuleInfo {
            name,
            address: self.module_entry.modBaseAddr as u64,
            size: self.module_entry.modBaseSize as u64,
            path: (!path.is_empty()).then(|| path.into()),
        }
    }

    fn current_heap_list(&self) -> HeapList {
        HeapList {
            process_id: self.heap_list.th32ProcessID,
            heap_id: self.heap_list.th32HeapID as u64,
        }
    }

    fn current_heap_entry(&self) -> HeapEntry {
        HeapEntry {
            address: self.heap_entry.dwAddress as u64,
            size: self.heap_entry.dwBlockSize as u64,
        }
    }
}

#[cfg(target_os = "windows")]
impl SnapshotWalk for ToolhelpWalk {
    fn first_module(&mut self) -> WalkStep<ModuleInfo> {
        self.module_entry.dwSize = std::mem::size_of::<MODULEENTRY32W>() as u32;
        match unsafe { Module32FirstW(self.handle.as_raw(), &mut self.module_entry) } {
            Ok(()) => WalkStep::Item(self.current_module()),
            Err(e) => WalkStep::Failed(win32_code(&e)),
        }
    }

    fn next_module(&mut self) -> WalkStep<ModuleInfo> {
        match unsafe { Module32NextW(self.handle.as_raw(), &mut self.module_entry) } {
            Ok(()) => WalkStep::Item(self.current_module()),
            Err(e) => WalkStep::Failed(win32_code(&e)),
        }
    }

    fn first_heap_list(&mut self) -> WalkStep<HeapList> {
        self.heap_list.dwSize = std::mem::size_of::<HEAPLIST32>();
        match unsafe { Heap32ListFirst(self.handle.as_raw(), &mut self.heap_list) } {
            Ok(()) => WalkStep::Item(self.current_heap_list()),
            Err(e) => WalkStep::Failed(win32_code(&e)),
        }
    }

    fn next_heap_list(&mut self) -> WalkStep<HeapList> {
        self.heap_list.dwSize = std::mem::size_of::<HEAPLIST32>();
        match unsafe { Heap32ListNext(self.handle.as_raw(), &mut self.heap_list) } {
            Ok(()) => WalkStep::Item(self.current_heap_list()),
            Err(e) => WalkStep::Failed(win32_code(&e)),
        }
    }

    fn first_heap_entry(&mut self, list: &HeapList) -> WalkStep<HeapEntry> {
        self.heap_entry = HEAPENTRY32 {
            dwSize: std::mem::size_of::<HEAPENTRY32>(),
            ..Default::default()
        };
        match unsafe {
            Heap32First(&mut self.heap_entry, list.process_id, list.heap_id as usize)
        } {
            Ok(()) => WalkStep::Item(self.current_heap_entry()),
            Err(e) => WalkStep::Failed(win32_code(&e)),
        }
    }

    fn next_heap_entry(&mut self) -> WalkStep<HeapEntry> {
        match unsafe { Heap32Next(&mut self.heap_entry) } {
            Ok(()) => WalkStep::Item(self.current_heap_entry()),
            Err(e) => WalkStep::Failed(win32_code(&e)),
        }
    }
}

#[cfg(target_os = "windows")]
impl SnapshotSource for WindowsProcess {
    fn modules(&self) -> Result<Vec<ModuleInfo>> {
        let mut walk = ToolhelpWalk::open(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, self.pid)?;
        snapshot::enumerate_modules(&mut walk)
    }

    fn heap_entries(&self) -> Result<Vec<HeapEntry>> {
        let mut walk = ToolhelpWalk::open(TH32CS_SNAPHEAPLIST, self.pid)?;
        snapshot::enumerate_heap_entries(&mut walk)
    }
}
