//! Cooperative process substrate
//!
//! Programs run in the kernel's address space and are entered by a
//! plain function call -- no trap, no context switch. One process record
//! is "current" at a time; a nested `exec` replaces it and the outer
//! caller resumes when the inner program returns. PIDs are never
//! reused.

use alloc::vec;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::{KernelResult, ProcessError};
use crate::kapi;

/// Process name limit in bytes.
pub const PROCESS_NAME_MAX: usize = 32;
/// Stack handed to each program.
pub const PROCESS_STACK_SIZE: usize = 16 * 1024;

/// Entry signature every program exports:
/// `int main(kapi_t *api, int argc, char **argv)` under AAPCS64.
pub type ProgramEntry = unsafe extern "C" fn(*mut kapi::KernelApi, i32, *mut *mut u8) -> i32;

/// The single-slot process record.
pub struct Process {
    pub pid: u64,
    name: [u8; PROCESS_NAME_MAX],
    name_len: usize,
    pub entry: u64,
    /// The 16 KiB stack allocation. Present while the process runs;
    /// released when it completes. The program is entered by direct
    /// call (so it executes on the caller's stack); the allocation is
    /// recorded so `sp` can be reported and the lifecycle observed.
    stack: Option<Vec<u8>>,
    /// Top of the stack allocation, 16-byte aligned downward.
    pub stack_top: u64,
    pub exit_status: i32,
    pub running: bool,
}

impl Process {
    fn new(pid: u64, name: &str, entry: u64) -> Result<Self, ProcessError> {
        let stack = vec![0u8; PROCESS_STACK_SIZE];
        let stack_top = (stack.as_ptr() as u64 + PROCESS_STACK_SIZE as u64) & !0xF;

        let mut record = Self {
            pid,
            name: [0; PROCESS_NAME_MAX],
            name_len: 0,
            entry,
            stack: Some(stack),
            stack_top,
            exit_status: 0,
            running: false,
        };
        let bytes = name.as_bytes();
        let len = bytes.len().min(PROCESS_NAME_MAX);
        record.name[..len].copy_from_slice(&bytes[..len]);
        record.name_len = len;
        Ok(record)
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("")
    }
}

static CURRENT: Mutex<Option<Process>> = Mutex::new(None);
static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Observe the current (or most recently finished) process record.
pub fn with_current<R>(f: impl FnOnce(&Process) -> R) -> Option<R> {
    CURRENT.lock().as_ref().map(f)
}

/// Snapshot of the record for the kapi process-enumeration family.
pub fn current_status() -> Option<(u64, i32, bool, bool)> {
    with_current(|p| (p.pid, p.exit_status, p.running, p.stack.is_some()))
}

pub fn init() {
    *CURRENT.lock() = None;
    println!("[PROC] Process subsystem initialized");
}

/// Marshal arguments into NUL-terminated buffers plus a pointer array.
fn build_argv(args: &[&str]) -> (Vec<Vec<u8>>, Vec<*mut u8>) {
    let mut storage: Vec<Vec<u8>> = args
        .iter()
        .map(|a| {
            let mut bytes = a.as_bytes().to_vec();
            bytes.push(0);
            bytes
        })
        .collect();
    let pointers: Vec<*mut u8> = storage.iter_mut().map(|b| b.as_mut_ptr()).collect();
    (storage, pointers)
}

/// Run a loaded image: create the record, call the entry, reap.
///
/// # Safety
///
/// `entry` must be the entry address of a successfully loaded program
/// that follows the `(kapi, argc, argv) -> int` ABI.
unsafe fn run(name: &str, entry: u64, args: &[&str]) -> KernelResult<i32> {
    let pid = NEXT_PID.fetch_add(1, Ordering::Relaxed);
    let mut record = Process::new(pid, name, entry).map_err(crate::error::KernelError::from)?;
    record.running = true;

    println!("[PROC] Starting '{}' (pid {}) at {:#x}", name, pid, entry);

    // Nested exec replaces the slot; the outer program's record is gone
    // but its stack frames live on and resume when we return.
    *CURRENT.lock() = Some(record);

    let (_storage, mut pointers) = build_argv(args);
    let argc = pointers.len() as i32;
    let argv = pointers.as_mut_ptr();

    // SAFETY: per the function contract the address follows the frozen
    // program ABI. The kapi table outlives every program.
    let status = unsafe {
        let entry_fn: ProgramEntry = core::mem::transmute(entry as usize);
        entry_fn(kapi::table_ptr(), argc, argv)
    };

    let mut current = CURRENT.lock();
    if let Some(proc) = current.as_mut() {
        proc.running = false;
        proc.exit_status = status;
        proc.stack = None; // release the 16 KiB back to the heap
    }
    drop(current);

    println!("[PROC] Process '{}' returned {}", name, status);
    Ok(status)
}

/// Execute a program image already in memory (the exec tail shared by
/// the path and test entry points).
pub fn exec_image(image: &[u8], name: &str, args: &[&str]) -> KernelResult<i32> {
    // SAFETY: the loader copies PT_LOAD segments into the program load
    // area, which the heap never reaches.
    let entry = unsafe { crate::elf::load(image) }.map_err(ProcessError::LoadFailed)?;
    // SAFETY: a validated ET_EXEC image's entry follows the program ABI.
    unsafe { run(name, entry, args) }
}

/// Execute a program from the filesystem, waiting for it to finish.
/// Returns its exit status.
pub fn exec_args(path: &str, args: &[&str]) -> KernelResult<i32> {
    let image = crate::fs::with_volume(|vol| {
        let entry = vol.resolve(path).map_err(|_| ProcessError::NotFound)?;
        if entry.is_directory() {
            return Err(ProcessError::IsADirectory.into());
        }
        if entry.size == 0 {
            return Err(ProcessError::EmptyImage.into());
        }
        let mut image = vec![0u8; entry.size as usize];
        vol.read_file(path, &mut image)?;
        Ok(image)
    })?;

    exec_image(&image, path, args)
}

/// `exec` with the conventional single-argument argv.
pub fn exec(path: &str) -> KernelResult<i32> {
    exec_args(path, &[path])
}

/// Start a program. The contract is "returns immediately"; with the
/// single-slot substrate there is no ready queue, so the program runs
/// to completion first and `spawn` returns its pid.
pub fn spawn(path: &str) -> KernelResult<u64> {
    exec(path)?;
    Ok(current_status().map(|(pid, ..)| pid).unwrap_or(0))
}

/// Early termination for programs that do not want to unwind to main.
///
/// There is no continuation to return to, so this records the status
/// and parks the CPU. Portable programs should return from `main`
/// instead.
pub fn exit(status: i32) -> ! {
    if let Some(proc) = CURRENT.lock().as_mut() {
        println!(
            "[PROC] Process '{}' (pid {}) exited with status {}",
            proc.name(),
            proc.pid,
            status
        );
        proc.exit_status = status;
        proc.running = false;
        proc.stack = None;
    }

    loop {
        crate::hal::wfi();
    }
}

/// Cooperative hand-off: pump the polled subsystems, then resume. No
/// client-visible state advances beyond what those subsystems change.
pub fn yield_now() {
    crate::net::poll();
    crate::hal::input_poll();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::{EHDR_SIZE, PHDR_SIZE};

    // The substrate is a process-wide singleton; keep tests that touch
    // it from interleaving.
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    /// A minimal ET_EXEC image with no segments whose entry is an
    /// in-process function, so the whole exec pipeline can run on the
    /// host.
    fn image_for(entry: u64) -> Vec<u8> {
        let mut img = vec![0u8; EHDR_SIZE + PHDR_SIZE];
        img[0..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
        img[4] = 2; // 64-bit
        img[5] = 1; // little-endian
        img[6] = 1;
        img[16..18].copy_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        img[18..20].copy_from_slice(&0xB7u16.to_le_bytes()); // AArch64
        img[24..32].copy_from_slice(&entry.to_le_bytes());
        img[54..56].copy_from_slice(&(PHDR_SIZE as u16).to_le_bytes());
        // phnum = 0: nothing to copy, entry used as-is.
        img
    }

    unsafe extern "C" fn returns_42(
        _api: *mut kapi::KernelApi,
        _argc: i32,
        _argv: *mut *mut u8,
    ) -> i32 {
        42
    }

    unsafe extern "C" fn counts_args(
        _api: *mut kapi::KernelApi,
        argc: i32,
        argv: *mut *mut u8,
    ) -> i32 {
        // Sum argc with the length of argv[0].
        let first = unsafe { *argv };
        let mut len = 0;
        while unsafe { *first.add(len) } != 0 {
            len += 1;
        }
        argc * 100 + len as i32
    }

    #[test]
    fn exec_reports_exit_status_and_frees_stack() {
        let _guard = TEST_LOCK.lock();
        let img = image_for(returns_42 as usize as u64);
        let status = exec_image(&img, "hello", &["hello"]).unwrap();
        assert_eq!(status, 42);

        let (pid, exit_status, running, has_stack) = current_status().unwrap();
        assert!(pid >= 1);
        assert_eq!(exit_status, 42);
        assert!(!running);
        assert!(!has_stack, "stack must be released after return");
    }

    #[test]
    fn argv_reaches_the_program() {
        let _guard = TEST_LOCK.lock();
        let img = image_for(counts_args as usize as u64);
        let status = exec_image(&img, "args", &["args", "one", "two"]).unwrap();
        // argc == 3, argv[0] == "args" (4 bytes).
        assert_eq!(status, 304);
    }

    #[test]
    fn pids_are_monotonic() {
        let _guard = TEST_LOCK.lock();
        let img = image_for(returns_42 as usize as u64);
        exec_image(&img, "a", &["a"]).unwrap();
        let first = current_status().unwrap().0;
        exec_image(&img, "b", &["b"]).unwrap();
        let second = current_status().unwrap().0;
        assert!(second > first);
    }

    #[test]
    fn exec_of_garbage_fails_with_load_error() {
        let _guard = TEST_LOCK.lock();
        let err = exec_image(b"not an elf", "bad", &[]).unwrap_err();
        assert!(matches!(
            err,
            crate::error::KernelError::ProcessError(ProcessError::LoadFailed(_))
        ));
    }

    #[test]
    fn record_name_truncates_to_limit() {
        let long = "x".repeat(64);
        let record = Process::new(1, &long, 0).unwrap();
        assert_eq!(record.name().len(), PROCESS_NAME_MAX);
        assert_eq!(record.stack_top % 16, 0);
    }
}
