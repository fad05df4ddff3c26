//! System-call surface for memory mapping
//!
//! The dispatcher decodes the user's registers and calls in here. mmap
//! argument errors return NULL to the user without killing the process;
//! passing a reserved console descriptor is fatal. The dispatcher turns
//! [`ProcessExit`] into the process kill path.

use crate::fs::FileRef;
use crate::memory::{SpaceId, Vm};

pub const STDIN_FILENO: i32 = 0;
pub const STDOUT_FILENO: i32 = 1;

/// Per-process descriptor table, owned by the process layer
pub trait FdTable {
    fn get_file(&self, fd: i32) -> Option<FileRef>;
}

/// The process must be terminated with this exit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit(pub i32);

/// `mmap(addr, length, writable, fd, offset)` — map a file into the
/// calling process. Returns the mapped address, 0 on argument errors, or
/// [`ProcessExit`] when a console descriptor is passed.
pub fn sys_mmap(
    vm: &mut Vm,
    space: SpaceId,
    fds: &dyn FdTable,
    addr: u64,
    length: u64,
    writable: bool,
    fd: i32,
    offset: u64,
) -> Result<u64, ProcessExit> {
    if fd == STDIN_FILENO || fd == STDOUT_FILENO {
        return Err(ProcessExit(-1));
    }
    let Some(file) = fds.get_file(fd) else {
        return Ok(0);
    };
    Ok(vm
        .mmap(space, addr, length, writable, &file, offset)
        .unwrap_or(0))
}

/// `munmap(addr)` — undo a mapping made by `mmap`. The caller guarantees
/// `addr` is an address `mmap` returned.
pub fn sys_munmap(vm: &mut Vm, space: SpaceId, addr: u64) {
    vm.munmap(space, addr);
}
