//! Filesystem seam for the VM layer
//!
//! The VM subsystem only needs positional reads and writes against an open
//! file, plus the ability to reopen a file so a memory mapping keeps its own
//! handle after the original descriptor is closed. [`Vnode`] is that
//! surface; the filesystem proper lives outside this crate.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

/// An open file as the VM layer sees it. Offsets are absolute; there is no
/// cursor, so handles sharing a vnode never interfere.
pub trait Vnode: Send {
    fn length(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`. Returns the byte count,
    /// short at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Write up to `buf.len()` bytes at `offset`. Does not grow the file;
    /// returns the byte count, short at end of file.
    fn write_at(&mut self, buf: &[u8], offset: u64) -> usize;
}

/// Shared handle to an open file. The mutex is the filesystem's own lock;
/// it is only taken from leaf I/O calls, below every VM lock.
pub type FileRef = Arc<Mutex<dyn Vnode>>;

/// Duplicate a handle onto the same vnode. The clone stays valid after the
/// original is closed (dropped), which is what memory mappings rely on.
pub fn reopen(file: &FileRef) -> FileRef {
    Arc::clone(file)
}

/// In-memory file, used by the tests and the hosted kernel build
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Convenience: a ready-to-share handle
    pub fn new_ref(data: Vec<u8>) -> FileRef {
        Arc::new(Mutex::new(Self::new(data)))
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl Vnode for MemFile {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let len = self.data.len() as u64;
        if offset >= len {
            return 0;
        }
        let n = buf.len().min((len - offset) as usize);
        buf[..n].copy_from_slice(&self.data[offset as usize..offset as usize + n]);
        n
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> usize {
        let len = self.data.len() as u64;
        if offset >= len {
            return 0;
        }
        let n = buf.len().min((len - offset) as usize);
        self.data[offset as usize..offset as usize + n].copy_from_slice(&buf[..n]);
        n
    }
}
