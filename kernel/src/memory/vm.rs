//! VM orchestration — address spaces, the fault handler, mmap/munmap
//!
//! One [`Vm`] value owns the whole subsystem: the user frame pool, the
//! global frame table with its clock ring, the swap slot store, and every
//! process address space (supplemental page table + page directory). All
//! entry points take `&mut self`; the embedding kernel wraps the value in
//! its VM lock.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::fs::{self, FileRef};

use super::frame::{FrameTable, UserPool};
use super::page::{Backing, FileSpan, FirstTouch, Page, PageKind, PageMarkers};
use super::paging::PageDirectory;
use super::spt::SupplementalPageTable;
use super::swap::{SwapDev, SwapTable};
use super::{
    is_page_aligned, is_user_address, page_ceil, page_floor, PageSlot, SpaceId, VmConfig,
    PAGE_SIZE, USER_FRAMES_MAX, USER_FRAMES_MIN, USER_STACK_TOP,
};

/// Statistics: faults resolved by the handler
static FAULTS_RESOLVED: AtomicU64 = AtomicU64::new(0);
/// Statistics: stack pages grown on demand
static STACK_GROWTHS: AtomicU64 = AtomicU64::new(0);

// Page fault error code bits, as pushed by the CPU
pub const PF_PRESENT: u64 = 1 << 0;
pub const PF_WRITE: u64 = 1 << 1;
pub const PF_USER: u64 = 1 << 2;

/// A decoded page fault, as handed to [`Vm::try_handle_fault`]
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// Faulting address
    pub addr: u64,
    /// Write access
    pub write: bool,
    /// Fault taken in user mode
    pub user: bool,
    /// Translation was absent (as opposed to a protection violation)
    pub not_present: bool,
    /// Stack pointer from the trap frame
    pub rsp: u64,
    /// User stack pointer saved at syscall entry, for kernel-mode faults
    /// on user addresses
    pub saved_user_rsp: u64,
}

impl PageFault {
    pub fn from_error_code(addr: u64, error_code: u64, rsp: u64, saved_user_rsp: u64) -> Self {
        Self {
            addr,
            write: error_code & PF_WRITE != 0,
            user: error_code & PF_USER != 0,
            not_present: error_code & PF_PRESENT == 0,
            rsp,
            saved_user_rsp,
        }
    }
}

/// One process's view of memory: its SPT and its hardware page table
pub struct AddressSpace {
    pub(crate) spt: SupplementalPageTable,
    pub(crate) pd: PageDirectory,
}

impl AddressSpace {
    fn new() -> Self {
        Self {
            spt: SupplementalPageTable::new(),
            pd: PageDirectory::new(),
        }
    }

    pub fn spt(&self) -> &SupplementalPageTable {
        &self.spt
    }

    /// Resolve a user address through the hardware page table
    pub fn translate(&self, va: u64) -> Option<u64> {
        self.pd.translate(va)
    }
}

/// The virtual memory subsystem
pub struct Vm {
    pub(crate) pool: UserPool,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapTable,
    pub(crate) spaces: BTreeMap<SpaceId, AddressSpace>,
    stack_limit: u64,
}

impl Vm {
    /// Bring up the subsystem: frame pool, frame table, swap slots
    pub fn new(cfg: VmConfig, swap_dev: Box<dyn SwapDev>) -> Self {
        let user_frames = cfg.user_frames.clamp(USER_FRAMES_MIN, USER_FRAMES_MAX);
        let swap = SwapTable::new(swap_dev);
        log::info!(
            "[VM] initialized: {} user frames, {} swap slots",
            user_frames,
            swap.slot_count()
        );
        Self {
            pool: UserPool::new(user_frames),
            frames: FrameTable::new(),
            swap,
            spaces: BTreeMap::new(),
            stack_limit: cfg.stack_limit,
        }
    }

    // ------------------------------------------------------------------
    // Address spaces
    // ------------------------------------------------------------------

    /// Construct the SPT and page directory for a new process
    pub fn create_space(&mut self, id: SpaceId) -> bool {
        if self.spaces.contains_key(&id) {
            return false;
        }
        self.spaces.insert(id, AddressSpace::new());
        true
    }

    pub fn space(&self, id: SpaceId) -> Option<&AddressSpace> {
        self.spaces.get(&id)
    }

    /// Tear down a process's address space: destroy every page, release
    /// every resident frame. Dirty file-backed pages are not flushed;
    /// munmap is the flush point.
    pub fn destroy_space(&mut self, id: SpaceId) {
        let Some(space) = self.spaces.remove(&id) else {
            return;
        };
        let mut pages = space.spt.pages;
        for (_, page) in pages.iter_mut() {
            if let Some(fid) = page.frame.take() {
                self.frames.release(fid, &mut self.pool);
            }
            page.destroy(&mut self.swap);
        }
        log::debug!("[VM] space {} destroyed ({} pages)", id, pages.len());
    }

    /// Fork-time duplication: every pending page is re-registered with the
    /// same first-touch recipe; every materialized page is allocated,
    /// claimed, and byte-copied into `dst`. Copy-on-write is out of scope,
    /// so the copy is eager.
    pub fn copy_space(&mut self, dst: SpaceId, src: SpaceId) -> bool {
        if dst == src || !self.spaces.contains_key(&dst) {
            return false;
        }
        let Some(src_space) = self.spaces.get(&src) else {
            return false;
        };

        enum Dup {
            Pending(FirstTouch),
            Materialized { kind: PageKind, span: Option<FileSpan> },
        }

        let plan: Vec<(u64, bool, PageMarkers, Dup)> = src_space
            .spt
            .iter()
            .map(|page| {
                let dup = match &page.backing {
                    Backing::Uninit(touch) => Dup::Pending(touch.clone()),
                    Backing::Anon { .. } => Dup::Materialized {
                        kind: PageKind::Anon,
                        span: None,
                    },
                    Backing::File { span } => Dup::Materialized {
                        kind: PageKind::File,
                        span: Some(span.clone()),
                    },
                };
                (page.va, page.writable, page.markers, dup)
            })
            .collect();

        for (va, writable, markers, dup) in plan {
            match dup {
                Dup::Pending(touch) => {
                    if !self.alloc_page_with_initializer(dst, touch, va, writable, markers) {
                        return false;
                    }
                }
                Dup::Materialized { kind, span } => {
                    // The source may have been evicted (possibly by this
                    // very copy); bring it back before reading its bytes.
                    let resident = self
                        .spaces
                        .get(&src)
                        .and_then(|s| s.spt.find(va))
                        .map_or(false, |p| p.is_resident());
                    if !resident && !self.claim_page(src, va) {
                        return false;
                    }
                    let bytes = {
                        let kva = self.page_kva(src, va).expect("resident source page");
                        self.pool.page(kva).to_vec()
                    };
                    let src_dirty = self
                        .spaces
                        .get(&src)
                        .map_or(false, |s| s.pd.is_dirty(va));

                    let target = match kind {
                        PageKind::File => FirstTouch::File {
                            span: span.expect("file page has a span"),
                        },
                        _ => FirstTouch::Anon { init: None },
                    };
                    if !self.alloc_page_with_initializer(dst, target, va, writable, markers) {
                        return false;
                    }
                    if !self.claim_page(dst, va) {
                        return false;
                    }
                    let kva = self.page_kva(dst, va).expect("resident destination page");
                    self.pool.page_mut(kva).copy_from_slice(&bytes);
                    if src_dirty {
                        // mirror the hardware state so a dirty source's
                        // content survives eviction of the fresh copy
                        if let Some(space) = self.spaces.get_mut(&dst) {
                            space.pd.set_dirty(va, true);
                        }
                    }
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Page registration and materialization
    // ------------------------------------------------------------------

    /// Register a pending page: it enters the SPT in the UNINIT variant
    /// and materializes as `target` on first touch. Fails on a collision
    /// or a bad address.
    pub fn alloc_page_with_initializer(
        &mut self,
        id: SpaceId,
        target: FirstTouch,
        va: u64,
        writable: bool,
        markers: PageMarkers,
    ) -> bool {
        if !is_page_aligned(va) || !is_user_address(va) {
            return false;
        }
        let Some(space) = self.spaces.get_mut(&id) else {
            return false;
        };
        space.spt.insert(Page::new(va, writable, markers, target))
    }

    /// Register a plain anonymous page (zero-filled on first touch)
    pub fn alloc_page(&mut self, id: SpaceId, va: u64, writable: bool, markers: PageMarkers) -> bool {
        self.alloc_page_with_initializer(id, FirstTouch::Anon { init: None }, va, writable, markers)
    }

    /// Force materialization of the page at `va`: acquire a frame, link
    /// page and frame, install the hardware mapping, pull the content in.
    pub fn claim_page(&mut self, id: SpaceId, va: u64) -> bool {
        let va = page_floor(va);
        {
            let Some(space) = self.spaces.get(&id) else {
                return false;
            };
            let Some(page) = space.spt.find(va) else {
                return false;
            };
            if page.is_resident() {
                return false;
            }
        }

        // May evict; the victim can live in any space.
        let fid = self
            .frames
            .acquire(&mut self.pool, &mut self.swap, &mut self.spaces);
        let kva = self.frames.get(fid).kva;

        let space = self.spaces.get_mut(&id).expect("space checked above");
        let page = space.spt.find_mut(va).expect("page checked above");

        self.frames.get_mut(fid).owner = Some(PageSlot { space: id, va });
        page.frame = Some(fid);

        if !space.pd.map(va, kva, page.writable) {
            page.frame = None;
            self.frames.get_mut(fid).owner = None;
            return false;
        }
        if !page.swap_in(&mut self.swap, self.pool.page_mut(kva)) {
            space.pd.unmap(va);
            page.frame = None;
            self.frames.get_mut(fid).owner = None;
            return false;
        }
        log::trace!("[VM] claimed va={:#x} -> frame {}", va, fid);
        true
    }

    // ------------------------------------------------------------------
    // Fault handling
    // ------------------------------------------------------------------

    /// Page fault entry point. Returns true to resume the faulting thread;
    /// false sends the process to the kill path (exit status -1).
    pub fn try_handle_fault(&mut self, id: SpaceId, fault: &PageFault) -> bool {
        let addr = fault.addr;
        if addr == 0 || !is_user_address(addr) {
            return false;
        }
        // The only protection fault a correct kernel sees here is a write
        // to a read-only page, which is an application error.
        if !fault.not_present {
            return false;
        }

        let rsp = if fault.user {
            fault.rsp
        } else {
            fault.saved_user_rsp
        };

        // Stack growth: a push may touch up to 8 bytes below rsp. Grow
        // only within the window below the stack top.
        let guard = rsp.saturating_sub(8);
        let low = USER_STACK_TOP - self.stack_limit;
        if guard <= addr && addr <= USER_STACK_TOP && guard >= low {
            let page_va = page_floor(addr);
            let absent = self
                .spaces
                .get(&id)
                .map_or(false, |s| s.spt.find(page_va).is_none());
            if absent && self.alloc_page(id, page_va, true, PageMarkers::STACK) {
                STACK_GROWTHS.fetch_add(1, Ordering::Relaxed);
                log::debug!("[VM] stack grown to {:#x}", page_va);
            }
        }

        {
            let Some(space) = self.spaces.get(&id) else {
                return false;
            };
            let Some(page) = space.spt.find(addr) else {
                return false;
            };
            if fault.write && !page.writable {
                return false;
            }
        }

        let ok = self.claim_page(id, addr);
        if ok {
            FAULTS_RESOLVED.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    // ------------------------------------------------------------------
    // mmap / munmap workers
    // ------------------------------------------------------------------

    /// Map `length` bytes of `file` starting at `offset` into the space at
    /// `addr`. Returns the mapped address, or the argument error.
    pub fn mmap_checked(
        &mut self,
        id: SpaceId,
        addr: u64,
        length: u64,
        writable: bool,
        file: &FileRef,
        offset: u64,
    ) -> Result<u64, MmapError> {
        if offset % PAGE_SIZE as u64 != 0 {
            return Err(MmapError::MisalignedOffset);
        }
        if addr == 0 || !is_page_aligned(addr) || !is_user_address(addr) {
            return Err(MmapError::BadAddress);
        }
        if length == 0 {
            return Err(MmapError::ZeroLength);
        }

        // The file is the backing store; the mapping cannot outrun it.
        let file_len = file.lock().length();
        let map_len = length.min(file_len);
        if map_len == 0 {
            return Err(MmapError::EmptyFile);
        }
        let span_bytes = page_ceil(map_len);
        let end = addr
            .checked_add(span_bytes)
            .ok_or(MmapError::BadAddress)?;
        if !is_user_address(end - 1) {
            return Err(MmapError::BadAddress);
        }

        // Check the whole range up front so a collision cannot leave a
        // half-registered mapping behind.
        {
            let Some(space) = self.spaces.get(&id) else {
                return Err(MmapError::BadAddress);
            };
            let mut va = addr;
            while va < end {
                if space.spt.find(va).is_some() {
                    return Err(MmapError::Overlap);
                }
                va += PAGE_SIZE as u64;
            }
        }

        // The mapping holds its own handle so closing the descriptor does
        // not tear the file out from under it.
        let handle = fs::reopen(file);
        let mut remaining = map_len;
        let mut va = addr;
        let mut ofs = offset;
        while remaining > 0 {
            let read_bytes = (remaining as usize).min(PAGE_SIZE);
            let span = FileSpan {
                file: handle.clone(),
                offset: ofs,
                read_bytes,
                zero_bytes: PAGE_SIZE - read_bytes,
            };
            if !self.alloc_page_with_initializer(
                id,
                FirstTouch::File { span },
                va,
                writable,
                PageMarkers::empty(),
            ) {
                return Err(MmapError::Overlap);
            }
            remaining -= read_bytes as u64;
            va += PAGE_SIZE as u64;
            ofs += read_bytes as u64;
        }
        log::debug!(
            "[VM] mmap {:#x}..{:#x} ({} bytes of file)",
            addr,
            end,
            map_len
        );
        Ok(addr)
    }

    /// mmap worker: argument errors collapse to `None`
    pub fn mmap(
        &mut self,
        id: SpaceId,
        addr: u64,
        length: u64,
        writable: bool,
        file: &FileRef,
        offset: u64,
    ) -> Option<u64> {
        match self.mmap_checked(id, addr, length, writable, file, offset) {
            Ok(addr) => Some(addr),
            Err(err) => {
                log::debug!("[VM] mmap({:#x}, {}) rejected: {:?}", addr, length, err);
                None
            }
        }
    }

    /// Unmap the mapping starting at `addr`: walk forward one page at a
    /// time until the SPT has no entry, flushing dirty file pages back and
    /// removing each page. A second call for the same address is a no-op.
    pub fn munmap(&mut self, id: SpaceId, addr: u64) {
        let mut va = page_floor(addr);
        while self.remove_page(id, va) {
            va += PAGE_SIZE as u64;
        }
    }

    /// Remove one page: flush it if file-backed and dirty, clear the
    /// hardware mapping, release the frame, destroy the record.
    /// Returns false if the SPT has no entry at `va`.
    pub fn remove_page(&mut self, id: SpaceId, va: u64) -> bool {
        let va = page_floor(va);
        let Some(space) = self.spaces.get_mut(&id) else {
            return false;
        };
        let Some(mut page) = space.spt.take(va) else {
            return false;
        };

        if let Backing::File { span } = &page.backing {
            if space.pd.is_dirty(va) {
                let kva = page
                    .frame
                    .map(|fid| self.frames.get(fid).kva)
                    .expect("dirty page is resident");
                let buf = self.pool.page(kva);
                span.file.lock().write_at(&buf[..span.read_bytes], span.offset);
                space.pd.set_dirty(va, false);
            }
        }
        space.pd.unmap(va);
        if let Some(fid) = page.frame.take() {
            self.frames.release(fid, &mut self.pool);
        }
        page.destroy(&mut self.swap);
        true
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> VmStats {
        VmStats {
            user_frames_total: self.pool.total_frames(),
            user_frames_free: self.pool.free_frames(),
            frames_in_ring: self.frames.len(),
            swap_slots_total: self.swap.slot_count(),
            swap_slots_used: self.swap.used_slots(),
            spaces: self.spaces.len(),
            faults_resolved: FAULTS_RESOLVED.load(Ordering::Relaxed),
            stack_growths: STACK_GROWTHS.load(Ordering::Relaxed),
        }
    }

    /// Kernel address of the frame backing `va`, if resident
    fn page_kva(&self, id: SpaceId, va: u64) -> Option<u64> {
        let page = self.spaces.get(&id)?.spt.find(va)?;
        page.frame_id().map(|fid| self.frames.get(fid).kva)
    }
}

/// mmap argument errors; all collapse to NULL at the syscall boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmapError {
    MisalignedOffset,
    BadAddress,
    ZeroLength,
    Overlap,
    EmptyFile,
}

/// VM statistics snapshot
#[derive(Debug, Clone, Copy)]
pub struct VmStats {
    pub user_frames_total: usize,
    pub user_frames_free: usize,
    pub frames_in_ring: usize,
    pub swap_slots_total: usize,
    pub swap_slots_used: usize,
    pub spaces: usize,
    /// Lifetime counters, global across VM instances
    pub faults_resolved: u64,
    pub stack_growths: u64,
}

/// Build a first-touch initializer from a closure; convenience for loaders
pub fn page_init<F>(f: F) -> super::page::PageInit
where
    F: Fn(&mut super::PageBuf) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}
