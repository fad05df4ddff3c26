//! Frame Pool & Table
//!
//! [`UserPool`] is the physical allocator's user pool: a fixed set of 4 KB
//! frames tracked by a bitmap (one bit per frame, next-fit scan hint).
//! [`FrameTable`] tracks every frame currently handed to the VM layer and
//! runs the clock eviction engine when the pool runs dry. Each live frame
//! sits in the clock ring exactly once, in insertion order.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;

use super::swap::SwapTable;
use super::vm::AddressSpace;
use super::{PageBuf, PageSlot, SpaceId, KERNEL_BASE, PAGE_SIZE};

/// Frame identifier, stable for the frame's lifetime
pub type FrameId = u64;

/// One physical frame handed to the VM layer
pub struct Frame {
    /// Kernel-visible address of the frame (direct map)
    pub kva: u64,
    /// Non-owning back-pointer to the page occupying this frame
    pub(crate) owner: Option<PageSlot>,
}

/// The user pool: bitmap-tracked frames with next-fit allocation.
/// Frames live in the kernel direct map starting at [`KERNEL_BASE`].
pub struct UserPool {
    /// Each bit = one frame; bit set = allocated
    bitmap: Vec<u64>,
    frames: Vec<PageBuf>,
    /// Index of the last allocation, speeds up the linear scan
    next_hint: usize,
    used: usize,
}

impl UserPool {
    pub fn new(frame_count: usize) -> Self {
        let words = frame_count.div_ceil(64);
        let mut bitmap = vec![0u64; words];
        // mark the tail bits of the last word as permanently taken
        for bit in frame_count..words * 64 {
            bitmap[bit / 64] |= 1 << (bit % 64);
        }
        Self {
            bitmap,
            frames: vec![[0u8; PAGE_SIZE]; frame_count],
            next_hint: 0,
            used: 0,
        }
    }

    /// Allocate one frame; returns its kernel-visible address
    pub fn alloc_page(&mut self) -> Option<u64> {
        let words = self.bitmap.len();
        for offset in 0..words {
            let idx = (self.next_hint + offset) % words;
            let word = self.bitmap[idx];
            if word == u64::MAX {
                continue; // all 64 frames in this word are taken
            }
            let bit = (!word).trailing_zeros() as usize;
            self.bitmap[idx] |= 1 << bit;
            self.next_hint = idx;
            self.used += 1;
            let frame = idx * 64 + bit;
            return Some(KERNEL_BASE + (frame * PAGE_SIZE) as u64);
        }
        None
    }

    /// Return a frame to the pool
    pub fn free_page(&mut self, kva: u64) {
        let frame = self.index_of(kva);
        debug_assert!(self.bitmap[frame / 64] & (1 << (frame % 64)) != 0);
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
        self.used -= 1;
    }

    pub fn page(&self, kva: u64) -> &PageBuf {
        &self.frames[self.index_of(kva)]
    }

    pub fn page_mut(&mut self, kva: u64) -> &mut PageBuf {
        let idx = self.index_of(kva);
        &mut self.frames[idx]
    }

    fn index_of(&self, kva: u64) -> usize {
        debug_assert!(kva >= KERNEL_BASE);
        let idx = ((kva - KERNEL_BASE) as usize) / PAGE_SIZE;
        debug_assert!(idx < self.frames.len());
        idx
    }

    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn used_frames(&self) -> usize {
        self.used
    }

    pub fn free_frames(&self) -> usize {
        self.frames.len() - self.used
    }
}

/// The global frame table and clock ring.
///
/// The ring is a rotation queue: the head is the clock hand, and examining
/// a frame moves it to the tail. Frames stay in the ring across eviction
/// and reassignment; [`FrameTable::release`] is the only exit.
pub struct FrameTable {
    pub(crate) frames: BTreeMap<FrameId, Frame>,
    pub(crate) ring: VecDeque<FrameId>,
    next_id: FrameId,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            frames: BTreeMap::new(),
            ring: VecDeque::new(),
            next_id: 0,
        }
    }

    pub(crate) fn get(&self, id: FrameId) -> &Frame {
        &self.frames[&id]
    }

    pub(crate) fn get_mut(&mut self, id: FrameId) -> &mut Frame {
        self.frames.get_mut(&id).expect("live frame")
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Hand out a usable frame: a fresh pool page if one is free, else the
    /// frame of an evicted page. The returned frame has no owner; the
    /// claimer links it. May block on swap I/O.
    pub(crate) fn acquire(
        &mut self,
        pool: &mut UserPool,
        swap: &mut SwapTable,
        spaces: &mut BTreeMap<SpaceId, AddressSpace>,
    ) -> FrameId {
        if let Some(kva) = pool.alloc_page() {
            let id = self.next_id;
            self.next_id += 1;
            self.frames.insert(id, Frame { kva, owner: None });
            self.ring.push_back(id);
            return id;
        }
        self.evict_one(pool, swap, spaces)
    }

    /// Remove a frame from the table and return its page to the pool.
    /// Used by munmap and address-space teardown.
    pub(crate) fn release(&mut self, id: FrameId, pool: &mut UserPool) {
        let frame = self.frames.remove(&id).expect("live frame");
        self.ring.retain(|&r| r != id);
        pool.free_page(frame.kva);
    }

    /// Clock victim selection and eviction.
    ///
    /// Walk the ring from the hand: an ownerless frame is taken at once;
    /// an accessed frame loses its bit and survives the pass; the first
    /// unaccessed frame is the victim and its page is swapped out. After a
    /// full pass every bit has been cleared, so a second pass must find a
    /// victim; anything else is a kernel bug.
    fn evict_one(
        &mut self,
        pool: &mut UserPool,
        swap: &mut SwapTable,
        spaces: &mut BTreeMap<SpaceId, AddressSpace>,
    ) -> FrameId {
        if self.ring.is_empty() {
            panic!("[VM] out of frames with nothing to evict");
        }
        let sweeps = 2 * self.ring.len();
        for _ in 0..sweeps {
            let id = self.ring.pop_front().expect("ring not empty");
            self.ring.push_back(id);
            let (kva, owner) = {
                let frame = &self.frames[&id];
                (frame.kva, frame.owner)
            };

            let Some(owner) = owner else {
                // orphaned by a prior swap-out; reusable as-is
                return id;
            };

            let Some(space) = spaces.get_mut(&owner.space) else {
                // owning space is gone; the frame is stale
                self.get_mut(id).owner = None;
                return id;
            };

            if space.pd.is_accessed(owner.va) {
                // second chance
                space.pd.set_accessed(owner.va, false);
                continue;
            }

            let AddressSpace { spt, pd } = space;
            let Some(page) = spt.find_mut(owner.va) else {
                self.get_mut(id).owner = None;
                return id;
            };
            if page.swap_out(owner, swap, pd, pool.page(kva)) {
                self.get_mut(id).owner = None;
                log::debug!("[VM] evicted frame {} (va={:#x})", id, owner.va);
                return id;
            }
            // swap-out refused this candidate; try the next frame
        }
        panic!("[VM] no evictable frame after a full clock sweep");
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
