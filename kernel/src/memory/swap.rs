//! Swap Slot Store
//!
//! Backing store for evicted anonymous pages. The swap device is carved
//! into fixed slots of one page each (8 sectors); slot `i` occupies sectors
//! `[8i, 8i+8)`. Allocation state lives in memory only and does not survive
//! a reboot — the device has no header.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{PageBuf, PageSlot, SECTORS_PER_PAGE, SECTOR_SIZE};

/// Statistics: pages written to swap
static PAGES_SWAPPED_OUT: AtomicU64 = AtomicU64::new(0);
/// Statistics: pages read back from swap
static PAGES_SWAPPED_IN: AtomicU64 = AtomicU64::new(0);

/// Sector-addressed block device holding the swap area.
///
/// `read_sector`/`write_sector` transfer exactly [`SECTOR_SIZE`] bytes and
/// may suspend the calling thread on a real device.
pub trait SwapDev: Send {
    fn sector_count(&self) -> u64;
    fn read_sector(&self, sector: u64, dst: &mut [u8]);
    fn write_sector(&mut self, sector: u64, src: &[u8]);
}

/// In-memory swap device, used when no disk is configured and by the tests
pub struct MemDisk {
    sectors: Vec<u8>,
}

impl MemDisk {
    pub fn new(sector_count: u64) -> Self {
        Self {
            sectors: vec![0; sector_count as usize * SECTOR_SIZE],
        }
    }
}

impl SwapDev for MemDisk {
    fn sector_count(&self) -> u64 {
        (self.sectors.len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&self, sector: u64, dst: &mut [u8]) {
        let at = sector as usize * SECTOR_SIZE;
        dst[..SECTOR_SIZE].copy_from_slice(&self.sectors[at..at + SECTOR_SIZE]);
    }

    fn write_sector(&mut self, sector: u64, src: &[u8]) {
        let at = sector as usize * SECTOR_SIZE;
        self.sectors[at..at + SECTOR_SIZE].copy_from_slice(&src[..SECTOR_SIZE]);
    }
}

/// One page-sized region of the swap device
struct Slot {
    used: bool,
    owner: Option<PageSlot>,
}

/// The swap slot store: device plus per-slot allocation state
pub struct SwapTable {
    dev: Box<dyn SwapDev>,
    slots: Vec<Slot>,
    used: usize,
}

impl SwapTable {
    /// Partition the device into `floor(sectors / 8)` slots, all free
    pub fn new(dev: Box<dyn SwapDev>) -> Self {
        let count = (dev.sector_count() / SECTORS_PER_PAGE) as usize;
        let slots = (0..count)
            .map(|_| Slot {
                used: false,
                owner: None,
            })
            .collect();
        log::info!("[SWAP] initialized: {} slots", count);
        Self {
            dev,
            slots,
            used: 0,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn used_slots(&self) -> usize {
        self.used
    }

    /// First-free linear scan. Fails only when the swap disk is full.
    pub(crate) fn alloc_slot(&mut self, owner: PageSlot) -> Option<usize> {
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            if !slot.used {
                slot.used = true;
                slot.owner = Some(owner);
                self.used += 1;
                return Some(idx);
            }
        }
        None
    }

    /// Mark a slot free and clear its owner
    pub(crate) fn free_slot(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if slot.used {
            slot.used = false;
            slot.owner = None;
            self.used -= 1;
        }
    }

    pub(crate) fn slot_owner(&self, idx: usize) -> Option<PageSlot> {
        self.slots.get(idx).and_then(|s| s.owner)
    }

    pub(crate) fn is_slot_used(&self, idx: usize) -> bool {
        self.slots.get(idx).map_or(false, |s| s.used)
    }

    /// Read slot `idx` into a frame (8 sectors)
    pub(crate) fn read_slot(&self, idx: usize, dst: &mut PageBuf) {
        let base = idx as u64 * SECTORS_PER_PAGE;
        for i in 0..SECTORS_PER_PAGE {
            let at = i as usize * SECTOR_SIZE;
            self.dev
                .read_sector(base + i, &mut dst[at..at + SECTOR_SIZE]);
        }
        PAGES_SWAPPED_IN.fetch_add(1, Ordering::Relaxed);
    }

    /// Write a frame into slot `idx` (8 sectors)
    pub(crate) fn write_slot(&mut self, idx: usize, src: &PageBuf) {
        let base = idx as u64 * SECTORS_PER_PAGE;
        for i in 0..SECTORS_PER_PAGE {
            let at = i as usize * SECTOR_SIZE;
            self.dev.write_sector(base + i, &src[at..at + SECTOR_SIZE]);
        }
        PAGES_SWAPPED_OUT.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> SwapStats {
        SwapStats {
            total_slots: self.slots.len(),
            used_slots: self.used,
            pages_swapped_out: PAGES_SWAPPED_OUT.load(Ordering::Relaxed),
            pages_swapped_in: PAGES_SWAPPED_IN.load(Ordering::Relaxed),
        }
    }
}

/// Swap statistics snapshot
#[derive(Clone, Debug)]
pub struct SwapStats {
    pub total_slots: usize,
    pub used_slots: usize,
    /// Lifetime counters, global across VM instances
    pub pages_swapped_out: u64,
    pub pages_swapped_in: u64,
}
