//! Page objects — one record per logical user page
//!
//! A page exists from registration (lazy, no frame) until its SPT removes
//! it. The backing is a tagged union: UNINIT pages carry their first-touch
//! recipe and transmute into ANON or FILE on the first fault; ANON pages
//! round-trip through the swap store; FILE pages re-read their file region
//! and write dirty content back. All three implement the same operations
//! contract: swap_in, swap_out, destroy.

use alloc::sync::Arc;
use bitflags::bitflags;

use crate::fs::FileRef;

use super::paging::PageDirectory;
use super::swap::SwapTable;
use super::{page_offset, FrameId, PageBuf, PageSlot};

bitflags! {
    /// Marker bits orthogonal to the backing variant; policy metadata only
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageMarkers: u8 {
        /// Page belongs to the user stack
        const STACK = 1 << 0;
    }
}

/// Base variant of a page. For UNINIT pages [`Page::kind`] reports the
/// variant the page will become on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Uninit,
    Anon,
    File,
}

/// First-touch content initializer for anonymous pages, run over the
/// zero-filled frame. Cloneable so fork can re-register pending pages.
pub type PageInit = Arc<dyn Fn(&mut PageBuf) -> bool + Send + Sync>;

/// A file region backing one page: `read_bytes` from `offset`, then
/// `zero_bytes` of fill. `read_bytes + zero_bytes == PAGE_SIZE`.
#[derive(Clone)]
pub struct FileSpan {
    pub file: FileRef,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

/// What an UNINIT page becomes on first touch
#[derive(Clone)]
pub enum FirstTouch {
    Anon { init: Option<PageInit> },
    File { span: FileSpan },
}

/// Variant payload
pub(crate) enum Backing {
    Uninit(FirstTouch),
    /// `slot` is `Some` exactly while the content sits in the swap store
    Anon { slot: Option<usize> },
    File { span: FileSpan },
}

/// The central record: one logical user page
pub struct Page {
    /// Page-aligned user virtual address; unique within an SPT
    pub va: u64,
    /// Set at creation, immutable thereafter
    pub writable: bool,
    pub markers: PageMarkers,
    /// Non-owning link to the resident frame; `None` while not materialized
    pub(crate) frame: Option<FrameId>,
    pub(crate) backing: Backing,
}

impl Page {
    pub(crate) fn new(va: u64, writable: bool, markers: PageMarkers, target: FirstTouch) -> Self {
        debug_assert_eq!(page_offset(va), 0);
        Self {
            va,
            writable,
            markers,
            frame: None,
            backing: Backing::Uninit(target),
        }
    }

    /// The page's variant; UNINIT pages report their target variant
    pub fn kind(&self) -> PageKind {
        match &self.backing {
            Backing::Uninit(FirstTouch::Anon { .. }) => PageKind::Anon,
            Backing::Uninit(FirstTouch::File { .. }) => PageKind::File,
            Backing::Anon { .. } => PageKind::Anon,
            Backing::File { .. } => PageKind::File,
        }
    }

    /// Whether the page has ever been materialized
    pub fn is_uninit(&self) -> bool {
        matches!(self.backing, Backing::Uninit(_))
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub(crate) fn frame_id(&self) -> Option<FrameId> {
        self.frame
    }

    /// Swap slot currently holding this page's content, if evicted
    pub(crate) fn swap_slot(&self) -> Option<usize> {
        match self.backing {
            Backing::Anon { slot } => slot,
            _ => None,
        }
    }

    /// Make the page's logical content available in `buf` (the freshly
    /// claimed frame). First touch transmutes UNINIT into its target
    /// variant; later calls re-materialize after eviction.
    pub(crate) fn swap_in(&mut self, swap: &mut SwapTable, buf: &mut PageBuf) -> bool {
        match &mut self.backing {
            Backing::Uninit(touch) => {
                let touch = touch.clone();
                match touch {
                    FirstTouch::Anon { init } => {
                        buf.fill(0);
                        if let Some(init) = init {
                            if !init(buf) {
                                return false;
                            }
                        }
                        self.backing = Backing::Anon { slot: None };
                    }
                    FirstTouch::File { span } => {
                        read_span(&span, buf);
                        self.backing = Backing::File { span };
                    }
                }
                true
            }
            Backing::Anon { slot } => {
                // Non-resident anonymous content always sits in a slot;
                // the slot is addressed directly and freed after the read.
                let Some(idx) = *slot else {
                    return false;
                };
                swap.read_slot(idx, buf);
                swap.free_slot(idx);
                *slot = None;
                log::trace!("[SWAP] paged in va={:#x} from slot {}", self.va, idx);
                true
            }
            Backing::File { span } => {
                read_span(span, buf);
                true
            }
        }
    }

    /// Evacuate the page to its backing store: anonymous content goes to a
    /// fresh swap slot, dirty file content back to the file. Clears the
    /// hardware mapping and cuts the page's side of the frame link; the
    /// caller owns the frame's back-pointer.
    pub(crate) fn swap_out(
        &mut self,
        me: PageSlot,
        swap: &mut SwapTable,
        pd: &mut PageDirectory,
        buf: &PageBuf,
    ) -> bool {
        debug_assert_eq!(me.va, self.va);
        match &mut self.backing {
            Backing::Uninit(_) => {
                debug_assert!(false, "uninit page cannot be resident");
                false
            }
            Backing::Anon { slot } => {
                let Some(idx) = swap.alloc_slot(me) else {
                    panic!("[SWAP] swap disk full");
                };
                swap.write_slot(idx, buf);
                *slot = Some(idx);
                pd.unmap(self.va);
                self.frame = None;
                log::trace!("[SWAP] evicted va={:#x} to slot {}", self.va, idx);
                true
            }
            Backing::File { span } => {
                if self.writable && pd.is_dirty(self.va) {
                    let n = span
                        .file
                        .lock()
                        .write_at(&buf[..span.read_bytes], span.offset);
                    if n < span.read_bytes {
                        log::warn!(
                            "[SWAP] short write-back va={:#x}: {} of {}",
                            self.va,
                            n,
                            span.read_bytes
                        );
                    }
                    pd.set_dirty(self.va, false);
                }
                pd.unmap(self.va);
                self.frame = None;
                true
            }
        }
    }

    /// Release variant-held resources. The SPT owns the record itself.
    pub(crate) fn destroy(&mut self, swap: &mut SwapTable) {
        match &mut self.backing {
            Backing::Anon { slot } => {
                if let Some(idx) = slot.take() {
                    swap.free_slot(idx);
                }
            }
            // the file reference drops with the record
            Backing::Uninit(_) | Backing::File { .. } => {}
        }
    }
}

/// Pull a file region into a frame: `read_bytes` from the file, the rest
/// zero. A short read zeroes the remainder too, so the frame is never
/// partially initialized.
fn read_span(span: &FileSpan, buf: &mut PageBuf) {
    let n = span
        .file
        .lock()
        .read_at(&mut buf[..span.read_bytes], span.offset);
    buf[n..].fill(0);
}
