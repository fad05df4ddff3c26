//! Subsystem scenario tests: cross-module invariants, eviction under
//! memory pressure, mmap write-back, stack growth, fork duplication.

use alloc::boxed::Box;
use alloc::collections::BTreeSet;
use alloc::vec;

use crate::fs::{FileRef, MemFile};
use crate::usercopy::{copy_from_user, copy_to_user, read_user_u64, write_user_u64, UserCopyError};

use super::page::Backing;
use super::*;

const BASE: u64 = 0x4000_0000;
const PG: u64 = PAGE_SIZE as u64;

fn test_vm(frames: usize, swap_sectors: u64) -> Vm {
    let mut vm = Vm::new(
        VmConfig {
            user_frames: frames,
            ..VmConfig::default()
        },
        Box::new(MemDisk::new(swap_sectors)),
    );
    vm.create_space(1);
    vm
}

fn alloc_anon_range(vm: &mut Vm, space: SpaceId, base: u64, count: u64) {
    for i in 0..count {
        assert!(vm.alloc_page(space, base + i * PG, true, PageMarkers::empty()));
    }
}

fn user_fault(addr: u64, write: bool, rsp: u64) -> PageFault {
    PageFault {
        addr,
        write,
        user: true,
        not_present: true,
        rsp,
        saved_user_rsp: 0,
    }
}

/// Structural invariants that must hold between any two operations
fn check_invariants(vm: &Vm) {
    // the clock ring contains each live frame exactly once
    let mut seen = BTreeSet::new();
    for &id in &vm.frames.ring {
        assert!(seen.insert(id), "frame {} appears twice in the ring", id);
        assert!(vm.frames.frames.contains_key(&id));
    }
    assert_eq!(seen.len(), vm.frames.frames.len());

    // frame -> page back-pointers match page -> frame links
    for (id, frame) in &vm.frames.frames {
        if let Some(owner) = frame.owner {
            let page = vm
                .spaces
                .get(&owner.space)
                .and_then(|s| s.spt.find(owner.va))
                .expect("frame owner names a live page");
            assert_eq!(page.frame_id(), Some(*id));
        }
    }

    for (sid, space) in &vm.spaces {
        for page in space.spt.iter() {
            let me = PageSlot {
                space: *sid,
                va: page.va,
            };
            if page.is_uninit() {
                assert!(!page.is_resident(), "uninit page cannot hold a frame");
            }
            match (page.frame_id(), &page.backing) {
                (Some(fid), backing) => {
                    assert_eq!(vm.frames.frames[&fid].owner, Some(me));
                    assert!(space.pd.is_mapped(page.va));
                    if let Backing::Anon { slot } = backing {
                        assert!(slot.is_none(), "resident anon page holds a slot");
                    }
                }
                (None, Backing::Anon { slot }) => {
                    let idx = slot.expect("non-resident anon page holds a slot");
                    assert!(vm.swap.is_slot_used(idx));
                    assert_eq!(vm.swap.slot_owner(idx), Some(me));
                }
                _ => {}
            }
        }
    }
}

// ----------------------------------------------------------------------
// Lazy allocation and claiming
// ----------------------------------------------------------------------

#[test]
fn registered_pages_stay_pending_until_claimed() {
    let mut vm = test_vm(8, 256);
    assert!(vm.alloc_page(1, BASE, true, PageMarkers::empty()));
    let page = vm.space(1).unwrap().spt().find(BASE).unwrap();
    assert!(page.is_uninit());
    assert_eq!(page.kind(), PageKind::Anon);
    assert_eq!(vm.stats().user_frames_free, 8);

    assert!(vm.claim_page(1, BASE));
    let page = vm.space(1).unwrap().spt().find(BASE).unwrap();
    assert!(!page.is_uninit());
    assert!(page.is_resident());
    assert_eq!(vm.stats().user_frames_free, 7);
    check_invariants(&vm);
}

#[test]
fn claiming_twice_fails() {
    let mut vm = test_vm(8, 256);
    vm.alloc_page(1, BASE, true, PageMarkers::empty());
    assert!(vm.claim_page(1, BASE));
    assert!(!vm.claim_page(1, BASE));
}

#[test]
fn loader_initializer_runs_on_first_touch() {
    let mut vm = test_vm(8, 256);
    let init = vm::page_init(|buf| {
        buf[..4].copy_from_slice(b"\x7fELF");
        true
    });
    assert!(vm.alloc_page_with_initializer(
        1,
        FirstTouch::Anon { init: Some(init) },
        BASE,
        false,
        PageMarkers::empty(),
    ));
    let mut head = [0u8; 4];
    copy_from_user(&mut vm, 1, BASE, &mut head).unwrap();
    assert_eq!(&head, b"\x7fELF");
    // the rest of the page is zero
    assert_eq!(read_user_u64(&mut vm, 1, BASE + 8).unwrap(), 0);
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut vm = test_vm(8, 256);
    assert!(vm.alloc_page(1, BASE, true, PageMarkers::empty()));
    assert!(!vm.alloc_page(1, BASE, false, PageMarkers::STACK));
    // misaligned and kernel addresses are rejected outright
    assert!(!vm.alloc_page(1, BASE + 1, true, PageMarkers::empty()));
    assert!(!vm.alloc_page(1, KERNEL_BASE, true, PageMarkers::empty()));
}

// ----------------------------------------------------------------------
// Fault handling policy
// ----------------------------------------------------------------------

#[test]
fn faults_on_bad_addresses_are_rejected() {
    let mut vm = test_vm(8, 256);
    assert!(!vm.try_handle_fault(1, &user_fault(0, false, BASE)));
    assert!(!vm.try_handle_fault(1, &user_fault(KERNEL_BASE + 0x1000, false, BASE)));
    // unregistered address
    assert!(!vm.try_handle_fault(1, &user_fault(BASE, false, BASE)));
}

#[test]
fn protection_faults_are_an_application_error() {
    let mut vm = test_vm(8, 256);
    vm.alloc_page(1, BASE, true, PageMarkers::empty());
    let mut fault = user_fault(BASE, true, BASE);
    fault.not_present = false;
    assert!(!vm.try_handle_fault(1, &fault));
}

#[test]
fn write_fault_on_read_only_page_is_rejected() {
    let mut vm = test_vm(8, 256);
    vm.alloc_page(1, BASE, false, PageMarkers::empty());
    assert!(!vm.try_handle_fault(1, &user_fault(BASE, true, 0)));
    assert!(vm.try_handle_fault(1, &user_fault(BASE, false, 0)));
}

#[test]
fn fault_error_code_decoding() {
    let f = PageFault::from_error_code(BASE, vm::PF_WRITE | vm::PF_USER, 1, 2);
    assert!(f.write && f.user && f.not_present);
    let f = PageFault::from_error_code(BASE, vm::PF_PRESENT, 1, 2);
    assert!(!f.not_present);
}

// ----------------------------------------------------------------------
// Stack growth
// ----------------------------------------------------------------------

#[test]
fn stack_grows_on_a_push_below_rsp() {
    let mut vm = test_vm(8, 256);
    let addr = USER_STACK_TOP - 4;
    assert!(vm.try_handle_fault(1, &user_fault(addr, true, addr)));

    let page = vm.space(1).unwrap().spt().find(addr).unwrap();
    assert!(page.markers.contains(PageMarkers::STACK));
    assert!(page.writable);
    assert_eq!(page.va, page_floor(addr));

    write_user_u64(&mut vm, 1, addr - 4, 77).unwrap();
    assert_eq!(read_user_u64(&mut vm, 1, addr - 4).unwrap(), 77);
    check_invariants(&vm);
}

#[test]
fn kernel_mode_fault_uses_the_saved_user_rsp() {
    let mut vm = test_vm(8, 256);
    let addr = USER_STACK_TOP - 64;
    let fault = PageFault {
        addr,
        write: true,
        user: false,
        not_present: true,
        rsp: 0,
        saved_user_rsp: addr + 8,
    };
    assert!(vm.try_handle_fault(1, &fault));
    assert!(vm.space(1).unwrap().spt().find(addr).is_some());
}

#[test]
fn stack_growth_stops_at_the_limit() {
    let mut vm = test_vm(8, 256);
    let low = USER_STACK_TOP - USER_STACK_LIMIT;

    // exactly at the bound: allowed
    assert!(vm.try_handle_fault(1, &user_fault(low, true, low + 8)));

    // one byte past it: the process dies
    let addr = low - 1;
    assert!(!vm.try_handle_fault(1, &user_fault(addr, true, addr + 4)));
    assert!(vm.space(1).unwrap().spt().find(addr).is_none());
}

#[test]
fn far_below_rsp_is_not_stack_growth() {
    let mut vm = test_vm(8, 256);
    // rsp parked at the stack top, touch a megabyte-away address
    let addr = USER_STACK_TOP - USER_STACK_LIMIT + PG;
    assert!(!vm.try_handle_fault(1, &user_fault(addr, true, USER_STACK_TOP)));
}

// ----------------------------------------------------------------------
// Eviction and the swap round trip
// ----------------------------------------------------------------------

#[test]
fn eviction_is_observable_in_the_slot_and_reversible() {
    let mut vm = test_vm(4, 256);
    alloc_anon_range(&mut vm, 1, BASE, 5);
    // fill the pool
    for i in 0..4u64 {
        write_user_u64(&mut vm, 1, BASE + i * PG, 0xAB00 + i).unwrap();
    }
    assert_eq!(vm.stats().user_frames_free, 0);

    // a fifth page forces the clock to evict the oldest frame (page 0)
    write_user_u64(&mut vm, 1, BASE + 4 * PG, 0xAB04).unwrap();
    check_invariants(&vm);

    let victim = vm.space(1).unwrap().spt().find(BASE).unwrap();
    assert!(!victim.is_resident());
    let idx = victim.swap_slot().expect("victim sits in a swap slot");

    // the slot holds exactly what the frame held
    let mut on_disk = [0u8; PAGE_SIZE];
    vm.swap.read_slot(idx, &mut on_disk);
    assert_eq!(u64::from_le_bytes(on_disk[..8].try_into().unwrap()), 0xAB00);

    // swapping back in restores the bytes and frees the slot
    assert_eq!(read_user_u64(&mut vm, 1, BASE).unwrap(), 0xAB00);
    assert!(!vm.swap.is_slot_used(idx));
    check_invariants(&vm);
}

#[test]
fn stamped_pages_survive_heavy_swapping() {
    let mut vm = test_vm(4, 512);
    let n = 12u64;
    alloc_anon_range(&mut vm, 1, BASE, n);
    for i in 0..n {
        write_user_u64(&mut vm, 1, BASE + i * PG, i).unwrap();
    }
    // more pages than frames: most of them are on disk now
    assert!(vm.stats().swap_slots_used >= (n as usize) - 4);
    check_invariants(&vm);

    for i in 0..n {
        assert_eq!(read_user_u64(&mut vm, 1, BASE + i * PG).unwrap(), i);
    }
    check_invariants(&vm);

    // and again in reverse, to churn the clock the other way
    for i in (0..n).rev() {
        assert_eq!(read_user_u64(&mut vm, 1, BASE + i * PG).unwrap(), i);
    }
    check_invariants(&vm);
}

#[test]
fn teardown_returns_frames_and_slots() {
    let mut vm = test_vm(4, 512);
    alloc_anon_range(&mut vm, 1, BASE, 10);
    for i in 0..10u64 {
        write_user_u64(&mut vm, 1, BASE + i * PG, i).unwrap();
    }
    assert!(vm.stats().swap_slots_used > 0);

    vm.destroy_space(1);
    let stats = vm.stats();
    assert_eq!(stats.user_frames_free, stats.user_frames_total);
    assert_eq!(stats.swap_slots_used, 0);
    assert_eq!(stats.frames_in_ring, 0);
    assert_eq!(stats.spaces, 0);
}

// ----------------------------------------------------------------------
// mmap / munmap
// ----------------------------------------------------------------------

fn page_file(fill: u8, len: usize) -> FileRef {
    MemFile::new_ref(vec![fill; len])
}

#[test]
fn mmap_lazily_registers_file_pages() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', 3 * PAGE_SIZE);
    assert_eq!(vm.mmap(1, BASE, 3 * PG, true, &file, 0), Some(BASE));
    assert_eq!(vm.space(1).unwrap().spt().len(), 3);
    for i in 0..3u64 {
        let page = vm.space(1).unwrap().spt().find(BASE + i * PG).unwrap();
        assert!(page.is_uninit());
        assert_eq!(page.kind(), PageKind::File);
    }
    // nothing materialized yet
    assert_eq!(vm.stats().user_frames_free, 8);

    let mut byte = [0u8; 1];
    copy_from_user(&mut vm, 1, BASE + 2 * PG + 17, &mut byte).unwrap();
    assert_eq!(byte[0], b'A');
    check_invariants(&vm);
}

#[test]
fn mmap_clamps_to_the_file_and_zero_fills_the_tail() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', 100);
    // ask for a page, get the 100 file bytes plus zero fill
    assert_eq!(vm.mmap(1, BASE, PG, true, &file, 0), Some(BASE));
    assert_eq!(vm.space(1).unwrap().spt().len(), 1);

    let mut buf = [0u8; 104];
    copy_from_user(&mut vm, 1, BASE, &mut buf).unwrap();
    assert!(buf[..100].iter().all(|&b| b == b'A'));
    assert!(buf[100..].iter().all(|&b| b == 0));
}

#[test]
fn mmap_argument_validation() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', 2 * PAGE_SIZE);
    use vm::MmapError::*;
    assert_eq!(
        vm.mmap_checked(1, BASE, PG, true, &file, 13),
        Err(MisalignedOffset)
    );
    assert_eq!(
        vm.mmap_checked(1, BASE + 5, PG, true, &file, 0),
        Err(BadAddress)
    );
    assert_eq!(vm.mmap_checked(1, 0, PG, true, &file, 0), Err(BadAddress));
    assert_eq!(
        vm.mmap_checked(1, KERNEL_BASE, PG, true, &file, 0),
        Err(BadAddress)
    );
    assert_eq!(vm.mmap_checked(1, BASE, 0, true, &file, 0), Err(ZeroLength));

    let empty = page_file(b'A', 0);
    assert_eq!(
        vm.mmap_checked(1, BASE, PG, true, &empty, 0),
        Err(EmptyFile)
    );
}

#[test]
fn overlapping_mmap_is_rejected_without_damage() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', 2 * PAGE_SIZE);
    assert_eq!(vm.mmap(1, BASE, 2 * PG, true, &file, 0), Some(BASE));

    // second mapping landing on the tail page must fail...
    let other = page_file(b'B', PAGE_SIZE);
    assert_eq!(vm.mmap(1, BASE + PG, PG, true, &other, 0), None);

    // ...and must not disturb the first mapping
    assert_eq!(vm.space(1).unwrap().spt().len(), 2);
    let mut byte = [0u8; 1];
    copy_from_user(&mut vm, 1, BASE + PG, &mut byte).unwrap();
    assert_eq!(byte[0], b'A');
    check_invariants(&vm);
}

#[test]
fn munmap_writes_dirty_pages_back() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', PAGE_SIZE);
    assert_eq!(vm.mmap(1, BASE, PG, true, &file, 0), Some(BASE));

    copy_to_user(&mut vm, 1, BASE, b"B").unwrap();
    vm.munmap(1, BASE);

    let mut head = [0u8; 3];
    assert_eq!(file.lock().read_at(&mut head, 0), 3);
    assert_eq!(&head, b"BAA");

    // mapping is gone, frames returned
    assert!(vm.space(1).unwrap().spt().find(BASE).is_none());
    assert_eq!(vm.stats().user_frames_free, 8);
    check_invariants(&vm);
}

#[test]
fn munmap_discards_clean_pages() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', PAGE_SIZE);
    vm.mmap(1, BASE, PG, true, &file, 0);
    let mut byte = [0u8; 1];
    copy_from_user(&mut vm, 1, BASE, &mut byte).unwrap();
    vm.munmap(1, BASE);
    let mut head = [0u8; 1];
    file.lock().read_at(&mut head, 0);
    assert_eq!(head[0], b'A');
}

#[test]
fn munmap_is_idempotent() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', 2 * PAGE_SIZE);
    vm.mmap(1, BASE, 2 * PG, true, &file, 0);
    copy_to_user(&mut vm, 1, BASE, b"Z").unwrap();
    vm.munmap(1, BASE);
    assert!(vm.space(1).unwrap().spt().is_empty());
    // the second call finds nothing and does nothing
    vm.munmap(1, BASE);
    assert!(vm.space(1).unwrap().spt().is_empty());
}

#[test]
fn read_only_mapping_faults_on_write() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', PAGE_SIZE);
    vm.mmap(1, BASE, PG, false, &file, 0);

    // reads work
    let mut byte = [0u8; 1];
    copy_from_user(&mut vm, 1, BASE, &mut byte).unwrap();
    assert_eq!(byte[0], b'A');

    // writes are refused; the dispatcher would exit the process with -1
    assert!(!vm.try_handle_fault(1, &user_fault(BASE, true, 0)));
    assert_eq!(
        copy_to_user(&mut vm, 1, BASE, b"B"),
        Err(UserCopyError::Permission)
    );
}

#[test]
fn evicted_dirty_file_page_reaches_the_file() {
    // a dirty file page pushed out by memory pressure is flushed on
    // eviction, not just at munmap
    let mut vm = test_vm(4, 512);
    let file = page_file(b'A', PAGE_SIZE);
    vm.mmap(1, BASE, PG, true, &file, 0);
    copy_to_user(&mut vm, 1, BASE, b"B").unwrap();

    // flood the pool with anonymous pages until the file page is evicted
    let flood = 0x5000_0000u64;
    alloc_anon_range(&mut vm, 1, flood, 8);
    for i in 0..8u64 {
        write_user_u64(&mut vm, 1, flood + i * PG, i).unwrap();
    }
    assert!(!vm.space(1).unwrap().spt().find(BASE).unwrap().is_resident());

    let mut head = [0u8; 1];
    file.lock().read_at(&mut head, 0);
    assert_eq!(head[0], b'B');

    // and the content comes back from the file on the next touch
    let mut byte = [0u8; 1];
    copy_from_user(&mut vm, 1, BASE, &mut byte).unwrap();
    assert_eq!(byte[0], b'B');
    check_invariants(&vm);
}

// ----------------------------------------------------------------------
// Fork duplication
// ----------------------------------------------------------------------

#[test]
fn fork_deep_copies_materialized_pages() {
    let mut vm = test_vm(8, 256);
    alloc_anon_range(&mut vm, 1, BASE, 1);
    write_user_u64(&mut vm, 1, BASE, 0x58).unwrap(); // 'X'

    vm.create_space(2);
    assert!(vm.copy_space(2, 1));
    check_invariants(&vm);

    write_user_u64(&mut vm, 2, BASE, 0x59).unwrap(); // 'Y'
    assert_eq!(read_user_u64(&mut vm, 1, BASE).unwrap(), 0x58);
    assert_eq!(read_user_u64(&mut vm, 2, BASE).unwrap(), 0x59);
}

#[test]
fn fork_recreates_pending_pages_lazily() {
    let mut vm = test_vm(8, 256);
    let init = vm::page_init(|buf| {
        buf[0] = 0x2A;
        true
    });
    vm.alloc_page_with_initializer(
        1,
        FirstTouch::Anon { init: Some(init) },
        BASE,
        true,
        PageMarkers::empty(),
    );
    vm.alloc_page(1, USER_STACK_TOP - PG, true, PageMarkers::STACK);

    vm.create_space(2);
    assert!(vm.copy_space(2, 1));

    let child = vm.space(2).unwrap();
    assert!(child.spt().find(BASE).unwrap().is_uninit());
    assert!(child
        .spt()
        .find(USER_STACK_TOP - PG)
        .unwrap()
        .markers
        .contains(PageMarkers::STACK));

    // the initializer runs on the child's own first touch
    let mut byte = [0u8; 1];
    copy_from_user(&mut vm, 2, BASE, &mut byte).unwrap();
    assert_eq!(byte[0], 0x2A);
}

#[test]
fn fork_claims_swapped_out_sources() {
    let mut vm = test_vm(4, 512);
    let n = 8u64;
    alloc_anon_range(&mut vm, 1, BASE, n);
    for i in 0..n {
        write_user_u64(&mut vm, 1, BASE + i * PG, i).unwrap();
    }
    // several source pages are on disk by now
    assert!(vm.stats().swap_slots_used > 0);

    vm.create_space(2);
    assert!(vm.copy_space(2, 1));
    check_invariants(&vm);

    for i in 0..n {
        assert_eq!(read_user_u64(&mut vm, 2, BASE + i * PG).unwrap(), i);
        assert_eq!(read_user_u64(&mut vm, 1, BASE + i * PG).unwrap(), i);
    }
}

#[test]
fn fork_copies_file_mappings() {
    let mut vm = test_vm(8, 256);
    let file = page_file(b'A', PAGE_SIZE);
    vm.mmap(1, BASE, PG, true, &file, 0);
    copy_to_user(&mut vm, 1, BASE, b"P").unwrap();

    vm.create_space(2);
    assert!(vm.copy_space(2, 1));

    // the child sees the parent's in-memory content, not the file's
    let mut byte = [0u8; 1];
    copy_from_user(&mut vm, 2, BASE, &mut byte).unwrap();
    assert_eq!(byte[0], b'P');
    let child_page = vm.space(2).unwrap().spt().find(BASE).unwrap();
    assert_eq!(child_page.kind(), PageKind::File);
}

#[test]
fn copy_space_needs_an_existing_destination() {
    let mut vm = test_vm(8, 256);
    assert!(!vm.copy_space(7, 1));
    assert!(!vm.copy_space(1, 1));
    vm.create_space(2);
    assert!(!vm.copy_space(2, 9));
}
