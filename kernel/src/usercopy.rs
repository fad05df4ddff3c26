//! Safe User Memory Copy
//!
//! Primitives for moving bytes between the kernel and a user address
//! space. Accesses go through the process's page directory the way user
//! code would: missing translations are resolved through the page fault
//! handler, and each touched page gets its hardware accessed bit (and
//! dirty bit, for writes) set.
//!
//! Kernel-mode faults taken here carry no user stack pointer, so these
//! paths never grow the stack; callers map or grow stacks before copying.

use crate::memory::{
    is_user_address, page_floor, page_offset, PageFault, SpaceId, Vm, PAGE_SIZE,
};

/// Error codes for usercopy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCopyError {
    /// Pointer is null
    NullPointer,
    /// Address is not in user space
    NotUserSpace,
    /// Address range overflows
    Overflow,
    /// Page not registered, or the fault handler refused it
    PageFault,
    /// Writing to a read-only page
    Permission,
}

impl UserCopyError {
    /// Convert to errno
    pub fn to_errno(self) -> i64 {
        match self {
            Self::NullPointer | Self::NotUserSpace | Self::Overflow => -14, // EFAULT
            Self::PageFault => -14,                                         // EFAULT
            Self::Permission => -13,                                        // EACCES
        }
    }
}

fn validate(va: u64, len: usize) -> Result<(), UserCopyError> {
    if len == 0 {
        return Ok(());
    }
    if va == 0 {
        return Err(UserCopyError::NullPointer);
    }
    let end = va
        .checked_add(len as u64)
        .ok_or(UserCopyError::Overflow)?;
    if !is_user_address(va) || !is_user_address(end - 1) {
        return Err(UserCopyError::NotUserSpace);
    }
    Ok(())
}

/// Make the page covering `va` resident and permission-checked.
/// Returns the kernel address of its frame.
fn resolve_page(vm: &mut Vm, space: SpaceId, va: u64, write: bool) -> Result<u64, UserCopyError> {
    {
        let spc = vm.space(space).ok_or(UserCopyError::PageFault)?;
        let page = spc.spt().find(va).ok_or(UserCopyError::PageFault)?;
        if write && !page.writable {
            return Err(UserCopyError::Permission);
        }
        if let Some(kva) = spc.translate(va) {
            return Ok(kva);
        }
    }
    let fault = PageFault {
        addr: va,
        write,
        user: false,
        not_present: true,
        rsp: 0,
        saved_user_rsp: 0,
    };
    if !vm.try_handle_fault(space, &fault) {
        return Err(UserCopyError::PageFault);
    }
    vm.space(space)
        .and_then(|s| s.translate(va))
        .ok_or(UserCopyError::PageFault)
}

/// Copy `src` into the user address space at `va`
pub fn copy_to_user(
    vm: &mut Vm,
    space: SpaceId,
    va: u64,
    src: &[u8],
) -> Result<(), UserCopyError> {
    validate(va, src.len())?;
    let mut va = va;
    let mut src = src;
    while !src.is_empty() {
        let kva = resolve_page(vm, space, va, true)?;
        let at = page_offset(va);
        let n = src.len().min(PAGE_SIZE - at);
        vm.pool.page_mut(kva)[at..at + n].copy_from_slice(&src[..n]);
        mark_access(vm, space, va, true);
        va += n as u64;
        src = &src[n..];
    }
    Ok(())
}

/// Copy from the user address space at `va` into `dst`
pub fn copy_from_user(
    vm: &mut Vm,
    space: SpaceId,
    va: u64,
    dst: &mut [u8],
) -> Result<(), UserCopyError> {
    validate(va, dst.len())?;
    let mut va = va;
    let mut dst = dst;
    while !dst.is_empty() {
        let kva = resolve_page(vm, space, va, false)?;
        let at = page_offset(va);
        let n = dst.len().min(PAGE_SIZE - at);
        let (head, rest) = dst.split_at_mut(n);
        head.copy_from_slice(&vm.pool.page(kva)[at..at + n]);
        mark_access(vm, space, va, false);
        va += n as u64;
        dst = rest;
    }
    Ok(())
}

/// Write a u64 into a user address space; used by ptrace-style debuggers
pub fn write_user_u64(vm: &mut Vm, space: SpaceId, va: u64, value: u64) -> Result<(), i64> {
    copy_to_user(vm, space, va, &value.to_le_bytes()).map_err(UserCopyError::to_errno)
}

/// Read a u64 from a user address space
pub fn read_user_u64(vm: &mut Vm, space: SpaceId, va: u64) -> Result<u64, i64> {
    let mut bytes = [0u8; 8];
    copy_from_user(vm, space, va, &mut bytes).map_err(UserCopyError::to_errno)?;
    Ok(u64::from_le_bytes(bytes))
}

/// What the MMU records on a successful access
fn mark_access(vm: &mut Vm, space: SpaceId, va: u64, write: bool) {
    if let Some(spc) = vm.spaces.get_mut(&space) {
        spc.pd.mark_access(page_floor(va), write);
    }
}
