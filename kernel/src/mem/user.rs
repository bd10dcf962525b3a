//! Copying between kernel buffers and user virtual memory.
//!
//! Accesses go through the address space's page directory the way the MMU
//! would, so they set accessed and dirty bits and fault in pages that are
//! not resident. A fault that would kill the process makes the copy fail.

use super::address_space::AddressSpace;
use crate::interrupts::page_fault::{handle_page_fault, FaultResolution, PageFault};
use crate::paging::{AccessKind, VirtPage};
use alloc::vec::Vec;
use kidneyos_shared::mem::{is_user_vaddr, page_offset, PAGE_FRAME_SIZE, PHYS_BASE};

/// Checks that `len` bytes starting at `addr` lie in user space.
fn check_user_range(addr: usize, len: usize) -> bool {
    addr.checked_add(len)
        .is_some_and(|end| is_user_vaddr(addr) && end <= PHYS_BASE)
}

/// Runs `copy` on the part of the frame that holds `addr`, faulting the page
/// in first if needed. The page directory stays locked during the copy so
/// the page cannot be evicted underneath it.
fn with_user_page<F>(space: &AddressSpace, addr: usize, access: AccessKind, copy: F) -> bool
where
    F: FnOnce(&mut [u8]),
{
    let page = VirtPage::containing(addr);
    let mut copy = Some(copy);
    loop {
        {
            let mut directory = space.directory();
            if let Some(frame) = directory.access(page, access) {
                let mut contents = space.vm().frames().memory().lock(frame);
                if let Some(copy) = copy.take() {
                    copy(&mut contents[page_offset(addr)..]);
                }
                return true;
            }
        }

        let fault = PageFault {
            addr,
            access,
            user: false,
            // Kernel accesses never grow the stack.
            esp: usize::MAX,
        };
        if let FaultResolution::Kill { .. } = handle_page_fault(space, &fault) {
            return false;
        }
    }
}

/// Copies `len` bytes of user memory at `addr` into a kernel buffer.
pub fn copy_from_user(space: &AddressSpace, addr: usize, len: usize) -> Option<Vec<u8>> {
    if !check_user_range(addr, len) {
        return None;
    }

    let mut bytes = Vec::with_capacity(len);
    let mut cursor = addr;
    while bytes.len() < len {
        let chunk = (PAGE_FRAME_SIZE - page_offset(cursor)).min(len - bytes.len());
        let copied = with_user_page(space, cursor, AccessKind::Read, |src| {
            bytes.extend_from_slice(&src[..chunk]);
        });
        if !copied {
            return None;
        }
        cursor += chunk;
    }
    Some(bytes)
}

/// Copies `bytes` into user memory at `addr`. Returns `false` if any of the
/// destination is not writable user memory, in which case a prefix may
/// already have been written.
pub fn copy_to_user(space: &AddressSpace, addr: usize, bytes: &[u8]) -> bool {
    if !check_user_range(addr, bytes.len()) {
        return false;
    }

    let mut cursor = addr;
    let mut rest = bytes;
    while !rest.is_empty() {
        let chunk = (PAGE_FRAME_SIZE - page_offset(cursor)).min(rest.len());
        let (head, tail) = rest.split_at(chunk);
        if !with_user_page(space, cursor, AccessKind::Write, |dst| {
            dst[..chunk].copy_from_slice(head);
        }) {
            return false;
        }
        cursor += chunk;
        rest = tail;
    }
    true
}
