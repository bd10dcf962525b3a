use crate::sizes::{KB, MB, SECTOR_SIZE, SWAP_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Top of the user address space. User stacks grow down from here.
pub const PHYS_BASE: usize = OFFSET;

/// Number of device sectors backing one page of swap.
pub const SECTORS_PER_PAGE: usize = PAGE_FRAME_SIZE / SECTOR_SIZE;

/// Number of page-sized slots on the default swap partition.
pub const SWAP_SLOTS: usize = SWAP_SIZE / PAGE_FRAME_SIZE;

/// Frames handed to user processes when nothing else is configured.
pub const USER_FRAMES: usize = 383;

/// The user stack may not grow past this many bytes below `PHYS_BASE`.
pub const MAX_STACK_SIZE: usize = 8 * MB;

/// PUSHA writes 32 bytes below the stack pointer before moving it, so a fault
/// that far below `esp` is still a stack access.
pub const STACK_PUSH_SLACK: usize = 32;

const PAGE_MASK: usize = PAGE_FRAME_SIZE - 1;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_MASK) & !PAGE_MASK
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & PAGE_MASK
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < PHYS_BASE
}

#[inline]
pub const fn is_kernel_vaddr(addr: usize) -> bool {
    addr >= PHYS_BASE
}
