//! Per-process page directories and the page-granular addresses they map.
//!
//! The fault path only ever needs a handful of operations on a page
//! directory, collected in the [`PageDirectory`] trait. [`PageManager`] is
//! the two-level x86 implementation used by the kernel and by the tests; its
//! [`access`](PageDirectory::access) emulates what the MMU does on a load or
//! store so that accessed and dirty bits behave like the hardware ones.

// Avoids lots of warnings about casting usize to u32 which cannot result in
// truncation on a 32-bit platform.
#![allow(clippy::cast_possible_truncation)]

use alloc::{boxed::Box, collections::BTreeMap};
use core::fmt;
use kidneyos_shared::mem::{page_round_down, PAGE_FRAME_SIZE};
use kidneyos_shared::paging::{PageTable, PageTableEntry, VirtualAddress};

/// Index of a physical frame in the frame table.
pub type FrameNumber = usize;

/// A page-aligned user virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPage(usize);

impl VirtPage {
    /// The page that contains `addr`.
    pub const fn containing(addr: usize) -> Self {
        Self(page_round_down(addr))
    }

    pub const fn from_number(number: usize) -> Self {
        Self(number * PAGE_FRAME_SIZE)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    /// Virtual page number.
    pub const fn number(self) -> usize {
        self.0 / PAGE_FRAME_SIZE
    }

    /// The page `count` pages above this one, if it doesn't wrap.
    pub fn checked_add(self, count: usize) -> Option<Self> {
        count
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|bytes| self.0.checked_add(bytes))
            .map(Self)
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtPage({:#X})", self.0)
    }
}

impl fmt::Display for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

/// The kind of memory access that caused a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// The page-table operations the virtual memory system relies on.
pub trait PageDirectory: Send {
    /// Installs a user mapping from `page` to `frame`. Returns `false` if
    /// `page` is already mapped.
    fn map(&mut self, page: VirtPage, frame: FrameNumber, writable: bool) -> bool;

    /// Removes the mapping for `page`, returning the entry as it was, with
    /// its accessed and dirty bits.
    fn unmap(&mut self, page: VirtPage) -> Option<PageTableEntry>;

    fn is_accessed(&self, page: VirtPage) -> bool;

    fn clear_accessed(&mut self, page: VirtPage);

    fn is_dirty(&self, page: VirtPage) -> bool;

    /// The frame `page` is mapped to, if any.
    fn translate(&self, page: VirtPage) -> Option<FrameNumber>;

    /// Performs an access the way the MMU would: sets the accessed bit, and
    /// the dirty bit for writes. Returns `None` when the access would fault.
    fn access(&mut self, page: VirtPage, kind: AccessKind) -> Option<FrameNumber>;
}

/// Two-level page directory. Page tables are created on first use and freed
/// once their last entry is unmapped.
#[derive(Default)]
pub struct PageManager {
    tables: BTreeMap<usize, Box<PageTable>>,
    mapped: usize,
}

impl PageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of present mappings.
    pub fn len(&self) -> usize {
        self.mapped
    }

    pub fn is_empty(&self) -> bool {
        self.mapped == 0
    }

    fn split(page: VirtPage) -> (usize, usize) {
        let addr = VirtualAddress::from_usize(page.addr());
        (
            addr.page_directory_index().value() as usize,
            addr.page_table_index().value() as usize,
        )
    }

    fn entry(&self, page: VirtPage) -> Option<&PageTableEntry> {
        let (dir, table) = Self::split(page);
        self.tables
            .get(&dir)
            .map(|t| &t[table])
            .filter(|entry| entry.present())
    }

    fn entry_mut(&mut self, page: VirtPage) -> Option<&mut PageTableEntry> {
        let (dir, table) = Self::split(page);
        self.tables
            .get_mut(&dir)
            .map(|t| &mut t[table])
            .filter(|entry| entry.present())
    }
}

impl PageDirectory for PageManager {
    fn map(&mut self, page: VirtPage, frame: FrameNumber, writable: bool) -> bool {
        let (dir, table) = Self::split(page);
        let page_table = self.tables.entry(dir).or_default();
        if page_table[table].present() {
            return false;
        }
        page_table[table] = PageTableEntry::user_mapping(frame, writable);
        self.mapped += 1;
        true
    }

    fn unmap(&mut self, page: VirtPage) -> Option<PageTableEntry> {
        let (dir, table) = Self::split(page);
        let page_table = self.tables.get_mut(&dir)?;
        let entry = page_table[table];
        if !entry.present() {
            return None;
        }
        page_table[table] = PageTableEntry::DEFAULT;
        if page_table.is_empty() {
            self.tables.remove(&dir);
        }
        self.mapped -= 1;
        Some(entry)
    }

    fn is_accessed(&self, page: VirtPage) -> bool {
        self.entry(page).is_some_and(|entry| entry.accessed())
    }

    fn clear_accessed(&mut self, page: VirtPage) {
        if let Some(entry) = self.entry_mut(page) {
            *entry = entry.with_accessed(false);
        }
    }

    fn is_dirty(&self, page: VirtPage) -> bool {
        self.entry(page).is_some_and(|entry| entry.dirty())
    }

    fn translate(&self, page: VirtPage) -> Option<FrameNumber> {
        self.entry(page).map(PageTableEntry::frame)
    }

    fn access(&mut self, page: VirtPage, kind: AccessKind) -> Option<FrameNumber> {
        let entry = self.entry_mut(page)?;
        let write = kind == AccessKind::Write;
        if write && !entry.read_write() {
            return None;
        }
        *entry = entry.with_accessed(true).with_dirty(entry.dirty() || write);
        Some(entry.frame())
    }
}
