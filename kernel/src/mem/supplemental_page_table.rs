//! Per-process record of every virtual page and where its contents live.

use super::vm_error::VmError;
use crate::paging::{FrameNumber, VirtPage};
use crate::swapping::SwapSlot;
use crate::user_program::Executable;
use alloc::collections::{btree_map::Entry, BTreeMap};
use alloc::sync::Arc;
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// Where the contents of a page come from.
#[derive(Clone)]
pub enum Backing {
    /// `read_bytes` bytes of `file` at `offset`, zero-padded to a page.
    Executable {
        file: Arc<dyn Executable>,
        offset: u64,
        read_bytes: usize,
    },
    ZeroFill,
    /// A user stack page. Its contents only ever live in memory or swap.
    Stack,
    /// A copy on the swap partition.
    Swapped { slot: SwapSlot },
}

impl Backing {
    pub fn is_stack(&self) -> bool {
        matches!(self, Backing::Stack)
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Executable {
                offset, read_bytes, ..
            } => write!(f, "Executable({read_bytes} bytes at {offset:#X})"),
            Backing::ZeroFill => write!(f, "ZeroFill"),
            Backing::Stack => write!(f, "Stack"),
            Backing::Swapped { slot } => write!(f, "Swapped({})", slot.index()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    NotLoaded,
    Resident,
    /// Unmapped and being written to swap. Still owns its frame.
    Evicting,
    InSwap,
    /// The swap copy could not be read back. The contents are gone.
    Lost,
}

#[derive(Debug, Clone)]
pub struct PageDescriptor {
    origin: Backing,
    writable: bool,
    residency: Residency,
    swap_slot: Option<SwapSlot>,
    frame: Option<FrameNumber>,
    diverged: bool,
}

impl PageDescriptor {
    fn new(origin: Backing, writable: bool) -> Self {
        Self {
            origin,
            writable,
            residency: Residency::NotLoaded,
            swap_slot: None,
            frame: None,
            diverged: false,
        }
    }

    /// Where the page would be loaded from right now.
    pub fn backing(&self) -> Backing {
        match self.swap_slot {
            Some(slot) => Backing::Swapped { slot },
            None => self.origin.clone(),
        }
    }

    /// The backing the page was created with.
    pub fn origin(&self) -> &Backing {
        &self.origin
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        self.frame
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        self.swap_slot
    }

    /// Whether the contents may differ from the original backing.
    pub fn is_diverged(&self) -> bool {
        self.diverged
    }

    /// Whether evicting the page has to keep a copy of its contents.
    pub fn must_preserve(&self, dirty: bool) -> bool {
        dirty || self.diverged || self.origin.is_stack()
    }

    pub fn mark_resident(&mut self, frame: FrameNumber) {
        assert!(
            matches!(self.residency, Residency::NotLoaded | Residency::InSwap),
            "page already resident in frame {:?}",
            self.frame
        );
        if self.residency == Residency::InSwap {
            self.swap_slot = None;
            self.diverged = true;
        }
        self.residency = Residency::Resident;
        self.frame = Some(frame);
    }

    /// The page has been unmapped and its contents are on their way to swap.
    pub fn mark_evicting(&mut self) {
        assert_eq!(self.residency, Residency::Resident, "evicting absent page");
        self.residency = Residency::Evicting;
    }

    pub fn mark_swapped(&mut self, slot: SwapSlot) {
        assert_eq!(self.residency, Residency::Evicting, "swapping out page not being evicted");
        self.residency = Residency::InSwap;
        self.swap_slot = Some(slot);
        self.frame = None;
    }

    /// The swap write failed and the page is mapped to its frame again. The
    /// dirty bit went away with the old mapping.
    pub fn cancel_eviction(&mut self, dirty: bool) {
        assert_eq!(
            self.residency,
            Residency::Evicting,
            "cancelling eviction of page not being evicted"
        );
        self.residency = Residency::Resident;
        self.diverged |= dirty;
    }

    pub fn mark_discarded(&mut self) {
        assert_eq!(self.residency, Residency::Resident, "discarding absent page");
        self.residency = Residency::NotLoaded;
        self.frame = None;
    }

    /// The swap copy could not be read back and its slot is gone. The page
    /// can never be loaded again.
    pub(crate) fn mark_swap_lost(&mut self) {
        assert_eq!(self.residency, Residency::InSwap);
        self.residency = Residency::Lost;
        self.swap_slot = None;
    }
}

#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: BTreeMap<VirtPage, PageDescriptor>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describes a new, not yet loaded page.
    pub fn insert(
        &mut self,
        page: VirtPage,
        backing: Backing,
        writable: bool,
    ) -> Result<&mut PageDescriptor, VmError> {
        match backing {
            Backing::Swapped { .. } => return Err(VmError::InvalidBacking),
            Backing::Executable { read_bytes, .. } if read_bytes > PAGE_FRAME_SIZE => {
                return Err(VmError::InvalidBacking)
            }
            _ => {}
        }
        match self.pages.entry(page) {
            Entry::Occupied(_) => Err(VmError::PageAlreadyPresent),
            Entry::Vacant(entry) => {
                Ok(entry.insert(PageDescriptor::new(backing, writable)))
            }
        }
    }

    pub fn find(&self, page: VirtPage) -> Option<&PageDescriptor> {
        self.pages.get(&page)
    }

    pub fn find_mut(&mut self, page: VirtPage) -> Option<&mut PageDescriptor> {
        self.pages.get_mut(&page)
    }

    pub fn remove(&mut self, page: VirtPage) -> Option<PageDescriptor> {
        self.pages.remove(&page)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VirtPage, &PageDescriptor)> {
        self.pages.iter().map(|(page, desc)| (*page, desc))
    }

    /// Swap slots held by pages that are currently in swap.
    pub fn swap_slots(&self) -> impl Iterator<Item = SwapSlot> + '_ {
        self.pages
            .values()
            .filter(|desc| desc.residency == Residency::InSwap)
            .filter_map(PageDescriptor::swap_slot)
    }
}
