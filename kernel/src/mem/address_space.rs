//! One process's view of virtual memory.
//!
//! An [`AddressSpace`] pairs the supplemental page table, which says what
//! each page *should* contain, with the page directory, which says what is
//! actually mapped. Faults move pages from the former into the latter;
//! evictions started by other processes move them back out.
//!
//! Locks are taken in the order fault lock, frame table, page table,
//! page directory, frame memory, swap. The frame table is never locked while
//! the page table, the page directory or a frame is held. Device I/O runs
//! with none of these held except the fault lock of the faulting process.

use super::frame_table::PhysicalMemory;
use super::supplemental_page_table::{
    Backing, PageDescriptor, Residency, SupplementalPageTable,
};
use super::vm_error::VmError;
use super::{SpaceId, VirtualMemory};
use crate::paging::{AccessKind, FrameNumber, PageDirectory, VirtPage};
use crate::swapping::{SwapSlot, SwapStore};
use crate::sync::{Mutex, MutexGuard};
use alloc::{boxed::Box, sync::Arc, vec};
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use kidneyos_shared::mem::{is_user_vaddr, PAGE_FRAME_SIZE};

/// What happened to a page taken out of its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// The page can be re-created from its backing and was dropped.
    Discarded,
    SwappedOut(SwapSlot),
}

pub struct AddressSpace {
    id: SpaceId,
    vm: Arc<VirtualMemory>,
    /// Serialises fault resolution so a page is only ever filled once.
    fault_lock: Mutex<()>,
    spt: Mutex<SupplementalPageTable>,
    directory: Mutex<Box<dyn PageDirectory>>,
    destroyed: AtomicBool,
}

impl AddressSpace {
    pub(super) fn new(
        id: SpaceId,
        vm: Arc<VirtualMemory>,
        directory: Box<dyn PageDirectory>,
    ) -> Self {
        Self {
            id,
            vm,
            fault_lock: Mutex::new(()),
            spt: Mutex::new(SupplementalPageTable::new()),
            directory: Mutex::new(directory),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn vm(&self) -> &Arc<VirtualMemory> {
        &self.vm
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    fn check_live(&self) -> Result<(), VmError> {
        if self.is_destroyed() {
            return Err(VmError::AddressSpaceDestroyed);
        }
        Ok(())
    }

    /// Locks the page directory, e.g. to perform user accesses through it.
    pub fn directory(&self) -> MutexGuard<'_, Box<dyn PageDirectory>> {
        self.directory.lock()
    }

    /// Describes `page`. Stack pages are given a zeroed frame right away,
    /// everything else is loaded on first access.
    pub fn insert(
        &self,
        page: VirtPage,
        backing: Backing,
        writable: bool,
    ) -> Result<(), VmError> {
        self.check_live()?;
        if !is_user_vaddr(page.addr()) {
            return Err(VmError::NotUserAddress);
        }

        let _fault = self.fault_lock.lock();
        let stack = backing.is_stack();
        log::trace!("{}: insert {} {:?}", self.id, page, backing);
        self.spt.lock().insert(page, backing, writable)?;

        if stack {
            if let Err(err) = self.load_page(page, AccessKind::Write) {
                log::debug!("{}: no frame for stack page {}: {}", self.id, page, err);
                self.spt.lock().remove(page);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Makes `page` resident so that an `access` to it can succeed.
    pub fn resolve_fault(&self, page: VirtPage, access: AccessKind) -> Result<(), VmError> {
        self.check_live()?;
        let _fault = self.fault_lock.lock();
        self.vm.record_fault();
        self.load_page(page, access)
    }

    /// Adds a stack page at `page`.
    pub fn grow_stack(&self, page: VirtPage) -> Result<(), VmError> {
        log::debug!("{}: growing stack to {}", self.id, page);
        self.insert(page, Backing::Stack, true)
    }

    /// A copy of the descriptor of `page`.
    pub fn find(&self, page: VirtPage) -> Option<PageDescriptor> {
        self.spt.lock().find(page).cloned()
    }

    /// Number of described pages.
    pub fn page_count(&self) -> usize {
        self.spt.lock().len()
    }

    /// Swap slots this address space is holding.
    pub fn swap_slots_held(&self) -> usize {
        self.spt.lock().swap_slots().count()
    }

    /// Loads `page` into a frame. Must be called with the fault lock held.
    fn load_page(&self, page: VirtPage, access: AccessKind) -> Result<(), VmError> {
        let (backing, writable) = loop {
            let spt = self.spt.lock();
            let desc = spt.find(page).ok_or(VmError::InvalidAccess)?;
            if access == AccessKind::Write && !desc.writable() {
                return Err(VmError::WriteToReadOnly);
            }
            match desc.residency() {
                Residency::NotLoaded | Residency::InSwap => {
                    break (desc.backing(), desc.writable());
                }
                Residency::Resident => {
                    log::trace!("{}: spurious fault on {}", self.id, page);
                    return Ok(());
                }
                Residency::Lost => return Err(VmError::PageLost(page)),
                // Another fault is writing the page to swap. Wait for it to
                // land in swap or be mapped again.
                Residency::Evicting => {
                    drop(spt);
                    core::hint::spin_loop();
                }
            }
        };

        let frame = self
            .vm
            .frames()
            .assign_frame(self.id, page, self.vm.as_ref())?;

        if let Err(err) = self.fill(page, &backing, frame.number()) {
            if let Backing::Swapped { .. } = backing {
                if let Some(desc) = self.spt.lock().find_mut(page) {
                    desc.mark_swap_lost();
                }
            }
            frame.release();
            return Err(err);
        }

        let mut spt = self.spt.lock();
        let Some(desc) = spt.find_mut(page) else {
            drop(spt);
            frame.release();
            return Err(VmError::AddressSpaceDestroyed);
        };
        let mapped = self.directory.lock().map(page, frame.number(), writable);
        assert!(mapped, "{} already mapped in {}", page, self.id);
        desc.mark_resident(frame.number());
        log::trace!("{}: {} resident in frame {}", self.id, page, frame.number());
        Ok(())
    }

    /// Fills a freshly zeroed frame with the contents of `backing`. Device
    /// reads go to a buffer first so the frame is only locked for the copy.
    fn fill(
        &self,
        page: VirtPage,
        backing: &Backing,
        frame: FrameNumber,
    ) -> Result<(), VmError> {
        let mut buffer = vec![0; PAGE_FRAME_SIZE];
        match backing {
            Backing::Executable {
                file,
                offset,
                read_bytes,
            } => {
                let read = file.read_at(&mut buffer[..*read_bytes], *offset);
                if read != *read_bytes {
                    return Err(VmError::ShortRead {
                        page,
                        expected: *read_bytes,
                        read,
                    });
                }
            }
            // The frame table hands out zeroed frames.
            Backing::ZeroFill | Backing::Stack => return Ok(()),
            Backing::Swapped { slot } => {
                self.vm.swap().read_in(*slot, &mut buffer)?;
                self.vm.record_swap_in();
            }
        }
        self.vm
            .frames()
            .memory()
            .lock(frame)
            .copy_from_slice(&buffer);
        Ok(())
    }

    pub(crate) fn is_accessed(&self, page: VirtPage) -> bool {
        self.directory.lock().is_accessed(page)
    }

    pub(crate) fn clear_accessed(&self, page: VirtPage) {
        self.directory.lock().clear_accessed(page);
    }

    /// Takes `page` out of `frame`, writing it to swap if it cannot be
    /// re-created from its backing. On failure the page stays mapped.
    ///
    /// The swap write happens with no lock of this address space held. The
    /// frame is pinned for its new owner and no longer mapped here, so its
    /// contents cannot change underneath the write. Faults on the page wait
    /// until it has reached swap.
    pub fn evict_page(
        &self,
        page: VirtPage,
        frame: FrameNumber,
        memory: &PhysicalMemory,
        swap: &SwapStore,
    ) -> Result<Eviction, VmError> {
        let dirty = {
            let mut spt = self.spt.lock();
            let mut directory = self.directory.lock();
            let Some(desc) = spt
                .find_mut(page)
                .filter(|desc| desc.frame() == Some(frame))
            else {
                // Torn down while the frame was changing hands.
                if directory.translate(page) == Some(frame) {
                    directory.unmap(page);
                }
                return Ok(Eviction::Discarded);
            };

            let dirty = directory.unmap(page).is_some_and(|entry| entry.dirty());
            if !desc.must_preserve(dirty) {
                desc.mark_discarded();
                log::trace!("{}: discarded {} from frame {}", self.id, page, frame);
                return Ok(Eviction::Discarded);
            }
            desc.mark_evicting();
            dirty
        };

        let contents = memory.lock(frame).to_vec();
        let result = swap.swap_out(&contents);

        let mut spt = self.spt.lock();
        let Some(desc) = spt
            .find_mut(page)
            .filter(|desc| desc.residency() == Residency::Evicting)
        else {
            // Destroyed during the write. The slot was never recorded.
            log::trace!("{}: {} torn down while being evicted", self.id, page);
            if let Ok(slot) = result {
                swap.free_slot(slot);
            }
            return Ok(Eviction::Discarded);
        };

        match result {
            Ok(slot) => {
                desc.mark_swapped(slot);
                log::trace!("{}: {} swapped out to {:?}", self.id, page, slot);
                Ok(Eviction::SwappedOut(slot))
            }
            Err(err) => {
                let remapped = self.directory.lock().map(page, frame, desc.writable());
                debug_assert!(remapped);
                desc.cancel_eviction(dirty);
                Err(VmError::SwapIo(err))
            }
        }
    }

    /// Releases every frame and swap slot held by this address space and
    /// forgets all of its pages. Further faults fail. Calling this twice does
    /// nothing.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _fault = self.fault_lock.lock();

        let freed = self.vm.frames().free_owner_frames(self.id);
        let spt = core::mem::take(&mut *self.spt.lock());
        {
            let mut directory = self.directory.lock();
            for (_, page) in &freed {
                directory.unmap(*page);
            }
            for (page, _) in spt.iter() {
                directory.unmap(page);
            }
        }

        let mut slots = 0;
        for slot in spt.swap_slots() {
            self.vm.swap().free_slot(slot);
            slots += 1;
        }
        self.vm.unregister(self.id);
        log::debug!(
            "Destroyed {}: {} pages, {} frames, {} swap slots",
            self.id,
            spt.len(),
            freed.len(),
            slots
        );
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if *self.destroyed.get_mut() {
            return;
        }
        log::warn!("{} dropped without being destroyed", self.id);
        for slot in self.spt.get_mut().swap_slots() {
            self.vm.swap().free_slot(slot);
        }
        self.vm.unregister(self.id);
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("pages", &self.page_count())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}
