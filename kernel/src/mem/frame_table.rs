//! The global table of user frames.
//!
//! Every physical frame handed to user processes has one [`FrameSlot`] in the
//! core map recording who it belongs to and which of their pages it holds.
//! When no slot is free, the configured replacement policy picks a victim and
//! the victim's owner is asked to give the page up before the frame changes
//! hands.

use super::vm_error::VmError;
use super::SpaceId;
use crate::paging::{FrameNumber, VirtPage};
use crate::swapping::page_replacement::{EvictionPolicy, PageReplacementPolicy};
use crate::sync::{Mutex, MutexGuard};
use alloc::{boxed::Box, vec::Vec};
use bitbybit::bitfield;
use core::fmt;
use kidneyos_shared::mem::PAGE_FRAME_SIZE;

/// The contents of one physical frame.
pub type Frame = [u8; PAGE_FRAME_SIZE];

#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    #[bit(0, rw)]
    allocated: bool,
    #[bit(1, rw)]
    pinned: bool,
}

/// Core map entry for one frame.
#[derive(Clone, Copy)]
pub struct FrameSlot {
    flags: FrameFlags,
    owner: Option<SpaceId>,
    mapped_page: Option<VirtPage>,
}

impl FrameSlot {
    const FREE: Self = Self {
        flags: FrameFlags::DEFAULT,
        owner: None,
        mapped_page: None,
    };

    pub fn is_allocated(&self) -> bool {
        self.flags.allocated()
    }

    /// Pinned frames are being filled or drained and are never evicted.
    pub fn is_pinned(&self) -> bool {
        self.flags.pinned()
    }

    pub fn owner(&self) -> Option<SpaceId> {
        self.owner
    }

    pub fn mapped_page(&self) -> Option<VirtPage> {
        self.mapped_page
    }

    /// The `(owner, page)` pair held by an allocated slot.
    pub fn mapping(&self) -> Option<(SpaceId, VirtPage)> {
        self.owner.zip(self.mapped_page)
    }

    #[cfg(test)]
    pub(crate) fn assigned(owner: SpaceId, page: VirtPage, pinned: bool) -> Self {
        let mut slot = Self::FREE;
        slot.assign(owner, page);
        slot.flags = slot.flags.with_pinned(pinned);
        slot
    }

    fn assign(&mut self, owner: SpaceId, page: VirtPage) {
        self.flags = FrameFlags::DEFAULT.with_allocated(true).with_pinned(true);
        self.owner = Some(owner);
        self.mapped_page = Some(page);
    }
}

impl fmt::Debug for FrameSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mapping() {
            None => write!(f, "Free"),
            Some((owner, page)) => write!(
                f,
                "{owner}:{page}{}",
                if self.is_pinned() { " (pinned)" } else { "" }
            ),
        }
    }
}

/// The address spaces that own frames, as seen by the frame table.
pub trait FrameOwners {
    /// Whether `owner` touched `page` since its accessed bit was last cleared.
    fn is_accessed(&self, owner: SpaceId, page: VirtPage) -> bool;

    fn clear_accessed(&self, owner: SpaceId, page: VirtPage);

    /// Takes `page` of `owner` out of `frame`, saving its contents first if
    /// they cannot be re-created. When this fails the page must still be
    /// resident in `frame`.
    fn evict(
        &self,
        owner: SpaceId,
        page: VirtPage,
        frame: FrameNumber,
        memory: &PhysicalMemory,
    ) -> Result<(), VmError>;
}

/// The physical frames themselves, one lock per frame.
pub struct PhysicalMemory {
    frames: Box<[Mutex<Box<Frame>>]>,
}

impl PhysicalMemory {
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| Mutex::new(Box::new([0; PAGE_FRAME_SIZE])))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Locks the contents of `frame`.
    ///
    /// Panics if `frame` is out of range.
    pub fn lock(&self, frame: FrameNumber) -> MutexGuard<'_, Box<Frame>> {
        self.frames[frame].lock()
    }
}

struct CoreMap {
    slots: Box<[FrameSlot]>,
    policy: Box<dyn PageReplacementPolicy>,
    frames_allocated: usize,
}

pub struct FrameTable {
    core_map: Mutex<CoreMap>,
    memory: PhysicalMemory,
}

impl FrameTable {
    pub fn new(frames: usize, policy: EvictionPolicy) -> Self {
        log::debug!("Frame table: {} user frames, {:?} eviction", frames, policy);
        Self {
            core_map: Mutex::new(CoreMap {
                slots: alloc::vec![FrameSlot::FREE; frames].into_boxed_slice(),
                policy: policy.build(),
                frames_allocated: 0,
            }),
            memory: PhysicalMemory::new(frames),
        }
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn frames_in_use(&self) -> usize {
        self.core_map.lock().frames_allocated
    }

    /// A copy of the core map entry for `frame`.
    pub fn slot(&self, frame: FrameNumber) -> Option<FrameSlot> {
        self.core_map.lock().slots.get(frame).copied()
    }

    /// The frame currently holding `page` of `owner`.
    pub fn frame_of(&self, owner: SpaceId, page: VirtPage) -> Option<FrameNumber> {
        self.core_map
            .lock()
            .slots
            .iter()
            .position(|slot| slot.mapping() == Some((owner, page)))
    }

    pub fn memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    /// Gets a zeroed frame for `page` of `owner`, evicting another page if
    /// every frame is taken. The frame comes back pinned; the hardware
    /// mapping is left to the caller.
    pub fn assign_frame(
        &self,
        owner: SpaceId,
        page: VirtPage,
        owners: &dyn FrameOwners,
    ) -> Result<PinnedFrame<'_>, VmError> {
        let (frame, victim) = {
            let mut core_map = self.core_map.lock();
            let CoreMap {
                slots,
                policy,
                frames_allocated,
            } = &mut *core_map;
            debug_assert!(
                !slots.iter().any(|slot| slot.mapping() == Some((owner, page))),
                "{owner}:{page} already has a frame"
            );

            if let Some(frame) = slots.iter().position(|slot| !slot.is_allocated()) {
                slots[frame].assign(owner, page);
                *frames_allocated += 1;
                (frame, None)
            } else {
                let frame = policy
                    .select_victim(slots, owners)
                    .ok_or(VmError::NoEvictableFrame)?;
                let victim = slots[frame];
                assert!(!victim.is_pinned(), "policy chose pinned frame {frame}");
                slots[frame].assign(owner, page);
                (frame, Some(victim))
            }
        };

        if let Some(victim) = victim {
            if let Some((victim_owner, victim_page)) = victim.mapping() {
                log::debug!(
                    "Evicting {}:{} from frame {} for {}:{}",
                    victim_owner,
                    victim_page,
                    frame,
                    owner,
                    page
                );
                if let Err(err) = owners.evict(victim_owner, victim_page, frame, &self.memory) {
                    log::warn!("Eviction from frame {} failed: {}", frame, err);
                    self.core_map.lock().slots[frame] = victim;
                    return Err(err);
                }
            }
        }

        self.memory.lock(frame).fill(0);
        log::trace!("Frame {} assigned to {}:{}", frame, owner, page);
        Ok(PinnedFrame { table: self, frame })
    }

    /// Frees every frame owned by `owner`, zeroing it, and reports the pages
    /// that were held so their mappings can be cleared.
    pub fn free_owner_frames(&self, owner: SpaceId) -> Vec<(FrameNumber, VirtPage)> {
        let mut core_map = self.core_map.lock();
        let mut freed = Vec::new();
        for (frame, slot) in core_map.slots.iter_mut().enumerate() {
            if slot.owner != Some(owner) {
                continue;
            }
            if let Some(page) = slot.mapped_page {
                freed.push((frame, page));
            }
            *slot = FrameSlot::FREE;
            self.memory.lock(frame).fill(0);
        }
        core_map.frames_allocated -= freed.len();
        freed
    }

    fn unpin(&self, frame: FrameNumber) {
        let mut core_map = self.core_map.lock();
        let slot = &mut core_map.slots[frame];
        assert!(slot.is_pinned(), "frame {frame} is not pinned");
        slot.flags = slot.flags.with_pinned(false);
    }

    fn release(&self, frame: FrameNumber) {
        let mut core_map = self.core_map.lock();
        assert!(core_map.slots[frame].is_pinned(), "frame {frame} is not pinned");
        core_map.slots[frame] = FrameSlot::FREE;
        core_map.frames_allocated -= 1;
        self.memory.lock(frame).fill(0);
    }
}

impl fmt::Debug for FrameTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.core_map.lock().slots.iter())
            .finish()
    }
}

/// A frame pinned for its new owner. Dropping the guard unpins the frame.
#[must_use]
pub struct PinnedFrame<'a> {
    table: &'a FrameTable,
    frame: FrameNumber,
}

impl PinnedFrame<'_> {
    pub fn number(&self) -> FrameNumber {
        self.frame
    }

    /// Gives the frame back to the table instead of keeping it.
    pub fn release(self) {
        self.table.release(self.frame);
        core::mem::forget(self);
    }
}

impl Drop for PinnedFrame<'_> {
    fn drop(&mut self) {
        self.table.unpin(self.frame);
    }
}
