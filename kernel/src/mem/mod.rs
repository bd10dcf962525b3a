//! Demand paging for user address spaces.

pub mod address_space;
pub mod frame_table;
pub mod supplemental_page_table;
pub mod user;
pub mod vm_error;

pub use self::address_space::{AddressSpace, Eviction};
pub use self::frame_table::{FrameOwners, FrameTable, PhysicalMemory, PinnedFrame};
pub use self::supplemental_page_table::{
    Backing, PageDescriptor, Residency, SupplementalPageTable,
};
pub use self::vm_error::VmError;

use crate::block::Block;
use crate::paging::{FrameNumber, PageDirectory, PageManager, VirtPage};
use crate::swapping::{EvictionPolicy, SwapStore};
use crate::sync::Mutex;
use alloc::{
    boxed::Box,
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::{MAX_STACK_SIZE, STACK_PUSH_SLACK, USER_FRAMES};

/// Identifies an address space without keeping it alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(usize);

impl SpaceId {
    pub(crate) const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn value(self) -> usize {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "space {}", self.0)
    }
}

/// Boot-time parameters of the virtual memory system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Number of frames shared by all user processes.
    pub user_frames: usize,
    pub eviction: EvictionPolicy,
    /// How far below `PHYS_BASE` the user stack may grow.
    pub max_stack_size: usize,
    /// How far below the stack pointer an access still counts as a push.
    pub stack_slack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: USER_FRAMES,
            eviction: EvictionPolicy::default(),
            max_stack_size: MAX_STACK_SIZE,
            stack_slack: STACK_PUSH_SLACK,
        }
    }
}

impl VmConfig {
    pub fn with_user_frames(self, user_frames: usize) -> Self {
        Self {
            user_frames,
            ..self
        }
    }

    pub fn with_eviction(self, eviction: EvictionPolicy) -> Self {
        Self { eviction, ..self }
    }

    pub fn with_max_stack_size(self, max_stack_size: usize) -> Self {
        Self {
            max_stack_size,
            ..self
        }
    }

    pub fn with_stack_slack(self, stack_slack: usize) -> Self {
        Self {
            stack_slack,
            ..self
        }
    }
}

/// A snapshot of the paging counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub faults: usize,
    pub evictions: usize,
    pub swap_outs: usize,
    pub swap_ins: usize,
    pub discards: usize,
}

#[derive(Default)]
struct StatCounters {
    faults: AtomicUsize,
    evictions: AtomicUsize,
    swap_outs: AtomicUsize,
    swap_ins: AtomicUsize,
    discards: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// The frame table, the swap store and every live address space.
pub struct VirtualMemory {
    config: VmConfig,
    frames: FrameTable,
    swap: SwapStore,
    spaces: Mutex<BTreeMap<SpaceId, Weak<AddressSpace>>>,
    next_id: AtomicUsize,
    stats: StatCounters,
}

impl VirtualMemory {
    pub fn new(config: VmConfig, swap_device: Arc<Block>) -> Arc<Self> {
        log::info!(
            "Virtual memory: {} user frames, swap on \"{}\"",
            config.user_frames,
            swap_device.get_name()
        );
        Arc::new(Self {
            config,
            frames: FrameTable::new(config.user_frames, config.eviction),
            swap: SwapStore::new(swap_device),
            spaces: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(1),
            stats: StatCounters::default(),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapStore {
        &self.swap
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            faults: self.stats.faults.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            swap_outs: self.stats.swap_outs.load(Ordering::Relaxed),
            swap_ins: self.stats.swap_ins.load(Ordering::Relaxed),
            discards: self.stats.discards.load(Ordering::Relaxed),
        }
    }

    /// Creates an empty address space backed by a fresh [`PageManager`].
    pub fn page_table_create(self: &Arc<Self>) -> Arc<AddressSpace> {
        self.page_table_create_with(Box::new(PageManager::new()))
    }

    /// Creates an empty address space on top of `directory`.
    pub fn page_table_create_with(
        self: &Arc<Self>,
        directory: Box<dyn PageDirectory>,
    ) -> Arc<AddressSpace> {
        let id = SpaceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let space = Arc::new(AddressSpace::new(id, self.clone(), directory));
        self.spaces.lock().insert(id, Arc::downgrade(&space));
        log::debug!("Created {}", id);
        space
    }

    /// Releases every frame and swap slot of `space`.
    pub fn page_table_destroy(&self, space: &AddressSpace) {
        space.destroy();
    }

    /// Number of registered address spaces.
    pub fn live_spaces(&self) -> usize {
        self.spaces.lock().len()
    }

    fn lookup(&self, id: SpaceId) -> Option<Arc<AddressSpace>> {
        let weak = self.spaces.lock().get(&id).cloned();
        weak.and_then(|weak| weak.upgrade())
    }

    pub(crate) fn unregister(&self, id: SpaceId) {
        self.spaces.lock().remove(&id);
    }

    pub(crate) fn record_fault(&self) {
        bump(&self.stats.faults);
    }

    pub(crate) fn record_swap_in(&self) {
        bump(&self.stats.swap_ins);
    }
}

impl FrameOwners for VirtualMemory {
    fn is_accessed(&self, owner: SpaceId, page: VirtPage) -> bool {
        self.lookup(owner)
            .is_some_and(|space| space.is_accessed(page))
    }

    fn clear_accessed(&self, owner: SpaceId, page: VirtPage) {
        if let Some(space) = self.lookup(owner) {
            space.clear_accessed(page);
        }
    }

    fn evict(
        &self,
        owner: SpaceId,
        page: VirtPage,
        frame: FrameNumber,
        memory: &PhysicalMemory,
    ) -> Result<(), VmError> {
        let eviction = match self.lookup(owner) {
            Some(space) => space.evict_page(page, frame, memory, &self.swap)?,
            None => {
                log::debug!("Reclaiming frame {} of dead {}", frame, owner);
                Eviction::Discarded
            }
        };
        bump(&self.stats.evictions);
        match eviction {
            Eviction::Discarded => bump(&self.stats.discards),
            Eviction::SwappedOut(_) => bump(&self.stats.swap_outs),
        }
        Ok(())
    }
}

impl fmt::Debug for VirtualMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualMemory")
            .field("config", &self.config)
            .field("frames_in_use", &self.frames.frames_in_use())
            .field("swap", &self.swap)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
