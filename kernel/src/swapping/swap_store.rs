// Sector numbers are u32 and slot indices usize; a swap partition never gets
// anywhere near 2^32 sectors.
#![allow(clippy::cast_possible_truncation)]

use crate::block::{Block, BlockError, BlockSector, BLOCK_SECTOR_SIZE};
use crate::sync::Mutex;
use alloc::sync::Arc;
use core::{fmt, ops::Range};
use kidneyos_shared::bitmap::Bitmap;
use kidneyos_shared::mem::{PAGE_FRAME_SIZE, SECTORS_PER_PAGE};

/// A page-sized region of the swap partition.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(self) -> usize {
        self.0
    }

    /// Device sectors holding this slot.
    fn sectors(self) -> Range<BlockSector> {
        let first = (self.0 * SECTORS_PER_PAGE) as BlockSector;
        first..first + SECTORS_PER_PAGE as BlockSector
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

/// Hands out page-sized slots on a swap partition.
///
/// The bitmap lock is only held while bits are tested or flipped. Device I/O
/// happens outside it, the block driver serialises its own accesses.
pub struct SwapStore {
    device: Arc<Block>,
    slots: Mutex<Bitmap>,
}

impl SwapStore {
    pub fn new(device: Arc<Block>) -> Self {
        let capacity = device.get_size() as usize / SECTORS_PER_PAGE;
        log::debug!(
            "Swap on \"{}\": {} sectors, {} page slots",
            device.get_name(),
            device.get_size(),
            capacity
        );
        Self {
            device,
            slots: Mutex::new(Bitmap::new(capacity)),
        }
    }

    pub fn device(&self) -> &Arc<Block> {
        &self.device
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.slots.lock().count_set()
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        let slots = self.slots.lock();
        slot.0 < slots.len() && slots.test(slot.0)
    }

    /// Reserves the lowest free slot.
    ///
    /// Running out of swap is unrecoverable: this panics when every slot is
    /// taken.
    pub fn allocate_slot(&self) -> SwapSlot {
        let index = self.slots.lock().scan_and_set();
        match index {
            Some(index) => SwapSlot(index),
            None => {
                log::error!(
                    "Swap partition \"{}\" is full ({} slots)",
                    self.device.get_name(),
                    self.capacity()
                );
                panic!("Out of swap space");
            }
        }
    }

    /// Releases `slot` without reading it.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        assert!(slots.test(slot.0), "freeing unallocated {slot:?}");
        slots.set(slot.0, false);
    }

    /// Writes one page to `slot`, which must be allocated.
    pub fn write_out(&self, slot: SwapSlot, page: &[u8]) -> Result<(), BlockError> {
        assert_eq!(page.len(), PAGE_FRAME_SIZE);
        assert!(self.is_allocated(slot), "writing unallocated {slot:?}");

        page.chunks_exact(BLOCK_SECTOR_SIZE)
            .zip(slot.sectors())
            .try_for_each(|(buf, sector)| self.device.write(sector, buf))
    }

    /// Reads one page from `slot` into `dest` and frees the slot. The slot is
    /// freed even if the read fails.
    pub fn read_in(&self, slot: SwapSlot, dest: &mut [u8]) -> Result<(), BlockError> {
        assert_eq!(dest.len(), PAGE_FRAME_SIZE);

        let result = dest
            .chunks_exact_mut(BLOCK_SECTOR_SIZE)
            .zip(slot.sectors())
            .try_for_each(|(buf, sector)| self.device.read(sector, buf));
        self.free_slot(slot);

        log::trace!("Swapped in {:?}", slot);
        result
    }

    /// Allocates a slot and writes `page` to it. If the write fails the slot
    /// is released again.
    pub fn swap_out(&self, page: &[u8]) -> Result<SwapSlot, BlockError> {
        let slot = self.allocate_slot();
        if let Err(err) = self.write_out(slot, page) {
            log::warn!("Swap out to {:?} failed: {}", slot, err);
            self.free_slot(slot);
            return Err(err);
        }
        log::trace!("Swapped out to {:?}", slot);
        Ok(slot)
    }
}

impl fmt::Debug for SwapStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapStore")
            .field("device", &self.device.get_name())
            .field("slots", &*self.slots.lock())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::block::{BlockOp, BlockType};
    use crate::drivers::RamDisk;
    use alloc::{boxed::Box, vec, vec::Vec};
    use core::sync::atomic::{AtomicBool, Ordering};

    /// A RAM disk whose reads and writes can be made to fail.
    pub(crate) struct FlakyDisk {
        disk: RamDisk,
        pub fail_reads: AtomicBool,
        pub fail_writes: AtomicBool,
    }

    impl FlakyDisk {
        pub fn new(sectors: usize) -> Self {
            Self {
                disk: RamDisk::new(sectors),
                fail_reads: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
            }
        }
    }

    impl BlockOp for FlakyDisk {
        fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(BlockError::ReadError);
            }
            self.disk.read(sector, buf)
        }

        fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(BlockError::WriteError);
            }
            self.disk.write(sector, buf)
        }
    }

    pub(crate) fn ram_swap(slots: usize) -> Arc<Block> {
        let sectors = slots * SECTORS_PER_PAGE;
        Arc::new(Block::new(
            "swap",
            BlockType::Swap,
            sectors as BlockSector,
            Box::new(RamDisk::new(sectors)),
        ))
    }

    pub(crate) fn flaky_swap(slots: usize) -> (Arc<Block>, Arc<FlakyDisk>) {
        let sectors = slots * SECTORS_PER_PAGE;
        let disk = Arc::new(FlakyDisk::new(sectors));
        let block = Arc::new(Block::new(
            "flaky",
            BlockType::Swap,
            sectors as BlockSector,
            Box::new(disk.clone()),
        ));
        (block, disk)
    }

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; PAGE_FRAME_SIZE]
    }

    #[test]
    fn capacity_follows_device_size() {
        let swap = SwapStore::new(ram_swap(3));
        assert_eq!(swap.capacity(), 3);
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn swap_out_then_read_in() {
        let swap = SwapStore::new(ram_swap(4));
        let mut page = page_of(0);
        page.iter_mut().enumerate().for_each(|(i, b)| *b = (i % 251) as u8);

        let slot = swap.swap_out(&page).unwrap();
        assert!(swap.is_allocated(slot));
        assert_eq!(swap.device().write_count(), SECTORS_PER_PAGE as u32);

        let mut back = page_of(0xFF);
        swap.read_in(slot, &mut back).unwrap();
        assert_eq!(back, page);
        assert!(!swap.is_allocated(slot));
        assert_eq!(swap.slots_in_use(), 0);
    }

    #[test]
    fn lowest_free_slot_first() {
        let swap = SwapStore::new(ram_swap(4));
        let a = swap.allocate_slot();
        let b = swap.allocate_slot();
        let c = swap.allocate_slot();
        assert_eq!((a.index(), b.index(), c.index()), (0, 1, 2));

        swap.free_slot(b);
        assert_eq!(swap.allocate_slot(), b);
        assert_eq!(swap.allocate_slot().index(), 3);
    }

    #[test]
    fn slots_do_not_overlap_on_disk() {
        let swap = SwapStore::new(ram_swap(2));
        let first = swap.swap_out(&page_of(1)).unwrap();
        let second = swap.swap_out(&page_of(2)).unwrap();

        let mut buf = page_of(0);
        swap.read_in(first, &mut buf).unwrap();
        assert_eq!(buf, page_of(1));
        swap.read_in(second, &mut buf).unwrap();
        assert_eq!(buf, page_of(2));
    }

    #[test]
    #[should_panic(expected = "Out of swap space")]
    fn exhaustion_panics() {
        let swap = SwapStore::new(ram_swap(1));
        swap.allocate_slot();
        swap.allocate_slot();
    }

    #[test]
    #[should_panic(expected = "freeing unallocated")]
    fn double_free_panics() {
        let swap = SwapStore::new(ram_swap(1));
        let slot = swap.allocate_slot();
        swap.free_slot(slot);
        swap.free_slot(slot);
    }

    #[test]
    fn failed_write_releases_slot() {
        let (block, disk) = flaky_swap(2);
        let swap = SwapStore::new(block);
        disk.fail_writes.store(true, Ordering::SeqCst);

        assert_eq!(swap.swap_out(&page_of(3)), Err(BlockError::WriteError));
        assert_eq!(swap.slots_in_use(), 0);

        disk.fail_writes.store(false, Ordering::SeqCst);
        assert_eq!(swap.swap_out(&page_of(3)).unwrap().index(), 0);
    }

    #[test]
    fn failed_read_still_frees_slot() {
        let (block, disk) = flaky_swap(2);
        let swap = SwapStore::new(block);
        let slot = swap.swap_out(&page_of(4)).unwrap();

        disk.fail_reads.store(true, Ordering::SeqCst);
        let mut buf = page_of(0);
        assert_eq!(swap.read_in(slot, &mut buf), Err(BlockError::ReadError));
        assert!(!swap.is_allocated(slot));
    }
}
