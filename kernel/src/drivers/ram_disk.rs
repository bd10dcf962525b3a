use crate::block::block_core::{BlockOp, BlockSector, BLOCK_SECTOR_SIZE};
use crate::block::block_error::BlockError;
use crate::sync::Mutex;
use alloc::{vec, vec::Vec};

/// A block device driver backed by memory. Sectors start zeroed.
pub struct RamDisk {
    sectors: Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![0; sectors * BLOCK_SECTOR_SIZE]),
        }
    }

    fn range(sector: BlockSector, len: usize) -> Option<core::ops::Range<usize>> {
        let start = sector as usize * BLOCK_SECTOR_SIZE;
        (len == BLOCK_SECTOR_SIZE).then_some(start..start + BLOCK_SECTOR_SIZE)
    }
}

impl BlockOp for RamDisk {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let range = Self::range(sector, buf.len()).ok_or(BlockError::BufferInvalid)?;
        let disk = self.sectors.lock();
        let src = disk.get(range).ok_or(BlockError::ReadError)?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let range = Self::range(sector, buf.len()).ok_or(BlockError::BufferInvalid)?;
        let mut disk = self.sectors.lock();
        let dst = disk.get_mut(range).ok_or(BlockError::WriteError)?;
        dst.copy_from_slice(buf);
        Ok(())
    }
}
