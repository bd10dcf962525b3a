use super::block_error::BlockError;
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyos_shared::sizes::SECTOR_SIZE;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// Types of blocks
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    /// OS Kernel
    Kernel,
    /// File system
    FileSystem,
    /// Scratch
    Scratch,
    /// Swap
    Swap,
    /// "Raw" device with unidentified contents
    Raw,
    /// Owned by non-KidneyOS operating system
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockType::Kernel => write!(f, "Kernel"),
            BlockType::FileSystem => write!(f, "File System"),
            BlockType::Scratch => write!(f, "Scratch"),
            BlockType::Swap => write!(f, "Swap"),
            BlockType::Raw => write!(f, "Raw"),
            BlockType::Foreign => write!(f, "Foreign"),
        }
    }
}

/// Lower-level interface to block device drivers.
///
/// Both operations transfer exactly one sector. Drivers do their own locking,
/// so a device can be shared between threads behind an `Arc`.
pub trait BlockOp: Send + Sync {
    /// Read a block sector
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    /// Write a block sector
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

impl<T: BlockOp + ?Sized> BlockOp for Arc<T> {
    fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        (**self).read(sector, buf)
    }
    fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        (**self).write(sector, buf)
    }
}

/// A block device
///
/// **Note:** Once blocks are made only their counters change
pub struct Block {
    /// Tha name of the block device
    block_name: String,

    /// The type of block
    block_type: BlockType,
    /// The block driver
    driver: Box<dyn BlockOp>,

    /// The size of the block device in sectors
    block_size: BlockSector,

    /// The read count
    read_count: AtomicU32,
    /// The write count
    write_count: AtomicU32,
}

impl Block {
    pub fn new(
        block_name: &str,
        block_type: BlockType,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> Self {
        Block {
            block_name: String::from(block_name),
            block_type,
            driver,
            block_size,
            read_count: AtomicU32::new(0),
            write_count: AtomicU32::new(0),
        }
    }

    /// Verifies that `buf` is a valid buffer for reading or writing a block sector.
    fn verify_buffer(buf: &[u8]) -> Result<(), BlockError> {
        if buf.len() != BLOCK_SECTOR_SIZE {
            log::warn!("Invalid buffer size {}", buf.len());
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Verifies that `sector` is a valid offset within the block device.
    fn check_sector(&self, sector: BlockSector) -> Result<(), BlockError> {
        if sector >= self.block_size {
            log::warn!(
                "{}: Invalid sector {} (block size: {})",
                self.block_name,
                sector,
                self.block_size
            );
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(())
    }

    /// Reads sector `sector` from the block device into `buf`, which must have room for
    /// `BLOCK_SECTOR_SIZE` bytes.
    pub fn read(&self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        self.driver.read(sector, buf)?;
        self.read_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes sector `sector` from `buf`, which must contain `BLOCK_SECTOR_SIZE` bytes. Returns
    /// after the block device has acknowledged receiving the data.
    pub fn write(&self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check_sector(sector)?;
        Self::verify_buffer(buf)?;

        // Ensure that we are not writing to a foreign block
        if self.block_type == BlockType::Foreign {
            log::warn!("{}: refusing to write to a foreign block", self.block_name);
            return Err(BlockError::WriteError);
        }

        self.driver.write(sector, buf)?;
        self.write_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // Block getters -----------------------------------------------------------

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }
    pub fn get_size(&self) -> BlockSector {
        self.block_size
    }
    pub fn get_name(&self) -> &str {
        &self.block_name
    }
    pub fn read_count(&self) -> u32 {
        self.read_count.load(Ordering::Relaxed)
    }
    pub fn write_count(&self) -> u32 {
        self.write_count.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("name", &self.block_name)
            .field("type", &self.block_type)
            .field("size", &self.block_size)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "\"{}\" ({}): {:04} sectors, {:04} read, {:04} write",
            self.block_name,
            self.block_type,
            self.block_size,
            self.read_count(),
            self.write_count()
        )
    }
}

/// Maintain a list of blocks
#[derive(Default)]
pub struct BlockManager {
    /// All the block devices, indexed by registration order
    all_blocks: Vec<Arc<Block>>,
}

impl BlockManager {
    /// Create a new block manager
    pub fn new() -> Self {
        BlockManager::with_capacity(10)
    }

    /// Create a new block manager with a given capacity
    pub fn with_capacity(cap: usize) -> Self {
        BlockManager {
            all_blocks: Vec::with_capacity(cap),
        }
    }

    /// Register a block device with the given `name`. The block device's `size` in sectors and its
    /// `device_type` must be provided, as well as the `driver` to access the block.
    ///
    /// Returns the index of the block device.
    pub fn register_block(
        &mut self,
        block_type: BlockType,
        block_name: &str,
        block_size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> usize {
        self.all_blocks.push(Arc::new(Block::new(
            block_name, block_type, block_size, driver,
        )));

        log::info!(
            "Registered block device \"{}\" ({} type) with {} sectors",
            block_name,
            block_type,
            block_size,
        );

        self.all_blocks.len() - 1
    }

    /// Get the block device with the given `index`.
    ///
    /// If the index is out of bounds, returns `None`.
    pub fn by_id(&self, idx: usize) -> Option<Arc<Block>> {
        self.all_blocks.get(idx).cloned()
    }

    /// Get the first block device registered with the given role, e.g. the
    /// swap partition.
    pub fn by_type(&self, block_type: BlockType) -> Option<Arc<Block>> {
        self.all_blocks
            .iter()
            .find(|b| b.block_type == block_type)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.all_blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all_blocks.is_empty()
    }
}

impl fmt::Display for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "Block Devices:")?;
        for (index, block) in self.all_blocks.iter().enumerate() {
            writeln!(f, "    {:04} | {}", index, block)?;
        }
        Ok(())
    }
}
