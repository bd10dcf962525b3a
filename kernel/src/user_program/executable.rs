use alloc::vec::Vec;

/// An executable image that pages can be loaded from.
pub trait Executable: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at byte `offset`, returning the
    /// number of bytes actually read. Reads past the end come up short.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Length of the image in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An executable held in kernel memory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryFile(Vec<u8>);

impl MemoryFile {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for MemoryFile {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Executable for MemoryFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let Some(src) = usize::try_from(offset)
            .ok()
            .and_then(|offset| self.0.get(offset..))
        else {
            return 0;
        };
        let count = buf.len().min(src.len());
        buf[..count].copy_from_slice(&src[..count]);
        count
    }

    fn len(&self) -> u64 {
        self.0.len() as u64
    }
}
