use crate::block::BlockError;
use crate::paging::VirtPage;
use core::error::Error;
use core::fmt::{Debug, Display, Formatter};

/// Why a virtual memory operation failed.
///
/// None of these are fatal to the kernel. The fault handler turns every one
/// of them into the death of the faulting process.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No page is described at the address
    InvalidAccess,
    /// Write to a page that was created read-only
    WriteToReadOnly,
    /// The page is already described in this address space
    PageAlreadyPresent,
    /// The backing cannot be used to create a page
    InvalidBacking,
    /// The executable ended before the page's bytes could be read
    ShortRead {
        page: VirtPage,
        expected: usize,
        read: usize,
    },
    /// Every frame is pinned
    NoEvictableFrame,
    /// Swap device I/O failed
    SwapIo(BlockError),
    /// The page's only copy was in swap and could not be read back
    PageLost(VirtPage),
    /// The address space was torn down
    AddressSpaceDestroyed,
    /// The address is not in user space
    NotUserAddress,
}

impl Debug for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::InvalidAccess => write!(f, "InvalidAccess"),
            VmError::WriteToReadOnly => write!(f, "WriteToReadOnly"),
            VmError::PageAlreadyPresent => write!(f, "PageAlreadyPresent"),
            VmError::InvalidBacking => write!(f, "InvalidBacking"),
            VmError::ShortRead {
                page,
                expected,
                read,
            } => write!(f, "ShortRead({page}, {read}/{expected})"),
            VmError::NoEvictableFrame => write!(f, "NoEvictableFrame"),
            VmError::SwapIo(err) => write!(f, "SwapIo({err:?})"),
            VmError::PageLost(page) => write!(f, "PageLost({page})"),
            VmError::AddressSpaceDestroyed => write!(f, "AddressSpaceDestroyed"),
            VmError::NotUserAddress => write!(f, "NotUserAddress"),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::InvalidAccess => write!(f, "access to an unmapped page"),
            VmError::WriteToReadOnly => write!(f, "write to a read-only page"),
            VmError::PageAlreadyPresent => write!(f, "page already present"),
            VmError::InvalidBacking => write!(f, "invalid page backing"),
            VmError::ShortRead {
                page,
                expected,
                read,
            } => write!(
                f,
                "short read loading page {page}: expected {expected} bytes, got {read}"
            ),
            VmError::NoEvictableFrame => write!(f, "no frame can be evicted"),
            VmError::SwapIo(err) => write!(f, "swap I/O failed: {err}"),
            VmError::PageLost(page) => write!(f, "contents of page {page} were lost"),
            VmError::AddressSpaceDestroyed => write!(f, "address space destroyed"),
            VmError::NotUserAddress => write!(f, "not a user address"),
        }
    }
}

impl Error for VmError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            VmError::SwapIo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        VmError::SwapIo(err)
    }
}
