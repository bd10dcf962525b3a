use super::executable::Executable;
use crate::mem::{AddressSpace, Backing, VmError};
use crate::paging::VirtPage;
use alloc::sync::Arc;
use core::fmt;
use kidneyos_shared::mem::{is_user_vaddr, page_offset, page_round_up, PAGE_FRAME_SIZE, PHYS_BASE};

/// A loadable segment of an executable, as described by its program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub file_offset: u64,
    pub vaddr: usize,
    pub file_size: usize,
    pub mem_size: usize,
    pub writable: bool,
}

// Error types that will arise when we try to validate segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    DifferentPageOffset,
    OffsetOutOfRange,
    MemSizeLesserThanFileSize,
    EmptyMemSize,
    VMRegionOutOfRange,
    VMRegionWrapAround,
    PageZeroMapping,
}

impl fmt::Display for SegmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            SegmentError::DifferentPageOffset => "file offset and address differ in page offset",
            SegmentError::OffsetOutOfRange => "file offset past the end of the file",
            SegmentError::MemSizeLesserThanFileSize => "memory size smaller than file size",
            SegmentError::EmptyMemSize => "empty segment",
            SegmentError::VMRegionOutOfRange => "segment outside user space",
            SegmentError::VMRegionWrapAround => "segment wraps around the address space",
            SegmentError::PageZeroMapping => "segment maps page 0",
        };
        f.write_str(reason)
    }
}

impl core::error::Error for SegmentError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    Segment(SegmentError),
    Page(VmError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Segment(err) => write!(f, "invalid segment: {err}"),
            LoadError::Page(err) => write!(f, "cannot map segment: {err}"),
        }
    }
}

impl core::error::Error for LoadError {}

impl From<SegmentError> for LoadError {
    fn from(err: SegmentError) -> Self {
        LoadError::Segment(err)
    }
}

impl From<VmError> for LoadError {
    fn from(err: VmError) -> Self {
        LoadError::Page(err)
    }
}

impl Segment {
    pub fn validate(&self, file_len: u64) -> Result<(), SegmentError> {
        // file_offset and vaddr must have the same page offset.
        if self.file_offset % PAGE_FRAME_SIZE as u64 != page_offset(self.vaddr) as u64 {
            return Err(SegmentError::DifferentPageOffset);
        }

        // file_offset must point within the file.
        if self.file_offset > file_len {
            return Err(SegmentError::OffsetOutOfRange);
        }

        if self.mem_size < self.file_size {
            return Err(SegmentError::MemSizeLesserThanFileSize);
        }

        if self.mem_size == 0 {
            return Err(SegmentError::EmptyMemSize);
        }

        // The region must both start and end within user space.
        if !is_user_vaddr(self.vaddr) {
            return Err(SegmentError::VMRegionOutOfRange);
        }
        let end = self
            .vaddr
            .checked_add(self.mem_size)
            .ok_or(SegmentError::VMRegionWrapAround)?;
        if !is_user_vaddr(end - 1) {
            return Err(SegmentError::VMRegionOutOfRange);
        }

        // Disallow mapping page 0.
        if self.vaddr < PAGE_FRAME_SIZE {
            return Err(SegmentError::PageZeroMapping);
        }

        Ok(())
    }
}

/// Describes every page of `segment` without loading anything. Pages that
/// hold file bytes are loaded from `file` on first access, the rest are
/// zero-filled.
pub fn load_segment(
    space: &AddressSpace,
    file: &Arc<dyn Executable>,
    segment: &Segment,
) -> Result<(), LoadError> {
    segment.validate(file.len())?;

    let lead = page_offset(segment.vaddr);
    let first = VirtPage::containing(segment.vaddr);
    let pages = (page_round_up(segment.vaddr + segment.mem_size) - first.addr()) / PAGE_FRAME_SIZE;
    let mut offset = segment.file_offset - lead as u64;
    let mut file_left = if segment.file_size > 0 {
        lead + segment.file_size
    } else {
        0
    };

    for n in 0..pages {
        let page = first.checked_add(n).ok_or(SegmentError::VMRegionWrapAround)?;
        let read_bytes = file_left.min(PAGE_FRAME_SIZE);
        let backing = if read_bytes > 0 {
            Backing::Executable {
                file: file.clone(),
                offset,
                read_bytes,
            }
        } else {
            Backing::ZeroFill
        };
        space.insert(page, backing, segment.writable)?;

        file_left -= read_bytes;
        offset += PAGE_FRAME_SIZE as u64;
    }

    log::debug!(
        "{}: {} pages at {:#X} ({} from file)",
        space.id(),
        pages,
        segment.vaddr,
        segment.file_size
    );
    Ok(())
}

/// Maps the top stack page and returns the initial stack pointer.
pub fn setup_stack(space: &AddressSpace) -> Result<usize, VmError> {
    space.insert(
        VirtPage::containing(PHYS_BASE - PAGE_FRAME_SIZE),
        Backing::Stack,
        true,
    )?;
    Ok(PHYS_BASE)
}

/// Loads every segment of `file` and sets up the stack, returning the
/// initial stack pointer.
pub fn load_image(
    space: &AddressSpace,
    file: Arc<dyn Executable>,
    segments: &[Segment],
) -> Result<usize, LoadError> {
    for segment in segments {
        load_segment(space, &file, segment)?;
    }
    Ok(setup_stack(space)?)
}
