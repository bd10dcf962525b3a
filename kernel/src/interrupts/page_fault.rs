//! What the page fault handler does once it has the faulting address.
//!
//! The trap stub reads `cr2` and the saved user `esp`, decodes the error code
//! into a [`PageFault`] and calls [`handle_page_fault`]. Anything that cannot
//! be resolved kills the faulting process; nothing here brings the kernel
//! down.

use crate::mem::{AddressSpace, VmConfig, VmError};
use crate::paging::{AccessKind, VirtPage};
use bitbybit::bitfield;
use kidneyos_shared::mem::{is_kernel_vaddr, PHYS_BASE};

/// Exit status of a process killed by a bad memory access.
pub const EXIT_FATAL_ACCESS: i32 = -1;

/// The error code pushed by the CPU on a page fault.
#[bitfield(u32, default = 0)]
pub struct PageFaultErrorCode {
    /// The page was present, so this is a protection violation.
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    write: bool,
    /// The access came from ring 3.
    #[bit(2, rw)]
    user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    pub addr: usize,
    pub access: AccessKind,
    pub user: bool,
    /// The user stack pointer at the time of the fault.
    pub esp: usize,
}

impl PageFault {
    pub fn new(addr: usize, error_code: PageFaultErrorCode, esp: usize) -> Self {
        Self {
            addr,
            access: if error_code.write() {
                AccessKind::Write
            } else {
                AccessKind::Read
            },
            user: error_code.user(),
            esp,
        }
    }

    /// A user-mode load from `addr`.
    pub fn read(addr: usize, esp: usize) -> Self {
        Self::new(addr, PageFaultErrorCode::DEFAULT.with_user(true), esp)
    }

    /// A user-mode store to `addr`.
    pub fn write(addr: usize, esp: usize) -> Self {
        Self::new(
            addr,
            PageFaultErrorCode::DEFAULT.with_user(true).with_write(true),
            esp,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// Retry the faulting instruction.
    Resolved,
    /// Terminate the process with `status`.
    Kill { status: i32 },
}

/// Resolves `fault` in `space` or decides that the process has to die.
pub fn handle_page_fault(space: &AddressSpace, fault: &PageFault) -> FaultResolution {
    match resolve(space, fault) {
        Ok(()) => FaultResolution::Resolved,
        Err(err) => {
            log::info!(
                "Killing {}: {:?} at {:#X} (esp {:#X}): {}",
                space.id(),
                fault.access,
                fault.addr,
                fault.esp,
                err
            );
            FaultResolution::Kill {
                status: EXIT_FATAL_ACCESS,
            }
        }
    }
}

fn resolve(space: &AddressSpace, fault: &PageFault) -> Result<(), VmError> {
    if is_kernel_vaddr(fault.addr) {
        return Err(VmError::NotUserAddress);
    }
    let page = VirtPage::containing(fault.addr);
    if page.addr() == 0 {
        return Err(VmError::InvalidAccess);
    }

    if space.find(page).is_none() {
        if !is_stack_access(space.vm().config(), fault) {
            return Err(VmError::InvalidAccess);
        }
        match space.grow_stack(page) {
            // Another thread of the process got there first.
            Ok(()) | Err(VmError::PageAlreadyPresent) => {}
            Err(err) => return Err(err),
        }
    }

    space.resolve_fault(page, fault.access)
}

/// Whether `fault` hits the stack region close enough to `esp` to count as
/// the stack growing.
fn is_stack_access(config: &VmConfig, fault: &PageFault) -> bool {
    let stack_limit = PHYS_BASE.saturating_sub(config.max_stack_size);
    fault.addr >= stack_limit && fault.addr.saturating_add(config.stack_slack) >= fault.esp
}
