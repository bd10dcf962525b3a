//! The kernel-wide virtual memory instance.

use crate::block::{BlockManager, BlockType};
use crate::mem::{VirtualMemory, VmConfig};
use alloc::{boxed::Box, sync::Arc};
use once_cell::race::OnceBox;

pub struct SystemState {
    pub block_manager: BlockManager,
    pub virtual_memory: Arc<VirtualMemory>,
}

static SYSTEM: OnceBox<SystemState> = OnceBox::new();

/// Brings up virtual memory on the first swap device in `block_manager`.
///
/// # Panics
///
/// If no swap device was registered or the system is already initialized.
pub fn init_system(block_manager: BlockManager, config: VmConfig) -> &'static SystemState {
    let swap = block_manager
        .by_type(BlockType::Swap)
        .expect("No swap device registered.");
    let state = SystemState {
        virtual_memory: VirtualMemory::new(config, swap),
        block_manager,
    };
    if SYSTEM.set(Box::new(state)).is_err() {
        panic!("System already initialized.");
    }
    unwrap_system()
}

pub fn try_system() -> Option<&'static SystemState> {
    SYSTEM.get()
}

pub fn unwrap_system() -> &'static SystemState {
    SYSTEM.get().expect("System not initialized.")
}

pub fn virtual_memory() -> &'static Arc<VirtualMemory> {
    &unwrap_system().virtual_memory
}
