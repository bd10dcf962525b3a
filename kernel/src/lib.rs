#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for KidneyOS user processes.
//!
//! Every process owns an [`AddressSpace`](mem::AddressSpace) whose pages are
//! described lazily and only brought into one of a fixed pool of physical
//! frames when a page fault asks for them. When the pool runs dry a victim
//! frame is chosen by the configured [replacement
//! policy](swapping::page_replacement), its contents are written to the swap
//! partition if they cannot be re-created, and the frame is handed over.
//!
//! The trap handler talks to this crate through
//! [`handle_page_fault`](interrupts::page_fault::handle_page_fault).

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod interrupts;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod sync;
pub mod system;
pub mod user_program;
