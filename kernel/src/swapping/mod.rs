//! Swap partition management and the policies that pick which frame to give
//! up when physical memory runs out.

pub mod page_replacement;
pub mod swap_store;

pub use self::page_replacement::{EvictionPolicy, PageReplacementPolicy, RoundRobin, SecondChance};
pub use self::swap_store::{SwapSlot, SwapStore};
