//! Victim selection for the frame table.

use crate::mem::frame_table::{FrameOwners, FrameSlot};
use alloc::boxed::Box;

/// Picks the frame to evict when every frame is allocated.
pub trait PageReplacementPolicy: Send {
    /// Returns the index of an unpinned slot in `core_map`, or `None` if all
    /// of them are pinned. Called with the frame table locked.
    fn select_victim(&mut self, core_map: &[FrameSlot], owners: &dyn FrameOwners)
        -> Option<usize>;
}

/// Which policy the frame table runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Clock: recently accessed frames get another trip around.
    #[default]
    SecondChance,
    /// Next unpinned frame after the last victim.
    RoundRobin,
}

impl EvictionPolicy {
    pub fn build(self) -> Box<dyn PageReplacementPolicy> {
        match self {
            EvictionPolicy::SecondChance => Box::<SecondChance>::default(),
            EvictionPolicy::RoundRobin => Box::<RoundRobin>::default(),
        }
    }
}

#[derive(Default)]
pub struct SecondChance {
    /// The clock hand, one past the last victim.
    hand: usize,
}

#[derive(Default)]
pub struct RoundRobin {
    hand: usize,
}

/// Slot indices in clock order starting at `hand`.
fn clock_order(hand: usize, len: usize) -> impl Iterator<Item = usize> {
    (0..len).map(move |step| (hand + step) % len)
}

impl PageReplacementPolicy for SecondChance {
    fn select_victim(
        &mut self,
        core_map: &[FrameSlot],
        owners: &dyn FrameOwners,
    ) -> Option<usize> {
        if core_map.is_empty() {
            return None;
        }

        // First pass: recently used frames lose their accessed bit and are
        // passed over.
        let victim = clock_order(self.hand, core_map.len())
            .find(|&i| {
                let slot = &core_map[i];
                if slot.is_pinned() {
                    return false;
                }
                match slot.mapping() {
                    Some((owner, page)) if owners.is_accessed(owner, page) => {
                        owners.clear_accessed(owner, page);
                        false
                    }
                    _ => true,
                }
            })
            // Second pass: everyone has had their chance.
            .or_else(|| {
                clock_order(self.hand, core_map.len()).find(|&i| !core_map[i].is_pinned())
            })?;

        self.hand = (victim + 1) % core_map.len();
        Some(victim)
    }
}

impl PageReplacementPolicy for RoundRobin {
    fn select_victim(
        &mut self,
        core_map: &[FrameSlot],
        _owners: &dyn FrameOwners,
    ) -> Option<usize> {
        if core_map.is_empty() {
            return None;
        }

        let victim =
            clock_order(self.hand, core_map.len()).find(|&i| !core_map[i].is_pinned())?;
        self.hand = (victim + 1) % core_map.len();
        Some(victim)
    }
}
