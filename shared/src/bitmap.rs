use alloc::{vec, vec::Vec};
use core::fmt;

/// A fixed-length array of bits, one per tracked resource. `true` marks the
/// resource as in use.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits: Vec<u8>,
    len: usize,
}

impl Bitmap {
    /// Creates a bitmap of `len` bits, all clear.
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the value of bit `idx`.
    ///
    /// Panics if `idx` is out of range.
    pub fn test(&self, idx: usize) -> bool {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        self.bits[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Sets bit `idx` to `value`.
    ///
    /// Panics if `idx` is out of range.
    pub fn set(&mut self, idx: usize, value: bool) {
        assert!(idx < self.len, "bit {idx} out of range ({})", self.len);
        if value {
            self.bits[idx / 8] |= 1 << (idx % 8);
        } else {
            self.bits[idx / 8] &= !(1 << (idx % 8));
        }
    }

    /// Finds the lowest clear bit, sets it, and returns its index.
    pub fn scan_and_set(&mut self) -> Option<usize> {
        let idx = self.first_clear()?;
        self.set(idx, true);
        Some(idx)
    }

    /// Returns the lowest clear bit without changing anything.
    fn first_clear(&self) -> Option<usize> {
        self.bits
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != u8::MAX)
            .map(|(i, byte)| i * 8 + byte.trailing_ones() as usize)
            .filter(|idx| *idx < self.len)
    }

    /// Number of set bits.
    pub fn count_set(&self) -> usize {
        self.bits.iter().map(|byte| byte.count_ones() as usize).sum()
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap[{}/{}](", self.count_set(), self.len)?;
        for idx in 0..self.len {
            write!(f, "{}", if self.test(idx) { '1' } else { '0' })?;
        }
        write!(f, ")")
    }
}
