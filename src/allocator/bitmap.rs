//! Fixed-domain bit vector backing every block and subnet allocator.
//!
//! Positions are dense in `[0, size)`. The scan order of [`Bitmap::first_zero`]
//! is part of the replicated-state contract: word order ascending, lowest bit
//! first within a word, so every replica picks the same position.

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{
    BitAlreadyClearSnafu, BitAlreadySetSnafu, IpamError, PositionOutOfRangeSnafu,
};

const WORD_BITS: usize = 64;

/// Dense bitmap over a fixed domain of `size` positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Bitmap {
    words: Vec<u64>,
    size: usize,
    allocated: usize,
}

impl Bitmap {
    /// Create an empty bitmap with `size` positions.
    pub fn new(size: usize) -> Self {
        let words = vec![0u64; size.div_ceil(WORD_BITS)];
        Self {
            words,
            size,
            allocated: 0,
        }
    }

    /// Mark a position as allocated.
    ///
    /// Fails on out-of-range positions and on double-set.
    pub fn set(&mut self, pos: usize) -> Result<(), IpamError> {
        ensure!(
            pos < self.size,
            PositionOutOfRangeSnafu {
                position: pos,
                size: self.size
            }
        );

        let idx = pos / WORD_BITS;
        let bit = 1u64 << (pos % WORD_BITS);
        ensure!(self.words[idx] & bit == 0, BitAlreadySetSnafu { position: pos });

        self.words[idx] |= bit;
        self.allocated += 1;
        Ok(())
    }

    /// Mark a position as free.
    ///
    /// Fails on out-of-range positions and on double-clear.
    pub fn clear(&mut self, pos: usize) -> Result<(), IpamError> {
        ensure!(
            pos < self.size,
            PositionOutOfRangeSnafu {
                position: pos,
                size: self.size
            }
        );

        let idx = pos / WORD_BITS;
        let bit = 1u64 << (pos % WORD_BITS);
        ensure!(
            self.words[idx] & bit != 0,
            BitAlreadyClearSnafu { position: pos }
        );

        self.words[idx] &= !bit;
        self.allocated -= 1;
        Ok(())
    }

    /// Whether a position is allocated. Out-of-range queries return `false`.
    pub fn is_set(&self, pos: usize) -> bool {
        if pos >= self.size {
            return false;
        }
        self.words[pos / WORD_BITS] & (1u64 << (pos % WORD_BITS)) != 0
    }

    /// Lowest unallocated position, or `None` when the domain is full.
    pub fn first_zero(&self) -> Option<usize> {
        for (idx, word) in self.words.iter().enumerate() {
            if *word != u64::MAX {
                let pos = idx * WORD_BITS + (!word).trailing_zeros() as usize;
                if pos < self.size {
                    return Some(pos);
                }
                // Zero bit lives in the tail padding beyond `size`.
                return None;
            }
        }
        None
    }

    /// Number of allocated positions.
    pub fn count(&self) -> usize {
        self.allocated
    }

    /// Number of free positions.
    pub fn available(&self) -> usize {
        self.size - self.allocated
    }

    /// Domain size.
    pub fn size(&self) -> usize {
        self.size
    }
}

// Snapshots ship bitmaps verbatim between replicas; reject any encoding
// whose counters disagree with the word content or that sets tail bits.
impl<'de> Deserialize<'de> for Bitmap {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            words: Vec<u64>,
            size: usize,
            allocated: usize,
        }

        let raw = Raw::deserialize(deserializer)?;
        if raw.words.len() != raw.size.div_ceil(WORD_BITS) {
            return Err(serde::de::Error::custom(format!(
                "bitmap has {} words for size {}",
                raw.words.len(),
                raw.size
            )));
        }
        let popcount: usize = raw.words.iter().map(|w| w.count_ones() as usize).sum();
        if popcount != raw.allocated {
            return Err(serde::de::Error::custom(format!(
                "bitmap allocated count {} does not match popcount {}",
                raw.allocated, popcount
            )));
        }
        let tail = raw.size % WORD_BITS;
        if tail != 0 {
            if let Some(last) = raw.words.last() {
                if last & !((1u64 << tail) - 1) != 0 {
                    return Err(serde::de::Error::custom(
                        "bitmap has bits set beyond its size",
                    ));
                }
            }
        }
        Ok(Bitmap {
            words: raw.words,
            size: raw.size,
            allocated: raw.allocated,
        })
    }
}
