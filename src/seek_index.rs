//! In-memory index of the native timestamps of every decoded unit of a track.
//!
//! A seek index is built in one forward pass over a stream: timestamps are appended in decode
//! order to a chain of fixed-size chunks, so that no up-front size estimate is needed. Once the
//! pass is complete the index is finalized, which flattens the chunks into a single sorted table
//! that can be binary searched.
//!
//! The index is used to correct seek targets for containers whose demuxer does not reliably
//! land at or before the requested timestamp: looking up the greatest indexed timestamp not
//! after the target yields a position that is known to be decodable.
//!
//! # Example
//!
//! ```
//! use avsession::seek_index::{SeekIndex, SeekIndexError};
//!
//! let mut index = SeekIndex::build();
//! for ts in (0..1000).step_by(10) {
//!     index.add(ts)?;
//! }
//! index.finalize();
//!
//! assert_eq!(index.find(995), Ok(990));
//! assert_eq!(index.find(-1), Err(SeekIndexError::BelowRange));
//! # Ok::<(), SeekIndexError>(())
//! ```

use crate::common::assert_error_traits;

/// Number of timestamps held by a single chunk while building.
pub const CHUNK_CAPACITY: usize = 100;

/// Errors reported by [`SeekIndex`] operations.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum SeekIndexError {
    /// A lookup was attempted while the index is still being built.
    #[error("seek index is not finalized")]
    NotFinalized,
    /// The index is finalized but holds no timestamps.
    #[error("seek index is empty")]
    Empty,
    /// The looked up timestamp is smaller than the first indexed timestamp.
    #[error("timestamp is below the first indexed timestamp")]
    BelowRange,
    /// A timestamp was added after the index was finalized.
    #[error("seek index is finalized and cannot be extended")]
    AlreadyFinalized,
}
assert_error_traits!(SeekIndexError);

#[derive(Debug, Clone)]
enum Phase {
    Building { chunks: Vec<Vec<i64>> },
    Finalized { index: Box<[i64]> },
}

/// Timestamp index of a single track.
#[derive(Debug, Clone)]
pub struct SeekIndex {
    phase: Phase,
}

impl Default for SeekIndex {
    fn default() -> Self {
        Self::build()
    }
}

impl SeekIndex {
    /// Creates an empty index in build mode.
    pub fn build() -> Self {
        SeekIndex {
            phase: Phase::Building {
                chunks: vec![Vec::with_capacity(CHUNK_CAPACITY)],
            },
        }
    }

    /// Appends a timestamp.
    ///
    /// Timestamps must be added in non-decreasing order for lookups to be correct. This is not
    /// checked; decode order of a single track naturally satisfies it.
    pub fn add(&mut self, timestamp: i64) -> Result<(), SeekIndexError> {
        let Phase::Building { chunks } = &mut self.phase else {
            return Err(SeekIndexError::AlreadyFinalized);
        };

        let needs_chunk = chunks
            .last()
            .is_none_or(|chunk| chunk.len() == CHUNK_CAPACITY);
        if needs_chunk {
            chunks.push(Vec::with_capacity(CHUNK_CAPACITY));
        }
        if let Some(chunk) = chunks.last_mut() {
            chunk.push(timestamp);
        }
        Ok(())
    }

    /// Converts the chunk chain into one contiguous table. Finalizing twice is a no-op.
    pub fn finalize(&mut self) {
        let Phase::Building { chunks } = &mut self.phase else {
            return;
        };

        let total = chunks.iter().map(Vec::len).sum();
        let mut index = Vec::with_capacity(total);
        for chunk in chunks.iter() {
            index.extend_from_slice(chunk);
        }
        self.phase = Phase::Finalized {
            index: index.into_boxed_slice(),
        };
    }

    #[inline]
    pub fn is_finalized(&self) -> bool {
        matches!(self.phase, Phase::Finalized { .. })
    }

    /// Number of timestamps in the index, in either phase.
    pub fn len(&self) -> usize {
        match &self.phase {
            Phase::Building { chunks } => chunks.iter().map(Vec::len).sum(),
            Phase::Finalized { index } => index.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of chunks currently linked while building, `0` once finalized.
    pub fn chunk_count(&self) -> usize {
        match &self.phase {
            Phase::Building { chunks } => chunks.len(),
            Phase::Finalized { .. } => 0,
        }
    }

    /// The finalized table, or `None` while building.
    pub fn entries(&self) -> Option<&[i64]> {
        match &self.phase {
            Phase::Building { .. } => None,
            Phase::Finalized { index } => Some(index),
        }
    }

    /// Returns the greatest indexed timestamp that is not after `timestamp`.
    pub fn find(&self, timestamp: i64) -> Result<i64, SeekIndexError> {
        let index = self.entries().ok_or(SeekIndexError::NotFinalized)?;
        if index.is_empty() {
            return Err(SeekIndexError::Empty);
        }

        let mut left = 0;
        let mut right = index.len() - 1;

        if timestamp < index[left] {
            return Err(SeekIndexError::BelowRange);
        }

        loop {
            let mid = left + (right - left) / 2;

            if left == right {
                return Ok(index[mid]);
            } else if right - left == 1 {
                // Two candidates left, the midpoint would always pick the left one.
                if timestamp >= index[right] {
                    left = right;
                } else {
                    right = left;
                }
            } else if timestamp < index[mid] {
                right = mid;
            } else {
                left = mid;
            }
        }
    }
}
