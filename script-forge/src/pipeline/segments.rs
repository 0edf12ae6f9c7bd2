//! Fixed-size grouping of records.

use serde::{Deserialize, Serialize};

/// A contiguous run of records processed together by a downstream step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment<T> {
    /// Zero-based segment index.
    pub index: usize,
    /// Index of the first record in the source list.
    pub start: usize,
    pub records: Vec<T>,
}

impl<T> Segment<T> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Source indices covered by this segment.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.records.len()
    }
}

/// Split `records` into segments of `size`; the last one may be shorter.
///
/// A size of zero is treated as one.
pub fn segment<T: Clone>(records: &[T], size: usize) -> Vec<Segment<T>> {
    let size = size.max(1);
    records
        .chunks(size)
        .enumerate()
        .map(|(index, chunk)| Segment {
            index,
            start: index * size,
            records: chunk.to_vec(),
        })
        .collect()
}
