/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Tracking which byte ranges of which source files produced an output.
//!
//! Ranges within one file never overlap; adjacent ranges coalesce on
//! insertion and on merge, so the representation stays canonical and
//! merging is associative and commutative.

use anyhow::{ensure, Result};
use std::collections::BTreeMap;

/// A sorted set of disjoint, half-open byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffsetRanges {
    /// `(start, end)` pairs, sorted, disjoint, non-adjacent.
    ranges: Vec<(u64, u64)>,
}

impl OffsetRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.len()
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    /// Appends a range at or after the current end; an abutting range
    /// extends the last one instead of starting a new one.
    pub fn add(&mut self, start: u64, end: u64) {
        assert!(start < end, "empty or inverted range [{}, {})", start, end);
        if let Some((_, last_end)) = self.ranges.last_mut() {
            assert!(
                *last_end <= start,
                "end of last range ({}) should not be after the range [{}, {}) being inserted",
                last_end,
                start,
                end
            );
            if *last_end == start {
                *last_end = end;
                return;
            }
        }
        self.ranges.push((start, end));
    }

    /// Merges another range set into this one, coalescing adjacency.
    pub fn merge(&mut self, other: &OffsetRanges) {
        let mut merged = OffsetRanges::new();
        let mut ours = self.ranges.iter().peekable();
        let mut theirs = other.ranges.iter().peekable();

        loop {
            let take_ours = match (ours.peek(), theirs.peek()) {
                (Some(&&(our_start, our_end)), Some(&&(their_start, their_end))) => {
                    assert!(
                        our_end <= their_start || their_end <= our_start,
                        "ranges for a given file must never overlap"
                    );
                    our_start < their_start
                }
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let &(start, end) = if take_ours {
                ours.next().unwrap()
            } else {
                theirs.next().unwrap()
            };
            merged.add(start, end);
        }

        *self = merged;
    }

    /// Serializes as a big-endian `u64` count followed by the range
    /// endpoints.
    pub fn marshal(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + self.ranges.len() * 16);
        bytes.extend_from_slice(&(self.ranges.len() as u64).to_be_bytes());
        for &(start, end) in &self.ranges {
            bytes.extend_from_slice(&start.to_be_bytes());
            bytes.extend_from_slice(&end.to_be_bytes());
        }
        bytes
    }

    pub fn demarshal(bytes: &[u8]) -> Result<Self> {
        ensure!(bytes.len() >= 8, "marshalled ranges are truncated");
        let count = u64::from_be_bytes(bytes[0..8].try_into().unwrap()) as usize;
        ensure!(
            bytes.len() == 8 + count * 16,
            "marshalled ranges have the wrong length"
        );
        let mut ranges = OffsetRanges::new();
        for i in 0..count {
            let base = 8 + i * 16;
            let start = u64::from_be_bytes(bytes[base..base + 8].try_into().unwrap());
            let end = u64::from_be_bytes(bytes[base + 8..base + 16].try_into().unwrap());
            ranges.add(start, end);
        }
        Ok(ranges)
    }
}

/// Offset ranges per source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFileRanges {
    files: BTreeMap<String, OffsetRanges>,
}

impl SourceFileRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filename: &str, start: u64, end: u64) {
        self.files
            .entry(filename.to_string())
            .or_default()
            .add(start, end);
    }

    pub fn merge(&mut self, other: &SourceFileRanges) {
        for (filename, ranges) in &other.files {
            self.files
                .entry(filename.clone())
                .or_default()
                .merge(ranges);
        }
    }

    pub fn ranges_for(&self, filename: &str) -> Option<&OffsetRanges> {
        self.files.get(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges_of(pairs: &[(u64, u64)]) -> OffsetRanges {
        let mut ranges = OffsetRanges::new();
        for &(start, end) in pairs {
            ranges.add(start, end);
        }
        ranges
    }

    #[test]
    fn test_adjacent_ranges_coalesce() {
        let mut ranges = OffsetRanges::new();
        ranges.add(0, 100);
        ranges.add(100, 250);
        ranges.add(300, 400);
        assert_eq!(ranges.ranges(), &[(0, 250), (300, 400)]);
    }

    #[test]
    fn test_merge_is_commutative_and_associative() {
        let a = ranges_of(&[(0, 10), (50, 60)]);
        let b = ranges_of(&[(10, 20), (80, 90)]);
        let c = ranges_of(&[(30, 40)]);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        assert_eq!(ab, ba);
        // Adjacency across sets coalesces too.
        assert_eq!(ab.ranges()[0], (0, 20));

        let mut ab_c = ab.clone();
        ab_c.merge(&c);
        let mut bc = b.clone();
        bc.merge(&c);
        let mut a_bc = a.clone();
        a_bc.merge(&bc);
        assert_eq!(ab_c, a_bc);
    }

    #[test]
    fn test_marshal_round_trip() -> Result<()> {
        let ranges = ranges_of(&[(0, 10), (20, 30), (100, 1000)]);
        let marshalled = ranges.marshal();
        assert_eq!(OffsetRanges::demarshal(&marshalled)?, ranges);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "never overlap")]
    fn test_overlap_is_rejected() {
        let mut a = ranges_of(&[(0, 15)]);
        let b = ranges_of(&[(10, 20)]);
        a.merge(&b);
    }
}
