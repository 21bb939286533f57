/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Carry-over alignment for direct-I/O writes.
//!
//! A [`BufferAligner`] lets a stage emit only buffers whose size is a
//! multiple of the alignment multiple. Each slot (typically a logical
//! disk) stores up to `A − 1` bytes carried over from the previous
//! emission. The protocol, per buffer:
//!
//! 1. [`prepare`](BufferAligner::prepare) prepends the carried bytes.
//! 2. The stage appends its own data.
//! 3. [`finish`](BufferAligner::finish) truncates the buffer to the
//!    largest multiple of `A` and stashes the tail in the slot.
//!
//! The very last buffer for a slot uses
//! [`finish_last_buffer`](BufferAligner::finish_last_buffer) instead,
//! which leaves it unaligned and resets the slot. Carry-over bytes are
//! never lost: the concatenation of emitted buffers equals the
//! concatenation of ingested ones.

use crate::buffers::KvPairBuffer;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct Slot {
    carried: Vec<u8>,
}

/// Per-slot carry-over state enforcing aligned emissions.
#[derive(Debug)]
pub struct BufferAligner {
    alignment_multiple: u64,
    slots: HashMap<u64, Slot>,
}

impl BufferAligner {
    /// Creates an aligner for the given alignment multiple (the smallest
    /// size acceptable for direct I/O).
    pub fn new(alignment_multiple: u64) -> Self {
        assert!(alignment_multiple > 0, "alignment multiple must be positive");
        BufferAligner {
            alignment_multiple,
            slots: HashMap::new(),
        }
    }

    /// Copies the slot's carried bytes to the front of `buffer`.
    pub fn prepare(&mut self, buffer: &mut KvPairBuffer, slot: u64) {
        let entry = self.slots.entry(slot).or_default();
        buffer.append(&entry.carried);
        entry.carried.clear();
    }

    /// Truncates `buffer` to its largest aligned size, stashing the tail
    /// in the slot for the next emission.
    pub fn finish(&mut self, buffer: &mut KvPairBuffer, slot: u64) {
        let entry = self
            .slots
            .get_mut(&slot)
            .expect("finish() called for a slot that was never prepared");

        let misaligned = buffer.current_size() % self.alignment_multiple as usize;
        let aligned_offset = buffer.current_size() - misaligned;

        entry.carried.clear();
        entry
            .carried
            .extend_from_slice(&buffer.bytes()[aligned_offset..]);
        buffer.set_current_size(aligned_offset);
    }

    /// Marks the slot complete without truncating the final buffer.
    pub fn finish_last_buffer(&mut self, slot: u64) {
        if let Some(entry) = self.slots.get_mut(&slot) {
            entry.carried.clear();
        }
    }

    /// The number of carried bytes waiting in a slot.
    pub fn remaining_bytes(&self, slot: u64) -> u64 {
        self.slots
            .get(&slot)
            .map_or(0, |entry| entry.carried.len() as u64)
    }

    pub fn has_remaining_bytes(&self, slot: u64) -> bool {
        self.remaining_bytes(slot) > 0
    }

    /// The slots that currently hold carried bytes.
    pub fn slots_with_remaining_bytes(&self) -> Vec<u64> {
        let mut slots: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, entry)| !entry.carried.is_empty())
            .map(|(&slot, _)| slot)
            .collect();
        slots.sort_unstable();
        slots
    }
}

impl Drop for BufferAligner {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        for (slot, entry) in &self.slots {
            assert!(
                entry.carried.is_empty(),
                "{} misaligned bytes were left behind for slot {}",
                entry.carried.len(),
                slot
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_carry_over() {
        let alignment = 512;
        let mut aligner = BufferAligner::new(alignment);
        let inputs: Vec<Vec<u8>> = [600, 400, 300, 50]
            .iter()
            .enumerate()
            .map(|(i, &size)| vec![i as u8 + 1; size])
            .collect();
        let total: usize = inputs.iter().map(Vec::len).sum();

        let mut emitted: Vec<Vec<u8>> = Vec::new();
        for input in &inputs {
            let mut buffer = KvPairBuffer::new(total, 0);
            aligner.prepare(&mut buffer, 0);
            buffer.append(input);
            aligner.finish(&mut buffer, 0);
            emitted.push(buffer.bytes().to_vec());
        }

        // Flush the remainder as the final, unaligned buffer.
        assert!(aligner.has_remaining_bytes(0));
        let mut last = KvPairBuffer::new(total, 0);
        aligner.prepare(&mut last, 0);
        aligner.finish_last_buffer(0);
        emitted.push(last.bytes().to_vec());

        // Every buffer but the last is a multiple of the alignment, and
        // the concatenation reproduces the input exactly.
        for buffer in &emitted[..emitted.len() - 1] {
            assert_eq!(buffer.len() % alignment as usize, 0);
        }
        let concatenated: Vec<u8> = emitted.concat();
        let expected: Vec<u8> = inputs.concat();
        assert_eq!(concatenated, expected);
    }

    #[test]
    fn test_independent_slots() {
        let mut aligner = BufferAligner::new(4);

        let mut a = KvPairBuffer::new(64, 0);
        aligner.prepare(&mut a, 0);
        a.append(b"abcde");
        aligner.finish(&mut a, 0);
        assert_eq!(a.bytes(), b"abcd");
        assert_eq!(aligner.remaining_bytes(0), 1);

        let mut b = KvPairBuffer::new(64, 0);
        aligner.prepare(&mut b, 1);
        b.append(b"xyz");
        aligner.finish(&mut b, 1);
        assert_eq!(b.current_size(), 0);
        assert_eq!(aligner.remaining_bytes(1), 3);

        assert_eq!(aligner.slots_with_remaining_bytes(), vec![0, 1]);
        aligner.finish_last_buffer(0);
        aligner.finish_last_buffer(1);
    }
}
