/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! LSD byte-wise radix sort for equal-length keys.
//!
//! The sort never moves whole tuples between passes. It packs one *entry*
//! per tuple — the key (optionally extended by the secondary-key prefix of
//! the value) followed by the tuple's offset in the input buffer — into a
//! scratch table, then re-buckets entries between two tables one key byte
//! at a time, least significant byte first. A final pass walks the sorted
//! entries and copies each whole tuple from the input buffer into the
//! output buffer through its stored offset.
//!
//! Offsets are stored in 2, 4 or 8 bytes depending on the input size, so
//! the scratch footprint of small buffers stays small.

use crate::buffers::KvPairBuffer;
use crate::sort::{SortAlgorithm, SortStrategy};
use crate::tuple;

const NUM_BUCKETS: usize = 256;

/// Offset field widths, picked from the input buffer size.
fn offset_size(input_size: usize) -> usize {
    if input_size <= u16::MAX as usize {
        2
    } else if input_size <= u32::MAX as usize {
        4
    } else {
        8
    }
}

fn write_offset(entry: &mut [u8], offset: usize, width: usize) {
    entry[..width].copy_from_slice(&offset.to_le_bytes()[..width]);
}

fn read_offset(entry: &[u8], width: usize) -> usize {
    let mut bytes = [0u8; 8];
    bytes[..width].copy_from_slice(&entry[..width]);
    usize::from_le_bytes(bytes)
}

/// Radix sort over buffers whose keys all have the same length.
#[derive(Debug)]
pub struct RadixSortStrategy {
    use_secondary_keys: bool,
}

impl RadixSortStrategy {
    pub fn new(use_secondary_keys: bool) -> Self {
        RadixSortStrategy { use_secondary_keys }
    }

    fn sort_key_size(&self, input: &mut KvPairBuffer) -> usize {
        let mut key_size = input.max_key_length() as usize;
        if self.use_secondary_keys {
            key_size += tuple::SECONDARY_KEY_SIZE;
        }
        key_size
    }
}

impl SortStrategy for RadixSortStrategy {
    fn algorithm(&self) -> SortAlgorithm {
        SortAlgorithm::RadixSort
    }

    fn required_scratch_bytes(&self, input: &mut KvPairBuffer) -> u64 {
        let entry_size = self.sort_key_size(input) + offset_size(input.current_size());
        entry_size as u64 * input.num_tuples() * 2
    }

    fn sort(&mut self, input: &mut KvPairBuffer, output: &mut KvPairBuffer) {
        assert!(
            input.current_size() <= output.capacity(),
            "output buffer (capacity {}) must be at least as large as input buffer (size {}) \
             to sort",
            output.capacity(),
            input.current_size()
        );
        assert!(
            input.min_key_length() == input.max_key_length(),
            "radix sort requires equal-length keys, but this buffer has lengths {} through {}",
            input.min_key_length(),
            input.max_key_length()
        );

        let key_size = self.sort_key_size(input);
        let width = offset_size(input.current_size());
        let entry_size = key_size + width;
        let num_tuples = input.num_tuples() as usize;
        let use_secondary_keys = self.use_secondary_keys;

        let bytes = input.bytes();

        // Distribute keys from the input buffer into the first table.
        let mut table = vec![0u8; num_tuples * entry_size];
        let mut offset = 0;
        for entry in table.chunks_exact_mut(entry_size) {
            let tuple_bytes = &bytes[offset..];
            let key = tuple::key(tuple_bytes);
            entry[..key.len()].copy_from_slice(key);
            if use_secondary_keys {
                let value = tuple::value(tuple_bytes);
                let prefix_len = value.len().min(tuple::SECONDARY_KEY_SIZE);
                entry[key.len()..key.len() + prefix_len].copy_from_slice(&value[..prefix_len]);
                entry[key.len() + prefix_len..key_size].fill(0);
            }
            write_offset(&mut entry[key_size..], offset, width);
            offset += tuple::framed_size(tuple_bytes);
        }

        // Re-bucket between the two tables, one key byte per pass, least
        // significant byte first. Counting sort keeps each pass stable,
        // which is what makes the byte-at-a-time decomposition correct.
        let mut other_table = vec![0u8; num_tuples * entry_size];
        for byte_index in (0..key_size).rev() {
            let mut histogram = [0usize; NUM_BUCKETS];
            for entry in table.chunks_exact(entry_size) {
                histogram[entry[byte_index] as usize] += 1;
            }

            let mut bucket_starts = [0usize; NUM_BUCKETS];
            let mut start = 0;
            for (bucket, count) in histogram.iter().enumerate() {
                bucket_starts[bucket] = start;
                start += count;
            }

            for entry in table.chunks_exact(entry_size) {
                let bucket = entry[byte_index] as usize;
                let slot = bucket_starts[bucket];
                bucket_starts[bucket] += 1;
                other_table[slot * entry_size..(slot + 1) * entry_size].copy_from_slice(entry);
            }

            std::mem::swap(&mut table, &mut other_table);
        }

        // Copy whole tuples to the output buffer via the stored offsets.
        let region = output.setup_append(bytes.len());
        let mut written = 0;
        for entry in table.chunks_exact(entry_size) {
            let offset = read_offset(&entry[key_size..], width);
            let size = tuple::framed_size(&bytes[offset..]);
            region[written..written + size].copy_from_slice(&bytes[offset..offset + size]);
            written += size;
        }
        output.commit_append(written);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::KeyValuePair;

    fn sorted_keys(input: &mut KvPairBuffer, use_secondary_keys: bool) -> Vec<Vec<u8>> {
        let mut output = KvPairBuffer::new(input.current_size().max(1), 0);
        RadixSortStrategy::new(use_secondary_keys).sort(input, &mut output);
        assert_eq!(output.current_size(), input.current_size());
        std::iter::from_fn(|| output.next_kv_pair().map(|pair| pair.key.to_vec())).collect()
    }

    #[test]
    fn test_sorts_equal_length_keys() {
        let mut input = KvPairBuffer::new(1 << 12, 0);
        for key in [&b"0042"[..], b"9999", b"0001", b"5000", b"0041"] {
            input.add_kv_pair(&KeyValuePair::new(key, b"v"));
        }
        assert_eq!(
            sorted_keys(&mut input, false),
            vec![
                b"0001".to_vec(),
                b"0041".to_vec(),
                b"0042".to_vec(),
                b"5000".to_vec(),
                b"9999".to_vec()
            ]
        );
    }

    #[test]
    fn test_matches_quick_sort_on_random_input() {
        use rand::prelude::*;
        let mut rng = SmallRng::seed_from_u64(0xfeed);

        let mut radix_input = KvPairBuffer::new(1 << 16, 0);
        let mut quick_input = KvPairBuffer::new(1 << 16, 0);
        for _ in 0..500 {
            let key: [u8; 10] = rng.random();
            let value: [u8; 13] = rng.random();
            radix_input.add_kv_pair(&KeyValuePair::new(&key, &value));
            quick_input.add_kv_pair(&KeyValuePair::new(&key, &value));
        }

        let mut radix_output = KvPairBuffer::new(radix_input.current_size(), 0);
        RadixSortStrategy::new(false).sort(&mut radix_input, &mut radix_output);
        let mut quick_output = KvPairBuffer::new(quick_input.current_size(), 0);
        crate::sort::QuickSortStrategy::new(false).sort(&mut quick_input, &mut quick_output);

        assert_eq!(radix_output.bytes(), quick_output.bytes());
    }

    #[test]
    fn test_secondary_keys() {
        let mut input = KvPairBuffer::new(1 << 12, 0);
        input.add_kv_pair(&KeyValuePair::new(b"kk", b"zzzzzzzz-last"));
        input.add_kv_pair(&KeyValuePair::new(b"kk", b"aaaaaaaa-first"));

        let mut output = KvPairBuffer::new(input.current_size(), 0);
        RadixSortStrategy::new(true).sort(&mut input, &mut output);
        assert_eq!(output.next_kv_pair().unwrap().value, b"aaaaaaaa-first");
    }

    #[test]
    #[should_panic(expected = "equal-length keys")]
    fn test_rejects_mixed_key_lengths() {
        let mut input = KvPairBuffer::new(1 << 12, 0);
        input.add_kv_pair(&KeyValuePair::new(b"short", b"v"));
        input.add_kv_pair(&KeyValuePair::new(b"longer-key!", b"v"));
        let mut output = KvPairBuffer::new(input.current_size(), 0);
        RadixSortStrategy::new(false).sort(&mut input, &mut output);
    }

    #[test]
    fn test_scratch_size_uses_narrow_offsets() {
        let mut small = KvPairBuffer::new(1 << 10, 0);
        small.add_kv_pair(&KeyValuePair::new(b"0123456789", b"v"));
        let strategy = RadixSortStrategy::new(false);
        // One tuple, 10-byte key, 2-byte offsets, two tables.
        assert_eq!(strategy.required_scratch_bytes(&mut small), (10 + 2) * 2);
    }
}
