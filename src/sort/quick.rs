/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Tag-array quick sort over framed tuples.

use crate::buffers::KvPairBuffer;
use crate::sort::{SortAlgorithm, SortStrategy};
use crate::tuple;

/// Sorts a buffer by building an array of tag offsets, one per tuple,
/// sorting the tags with an introsort-style unstable sort, and then
/// walking the tags to copy tuples into the output buffer.
///
/// Key lengths are read from the tuple headers through the tags, so the
/// tags themselves stay one word each.
#[derive(Debug)]
pub struct QuickSortStrategy {
    use_secondary_keys: bool,
}

impl QuickSortStrategy {
    pub fn new(use_secondary_keys: bool) -> Self {
        QuickSortStrategy { use_secondary_keys }
    }
}

impl SortStrategy for QuickSortStrategy {
    fn algorithm(&self) -> SortAlgorithm {
        SortAlgorithm::QuickSort
    }

    fn required_scratch_bytes(&self, input: &mut KvPairBuffer) -> u64 {
        input.num_tuples() * std::mem::size_of::<usize>() as u64
    }

    fn sort(&mut self, input: &mut KvPairBuffer, output: &mut KvPairBuffer) {
        assert!(
            input.current_size() <= output.capacity(),
            "output buffer (capacity {}) must be at least as large as input buffer (size {}) \
             to sort",
            output.capacity(),
            input.current_size()
        );

        let bytes = input.bytes();

        // Populate tags by walking the framed tuples.
        let mut tags = Vec::with_capacity(input.bytes().len() / tuple::HEADER_SIZE);
        let mut offset = 0;
        while offset < bytes.len() {
            tags.push(offset);
            offset += tuple::framed_size(&bytes[offset..]);
        }

        if self.use_secondary_keys {
            tags.sort_unstable_by(|&a, &b| {
                tuple::compare_tuples_with_secondary(&bytes[a..], &bytes[b..])
            });
        } else {
            tags.sort_unstable_by(|&a, &b| tuple::compare_tuples(&bytes[a..], &bytes[b..]));
        }

        // Collect sorted tuples.
        let total = bytes.len();
        let region = output.setup_append(total);
        let mut written = 0;
        for tag in tags {
            let size = tuple::framed_size(&bytes[tag..]);
            region[written..written + size].copy_from_slice(&bytes[tag..tag + size]);
            written += size;
        }
        output.commit_append(written);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::KeyValuePair;

    #[test]
    fn test_sorts_variable_length_keys() {
        let mut input = KvPairBuffer::new(1 << 12, 0);
        for key in [&b"pear"[..], b"a", b"zz", b"apple", b"ab"] {
            input.add_kv_pair(&KeyValuePair::new(key, b"value"));
        }

        let mut output = KvPairBuffer::new(input.current_size(), 0);
        let mut strategy = QuickSortStrategy::new(false);
        strategy.sort(&mut input, &mut output);

        assert_eq!(output.current_size(), input.current_size());
        let keys: Vec<Vec<u8>> = std::iter::from_fn(|| {
            output.next_kv_pair().map(|pair| pair.key.to_vec())
        })
        .collect();
        assert_eq!(
            keys,
            vec![
                b"a".to_vec(),
                b"ab".to_vec(),
                b"apple".to_vec(),
                b"pear".to_vec(),
                b"zz".to_vec()
            ]
        );
    }

    #[test]
    fn test_secondary_keys_break_ties() {
        let mut input = KvPairBuffer::new(1 << 12, 0);
        input.add_kv_pair(&KeyValuePair::new(b"k", b"bbbbbbbb-2"));
        input.add_kv_pair(&KeyValuePair::new(b"k", b"aaaaaaaa-1"));

        let mut output = KvPairBuffer::new(input.current_size(), 0);
        QuickSortStrategy::new(true).sort(&mut input, &mut output);

        let first = output.next_kv_pair().unwrap().value.to_vec();
        assert_eq!(first, b"aaaaaaaa-1");
    }
}
