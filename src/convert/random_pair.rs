/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Pairing of random 64-bit fragments into 128-bit keys.

use crate::buffers::{ByteStreamBuffer, KvPairBuffer};
use crate::convert::{EmitKvBuffer, FormatReader};
use crate::tuple;
use anyhow::Result;

const FRAGMENT_SIZE: usize = 8;

/// Treats the input as a stream of 64-bit fragments and emits every
/// *consecutive* 128-bit pair as a key-only tuple, carrying the trailing
/// fragment across input buffers. Input buffers must be a multiple of
/// eight bytes, which direct I/O guarantees anyway.
pub struct RandomPairFormatReader {
    header: [u8; tuple::HEADER_SIZE],
    previous_fragment: [u8; FRAGMENT_SIZE],
    first_buffer: bool,
}

impl RandomPairFormatReader {
    pub fn new() -> Self {
        let mut header = [0u8; tuple::HEADER_SIZE];
        tuple::set_key_length(&mut header, 2 * FRAGMENT_SIZE as u32);
        tuple::set_value_length(&mut header, 0);
        RandomPairFormatReader {
            header,
            previous_fragment: [0; FRAGMENT_SIZE],
            first_buffer: true,
        }
    }
}

impl Default for RandomPairFormatReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatReader for RandomPairFormatReader {
    fn read_byte_stream(
        &mut self,
        buffer: &mut ByteStreamBuffer,
        emit: &mut EmitKvBuffer,
    ) -> Result<()> {
        let input = buffer.bytes();
        assert!(
            input.len() % FRAGMENT_SIZE == 0,
            "buffer must be {}-byte aligned but has size {}",
            FRAGMENT_SIZE,
            input.len()
        );

        let mut num_fragments = input.len() / FRAGMENT_SIZE;
        if !self.first_buffer {
            // The previous buffer's last fragment pairs with our first.
            num_fragments += 1;
        }
        if num_fragments < 2 {
            if let Some(last) = input.chunks_exact(FRAGMENT_SIZE).last() {
                self.previous_fragment.copy_from_slice(last);
                self.first_buffer = false;
            }
            return Ok(());
        }

        // Every fragment except the last starts one pair.
        let tuple_size = tuple::HEADER_SIZE + 2 * FRAGMENT_SIZE;
        let output_size = (num_fragments - 1) * tuple_size;
        let mut output = KvPairBuffer::new(output_size, 0);

        let mut input_offset = 0;
        {
            let region = output.setup_append(output_size);
            let mut out = 0;
            for i in 0..num_fragments - 1 {
                region[out..out + tuple::HEADER_SIZE].copy_from_slice(&self.header);
                out += tuple::HEADER_SIZE;
                if i == 0 && !self.first_buffer {
                    region[out..out + FRAGMENT_SIZE].copy_from_slice(&self.previous_fragment);
                    out += FRAGMENT_SIZE;
                    region[out..out + FRAGMENT_SIZE]
                        .copy_from_slice(&input[..FRAGMENT_SIZE]);
                    out += FRAGMENT_SIZE;
                } else {
                    region[out..out + 2 * FRAGMENT_SIZE]
                        .copy_from_slice(&input[input_offset..input_offset + 2 * FRAGMENT_SIZE]);
                    out += 2 * FRAGMENT_SIZE;
                    // Advance one fragment only, so every consecutive
                    // pair is captured.
                    input_offset += FRAGMENT_SIZE;
                }
            }
        }
        output.commit_append(output_size);

        self.previous_fragment
            .copy_from_slice(&input[input.len() - FRAGMENT_SIZE..]);
        self.first_buffer = false;

        emit(output)
    }

    fn stream_end(&mut self, _emit: &mut EmitKvBuffer) -> Result<()> {
        // The trailing fragment has no partner; nothing to flush.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(values: &[u64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn pairs_from(chunks: &[&[u8]]) -> Vec<(u64, u64)> {
        let mut reader = RandomPairFormatReader::new();
        let mut emitted = Vec::new();
        for chunk in chunks {
            let mut buffer = ByteStreamBuffer::new(chunk.len(), 0, 0);
            buffer.append(chunk);
            let mut emit = |kv: KvPairBuffer| {
                emitted.push(kv);
                Ok(())
            };
            reader.read_byte_stream(&mut buffer, &mut emit).unwrap();
        }

        let mut pairs = Vec::new();
        for mut buffer in emitted {
            buffer.reset_iterator();
            while let Some(pair) = buffer.next_kv_pair() {
                assert!(pair.value.is_empty());
                pairs.push((
                    u64::from_le_bytes(pair.key[..8].try_into().unwrap()),
                    u64::from_le_bytes(pair.key[8..].try_into().unwrap()),
                ));
            }
        }
        pairs
    }

    #[test]
    fn test_consecutive_pairs() {
        let input = fragments(&[1, 2, 3, 4]);
        assert_eq!(pairs_from(&[&input]), vec![(1, 2), (2, 3), (3, 4)]);
    }

    #[test]
    fn test_fragment_carries_across_buffers() {
        let first = fragments(&[1, 2]);
        let second = fragments(&[3, 4]);
        assert_eq!(
            pairs_from(&[&first, &second]),
            vec![(1, 2), (2, 3), (3, 4)]
        );
    }

    #[test]
    #[should_panic(expected = "byte aligned")]
    fn test_unaligned_buffer_panics() {
        let mut input = fragments(&[1, 2]);
        input.pop();
        pairs_from(&[&input]);
    }
}
