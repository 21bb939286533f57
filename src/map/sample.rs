/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Per-sample-buffer metadata used to size partitions in phase zero.

use crate::buffers::KvPairBuffer;
use crate::tuple::{self, KeyValuePair};

/// The serialized metadata value: six big-endian `u64`s.
const METADATA_SIZE: usize = 48;

/// The metadata tuple's key is a single placeholder byte.
const TUPLE_KEY_SIZE: usize = 1;

/// Counts describing one node's sample of a job's map output, embedded
/// big-endian as the first tuple of every sample buffer.
///
/// `bytes_out` is the number of map-output bytes the *sampled* tuples
/// stand for, which is exactly what the boundary scanner re-accumulates
/// while picking split points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleMetadata {
    pub job_id: u64,
    pub tuples_in: u64,
    pub bytes_in: u64,
    pub tuples_out: u64,
    pub bytes_out: u64,
    pub bytes_mapped: u64,
}

impl SampleMetadata {
    /// The framed size of a metadata tuple.
    pub const fn tuple_size() -> usize {
        tuple::tuple_size(TUPLE_KEY_SIZE as u32, METADATA_SIZE as u32)
    }

    /// Parses a metadata tuple.
    pub fn from_kv_pair(pair: &KeyValuePair) -> Self {
        assert!(
            pair.key.len() == TUPLE_KEY_SIZE,
            "expected a {}-byte key when demarshalling sample metadata; got length {}",
            TUPLE_KEY_SIZE,
            pair.key.len()
        );
        assert!(
            pair.value.len() == METADATA_SIZE,
            "unexpected value size {} when demarshalling sample metadata",
            pair.value.len()
        );

        let field = |i: usize| {
            u64::from_be_bytes(pair.value[i * 8..(i + 1) * 8].try_into().unwrap())
        };
        SampleMetadata {
            job_id: field(0),
            tuples_in: field(1),
            bytes_in: field(2),
            tuples_out: field(3),
            bytes_out: field(4),
            bytes_mapped: field(5),
        }
    }

    fn serialized_value(&self) -> [u8; METADATA_SIZE] {
        let mut value = [0u8; METADATA_SIZE];
        for (i, field) in [
            self.job_id,
            self.tuples_in,
            self.bytes_in,
            self.tuples_out,
            self.bytes_out,
            self.bytes_mapped,
        ]
        .into_iter()
        .enumerate()
        {
            value[i * 8..(i + 1) * 8].copy_from_slice(&field.to_be_bytes());
        }
        value
    }

    /// Appends this metadata as a tuple; it must be the buffer's first.
    pub fn append_to(&self, buffer: &mut KvPairBuffer) {
        assert!(
            buffer.is_empty(),
            "sample metadata must be the first tuple of a sample buffer"
        );
        let value = self.serialized_value();
        // The key is the first byte of the serialized value; its content
        // is irrelevant, it only has to be present.
        buffer.add_kv_pair(&KeyValuePair::new(&value[..TUPLE_KEY_SIZE], &value));
    }

    /// Field-wise accumulation of another sample of the same job.
    pub fn merge(&mut self, other: &SampleMetadata) {
        assert!(
            self.job_id == other.job_id,
            "can't merge metadata from two different jobs (other {}, this {})",
            other.job_id,
            self.job_id
        );
        self.tuples_in += other.tuples_in;
        self.bytes_in += other.bytes_in;
        self.tuples_out += other.tuples_out;
        self.bytes_out += other.bytes_out;
        self.bytes_mapped += other.bytes_mapped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> SampleMetadata {
        SampleMetadata {
            job_id: 7,
            tuples_in: 1000,
            bytes_in: 123456,
            tuples_out: 100,
            bytes_out: 12345,
            bytes_mapped: 98765,
        }
    }

    #[test]
    fn test_round_trip_through_buffer() {
        let mut buffer = KvPairBuffer::new(256, 0);
        metadata().append_to(&mut buffer);
        assert_eq!(buffer.current_size(), SampleMetadata::tuple_size());

        let pair = buffer.next_kv_pair().unwrap();
        assert_eq!(SampleMetadata::from_kv_pair(&pair), metadata());
    }

    #[test]
    fn test_merge_adds_fields() {
        let mut merged = metadata();
        merged.merge(&metadata());
        assert_eq!(merged.job_id, 7);
        assert_eq!(merged.tuples_in, 2000);
        assert_eq!(merged.bytes_out, 24690);
    }

    #[test]
    #[should_panic(expected = "two different jobs")]
    fn test_merge_rejects_other_job() {
        let mut first = metadata();
        let mut second = metadata();
        second.job_id = 8;
        first.merge(&second);
    }
}
