/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The network envelope framing shuffled buffers.

use crate::buffers::KvPairBuffer;

/// Size of the on-wire envelope.
pub const ENVELOPE_SIZE: usize = 32;

/// The 32-byte big-endian header that precedes every shuffled buffer:
/// `⟨bufferLength, jobID, partitionGroup, partitionID⟩`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub buffer_length: u64,
    pub job_id: u64,
    pub partition_group: u64,
    pub partition_id: u64,
}

impl Envelope {
    /// Builds the envelope describing a buffer about to be sent.
    ///
    /// Untagged fields are sent as all-ones, the "unset" sentinel on the
    /// wire.
    pub fn for_buffer(buffer: &KvPairBuffer) -> Self {
        Envelope {
            buffer_length: buffer.current_size() as u64,
            job_id: buffer.sole_job_id(),
            partition_group: buffer.partition_group.unwrap_or(u64::MAX),
            partition_id: buffer.logical_disk_id.unwrap_or(u64::MAX),
        }
    }

    pub fn serialize(&self) -> [u8; ENVELOPE_SIZE] {
        let mut bytes = [0u8; ENVELOPE_SIZE];
        bytes[0..8].copy_from_slice(&self.buffer_length.to_be_bytes());
        bytes[8..16].copy_from_slice(&self.job_id.to_be_bytes());
        bytes[16..24].copy_from_slice(&self.partition_group.to_be_bytes());
        bytes[24..32].copy_from_slice(&self.partition_id.to_be_bytes());
        bytes
    }

    pub fn deserialize(bytes: &[u8; ENVELOPE_SIZE]) -> Self {
        let field =
            |i: usize| u64::from_be_bytes(bytes[i * 8..(i + 1) * 8].try_into().unwrap());
        Envelope {
            buffer_length: field(0),
            job_id: field(1),
            partition_group: field(2),
            partition_id: field(3),
        }
    }

    /// Applies the envelope's tags to a freshly received buffer.
    pub fn apply_to(&self, buffer: &mut KvPairBuffer) {
        buffer.add_job_id(self.job_id);
        if self.partition_group != u64::MAX {
            buffer.partition_group = Some(self.partition_group);
        }
        if self.partition_id != u64::MAX {
            buffer.logical_disk_id = Some(self.partition_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut buffer = KvPairBuffer::new(128, 0);
        buffer.append(&[0u8; 100]);
        buffer.add_job_id(4);
        buffer.partition_group = Some(7);
        buffer.logical_disk_id = Some(23);

        let envelope = Envelope::for_buffer(&buffer);
        let read_back = Envelope::deserialize(&envelope.serialize());
        assert_eq!(read_back, envelope);
        assert_eq!(read_back.buffer_length, 100);
        assert_eq!(read_back.job_id, 4);
        assert_eq!(read_back.partition_group, 7);
        assert_eq!(read_back.partition_id, 23);
    }

    #[test]
    fn test_unset_fields_round_trip() {
        let mut buffer = KvPairBuffer::new(16, 0);
        buffer.add_job_id(1);
        let envelope = Envelope::for_buffer(&buffer);

        let mut received = KvPairBuffer::new(16, 0);
        Envelope::deserialize(&envelope.serialize()).apply_to(&mut received);
        assert_eq!(received.partition_group, None);
        assert_eq!(received.logical_disk_id, None);
    }
}
