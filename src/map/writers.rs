/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The KV writer abstractions stages write tuples through.
//!
//! Writers decouple tuple production from buffer management: a stage (or
//! a user map/reduce function) calls [`KvWriter::write`] and the writer
//! takes care of acquiring buffers, filling them, and emitting them
//! downstream. The three concrete writers are the *simple* writer (whole
//! tuples, one buffer), the *partial* writer (per-partition buffers,
//! tuples may split across a buffer boundary at the byte level), and the
//! *reservoir-sampling* writer used to bound phase zero's sample volume.

use crate::buffers::KvPairBuffer;
use crate::map::SampleMetadata;
use crate::tuple::{self, KeyValuePair};
use anyhow::Result;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Produces an empty buffer with at least the requested capacity.
pub type BufferSource = Box<dyn FnMut(usize) -> KvPairBuffer + Send>;

/// Consumes a filled buffer together with the number of the partition (or
/// flow) it belongs to.
pub type BufferSink = Box<dyn FnMut(KvPairBuffer, u64) -> Result<()> + Send>;

/// Anything tuples can be written through.
pub trait KvWriter {
    fn write(&mut self, pair: &KeyValuePair) -> Result<()>;
}

/// Writes whole tuples to a single buffer, emitting on overflow.
pub struct SimpleKvWriter {
    buffer: Option<KvPairBuffer>,
    source: BufferSource,
    sink: BufferSink,
    /// Partition number handed to the sink with each buffer.
    buffer_number: u64,
    tuples_written: u64,
    bytes_written: u64,
}

impl SimpleKvWriter {
    pub fn new(buffer_number: u64, source: BufferSource, sink: BufferSink) -> Self {
        SimpleKvWriter {
            buffer: None,
            source,
            sink,
            buffer_number,
            tuples_written: 0,
            bytes_written: 0,
        }
    }

    /// Emits the current buffer even if it is only partially full.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(buffer) = self.buffer.take() {
            if !buffer.is_empty() {
                (self.sink)(buffer, self.buffer_number)?;
            }
        }
        Ok(())
    }

    pub fn tuples_written(&self) -> u64 {
        self.tuples_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl KvWriter for SimpleKvWriter {
    fn write(&mut self, pair: &KeyValuePair) -> Result<()> {
        let size = pair.write_size();

        if let Some(buffer) = &self.buffer {
            if buffer.capacity() - buffer.current_size() < size {
                let full = self.buffer.take().unwrap();
                (self.sink)(full, self.buffer_number)?;
            }
        }
        if self.buffer.is_none() {
            self.buffer = Some((self.source)(size));
        }
        let buffer = self.buffer.as_mut().unwrap();

        buffer.add_kv_pair(pair);
        self.tuples_written += 1;
        self.bytes_written += size as u64;
        Ok(())
    }
}

/// Per-partition buffering with byte-boundary splits.
///
/// A tuple whose framed bytes do not fit in the partition's current
/// buffer is split across two buffers; downstream stages of this writer
/// care about bytes, not tuples, so a buffer may begin or end
/// mid-tuple.
pub struct PartialKvWriter {
    buffers: Vec<Option<KvPairBuffer>>,
    source: BufferSource,
    sink: BufferSink,
    scratch: Vec<u8>,
    tuples_written: u64,
    bytes_written: u64,
}

impl PartialKvWriter {
    pub fn new(num_partitions: u64, source: BufferSource, sink: BufferSink) -> Self {
        PartialKvWriter {
            buffers: (0..num_partitions).map(|_| None).collect(),
            source,
            sink,
            scratch: Vec::new(),
            tuples_written: 0,
            bytes_written: 0,
        }
    }

    /// Writes one tuple to the given partition, splitting it across
    /// buffers as needed.
    pub fn write_to_partition(&mut self, partition: u64, pair: &KeyValuePair) -> Result<()> {
        let size = pair.write_size();
        self.scratch.resize(size, 0);
        pair.serialize_into(&mut self.scratch);

        let mut written = 0;
        while written < size {
            if self.buffers[partition as usize].is_none() {
                self.buffers[partition as usize] = Some((self.source)(0));
            }
            let buffer = self.buffers[partition as usize].as_mut().unwrap();

            let room = buffer.capacity() - buffer.current_size();
            let chunk = room.min(size - written);
            buffer.append(&self.scratch[written..written + chunk]);
            written += chunk;

            if buffer.capacity() == buffer.current_size() {
                let full = self.buffers[partition as usize].take().unwrap();
                (self.sink)(full, partition)?;
            }
        }

        self.tuples_written += 1;
        self.bytes_written += size as u64;
        Ok(())
    }

    /// Emits every partially filled buffer.
    pub fn flush(&mut self) -> Result<()> {
        for partition in 0..self.buffers.len() {
            if let Some(buffer) = self.buffers[partition].take() {
                if !buffer.is_empty() {
                    (self.sink)(buffer, partition as u64)?;
                }
            }
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn tuples_written(&self) -> u64 {
        self.tuples_written
    }
}

/// Reservoir-samples map output during phase zero.
///
/// The writer keeps at most `sample_capacity` sampled keys, each recorded
/// with the framed size of the map-output tuple it stands for. At flush
/// time it emits a sample buffer whose first tuple is the
/// [`SampleMetadata`] and whose remaining tuples are
/// `⟨key, u32 original size⟩` pairs, which is exactly the form the sorter
/// and boundary scanner expect.
pub struct ReservoirSamplingKvWriter {
    sample_capacity: usize,
    entries: Vec<(Vec<u8>, u32)>,
    rng: SmallRng,
    tuples_seen: u64,
    tuples_in: u64,
    bytes_in: u64,
    bytes_mapped: u64,
    pending_setup: Option<(Vec<u8>, usize)>,
    scratch: Vec<u8>,
}

impl ReservoirSamplingKvWriter {
    pub fn new(sample_capacity: usize, seed: u64) -> Self {
        ReservoirSamplingKvWriter {
            sample_capacity,
            entries: Vec::with_capacity(sample_capacity),
            rng: SmallRng::seed_from_u64(seed),
            tuples_seen: 0,
            tuples_in: 0,
            bytes_in: 0,
            bytes_mapped: 0,
            pending_setup: None,
            scratch: Vec::new(),
        }
    }

    /// Records input-side progress for the metadata tuple.
    pub fn add_bytes_mapped(&mut self, bytes: u64) {
        self.bytes_mapped += bytes;
    }

    /// Reserves a value span for in-place production of a tuple.
    ///
    /// Returns the writable value region; aborting is implicit when the
    /// caller never commits (nothing was sampled yet).
    pub fn setup_write(&mut self, key: &[u8], max_value_length: usize) -> &mut [u8] {
        assert!(
            self.pending_setup.is_none(),
            "setup_write called with a write already outstanding"
        );
        self.pending_setup = Some((key.to_vec(), max_value_length));
        self.scratch.resize(max_value_length, 0);
        &mut self.scratch
    }

    /// Commits the value span reserved by [`setup_write`](Self::setup_write).
    pub fn commit_write(&mut self, actual_value_length: usize) -> Result<()> {
        let (key, max_value_length) = self
            .pending_setup
            .take()
            .expect("commit_write without setup_write");
        assert!(
            actual_value_length <= max_value_length,
            "wrote {} value bytes but promised at most {}",
            actual_value_length,
            max_value_length
        );
        let value = self.scratch[..actual_value_length].to_vec();
        self.write(&KeyValuePair::new(&key, &value))
    }

    /// Abandons the reserved span.
    pub fn abort_write(&mut self) {
        assert!(
            self.pending_setup.take().is_some(),
            "abort_write without setup_write"
        );
    }

    fn bytes_out(&self) -> u64 {
        self.entries.iter().map(|(_, size)| *size as u64).sum()
    }

    /// The metadata describing this writer's sample so far.
    pub fn metadata(&self, job_id: u64) -> SampleMetadata {
        SampleMetadata {
            job_id,
            tuples_in: self.tuples_in,
            bytes_in: self.bytes_in,
            tuples_out: self.entries.len() as u64,
            bytes_out: self.bytes_out(),
            bytes_mapped: self.bytes_mapped,
        }
    }

    /// Drains the sample into a buffer: metadata first, then one
    /// `⟨key, u32 size⟩` tuple per sampled map-output tuple.
    pub fn take_sample_buffer(&mut self, job_id: u64) -> KvPairBuffer {
        let metadata = self.metadata(job_id);
        let payload: usize = self
            .entries
            .iter()
            .map(|(key, _)| tuple::tuple_size(key.len() as u32, 4))
            .sum();

        let mut buffer = KvPairBuffer::new(SampleMetadata::tuple_size() + payload, 0);
        metadata.append_to(&mut buffer);
        for (key, size) in self.entries.drain(..) {
            buffer.add_kv_pair(&KeyValuePair::new(&key, &size.to_le_bytes()));
        }
        buffer.add_job_id(job_id);
        buffer
    }
}

impl KvWriter for ReservoirSamplingKvWriter {
    fn write(&mut self, pair: &KeyValuePair) -> Result<()> {
        let size = pair.write_size() as u32;
        self.tuples_in += 1;
        self.bytes_in += size as u64;

        let index = self.tuples_seen;
        self.tuples_seen += 1;

        if self.entries.len() < self.sample_capacity {
            self.entries.push((pair.key.to_vec(), size));
        } else {
            let slot = self.rng.random_range(0..=index);
            if (slot as usize) < self.sample_capacity {
                self.entries[slot as usize] = (pair.key.to_vec(), size);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;

    fn fixed_source(capacity: usize) -> BufferSource {
        Box::new(move |at_least| KvPairBuffer::new(capacity.max(at_least), 0))
    }

    #[test]
    fn test_simple_writer_emits_on_overflow() -> Result<()> {
        let (tracker, receiver) = work_queue("out", 16);
        let sink: BufferSink = Box::new(move |buffer, _| tracker.send(buffer));
        let mut writer = SimpleKvWriter::new(0, fixed_source(64), sink);

        // Each tuple is 8 + 4 + 12 = 24 bytes; the third overflows a
        // 64-byte buffer.
        for i in 0..3u32 {
            let key = i.to_be_bytes();
            writer.write(&KeyValuePair::new(&key, b"0123456789ab"))?;
        }
        writer.flush()?;

        let mut first = receiver.try_recv().unwrap();
        let mut second = receiver.try_recv().unwrap();
        assert_eq!(first.num_tuples(), 2);
        assert_eq!(second.num_tuples(), 1);
        assert_eq!(writer.tuples_written(), 3);
        Ok(())
    }

    #[test]
    fn test_partial_writer_splits_across_buffers() -> Result<()> {
        let (tracker, receiver) = work_queue("out", 16);
        let sink: BufferSink = Box::new(move |buffer, partition| {
            assert_eq!(partition, 0);
            tracker.send(buffer)
        });
        let mut writer = PartialKvWriter::new(1, fixed_source(20), sink);

        // One 28-byte tuple across 20-byte buffers: the first emission is
        // full and ends mid-tuple.
        writer.write_to_partition(0, &KeyValuePair::new(b"key-bytes!", b"value-byte"))?;
        writer.flush()?;

        let first = receiver.try_recv().unwrap();
        let second = receiver.try_recv().unwrap();
        assert_eq!(first.current_size(), 20);
        assert_eq!(second.current_size(), 8);

        let mut rejoined = first.bytes().to_vec();
        rejoined.extend_from_slice(second.bytes());
        let pair = KeyValuePair::deserialize(&rejoined);
        assert_eq!(pair.key, b"key-bytes!");
        assert_eq!(pair.value, b"value-byte");
        Ok(())
    }

    #[test]
    fn test_reservoir_bounds_sample_size() -> Result<()> {
        let mut writer = ReservoirSamplingKvWriter::new(10, 42);
        for i in 0..1000u32 {
            let key = i.to_be_bytes();
            writer.write(&KeyValuePair::new(&key, b"value"))?;
        }

        let metadata = writer.metadata(1);
        assert_eq!(metadata.tuples_in, 1000);
        assert_eq!(metadata.tuples_out, 10);
        // Every sampled tuple has the same framed size here.
        assert_eq!(metadata.bytes_out, 10 * (8 + 4 + 5));

        let mut buffer = writer.take_sample_buffer(1);
        let first = buffer.next_kv_pair().unwrap();
        let read_back = SampleMetadata::from_kv_pair(&first);
        assert_eq!(read_back, metadata);

        let mut samples = 0;
        while let Some(pair) = buffer.next_kv_pair() {
            assert_eq!(u32::from_le_bytes(pair.value.try_into().unwrap()), 17);
            samples += 1;
        }
        assert_eq!(samples, 10);
        Ok(())
    }

    #[test]
    fn test_reservoir_setup_commit_write() -> Result<()> {
        let mut writer = ReservoirSamplingKvWriter::new(4, 7);
        let value = writer.setup_write(b"key", 16);
        value[..5].copy_from_slice(b"hello");
        writer.commit_write(5)?;
        assert_eq!(writer.metadata(1).tuples_in, 1);

        writer.setup_write(b"key", 16);
        writer.abort_write();
        assert_eq!(writer.metadata(1).tuples_in, 1);
        Ok(())
    }
}
