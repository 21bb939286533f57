/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Per-node boundary key selection from sorted samples.

use crate::buffers::KvPairBuffer;
use crate::map::{KvWriter, SampleMetadata, SimpleKvWriter};
use crate::stage::{Tracker, Worker};
use crate::tuple::KeyValuePair;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Merges a node's sample buffers into one.
///
/// Each sample mapper emits one sample buffer led by its own metadata
/// tuple; the scanner wants a single metadata tuple that covers the whole
/// node. The combiner strips each arriving buffer's metadata, merges the
/// counts field-wise, concatenates the sample tuples, and emits one
/// combined buffer at teardown.
pub struct SampleCombiner {
    metadata: Option<SampleMetadata>,
    samples: Vec<(Vec<u8>, Vec<u8>)>,
    payload_bytes: usize,
    node: Option<u64>,
    downstream: Tracker<KvPairBuffer>,
}

impl SampleCombiner {
    pub fn new(downstream: Tracker<KvPairBuffer>) -> Self {
        SampleCombiner {
            metadata: None,
            samples: Vec::new(),
            payload_bytes: 0,
            node: None,
            downstream,
        }
    }
}

impl Worker for SampleCombiner {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "sample-combiner"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        buffer.reset_iterator();
        let arriving = SampleMetadata::from_kv_pair(
            &buffer
                .next_kv_pair()
                .expect("sample buffer arrived without a metadata tuple"),
        );
        match &mut self.metadata {
            None => self.metadata = Some(arriving),
            Some(metadata) => metadata.merge(&arriving),
        }
        self.node = self.node.or(buffer.node);

        while let Some(pair) = buffer.next_kv_pair() {
            self.payload_bytes += pair.write_size();
            self.samples.push((pair.key.to_vec(), pair.value.to_vec()));
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let metadata = match self.metadata {
            Some(metadata) => metadata,
            // No samples at all; nothing to emit.
            None => return Ok(()),
        };

        let mut combined =
            KvPairBuffer::new(SampleMetadata::tuple_size() + self.payload_bytes, 0);
        metadata.append_to(&mut combined);
        for (key, value) in self.samples.drain(..) {
            combined.add_kv_pair(&KeyValuePair::new(&key, &value));
        }
        combined.add_job_id(metadata.job_id);
        combined.node = self.node;
        self.downstream.send(combined)
    }
}

/// Scans a node's sorted sample and picks its boundary keys.
///
/// With `bytes_per_partition = bytes_out / num_partitions` (and the
/// remainder spread one byte each over the first partitions), the scanner
/// emits the first key whose cumulative byte count crosses each
/// threshold. Boundary keys travel to the coordinator node with
/// zero-length values.
pub struct BoundaryScanner {
    num_partitions: u64,
    coordinator_node_id: u64,
    job_id: Option<u64>,
    metadata: Option<SampleMetadata>,
    bytes_per_partition: u64,
    remainder: u64,
    next_partition_bytes: u64,
    bytes_scanned: u64,
    tuples_scanned: u64,
    partitions_picked: u64,
    writer: SimpleKvWriter,
    /// Shared with the writer's sink so emitted buffers get the job tag.
    job_for_sink: Arc<AtomicU64>,
}

impl BoundaryScanner {
    pub fn new(
        num_partitions: u64,
        coordinator_node_id: u64,
        default_buffer_size: usize,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        let job_for_sink = Arc::new(AtomicU64::new(u64::MAX));
        let job_for_sink_clone = job_for_sink.clone();
        let writer = SimpleKvWriter::new(
            coordinator_node_id,
            Box::new(move |at_least| KvPairBuffer::new(default_buffer_size.max(at_least), 0)),
            Box::new(move |mut buffer, node| {
                buffer.node = Some(node);
                let job_id = job_for_sink_clone.load(Ordering::Relaxed);
                assert!(job_id != u64::MAX, "boundary buffer emitted before any input");
                buffer.add_job_id(job_id);
                downstream.send(buffer)
            }),
        );
        BoundaryScanner {
            num_partitions,
            coordinator_node_id,
            job_id: None,
            metadata: None,
            bytes_per_partition: 0,
            remainder: 0,
            next_partition_bytes: 0,
            bytes_scanned: 0,
            tuples_scanned: 0,
            partitions_picked: 0,
            writer,
            job_for_sink,
        }
    }
}

impl Worker for BoundaryScanner {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "boundary-scanner"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        buffer.reset_iterator();

        if self.metadata.is_none() {
            let job_id = buffer.sole_job_id();
            self.job_id = Some(job_id);
            self.job_for_sink.store(job_id, Ordering::Relaxed);

            let metadata = SampleMetadata::from_kv_pair(
                &buffer
                    .next_kv_pair()
                    .expect("could not get the metadata tuple from the first sample buffer"),
            );
            self.bytes_per_partition = metadata.bytes_out / self.num_partitions;
            self.remainder = metadata.bytes_out % self.num_partitions;
            self.metadata = Some(metadata);
        }

        while let Some(pair) = buffer.next_kv_pair() {
            let bytes_read =
                u32::from_le_bytes(pair.value.try_into().expect("malformed sample tuple")) as u64;

            if self.bytes_scanned > self.next_partition_bytes {
                // A boundary key; forward it with an empty value.
                self.writer.write(&KeyValuePair::new(pair.key, b""))?;
                self.next_partition_bytes += self.bytes_per_partition;
                if self.remainder > 0 {
                    self.next_partition_bytes += 1;
                    self.remainder -= 1;
                }
                self.partitions_picked += 1;
            }

            // The value is the number of bytes the sampled map-output
            // tuple took up.
            self.bytes_scanned += bytes_read;
            self.tuples_scanned += 1;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.writer.flush()?;

        let metadata = self
            .metadata
            .expect("boundary scanner tore down without seeing any samples");
        assert!(
            self.bytes_scanned == metadata.bytes_out,
            "we were supposed to scan {} bytes but scanned {}",
            metadata.bytes_out,
            self.bytes_scanned
        );
        assert!(
            self.tuples_scanned == metadata.tuples_out,
            "we were supposed to scan {} tuples but scanned {}",
            metadata.tuples_out,
            self.tuples_scanned
        );
        assert!(
            self.partitions_picked == self.num_partitions,
            "we were supposed to pick {} partitions but picked {}",
            self.num_partitions,
            self.partitions_picked
        );
        log::info!(
            "boundary scanner picked {} boundaries for the coordinator (node {})",
            self.partitions_picked,
            self.coordinator_node_id
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;

    /// Builds a sorted sample buffer of single-byte keys, each standing
    /// for a map-output tuple of `tuple_bytes` bytes.
    fn sample_buffer(job_id: u64, keys: &[u8], tuple_bytes: u32) -> KvPairBuffer {
        let mut buffer = KvPairBuffer::new(1 << 12, 0);
        SampleMetadata {
            job_id,
            tuples_in: keys.len() as u64 * 10,
            bytes_in: 0,
            tuples_out: keys.len() as u64,
            bytes_out: keys.len() as u64 * tuple_bytes as u64,
            bytes_mapped: 0,
        }
        .append_to(&mut buffer);
        for key in keys {
            buffer.add_kv_pair(&KeyValuePair::new(&[*key], &tuple_bytes.to_le_bytes()));
        }
        buffer.add_job_id(job_id);
        buffer
    }

    #[test]
    fn test_scanner_picks_num_partitions_boundaries() -> Result<()> {
        let (tracker, receiver) = work_queue("decider", 16);
        let mut scanner = BoundaryScanner::new(4, 0, 1 << 12, tracker);

        // 16 keys of 100 bytes each: thresholds at 0, 400, 800, 1200.
        let keys: Vec<u8> = (b'a'..=b'p').collect();
        scanner.process(sample_buffer(8, &keys, 100))?;
        scanner.teardown()?;

        let mut boundaries = Vec::new();
        while let Ok(mut buffer) = receiver.try_recv() {
            assert_eq!(buffer.node, Some(0));
            assert_eq!(buffer.sole_job_id(), 8);
            while let Some(pair) = buffer.next_kv_pair() {
                assert!(pair.value.is_empty());
                boundaries.push(pair.key.to_vec());
            }
        }
        assert_eq!(boundaries.len(), 4);
        // The first boundary is the first key whose cumulative count
        // crosses zero, i.e. the second key.
        assert_eq!(boundaries[0], b"b");
        Ok(())
    }

    #[test]
    fn test_combiner_merges_metadata() -> Result<()> {
        let (tracker, receiver) = work_queue("sorter", 4);
        let mut combiner = SampleCombiner::new(tracker);

        combiner.process(sample_buffer(8, b"ab", 50))?;
        combiner.process(sample_buffer(8, b"cd", 50))?;
        combiner.teardown()?;

        let mut combined = receiver.try_recv().unwrap();
        assert_eq!(combined.num_tuples(), 5);
        combined.reset_iterator();
        let metadata = SampleMetadata::from_kv_pair(&combined.next_kv_pair().unwrap());
        assert_eq!(metadata.tuples_out, 4);
        assert_eq!(metadata.bytes_out, 200);
        Ok(())
    }
}
