/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Merging the sorted chunks of large partitions.
//!
//! Partitions that outgrew the large-partition threshold were split into
//! sorted chunk files. The merger collects a partition's chunk buffers
//! and k-way merges them through a quaternary heap into output buffers
//! for the writer, releasing each chunk's read token as the chunk is
//! consumed.

use crate::buffers::KvPairBuffer;
use crate::chain::WriteTokenPool;
use crate::map::{KvWriter, SimpleKvWriter};
use crate::stage::{Tracker, Worker};
use crate::tuple::{self, KeyValuePair};
use anyhow::Result;
use dary_heap::QuaternaryHeap;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One chunk's cursor in the merge heap, ordered by its current key
/// (reversed, since the heap is a max-heap).
struct HeadTail {
    key: Vec<u8>,
    chunk_index: usize,
}

impl PartialEq for HeadTail {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for HeadTail {}

impl PartialOrd for HeadTail {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeadTail {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| other.chunk_index.cmp(&self.chunk_index))
    }
}

/// Merges each large partition's sorted chunks into one sorted stream.
pub struct ChunkMerger {
    /// Expected chunk count per partition.
    chunk_counts: HashMap<u64, u64>,
    pending: HashMap<u64, Vec<KvPairBuffer>>,
    token_pool: Option<Arc<WriteTokenPool>>,
    writer: SimpleKvWriter,
    sink_partition: Arc<AtomicU64>,
    sink_job: Arc<AtomicU64>,
    tuples_merged: u64,
}

impl ChunkMerger {
    pub fn new(
        chunk_counts: HashMap<u64, u64>,
        token_pool: Option<Arc<WriteTokenPool>>,
        default_buffer_size: usize,
        alignment: usize,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        let sink_partition = Arc::new(AtomicU64::new(u64::MAX));
        let sink_job = Arc::new(AtomicU64::new(u64::MAX));

        let partition_for_sink = sink_partition.clone();
        let job_for_sink = sink_job.clone();
        let writer = SimpleKvWriter::new(
            0,
            Box::new(move |at_least| {
                KvPairBuffer::new(default_buffer_size.max(at_least), alignment)
            }),
            Box::new(move |mut buffer, _| {
                buffer.logical_disk_id =
                    Some(partition_for_sink.load(Ordering::Relaxed));
                buffer.add_job_id(job_for_sink.load(Ordering::Relaxed));
                downstream.send(buffer)
            }),
        );

        ChunkMerger {
            chunk_counts,
            pending: HashMap::new(),
            token_pool,
            writer,
            sink_partition,
            sink_job,
            tuples_merged: 0,
        }
    }

    /// K-way merges one partition's chunks into the writer.
    fn merge_partition(&mut self, partition: u64, mut chunks: Vec<KvPairBuffer>) -> Result<()> {
        let job_id = chunks[0].sole_job_id();
        self.sink_partition.store(partition, Ordering::Relaxed);
        self.sink_job.store(job_id, Ordering::Relaxed);

        let mut cursors = vec![0usize; chunks.len()];
        let mut heap = QuaternaryHeap::with_capacity(chunks.len());
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            if !chunk.is_empty() {
                heap.push(HeadTail {
                    key: tuple::key(chunk.bytes()).to_vec(),
                    chunk_index,
                });
            }
        }

        while let Some(head) = heap.pop() {
            let chunk_index = head.chunk_index;
            let bytes = chunks[chunk_index].bytes();
            let offset = cursors[chunk_index];
            let tuple_bytes = &bytes[offset..];
            let pair = KeyValuePair::new(tuple::key(tuple_bytes), tuple::value(tuple_bytes));
            self.writer.write(&pair)?;
            self.tuples_merged += 1;

            let next = offset + tuple::framed_size(tuple_bytes);
            cursors[chunk_index] = next;
            if next < bytes.len() {
                heap.push(HeadTail {
                    key: tuple::key(&bytes[next..]).to_vec(),
                    chunk_index,
                });
            }
        }

        // Chunks are consumed: release their read tokens.
        if let Some(pool) = &self.token_pool {
            for chunk in &mut chunks {
                if let Some(token) = chunk.take_token() {
                    pool.put_token(token);
                }
            }
        }

        // One partition per output file; don't let buffers straddle.
        self.writer.flush()
    }
}

impl Worker for ChunkMerger {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "chunk-merger"
    }

    fn process(&mut self, buffer: Self::Input) -> Result<()> {
        let partition = buffer
            .logical_disk_id
            .expect("chunk buffer arrived without a partition tag");
        assert!(
            buffer.chunk_id.is_some(),
            "merger input for partition {} is not a chunk",
            partition
        );

        let expected = *self
            .chunk_counts
            .get(&partition)
            .unwrap_or_else(|| panic!("no chunk count for partition {}", partition));

        let chunks = self.pending.entry(partition).or_default();
        chunks.push(buffer);
        if chunks.len() as u64 == expected {
            let chunks = self.pending.remove(&partition).unwrap();
            self.merge_partition(partition, chunks)?;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        assert!(
            self.pending.is_empty(),
            "{} partitions are missing chunks at teardown",
            self.pending.len()
        );
        log::info!("chunk merger done: {} tuples merged", self.tuples_merged);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;

    fn chunk(partition: u64, chunk_id: u64, keys: &[&[u8]]) -> KvPairBuffer {
        let mut buffer = KvPairBuffer::new(1 << 10, 0);
        for key in keys {
            buffer.add_kv_pair(&KeyValuePair::new(key, b"v"));
        }
        buffer.logical_disk_id = Some(partition);
        buffer.chunk_id = Some(chunk_id);
        buffer.add_job_id(2);
        buffer
    }

    #[test]
    fn test_merges_sorted_chunks() -> Result<()> {
        let (tracker, receiver) = work_queue("writer", 16);
        let mut merger = ChunkMerger::new(
            HashMap::from([(7, 3)]),
            None,
            1 << 12,
            0,
            tracker,
        );

        merger.process(chunk(7, 0, &[b"b", b"f", b"x"]))?;
        merger.process(chunk(7, 1, &[b"a", b"g"]))?;
        assert!(receiver.try_recv().is_err());

        merger.process(chunk(7, 2, &[b"c", b"d", b"z"]))?;
        merger.teardown()?;

        let mut output = receiver.try_recv().unwrap();
        assert_eq!(output.logical_disk_id, Some(7));
        let keys: Vec<Vec<u8>> =
            std::iter::from_fn(|| output.next_kv_pair().map(|pair| pair.key.to_vec())).collect();
        assert_eq!(
            keys,
            vec![
                b"a".to_vec(),
                b"b".to_vec(),
                b"c".to_vec(),
                b"d".to_vec(),
                b"f".to_vec(),
                b"g".to_vec(),
                b"x".to_vec(),
                b"z".to_vec()
            ]
        );
        Ok(())
    }
}
