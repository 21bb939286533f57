/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Coalescing chains into single aligned writer buffers.

use crate::buffers::{BufferAligner, KvPairBuffer};
use crate::chain::{Chain, WriteTokenPool};
use crate::stage::{Tracker, Worker};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Concatenates each chain's buffers into one buffer through the
/// per-job [`BufferAligner`], so that every emitted buffer except a
/// partition's last is a multiple of the write size.
///
/// The chain's write token transfers to the coalesced buffer and rides
/// it to the writer. At teardown, any carry-over bytes the aligners
/// still hold are emitted as final, unaligned, token-less buffers.
pub struct Coalescer {
    write_size_multiple: u64,
    alignment: usize,
    downstream: Tracker<KvPairBuffer>,
    aligners: BTreeMap<u64, BufferAligner>,
    /// Partitions seen per job, for the teardown sweep.
    partitions: BTreeMap<u64, BTreeSet<u64>>,
}

impl Coalescer {
    pub fn new(
        write_size_multiple: u64,
        alignment: usize,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        Coalescer {
            write_size_multiple,
            alignment,
            downstream,
            aligners: BTreeMap::new(),
            partitions: BTreeMap::new(),
        }
    }
}

impl Worker for Coalescer {
    type Input = Chain;

    fn stage_name(&self) -> &'static str {
        "coalescer"
    }

    fn process(&mut self, mut chain: Self::Input) -> Result<()> {
        let partition = chain.list.logical_disk_id();
        let job_id = chain.job_id;

        let write_size_multiple = self.write_size_multiple;
        let aligner = self
            .aligners
            .entry(job_id)
            .or_insert_with(|| BufferAligner::new(write_size_multiple));
        self.partitions.entry(job_id).or_default().insert(partition);

        // Room for the whole chain plus any carried-over bytes.
        let size =
            chain.list.total_data_size() + aligner.remaining_bytes(partition);
        let mut output = KvPairBuffer::new(size as usize, self.alignment);
        output.logical_disk_id = Some(partition);
        output.add_job_id(job_id);
        if let Some(token) = chain.token.take() {
            output.set_token(token);
        }

        aligner.prepare(&mut output, partition);
        while let Some(head) = chain.list.remove_head() {
            assert!(
                head.sole_job_id() == job_id,
                "expected all buffers being coalesced to have the same job id"
            );
            output.append(head.bytes());
        }
        aligner.finish(&mut output, partition);

        self.downstream.send(output)
    }

    fn teardown(&mut self) -> Result<()> {
        for (job_id, partitions) in std::mem::take(&mut self.partitions) {
            let aligner = self
                .aligners
                .get_mut(&job_id)
                .expect("no aligner for a job seen by the coalescer");

            for partition in partitions {
                if !aligner.has_remaining_bytes(partition) {
                    continue;
                }
                // The final (unaligned) bytes for this partition.
                let size = aligner.remaining_bytes(partition) as usize;
                let mut output = KvPairBuffer::new(size, self.alignment);
                output.logical_disk_id = Some(partition);
                output.add_job_id(job_id);
                aligner.prepare(&mut output, partition);
                aligner.finish_last_buffer(partition);
                self.downstream.send(output)?;
            }
        }
        self.aligners.clear();
        Ok(())
    }
}

/// A coalescer that discards chain contents and returns tokens; used on
/// benchmark paths that exercise the pipeline without writing.
pub struct SinkCoalescer {
    token_pool: Arc<WriteTokenPool>,
}

impl SinkCoalescer {
    pub fn new(token_pool: Arc<WriteTokenPool>) -> Self {
        SinkCoalescer { token_pool }
    }
}

impl Worker for SinkCoalescer {
    type Input = Chain;

    fn stage_name(&self) -> &'static str {
        "sink-coalescer"
    }

    fn process(&mut self, mut chain: Self::Input) -> Result<()> {
        if let Some(token) = chain.token.take() {
            self.token_pool.put_token(token);
        }
        while chain.list.remove_head().is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::BufferList;
    use crate::stage::work_queue;

    fn chain_of(job_id: u64, partition: u64, sizes: &[usize]) -> Chain {
        let mut list = BufferList::new(partition, 0);
        for (i, &size) in sizes.iter().enumerate() {
            let mut buffer = KvPairBuffer::new(size, 0);
            buffer.append(&vec![i as u8 + 1; size]);
            buffer.logical_disk_id = Some(partition);
            buffer.add_job_id(job_id);
            list.append(buffer);
        }
        Chain {
            job_id,
            list,
            token: None,
        }
    }

    #[test]
    fn test_aligned_coalesce() -> Result<()> {
        let (tracker, receiver) = work_queue("writer", 16);
        let mut coalescer = Coalescer::new(512, 0, tracker);

        // Four chains of sizes 600, 400, 300 and 50 for one partition.
        for &size in &[600, 400, 300, 50] {
            coalescer.process(chain_of(3, 9, &[size]))?;
        }
        coalescer.teardown()?;

        let mut emitted: Vec<KvPairBuffer> = Vec::new();
        while let Ok(buffer) = receiver.try_recv() {
            assert_eq!(buffer.logical_disk_id, Some(9));
            emitted.push(buffer);
        }

        // Every buffer except the final teardown flush is 512-aligned,
        // and the concatenation reproduces the input byte for byte.
        let (last, aligned) = emitted.split_last().unwrap();
        for buffer in aligned {
            assert_eq!(buffer.current_size() % 512, 0);
        }
        let total: usize = emitted.iter().map(KvPairBuffer::current_size).sum();
        assert_eq!(total, 600 + 400 + 300 + 50);

        let mut concatenated = Vec::new();
        for buffer in &emitted {
            concatenated.extend_from_slice(buffer.bytes());
        }
        let mut expected = Vec::new();
        for &size in &[600, 400, 300, 50] {
            expected.extend(std::iter::repeat(1u8).take(size));
        }
        assert_eq!(concatenated, expected);
        assert!(last.current_size() < 512);
        Ok(())
    }

    #[test]
    fn test_chain_concatenation_order() -> Result<()> {
        let (tracker, receiver) = work_queue("writer", 16);
        let mut coalescer = Coalescer::new(4, 0, tracker);

        coalescer.process(chain_of(3, 0, &[4, 8, 4]))?;
        coalescer.teardown()?;

        let buffer = receiver.try_recv().unwrap();
        // 1s then 2s then 3s, in list order.
        let bytes = buffer.bytes();
        assert_eq!(&bytes[..4], &[1, 1, 1, 1]);
        assert_eq!(&bytes[4..12], &[2; 8]);
        assert_eq!(&bytes[12..], &[3, 3, 3, 3]);
        Ok(())
    }

    #[test]
    fn test_sink_coalescer_returns_tokens() -> Result<()> {
        let pool = Arc::new(WriteTokenPool::new(1, 1));
        let token = pool.attempt_get_token(&BTreeSet::from([0])).unwrap();

        let mut sink = SinkCoalescer::new(pool.clone());
        let mut chain = chain_of(1, 0, &[64]);
        chain.token = Some(token);
        sink.process(chain)?;

        assert!(pool.attempt_get_token(&BTreeSet::from([0])).is_some());
        Ok(())
    }
}
