/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Demultiplexing received buffers into per-partition chains.

use crate::buffers::KvPairBuffer;
use crate::map::{PartialKvWriter, PartitionFunction};
use crate::stage::{Tracker, Worker};
use anyhow::Result;
use std::sync::Arc;

/// Splits shuffled tuples into one small buffer per partition.
///
/// Each demux worker is pinned to one node-relative partition group; the
/// receiver routes buffers by their partition-group tag. Tuples are
/// pushed through a [`PartialKvWriter`], so the emitted per-partition
/// buffers may begin or end mid-tuple; everything downstream of the demux
/// (chainer, coalescer, writer) treats them as raw bytes.
pub struct TupleDemux {
    partition_function: Arc<PartitionFunction>,
    /// Node-relative group this worker serves.
    partition_group: u64,
    /// Global partition id of the group's first partition.
    partition_offset: u64,
    writer: PartialKvWriter,
    tuples_in: u64,
}

impl TupleDemux {
    pub fn new(
        job_id: u64,
        partition_function: Arc<PartitionFunction>,
        partition_group: u64,
        partition_offset: u64,
        partitions_per_group: u64,
        default_buffer_size: usize,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        let writer = PartialKvWriter::new(
            partitions_per_group,
            Box::new(move |at_least| KvPairBuffer::new(default_buffer_size.max(at_least), 0)),
            Box::new(move |mut buffer, partition| {
                buffer.add_job_id(job_id);
                buffer.logical_disk_id = Some(partition_offset + partition);
                downstream.send(buffer)
            }),
        );

        TupleDemux {
            partition_function,
            partition_group,
            partition_offset,
            writer,
            tuples_in: 0,
        }
    }
}

impl Worker for TupleDemux {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "demux"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        assert!(
            buffer.partition_group == Some(self.partition_group),
            "demux for group {} got a buffer for group {:?}",
            self.partition_group,
            buffer.partition_group
        );

        buffer.reset_iterator();
        while let Some(pair) = buffer.next_kv_pair() {
            let partition = self
                .partition_function
                .local_partition(pair.key, self.partition_group);
            // The local partition is a global id; the writer indexes
            // partitions within the group.
            self.writer
                .write_to_partition(partition - self.partition_offset, &pair)?;
            self.tuples_in += 1;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        self.writer.flush()?;
        log::info!(
            "demux for group {} done: {} tuples, {} bytes",
            self.partition_group,
            self.tuples_in,
            self.writer.bytes_written()
        );
        Ok(())
    }
}
