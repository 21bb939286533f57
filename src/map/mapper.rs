/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The mapper stage.
//!
//! A mapper applies the user map function to every tuple of its input
//! buffers. In the shuffle phase the produced tuples are routed by the
//! partition function into one output buffer per partition group, each
//! tagged with the destination peer; in phase zero the output path is
//! replaced by a reservoir-sampling writer whose sample buffer travels to
//! the coordinator node at teardown.

use crate::buffers::KvPairBuffer;
use crate::map::{
    KvWriter, PartitionFunction, ReservoirSamplingKvWriter, SimpleKvWriter,
};
use crate::stage::{Tracker, Worker};
use crate::tuple::KeyValuePair;
use anyhow::Result;
use std::sync::Arc;

/// A user-supplied map function.
pub trait MapFunction: Send {
    fn map(&self, pair: &KeyValuePair, writer: &mut dyn KvWriter) -> Result<()>;
}

/// Passes every tuple through unchanged; the sort job's map function.
pub struct IdentityMapFunction;

impl MapFunction for IdentityMapFunction {
    fn map(&self, pair: &KeyValuePair, writer: &mut dyn KvWriter) -> Result<()> {
        writer.write(pair)
    }
}

/// The shuffle-phase mapper: map, partition into groups, route to peers.
pub struct Mapper {
    job_id: u64,
    map_function: Box<dyn MapFunction>,
    partition_function: Arc<PartitionFunction>,
    groups_per_node: u64,
    /// One buffered writer per partition group.
    group_writers: Vec<SimpleKvWriter>,
    tuples_in: u64,
    bytes_in: u64,
}

impl Mapper {
    pub fn new(
        job_id: u64,
        map_function: Box<dyn MapFunction>,
        partition_function: Arc<PartitionFunction>,
        num_partition_groups: u64,
        groups_per_node: u64,
        default_buffer_size: usize,
        peer_trackers: Vec<Tracker<KvPairBuffer>>,
    ) -> Self {
        let group_writers = (0..num_partition_groups)
            .map(|group| {
                let trackers = peer_trackers.clone();
                let node = group / groups_per_node;
                SimpleKvWriter::new(
                    group,
                    Box::new(move |at_least| {
                        KvPairBuffer::new(default_buffer_size.max(at_least), 0)
                    }),
                    Box::new(move |mut buffer, group| {
                        buffer.add_job_id(job_id);
                        buffer.partition_group = Some(group);
                        buffer.node = Some(node);
                        trackers[node as usize].send(buffer)
                    }),
                )
            })
            .collect();

        Mapper {
            job_id,
            map_function,
            partition_function,
            groups_per_node,
            group_writers,
            tuples_in: 0,
            bytes_in: 0,
        }
    }

    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    /// Maps every tuple of `buffer` without consuming it.
    pub fn map_buffer(&mut self, buffer: &mut KvPairBuffer) -> Result<()> {
        buffer.reset_iterator();
        let mut router = GroupRouter {
            partition_function: &self.partition_function,
            writers: &mut self.group_writers,
        };
        while let Some(pair) = buffer.next_kv_pair() {
            self.tuples_in += 1;
            self.bytes_in += pair.write_size() as u64;
            self.map_function.map(&pair, &mut router)?;
        }
        Ok(())
    }

    /// Emits every partially filled group buffer.
    pub fn flush(&mut self) -> Result<()> {
        for writer in &mut self.group_writers {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Routes mapped tuples to the writer of their partition group.
struct GroupRouter<'a> {
    partition_function: &'a PartitionFunction,
    writers: &'a mut [SimpleKvWriter],
}

impl KvWriter for GroupRouter<'_> {
    fn write(&mut self, pair: &KeyValuePair) -> Result<()> {
        let group = self.partition_function.global_partition(pair.key);
        self.writers[group as usize].write(pair)
    }
}

impl Worker for Mapper {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "mapper"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        self.map_buffer(&mut buffer)
    }

    fn teardown(&mut self) -> Result<()> {
        self.flush()?;
        let written: u64 = self
            .group_writers
            .iter()
            .map(SimpleKvWriter::tuples_written)
            .sum();
        log::info!(
            "mapper for job {} done: {} tuples in ({} bytes), {} tuples out across {} groups \
             ({} per node)",
            self.job_id,
            self.tuples_in,
            self.bytes_in,
            written,
            self.group_writers.len(),
            self.groups_per_node,
        );
        Ok(())
    }
}

/// The phase-zero mapper: map, then reservoir-sample the output.
pub struct SampleMapper {
    job_id: u64,
    map_function: Box<dyn MapFunction>,
    writer: ReservoirSamplingKvWriter,
    coordinator_node_id: u64,
    downstream: Tracker<KvPairBuffer>,
}

impl SampleMapper {
    pub fn new(
        job_id: u64,
        map_function: Box<dyn MapFunction>,
        sample_capacity: usize,
        sample_seed: u64,
        coordinator_node_id: u64,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        SampleMapper {
            job_id,
            map_function,
            writer: ReservoirSamplingKvWriter::new(sample_capacity, sample_seed),
            coordinator_node_id,
            downstream,
        }
    }
}

impl Worker for SampleMapper {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "sample-mapper"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        self.writer.add_bytes_mapped(buffer.current_size() as u64);
        buffer.reset_iterator();
        while let Some(pair) = buffer.next_kv_pair() {
            self.map_function.map(&pair, &mut self.writer)?;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        let metadata = self.writer.metadata(self.job_id);
        log::info!(
            "sample mapper for job {} done: sampled {} of {} tuples",
            self.job_id,
            metadata.tuples_out,
            metadata.tuples_in
        );
        let mut sample = self.writer.take_sample_buffer(self.job_id);
        sample.node = Some(self.coordinator_node_id);
        self.downstream.send(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;

    #[test]
    fn test_mapper_routes_by_group() -> Result<()> {
        // Four groups over two peers; modulo partitioning.
        let (trackers, receivers): (Vec<_>, Vec<_>) =
            (0..2).map(|i| work_queue(&format!("peer{}", i), 16)).unzip();

        let mut mapper = Mapper::new(
            1,
            Box::new(IdentityMapFunction),
            Arc::new(PartitionFunction::Modulo { num_partitions: 4 }),
            4,
            2,
            1 << 12,
            trackers,
        );

        let mut input = KvPairBuffer::new(1 << 12, 0);
        for i in 0..64u32 {
            input.add_kv_pair(&KeyValuePair::new(&i.to_be_bytes(), b"value"));
        }
        mapper.process(input)?;
        mapper.teardown()?;

        let mut total = 0;
        for (node, receiver) in receivers.iter().enumerate() {
            while let Ok(mut buffer) = receiver.try_recv() {
                assert_eq!(buffer.sole_job_id(), 1);
                assert_eq!(buffer.node, Some(node as u64));
                let group = buffer.partition_group.unwrap();
                assert_eq!(group / 2, node as u64);
                // Every tuple in the buffer belongs to the tagged group.
                while let Some(pair) = buffer.next_kv_pair() {
                    let function = PartitionFunction::Modulo { num_partitions: 4 };
                    assert_eq!(function.global_partition(pair.key), group);
                    total += 1;
                }
            }
        }
        assert_eq!(total, 64);
        Ok(())
    }

    #[test]
    fn test_sample_mapper_emits_one_sample_buffer() -> Result<()> {
        let (tracker, receiver) = work_queue("samples", 4);
        let mut mapper = SampleMapper::new(3, Box::new(IdentityMapFunction), 8, 11, 1, tracker);

        let mut input = KvPairBuffer::new(1 << 12, 0);
        for i in 0..100u32 {
            input.add_kv_pair(&KeyValuePair::new(&i.to_be_bytes(), b"v"));
        }
        mapper.process(input)?;
        mapper.teardown()?;

        let mut sample = receiver.try_recv().unwrap();
        assert_eq!(sample.node, Some(1));
        assert_eq!(sample.sole_job_id(), 3);
        // Metadata plus eight sampled keys.
        assert_eq!(sample.num_tuples(), 9);
        Ok(())
    }
}
