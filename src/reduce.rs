/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The reducer stage.
//!
//! Input buffers hold the sorted tuples of one partition, so tuples with
//! equal keys form contiguous runs. The reducer walks the runs and
//! invokes the user reduce function once per distinct key with an
//! iterator over that key's values and a writer for its output. Output
//! buffers carry the partition id forward; with replication above one,
//! each output buffer is duplicated and the replicas are routed to a
//! second downstream with a derived destination node.

use crate::buffers::KvPairBuffer;
use crate::map::{KvWriter, SimpleKvWriter};
use crate::stage::{Tracker, Worker};
use crate::tuple;
use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Iterates the values of one key's run within a sorted buffer.
pub struct ValueIterator<'a> {
    bytes: &'a [u8],
    offset: usize,
    key: &'a [u8],
}

impl<'a> ValueIterator<'a> {
    fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for ValueIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.offset >= self.bytes.len() {
            return None;
        }
        let tuple_bytes = &self.bytes[self.offset..];
        if tuple::key(tuple_bytes) != self.key {
            return None;
        }
        self.offset += tuple::framed_size(tuple_bytes);
        Some(tuple::value(tuple_bytes))
    }
}

/// A user-supplied reduce function.
pub trait ReduceFunction: Send {
    fn reduce(
        &self,
        key: &[u8],
        values: &mut ValueIterator,
        writer: &mut dyn KvWriter,
    ) -> Result<()>;
}

/// Re-emits every `(key, value)` pair unchanged; the sort job's reduce
/// function.
pub struct IdentityReduceFunction;

impl ReduceFunction for IdentityReduceFunction {
    fn reduce(
        &self,
        key: &[u8],
        values: &mut ValueIterator,
        writer: &mut dyn KvWriter,
    ) -> Result<()> {
        for value in values {
            writer.write(&tuple::KeyValuePair::new(key, value))?;
        }
        Ok(())
    }
}

/// Routing parameters for replicated output.
#[derive(Debug, Clone)]
pub struct ReplicationPolicy {
    pub replication_level: u64,
    pub num_nodes: u64,
    pub first_local_partition: u64,
}

impl ReplicationPolicy {
    /// The destination node offset of replica `i` (1-based) of a
    /// partition's output. Placement is policy; this default spreads
    /// replicas round-robin over the other nodes.
    pub fn replica_node(&self, partition: u64, replica: u64) -> u64 {
        (partition - self.first_local_partition) % (self.num_nodes - 1) + (replica - 1)
    }
}

/// The reducer worker.
pub struct Reducer {
    reduce_function: Box<dyn ReduceFunction>,
    writer: SimpleKvWriter,
    current_partition: Arc<AtomicU64>,
    job_id: Option<u64>,
    job_for_sink: Arc<AtomicU64>,
    bytes_in: u64,
    bytes_out: Arc<AtomicU64>,
}

impl Reducer {
    pub fn new(
        reduce_function: Box<dyn ReduceFunction>,
        default_buffer_size: usize,
        alignment: usize,
        replication: Option<(ReplicationPolicy, Tracker<KvPairBuffer>)>,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        let current_partition = Arc::new(AtomicU64::new(u64::MAX));
        let job_for_sink = Arc::new(AtomicU64::new(u64::MAX));
        let bytes_out = Arc::new(AtomicU64::new(0));

        let sink_partition = current_partition.clone();
        let sink_job = job_for_sink.clone();
        let sink_bytes = bytes_out.clone();
        let writer = SimpleKvWriter::new(
            0,
            Box::new(move |at_least| {
                KvPairBuffer::new(default_buffer_size.max(at_least), alignment)
            }),
            Box::new(move |mut buffer, _| {
                let partition = sink_partition.load(Ordering::Relaxed);
                let job_id = sink_job.load(Ordering::Relaxed);
                assert!(
                    partition != u64::MAX && job_id != u64::MAX,
                    "reducer emitted a buffer before seeing any input"
                );
                buffer.logical_disk_id = Some(partition);
                buffer.add_job_id(job_id);
                sink_bytes.fetch_add(buffer.current_size() as u64, Ordering::Relaxed);

                if let Some((policy, replica_tracker)) = &replication {
                    for replica in 1..policy.replication_level {
                        let mut copy = KvPairBuffer::new(buffer.current_size().max(1), 0);
                        copy.append(buffer.bytes());
                        copy.logical_disk_id = Some(partition);
                        copy.add_job_id(job_id);
                        copy.node = Some(policy.replica_node(partition, replica));
                        replica_tracker.send(copy)?;
                    }
                }
                downstream.send(buffer)
            }),
        );

        Reducer {
            reduce_function,
            writer,
            current_partition,
            job_id: None,
            job_for_sink,
            bytes_in: 0,
            bytes_out,
        }
    }
}

impl Worker for Reducer {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "reducer"
    }

    fn process(&mut self, buffer: Self::Input) -> Result<()> {
        let job_id = buffer.sole_job_id();
        match self.job_id {
            None => {
                self.job_id = Some(job_id);
                self.job_for_sink.store(job_id, Ordering::Relaxed);
            }
            Some(existing) => assert!(
                existing == job_id,
                "expected all buffers entering this reducer to have job {}, got {}",
                existing,
                job_id
            ),
        }

        self.bytes_in += buffer.current_size() as u64;
        if buffer.is_empty() {
            return Ok(());
        }

        let partition = buffer
            .logical_disk_id
            .expect("reducer buffer arrived without a partition tag");
        self.current_partition.store(partition, Ordering::Relaxed);

        let bytes = buffer.bytes();
        let mut offset = 0;
        while offset < bytes.len() {
            let key = tuple::key(&bytes[offset..]);
            let mut values = ValueIterator {
                bytes,
                offset,
                key,
            };
            self.reduce_function
                .reduce(key, &mut values, &mut self.writer)?;
            // Skip whatever the reduce function did not consume.
            while values.next().is_some() {}
            offset = values.offset();
        }

        // Flush per partition so output buffers don't straddle
        // partitions.
        self.writer.flush()
    }

    fn teardown(&mut self) -> Result<()> {
        self.writer.flush()?;
        log::info!(
            "reducer done: {} bytes in, {} bytes out",
            self.bytes_in,
            self.bytes_out.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;
    use crate::tuple::KeyValuePair;

    /// Sums little-endian u32 values per key.
    struct SumReduceFunction;

    impl ReduceFunction for SumReduceFunction {
        fn reduce(
            &self,
            key: &[u8],
            values: &mut ValueIterator,
            writer: &mut dyn KvWriter,
        ) -> Result<()> {
            let mut sum = 0u32;
            for value in values {
                sum += u32::from_le_bytes(value.try_into().unwrap());
            }
            writer.write(&KeyValuePair::new(key, &sum.to_le_bytes()))
        }
    }

    fn sorted_partition_buffer(partition: u64) -> KvPairBuffer {
        let mut buffer = KvPairBuffer::new(1 << 12, 0);
        for (key, value) in [
            (&b"apple"[..], 1u32),
            (b"apple", 2),
            (b"apple", 4),
            (b"pear", 10),
            (b"plum", 20),
            (b"plum", 22),
        ] {
            buffer.add_kv_pair(&KeyValuePair::new(key, &value.to_le_bytes()));
        }
        buffer.logical_disk_id = Some(partition);
        buffer.add_job_id(6);
        buffer
    }

    #[test]
    fn test_groups_by_key() -> Result<()> {
        let (tracker, receiver) = work_queue("writer", 16);
        let mut reducer = Reducer::new(Box::new(SumReduceFunction), 1 << 12, 0, None, tracker);

        reducer.process(sorted_partition_buffer(3))?;
        reducer.teardown()?;

        let mut output = receiver.try_recv().unwrap();
        assert_eq!(output.logical_disk_id, Some(3));
        assert_eq!(output.sole_job_id(), 6);

        let mut groups = Vec::new();
        while let Some(pair) = output.next_kv_pair() {
            groups.push((
                pair.key.to_vec(),
                u32::from_le_bytes(pair.value.try_into().unwrap()),
            ));
        }
        assert_eq!(
            groups,
            vec![
                (b"apple".to_vec(), 7),
                (b"pear".to_vec(), 10),
                (b"plum".to_vec(), 42)
            ]
        );
        Ok(())
    }

    #[test]
    fn test_replicas_route_to_second_tracker() -> Result<()> {
        let (primary_tracker, primary_queue) = work_queue("writer", 16);
        let (replica_tracker, replica_queue) = work_queue("replica-sender", 16);

        let policy = ReplicationPolicy {
            replication_level: 2,
            num_nodes: 3,
            first_local_partition: 2,
        };
        let mut reducer = Reducer::new(
            Box::new(IdentityReduceFunction),
            1 << 12,
            0,
            Some((policy, replica_tracker)),
            primary_tracker,
        );

        reducer.process(sorted_partition_buffer(3))?;
        reducer.teardown()?;

        let primary = primary_queue.try_recv().unwrap();
        let replica = replica_queue.try_recv().unwrap();
        assert_eq!(replica.bytes(), primary.bytes());
        // (3 - 2) % (3 - 1) + 0 = 1.
        assert_eq!(replica.node, Some(1));
        Ok(())
    }
}
