/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Rebuilding the key partitioner from broadcast boundary fragments.

use crate::boundary::KeyPartitioner;
use crate::buffers::KvPairBuffer;
use crate::stage::{Tracker, Worker};
use anyhow::Result;
use std::collections::BTreeMap;

/// Coalesces the boundary fragments broadcast by the decider and builds
/// this node's [`KeyPartitioner`], one per job, at teardown.
pub struct BoundaryDeserializer {
    node_id: u64,
    num_nodes: u64,
    num_partition_groups: u64,
    num_partitions: u64,
    /// Arrival-ordered fragments per job; flow ordering guarantees they
    /// arrive in boundary order.
    fragments: BTreeMap<u64, Vec<KvPairBuffer>>,
    downstream: Tracker<(u64, KeyPartitioner)>,
}

impl BoundaryDeserializer {
    pub fn new(
        node_id: u64,
        num_nodes: u64,
        num_partition_groups: u64,
        num_partitions: u64,
        downstream: Tracker<(u64, KeyPartitioner)>,
    ) -> Self {
        BoundaryDeserializer {
            node_id,
            num_nodes,
            num_partition_groups,
            num_partitions,
            fragments: BTreeMap::new(),
            downstream,
        }
    }
}

impl Worker for BoundaryDeserializer {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "boundary-deserializer"
    }

    fn process(&mut self, buffer: Self::Input) -> Result<()> {
        self.fragments
            .entry(buffer.sole_job_id())
            .or_default()
            .push(buffer);
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        for (job_id, fragments) in std::mem::take(&mut self.fragments) {
            let total: usize = fragments.iter().map(KvPairBuffer::current_size).sum();
            let mut combined = KvPairBuffer::new(total.max(1), 0);
            for fragment in &fragments {
                combined.append(fragment.bytes());
            }

            let partitioner = KeyPartitioner::from_boundary_buffer(
                &mut combined,
                self.node_id,
                self.num_nodes,
                self.num_partition_groups,
                self.num_partitions,
            );
            log::info!(
                "built the boundary partitioner for job {}: {} groups over {} partitions",
                job_id,
                self.num_partition_groups,
                self.num_partitions
            );
            self.downstream.send((job_id, partitioner))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;
    use crate::tuple::KeyValuePair;

    #[test]
    fn test_fragments_coalesce_into_partitioner() -> Result<()> {
        let (tracker, receiver) = work_queue("partitioners", 4);
        let mut deserializer = BoundaryDeserializer::new(0, 2, 4, 8, tracker);

        // The eight boundaries arrive split across three fragments.
        let keys: Vec<&[u8]> = vec![b"a", b"c", b"e", b"g", b"i", b"k", b"m", b"o"];
        for chunk in keys.chunks(3) {
            let mut fragment = KvPairBuffer::new(1 << 8, 0);
            for key in chunk {
                fragment.add_kv_pair(&KeyValuePair::new(key, b""));
            }
            fragment.add_job_id(4);
            deserializer.process(fragment)?;
        }
        deserializer.teardown()?;

        let (job_id, partitioner) = receiver.try_recv().unwrap();
        assert_eq!(job_id, 4);
        assert_eq!(partitioner.num_global_partitions(), 4);
        assert_eq!(partitioner.global_partition(b"f"), 1);
        assert_eq!(partitioner.local_partition(b"d", 1), 2);
        Ok(())
    }
}
