/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The global-then-local boundary key partitioner.

use crate::boundary::KeyList;
use crate::buffers::KvPairBuffer;
use anyhow::{Context, Result};
use std::io::{Read, Write};

/// Production partitioning from a broadcast boundary list.
///
/// The *global* key list holds the first boundary key of every partition
/// group and maps a key to its group; one *local* key list per group owned
/// by this node maps a key to a partition within the group. Nodes only
/// keep local lists for their own partition groups, so
/// [`local_partition`](Self::local_partition) takes a node-relative group
/// index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPartitioner {
    global: KeyList,
    local: Vec<KeyList>,
}

impl KeyPartitioner {
    /// Builds a partitioner from the broadcast boundary buffer, which
    /// holds one tuple per partition in partition order.
    pub fn from_boundary_buffer(
        boundary_buffer: &mut KvPairBuffer,
        local_node_id: u64,
        num_nodes: u64,
        num_partition_groups: u64,
        num_partitions: u64,
    ) -> Self {
        let partitions_per_group = num_partitions / num_partition_groups;
        let partitions_per_node = num_partitions / num_nodes;

        // First pass sizes the key lists.
        let start_position = boundary_buffer.iterator_position();
        let mut global_bytes = 0u64;
        let mut local_bytes = 0u64;
        let mut local_list_sizes = Vec::new();
        let mut partition = 0u64;
        while let Some(pair) = boundary_buffer.next_kv_pair() {
            if partition % partitions_per_group == 0 {
                global_bytes += pair.key.len() as u64;
            }
            if partition / partitions_per_node == local_node_id {
                local_bytes += pair.key.len() as u64;
                if partition % partitions_per_group == partitions_per_group - 1 {
                    let first_partition = partition - (partitions_per_group - 1);
                    local_list_sizes.push((local_bytes, first_partition));
                    local_bytes = 0;
                }
            }
            partition += 1;
        }
        assert!(
            partition == num_partitions,
            "boundary buffer has {} partitions, but we are expecting {}",
            partition,
            num_partitions
        );

        let mut global = KeyList::new(num_partition_groups, global_bytes, 0);
        let mut local: Vec<KeyList> = local_list_sizes
            .iter()
            .map(|&(bytes, first_partition)| {
                KeyList::new(partitions_per_group, bytes, first_partition)
            })
            .collect();

        // Second pass assigns the keys.
        boundary_buffer.set_iterator_position(start_position);
        let mut partition = 0u64;
        let mut local_index = 0;
        while let Some(pair) = boundary_buffer.next_kv_pair() {
            if partition % partitions_per_group == 0 {
                global.add_key(pair.key);
            }
            if partition / partitions_per_node == local_node_id {
                local[local_index].add_key(pair.key);
                if partition % partitions_per_group == partitions_per_group - 1 {
                    local_index += 1;
                }
            }
            partition += 1;
        }

        KeyPartitioner { global, local }
    }

    /// The partition group a key belongs to.
    pub fn global_partition(&self, key: &[u8]) -> u64 {
        self.global.find_lower_bound(key)
    }

    /// The partition a key belongs to within one of this node's partition
    /// groups. The group index is node-relative.
    pub fn local_partition(&self, key: &[u8], partition_group: u64) -> u64 {
        assert!(
            (partition_group as usize) < self.local.len(),
            "tried to compute a local partition for group {}, but this node only has {} groups",
            partition_group,
            self.local.len()
        );
        self.local[partition_group as usize].find_lower_bound(key)
    }

    pub fn num_global_partitions(&self) -> u64 {
        self.global.num_keys()
    }

    /// Serializes as `u64 numLocalKeyLists` (big-endian) followed by the
    /// global key list and each local key list.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer
            .write_all(&(self.local.len() as u64).to_be_bytes())
            .context("could not write local key list count")?;
        self.global.write_to(writer)?;
        for list in &self.local {
            list.write_to(writer)?;
        }
        Ok(())
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut u64_bytes = [0u8; 8];
        reader
            .read_exact(&mut u64_bytes)
            .context("could not read local key list count")?;
        let num_local = u64::from_be_bytes(u64_bytes);

        let global = KeyList::read_from(reader)?;
        let local = (0..num_local)
            .map(|_| KeyList::read_from(reader))
            .collect::<Result<Vec<_>>>()?;
        Ok(KeyPartitioner { global, local })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::KeyValuePair;

    /// Eight partitions, four groups, two nodes; boundary keys one byte
    /// apart.
    fn boundary_buffer() -> KvPairBuffer {
        let mut buffer = KvPairBuffer::new(1 << 10, 0);
        for key in [b"a", b"c", b"e", b"g", b"i", b"k", b"m", b"o"] {
            buffer.add_kv_pair(&KeyValuePair::new(&key[..], b""));
        }
        buffer
    }

    #[test]
    fn test_global_and_local_partitioning() {
        let mut buffer = boundary_buffer();
        let partitioner = KeyPartitioner::from_boundary_buffer(&mut buffer, 0, 2, 4, 8);

        // Groups cover [a,c) [e,g) [i,k) [m,o].
        assert_eq!(partitioner.num_global_partitions(), 4);
        assert_eq!(partitioner.global_partition(b"a"), 0);
        assert_eq!(partitioner.global_partition(b"d"), 0);
        assert_eq!(partitioner.global_partition(b"e"), 1);
        assert_eq!(partitioner.global_partition(b"z"), 3);

        // Node 0 owns partitions 0..4, i.e. groups 0 and 1.
        assert_eq!(partitioner.local_partition(b"a", 0), 0);
        assert_eq!(partitioner.local_partition(b"c", 0), 1);
        assert_eq!(partitioner.local_partition(b"e", 1), 2);
        assert_eq!(partitioner.local_partition(b"h", 1), 3);
    }

    #[test]
    fn test_second_node_offsets() {
        let mut buffer = boundary_buffer();
        let partitioner = KeyPartitioner::from_boundary_buffer(&mut buffer, 1, 2, 4, 8);

        // Node 1 owns partitions 4..8; its local lists carry the global
        // partition offsets.
        assert_eq!(partitioner.local_partition(b"i", 0), 4);
        assert_eq!(partitioner.local_partition(b"l", 0), 5);
        assert_eq!(partitioner.local_partition(b"m", 1), 6);
        assert_eq!(partitioner.local_partition(b"zebra", 1), 7);
    }

    #[test]
    fn test_file_round_trip() -> Result<()> {
        let mut buffer = boundary_buffer();
        let partitioner = KeyPartitioner::from_boundary_buffer(&mut buffer, 0, 2, 4, 8);

        let mut serialized = Vec::new();
        partitioner.write_to(&mut serialized)?;
        let read_back = KeyPartitioner::read_from(&mut serialized.as_slice())?;
        assert_eq!(partitioner, read_back);
        Ok(())
    }
}
