/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The chainer's two-dimensional table of buffer lists.

use crate::buffers::{BufferList, KvPairBuffer};
use std::collections::BTreeSet;

/// A per-chainer map `[physical disk][logical disk] → BufferList`, with a
/// cached largest-list pointer per physical disk.
///
/// The cache is updated on [`insert`](Self::insert) and must be refreshed
/// with [`update_largest_list`](Self::update_largest_list) after a drain
/// changed list sizes behind its back.
#[derive(Debug)]
pub struct BufferTable {
    /// The lowest-numbered physical disk this table serves; used to split
    /// tables among groups of disks.
    base_physical_disk_id: u64,
    num_physical_disks: u64,
    partitions_per_disk: u64,
    /// Intermediate disks per node, used to map partitions to local disks.
    num_node_disks: u64,
    /// Outer index: local physical disk. Inner index: partition on that
    /// disk.
    lists: Vec<Vec<BufferList>>,
    /// Index into `lists[disk]` of the largest list for that disk.
    largest: Vec<Option<usize>>,
}

impl BufferTable {
    pub fn new(
        base_physical_disk_id: u64,
        num_physical_disks: u64,
        node_id: u64,
        partitions_per_disk: u64,
        num_node_disks: u64,
    ) -> Self {
        // The first partition of the first disk this table owns.
        let mut partition =
            (node_id * num_node_disks + base_physical_disk_id) * partitions_per_disk;

        let mut lists = Vec::with_capacity(num_physical_disks as usize);
        for disk in 0..num_physical_disks {
            let mut disk_lists = Vec::with_capacity(partitions_per_disk as usize);
            for _ in 0..partitions_per_disk {
                disk_lists.push(BufferList::new(partition, base_physical_disk_id + disk));
                partition += 1;
            }
            lists.push(disk_lists);
        }

        BufferTable {
            base_physical_disk_id,
            num_physical_disks,
            partitions_per_disk,
            num_node_disks,
            lists,
            largest: vec![None; num_physical_disks as usize],
        }
    }

    /// The total number of buffers across all the table's lists.
    pub fn total_buffers(&self) -> u64 {
        self.lists
            .iter()
            .flatten()
            .map(|list| list.len() as u64)
            .sum()
    }

    /// Total payload bytes across all the table's lists.
    pub fn total_data_size(&self) -> u64 {
        self.lists
            .iter()
            .flatten()
            .map(BufferList::total_data_size)
            .sum()
    }

    /// Inserts a buffer into the list its partition tag selects.
    pub fn insert(&mut self, buffer: KvPairBuffer) {
        let partition = buffer
            .logical_disk_id
            .expect("buffer reached the chainer without a partition tag");

        let node_disk = (partition / self.partitions_per_disk) % self.num_node_disks;
        assert!(
            node_disk >= self.base_physical_disk_id,
            "partition {} maps to disk {}, below this table's base disk {}",
            partition,
            node_disk,
            self.base_physical_disk_id
        );
        let local_disk = self.local_disk_index(node_disk - self.base_physical_disk_id);
        let slot = (partition % self.partitions_per_disk) as usize;

        let list = &mut self.lists[local_disk][slot];
        list.append(buffer);
        let list_size = list.total_data_size();

        let largest = &mut self.largest[local_disk];
        let current_best = largest.map_or(0, |i| self.lists[local_disk][i].total_data_size());
        if largest.is_none() || list_size > current_best {
            *largest = Some(slot);
        }
    }

    /// Recomputes the cached largest list for one physical disk.
    pub fn update_largest_list(&mut self, physical_disk_id: u64) {
        let local_disk = self.local_disk_index(physical_disk_id - self.base_physical_disk_id);
        self.largest[local_disk] = self.lists[local_disk]
            .iter()
            .enumerate()
            .filter(|(_, list)| list.total_data_size() > 0)
            .max_by_key(|(_, list)| list.total_data_size())
            .map(|(i, _)| i);
    }

    /// The largest list for one physical disk, per the cache.
    pub fn largest_list_for_disk(&mut self, physical_disk_id: u64) -> Option<&mut BufferList> {
        let local_disk = self.local_disk_index(physical_disk_id - self.base_physical_disk_id);
        let slot = self.largest[local_disk]?;
        Some(&mut self.lists[local_disk][slot])
    }

    /// Collects the physical disks whose largest list holds at least
    /// `minimum_size` bytes.
    pub fn disks_with_lists_above(&self, minimum_size: u64, disk_set: &mut BTreeSet<u64>) {
        for (local_disk, largest) in self.largest.iter().enumerate() {
            if let Some(slot) = largest {
                let list = &self.lists[local_disk][*slot];
                if list.total_data_size() >= minimum_size && list.total_data_size() > 0 {
                    disk_set.insert(self.base_physical_disk_id + local_disk as u64);
                }
            }
        }
    }

    fn local_disk_index(&self, local_disk: u64) -> usize {
        assert!(
            local_disk < self.num_physical_disks,
            "physical disk {} is outside this table's {} disks",
            local_disk,
            self.num_physical_disks
        );
        local_disk as usize
    }
}
