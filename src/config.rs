/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Typed engine configuration.
//!
//! The engine is configured through plain structs; the layer that parses
//! configuration files or command lines into them lives outside the
//! engine. Per-stage knobs (alignment, buffer sizes, I/O depth) override
//! a per-phase default, mirroring the `KEY.phase.stage` convention of
//! the recognized configuration keys.

use crate::convert::FormatReaderKind;
use crate::sort::SortStrategyKind;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// The four phases of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Sample and pick partition boundaries.
    Zero,
    /// Map, shuffle, chain and write partitions.
    One,
    /// Sort and reduce each partition.
    Two,
    /// Merge the chunks of large partitions.
    Three,
}

/// Per-stage I/O settings.
#[derive(Debug, Clone, Copy)]
pub struct StageSettings {
    pub alignment: usize,
    pub direct_io: bool,
    pub default_buffer_size: usize,
    pub asynchronous_io_depth: usize,
    pub disks_per_worker: u64,
    pub num_workers: u64,
}

impl Default for StageSettings {
    fn default() -> Self {
        StageSettings {
            alignment: 0,
            direct_io: false,
            default_buffer_size: 4 << 20,
            asynchronous_io_depth: 4,
            disks_per_worker: 1,
            num_workers: 1,
        }
    }
}

/// Per-phase settings, with per-stage overrides.
#[derive(Debug, Clone)]
pub struct PhaseSettings {
    pub max_read_size: usize,
    pub max_write_size: usize,
    pub write_size_multiple: u64,
    pub delete_after_read: bool,
    pub format_reader: Option<FormatReaderKind>,
    pub default_stage: StageSettings,
    pub stage_overrides: HashMap<&'static str, StageSettings>,
}

impl Default for PhaseSettings {
    fn default() -> Self {
        PhaseSettings {
            max_read_size: 4 << 20,
            max_write_size: 4 << 20,
            write_size_multiple: 512,
            delete_after_read: false,
            format_reader: Some(FormatReaderKind::KvPair),
            default_stage: StageSettings::default(),
            stage_overrides: HashMap::new(),
        }
    }
}

impl PhaseSettings {
    /// The settings of a stage, falling back to the phase default.
    pub fn stage(&self, stage: &str) -> StageSettings {
        self.stage_overrides
            .get(stage)
            .copied()
            .unwrap_or(self.default_stage)
    }
}

/// The cluster as one node sees it.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub num_peers: u64,
    pub my_peer_id: u64,
    pub my_ip_address: String,
    /// Shuffle addresses, one per peer.
    pub peers: Vec<String>,
    /// The node that runs the boundary decider.
    pub merge_node_id: u64,
    pub num_partitions: u64,
    pub num_partition_groups: u64,
    pub input_disks: Vec<PathBuf>,
    pub output_disks: Vec<PathBuf>,
}

impl ClusterConfig {
    /// A one-node cluster over loopback.
    pub fn single_node(
        input_disks: Vec<PathBuf>,
        output_disks: Vec<PathBuf>,
        num_partitions: u64,
        num_partition_groups: u64,
    ) -> Self {
        ClusterConfig {
            num_peers: 1,
            my_peer_id: 0,
            my_ip_address: "127.0.0.1".into(),
            peers: vec!["127.0.0.1:0".into()],
            merge_node_id: 0,
            num_partitions,
            num_partition_groups,
            input_disks,
            output_disks,
        }
    }

    pub fn partitions_per_node(&self) -> u64 {
        self.num_partitions / self.num_peers
    }

    pub fn partitions_per_group(&self) -> u64 {
        self.num_partitions / self.num_partition_groups
    }

    pub fn groups_per_node(&self) -> u64 {
        self.num_partition_groups / self.num_peers
    }

    pub fn partitions_per_disk(&self) -> u64 {
        self.partitions_per_node() / self.output_disks.len() as u64
    }

    pub fn first_local_partition(&self) -> u64 {
        self.my_peer_id * self.partitions_per_node()
    }
}

/// Everything the engine needs to run a job on one node.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub cluster: ClusterConfig,
    pub phases: HashMap<Phase, PhaseSettings>,

    pub sort_strategy: SortStrategyKind,
    pub use_secondary_keys: bool,
    pub max_radix_sort_scratch_size: u64,

    pub chainer_emission_lower_bound: u64,
    pub chainer_emission_upper_bound: u64,
    pub write_tokens_per_disk: u64,

    pub flows_per_peer: u64,
    pub send_socket_syscall_size: usize,
    pub select_sender_get_more_data_timeout: Duration,

    pub output_replication_level: u64,
    pub file_preallocation: bool,
    pub partition_size: u64,
    pub large_partition_threshold: u64,

    /// Use the POSIX-AIO reader and writer instead of the blocking ones.
    pub asynchronous_io: bool,

    /// Reservoir size of the phase-zero sample.
    pub sample_capacity: usize,

    /// Byte budget of the shared allocator.
    pub memory_quota: u64,
}

impl EngineConfig {
    pub fn new(cluster: ClusterConfig) -> Self {
        let mut phases: HashMap<Phase, PhaseSettings> =
            [Phase::Zero, Phase::One, Phase::Two, Phase::Three]
                .into_iter()
                .map(|phase| (phase, PhaseSettings::default()))
                .collect();

        // Sorting is the compute-bound stage; give it a pool by default.
        let sorter_settings = StageSettings {
            num_workers: (num_cpus::get() as u64 / 2).clamp(1, 8),
            ..StageSettings::default()
        };
        phases
            .get_mut(&Phase::Two)
            .unwrap()
            .stage_overrides
            .insert("sorter", sorter_settings);

        EngineConfig {
            cluster,
            phases,
            sort_strategy: SortStrategyKind::Any,
            use_secondary_keys: false,
            max_radix_sort_scratch_size: 2 << 30,
            chainer_emission_lower_bound: 4 << 20,
            chainer_emission_upper_bound: 14 << 20,
            write_tokens_per_disk: 2,
            flows_per_peer: 2,
            send_socket_syscall_size: 1 << 20,
            select_sender_get_more_data_timeout: Duration::from_millis(5),
            output_replication_level: 1,
            file_preallocation: false,
            partition_size: 0,
            large_partition_threshold: 0,
            asynchronous_io: false,
            sample_capacity: 1 << 16,
            memory_quota: 8 << 30,
        }
    }

    pub fn phase(&self, phase: Phase) -> &PhaseSettings {
        &self.phases[&phase]
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseSettings {
        self.phases.get_mut(&phase).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_overrides() {
        let cluster = ClusterConfig::single_node(vec![], vec![], 16, 4);
        let mut config = EngineConfig::new(cluster);

        let writer_settings = StageSettings {
            alignment: 512,
            direct_io: true,
            ..StageSettings::default()
        };
        config
            .phase_mut(Phase::One)
            .stage_overrides
            .insert("writer", writer_settings);

        let phase = config.phase(Phase::One);
        assert_eq!(phase.stage("writer").alignment, 512);
        assert!(phase.stage("writer").direct_io);
        assert_eq!(phase.stage("reader").alignment, 0);
    }

    #[test]
    fn test_cluster_arithmetic() {
        let cluster = ClusterConfig {
            num_peers: 2,
            my_peer_id: 1,
            my_ip_address: "10.0.0.2".into(),
            peers: vec!["10.0.0.1:9090".into(), "10.0.0.2:9090".into()],
            merge_node_id: 0,
            num_partitions: 16,
            num_partition_groups: 8,
            input_disks: vec![],
            output_disks: vec![PathBuf::from("/d0"), PathBuf::from("/d1")],
        };
        assert_eq!(cluster.partitions_per_node(), 8);
        assert_eq!(cluster.partitions_per_group(), 2);
        assert_eq!(cluster.groups_per_node(), 4);
        assert_eq!(cluster.partitions_per_disk(), 4);
        assert_eq!(cluster.first_local_partition(), 8);
    }
}
