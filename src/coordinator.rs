/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The coordinator seen from inside the engine.
//!
//! The coordinator itself is an external service; the engine only
//! depends on the [`Coordinator`] capability, which supplies read
//! requests, job metadata, partition counts, output locations and
//! cluster-wide sample statistics, and receives failure notifications.
//! The [`DebugCoordinator`] serves single-node runs and tests by
//! answering everything from the local filesystem and configuration.

use crate::read::ReadRequest;
use anyhow::Result;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;

/// Metadata of one job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub job_id: u64,
    pub map_function: String,
    pub reduce_function: String,
    pub partition_function: String,
    pub total_input_size: u64,
    pub num_partitions: u64,
}

/// The cluster coordinator, as the worker stages see it.
pub trait Coordinator: Send + Sync {
    /// Blocks until a read request is available for the given disk, or
    /// returns [`None`] when there is nothing left to read.
    fn next_read_request(&self, disk_id: u64) -> Result<Option<ReadRequest>>;

    fn job_info(&self, job_id: u64) -> Result<JobInfo>;

    /// The per-job directory component writers append to each output
    /// disk.
    fn output_directory(&self, job_id: u64) -> Result<PathBuf>;

    /// Publishes the partition count chosen by the coordinator node.
    fn set_num_partitions(&self, job_id: u64, num_partitions: u64) -> Result<()>;

    /// Waits until the partition count for a job is known.
    fn num_partitions(&self, job_id: u64) -> Result<u64>;

    /// Publishes this node's sampled input/intermediate byte counts.
    fn upload_sample_statistics(
        &self,
        job_id: u64,
        input_bytes: u64,
        intermediate_bytes: u64,
    ) -> Result<()>;

    /// Sums the sample statistics of all nodes; blocks until every node
    /// has uploaded.
    fn sample_statistics_sums(&self, job_id: u64, num_nodes: u64) -> Result<(u64, u64)>;

    fn notify_node_failure(&self, peer_ip_address: &str) -> Result<()>;

    fn notify_disk_failure(&self, peer_ip_address: &str, disk_path: &str) -> Result<()>;

    /// Blocks until every node in the cluster reaches the named barrier.
    fn wait_on_barrier(&self, barrier_name: &str) -> Result<()>;
}

/// A local, single-node coordinator for debugging and tests.
///
/// Read requests are drawn from a pre-computed per-disk file list; jobs,
/// partition counts and sample statistics live in process memory;
/// failure notifications abort, since there is no cluster to fall back
/// on.
pub struct DebugCoordinator {
    num_partitions: Mutex<u64>,
    output_directory: PathBuf,
    requests: Mutex<VecDeque<ReadRequest>>,
    sample_statistics: Mutex<(u64, u64)>,
    job: JobInfo,
}

impl DebugCoordinator {
    pub fn new(
        job: JobInfo,
        output_directory: PathBuf,
        requests: impl IntoIterator<Item = ReadRequest>,
    ) -> Self {
        DebugCoordinator {
            num_partitions: Mutex::new(job.num_partitions),
            output_directory,
            requests: Mutex::new(requests.into_iter().collect()),
            sample_statistics: Mutex::new((0, 0)),
            job,
        }
    }

    /// Builds the read-request list by walking a job's input directory.
    pub fn scan_input_directory(
        job_id: u64,
        input_directory: &std::path::Path,
        disk_id: u64,
    ) -> Result<Vec<ReadRequest>> {
        let mut requests = Vec::new();
        let mut paths: Vec<PathBuf> = std::fs::read_dir(input_directory)?
            .map(|entry| Ok(entry?.path()))
            .collect::<Result<_>>()?;
        paths.sort();
        for path in paths {
            if !path.is_file() {
                continue;
            }
            let length = path.metadata()?.len();
            requests.push(ReadRequest::local_file(path, [job_id], length, disk_id));
        }
        Ok(requests)
    }
}

impl Coordinator for DebugCoordinator {
    fn next_read_request(&self, _disk_id: u64) -> Result<Option<ReadRequest>> {
        Ok(self.requests.lock().unwrap().pop_front())
    }

    fn job_info(&self, job_id: u64) -> Result<JobInfo> {
        anyhow::ensure!(
            job_id == self.job.job_id,
            "debug coordinator only knows job {}",
            self.job.job_id
        );
        Ok(self.job.clone())
    }

    fn output_directory(&self, _job_id: u64) -> Result<PathBuf> {
        Ok(self.output_directory.clone())
    }

    fn set_num_partitions(&self, _job_id: u64, num_partitions: u64) -> Result<()> {
        *self.num_partitions.lock().unwrap() = num_partitions;
        Ok(())
    }

    fn num_partitions(&self, _job_id: u64) -> Result<u64> {
        Ok(*self.num_partitions.lock().unwrap())
    }

    fn upload_sample_statistics(
        &self,
        _job_id: u64,
        input_bytes: u64,
        intermediate_bytes: u64,
    ) -> Result<()> {
        let mut sums = self.sample_statistics.lock().unwrap();
        sums.0 += input_bytes;
        sums.1 += intermediate_bytes;
        Ok(())
    }

    fn sample_statistics_sums(&self, _job_id: u64, _num_nodes: u64) -> Result<(u64, u64)> {
        Ok(*self.sample_statistics.lock().unwrap())
    }

    fn notify_node_failure(&self, peer_ip_address: &str) -> Result<()> {
        // There is no cluster to survive on in debug mode.
        panic!("node failure reported for {}", peer_ip_address);
    }

    fn notify_disk_failure(&self, peer_ip_address: &str, disk_path: &str) -> Result<()> {
        panic!(
            "disk failure reported for {} on {}",
            disk_path, peer_ip_address
        );
    }

    fn wait_on_barrier(&self, _barrier_name: &str) -> Result<()> {
        // A single node is always at the barrier.
        Ok(())
    }
}
