/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Partition file management shared by the writer variants.

use crate::buffers::KvPairBuffer;
use crate::chain::WriteTokenPool;
use crate::coordinator::Coordinator;
use crate::direct::DirectFile;
use crate::write::partition_file_path;
use anyhow::{Context, Result};
use itertools::Itertools;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Per-writer configuration.
pub struct WriterConfig {
    pub node_id: u64,
    pub node_ip_address: String,
    /// Cluster-wide output disks per node.
    pub num_disks: u64,
    pub partitions_per_disk: u64,
    /// The disks this writer serves: disk id → mount path.
    pub output_disks: BTreeMap<u64, PathBuf>,
    pub direct_io: bool,
    /// Preallocation hint; zero disables preallocation.
    pub preallocation_size: u64,
    pub max_write_size: usize,
    /// Partitions exceeding this are renamed `.large` at teardown; zero
    /// disables the rename.
    pub large_partition_threshold: u64,
    /// Fault-injection: black-hole a disk after this many bytes.
    pub bytes_before_simulated_failure: u64,
    /// Disk placement of merge-phase chunks.
    pub chunk_disks: HashMap<(u64, u64), u64>,
}

struct OpenFile {
    file: DirectFile,
    append_offset: u64,
}

type FileKey = (u64, u64, Option<u64>);

/// Lazily created, append-tracked partition files for one writer.
///
/// Files are created on the first buffer for a `(job, partition[,
/// chunk])`, preallocated when configured, and closed at teardown, where
/// partitions above the large-partition threshold get their `.large`
/// rename. A simulated disk failure notifies the coordinator and
/// black-holes all further writes to that disk.
pub struct WriterFiles {
    config: WriterConfig,
    coordinator: Arc<dyn Coordinator>,
    token_pool: Option<Arc<WriteTokenPool>>,
    files: HashMap<FileKey, OpenFile>,
    black_holed_disks: BTreeSet<u64>,
    total_bytes_written: u64,
}

impl WriterFiles {
    pub fn new(
        config: WriterConfig,
        coordinator: Arc<dyn Coordinator>,
        token_pool: Option<Arc<WriteTokenPool>>,
    ) -> Self {
        WriterFiles {
            config,
            coordinator,
            token_pool,
            files: HashMap::new(),
            black_holed_disks: BTreeSet::new(),
            total_bytes_written: 0,
        }
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// The disk a buffer's partition lives on, and whether the write is
    /// a remote replica.
    fn disk_for(&self, partition: u64, chunk: Option<u64>) -> (u64, bool) {
        if let Some(chunk_id) = chunk {
            if let Some(&disk) = self.config.chunk_disks.get(&(partition, chunk_id)) {
                return (disk, false);
            }
        }

        let global_disk = partition / self.config.partitions_per_disk;
        let disk_node = global_disk / self.config.num_disks;
        let disk = global_disk % self.config.num_disks;
        // A partition of another node arriving here is a replica.
        (disk, disk_node != self.config.node_id)
    }

    /// The open file for a buffer, created lazily; [`None`] when its
    /// disk has been black-holed.
    fn file_for(&mut self, buffer: &KvPairBuffer) -> Result<Option<(FileKey, &mut OpenFile)>> {
        let job_id = buffer.sole_job_id();
        let partition = buffer
            .logical_disk_id
            .expect("buffer reached the writer without a partition tag");
        let chunk = buffer.chunk_id;
        let (disk, replica) = self.disk_for(partition, chunk);

        if self.black_holed_disks.contains(&disk) {
            return Ok(None);
        }

        let disk_path = self
            .config
            .output_disks
            .get(&disk)
            .unwrap_or_else(|| {
                panic!(
                    "writer got a buffer for partition {} on disk {}, but is not responsible \
                     for that disk",
                    partition, disk
                )
            })
            .clone();

        let key: FileKey = (job_id, partition, chunk);
        if !self.files.contains_key(&key) {
            let job_directory = self.coordinator.output_directory(job_id)?;
            let path = partition_file_path(
                &disk_path.join(job_directory),
                job_id,
                partition,
                chunk,
                replica,
            );
            let parent = path.parent().unwrap();
            std::fs::create_dir_all(parent)
                .with_context(|| format!("could not create directory {}", parent.display()))?;

            let file = DirectFile::create_write(&path, self.config.direct_io)?;
            if self.config.preallocation_size > 0 {
                file.preallocate(self.config.preallocation_size)?;
            }
            log::debug!("created partition file {}", path.display());
            self.files.insert(
                key,
                OpenFile {
                    file,
                    append_offset: 0,
                },
            );
        }
        Ok(Some((key, self.files.get_mut(&key).unwrap())))
    }

    /// Resolves a buffer to its file and current append offset.
    pub fn begin_write(
        &mut self,
        buffer: &KvPairBuffer,
    ) -> Result<Option<(FileKey, &mut DirectFile, u64)>> {
        Ok(self.file_for(buffer)?.map(|(key, open)| {
            let offset = open.append_offset;
            (key, &mut open.file, offset)
        }))
    }

    /// Records a completed buffer write and returns its token.
    pub fn finish_write(&mut self, key: FileKey, mut buffer: KvPairBuffer) -> Result<()> {
        let written = buffer.current_size() as u64;
        if let Some(open) = self.files.get_mut(&key) {
            open.append_offset += written;
        }
        self.total_bytes_written += written;

        if self.config.bytes_before_simulated_failure > 0
            && self.total_bytes_written >= self.config.bytes_before_simulated_failure
        {
            let (disk, _) = self.disk_for(key.1, key.2);
            if !self.black_holed_disks.contains(&disk) {
                let disk_path = self.config.output_disks[&disk].clone();
                log::error!(
                    "simulated failure of disk {} after {} bytes",
                    disk_path.display(),
                    self.total_bytes_written
                );
                self.coordinator.notify_disk_failure(
                    &self.config.node_ip_address,
                    &disk_path.to_string_lossy(),
                )?;
                self.black_holed_disks.insert(disk);
            }
        }

        if let Some(token) = buffer.take_token() {
            let pool = self
                .token_pool
                .as_ref()
                .expect("a write token arrived but this writer has no token pool");
            pool.put_token(token);
        }
        Ok(())
    }

    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Closes every open file in partition order, renaming large
    /// partitions for the merge phase.
    pub fn close_all(&mut self) -> Result<()> {
        let mut aligned_bytes = 0;
        for ((job_id, partition, chunk), open) in self
            .files
            .drain()
            .sorted_by_key(|((job_id, partition, chunk), _)| (*job_id, *partition, *chunk))
        {
            aligned_bytes += open.file.aligned_bytes();
            let path = open.file.path().to_owned();
            let size = open.append_offset;
            drop(open);

            if self.config.large_partition_threshold > 0
                && chunk.is_none()
                && size > self.config.large_partition_threshold
            {
                let large_path = path.with_extension("partition.large");
                std::fs::rename(&path, &large_path).with_context(|| {
                    format!(
                        "could not rename large partition {} of job {}",
                        partition, job_id
                    )
                })?;
                log::info!(
                    "partition {} of job {} is large ({} bytes); renamed for the merge phase",
                    partition,
                    job_id,
                    size
                );
            }
        }
        log::info!(
            "writer closed all files; {} bytes total, {} with direct I/O",
            self.total_bytes_written,
            aligned_bytes
        );
        Ok(())
    }
}
