/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Partition file naming and parsing.
//!
//! Partition files are named
//! `{output disk}{output job path}/{partition:08}.partition`, with a
//! `.chunk_{chunk:08}` suffix for the chunk files of large partitions and
//! a `.large` suffix applied at teardown to partitions exceeding the
//! large-partition threshold. Replica partitions land in a sibling
//! directory with a `_replica` suffix. The job path component is
//! `job_{job}`, which is also how readers recover the job id of a
//! partition file they are handed.

use std::path::{Path, PathBuf};

/// The identity a partition filename encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionFileInfo {
    pub job_id: u64,
    pub partition_id: u64,
    pub chunk_id: Option<u64>,
}

/// The directory all of a job's partition files live in.
pub fn job_directory(output_disk: &Path, job_id: u64, replica: bool) -> PathBuf {
    let suffix = if replica { "_replica" } else { "" };
    output_disk.join(format!("job_{}{}", job_id, suffix))
}

/// The full path of a partition (or chunk) file.
pub fn partition_file_path(
    output_disk: &Path,
    job_id: u64,
    partition_id: u64,
    chunk_id: Option<u64>,
    replica: bool,
) -> PathBuf {
    let mut name = format!("{:08}.partition", partition_id);
    if let Some(chunk_id) = chunk_id {
        name.push_str(&format!(".chunk_{:08}", chunk_id));
    }
    job_directory(output_disk, job_id, replica).join(name)
}

/// Parses `…/job_{J}/{P:08}.partition[.large|.chunk_{C:08}]`.
///
/// Returns [`None`] for filenames that are not partition files, in which
/// case the buffer simply carries no partition provenance.
pub fn parse_partition_file_path(path: &str) -> Option<PartitionFileInfo> {
    let path = Path::new(path);
    let file_name = path.file_name()?.to_str()?;
    let directory = path.parent()?.file_name()?.to_str()?;

    let job_id = directory
        .strip_prefix("job_")?
        .trim_end_matches("_replica")
        .parse()
        .ok()?;

    let (partition, suffix) = file_name.split_once(".partition")?;
    let partition_id = partition.parse().ok()?;

    let chunk_id = match suffix {
        "" | ".large" => None,
        _ => Some(suffix.strip_prefix(".chunk_")?.parse().ok()?),
    };

    Some(PartitionFileInfo {
        job_id,
        partition_id,
        chunk_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_construction() {
        let path = partition_file_path(Path::new("/disk0"), 3, 42, None, false);
        assert_eq!(path, Path::new("/disk0/job_3/00000042.partition"));

        let chunk = partition_file_path(Path::new("/disk0"), 3, 42, Some(7), false);
        assert_eq!(
            chunk,
            Path::new("/disk0/job_3/00000042.partition.chunk_00000007")
        );

        let replica = partition_file_path(Path::new("/disk1"), 3, 42, None, true);
        assert_eq!(replica, Path::new("/disk1/job_3_replica/00000042.partition"));
    }

    #[test]
    fn test_parse_round_trip() {
        for (path, expected) in [
            (
                "/disk0/job_3/00000042.partition",
                PartitionFileInfo {
                    job_id: 3,
                    partition_id: 42,
                    chunk_id: None,
                },
            ),
            (
                "/disk0/job_3/00000042.partition.large",
                PartitionFileInfo {
                    job_id: 3,
                    partition_id: 42,
                    chunk_id: None,
                },
            ),
            (
                "/disk2/job_11/00000007.partition.chunk_00000003",
                PartitionFileInfo {
                    job_id: 11,
                    partition_id: 7,
                    chunk_id: Some(3),
                },
            ),
        ] {
            assert_eq!(parse_partition_file_path(path), Some(expected), "{}", path);
        }
    }

    #[test]
    fn test_parse_rejects_other_files() {
        assert_eq!(parse_partition_file_path("/data/input.txt"), None);
        assert_eq!(parse_partition_file_path("/disk0/job_x/0.partition"), None);
        assert_eq!(parse_partition_file_path("/disk0/other/0000.part"), None);
    }
}
