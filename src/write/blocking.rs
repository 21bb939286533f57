/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The blocking writer.

use crate::buffers::KvPairBuffer;
use crate::stage::Worker;
use crate::write::WriterFiles;
use anyhow::Result;

/// Writes each buffer to its partition file with sequential writes
/// bounded by the maximum write size.
pub struct BlockingWriter {
    files: WriterFiles,
}

impl BlockingWriter {
    pub fn new(files: WriterFiles) -> Self {
        BlockingWriter { files }
    }
}

impl Worker for BlockingWriter {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "writer"
    }

    fn process(&mut self, buffer: Self::Input) -> Result<()> {
        let max_write_size = self.files.config().max_write_size;
        let Some((key, file, offset)) = self.files.begin_write(&buffer)? else {
            // The disk failed; swallow the write but keep the token
            // discipline intact.
            let key = (
                buffer.sole_job_id(),
                buffer.logical_disk_id.unwrap(),
                buffer.chunk_id,
            );
            return self.files.finish_write(key, buffer);
        };
        file.write_all_at(buffer.bytes(), offset, max_write_size)?;
        self.files.finish_write(key, buffer)
    }

    fn teardown(&mut self) -> Result<()> {
        self.files.close_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::WriteTokenPool;
    use crate::coordinator::{DebugCoordinator, JobInfo};
    use crate::write::{WriterConfig, WriterFiles};
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use std::path::PathBuf;
    use std::sync::Arc;

    fn writer(dir: &std::path::Path, token_pool: Option<Arc<WriteTokenPool>>) -> BlockingWriter {
        let job = JobInfo {
            job_id: 0,
            map_function: "identity".into(),
            reduce_function: "identity".into(),
            partition_function: "boundary".into(),
            total_input_size: 0,
            num_partitions: 4,
        };
        let coordinator = Arc::new(DebugCoordinator::new(job, PathBuf::from(""), []));
        BlockingWriter::new(WriterFiles::new(
            WriterConfig {
                node_id: 0,
                node_ip_address: "127.0.0.1".into(),
                num_disks: 1,
                partitions_per_disk: 4,
                output_disks: BTreeMap::from([(0, dir.to_owned())]),
                direct_io: false,
                preallocation_size: 0,
                max_write_size: 64,
                large_partition_threshold: 0,
                bytes_before_simulated_failure: 0,
                chunk_disks: HashMap::new(),
            },
            coordinator,
            token_pool,
        ))
    }

    #[test]
    fn test_writes_append_in_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut writer = writer(dir.path(), None);

        for fill in [1u8, 2, 3] {
            let mut buffer = KvPairBuffer::new(200, 0);
            buffer.append(&vec![fill; 200]);
            buffer.logical_disk_id = Some(1);
            buffer.add_job_id(0);
            writer.process(buffer)?;
        }
        writer.teardown()?;

        let written = std::fs::read(dir.path().join("job_0/00000001.partition"))?;
        assert_eq!(written.len(), 600);
        assert_eq!(&written[..200], &[1u8; 200][..]);
        assert_eq!(&written[200..400], &[2u8; 200][..]);
        assert_eq!(&written[400..], &[3u8; 200][..]);
        Ok(())
    }

    #[test]
    fn test_tokens_return_to_pool() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let pool = Arc::new(WriteTokenPool::new(1, 1));
        let mut writer = writer(dir.path(), Some(pool.clone()));

        let token = pool.attempt_get_token(&BTreeSet::from([0])).unwrap();
        let mut buffer = KvPairBuffer::new(64, 0);
        buffer.append(&[9u8; 64]);
        buffer.logical_disk_id = Some(0);
        buffer.add_job_id(0);
        buffer.set_token(token);
        writer.process(buffer)?;

        assert!(pool.attempt_get_token(&BTreeSet::from([0])).is_some());
        writer.teardown()
    }
}
