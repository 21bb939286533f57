/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Blocking whole-file reads into single KV buffers.

use crate::buffers::KvPairBuffer;
use crate::direct::DirectFile;
use crate::read::{ReadProtocol, ReadRequest};
use crate::stage::{Tracker, Worker};
use crate::write::parse_partition_file_path;
use anyhow::Result;

/// Reads each request's file in one piece and emits it as a single KV
/// buffer, tagged with the partition provenance its filename encodes.
pub struct WholeFileReader {
    max_read_size: usize,
    alignment: usize,
    direct_io: bool,
    delete_after_read: bool,
    downstream: Tracker<KvPairBuffer>,
    aligned_bytes_read: u64,
}

impl WholeFileReader {
    pub fn new(
        max_read_size: usize,
        alignment: usize,
        direct_io: bool,
        delete_after_read: bool,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        WholeFileReader {
            max_read_size,
            alignment,
            direct_io,
            delete_after_read,
            downstream,
            aligned_bytes_read: 0,
        }
    }
}

impl Worker for WholeFileReader {
    type Input = ReadRequest;

    fn stage_name(&self) -> &'static str {
        "reader"
    }

    fn process(&mut self, request: Self::Input) -> Result<()> {
        assert!(
            request.protocol == ReadProtocol::File,
            "the local reader only serves local files"
        );

        let mut file = DirectFile::open_read(&request.path, self.direct_io)?;
        let file_size = file.len()? as usize;
        // Don't process zero-length files.
        if file_size == 0 {
            return Ok(());
        }

        let mut buffer = KvPairBuffer::new(file_size, self.alignment);
        let filename = request.path.to_string_lossy().into_owned();

        {
            let region = buffer.setup_append(file_size);
            file.read_exact_at(region, 0, self.max_read_size)?;
        }
        buffer.commit_append(file_size);

        buffer.source_name = Some(filename.clone());
        buffer.add_job_ids(request.job_ids.iter().copied());
        if let Some(info) = parse_partition_file_path(&filename) {
            buffer.logical_disk_id = Some(info.partition_id);
            buffer.chunk_id = info.chunk_id;
        }

        self.aligned_bytes_read += file.aligned_bytes();
        drop(file);

        if self.delete_after_read {
            std::fs::remove_file(&request.path)?;
        }

        self.downstream.send(buffer)
    }

    fn teardown(&mut self) -> Result<()> {
        log::info!(
            "whole-file reader done; {} bytes read with direct I/O",
            self.aligned_bytes_read
        );
        Ok(())
    }
}
