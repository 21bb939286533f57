/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Blocking streaming reads into fixed-capacity byte-stream buffers.

use crate::buffers::ByteStreamBuffer;
use crate::convert::FilenameToStreamIdMap;
use crate::direct::DirectFile;
use crate::read::{ReadProtocol, ReadRequest};
use crate::stage::{Tracker, Worker};
use anyhow::Result;
use std::sync::Arc;

/// Reads each request's byte range into fixed-capacity byte-stream
/// buffers; the final empty buffer signals the stream's end.
pub struct ByteStreamReader {
    max_read_size: usize,
    alignment: usize,
    direct_io: bool,
    buffer_size: usize,
    delete_after_read: bool,
    /// Record the stream length at registration (phase two knows it).
    set_stream_size: bool,
    stream_map: Arc<FilenameToStreamIdMap>,
    downstream: Tracker<ByteStreamBuffer>,
    aligned_bytes_read: u64,
}

impl ByteStreamReader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        max_read_size: usize,
        alignment: usize,
        direct_io: bool,
        buffer_size: usize,
        delete_after_read: bool,
        set_stream_size: bool,
        stream_map: Arc<FilenameToStreamIdMap>,
        downstream: Tracker<ByteStreamBuffer>,
    ) -> Self {
        assert!(
            alignment == 0 || buffer_size % alignment == 0,
            "read buffer size {} is not a multiple of alignment size {}",
            buffer_size,
            alignment
        );
        ByteStreamReader {
            max_read_size,
            alignment,
            direct_io,
            buffer_size,
            delete_after_read,
            set_stream_size,
            stream_map,
            downstream,
            aligned_bytes_read: 0,
        }
    }
}

impl Worker for ByteStreamReader {
    type Input = ReadRequest;

    fn stage_name(&self) -> &'static str {
        "reader"
    }

    fn process(&mut self, request: Self::Input) -> Result<()> {
        assert!(
            request.protocol == ReadProtocol::File,
            "the local reader only serves local files"
        );
        assert!(
            !request.job_ids.is_empty(),
            "expected read request to have at least one job id"
        );

        let filename = request.path.to_string_lossy().into_owned();
        let stream_id = self.stream_map.add_filename(
            &filename,
            request.job_ids.iter().copied(),
            self.set_stream_size.then_some(request.length),
        );

        let mut file = DirectFile::open_read(&request.path, self.direct_io)?;
        let file_size = file.len()?;
        // Don't process zero-length files.
        if file_size == 0 {
            return Ok(());
        }

        let mut offset = request.offset;
        let mut remaining = request.length.min(file_size - request.offset);
        while remaining > 0 {
            let read_size = (self.buffer_size as u64).min(remaining) as usize;
            let mut buffer = ByteStreamBuffer::new(self.buffer_size, self.alignment, stream_id);
            {
                let region = buffer.setup_append(read_size);
                file.read_exact_at(&mut region[..read_size], offset, self.max_read_size)?;
            }
            buffer.commit_append(read_size);
            self.downstream.send(buffer)?;

            offset += read_size as u64;
            remaining -= read_size as u64;
        }

        self.aligned_bytes_read += file.aligned_bytes();
        drop(file);

        if self.delete_after_read {
            std::fs::remove_file(&request.path)?;
        }

        // Tell the converter the stream is closed.
        self.downstream.send(ByteStreamBuffer::stream_end(stream_id))
    }

    fn teardown(&mut self) -> Result<()> {
        log::info!(
            "byte-stream reader done; {} bytes read with direct I/O",
            self.aligned_bytes_read
        );
        Ok(())
    }
}
