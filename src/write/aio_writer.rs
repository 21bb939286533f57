/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Asynchronous writes multiplexed over POSIX AIO.

use crate::aio::{AioEngine, Completion};
use crate::buffers::KvPairBuffer;
use crate::stage::{MultiQueueWorker, Receiver};
use crate::write::WriterFiles;
use anyhow::{bail, Result};
use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use std::collections::HashMap;
use std::time::Duration;

/// How long completion waits may block before the writer polls its
/// queue again.
const COMPLETION_WAIT: Duration = Duration::from_millis(1);

/// One buffer being written, one chunk at a time.
struct PendingWrite {
    key: (u64, u64, Option<u64>),
    buffer: KvPairBuffer,
    /// Offset of the buffer's first byte in the file.
    file_offset: u64,
    written: usize,
    /// End of the currently submitted chunk, relative to the buffer.
    chunk_end: usize,
}

/// The asynchronous writer stage.
///
/// Maintains up to `ASYNCHRONOUS_IO_DEPTH` writes in flight; buffers
/// larger than the maximum write size become a sequence of chunk
/// submissions, each re-queued as its predecessor completes. A request
/// that returns fewer bytes than asked and is not the buffer's final
/// chunk is retried for the remainder; a failed write aborts the worker.
pub struct AioWriter {
    files: WriterFiles,
    engine: AioEngine,
    pending: HashMap<u64, PendingWrite>,
}

// Raw buffer pointers in flight refer to regions owned by `pending`.
unsafe impl Send for AioWriter {}

impl AioWriter {
    pub fn new(files: WriterFiles, io_depth: usize) -> Self {
        AioWriter {
            files,
            engine: AioEngine::new(io_depth),
            pending: HashMap::new(),
        }
    }

    /// Starts writing a buffer, or finishes it immediately when its disk
    /// is black-holed.
    fn start_buffer(&mut self, buffer: KvPairBuffer) -> Result<()> {
        let Some((key, _, file_offset)) = self.files.begin_write(&buffer)? else {
            let key = (
                buffer.sole_job_id(),
                buffer.logical_disk_id.unwrap(),
                buffer.chunk_id,
            );
            return self.files.finish_write(key, buffer);
        };

        let pending = PendingWrite {
            key,
            buffer,
            file_offset,
            written: 0,
            chunk_end: 0,
        };
        self.submit_next_chunk(pending)
    }

    /// Submits the next chunk of a pending write.
    fn submit_next_chunk(&mut self, mut pending: PendingWrite) -> Result<()> {
        let max_write_size = self.files.config().max_write_size;
        let total = pending.buffer.current_size();
        pending.chunk_end = total.min(pending.written + max_write_size);

        let fd = match self.files.begin_write(&pending.buffer)? {
            Some((_, file, _)) => file.as_raw_fd(),
            // The disk failed mid-buffer; swallow the rest of the write.
            None => return self.files.finish_write(pending.key, pending.buffer),
        };
        let base = pending.buffer.bytes().as_ptr();
        let id = self.engine.submit_write(
            fd,
            pending.file_offset + pending.written as u64,
            unsafe { base.add(pending.written) },
            pending.chunk_end - pending.written,
        )?;
        self.pending.insert(id, pending);
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let mut pending = self
            .pending
            .remove(&completion.id)
            .expect("completion for an unknown operation");

        if completion.result < 0 {
            let errno = (-completion.result) as i32;
            if errno == libc::EINVAL {
                // Unaligned tail with direct I/O: drain is implicit (one
                // in-flight op per file), so fsync, disable, retry.
                if let Some((_, file, _)) = self.files.begin_write(&pending.buffer)? {
                    if file.direct() {
                        file.disable_direct()?;
                        return self.submit_next_chunk(pending);
                    }
                }
            }
            bail!(
                "asynchronous write failed: {}",
                std::io::Error::from_raw_os_error(errno)
            );
        }

        let transferred = completion.result as usize;
        anyhow::ensure!(transferred > 0, "zero-length asynchronous write");
        pending.written += transferred;

        if pending.written < pending.buffer.current_size() {
            // Short chunk or more chunks to go: submit the remainder.
            return self.submit_next_chunk(pending);
        }

        self.files.finish_write(pending.key, pending.buffer)
    }

    fn service_completions(&mut self) -> Result<()> {
        for completion in self.engine.wait_for_completions(COMPLETION_WAIT)? {
            self.handle_completion(completion)?;
        }
        Ok(())
    }
}

impl MultiQueueWorker for AioWriter {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "aio-writer"
    }

    fn run(&mut self, queues: &[Receiver<KvPairBuffer>]) -> Result<()> {
        assert!(queues.len() == 1, "the asynchronous writer owns one queue");
        let queue = &queues[0];

        'outer: loop {
            match queue.try_recv() {
                Ok(buffer) => {
                    while !self.engine.has_free_slot() {
                        self.service_completions()?;
                    }
                    self.start_buffer(buffer)?;
                }
                Err(TryRecvError::Empty) => {
                    if self.engine.len() == 0 {
                        match queue.recv_timeout(COMPLETION_WAIT) {
                            Ok(buffer) => self.start_buffer(buffer)?,
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break 'outer,
                        }
                    } else {
                        self.service_completions()?;
                    }
                }
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }

        // Finish all outstanding writes before closing files.
        while self.engine.len() > 0 {
            self.service_completions()?;
        }
        assert!(
            self.pending.is_empty(),
            "writes left unfinished at teardown"
        );
        self.files.close_all()
    }
}
