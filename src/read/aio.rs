/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Asynchronous reads multiplexed over POSIX AIO.
//!
//! The reader keeps at most `ASYNCHRONOUS_IO_DEPTH` operations in flight.
//! Its policy: when a free slot exists and a new request is available,
//! start it; otherwise service completions, waiting up to ten
//! milliseconds, and go back to the tracker for more work. Direct I/O is
//! attempted first; a request the kernel rejects for alignment reasons
//! drains the file's in-flight I/O, disables direct I/O on the
//! descriptor, and retries.
//!
//! In the merge phase, reads of chunk files pause until a read token for
//! `partition offset + chunk id` is available, which bounds how much
//! chunk data the merger holds in memory at once.

use crate::aio::{AioEngine, Completion};
use crate::buffers::{ByteStreamBuffer, KvPairBuffer};
use crate::chain::WriteTokenPool;
use crate::convert::FilenameToStreamIdMap;
use crate::direct::DirectFile;
use crate::read::{ReadProtocol, ReadRequest};
use crate::stage::{MultiQueueWorker, Receiver};
use crate::write::parse_partition_file_path;
use anyhow::{bail, Result};
use crossbeam_channel::{RecvTimeoutError, TryRecvError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// How long completion waits may block before the reader polls its queue
/// again.
const COMPLETION_WAIT: Duration = Duration::from_millis(10);

/// What a pending read is filling.
enum ReadTarget {
    Stream(ByteStreamBuffer),
    Whole(KvPairBuffer),
}

/// One buffer being filled by the engine.
struct PendingRead {
    stream_key: usize,
    target: ReadTarget,
    /// Base of the reserved append region.
    base: *mut u8,
    read_size: usize,
    filled: usize,
    file_offset: u64,
}

/// One open request being streamed.
struct OpenRead {
    request: ReadRequest,
    file: DirectFile,
    stream_id: u64,
    next_offset: u64,
    remaining: u64,
}

/// The asynchronous reader stage.
///
/// In byte-stream mode it chops each request into default-buffer-size
/// chunks and finishes each stream with the empty sentinel; in
/// whole-file mode it reads each request into one KV buffer. One buffer
/// per request is in flight at a time; concurrency comes from servicing
/// many requests at once.
pub struct AioReader {
    default_buffer_size: usize,
    alignment: usize,
    direct_io: bool,
    delete_after_read: bool,
    /// Byte-stream mode when set; whole-file mode otherwise.
    stream_map: Option<Arc<FilenameToStreamIdMap>>,
    set_stream_size: bool,
    /// Merge-phase read gating: tokens keyed by partition offset + chunk.
    token_pool: Option<(Arc<WriteTokenPool>, HashMap<u64, u64>)>,
    stream_out: Option<crate::stage::Tracker<ByteStreamBuffer>>,
    whole_out: Option<crate::stage::Tracker<KvPairBuffer>>,

    engine: AioEngine,
    open_reads: HashMap<usize, OpenRead>,
    pending: HashMap<u64, PendingRead>,
    waiting_for_token: Vec<ReadRequest>,
    next_stream_key: usize,
    aligned_bytes_read: u64,
}

// Raw buffer pointers in `pending` refer to regions owned by the same
// struct.
unsafe impl Send for AioReader {}

impl AioReader {
    /// A byte-stream-mode reader feeding a converter.
    #[allow(clippy::too_many_arguments)]
    pub fn byte_stream(
        io_depth: usize,
        default_buffer_size: usize,
        alignment: usize,
        direct_io: bool,
        delete_after_read: bool,
        set_stream_size: bool,
        stream_map: Arc<FilenameToStreamIdMap>,
        downstream: crate::stage::Tracker<ByteStreamBuffer>,
    ) -> Self {
        AioReader {
            default_buffer_size,
            alignment,
            direct_io,
            delete_after_read,
            stream_map: Some(stream_map),
            set_stream_size,
            token_pool: None,
            stream_out: Some(downstream),
            whole_out: None,
            engine: AioEngine::new(io_depth),
            open_reads: HashMap::new(),
            pending: HashMap::new(),
            waiting_for_token: Vec::new(),
            next_stream_key: 0,
            aligned_bytes_read: 0,
        }
    }

    /// A whole-file-mode reader; with a token pool it serves the merge
    /// phase's gated chunk reads.
    pub fn whole_file(
        io_depth: usize,
        alignment: usize,
        direct_io: bool,
        delete_after_read: bool,
        token_pool: Option<(Arc<WriteTokenPool>, HashMap<u64, u64>)>,
        downstream: crate::stage::Tracker<KvPairBuffer>,
    ) -> Self {
        AioReader {
            default_buffer_size: 0,
            alignment,
            direct_io,
            delete_after_read,
            stream_map: None,
            set_stream_size: false,
            token_pool,
            stream_out: None,
            whole_out: Some(downstream),
            engine: AioEngine::new(io_depth),
            open_reads: HashMap::new(),
            pending: HashMap::new(),
            waiting_for_token: Vec::new(),
            next_stream_key: 0,
            aligned_bytes_read: 0,
        }
    }

    fn token_key(&self, request: &ReadRequest) -> Option<u64> {
        let (_, offsets) = self.token_pool.as_ref()?;
        let info = parse_partition_file_path(&request.path.to_string_lossy())?;
        let offset = offsets.get(&info.partition_id)?;
        Some(offset + info.chunk_id.unwrap_or(0))
    }

    /// Starts a request, or parks it until its read token is available.
    fn accept_request(&mut self, request: ReadRequest) -> Result<()> {
        if let Some(key) = self.token_key(&request) {
            let (pool, _) = self.token_pool.as_ref().unwrap();
            let mut keys = BTreeSet::new();
            keys.insert(key);
            match pool.attempt_get_token(&keys) {
                Some(token) => self.start_request(request, Some(token))?,
                None => self.waiting_for_token.push(request),
            }
            return Ok(());
        }
        self.start_request(request, None)
    }

    /// Retries parked requests whose tokens have become available.
    fn check_for_read_tokens(&mut self) -> Result<()> {
        let mut still_waiting = Vec::new();
        for request in std::mem::take(&mut self.waiting_for_token) {
            let key = self.token_key(&request).unwrap();
            let (pool, _) = self.token_pool.as_ref().unwrap();
            let mut keys = BTreeSet::new();
            keys.insert(key);
            match pool.attempt_get_token(&keys) {
                Some(token) => self.start_request(request, Some(token))?,
                None => still_waiting.push(request),
            }
        }
        self.waiting_for_token = still_waiting;
        Ok(())
    }

    fn start_request(
        &mut self,
        request: ReadRequest,
        token: Option<crate::chain::WriteToken>,
    ) -> Result<()> {
        assert!(
            request.protocol == ReadProtocol::File,
            "the local reader only serves local files"
        );

        let file = DirectFile::open_read(&request.path, self.direct_io)?;
        let file_size = file.len()?;
        if file_size == 0 {
            if let Some(token) = token {
                self.token_pool.as_ref().unwrap().0.put_token(token);
            }
            return Ok(());
        }

        let stream_id = match &self.stream_map {
            Some(stream_map) => {
                assert!(
                    !request.job_ids.is_empty(),
                    "expected read request to have at least one job id"
                );
                stream_map.add_filename(
                    request.path.to_string_lossy(),
                    request.job_ids.iter().copied(),
                    self.set_stream_size.then_some(request.length),
                )
            }
            None => 0,
        };

        let stream_key = self.next_stream_key;
        self.next_stream_key += 1;
        let remaining = request.length.min(file_size - request.offset);
        let next_offset = request.offset;
        self.open_reads.insert(
            stream_key,
            OpenRead {
                request,
                file,
                stream_id,
                next_offset,
                remaining,
            },
        );

        self.start_next_buffer(stream_key, token)
    }

    /// Issues the next buffer's read for an open request.
    fn start_next_buffer(
        &mut self,
        stream_key: usize,
        token: Option<crate::chain::WriteToken>,
    ) -> Result<()> {
        let open = self.open_reads.get_mut(&stream_key).unwrap();

        let read_size = if self.stream_map.is_some() {
            (self.default_buffer_size as u64).min(open.remaining) as usize
        } else {
            open.remaining as usize
        };

        let mut target = if self.stream_map.is_some() {
            let mut buffer =
                ByteStreamBuffer::new(self.default_buffer_size, self.alignment, open.stream_id);
            buffer.setup_append(read_size);
            ReadTarget::Stream(buffer)
        } else {
            let mut buffer = KvPairBuffer::new(read_size, self.alignment);
            if let Some(token) = token {
                buffer.set_token(token);
            }
            buffer.setup_append(read_size);
            ReadTarget::Whole(buffer)
        };

        let base = match &mut target {
            ReadTarget::Stream(buffer) => buffer.base_mut().pending_region().as_mut_ptr(),
            ReadTarget::Whole(buffer) => buffer.pending_region_ptr(),
        };

        let id = self
            .engine
            .submit_read(open.file.as_raw_fd(), open.next_offset, base, read_size)?;
        self.pending.insert(
            id,
            PendingRead {
                stream_key,
                target,
                base,
                read_size,
                filled: 0,
                file_offset: open.next_offset,
            },
        );
        Ok(())
    }

    fn handle_completion(&mut self, completion: Completion) -> Result<()> {
        let mut pending = self
            .pending
            .remove(&completion.id)
            .expect("completion for an unknown operation");

        if completion.result < 0 {
            let errno = (-completion.result) as i32;
            let open = self.open_reads.get_mut(&pending.stream_key).unwrap();
            if errno == libc::EINVAL && open.file.direct() {
                // Unaligned request with direct I/O: this operation is
                // the file's only in-flight one, so disable and retry.
                open.file.disable_direct()?;
                let offset = pending.file_offset + pending.filled as u64;
                let id = self.engine.submit_read(
                    open.file.as_raw_fd(),
                    offset,
                    unsafe { pending.base.add(pending.filled) },
                    pending.read_size - pending.filled,
                )?;
                self.pending.insert(id, pending);
                return Ok(());
            }
            bail!(
                "asynchronous read of {} failed: {}",
                open.file.path().display(),
                std::io::Error::from_raw_os_error(errno)
            );
        }

        let transferred = completion.result as usize;
        anyhow::ensure!(
            transferred > 0,
            "unexpected end of file in an asynchronous read"
        );
        pending.filled += transferred;
        {
            let open = self.open_reads.get(&pending.stream_key).unwrap();
            if open.file.direct() {
                self.aligned_bytes_read += transferred as u64;
            }
        }

        if pending.filled < pending.read_size {
            // Partial completion that is not the final one: read on.
            let open = self.open_reads.get(&pending.stream_key).unwrap();
            let offset = pending.file_offset + pending.filled as u64;
            let id = self.engine.submit_read(
                open.file.as_raw_fd(),
                offset,
                unsafe { pending.base.add(pending.filled) },
                pending.read_size - pending.filled,
            )?;
            self.pending.insert(id, pending);
            return Ok(());
        }

        // Buffer complete: emit it and advance the stream.
        let stream_key = pending.stream_key;
        {
            let open = self.open_reads.get_mut(&stream_key).unwrap();
            open.next_offset += pending.read_size as u64;
            open.remaining -= pending.read_size as u64;
        }

        match pending.target {
            ReadTarget::Stream(mut buffer) => {
                buffer.commit_append(pending.read_size);
                self.stream_out.as_ref().unwrap().send(buffer)?;
            }
            ReadTarget::Whole(mut buffer) => {
                buffer.commit_append(pending.read_size);
                let open = self.open_reads.get(&stream_key).unwrap();
                let filename = open.request.path.to_string_lossy().into_owned();
                buffer.source_name = Some(filename.clone());
                buffer.add_job_ids(open.request.job_ids.iter().copied());
                if let Some(info) = parse_partition_file_path(&filename) {
                    buffer.logical_disk_id = Some(info.partition_id);
                    buffer.chunk_id = info.chunk_id;
                }
                self.whole_out.as_ref().unwrap().send(buffer)?;
            }
        }

        let open = self.open_reads.get(&stream_key).unwrap();
        if open.remaining > 0 {
            self.start_next_buffer(stream_key, None)
        } else {
            let open = self.open_reads.remove(&stream_key).unwrap();
            if let Some(out) = &self.stream_out {
                out.send(ByteStreamBuffer::stream_end(open.stream_id))?;
            }
            if self.delete_after_read {
                std::fs::remove_file(&open.request.path)?;
            }
            Ok(())
        }
    }

    fn service_completions(&mut self) -> Result<()> {
        for completion in self.engine.wait_for_completions(COMPLETION_WAIT)? {
            self.handle_completion(completion)?;
        }
        Ok(())
    }
}

impl MultiQueueWorker for AioReader {
    type Input = ReadRequest;

    fn stage_name(&self) -> &'static str {
        "aio-reader"
    }

    fn run(&mut self, queues: &[Receiver<ReadRequest>]) -> Result<()> {
        assert!(queues.len() == 1, "the asynchronous reader owns one queue");
        let queue = &queues[0];

        'outer: loop {
            match queue.try_recv() {
                Ok(request) => {
                    while !self.engine.has_free_slot() {
                        self.service_completions()?;
                    }
                    self.accept_request(request)?;
                }
                Err(TryRecvError::Empty) => {
                    if self.engine.len() == 0 && self.waiting_for_token.is_empty() {
                        // Nothing in flight: block for new work.
                        match queue.recv_timeout(COMPLETION_WAIT) {
                            Ok(request) => self.accept_request(request)?,
                            Err(RecvTimeoutError::Timeout) => {}
                            Err(RecvTimeoutError::Disconnected) => break 'outer,
                        }
                    } else {
                        self.check_for_read_tokens()?;
                        if self.engine.len() > 0 {
                            self.service_completions()?;
                        } else {
                            // Parked on tokens only; don't spin.
                            std::thread::sleep(COMPLETION_WAIT);
                        }
                    }
                }
                Err(TryRecvError::Disconnected) => break 'outer,
            }
        }

        // Finish every outstanding request before tearing down.
        while !self.waiting_for_token.is_empty() || self.engine.len() > 0 {
            self.check_for_read_tokens()?;
            if self.engine.len() > 0 {
                self.service_completions()?;
            } else {
                std::thread::sleep(COMPLETION_WAIT);
            }
        }
        assert!(
            self.pending.is_empty() && self.open_reads.is_empty(),
            "reads left unfinished at teardown"
        );
        log::info!(
            "asynchronous reader done; {} bytes read with direct I/O",
            self.aligned_bytes_read
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{work_queue, work_queues};
    use std::io::Write;

    #[test]
    fn test_streams_files_concurrently() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut payloads = Vec::new();
        let mut paths = Vec::new();
        for i in 0..3u8 {
            let path = dir.path().join(format!("input-{}", i));
            let payload = vec![i; 3000];
            std::fs::File::create(&path)?.write_all(&payload)?;
            payloads.push(payload);
            paths.push(path);
        }

        let stream_map = Arc::new(FilenameToStreamIdMap::new());
        let (request_trackers, request_queues) = work_queues("aio-reader", 1, 16);
        let (tracker, receiver) = work_queue("converter", 64);
        let mut reader = AioReader::byte_stream(
            4,
            1024,
            0,
            false,
            false,
            false,
            stream_map,
            tracker,
        );

        for (i, path) in paths.iter().enumerate() {
            request_trackers[0].send(ReadRequest::local_file(path, [1], 3000, i as u64))?;
        }
        drop(request_trackers);
        reader.run(&request_queues)?;

        // Each file yields three chunks and a sentinel, reassembling to
        // its payload.
        let mut rebuilt: HashMap<u64, Vec<u8>> = HashMap::new();
        let mut sentinels = 0;
        while let Ok(buffer) = receiver.try_recv() {
            if buffer.is_empty() {
                sentinels += 1;
            } else {
                rebuilt
                    .entry(buffer.stream_id())
                    .or_default()
                    .extend_from_slice(buffer.bytes());
            }
        }
        assert_eq!(sentinels, 3);
        assert_eq!(rebuilt.len(), 3);
        let mut totals: Vec<Vec<u8>> = rebuilt.into_values().collect();
        totals.sort();
        let mut expected = payloads.clone();
        expected.sort();
        assert_eq!(totals, expected);
        Ok(())
    }

    #[test]
    fn test_whole_file_mode() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let job_dir = dir.path().join("job_2");
        std::fs::create_dir(&job_dir)?;
        let path = job_dir.join("00000004.partition");
        let payload = vec![0xEEu8; 4096];
        std::fs::File::create(&path)?.write_all(&payload)?;

        let (request_trackers, request_queues) = work_queues("aio-reader", 1, 4);
        let (tracker, receiver) = work_queue("merger", 4);
        let mut reader = AioReader::whole_file(2, 0, false, false, None, tracker);

        request_trackers[0].send(ReadRequest::local_file(&path, [2], 4096, 0))?;
        drop(request_trackers);
        reader.run(&request_queues)?;

        let buffer = receiver.try_recv().unwrap();
        assert_eq!(buffer.bytes(), &payload[..]);
        assert_eq!(buffer.logical_disk_id, Some(4));
        Ok(())
    }
}
