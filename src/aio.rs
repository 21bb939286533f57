/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! A minimal submission/completion engine over POSIX AIO, shared by the
//! asynchronous reader and writer.

use anyhow::{bail, Context, Result};
use std::time::Duration;

/// One AIO operation's result.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub id: u64,
    /// Bytes transferred, or the negated errno.
    pub result: i64,
}

/// Tracks up to `depth` in-flight `aio_read`/`aio_write` operations.
pub(crate) struct AioEngine {
    depth: usize,
    in_flight: Vec<(u64, Box<libc::aiocb>)>,
    next_id: u64,
}

// The engine owns its control blocks; the raw buffer pointers inside
// them belong to buffers owned by the same worker.
unsafe impl Send for AioEngine {}

impl AioEngine {
    pub fn new(depth: usize) -> Self {
        AioEngine {
            depth,
            in_flight: Vec::with_capacity(depth),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_free_slot(&self) -> bool {
        self.in_flight.len() < self.depth
    }

    fn submit(
        &mut self,
        fd: std::os::fd::RawFd,
        offset: u64,
        buffer: *mut u8,
        length: usize,
        write: bool,
    ) -> Result<u64> {
        assert!(
            self.has_free_slot(),
            "operation submitted with no free I/O slot"
        );

        let mut control: Box<libc::aiocb> = Box::new(unsafe { std::mem::zeroed() });
        control.aio_fildes = fd;
        control.aio_offset = offset as libc::off_t;
        control.aio_buf = buffer as *mut libc::c_void;
        control.aio_nbytes = length;

        let rc = unsafe {
            if write {
                libc::aio_write(control.as_mut())
            } else {
                libc::aio_read(control.as_mut())
            }
        };
        if rc != 0 {
            bail!(
                "aio_{} failed: {}",
                if write { "write" } else { "read" },
                std::io::Error::last_os_error()
            );
        }

        let id = self.next_id;
        self.next_id += 1;
        self.in_flight.push((id, control));
        Ok(id)
    }

    /// Submits one read; the caller guarantees the buffer outlives the
    /// operation and does not move its backing region.
    pub fn submit_read(
        &mut self,
        fd: std::os::fd::RawFd,
        offset: u64,
        buffer: *mut u8,
        length: usize,
    ) -> Result<u64> {
        self.submit(fd, offset, buffer, length, false)
    }

    /// Submits one write, under the same buffer-stability contract.
    pub fn submit_write(
        &mut self,
        fd: std::os::fd::RawFd,
        offset: u64,
        buffer: *const u8,
        length: usize,
    ) -> Result<u64> {
        self.submit(fd, offset, buffer as *mut u8, length, true)
    }

    /// Waits up to `timeout` for at least one completion and collects
    /// everything that has finished.
    pub fn wait_for_completions(&mut self, timeout: Duration) -> Result<Vec<Completion>> {
        if self.in_flight.is_empty() {
            return Ok(Vec::new());
        }

        let list: Vec<*const libc::aiocb> = self
            .in_flight
            .iter()
            .map(|(_, control)| {
                let control: *const libc::aiocb = control.as_ref();
                control
            })
            .collect();
        let timespec = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let rc = unsafe {
            libc::aio_suspend(list.as_ptr(), list.len() as libc::c_int, &timespec)
        };
        if rc != 0 {
            let error = std::io::Error::last_os_error();
            match error.raw_os_error() {
                // Timeout or signal: no completions this round.
                Some(libc::EAGAIN) | Some(libc::EINTR) => return Ok(Vec::new()),
                _ => return Err(error).context("aio_suspend failed"),
            }
        }

        let mut completions = Vec::new();
        self.in_flight.retain_mut(|(id, control)| {
            let status = unsafe { libc::aio_error(control.as_ref()) };
            if status == libc::EINPROGRESS {
                return true;
            }
            let result = if status == 0 {
                unsafe { libc::aio_return(control.as_mut()) as i64 }
            } else {
                -(status as i64)
            };
            completions.push(Completion { id: *id, result });
            false
        });
        Ok(completions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_write_then_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("aio");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;

        let mut engine = AioEngine::new(2);
        let payload = b"engine round trip".to_vec();
        engine.submit_write(file.as_raw_fd(), 0, payload.as_ptr(), payload.len())?;

        let mut written = 0;
        while written < payload.len() {
            for completion in engine.wait_for_completions(Duration::from_millis(100))? {
                assert!(completion.result > 0, "write failed");
                written += completion.result as usize;
            }
        }

        let mut read_back = String::new();
        let mut file = std::fs::File::open(&path)?;
        file.read_to_string(&mut read_back)?;
        assert_eq!(read_back.as_bytes(), payload.as_slice());
        Ok(())
    }
}
