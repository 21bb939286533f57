/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Direct-I/O file access shared by the readers and writers.
//!
//! A [`DirectFile`] wraps a file opened with `O_DIRECT` when requested
//! and implements the drain-disable-retry recovery the pipeline relies
//! on: a request the kernel rejects for alignment reasons (the unaligned
//! tail of a file, typically) disables direct I/O on the file — after an
//! fsync on the write side — and is retried, instead of surfacing a
//! failure.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// A file handle with togglable direct I/O.
#[derive(Debug)]
pub struct DirectFile {
    file: File,
    path: PathBuf,
    direct: bool,
    mode: Mode,
    aligned_bytes: u64,
}

impl DirectFile {
    pub fn open_read(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.read(true);
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options
            .open(path)
            .with_context(|| format!("could not open {} for reading", path.display()))?;
        Ok(DirectFile {
            file,
            path: path.to_owned(),
            direct,
            mode: Mode::Read,
            aligned_bytes: 0,
        })
    }

    pub fn create_write(path: impl AsRef<Path>, direct: bool) -> Result<Self> {
        let path = path.as_ref();
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        if direct {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options
            .open(path)
            .with_context(|| format!("could not create {}", path.display()))?;
        Ok(DirectFile {
            file,
            path: path.to_owned(),
            direct,
            mode: Mode::Write,
            aligned_bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn direct(&self) -> bool {
        self.direct
    }

    /// Bytes transferred while direct I/O was still enabled.
    pub fn aligned_bytes(&self) -> u64 {
        self.aligned_bytes
    }

    pub fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.file.as_raw_fd()
    }

    /// Hints the final file size to the filesystem.
    pub fn preallocate(&self, size: u64) -> Result<()> {
        let rc = unsafe {
            libc::posix_fallocate(self.file.as_raw_fd(), 0, size as libc::off_t)
        };
        if rc != 0 {
            // Preallocation is an optimization; some filesystems simply
            // don't support it.
            log::debug!(
                "posix_fallocate({}) failed with {}; continuing without preallocation",
                self.path.display(),
                rc
            );
        }
        Ok(())
    }

    /// Turns off `O_DIRECT` on the open descriptor. Writes are fsynced
    /// first so pending aligned data is durable before the mode switch.
    pub fn disable_direct(&mut self) -> Result<()> {
        if !self.direct {
            return Ok(());
        }
        if self.mode == Mode::Write {
            self.file
                .sync_data()
                .with_context(|| format!("could not fsync {}", self.path.display()))?;
        }
        let fd = self.file.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        anyhow::ensure!(flags >= 0, "could not read flags of {}", self.path.display());
        let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_DIRECT) };
        anyhow::ensure!(
            rc >= 0,
            "could not disable direct I/O on {}",
            self.path.display()
        );
        log::debug!("disabled direct I/O on {}", self.path.display());
        self.direct = false;
        Ok(())
    }

    fn is_alignment_error(error: &std::io::Error) -> bool {
        error.raw_os_error() == Some(libc::EINVAL)
    }

    /// Reads exactly `buf.len()` bytes at `offset`, in chunks of at most
    /// `max_read_size`, retrying without direct I/O when the kernel
    /// rejects an unaligned tail.
    pub fn read_exact_at(
        &mut self,
        buf: &mut [u8],
        mut offset: u64,
        max_read_size: usize,
    ) -> Result<()> {
        let mut remaining = buf.len();
        let mut position = 0;
        while remaining > 0 {
            let chunk = remaining.min(max_read_size);
            let read = match self.file.read_at(&mut buf[position..position + chunk], offset) {
                Ok(0) => anyhow::bail!(
                    "unexpected end of {} at offset {}",
                    self.path.display(),
                    offset
                ),
                Ok(read) => read,
                Err(error) if Self::is_alignment_error(&error) && self.direct => {
                    self.disable_direct()?;
                    continue;
                }
                Err(error) => {
                    return Err(error).with_context(|| {
                        format!("could not read {} at offset {}", self.path.display(), offset)
                    })
                }
            };
            if self.direct {
                self.aligned_bytes += read as u64;
            }
            position += read;
            offset += read as u64;
            remaining -= read;
        }
        Ok(())
    }

    /// Writes all of `buf` at `offset` in chunks of at most
    /// `max_write_size`, with the same alignment fallback as reads.
    pub fn write_all_at(
        &mut self,
        buf: &[u8],
        mut offset: u64,
        max_write_size: usize,
    ) -> Result<()> {
        let mut remaining = buf.len();
        let mut position = 0;
        while remaining > 0 {
            let chunk = remaining.min(max_write_size);
            let written = match self.file.write_at(&buf[position..position + chunk], offset) {
                Ok(written) => written,
                Err(error) if Self::is_alignment_error(&error) && self.direct => {
                    self.disable_direct()?;
                    continue;
                }
                Err(error) => {
                    return Err(error).with_context(|| {
                        format!(
                            "could not write {} at offset {}",
                            self.path.display(),
                            offset
                        )
                    })
                }
            };
            anyhow::ensure!(
                written > 0,
                "zero-length write to {} at offset {}",
                self.path.display(),
                offset
            );
            if self.direct {
                self.aligned_bytes += written as u64;
            }
            position += written;
            offset += written as u64;
            remaining -= written;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .with_context(|| format!("could not fsync {}", self.path.display()))
    }
}
