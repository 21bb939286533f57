/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The base byte buffer all work units build on.
//!
//! A [`BaseBuffer`] is a fixed-capacity byte region with a logical size, a
//! seek offset, and an optional alignment multiple. When the alignment
//! multiple is non-zero, the backing region is allocated so that the
//! visible pointer is aligned, which is what makes the buffer directly
//! usable for `O_DIRECT` reads and writes.
//!
//! The *append protocol* is the sole way to extend a buffer's logical
//! size: [`setup_append`](BaseBuffer::setup_append) reserves up to `n`
//! bytes and hands out the writable region,
//! [`commit_append`](BaseBuffer::commit_append) makes `k ≤ n` of them
//! permanent, and [`abort_append`](BaseBuffer::abort_append) releases the
//! reservation. At most one append may be outstanding; violating the
//! protocol is a programmer error and panics.

use crate::chain::WriteToken;
use crate::memory::AllocationLease;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// The backing region of a buffer: either an alignment-aware allocation of
/// our own or a caller-provided boxed region.
#[derive(Debug)]
enum Region {
    Aligned { ptr: NonNull<u8>, layout: Layout },
    Boxed(Box<[u8]>),
}

// The aligned variant is a uniquely owned heap region, so moving it across
// threads is fine.
unsafe impl Send for Region {}

impl Region {
    fn aligned(capacity: usize, alignment: usize) -> Self {
        let layout = Layout::from_size_align(capacity.max(1), alignment.max(1))
            .expect("invalid buffer layout");
        let ptr = unsafe { alloc(layout) };
        let ptr = NonNull::new(ptr).expect("buffer allocation failed");
        Region::Aligned { ptr, layout }
    }

    fn as_slice(&self) -> &[u8] {
        match self {
            Region::Aligned { ptr, layout } => unsafe {
                std::slice::from_raw_parts(ptr.as_ptr(), layout.size())
            },
            Region::Boxed(memory) => memory,
        }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Region::Aligned { ptr, layout } => unsafe {
                std::slice::from_raw_parts_mut(ptr.as_ptr(), layout.size())
            },
            Region::Boxed(memory) => memory,
        }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Region::Aligned { ptr, layout } = self {
            unsafe { dealloc(ptr.as_ptr(), *layout) };
        }
    }
}

/// A fixed-capacity, optionally aligned byte buffer.
#[derive(Debug)]
pub struct BaseBuffer {
    region: Option<Region>,
    lease: Option<AllocationLease>,
    /// Seek offset into the region; the visible buffer starts here.
    start: usize,
    /// Capacity at construction time; the visible capacity is
    /// `max_capacity - start`.
    max_capacity: usize,
    current_size: usize,
    alignment: usize,
    pending_append: Option<usize>,
    token: Option<WriteToken>,
}

impl BaseBuffer {
    /// Creates a buffer backed by a freshly allocated region.
    ///
    /// If `alignment` is non-zero the region's base pointer is aligned to
    /// it.
    pub fn new(capacity: usize, alignment: usize) -> Self {
        BaseBuffer {
            region: Some(Region::aligned(capacity, alignment)),
            lease: None,
            start: 0,
            max_capacity: capacity,
            current_size: 0,
            alignment,
            pending_append: None,
            token: None,
        }
    }

    /// Creates a buffer like [`new`](Self::new) whose backing bytes are
    /// paid for by an allocator lease.
    pub fn with_lease(capacity: usize, alignment: usize, lease: AllocationLease) -> Self {
        let mut buffer = Self::new(capacity, alignment);
        buffer.lease = Some(lease);
        buffer
    }

    /// Wraps a caller-provided region; the buffer starts empty and no
    /// alignment is guaranteed.
    pub fn wrapping(memory: Box<[u8]>) -> Self {
        let capacity = memory.len();
        BaseBuffer {
            region: Some(Region::Boxed(memory)),
            lease: None,
            start: 0,
            max_capacity: capacity,
            current_size: 0,
            alignment: 0,
            pending_append: None,
            token: None,
        }
    }

    /// The visible capacity, reduced by any forward seek.
    pub fn capacity(&self) -> usize {
        self.max_capacity - self.start
    }

    /// The number of valid bytes currently in the buffer.
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Truncates or extends the logical size without touching the bytes.
    pub fn set_current_size(&mut self, size: usize) {
        assert!(
            size <= self.capacity(),
            "can't set size {} beyond the buffer capacity {}",
            size,
            self.capacity()
        );
        self.current_size = size;
    }

    pub fn is_empty(&self) -> bool {
        self.current_size == 0
    }

    pub fn is_full(&self) -> bool {
        self.current_size == self.capacity()
    }

    /// The alignment multiple this buffer was created with (0 = unaligned).
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// The valid contents of the buffer.
    pub fn bytes(&self) -> &[u8] {
        match &self.region {
            Some(region) => &region.as_slice()[self.start..self.start + self.current_size],
            None => &[],
        }
    }

    /// Moves the visible start of the buffer forward, shrinking the
    /// capacity and reducing the size by at most `offset`.
    pub fn seek_forward(&mut self, offset: usize) {
        assert!(
            offset <= self.capacity(),
            "tried to seek forward {} bytes, but capacity is {}",
            offset,
            self.capacity()
        );
        self.start += offset;
        self.current_size -= self.current_size.min(offset);
    }

    /// Reverses a forward seek, bounded by the original start of the
    /// buffer.
    pub fn seek_backward(&mut self, offset: usize) {
        assert!(
            offset <= self.start,
            "tried to seek backward {} bytes, but this would put us {} bytes before the start \
             of the buffer",
            offset,
            offset - self.start
        );
        self.start -= offset;
        self.current_size += offset;
    }

    /// Appends `data`, panicking on overflow. This is a convenience that
    /// performs [`setup_append`](Self::setup_append) and
    /// [`commit_append`](Self::commit_append) internally.
    pub fn append(&mut self, data: &[u8]) {
        let region = self.setup_append(data.len());
        region[..data.len()].copy_from_slice(data);
        self.commit_append(data.len());
    }

    /// Reserves up to `max_length` bytes at the end of the buffer and
    /// returns the writable region.
    ///
    /// Panics if the reservation would overflow the buffer or if another
    /// append is already outstanding.
    pub fn setup_append(&mut self, max_length: usize) -> &mut [u8] {
        assert!(
            self.current_size + max_length <= self.capacity(),
            "the append you're about to do would run off the end of the buffer: you want {} \
             bytes and the buffer has {} left ({} / {})",
            max_length,
            self.capacity() - self.current_size,
            self.current_size,
            self.capacity()
        );
        assert!(
            self.pending_append.is_none(),
            "tried to set up an append while another append was outstanding"
        );
        self.pending_append = Some(max_length);
        let offset = self.start + self.current_size;
        let region = self.region.as_mut().expect("buffer has no backing memory");
        &mut region.as_mut_slice()[offset..offset + max_length]
    }

    /// Commits `actual_length` bytes of the outstanding append.
    pub fn commit_append(&mut self, actual_length: usize) {
        let max_length = self
            .pending_append
            .take()
            .expect("tried to commit an append that was never set up");
        assert!(
            actual_length <= max_length,
            "appended {} bytes but promised at most {}",
            actual_length,
            max_length
        );
        self.current_size += actual_length;
    }

    /// Releases the outstanding append without changing the buffer.
    pub fn abort_append(&mut self) {
        assert!(
            self.pending_append.take().is_some(),
            "tried to abort an append that was never set up"
        );
    }

    /// Whether an append is outstanding.
    pub fn has_pending_append(&self) -> bool {
        self.pending_append.is_some()
    }

    /// Re-borrows the region reserved by the outstanding append.
    pub(crate) fn pending_region(&mut self) -> &mut [u8] {
        let max_length = self
            .pending_append
            .expect("no append is outstanding on this buffer");
        let offset = self.start + self.current_size;
        let region = self.region.as_mut().expect("buffer has no backing memory");
        &mut region.as_mut_slice()[offset..offset + max_length]
    }

    /// Steals the backing memory of another buffer, along with its
    /// geometry, lease, and token.
    ///
    /// The donor is left without memory: zero capacity, zero size, nothing
    /// to free on drop. This is the one legal transfer of a backing region
    /// and is how a byte-stream buffer becomes a KV buffer without a copy.
    pub fn steal_memory(&mut self, donor: &mut BaseBuffer) {
        assert!(
            donor.region.is_some(),
            "tried to steal from a buffer whose memory is already gone"
        );
        self.region = donor.region.take();
        self.lease = donor.lease.take();
        self.start = donor.start;
        self.max_capacity = donor.max_capacity;
        self.current_size = donor.current_size;
        self.alignment = donor.alignment;
        self.pending_append = donor.pending_append.take();
        self.token = donor.token.take();

        donor.start = 0;
        donor.max_capacity = 0;
        donor.current_size = 0;
        donor.alignment = 0;
    }

    /// Clears the buffer's contents and any attached token.
    pub fn clear(&mut self) {
        self.current_size = 0;
        self.pending_append = None;
        self.token = None;
    }

    /// Attaches a write token for downstream scheduling.
    pub fn set_token(&mut self, token: WriteToken) {
        self.token = Some(token);
    }

    /// Detaches the write token, if any.
    pub fn take_token(&mut self) -> Option<WriteToken> {
        self.token.take()
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_protocol() {
        let mut buffer = BaseBuffer::new(16, 0);
        let region = buffer.setup_append(8);
        region[..3].copy_from_slice(b"abc");
        buffer.commit_append(3);
        assert_eq!(buffer.current_size(), 3);

        buffer.setup_append(4);
        buffer.abort_append();
        assert_eq!(buffer.current_size(), 3);

        buffer.append(b"de");
        assert_eq!(buffer.bytes(), b"abcde");
    }

    #[test]
    #[should_panic(expected = "another append was outstanding")]
    fn test_double_setup_panics() {
        let mut buffer = BaseBuffer::new(16, 0);
        buffer.setup_append(4);
        buffer.setup_append(4);
    }

    #[test]
    #[should_panic(expected = "run off the end of the buffer")]
    fn test_append_overflow_panics() {
        let mut buffer = BaseBuffer::new(4, 0);
        buffer.append(b"12345");
    }

    #[test]
    #[should_panic(expected = "promised at most")]
    fn test_commit_more_than_promised_panics() {
        let mut buffer = BaseBuffer::new(16, 0);
        buffer.setup_append(2);
        buffer.commit_append(3);
    }

    #[test]
    fn test_seek_round_trip() {
        let mut buffer = BaseBuffer::new(16, 0);
        buffer.append(b"0123456789");

        buffer.seek_forward(4);
        assert_eq!(buffer.capacity(), 12);
        assert_eq!(buffer.current_size(), 6);
        assert_eq!(buffer.bytes(), b"456789");

        buffer.seek_backward(4);
        assert_eq!(buffer.capacity(), 16);
        assert_eq!(buffer.current_size(), 10);
        assert_eq!(buffer.bytes(), b"0123456789");
    }

    #[test]
    fn test_seek_past_size_zeroes_size() {
        let mut buffer = BaseBuffer::new(16, 0);
        buffer.append(b"abc");
        buffer.seek_forward(8);
        assert_eq!(buffer.current_size(), 0);
        assert_eq!(buffer.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "before the start")]
    fn test_seek_backward_past_start_panics() {
        let mut buffer = BaseBuffer::new(16, 0);
        buffer.seek_forward(2);
        buffer.seek_backward(3);
    }

    #[test]
    fn test_alignment() {
        for alignment in [512, 4096] {
            let buffer = BaseBuffer::new(alignment * 2, alignment);
            assert_eq!(buffer.bytes().as_ptr() as usize % alignment, 0);
        }
    }

    #[test]
    fn test_steal_memory() {
        let mut donor = BaseBuffer::new(16, 512);
        donor.append(b"payload");

        let mut thief = BaseBuffer::new(1, 0);
        thief.steal_memory(&mut donor);

        assert_eq!(thief.bytes(), b"payload");
        assert_eq!(thief.capacity(), 16);
        assert_eq!(thief.alignment(), 512);

        // The donor must be fully zeroed: no capacity, no size, and
        // dropping it must not free the stolen region.
        assert_eq!(donor.capacity(), 0);
        assert_eq!(donor.current_size(), 0);
        assert_eq!(donor.alignment(), 0);
        drop(donor);
        assert_eq!(thief.bytes(), b"payload");
    }

    #[test]
    fn test_wrapping() {
        let mut buffer = BaseBuffer::wrapping(vec![0u8; 8].into_boxed_slice());
        assert_eq!(buffer.capacity(), 8);
        buffer.append(b"ok");
        assert_eq!(buffer.bytes(), b"ok");
    }
}
