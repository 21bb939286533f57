/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Buffers whose payload is a sequence of framed MapReduce tuples.

use crate::buffers::BaseBuffer;
use crate::chain::WriteToken;
use crate::memory::AllocationLease;
use crate::tuple::{self, KeyValuePair};
use std::collections::BTreeSet;

/// Per-buffer tuple statistics, cached until a raw append stales them.
#[derive(Debug, Clone, Copy)]
struct TupleStats {
    num_tuples: u64,
    min_key_length: u32,
    max_key_length: u32,
}

#[derive(Debug, Clone, Copy)]
struct PendingKvAppend {
    key_length: u32,
    max_value_length: u32,
}

/// A buffer carrying framed key/value tuples, plus the routing tags the
/// pipeline stages use to steer it.
///
/// The buffer keeps an intra-buffer cursor for
/// [`next_kv_pair`](Self::next_kv_pair) and caches `num_tuples` and the
/// minimum/maximum key length. The cache is invalidated by any raw append
/// and recomputed on demand by walking the framed tuples.
///
/// When a fixed `(key_length, value_length)` layout is configured the
/// buffer serializes and deserializes tuples *headerless*, saving eight
/// bytes per tuple; this is only legal when the schema is fixed end to
/// end.
#[derive(Debug)]
pub struct KvPairBuffer {
    base: BaseBuffer,
    cursor: usize,
    stats: Option<TupleStats>,
    pending_kv: Option<PendingKvAppend>,
    /// `Some((key_length, value_length))` selects the headerless layout.
    fixed_layout: Option<(u32, u32)>,

    job_ids: BTreeSet<u64>,
    /// The partition (logical disk) this buffer is destined for.
    pub logical_disk_id: Option<u64>,
    pub partition_group: Option<u64>,
    /// Sub-partition id for large partitions split in the merge phase.
    pub chunk_id: Option<u64>,
    /// Originating (or destination) peer.
    pub node: Option<u64>,
    pub source_name: Option<String>,
}

impl KvPairBuffer {
    pub fn new(capacity: usize, alignment: usize) -> Self {
        Self::from_base(BaseBuffer::new(capacity, alignment))
    }

    pub fn with_lease(capacity: usize, alignment: usize, lease: AllocationLease) -> Self {
        Self::from_base(BaseBuffer::with_lease(capacity, alignment, lease))
    }

    /// Wraps an existing base buffer; its current contents must end on a
    /// tuple boundary.
    pub fn from_base(base: BaseBuffer) -> Self {
        KvPairBuffer {
            base,
            cursor: 0,
            stats: None,
            pending_kv: None,
            fixed_layout: None,
            job_ids: BTreeSet::new(),
            logical_disk_id: None,
            partition_group: None,
            chunk_id: None,
            node: None,
            source_name: None,
        }
    }

    /// Builds a KV buffer by stealing the backing memory of `donor`,
    /// avoiding a copy. The donor is left empty.
    pub fn stealing_from(donor: &mut BaseBuffer) -> Self {
        let mut base = BaseBuffer::new(0, 0);
        base.steal_memory(donor);
        Self::from_base(base)
    }

    /// Switches this buffer to the headerless fixed-size layout.
    pub fn set_fixed_layout(&mut self, key_length: u32, value_length: u32) {
        self.fixed_layout = Some((key_length, value_length));
        self.stats = None;
    }

    pub fn fixed_layout(&self) -> Option<(u32, u32)> {
        self.fixed_layout
    }

    // Delegated geometry. Appends funnel through the methods below so the
    // tuple statistics cache stays honest.

    pub fn capacity(&self) -> usize {
        self.base.capacity()
    }

    pub fn current_size(&self) -> usize {
        self.base.current_size()
    }

    pub fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub fn alignment(&self) -> usize {
        self.base.alignment()
    }

    pub fn bytes(&self) -> &[u8] {
        self.base.bytes()
    }

    pub fn set_token(&mut self, token: WriteToken) {
        self.base.set_token(token)
    }

    pub fn take_token(&mut self) -> Option<WriteToken> {
        self.base.take_token()
    }

    pub fn has_token(&self) -> bool {
        self.base.has_token()
    }

    /// Raw byte append; invalidates the tuple statistics cache.
    pub fn append(&mut self, data: &[u8]) {
        self.base.append(data);
        self.stats = None;
    }

    /// Reserves a raw append region; see [`BaseBuffer::setup_append`].
    pub fn setup_append(&mut self, max_length: usize) -> &mut [u8] {
        self.base.setup_append(max_length)
    }

    /// Raw pointer to the outstanding append's region, for asynchronous
    /// I/O submission.
    pub(crate) fn pending_region_ptr(&mut self) -> *mut u8 {
        self.base.pending_region().as_mut_ptr()
    }

    /// Commits a raw append; invalidates the tuple statistics cache.
    pub fn commit_append(&mut self, actual_length: usize) {
        self.base.commit_append(actual_length);
        self.stats = None;
    }

    pub fn abort_append(&mut self) {
        self.base.abort_append()
    }

    pub fn set_current_size(&mut self, size: usize) {
        self.base.set_current_size(size);
        self.stats = None;
    }

    /// Advances the visible start of the buffer past `offset` bytes; the
    /// cursor and statistics are reset to the new view.
    pub fn seek_forward(&mut self, offset: usize) {
        self.base.seek_forward(offset);
        self.cursor = 0;
        self.stats = None;
    }

    /// Takes the backing memory out of this buffer as a plain base buffer,
    /// leaving this buffer empty.
    pub fn take_base(&mut self) -> BaseBuffer {
        let mut base = BaseBuffer::new(0, 0);
        base.steal_memory(&mut self.base);
        self.stats = None;
        self.cursor = 0;
        base
    }

    /// Appends one tuple, keeping the statistics cache up to date.
    pub fn add_kv_pair(&mut self, pair: &KeyValuePair) {
        let key_length = pair.key.len() as u32;
        let value_length = pair.value.len() as u32;

        match self.fixed_layout {
            None => {
                let size = pair.write_size();
                let region = self.base.setup_append(size);
                pair.serialize_into(region);
                self.base.commit_append(size);
            }
            Some((fixed_key, fixed_value)) => {
                assert!(
                    key_length == fixed_key && value_length == fixed_value,
                    "headerless buffers require fixed ({}, {}) tuples; got ({}, {})",
                    fixed_key,
                    fixed_value,
                    key_length,
                    value_length
                );
                let size = tuple::tuple_size_without_header(key_length, value_length);
                let region = self.base.setup_append(size);
                region[..pair.key.len()].copy_from_slice(pair.key);
                region[pair.key.len()..size].copy_from_slice(pair.value);
                self.base.commit_append(size);
            }
        }

        if let Some(stats) = &mut self.stats {
            stats.num_tuples += 1;
            stats.min_key_length = stats.min_key_length.min(key_length);
            stats.max_key_length = stats.max_key_length.max(key_length);
        } else if self.cursor == 0 && self.current_size() == self.tuple_len_of(pair) {
            // First tuple in a fresh buffer: seed the cache.
            self.stats = Some(TupleStats {
                num_tuples: 1,
                min_key_length: key_length,
                max_key_length: key_length,
            });
        }
    }

    fn tuple_len_of(&self, pair: &KeyValuePair) -> usize {
        match self.fixed_layout {
            None => pair.write_size(),
            Some(_) => pair.key.len() + pair.value.len(),
        }
    }

    /// Yields the next tuple at the cursor, or [`None`] at the end of the
    /// buffer.
    pub fn next_kv_pair(&mut self) -> Option<KeyValuePair<'_>> {
        if self.cursor == self.current_size() {
            return None;
        }
        let bytes = self.base.bytes();
        let pair = match self.fixed_layout {
            None => KeyValuePair::deserialize(&bytes[self.cursor..]),
            Some((key_length, value_length)) => KeyValuePair::deserialize_without_header(
                &bytes[self.cursor..],
                key_length,
                value_length,
            ),
        };
        let read = self.tuple_len_of(&pair);
        assert!(
            self.cursor + read <= self.current_size(),
            "deserialized a tuple ({} bytes) too large to be at offset {} of a {}-byte buffer",
            read,
            self.cursor,
            self.current_size()
        );
        self.cursor += read;
        Some(pair)
    }

    /// Peeks at the next tuple without advancing the cursor.
    pub fn peek_kv_pair(&self) -> Option<KeyValuePair<'_>> {
        if self.cursor == self.current_size() {
            return None;
        }
        let bytes = self.base.bytes();
        Some(match self.fixed_layout {
            None => KeyValuePair::deserialize(&bytes[self.cursor..]),
            Some((key_length, value_length)) => KeyValuePair::deserialize_without_header(
                &bytes[self.cursor..],
                key_length,
                value_length,
            ),
        })
    }

    pub fn reset_iterator(&mut self) {
        self.cursor = 0;
    }

    pub fn iterator_position(&self) -> usize {
        self.cursor
    }

    pub fn set_iterator_position(&mut self, position: usize) {
        self.cursor = position;
    }

    /// Reserves space for one tuple and returns the key and value regions
    /// so the caller can fill them in place.
    ///
    /// Must be paired with [`commit_append_kv_pair`](Self::commit_append_kv_pair)
    /// or [`abort_append_kv_pair`](Self::abort_append_kv_pair).
    pub fn setup_append_kv_pair(
        &mut self,
        key_length: u32,
        max_value_length: u32,
    ) -> (&mut [u8], &mut [u8]) {
        assert!(
            self.pending_kv.is_none(),
            "setup_append_kv_pair called with a KV append already outstanding"
        );
        self.pending_kv = Some(PendingKvAppend {
            key_length,
            max_value_length,
        });

        match self.fixed_layout {
            None => {
                let size = tuple::tuple_size(key_length, max_value_length);
                let region = self.base.setup_append(size);
                tuple::set_key_length(region, key_length);
                tuple::set_value_length(region, max_value_length);
                let (_, payload) = region.split_at_mut(tuple::HEADER_SIZE);
                payload.split_at_mut(key_length as usize)
            }
            Some((fixed_key, fixed_value)) => {
                assert!(
                    key_length == fixed_key && max_value_length == fixed_value,
                    "headerless buffers require fixed ({}, {}) tuples; got ({}, {})",
                    fixed_key,
                    fixed_value,
                    key_length,
                    max_value_length
                );
                let size = tuple::tuple_size_without_header(key_length, max_value_length);
                let region = self.base.setup_append(size);
                region.split_at_mut(key_length as usize)
            }
        }
    }

    /// Commits the tuple reserved by
    /// [`setup_append_kv_pair`](Self::setup_append_kv_pair), fixing the
    /// header for the value length actually written.
    pub fn commit_append_kv_pair(&mut self, actual_value_length: u32) {
        let pending = self
            .pending_kv
            .take()
            .expect("commit_append_kv_pair without setup_append_kv_pair");
        assert!(
            actual_value_length <= pending.max_value_length,
            "value length {} cannot be larger than the promised maximum {}",
            actual_value_length,
            pending.max_value_length
        );

        match self.fixed_layout {
            None => {
                let region = self.base.pending_region();
                tuple::set_value_length(region, actual_value_length);
                self.base
                    .commit_append(tuple::tuple_size(pending.key_length, actual_value_length));
            }
            Some(_) => {
                assert!(
                    actual_value_length == pending.max_value_length,
                    "headerless tuples cannot shrink their value"
                );
                self.base.commit_append(tuple::tuple_size_without_header(
                    pending.key_length,
                    actual_value_length,
                ));
            }
        }

        if let Some(stats) = &mut self.stats {
            stats.num_tuples += 1;
            stats.min_key_length = stats.min_key_length.min(pending.key_length);
            stats.max_key_length = stats.max_key_length.max(pending.key_length);
        }
    }

    /// Abandons the tuple reserved by
    /// [`setup_append_kv_pair`](Self::setup_append_kv_pair).
    pub fn abort_append_kv_pair(&mut self) {
        assert!(
            self.pending_kv.take().is_some(),
            "abort_append_kv_pair without setup_append_kv_pair"
        );
        self.base.abort_append();
    }

    pub fn num_tuples(&mut self) -> u64 {
        self.tuple_stats().num_tuples
    }

    pub fn min_key_length(&mut self) -> u32 {
        self.tuple_stats().min_key_length
    }

    pub fn max_key_length(&mut self) -> u32 {
        self.tuple_stats().max_key_length
    }

    fn tuple_stats(&mut self) -> TupleStats {
        if let Some(stats) = self.stats {
            return stats;
        }

        let bytes = self.base.bytes();
        let mut offset = 0;
        let mut stats = TupleStats {
            num_tuples: 0,
            min_key_length: u32::MAX,
            max_key_length: 0,
        };
        while offset < bytes.len() {
            let (key_length, size) = match self.fixed_layout {
                None => {
                    let tuple = &bytes[offset..];
                    (tuple::key_length(tuple), tuple::framed_size(tuple))
                }
                Some((key_length, value_length)) => (
                    key_length,
                    tuple::tuple_size_without_header(key_length, value_length),
                ),
            };
            stats.num_tuples += 1;
            stats.min_key_length = stats.min_key_length.min(key_length);
            stats.max_key_length = stats.max_key_length.max(key_length);
            offset += size;
        }
        assert!(
            offset == bytes.len(),
            "KV buffer must end on a clean tuple boundary, but found {} extra bytes",
            offset - bytes.len()
        );
        if stats.num_tuples == 0 {
            stats.min_key_length = 0;
        }

        self.stats = Some(stats);
        stats
    }

    // Routing tags.

    pub fn add_job_id(&mut self, job_id: u64) {
        self.job_ids.insert(job_id);
    }

    pub fn add_job_ids(&mut self, job_ids: impl IntoIterator<Item = u64>) {
        self.job_ids.extend(job_ids);
    }

    pub fn job_ids(&self) -> &BTreeSet<u64> {
        &self.job_ids
    }

    /// The single job id this buffer is tagged with.
    ///
    /// Panics when the buffer carries zero or several job ids; stages past
    /// the mapper require exactly one.
    pub fn sole_job_id(&self) -> u64 {
        assert!(
            self.job_ids.len() == 1,
            "expected this buffer to have exactly one job id, but it has {}",
            self.job_ids.len()
        );
        *self.job_ids.iter().next().unwrap()
    }

    /// Clears contents, cursor, cache and all tags.
    pub fn clear(&mut self) {
        self.base.clear();
        self.cursor = 0;
        self.stats = None;
        self.pending_kv = None;
        self.job_ids.clear();
        self.logical_disk_id = None;
        self.partition_group = None;
        self.chunk_id = None;
        self.node = None;
        self.source_name = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair<'a>(key: &'a [u8], value: &'a [u8]) -> KeyValuePair<'a> {
        KeyValuePair::new(key, value)
    }

    #[test]
    fn test_iteration_matches_insertion() {
        let mut buffer = KvPairBuffer::new(1024, 0);
        let tuples: Vec<(&[u8], &[u8])> =
            vec![(b"alpha", b"1"), (b"beta", b"22"), (b"gamma", b"333")];
        for (key, value) in &tuples {
            buffer.add_kv_pair(&pair(key, value));
        }

        for (key, value) in &tuples {
            let read = buffer.next_kv_pair().unwrap();
            assert_eq!(read.key, *key);
            assert_eq!(read.value, *value);
        }
        assert!(buffer.next_kv_pair().is_none());

        buffer.reset_iterator();
        assert_eq!(buffer.next_kv_pair().unwrap().key, b"alpha");
    }

    #[test]
    fn test_tuple_stats() {
        let mut buffer = KvPairBuffer::new(1024, 0);
        buffer.add_kv_pair(&pair(b"ab", b"x"));
        buffer.add_kv_pair(&pair(b"abcdef", b"y"));
        assert_eq!(buffer.num_tuples(), 2);
        assert_eq!(buffer.min_key_length(), 2);
        assert_eq!(buffer.max_key_length(), 6);

        // A raw append stales the cache; it must be recomputed.
        let extra = pair(b"abcd", b"zz");
        let mut framed = vec![0; extra.write_size()];
        extra.serialize_into(&mut framed);
        buffer.append(&framed);
        assert_eq!(buffer.num_tuples(), 3);
        assert_eq!(buffer.max_key_length(), 6);
        assert_eq!(buffer.min_key_length(), 2);
    }

    #[test]
    fn test_setup_commit_append_kv_pair() {
        let mut buffer = KvPairBuffer::new(1024, 0);
        {
            let (key, value) = buffer.setup_append_kv_pair(3, 10);
            key.copy_from_slice(b"key");
            value[..4].copy_from_slice(b"val!");
        }
        buffer.commit_append_kv_pair(4);

        let read = buffer.next_kv_pair().unwrap();
        assert_eq!(read.key, b"key");
        assert_eq!(read.value, b"val!");
    }

    #[test]
    fn test_abort_append_kv_pair() {
        let mut buffer = KvPairBuffer::new(64, 0);
        buffer.setup_append_kv_pair(4, 4);
        buffer.abort_append_kv_pair();
        assert_eq!(buffer.current_size(), 0);
        assert!(buffer.next_kv_pair().is_none());
    }

    #[test]
    fn test_headerless_layout() {
        let mut buffer = KvPairBuffer::new(1024, 0);
        buffer.set_fixed_layout(10, 90);

        let key = [7u8; 10];
        let value = [9u8; 90];
        buffer.add_kv_pair(&pair(&key, &value));
        assert_eq!(buffer.current_size(), 100);

        let read = buffer.next_kv_pair().unwrap();
        assert_eq!(read.key, &key);
        assert_eq!(read.value, &value);
        assert_eq!(buffer.num_tuples(), 1);
    }

    #[test]
    fn test_stealing_from() {
        let mut donor = BaseBuffer::new(64, 512);
        let tuple = pair(b"k", b"v");
        let mut framed = vec![0; tuple.write_size()];
        tuple.serialize_into(&mut framed);
        donor.append(&framed);

        let mut kv = KvPairBuffer::stealing_from(&mut donor);
        assert_eq!(donor.capacity(), 0);
        let read = kv.next_kv_pair().unwrap();
        assert_eq!(read.key, b"k");
        assert_eq!(read.value, b"v");
    }
}
