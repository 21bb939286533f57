/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The sorter stage and its allocation validator.

use crate::buffers::KvPairBuffer;
use crate::memory::{CallerId, MemoryAllocator};
use crate::sort::{ordered_strategies, SortAlgorithm, SortStrategy, SortStrategyKind};
use crate::stage::{Tracker, Worker};
use anyhow::Result;
use std::sync::Arc;

fn select_strategy<'a>(
    strategies: &'a mut [Box<dyn SortStrategy>],
    buffer: &mut KvPairBuffer,
    max_radix_sort_scratch_size: u64,
) -> Option<(&'a mut Box<dyn SortStrategy>, u64)> {
    let equal_length_keys = buffer.min_key_length() == buffer.max_key_length();
    for strategy in strategies {
        let scratch = strategy.required_scratch_bytes(buffer);
        // Radix sort is only usable when every key has the same length and
        // its scratch stays under the configured ceiling.
        if strategy.algorithm() == SortAlgorithm::RadixSort
            && (!equal_length_keys || scratch > max_radix_sort_scratch_size)
        {
            continue;
        }
        return Some((strategy, scratch));
    }
    None
}

/// One input buffer in, one sorted buffer of equal size out.
///
/// A sample-aware sorter leaves the leading sample-metadata tuple in
/// place and sorts the tuples after it; phase zero uses it so the
/// metadata stays the first tuple of every sample buffer.
pub struct Sorter {
    strategies: Vec<Box<dyn SortStrategy>>,
    max_radix_sort_scratch_size: u64,
    allocator: Arc<MemoryAllocator>,
    caller: CallerId,
    alignment: usize,
    sample_aware: bool,
    downstream: Tracker<KvPairBuffer>,
    tuples_in: u64,
    bytes_in: u64,
}

impl Sorter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: SortStrategyKind,
        use_secondary_keys: bool,
        max_radix_sort_scratch_size: u64,
        allocator: Arc<MemoryAllocator>,
        alignment: usize,
        sample_aware: bool,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        let caller = allocator.register_caller("sorter");
        Sorter {
            strategies: ordered_strategies(kind, use_secondary_keys),
            max_radix_sort_scratch_size,
            allocator,
            caller,
            alignment,
            sample_aware,
            downstream,
            tuples_in: 0,
            bytes_in: 0,
        }
    }
}

impl Worker for Sorter {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "sorter"
    }

    fn process(&mut self, mut input: Self::Input) -> Result<()> {
        let bytes_in = input.current_size();
        let tuples_in = input.num_tuples();

        let mut output = {
            let (_, scratch) = select_strategy(
                &mut self.strategies,
                &mut input,
                self.max_radix_sort_scratch_size,
            )
            .expect("could not find an acceptable sort strategy");

            // One lease covers the output buffer and the strategy's
            // scratch tables, released together when the output buffer is
            // dropped downstream.
            let lease = self.allocator.allocate(
                self.caller,
                bytes_in as u64 + scratch + self.alignment as u64,
            )?;
            KvPairBuffer::with_lease(bytes_in, self.alignment, lease)
        };

        output.logical_disk_id = input.logical_disk_id;
        output.partition_group = input.partition_group;
        output.chunk_id = input.chunk_id;
        output.add_job_ids(input.job_ids().iter().copied());
        if let Some(node) = input.node {
            output.node = Some(node);
        }

        if self.sample_aware {
            // Keep the sample-metadata tuple first and out of the sort.
            input.reset_iterator();
            let metadata_size = {
                let metadata = input
                    .next_kv_pair()
                    .expect("sample buffer arrived without a metadata tuple");
                output.add_kv_pair(&metadata);
                metadata.write_size()
            };
            input.seek_forward(metadata_size);
        }

        let (strategy, _) = select_strategy(
            &mut self.strategies,
            &mut input,
            self.max_radix_sort_scratch_size,
        )
        .expect("could not find an acceptable sort strategy");
        strategy.sort(&mut input, &mut output);

        assert!(
            output.current_size() == bytes_in,
            "sorter output size is not equal to input size ({} bytes != {} bytes)",
            output.current_size(),
            bytes_in
        );
        assert!(
            output.num_tuples() == tuples_in,
            "sorter output tuple count is not equal to input tuple count ({} != {})",
            output.num_tuples(),
            tuples_in
        );

        self.tuples_in += tuples_in;
        self.bytes_in += bytes_in as u64;
        self.downstream.send(output)
    }

    fn teardown(&mut self) -> Result<()> {
        log::info!(
            "sorter done: {} tuples, {} bytes",
            self.tuples_in,
            self.bytes_in
        );
        Ok(())
    }
}

/// Drops buffers whose sort would not fit in the allocator's budget.
///
/// Sorting a buffer needs the output buffer plus the strategy's scratch on
/// top of the input itself; a buffer for which that sum exceeds the
/// allocator's capacity would park the sorter in an unsatisfiable
/// allocation forever, so the validator discards it up front.
pub struct SortValidator {
    strategies: Vec<Box<dyn SortStrategy>>,
    max_radix_sort_scratch_size: u64,
    allocator_capacity: u64,
    downstream: Tracker<KvPairBuffer>,
    dropped: u64,
}

impl SortValidator {
    pub fn new(
        kind: SortStrategyKind,
        use_secondary_keys: bool,
        max_radix_sort_scratch_size: u64,
        allocator_capacity: u64,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        SortValidator {
            strategies: ordered_strategies(kind, use_secondary_keys),
            max_radix_sort_scratch_size,
            allocator_capacity,
            downstream,
            dropped: 0,
        }
    }
}

impl Worker for SortValidator {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "sort-validator"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        let scratch = select_strategy(
            &mut self.strategies,
            &mut buffer,
            self.max_radix_sort_scratch_size,
        )
        .map(|(_, scratch)| scratch)
        .unwrap_or(0);

        let required = buffer.capacity() as u64 + scratch + buffer.current_size() as u64;
        if required > self.allocator_capacity {
            self.dropped += 1;
            log::warn!(
                "dropping a {}-byte buffer whose sort needs {} bytes against a {}-byte budget",
                buffer.current_size(),
                required,
                self.allocator_capacity
            );
            return Ok(());
        }
        self.downstream.send(buffer)
    }

    fn teardown(&mut self) -> Result<()> {
        if self.dropped > 0 {
            log::warn!("sort validator dropped {} oversized buffers", self.dropped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;
    use crate::tuple::KeyValuePair;

    fn run_sorter(input: KvPairBuffer, sample_aware: bool) -> KvPairBuffer {
        let allocator = MemoryAllocator::new(1 << 24);
        let (tracker, receiver) = work_queue("sorted", 4);
        let mut sorter = Sorter::new(
            SortStrategyKind::Any,
            false,
            1 << 20,
            allocator,
            0,
            sample_aware,
            tracker,
        );
        sorter.process(input).unwrap();
        receiver.try_recv().unwrap()
    }

    #[test]
    fn test_selects_radix_for_equal_length_keys() {
        // All keys are 10 bytes: radix must be eligible and first.
        let mut strategies = ordered_strategies(SortStrategyKind::Any, false);
        let mut buffer = KvPairBuffer::new(1 << 12, 0);
        for i in 0..4u32 {
            buffer.add_kv_pair(&KeyValuePair::new(format!("key-{:05}", i).as_bytes(), b"v"));
        }
        let (strategy, _) = select_strategy(&mut strategies, &mut buffer, 1 << 20).unwrap();
        assert_eq!(strategy.algorithm(), SortAlgorithm::RadixSort);
    }

    #[test]
    fn test_selects_quick_for_mixed_key_lengths() {
        let mut strategies = ordered_strategies(SortStrategyKind::Any, false);
        let mut buffer = KvPairBuffer::new(1 << 12, 0);
        buffer.add_kv_pair(&KeyValuePair::new(b"0123456789", b"v"));
        buffer.add_kv_pair(&KeyValuePair::new(b"0123456789a", b"v"));
        let (strategy, _) = select_strategy(&mut strategies, &mut buffer, 1 << 20).unwrap();
        assert_eq!(strategy.algorithm(), SortAlgorithm::QuickSort);
    }

    #[test]
    fn test_selects_quick_when_radix_scratch_too_large() {
        let mut strategies = ordered_strategies(SortStrategyKind::Any, false);
        let mut buffer = KvPairBuffer::new(1 << 12, 0);
        for _ in 0..8 {
            buffer.add_kv_pair(&KeyValuePair::new(b"0123456789", b"v"));
        }
        let (strategy, _) = select_strategy(&mut strategies, &mut buffer, 16).unwrap();
        assert_eq!(strategy.algorithm(), SortAlgorithm::QuickSort);
    }

    #[test]
    fn test_sorter_worker_round_trip() {
        let mut input = KvPairBuffer::new(1 << 12, 0);
        for key in [&b"delta"[..], b"alpha", b"echo", b"bravo"] {
            input.add_kv_pair(&KeyValuePair::new(key, b"v"));
        }
        input.logical_disk_id = Some(3);
        input.add_job_id(1);

        let mut output = run_sorter(input, false);
        assert_eq!(output.logical_disk_id, Some(3));
        assert_eq!(output.sole_job_id(), 1);
        let keys: Vec<Vec<u8>> =
            std::iter::from_fn(|| output.next_kv_pair().map(|pair| pair.key.to_vec())).collect();
        assert_eq!(
            keys,
            vec![
                b"alpha".to_vec(),
                b"bravo".to_vec(),
                b"delta".to_vec(),
                b"echo".to_vec()
            ]
        );
    }

    #[test]
    fn test_sample_aware_sorter_keeps_metadata_first() {
        let mut input = KvPairBuffer::new(1 << 12, 0);
        // A stand-in metadata tuple that would sort last by key.
        input.add_kv_pair(&KeyValuePair::new(b"\xff", b"metadata"));
        input.add_kv_pair(&KeyValuePair::new(b"zz", b"v"));
        input.add_kv_pair(&KeyValuePair::new(b"aa", b"v"));
        input.add_job_id(1);

        let mut output = run_sorter(input, true);
        assert_eq!(output.next_kv_pair().unwrap().value, b"metadata");
        assert_eq!(output.next_kv_pair().unwrap().key, b"aa");
        assert_eq!(output.next_kv_pair().unwrap().key, b"zz");
    }

    #[test]
    fn test_validator_drops_oversized_buffers() {
        let (tracker, receiver) = work_queue("sorter", 4);
        let mut validator =
            SortValidator::new(SortStrategyKind::Any, false, 1 << 20, 256, tracker);

        let mut small = KvPairBuffer::new(64, 0);
        small.add_kv_pair(&KeyValuePair::new(b"k", b"v"));
        validator.process(small).unwrap();
        assert!(receiver.try_recv().is_ok());

        let mut huge = KvPairBuffer::new(512, 0);
        huge.add_kv_pair(&KeyValuePair::new(b"k", b"v"));
        validator.process(huge).unwrap();
        assert!(receiver.try_recv().is_err());
    }
}
