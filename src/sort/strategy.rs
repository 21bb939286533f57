/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Sort strategy selection.
//!
//! Strategies are ordered by expected running time: radix sort first,
//! quick sort second. Radix sort is only eligible when every key in the
//! buffer has the same length and the scratch it needs stays under the
//! configured ceiling; the [`Sorter`](crate::sort::Sorter) worker checks
//! both before committing to it.

use crate::buffers::KvPairBuffer;
use crate::sort::{QuickSortStrategy, RadixSortStrategy};

/// The algorithms a sorter can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortAlgorithm {
    RadixSort,
    QuickSort,
}

/// The configured strategy choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortStrategyKind {
    RadixSort,
    QuickSort,
    /// Let the sorter pick the fastest eligible algorithm per buffer.
    #[default]
    Any,
}

impl std::str::FromStr for SortStrategyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RADIX_SORT" => Ok(SortStrategyKind::RadixSort),
            "QUICK_SORT" => Ok(SortStrategyKind::QuickSort),
            "ANY" => Ok(SortStrategyKind::Any),
            _ => anyhow::bail!(
                "unknown sort strategy {}; specify RADIX_SORT, QUICK_SORT, or ANY",
                s
            ),
        }
    }
}

/// One in-place sorting algorithm over a KV buffer.
///
/// A strategy reports the scratch memory it needs for a given input so
/// that the sorter can account for it (and the validator can refuse
/// buffers that would not fit) before any allocation happens. `sort`
/// yields an output buffer of equal size containing the sorted
/// permutation of the input tuples.
pub trait SortStrategy: Send {
    fn algorithm(&self) -> SortAlgorithm;

    /// Bytes of scratch memory `sort` will use for this input.
    fn required_scratch_bytes(&self, input: &mut KvPairBuffer) -> u64;

    /// Sorts `input` into `output`, which must have at least
    /// `input.current_size()` bytes of capacity.
    fn sort(&mut self, input: &mut KvPairBuffer, output: &mut KvPairBuffer);
}

/// Builds the ordered list of candidate strategies for a configured kind.
pub fn ordered_strategies(
    kind: SortStrategyKind,
    use_secondary_keys: bool,
) -> Vec<Box<dyn SortStrategy>> {
    let mut strategies: Vec<Box<dyn SortStrategy>> = Vec::new();
    if matches!(kind, SortStrategyKind::Any | SortStrategyKind::RadixSort) {
        strategies.push(Box::new(RadixSortStrategy::new(use_secondary_keys)));
    }
    if matches!(kind, SortStrategyKind::Any | SortStrategyKind::QuickSort) {
        strategies.push(Box::new(QuickSortStrategy::new(use_secondary_keys)));
    }
    strategies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordered_strategies() {
        let any = ordered_strategies(SortStrategyKind::Any, false);
        assert_eq!(any.len(), 2);
        assert_eq!(any[0].algorithm(), SortAlgorithm::RadixSort);
        assert_eq!(any[1].algorithm(), SortAlgorithm::QuickSort);

        let quick = ordered_strategies(SortStrategyKind::QuickSort, false);
        assert_eq!(quick.len(), 1);
        assert_eq!(quick[0].algorithm(), SortAlgorithm::QuickSort);
    }
}
