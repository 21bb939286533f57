/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The coordinator-side boundary decision protocol.

use crate::buffers::KvPairBuffer;
use crate::sort::{QuickSortStrategy, SortStrategy};
use crate::stage::{MultiQueueWorker, Receiver, Tracker};
use crate::tuple::KeyValuePair;
use anyhow::Result;

/// Merges every peer's boundary proposals into the authoritative list.
///
/// The decider blocks on one queue per peer and consumes the peers'
/// boundary buffers in lockstep: each round it takes one boundary key per
/// peer, sorts them with the sort strategy, and emits the median as the
/// authoritative boundary for that partition position. When any peer's
/// stream runs dry, all must run dry in the same round, otherwise the
/// peers disagreed on the number of partitions and the job is aborted.
///
/// Decided boundaries accumulate into chunk buffers which are broadcast
/// to every peer as they fill.
pub struct BoundaryDecider {
    num_nodes: u64,
    default_buffer_size: usize,
    downstream: Tracker<KvPairBuffer>,
    job_id: u64,
    output: Option<KvPairBuffer>,
    rounds: u64,
}

impl BoundaryDecider {
    pub fn new(
        num_nodes: u64,
        default_buffer_size: usize,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        BoundaryDecider {
            num_nodes,
            default_buffer_size,
            downstream,
            job_id: 0,
            output: None,
            rounds: 0,
        }
    }

    /// Sorts one round's proposals and returns the median key.
    fn median_of(&self, proposals: &[Vec<u8>]) -> Vec<u8> {
        let total_bytes: usize = proposals
            .iter()
            .map(|key| KeyValuePair::new(key, b"").write_size())
            .sum();

        let mut buffer = KvPairBuffer::new(total_bytes.max(1), 0);
        for key in proposals {
            buffer.add_kv_pair(&KeyValuePair::new(key, b""));
        }

        let mut sorted = KvPairBuffer::new(total_bytes.max(1), 0);
        QuickSortStrategy::new(false).sort(&mut buffer, &mut sorted);

        let median_index = (self.num_nodes - 1) / 2;
        sorted.reset_iterator();
        let mut pair = None;
        for _ in 0..=median_index {
            pair = Some(sorted.next_kv_pair().unwrap().key.to_vec());
        }
        pair.unwrap()
    }

    /// Appends a decided boundary, broadcasting the chunk if it is full.
    fn write_boundary(&mut self, key: &[u8]) -> Result<()> {
        let size = KeyValuePair::new(key, b"").write_size();
        if let Some(output) = &self.output {
            if output.capacity() - output.current_size() < size {
                let full = self.output.take().unwrap();
                self.broadcast(full)?;
            }
        }
        if self.output.is_none() {
            self.output = Some(KvPairBuffer::new(self.default_buffer_size.max(size), 0));
        }
        self.output
            .as_mut()
            .unwrap()
            .add_kv_pair(&KeyValuePair::new(key, b""));
        Ok(())
    }

    /// Sends a copy of the chunk to every node.
    fn broadcast(&mut self, chunk: KvPairBuffer) -> Result<()> {
        for node in 0..self.num_nodes {
            let mut copy = KvPairBuffer::new(chunk.current_size().max(1), 0);
            copy.append(chunk.bytes());
            copy.node = Some(node);
            copy.add_job_id(self.job_id);
            self.downstream.send(copy)?;
        }
        Ok(())
    }
}

impl MultiQueueWorker for BoundaryDecider {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "boundary-decider"
    }

    fn run(&mut self, queues: &[Receiver<KvPairBuffer>]) -> Result<()> {
        assert!(
            queues.len() as u64 == self.num_nodes,
            "boundary decider needs one queue per peer ({} != {})",
            queues.len(),
            self.num_nodes
        );

        // Every peer must deliver a first boundary buffer before any
        // decision can be made.
        let mut buffers: Vec<KvPairBuffer> = Vec::with_capacity(queues.len());
        for (peer, queue) in queues.iter().enumerate() {
            let mut buffer = queue
                .recv()
                .map_err(|_| anyhow::anyhow!("peer {} closed before sending boundaries", peer))?;
            buffer.reset_iterator();
            buffers.push(buffer);
        }
        self.job_id = buffers[0].sole_job_id();

        loop {
            // One proposal per peer for this partition position.
            let mut proposals = Vec::with_capacity(buffers.len());
            for buffer in &mut buffers {
                let pair = buffer
                    .next_kv_pair()
                    .expect("peer buffer drained mid-round");
                proposals.push(pair.key.to_vec());
            }

            let median = self.median_of(&proposals);
            self.write_boundary(&median)?;
            self.rounds += 1;

            // Refill: advance each peer, fetching a fresh buffer when the
            // current one is exhausted.
            let mut peers_done = 0u64;
            for (peer, buffer) in buffers.iter_mut().enumerate() {
                if buffer.peek_kv_pair().is_some() {
                    continue;
                }
                match queues[peer].recv() {
                    Ok(mut next) => {
                        next.reset_iterator();
                        assert!(
                            next.peek_kv_pair().is_some(),
                            "somehow there is no tuple in the buffer for node {}",
                            peer
                        );
                        *buffer = next;
                    }
                    Err(_) => peers_done += 1,
                }
            }

            if peers_done > 0 {
                // All peers must exhaust in the same round.
                assert!(
                    peers_done == self.num_nodes,
                    "all peers should run out of boundaries simultaneously, but only {} of {} \
                     did; the peers disagree on the number of partitions",
                    peers_done,
                    self.num_nodes
                );
                break;
            }
        }

        if let Some(chunk) = self.output.take() {
            if !chunk.is_empty() {
                self.broadcast(chunk)?;
            }
        }
        log::info!(
            "boundary decider merged {} partition positions across {} peers",
            self.rounds,
            self.num_nodes
        );
        Ok(())
    }
}
