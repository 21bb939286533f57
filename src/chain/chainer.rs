/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Chaining per-partition buffers into token-scheduled emissions.

use crate::buffers::{BufferList, BufferTable, KvPairBuffer};
use crate::chain::{WriteToken, WriteTokenPool};
use crate::stage::{BatchWorker, Receiver, Tracker};
use anyhow::Result;
use crossbeam_channel::TryRecvError;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// How long the chainer naps when its input queue is empty.
const EMPTY_QUEUE_WAIT: Duration = Duration::from_millis(1);

/// How many emissions between emission-rate log lines.
const EMISSION_LOG_INTERVAL: u64 = 100;

/// A chain of buffers for one partition, with the token that scheduled
/// it. A `None` token only occurs for the forced emissions of teardown.
pub struct Chain {
    pub job_id: u64,
    pub list: BufferList,
    pub token: Option<WriteToken>,
}

/// Parameters of one chainer worker.
#[derive(Debug, Clone)]
pub struct ChainerConfig {
    pub node_id: u64,
    /// Physical disks this chainer serves.
    pub disks_per_chainer: u64,
    pub base_disk_id: u64,
    pub num_node_disks: u64,
    pub partitions_per_disk: u64,
    pub emission_lower_bound: u64,
    pub emission_upper_bound: u64,
}

/// The chainer: a batch worker accumulating per-partition buffers in a
/// per-job [`BufferTable`] and emitting the largest chains as write
/// tokens permit.
///
/// Each iteration drains the input queue (sleeping a millisecond when it
/// is empty), then repeatedly: finds the disks whose largest list is
/// above the emission lower bound, attempts a non-blocking token get
/// restricted to those disks, and on success moves up to the emission
/// upper bound of buffers from the token's disk's largest list into a
/// [`Chain`]. At teardown the same routine runs with *blocking* token
/// gets until every list is empty; a pool closed for teardown yields
/// token-less chains, so unsent data still reaches a writer.
pub struct Chainer {
    config: ChainerConfig,
    token_pool: Arc<WriteTokenPool>,
    downstream: Tracker<Chain>,
    tables: HashMap<u64, BufferTable>,
    emissions: u64,
    failed_token_gets: u64,
    empty_queue_waits: u64,
}

impl Chainer {
    pub fn new(
        config: ChainerConfig,
        token_pool: Arc<WriteTokenPool>,
        downstream: Tracker<Chain>,
    ) -> Self {
        Chainer {
            config,
            token_pool,
            downstream,
            tables: HashMap::new(),
            emissions: 0,
            failed_token_gets: 0,
            empty_queue_waits: 0,
        }
    }

    fn insert(&mut self, buffer: KvPairBuffer) {
        let job_id = buffer.sole_job_id();
        let config = &self.config;
        let table = self.tables.entry(job_id).or_insert_with(|| {
            BufferTable::new(
                config.base_disk_id,
                config.disks_per_chainer,
                config.node_id,
                config.partitions_per_disk,
                config.num_node_disks,
            )
        });
        table.insert(buffer);
    }

    /// Moves one chain out of `list`, honoring the emission upper bound
    /// and the oversize-head exception.
    fn build_chain(
        list: &mut BufferList,
        emission_upper_bound: u64,
        job_id: u64,
        token: Option<WriteToken>,
    ) -> Chain {
        let mut out = BufferList::new(list.logical_disk_id(), list.physical_disk_id());

        let head_oversized = list
            .head()
            .is_some_and(|head| head.current_size() as u64 > emission_upper_bound);
        if head_oversized {
            // A head too large for the bound moves alone, otherwise its
            // list could never be emitted.
            out.append(list.remove_head().unwrap());
        } else {
            list.bulk_move_buffers_to(&mut out, emission_upper_bound);
        }

        Chain {
            job_id,
            list: out,
            token,
        }
    }

    /// Emits full chains for one job while tokens are available.
    fn emit_full_lists(&mut self, job_id: u64) -> Result<()> {
        loop {
            let table = self.tables.get_mut(&job_id).unwrap();
            let mut candidate_disks = BTreeSet::new();
            table.disks_with_lists_above(self.config.emission_lower_bound, &mut candidate_disks);
            if candidate_disks.is_empty() {
                return Ok(());
            }

            let Some(token) = self.token_pool.attempt_get_token(&candidate_disks) else {
                self.failed_token_gets += 1;
                return Ok(());
            };

            let disk_id = token.disk_id();
            let chain = {
                let list = table
                    .largest_list_for_disk(disk_id)
                    .expect("token granted for a disk with no candidate list");
                Self::build_chain(list, self.config.emission_upper_bound, job_id, Some(token))
            };
            table.update_largest_list(disk_id);

            self.emissions += 1;
            if self.emissions % EMISSION_LOG_INTERVAL == 0 {
                log::debug!("chainer has emitted {} chains", self.emissions);
            }
            self.downstream.send(chain)?;
        }
    }

    /// Drains every table, blocking for tokens; used at teardown.
    fn emit_everything(&mut self) -> Result<()> {
        let job_ids: Vec<u64> = self.tables.keys().copied().collect();
        for job_id in job_ids {
            loop {
                let table = self.tables.get_mut(&job_id).unwrap();
                let mut disks_with_work = BTreeSet::new();
                table.disks_with_lists_above(0, &mut disks_with_work);
                if disks_with_work.is_empty() {
                    break;
                }

                // A closed pool returns None; the chain goes out without
                // a token rather than stranding its data.
                let token = self.token_pool.get_token(&disks_with_work);
                let disk_id = token
                    .as_ref()
                    .map(WriteToken::disk_id)
                    .unwrap_or_else(|| *disks_with_work.iter().next().unwrap());

                let table = self.tables.get_mut(&job_id).unwrap();
                let Some(list) = table.largest_list_for_disk(disk_id) else {
                    if let Some(token) = token {
                        self.token_pool.put_token(token);
                    }
                    continue;
                };
                let chain =
                    Self::build_chain(list, self.config.emission_upper_bound, job_id, token);
                table.update_largest_list(disk_id);
                self.emissions += 1;
                self.downstream.send(chain)?;
            }
        }
        Ok(())
    }
}

impl BatchWorker for Chainer {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "chainer"
    }

    fn run(&mut self, queue: &Receiver<KvPairBuffer>) -> Result<()> {
        'outer: loop {
            // Drain whatever is queued; nap briefly when nothing is.
            let mut drained_any = false;
            loop {
                match queue.try_recv() {
                    Ok(buffer) => {
                        self.insert(buffer);
                        drained_any = true;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }
            if !drained_any {
                self.empty_queue_waits += 1;
                std::thread::sleep(EMPTY_QUEUE_WAIT);
            }

            let job_ids: Vec<u64> = self.tables.keys().copied().collect();
            for job_id in job_ids {
                self.emit_full_lists(job_id)?;
            }
        }

        self.emit_everything()?;
        log::info!(
            "chainer done: {} emissions, {} failed token gets, {} empty-queue waits",
            self.emissions,
            self.failed_token_gets,
            self.empty_queue_waits
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;

    fn tagged_buffer(job_id: u64, partition: u64, size: usize) -> KvPairBuffer {
        let mut buffer = KvPairBuffer::new(size, 0);
        buffer.append(&vec![0u8; size]);
        buffer.logical_disk_id = Some(partition);
        buffer.add_job_id(job_id);
        buffer
    }

    fn config_for_three_disks() -> ChainerConfig {
        ChainerConfig {
            node_id: 0,
            disks_per_chainer: 3,
            base_disk_id: 0,
            num_node_disks: 3,
            partitions_per_disk: 2,
            emission_lower_bound: 1 << 20,
            emission_upper_bound: 2 << 20,
        }
    }

    #[test]
    fn test_tokens_gate_emission() -> Result<()> {
        // Tokens available only on disk 1.
        let pool = Arc::new(WriteTokenPool::new(1, 3));
        let hog0 = pool.attempt_get_token(&BTreeSet::from([0])).unwrap();
        let hog2 = pool.attempt_get_token(&BTreeSet::from([2])).unwrap();

        let (tracker, receiver) = work_queue("coalescer", 16);
        let mut chainer = Chainer::new(config_for_three_disks(), pool.clone(), tracker);

        // Seven buffers totalling 5 MB across partitions of disks 0, 1
        // and 2 (partitions 0-1 → disk 0, 2-3 → disk 1, 4-5 → disk 2).
        let mb = 1 << 20;
        for (partition, size) in [
            (0, mb),
            (1, mb / 2),
            (2, mb),
            (3, mb / 2),
            (4, mb),
            (5, mb / 2),
            (2, mb / 2),
        ] {
            chainer.insert(tagged_buffer(7, partition, size));
        }
        chainer.emit_full_lists(7)?;

        // Exactly one emission, for disk 1, within the upper bound.
        let chain = receiver.try_recv().unwrap();
        assert_eq!(chain.token.as_ref().unwrap().disk_id(), 1);
        assert_eq!(chain.list.physical_disk_id(), 1);
        assert!(chain.list.total_data_size() <= 2 * mb as u64);
        assert!(receiver.try_recv().is_err());

        // No further emission until another token frees up.
        chainer.emit_full_lists(7)?;
        assert!(receiver.try_recv().is_err());

        drop(hog0);
        drop(hog2);
        Ok(())
    }

    #[test]
    fn test_oversize_head_emits_alone() -> Result<()> {
        let pool = Arc::new(WriteTokenPool::new(1, 3));
        let (tracker, receiver) = work_queue("coalescer", 16);
        let mut chainer = Chainer::new(config_for_three_disks(), pool, tracker);

        let big = 3 << 20;
        chainer.insert(tagged_buffer(7, 0, big));
        chainer.insert(tagged_buffer(7, 0, 1024));
        chainer.emit_full_lists(7)?;

        let chain = receiver.try_recv().unwrap();
        assert_eq!(chain.list.len(), 1);
        assert_eq!(chain.list.total_data_size(), big as u64);
        Ok(())
    }

    #[test]
    fn test_teardown_emits_leftovers_without_tokens() -> Result<()> {
        let pool = Arc::new(WriteTokenPool::new(0, 3));
        pool.close();
        let (tracker, receiver) = work_queue("coalescer", 16);
        let mut chainer = Chainer::new(config_for_three_disks(), pool, tracker);

        chainer.insert(tagged_buffer(7, 1, 4096));
        chainer.insert(tagged_buffer(7, 4, 4096));
        chainer.emit_everything()?;

        let mut chains = 0;
        while let Ok(chain) = receiver.try_recv() {
            assert!(chain.token.is_none());
            assert_eq!(chain.list.total_data_size(), 4096);
            chains += 1;
        }
        assert_eq!(chains, 2);
        Ok(())
    }
}
