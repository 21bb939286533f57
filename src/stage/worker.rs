/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The three worker pull policies.
//!
//! Every stage owns a pool of workers, each running on its own OS thread.
//! A *single-unit* worker processes one typed work unit per dispatch; a
//! *batch* worker drains its queue into internal state that amortizes over
//! many inputs (the chainer); a *multi-queue* worker pulls from several
//! named queues at once (senders, the boundary decider, async I/O
//! workers). In every case, teardown runs after the stage's input is
//! disconnected and drained.

use crate::stage::Receiver;
use anyhow::{Context, Result};
use std::thread::JoinHandle;

/// A worker processing one work unit per dispatch.
pub trait Worker: Send {
    type Input: Send;

    /// The stage name, used for thread naming and logging.
    fn stage_name(&self) -> &'static str;

    fn process(&mut self, work: Self::Input) -> Result<()>;

    /// Invoked once the input queue is disconnected and drained.
    fn teardown(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A worker that owns its pull loop and drains the queue itself.
pub trait BatchWorker: Send {
    type Input: Send;

    fn stage_name(&self) -> &'static str;

    /// Runs until the queue is disconnected and the worker's internal
    /// state is drained.
    fn run(&mut self, queue: &Receiver<Self::Input>) -> Result<()>;
}

/// A worker pulling from several named input queues.
pub trait MultiQueueWorker: Send {
    type Input: Send;

    fn stage_name(&self) -> &'static str;

    fn run(&mut self, queues: &[Receiver<Self::Input>]) -> Result<()>;
}

/// Drives a [`Worker`]: pull, process, teardown.
pub fn run_worker<W: Worker>(worker: &mut W, queue: &Receiver<W::Input>) -> Result<()> {
    while let Ok(work) = queue.recv() {
        worker.process(work)?;
    }
    worker.teardown()
}

fn spawn_named<F>(name: String, body: F) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            log::debug!("{} starting", name);
            let result = body();
            if let Err(error) = &result {
                log::error!("{} failed: {:?}", name, error);
            } else {
                log::debug!("{} done", name);
            }
            result
        })
        .context("could not spawn worker thread")
}

/// Spawns a pool of single-unit workers sharing one queue.
pub fn spawn_pool<W>(workers: Vec<W>, queue: Receiver<W::Input>) -> Result<Vec<JoinHandle<Result<()>>>>
where
    W: Worker + 'static,
    W::Input: 'static,
{
    workers
        .into_iter()
        .enumerate()
        .map(|(id, mut worker)| {
            let queue = queue.clone();
            spawn_named(format!("{}-{}", worker.stage_name(), id), move || {
                run_worker(&mut worker, &queue)
            })
        })
        .collect()
}

/// Spawns a pool of batch workers sharing one queue.
pub fn spawn_batch_pool<W>(
    workers: Vec<W>,
    queue: Receiver<W::Input>,
) -> Result<Vec<JoinHandle<Result<()>>>>
where
    W: BatchWorker + 'static,
    W::Input: 'static,
{
    workers
        .into_iter()
        .enumerate()
        .map(|(id, mut worker)| {
            let queue = queue.clone();
            spawn_named(format!("{}-{}", worker.stage_name(), id), move || {
                worker.run(&queue)
            })
        })
        .collect()
}

/// Spawns one multi-queue worker over a slice of named queues.
pub fn spawn_multi_queue<W>(
    mut worker: W,
    queues: Vec<Receiver<W::Input>>,
    id: usize,
) -> Result<JoinHandle<Result<()>>>
where
    W: MultiQueueWorker + 'static,
    W::Input: 'static,
{
    spawn_named(format!("{}-{}", worker.stage_name(), id), move || {
        worker.run(&queues)
    })
}

/// Joins a pool, propagating the first worker failure.
pub fn join_pool(handles: Vec<JoinHandle<Result<()>>>) -> Result<()> {
    let mut first_error = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
    match first_error {
        None => Ok(()),
        Some(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::work_queue;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct Summer {
        total: Arc<AtomicU64>,
        torn_down: Arc<AtomicU64>,
    }

    impl Worker for Summer {
        type Input = u64;

        fn stage_name(&self) -> &'static str {
            "summer"
        }

        fn process(&mut self, work: u64) -> Result<()> {
            self.total.fetch_add(work, Ordering::Relaxed);
            Ok(())
        }

        fn teardown(&mut self) -> Result<()> {
            self.torn_down.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn test_pool_processes_and_tears_down() -> Result<()> {
        let total = Arc::new(AtomicU64::new(0));
        let torn_down = Arc::new(AtomicU64::new(0));

        let (tracker, queue) = work_queue("summer", 16);
        let workers = (0..3)
            .map(|_| Summer {
                total: total.clone(),
                torn_down: torn_down.clone(),
            })
            .collect();
        let handles = spawn_pool(workers, queue)?;

        for i in 1..=100 {
            tracker.send(i)?;
        }
        drop(tracker);
        join_pool(handles)?;

        assert_eq!(total.load(Ordering::Relaxed), 5050);
        assert_eq!(torn_down.load(Ordering::Relaxed), 3);
        Ok(())
    }
}
