/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Typed, bounded queues connecting stages.
//!
//! A stage emits work through a [`Tracker`] and its downstream pool pulls
//! from the matching [`Receiver`]. Queues are multi-producer,
//! multi-consumer and bounded, so a slow stage exerts back-pressure on its
//! upstream. Dropping every tracker of a queue disconnects it; a
//! disconnected, drained queue is the "no more input" signal after which a
//! worker begins draining its own state.

use anyhow::{Context, Result};
pub use crossbeam_channel::Receiver;
use crossbeam_channel::{bounded, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The emission handle of a stage: a named, counted sender.
#[derive(Debug)]
pub struct Tracker<T> {
    name: Arc<str>,
    sender: Sender<T>,
    emitted: Arc<AtomicU64>,
}

impl<T> Clone for Tracker<T> {
    fn clone(&self) -> Self {
        Tracker {
            name: self.name.clone(),
            sender: self.sender.clone(),
            emitted: self.emitted.clone(),
        }
    }
}

impl<T> Tracker<T> {
    /// Sends one work unit downstream, blocking while the queue is full.
    pub fn send(&self, work: T) -> Result<()> {
        self.sender
            .send(work)
            .ok()
            .with_context(|| format!("the queue for stage {} is closed", self.name))?;
        self.emitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// The number of work units sent through this tracker and its clones.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Creates a bounded queue feeding the named stage.
pub fn work_queue<T>(name: &str, capacity: usize) -> (Tracker<T>, Receiver<T>) {
    let (sender, receiver) = bounded(capacity);
    (
        Tracker {
            name: name.into(),
            sender,
            emitted: Arc::new(AtomicU64::new(0)),
        },
        receiver,
    )
}

/// Creates one bounded queue per named sub-queue of a multi-queue stage
/// (one per peer for the sender and the boundary decider).
pub fn work_queues<T>(name: &str, count: usize, capacity: usize) -> (Vec<Tracker<T>>, Vec<Receiver<T>>) {
    (0..count)
        .map(|i| work_queue(&format!("{}[{}]", name, i), capacity))
        .unzip()
}
