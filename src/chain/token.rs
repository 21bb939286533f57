/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Write tokens and the per-disk token pool.
//!
//! A write token is a capability proving that a disk has spare write
//! capacity. The chainer must hold a token for one of a chain's candidate
//! disks before handing the chain downstream; the writer (or the sink
//! coalescer) returns the token once the write completes. Segmenting the
//! tokens by disk lets the chainer ask for "a token for any of these disks"
//! and receive one bound to a specific disk.

use std::collections::BTreeSet;
use std::sync::{Condvar, Mutex};

/// A capability for one write slot on one physical disk.
///
/// Tokens are deliberately not [`Clone`]: a token borrowed from the pool is
/// returned exactly once, by whichever stage terminates the chain.
#[derive(Debug, PartialEq, Eq)]
pub struct WriteToken {
    disk_id: u64,
}

impl WriteToken {
    /// The physical disk this token is bound to.
    pub fn disk_id(&self) -> u64 {
        self.disk_id
    }
}

#[derive(Debug)]
struct PoolState {
    /// Tokens currently available, per disk.
    available: Vec<u64>,
    closed: bool,
}

/// A multi-pool of write tokens, segmented by physical disk.
#[derive(Debug)]
pub struct WriteTokenPool {
    state: Mutex<PoolState>,
    token_returned: Condvar,
}

impl WriteTokenPool {
    /// Creates a pool with `tokens_per_disk` tokens for each of `num_disks`
    /// disks.
    pub fn new(tokens_per_disk: u64, num_disks: u64) -> Self {
        WriteTokenPool {
            state: Mutex::new(PoolState {
                available: vec![tokens_per_disk; num_disks as usize],
                closed: false,
            }),
            token_returned: Condvar::new(),
        }
    }

    /// Attempts to take a token for any disk in `disks` without blocking.
    pub fn attempt_get_token(&self, disks: &BTreeSet<u64>) -> Option<WriteToken> {
        let mut state = self.state.lock().unwrap();
        Self::take_from(&mut state, disks)
    }

    /// Takes a token for any disk in `disks`, blocking until one is
    /// available.
    ///
    /// Returns [`None`] once the pool has been [closed](Self::close); at
    /// teardown the chainer uses that to emit leftover chains without a
    /// token.
    pub fn get_token(&self, disks: &BTreeSet<u64>) -> Option<WriteToken> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(token) = Self::take_from(&mut state, disks) {
                return Some(token);
            }
            if state.closed {
                return None;
            }
            state = self.token_returned.wait(state).unwrap();
        }
    }

    /// Returns a token to the pool.
    pub fn put_token(&self, token: WriteToken) {
        let mut state = self.state.lock().unwrap();
        state.available[token.disk_id as usize] += 1;
        drop(state);
        self.token_returned.notify_all();
    }

    /// Makes all pending and future blocking gets return [`None`] once the
    /// pool runs dry.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.token_returned.notify_all();
    }

    fn take_from(state: &mut PoolState, disks: &BTreeSet<u64>) -> Option<WriteToken> {
        for &disk_id in disks {
            let available = &mut state.available[disk_id as usize];
            if *available > 0 {
                *available -= 1;
                return Some(WriteToken { disk_id });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk_set(disks: &[u64]) -> BTreeSet<u64> {
        disks.iter().copied().collect()
    }

    #[test]
    fn test_attempt_get_token() {
        let pool = WriteTokenPool::new(1, 3);

        let token = pool.attempt_get_token(&disk_set(&[1])).unwrap();
        assert_eq!(token.disk_id(), 1);

        // Disk 1 is drained; a request restricted to it must fail.
        assert!(pool.attempt_get_token(&disk_set(&[1])).is_none());

        // A wider request falls through to another disk.
        let other = pool.attempt_get_token(&disk_set(&[1, 2])).unwrap();
        assert_eq!(other.disk_id(), 2);

        pool.put_token(token);
        assert!(pool.attempt_get_token(&disk_set(&[1])).is_some());
    }

    #[test]
    fn test_blocking_get_wakes_on_put() {
        let pool = std::sync::Arc::new(WriteTokenPool::new(1, 1));
        let token = pool.attempt_get_token(&disk_set(&[0])).unwrap();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.get_token(&disk_set(&[0])))
        };

        pool.put_token(token);
        let token = waiter.join().unwrap();
        assert_eq!(token.unwrap().disk_id(), 0);
    }

    #[test]
    fn test_close_unblocks_waiters() {
        let pool = std::sync::Arc::new(WriteTokenPool::new(0, 1));
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.get_token(&disk_set(&[0])))
        };
        pool.close();
        assert!(waiter.join().unwrap().is_none());
    }
}
