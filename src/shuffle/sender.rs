/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The shuffle senders.
//!
//! A sender owns a slice of the node's flows and pulls buffers from one
//! queue per peer. The round-robin sender cycles over its flows issuing
//! non-blocking sends; the select sender parks in `poll` until at least
//! one flow with a loaded buffer is writable, using a finite timeout
//! while some flow still has no buffer so new work can be fetched.

use crate::buffers::KvPairBuffer;
use crate::coordinator::Coordinator;
use crate::shuffle::Connection;
use crate::stage::{MultiQueueWorker, Receiver};
use anyhow::Result;
use crossbeam_channel::TryRecvError;
use std::sync::Arc;
use std::time::Duration;

/// Nap between round-robin sweeps in which every send would block.
const BLOCKED_SWEEP_WAIT: Duration = Duration::from_micros(100);

/// State shared by the sender variants.
struct SenderCore {
    connections: Vec<Connection>,
    max_send_size: usize,
    coordinator: Option<Arc<dyn Coordinator>>,
    completed_flows: usize,
    total_bytes_sent: u64,
    blocked_sends: u64,
    total_sends: u64,
}

impl SenderCore {
    fn new(
        connections: Vec<Connection>,
        max_send_size: usize,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Self {
        SenderCore {
            connections,
            max_send_size,
            coordinator,
            completed_flows: 0,
            total_bytes_sent: 0,
            blocked_sends: 0,
            total_sends: 0,
        }
    }

    /// Loads new buffers onto idle flows; a disconnected peer queue
    /// closes the flow.
    fn get_more_work(&mut self, queues: &[Receiver<KvPairBuffer>]) -> Result<()> {
        for connection in &mut self.connections {
            if connection.closed() || connection.has_pending_buffer() {
                continue;
            }
            match queues[connection.peer_id as usize].try_recv() {
                Ok(buffer) => {
                    if connection.broken {
                        // A broken flow swallows its queued data; the
                        // coordinator already knows.
                        drop(buffer);
                    } else {
                        connection.load_buffer(buffer);
                    }
                }
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => {
                    log::debug!(
                        "closing flow {} to peer {}",
                        connection.flow_id,
                        connection.peer_id
                    );
                    connection.close();
                    self.completed_flows += 1;
                }
            }
        }
        Ok(())
    }

    /// One send attempt on one flow, with breakage reporting.
    fn send_once(&mut self, index: usize) -> Result<bool> {
        let before_broken = self.connections[index].broken;
        self.total_sends += 1;
        let sent_before = self.connections[index].total_bytes_sent;
        let finished = {
            let connection = &mut self.connections[index];
            let finished = connection.send_once(self.max_send_size, &mut self.blocked_sends)?;
            self.total_bytes_sent += connection.total_bytes_sent - sent_before;
            finished
        };

        let connection = &self.connections[index];
        if connection.broken && !before_broken {
            if let Some(coordinator) = &self.coordinator {
                coordinator.notify_node_failure(connection.peer_address())?;
            } else {
                anyhow::bail!(
                    "send to peer {} flow {} failed and no coordinator is configured",
                    connection.peer_id,
                    connection.flow_id
                );
            }
        }
        Ok(finished)
    }

    fn all_flows_complete(&self) -> bool {
        self.completed_flows == self.connections.len()
    }

    fn log_teardown(&self, stage: &str) {
        log::info!(
            "{} done: {} bytes over {} flows, {} of {} sends would have blocked",
            stage,
            self.total_bytes_sent,
            self.connections.len(),
            self.blocked_sends,
            self.total_sends
        );
    }
}

/// The round-robin sender: iterate flows, try to send on each.
pub struct RoundRobinSender {
    core: SenderCore,
}

impl RoundRobinSender {
    pub fn new(
        connections: Vec<Connection>,
        max_send_size: usize,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Self {
        RoundRobinSender {
            core: SenderCore::new(connections, max_send_size, coordinator),
        }
    }
}

impl MultiQueueWorker for RoundRobinSender {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "sender"
    }

    fn run(&mut self, queues: &[Receiver<KvPairBuffer>]) -> Result<()> {
        while !self.core.all_flows_complete() {
            self.core.get_more_work(queues)?;

            let mut progressed = false;
            for index in 0..self.core.connections.len() {
                let connection = &self.core.connections[index];
                if connection.closed() || !connection.has_pending_buffer() {
                    continue;
                }
                let sent_before = self.core.total_bytes_sent;
                self.core.send_once(index)?;
                progressed |= self.core.total_bytes_sent > sent_before;
            }

            if !progressed {
                std::thread::sleep(BLOCKED_SWEEP_WAIT);
            }
        }

        self.core.log_teardown("round-robin sender");
        Ok(())
    }
}

/// The select sender: block until some loaded flow is writable.
pub struct SelectSender {
    core: SenderCore,
    /// How long to wait when some flows still lack a buffer.
    get_more_data_timeout: Duration,
}

impl SelectSender {
    pub fn new(
        connections: Vec<Connection>,
        max_send_size: usize,
        get_more_data_timeout: Duration,
        coordinator: Option<Arc<dyn Coordinator>>,
    ) -> Self {
        SelectSender {
            core: SenderCore::new(connections, max_send_size, coordinator),
            get_more_data_timeout,
        }
    }

    /// Polls the loaded flows for writability. Returns the indexes that
    /// can make progress.
    fn poll_writable(&self, block_forever: bool) -> Result<Vec<usize>> {
        let mut fds = Vec::new();
        let mut indexes = Vec::new();
        for (index, connection) in self.core.connections.iter().enumerate() {
            if connection.closed() || !connection.has_pending_buffer() {
                continue;
            }
            fds.push(libc::pollfd {
                fd: connection.raw_fd(),
                events: libc::POLLOUT,
                revents: 0,
            });
            indexes.push(index);
        }
        if fds.is_empty() {
            return Ok(Vec::new());
        }

        let timeout = if block_forever {
            -1
        } else {
            self.get_more_data_timeout.as_millis().max(1) as libc::c_int
        };
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout) };
        anyhow::ensure!(rc >= 0, "poll failed: {}", std::io::Error::last_os_error());

        Ok(fds
            .iter()
            .zip(indexes)
            .filter(|(fd, _)| fd.revents & libc::POLLOUT != 0)
            .map(|(_, index)| index)
            .collect())
    }
}

impl MultiQueueWorker for SelectSender {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "select-sender"
    }

    fn run(&mut self, queues: &[Receiver<KvPairBuffer>]) -> Result<()> {
        while !self.core.all_flows_complete() {
            let loaded = self
                .core
                .connections
                .iter()
                .filter(|connection| !connection.closed() && connection.has_pending_buffer())
                .count();
            let open = self
                .core
                .connections
                .iter()
                .filter(|connection| !connection.closed())
                .count();

            if loaded < open {
                // At least one open flow has no buffer yet; go get more.
                self.core.get_more_work(queues)?;
            }

            let loaded_after = self
                .core
                .connections
                .iter()
                .filter(|connection| !connection.closed() && connection.has_pending_buffer())
                .count();
            if loaded_after == 0 {
                // Nothing to send yet; avoid a busy loop while waiting
                // for upstream.
                std::thread::sleep(BLOCKED_SWEEP_WAIT);
                continue;
            }

            // With data for every open flow we can block indefinitely;
            // otherwise use the finite timeout so starved flows can be
            // refilled.
            let open_after = self
                .core
                .connections
                .iter()
                .filter(|connection| !connection.closed())
                .count();
            let writable = self.poll_writable(loaded_after == open_after)?;
            for index in writable {
                self.core.send_once(index)?;
            }
        }

        self.core.log_teardown("select sender");
        Ok(())
    }
}
