/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The shuffle receiver.

use crate::buffers::KvPairBuffer;
use crate::shuffle::{Connection, Envelope, ENVELOPE_SIZE};
use crate::stage::Tracker;
use anyhow::Result;

/// What one inbound flow is currently reading.
enum FlowState {
    Header {
        bytes: [u8; ENVELOPE_SIZE],
        filled: usize,
    },
    Body {
        envelope: Envelope,
        buffer: KvPairBuffer,
        filled: usize,
    },
}

/// Receives enveloped buffers from every inbound flow.
///
/// For each flow the receiver reads the 32-byte header, allocates a KV
/// buffer of exactly the advertised length, fills it, tags it with the
/// peer id and the envelope's job, group and partition, and emits it.
/// Within a flow, buffers arrive in the order they were sent; the
/// receiver preserves that order per flow.
pub struct Receiver {
    connections: Vec<Connection>,
    states: Vec<FlowState>,
    alignment: usize,
    downstream: Tracker<KvPairBuffer>,
    total_bytes_received: u64,
}

impl Receiver {
    pub fn new(
        connections: Vec<Connection>,
        alignment: usize,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        let states = connections
            .iter()
            .map(|_| FlowState::Header {
                bytes: [0; ENVELOPE_SIZE],
                filled: 0,
            })
            .collect();
        Receiver {
            connections,
            states,
            alignment,
            downstream,
            total_bytes_received: 0,
        }
    }

    /// Polls all open flows for readability.
    fn poll_readable(&self) -> Result<Vec<usize>> {
        let mut fds = Vec::new();
        let mut indexes = Vec::new();
        for (index, connection) in self.connections.iter().enumerate() {
            if connection.closed() {
                continue;
            }
            fds.push(libc::pollfd {
                fd: connection.raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
            indexes.push(index);
        }
        if fds.is_empty() {
            return Ok(Vec::new());
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, 100) };
        anyhow::ensure!(rc >= 0, "poll failed: {}", std::io::Error::last_os_error());

        Ok(fds
            .iter()
            .zip(indexes)
            .filter(|(fd, _)| fd.revents & (libc::POLLIN | libc::POLLHUP) != 0)
            .map(|(_, index)| index)
            .collect())
    }

    /// Advances one flow's state machine as far as the socket allows.
    fn service_flow(&mut self, index: usize) -> Result<()> {
        loop {
            let connection = &mut self.connections[index];
            match &mut self.states[index] {
                FlowState::Header { bytes, filled } => {
                    let read = connection.read_some(&mut bytes[*filled..])?;
                    if read == 0 {
                        return Ok(());
                    }
                    *filled += read;
                    self.total_bytes_received += read as u64;
                    if *filled < ENVELOPE_SIZE {
                        continue;
                    }

                    let envelope = Envelope::deserialize(bytes);
                    let mut buffer =
                        KvPairBuffer::new((envelope.buffer_length as usize).max(1), self.alignment);
                    envelope.apply_to(&mut buffer);
                    buffer.node = Some(connection.peer_id);
                    if envelope.buffer_length == 0 {
                        // Nothing to read for an empty buffer.
                        self.states[index] = FlowState::Header {
                            bytes: [0; ENVELOPE_SIZE],
                            filled: 0,
                        };
                        self.downstream.send(buffer)?;
                        continue;
                    }
                    self.states[index] = FlowState::Body {
                        envelope,
                        buffer,
                        filled: 0,
                    };
                }
                FlowState::Body {
                    envelope,
                    buffer,
                    filled,
                } => {
                    let total = envelope.buffer_length as usize;
                    let read = {
                        let region = buffer.setup_append(total - *filled);
                        let read = connection.read_some(region)?;
                        buffer.commit_append(read);
                        read
                    };
                    if read == 0 {
                        anyhow::ensure!(
                            !connection.closed(),
                            "peer {} closed flow {} mid-buffer ({} of {} bytes)",
                            connection.peer_id,
                            connection.flow_id,
                            *filled,
                            total
                        );
                        return Ok(());
                    }
                    *filled += read;
                    self.total_bytes_received += read as u64;
                    if *filled < total {
                        continue;
                    }

                    // Whole buffer received: emit and await the next
                    // header.
                    let done = std::mem::replace(
                        &mut self.states[index],
                        FlowState::Header {
                            bytes: [0; ENVELOPE_SIZE],
                            filled: 0,
                        },
                    );
                    if let FlowState::Body { buffer, .. } = done {
                        self.downstream.send(buffer)?;
                    }
                }
            }
        }
    }

    /// Runs until every inbound flow has been closed by its peer.
    pub fn run(&mut self) -> Result<()> {
        while self.connections.iter().any(|c| !c.closed()) {
            for index in self.poll_readable()? {
                self.service_flow(index)?;
            }
        }
        // Every flow must close on a header boundary.
        for (connection, state) in self.connections.iter().zip(&self.states) {
            if let FlowState::Header { filled, .. } = state {
                assert!(
                    *filled == 0,
                    "peer {} closed flow {} inside an envelope",
                    connection.peer_id,
                    connection.flow_id
                );
            }
        }
        log::info!(
            "receiver done: {} bytes over {} flows",
            self.total_bytes_received,
            self.connections.len()
        );
        Ok(())
    }
}
