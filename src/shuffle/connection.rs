/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Per-flow socket state for the shuffle.

use crate::buffers::KvPairBuffer;
use crate::shuffle::{Envelope, ENVELOPE_SIZE};
use anyhow::{Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};

/// One flow (socket) to one peer, with its in-progress send state.
///
/// A buffer travels as a 32-byte envelope followed by its raw bytes;
/// `metadata_bytes_sent` and `buffer_bytes_sent` track how far the
/// non-blocking sends have gotten.
pub struct Connection {
    pub peer_id: u64,
    pub flow_id: u64,
    stream: TcpStream,
    peer_address: String,
    pub broken: bool,
    closed: bool,
    pub buffer: Option<KvPairBuffer>,
    metadata: Option<[u8; ENVELOPE_SIZE]>,
    metadata_bytes_sent: usize,
    buffer_bytes_sent: usize,
    pub total_bytes_sent: u64,
}

impl Connection {
    pub fn new(stream: TcpStream, peer_id: u64, flow_id: u64) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .context("could not make a shuffle socket non-blocking")?;
        let peer_address = stream
            .peer_addr()
            .map(|address| address.ip().to_string())
            .unwrap_or_default();
        Ok(Connection {
            peer_id,
            flow_id,
            stream,
            peer_address,
            broken: false,
            closed: false,
            buffer: None,
            metadata: None,
            metadata_bytes_sent: 0,
            buffer_bytes_sent: 0,
            total_bytes_sent: 0,
        })
    }

    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.closed = true;
    }

    pub fn raw_fd(&self) -> std::os::fd::RawFd {
        use std::os::fd::AsRawFd;
        self.stream.as_raw_fd()
    }

    /// Loads a new buffer onto the flow, resetting the send cursors.
    pub fn load_buffer(&mut self, buffer: KvPairBuffer) {
        assert!(self.buffer.is_none(), "flow already has a buffer loaded");
        self.metadata = Some(Envelope::for_buffer(&buffer).serialize());
        self.metadata_bytes_sent = 0;
        self.buffer_bytes_sent = 0;
        self.buffer = Some(buffer);
    }

    /// Discards the flow's queued buffer (on breakage).
    pub fn discard_buffer(&mut self) {
        self.buffer = None;
        self.metadata = None;
    }

    /// The outcome of one non-blocking send attempt.
    pub fn has_pending_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Issues one non-blocking send of at most `max_send_size` payload
    /// bytes. Returns `Ok(true)` when the flow's current buffer became
    /// fully sent, `Ok(false)` otherwise; a would-block is not an error.
    pub fn send_once(
        &mut self,
        max_send_size: usize,
        blocked_sends: &mut u64,
    ) -> Result<bool> {
        // Envelope first.
        if let Some(metadata) = self.metadata {
            let remaining = &metadata[self.metadata_bytes_sent..];
            assert!(!remaining.is_empty(), "no metadata bytes left but metadata set");
            match self.write_some(remaining, blocked_sends)? {
                0 => return Ok(false),
                sent => {
                    self.metadata_bytes_sent += sent;
                    if self.metadata_bytes_sent < ENVELOPE_SIZE {
                        return Ok(false);
                    }
                    self.metadata = None;
                }
            }
            if self.broken {
                return Ok(false);
            }
        }

        // Take the buffer out for the duration of the send so the write
        // can borrow it and the flow state at the same time.
        let Some(buffer) = self.buffer.take() else {
            return Ok(false);
        };
        let total = buffer.current_size();
        let remaining = total - self.buffer_bytes_sent;
        assert!(remaining != 0, "no buffer bytes left to send");
        let chunk_length = remaining.min(max_send_size);

        let sent = {
            let chunk =
                &buffer.bytes()[self.buffer_bytes_sent..self.buffer_bytes_sent + chunk_length];
            self.write_some(chunk, blocked_sends)?
        };
        if self.broken {
            // The flow died mid-buffer; the buffer is discarded with it.
            return Ok(false);
        }

        self.buffer_bytes_sent += sent;
        if self.buffer_bytes_sent == total {
            return Ok(true);
        }
        self.buffer = Some(buffer);
        Ok(false)
    }

    /// A single non-blocking write; would-block counts, other errors
    /// mark the flow broken and discard its buffer.
    fn write_some(&mut self, data: &[u8], blocked_sends: &mut u64) -> Result<usize> {
        match self.stream.write(data) {
            Ok(written) => Ok(written),
            Err(error) if error.kind() == ErrorKind::WouldBlock => {
                *blocked_sends += 1;
                Ok(0)
            }
            Err(error) => {
                log::error!(
                    "send to peer {} flow {} failed: {}",
                    self.peer_id,
                    self.flow_id,
                    error
                );
                self.broken = true;
                self.discard_buffer();
                Ok(0)
            }
        }
    }

    /// A single non-blocking read into `target`; EOF closes the flow.
    pub fn read_some(&mut self, target: &mut [u8]) -> Result<usize> {
        match self.stream.read(target) {
            Ok(0) => {
                self.close();
                Ok(0)
            }
            Ok(read) => Ok(read),
            Err(error) if error.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(error) => Err(error).with_context(|| {
                format!(
                    "recv from peer {} flow {} failed",
                    self.peer_id, self.flow_id
                )
            }),
        }
    }
}

/// Connects `flows_per_peer` flows to each peer address, in peer order.
/// Each flow opens with an 8-byte big-endian hello naming this node.
pub fn connect_flows(
    local_node_id: u64,
    peers: &[String],
    flows_per_peer: u64,
) -> Result<Vec<Connection>> {
    let mut connections = Vec::new();
    for (peer_id, address) in peers.iter().enumerate() {
        for flow_id in 0..flows_per_peer {
            let mut stream = TcpStream::connect(address)
                .with_context(|| format!("could not connect flow to peer {}", address))?;
            stream
                .write_all(&local_node_id.to_be_bytes())
                .context("could not send connection hello")?;
            connections.push(Connection::new(stream, peer_id as u64, flow_id)?);
        }
    }
    Ok(connections)
}

/// Accepts `count` inbound flows; the peer id is recovered from each
/// flow's hello.
pub fn accept_flows(listener: &TcpListener, count: usize) -> Result<Vec<Connection>> {
    let mut connections = Vec::new();
    for flow_id in 0..count {
        let (mut stream, _) = listener.accept().context("accept failed")?;
        let mut hello = [0u8; 8];
        stream.read_exact(&mut hello)?;
        let peer_id = u64::from_be_bytes(hello);
        connections.push(Connection::new(stream, peer_id, flow_id as u64)?);
    }
    Ok(connections)
}
