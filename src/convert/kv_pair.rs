/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Zero-copy framing of already-framed tuple streams.

use crate::buffers::{ByteStreamBuffer, KvPairBuffer};
use crate::convert::{EmitKvBuffer, FormatReader};
use crate::tuple;
use anyhow::Result;

/// Reads a stream that already contains framed tuples.
///
/// The whole-tuple prefix of each input buffer is emitted *zero-copy* by
/// stealing the byte-stream buffer's memory. A tuple straddling the
/// buffer boundary is copied into a minimal *overflow* buffer carried
/// across inputs; a header straddling the boundary is reassembled in an
/// eight-byte scratch area first, since the tuple's size is unknown until
/// the header is whole.
pub struct KvPairFormatReader {
    header: [u8; tuple::HEADER_SIZE],
    header_bytes_needed: usize,
    overflow: Option<KvPairBuffer>,
}

impl KvPairFormatReader {
    pub fn new() -> Self {
        KvPairFormatReader {
            header: [0; tuple::HEADER_SIZE],
            header_bytes_needed: 0,
            overflow: None,
        }
    }
}

impl Default for KvPairFormatReader {
    fn default() -> Self {
        Self::new()
    }
}

impl FormatReader for KvPairFormatReader {
    fn read_byte_stream(
        &mut self,
        buffer: &mut ByteStreamBuffer,
        emit: &mut EmitKvBuffer,
    ) -> Result<()> {
        // Were we mid-header at the end of the previous buffer?
        if self.header_bytes_needed > 0 {
            assert!(
                self.overflow.is_none(),
                "should not have an overflow buffer while reading a header"
            );

            let header_bytes = self.header_bytes_needed.min(buffer.current_size());
            let filled = tuple::HEADER_SIZE - self.header_bytes_needed;
            self.header[filled..filled + header_bytes]
                .copy_from_slice(&buffer.bytes()[..header_bytes]);
            self.header_bytes_needed -= header_bytes;

            if self.header_bytes_needed == 0 {
                // Complete header: start an overflow buffer with it.
                let tuple_size = tuple::framed_size(&self.header);
                let mut overflow = KvPairBuffer::new(tuple_size, 0);
                overflow.append(&self.header);
                self.overflow = Some(overflow);
            }

            buffer.seek_forward(header_bytes);
            if buffer.is_empty() {
                return Ok(());
            }
        }

        // Complete a carried partial tuple.
        if let Some(overflow) = &mut self.overflow {
            let overflow_bytes = (overflow.capacity() - overflow.current_size())
                .min(buffer.current_size());
            overflow.append(&buffer.bytes()[..overflow_bytes]);

            if overflow.capacity() == overflow.current_size() {
                emit(self.overflow.take().unwrap())?;
            }

            buffer.seek_forward(overflow_bytes);
            if buffer.is_empty() {
                return Ok(());
            }
        }

        assert!(
            self.overflow.is_none(),
            "should not have an overflow buffer at the whole-tuple scan"
        );

        // Scan to the end of the last complete tuple.
        let bytes = buffer.bytes();
        let buffer_size = bytes.len();
        let mut complete_bytes = 0;
        let mut tuple_size = 0;
        while complete_bytes + tuple::HEADER_SIZE <= buffer_size {
            tuple_size = tuple::framed_size(&bytes[complete_bytes..]);
            if complete_bytes + tuple_size > buffer_size {
                // Partial tuple.
                break;
            }
            complete_bytes += tuple_size;
        }

        let bytes_remaining = buffer_size - complete_bytes;
        if bytes_remaining > 0 {
            if bytes_remaining < tuple::HEADER_SIZE {
                // Only a partial header remains.
                self.header[..bytes_remaining]
                    .copy_from_slice(&bytes[complete_bytes..]);
                self.header_bytes_needed = tuple::HEADER_SIZE - bytes_remaining;
            } else {
                // A partial tuple remains; copy it into a right-sized
                // overflow buffer.
                let mut overflow = KvPairBuffer::new(tuple_size, 0);
                overflow.append(&bytes[complete_bytes..]);
                self.overflow = Some(overflow);
            }
        }

        // Truncate to the whole tuples and hand the memory over without a
        // copy.
        buffer.set_current_size(complete_bytes);
        emit(KvPairBuffer::stealing_from(buffer.base_mut()))
    }

    fn stream_end(&mut self, emit: &mut EmitKvBuffer) -> Result<()> {
        assert!(
            self.header_bytes_needed == 0,
            "stream ended inside a tuple header ({} bytes short)",
            self.header_bytes_needed
        );
        if let Some(overflow) = self.overflow.take() {
            assert!(
                overflow.capacity() == overflow.current_size(),
                "stream ended inside a tuple ({} of {} bytes)",
                overflow.current_size(),
                overflow.capacity()
            );
            emit(overflow)?;
        }
        Ok(())
    }
}
