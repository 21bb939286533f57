/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Header synthesis for headerless fixed-size tuple streams.

use crate::buffers::{ByteStreamBuffer, KvPairBuffer};
use crate::convert::{EmitKvBuffer, FormatReader};
use crate::tuple;
use anyhow::Result;

/// Reads a stream of headerless fixed-size tuples, synthesizing a header
/// for each.
///
/// When the stream's total size is known up front a single output buffer
/// is allocated for the whole stream and emitted at stream end; otherwise
/// one output buffer is emitted per input buffer. A tuple straddling two
/// input buffers is carried in a one-tuple scratch area.
pub struct FixedSizeKvPairFormatReader {
    header: [u8; tuple::HEADER_SIZE],
    tuple_size: usize,
    /// Set when the stream size is known: emit one buffer at stream end.
    emit_single_buffer: bool,
    output: Option<KvPairBuffer>,
    partial_tuple: Vec<u8>,
    partial_bytes: usize,
}

impl FixedSizeKvPairFormatReader {
    pub fn new(stream_size: Option<u64>, key_length: u32, value_length: u32) -> Self {
        let tuple_size = (key_length + value_length) as usize;
        let mut header = [0u8; tuple::HEADER_SIZE];
        tuple::set_key_length(&mut header, key_length);
        tuple::set_value_length(&mut header, value_length);

        let mut reader = FixedSizeKvPairFormatReader {
            header,
            tuple_size,
            emit_single_buffer: stream_size.is_some(),
            output: None,
            partial_tuple: vec![0; tuple_size],
            partial_bytes: 0,
        };

        if let Some(size) = stream_size {
            assert!(
                size as usize % tuple_size == 0,
                "stream should only contain fixed-size tuples of {} bytes but has {} bytes \
                 (not divisible)",
                tuple_size,
                size
            );
            reader.new_output_buffer(size as usize);
        }
        reader
    }

    fn new_output_buffer(&mut self, input_bytes: usize) {
        assert!(
            self.output.is_none(),
            "tried to get a new output buffer while the stream already has one"
        );
        let output_size = ((input_bytes + self.partial_bytes) / self.tuple_size)
            * (self.tuple_size + tuple::HEADER_SIZE);
        self.output = Some(KvPairBuffer::new(output_size, 0));
    }

    fn emit_output(&mut self, emit: &mut EmitKvBuffer) -> Result<()> {
        emit(self.output.take().expect("no output buffer to emit"))
    }
}

impl FormatReader for FixedSizeKvPairFormatReader {
    fn read_byte_stream(
        &mut self,
        buffer: &mut ByteStreamBuffer,
        emit: &mut EmitKvBuffer,
    ) -> Result<()> {
        if !self.emit_single_buffer {
            self.new_output_buffer(buffer.current_size());
        }

        let output = self.output.as_mut().expect("no output buffer");
        let mut input = buffer.bytes();

        // Complete a tuple carried over from the previous buffer.
        if self.partial_bytes > 0 {
            let needed = self.tuple_size - self.partial_bytes;
            output.append(&self.header);
            output.append(&self.partial_tuple[..self.partial_bytes]);
            output.append(&input[..needed]);
            input = &input[needed..];
            self.partial_bytes = 0;
        }

        // All the complete tuples in the rest of the input.
        while input.len() >= self.tuple_size {
            output.append(&self.header);
            output.append(&input[..self.tuple_size]);
            input = &input[self.tuple_size..];
        }

        // Carry any trailing fragment.
        self.partial_tuple[..input.len()].copy_from_slice(input);
        self.partial_bytes = input.len();

        if !self.emit_single_buffer {
            self.emit_output(emit)?;
        }
        Ok(())
    }

    fn stream_end(&mut self, emit: &mut EmitKvBuffer) -> Result<()> {
        assert!(
            self.partial_bytes == 0,
            "stream ended {} bytes into a fixed-size tuple",
            self.partial_bytes
        );
        if self.emit_single_buffer {
            let output = self.output.as_ref().expect("no output buffer");
            assert!(
                output.current_size() == output.capacity(),
                "allocated a single {}-byte output buffer but only filled {} bytes",
                output.capacity(),
                output.current_size()
            );
            self.emit_output(emit)?;
        }
        Ok(())
    }
}
