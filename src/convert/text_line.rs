/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Text-line framing: one tuple per line, keyed by filename.

use crate::buffers::{ByteStreamBuffer, KvPairBuffer};
use crate::convert::{EmitKvBuffer, FormatReader};
use crate::tuple;
use anyhow::Result;

/// Emits one `⟨filename, line⟩` tuple per text line.
///
/// Both `\n` and `\r\n` terminators are stripped, empty lines are
/// skipped, lines may span input buffers, and a final unterminated line
/// is still emitted at stream end.
pub struct TextLineFormatReader {
    filename: String,
    default_buffer_size: usize,
    line: Vec<u8>,
    output: Option<KvPairBuffer>,
}

impl TextLineFormatReader {
    pub fn new(filename: String, default_buffer_size: usize) -> Self {
        TextLineFormatReader {
            filename,
            default_buffer_size,
            line: Vec::new(),
            output: None,
        }
    }

    fn write_line(&mut self, emit: &mut EmitKvBuffer) -> Result<()> {
        if self.line.is_empty() {
            return Ok(());
        }

        let tuple_size =
            tuple::tuple_size(self.filename.len() as u32, self.line.len() as u32);

        if let Some(output) = &self.output {
            if output.capacity() - output.current_size() < tuple_size {
                emit(self.output.take().unwrap())?;
            }
        }
        if self.output.is_none() {
            self.output = Some(KvPairBuffer::new(
                self.default_buffer_size.max(tuple_size),
                0,
            ));
        }
        let output = self.output.as_mut().unwrap();

        let (key, value) =
            output.setup_append_kv_pair(self.filename.len() as u32, self.line.len() as u32);
        key.copy_from_slice(self.filename.as_bytes());
        value.copy_from_slice(&self.line);
        output.commit_append_kv_pair(self.line.len() as u32);

        self.line.clear();
        Ok(())
    }
}

impl FormatReader for TextLineFormatReader {
    fn read_byte_stream(
        &mut self,
        buffer: &mut ByteStreamBuffer,
        emit: &mut EmitKvBuffer,
    ) -> Result<()> {
        for i in 0..buffer.current_size() {
            let byte = buffer.bytes()[i];
            if byte == b'\n' {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                self.write_line(emit)?;
            } else {
                self.line.push(byte);
            }
        }
        Ok(())
    }

    fn stream_end(&mut self, emit: &mut EmitKvBuffer) -> Result<()> {
        // A final line without a terminator still counts.
        self.write_line(emit)?;
        if let Some(output) = self.output.take() {
            if !output.is_empty() {
                emit(output)?;
            }
        }
        Ok(())
    }
}
