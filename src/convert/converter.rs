/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Byte-stream to tuple conversion.

use crate::buffers::{ByteStreamBuffer, KvPairBuffer};
use crate::convert::{FilenameToStreamIdMap, StreamInfo};
use crate::stage::{Tracker, Worker};
use crate::write::parse_partition_file_path;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Emission callback handed to format readers.
pub type EmitKvBuffer<'a> = dyn FnMut(KvPairBuffer) -> Result<()> + 'a;

/// One per open stream: turns raw bytes into framed tuples.
pub trait FormatReader: Send {
    /// Consumes one byte-stream buffer, emitting any number of KV
    /// buffers.
    fn read_byte_stream(
        &mut self,
        buffer: &mut ByteStreamBuffer,
        emit: &mut EmitKvBuffer,
    ) -> Result<()>;

    /// Invoked on the stream-end sentinel; flushes any carried state.
    fn stream_end(&mut self, emit: &mut EmitKvBuffer) -> Result<()>;
}

/// The format reader families, selected per phase by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatReaderKind {
    /// Framed tuples, zero-copy with straddle handling.
    KvPair,
    /// Headerless fixed-size tuples; headers are synthesized.
    FixedSizeKvPair { key_length: u32, value_length: u32 },
    /// One tuple per text line, key = filename.
    TextLine,
    /// 64-bit fragments paired into 128-bit keys.
    RandomPair,
}

impl std::str::FromStr for FormatReaderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "KVPairFormatReader" => Ok(FormatReaderKind::KvPair),
            "FixedSizeKVPairFormatReader" => Ok(FormatReaderKind::FixedSizeKvPair {
                key_length: 10,
                value_length: 90,
            }),
            "TextLineFormatReader" => Ok(FormatReaderKind::TextLine),
            "RdRandFormatReader" => Ok(FormatReaderKind::RandomPair),
            _ => anyhow::bail!("unknown format reader {}", s),
        }
    }
}

impl FormatReaderKind {
    fn new_reader(
        &self,
        stream_info: Arc<StreamInfo>,
        default_buffer_size: usize,
    ) -> Box<dyn FormatReader> {
        match *self {
            FormatReaderKind::KvPair => Box::new(crate::convert::KvPairFormatReader::new()),
            FormatReaderKind::FixedSizeKvPair {
                key_length,
                value_length,
            } => Box::new(crate::convert::FixedSizeKvPairFormatReader::new(
                stream_info.size(),
                key_length,
                value_length,
            )),
            FormatReaderKind::TextLine => Box::new(crate::convert::TextLineFormatReader::new(
                stream_info.filename().to_string(),
                default_buffer_size,
            )),
            FormatReaderKind::RandomPair => {
                Box::new(crate::convert::RandomPairFormatReader::new())
            }
        }
    }
}

/// The byte-stream converter stage.
///
/// Holds one format reader per open stream id; an empty buffer is the
/// end-of-stream sentinel that flushes and closes the stream's reader.
/// Every emitted buffer is tagged with the stream's provenance: source
/// name, job ids, and — when the source is a partition file — the
/// partition and chunk ids parsed from the filename.
pub struct ByteStreamConverter {
    kind: FormatReaderKind,
    default_buffer_size: usize,
    stream_map: Arc<FilenameToStreamIdMap>,
    readers: HashMap<u64, Box<dyn FormatReader>>,
    downstream: Tracker<KvPairBuffer>,
}

impl ByteStreamConverter {
    pub fn new(
        kind: FormatReaderKind,
        default_buffer_size: usize,
        stream_map: Arc<FilenameToStreamIdMap>,
        downstream: Tracker<KvPairBuffer>,
    ) -> Self {
        ByteStreamConverter {
            kind,
            default_buffer_size,
            stream_map,
            readers: HashMap::new(),
            downstream,
        }
    }

    fn emitter<'a>(
        stream_info: &'a StreamInfo,
        downstream: &'a Tracker<KvPairBuffer>,
    ) -> impl FnMut(KvPairBuffer) -> Result<()> + 'a {
        move |mut buffer: KvPairBuffer| {
            buffer.source_name = Some(stream_info.filename().to_string());
            buffer.add_job_ids(stream_info.job_ids().iter().copied());

            if let Some(info) = parse_partition_file_path(stream_info.filename()) {
                buffer.logical_disk_id = Some(info.partition_id);
                buffer.chunk_id = info.chunk_id;
            }

            downstream.send(buffer)
        }
    }
}

impl Worker for ByteStreamConverter {
    type Input = ByteStreamBuffer;

    fn stage_name(&self) -> &'static str {
        "converter"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        let stream_id = buffer.stream_id();
        let stream_info = self.stream_map.stream_info(stream_id);

        let reader = self.readers.entry(stream_id).or_insert_with(|| {
            self.kind
                .new_reader(stream_info.clone(), self.default_buffer_size)
        });

        let mut emit = Self::emitter(stream_info.as_ref(), &self.downstream);
        if buffer.is_empty() {
            // Empty buffer signals a closed stream.
            reader.stream_end(&mut emit)?;
            self.readers.remove(&stream_id);
        } else {
            reader.read_byte_stream(&mut buffer, &mut emit)?;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        assert!(
            self.readers.is_empty(),
            "{} streams were still open during teardown",
            self.readers.len()
        );
        Ok(())
    }
}
