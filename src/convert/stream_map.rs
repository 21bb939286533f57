/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! The shared filename ↔ stream-id map.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

/// Provenance of one input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    stream_id: u64,
    filename: String,
    job_ids: BTreeSet<u64>,
    /// Total stream size, when the reader knows it up front.
    size: Option<u64>,
}

impl StreamInfo {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn job_ids(&self) -> &BTreeSet<u64> {
        &self.job_ids
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

/// Registry mapping filenames to stream ids, shared between readers and
/// converters.
///
/// Entries are append-only: readers register a stream before emitting its
/// first buffer, and converters look streams up concurrently, so reads
/// are guarded by the same lock as the appends.
#[derive(Debug, Default)]
pub struct FilenameToStreamIdMap {
    streams: RwLock<Vec<Arc<StreamInfo>>>,
}

impl FilenameToStreamIdMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a stream and returns its freshly assigned id.
    pub fn add_filename(
        &self,
        filename: impl Into<String>,
        job_ids: impl IntoIterator<Item = u64>,
        size: Option<u64>,
    ) -> u64 {
        let mut streams = self.streams.write().unwrap();
        let stream_id = streams.len() as u64;
        streams.push(Arc::new(StreamInfo {
            stream_id,
            filename: filename.into(),
            job_ids: job_ids.into_iter().collect(),
            size,
        }));
        stream_id
    }

    /// Looks up a registered stream; unknown ids are a broken invariant.
    pub fn stream_info(&self, stream_id: u64) -> Arc<StreamInfo> {
        let streams = self.streams.read().unwrap();
        streams
            .get(stream_id as usize)
            .unwrap_or_else(|| panic!("unknown stream id {}", stream_id))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.streams.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let map = FilenameToStreamIdMap::new();
        let first = map.add_filename("/data/input-0", [1], Some(4096));
        let second = map.add_filename("/data/input-1", [1, 2], None);
        assert_eq!(first, 0);
        assert_eq!(second, 1);

        let info = map.stream_info(first);
        assert_eq!(info.filename(), "/data/input-0");
        assert_eq!(info.size(), Some(4096));
        assert_eq!(map.stream_info(second).job_ids().len(), 2);
    }

    #[test]
    #[should_panic(expected = "unknown stream id")]
    fn test_unknown_stream_panics() {
        FilenameToStreamIdMap::new().stream_info(3);
    }
}
