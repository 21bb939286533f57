/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Sorted, binary-searchable lists of partition boundary keys.

use anyhow::{Context, Result};
use std::io::{Read, Write};

/// A compact sorted key list: one contiguous byte region holding the key
/// bytes plus parallel `(offset, length)` descriptors.
///
/// [`find_lower_bound`](Self::find_lower_bound) returns the index of the
/// last key not greater than the probe, shifted by the configured base
/// offset; with boundary keys for partitions `p .. p + n`, a base offset
/// of `p` makes the result a global partition id directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyList {
    num_keys: u64,
    lower_bound_offset: u64,
    key_bytes: Vec<u8>,
    /// `(offset, length)` of each key within `key_bytes`.
    key_infos: Vec<(u32, u32)>,
}

impl KeyList {
    /// Creates a list that will accept exactly `num_keys` keys totalling
    /// `num_bytes` bytes.
    pub fn new(num_keys: u64, num_bytes: u64, lower_bound_offset: u64) -> Self {
        KeyList {
            num_keys,
            lower_bound_offset,
            key_bytes: Vec::with_capacity(num_bytes as usize),
            key_infos: Vec::with_capacity(num_keys as usize),
        }
    }

    pub fn num_keys(&self) -> u64 {
        self.num_keys
    }

    /// Adds the next key in sorted order.
    pub fn add_key(&mut self, key: &[u8]) {
        assert!(
            (self.key_infos.len() as u64) < self.num_keys,
            "added more keys than the list can accept ({})",
            self.num_keys
        );
        self.key_infos
            .push((self.key_bytes.len() as u32, key.len() as u32));
        self.key_bytes.extend_from_slice(key);
    }

    fn key(&self, index: usize) -> &[u8] {
        let (offset, length) = self.key_infos[index];
        &self.key_bytes[offset as usize..(offset + length) as usize]
    }

    /// Binary search for the last key `≤ probe`, plus the base offset.
    ///
    /// Keys below the first boundary land in the first partition.
    pub fn find_lower_bound(&self, probe: &[u8]) -> u64 {
        assert!(
            self.key_infos.len() as u64 == self.num_keys,
            "tried to search a partially-filled key list ({} / {})",
            self.key_infos.len(),
            self.num_keys
        );

        let mut lower = 0u64;
        let mut upper = self.num_keys - 1;
        while lower < upper {
            // Round the midpoint up so the search makes progress when
            // lower + 1 == upper.
            let midpoint = (upper + lower + 1) / 2;
            if probe < self.key(midpoint as usize) {
                upper = midpoint.saturating_sub(1);
            } else {
                lower = midpoint;
            }
        }

        lower + self.lower_bound_offset
    }

    /// Serializes as `u64 numKeys, u64 numBytes, u64 lowerBoundOffset`,
    /// the key bytes, and one `u32` length per key, all big-endian.
    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer
            .write_all(&self.num_keys.to_be_bytes())
            .context("could not write key count")?;
        writer.write_all(&(self.key_bytes.len() as u64).to_be_bytes())?;
        writer.write_all(&self.lower_bound_offset.to_be_bytes())?;
        writer.write_all(&self.key_bytes)?;
        for &(_, length) in &self.key_infos {
            writer.write_all(&length.to_be_bytes())?;
        }
        Ok(())
    }

    /// Reads back the serialized form produced by
    /// [`write_to`](Self::write_to).
    pub fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut u64_bytes = [0u8; 8];
        reader
            .read_exact(&mut u64_bytes)
            .context("could not read key count")?;
        let num_keys = u64::from_be_bytes(u64_bytes);
        reader.read_exact(&mut u64_bytes)?;
        let num_bytes = u64::from_be_bytes(u64_bytes);
        reader.read_exact(&mut u64_bytes)?;
        let lower_bound_offset = u64::from_be_bytes(u64_bytes);

        let mut key_bytes = vec![0u8; num_bytes as usize];
        reader
            .read_exact(&mut key_bytes)
            .context("could not read key bytes")?;

        let mut key_infos = Vec::with_capacity(num_keys as usize);
        let mut offset = 0u32;
        let mut u32_bytes = [0u8; 4];
        for _ in 0..num_keys {
            reader.read_exact(&mut u32_bytes)?;
            let length = u32::from_be_bytes(u32_bytes);
            key_infos.push((offset, length));
            offset += length;
        }

        Ok(KeyList {
            num_keys,
            lower_bound_offset,
            key_bytes,
            key_infos,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list_of(keys: &[&[u8]], lower_bound_offset: u64) -> KeyList {
        let num_bytes = keys.iter().map(|key| key.len() as u64).sum();
        let mut list = KeyList::new(keys.len() as u64, num_bytes, lower_bound_offset);
        for key in keys {
            list.add_key(key);
        }
        list
    }

    #[test]
    fn test_find_lower_bound() {
        let list = list_of(&[b"b", b"f", b"m", b"t"], 0);
        assert_eq!(list.find_lower_bound(b"a"), 0); // below the first boundary
        assert_eq!(list.find_lower_bound(b"b"), 0);
        assert_eq!(list.find_lower_bound(b"c"), 0);
        assert_eq!(list.find_lower_bound(b"f"), 1);
        assert_eq!(list.find_lower_bound(b"g"), 1);
        assert_eq!(list.find_lower_bound(b"s"), 2);
        assert_eq!(list.find_lower_bound(b"t"), 3);
        assert_eq!(list.find_lower_bound(b"zzz"), 3);
    }

    #[test]
    fn test_lower_bound_offset() {
        let list = list_of(&[b"b", b"f"], 10);
        assert_eq!(list.find_lower_bound(b"a"), 10);
        assert_eq!(list.find_lower_bound(b"g"), 11);
    }

    #[test]
    fn test_file_round_trip() -> Result<()> {
        let list = list_of(&[b"apple", b"fig", b"mango"], 3);
        let mut serialized = Vec::new();
        list.write_to(&mut serialized)?;
        let read_back = KeyList::read_from(&mut serialized.as_slice())?;
        assert_eq!(list, read_back);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "more keys than the list can accept")]
    fn test_overfull_list_panics() {
        let mut list = KeyList::new(1, 8, 0);
        list.add_key(b"one");
        list.add_key(b"two");
    }
}
