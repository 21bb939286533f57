/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Replaying one input stream through several jobs' mappers.

use crate::buffers::KvPairBuffer;
use crate::map::Mapper;
use crate::stage::Worker;
use anyhow::Result;
use std::collections::BTreeMap;

/// Runs one child [`Mapper`] per active job and replays each input buffer
/// through every mapper whose job id is tagged on the buffer, resetting
/// the iterator between passes.
pub struct MultiJobMapper {
    mappers: BTreeMap<u64, Mapper>,
    make_mapper: Box<dyn FnMut(u64) -> Mapper + Send>,
}

impl MultiJobMapper {
    pub fn new(make_mapper: Box<dyn FnMut(u64) -> Mapper + Send>) -> Self {
        MultiJobMapper {
            mappers: BTreeMap::new(),
            make_mapper,
        }
    }
}

impl Worker for MultiJobMapper {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "multi-job-mapper"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        let job_ids: Vec<u64> = buffer.job_ids().iter().copied().collect();
        for job_id in job_ids {
            let mapper = self
                .mappers
                .entry(job_id)
                .or_insert_with(|| (self.make_mapper)(job_id));
            buffer.reset_iterator();
            mapper.map_buffer(&mut buffer)?;
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<()> {
        for mapper in self.mappers.values_mut() {
            mapper.flush()?;
        }
        Ok(())
    }
}
