/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use rand::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use themis::config::{ClusterConfig, EngineConfig, Phase};
use themis::convert::FormatReaderKind;
use themis::coordinator::{Coordinator, DebugCoordinator, JobInfo};
use themis::map::IdentityMapFunction;
use themis::pipeline::SortJob;
use themis::tuple::{self, KeyValuePair};
use themis::write::parse_partition_file_path;

const NUM_PARTITIONS: u64 = 4;
const NUM_GROUPS: u64 = 2;
const JOB_ID: u64 = 0;

fn generate_input(input_dir: &Path, count: usize) -> Result<usize> {
    let mut rng = SmallRng::seed_from_u64(0x1a79e);
    let mut file = std::fs::File::create(input_dir.join("input-0"))?;
    let mut total = 0;
    for _ in 0..count {
        let key: [u8; 8] = rng.random();
        let value = [0xCDu8; 20];
        let pair = KeyValuePair::new(&key, &value);
        let mut framed = vec![0u8; pair.write_size()];
        pair.serialize_into(&mut framed);
        file.write_all(&framed)?;
        total += framed.len();
    }
    Ok(total)
}

fn coordinator_for(input: &Path) -> Result<Arc<dyn Coordinator>> {
    let requests = DebugCoordinator::scan_input_directory(JOB_ID, input, 0)?;
    Ok(Arc::new(DebugCoordinator::new(
        JobInfo {
            job_id: JOB_ID,
            map_function: "identity".into(),
            reduce_function: "identity".into(),
            partition_function: "boundary".into(),
            total_input_size: 0,
            num_partitions: NUM_PARTITIONS,
        },
        PathBuf::from(""),
        requests,
    )))
}

/// Every partition exceeds the threshold, gets split into chunks, and
/// is merged back into one sorted partition file.
#[test]
fn test_large_partitions_are_chunked_and_merged() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let workspace = tempfile::tempdir()?;
    let input = workspace.path().join("input");
    let intermediate = workspace.path().join("intermediate");
    std::fs::create_dir_all(&input)?;
    std::fs::create_dir_all(&intermediate)?;

    let total_bytes = generate_input(&input, 2000)?;

    let cluster = ClusterConfig::single_node(
        vec![input.clone()],
        vec![intermediate.clone()],
        NUM_PARTITIONS,
        NUM_GROUPS,
    );
    let mut config = EngineConfig::new(cluster);
    config.sample_capacity = 256;
    // Every partition is "large", and chunks are a few KB each.
    config.large_partition_threshold = 1024;
    config.chainer_emission_lower_bound = 1 << 10;
    config.chainer_emission_upper_bound = 1 << 14;
    for phase in [Phase::Zero, Phase::One, Phase::Three] {
        config.phase_mut(phase).format_reader = Some(FormatReaderKind::KvPair);
        config.phase_mut(phase).default_stage.default_buffer_size = 1 << 13;
    }

    let job = SortJob {
        config,
        coordinator: coordinator_for(&input)?,
        job_id: JOB_ID,
    };

    let partitioner = Arc::new(job.run_phase_zero(|| Box::new(IdentityMapFunction))?);
    job.run_phase_one(partitioner, || Box::new(IdentityMapFunction))?;

    // Phase one must have renamed every partition.
    let job_dir = intermediate.join("job_0");
    let large_count = std::fs::read_dir(&job_dir)?
        .filter(|entry| {
            entry
                .as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".partition.large")
        })
        .count();
    assert_eq!(large_count as u64, NUM_PARTITIONS);

    job.run_phase_three()?;

    // Every partition is merged back, sorted, with all its bytes.
    let mut merged_bytes = 0;
    let mut merged_partitions = 0;
    for entry in std::fs::read_dir(&job_dir)? {
        let path = entry?.path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        if !name.ends_with(".partition") {
            continue;
        }
        let info = parse_partition_file_path(&path.to_string_lossy()).unwrap();

        let bytes = std::fs::read(&path)?;
        let mut offset = 0;
        let mut previous_key: Option<Vec<u8>> = None;
        while offset < bytes.len() {
            let pair = KeyValuePair::deserialize(&bytes[offset..]);
            if let Some(previous) = &previous_key {
                assert!(
                    previous.as_slice() <= pair.key,
                    "merged partition {} is not sorted",
                    info.partition_id
                );
            }
            previous_key = Some(pair.key.to_vec());
            offset += tuple::framed_size(&bytes[offset..]);
        }
        assert_eq!(offset, bytes.len());
        merged_bytes += bytes.len();
        merged_partitions += 1;
    }
    assert_eq!(merged_partitions as u64, NUM_PARTITIONS);
    assert_eq!(merged_bytes, total_bytes);
    Ok(())
}
