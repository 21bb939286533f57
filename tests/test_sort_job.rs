/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

use anyhow::Result;
use rand::prelude::*;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use themis::config::{ClusterConfig, EngineConfig, Phase};
use themis::convert::FormatReaderKind;
use themis::coordinator::{Coordinator, DebugCoordinator, JobInfo};
use themis::map::IdentityMapFunction;
use themis::pipeline::SortJob;
use themis::read::ReadRequest;
use themis::reduce::IdentityReduceFunction;
use themis::tuple::{self, KeyValuePair};
use themis::write::parse_partition_file_path;

const NUM_PARTITIONS: u64 = 8;
const NUM_GROUPS: u64 = 4;
const JOB_ID: u64 = 0;

/// Writes `count` random framed tuples into `num_files` input files and
/// returns every (key, value) written.
fn generate_input(
    input_dir: &Path,
    num_files: usize,
    count: usize,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut rng = SmallRng::seed_from_u64(0x7e315);
    let mut tuples = Vec::with_capacity(count);
    let mut files: Vec<std::fs::File> = (0..num_files)
        .map(|i| {
            Ok(std::fs::File::create(
                input_dir.join(format!("input-{}", i)),
            )?)
        })
        .collect::<Result<_>>()?;

    for i in 0..count {
        let key: [u8; 10] = rng.random();
        let value_length = rng.random_range(0..64usize);
        let value: Vec<u8> = (0..value_length).map(|_| rng.random()).collect();

        let pair = KeyValuePair::new(&key, &value);
        let mut framed = vec![0u8; pair.write_size()];
        pair.serialize_into(&mut framed);
        files[i % num_files].write_all(&framed)?;

        tuples.push((key.to_vec(), value));
    }
    Ok(tuples)
}

fn engine_config(input: &Path, output_disks: Vec<PathBuf>) -> EngineConfig {
    let cluster = ClusterConfig::single_node(
        vec![input.to_owned()],
        output_disks,
        NUM_PARTITIONS,
        NUM_GROUPS,
    );
    let mut config = EngineConfig::new(cluster);
    // Keep chains small enough that the token discipline is actually
    // exercised on a test-sized input.
    config.chainer_emission_lower_bound = 1 << 10;
    config.chainer_emission_upper_bound = 1 << 14;
    config.sample_capacity = 512;
    for phase in [Phase::Zero, Phase::One, Phase::Two] {
        config.phase_mut(phase).format_reader = Some(FormatReaderKind::KvPair);
        config.phase_mut(phase).default_stage.default_buffer_size = 1 << 14;
    }
    config
}

fn coordinator_with(requests: Vec<ReadRequest>) -> Arc<dyn Coordinator> {
    Arc::new(DebugCoordinator::new(
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
    ))
}

fn partition_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(directory.join("job_0"))?
        .map(|entry| Ok(entry?.path()))
        .collect::<Result<_>>()?;
    paths.sort();
    Ok(paths)
}

#[test]
fn test_single_node_sort_job() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let workspace = tempfile::tempdir()?;
    let input = workspace.path().join("input");
    let intermediate = workspace.path().join("intermediate");
    let output = workspace.path().join("output");
    std::fs::create_dir_all(&input)?;
    std::fs::create_dir_all(&intermediate)?;
    std::fs::create_dir_all(&output)?;

    let mut written = generate_input(&input, 3, 5000)?;

    // Phase zero: decide partition boundaries from a sample of the map
    // output.
    let requests = DebugCoordinator::scan_input_directory(JOB_ID, &input, 0)?;
    let config = engine_config(&input, vec![intermediate.clone()]);
    let job = SortJob {
        config: config.clone(),
        coordinator: coordinator_with(requests.clone()),
        job_id: JOB_ID,
    };
    let partitioner = Arc::new(job.run_phase_zero(|| Box::new(IdentityMapFunction))?);
    assert_eq!(partitioner.num_global_partitions(), NUM_GROUPS);

    // Phase one: map, shuffle and write intermediate partition files.
    let job = SortJob {
        config,
        coordinator: coordinator_with(requests),
        job_id: JOB_ID,
    };
    job.run_phase_one(partitioner.clone(), || Box::new(IdentityMapFunction))?;

    let intermediate_files = partition_files(&intermediate)?;
    assert_eq!(intermediate_files.len() as u64, NUM_PARTITIONS);

    // Every tuple must be in the partition the boundary list assigns it
    // to, and nothing may be lost or invented.
    let mut seen = 0usize;
    for path in &intermediate_files {
        let info = parse_partition_file_path(&path.to_string_lossy()).unwrap();
        let bytes = std::fs::read(path)?;
        let mut offset = 0;
        while offset < bytes.len() {
            let pair = KeyValuePair::deserialize(&bytes[offset..]);
            let group = partitioner.global_partition(pair.key);
            let partition = partitioner.local_partition(pair.key, group);
            assert_eq!(partition, info.partition_id, "tuple in the wrong partition");
            offset += tuple::framed_size(&bytes[offset..]);
            seen += 1;
        }
        assert_eq!(offset, bytes.len(), "partition file ends mid-tuple");
    }
    assert_eq!(seen, written.len());

    // Phase two: sort each partition and reduce.
    let mut partition_requests = Vec::new();
    for path in &intermediate_files {
        let length = path.metadata()?.len();
        partition_requests.push(ReadRequest::local_file(path, [JOB_ID], length, 0));
    }
    let job = SortJob {
        config: engine_config(&input, vec![output.clone()]),
        coordinator: coordinator_with(partition_requests),
        job_id: JOB_ID,
    };
    job.run_phase_two(|| Box::new(IdentityReduceFunction))?;

    // The final output must hold exactly the input multiset, sorted
    // within each partition and ranged across partitions.
    let mut recovered: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    let mut partition_key_ranges: BTreeMap<u64, (Vec<u8>, Vec<u8>)> = BTreeMap::new();
    for path in partition_files(&output)? {
        let info = parse_partition_file_path(&path.to_string_lossy()).unwrap();
        let bytes = std::fs::read(path)?;
        let mut offset = 0;
        let mut first_key = None;
        let mut previous_key: Option<Vec<u8>> = None;
        while offset < bytes.len() {
            let pair = KeyValuePair::deserialize(&bytes[offset..]);
            if let Some(previous) = &previous_key {
                assert!(
                    previous.as_slice() <= pair.key,
                    "partition {} is not sorted",
                    info.partition_id
                );
            }
            first_key.get_or_insert_with(|| pair.key.to_vec());
            previous_key = Some(pair.key.to_vec());
            recovered.push((pair.key.to_vec(), pair.value.to_vec()));
            offset += tuple::framed_size(&bytes[offset..]);
        }
        if let (Some(first), Some(last)) = (first_key, previous_key) {
            partition_key_ranges.insert(info.partition_id, (first, last));
        }
    }

    written.sort();
    recovered.sort();
    assert_eq!(recovered, written);

    // Partitions cover disjoint, increasing key ranges.
    let ranges: Vec<(u64, (Vec<u8>, Vec<u8>))> = partition_key_ranges.into_iter().collect();
    for window in ranges.windows(2) {
        let (_, (_, left_max)) = &window[0];
        let (_, (right_min, _)) = &window[1];
        assert!(left_max <= right_min, "partition key ranges overlap");
    }
    Ok(())
}
