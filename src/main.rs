/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! A single-node driver: run a whole sort job against local directories.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use themis::config::{ClusterConfig, EngineConfig, Phase};
use themis::convert::FormatReaderKind;
use themis::coordinator::{Coordinator, DebugCoordinator, JobInfo};
use themis::map::IdentityMapFunction;
use themis::pipeline::SortJob;
use themis::read::ReadRequest;
use themis::reduce::IdentityReduceFunction;
use themis::sort::SortStrategyKind;

#[derive(Parser, Debug)]
#[command(about = "Sort a directory of framed key/value tuples into partition files", version)]
struct Args {
    /// Directory of input files.
    input: PathBuf,

    /// Directory for intermediate partition files.
    intermediate: PathBuf,

    /// Directory for final output partition files.
    output: PathBuf,

    /// Number of output partitions.
    #[arg(long, default_value_t = 16)]
    partitions: u64,

    /// Number of partition groups.
    #[arg(long, default_value_t = 4)]
    partition_groups: u64,

    /// Input format reader.
    #[arg(long, default_value = "KVPairFormatReader")]
    format_reader: String,

    /// Sort strategy (RADIX_SORT, QUICK_SORT or ANY).
    #[arg(long, default_value = "ANY")]
    sort_strategy: String,

    /// Reservoir size of the phase-zero sample.
    #[arg(long, default_value_t = 65536)]
    sample_capacity: usize,

    /// Partitions above this many bytes are split into chunks and
    /// merged separately (0 disables).
    #[arg(long, default_value_t = 0)]
    large_partition_threshold: u64,
}

fn job_info(job_id: u64, num_partitions: u64) -> JobInfo {
    JobInfo {
        job_id,
        map_function: "identity".into(),
        reduce_function: "identity".into(),
        partition_function: "boundary".into(),
        total_input_size: 0,
        num_partitions,
    }
}

fn config_for(args: &Args, output_disks: Vec<PathBuf>) -> Result<EngineConfig> {
    let cluster = ClusterConfig::single_node(
        vec![args.input.clone()],
        output_disks,
        args.partitions,
        args.partition_groups,
    );
    let mut config = EngineConfig::new(cluster);
    config.sort_strategy = args.sort_strategy.parse::<SortStrategyKind>()?;
    config.sample_capacity = args.sample_capacity;
    config.large_partition_threshold = args.large_partition_threshold;

    let format_reader = args.format_reader.parse::<FormatReaderKind>()?;
    for phase in [Phase::Zero, Phase::One] {
        config.phase_mut(phase).format_reader = Some(format_reader);
    }
    // Phase two re-reads our own partition files whole; no format
    // reader is involved.
    config.phase_mut(Phase::Two).format_reader = None;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .try_init()?;
    let args = Args::parse();
    let job_id = 0;

    std::fs::create_dir_all(&args.intermediate)?;
    std::fs::create_dir_all(&args.output)?;

    // Phases zero and one read the input and write intermediate
    // partition files.
    let requests = DebugCoordinator::scan_input_directory(job_id, &args.input, 0)
        .with_context(|| format!("could not scan {}", args.input.display()))?;

    let map_config = config_for(&args, vec![args.intermediate.clone()])?;
    let coordinator: Arc<dyn Coordinator> = Arc::new(DebugCoordinator::new(
        job_info(job_id, args.partitions),
        PathBuf::from(""),
        requests.clone(),
    ));
    let job = SortJob {
        config: map_config.clone(),
        coordinator: coordinator.clone(),
        job_id,
    };

    let partitioner = Arc::new(job.run_phase_zero(|| Box::new(IdentityMapFunction))?);

    let coordinator: Arc<dyn Coordinator> = Arc::new(DebugCoordinator::new(
        job_info(job_id, args.partitions),
        PathBuf::from(""),
        requests,
    ));
    let job = SortJob {
        config: map_config,
        coordinator,
        job_id,
    };
    job.run_phase_one(partitioner, || Box::new(IdentityMapFunction))?;

    // Partitions that outgrew the large-partition threshold are merged
    // back into ordinary sorted partitions before the reduce phase.
    job.run_phase_three()?;

    // Phase two reads the intermediate partitions and writes the final
    // sorted output.
    let mut partition_requests: Vec<ReadRequest> = Vec::new();
    let job_dir = args.intermediate.join(format!("job_{}", job_id));
    let mut paths: Vec<PathBuf> = std::fs::read_dir(&job_dir)
        .with_context(|| format!("could not list {}", job_dir.display()))?
        .map(|entry| Ok(entry?.path()))
        .collect::<Result<_>>()?;
    paths.sort();
    for path in paths {
        let name = path.file_name().unwrap_or_default().to_string_lossy();
        if !name.ends_with(".partition") {
            // Large originals and their chunk files are already merged.
            continue;
        }
        let length = path.metadata()?.len();
        partition_requests.push(ReadRequest::local_file(path, [job_id], length, 0));
    }

    let reduce_config = config_for(&args, vec![args.output.clone()])?;
    let coordinator: Arc<dyn Coordinator> = Arc::new(DebugCoordinator::new(
        job_info(job_id, args.partitions),
        PathBuf::from(""),
        partition_requests,
    ));
    let job = SortJob {
        config: reduce_config,
        coordinator,
        job_id,
    };
    job.run_phase_two(|| Box::new(IdentityReduceFunction))?;

    log::info!("job {} complete", job_id);
    Ok(())
}
