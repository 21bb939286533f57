/*
 * SPDX-FileCopyrightText: 2023 Inria
 * SPDX-FileCopyrightText: 2023 Sebastiano Vigna
 *
 * SPDX-License-Identifier: Apache-2.0 OR LGPL-2.1-or-later
 */

//! Wiring the worker stages into phase graphs.
//!
//! Each phase is a directed graph of stages connected by bounded queues.
//! Phase zero samples map output and produces the job's partition
//! boundaries; phase one maps, shuffles and writes partition files;
//! phase two sorts and reduces each partition; phase three merges the
//! chunks of large partitions. This module wires the graphs for one
//! node; the coordinator decides what every node reads and when phases
//! begin.

use crate::boundary::{
    BoundaryDecider, BoundaryDeserializer, BoundaryScanner, KeyPartitioner, SampleCombiner,
};
use crate::buffers::KvPairBuffer;
use crate::chain::{Chainer, ChainerConfig, Coalescer, WriteTokenPool};
use crate::config::{EngineConfig, Phase};
use crate::convert::{ByteStreamConverter, FilenameToStreamIdMap};
use crate::coordinator::Coordinator;
use crate::map::{Mapper, MapFunction, PartitionFunction, SampleMapper, TupleDemux};
use crate::memory::MemoryAllocator;
use crate::merge::ChunkMerger;
use crate::read::{AioReader, ByteStreamReader, ReadRequest, WholeFileReader};
use crate::reduce::{Reducer, ReduceFunction, ReplicationPolicy};
use crate::shuffle::{accept_flows, connect_flows, Receiver as ShuffleReceiver, SelectSender};
use crate::sort::{SortValidator, Sorter};
use crate::stage::{
    join_pool, spawn_batch_pool, spawn_multi_queue, spawn_pool, work_queue, work_queues, Tracker,
    Worker,
};
use crate::write::{job_directory, AioWriter, BlockingWriter, WriterConfig, WriterFiles};
use std::sync::Mutex;
use anyhow::{Context, Result};
use dsi_progress_logger::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Queue capacity between stages, in work units.
const QUEUE_CAPACITY: usize = 64;

/// Forwards received buffers to the demux of their partition group.
struct GroupRouter {
    groups_per_node: u64,
    first_local_group: u64,
    demux_trackers: Vec<Tracker<KvPairBuffer>>,
}

impl Worker for GroupRouter {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "group-router"
    }

    fn process(&mut self, buffer: Self::Input) -> Result<()> {
        let group = buffer
            .partition_group
            .expect("shuffled buffer arrived without a partition group");
        let local_group = group - self.first_local_group;
        assert!(
            local_group < self.groups_per_node,
            "buffer for group {} reached a node owning groups {}..{}",
            group,
            self.first_local_group,
            self.first_local_group + self.groups_per_node
        );
        let mut routed = buffer;
        routed.partition_group = Some(local_group);
        self.demux_trackers[local_group as usize].send(routed)
    }
}

/// Assigns sequential chunk ids to the sorted pieces of each large
/// partition, recording the final chunk count per partition for the
/// merge step.
struct ChunkTagger {
    next_chunk: HashMap<u64, u64>,
    chunk_counts: Arc<Mutex<HashMap<u64, u64>>>,
    downstream: Tracker<KvPairBuffer>,
}

impl Worker for ChunkTagger {
    type Input = KvPairBuffer;

    fn stage_name(&self) -> &'static str {
        "chunk-tagger"
    }

    fn process(&mut self, mut buffer: Self::Input) -> Result<()> {
        if buffer.is_empty() {
            // An empty buffer would become an empty chunk file, which
            // the merge step's reader skips; don't count one.
            return Ok(());
        }
        let partition = buffer
            .logical_disk_id
            .expect("large-partition buffer arrived without a partition tag");
        let next = self.next_chunk.entry(partition).or_insert(0);
        buffer.chunk_id = Some(*next);
        *next += 1;
        self.chunk_counts
            .lock()
            .unwrap()
            .insert(partition, *next);
        self.downstream.send(buffer)
    }
}

/// One node's view of a running job.
pub struct SortJob {
    pub config: EngineConfig,
    pub coordinator: Arc<dyn Coordinator>,
    pub job_id: u64,
}

impl SortJob {
    /// Drains the coordinator's read requests into a reader queue.
    fn feed_read_requests(&self, tracker: Tracker<crate::read::ReadRequest>) -> Result<()> {
        let mut progress = ProgressLogger::default();
        progress.item_name("request");
        progress.start("feeding read requests...");
        while let Some(request) = self.coordinator.next_read_request(0)? {
            tracker.send(request)?;
            progress.update();
        }
        progress.done();
        Ok(())
    }

    fn writer_files(&self, phase: Phase, token_pool: Option<Arc<WriteTokenPool>>) -> WriterFiles {
        let cluster = &self.config.cluster;
        let settings = self.config.phase(phase);
        let output_disks: BTreeMap<u64, std::path::PathBuf> = cluster
            .output_disks
            .iter()
            .enumerate()
            .map(|(disk, path)| (disk as u64, path.clone()))
            .collect();

        WriterFiles::new(
            WriterConfig {
                node_id: cluster.my_peer_id,
                node_ip_address: cluster.my_ip_address.clone(),
                num_disks: cluster.output_disks.len() as u64,
                partitions_per_disk: cluster.partitions_per_disk(),
                output_disks,
                direct_io: settings.stage("writer").direct_io,
                preallocation_size: if self.config.file_preallocation {
                    self.config.partition_size
                } else {
                    0
                },
                max_write_size: settings.max_write_size,
                large_partition_threshold: if phase == Phase::One {
                    self.config.large_partition_threshold
                } else {
                    0
                },
                bytes_before_simulated_failure: 0,
                chunk_disks: HashMap::new(),
            },
            self.coordinator.clone(),
            token_pool,
        )
    }

    /// Phase zero: sample the input and decide partition boundaries.
    ///
    /// On a single node the scanner's boundary buffers feed the decider
    /// directly; in a cluster the same buffers would ride the shuffle to
    /// the merge node and the broadcast would ride it back.
    pub fn run_phase_zero(
        &self,
        make_map_function: impl Fn() -> Box<dyn MapFunction>,
    ) -> Result<KeyPartitioner> {
        let cluster = &self.config.cluster;
        let settings = self.config.phase(Phase::Zero);
        let stream_map = Arc::new(FilenameToStreamIdMap::new());

        log::info!("running phase zero");
        let (request_tracker, request_queue) = work_queue("reader", QUEUE_CAPACITY);
        let (converter_tracker, converter_queue) = work_queue("converter", QUEUE_CAPACITY);
        let (mapper_tracker, mapper_queue) = work_queue("sample-mapper", QUEUE_CAPACITY);
        let (combiner_tracker, combiner_queue) = work_queue("sample-combiner", QUEUE_CAPACITY);
        let (sorter_tracker, sorter_queue) = work_queue("sorter", QUEUE_CAPACITY);
        let (scanner_tracker, scanner_queue) = work_queue("boundary-scanner", QUEUE_CAPACITY);
        let (decider_trackers, decider_queues) =
            work_queues("boundary-decider", cluster.num_peers as usize, QUEUE_CAPACITY);
        let (deserializer_tracker, deserializer_queue) =
            work_queue("boundary-deserializer", QUEUE_CAPACITY);
        let (partitioner_tracker, partitioner_queue) = work_queue("partitioners", 4);

        let reader_settings = settings.stage("reader");
        let readers = spawn_pool(
            vec![ByteStreamReader::new(
                settings.max_read_size,
                reader_settings.alignment,
                reader_settings.direct_io,
                reader_settings.default_buffer_size,
                settings.delete_after_read,
                false,
                stream_map.clone(),
                converter_tracker,
            )],
            request_queue,
        )?;

        let converters = spawn_pool(
            vec![ByteStreamConverter::new(
                settings
                    .format_reader
                    .expect("phase zero needs a format reader"),
                settings.stage("converter").default_buffer_size,
                stream_map,
                mapper_tracker,
            )],
            converter_queue,
        )?;

        let mappers = spawn_pool(
            vec![SampleMapper::new(
                self.job_id,
                make_map_function(),
                self.config.sample_capacity,
                self.job_id ^ cluster.my_peer_id,
                cluster.merge_node_id,
                combiner_tracker,
            )],
            mapper_queue,
        )?;

        let combiners = spawn_pool(
            vec![SampleCombiner::new(sorter_tracker)],
            combiner_queue,
        )?;

        let allocator = MemoryAllocator::new(self.config.memory_quota);
        let sorters = spawn_pool(
            vec![Sorter::new(
                self.config.sort_strategy,
                self.config.use_secondary_keys,
                self.config.max_radix_sort_scratch_size,
                allocator,
                settings.stage("sorter").alignment,
                true,
                scanner_tracker,
            )],
            sorter_queue,
        )?;

        // The scanner's output goes straight onto this node's decider
        // queue.
        let decider_tracker = decider_trackers[cluster.my_peer_id as usize].clone();
        drop(decider_trackers);
        let scanners = spawn_pool(
            vec![BoundaryScanner::new(
                cluster.num_partitions,
                cluster.merge_node_id,
                settings.stage("boundary-scanner").default_buffer_size,
                decider_tracker,
            )],
            scanner_queue,
        )?;

        let decider = spawn_multi_queue(
            BoundaryDecider::new(
                cluster.num_peers,
                settings.stage("boundary-decider").default_buffer_size,
                deserializer_tracker,
            ),
            decider_queues,
            0,
        )?;

        let deserializers = spawn_pool(
            vec![BoundaryDeserializer::new(
                cluster.my_peer_id,
                cluster.num_peers,
                cluster.num_partition_groups,
                cluster.num_partitions,
                partitioner_tracker,
            )],
            deserializer_queue,
        )?;

        self.feed_read_requests(request_tracker)?;

        join_pool(readers)?;
        join_pool(converters)?;
        join_pool(mappers)?;
        join_pool(combiners)?;
        join_pool(sorters)?;
        join_pool(scanners)?;
        join_pool(vec![decider])?;
        join_pool(deserializers)?;
        log::info!("phase zero complete");

        let (_, partitioner) = partitioner_queue
            .recv()
            .context("phase zero produced no partition boundaries")?;
        Ok(partitioner)
    }

    /// Phase one: map, shuffle, chain, coalesce and write partitions.
    pub fn run_phase_one(
        &self,
        partitioner: Arc<KeyPartitioner>,
        make_map_function: impl Fn() -> Box<dyn MapFunction>,
    ) -> Result<()> {
        let cluster = &self.config.cluster;
        let settings = self.config.phase(Phase::One);
        let stream_map = Arc::new(FilenameToStreamIdMap::new());

        log::info!("running phase one");
        // Shuffle plumbing first: every node listens, connects to every
        // peer, and accepts one inbound flow per peer flow.
        let listener = TcpListener::bind((cluster.my_ip_address.as_str(), 0))
            .context("could not bind the shuffle listener")?;
        let listen_address = listener.local_addr()?.to_string();
        // A real deployment exchanges addresses through the coordinator;
        // one node just talks to itself.
        let peer_addresses: Vec<String> = if cluster.num_peers == 1 {
            vec![listen_address]
        } else {
            cluster.peers.clone()
        };

        let outbound = connect_flows(
            cluster.my_peer_id,
            &peer_addresses,
            self.config.flows_per_peer,
        )?;
        let inbound = accept_flows(
            &listener,
            (cluster.num_peers * self.config.flows_per_peer) as usize,
        )?;

        // Queues.
        let (request_tracker, request_queue) = work_queue("reader", QUEUE_CAPACITY);
        let (converter_tracker, converter_queue) = work_queue("converter", QUEUE_CAPACITY);
        let (mapper_tracker, mapper_queue) = work_queue("mapper", QUEUE_CAPACITY);
        let (sender_trackers, sender_queues) =
            work_queues("sender", cluster.num_peers as usize, QUEUE_CAPACITY);
        let (router_tracker, router_queue) = work_queue("group-router", QUEUE_CAPACITY);
        let groups_per_node = cluster.groups_per_node();
        let (demux_trackers, demux_queues) =
            work_queues("demux", groups_per_node as usize, QUEUE_CAPACITY);
        let (chainer_tracker, chainer_queue) = work_queue("chainer", QUEUE_CAPACITY);
        let (coalescer_tracker, coalescer_queue) = work_queue("coalescer", QUEUE_CAPACITY);
        let (writer_tracker, writer_queue) = work_queue("writer", QUEUE_CAPACITY);

        let token_pool = Arc::new(WriteTokenPool::new(
            self.config.write_tokens_per_disk,
            cluster.output_disks.len() as u64,
        ));

        // Readers and converters.
        let reader_settings = settings.stage("reader");
        let readers = if self.config.asynchronous_io {
            vec![spawn_multi_queue(
                AioReader::byte_stream(
                    reader_settings.asynchronous_io_depth,
                    reader_settings.default_buffer_size,
                    reader_settings.alignment,
                    reader_settings.direct_io,
                    settings.delete_after_read,
                    false,
                    stream_map.clone(),
                    converter_tracker,
                ),
                vec![request_queue],
                0,
            )?]
        } else {
            spawn_pool(
                vec![ByteStreamReader::new(
                    settings.max_read_size,
                    reader_settings.alignment,
                    reader_settings.direct_io,
                    reader_settings.default_buffer_size,
                    settings.delete_after_read,
                    false,
                    stream_map.clone(),
                    converter_tracker,
                )],
                request_queue,
            )?
        };
        let converters = spawn_pool(
            vec![ByteStreamConverter::new(
                settings
                    .format_reader
                    .expect("phase one needs a format reader"),
                settings.stage("converter").default_buffer_size,
                stream_map,
                mapper_tracker,
            )],
            converter_queue,
        )?;

        // Mapper, partitioned by the boundary list.
        let partition_function =
            Arc::new(PartitionFunction::BoundaryList(partitioner.clone()));
        let mappers = spawn_pool(
            vec![Mapper::new(
                self.job_id,
                make_map_function(),
                partition_function.clone(),
                cluster.num_partition_groups,
                groups_per_node,
                settings.stage("mapper").default_buffer_size,
                sender_trackers,
            )],
            mapper_queue,
        )?;

        // Shuffle.
        let sender = spawn_multi_queue(
            SelectSender::new(
                outbound,
                self.config.send_socket_syscall_size,
                self.config.select_sender_get_more_data_timeout,
                Some(self.coordinator.clone()),
            ),
            sender_queues,
            0,
        )?;
        let receiver_settings = settings.stage("receiver");
        let mut shuffle_receiver =
            ShuffleReceiver::new(inbound, receiver_settings.alignment, router_tracker);
        let receiver: JoinHandle<Result<()>> = std::thread::Builder::new()
            .name("receiver-0".into())
            .spawn(move || shuffle_receiver.run())?;

        // Demux per node-relative partition group.
        let routers = spawn_pool(
            vec![GroupRouter {
                groups_per_node,
                first_local_group: cluster.my_peer_id * groups_per_node,
                demux_trackers,
            }],
            router_queue,
        )?;
        let mut demux_pools = Vec::new();
        for (local_group, demux_queue) in demux_queues.into_iter().enumerate() {
            let partition_offset = cluster.first_local_partition()
                + local_group as u64 * cluster.partitions_per_group();
            let demuxes = spawn_pool(
                vec![TupleDemux::new(
                    self.job_id,
                    partition_function.clone(),
                    local_group as u64,
                    partition_offset,
                    cluster.partitions_per_group(),
                    settings.stage("demux").default_buffer_size,
                    chainer_tracker.clone(),
                )],
                demux_queue,
            )?;
            demux_pools.push(demuxes);
        }
        drop(chainer_tracker);

        // Chainer, coalescer, writer.
        let chainers = spawn_batch_pool(
            vec![Chainer::new(
                ChainerConfig {
                    node_id: cluster.my_peer_id,
                    disks_per_chainer: cluster.output_disks.len() as u64,
                    base_disk_id: 0,
                    num_node_disks: cluster.output_disks.len() as u64,
                    partitions_per_disk: cluster.partitions_per_disk(),
                    emission_lower_bound: self.config.chainer_emission_lower_bound,
                    emission_upper_bound: self.config.chainer_emission_upper_bound,
                },
                token_pool.clone(),
                coalescer_tracker,
            )],
            chainer_queue,
        )?;
        let coalescers = spawn_pool(
            vec![Coalescer::new(
                settings.write_size_multiple,
                settings.stage("coalescer").alignment,
                writer_tracker,
            )],
            coalescer_queue,
        )?;
        let writer_files = self.writer_files(Phase::One, Some(token_pool));
        let writers = if self.config.asynchronous_io {
            vec![spawn_multi_queue(
                AioWriter::new(writer_files, settings.stage("writer").asynchronous_io_depth),
                vec![writer_queue],
                0,
            )?]
        } else {
            spawn_pool(vec![BlockingWriter::new(writer_files)], writer_queue)?
        };

        self.feed_read_requests(request_tracker)?;

        join_pool(readers)?;
        join_pool(converters)?;
        join_pool(mappers)?;
        join_pool(vec![sender])?;
        match receiver.join() {
            Ok(result) => result?,
            Err(panic) => std::panic::resume_unwind(panic),
        }
        join_pool(routers)?;
        for demuxes in demux_pools {
            join_pool(demuxes)?;
        }
        join_pool(chainers)?;
        join_pool(coalescers)?;
        join_pool(writers)?;
        log::info!("phase one complete");
        Ok(())
    }

    /// Phase two: sort each partition and run the reduce function.
    ///
    /// A partition must be sorted as a single buffer (the reducer's
    /// group runs cannot straddle buffers), so this phase reads each
    /// partition file whole instead of streaming it through a format
    /// reader.
    pub fn run_phase_two(
        &self,
        make_reduce_function: impl Fn() -> Box<dyn ReduceFunction>,
    ) -> Result<()> {
        let cluster = &self.config.cluster;
        let settings = self.config.phase(Phase::Two);

        log::info!("running phase two");
        let (request_tracker, request_queue) = work_queue("reader", QUEUE_CAPACITY);
        let (validator_tracker, validator_queue) = work_queue("sort-validator", QUEUE_CAPACITY);
        let (sorter_tracker, sorter_queue) = work_queue("sorter", QUEUE_CAPACITY);
        let (reducer_tracker, reducer_queue) = work_queue("reducer", QUEUE_CAPACITY);
        let (writer_tracker, writer_queue) = work_queue("writer", QUEUE_CAPACITY);

        let reader_settings = settings.stage("reader");
        let readers = spawn_pool(
            vec![WholeFileReader::new(
                settings.max_read_size,
                reader_settings.alignment,
                reader_settings.direct_io,
                settings.delete_after_read,
                validator_tracker,
            )],
            request_queue,
        )?;

        // A partition whose sort cannot fit the memory budget would park
        // the sorter forever; the validator drops it up front.
        let validators = spawn_pool(
            vec![SortValidator::new(
                self.config.sort_strategy,
                self.config.use_secondary_keys,
                self.config.max_radix_sort_scratch_size,
                self.config.memory_quota,
                sorter_tracker,
            )],
            validator_queue,
        )?;

        let allocator = MemoryAllocator::new(self.config.memory_quota);
        let sorter_settings = settings.stage("sorter");
        let sorters = spawn_pool(
            (0..sorter_settings.num_workers.max(1))
                .map(|_| {
                    Sorter::new(
                        self.config.sort_strategy,
                        self.config.use_secondary_keys,
                        self.config.max_radix_sort_scratch_size,
                        allocator.clone(),
                        sorter_settings.alignment,
                        false,
                        reducer_tracker.clone(),
                    )
                })
                .collect(),
            sorter_queue,
        )?;
        drop(reducer_tracker);

        // Replicas are routed to a second pipeline in a cluster; a
        // single node has no peers, so its replica stream is drained
        // with a warning.
        let mut replica_drainer = None;
        let replication = (self.config.output_replication_level > 1).then(|| {
            let (replica_tracker, replica_queue) =
                work_queue::<KvPairBuffer>("replica-sender", QUEUE_CAPACITY);
            if cluster.num_peers == 1 {
                replica_drainer = Some(std::thread::spawn(move || {
                    let mut dropped = 0u64;
                    while replica_queue.recv().is_ok() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        log::warn!(
                            "dropped {} replica buffers: a single node has no peers to \
                             replicate to",
                            dropped
                        );
                    }
                }));
            }
            (
                ReplicationPolicy {
                    replication_level: self.config.output_replication_level,
                    num_nodes: cluster.num_peers,
                    first_local_partition: cluster.first_local_partition(),
                },
                replica_tracker,
            )
        });
        let reducers = spawn_pool(
            vec![Reducer::new(
                make_reduce_function(),
                settings.stage("reducer").default_buffer_size,
                settings.stage("reducer").alignment,
                replication,
                writer_tracker,
            )],
            reducer_queue,
        )?;

        let writers = spawn_pool(
            vec![BlockingWriter::new(self.writer_files(Phase::Two, None))],
            writer_queue,
        )?;

        self.feed_read_requests(request_tracker)?;

        join_pool(readers)?;
        join_pool(validators)?;
        join_pool(sorters)?;
        join_pool(reducers)?;
        join_pool(writers)?;
        if let Some(drainer) = replica_drainer {
            let _ = drainer.join();
        }
        log::info!("phase two complete");
        Ok(())
    }

    /// Finds this node's files under the job's output directories whose
    /// names pass `select`.
    fn scan_job_files(
        &self,
        select: impl Fn(&str) -> bool,
    ) -> Result<Vec<ReadRequest>> {
        let output_directory = self.coordinator.output_directory(self.job_id)?;
        let mut requests = Vec::new();
        for disk in &self.config.cluster.output_disks {
            let job_dir = job_directory(&disk.join(&output_directory), self.job_id, false);
            if !job_dir.exists() {
                continue;
            }
            let mut paths: Vec<std::path::PathBuf> = std::fs::read_dir(&job_dir)?
                .map(|entry| Ok(entry?.path()))
                .collect::<Result<_>>()?;
            paths.sort();
            for path in paths {
                let name = path.file_name().unwrap_or_default().to_string_lossy();
                if !select(&name) {
                    continue;
                }
                let length = path.metadata()?.len();
                requests.push(ReadRequest::local_file(path, [self.job_id], length, 0));
            }
        }
        Ok(requests)
    }

    /// Phase three: split each large partition into sorted chunks, then
    /// merge the chunks into the final sorted partition.
    ///
    /// Chunk size follows the phase's reader buffer size: every reader
    /// buffer becomes one sorted chunk. The merge step's reads are gated
    /// by tokens keyed `partition offset + chunk id`, which the merger
    /// returns as it consumes chunks.
    pub fn run_phase_three(&self) -> Result<()> {
        let settings = self.config.phase(Phase::Three);

        let large_requests = self.scan_job_files(|name| name.ends_with(".partition.large"))?;
        if large_requests.is_empty() {
            log::info!("no large partitions; skipping phase three");
            return Ok(());
        }
        log::info!(
            "running phase three over {} large partitions",
            large_requests.len()
        );

        // Part one: read, chunk, sort, and write chunk files.
        let chunk_counts = Arc::new(Mutex::new(HashMap::new()));
        {
            let stream_map = Arc::new(FilenameToStreamIdMap::new());
            let (request_tracker, request_queue) = work_queue("reader", QUEUE_CAPACITY);
            let (converter_tracker, converter_queue) = work_queue("converter", QUEUE_CAPACITY);
            let (tagger_tracker, tagger_queue) = work_queue("chunk-tagger", QUEUE_CAPACITY);
            let (sorter_tracker, sorter_queue) = work_queue("sorter", QUEUE_CAPACITY);
            let (writer_tracker, writer_queue) = work_queue("writer", QUEUE_CAPACITY);

            let reader_settings = settings.stage("reader");
            let readers = spawn_pool(
                vec![ByteStreamReader::new(
                    settings.max_read_size,
                    reader_settings.alignment,
                    reader_settings.direct_io,
                    reader_settings.default_buffer_size,
                    settings.delete_after_read,
                    false,
                    stream_map.clone(),
                    converter_tracker,
                )],
                request_queue,
            )?;
            let converters = spawn_pool(
                vec![ByteStreamConverter::new(
                    crate::convert::FormatReaderKind::KvPair,
                    settings.stage("converter").default_buffer_size,
                    stream_map,
                    tagger_tracker,
                )],
                converter_queue,
            )?;
            let taggers = spawn_pool(
                vec![ChunkTagger {
                    next_chunk: HashMap::new(),
                    chunk_counts: chunk_counts.clone(),
                    downstream: sorter_tracker,
                }],
                tagger_queue,
            )?;

            let allocator = MemoryAllocator::new(self.config.memory_quota);
            let sorters = spawn_pool(
                vec![Sorter::new(
                    self.config.sort_strategy,
                    self.config.use_secondary_keys,
                    self.config.max_radix_sort_scratch_size,
                    allocator,
                    settings.stage("sorter").alignment,
                    false,
                    writer_tracker,
                )],
                sorter_queue,
            )?;
            let writers = spawn_pool(
                vec![BlockingWriter::new(self.writer_files(Phase::Three, None))],
                writer_queue,
            )?;

            for request in large_requests {
                request_tracker.send(request)?;
            }
            drop(request_tracker);

            join_pool(readers)?;
            join_pool(converters)?;
            join_pool(taggers)?;
            join_pool(sorters)?;
            join_pool(writers)?;
        }

        // Part two: merge each partition's chunks.
        let chunk_counts: HashMap<u64, u64> = chunk_counts.lock().unwrap().clone();
        let mut partitions: Vec<u64> = chunk_counts.keys().copied().collect();
        partitions.sort_unstable();
        let mut partition_offsets = HashMap::new();
        let mut total_chunks = 0u64;
        for partition in &partitions {
            partition_offsets.insert(*partition, total_chunks);
            total_chunks += chunk_counts[partition];
        }

        let chunk_requests = self.scan_job_files(|name| name.contains(".partition.chunk_"))?;
        let token_pool = Arc::new(WriteTokenPool::new(
            self.config.write_tokens_per_disk.max(1),
            total_chunks,
        ));

        let (request_tracker, request_queue) = work_queue("aio-reader", QUEUE_CAPACITY);
        let (merger_tracker, merger_queue) = work_queue("chunk-merger", QUEUE_CAPACITY);
        let (writer_tracker, writer_queue) = work_queue("writer", QUEUE_CAPACITY);

        let reader_settings = settings.stage("reader");
        let reader = spawn_multi_queue(
            AioReader::whole_file(
                reader_settings.asynchronous_io_depth,
                reader_settings.alignment,
                reader_settings.direct_io,
                settings.delete_after_read,
                Some((token_pool.clone(), partition_offsets)),
                merger_tracker,
            ),
            vec![request_queue],
            0,
        )?;
        let mergers = spawn_pool(
            vec![ChunkMerger::new(
                chunk_counts,
                Some(token_pool),
                settings.stage("merger").default_buffer_size,
                settings.stage("merger").alignment,
                writer_tracker,
            )],
            merger_queue,
        )?;
        let writers = spawn_pool(
            vec![BlockingWriter::new(self.writer_files(Phase::Three, None))],
            writer_queue,
        )?;

        for request in chunk_requests {
            request_tracker.send(request)?;
        }
        drop(request_tracker);

        join_pool(vec![reader])?;
        join_pool(mergers)?;
        join_pool(writers)?;
        log::info!("phase three complete");
        Ok(())
    }
}
