// Copyright 2024 The numa-sort Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Variant A: two-level range partitioning with a cache-resident comb sort.
//!
//! Pass 1 range-partitions every node's input into `P1` partitions using
//! delimiters from the sampled comparison tree. After the optional NUMA
//! shuffle, each first-level partition is claimed by one worker through a
//! fetch-and-add counter and either comb-sorted directly (`P2 == 1`) or
//! split once more by a locally sampled second-level tree, sub-partition by
//! sub-partition.
//!
//! Worker state machine:
//! `Bind -> Alloc -> Sample -> Hist1 -> Part1 -> (barrier) -> Shuffle? ->
//! Hist2/Part2/Sort per claimed partition -> Exit`.

use crate::engine::{
    self, DestinationParity, NodeArrays, PhaseTimes, ScratchPtrs, ShardState, SortConfig,
    SortOutput,
};
use crate::error::Result;
use crate::partition::buffered::{drain, partition_pass_by_tags, virtual_add};
use crate::partition::histogram::{histogram_with_ranges, DelimiterTree};
use crate::partition::{partition_offsets, PartitionBuffers, SharedHistogram};
use crate::sample::{
    draw_sample, extract_delimiters, sample_size, sample_slice, sort_sample,
};
use crate::shuffle::{build_transfers, plan_node_cuts, randomize_transfers, run_transfers};
use crate::sort::comb::{combsort_pairs, scalar_combsort_keys};
use crate::sync::BarrierSet;
use crate::util::{PaddedAtomicU64, SlicePtr};
use itertools::Itertools;
use numa_cpu::runtime::allocator::{Allocator, MemType};
use numa_cpu::runtime::cpu_affinity::bind_worker;
use numa_cpu::runtime::hw_info::HwTopology;
use numa_cpu::runtime::memory::DerefMem;
use numa_cpu::runtime::stream::stream_fill_zero_u64;
use numa_cpu::runtime::topology::ThreadSchedule;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::debug;

const SAMPLE_RATIO: f64 = 0.01;
const SAMPLE_CAP: usize = 1_000_000;

/// Picks the first- and second-level fanout so that the expected partition
/// size after the last level fits the cache budget, with `P1 >= numa`.
pub fn decide_partitions(size: u64, numa: usize, cache_tuples: u64) -> (usize, usize) {
    const FANOUT: [u64; 4] = [1, 360, 1000, 1800];
    for i in 1..=3 {
        if FANOUT[i] * cache_tuples >= size && FANOUT[i] >= numa as u64 {
            return (FANOUT[i] as usize, 1);
        }
    }
    for i in 1..=3 {
        for j in 1..=i {
            if FANOUT[i] * FANOUT[j] * cache_tuples >= size && FANOUT[i] >= numa as u64 {
                return (FANOUT[i] as usize, FANOUT[j] as usize);
            }
        }
    }
    (1800, 1800)
}

struct RangeEnv<'a> {
    cfg: &'a SortConfig,
    schedule: &'a ThreadSchedule,
    shards: &'a [ShardState],
    barriers: &'a BarrierSet,
    hist: &'a SharedHistogram,
    sample_hist: &'a SharedHistogram,
    sample: SlicePtr<u64>,
    sample_buf: SlicePtr<u64>,
    sample_total: usize,
    seeds: &'a engine::Seeds,
    numa_counters: &'a [PaddedAtomicU64],
    part_counters: &'a [PaddedAtomicU64],
    p1: usize,
    p2: usize,
    total: usize,
    preallocated: bool,
}

/// Sorts the per-node arrays globally; node `n` ends up holding a
/// contiguous sorted range and the concatenation over nodes is monotone.
/// Returns which buffer set holds the result.
pub fn sort(input: &mut NodeArrays<'_>, cfg: &SortConfig) -> Result<SortOutput> {
    engine::validate(input, cfg, true)?;
    let schedule = ThreadSchedule::new(cfg.threads, cfg.numa, cfg.chiplet, HwTopology::get())?;

    let sizes: Vec<usize> = input.sizes.clone();
    let total: usize = sizes.iter().sum();
    let preallocated = input.scratch.is_some();
    let (p1, p2) = decide_partitions(total as u64, cfg.numa, cfg.cache_tuples as u64);
    debug!(p1, p2, total, "first- and second-level fanout chosen");

    let shards = engine::build_shards(input);
    let sample_total = sample_size(total, SAMPLE_RATIO, SAMPLE_CAP);
    let mut sample_mem: DerefMem<u64> = Allocator::alloc_deref_mem(
        MemType::NumaInterleavedMem { nodes: cfg.numa },
        sample_total.max(1),
    )?;
    let mut sample_buf_mem: DerefMem<u64> = Allocator::alloc_deref_mem(
        MemType::NumaInterleavedMem { nodes: cfg.numa },
        sample_total.max(1),
    )?;

    let barriers = BarrierSet::new(cfg.threads, cfg.numa);
    let hist = SharedHistogram::new(cfg.threads, p1);
    let sample_hist = SharedHistogram::new(cfg.threads, 256);
    let seeds = engine::Seeds::new(cfg);
    let numa_counters: Vec<PaddedAtomicU64> =
        (0..cfg.numa).map(|_| PaddedAtomicU64::default()).collect();
    let part_counters: Vec<PaddedAtomicU64> =
        (0..cfg.numa).map(|_| PaddedAtomicU64::default()).collect();

    let env = RangeEnv {
        cfg,
        schedule: &schedule,
        shards: &shards,
        barriers: &barriers,
        hist: &hist,
        sample_hist: &sample_hist,
        sample: SlicePtr::from_mut(&mut sample_mem),
        sample_buf: SlicePtr::from_mut(&mut sample_buf_mem),
        sample_total,
        seeds: &seeds,
        numa_counters: &numa_counters,
        part_counters: &part_counters,
        p1,
        p2,
        total,
        preallocated,
    };

    let per_thread: Vec<Vec<u64>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..cfg.threads)
            .map(|id| {
                let env = &env;
                s.spawn(move || range_worker(env, id))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let avg = engine::average_times(&per_thread);
    let mut times = PhaseTimes::default();
    for (name, &us) in [
        "Allocation",
        "Sampling",
        "1st histogram",
        "1st partition",
        "NUMA shuffle",
        "2nd histogram",
        "2nd partition",
        "Cache sort",
    ]
    .iter()
    .zip_eq(avg.iter())
    {
        times.push(*name, us);
    }

    let node_sizes: Vec<usize> = shards
        .iter()
        .map(|s| s.size_after.load(Ordering::Relaxed) as usize)
        .collect();
    let parity = if (cfg.numa == 1) != (p2 == 1) {
        DestinationParity::Scratch
    } else {
        DestinationParity::Primary
    };
    let owned_scratch = engine::collect_owned(shards);

    Ok(SortOutput {
        parity,
        times,
        node_sizes,
        owned_scratch,
    })
}

fn range_worker(env: &RangeEnv<'_>, id: usize) -> Vec<u64> {
    let cfg = env.cfg;
    let node = env.schedule.nodes[id];
    let local_id = env.schedule.local_id(id);
    let tpn = env.schedule.threads_per_numa();
    let row = node * tpn + local_id;
    let shard = &env.shards[node];
    let lb = &env.barriers.local[node];
    let gb = &env.barriers.global;

    bind_worker(env.schedule, id);

    let mut times = vec![0u64; 8];
    let (in_off, in_size) = engine::thread_slice(shard.size, local_id, tpn, 8);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(env.seeds.thread[id]);

    // Alloc: map the node's scratch (unless preallocated) and fault its
    // pages in from the threads that will write it.
    let t = Instant::now();
    if !env.preallocated {
        if local_id == 0 {
            unsafe {
                engine::alloc_node_scratch(shard, node, cfg.numa, cfg.interleaved, true);
            }
        }
        lb.wait();
    }
    let scratch: ScratchPtrs = unsafe { shard.scratch.get().expect("scratch missing") };
    if !env.preallocated {
        unsafe {
            stream_fill_zero_u64(scratch.keys_buf.ptr_at(in_off), in_size);
            stream_fill_zero_u64(scratch.payloads_buf.ptr_at(in_off), in_size);
            std::ptr::write_bytes(scratch.ranges.ptr_at(in_off), 0, in_size);
        }
        lb.wait();
    }
    times[0] = engine::micros_since(t);

    // Sample: draw from the node-local slice, sort cooperatively, read the
    // first-level delimiters off the quantiles.
    let t = Instant::now();
    {
        let my_keys = unsafe { shard.keys.slice(in_off, in_size) };
        let (s_off, s_len) = sample_slice(env.sample_total, id, cfg.threads);
        let my_sample = unsafe { env.sample.slice_mut(s_off, s_len) };
        draw_sample(my_keys, my_sample, &mut rng);
    }
    unsafe {
        sort_sample(
            env.sample,
            env.sample_buf,
            env.sample_total,
            env.sample_hist,
            id,
            cfg.threads,
            gb,
        );
    }
    let delim_1 =
        extract_delimiters(unsafe { env.sample.slice(0, env.sample_total) }, env.p1);
    times[1] = engine::micros_since(t);

    // Hist1: tag every tuple with its first-level partition.
    let t = Instant::now();
    let tree_1 = DelimiterTree::new(&delim_1).expect("unsupported first-level fanout");
    {
        let my_keys = unsafe { shard.keys.slice(in_off, in_size) };
        let my_ranges = unsafe { scratch.ranges.slice_mut(in_off, in_size) };
        let own = unsafe { env.hist.row_mut(row) };
        histogram_with_ranges(my_keys, &tree_1, own, my_ranges);
    }
    times[2] = engine::micros_since(t);
    if id == 0 {
        debug!("first histogram done");
    }
    lb.wait();

    // Part1: stream the node's tuples into per-partition slabs of the
    // scratch buffers. The local barrier separates the buffered pass from
    // the drains so boundary lines are repaired deterministically.
    let t = Instant::now();
    let max_parts = env.p1.max(env.p2);
    let mut offsets = vec![0u64; max_parts];
    let mut bufs = PartitionBuffers::new(max_parts);
    {
        let node_rows = node * tpn..node * tpn + tpn;
        unsafe {
            partition_offsets(env.hist, node_rows, local_id, env.p1, &mut offsets[..env.p1])
        };
        let va = virtual_add(scratch.keys_buf.as_ptr(), shard.size);
        bufs.reset_with_offsets(&offsets[..env.p1], va);
        let my_keys = unsafe { shard.keys.slice(in_off, in_size) };
        let my_vals = unsafe { shard.payloads.slice(in_off, in_size) };
        let my_ranges = unsafe { scratch.ranges.slice(in_off, in_size) };
        unsafe {
            partition_pass_by_tags(
                my_keys,
                my_vals,
                my_ranges,
                &mut bufs,
                scratch.keys_buf,
                scratch.payloads_buf,
                va,
            );
        }
        lb.wait();
        let own = unsafe { env.hist.row(row) };
        unsafe { drain(&mut bufs, env.p1, own, scratch.keys_buf, scratch.payloads_buf, va) };
    }
    times[3] = engine::micros_since(t);
    if id == 0 {
        debug!("first partition done");
    }
    gb.wait();

    // Fold the global per-partition totals; every worker derives the same
    // vector from the published histograms.
    let mut part_total = vec![0u64; env.p1];
    unsafe {
        for r in 0..cfg.threads {
            let hist_row = env.hist.row(r);
            for (p, total) in part_total.iter_mut().enumerate() {
                *total += hist_row[p];
            }
        }
    }

    // Shuffle: route every first-level partition to its owning node.
    let t = Instant::now();
    let numa = cfg.numa;
    let mut prev_parts = 0usize;
    let mut numa_parts = env.p1;
    let mut my_node_size = shard.size;
    let (keys_1, vals_1, keys_2, vals_2);
    if numa > 1 {
        let cuts = plan_node_cuts(&part_total, numa, env.total as u64);
        for n in 0..numa {
            assert!(
                cuts.size_per_numa[n] <= (env.shards[n].size as f64 * cfg.fudge) as u64,
                "node {} receives {} tuples, over its fudged capacity",
                n,
                cuts.size_per_numa[n]
            );
        }
        prev_parts = cuts.partitions_before(node);
        numa_parts = cuts.part_per_numa[node];
        my_node_size = cuts.size_per_numa[node] as usize;

        let src_keys: Vec<SlicePtr<u64>> = env
            .shards
            .iter()
            .map(|s| unsafe { s.scratch.get().expect("scratch missing") }.keys_buf)
            .collect();
        let src_vals: Vec<SlicePtr<u64>> = env
            .shards
            .iter()
            .map(|s| unsafe { s.scratch.get().expect("scratch missing") }.payloads_buf)
            .collect();
        let (mut transfers, moved) = unsafe {
            build_transfers(
                env.hist,
                tpn,
                numa,
                prev_parts,
                numa_parts,
                &src_keys,
                &src_vals,
                shard.keys,
                shard.payloads,
            )
        };
        debug_assert_eq!(moved, cuts.size_per_numa[node]);
        randomize_transfers(&mut transfers, env.seeds.node[node]);
        unsafe { run_transfers(&transfers, &env.numa_counters[node].0) };
        gb.wait();

        keys_1 = shard.keys;
        vals_1 = shard.payloads;
        keys_2 = scratch.keys_buf;
        vals_2 = scratch.payloads_buf;
    } else {
        keys_1 = scratch.keys_buf;
        vals_1 = scratch.payloads_buf;
        keys_2 = shard.keys;
        vals_2 = shard.payloads;
    }
    times[4] = engine::micros_since(t);
    if local_id == 0 {
        shard.size_after.store(my_node_size as u64, Ordering::Relaxed);
    }

    // Second level: claim first-level partitions by fetch-and-add; either
    // comb-sort directly or split once more and sort the sub-partitions.
    let t = Instant::now();
    let mut h2_us = 0u64;
    let mut p2_us = 0u64;
    let part_counter = &env.part_counters[node].0;
    let mut target = part_counter.fetch_add(1, Ordering::Relaxed);
    let mut sub_sample = if env.p2 > 1 {
        vec![0u64; (env.p2 << 3) - 1]
    } else {
        Vec::new()
    };
    let mut count_2 = vec![0u64; env.p2];
    let mut cum = 0usize;
    for p in 0..numa_parts {
        let size = part_total[prev_parts + p] as usize;
        if p as u64 == target {
            if env.p2 == 1 {
                let in_k = unsafe { keys_1.slice_mut(cum, size) };
                let in_v = unsafe { vals_1.slice_mut(cum, size) };
                let out_k = unsafe { keys_2.slice_mut(cum, size) };
                let out_v = unsafe { vals_2.slice_mut(cum, size) };
                combsort_pairs(in_k, in_v, out_k, out_v);
            } else {
                // A small secondary sample picks the sub-delimiters.
                {
                    let in_k = unsafe { keys_1.slice(cum, size) };
                    draw_sample(in_k, &mut sub_sample, &mut rng);
                }
                scalar_combsort_keys(&mut sub_sample);
                let delim_2 = extract_delimiters(&sub_sample, env.p2);
                let tree_2 =
                    DelimiterTree::new(&delim_2).expect("unsupported second-level fanout");

                let ht = Instant::now();
                for c in count_2.iter_mut() {
                    *c = 0;
                }
                {
                    let in_k = unsafe { keys_1.slice(cum, size) };
                    let my_ranges = unsafe { scratch.ranges.slice_mut(cum, size) };
                    histogram_with_ranges(in_k, &tree_2, &mut count_2, my_ranges);
                }
                h2_us += engine::micros_since(ht);

                let pt = Instant::now();
                {
                    let out_k = keys_2.sub(cum, size);
                    let out_v = vals_2.sub(cum, size);
                    let va = virtual_add(out_k.as_ptr(), size);
                    bufs.reset_with_sizes(&count_2, va);
                    let in_k = unsafe { keys_1.slice(cum, size) };
                    let in_v = unsafe { vals_1.slice(cum, size) };
                    let my_ranges = unsafe { scratch.ranges.slice(cum, size) };
                    unsafe {
                        partition_pass_by_tags(
                            in_k, in_v, my_ranges, &mut bufs, out_k, out_v, va,
                        );
                        // Single writer per slab: drain immediately.
                        drain(&mut bufs, env.p2, &count_2, out_k, out_v, va);
                    }
                }
                p2_us += engine::micros_since(pt);

                let mut sub = 0usize;
                for &c in count_2.iter() {
                    let ssize = c as usize;
                    let in_k = unsafe { keys_2.slice_mut(cum + sub, ssize) };
                    let in_v = unsafe { vals_2.slice_mut(cum + sub, ssize) };
                    let out_k = unsafe { keys_1.slice_mut(cum + sub, ssize) };
                    let out_v = unsafe { vals_1.slice_mut(cum + sub, ssize) };
                    combsort_pairs(in_k, in_v, out_k, out_v);
                    sub += ssize;
                }
            }
            target = part_counter.fetch_add(1, Ordering::Relaxed);
        }
        cum += size;
    }
    let second = engine::micros_since(t);
    times[5] = h2_us;
    times[6] = p2_us;
    times[7] = second.saturating_sub(h2_us + p2_us);
    if id == 0 {
        debug!("second partition and cache sort done");
    }

    times
}
