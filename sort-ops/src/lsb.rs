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

//! Variant B: multi-pass LSB radix sort.
//!
//! The first pass partitions by the lowest bit window and, on multi-node
//! runs, a range-derived NUMA tag in the high partition bits; the shuffle
//! then concentrates each node's tag on that node and all later passes are
//! node-local. The sort is stable within each pass, which is what makes the
//! LSB schedule correct.

use crate::engine::{
    self, DestinationParity, NodeArrays, PhaseTimes, ScratchPtrs, ShardState, SortConfig,
    SortOutput,
};
use crate::error::{Error, Result};
use crate::partition::buffered::{drain, partition_pass_by_key, virtual_add};
use crate::partition::histogram::{
    histogram, Classifier, NumaSplit, RadixClassifier, RadixNumaClassifier,
};
use crate::partition::{partition_offsets, PartitionBuffers, SharedHistogram};
use crate::sample::{draw_sample, extract_delimiters, sample_size, sample_slice, sort_sample};
use crate::shuffle::{build_transfers, randomize_transfers, run_transfers};
use crate::sync::BarrierSet;
use crate::util::{ceil_div, ceil_log2, PaddedAtomicU64, SlicePtr};
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

const SAMPLE_RATIO: f64 = 0.001;
const SAMPLE_CAP: usize = 100_000;

/// Splits `bits` significant key bits plus the NUMA tag over radix passes so
/// no pass exceeds a 16-bit fanout. The first pass carries the tag; on
/// multi-node runs the last pass absorbs one extra balancing bit.
pub fn distribute_bits(bits: u32, numa: usize) -> Vec<u32> {
    let numa_bits = ceil_log2(numa);
    let end_bits = if numa_bits > 0 { 1u32 } else { 0 };
    let total_bits = bits + numa_bits;
    const LIMIT: [u32; 6] = [12, 23, 34, 45, 56, 67];
    let mut passes = 0;
    while LIMIT[passes] < total_bits {
        passes += 1;
    }
    passes += 1;

    let mut plan = vec![0u32; passes];
    plan[0] = ceil_div((total_bits - end_bits) as usize, passes) as u32 - numa_bits;
    let mut rem = bits - plan[0];
    for p in 1..passes {
        plan[p] = ceil_div((rem - end_bits) as usize, passes - p) as u32;
        rem -= plan[p];
    }
    plan[passes - 1] += end_bits;
    debug_assert_eq!(rem, end_bits);
    debug_assert_eq!(plan.iter().sum::<u32>() + numa_bits, bits + numa_bits);
    plan
}

/// First-pass classifier: plain radix on one node, tag-extended on many.
enum FirstPass {
    Radix(RadixClassifier),
    Tagged(RadixNumaClassifier),
}

impl Classifier for FirstPass {
    #[inline]
    fn partitions(&self) -> usize {
        match self {
            FirstPass::Radix(c) => c.partitions(),
            FirstPass::Tagged(c) => c.partitions(),
        }
    }

    #[inline]
    fn classify(&self, key: u64) -> usize {
        match self {
            FirstPass::Radix(c) => c.classify(key),
            FirstPass::Tagged(c) => c.classify(key),
        }
    }
}

struct LsbEnv<'a> {
    cfg: &'a SortConfig,
    schedule: &'a ThreadSchedule,
    shards: &'a [ShardState],
    barriers: &'a BarrierSet,
    hist: &'a SharedHistogram,
    tag_hist: &'a SharedHistogram,
    sample_hist: &'a SharedHistogram,
    sample: SlicePtr<u64>,
    sample_buf: SlicePtr<u64>,
    sample_total: usize,
    seeds: &'a engine::Seeds,
    numa_counters: &'a [PaddedAtomicU64],
    plan: &'a [u32],
    numa_fanout: usize,
    preallocated: bool,
}

/// Sorts the per-node arrays by `cfg.bits` significant key bits. See the
/// module documentation for the pass structure.
pub fn sort(input: &mut NodeArrays<'_>, cfg: &SortConfig) -> Result<SortOutput> {
    engine::validate(input, cfg, false)?;
    if cfg.numa > 8 {
        return Err(Error::InvalidArgument(format!(
            "the LSB variant supports at most 8 NUMA nodes, got {}",
            cfg.numa
        )));
    }
    let schedule = ThreadSchedule::new(cfg.threads, cfg.numa, cfg.chiplet, HwTopology::get())?;

    let total: usize = input.sizes.iter().sum();
    let preallocated = input.scratch.is_some();
    let plan = distribute_bits(cfg.bits, cfg.numa);
    debug!(?plan, "radix pass plan");

    let numa_fanout = if cfg.numa > 1 {
        cfg.numa.next_power_of_two()
    } else {
        1
    };
    let max_partitions = plan
        .iter()
        .enumerate()
        .map(|(i, &b)| if i == 0 { numa_fanout << b } else { 1 << b })
        .max()
        .unwrap();

    let shards = engine::build_shards(input);
    let sample_total = if cfg.numa > 1 {
        sample_size(total, SAMPLE_RATIO, SAMPLE_CAP)
    } else {
        0
    };
    let mut sample_mem: DerefMem<u64> = Allocator::alloc_deref_mem(
        MemType::NumaInterleavedMem { nodes: cfg.numa },
        sample_total.max(1),
    )?;
    let mut sample_buf_mem: DerefMem<u64> = Allocator::alloc_deref_mem(
        MemType::NumaInterleavedMem { nodes: cfg.numa },
        sample_total.max(1),
    )?;

    let barriers = BarrierSet::new(cfg.threads, cfg.numa);
    let hist = SharedHistogram::new(cfg.threads, max_partitions);
    let tag_hist = SharedHistogram::new(cfg.threads, numa_fanout);
    let sample_hist = SharedHistogram::new(cfg.threads, 256);
    let seeds = engine::Seeds::new(cfg);
    let numa_counters: Vec<PaddedAtomicU64> =
        (0..cfg.numa).map(|_| PaddedAtomicU64::default()).collect();

    let env = LsbEnv {
        cfg,
        schedule: &schedule,
        shards: &shards,
        barriers: &barriers,
        hist: &hist,
        tag_hist: &tag_hist,
        sample_hist: &sample_hist,
        sample: SlicePtr::from_mut(&mut sample_mem),
        sample_buf: SlicePtr::from_mut(&mut sample_buf_mem),
        sample_total,
        seeds: &seeds,
        numa_counters: &numa_counters,
        plan: &plan,
        numa_fanout,
        preallocated,
    };

    let per_thread: Vec<Vec<u64>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..cfg.threads)
            .map(|id| {
                let env = &env;
                s.spawn(move || lsb_worker(env, id))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let avg = engine::average_times(&per_thread);
    // Worker layout: [alloc, sample, shuffle, hist/part per pass].
    let mut times = PhaseTimes::default();
    times.push("Allocation", avg[0]);
    times.push("Sampling", avg[1]);
    times.push("Pass 1 histogram", avg[3]);
    times.push("Pass 1 partition", avg[4]);
    times.push("NUMA shuffle", avg[2]);
    for p in 1..plan.len() {
        times.push(format!("Pass {} histogram", p + 1), avg[3 + 2 * p]);
        times.push(format!("Pass {} partition", p + 1), avg[4 + 2 * p]);
    }

    let node_sizes: Vec<usize> = shards
        .iter()
        .map(|s| s.size_after.load(Ordering::Relaxed) as usize)
        .collect();
    let moves = plan.len() + if cfg.numa > 1 { 1 } else { 0 };
    let parity = DestinationParity::from_pass_count(moves);
    let owned_scratch = engine::collect_owned(shards);

    Ok(SortOutput {
        parity,
        times,
        node_sizes,
        owned_scratch,
    })
}

fn lsb_worker(env: &LsbEnv<'_>, id: usize) -> Vec<u64> {
    let cfg = env.cfg;
    let numa = cfg.numa;
    let node = env.schedule.nodes[id];
    let local_id = env.schedule.local_id(id);
    let tpn = env.schedule.threads_per_numa();
    let row = node * tpn + local_id;
    let shard = &env.shards[node];
    let lb = &env.barriers.local[node];
    let gb = &env.barriers.global;

    bind_worker(env.schedule, id);

    let passes = env.plan.len();
    let mut times = vec![0u64; 3 + 2 * passes];
    let (in_off, in_size) = engine::thread_slice(shard.size, local_id, tpn, 1);
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(env.seeds.thread[id]);

    // Alloc.
    let t = Instant::now();
    if !env.preallocated {
        if local_id == 0 {
            unsafe {
                engine::alloc_node_scratch(shard, node, numa, cfg.interleaved, false);
            }
        }
        lb.wait();
    }
    let scratch: ScratchPtrs = unsafe { shard.scratch.get().expect("scratch missing") };
    if !env.preallocated {
        unsafe {
            stream_fill_zero_u64(scratch.keys_buf.ptr_at(in_off), in_size);
            stream_fill_zero_u64(scratch.payloads_buf.ptr_at(in_off), in_size);
        }
        lb.wait();
    }
    times[0] = engine::micros_since(t);

    // Sampling: only multi-node runs need the NUMA range split.
    let t = Instant::now();
    let split = if numa > 1 {
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
        let delims =
            extract_delimiters(unsafe { env.sample.slice(0, env.sample_total) }, numa);
        Some(NumaSplit::new(&delims, numa))
    } else {
        None
    };
    times[1] = engine::micros_since(t);

    // Pass 1: radix window plus NUMA tag.
    let radix_bits_0 = env.plan[0];
    let partitions_0 = env.numa_fanout << radix_bits_0;
    let first_pass = match split {
        Some(split) => FirstPass::Tagged(RadixNumaClassifier::new(radix_bits_0, split)),
        None => FirstPass::Radix(RadixClassifier::new(0, radix_bits_0)),
    };

    let t = Instant::now();
    {
        let my_keys = unsafe { shard.keys.slice(in_off, in_size) };
        let own = unsafe { env.hist.row_mut(row) };
        for c in own[..partitions_0].iter_mut() {
            *c = 0;
        }
        histogram(my_keys, &first_pass, &mut own[..partitions_0]);
        if numa > 1 {
            let tags = unsafe { env.tag_hist.row_mut(row) };
            for c in tags.iter_mut() {
                *c = 0;
            }
            for (p, &c) in own[..partitions_0].iter().enumerate() {
                tags[p >> radix_bits_0] += c;
            }
        }
    }
    times[3] = engine::micros_since(t);
    lb.wait();

    let t = Instant::now();
    let mut offsets = vec![0u64; env.hist.partitions()];
    let mut bufs = PartitionBuffers::new(env.hist.partitions());
    {
        let node_rows = node * tpn..node * tpn + tpn;
        unsafe {
            partition_offsets(
                env.hist,
                node_rows,
                local_id,
                partitions_0,
                &mut offsets[..partitions_0],
            )
        };
        let va = virtual_add(scratch.keys_buf.as_ptr(), shard.size);
        bufs.reset_with_offsets(&offsets[..partitions_0], va);
        let my_keys = unsafe { shard.keys.slice(in_off, in_size) };
        let my_vals = unsafe { shard.payloads.slice(in_off, in_size) };
        unsafe {
            partition_pass_by_key(
                my_keys,
                my_vals,
                &first_pass,
                &mut bufs,
                scratch.keys_buf,
                scratch.payloads_buf,
                va,
            );
        }
        lb.wait();
        let own = unsafe { env.hist.row(row) };
        unsafe {
            drain(
                &mut bufs,
                partitions_0,
                &own[..partitions_0],
                scratch.keys_buf,
                scratch.payloads_buf,
                va,
            )
        };
    }
    times[4] = engine::micros_since(t);
    if id == 0 {
        debug!("first radix pass done");
    }
    gb.wait();

    // Shuffle: every partition tagged for this node moves here.
    let t = Instant::now();
    let mut my_node_size = shard.size;
    let (mut keys_a, mut vals_a, mut keys_b, mut vals_b);
    if numa > 1 {
        // Tag totals give the post-shuffle occupancy; the fudged capacity
        // must hold it.
        my_node_size = 0;
        unsafe {
            for src in 0..numa {
                for tr in 0..tpn {
                    my_node_size += env.tag_hist.row(src * tpn + tr)[node] as usize;
                }
            }
        }
        assert!(
            my_node_size <= (shard.size as f64 * cfg.fudge) as usize,
            "node {} receives {} tuples, over its fudged capacity",
            node,
            my_node_size
        );

        let prev_parts = node << radix_bits_0;
        let owned_parts = 1usize << radix_bits_0;
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
                owned_parts,
                &src_keys,
                &src_vals,
                shard.keys,
                shard.payloads,
            )
        };
        debug_assert_eq!(moved as usize, my_node_size);
        randomize_transfers(&mut transfers, env.seeds.node[node]);
        unsafe { run_transfers(&transfers, &env.numa_counters[node].0) };
        gb.wait();

        keys_a = shard.keys;
        vals_a = shard.payloads;
        keys_b = scratch.keys_buf;
        vals_b = scratch.payloads_buf;
    } else {
        keys_a = scratch.keys_buf;
        vals_a = scratch.payloads_buf;
        keys_b = shard.keys;
        vals_b = shard.payloads;
    }
    times[2] = engine::micros_since(t);
    if local_id == 0 {
        shard
            .size_after
            .store(my_node_size as u64, Ordering::Relaxed);
    }

    // Node-local passes over the remaining bit windows.
    let (l_off, l_size) = engine::thread_slice(my_node_size, local_id, tpn, 4);
    let mut shift = 0u32;
    for pass in 1..passes {
        shift += env.plan[pass - 1];
        let radix_bits = env.plan[pass];
        let partitions = 1usize << radix_bits;
        let cls = RadixClassifier::new(shift, radix_bits);

        let t = Instant::now();
        {
            let my_keys = unsafe { keys_a.slice(l_off, l_size) };
            let own = unsafe { env.hist.row_mut(row) };
            for c in own[..partitions].iter_mut() {
                *c = 0;
            }
            histogram(my_keys, &cls, &mut own[..partitions]);
        }
        times[3 + 2 * pass] = engine::micros_since(t);
        lb.wait();

        let t = Instant::now();
        {
            let node_rows = node * tpn..node * tpn + tpn;
            unsafe {
                partition_offsets(
                    env.hist,
                    node_rows,
                    local_id,
                    partitions,
                    &mut offsets[..partitions],
                )
            };
            let va = virtual_add(keys_b.as_ptr(), my_node_size);
            bufs.reset_with_offsets(&offsets[..partitions], va);
            let my_keys = unsafe { keys_a.slice(l_off, l_size) };
            let my_vals = unsafe { vals_a.slice(l_off, l_size) };
            unsafe {
                partition_pass_by_key(my_keys, my_vals, &cls, &mut bufs, keys_b, vals_b, va);
            }
            lb.wait();
            let own = unsafe { env.hist.row(row) };
            unsafe { drain(&mut bufs, partitions, &own[..partitions], keys_b, vals_b, va) };
        }
        times[4 + 2 * pass] = engine::micros_since(t);
        lb.wait();

        std::mem::swap(&mut keys_a, &mut keys_b);
        std::mem::swap(&mut vals_a, &mut vals_b);
    }
    if id == 0 {
        debug!("all radix passes done");
    }

    times
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_plan(bits: u32, numa: usize) {
        let plan = distribute_bits(bits, numa);
        let numa_bits = ceil_log2(numa);
        // The pass schedule covers every significant bit plus the NUMA tag.
        assert_eq!(plan.iter().sum::<u32>() + numa_bits, bits + numa_bits);
        assert_eq!(plan.iter().sum::<u32>(), bits);
        assert!(plan.iter().all(|&b| b >= 1 && b <= 16));
        // First-pass fanout including the tag stays within 16 bits.
        assert!(plan[0] + numa_bits <= 16);
    }

    #[test]
    fn bit_plans_cover_all_widths_and_node_counts() {
        for bits in 1..=64 {
            for &numa in &[1usize, 2, 3, 4, 8] {
                check_plan(bits, numa);
            }
        }
    }

    #[test]
    fn sixty_four_bits_two_nodes_needs_sixty_five() {
        let plan = distribute_bits(64, 2);
        assert_eq!(plan.len(), 6);
        assert_eq!(plan.iter().sum::<u32>() + 1, 65);
    }

    #[test]
    fn single_pass_for_narrow_keys() {
        assert_eq!(distribute_bits(12, 1), vec![12]);
        assert_eq!(distribute_bits(1, 1), vec![1]);
    }
}
