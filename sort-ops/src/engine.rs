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

//! Engine configuration, per-node array handles, and the plumbing shared by
//! the two sort variants: entry validation, shard pointer tables, in-worker
//! scratch allocation, seeds, and phase timing.

use crate::error::{Error, Result};
use crate::util::{SharedCell, SlicePtr};
use numa_cpu::runtime::allocator::{Allocator, MemType};
use numa_cpu::runtime::memory::DerefMem;
use numa_cpu::runtime::topology::ChipletLayout;
use rand::RngCore;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

/// Which of the two same-shaped buffer sets holds the sorted result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationParity {
    /// The input arrays.
    Primary,
    /// The scratch arrays.
    Scratch,
}

impl DestinationParity {
    pub fn from_pass_count(passes: usize) -> Self {
        if passes & 1 == 0 {
            DestinationParity::Primary
        } else {
            DestinationParity::Scratch
        }
    }

    pub fn flag(self) -> u8 {
        match self {
            DestinationParity::Primary => 0,
            DestinationParity::Scratch => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SortConfig {
    pub threads: usize,
    pub numa: usize,
    /// Significant key bits; drives the pass plan of the LSB variant.
    pub bits: u32,
    /// Per-node capacity overcommit absorbing shuffle imbalance.
    pub fudge: f64,
    /// Allocate engine-owned scratch interleaved instead of node-bound.
    pub interleaved: bool,
    pub chiplet: ChipletLayout,
    /// Tuples that fit the per-core cache budget; sizes the partition fanout
    /// of the range variant.
    pub cache_tuples: usize,
    /// Fixed seed for reproducible runs; entropy-seeded when `None`.
    pub seed: Option<u64>,
}

impl Default for SortConfig {
    fn default() -> Self {
        let hw = numa_cpu::runtime::hw_info::HwTopology::get();
        SortConfig {
            threads: hw.threads,
            numa: hw.numa_nodes,
            bits: 64,
            fudge: 1.1,
            interleaved: false,
            chiplet: ChipletLayout::default(),
            cache_tuples: 1_500_000,
            seed: None,
        }
    }
}

/// Caller-provided scratch: sibling buffers of the input arrays plus the
/// per-tuple range tags. `ranges` may be empty for the LSB variant, which
/// never tags tuples.
pub struct ScratchArrays<'a> {
    pub keys_buf: Vec<&'a mut [u64]>,
    pub payloads_buf: Vec<&'a mut [u64]>,
    pub ranges: Vec<&'a mut [u16]>,
}

/// Per-NUMA-node input of a sort call. Each array is the full capacity
/// (`>= size * fudge`); `sizes` holds the logical tuple counts.
pub struct NodeArrays<'a> {
    pub keys: Vec<&'a mut [u64]>,
    pub payloads: Vec<&'a mut [u64]>,
    pub sizes: Vec<usize>,
    pub scratch: Option<ScratchArrays<'a>>,
}

/// Scratch allocated by the engine itself (the non-preallocated mode),
/// returned to the caller because a `Scratch`-parity result lives in it.
pub struct OwnedScratch {
    pub keys_buf: Vec<DerefMem<u64>>,
    pub payloads_buf: Vec<DerefMem<u64>>,
    pub ranges: Vec<DerefMem<u16>>,
}

/// Named per-phase wall-clock times in microseconds, averaged over workers.
#[derive(Debug, Default, Clone)]
pub struct PhaseTimes(pub Vec<(String, u64)>);

impl PhaseTimes {
    pub fn push(&mut self, name: impl Into<String>, us: u64) {
        self.0.push((name.into(), us));
    }

    pub fn total_us(&self) -> u64 {
        self.0.iter().map(|(_, t)| t).sum()
    }
}

pub struct SortOutput {
    pub parity: DestinationParity,
    pub times: PhaseTimes,
    /// Per-node tuple counts after the shuffle rebalanced ownership.
    pub node_sizes: Vec<usize>,
    pub owned_scratch: Option<OwnedScratch>,
}

/// Raw pointers into one node's scratch arrays.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ScratchPtrs {
    pub keys_buf: SlicePtr<u64>,
    pub payloads_buf: SlicePtr<u64>,
    pub ranges: SlicePtr<u16>,
}

pub(crate) struct OwnedNodeScratch {
    pub keys_buf: DerefMem<u64>,
    pub payloads_buf: DerefMem<u64>,
    pub ranges: Option<DerefMem<u16>>,
}

/// Shared state of one NUMA node's arrays during a sort.
pub(crate) struct ShardState {
    pub keys: SlicePtr<u64>,
    pub payloads: SlicePtr<u64>,
    pub size: usize,
    pub cap: usize,
    /// Set before spawn (preallocated) or by the node's first worker.
    pub scratch: SharedCell<Option<ScratchPtrs>>,
    pub owned: SharedCell<Option<OwnedNodeScratch>>,
    /// Node occupancy after the shuffle, written by the node's first worker.
    pub size_after: AtomicU64,
}

fn check_alignment<T>(ptr: *const T, align: usize, what: &str, node: usize) -> Result<()> {
    if ptr as usize % align != 0 {
        Err(Error::InvalidAlignment(format!(
            "{} of node {} is not {}-byte aligned",
            what, node, align
        )))
    } else {
        Ok(())
    }
}

/// Validates counts, capacities and alignment preconditions of a sort call.
pub(crate) fn validate(input: &NodeArrays, cfg: &SortConfig, need_ranges: bool) -> Result<()> {
    let numa = cfg.numa;
    if numa == 0 || cfg.threads < numa || cfg.threads % numa != 0 {
        return Err(Error::InvalidArgument(format!(
            "threads ({}) must be a positive multiple of NUMA nodes ({})",
            cfg.threads, numa
        )));
    }
    if cfg.bits == 0 || cfg.bits > 64 {
        return Err(Error::InvalidArgument(format!(
            "bits must be in 1..=64, got {}",
            cfg.bits
        )));
    }
    if cfg.fudge < 1.0 {
        return Err(Error::InvalidArgument(format!(
            "fudge must be >= 1.0, got {}",
            cfg.fudge
        )));
    }
    if input.keys.len() != numa || input.payloads.len() != numa || input.sizes.len() != numa {
        return Err(Error::InvalidArgument(format!(
            "expected {} per-node arrays, got {}/{}/{}",
            numa,
            input.keys.len(),
            input.payloads.len(),
            input.sizes.len()
        )));
    }

    for n in 0..numa {
        let cap_needed = (input.sizes[n] as f64 * cfg.fudge) as usize;
        if input.keys[n].len() < cap_needed || input.payloads[n].len() < cap_needed {
            return Err(Error::InvalidArgument(format!(
                "node {} arrays hold {} tuples, capacity {} needed (size x fudge)",
                n,
                input.keys[n].len().min(input.payloads[n].len()),
                cap_needed
            )));
        }
        check_alignment(input.keys[n].as_ptr(), 16, "keys", n)?;
        check_alignment(input.payloads[n].as_ptr(), 16, "payloads", n)?;
        // Streamed line flushes compute their alignment bias from the key
        // array; the payload array must share its cache-line phase.
        if input.keys[n].as_ptr() as usize % 64 != input.payloads[n].as_ptr() as usize % 64 {
            return Err(Error::InvalidAlignment(format!(
                "keys and payloads of node {} differ in cache-line phase",
                n
            )));
        }
    }

    if let Some(scratch) = &input.scratch {
        if scratch.keys_buf.len() != numa || scratch.payloads_buf.len() != numa {
            return Err(Error::InvalidArgument(
                "scratch arrays must cover every node".to_string(),
            ));
        }
        if need_ranges && scratch.ranges.len() != numa {
            return Err(Error::InvalidArgument(
                "range tags must cover every node".to_string(),
            ));
        }
        for n in 0..numa {
            let cap = input.keys[n].len().min(input.payloads[n].len());
            if scratch.keys_buf[n].len() < cap || scratch.payloads_buf[n].len() < cap {
                return Err(Error::InvalidArgument(format!(
                    "node {} scratch smaller than its capacity {}",
                    n, cap
                )));
            }
            check_alignment(scratch.keys_buf[n].as_ptr(), 64, "scratch keys", n)?;
            check_alignment(scratch.payloads_buf[n].as_ptr(), 64, "scratch payloads", n)?;
            if need_ranges {
                if scratch.ranges[n].len() < cap {
                    return Err(Error::InvalidArgument(format!(
                        "node {} range tags smaller than its capacity {}",
                        n, cap
                    )));
                }
                check_alignment(scratch.ranges[n].as_ptr(), 8, "range tags", n)?;
            }
        }
    }
    Ok(())
}

/// Builds the shared shard table from the caller's borrows.
pub(crate) fn build_shards(input: &mut NodeArrays<'_>) -> Vec<ShardState> {
    let numa = input.keys.len();
    let mut scratch_ptrs: Vec<Option<ScratchPtrs>> = match input.scratch.as_mut() {
        Some(s) => (0..numa)
            .map(|n| {
                Some(ScratchPtrs {
                    keys_buf: SlicePtr::from_mut(&mut s.keys_buf[n][..]),
                    payloads_buf: SlicePtr::from_mut(&mut s.payloads_buf[n][..]),
                    ranges: match s.ranges.get_mut(n) {
                        Some(r) => SlicePtr::from_mut(&mut r[..]),
                        None => SlicePtr::dangling(),
                    },
                })
            })
            .collect(),
        None => (0..numa).map(|_| None).collect(),
    };

    (0..numa)
        .map(|n| {
            let cap = input.keys[n].len().min(input.payloads[n].len());
            ShardState {
                keys: SlicePtr::from_mut(&mut input.keys[n][..]),
                payloads: SlicePtr::from_mut(&mut input.payloads[n][..]),
                size: input.sizes[n],
                cap,
                scratch: SharedCell::new(scratch_ptrs[n].take()),
                owned: SharedCell::new(None),
                size_after: AtomicU64::new(input.sizes[n] as u64),
            }
        })
        .collect()
}

/// Allocates one node's scratch in-engine. Called by the node's first
/// worker when no scratch was passed in; allocation failure is fatal.
///
/// # Safety
///
/// Must be called by exactly one worker per node, before the local barrier
/// that publishes the pointers.
pub(crate) unsafe fn alloc_node_scratch(
    shard: &ShardState,
    node: usize,
    numa: usize,
    interleaved: bool,
    need_ranges: bool,
) {
    let mem_type = if interleaved {
        MemType::NumaInterleavedMem { nodes: numa }
    } else {
        MemType::NumaMem { node: node as u16 }
    };
    let mut keys_buf: DerefMem<u64> = Allocator::alloc_deref_mem(mem_type, shard.cap)
        .expect("scratch key allocation failed");
    let mut payloads_buf: DerefMem<u64> = Allocator::alloc_deref_mem(mem_type, shard.cap)
        .expect("scratch payload allocation failed");
    let mut ranges: Option<DerefMem<u16>> = if need_ranges {
        Some(
            Allocator::alloc_deref_mem(mem_type, shard.cap)
                .expect("range tag allocation failed"),
        )
    } else {
        None
    };

    *shard.scratch.get_mut() = Some(ScratchPtrs {
        keys_buf: SlicePtr::from_mut(&mut keys_buf),
        payloads_buf: SlicePtr::from_mut(&mut payloads_buf),
        ranges: ranges
            .as_mut()
            .map(|r| SlicePtr::from_mut(r))
            .unwrap_or_else(SlicePtr::dangling),
    });
    *shard.owned.get_mut() = Some(OwnedNodeScratch {
        keys_buf,
        payloads_buf,
        ranges,
    });
}

/// Moves engine-allocated scratch out of the shard table after the workers
/// joined. `None` when the caller preallocated.
pub(crate) fn collect_owned(shards: Vec<ShardState>) -> Option<OwnedScratch> {
    let mut keys_buf = Vec::new();
    let mut payloads_buf = Vec::new();
    let mut ranges = Vec::new();
    let mut any = false;
    for shard in shards {
        if let Some(owned) = shard.owned.into_inner() {
            any = true;
            keys_buf.push(owned.keys_buf);
            payloads_buf.push(owned.payloads_buf);
            if let Some(r) = owned.ranges {
                ranges.push(r);
            }
        }
    }
    if any {
        Some(OwnedScratch {
            keys_buf,
            payloads_buf,
            ranges,
        })
    } else {
        None
    }
}

/// Deterministic per-thread and per-node seed streams.
pub(crate) struct Seeds {
    pub thread: Vec<u64>,
    pub node: Vec<u64>,
}

impl Seeds {
    pub fn new(cfg: &SortConfig) -> Seeds {
        let master = cfg.seed.unwrap_or_else(rand::random);
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(master);
        Seeds {
            thread: (0..cfg.threads).map(|_| rng.next_u64()).collect(),
            node: (0..cfg.numa).map(|_| rng.next_u64()).collect(),
        }
    }
}

/// Static split of `total` tuples over a node's workers; the slice start is
/// rounded down to `align` tuples and the last worker absorbs the rest.
pub(crate) fn thread_slice(
    total: usize,
    local_id: usize,
    threads_per_numa: usize,
    align: usize,
) -> (usize, usize) {
    let per_thread = (total / threads_per_numa) & !(align - 1);
    let offset = per_thread * local_id;
    let size = if local_id + 1 == threads_per_numa {
        total - offset
    } else {
        per_thread
    };
    (offset, size)
}

pub(crate) fn micros_since(start: Instant) -> u64 {
    start.elapsed().as_micros() as u64
}

/// Averages the per-thread phase times collected from the join handles.
pub(crate) fn average_times(per_thread: &[Vec<u64>]) -> Vec<u64> {
    let threads = per_thread.len() as u64;
    let phases = per_thread.first().map(|t| t.len()).unwrap_or(0);
    (0..phases)
        .map(|p| per_thread.iter().map(|t| t[p]).sum::<u64>() / threads)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_slices_cover_the_input() {
        let total = 100_003;
        let tpn = 4;
        let mut covered = 0;
        for local in 0..tpn {
            let (off, len) = thread_slice(total, local, tpn, 8);
            assert_eq!(off, covered);
            if local + 1 != tpn {
                assert_eq!(len % 8, 0);
            }
            covered += len;
        }
        assert_eq!(covered, total);
    }

    #[test]
    fn parity_follows_pass_count() {
        assert_eq!(
            DestinationParity::from_pass_count(2),
            DestinationParity::Primary
        );
        assert_eq!(
            DestinationParity::from_pass_count(7),
            DestinationParity::Scratch
        );
        assert_eq!(DestinationParity::Scratch.flag(), 1);
    }

    #[test]
    fn validation_rejects_undersized_capacity() {
        let cfg = SortConfig {
            threads: 1,
            numa: 1,
            seed: Some(1),
            ..SortConfig::default()
        };
        let mut keys = vec![0u64; 100];
        let mut payloads = vec![0u64; 100];
        let input = NodeArrays {
            keys: vec![&mut keys],
            payloads: vec![&mut payloads],
            sizes: vec![100],
            scratch: None,
        };
        // 100 * 1.1 = 110 > 100.
        assert!(validate(&input, &cfg, false).is_err());
    }
}
