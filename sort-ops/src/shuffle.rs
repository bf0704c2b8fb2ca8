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

//! NUMA shuffle: concentrates each first-pass partition on the node that
//! sorts it.
//!
//! Every worker of a node builds the same transfer list from the published
//! histograms, permutes it with the node's shared seed (identical
//! permutation, so indices can be handed out by fetch-and-add without
//! collisions), and copies descriptors with streaming stores until the list
//! is drained. The randomized order decorrelates memory-controller
//! hotspots. A fenced global barrier ends the phase.

use crate::partition::SharedHistogram;
use crate::util::{mulhi, SlicePtr};
use numa_cpu::runtime::stream::stream_copy_u64;
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::atomic::{AtomicU64, Ordering};

/// One contiguous cross-node copy.
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    pub src_keys: *const u64,
    pub src_vals: *const u64,
    pub dst_keys: *mut u64,
    pub dst_vals: *mut u64,
    pub len: usize,
}

unsafe impl Send for Transfer {}
unsafe impl Sync for Transfer {}

/// Contiguous partition ranges assigned to each node, with their sizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCuts {
    pub part_per_numa: Vec<usize>,
    pub size_per_numa: Vec<u64>,
}

impl NodeCuts {
    pub fn partitions_before(&self, node: usize) -> usize {
        self.part_per_numa[..node].iter().sum()
    }
}

/// Greedy single-cut balance of total partition size across nodes: each cut
/// lands on the partition boundary that minimizes the residual imbalance
/// against the ideal `total / numa` split.
pub fn plan_node_cuts(part_totals: &[u64], numa: usize, total: u64) -> NodeCuts {
    let partitions = part_totals.len();
    let mut part_per_numa = vec![0usize; numa];
    let mut size_per_numa = vec![0u64; numa];

    let mut prev_p = 0usize;
    let mut prev_o = 0u64;
    let mut p = 0usize;
    let mut o = 0u64;
    for n in 0..numa - 1 {
        let goal = (total / numa as u64) * (n as u64 + 1);
        p = 0;
        o = 0;
        while p != partitions {
            if o + part_totals[p] >= goal {
                break;
            }
            o += part_totals[p];
            p += 1;
        }
        if p != partitions && part_totals[p] + o - goal < goal - o {
            o += part_totals[p];
            p += 1;
        }
        part_per_numa[n] = p - prev_p;
        size_per_numa[n] = o - prev_o;
        prev_p = p;
        prev_o = o;
    }
    part_per_numa[numa - 1] = partitions - p;
    size_per_numa[numa - 1] = total - o;

    NodeCuts {
        part_per_numa,
        size_per_numa,
    }
}

/// Builds the transfer list of one node: one descriptor per (owned
/// partition, source node). The destination concatenates, per partition,
/// the per-source contributions in source-node order. Returns the list and
/// the node's occupancy after the shuffle.
///
/// # Safety
///
/// The histogram rows must be published (barrier) and the shard pointers
/// valid for the computed ranges.
#[allow(clippy::too_many_arguments)]
pub unsafe fn build_transfers(
    hist: &SharedHistogram,
    threads_per_numa: usize,
    numa: usize,
    prev_partitions: usize,
    owned_partitions: usize,
    src_keys: &[SlicePtr<u64>],
    src_vals: &[SlicePtr<u64>],
    dst_keys: SlicePtr<u64>,
    dst_vals: SlicePtr<u64>,
) -> (Vec<Transfer>, u64) {
    // Where each source node's contribution to our first owned partition
    // starts: everything belonging to lower-numbered owners lies before it.
    let mut remote_offset = vec![0u64; numa];
    for (n, off) in remote_offset.iter_mut().enumerate() {
        let mut sum = 0u64;
        for t in 0..threads_per_numa {
            let row = hist.row(n * threads_per_numa + t);
            for p in 0..prev_partitions {
                sum += row[p];
            }
        }
        *off = sum;
    }

    let mut transfers = Vec::with_capacity(owned_partitions * numa);
    let mut local_offset = 0u64;
    for p in 0..owned_partitions {
        let gp = prev_partitions + p;
        for n in 0..numa {
            let mut remote_size = 0u64;
            for t in 0..threads_per_numa {
                remote_size += hist.row(n * threads_per_numa + t)[gp];
            }
            transfers.push(Transfer {
                src_keys: src_keys[n].ptr_at(remote_offset[n] as usize),
                src_vals: src_vals[n].ptr_at(remote_offset[n] as usize),
                dst_keys: dst_keys.ptr_at(local_offset as usize),
                dst_vals: dst_vals.ptr_at(local_offset as usize),
                len: remote_size as usize,
            });
            local_offset += remote_size;
            remote_offset[n] += remote_size;
        }
    }
    (transfers, local_offset)
}

/// Fisher-Yates permutation from a seed shared by all workers of the node:
/// the same seed yields the same order, so the fetch-and-add work loop
/// never hands out one descriptor twice.
pub fn randomize_transfers(transfers: &mut [Transfer], seed: u64) {
    let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
    let n = transfers.len() as u64;
    for p in 0..transfers.len() {
        let r = mulhi(rng.next_u64(), n - p as u64) + p as u64;
        transfers.swap(p, r as usize);
    }
}

/// Pops descriptors by fetch-and-add and copies them with streaming stores.
///
/// # Safety
///
/// Descriptors must reference valid, pairwise disjoint destination regions;
/// all workers of the node share `counter` and an identically ordered list.
pub unsafe fn run_transfers(transfers: &[Transfer], counter: &AtomicU64) {
    loop {
        let p = counter.fetch_add(1, Ordering::Relaxed) as usize;
        if p >= transfers.len() {
            break;
        }
        let t = &transfers[p];
        stream_copy_u64(t.dst_keys, t.src_keys, t.len);
        stream_copy_u64(t.dst_vals, t.src_vals, t.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cuts_balance_even_partitions() {
        let totals = vec![10u64; 8];
        let cuts = plan_node_cuts(&totals, 2, 80);
        assert_eq!(cuts.part_per_numa, vec![4, 4]);
        assert_eq!(cuts.size_per_numa, vec![40, 40]);
        assert_eq!(cuts.partitions_before(1), 4);
    }

    #[test]
    fn cuts_pick_the_smaller_imbalance() {
        // Ideal split of 90 over 2 nodes is 45; the cut after the 60-sized
        // partition overshoots by 30, before it undershoots by 15.
        let totals = vec![30u64, 60, 0, 0];
        let cuts = plan_node_cuts(&totals, 2, 90);
        assert_eq!(cuts.part_per_numa, vec![1, 3]);
        assert_eq!(cuts.size_per_numa, vec![30, 60]);
    }

    #[test]
    fn cuts_cover_all_partitions_and_sizes() {
        let totals: Vec<u64> = (0..360).map(|i| (i * 7919) as u64 % 1000).collect();
        let total: u64 = totals.iter().sum();
        for numa in [1usize, 2, 4].iter().copied() {
            let cuts = plan_node_cuts(&totals, numa, total);
            assert_eq!(cuts.part_per_numa.iter().sum::<usize>(), 360);
            assert_eq!(cuts.size_per_numa.iter().sum::<u64>(), total);
        }
    }

    #[test]
    fn same_seed_same_permutation() {
        let mk = || -> Vec<Transfer> {
            (0..17)
                .map(|i| Transfer {
                    src_keys: i as *const u64,
                    src_vals: std::ptr::null(),
                    dst_keys: std::ptr::null_mut(),
                    dst_vals: std::ptr::null_mut(),
                    len: i,
                })
                .collect()
        };
        let mut a = mk();
        let mut b = mk();
        randomize_transfers(&mut a, 99);
        randomize_transfers(&mut b, 99);
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x.len == y.len));
        let mut c = mk();
        randomize_transfers(&mut c, 100);
        // A different seed almost surely yields a different order.
        assert!(a.iter().zip(c.iter()).any(|(x, y)| x.len != y.len));
    }

    #[test]
    fn transfers_conserve_partition_bytes() {
        // Two nodes, two workers each, four first-pass partitions.
        let tpn = 2;
        let numa = 2;
        let hist = SharedHistogram::new(numa * tpn, 4);
        unsafe {
            hist.row_mut(0).copy_from_slice(&[3, 1, 0, 2]);
            hist.row_mut(1).copy_from_slice(&[1, 1, 1, 1]);
            hist.row_mut(2).copy_from_slice(&[0, 4, 2, 0]);
            hist.row_mut(3).copy_from_slice(&[2, 0, 0, 2]);
        }
        let mut src0k = vec![0u64; 8];
        let mut src0v = vec![0u64; 8];
        let mut src1k = vec![0u64; 8];
        let mut src1v = vec![0u64; 8];
        let mut dstk = vec![0u64; 16];
        let mut dstv = vec![0u64; 16];
        let src_keys = [SlicePtr::from_mut(&mut src0k), SlicePtr::from_mut(&mut src1k)];
        let src_vals = [SlicePtr::from_mut(&mut src0v), SlicePtr::from_mut(&mut src1v)];

        // Node 1 owns partitions 2 and 3.
        let (transfers, moved) = unsafe {
            build_transfers(
                &hist,
                tpn,
                numa,
                2,
                2,
                &src_keys,
                &src_vals,
                SlicePtr::from_mut(&mut dstk),
                SlicePtr::from_mut(&mut dstv),
            )
        };
        assert_eq!(transfers.len(), 4);
        // Partition 2 contributes 0+1 from node 0 and 2+0 from node 1;
        // partition 3 contributes 2+1 and 0+2.
        let lens: Vec<usize> = transfers.iter().map(|t| t.len).collect();
        assert_eq!(lens, vec![1, 2, 3, 2]);
        assert_eq!(moved, 8);
    }
}
