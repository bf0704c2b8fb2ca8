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

//! End-to-end scenarios for both sort variants.

use numa_cpu::runtime::memory::AlignedBuffer;
use numa_cpu::runtime::topology::ChipletLayout;
use sort_ops::{lsb, range};
use sort_ops::{DestinationParity, NodeArrays, ScratchArrays, SortConfig, SortOutput};

#[derive(Clone, Copy, PartialEq)]
enum Variant {
    Range,
    Lsb,
}

/// Per-node buffers of one test run, capacity-padded per the fudge factor.
struct TestShards {
    keys: Vec<AlignedBuffer<u64>>,
    payloads: Vec<AlignedBuffer<u64>>,
    keys_buf: Vec<AlignedBuffer<u64>>,
    payloads_buf: Vec<AlignedBuffer<u64>>,
    ranges: Vec<AlignedBuffer<u16>>,
    sizes: Vec<usize>,
    preallocated: bool,
}

impl TestShards {
    fn new(keys: &[u64], payloads: &[u64], numa: usize, fudge: f64, preallocated: bool) -> Self {
        let total = keys.len();
        let per_node = total / numa;
        let mut shards = TestShards {
            keys: Vec::new(),
            payloads: Vec::new(),
            keys_buf: Vec::new(),
            payloads_buf: Vec::new(),
            ranges: Vec::new(),
            sizes: Vec::new(),
            preallocated,
        };
        for n in 0..numa {
            let start = n * per_node;
            let size = if n + 1 == numa { total - start } else { per_node };
            let cap = (size as f64 * fudge) as usize + 8;
            let mut k = AlignedBuffer::<u64>::zeroed(cap).unwrap();
            let mut p = AlignedBuffer::<u64>::zeroed(cap).unwrap();
            k[..size].copy_from_slice(&keys[start..start + size]);
            p[..size].copy_from_slice(&payloads[start..start + size]);
            shards.keys.push(k);
            shards.payloads.push(p);
            shards.keys_buf.push(AlignedBuffer::zeroed(cap).unwrap());
            shards.payloads_buf.push(AlignedBuffer::zeroed(cap).unwrap());
            shards.ranges.push(AlignedBuffer::zeroed(cap).unwrap());
            shards.sizes.push(size);
        }
        shards
    }

    fn run(&mut self, variant: Variant, cfg: &SortConfig) -> SortOutput {
        let scratch = if self.preallocated {
            Some(ScratchArrays {
                keys_buf: self.keys_buf.iter_mut().map(|b| &mut b[..]).collect(),
                payloads_buf: self.payloads_buf.iter_mut().map(|b| &mut b[..]).collect(),
                ranges: self.ranges.iter_mut().map(|b| &mut b[..]).collect(),
            })
        } else {
            None
        };
        let mut input = NodeArrays {
            keys: self.keys.iter_mut().map(|b| &mut b[..]).collect(),
            payloads: self.payloads.iter_mut().map(|b| &mut b[..]).collect(),
            sizes: self.sizes.clone(),
            scratch,
        };
        match variant {
            Variant::Range => range::sort(&mut input, cfg).expect("range sort failed"),
            Variant::Lsb => lsb::sort(&mut input, cfg).expect("lsb sort failed"),
        }
    }

    /// The sorted keys and payloads, concatenated over nodes, picked from
    /// the buffer set named by the destination parity.
    fn result(&self, out: &SortOutput) -> (Vec<u64>, Vec<u64>) {
        let mut keys = Vec::new();
        let mut payloads = Vec::new();
        for (n, &size) in out.node_sizes.iter().enumerate() {
            match out.parity {
                DestinationParity::Primary => {
                    keys.extend_from_slice(&self.keys[n][..size]);
                    payloads.extend_from_slice(&self.payloads[n][..size]);
                }
                DestinationParity::Scratch => {
                    if self.preallocated {
                        keys.extend_from_slice(&self.keys_buf[n][..size]);
                        payloads.extend_from_slice(&self.payloads_buf[n][..size]);
                    } else {
                        let owned = out.owned_scratch.as_ref().expect("engine scratch missing");
                        keys.extend_from_slice(&owned.keys_buf[n][..size]);
                        payloads.extend_from_slice(&owned.payloads_buf[n][..size]);
                    }
                }
            }
        }
        (keys, payloads)
    }
}

fn test_config(threads: usize, numa: usize, fudge: f64) -> SortConfig {
    SortConfig {
        threads,
        numa,
        bits: 64,
        fudge,
        interleaved: false,
        chiplet: ChipletLayout::default(),
        cache_tuples: 1_500_000,
        seed: Some(0x5eed_5eed),
    }
}

fn uniform_keys(n: usize, bits: u32) -> Vec<u64> {
    let mut keys = vec![0u64; n];
    datagen::relation::UniformRelation::gen_attr_par(&mut keys, bits, 77).unwrap();
    keys
}

fn check_sorted_output(
    input_keys: &[u64],
    input_payloads: &[u64],
    out_keys: &[u64],
    out_payloads: &[u64],
) {
    assert_eq!(out_keys.len(), input_keys.len());
    assert!(
        out_keys.windows(2).all(|w| w[0] <= w[1]),
        "output keys are not sorted"
    );
    // Multiset equality through sorted copies and checksums.
    let mut expect = input_keys.to_vec();
    expect.sort_unstable();
    assert_eq!(out_keys, &expect[..]);
    let sum_in: u64 = input_payloads.iter().fold(0, |a, &x| a.wrapping_add(x));
    let sum_out: u64 = out_payloads.iter().fold(0, |a, &x| a.wrapping_add(x));
    assert_eq!(sum_in, sum_out, "payload checksum changed");
}

/// Payloads equal to keys must come out still equal, tuple by tuple.
fn check_payloads_follow(out_keys: &[u64], out_payloads: &[u64]) {
    for (&k, &p) in out_keys.iter().zip(out_payloads.iter()) {
        assert_eq!(k, p, "payload detached from its key");
    }
}

#[test]
fn sixteen_reversed_tuples_single_thread() {
    let keys: Vec<u64> = (0..16u64).rev().collect();
    let payloads = keys.clone();
    for &variant in &[Variant::Range, Variant::Lsb] {
        let cfg = test_config(1, 1, 1.1);
        let mut shards = TestShards::new(&keys, &payloads, 1, cfg.fudge, true);
        let out = shards.run(variant, &cfg);
        let (ok, op) = shards.result(&out);
        assert_eq!(ok, (0..16u64).collect::<Vec<_>>());
        assert_eq!(op, ok);
        assert_eq!(ok.iter().sum::<u64>(), 120);
    }
}

#[test]
fn uniform_keys_four_threads_single_node() {
    let keys = uniform_keys(100_000, 64);
    let payloads = keys.clone();
    for &variant in &[Variant::Range, Variant::Lsb] {
        // No preallocated scratch: the engine allocates and returns it.
        let cfg = test_config(4, 1, 1.1);
        let mut shards = TestShards::new(&keys, &payloads, 1, cfg.fudge, false);
        let out = shards.run(variant, &cfg);
        let (ok, op) = shards.result(&out);
        check_sorted_output(&keys, &payloads, &ok, &op);
        check_payloads_follow(&ok, &op);
    }
}

#[test]
fn random_payloads_survive_the_sort() {
    let keys = uniform_keys(60_000, 64);
    let mut payloads = vec![0u64; keys.len()];
    datagen::relation::UniformRelation::gen_attr_par(&mut payloads, 64, 123).unwrap();
    // Pair each key with its payload for the reference answer.
    let mut expect: Vec<(u64, u64)> = keys.iter().copied().zip(payloads.iter().copied()).collect();
    expect.sort_unstable();

    let cfg = test_config(2, 1, 1.1);
    let mut shards = TestShards::new(&keys, &payloads, 1, cfg.fudge, true);
    let out = shards.run(Variant::Range, &cfg);
    let (ok, op) = shards.result(&out);
    let mut got: Vec<(u64, u64)> = ok.into_iter().zip(op.into_iter()).collect();
    // Equal keys may order their payloads differently; normalize.
    got.sort_unstable();
    assert_eq!(got, expect);
}

#[test]
fn two_numa_nodes_concatenate_monotonically() {
    let keys = uniform_keys(200_000, 64);
    let payloads = keys.clone();
    for &variant in &[Variant::Range, Variant::Lsb] {
        let cfg = test_config(4, 2, 1.3);
        let mut shards = TestShards::new(&keys, &payloads, 2, cfg.fudge, true);
        let out = shards.run(variant, &cfg);

        // Node occupancy stays within the fudged capacity.
        for (n, &size) in out.node_sizes.iter().enumerate() {
            assert!(size <= (shards.sizes[n] as f64 * cfg.fudge) as usize);
        }
        assert_eq!(out.node_sizes.iter().sum::<usize>(), keys.len());

        let (ok, op) = shards.result(&out);
        check_sorted_output(&keys, &payloads, &ok, &op);
        check_payloads_follow(&ok, &op);
    }
}

#[test]
fn all_equal_keys_collapse_into_one_partition() {
    let keys = vec![7u64; 100_000];
    let payloads = keys.clone();
    let cfg = test_config(2, 1, 1.1);
    let mut shards = TestShards::new(&keys, &payloads, 1, cfg.fudge, true);
    let out = shards.run(Variant::Range, &cfg);
    let (ok, op) = shards.result(&out);
    assert_eq!(ok, keys);
    assert_eq!(op, payloads);
}

#[test]
fn narrow_keys_take_a_single_radix_pass() {
    // bits = 12 is one pass; an odd pass count flips the destination.
    let keys = uniform_keys(50_000, 12);
    let payloads = keys.clone();
    let cfg = SortConfig {
        bits: 12,
        ..test_config(2, 1, 1.1)
    };
    let mut shards = TestShards::new(&keys, &payloads, 1, cfg.fudge, false);
    let out = shards.run(Variant::Lsb, &cfg);
    assert_eq!(out.parity, DestinationParity::Scratch);
    assert!(out.owned_scratch.is_some());
    let (ok, op) = shards.result(&out);
    check_sorted_output(&keys, &payloads, &ok, &op);
}

#[test]
fn tiny_cache_budget_forces_two_level_partitioning() {
    // With a 10-tuple cache budget, 50k tuples need P1 = P2 = 360.
    assert_eq!(range::decide_partitions(50_000, 1, 10), (360, 360));
    let keys = uniform_keys(50_000, 64);
    let payloads = keys.clone();
    let cfg = SortConfig {
        cache_tuples: 10,
        ..test_config(2, 1, 1.1)
    };
    let mut shards = TestShards::new(&keys, &payloads, 1, cfg.fudge, true);
    let out = shards.run(Variant::Range, &cfg);
    assert_eq!(out.parity, DestinationParity::Scratch);
    let (ok, op) = shards.result(&out);
    check_sorted_output(&keys, &payloads, &ok, &op);
    check_payloads_follow(&ok, &op);
}

#[test]
fn sorting_twice_is_idempotent() {
    let keys = uniform_keys(40_000, 64);
    let payloads = keys.clone();
    let cfg = test_config(2, 1, 1.1);

    let mut first = TestShards::new(&keys, &payloads, 1, cfg.fudge, true);
    let out = first.run(Variant::Range, &cfg);
    let (sorted_keys, sorted_payloads) = first.result(&out);

    let mut second = TestShards::new(&sorted_keys, &sorted_payloads, 1, cfg.fudge, true);
    let out2 = second.run(Variant::Range, &cfg);
    let (again_keys, again_payloads) = second.result(&out2);
    assert_eq!(sorted_keys, again_keys);
    assert_eq!(sorted_payloads, again_payloads);
}

#[test]
fn presorted_input_passes_through() {
    let mut keys = uniform_keys(30_000, 64);
    keys.sort_unstable();
    let payloads = keys.clone();
    let cfg = test_config(2, 1, 1.1);
    let mut shards = TestShards::new(&keys, &payloads, 1, cfg.fudge, true);
    let out = shards.run(Variant::Lsb, &cfg);
    let (ok, _) = shards.result(&out);
    assert_eq!(ok, keys);
}

#[test]
fn partition_table_respects_cache_and_node_count() {
    // Small inputs stay single-level with the smallest fanout.
    assert_eq!(range::decide_partitions(1_000_000, 1, 1_500_000), (360, 1));
    // A billion tuples fits 1000 x 1.5M.
    assert_eq!(
        range::decide_partitions(1_000_000_000, 1, 1_500_000),
        (1000, 1)
    );
    // P1 must cover the node count even when a smaller fanout would fit.
    let (p1, _) = range::decide_partitions(1_000, 4, 1_500_000);
    assert!(p1 >= 4);
}

#[test]
fn rejects_misaligned_and_undersized_inputs() {
    let cfg = test_config(1, 2, 1.1);
    // One node array for two requested nodes.
    let mut k = AlignedBuffer::<u64>::zeroed(64).unwrap();
    let mut p = AlignedBuffer::<u64>::zeroed(64).unwrap();
    let mut input = NodeArrays {
        keys: vec![&mut k[..]],
        payloads: vec![&mut p[..]],
        sizes: vec![32],
        scratch: None,
    };
    assert!(range::sort(&mut input, &cfg).is_err());
}
