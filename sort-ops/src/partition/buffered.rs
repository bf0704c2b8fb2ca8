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

//! Software-managed buffered partitioning.
//!
//! Tuples are appended to a per-partition staging line and flushed to the
//! output one full cache-line pair at a time with non-temporal stores, so
//! the pass reads the input once and writes the output once without
//! read-for-ownership traffic.
//!
//! # Alignment bias
//!
//! The first line of an output region may be unaligned. Cursors therefore
//! run in *virtual* coordinates, shifted by `virtual_add = 8 - to_align`
//! where `to_align` is the number of tuples up to the first 64-byte boundary
//! of the output: every full virtual line then maps to an aligned real line.
//! The under-filled leading line (virtual line 0) is written with scalar
//! streaming stores, as is the per-partition tail during [`drain`].
//!
//! # Concurrency
//!
//! Workers partition disjoint input slices into disjoint output slabs.
//! Boundary output lines shared by two slabs are written twice: a full-line
//! flush from one side may cover slots owned by the other, whose correct
//! values are still staged and reach memory in the scalar drain. A barrier
//! must therefore separate the pass from [`drain`] whenever a pass has more
//! than one writer; the single-writer second-level pass drains immediately.

use crate::partition::histogram::Classifier;
use crate::partition::{PartitionBuffers, ScratchLine, TUPLES_PER_LINE};
use crate::util::SlicePtr;
use numa_cpu::runtime::stream::{stream_line_u64, stream_u64};

const LINE_MASK: u64 = TUPLES_PER_LINE as u64 - 1;

/// Virtual-coordinate bias for an output array of `total` tuples starting at
/// `out`. Zero when the output is already aligned or too small to ever flush
/// a full line.
pub fn virtual_add(out: *const u64, total: usize) -> u64 {
    let misaligned_bytes = out as usize & 63;
    let to_align = ((64 - misaligned_bytes) & 63) as u64 / 8;
    if to_align != 0 && (to_align as usize) < total {
        TUPLES_PER_LINE as u64 - to_align
    } else {
        0
    }
}

/// Appends one tuple to its partition's staging line, flushing the line
/// when it completes. Shared by the tag-driven and classifier-driven passes.
#[inline(always)]
unsafe fn push_tuple(
    p: usize,
    key: u64,
    val: u64,
    lines: &mut [ScratchLine],
    cursors: &mut [u64],
    starts: &[u64],
    out_keys: SlicePtr<u64>,
    out_vals: SlicePtr<u64>,
    va: u64,
) {
    let cur = cursors[p];
    cursors[p] = cur + 1;
    let slot = (cur & LINE_MASK) as usize;
    let line = &mut lines[p];
    line.keys[slot] = key;
    line.vals[slot] = val;
    if slot == TUPLES_PER_LINE - 1 {
        let line_start = cur - LINE_MASK;
        if va != 0 && line_start == 0 {
            // Virtual line 0 backs fewer than eight real slots; stream only
            // the slots this partition owns, scalar.
            let first = starts[p] as usize;
            for s in first..TUPLES_PER_LINE {
                let real = s - va as usize;
                stream_u64(out_keys.ptr_at(real), line.keys[s]);
                stream_u64(out_vals.ptr_at(real), line.vals[s]);
            }
        } else {
            let real = (line_start - va) as usize;
            stream_line_u64(out_keys.ptr_at(real), &line.keys);
            stream_line_u64(out_vals.ptr_at(real), &line.vals);
        }
    }
}

/// Partition pass driven by precomputed per-tuple tags (range mode).
///
/// # Safety
///
/// Output slabs referenced by the cursors in `bufs` must be in bounds of
/// `out_keys`/`out_vals` and disjoint from every concurrent writer's slabs.
pub unsafe fn partition_pass_by_tags(
    keys: &[u64],
    vals: &[u64],
    tags: &[u16],
    bufs: &mut PartitionBuffers,
    out_keys: SlicePtr<u64>,
    out_vals: SlicePtr<u64>,
    va: u64,
) {
    debug_assert_eq!(keys.len(), vals.len());
    debug_assert_eq!(keys.len(), tags.len());
    debug_assert_eq!(out_keys.as_ptr() as usize & 63, out_vals.as_ptr() as usize & 63);

    let (lines, cursors, starts) = bufs.parts();
    let quads = keys.len() & !3;
    let mut i = 0;
    while i != quads {
        for j in i..i + 4 {
            push_tuple(
                tags[j] as usize,
                keys[j],
                vals[j],
                lines,
                cursors,
                starts,
                out_keys,
                out_vals,
                va,
            );
        }
        i += 4;
    }
    while i != keys.len() {
        push_tuple(
            tags[i] as usize,
            keys[i],
            vals[i],
            lines,
            cursors,
            starts,
            out_keys,
            out_vals,
            va,
        );
        i += 1;
    }
}

/// Partition pass that classifies each key on the fly (radix modes).
///
/// # Safety
///
/// Same contract as [`partition_pass_by_tags`].
pub unsafe fn partition_pass_by_key<C: Classifier>(
    keys: &[u64],
    vals: &[u64],
    cls: &C,
    bufs: &mut PartitionBuffers,
    out_keys: SlicePtr<u64>,
    out_vals: SlicePtr<u64>,
    va: u64,
) {
    debug_assert_eq!(keys.len(), vals.len());
    debug_assert_eq!(out_keys.as_ptr() as usize & 63, out_vals.as_ptr() as usize & 63);

    let (lines, cursors, starts) = bufs.parts();
    let quads = keys.len() & !3;
    let mut i = 0;
    while i != quads {
        for j in i..i + 4 {
            push_tuple(
                cls.classify(keys[j]),
                keys[j],
                vals[j],
                lines,
                cursors,
                starts,
                out_keys,
                out_vals,
                va,
            );
        }
        i += 4;
    }
    while i != keys.len() {
        push_tuple(
            cls.classify(keys[i]),
            keys[i],
            vals[i],
            lines,
            cursors,
            starts,
            out_keys,
            out_vals,
            va,
        );
        i += 1;
    }
}

/// Streams the up-to-seven staged tuples of every partition to the output.
///
/// `sizes[p]` is the caller's tuple count for partition `p`; it clamps the
/// staged slots so positions below the partition's slab (never written by
/// this caller) are skipped. Zero-size partitions write nothing.
///
/// # Safety
///
/// Same slab contract as the pass functions. With multiple writers a
/// barrier must separate all passes from all drains.
pub unsafe fn drain(
    bufs: &mut PartitionBuffers,
    partitions: usize,
    sizes: &[u64],
    out_keys: SlicePtr<u64>,
    out_vals: SlicePtr<u64>,
    va: u64,
) {
    let (lines, cursors, starts) = bufs.parts();
    for p in 0..partitions {
        let cur = cursors[p];
        let remain = cur & LINE_MASK;
        let skip = remain.saturating_sub(sizes[p]);
        let line = &lines[p];
        for off in skip..remain {
            let virt = cur - remain + off;
            let real = (virt - va) as usize;
            let slot = (virt & LINE_MASK) as usize;
            stream_u64(out_keys.ptr_at(real), line.keys[slot]);
            stream_u64(out_vals.ptr_at(real), line.vals[slot]);
        }
        debug_assert_eq!(cur, starts[p] + sizes[p], "partition {} cursor mismatch", p);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::histogram::{histogram, RadixClassifier};
    use crate::partition::SharedHistogram;
    use numa_cpu::runtime::memory::AlignedBuffer;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;
    use std::collections::HashMap;

    fn partition_once(
        keys: &[u64],
        vals: &[u64],
        bits: u32,
        out_offset: usize,
    ) -> (Vec<u64>, Vec<u64>, Vec<u64>) {
        let cls = RadixClassifier::new(0, bits);
        let parts = 1usize << bits;
        let mut count = vec![0u64; parts];
        histogram(keys, &cls, &mut count);

        let mut out_keys = AlignedBuffer::<u64>::zeroed(keys.len() + out_offset).unwrap();
        let mut out_vals = AlignedBuffer::<u64>::zeroed(keys.len() + out_offset).unwrap();
        let ok = SlicePtr::from_mut(&mut out_keys[out_offset..]);
        let ov = SlicePtr::from_mut(&mut out_vals[out_offset..]);

        let va = virtual_add(ok.as_ptr(), keys.len());
        let mut bufs = PartitionBuffers::new(parts);
        bufs.reset_with_sizes(&count, va);
        unsafe {
            partition_pass_by_key(keys, vals, &cls, &mut bufs, ok, ov, va);
            drain(&mut bufs, parts, &count, ok, ov, va);
        }
        numa_cpu::runtime::stream::store_fence();
        (
            out_keys[out_offset..].to_vec(),
            out_vals[out_offset..].to_vec(),
            count,
        )
    }

    fn check_partitioned(
        keys: &[u64],
        vals: &[u64],
        out_keys: &[u64],
        out_vals: &[u64],
        count: &[u64],
        bits: u32,
    ) {
        // No tuple lost, none duplicated, payloads still attached.
        let mut expect: HashMap<(u64, u64), usize> = HashMap::new();
        for (&k, &v) in keys.iter().zip(vals.iter()) {
            *expect.entry((k, v)).or_insert(0) += 1;
        }
        for (&k, &v) in out_keys.iter().zip(out_vals.iter()) {
            let slot = expect.get_mut(&(k, v)).expect("unknown tuple in output");
            assert!(*slot > 0, "duplicated tuple in output");
            *slot -= 1;
        }
        assert!(expect.values().all(|&c| c == 0), "tuple lost");

        // Every tuple sits in its partition's slab.
        let mask = (1u64 << bits) - 1;
        let mut base = 0usize;
        for (p, &c) in count.iter().enumerate() {
            for &k in &out_keys[base..base + c as usize] {
                assert_eq!((k & mask) as usize, p);
            }
            base += c as usize;
        }
        assert_eq!(base, keys.len());
    }

    #[test]
    fn partitions_aligned_output() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(1);
        let keys: Vec<u64> = (0..100_003).map(|_| rng.gen()).collect();
        let vals: Vec<u64> = keys.iter().map(|&k| !k).collect();
        let (ok, ov, count) = partition_once(&keys, &vals, 6, 0);
        check_partitioned(&keys, &vals, &ok, &ov, &count, 6);
    }

    #[test]
    fn partitions_every_unaligned_output_offset() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(2);
        let keys: Vec<u64> = (0..10_000).map(|_| rng.gen()).collect();
        let vals: Vec<u64> = keys.clone();
        for off in 0..8 {
            let (ok, ov, count) = partition_once(&keys, &vals, 4, off);
            check_partitioned(&keys, &vals, &ok, &ov, &count, 4);
        }
    }

    #[test]
    fn small_inputs_never_flush() {
        let keys: Vec<u64> = vec![3, 1, 2];
        let vals = keys.clone();
        for off in 0..8 {
            let (ok, ov, count) = partition_once(&keys, &vals, 2, off);
            check_partitioned(&keys, &vals, &ok, &ov, &count, 2);
        }
    }

    #[test]
    fn empty_partitions_leave_cursors_unchanged() {
        // All keys land in partition 5 of 16.
        let keys = vec![5u64; 1000];
        let vals = vec![7u64; 1000];
        let (ok, ov, count) = partition_once(&keys, &vals, 4, 3);
        assert_eq!(count[5], 1000);
        assert!(count.iter().enumerate().all(|(p, &c)| p == 5 || c == 0));
        check_partitioned(&keys, &vals, &ok, &ov, &count, 4);
    }

    #[test]
    fn two_writers_with_barrier_semantics() {
        // Emulates the phase structure: both passes complete before the
        // drains run, as the engine's barrier enforces.
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(3);
        let keys: Vec<u64> = (0..20_001).map(|_| rng.gen()).collect();
        let vals: Vec<u64> = keys.iter().map(|&k| k ^ 0xdead).collect();
        let bits = 5;
        let parts = 1usize << bits;
        let cls = RadixClassifier::new(0, bits);

        let mid = 9_997;
        let hist = SharedHistogram::new(2, parts);
        unsafe {
            histogram(&keys[..mid], &cls, hist.row_mut(0));
            histogram(&keys[mid..], &cls, hist.row_mut(1));
        }

        let mut out_keys = AlignedBuffer::<u64>::zeroed(keys.len()).unwrap();
        let mut out_vals = AlignedBuffer::<u64>::zeroed(keys.len()).unwrap();
        let ok = SlicePtr::from_mut(&mut out_keys[..]);
        let ov = SlicePtr::from_mut(&mut out_vals[..]);
        let va = virtual_add(ok.as_ptr(), keys.len());
        assert_eq!(va, 0);

        let mut bufs0 = PartitionBuffers::new(parts);
        let mut bufs1 = PartitionBuffers::new(parts);
        let mut off0 = vec![0u64; parts];
        let mut off1 = vec![0u64; parts];
        unsafe {
            crate::partition::partition_offsets(&hist, 0..2, 0, parts, &mut off0);
            crate::partition::partition_offsets(&hist, 0..2, 1, parts, &mut off1);
        }
        bufs0.reset_with_offsets(&off0, va);
        bufs1.reset_with_offsets(&off1, va);

        unsafe {
            partition_pass_by_key(&keys[..mid], &vals[..mid], &cls, &mut bufs0, ok, ov, va);
            partition_pass_by_key(&keys[mid..], &vals[mid..], &cls, &mut bufs1, ok, ov, va);
            // "Barrier", then drains in either order.
            let row0: Vec<u64> = hist.row(0).to_vec();
            let row1: Vec<u64> = hist.row(1).to_vec();
            drain(&mut bufs1, parts, &row1, ok, ov, va);
            drain(&mut bufs0, parts, &row0, ok, ov, va);
        }
        numa_cpu::runtime::stream::store_fence();

        let mut total = vec![0u64; parts];
        unsafe {
            for p in 0..parts {
                total[p] = hist.row(0)[p] + hist.row(1)[p];
            }
        }
        check_partitioned(&keys, &vals, &out_keys, &out_vals, &total, bits);

        // Stability: worker 0's tuples precede worker 1's inside a slab.
        let mut base = 0usize;
        unsafe {
            for p in 0..parts {
                let c0 = hist.row(0)[p] as usize;
                let naive0: Vec<u64> = keys[..mid]
                    .iter()
                    .copied()
                    .filter(|&k| cls.classify(k) == p)
                    .collect();
                assert_eq!(&out_keys[base..base + c0], &naive0[..]);
                base += total[p] as usize;
            }
        }
    }
}
