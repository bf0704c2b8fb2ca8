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

//! Sampling and delimiter extraction.
//!
//! Every worker draws uniform samples from its node-local input, the pool
//! sorts the combined sample with eight cooperative 8-bit LSB radix passes,
//! and partition delimiters are read off at the quantile positions with a
//! run-length tie-break.

use crate::partition::histogram::{histogram, Classifier, RadixClassifier};
use crate::partition::{partition_offsets, SharedHistogram, TUPLES_PER_LINE};
use crate::sync::FencedBarrier;
use crate::util::{mulhi, SlicePtr};
use numa_cpu::runtime::stream::{stream_line_u64, stream_u64};
use rand::RngCore;

pub const SAMPLE_RADIX_BITS: u32 = 8;
pub const SAMPLE_PASSES: u32 = 8;

/// Caps and rounds a proposed sample size. The cooperative sort slices the
/// sample in multiples of 16 per worker.
pub fn sample_size(total: usize, ratio: f64, cap: usize) -> usize {
    (((total as f64 * ratio) as usize).min(cap)) & !15
}

/// Draws `out.len()` keys from `local_keys`, indexing with the multiply-high
/// of a random word so no modulo bias sneaks in.
pub fn draw_sample<R: RngCore>(local_keys: &[u64], out: &mut [u64], rng: &mut R) {
    let n = local_keys.len() as u64;
    if n == 0 {
        for slot in out.iter_mut() {
            *slot = 0;
        }
        return;
    }
    for slot in out.iter_mut() {
        *slot = local_keys[mulhi(rng.next_u64(), n) as usize];
    }
}

/// The per-worker slice of the shared sample array.
pub fn sample_slice(total: usize, thread_id: usize, threads: usize) -> (usize, usize) {
    let per_thread = (total / threads) & !15;
    let start = per_thread * thread_id;
    let len = if thread_id + 1 == threads {
        total - start
    } else {
        per_thread
    };
    (start, len)
}

#[repr(C, align(64))]
#[derive(Clone, Copy)]
struct KeyLine([u64; TUPLES_PER_LINE]);

/// One cooperative 8-bit radix pass over the shared sample: histogram,
/// buffered keys-only partition, drain. Three barrier crossings publish the
/// histograms, the streamed lines, and the drained tails.
///
/// # Safety
///
/// All workers must call with the same arguments except `thread_id`; `keys`
/// and `keys_out` must not overlap, and `keys_out` must be 64-byte aligned.
pub unsafe fn partition_keys_pass(
    keys: SlicePtr<u64>,
    keys_out: SlicePtr<u64>,
    size: usize,
    hist: &SharedHistogram,
    shift: u32,
    thread_id: usize,
    threads: usize,
    global: &FencedBarrier,
) {
    debug_assert_eq!(keys_out.as_ptr() as usize & 63, 0);
    let partitions = 1usize << SAMPLE_RADIX_BITS;
    let cls = RadixClassifier::new(shift, SAMPLE_RADIX_BITS);

    let per_thread = (size / threads) & !15;
    let start = per_thread * thread_id;
    let local_size = if thread_id + 1 == threads {
        size - start
    } else {
        per_thread
    };
    let local_keys = keys.slice(start, local_size);

    let own = hist.row_mut(thread_id);
    for c in own.iter_mut() {
        *c = 0;
    }
    histogram(local_keys, &cls, own);
    global.wait();

    let mut offsets = vec![0u64; partitions];
    partition_offsets(hist, 0..threads, thread_id, partitions, &mut offsets);

    let mut lines = vec![KeyLine([0; TUPLES_PER_LINE]); partitions];
    let mut cursors = offsets.clone();
    for &key in local_keys {
        let p = cls.classify(key);
        let cur = cursors[p];
        cursors[p] = cur + 1;
        let slot = (cur & 7) as usize;
        lines[p].0[slot] = key;
        if slot == TUPLES_PER_LINE - 1 {
            stream_line_u64(keys_out.ptr_at((cur - 7) as usize), &lines[p].0);
        }
    }
    global.wait();

    let own = hist.row(thread_id);
    for p in 0..partitions {
        let cur = cursors[p];
        let remain = cur & 7;
        let skip = remain.saturating_sub(own[p]);
        for off in skip..remain {
            let pos = cur - remain + off;
            stream_u64(keys_out.ptr_at(pos as usize), lines[p].0[(pos & 7) as usize]);
        }
        debug_assert_eq!(cur, offsets[p] + own[p]);
    }
    global.wait();
}

/// Sorts the shared sample with eight cooperative LSB passes. The sorted
/// result ends up back in `sample`.
///
/// # Safety
///
/// Same contract as [`partition_keys_pass`]; in addition `sample` must be
/// 64-byte aligned because even passes stream into it.
pub unsafe fn sort_sample(
    sample: SlicePtr<u64>,
    sample_buf: SlicePtr<u64>,
    size: usize,
    hist: &SharedHistogram,
    thread_id: usize,
    threads: usize,
    global: &FencedBarrier,
) {
    for pass in 0..SAMPLE_PASSES {
        let (src, dst) = if pass % 2 == 0 {
            (sample, sample_buf)
        } else {
            (sample_buf, sample)
        };
        partition_keys_pass(
            src,
            dst,
            size,
            hist,
            pass * SAMPLE_RADIX_BITS,
            thread_id,
            threads,
            global,
        );
    }
}

/// Delimiters at the quantile positions `ceil(i * S / P) - 1` of a sorted
/// sample, for `i` in `1..P`.
///
/// Tie-break: when the sample repeats the picked key more often after the
/// quantile position than before it, the delimiter is decremented so the
/// partition boundary falls before the run instead of splitting it.
pub fn extract_delimiters(sample: &[u64], partitions: usize) -> Vec<u64> {
    if partitions <= 1 {
        return Vec::new();
    }
    if sample.is_empty() {
        return vec![0; partitions - 1];
    }
    debug_assert!(sample.windows(2).all(|w| w[0] <= w[1]));

    let s = sample.len() as u64;
    let parts = partitions as u64;
    (1..parts)
        .map(|i| {
            let idx = ((i * s + parts - 1) / parts - 1) as usize;
            let d = sample[idx];
            let mut start = idx;
            while start > 0 && sample[start] == d {
                start -= 1;
            }
            let mut end = idx;
            while end != sample.len() && sample[end] == d {
                end += 1;
            }
            if idx - start < end - idx && d != 0 {
                d - 1
            } else {
                d
            }
        })
        .collect()
}
