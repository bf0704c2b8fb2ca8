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

//! Shared partitioning state: histograms, prefix-sum offsets, and the
//! write-combining scratch lines of the buffered partitioner.

pub mod buffered;
pub mod histogram;

use crate::util::SharedCell;

/// Tuples per 64-byte output line; the flush granularity of the buffered
/// partitioner.
pub const TUPLES_PER_LINE: usize = 8;

#[inline]
pub fn fanout(radix_bits: u32) -> usize {
    1 << radix_bits
}

/// One histogram row per worker, written exclusively by its owner and read
/// by peers after a barrier.
#[derive(Debug)]
pub struct SharedHistogram {
    rows: Vec<SharedCell<Vec<u64>>>,
    partitions: usize,
}

impl SharedHistogram {
    pub fn new(rows: usize, partitions: usize) -> Self {
        SharedHistogram {
            rows: (0..rows)
                .map(|_| SharedCell::new(vec![0u64; partitions]))
                .collect(),
            partitions,
        }
    }

    pub fn partitions(&self) -> usize {
        self.partitions
    }

    pub fn rows(&self) -> usize {
        self.rows.len()
    }

    /// # Safety
    ///
    /// Caller must be the owner of `row` during a write phase.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn row_mut(&self, row: usize) -> &mut [u64] {
        self.rows[row].get_mut()
    }

    /// # Safety
    ///
    /// A barrier must separate this read from the owner's writes.
    pub unsafe fn row(&self, row: usize) -> &[u64] {
        self.rows[row].get()
    }
}

/// Exclusive prefix sums of the per-worker histograms of one NUMA node.
///
/// For every partition `p`, worker `local_id` owns the output slab
/// `[offsets[p], offsets[p] + rows[local_id][p])`: contributions are laid
/// out partition-major, worker-minor, which keeps the pass stable.
///
/// # Safety
///
/// All rows in `row_range` must have been published (barrier) before the
/// call.
pub unsafe fn partition_offsets(
    hist: &SharedHistogram,
    row_range: std::ops::Range<usize>,
    local_id: usize,
    partitions: usize,
    offsets: &mut [u64],
) -> u64 {
    let rows: Vec<&[u64]> = row_range.map(|r| hist.row(r)).collect();
    let mut pos = 0u64;
    for p in 0..partitions {
        for row in rows.iter().take(local_id) {
            pos += row[p];
        }
        offsets[p] = pos;
        for row in rows.iter().skip(local_id) {
            pos += row[p];
        }
    }
    pos
}

/// One write-combining staging line per partition: eight key/payload pairs,
/// flushed to the output as a 64-byte keys line and a 64-byte payloads line.
#[repr(C, align(128))]
#[derive(Debug, Clone, Copy)]
pub struct ScratchLine {
    pub keys: [u64; TUPLES_PER_LINE],
    pub vals: [u64; TUPLES_PER_LINE],
}

impl ScratchLine {
    const ZERO: ScratchLine = ScratchLine {
        keys: [0; TUPLES_PER_LINE],
        vals: [0; TUPLES_PER_LINE],
    };
}

/// Per-partition scratch lines plus their write cursors.
///
/// The cursors live in a parallel array instead of being folded into the
/// last line slot; the flush kernel therefore never has to save and restore
/// cursor state around a streamed line. Cursors count *virtual* tuple
/// positions: `reset_*` adds an alignment bias so that every full line lands
/// on a 64-byte boundary of the output (see `buffered`).
#[derive(Debug)]
pub struct PartitionBuffers {
    lines: Vec<ScratchLine>,
    cursors: Vec<u64>,
    starts: Vec<u64>,
}

impl PartitionBuffers {
    pub fn new(max_partitions: usize) -> Self {
        PartitionBuffers {
            lines: vec![ScratchLine::ZERO; max_partitions],
            cursors: vec![0; max_partitions],
            starts: vec![0; max_partitions],
        }
    }

    /// Prepares `partitions` cursors from explicit slab offsets.
    pub fn reset_with_offsets(&mut self, offsets: &[u64], virtual_add: u64) {
        for (p, &o) in offsets.iter().enumerate() {
            let start = o + virtual_add;
            self.cursors[p] = start;
            self.starts[p] = start;
        }
    }

    /// Prepares cursors from consecutive partition sizes starting at zero.
    pub fn reset_with_sizes(&mut self, sizes: &[u64], virtual_add: u64) {
        let mut pos = virtual_add;
        for (p, &s) in sizes.iter().enumerate() {
            self.cursors[p] = pos;
            self.starts[p] = pos;
            pos += s;
        }
    }

    #[inline]
    pub(crate) fn parts(
        &mut self,
    ) -> (&mut [ScratchLine], &mut [u64], &[u64]) {
        (&mut self.lines, &mut self.cursors, &self.starts)
    }

    pub fn cursor(&self, p: usize) -> u64 {
        self.cursors[p]
    }

    pub fn start(&self, p: usize) -> u64 {
        self.starts[p]
    }

    pub fn capacity(&self) -> usize {
        self.lines.len()
    }
}
