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

//! Histogramming: radix windows, range lookup over a hierarchical
//! comparison tree, and the NUMA-tagged radix window of the first LSB pass.
//!
//! The histogrammer never allocates on the data path. Range mode emits a
//! `u16` partition tag per tuple, consumed later by the buffered
//! partitioner.

use crate::error::{Error, Result};

/// Maps a key to its partition. Implementations are branch-free or
/// tree-structured; all of them agree with a scalar reference computation.
pub trait Classifier {
    fn partitions(&self) -> usize;
    fn classify(&self, key: u64) -> usize;
}

/// Index of the first delimiter `>= key`; equal keys go to the delimiter's
/// own partition, so `delim[p-1] < key <= delim[p]` holds for every tuple
/// tagged `p`.
#[inline]
pub fn lower_bound(delims: &[u64], key: u64) -> usize {
    delims.partition_point(|&d| d < key)
}

/// `partition(key) = (key >> shift) & ((1 << bits) - 1)`, `bits <= 16`.
#[derive(Debug, Clone, Copy)]
pub struct RadixClassifier {
    shift: u32,
    mask: u64,
    partitions: usize,
}

impl RadixClassifier {
    pub fn new(shift: u32, radix_bits: u32) -> Self {
        assert!(radix_bits >= 1 && radix_bits <= 16);
        assert!(shift + radix_bits <= 64);
        RadixClassifier {
            shift,
            mask: (1u64 << radix_bits) - 1,
            partitions: 1usize << radix_bits,
        }
    }
}

impl Classifier for RadixClassifier {
    #[inline]
    fn partitions(&self) -> usize {
        self.partitions
    }

    #[inline]
    fn classify(&self, key: u64) -> usize {
        ((key >> self.shift) & self.mask) as usize
    }
}

/// Range split across NUMA nodes: `numa - 1` delimiters padded with
/// `u64::MAX` up to the power-of-two fanout, so the tag of any key stays
/// below `numa`.
#[derive(Debug, Clone)]
pub struct NumaSplit {
    delims: Vec<u64>,
}

impl NumaSplit {
    pub fn new(delims: &[u64], numa: usize) -> Self {
        assert!(numa >= 2);
        assert_eq!(delims.len(), numa - 1);
        let fanout = numa.next_power_of_two();
        let mut padded = delims.to_vec();
        padded.resize(fanout - 1, u64::MAX);
        NumaSplit { delims: padded }
    }

    #[inline]
    pub fn fanout(&self) -> usize {
        self.delims.len() + 1
    }

    #[inline]
    pub fn tag(&self, key: u64) -> usize {
        lower_bound(&self.delims, key)
    }
}

/// First-pass classifier of the LSB variant: the low radix window plus the
/// NUMA range tag in the high bits.
#[derive(Debug, Clone)]
pub struct RadixNumaClassifier {
    radix_bits: u32,
    mask: u64,
    split: NumaSplit,
}

impl RadixNumaClassifier {
    pub fn new(radix_bits: u32, split: NumaSplit) -> Self {
        assert!(radix_bits >= 1 && radix_bits <= 16);
        RadixNumaClassifier {
            radix_bits,
            mask: (1u64 << radix_bits) - 1,
            split,
        }
    }
}

impl Classifier for RadixNumaClassifier {
    #[inline]
    fn partitions(&self) -> usize {
        self.split.fanout() << self.radix_bits
    }

    #[inline]
    fn classify(&self, key: u64) -> usize {
        (self.split.tag(key) << self.radix_bits) | (key & self.mask) as usize
    }
}

/// Fanout decomposition per supported partition count. The root always has
/// eight children so one 7-delimiter compare block resolves the first level.
fn tree_fanouts(partitions: usize) -> Option<&'static [usize]> {
    match partitions {
        360 => Some(&[8, 3, 3, 5]),
        1000 => Some(&[8, 5, 5, 5]),
        1800 => Some(&[8, 3, 3, 5, 5]),
        _ => None,
    }
}

/// Delimiters reorganized into a hierarchical comparison tree.
///
/// Level `k` holds, for each of its nodes, `fanout[k] - 1` keys drawn from
/// the sorted delimiter vector at the node's child boundaries; the levels
/// are stored back to back in one contiguous array. Descending the tree with
/// a first-key-`>= key` test per node yields exactly the scalar
/// [`lower_bound`] over the original delimiter vector.
#[derive(Debug)]
pub struct DelimiterTree {
    keys: Vec<u64>,
    level_offsets: Vec<usize>,
    fanouts: &'static [usize],
    delims: Vec<u64>,
}

impl DelimiterTree {
    pub fn new(delims: &[u64]) -> Result<Self> {
        let partitions = delims.len() + 1;
        let fanouts = tree_fanouts(partitions).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "no comparison tree layout for {} partitions",
                partitions
            ))
        })?;
        debug_assert!(delims.windows(2).all(|w| w[0] <= w[1]));

        let mut keys = Vec::with_capacity(partitions - 1);
        let mut level_offsets = Vec::with_capacity(fanouts.len());
        let mut node_count = 1;
        let mut width = partitions;
        for &f in fanouts {
            level_offsets.push(keys.len());
            let stride = width / f;
            for node in 0..node_count {
                let base = node * width;
                for j in 0..f - 1 {
                    keys.push(delims[base + (j + 1) * stride - 1]);
                }
            }
            node_count *= f;
            width = stride;
        }
        debug_assert_eq!(keys.len(), partitions - 1);
        debug_assert_eq!(width, 1);

        Ok(DelimiterTree {
            keys,
            level_offsets,
            fanouts,
            delims: delims.to_vec(),
        })
    }

    pub fn partitions(&self) -> usize {
        self.delims.len() + 1
    }

    pub fn delims(&self) -> &[u64] {
        &self.delims
    }

    #[inline]
    pub fn lookup(&self, key: u64) -> usize {
        let mut node = 0usize;
        for (level, &f) in self.fanouts.iter().enumerate() {
            let base = self.level_offsets[level] + node * (f - 1);
            let node_keys = &self.keys[base..base + f - 1];
            node = node * f + lower_bound(node_keys, key);
        }
        node
    }
}

impl Classifier for DelimiterTree {
    #[inline]
    fn partitions(&self) -> usize {
        self.partitions()
    }

    #[inline]
    fn classify(&self, key: u64) -> usize {
        self.lookup(key)
    }
}

/// Per-partition counts of `keys` under `cls`. The 4-wide body and the
/// scalar tail share the same kernel.
pub fn histogram<C: Classifier>(keys: &[u64], cls: &C, count: &mut [u64]) {
    debug_assert!(count.len() >= cls.partitions());
    let mut chunks = keys.chunks_exact(4);
    for group in &mut chunks {
        for &key in group {
            count[cls.classify(key)] += 1;
        }
    }
    for &key in chunks.remainder() {
        count[cls.classify(key)] += 1;
    }
}

/// Range histogram: counts per partition plus the per-tuple partition tag.
pub fn histogram_with_ranges(
    keys: &[u64],
    tree: &DelimiterTree,
    count: &mut [u64],
    ranges: &mut [u16],
) {
    debug_assert!(count.len() >= tree.partitions());
    debug_assert!(ranges.len() >= keys.len());
    debug_assert!(tree.partitions() <= u16::MAX as usize + 1);

    let (head, tail) = ranges.split_at_mut(keys.len() & !3);
    let mut out = head.chunks_exact_mut(4);
    let mut chunks = keys.chunks_exact(4);
    for (group, tags) in (&mut chunks).zip(&mut out) {
        for (&key, tag) in group.iter().zip(tags.iter_mut()) {
            let p = tree.lookup(key);
            debug_assert_eq!(p, lower_bound(tree.delims(), key));
            count[p] += 1;
            *tag = p as u16;
        }
    }
    for (&key, tag) in chunks.remainder().iter().zip(tail.iter_mut()) {
        let p = tree.lookup(key);
        debug_assert_eq!(p, lower_bound(tree.delims(), key));
        count[p] += 1;
        *tag = p as u16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn random_delims(partitions: usize, seed: u64, with_dups: bool) -> Vec<u64> {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let mut delims: Vec<u64> = (0..partitions - 1)
            .map(|_| {
                if with_dups {
                    rng.gen::<u64>() % 1000
                } else {
                    rng.gen()
                }
            })
            .collect();
        delims.sort_unstable();
        delims
    }

    #[test]
    fn tree_matches_lower_bound_for_all_layouts() -> crate::Result<()> {
        for &parts in &[360usize, 1000, 1800] {
            for &dups in &[false, true] {
                let delims = random_delims(parts, parts as u64 + dups as u64, dups);
                let tree = DelimiterTree::new(&delims)?;
                let mut rng = Xoshiro256PlusPlus::seed_from_u64(99);
                for _ in 0..20_000 {
                    let key: u64 = if dups { rng.gen::<u64>() % 1100 } else { rng.gen() };
                    assert_eq!(tree.lookup(key), lower_bound(&delims, key));
                }
                // Boundary keys, exactly on and around each delimiter.
                for &d in delims.iter().step_by(37) {
                    for key in [d.wrapping_sub(1), d, d.wrapping_add(1)] {
                        assert_eq!(tree.lookup(key), lower_bound(&delims, key));
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn tree_rejects_unknown_partition_counts() {
        assert!(DelimiterTree::new(&vec![0u64; 499]).is_err());
    }

    #[test]
    fn tree_with_all_equal_delimiters_splits_at_the_run() -> crate::Result<()> {
        let delims = vec![7u64; 359];
        let tree = DelimiterTree::new(&delims)?;
        assert_eq!(tree.lookup(6), 0);
        assert_eq!(tree.lookup(7), 0);
        assert_eq!(tree.lookup(8), 359);
        Ok(())
    }

    #[test]
    fn radix_classifier_extracts_bit_window() {
        let cls = RadixClassifier::new(8, 4);
        assert_eq!(cls.partitions(), 16);
        assert_eq!(cls.classify(0xab_cd), 0xb);
        assert_eq!(cls.classify(0xff_00), 0xf);
    }

    #[test]
    fn numa_split_pads_to_power_of_two() {
        let split = NumaSplit::new(&[100, 200], 3);
        assert_eq!(split.fanout(), 4);
        assert_eq!(split.tag(50), 0);
        assert_eq!(split.tag(100), 0);
        assert_eq!(split.tag(101), 1);
        assert_eq!(split.tag(u64::MAX), 2);
    }

    #[test]
    fn radix_numa_classifier_combines_tag_and_window() {
        let split = NumaSplit::new(&[1 << 32], 2);
        let cls = RadixNumaClassifier::new(8, split);
        assert_eq!(cls.partitions(), 512);
        assert_eq!(cls.classify(0x0000_0000_0000_00ab), 0xab);
        assert_eq!(cls.classify(0x0000_0001_0000_00ab), 0x1ab);
    }

    #[test]
    fn histogram_counts_match_naive() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(5);
        let keys: Vec<u64> = (0..10_003).map(|_| rng.gen()).collect();
        let cls = RadixClassifier::new(0, 8);
        let mut count = vec![0u64; 256];
        histogram(&keys, &cls, &mut count);
        let mut naive = vec![0u64; 256];
        for &k in &keys {
            naive[(k & 0xff) as usize] += 1;
        }
        assert_eq!(count, naive);
        assert_eq!(count.iter().sum::<u64>(), keys.len() as u64);
    }

    #[test]
    fn range_histogram_tags_agree_with_lower_bound() -> crate::Result<()> {
        let delims = random_delims(360, 11, true);
        let tree = DelimiterTree::new(&delims)?;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(12);
        let keys: Vec<u64> = (0..4099).map(|_| rng.gen::<u64>() % 1100).collect();
        let mut count = vec![0u64; 360];
        let mut ranges = vec![0u16; keys.len()];
        histogram_with_ranges(&keys, &tree, &mut count, &mut ranges);
        for (&k, &r) in keys.iter().zip(ranges.iter()) {
            assert_eq!(r as usize, lower_bound(&delims, k));
            let p = r as usize;
            if p > 0 {
                assert!(delims[p - 1] < k);
            }
            if p < delims.len() {
                assert!(k <= delims[p]);
            }
        }
        assert_eq!(count.iter().sum::<u64>(), keys.len() as u64);
        Ok(())
    }
}
