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

//! Deterministic thread placement.
//!
//! Worker threads are assigned to NUMA nodes in contiguous blocks (threads
//! `[n*tpn, (n+1)*tpn)` belong to node `n`), and within a node a chiplet
//! permutation spreads consecutive local thread ids over the cores of one
//! chiplet so that cooperating threads share an L3 slice. When the request
//! exceeds the hardware, placement degrades to a simple modulo layout.

use crate::error::{Error, Result};
use crate::runtime::hw_info::HwTopology;

/// Chiplet geometry: `block_size` consecutive cores form one repetition
/// block, split into chiplets of `group_size` cores each.
///
/// Thread `t` within a block maps to core
/// `base + offset / group_size + (offset % group_size) * (block_size / group_size)`,
/// which places every `group_size`-th thread on the same chiplet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipletLayout {
    pub block_size: usize,
    pub group_size: usize,
}

impl Default for ChipletLayout {
    fn default() -> Self {
        ChipletLayout {
            block_size: 128,
            group_size: 16,
        }
    }
}

impl ChipletLayout {
    pub fn new(block_size: usize, group_size: usize) -> Result<Self> {
        if group_size == 0 || block_size == 0 || block_size % group_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "chiplet layout {}/{} is not divisible",
                block_size, group_size
            )));
        }
        Ok(ChipletLayout {
            block_size,
            group_size,
        })
    }

    /// Permutes a local index within `[0, domain)`. Only complete blocks are
    /// permuted; a partial tail block keeps the identity mapping so that the
    /// permutation stays collision-free on any domain size.
    pub fn permute(&self, index: usize, domain: usize) -> usize {
        let block = self.effective_block(domain);
        if block <= 1 {
            return index;
        }
        let base = (index / block) * block;
        let offset = index % block;
        if base + block > domain {
            return index;
        }
        base + offset / self.group_size + (offset % self.group_size) * (block / self.group_size)
    }

    fn effective_block(&self, domain: usize) -> usize {
        let mut block = self.block_size.min(domain);
        block -= block % self.group_size;
        if block < self.group_size {
            0
        } else {
            block
        }
    }
}

/// Thread id to (logical CPU, NUMA node) assignment for a worker pool.
#[derive(Debug, Clone)]
pub struct ThreadSchedule {
    pub cpus: Vec<usize>,
    pub nodes: Vec<usize>,
    pub threads: usize,
    pub numa: usize,
}

impl ThreadSchedule {
    pub fn new(
        threads: usize,
        numa: usize,
        layout: ChipletLayout,
        hw: &HwTopology,
    ) -> Result<ThreadSchedule> {
        if numa == 0 || threads < numa || threads % numa != 0 {
            return Err(Error::InvalidArgument(format!(
                "threads ({}) must be a positive multiple of NUMA nodes ({})",
                threads, numa
            )));
        }
        let threads_per_numa = threads / numa;

        let oversubscribed = numa > hw.numa_nodes
            || threads > hw.threads
            || threads_per_numa > hw.threads / hw.numa_nodes;

        let mut cpus = Vec::with_capacity(threads);
        let mut nodes = Vec::with_capacity(threads);

        if oversubscribed {
            for t in 0..threads {
                cpus.push(t % hw.threads);
                nodes.push(t / threads_per_numa);
            }
        } else {
            for node in 0..numa {
                let node_cpus = hw.cpus_of_node(node);
                for local in 0..threads_per_numa {
                    if node_cpus.is_empty() {
                        cpus.push((node * threads_per_numa + local) % hw.threads);
                    } else {
                        let core = layout.permute(local, node_cpus.len());
                        cpus.push(node_cpus[core % node_cpus.len()]);
                    }
                    nodes.push(node);
                }
            }
        }

        Ok(ThreadSchedule {
            cpus,
            nodes,
            threads,
            numa,
        })
    }

    pub fn threads_per_numa(&self) -> usize {
        self.threads / self.numa
    }

    /// Index of `thread` among the threads of its own node.
    pub fn local_id(&self, thread: usize) -> usize {
        thread % self.threads_per_numa()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_hw(threads: usize, numa: usize) -> HwTopology {
        let per = threads / numa;
        HwTopology {
            threads,
            numa_nodes: numa,
            cpu_node: (0..threads).map(|c| c / per).collect(),
        }
    }

    #[test]
    fn chiplet_permutation_is_a_bijection_per_block() {
        let layout = ChipletLayout::default();
        let mut seen = vec![false; 128];
        for t in 0..128 {
            let c = layout.permute(t, 128);
            assert!(!seen[c], "collision at core {}", c);
            seen[c] = true;
        }
        // Threads 0 and 16 land on the same chiplet (consecutive cores).
        assert_eq!(layout.permute(0, 128), 0);
        assert_eq!(layout.permute(16, 128), 1);
        assert_eq!(layout.permute(1, 128), 8);
    }

    #[test]
    fn chiplet_permutation_shrinks_to_domain() {
        let layout = ChipletLayout::default();
        let mut seen = vec![false; 64];
        for t in 0..64 {
            let c = layout.permute(t, 64);
            assert!(c < 64);
            assert!(!seen[c], "collision at core {}", c);
            seen[c] = true;
        }
    }

    #[test]
    fn schedule_assigns_blocks_of_threads_per_node() {
        let hw = fake_hw(8, 2);
        let s = ThreadSchedule::new(4, 2, ChipletLayout::default(), &hw).unwrap();
        assert_eq!(s.nodes, vec![0, 0, 1, 1]);
        assert!(s.cpus[0] < 4 && s.cpus[1] < 4);
        assert!(s.cpus[2] >= 4 && s.cpus[3] >= 4);
        assert_eq!(s.local_id(3), 1);
    }

    #[test]
    fn schedule_degrades_to_modulo_when_oversubscribed() {
        let hw = fake_hw(2, 1);
        let s = ThreadSchedule::new(8, 2, ChipletLayout::default(), &hw).unwrap();
        assert_eq!(s.cpus, vec![0, 1, 0, 1, 0, 1, 0, 1]);
        assert_eq!(s.nodes, vec![0, 0, 0, 0, 1, 1, 1, 1]);
    }

    #[test]
    fn schedule_rejects_indivisible_thread_counts() {
        let hw = fake_hw(8, 2);
        assert!(ThreadSchedule::new(5, 2, ChipletLayout::default(), &hw).is_err());
        assert!(ThreadSchedule::new(2, 0, ChipletLayout::default(), &hw).is_err());
    }
}
