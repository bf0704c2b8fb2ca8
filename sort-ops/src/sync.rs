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

//! Publication barriers for the worker pool.

use numa_cpu::runtime::stream::store_fence;
use std::sync::Barrier;

/// A counting barrier that publishes non-temporal stores.
///
/// The partitioning and shuffle kernels write with streaming stores, which
/// are not ordered by the barrier's internal synchronization alone. `wait`
/// issues a store fence first, so writes made by any worker before the
/// barrier are visible to every worker after it.
#[derive(Debug)]
pub struct FencedBarrier(Barrier);

impl FencedBarrier {
    pub fn new(parties: usize) -> Self {
        FencedBarrier(Barrier::new(parties))
    }

    pub fn wait(&self) {
        store_fence();
        self.0.wait();
    }
}

/// The barrier pair of the engine: one global barrier over all workers, and
/// one local barrier per NUMA node over that node's workers.
#[derive(Debug)]
pub struct BarrierSet {
    pub global: FencedBarrier,
    pub local: Vec<FencedBarrier>,
}

impl BarrierSet {
    pub fn new(threads: usize, numa: usize) -> Self {
        let threads_per_numa = threads / numa;
        BarrierSet {
            global: FencedBarrier::new(threads),
            local: (0..numa)
                .map(|_| FencedBarrier::new(threads_per_numa))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn barrier_synchronizes_all_parties() {
        let barrier = FencedBarrier::new(4);
        let before = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    before.fetch_add(1, Ordering::SeqCst);
                    barrier.wait();
                    assert_eq!(before.load(Ordering::SeqCst), 4);
                });
            }
        });
    }
}
