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

//! Thread pinning and per-thread memory policy.

use crate::runtime::linux_wrapper;
use crate::runtime::topology::ThreadSchedule;
use tracing::warn;

/// Hard-binds the calling worker to its scheduled CPU and binds the thread's
/// memory policy to the owning NUMA node.
///
/// Both operations are best-effort: on restricted systems (containers,
/// single-node machines asked for more nodes) a failure costs locality, not
/// correctness, so it only emits a warning.
pub fn bind_worker(schedule: &ThreadSchedule, thread_id: usize) {
    let cpu = schedule.cpus[thread_id];
    let node = schedule.nodes[thread_id];

    if let Err(e) = linux_wrapper::bind_to_cpu(cpu) {
        warn!("pinning thread {} to cpu {} failed: {}", thread_id, cpu, e);
    }
    // The memory policy is set explicitly rather than relying on first-touch
    // through the CPU binding.
    if let Err(e) = linux_wrapper::set_mempolicy_bind(node as u16) {
        warn!(
            "binding memory policy of thread {} to node {} failed: {}",
            thread_id, node, e
        );
    }
}

/// Pins the calling thread to the first CPU of `node` and binds its memory
/// policy there. Used by the file loader to place data node-locally.
pub fn bind_to_node(node: usize) {
    let hw = crate::runtime::hw_info::HwTopology::get();
    let cpu = hw.cpus_of_node(node).first().copied().unwrap_or(0);
    if let Err(e) = linux_wrapper::bind_to_cpu(cpu) {
        warn!("pinning loader to cpu {} failed: {}", cpu, e);
    }
    if let Err(e) = linux_wrapper::set_mempolicy_bind(node as u16) {
        warn!("binding loader memory to node {} failed: {}", node, e);
    }
}

/// Restores the default memory policy of the calling thread.
pub fn unbind_memory() {
    linux_wrapper::set_mempolicy_default();
}
