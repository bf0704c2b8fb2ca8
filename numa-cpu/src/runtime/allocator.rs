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

//! Allocator facade over the buffer kinds in [`memory`](super::memory).
//!
//! Mapping failures are fatal (`Error::OutOfMemory`). NUMA *placement*
//! failures are not: the buffer stays usable and only locality is lost, so
//! they are reported as a warning. This keeps the engine runnable inside
//! containers and on single-node machines.

use crate::error::Result;
use crate::runtime::linux_wrapper;
use crate::runtime::memory::{AlignedBuffer, DerefMem, MappedBuffer};
use tracing::warn;

/// Memory kinds the engine allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemType {
    /// 64-byte aligned heap memory with no placement constraint.
    SysMem,
    /// Page-backed memory bound to one NUMA node.
    NumaMem { node: u16 },
    /// Page-backed memory interleaved over `nodes` NUMA nodes.
    NumaInterleavedMem { nodes: usize },
    /// Explicit huge pages, falling back to regular pages when the pool is
    /// exhausted.
    HugePageMem,
}

/// Boxed allocation function, for callers that pick the memory kind at
/// runtime.
pub type DerefMemAllocFn<T> = Box<dyn Fn(usize) -> Result<DerefMem<T>> + Send + Sync>;

pub struct Allocator;

impl Allocator {
    pub fn alloc_deref_mem<T: Copy>(ty: MemType, len: usize) -> Result<DerefMem<T>> {
        match ty {
            MemType::SysMem => Ok(DerefMem::SysMem(AlignedBuffer::zeroed(len)?)),
            MemType::NumaMem { node } => {
                let buf = MappedBuffer::new(len, false)?;
                if let Err(e) = linux_wrapper::mbind_to_node(buf.as_byte_ptr(), buf.byte_len(), node)
                {
                    warn!("binding {} bytes to node {} failed: {}", buf.byte_len(), node, e);
                }
                Ok(DerefMem::NumaMem(buf))
            }
            MemType::NumaInterleavedMem { nodes } => {
                let buf = MappedBuffer::new(len, false)?;
                if let Err(e) =
                    linux_wrapper::mbind_interleaved(buf.as_byte_ptr(), buf.byte_len(), nodes)
                {
                    warn!("interleaving {} bytes failed: {}", buf.byte_len(), e);
                }
                Ok(DerefMem::NumaInterleavedMem(buf))
            }
            MemType::HugePageMem => match MappedBuffer::new(len, true) {
                Ok(buf) => Ok(DerefMem::HugePageMem(buf)),
                Err(e) => {
                    warn!("huge page mapping failed ({}), falling back to regular pages", e);
                    Ok(DerefMem::HugePageMem(MappedBuffer::new(len, false)?))
                }
            },
        }
    }

    pub fn deref_mem_alloc_fn<T: Copy + 'static>(ty: MemType) -> DerefMemAllocFn<T> {
        Box::new(move |len| Self::alloc_deref_mem(ty, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sys_mem_allocates_and_zeroes() {
        let mem: DerefMem<u64> = Allocator::alloc_deref_mem(MemType::SysMem, 128).unwrap();
        assert_eq!(mem.len(), 128);
        assert!(mem.iter().all(|&x| x == 0));
    }

    #[test]
    fn numa_mem_survives_missing_node() {
        // Node 0 always exists; binding must succeed or degrade to a warning.
        let mem: DerefMem<u64> =
            Allocator::alloc_deref_mem(MemType::NumaMem { node: 0 }, 4096).unwrap();
        assert_eq!(mem.len(), 4096);
    }
}
