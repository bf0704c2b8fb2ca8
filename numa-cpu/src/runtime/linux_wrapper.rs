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

//! Thin wrappers around the Linux memory-policy and scheduling syscalls.

use crate::error::{Error, Result};

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::ptr;

    const MAX_NODE_BITS: libc::c_ulong = 64;

    /// Anonymous private mapping, page-aligned (and therefore at least
    /// 64-byte aligned). `huge` requests explicit huge pages.
    pub fn mmap_anonymous(bytes: usize, huge: bool) -> Result<*mut u8> {
        let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        if huge {
            flags |= libc::MAP_HUGETLB;
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(Error::OutOfMemory(format!(
                "mmap of {} bytes failed (huge pages: {})",
                bytes, huge
            )))
        } else {
            Ok(ptr as *mut u8)
        }
    }

    pub fn munmap(ptr: *mut u8, bytes: usize) {
        unsafe {
            libc::munmap(ptr as *mut libc::c_void, bytes);
        }
    }

    /// Binds a mapping to one NUMA node. Placement failures are not fatal:
    /// the mapping stays usable, only locality is lost.
    pub fn mbind_to_node(ptr: *mut u8, bytes: usize, node: u16) -> Result<()> {
        let nodemask: libc::c_ulong = 1 << node;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr as *mut libc::c_void,
                bytes,
                libc::MPOL_BIND,
                &nodemask,
                MAX_NODE_BITS,
                0,
            )
        };
        if ret != 0 {
            Err(Error::os("mbind"))
        } else {
            Ok(())
        }
    }

    /// Interleaves a mapping over a set of NUMA nodes.
    pub fn mbind_interleaved(ptr: *mut u8, bytes: usize, nodes: usize) -> Result<()> {
        let nodemask: libc::c_ulong = if nodes >= 64 {
            !0
        } else {
            (1 << nodes) - 1
        };
        let ret = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                ptr as *mut libc::c_void,
                bytes,
                libc::MPOL_INTERLEAVE,
                &nodemask,
                MAX_NODE_BITS,
                0,
            )
        };
        if ret != 0 {
            Err(Error::os("mbind"))
        } else {
            Ok(())
        }
    }

    /// Binds the calling thread's future allocations to one NUMA node.
    pub fn set_mempolicy_bind(node: u16) -> Result<()> {
        let nodemask: libc::c_ulong = 1 << node;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                libc::MPOL_BIND,
                &nodemask,
                MAX_NODE_BITS,
            )
        };
        if ret != 0 {
            Err(Error::os("set_mempolicy"))
        } else {
            Ok(())
        }
    }

    /// Restores the default (local) allocation policy.
    pub fn set_mempolicy_default() {
        unsafe {
            libc::syscall(
                libc::SYS_set_mempolicy,
                libc::MPOL_DEFAULT,
                std::ptr::null::<libc::c_ulong>(),
                0,
            );
        }
    }

    /// Pins the calling thread to one logical CPU.
    pub fn bind_to_cpu(cpu: usize) -> Result<()> {
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
            if ret != 0 {
                Err(Error::os("sched_setaffinity"))
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::*;

#[cfg(not(target_os = "linux"))]
mod fallback {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};

    pub fn mmap_anonymous(bytes: usize, _huge: bool) -> Result<*mut u8> {
        let layout = Layout::from_size_align(bytes, 4096).map_err(|e| {
            Error::InvalidArgument(format!("bad layout for {} bytes: {}", bytes, e))
        })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            Err(Error::OutOfMemory(format!("allocation of {} bytes failed", bytes)))
        } else {
            Ok(ptr)
        }
    }

    pub fn munmap(ptr: *mut u8, bytes: usize) {
        let layout = Layout::from_size_align(bytes, 4096).unwrap();
        unsafe { dealloc(ptr, layout) };
    }

    pub fn mbind_to_node(_ptr: *mut u8, _bytes: usize, _node: u16) -> Result<()> {
        Ok(())
    }

    pub fn mbind_interleaved(_ptr: *mut u8, _bytes: usize, _nodes: usize) -> Result<()> {
        Ok(())
    }

    pub fn set_mempolicy_bind(_node: u16) -> Result<()> {
        Ok(())
    }

    pub fn set_mempolicy_default() {}

    pub fn bind_to_cpu(_cpu: usize) -> Result<()> {
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub use self::fallback::*;
