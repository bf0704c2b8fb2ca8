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

//! Non-temporal store primitives.
//!
//! Streaming writes bypass the cache hierarchy. They become visible to other
//! threads only after a store fence; every barrier that publishes streamed
//! data must therefore issue [`store_fence`] first (see `sort-ops::sync`).
//! On non-x86 targets the functions degrade to plain stores with a full
//! fence, which is observably equivalent.

/// Orders all prior stores, including non-temporal ones, before any later
/// store.
#[inline]
pub fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_mm_sfence();
    }
    #[cfg(not(target_arch = "x86_64"))]
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

/// Streams one `u64` to `dst`.
///
/// # Safety
///
/// `dst` must be valid for writes and 8-byte aligned.
#[inline]
pub unsafe fn stream_u64(dst: *mut u64, val: u64) {
    #[cfg(target_arch = "x86_64")]
    std::arch::x86_64::_mm_stream_si64(dst as *mut i64, val as i64);
    #[cfg(not(target_arch = "x86_64"))]
    std::ptr::write(dst, val);
}

/// Streams a full 64-byte line of eight `u64` values.
///
/// # Safety
///
/// `dst` must be valid for 8 writes and 64-byte aligned.
#[inline]
pub unsafe fn stream_line_u64(dst: *mut u64, vals: &[u64; 8]) {
    debug_assert_eq!(dst as usize % 64, 0);
    for (i, &v) in vals.iter().enumerate() {
        stream_u64(dst.add(i), v);
    }
}

/// Streams `len` values from `src` to `dst`.
///
/// # Safety
///
/// Both pointers must be valid for `len` elements and 8-byte aligned; the
/// regions must not overlap.
#[inline]
pub unsafe fn stream_copy_u64(dst: *mut u64, src: *const u64, len: usize) {
    for i in 0..len {
        stream_u64(dst.add(i), *src.add(i));
    }
}

/// Zero-fills `len` values at `dst` with streaming stores. Used for the
/// first-touch pass over freshly mapped output buffers.
///
/// # Safety
///
/// `dst` must be valid for `len` writes and 8-byte aligned.
#[inline]
pub unsafe fn stream_fill_zero_u64(dst: *mut u64, len: usize) {
    for i in 0..len {
        stream_u64(dst.add(i), 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_copy_moves_data() {
        let src: Vec<u64> = (0..256).collect();
        let mut dst = vec![0u64; 256];
        unsafe { stream_copy_u64(dst.as_mut_ptr(), src.as_ptr(), 256) };
        store_fence();
        assert_eq!(src, dst);
    }
}
