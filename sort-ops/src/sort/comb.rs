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

//! Cache-resident final sort.
//!
//! A 4-lane comb sort runs over the partition with gaps that are multiples
//! of four tuples, which turns the array into four interleaved sorted
//! subsequences (one per lane, stride 4). A 4-way merge then streams the
//! lane fronts to the output, picking the minimum key with ties broken by
//! the leftmost position. Exhausted lanes are retired through an explicit
//! valid mask. Partitions of at most nine tuples use a plain insertion
//! sort.

use numa_cpu::runtime::stream::stream_u64;

const SHRINK: f64 = 0.77;
const INSERTION_CUTOFF: usize = 9;

/// Largest partition the comb sort accepts. Bigger partitions indicate a
/// sizing error in the caller and abort.
pub const MAX_COMB_SIZE: usize = 0x7FFF_FFF0;

/// In-place insertion sort of key/payload pairs.
pub fn insertsort_pairs(keys: &mut [u64], vals: &mut [u64]) {
    debug_assert_eq!(keys.len(), vals.len());
    for i in 1..keys.len() {
        let key = keys[i];
        let val = vals[i];
        let mut j = i;
        while j > 0 && keys[j - 1] > key {
            keys[j] = keys[j - 1];
            vals[j] = vals[j - 1];
            j -= 1;
        }
        keys[j] = key;
        vals[j] = val;
    }
}

/// Scalar comb sort over keys alone; sorts the small secondary sample.
pub fn scalar_combsort_keys(keys: &mut [u64]) {
    let size = keys.len();
    if size <= 1 {
        return;
    }
    let mut gap = (size as f64 * SHRINK) as usize;
    loop {
        let mut done = true;
        let mut i = 0;
        let mut j = gap;
        while j != size {
            if keys[i] > keys[j] {
                keys.swap(i, j);
                done = false;
            }
            i += 1;
            j += 1;
        }
        if gap > 1 {
            gap = (gap as f64 * SHRINK) as usize;
        } else if done {
            break;
        }
    }
}

/// Sorts one partition of key/payload pairs from `keys`/`vals` into
/// `out_keys`/`out_vals`. The input arrays are consumed as scratch.
pub fn combsort_pairs(
    keys: &mut [u64],
    vals: &mut [u64],
    out_keys: &mut [u64],
    out_vals: &mut [u64],
) {
    let size = keys.len();
    debug_assert_eq!(size, vals.len());
    debug_assert_eq!(size, out_keys.len());
    debug_assert_eq!(size, out_vals.len());
    assert!(size <= MAX_COMB_SIZE, "partition of {} tuples overflows the comb sort", size);

    if size <= INSERTION_CUTOFF {
        insertsort_pairs(keys, vals);
        unsafe {
            for i in 0..size {
                stream_u64(out_keys.as_mut_ptr().add(i), keys[i]);
                stream_u64(out_vals.as_mut_ptr().add(i), vals[i]);
            }
        }
        return;
    }

    // Comb phase: gaps in units of four tuples, shrinking by 0.77 per
    // iteration; terminates on a clean pass at gap one.
    let end = size & 3;
    let size_middle = size - end;
    let mut gap = ((size_middle >> 2) as f64 * SHRINK) as usize;
    loop {
        let mut swapped = false;
        let mut i = 0;
        let mut j = gap << 2;
        while j != size_middle {
            for c in 0..4 {
                if keys[i + c] > keys[j + c] {
                    keys.swap(i + c, j + c);
                    vals.swap(i + c, j + c);
                    swapped = true;
                }
            }
            i += 4;
            j += 4;
        }
        for c in 0..end {
            if keys[i + c] > keys[j + c] {
                keys.swap(i + c, j + c);
                vals.swap(i + c, j + c);
                swapped = true;
            }
        }
        if gap > 1 {
            gap = (gap as f64 * SHRINK) as usize;
        } else if !swapped {
            break;
        }
    }

    // Merge phase: the four stride-4 lanes are each sorted; stream the
    // global minimum, refill the drained lane from four positions ahead.
    let mut lane_key = [keys[0], keys[1], keys[2], keys[3]];
    let mut lane_val = [vals[0], vals[1], vals[2], vals[3]];
    let mut lane_loc = [0usize, 1, 2, 3];
    let mut lane_valid = [size > 0, size > 1, size > 2, size > 3];

    let ok = out_keys.as_mut_ptr();
    let ov = out_vals.as_mut_ptr();
    for out_i in 0..size {
        let mut best = usize::MAX;
        for l in 0..4 {
            if !lane_valid[l] {
                continue;
            }
            if best == usize::MAX
                || lane_key[l] < lane_key[best]
                || (lane_key[l] == lane_key[best] && lane_loc[l] < lane_loc[best])
            {
                best = l;
            }
        }
        debug_assert!(best != usize::MAX);
        unsafe {
            stream_u64(ok.add(out_i), lane_key[best]);
            stream_u64(ov.add(out_i), lane_val[best]);
        }
        let next = lane_loc[best] + 4;
        if next < size {
            lane_key[best] = keys[next];
            lane_val[best] = vals[next];
            lane_loc[best] = next;
        } else {
            lane_valid[best] = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn run_combsort(mut keys: Vec<u64>) -> (Vec<u64>, Vec<u64>) {
        let mut vals: Vec<u64> = keys.iter().map(|&k| !k).collect();
        let mut out_keys = vec![0u64; keys.len()];
        let mut out_vals = vec![0u64; keys.len()];
        combsort_pairs(&mut keys, &mut vals, &mut out_keys, &mut out_vals);
        numa_cpu::runtime::stream::store_fence();
        (out_keys, out_vals)
    }

    fn assert_sorted_with_payloads(out_keys: &[u64], out_vals: &[u64], mut input: Vec<u64>) {
        assert!(out_keys.windows(2).all(|w| w[0] <= w[1]));
        for (&k, &v) in out_keys.iter().zip(out_vals.iter()) {
            assert_eq!(v, !k, "payload detached from key {:#x}", k);
        }
        input.sort_unstable();
        assert_eq!(out_keys, &input[..]);
    }

    #[test]
    fn insertion_fallback_sizes() {
        for n in 0..=9usize {
            let keys: Vec<u64> = (0..n as u64).rev().collect();
            let (ok, ov) = run_combsort(keys.clone());
            assert_sorted_with_payloads(&ok, &ov, keys);
        }
    }

    #[test]
    fn sorts_random_inputs_of_awkward_sizes() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        for &n in &[10usize, 11, 12, 13, 16, 100, 101, 1023, 4096, 30_011] {
            let keys: Vec<u64> = (0..n).map(|_| rng.gen()).collect();
            let (ok, ov) = run_combsort(keys.clone());
            assert_sorted_with_payloads(&ok, &ov, keys);
        }
    }

    #[test]
    fn sorts_heavy_duplicates() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(8);
        let keys: Vec<u64> = (0..5000).map(|_| rng.gen::<u64>() % 7).collect();
        let (ok, ov) = run_combsort(keys.clone());
        assert_sorted_with_payloads(&ok, &ov, keys);
    }

    #[test]
    fn sorts_presorted_and_reversed() {
        let keys: Vec<u64> = (0..2000).collect();
        let (ok, ov) = run_combsort(keys.clone());
        assert_sorted_with_payloads(&ok, &ov, keys);

        let keys: Vec<u64> = (0..2000).rev().collect();
        let (ok, ov) = run_combsort(keys.clone());
        assert_sorted_with_payloads(&ok, &ov, keys);
    }

    #[test]
    fn all_equal_keys_pass_through() {
        let keys = vec![42u64; 1000];
        let (ok, ov) = run_combsort(keys.clone());
        assert_sorted_with_payloads(&ok, &ov, keys);
    }

    #[test]
    fn scalar_comb_sorts_keys() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(9);
        for &n in &[0usize, 1, 2, 3, 10, 359, 2879] {
            let mut keys: Vec<u64> = (0..n).map(|_| rng.gen()).collect();
            let mut expect = keys.clone();
            expect.sort_unstable();
            scalar_combsort_keys(&mut keys);
            assert_eq!(keys, expect);
        }
    }

    #[test]
    fn insertsort_is_stable_enough_for_pairs() {
        let mut keys = vec![5u64, 3, 5, 1];
        let mut vals = vec![50u64, 30, 51, 10];
        insertsort_pairs(&mut keys, &mut vals);
        assert_eq!(keys, vec![1, 3, 5, 5]);
        assert_eq!(vals, vec![10, 30, 50, 51]);
    }
}
