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

//! Post-sort sanity checks: per-node ordering, cross-node monotonicity, and
//! the key checksum the generator recorded.

use rayon::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("node {node} is not sorted near position {position}")]
    Unsorted { node: usize, position: usize },

    #[error("node {node} payload differs from key near position {position}")]
    PayloadMismatch { node: usize, position: usize },

    #[error("last key of node {node} exceeds the first key of node {next}")]
    NodeBoundary { node: usize, next: usize },
}

const CHECK_CHUNK: usize = 1 << 20;

/// Walks the sorted output in parallel chunks. Returns the wrapping key sum
/// for the multiset check against the generator's checksum.
pub fn check_sorted(
    keys: &[&[u64]],
    payloads: &[&[u64]],
    same_key_payload: bool,
) -> Result<u64, VerifyError> {
    // Cross-node boundaries first; they are cheap.
    for n in 1..keys.len() {
        let prev = keys[n - 1];
        let cur = keys[n];
        if !prev.is_empty() && !cur.is_empty() && prev[prev.len() - 1] > cur[0] {
            return Err(VerifyError::NodeBoundary { node: n - 1, next: n });
        }
    }

    let mut checksum = 0u64;
    for (n, (node_keys, node_payloads)) in keys.iter().zip(payloads.iter()).enumerate() {
        let chunk_sums: Vec<u64> = node_keys
            .par_chunks(CHECK_CHUNK)
            .zip(node_payloads.par_chunks(CHECK_CHUNK))
            .enumerate()
            .map(|(c, (kc, pc))| {
                let base = c * CHECK_CHUNK;
                let mut sum = 0u64;
                let mut prev = kc[0];
                for (i, (&k, &p)) in kc.iter().zip(pc.iter()).enumerate() {
                    if k < prev {
                        return Err(VerifyError::Unsorted {
                            node: n,
                            position: base + i,
                        });
                    }
                    if same_key_payload && p != k {
                        return Err(VerifyError::PayloadMismatch {
                            node: n,
                            position: base + i,
                        });
                    }
                    sum = sum.wrapping_add(k);
                    prev = k;
                }
                Ok(sum)
            })
            .collect::<Result<_, _>>()?;
        checksum = chunk_sums
            .iter()
            .fold(checksum, |a, &s| a.wrapping_add(s));

        // Seams between parallel chunks.
        for c in 1..(node_keys.len() + CHECK_CHUNK - 1) / CHECK_CHUNK {
            let at = c * CHECK_CHUNK;
            if node_keys[at - 1] > node_keys[at] {
                return Err(VerifyError::Unsorted { node: n, position: at });
            }
        }
    }
    Ok(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_sorted_nodes_and_sums_keys() {
        let a: Vec<u64> = (0..100).collect();
        let b: Vec<u64> = (100..200).collect();
        let sum = check_sorted(&[&a, &b], &[&a, &b], true).unwrap();
        assert_eq!(sum, (0..200u64).sum::<u64>());
    }

    #[test]
    fn rejects_unsorted_node() {
        let a = vec![3u64, 2, 5];
        assert!(matches!(
            check_sorted(&[&a], &[&a], false),
            Err(VerifyError::Unsorted { .. })
        ));
    }

    #[test]
    fn rejects_bad_node_boundary() {
        let a = vec![1u64, 50];
        let b = vec![10u64, 60];
        assert!(matches!(
            check_sorted(&[&a, &b], &[&a, &b], false),
            Err(VerifyError::NodeBoundary { .. })
        ));
    }

    #[test]
    fn rejects_detached_payloads() {
        let a = vec![1u64, 2];
        let p = vec![1u64, 3];
        assert!(matches!(
            check_sorted(&[&a], &[&p], true),
            Err(VerifyError::PayloadMismatch { .. })
        ));
    }
}
