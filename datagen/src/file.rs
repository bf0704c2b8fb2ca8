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

//! Raw key file loading.
//!
//! The input format is a plain little-endian stream of `u64` keys. Keys are
//! read in 4 KiB blocks; the caller is expected to pin itself to the
//! destination NUMA node before filling that node's array.

use crate::{Error, Result};
use std::fs::File;
use std::io::Read;

const BLOCK_KEYS: usize = 4096 / std::mem::size_of::<u64>();

/// Fills `keys` from the reader and returns the sum of the keys read.
/// A short read is an error.
pub fn read_node_keys(file: &mut File, keys: &mut [u64]) -> Result<u64> {
    let mut checksum = 0u64;
    let mut block = [0u8; BLOCK_KEYS * 8];
    let mut filled = 0;
    while filled != keys.len() {
        let want = BLOCK_KEYS.min(keys.len() - filled);
        file.read_exact(&mut block[..want * 8]).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::InvalidArgument(format!(
                    "key file too short: needed {} more keys",
                    keys.len() - filled
                ))
            } else {
                Error::Io(e)
            }
        })?;
        for (slot, bytes) in keys[filled..filled + want]
            .iter_mut()
            .zip(block.chunks_exact(8))
        {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            let key = u64::from_le_bytes(raw);
            *slot = key;
            checksum = checksum.wrapping_add(key);
        }
        filled += want;
    }
    Ok(checksum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn reads_little_endian_keys() -> Result<()> {
        let mut f = tempfile::tempfile().unwrap();
        let expect: Vec<u64> = (0..1000u64).map(|i| i * 3).collect();
        for k in &expect {
            f.write_all(&k.to_le_bytes()).unwrap();
        }
        f.seek(SeekFrom::Start(0)).unwrap();

        let mut keys = vec![0u64; 1000];
        let sum = read_node_keys(&mut f, &mut keys)?;
        assert_eq!(keys, expect);
        assert_eq!(sum, expect.iter().fold(0u64, |a, &x| a.wrapping_add(x)));
        Ok(())
    }

    #[test]
    fn short_file_is_an_error() {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&42u64.to_le_bytes()).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        let mut keys = vec![0u64; 2];
        assert!(read_node_keys(&mut f, &mut keys).is_err());
    }
}
