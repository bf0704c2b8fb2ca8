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

//! NUMA-aware parallel partition-and-sort operators.
//!
//! The crate sorts large in-memory tables of 64-bit key / 64-bit payload
//! pairs across multiple NUMA nodes. Two orchestrations share the same
//! machinery:
//!
//! - [`range`]: a two-level range partitioning (delimiters from a sampled
//!   comparison tree) followed by a cache-resident comb sort per partition.
//! - [`lsb`]: multi-pass least-significant-bit radix partitioning, with a
//!   range-derived NUMA tag folded into the first pass.
//!
//! Both place every partition on the NUMA node that sorts it, moving data at
//! most once across nodes through a randomized shuffle.

pub mod engine;
pub mod error;
pub mod lsb;
pub mod partition;
pub mod range;
pub mod sample;
pub mod shuffle;
pub mod sort;
pub mod sync;
pub mod util;

pub use crate::engine::{
    DestinationParity, NodeArrays, PhaseTimes, ScratchArrays, SortConfig, SortOutput,
};
pub use crate::error::{Error, Result};
