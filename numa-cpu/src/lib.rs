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

//! Runtime support for NUMA-aware CPU programs.
//!
//! The crate bundles the low-level machinery that a NUMA-conscious data
//! processing engine needs: hardware topology probing, deterministic thread
//! placement, page-level memory allocation with node binding, and streaming
//! (non-temporal) store primitives.

pub mod error;
pub mod runtime;

pub use crate::error::{Error, Result};
