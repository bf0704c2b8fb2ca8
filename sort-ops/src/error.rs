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

use thiserror::Error;

/// Engine entry errors.
///
/// Only argument validation at the `sort()` entry points reports through
/// `Result`. Once the worker pool is running, precondition violations
/// (capacity overflow during the shuffle, oversized partitions at the comb
/// sort) abort the process: they are programmer or sizing errors with no
/// recovery path.
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("misaligned buffer: {0}")]
    InvalidAlignment(String),

    #[error(transparent)]
    Runtime(#[from] numa_cpu::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
