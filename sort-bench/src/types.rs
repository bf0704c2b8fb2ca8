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

use serde_derive::Serialize;
use structopt::clap::arg_enum;

arg_enum! {
    /// Which sort orchestration the benchmark runs.
    #[derive(Copy, Clone, Debug, PartialEq, Serialize)]
    pub enum ArgAlgorithm {
        RangeCmp,
        LsbRadix,
    }
}

/// Where the benchmark's keys came from; recorded in the data point.
#[derive(Clone, Debug)]
pub enum DataSet {
    Uniform,
    Zipf(f64),
    File(String),
}

impl std::fmt::Display for DataSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSet::Uniform => write!(f, "uniform"),
            DataSet::Zipf(theta) => write!(f, "zipf({})", theta),
            DataSet::File(name) => write!(f, "file({})", name),
        }
    }
}
