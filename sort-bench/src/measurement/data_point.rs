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

use crate::types::ArgAlgorithm;
use serde_derive::Serialize;

/// One benchmark run, flattened for the CSV output.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DataPoint {
    pub hostname: String,
    pub algorithm: Option<ArgAlgorithm>,
    pub data_set: Option<String>,
    pub tuples: Option<u64>,
    pub threads: Option<usize>,
    pub numa_nodes: Option<usize>,
    pub bits: Option<u32>,
    pub interleaved: Option<bool>,
    pub preallocated: Option<bool>,
    pub fudge: Option<f64>,
    pub block_size: Option<usize>,
    pub group_size: Option<usize>,
    /// `name=us` pairs of the engine's phase breakdown.
    pub phases: Option<String>,
    pub sort_us: Option<u64>,
    pub throughput_mrps: Option<f64>,
    pub destination_changed: Option<bool>,
}

impl DataPoint {
    pub fn new() -> std::io::Result<DataPoint> {
        let hostname = hostname::get()?
            .into_string()
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "hostname is not valid UTF-8",
                )
            })?;
        Ok(DataPoint {
            hostname,
            ..DataPoint::default()
        })
    }
}
