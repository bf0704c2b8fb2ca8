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

//! Measurement output: the stderr report and the CSV appender.

use super::data_point::DataPoint;
use sort_ops::PhaseTimes;
use std::fs::OpenOptions;
use std::path::Path;

/// Appends one data point; writes the header only when the file is new.
pub fn write_csv(path: &Path, dp: &DataPoint) -> Result<(), Box<dyn std::error::Error>> {
    let new_file = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(new_file)
        .from_writer(file);
    writer.serialize(dp)?;
    writer.flush()?;
    Ok(())
}

/// Phase breakdown with percentages, in the engine's phase order.
pub fn print_phase_report(times: &PhaseTimes, sort_us: u64) {
    let total = times.total_us().max(1);
    for (name, us) in &times.0 {
        eprintln!(
            "{:<22} {:>10} us ({:>5.2}%)",
            format!("{}:", name),
            us,
            *us as f64 * 100.0 / total as f64
        );
    }
    eprintln!(
        "Noise time loss: {:.2}%",
        sort_us as f64 * 100.0 / total as f64 - 100.0
    );
}

/// `name=us` pairs for the CSV column.
pub fn phases_column(times: &PhaseTimes) -> String {
    times
        .0
        .iter()
        .map(|(name, us)| format!("{}={}", name, us))
        .collect::<Vec<_>>()
        .join(";")
}
