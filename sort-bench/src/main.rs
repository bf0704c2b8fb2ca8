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

//! Benchmark driver: generates or loads per-node key/payload arrays, runs
//! one of the two sort variants, reports per-phase timings, and checks the
//! output against the generator's checksum.

mod measurement;
mod types;
mod verify;

use crate::measurement::data_point::DataPoint;
use crate::measurement::harness;
use crate::types::{ArgAlgorithm, DataSet};
use datagen::relation::{UniformRelation, ZipfRelation};
use numa_cpu::runtime::allocator::{Allocator, MemType};
use numa_cpu::runtime::cpu_affinity;
use numa_cpu::runtime::hw_info::HwTopology;
use numa_cpu::runtime::memory::DerefMem;
use numa_cpu::runtime::topology::ChipletLayout;
use sort_ops::{lsb, range};
use sort_ops::{DestinationParity, NodeArrays, ScratchArrays, SortConfig};
use std::error::Error;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;
use structopt::StructOpt;
use tracing::info;

#[derive(StructOpt, Debug)]
#[structopt(
    name = "numa-sort",
    about = "Sorts billions of 64-bit key/payload tuples across NUMA nodes"
)]
struct CmdOpt {
    /// Millions of tuples to sort
    #[structopt(default_value = "1000")]
    tuples_millions: u64,

    /// Worker threads; defaults to all hardware threads
    threads: Option<usize>,

    /// NUMA nodes to spread the data over; defaults to all nodes
    numa: Option<usize>,

    /// Significant key bits (1..=64)
    #[structopt(default_value = "64")]
    bits: u32,

    /// Interleave buffer allocations over all nodes (0|1)
    #[structopt(default_value = "0")]
    interleaved: u8,

    /// Preallocate the scratch buffers before the sort (0|1)
    #[structopt(default_value = "1")]
    preallocated: u8,

    /// Zipf exponent (leading digit) or a raw little-endian u64 key file
    theta_or_file: Option<String>,

    /// Sort orchestration to benchmark
    #[structopt(
        long,
        default_value = "RangeCmp",
        possible_values = &ArgAlgorithm::variants(),
        case_insensitive = true
    )]
    algorithm: ArgAlgorithm,

    /// Output filename for the measurement CSV file
    #[structopt(long, parse(from_os_str))]
    csv: Option<PathBuf>,

    /// Per-node capacity overcommit factor
    #[structopt(long, default_value = "1.1")]
    fudge: f64,

    /// Chiplet repetition block, in cores
    #[structopt(long, default_value = "128")]
    block_size: usize,

    /// Cores per chiplet
    #[structopt(long, default_value = "16")]
    group_size: usize,

    /// Fixed seed for reproducible runs
    #[structopt(long)]
    seed: Option<u64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cmd = CmdOpt::from_args();
    let hw = HwTopology::get();
    let threads = cmd.threads.unwrap_or(hw.threads);
    let numa = cmd.numa.unwrap_or(hw.numa_nodes);
    let tuples = cmd
        .tuples_millions
        .checked_mul(1_000_000)
        .ok_or("tuple count overflows")? as usize;

    if cmd.bits == 0 || cmd.bits > 64 {
        return Err(format!("bits must be in 1..=64, got {}", cmd.bits).into());
    }
    if numa == 0 || threads < numa || threads % numa != 0 {
        return Err(format!(
            "threads ({}) must be a positive multiple of NUMA nodes ({})",
            threads, numa
        )
        .into());
    }
    let interleaved = cmd.interleaved != 0;
    let preallocated = cmd.preallocated != 0;

    let data_set = match &cmd.theta_or_file {
        None => DataSet::Uniform,
        Some(arg) => {
            if cmd.bits != 64 {
                return Err("custom data sets require bits = 64".into());
            }
            match arg.chars().next() {
                Some(c) if c.is_ascii_digit() => DataSet::Zipf(arg.parse::<f64>()?),
                _ => DataSet::File(arg.clone()),
            }
        }
    };

    eprintln!(
        "Tuples: {:.2} mil. ({:.1} GB)",
        tuples as f64 / 1e6,
        tuples as f64 * 16.0 / (1u64 << 30) as f64
    );
    eprintln!("NUMA nodes: {}", numa);
    eprintln!(
        "Memory {}",
        if interleaved { "interleaved" } else { "bound" }
    );
    eprintln!(
        "Buffers {}",
        if preallocated {
            "pre-allocated"
        } else {
            "not pre-allocated"
        }
    );
    eprintln!(
        "Hardware threads: {} ({} per NUMA)",
        hw.threads,
        hw.threads_per_node()
    );
    eprintln!("Threads: {} ({} per NUMA)", threads, threads / numa);
    eprintln!("Sorting bits: {}", cmd.bits);
    if let Ok(codename) = numa_cpu::runtime::hw_info::cpu_codename() {
        info!("cpu: {}", codename);
    }

    // Per-node sizes and fudged capacities; the last node takes the slack.
    let per_node = tuples / numa;
    let sizes: Vec<usize> = (0..numa)
        .map(|n| {
            if n + 1 == numa {
                tuples - per_node * (numa - 1)
            } else {
                per_node
            }
        })
        .collect();
    let caps: Vec<usize> = sizes.iter().map(|&s| (s as f64 * cmd.fudge) as usize).collect();
    let mem_type = |node: usize| {
        if interleaved {
            MemType::NumaInterleavedMem { nodes: numa }
        } else {
            MemType::NumaMem { node: node as u16 }
        }
    };

    let gen_start = Instant::now();
    let mut keys: Vec<DerefMem<u64>> = Vec::with_capacity(numa);
    let mut payloads: Vec<DerefMem<u64>> = Vec::with_capacity(numa);
    for n in 0..numa {
        keys.push(Allocator::alloc_deref_mem(mem_type(n), caps[n])?);
        payloads.push(Allocator::alloc_deref_mem(mem_type(n), caps[n])?);
    }

    let seed = cmd.seed.unwrap_or_else(rand_seed);
    let mut sum_k = 0u64;
    let mut same_key_payload = true;
    match &data_set {
        DataSet::Uniform => {
            for n in 0..numa {
                let s =
                    UniformRelation::gen_attr_par(&mut keys[n][..sizes[n]], cmd.bits, seed ^ n as u64)?;
                sum_k = sum_k.wrapping_add(s);
                let (k, p) = (&keys[n][..sizes[n]], &mut payloads[n][..sizes[n]]);
                p.copy_from_slice(k);
            }
        }
        DataSet::Zipf(theta) => {
            same_key_payload = false;
            eprintln!("Generating zipfian with theta = {:.2}", theta);
            for n in 0..numa {
                let s = ZipfRelation::gen_attr_par(
                    &mut keys[n][..sizes[n]],
                    tuples as u64,
                    *theta,
                    seed ^ n as u64,
                )?;
                sum_k = sum_k.wrapping_add(s);
                UniformRelation::gen_attr_par(&mut payloads[n][..sizes[n]], 64, seed ^ (n as u64) << 8)?;
            }
        }
        DataSet::File(name) => {
            same_key_payload = false;
            eprintln!("Opening file: {}", name);
            let mut file = File::open(name)?;
            for n in 0..numa {
                // Pin the loader so the pages fault in node-locally.
                cpu_affinity::bind_to_node(n);
                let s = datagen::file::read_node_keys(&mut file, &mut keys[n][..sizes[n]])?;
                sum_k = sum_k.wrapping_add(s);
                UniformRelation::gen_attr_par(&mut payloads[n][..sizes[n]], 64, seed ^ (n as u64) << 8)?;
            }
            cpu_affinity::unbind_memory();
        }
    }
    let gen_us = gen_start.elapsed().as_micros() as u64;
    eprintln!("Generation time: {} us", gen_us);
    eprintln!("Generation rate: {:.1} mrps", tuples as f64 / gen_us.max(1) as f64);

    // Scratch buffers for the preallocated mode; the range variant also
    // needs the per-tuple tag array.
    let need_ranges = cmd.algorithm == ArgAlgorithm::RangeCmp;
    let (mut keys_buf, mut payloads_buf, mut ranges): (
        Vec<DerefMem<u64>>,
        Vec<DerefMem<u64>>,
        Vec<DerefMem<u16>>,
    ) = (Vec::new(), Vec::new(), Vec::new());
    if preallocated {
        for n in 0..numa {
            keys_buf.push(Allocator::alloc_deref_mem(mem_type(n), caps[n])?);
            payloads_buf.push(Allocator::alloc_deref_mem(mem_type(n), caps[n])?);
            if need_ranges {
                ranges.push(Allocator::alloc_deref_mem(mem_type(n), caps[n])?);
            }
        }
    }

    let cfg = SortConfig {
        threads,
        numa,
        bits: cmd.bits,
        fudge: cmd.fudge,
        interleaved,
        chiplet: ChipletLayout::new(cmd.block_size, cmd.group_size)?,
        seed: cmd.seed,
        ..SortConfig::default()
    };

    let mut input = NodeArrays {
        keys: keys.iter_mut().map(|b| &mut b[..]).collect(),
        payloads: payloads.iter_mut().map(|b| &mut b[..]).collect(),
        sizes: sizes.clone(),
        scratch: if preallocated {
            Some(ScratchArrays {
                keys_buf: keys_buf.iter_mut().map(|b| &mut b[..]).collect(),
                payloads_buf: payloads_buf.iter_mut().map(|b| &mut b[..]).collect(),
                ranges: ranges.iter_mut().map(|b| &mut b[..]).collect(),
            })
        } else {
            None
        },
    };

    let sort_start = Instant::now();
    let out = match cmd.algorithm {
        ArgAlgorithm::RangeCmp => range::sort(&mut input, &cfg)?,
        ArgAlgorithm::LsbRadix => lsb::sort(&mut input, &cfg)?,
    };
    let sort_us = sort_start.elapsed().as_micros() as u64;
    drop(input);

    let gigs = tuples as f64 * 16.0 / (1u64 << 30) as f64;
    let mrps = tuples as f64 / sort_us.max(1) as f64;
    eprintln!("Sort time: {} us", sort_us);
    eprintln!(
        "Sort rate: {:.1} mrps ({:.2} GB / sec)",
        mrps,
        gigs * 1e6 / sort_us.max(1) as f64
    );
    harness::print_phase_report(&out.times, sort_us);
    for (n, &size) in out.node_sizes.iter().enumerate() {
        eprintln!("Node {}: {:>6.2}%", n, size as f64 * 100.0 / tuples as f64);
    }
    match out.parity {
        DestinationParity::Scratch => eprintln!("Destination changed"),
        DestinationParity::Primary => eprintln!("Destination remained the same"),
    }

    // Sanity check the output where it actually ended up.
    let (res_keys, res_payloads): (Vec<&[u64]>, Vec<&[u64]>) = match out.parity {
        DestinationParity::Primary => (
            keys.iter()
                .zip(out.node_sizes.iter())
                .map(|(b, &s)| &b[..s])
                .collect(),
            payloads
                .iter()
                .zip(out.node_sizes.iter())
                .map(|(b, &s)| &b[..s])
                .collect(),
        ),
        DestinationParity::Scratch => {
            if preallocated {
                (
                    keys_buf
                        .iter()
                        .zip(out.node_sizes.iter())
                        .map(|(b, &s)| &b[..s])
                        .collect(),
                    payloads_buf
                        .iter()
                        .zip(out.node_sizes.iter())
                        .map(|(b, &s)| &b[..s])
                        .collect(),
                )
            } else {
                let owned = out
                    .owned_scratch
                    .as_ref()
                    .ok_or("engine did not return its scratch")?;
                (
                    owned
                        .keys_buf
                        .iter()
                        .zip(out.node_sizes.iter())
                        .map(|(b, &s)| &b[..s])
                        .collect(),
                    owned
                        .payloads_buf
                        .iter()
                        .zip(out.node_sizes.iter())
                        .map(|(b, &s)| &b[..s])
                        .collect(),
                )
            }
        }
    };

    let checksum = verify::check_sorted(&res_keys, &res_payloads, same_key_payload)?;
    if checksum != sum_k {
        return Err(format!(
            "key checksum mismatch: generated {:#x}, sorted {:#x}",
            sum_k, checksum
        )
        .into());
    }

    println!(
        "{:.1} mrps ({:.2} GB / sec)",
        mrps,
        gigs * 1e6 / sort_us.max(1) as f64
    );

    if let Some(csv) = &cmd.csv {
        let mut dp = DataPoint::new()?;
        dp.algorithm = Some(cmd.algorithm);
        dp.data_set = Some(data_set.to_string());
        dp.tuples = Some(tuples as u64);
        dp.threads = Some(threads);
        dp.numa_nodes = Some(numa);
        dp.bits = Some(cmd.bits);
        dp.interleaved = Some(interleaved);
        dp.preallocated = Some(preallocated);
        dp.fudge = Some(cmd.fudge);
        dp.block_size = Some(cmd.block_size);
        dp.group_size = Some(cmd.group_size);
        dp.phases = Some(harness::phases_column(&out.times));
        dp.sort_us = Some(sort_us);
        dp.throughput_mrps = Some(mrps);
        dp.destination_changed = Some(out.parity == DestinationParity::Scratch);
        harness::write_csv(csv, &dp)?;
    }

    Ok(())
}

/// Seed from the wall clock, like a benchmark run wants when none is given.
fn rand_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
