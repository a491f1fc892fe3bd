// Copyright 2022 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! Implements command-line argument parsing.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{ArgAction, Parser};

use pdnsstore::db::OrphanPolicy;

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// The passive-DNS observation store daemon
#[derive(Debug, Parser)]
#[command(author, version)]
pub struct Args {
    /// Set the configuration file to use
    #[arg(
        long,
        value_name = "FILE",
        conflicts_with_all = [
            "bind", "ip", "port", "throttle", "database_path", "memory",
            "membudget", "parallelism", "max_log_file_size", "max_open_files",
            "keep_log_file_num", "orphan_policy", "stats_interval",
        ],
    )]
    pub config: Option<PathBuf>,

    /// Set the bind IP address and port
    #[arg(long, value_name = "IP:PORT")]
    pub bind: Option<SocketAddr>,

    /// Set the bind IP address
    #[arg(short = 'l', long, conflicts_with = "bind", value_name = "IP")]
    pub ip: Option<IpAddr>,

    /// Set the bind port
    #[arg(short, long, conflicts_with = "bind", value_name = "PORT")]
    pub port: Option<u16>,

    /// Set the maximum number of connections served at once
    #[arg(short = 'j', long, value_name = "N")]
    pub throttle: Option<usize>,

    /// Set the RocksDB database directory
    #[arg(short, long, value_name = "DIR")]
    pub database_path: Option<PathBuf>,

    /// Keep observations in memory instead of RocksDB
    #[arg(long, conflicts_with_all = [
        "database_path", "membudget", "parallelism", "max_log_file_size",
        "max_open_files", "keep_log_file_num",
    ])]
    pub memory: bool,

    /// Set the RocksDB compaction memory budget in octets
    #[arg(long, value_name = "OCTETS")]
    pub membudget: Option<usize>,

    /// Set the number of RocksDB background threads
    #[arg(long, value_name = "N")]
    pub parallelism: Option<i32>,

    /// Set the maximum size of a RocksDB info log file in octets
    #[arg(long, value_name = "OCTETS")]
    pub max_log_file_size: Option<usize>,

    /// Set the maximum number of files RocksDB keeps open
    #[arg(long, value_name = "N")]
    pub max_open_files: Option<i32>,

    /// Set the number of RocksDB info log files to keep
    #[arg(long, value_name = "N")]
    pub keep_log_file_num: Option<usize>,

    /// Set whether orphaned inverted keys are logged ("skip" or "warn")
    #[arg(long, value_name = "POLICY")]
    pub orphan_policy: Option<OrphanPolicy>,

    /// Set the stats reporting interval in seconds (0 disables it)
    #[arg(long, value_name = "SECONDS")]
    pub stats_interval: Option<u64>,

    /// Increase logging verbosity (may be repeated)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Do not install signal handlers
    #[arg(short = 'S', long)]
    pub no_signals: bool,

    /// Do not run the stats reporter
    #[arg(short = 'R', long)]
    pub no_stats: bool,
}
