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

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{ArgAction, Args as ClapArgs, Parser, Subcommand};

/// Parses the command line arguments.
pub fn parse() -> Args {
    Args::parse()
}

/// Tooling for the passive-DNS observation store
#[derive(Debug, Parser)]
#[command(author, version)]
pub struct Args {
    /// Increase logging verbosity (may be repeated)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Convert a dump file to JSON lines
    Jsonize {
        /// The dump file to read (standard input if omitted)
        #[arg(value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Request a dump from a running store and write it to standard
    /// output as dump records
    Dump {
        #[command(flatten)]
        remote: Remote,

        /// The path hint sent to the store
        #[arg(long, default_value = "-", value_name = "PATH")]
        hint: String,
    },

    /// Send the contents of a dump file to a running store as input
    Replay {
        #[command(flatten)]
        remote: Remote,

        /// The number of observations per input request
        #[arg(long, default_value_t = 500, value_name = "N")]
        batch: usize,

        /// The dump file to read (standard input if omitted)
        #[arg(value_name = "FILE")]
        input: Option<PathBuf>,
    },

    /// Query a running store and print the results as JSON lines
    Query {
        #[command(flatten)]
        remote: Remote,

        #[arg(long)]
        rrname: Option<String>,

        #[arg(long)]
        rrtype: Option<String>,

        #[arg(long)]
        rdata: Option<String>,

        #[arg(long)]
        sensor_id: Option<String>,

        /// The maximum number of results
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Ask a running store to back itself up
    Backup {
        #[command(flatten)]
        remote: Remote,

        /// The backup directory, on the store's host
        #[arg(value_name = "DIR")]
        path: String,
    },
}

/// The address of a running store.
#[derive(Debug, ClapArgs)]
pub struct Remote {
    /// The store's IP address and port
    #[arg(long, default_value = "127.0.0.1:4242", value_name = "IP:PORT")]
    pub store: SocketAddr,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn query_flags_are_parsed() {
        let args = Args::try_parse_from([
            "pdnsstore-console",
            "query",
            "--store",
            "10.0.0.1:4000",
            "--rdata",
            "1.2.3.4",
            "--limit",
            "5",
        ])
        .unwrap();
        match args.command {
            Command::Query {
                remote,
                rrname,
                rdata,
                limit,
                ..
            } => {
                assert_eq!(remote.store, "10.0.0.1:4000".parse().unwrap());
                assert_eq!(rrname, None);
                assert_eq!(rdata.as_deref(), Some("1.2.3.4"));
                assert_eq!(limit, 5);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
