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

//! Implements running the daemon.

use std::fmt::Write;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use env_logger::Env;
use log::{error, info, warn};
use signal_hook::consts::signal::{SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};

use pdnsstore::db::{Backend, MemoryBackend, RocksBackend, RocksConfig};
use pdnsstore::engine::{start_reporter, Engine};
use pdnsstore::thread::WorkerGroup;

use crate::args::Args;
use crate::config::{self, BackendConfig, Config};

/// Runs the daemon.
pub fn run(args: Args) {
    let default_filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::init_from_env(Env::new().default_filter_or(default_filter));

    if let Err(e) = try_running(args) {
        let mut message = String::from("Failed to run:");
        for (i, cause) in e.chain().enumerate() {
            write!(message, "\n[{}] {}", i + 1, cause).unwrap();
        }
        message.push_str("\nExiting with failure.");
        error!("{}", message);
        process::exit(1);
    }
    info!("Exiting with success.");
}

fn try_running(args: Args) -> Result<()> {
    info!(
        "pdnsstored v{}.{}.{} starting.",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR"),
        env!("CARGO_PKG_VERSION_PATCH"),
    );

    let config = if let Some(ref config_path) = args.config {
        info!("Loading the configuration from {}.", config_path.display());
        config::load_from_path(config_path).context("failed to load the configuration")?
    } else {
        info!("Loading the configuration from the command line.");
        config::load_from_args(&args)
    };

    match config.backend {
        BackendConfig::RocksDb(ref rocks_config) => {
            let backend = RocksBackend::open(&RocksConfig::from(rocks_config))
                .context("failed to open the RocksDB database")?;
            serve(&config, &args, Arc::new(backend))
        }
        BackendConfig::Memory(ref memory_config) => {
            warn!("Using the in-memory backend; observations are lost on exit.");
            let backend = MemoryBackend::new(memory_config.orphan_policy.0);
            serve(&config, &args, Arc::new(backend))
        }
    }
}

fn serve<B: Backend>(config: &Config, args: &Args, backend: Arc<B>) -> Result<()> {
    let group = WorkerGroup::new();
    let engine = Engine::bind(config.bind, backend, group.clone(), config.engine_config())
        .with_context(|| format!("failed to bind {}", config.bind))?;

    if !args.no_stats && config.stats_interval > 0 {
        let interval = Duration::from_secs(config.stats_interval);
        start_reporter(&group, engine.stats().clone(), interval)
            .context("failed to start the stats reporter")?;
    }

    let signals = if args.no_signals {
        None
    } else {
        Some(start_signal_listener(&group).context("failed to set up signal handling")?)
    };

    info!("Set-up is complete; accepting connections.");
    engine.run();

    // The engine may have stopped on its own; release the listener.
    if let Some((handle, listener)) = signals {
        handle.close();
        if listener.join().is_err() {
            warn!("The signal listener panicked.");
        }
    }
    info!("Final stats: {}", engine.stats().snapshot());
    Ok(())
}

/// Starts a thread that stops the engine on the first termination
/// signal. A second termination signal exits immediately.
fn start_signal_listener(group: &Arc<WorkerGroup>) -> Result<(Handle, JoinHandle<()>)> {
    let term_signals = &[SIGINT, SIGTERM, SIGQUIT];
    let already_terminating = Arc::new(AtomicBool::new(false));
    for sig in term_signals {
        signal_hook::flag::register_conditional_shutdown(*sig, 1, already_terminating.clone())?;
        signal_hook::flag::register(*sig, already_terminating.clone())?;
    }

    let mut signals = Signals::new(term_signals)?;
    let handle = signals.handle();
    let group = group.clone();
    let listener = thread::Builder::new()
        .name("signals".to_owned())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                let name = match signal {
                    SIGINT => "SIGINT",
                    SIGTERM => "SIGTERM",
                    SIGQUIT => "SIGQUIT",
                    _ => unreachable!(),
                };
                info!("Received {}; shutting down.", name);
                group.shut_down();
            }
        })?;
    Ok((handle, listener))
}
