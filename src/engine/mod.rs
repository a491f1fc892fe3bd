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

//! The connection engine.
//!
//! The [`Engine`] owns the listening socket and all connection I/O. It
//! runs an accept loop on the caller's thread and serves each accepted
//! connection on its own worker thread in a [`WorkerGroup`]. A worker
//! repeatedly reads one message, dispatches it to the [`Backend`], and
//! writes any response, until the peer closes the connection, a fault
//! occurs, or the group shuts down.
//!
//! # Stopping
//!
//! Stopping is cooperative. Shutting down the engine's [`WorkerGroup`]
//! is the stop request: the accept loop notices it within the accept
//! timeout, and each worker notices it before its next read or within
//! its read timeout while waiting for data. [`Engine::run`] then waits
//! for every worker to exit and tears down the backend.
//!
//! # Throttling
//!
//! When the number of active connections reaches the throttle limit,
//! the accept loop stops accepting and backs off until a connection
//! closes. Peers are never refused; excess connections simply wait in
//! the listen backlog.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use self::socket::{Pollable, POLL_WORKS};
use self::stats::bump;
use crate::db::Backend;
use crate::protocol::Limits;
use crate::thread::{self, WorkerGroup};

mod conn;
mod socket;
mod stats;

pub use stats::{start_reporter, Stats, StatsSnapshot};

/// How often [`Engine::run`] reports on workers that have not exited
/// yet after a stop request.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Tuning options for the [`Engine`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EngineConfig {
    /// The maximum number of connections served at once.
    pub throttle: usize,

    /// The maximum time the accept loop blocks before checking for a
    /// stop request again.
    pub accept_timeout: Duration,

    /// The maximum time a worker blocks waiting for data before
    /// checking for a stop request again. Idle connections are kept.
    pub read_timeout: Duration,

    /// The maximum time a worker waits for a peer to accept response
    /// data. A peer that stalls longer loses its connection.
    pub write_timeout: Duration,

    /// How long the accept loop sleeps when the throttle is reached.
    pub throttle_backoff: Duration,

    /// Resource bounds on decoded messages.
    pub limits: Limits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            throttle: 64,
            accept_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(30),
            throttle_backoff: Duration::from_secs(1),
            limits: Limits::default(),
        }
    }
}

/// State shared by the accept loop and every connection worker.
struct Shared<B> {
    backend: Arc<B>,
    group: Arc<WorkerGroup>,
    stats: Arc<Stats>,
    active: Arc<AtomicUsize>,
    config: EngineConfig,
}

/// A TCP server answering protocol messages from a [`Backend`].
pub struct Engine<B> {
    listener: TcpListener,
    shared: Arc<Shared<B>>,
}

impl<B: Backend> Engine<B> {
    /// Binds the listening socket. Connections are not accepted until
    /// [`Engine::run`] is called.
    pub fn bind(
        addr: SocketAddr,
        backend: Arc<B>,
        group: Arc<WorkerGroup>,
        config: EngineConfig,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        if POLL_WORKS {
            listener.set_nonblocking(true)?;
        }
        info!("Listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                backend,
                group,
                stats: Arc::new(Stats::new()),
                active: Arc::new(AtomicUsize::new(0)),
                config,
            }),
        })
    }

    /// Returns the address the engine is listening on.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the worker group. Shutting it down stops the engine.
    pub fn group(&self) -> &Arc<WorkerGroup> {
        &self.shared.group
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.shared.stats
    }

    /// Returns the number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.shared.active.load(Ordering::Relaxed)
    }

    /// Runs the accept loop until the worker group shuts down or
    /// accepting fails, then waits for every worker to exit and tears
    /// down the backend.
    ///
    /// This must not be called from a worker of the engine's own
    /// group, since it waits for that group to empty.
    pub fn run(&self) {
        if let Err(e) = self.accept_loop() {
            error!("Failed to accept connections: {}", e);
            self.shared.group.shut_down();
        }
        info!("Stopping; waiting for connections to close");
        self.shared.group.await_shutdown(SHUTDOWN_POLL_INTERVAL);
        self.shared.backend.teardown();
        info!("Stopped");
    }

    fn accept_loop(&self) -> io::Result<()> {
        let shared = &self.shared;
        let config = &shared.config;
        loop {
            if shared.group.is_shutting_down() {
                return Ok(());
            }

            let active = shared.active.load(Ordering::Relaxed);
            if active >= config.throttle {
                warn!(
                    "Serving {} connections (throttle {}); backing off",
                    active, config.throttle
                );
                shared.group.sleep(config.throttle_backoff);
                continue;
            }

            // poll_readable returns false on timeout or interruption.
            // Where polling does not work, it returns true immediately
            // and the accept below blocks.
            if !self.listener.poll_readable(config.accept_timeout)? {
                continue;
            }
            let (stream, peer) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            bump(&shared.stats.connections, 1);

            let admission = Admission::new(&shared.active);
            let shared_cloned = shared.clone();
            let task = move || conn::serve(&shared_cloned, admission, stream, peer);
            match shared.group.start_worker(Some(format!("conn {}", peer)), task) {
                Ok(()) => (),
                Err(thread::Error::ShuttingDown) => return Ok(()),
                Err(thread::Error::Io(e)) => {
                    // The connection was dropped along with the task.
                    error!("Failed to start worker for {}: {}", peer, e);
                }
            }
        }
    }
}

/// Counts a connection as active for as long as it lives.
struct Admission(Arc<AtomicUsize>);

impl Admission {
    fn new(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(active.clone())
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
