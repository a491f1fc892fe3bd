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

//! Engine activity counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};

use crate::thread::{self, WorkerGroup};

/// Monotonic counters shared by every connection worker.
///
/// Counters are updated with relaxed atomic adds. A [`StatsSnapshot`]
/// taken while workers are running is therefore not a consistent cut
/// across counters, which is fine for reporting.
#[derive(Debug, Default)]
pub struct Stats {
    pub(super) queries: AtomicU64,
    pub(super) inputs: AtomicU64,
    pub(super) backups: AtomicU64,
    pub(super) dumps: AtomicU64,
    pub(super) bytes_in: AtomicU64,
    pub(super) bytes_out: AtomicU64,
    pub(super) connections: AtomicU64,
    pub(super) errors: AtomicU64,
}

/// A point-in-time copy of [`Stats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StatsSnapshot {
    pub queries: u64,
    pub inputs: u64,
    pub backups: u64,
    pub dumps: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
    pub errors: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a snapshot of the counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            queries: load(&self.queries),
            inputs: load(&self.inputs),
            backups: load(&self.backups),
            dumps: load(&self.dumps),
            bytes_in: load(&self.bytes_in),
            bytes_out: load(&self.bytes_out),
            connections: load(&self.connections),
            errors: load(&self.errors),
        }
    }
}

/// Adds `n` to `counter`.
pub(super) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "connections={} queries={} inputs={} backups={} dumps={} bytes_in={} bytes_out={} errors={}",
            self.connections,
            self.queries,
            self.inputs,
            self.backups,
            self.dumps,
            self.bytes_in,
            self.bytes_out,
            self.errors,
        )
    }
}

/// Starts a worker in `group` that logs a snapshot of `stats` every
/// `interval` until the group shuts down.
pub fn start_reporter(
    group: &Arc<WorkerGroup>,
    stats: Arc<Stats>,
    interval: Duration,
) -> Result<(), thread::Error> {
    let group_cloned = group.clone();
    group.start_worker(Some("stats".to_owned()), move || {
        while !group_cloned.sleep(interval) {
            info!("Stats: {}", stats.snapshot());
        }
        debug!("Stats reporter exiting");
    })
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
