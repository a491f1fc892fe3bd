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

//! Worker groups with cooperative shutdown.

use std::fmt;
use std::io;
use std::mem::drop;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use log::{error, warn};

////////////////////////////////////////////////////////////////////////
// WORKER GROUPS                                                      //
////////////////////////////////////////////////////////////////////////

/// A group of worker threads managed together.
///
/// A `WorkerGroup` starts one-shot worker threads (see
/// [`WorkerGroup::start_worker`]) and keeps count of how many are
/// still running. The count is what the connection engine compares
/// against its throttle limit.
///
/// A `WorkerGroup` is stopped through [`WorkerGroup::shut_down`]. No
/// new workers can be started once shutdown is initiated. Shutdown is
/// cooperative: nothing is cancelled preemptively. Long-running tasks
/// should hold an [`Arc`] reference to the group and check
/// [`WorkerGroup::is_shutting_down`] at their poll points.
/// [`WorkerGroup::await_shutdown`] waits for every worker to exit.
///
/// Each engine owns its own group, so several engines can run in the
/// same process (as they do in tests).
pub struct WorkerGroup {
    records: Mutex<GroupRecords>,

    /// Allows threads to wait for group events. This is used with the
    /// `records` mutex. All waiting threads are notified when (1)
    /// shutdown is initiated and (2) a worker exits.
    wakeup: Condvar,
}

/// The internal records of a [`WorkerGroup`].
#[derive(Default)]
struct GroupRecords {
    active: usize,
    shutting_down: bool,
}

impl WorkerGroup {
    /// Creates a new worker group.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(GroupRecords::default()),
            wakeup: Condvar::new(),
        })
    }

    /// Starts a one-shot worker thread in the `WorkerGroup`. The thread
    /// executes `task` once and is counted as active until it exits or
    /// panics.
    pub fn start_worker<F>(self: &Arc<Self>, name: Option<String>, task: F) -> Result<(), Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut records = self.records.lock().unwrap();
        if records.shutting_down {
            Err(Error::ShuttingDown)
        } else {
            start_worker(self.clone(), &mut records, name, task).map_err(Into::into)
        }
    }

    /// Requests shutdown of the `WorkerGroup`. This is idempotent.
    pub fn shut_down(&self) {
        let mut records = self.records.lock().unwrap();
        records.shutting_down = true;
        self.wakeup.notify_all();
    }

    /// Returns whether the `WorkerGroup` is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        self.records.lock().unwrap().shutting_down
    }

    /// Returns the number of workers that have not yet exited.
    pub fn active_workers(&self) -> usize {
        self.records.lock().unwrap().active
    }

    /// Sleeps for up to `duration`, returning early if shutdown is
    /// initiated. Returns whether the group is shutting down.
    pub fn sleep(&self, duration: Duration) -> bool {
        let records = self.records.lock().unwrap();
        let (records, _) = self
            .wakeup
            .wait_timeout_while(records, duration, |r| !r.shutting_down)
            .unwrap();
        records.shutting_down
    }

    /// Waits for the `WorkerGroup` to shut down. This is defined as (1)
    /// shutdown having been initiated ([`WorkerGroup::shut_down`]) and
    /// (2) the active worker count having dropped to zero. While
    /// workers remain, a warning is logged every `poll_interval`.
    ///
    /// If this is called from a worker within the group, a deadlock
    /// will occur (since the count will never become zero).
    pub fn await_shutdown(&self, poll_interval: Duration) {
        let mut records = self.records.lock().unwrap();
        while !records.shutting_down || records.active > 0 {
            if records.shutting_down {
                warn!("Waiting for {} worker(s) to exit", records.active);
            }
            records = self
                .wakeup
                .wait_timeout(records, poll_interval)
                .unwrap()
                .0;
        }
    }
}

/// A handle to be owned by a worker thread. When dropped (when the
/// thread exits or panics), it decrements the active count (see
/// [`end_worker`]).
struct WorkerHandle {
    group: Arc<WorkerGroup>,
    parent: ThreadId,
}

/// The implementation of worker thread creation.
fn start_worker<F>(
    group: Arc<WorkerGroup>,
    records: &mut MutexGuard<GroupRecords>,
    name: Option<String>,
    task: F,
) -> io::Result<()>
where
    F: FnOnce() + Send + 'static,
{
    records.active += 1;
    let handle = WorkerHandle {
        group,
        parent: thread::current().id(),
    };
    let result = thread::Builder::new()
        .name(name.unwrap_or_else(|| "anonymous".to_owned()))
        .spawn(move || {
            task();
            drop(handle);
        });
    if result.is_err() {
        records.active -= 1;
    }
    result.and(Ok(()))
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let current_thread = thread::current();

        // If we are being dropped in the parent thread, then the new
        // thread failed to start (on the OS level). In this case,
        // start_worker handles the count itself, and the records mutex
        // is already held by this thread.
        if current_thread.id() == self.parent {
            return;
        }

        if thread::panicking() {
            let thread_name = current_thread.name().unwrap_or("anonymous");
            error!("Worker thread {} panicked", thread_name);
        }

        let mut records = self.group.records.lock().unwrap();
        end_worker(&mut records, &self.group.wakeup);
    }
}

/// Performs clean-up actions when a worker exits.
fn end_worker(records: &mut MutexGuard<GroupRecords>, wakeup: &Condvar) {
    records.active -= 1;
    wakeup.notify_all();
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// An error that occurs when starting a worker.
#[derive(Debug)]
pub enum Error {
    /// An OS-level error occurred during the creation of a thread.
    Io(io::Error),

    /// The [`WorkerGroup`] is shutting down.
    ShuttingDown,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Io(err) => err.fmt(f),
            Self::ShuttingDown => f.write_str("worker group is shutting down"),
        }
    }
}

impl std::error::Error for Error {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
