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

//! Facilities for storing and querying observations.
//!
//! The core of this module is the [`Backend`] trait, the fixed set of
//! capabilities the connection engine consumes. The engine owns all
//! socket I/O; a backend only ever sees decoded requests and writes
//! results into a [`Sink`].
//!
//! ## Key spaces and aggregation
//!
//! Both provided backends store every observation twice, under a
//! *forward* key ordered by name and an *inverted* key ordered by
//! answer data (see [`key`]). This lets a query in either direction
//! run as a prefix scan instead of a full scan. Repeated observations
//! are folded into one aggregate by a merge operator (see [`merge`])
//! rather than by read-modify-write, so concurrent writers never need
//! an application-level lock.
//!
//! The two key spaces are not updated atomically. A scan of the
//! inverted space can therefore find a key whose forward counterpart
//! does not (yet) exist; such *orphans* are skipped, counted, and
//! optionally logged according to the [`OrphanPolicy`].
//!
//! ## Provided backends
//!
//! * [`RocksBackend`] stores observations in a RocksDB database and
//!   uses RocksDB's merge operator and hot backups. This is what the
//!   daemon uses by default.
//! * [`MemoryBackend`] keeps the same key spaces in an ordered map. It
//!   is used in tests and for trying things out.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

use crate::entry::{Entry, EntryRef};
use crate::protocol::QueryRequest;

pub mod key;
mod memory;
pub mod merge;
mod query;
mod rocks;

pub use memory::MemoryBackend;
pub use rocks::{RocksBackend, RocksConfig};

////////////////////////////////////////////////////////////////////////
// BACKEND TRAIT                                                      //
////////////////////////////////////////////////////////////////////////

/// Trait for storage backends.
///
/// A backend is shared by every connection worker. Per-connection
/// state (such as scratch key buffers) lives in [`Backend::Conn`],
/// which is created when a connection is accepted and released when it
/// closes.
pub trait Backend: Send + Sync + 'static {
    /// Per-connection state.
    type Conn: Send;

    /// Creates the state for a newly accepted connection.
    fn conn_init(&self, peer: SocketAddr) -> Result<Self::Conn>;

    /// Releases the state of a closed connection. The engine calls this
    /// on every exit path, including errors, and drops `conn` right
    /// after.
    fn conn_deinit(&self, conn: &mut Self::Conn);

    /// Releases backend-wide resources once every connection is gone.
    fn teardown(&self);

    /// Runs `query`, pushing each match into `sink`. Returns the number
    /// of matches pushed.
    fn query(&self, conn: &mut Self::Conn, query: &QueryRequest, sink: &mut dyn Sink) -> Result<usize>;

    /// Merges one observation into the store.
    fn input(&self, conn: &mut Self::Conn, entry: &Entry) -> Result<()>;

    /// Writes a backup of the store to the directory at `path`.
    fn backup(&self, conn: &mut Self::Conn, path: &Path) -> Result<()>;

    /// Pushes every stored observation into `sink` in forward-key
    /// order. `hint` is the path the client asked for; it is only
    /// logged. Returns the number of observations pushed.
    fn dump(&self, conn: &mut Self::Conn, hint: &Path, sink: &mut dyn Sink) -> Result<u64>;
}

/// A destination for query and dump results.
pub trait Sink {
    fn push(&mut self, entry: &EntryRef) -> io::Result<()>;
}

impl Sink for Vec<Entry> {
    fn push(&mut self, entry: &EntryRef) -> io::Result<()> {
        Vec::push(self, entry.to_entry());
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////
// ORPHAN POLICY                                                      //
////////////////////////////////////////////////////////////////////////

/// What to do when an inverted key has no forward counterpart.
///
/// Orphans are always skipped and counted. The policy only decides
/// whether each one is also logged.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OrphanPolicy {
    #[default]
    Skip,
    Warn,
}

impl FromStr for OrphanPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "skip" => Ok(Self::Skip),
            "warn" => Ok(Self::Warn),
            _ => Err(format!("unknown orphan policy {:?} (expected \"skip\" or \"warn\")", s)),
        }
    }
}

impl fmt::Display for OrphanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Skip => f.write_str("skip"),
            Self::Warn => f.write_str("warn"),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that backend operations may return.
#[derive(Debug)]
pub enum Error {
    /// The storage engine failed.
    Storage(rocksdb::Error),

    /// An observation's fields would produce a key longer than
    /// [`key::MAX_KEY_LEN`].
    KeyTooLong(usize),

    /// An I/O error occurred while writing a backup.
    Io(io::Error),

    /// Pushing a result into the [`Sink`] failed. Unlike the other
    /// variants, this means the connection itself is broken.
    Sink(io::Error),
}

impl Error {
    /// Returns whether this error came from the result sink rather
    /// than from storage.
    pub fn is_sink(&self) -> bool {
        matches!(self, Self::Sink(_))
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Storage(err) => write!(f, "storage error: {}", err),
            Self::KeyTooLong(len) => write!(
                f,
                "key of {} octets exceeds the maximum of {}",
                len,
                key::MAX_KEY_LEN,
            ),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::Sink(err) => write!(f, "failed to write result: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            Self::Io(err) | Self::Sink(err) => Some(err),
            Self::KeyTooLong(_) => None,
        }
    }
}

/// A result type for backend operations.
pub type Result<T> = std::result::Result<T, Error>;
