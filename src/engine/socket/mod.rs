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

//! Target-specific socket readiness polling.
//!
//! The engine never blocks in `accept`, `read` or `write` without first
//! polling with a timeout, so that it can notice a stop request and so
//! that a stalled peer cannot hold a worker forever. The standard
//! library offers no way to do this, so on Unix targets we use
//! `poll(2)` through [`nix`](https://docs.rs/nix). Elsewhere the poll
//! methods report readiness immediately and
//! [`POLL_WORKS`](Pollable::POLL_WORKS) is `false`; the engine then
//! falls back to blocking accepts and socket-level timeouts.

use std::io;
use std::time::Duration;

/// Readiness polling for sockets.
pub(crate) trait Pollable {
    /// Whether this target has functional polling.
    const POLL_WORKS: bool;

    /// Blocks until the socket is readable (or has a connection to
    /// accept), the timeout expires, or the call is interrupted.
    /// Returns whether the socket is ready.
    fn poll_readable(&self, timeout: Duration) -> io::Result<bool>;

    /// Like [`Pollable::poll_readable`], but waits for writability.
    fn poll_writable(&self, timeout: Duration) -> io::Result<bool>;
}

#[cfg_attr(unix, path = "unix.rs")]
#[cfg_attr(not(unix), path = "std.rs")]
mod poll_impl;

/// Whether this target has functional socket polling.
pub const POLL_WORKS: bool = <std::net::TcpStream as Pollable>::POLL_WORKS;
