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

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use super::Pollable;

fn poll_fd(fd: RawFd, flags: PollFlags, timeout: Duration) -> io::Result<bool> {
    let millis = timeout.as_millis().try_into().unwrap_or(i32::MAX);
    let mut poll_fds = [PollFd::new(fd, flags)];
    poll(&mut poll_fds, millis).map(|n| n > 0).or_else(|e| {
        if e == Errno::EINTR {
            Ok(false)
        } else {
            Err(e.into())
        }
    })
}

impl Pollable for TcpListener {
    const POLL_WORKS: bool = true;

    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        poll_fd(self.as_raw_fd(), PollFlags::POLLIN, timeout)
    }

    fn poll_writable(&self, timeout: Duration) -> io::Result<bool> {
        poll_fd(self.as_raw_fd(), PollFlags::POLLOUT, timeout)
    }
}

impl Pollable for TcpStream {
    const POLL_WORKS: bool = true;

    fn poll_readable(&self, timeout: Duration) -> io::Result<bool> {
        poll_fd(self.as_raw_fd(), PollFlags::POLLIN, timeout)
    }

    fn poll_writable(&self, timeout: Duration) -> io::Result<bool> {
        poll_fd(self.as_raw_fd(), PollFlags::POLLOUT, timeout)
    }
}
