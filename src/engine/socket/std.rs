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
use std::time::Duration;

use super::Pollable;

impl Pollable for TcpListener {
    const POLL_WORKS: bool = false;

    fn poll_readable(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }

    fn poll_writable(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }
}

impl Pollable for TcpStream {
    const POLL_WORKS: bool = false;

    fn poll_readable(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }

    fn poll_writable(&self, _timeout: Duration) -> io::Result<bool> {
        Ok(true)
    }
}
