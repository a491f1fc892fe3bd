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

//! A blocking client for the store's wire protocol.

use std::io::{self, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use crate::entry::{Entry, EntryRef};
use crate::protocol::{DumpReader, Error, Limits, Message, MessageReader, MessageWriter, QueryRequest, Result};

/// A connection to a store.
pub struct Client {
    stream: TcpStream,
    reader: MessageReader<BufReader<TcpStream>>,
    encoder: MessageWriter,
    limits: Limits,
}

impl Client {
    /// Connects to the store at `addr` with the default [`Limits`] on
    /// responses.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Self::with_limits(addr, Limits::default())
    }

    /// Connects to the store at `addr`, bounding each decoded response
    /// message by `limits`.
    pub fn with_limits<A: ToSocketAddrs>(addr: A, limits: Limits) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let reader = MessageReader::new(BufReader::new(stream.try_clone()?), limits);
        Ok(Self {
            stream,
            reader,
            encoder: MessageWriter::new(),
            limits,
        })
    }

    /// Sends observations to merge. The store does not acknowledge
    /// input, so this returns once the request is written.
    pub fn input(&mut self, entries: &[EntryRef]) -> io::Result<()> {
        let message = self.encoder.input_request(entries)?;
        self.stream.write_all(message)
    }

    /// Runs a query and collects the results.
    pub fn query(&mut self, query: &QueryRequest) -> Result<Vec<Entry>> {
        let mut results = Vec::new();
        self.query_each(query, |entry| results.push(entry))?;
        Ok(results)
    }

    /// Runs a query, handing each result to `f` as it arrives. Returns
    /// the number of results.
    pub fn query_each<F>(&mut self, query: &QueryRequest, mut f: F) -> Result<usize>
    where
        F: FnMut(Entry),
    {
        let message = self.encoder.query_request(query)?;
        self.stream.write_all(message)?;

        match self.reader.read_message()? {
            Message::StreamStart => (),
            _ => return Err(Error::Malformed("query response does not start a stream")),
        }
        let mut n = 0;
        loop {
            match self.reader.read_message()? {
                Message::StreamData(entry) => {
                    f(entry);
                    n += 1;
                }
                Message::StreamEnd => return Ok(n),
                _ => return Err(Error::Malformed("unexpected message in query stream")),
            }
        }
    }

    /// Asks the store to back itself up to `path` on the store's host.
    /// The store does not report whether the backup succeeded.
    pub fn backup(&mut self, path: &str) -> io::Result<()> {
        let message = self.encoder.backup_request(path)?;
        self.stream.write_all(message)
    }

    /// Requests a dump of every stored observation. The store closes
    /// the connection after the last record, so this consumes the
    /// client. `path` is only logged by the store.
    pub fn dump(mut self, path: &str) -> io::Result<DumpReader<BufReader<TcpStream>>> {
        let message = self.encoder.dump_request(path)?;
        self.stream.write_all(message)?;
        self.stream.shutdown(Shutdown::Write)?;
        Ok(DumpReader::new(self.reader.into_inner(), self.limits))
    }

    /// Closes the sending half of the connection. The store finishes
    /// any outstanding request and then closes the connection.
    pub fn shutdown(&self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Write)
    }
}
