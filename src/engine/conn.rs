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

//! The per-connection worker.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use super::socket::{Pollable, POLL_WORKS};
use super::stats::{bump, Stats};
use super::{Admission, EngineConfig, Shared};
use crate::db::{self, Backend, Sink};
use crate::entry::EntryRef;
use crate::protocol::{self, write_dump_entry, Message, MessageReader, MessageWriter};
use crate::thread::WorkerGroup;

/// Serves one accepted connection until it closes. The connection
/// counts as active until this returns.
pub(super) fn serve<B: Backend>(
    shared: &Shared<B>,
    _admission: Admission,
    stream: TcpStream,
    peer: SocketAddr,
) {
    debug!("Connection from {} opened", peer);
    match handle_connection(shared, &stream, peer) {
        Ok(()) => debug!("Connection from {} closed", peer),
        Err(e) if shared.group.is_shutting_down() => {
            debug!("Connection from {} closed on stop: {}", peer, e)
        }
        Err(e) => {
            bump(&shared.stats.errors, 1);
            error!("I/O error on connection from {}: {}", peer, e);
        }
    }
}

/// The read/dispatch loop. Transport faults are returned; protocol
/// faults are logged here and end the loop normally.
fn handle_connection<B: Backend>(shared: &Shared<B>, stream: &TcpStream, peer: SocketAddr) -> io::Result<()> {
    let config = &shared.config;
    prepare_stream(stream, config)?;

    let mut conn = match BackendConn::init(&*shared.backend, peer) {
        Ok(conn) => conn,
        Err(e) => {
            bump(&shared.stats.errors, 1);
            error!("Failed to set up backend state for {}: {}", peer, e);
            return Ok(());
        }
    };

    let mut reader = MessageReader::new(
        BufReader::new(PollingReader {
            stream,
            group: &shared.group,
            timeout: config.read_timeout,
            stats: &shared.stats,
        }),
        config.limits,
    );
    let mut out = BufWriter::new(ResponseWriter {
        stream,
        timeout: config.write_timeout,
        stats: &shared.stats,
    });
    let mut encoder = MessageWriter::new();

    loop {
        if shared.group.is_shutting_down() {
            debug!("Closing connection from {} on stop", peer);
            return Ok(());
        }

        let message = match reader.read_message() {
            Ok(message) => message,
            Err(e) if e.is_eof() => return Ok(()),
            Err(protocol::Error::Io(e)) => return Err(e),
            Err(e) => {
                bump(&shared.stats.errors, 1);
                error!("Failed to decode message from {}: {}", peer, e);
                return Ok(());
            }
        };
        trace!("Received {:?} from {}", message.message_type(), peer);

        let keep_open = dispatch(shared, &mut conn.conn, &mut encoder, &mut out, message, peer)?;
        out.flush()?;
        if !keep_open {
            return Ok(());
        }
    }
}

/// Puts an accepted stream into blocking mode with the configured
/// timeouts. The write timeout bounds each write system call, since a
/// successful writability poll does not guarantee that a large write
/// completes without blocking.
fn prepare_stream(stream: &TcpStream, config: &EngineConfig) -> io::Result<()> {
    if POLL_WORKS {
        // On some systems, the socket might inherit nonblocking status
        // from the listener.
        stream.set_nonblocking(false)?;
    } else {
        stream.set_read_timeout(Some(config.read_timeout))?;
    }
    stream.set_write_timeout(Some(config.write_timeout))
}

/// Hands one message to the backend and writes the response, if any.
/// Returns whether the connection should stay open.
fn dispatch<B: Backend, W: Write>(
    shared: &Shared<B>,
    conn: &mut B::Conn,
    encoder: &mut MessageWriter,
    out: &mut W,
    message: Message,
    peer: SocketAddr,
) -> io::Result<bool> {
    let backend = &*shared.backend;
    let stats = &shared.stats;
    match message {
        Message::Input(entries) => {
            for entry in &entries {
                bump(&stats.inputs, 1);
                check(shared, peer, "Input", backend.input(conn, entry))?;
            }
            Ok(true)
        }

        Message::Query(query) => {
            bump(&stats.queries, 1);
            out.write_all(encoder.stream_start()?)?;
            let mut sink = StreamSink {
                encoder: &mut *encoder,
                out: &mut *out,
            };
            let result = backend.query(conn, &query, &mut sink);
            if let Some(n) = check(shared, peer, "Query", result)? {
                debug!("Query from {} matched {} entries", peer, n);
            }
            // The stream is closed even if the query failed part way.
            out.write_all(encoder.stream_end()?)?;
            Ok(true)
        }

        Message::Backup(path) => {
            bump(&stats.backups, 1);
            check(shared, peer, "Backup", backend.backup(conn, &path))?;
            Ok(true)
        }

        // Dump records are unframed, so the end of the connection marks
        // the end of the dump.
        Message::Dump(path) => {
            bump(&stats.dumps, 1);
            let result = backend.dump(conn, &path, &mut DumpSink(&mut *out));
            check(shared, peer, "Dump", result)?;
            Ok(false)
        }

        Message::StreamStart | Message::StreamData(_) | Message::StreamEnd => {
            bump(&stats.errors, 1);
            error!(
                "Unexpected {:?} message from {}; closing connection",
                message.message_type(),
                peer
            );
            Ok(false)
        }
    }
}

/// Sorts out the result of a backend call. Sink failures mean the
/// connection is broken and are returned. Other failures are logged
/// and counted, and the connection carries on.
fn check<B, T>(shared: &Shared<B>, peer: SocketAddr, what: &str, result: db::Result<T>) -> io::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(db::Error::Sink(e)) => Err(e),
        Err(e) => {
            bump(&shared.stats.errors, 1);
            error!("{} from {} failed: {}", what, peer, e);
            Ok(None)
        }
    }
}

////////////////////////////////////////////////////////////////////////
// SINKS                                                              //
////////////////////////////////////////////////////////////////////////

/// Writes query results as stream data messages.
struct StreamSink<'a, W> {
    encoder: &'a mut MessageWriter,
    out: &'a mut W,
}

impl<W: Write> Sink for StreamSink<'_, W> {
    fn push(&mut self, entry: &EntryRef) -> io::Result<()> {
        let message = self.encoder.stream_data(entry)?;
        self.out.write_all(message)
    }
}

/// Writes dump records.
struct DumpSink<'a, W>(&'a mut W);

impl<W: Write> Sink for DumpSink<'_, W> {
    fn push(&mut self, entry: &EntryRef) -> io::Result<()> {
        write_dump_entry(self.0, entry)
    }
}

////////////////////////////////////////////////////////////////////////
// BACKEND STATE GUARD                                                //
////////////////////////////////////////////////////////////////////////

/// Per-connection backend state, released on every exit path.
struct BackendConn<'a, B: Backend> {
    backend: &'a B,
    conn: B::Conn,
}

impl<'a, B: Backend> BackendConn<'a, B> {
    fn init(backend: &'a B, peer: SocketAddr) -> db::Result<Self> {
        Ok(Self {
            backend,
            conn: backend.conn_init(peer)?,
        })
    }
}

impl<B: Backend> Drop for BackendConn<'_, B> {
    fn drop(&mut self) {
        self.backend.conn_deinit(&mut self.conn);
    }
}

////////////////////////////////////////////////////////////////////////
// POLLING I/O                                                        //
////////////////////////////////////////////////////////////////////////

/// Reads from a connection, polling for data so that a stop request is
/// noticed while the peer is idle.
struct PollingReader<'a> {
    stream: &'a TcpStream,
    group: &'a WorkerGroup,
    timeout: Duration,
    stats: &'a Stats,
}

impl Read for PollingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.group.is_shutting_down() {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionAborted,
                    "engine is stopping",
                ));
            }
            if !self.stream.poll_readable(self.timeout)? {
                continue;
            }

            let mut stream = self.stream;
            match stream.read(buf) {
                Ok(n) => {
                    bump(&self.stats.bytes_in, n as u64);
                    return Ok(n);
                }
                // Socket-level timeouts, where polling does not work.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

/// Writes to a connection, failing if the peer does not accept data
/// within the timeout.
struct ResponseWriter<'a> {
    stream: &'a TcpStream,
    timeout: Duration,
    stats: &'a Stats,
}

impl Write for ResponseWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            let timeout = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| io::Error::new(io::ErrorKind::TimedOut, "peer stopped reading"))?;
            if self.stream.poll_writable(timeout)? {
                break;
            }
        }
        let mut stream = self.stream;
        let n = match stream.write(buf) {
            Ok(n) => n,
            // The socket-level write timeout expired.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "peer stopped reading"))
            }
            Err(e) => return Err(e),
        };
        bump(&self.stats.bytes_out, n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut stream = self.stream;
        stream.flush()
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
