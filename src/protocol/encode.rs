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

//! Encoding of message envelopes and payloads.

use std::io::{self, Write};

use rmp::encode::{
    write_array_len, write_bin, write_bool, write_ext_meta, write_map_len, write_str,
    write_str_len, write_uint,
};

use super::{MessageType, QueryRequest};
use crate::entry::EntryRef;

/// Encodes messages into reusable buffers.
///
/// Each method encodes one complete envelope and returns it as a slice
/// that stays valid until the next call. A connection keeps one
/// `MessageWriter` for its lifetime, so steady-state encoding does not
/// allocate.
#[derive(Default)]
pub struct MessageWriter {
    payload: Vec<u8>,
    envelope: Vec<u8>,
}

impl MessageWriter {
    /// Creates a new `MessageWriter`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes an input request carrying `entries`.
    pub fn input_request(&mut self, entries: &[EntryRef]) -> io::Result<&[u8]> {
        self.payload.clear();
        write_map_len(&mut self.payload, 1)?;
        write_str(&mut self.payload, "O")?;
        write_array_len(&mut self.payload, len_u32(entries.len())?)?;
        for entry in entries {
            write_entry(&mut self.payload, entry, Timestamps::Integer)?;
        }
        self.seal(MessageType::InputRequest)
    }

    /// Encodes a query request.
    pub fn query_request(&mut self, query: &QueryRequest) -> io::Result<&[u8]> {
        self.payload.clear();
        write_map_len(&mut self.payload, 9)?;
        let fields = [
            ("rrname", &query.rrname),
            ("rrtype", &query.rrtype),
            ("rdata", &query.rdata),
            ("sensorID", &query.sensor_id),
        ];
        for (name, value) in fields {
            write_str(&mut self.payload, &format!("Q{}", name))?;
            write_raw_str(&mut self.payload, value.as_deref().unwrap_or_default())?;
            write_str(&mut self.payload, &format!("H{}", name))?;
            write_bool(&mut self.payload, value.is_some())?;
        }
        write_str(&mut self.payload, "Limit")?;
        write_uint(&mut self.payload, query.limit as u64)?;
        self.seal(MessageType::QueryRequest)
    }

    /// Encodes a backup request.
    pub fn backup_request(&mut self, path: &str) -> io::Result<&[u8]> {
        self.path_payload(path)?;
        self.seal(MessageType::BackupRequest)
    }

    /// Encodes a dump request. The path is only a hint to the server.
    pub fn dump_request(&mut self, path: &str) -> io::Result<&[u8]> {
        self.path_payload(path)?;
        self.seal(MessageType::DumpRequest)
    }

    /// Encodes the marker that opens a query result stream.
    pub fn stream_start(&mut self) -> io::Result<&[u8]> {
        self.payload.clear();
        self.seal(MessageType::StreamStart)
    }

    /// Encodes one query result.
    pub fn stream_data(&mut self, entry: &EntryRef) -> io::Result<&[u8]> {
        self.payload.clear();
        write_entry(&mut self.payload, entry, Timestamps::Extension)?;
        self.seal(MessageType::StreamData)
    }

    /// Encodes the marker that closes a query result stream.
    pub fn stream_end(&mut self) -> io::Result<&[u8]> {
        self.payload.clear();
        self.seal(MessageType::StreamEnd)
    }

    fn path_payload(&mut self, path: &str) -> io::Result<()> {
        self.payload.clear();
        write_map_len(&mut self.payload, 1)?;
        write_str(&mut self.payload, "P")?;
        write_str(&mut self.payload, path)?;
        Ok(())
    }

    /// Wraps the current payload in an envelope.
    fn seal(&mut self, message_type: MessageType) -> io::Result<&[u8]> {
        self.envelope.clear();
        write_map_len(&mut self.envelope, 2)?;
        write_str(&mut self.envelope, "T")?;
        write_uint(&mut self.envelope, message_type.tag().into())?;
        write_str(&mut self.envelope, "M")?;
        write_bin(&mut self.envelope, &self.payload)?;
        Ok(&self.envelope)
    }
}

/// How timestamps are written in an entry map.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum Timestamps {
    Integer,
    Extension,
}

/// Writes a seven-key entry map. The key order is N, T, D, I, C, L, F;
/// readers accept any order.
pub(super) fn write_entry<W>(wr: &mut W, entry: &EntryRef, timestamps: Timestamps) -> io::Result<()>
where
    W: Write,
{
    write_map_len(wr, 7)?;
    write_str(wr, "N")?;
    write_raw_str(wr, entry.rrname)?;
    write_str(wr, "T")?;
    write_raw_str(wr, entry.rrtype)?;
    write_str(wr, "D")?;
    write_raw_str(wr, entry.rdata)?;
    write_str(wr, "I")?;
    write_raw_str(wr, entry.sensor_id)?;
    write_str(wr, "C")?;
    write_uint(wr, entry.count.into())?;
    write_str(wr, "L")?;
    write_timestamp(wr, entry.last_seen, timestamps)?;
    write_str(wr, "F")?;
    write_timestamp(wr, entry.first_seen, timestamps)?;
    Ok(())
}

fn write_timestamp<W: Write>(wr: &mut W, seconds: u32, timestamps: Timestamps) -> io::Result<()> {
    match timestamps {
        Timestamps::Integer => {
            write_uint(wr, seconds.into())?;
        }
        Timestamps::Extension => {
            write_ext_meta(wr, 4, -1)?;
            wr.write_all(&seconds.to_be_bytes())?;
        }
    }
    Ok(())
}

/// Writes `bytes` as a MessagePack string without requiring it to be
/// valid UTF-8.
fn write_raw_str<W: Write>(wr: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_str_len(wr, len_u32(bytes.len())?)?;
    wr.write_all(bytes)
}

fn len_u32(len: usize) -> io::Result<u32> {
    len.try_into()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "value too long to encode"))
}
