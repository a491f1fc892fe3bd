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

//! The wire protocol and the dump record format.
//!
//! Every message on the wire is an *envelope*: a MessagePack map with
//! exactly two keys, `"T"` (an integer [`MessageType`] tag) and `"M"`
//! (a binary payload). The payload is itself an encoded MessagePack
//! value whose schema depends on the tag. The envelope is
//! self-delimiting, so messages are written back to back with no
//! separate framing.
//!
//! Observations are encoded as *entry maps* with exactly seven
//! single-letter keys:
//!
//! | Key | Field        | Encoding                                |
//! |-----|--------------|-----------------------------------------|
//! | `N` | rrname       | string (binary accepted)                |
//! | `T` | rrtype       | string (binary accepted)                |
//! | `D` | rdata        | string (binary accepted)                |
//! | `I` | sensor ID    | string (binary accepted)                |
//! | `C` | count        | unsigned integer                        |
//! | `F` | first seen   | unsigned integer or timestamp extension |
//! | `L` | last seen    | unsigned integer or timestamp extension |
//!
//! Query stream data carries its timestamps as timestamp extensions;
//! dump records carry them as plain integers.

use std::path::PathBuf;

use crate::entry::Entry;

mod decode;
mod dump;
mod encode;
mod error;
mod node;

pub use decode::MessageReader;
pub use dump::{write_dump_entry, DumpReader};
pub use encode::MessageWriter;
pub use error::{Error, Result};

////////////////////////////////////////////////////////////////////////
// MESSAGE TYPES                                                      //
////////////////////////////////////////////////////////////////////////

/// The type tag of a message envelope.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MessageType {
    InputRequest,
    QueryRequest,
    BackupRequest,
    DumpRequest,
    StreamStart,
    StreamData,
    StreamEnd,
}

impl MessageType {
    /// Returns the numeric tag of this type.
    pub fn tag(self) -> u8 {
        match self {
            Self::InputRequest => 1,
            Self::QueryRequest => 2,
            Self::BackupRequest => 3,
            Self::DumpRequest => 4,
            Self::StreamStart => 130,
            Self::StreamData => 131,
            Self::StreamEnd => 132,
        }
    }

    /// Looks up a type by its numeric tag.
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(Self::InputRequest),
            2 => Some(Self::QueryRequest),
            3 => Some(Self::BackupRequest),
            4 => Some(Self::DumpRequest),
            130 => Some(Self::StreamStart),
            131 => Some(Self::StreamData),
            132 => Some(Self::StreamEnd),
            _ => None,
        }
    }
}

/// A decoded message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Message {
    /// Observations to merge into the store.
    Input(Vec<Entry>),

    /// A query for stored observations.
    Query(QueryRequest),

    /// A request to back up the store to the given directory.
    Backup(PathBuf),

    /// A request to dump every stored observation onto the connection.
    /// The path is a hint only.
    Dump(PathBuf),

    StreamStart,
    StreamData(Entry),
    StreamEnd,
}

impl Message {
    /// Returns the type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Input(_) => MessageType::InputRequest,
            Self::Query(_) => MessageType::QueryRequest,
            Self::Backup(_) => MessageType::BackupRequest,
            Self::Dump(_) => MessageType::DumpRequest,
            Self::StreamStart => MessageType::StreamStart,
            Self::StreamData(_) => MessageType::StreamData,
            Self::StreamEnd => MessageType::StreamEnd,
        }
    }
}

/// A query for stored observations.
///
/// Each of the four identity fields is an optional equality filter.
/// [`None`] means the field is unconstrained, which is distinct from
/// `Some(vec![])` (the field must be empty).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QueryRequest {
    pub rrname: Option<Vec<u8>>,
    pub rrtype: Option<Vec<u8>>,
    pub rdata: Option<Vec<u8>>,
    pub sensor_id: Option<Vec<u8>>,

    /// The maximum number of results.
    pub limit: usize,
}

////////////////////////////////////////////////////////////////////////
// LIMITS                                                             //
////////////////////////////////////////////////////////////////////////

/// Bounds on the resources a single decoded message may use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Limits {
    /// The maximum size of a message in octets. This bounds both the
    /// envelope and, separately, its payload.
    pub max_size: usize,

    /// The maximum number of MessagePack values in a message.
    pub max_nodes: usize,
}

impl Limits {
    pub const DEFAULT_MAX_SIZE: usize = 1024 * 1024;
    pub const DEFAULT_MAX_NODES: usize = 16 * 1024;
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_size: Self::DEFAULT_MAX_SIZE,
            max_nodes: Self::DEFAULT_MAX_NODES,
        }
    }
}
