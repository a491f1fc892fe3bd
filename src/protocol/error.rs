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

//! Error types for decoding protocol messages and dump records.

use std::fmt;
use std::io;

/// Represents errors that may occur while decoding.
///
/// Only [`Error::Eof`] is a normal outcome: it means the stream ended
/// cleanly between two messages. Every other variant is fatal to the
/// connection or dump stream being read, since the decoder cannot
/// resynchronize after a structural fault.
#[derive(Debug)]
pub enum Error {
    /// The stream ended before the first octet of a message.
    Eof,

    /// The stream ended in the middle of a message.
    Truncated,

    /// The underlying reader failed.
    Io(io::Error),

    /// The message exceeds the configured maximum size in octets.
    TooLarge(usize),

    /// The message contains more nodes than the configured maximum.
    TooManyNodes(usize),

    /// The message nests arrays and maps too deeply.
    TooDeep,

    /// The envelope carries a type tag this decoder does not know.
    UnknownType(u64),

    /// The message is structurally valid MessagePack but does not match
    /// the expected schema.
    Malformed(&'static str),
}

impl Error {
    /// Returns whether this is a clean end of stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Eof => f.write_str("end of stream"),
            Self::Truncated => f.write_str("stream ended in the middle of a message"),
            Self::Io(err) => write!(f, "I/O error: {}", err),
            Self::TooLarge(limit) => {
                write!(f, "message exceeds the maximum size of {} octets", limit)
            }
            Self::TooManyNodes(limit) => {
                write!(f, "message exceeds the maximum of {} nodes", limit)
            }
            Self::TooDeep => f.write_str("message is nested too deeply"),
            Self::UnknownType(tag) => write!(f, "unknown message type {}", tag),
            Self::Malformed(what) => write!(f, "malformed message: {}", what),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

/// A result type for decoding.
pub type Result<T> = std::result::Result<T, Error>;
