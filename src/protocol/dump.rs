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

//! The dump record format.
//!
//! A dump is a plain sequence of entry maps with integer timestamps
//! and no envelope. The end of the stream after a complete record is
//! the normal terminator.

use std::io::{self, Read, Write};

use super::decode::decode_entry;
use super::encode::{write_entry, Timestamps};
use super::error::{Error, Result};
use super::node::NodeReader;
use super::Limits;
use crate::entry::{Entry, EntryRef};

/// Writes one dump record.
pub fn write_dump_entry<W: Write>(wr: &mut W, entry: &EntryRef) -> io::Result<()> {
    write_entry(wr, entry, Timestamps::Integer)
}

/// Reads dump records from a byte stream.
pub struct DumpReader<R> {
    nodes: NodeReader<R>,
}

impl<R: Read> DumpReader<R> {
    /// Creates a new `DumpReader`.
    pub fn new(reader: R, limits: Limits) -> Self {
        Self {
            nodes: NodeReader::new(reader, limits),
        }
    }

    /// Reads the next record, or returns [`None`] at the end of the
    /// stream.
    pub fn read_entry(&mut self) -> Result<Option<Entry>> {
        match self.nodes.read_node() {
            Ok(node) => decode_entry(node).map(Some),
            Err(Error::Eof) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl<R: Read> Iterator for DumpReader<R> {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_entry().transpose()
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
