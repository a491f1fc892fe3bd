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

//! Bounded, streaming decoding of MessagePack values into a node tree.
//!
//! The [`NodeReader`] pulls octets from its reader only as far as the
//! value being decoded requires, so several messages can be read back
//! to back from one socket. Every allocation is checked against the
//! remaining octet and node budgets *before* it is made: a hostile
//! length prefix cannot make the decoder reserve more memory than the
//! configured maximum message size.

use std::io::{self, Read};

use rmp::Marker;

use super::error::{Error, Result};
use super::Limits;

/// The maximum nesting depth of arrays and maps. No valid message
/// nests deeper than four levels.
const MAX_DEPTH: usize = 32;

/// The MessagePack extension type of timestamps.
const TIMESTAMP_EXT: i8 = -1;

////////////////////////////////////////////////////////////////////////
// NODES                                                              //
////////////////////////////////////////////////////////////////////////

/// A decoded MessagePack value.
#[derive(Clone, Debug, PartialEq)]
pub enum Node {
    Nil,
    Bool(bool),
    UInt(u64),
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
    Bin(Vec<u8>),
    Array(Vec<Node>),
    Map(Vec<(Node, Node)>),
    Ext(i8, Vec<u8>),
}

impl Node {
    /// Returns the contents of a string or binary node.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Str(b) | Self::Bin(b) => Some(b),
            _ => None,
        }
    }

    /// Consumes a string or binary node, returning its contents.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Self::Str(b) | Self::Bin(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the value of a non-negative integer node.
    pub fn as_uint(&self) -> Option<u64> {
        match *self {
            Self::UInt(n) => Some(n),
            Self::Int(n) => n.try_into().ok(),
            _ => None,
        }
    }

    /// Returns the value of an integer node of any sign.
    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Self::UInt(n) => n.try_into().ok(),
            Self::Int(n) => Some(n),
            _ => None,
        }
    }

    /// Returns the value of a boolean node.
    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Self::Bool(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the seconds of a timestamp, given either as a
    /// non-negative integer or as a timestamp extension in any of its
    /// three forms. The nanoseconds are discarded. Returns [`None`] for
    /// other nodes and for seconds that do not fit in a `u32`.
    pub fn as_timestamp(&self) -> Option<u32> {
        match self {
            Self::Ext(TIMESTAMP_EXT, data) => {
                let seconds: i64 = match data.len() {
                    4 => u32::from_be_bytes(data[..4].try_into().ok()?).into(),
                    8 => {
                        let packed = u64::from_be_bytes(data[..8].try_into().ok()?);
                        (packed & 0x3_ffff_ffff) as i64
                    }
                    12 => i64::from_be_bytes(data[4..12].try_into().ok()?),
                    _ => return None,
                };
                seconds.try_into().ok()
            }
            _ => self.as_uint().and_then(|n| n.try_into().ok()),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// NODE READER                                                        //
////////////////////////////////////////////////////////////////////////

/// Reads [`Node`]s from an underlying reader within [`Limits`].
pub struct NodeReader<R> {
    reader: R,
    limits: Limits,
    octets_left: usize,
    nodes_left: usize,
}

impl<R: Read> NodeReader<R> {
    /// Creates a new `NodeReader`.
    pub fn new(reader: R, limits: Limits) -> Self {
        Self {
            reader,
            limits,
            octets_left: limits.max_size,
            nodes_left: limits.max_nodes,
        }
    }

    /// Returns a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Consumes the `NodeReader`, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads one complete top-level value. The octet and node budgets
    /// are reset for every value.
    ///
    /// If the reader is exhausted before the first octet of the value,
    /// [`Error::Eof`] is returned. If it is exhausted later,
    /// [`Error::Truncated`] is returned.
    pub fn read_node(&mut self) -> Result<Node> {
        self.octets_left = self.limits.max_size;
        self.nodes_left = self.limits.max_nodes;
        let first = self.read_first_octet()?;
        self.read_value(first, 0)
    }

    fn read_first_octet(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Err(Error::Eof),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.charge_octets(1)?;
        Ok(buf[0])
    }

    fn read_value(&mut self, first: u8, depth: usize) -> Result<Node> {
        if depth > MAX_DEPTH {
            return Err(Error::TooDeep);
        }
        self.charge_nodes(1)?;

        match Marker::from_u8(first) {
            Marker::Null => Ok(Node::Nil),
            Marker::True => Ok(Node::Bool(true)),
            Marker::False => Ok(Node::Bool(false)),
            Marker::FixPos(n) => Ok(Node::UInt(n.into())),
            Marker::FixNeg(n) => Ok(Node::Int(n.into())),
            Marker::U8 => Ok(Node::UInt(self.read_array::<1>()?[0].into())),
            Marker::U16 => Ok(Node::UInt(u16::from_be_bytes(self.read_array()?).into())),
            Marker::U32 => Ok(Node::UInt(u32::from_be_bytes(self.read_array()?).into())),
            Marker::U64 => Ok(Node::UInt(u64::from_be_bytes(self.read_array()?))),
            Marker::I8 => Ok(Node::Int(i8::from_be_bytes(self.read_array()?).into())),
            Marker::I16 => Ok(Node::Int(i16::from_be_bytes(self.read_array()?).into())),
            Marker::I32 => Ok(Node::Int(i32::from_be_bytes(self.read_array()?).into())),
            Marker::I64 => Ok(Node::Int(i64::from_be_bytes(self.read_array()?))),
            Marker::F32 => Ok(Node::Float(f32::from_be_bytes(self.read_array()?).into())),
            Marker::F64 => Ok(Node::Float(f64::from_be_bytes(self.read_array()?))),
            Marker::FixStr(len) => Ok(Node::Str(self.read_vec(len.into())?)),
            Marker::Str8 => {
                let len = self.read_len8()?;
                Ok(Node::Str(self.read_vec(len)?))
            }
            Marker::Str16 => {
                let len = self.read_len16()?;
                Ok(Node::Str(self.read_vec(len)?))
            }
            Marker::Str32 => {
                let len = self.read_len32()?;
                Ok(Node::Str(self.read_vec(len)?))
            }
            Marker::Bin8 => {
                let len = self.read_len8()?;
                Ok(Node::Bin(self.read_vec(len)?))
            }
            Marker::Bin16 => {
                let len = self.read_len16()?;
                Ok(Node::Bin(self.read_vec(len)?))
            }
            Marker::Bin32 => {
                let len = self.read_len32()?;
                Ok(Node::Bin(self.read_vec(len)?))
            }
            Marker::FixArray(len) => self.read_array_node(len.into(), depth),
            Marker::Array16 => {
                let len = self.read_len16()?;
                self.read_array_node(len, depth)
            }
            Marker::Array32 => {
                let len = self.read_len32()?;
                self.read_array_node(len, depth)
            }
            Marker::FixMap(len) => self.read_map_node(len.into(), depth),
            Marker::Map16 => {
                let len = self.read_len16()?;
                self.read_map_node(len, depth)
            }
            Marker::Map32 => {
                let len = self.read_len32()?;
                self.read_map_node(len, depth)
            }
            Marker::FixExt1 => self.read_ext_node(1),
            Marker::FixExt2 => self.read_ext_node(2),
            Marker::FixExt4 => self.read_ext_node(4),
            Marker::FixExt8 => self.read_ext_node(8),
            Marker::FixExt16 => self.read_ext_node(16),
            Marker::Ext8 => {
                let len = self.read_len8()?;
                self.read_ext_node(len)
            }
            Marker::Ext16 => {
                let len = self.read_len16()?;
                self.read_ext_node(len)
            }
            Marker::Ext32 => {
                let len = self.read_len32()?;
                self.read_ext_node(len)
            }
            Marker::Reserved => Err(Error::Malformed("reserved marker")),
        }
    }

    fn read_array_node(&mut self, len: usize, depth: usize) -> Result<Node> {
        // Each element takes at least one node, so checking the count
        // up front bounds the allocation below.
        if len > self.nodes_left {
            return Err(Error::TooManyNodes(self.limits.max_nodes));
        }
        let mut elements = Vec::with_capacity(len);
        for _ in 0..len {
            let first = self.read_octet()?;
            elements.push(self.read_value(first, depth + 1)?);
        }
        Ok(Node::Array(elements))
    }

    fn read_map_node(&mut self, len: usize, depth: usize) -> Result<Node> {
        if len.saturating_mul(2) > self.nodes_left {
            return Err(Error::TooManyNodes(self.limits.max_nodes));
        }
        let mut pairs = Vec::with_capacity(len);
        for _ in 0..len {
            let first = self.read_octet()?;
            let key = self.read_value(first, depth + 1)?;
            let first = self.read_octet()?;
            let value = self.read_value(first, depth + 1)?;
            pairs.push((key, value));
        }
        Ok(Node::Map(pairs))
    }

    fn read_ext_node(&mut self, len: usize) -> Result<Node> {
        let [ty] = self.read_array::<1>()?;
        let data = self.read_vec(len)?;
        Ok(Node::Ext(ty as i8, data))
    }

    fn read_len8(&mut self) -> Result<usize> {
        Ok(self.read_array::<1>()?[0].into())
    }

    fn read_len16(&mut self) -> Result<usize> {
        Ok(u16::from_be_bytes(self.read_array()?).into())
    }

    fn read_len32(&mut self) -> Result<usize> {
        usize::try_from(u32::from_be_bytes(self.read_array()?))
            .map_err(|_| Error::TooLarge(self.limits.max_size))
    }

    fn read_octet(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.charge_octets(N)?;
        let mut buf = [0; N];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        self.charge_octets(len)?;
        let mut buf = vec![0; len];
        self.reader.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn charge_octets(&mut self, n: usize) -> Result<()> {
        if n > self.octets_left {
            Err(Error::TooLarge(self.limits.max_size))
        } else {
            self.octets_left -= n;
            Ok(())
        }
    }

    fn charge_nodes(&mut self, n: usize) -> Result<()> {
        if n > self.nodes_left {
            Err(Error::TooManyNodes(self.limits.max_nodes))
        } else {
            self.nodes_left -= n;
            Ok(())
        }
    }
}

/// Decodes exactly one value from `buf`. Trailing octets are an error.
pub fn decode_slice(buf: &[u8], limits: Limits) -> Result<Node> {
    let mut reader = NodeReader::new(buf, limits);
    let node = match reader.read_node() {
        Err(Error::Eof) => return Err(Error::Malformed("empty payload")),
        result => result?,
    };
    if reader.get_ref().is_empty() {
        Ok(node)
    } else {
        Err(Error::Malformed("trailing octets after payload"))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Limits = Limits {
        max_size: 1024,
        max_nodes: 64,
    };

    fn read_all(buf: &[u8], limits: Limits) -> Vec<Result<Node>> {
        let mut reader = NodeReader::new(buf, limits);
        let mut results = Vec::new();
        loop {
            let result = reader.read_node();
            let done = result.is_err();
            results.push(result);
            if done {
                return results;
            }
        }
    }

    #[test]
    fn reads_consecutive_values_then_eof() {
        // 7, "ab", [true, nil], {1: -1}
        let buf = [
            0x07, 0xa2, b'a', b'b', 0x92, 0xc3, 0xc0, 0x81, 0x01, 0xff,
        ];
        let results = read_all(&buf, LIMITS);
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].as_ref().unwrap(), &Node::UInt(7));
        assert_eq!(results[1].as_ref().unwrap(), &Node::Str(b"ab".to_vec()));
        assert_eq!(
            results[2].as_ref().unwrap(),
            &Node::Array(vec![Node::Bool(true), Node::Nil])
        );
        assert_eq!(
            results[3].as_ref().unwrap(),
            &Node::Map(vec![(Node::UInt(1), Node::Int(-1))])
        );
        assert!(matches!(results[4], Err(Error::Eof)));
    }

    #[test]
    fn truncation_is_not_eof() {
        // A bin8 claiming four octets but carrying two.
        let buf = [0xc4, 0x04, 0x00, 0x00];
        let results = read_all(&buf, LIMITS);
        assert!(matches!(results[0], Err(Error::Truncated)));
    }

    #[test]
    fn size_limit_is_checked_before_allocation() {
        // A bin32 claiming 4 GiB.
        let buf = [0xc6, 0xff, 0xff, 0xff, 0xff];
        let results = read_all(&buf, LIMITS);
        assert!(matches!(results[0], Err(Error::TooLarge(1024))));
    }

    #[test]
    fn node_limit_is_checked_before_allocation() {
        // An array32 claiming 2^32 - 1 elements.
        let buf = [0xdd, 0xff, 0xff, 0xff, 0xff];
        let results = read_all(&buf, LIMITS);
        assert!(matches!(results[0], Err(Error::TooManyNodes(64))));

        // A map16 with 40 pairs needs 81 nodes.
        let buf = [0xde, 0x00, 40];
        let results = read_all(&buf, LIMITS);
        assert!(matches!(results[0], Err(Error::TooManyNodes(64))));
    }

    #[test]
    fn depth_is_bounded() {
        let buf = vec![0x91; MAX_DEPTH + 2];
        let limits = Limits {
            max_size: 1024,
            max_nodes: 1024,
        };
        let results = read_all(&buf, limits);
        assert!(matches!(results[0], Err(Error::TooDeep)));
    }

    #[test]
    fn budgets_reset_per_value() {
        let limits = Limits {
            max_size: 3,
            max_nodes: 64,
        };
        let buf = [0xa2, b'a', b'b', 0xa2, b'c', b'd'];
        let results = read_all(&buf, limits);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(Error::Eof)));
    }

    #[test]
    fn decode_slice_rejects_trailing_octets() {
        assert_eq!(decode_slice(&[0x01], LIMITS).unwrap(), Node::UInt(1));
        assert!(matches!(
            decode_slice(&[0x01, 0x02], LIMITS),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(decode_slice(&[], LIMITS), Err(Error::Malformed(_))));
    }

    #[test]
    fn timestamps_accept_all_forms() {
        assert_eq!(Node::UInt(100).as_timestamp(), Some(100));
        assert_eq!(Node::UInt(1 << 40).as_timestamp(), None);
        assert_eq!(Node::Int(-1).as_timestamp(), None);

        let ts32 = Node::Ext(-1, 100u32.to_be_bytes().to_vec());
        assert_eq!(ts32.as_timestamp(), Some(100));

        let packed: u64 = (5 << 34) | 200;
        let ts64 = Node::Ext(-1, packed.to_be_bytes().to_vec());
        assert_eq!(ts64.as_timestamp(), Some(200));

        let mut data = 7u32.to_be_bytes().to_vec();
        data.extend_from_slice(&300i64.to_be_bytes());
        assert_eq!(Node::Ext(-1, data).as_timestamp(), Some(300));

        let mut data = 0u32.to_be_bytes().to_vec();
        data.extend_from_slice(&(-5i64).to_be_bytes());
        assert_eq!(Node::Ext(-1, data).as_timestamp(), None);

        assert_eq!(Node::Ext(3, vec![0; 4]).as_timestamp(), None);
    }
}
