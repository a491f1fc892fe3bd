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

//! Observation entries and their aggregate values.

use std::fmt;

////////////////////////////////////////////////////////////////////////
// ENTRIES                                                            //
////////////////////////////////////////////////////////////////////////

/// One aggregated passive-DNS fact.
///
/// The four identity fields are byte strings: sensors may report
/// names and answer data that are not valid UTF-8, and they are stored
/// and returned exactly as received.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Entry {
    pub rrname: Vec<u8>,
    pub rrtype: Vec<u8>,
    pub rdata: Vec<u8>,
    pub sensor_id: Vec<u8>,
    pub count: u32,
    pub first_seen: u32,
    pub last_seen: u32,
}

/// A borrowed view of an [`Entry`].
///
/// Query results are assembled from slices of storage keys, so the
/// response path works with `EntryRef`s to avoid copying every field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EntryRef<'a> {
    pub rrname: &'a [u8],
    pub rrtype: &'a [u8],
    pub rdata: &'a [u8],
    pub sensor_id: &'a [u8],
    pub count: u32,
    pub first_seen: u32,
    pub last_seen: u32,
}

impl Entry {
    /// Returns a borrowed view of this entry.
    pub fn as_entry_ref(&self) -> EntryRef<'_> {
        EntryRef {
            rrname: &self.rrname,
            rrtype: &self.rrtype,
            rdata: &self.rdata,
            sensor_id: &self.sensor_id,
            count: self.count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }

    /// Returns the aggregate carried by this entry.
    pub fn aggregate(&self) -> Aggregate {
        self.as_entry_ref().aggregate()
    }
}

impl<'a> EntryRef<'a> {
    /// Assembles an entry view from identity fields and an aggregate.
    pub fn from_parts(
        rrname: &'a [u8],
        sensor_id: &'a [u8],
        rrtype: &'a [u8],
        rdata: &'a [u8],
        aggregate: Aggregate,
    ) -> Self {
        Self {
            rrname,
            rrtype,
            rdata,
            sensor_id,
            count: aggregate.count,
            first_seen: aggregate.first_seen,
            last_seen: aggregate.last_seen,
        }
    }

    /// Returns the aggregate carried by this entry.
    pub fn aggregate(&self) -> Aggregate {
        Aggregate {
            count: self.count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }

    /// Copies the view into an owned [`Entry`].
    pub fn to_entry(&self) -> Entry {
        Entry {
            rrname: self.rrname.to_vec(),
            rrtype: self.rrtype.to_vec(),
            rdata: self.rdata.to_vec(),
            sensor_id: self.sensor_id.to_vec(),
            count: self.count,
            first_seen: self.first_seen,
            last_seen: self.last_seen,
        }
    }
}

impl fmt::Display for EntryRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} count={} first_seen={} last_seen={}",
            self.rrname.escape_ascii(),
            self.sensor_id.escape_ascii(),
            self.rrtype.escape_ascii(),
            self.rdata.escape_ascii(),
            self.count,
            self.first_seen,
            self.last_seen,
        )
    }
}

////////////////////////////////////////////////////////////////////////
// AGGREGATES                                                         //
////////////////////////////////////////////////////////////////////////

/// The size of an encoded [`Aggregate`].
pub const AGGREGATE_LEN: usize = 12;

/// The aggregate stored under a forward key: how often an observation
/// was seen and the time span it was seen in.
///
/// Aggregates form a commutative monoid under [`Aggregate::merge`] with
/// [`Aggregate::IDENTITY`] as the identity element, which is what lets
/// the storage engine fold concurrent writes in any order.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Aggregate {
    pub count: u32,
    pub first_seen: u32,
    pub last_seen: u32,
}

impl Aggregate {
    /// The starting value for a key that has never been written.
    pub const IDENTITY: Self = Self {
        count: 0,
        first_seen: u32::MAX,
        last_seen: 0,
    };

    /// Folds `other` into `self`: counts are summed, and the time span
    /// is widened to cover both.
    pub fn merge(&mut self, other: &Self) {
        self.count = self.count.wrapping_add(other.count);
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
    }

    /// Encodes the aggregate into its 12-octet storage form.
    ///
    /// The on-disk field order is count, last seen, first seen, each as
    /// a little-endian `u32`. Existing databases depend on this order.
    pub fn encode(&self) -> [u8; AGGREGATE_LEN] {
        let mut buf = [0; AGGREGATE_LEN];
        buf[0..4].copy_from_slice(&self.count.to_le_bytes());
        buf[4..8].copy_from_slice(&self.last_seen.to_le_bytes());
        buf[8..12].copy_from_slice(&self.first_seen.to_le_bytes());
        buf
    }

    /// Decodes an aggregate from its storage form. Returns [`None`] if
    /// the buffer is too short. Trailing octets are ignored.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < AGGREGATE_LEN {
            return None;
        }
        let read = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Some(Self {
            count: read(0),
            last_seen: read(4),
            first_seen: read(8),
        })
    }
}

impl Default for Aggregate {
    fn default() -> Self {
        Self::IDENTITY
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
