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

//! The two sorted key spaces.
//!
//! Every observation is stored under two keys built from its four
//! identity fields, joined by the delimiter octet `0x1F`:
//!
//! ```text
//! forward:   o 0x1F rrname 0x1F sensor_id 0x1F rrtype 0x1F rdata
//! inverted:  i 0x1F rdata  0x1F sensor_id 0x1F rrname 0x1F rrtype
//! ```
//!
//! The forward key carries the [`Aggregate`](crate::Aggregate). The
//! inverted key has an empty value and exists only so that queries by
//! answer data can prefix-scan.
//!
//! Answer data may itself contain the delimiter. It is therefore always
//! placed where it can be recovered unambiguously: last in the forward
//! key (split forward, stopping after three delimiters) and first in
//! the inverted key (split backward from the tail, stopping after
//! three delimiters).

use super::{Error, Result};

/// The octet separating key fields.
pub const DELIMITER: u8 = 0x1f;

/// The tag octet of forward keys.
pub const FORWARD_TAG: u8 = b'o';

/// The tag octet of inverted keys.
pub const INVERTED_TAG: u8 = b'i';

/// The maximum length of a stored key. Inputs that would produce a
/// longer key are rejected.
pub const MAX_KEY_LEN: usize = 10 * 1024;

/// The four identity fields of an observation, borrowed from a key or
/// an entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Identity<'a> {
    pub rrname: &'a [u8],
    pub sensor_id: &'a [u8],
    pub rrtype: &'a [u8],
    pub rdata: &'a [u8],
}

/// Per-connection key buffers, allocated once at the maximum key size.
pub struct KeyBuffers {
    pub forward: Vec<u8>,
    pub inverted: Vec<u8>,
}

impl KeyBuffers {
    pub fn new() -> Self {
        Self {
            forward: Vec::with_capacity(MAX_KEY_LEN),
            inverted: Vec::with_capacity(MAX_KEY_LEN),
        }
    }
}

impl Default for KeyBuffers {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////
// KEY CONSTRUCTION                                                   //
////////////////////////////////////////////////////////////////////////

/// Joins `fields` after `tag` into `buf`, checking the length bound
/// before writing anything.
fn build(buf: &mut Vec<u8>, tag: u8, fields: &[&[u8]]) -> Result<()> {
    let len = 1 + fields.iter().map(|f| f.len() + 1).sum::<usize>();
    if len > MAX_KEY_LEN {
        return Err(Error::KeyTooLong(len));
    }
    buf.clear();
    buf.push(tag);
    for field in fields {
        buf.push(DELIMITER);
        buf.extend_from_slice(field);
    }
    Ok(())
}

/// Writes the forward key of `id` into `buf`.
pub fn forward_key(buf: &mut Vec<u8>, id: &Identity) -> Result<()> {
    build(buf, FORWARD_TAG, &[id.rrname, id.sensor_id, id.rrtype, id.rdata])
}

/// Writes the inverted key of `id` into `buf`.
pub fn inverted_key(buf: &mut Vec<u8>, id: &Identity) -> Result<()> {
    build(buf, INVERTED_TAG, &[id.rdata, id.sensor_id, id.rrname, id.rrtype])
}

/// Writes the forward-key prefix for a query by name into `buf`. The
/// prefix ends with a delimiter, so it only matches keys whose rrname
/// (and sensor ID, if given) match exactly.
pub fn forward_prefix(buf: &mut Vec<u8>, rrname: &[u8], sensor_id: Option<&[u8]>) {
    prefix(buf, FORWARD_TAG, rrname, sensor_id)
}

/// Writes the inverted-key prefix for a query by answer data into
/// `buf`.
pub fn inverted_prefix(buf: &mut Vec<u8>, rdata: &[u8], sensor_id: Option<&[u8]>) {
    prefix(buf, INVERTED_TAG, rdata, sensor_id)
}

fn prefix(buf: &mut Vec<u8>, tag: u8, first: &[u8], sensor_id: Option<&[u8]>) {
    buf.clear();
    buf.push(tag);
    buf.push(DELIMITER);
    buf.extend_from_slice(first);
    buf.push(DELIMITER);
    if let Some(sensor_id) = sensor_id {
        buf.extend_from_slice(sensor_id);
        buf.push(DELIMITER);
    }
}

////////////////////////////////////////////////////////////////////////
// KEY TOKENIZATION                                                   //
////////////////////////////////////////////////////////////////////////

/// Splits a forward key into its identity fields.
///
/// Fields are split left to right at the first three delimiters after
/// the tag; everything after the third is the rdata. Returns [`None`]
/// if the key is not a forward key or has fewer than three delimiters
/// after the tag.
pub fn split_forward(key: &[u8]) -> Option<Identity> {
    let body = strip_tag(key, FORWARD_TAG)?;
    let mut parts = body.splitn(4, |&b| b == DELIMITER);
    let rrname = parts.next()?;
    let sensor_id = parts.next()?;
    let rrtype = parts.next()?;
    let rdata = parts.next()?;
    Some(Identity {
        rrname,
        sensor_id,
        rrtype,
        rdata,
    })
}

/// Splits an inverted key into its identity fields.
///
/// Fields are split right to left at the last three delimiters;
/// everything between the tag and the third delimiter from the tail is
/// the rdata. Returns [`None`] if the key is not an inverted key or
/// has fewer than three delimiters after the tag.
pub fn split_inverted(key: &[u8]) -> Option<Identity> {
    let body = strip_tag(key, INVERTED_TAG)?;
    let mut parts = body.rsplitn(4, |&b| b == DELIMITER);
    let rrtype = parts.next()?;
    let rrname = parts.next()?;
    let sensor_id = parts.next()?;
    let rdata = parts.next()?;
    Some(Identity {
        rrname,
        sensor_id,
        rrtype,
        rdata,
    })
}

fn strip_tag(key: &[u8], tag: u8) -> Option<&[u8]> {
    match key {
        [t, DELIMITER, body @ ..] if *t == tag => Some(body),
        _ => None,
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    const ID: Identity = Identity {
        rrname: b"example.com",
        sensor_id: b"s1",
        rrtype: b"A",
        rdata: b"1.2.3.4",
    };

    #[test]
    fn keys_have_expected_layout() {
        let mut buf = Vec::new();
        forward_key(&mut buf, &ID).unwrap();
        assert_eq!(buf, b"o\x1fexample.com\x1fs1\x1fA\x1f1.2.3.4");
        inverted_key(&mut buf, &ID).unwrap();
        assert_eq!(buf, b"i\x1f1.2.3.4\x1fs1\x1fexample.com\x1fA");
    }

    #[test]
    fn rdata_with_delimiters_survives_both_directions() {
        let id = Identity {
            rdata: b"\x1fv=spf1\x1f\x1finclude\x1f",
            ..ID
        };
        let mut buf = Vec::new();
        forward_key(&mut buf, &id).unwrap();
        assert_eq!(split_forward(&buf), Some(id));
        inverted_key(&mut buf, &id).unwrap();
        assert_eq!(split_inverted(&buf), Some(id));
    }

    #[test]
    fn empty_fields_are_preserved() {
        let id = Identity {
            rrname: b"",
            sensor_id: b"",
            rrtype: b"",
            rdata: b"",
        };
        let mut buf = Vec::new();
        forward_key(&mut buf, &id).unwrap();
        assert_eq!(split_forward(&buf), Some(id));
        inverted_key(&mut buf, &id).unwrap();
        assert_eq!(split_inverted(&buf), Some(id));
    }

    #[test]
    fn malformed_keys_do_not_split() {
        assert_eq!(split_forward(b""), None);
        assert_eq!(split_forward(b"o"), None);
        assert_eq!(split_forward(b"o\x1fname\x1fsensor\x1ftype"), None);
        assert_eq!(split_forward(b"i\x1fa\x1fb\x1fc\x1fd"), None);
        assert_eq!(split_inverted(b"i\x1fdata\x1fsensor\x1fname"), None);
        assert_eq!(split_inverted(b"ix\x1fa\x1fb\x1fc"), None);
        assert_eq!(split_inverted(b"o\x1fa\x1fb\x1fc\x1fd"), None);
    }

    #[test]
    fn long_keys_are_rejected() {
        let rdata = vec![b'x'; MAX_KEY_LEN];
        let id = Identity {
            rdata: &rdata,
            ..ID
        };
        let mut buf = Vec::new();
        assert!(matches!(forward_key(&mut buf, &id), Err(Error::KeyTooLong(_))));
        assert!(matches!(inverted_key(&mut buf, &id), Err(Error::KeyTooLong(_))));
        assert!(buf.is_empty());
    }

    #[test]
    fn prefixes_end_with_delimiter() {
        let mut buf = Vec::new();
        forward_prefix(&mut buf, b"a", None);
        assert_eq!(buf, b"o\x1fa\x1f");
        forward_prefix(&mut buf, b"a", Some(b"s1"));
        assert_eq!(buf, b"o\x1fa\x1fs1\x1f");
        inverted_prefix(&mut buf, b"1.2.3.4", None);
        assert_eq!(buf, b"i\x1f1.2.3.4\x1f");
    }
}
