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

//! Decoding of message envelopes and payloads.

use std::io::Read;
use std::path::PathBuf;

use super::error::{Error, Result};
use super::node::{decode_slice, Node, NodeReader};
use super::{Limits, Message, MessageType, QueryRequest};
use crate::entry::Entry;

////////////////////////////////////////////////////////////////////////
// MESSAGE READER                                                     //
////////////////////////////////////////////////////////////////////////

/// Reads [`Message`]s from a byte stream.
pub struct MessageReader<R> {
    nodes: NodeReader<R>,
    limits: Limits,
}

impl<R: Read> MessageReader<R> {
    /// Creates a new `MessageReader`.
    pub fn new(reader: R, limits: Limits) -> Self {
        Self {
            nodes: NodeReader::new(reader, limits),
            limits,
        }
    }

    /// Reads the next message.
    ///
    /// [`Error::Eof`] means the peer closed the stream cleanly between
    /// messages. Any other error leaves the stream in an unknown state.
    pub fn read_message(&mut self) -> Result<Message> {
        let envelope = self.nodes.read_node()?;
        let (message_type, payload) = decode_envelope(envelope)?;
        decode_payload(message_type, &payload, self.limits)
    }

    /// Consumes the `MessageReader`, returning the underlying reader.
    pub fn into_inner(self) -> R {
        self.nodes.into_inner()
    }
}

fn decode_envelope(envelope: Node) -> Result<(MessageType, Vec<u8>)> {
    let pairs = match envelope {
        Node::Map(pairs) if pairs.len() == 2 => pairs,
        _ => return Err(Error::Malformed("envelope is not a two-key map")),
    };
    let mut tag = None;
    let mut payload = None;
    for (key, value) in pairs {
        match key.as_bytes() {
            Some(b"T") if tag.is_none() => {
                tag = Some(value.as_uint().ok_or(Error::Malformed("type tag is not an integer"))?);
            }
            Some(b"M") if payload.is_none() => {
                payload = Some(value.into_bytes().ok_or(Error::Malformed("payload is not binary"))?);
            }
            _ => return Err(Error::Malformed("unexpected envelope key")),
        }
    }
    match (tag, payload) {
        (Some(tag), Some(payload)) => {
            let message_type = MessageType::from_tag(tag).ok_or(Error::UnknownType(tag))?;
            Ok((message_type, payload))
        }
        _ => Err(Error::Malformed("envelope is missing a key")),
    }
}

fn decode_payload(message_type: MessageType, payload: &[u8], limits: Limits) -> Result<Message> {
    match message_type {
        MessageType::InputRequest => decode_input(decode_slice(payload, limits)?).map(Message::Input),
        MessageType::QueryRequest => decode_query(decode_slice(payload, limits)?).map(Message::Query),
        MessageType::BackupRequest => decode_path(decode_slice(payload, limits)?).map(Message::Backup),
        MessageType::DumpRequest => decode_path(decode_slice(payload, limits)?).map(Message::Dump),
        MessageType::StreamData => decode_entry(decode_slice(payload, limits)?).map(Message::StreamData),
        MessageType::StreamStart => Ok(Message::StreamStart),
        MessageType::StreamEnd => Ok(Message::StreamEnd),
    }
}

////////////////////////////////////////////////////////////////////////
// PAYLOADS                                                           //
////////////////////////////////////////////////////////////////////////

/// Unwraps a map with exactly one key, `key`, returning its value.
fn single_key_map(node: Node, key: &[u8], what: &'static str) -> Result<Node> {
    match node {
        Node::Map(pairs) if pairs.len() == 1 => {
            let (k, v) = pairs.into_iter().next().ok_or(Error::Malformed(what))?;
            if k.as_bytes() == Some(key) {
                Ok(v)
            } else {
                Err(Error::Malformed(what))
            }
        }
        _ => Err(Error::Malformed(what)),
    }
}

/// Decodes an input request payload. The observations may be an array
/// of entry maps or, from older writers, a single entry map.
fn decode_input(node: Node) -> Result<Vec<Entry>> {
    match single_key_map(node, b"O", "input request is not a map with key O")? {
        Node::Array(elements) => elements.into_iter().map(decode_entry).collect(),
        map @ Node::Map(_) => Ok(vec![decode_entry(map)?]),
        _ => Err(Error::Malformed("input observations are not an array")),
    }
}

fn decode_path(node: Node) -> Result<PathBuf> {
    let path = single_key_map(node, b"P", "path request is not a map with key P")?
        .into_bytes()
        .ok_or(Error::Malformed("path is not a string"))?;
    String::from_utf8(path)
        .map(PathBuf::from)
        .map_err(|_| Error::Malformed("path is not valid UTF-8"))
}

/// Decodes an entry map. The map must have exactly the seven entry
/// keys, each exactly once.
pub(super) fn decode_entry(node: Node) -> Result<Entry> {
    let pairs = match node {
        Node::Map(pairs) if pairs.len() == 7 => pairs,
        _ => return Err(Error::Malformed("entry is not a seven-key map")),
    };

    let mut rrname = None;
    let mut rrtype = None;
    let mut rdata = None;
    let mut sensor_id = None;
    let mut count = None;
    let mut first_seen = None;
    let mut last_seen = None;

    fn slot_bytes(slot: &mut Option<Vec<u8>>, value: Node) -> Result<()> {
        if slot.is_some() {
            return Err(Error::Malformed("duplicate entry key"));
        }
        *slot = Some(value.into_bytes().ok_or(Error::Malformed("entry field is not a string"))?);
        Ok(())
    }

    fn slot_u32(slot: &mut Option<u32>, value: Option<u32>) -> Result<()> {
        if slot.is_some() {
            return Err(Error::Malformed("duplicate entry key"));
        }
        *slot = Some(value.ok_or(Error::Malformed("entry field is not a valid integer"))?);
        Ok(())
    }

    for (key, value) in pairs {
        match key.as_bytes() {
            Some(b"N") => slot_bytes(&mut rrname, value)?,
            Some(b"T") => slot_bytes(&mut rrtype, value)?,
            Some(b"D") => slot_bytes(&mut rdata, value)?,
            Some(b"I") => slot_bytes(&mut sensor_id, value)?,
            Some(b"C") => {
                let n = value.as_uint().and_then(|n| n.try_into().ok());
                slot_u32(&mut count, n)?
            }
            Some(b"F") => slot_u32(&mut first_seen, value.as_timestamp())?,
            Some(b"L") => slot_u32(&mut last_seen, value.as_timestamp())?,
            _ => return Err(Error::Malformed("unexpected entry key")),
        }
    }

    // With seven pairs, seven distinct known keys means none is
    // missing, so these cannot fail. They are checked regardless.
    let missing = || Error::Malformed("entry is missing a key");
    Ok(Entry {
        rrname: rrname.ok_or_else(missing)?,
        rrtype: rrtype.ok_or_else(missing)?,
        rdata: rdata.ok_or_else(missing)?,
        sensor_id: sensor_id.ok_or_else(missing)?,
        count: count.ok_or_else(missing)?,
        first_seen: first_seen.ok_or_else(missing)?,
        last_seen: last_seen.ok_or_else(missing)?,
    })
}

/// Decodes a query request. The map must have exactly the nine query
/// keys. A field whose "have" flag is false is absent regardless of
/// any value sent for it.
fn decode_query(node: Node) -> Result<QueryRequest> {
    let pairs = match node {
        Node::Map(pairs) if pairs.len() == 9 => pairs,
        _ => return Err(Error::Malformed("query is not a nine-key map")),
    };

    #[derive(Default)]
    struct Field {
        value: Option<Option<Vec<u8>>>,
        have: Option<bool>,
    }

    impl Field {
        fn set_value(&mut self, value: Node) -> Result<()> {
            if self.value.is_some() {
                return Err(Error::Malformed("duplicate query key"));
            }
            self.value = Some(match value {
                Node::Nil => None,
                other => Some(other.into_bytes().ok_or(Error::Malformed("query field is not a string"))?),
            });
            Ok(())
        }

        fn set_have(&mut self, value: Node) -> Result<()> {
            if self.have.is_some() {
                return Err(Error::Malformed("duplicate query key"));
            }
            self.have = Some(value.as_bool().ok_or(Error::Malformed("query flag is not a boolean"))?);
            Ok(())
        }

        fn finish(self) -> Result<Option<Vec<u8>>> {
            match (self.value, self.have) {
                (Some(_), Some(false)) => Ok(None),
                (Some(Some(value)), Some(true)) => Ok(Some(value)),
                (Some(None), Some(true)) => Err(Error::Malformed("query flag set for a nil field")),
                _ => Err(Error::Malformed("query is missing a key")),
            }
        }
    }

    let mut rrname = Field::default();
    let mut rrtype = Field::default();
    let mut rdata = Field::default();
    let mut sensor_id = Field::default();
    let mut limit = None;

    for (key, value) in pairs {
        match key.as_bytes() {
            Some(b"Qrrname") => rrname.set_value(value)?,
            Some(b"Qrrtype") => rrtype.set_value(value)?,
            Some(b"Qrdata") => rdata.set_value(value)?,
            Some(b"QsensorID") => sensor_id.set_value(value)?,
            Some(b"Hrrname") => rrname.set_have(value)?,
            Some(b"Hrrtype") => rrtype.set_have(value)?,
            Some(b"Hrdata") => rdata.set_have(value)?,
            Some(b"HsensorID") => sensor_id.set_have(value)?,
            Some(b"Limit") if limit.is_none() => {
                let n = value.as_int().ok_or(Error::Malformed("query limit is not an integer"))?;
                // Negative limits yield no results.
                limit = Some(usize::try_from(n.max(0)).unwrap_or(usize::MAX));
            }
            _ => return Err(Error::Malformed("unexpected query key")),
        }
    }

    Ok(QueryRequest {
        rrname: rrname.finish()?,
        rrtype: rrtype.finish()?,
        rdata: rdata.finish()?,
        sensor_id: sensor_id.finish()?,
        limit: limit.ok_or(Error::Malformed("query is missing a key"))?,
    })
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::Write;

    use rmp::encode::{write_bin, write_bool, write_map_len, write_sint, write_str, write_uint};

    use super::*;
    use crate::protocol::MessageWriter;

    fn envelope(tag: u64, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_map_len(&mut buf, 2).unwrap();
        write_str(&mut buf, "T").unwrap();
        write_uint(&mut buf, tag).unwrap();
        write_str(&mut buf, "M").unwrap();
        write_bin(&mut buf, payload).unwrap();
        buf
    }

    fn read_one(buf: &[u8]) -> Result<Message> {
        MessageReader::new(buf, Limits::default()).read_message()
    }

    fn sample_entry() -> Entry {
        Entry {
            rrname: b"example.com".to_vec(),
            rrtype: b"A".to_vec(),
            rdata: b"1.2.3.4\x1fwith-delimiter\xff".to_vec(),
            sensor_id: b"s1".to_vec(),
            count: 3,
            first_seen: 100,
            last_seen: 200,
        }
    }

    /// Writes an entry map with the given keys, filling values in the
    /// usual way. Unknown keys get a string value.
    fn entry_map(keys: &[&str]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_map_len(&mut buf, keys.len() as u32).unwrap();
        for key in keys {
            write_str(&mut buf, key).unwrap();
            match *key {
                "C" | "F" | "L" => {
                    write_uint(&mut buf, 1).unwrap();
                }
                _ => write_str(&mut buf, "x").unwrap(),
            }
        }
        buf
    }

    fn input_payload(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut buf = Vec::new();
        write_map_len(&mut buf, 1).unwrap();
        write_str(&mut buf, "O").unwrap();
        rmp::encode::write_array_len(&mut buf, entries.len() as u32).unwrap();
        for entry in entries {
            buf.write_all(entry).unwrap();
        }
        buf
    }

    #[test]
    fn input_request_preserves_binary_fields() {
        let entry = sample_entry();
        let mut writer = MessageWriter::new();
        let buf = writer.input_request(&[entry.as_entry_ref()]).unwrap().to_vec();
        assert_eq!(read_one(&buf).unwrap(), Message::Input(vec![entry]));
    }

    #[test]
    fn input_accepts_single_entry_map() {
        let mut payload = Vec::new();
        write_map_len(&mut payload, 1).unwrap();
        write_str(&mut payload, "O").unwrap();
        payload.extend_from_slice(&entry_map(&["N", "T", "D", "I", "C", "F", "L"]));
        match read_one(&envelope(1, &payload)).unwrap() {
            Message::Input(entries) => assert_eq!(entries.len(), 1),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn input_accepts_timestamp_extensions() {
        let mut map = Vec::new();
        write_map_len(&mut map, 7).unwrap();
        for key in ["N", "T", "D", "I"] {
            write_str(&mut map, key).unwrap();
            write_bin(&mut map, b"v").unwrap();
        }
        write_str(&mut map, "C").unwrap();
        write_uint(&mut map, 1).unwrap();
        write_str(&mut map, "F").unwrap();
        rmp::encode::write_ext_meta(&mut map, 4, -1).unwrap();
        map.write_all(&100u32.to_be_bytes()).unwrap();
        write_str(&mut map, "L").unwrap();
        rmp::encode::write_ext_meta(&mut map, 8, -1).unwrap();
        map.write_all(&200u64.to_be_bytes()).unwrap();

        match read_one(&envelope(1, &input_payload(&[map]))).unwrap() {
            Message::Input(entries) => {
                assert_eq!(entries[0].rrname, b"v");
                assert_eq!(entries[0].first_seen, 100);
                assert_eq!(entries[0].last_seen, 200);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn entry_key_set_is_strict() {
        let bad_maps = [
            entry_map(&["N", "T", "D", "I", "C", "F"]),
            entry_map(&["N", "T", "D", "I", "C", "F", "L", "X"]),
            entry_map(&["N", "T", "D", "I", "C", "F", "X"]),
            entry_map(&["N", "N", "D", "I", "C", "F", "L"]),
        ];
        for map in bad_maps {
            let buf = envelope(1, &input_payload(&[map]));
            assert!(matches!(read_one(&buf), Err(Error::Malformed(_))));
        }
    }

    #[test]
    fn oversized_count_is_rejected() {
        let mut map = Vec::new();
        write_map_len(&mut map, 7).unwrap();
        for key in ["N", "T", "D", "I"] {
            write_str(&mut map, key).unwrap();
            write_str(&mut map, "v").unwrap();
        }
        write_str(&mut map, "C").unwrap();
        write_uint(&mut map, 1 << 33).unwrap();
        for key in ["F", "L"] {
            write_str(&mut map, key).unwrap();
            write_uint(&mut map, 1).unwrap();
        }
        let buf = envelope(1, &input_payload(&[map]));
        assert!(matches!(read_one(&buf), Err(Error::Malformed(_))));
    }

    fn query_payload(
        fields: [(&str, Option<&str>, bool); 4],
        limit: i64,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        write_map_len(&mut buf, 9).unwrap();
        for (name, value, have) in fields {
            write_str(&mut buf, &format!("Q{}", name)).unwrap();
            write_str(&mut buf, value.unwrap_or("")).unwrap();
            write_str(&mut buf, &format!("H{}", name)).unwrap();
            write_bool(&mut buf, have).unwrap();
        }
        write_str(&mut buf, "Limit").unwrap();
        write_sint(&mut buf, limit).unwrap();
        buf
    }

    #[test]
    fn have_flags_select_fields() {
        let payload = query_payload(
            [
                ("rrname", Some("example.com"), true),
                ("rrtype", Some("ignored"), false),
                ("rdata", Some(""), true),
                ("sensorID", None, false),
            ],
            10,
        );
        assert_eq!(
            read_one(&envelope(2, &payload)).unwrap(),
            Message::Query(QueryRequest {
                rrname: Some(b"example.com".to_vec()),
                rrtype: None,
                rdata: Some(Vec::new()),
                sensor_id: None,
                limit: 10,
            })
        );
    }

    #[test]
    fn negative_limit_is_zero() {
        let payload = query_payload(
            [
                ("rrname", Some("a"), true),
                ("rrtype", None, false),
                ("rdata", None, false),
                ("sensorID", None, false),
            ],
            -5,
        );
        match read_one(&envelope(2, &payload)).unwrap() {
            Message::Query(query) => assert_eq!(query.limit, 0),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn query_key_set_is_strict() {
        let mut payload = query_payload(
            [
                ("rrname", Some("a"), true),
                ("rrtype", None, false),
                ("rdata", None, false),
                ("sensorID", None, false),
            ],
            1,
        );
        // Turn "Limit" into "Limxt".
        let pos = payload.windows(5).position(|w| w == b"Limit").unwrap();
        payload[pos + 3] = b'x';
        assert!(matches!(
            read_one(&envelope(2, &payload)),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn envelope_errors_are_classified() {
        assert!(matches!(read_one(&[]), Err(Error::Eof)));
        assert!(matches!(read_one(&[0x82, 0xa1]), Err(Error::Truncated)));
        assert!(matches!(read_one(&[0x90]), Err(Error::Malformed(_))));
        assert!(matches!(
            read_one(&envelope(128, &[0x80])),
            Err(Error::UnknownType(128))
        ));
        // A payload with trailing octets.
        let mut payload = Vec::new();
        write_map_len(&mut payload, 1).unwrap();
        write_str(&mut payload, "P").unwrap();
        write_str(&mut payload, "/tmp").unwrap();
        payload.push(0xc0);
        assert!(matches!(
            read_one(&envelope(3, &payload)),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn messages_are_read_back_to_back() {
        let mut writer = MessageWriter::new();
        let mut buf = Vec::new();
        buf.extend_from_slice(writer.backup_request("/tmp/backup").unwrap());
        buf.extend_from_slice(writer.stream_start().unwrap());
        buf.extend_from_slice(writer.stream_data(&sample_entry().as_entry_ref()).unwrap());
        buf.extend_from_slice(writer.stream_end().unwrap());
        buf.extend_from_slice(writer.dump_request("/tmp/dump").unwrap());

        let mut reader = MessageReader::new(&buf[..], Limits::default());
        assert_eq!(
            reader.read_message().unwrap(),
            Message::Backup(PathBuf::from("/tmp/backup"))
        );
        assert_eq!(reader.read_message().unwrap(), Message::StreamStart);
        assert_eq!(
            reader.read_message().unwrap(),
            Message::StreamData(sample_entry())
        );
        assert_eq!(reader.read_message().unwrap(), Message::StreamEnd);
        assert_eq!(
            reader.read_message().unwrap(),
            Message::Dump(PathBuf::from("/tmp/dump"))
        );
        assert!(matches!(reader.read_message(), Err(Error::Eof)));
    }
}
