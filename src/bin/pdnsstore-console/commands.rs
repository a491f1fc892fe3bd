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

//! Implements the console commands.

use std::borrow::Cow;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;

use pdnsstore::client::Client;
use pdnsstore::protocol::{write_dump_entry, DumpReader, Limits, QueryRequest};
use pdnsstore::{Entry, EntryRef};

use crate::args::{Args, Command};

/// Runs the command selected on the command line.
pub fn execute(args: Args) -> Result<()> {
    match args.command {
        Command::Jsonize { input } => jsonize(open_input(input.as_deref())?),
        Command::Dump { remote, hint } => dump(remote.store, &hint),
        Command::Replay {
            remote,
            batch,
            input,
        } => replay(remote.store, batch, open_input(input.as_deref())?),
        Command::Query {
            remote,
            rrname,
            rrtype,
            rdata,
            sensor_id,
            limit,
        } => {
            let request = QueryRequest {
                rrname: rrname.map(String::into_bytes),
                rrtype: rrtype.map(String::into_bytes),
                rdata: rdata.map(String::into_bytes),
                sensor_id: sensor_id.map(String::into_bytes),
                limit,
            };
            query(remote.store, &request)
        }
        Command::Backup { remote, path } => backup(remote.store, &path),
    }
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn Read>> {
    match path {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(io::stdin().lock())),
    }
}

fn connect(store: SocketAddr) -> Result<Client> {
    Client::connect(store).with_context(|| format!("failed to connect to {}", store))
}

////////////////////////////////////////////////////////////////////////
// JSON OUTPUT                                                        //
////////////////////////////////////////////////////////////////////////

/// The JSON form of an entry. Fields that are not valid UTF-8 are
/// converted lossily.
#[derive(Debug, Serialize)]
struct JsonEntry<'a> {
    rrname: Cow<'a, str>,
    rrtype: Cow<'a, str>,
    rdata: Cow<'a, str>,
    sensor_id: Cow<'a, str>,
    count: u32,
    first_seen: u32,
    last_seen: u32,
}

impl<'a> From<&'a Entry> for JsonEntry<'a> {
    fn from(entry: &'a Entry) -> Self {
        Self {
            rrname: String::from_utf8_lossy(&entry.rrname),
            rrtype: String::from_utf8_lossy(&entry.rrtype),
            rdata: String::from_utf8_lossy(&entry.rdata),
            sensor_id: String::from_utf8_lossy(&entry.sensor_id),
            count: entry.count,
            first_seen: entry.first_seen,
            last_seen: entry.last_seen,
        }
    }
}

fn write_json<W: Write>(out: &mut W, entry: &Entry) -> Result<()> {
    serde_json::to_writer(&mut *out, &JsonEntry::from(entry))?;
    out.write_all(b"\n")?;
    Ok(())
}

////////////////////////////////////////////////////////////////////////
// COMMANDS                                                           //
////////////////////////////////////////////////////////////////////////

fn jsonize(input: Box<dyn Read>) -> Result<()> {
    let mut out = BufWriter::new(io::stdout().lock());
    for (i, entry) in DumpReader::new(input, Limits::default()).enumerate() {
        let entry = entry.with_context(|| format!("failed to decode record {}", i + 1))?;
        write_json(&mut out, &entry)?;
    }
    out.flush()?;
    Ok(())
}

fn dump(store: SocketAddr, hint: &str) -> Result<()> {
    let records = connect(store)?
        .dump(hint)
        .context("failed to request the dump")?;
    let mut out = BufWriter::new(io::stdout().lock());
    let mut count = 0u64;
    for entry in records {
        let entry = entry.with_context(|| format!("failed to decode record {}", count + 1))?;
        write_dump_entry(&mut out, &entry.as_entry_ref())?;
        count += 1;
    }
    out.flush()?;
    info!("Received {} records", count);
    Ok(())
}

fn replay(store: SocketAddr, batch: usize, input: Box<dyn Read>) -> Result<()> {
    let batch = batch.max(1);
    let mut client = connect(store)?;
    let mut pending = Vec::with_capacity(batch);
    let mut count = 0u64;
    for (i, entry) in DumpReader::new(input, Limits::default()).enumerate() {
        pending.push(entry.with_context(|| format!("failed to decode record {}", i + 1))?);
        if pending.len() == batch {
            count += send(&mut client, &mut pending)?;
        }
    }
    count += send(&mut client, &mut pending)?;
    client.shutdown().context("failed to close the connection")?;
    info!("Replayed {} records", count);
    Ok(())
}

/// Sends the pending entries as one input request and clears them.
fn send(client: &mut Client, pending: &mut Vec<Entry>) -> Result<u64> {
    if pending.is_empty() {
        return Ok(0);
    }
    let refs: Vec<EntryRef> = pending.iter().map(Entry::as_entry_ref).collect();
    client.input(&refs).context("failed to send input")?;
    let n = pending.len() as u64;
    pending.clear();
    Ok(n)
}

fn query(store: SocketAddr, query: &QueryRequest) -> Result<()> {
    let mut client = connect(store)?;
    let mut out = BufWriter::new(io::stdout().lock());
    let mut failure = None;
    let n = client
        .query_each(query, |entry| {
            if failure.is_none() {
                failure = write_json(&mut out, &entry).err();
            }
        })
        .context("failed to run the query")?;
    if let Some(e) = failure {
        return Err(e.context("failed to write the results"));
    }
    out.flush()?;
    info!("{} results", n);
    Ok(())
}

fn backup(store: SocketAddr, path: &str) -> Result<()> {
    let mut client = connect(store)?;
    client.backup(path).context("failed to request the backup")?;
    client.shutdown().context("failed to close the connection")?;
    info!("Requested a backup to {}; check the store's log for the outcome", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_lines_are_lossy_utf8() {
        let entry = Entry {
            rrname: b"example.com".to_vec(),
            rrtype: b"TXT".to_vec(),
            rdata: b"\xffv=spf1".to_vec(),
            sensor_id: b"s1".to_vec(),
            count: 3,
            first_seen: 10,
            last_seen: 20,
        };
        let mut out = Vec::new();
        write_json(&mut out, &entry).unwrap();
        let line = String::from_utf8(out).unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["rrname"], "example.com");
        assert_eq!(value["rdata"], "\u{fffd}v=spf1");
        assert_eq!(value["count"], 3);
        assert_eq!(value["last_seen"], 20);
    }
}
