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

//! Query, dump and input algorithms shared by the provided backends.
//!
//! The algorithms only need an ordered key-value view of the store,
//! which each backend supplies through the [`Store`] trait.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, error, warn};

use super::key::{self, Identity, KeyBuffers, FORWARD_TAG};
use super::{Error, OrphanPolicy, Result, Sink};
use crate::entry::{Aggregate, Entry, EntryRef};
use crate::protocol::QueryRequest;

/// A point lookup valid for the duration of a scan.
pub(super) trait Lookup {
    /// Looks up the aggregate stored under `key`. Returns [`None`] if
    /// the key does not exist. An undecodable value is reported as
    /// `Some(None)`.
    fn get_aggregate(&self, key: &[u8]) -> Result<Option<Option<Aggregate>>>;
}

/// The continuation of a scan.
pub(super) type Flow = ControlFlow<()>;

/// An ordered key-value view of a store.
pub(super) trait Store {
    /// Visits every key at or after `start` in ascending order until
    /// `visit` breaks. `visit` is also handed a [`Lookup`] that may be
    /// used for point lookups while the scan is in progress.
    fn scan(
        &self,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8], &dyn Lookup) -> Result<Flow>,
    ) -> Result<()>;
}

/// Returns whether an optional filter accepts `value`.
fn accepts(filter: &Option<Vec<u8>>, value: &[u8]) -> bool {
    filter.as_deref().map_or(true, |f| f == value)
}

fn push(sink: &mut dyn Sink, entry: &EntryRef) -> Result<()> {
    sink.push(entry).map_err(Error::Sink)
}

////////////////////////////////////////////////////////////////////////
// QUERY                                                              //
////////////////////////////////////////////////////////////////////////

/// Runs a query, choosing the strategy by which fields are present: by
/// name if the rrname is given, otherwise by answer data. A query with
/// neither yields nothing.
pub(super) fn query(
    store: &dyn Store,
    keys: &mut KeyBuffers,
    query: &QueryRequest,
    orphans: &Orphans,
    sink: &mut dyn Sink,
) -> Result<usize> {
    if query.limit == 0 {
        return Ok(0);
    }
    if let Some(rrname) = &query.rrname {
        query_by_name(store, keys, rrname, query, sink)
    } else if let Some(rdata) = &query.rdata {
        query_by_rdata(store, keys, rdata, query, orphans, sink)
    } else {
        warn!("Ignoring query with neither rrname nor rdata");
        Ok(0)
    }
}

fn query_by_name(
    store: &dyn Store,
    keys: &mut KeyBuffers,
    rrname: &[u8],
    query: &QueryRequest,
    sink: &mut dyn Sink,
) -> Result<usize> {
    key::forward_prefix(&mut keys.forward, rrname, query.sensor_id.as_deref());
    let prefix = &keys.forward;
    debug!("Scanning forward keys from {}", prefix.escape_ascii());

    let mut hits = 0;
    store.scan(prefix, &mut |k, value, _| {
        if !k.starts_with(prefix) {
            return Ok(Flow::Break(()));
        }
        let id = match key::split_forward(k) {
            Some(id) => id,
            None => {
                error!("Skipping invalid forward key {}", k.escape_ascii());
                return Ok(Flow::Continue(()));
            }
        };

        // Keys are sorted, so once the rrname differs no later key can
        // match.
        if id.rrname != rrname {
            return Ok(Flow::Break(()));
        }
        if !accepts(&query.sensor_id, id.sensor_id)
            || !accepts(&query.rdata, id.rdata)
            || !accepts(&query.rrtype, id.rrtype)
        {
            return Ok(Flow::Continue(()));
        }

        let aggregate = match Aggregate::decode(value) {
            Some(aggregate) => aggregate,
            None => {
                error!("Skipping undecodable value under key {}", k.escape_ascii());
                return Ok(Flow::Continue(()));
            }
        };
        push(sink, &entry_ref(&id, aggregate))?;
        hits += 1;
        Ok(if hits < query.limit {
            Flow::Continue(())
        } else {
            Flow::Break(())
        })
    })?;
    Ok(hits)
}

fn query_by_rdata(
    store: &dyn Store,
    keys: &mut KeyBuffers,
    rdata: &[u8],
    query: &QueryRequest,
    orphans: &Orphans,
    sink: &mut dyn Sink,
) -> Result<usize> {
    key::inverted_prefix(&mut keys.inverted, rdata, query.sensor_id.as_deref());
    let prefix = &keys.inverted;
    let forward = &mut keys.forward;
    debug!("Scanning inverted keys from {}", prefix.escape_ascii());

    let mut hits = 0;
    store.scan(prefix, &mut |k, _, lookup| {
        if !k.starts_with(prefix) {
            return Ok(Flow::Break(()));
        }
        let id = match key::split_inverted(k) {
            Some(id) => id,
            None => {
                error!("Skipping invalid inverted key {}", k.escape_ascii());
                return Ok(Flow::Continue(()));
            }
        };

        // Unlike the rrname in a forward key, the rdata may contain the
        // delimiter, so a key under the prefix can still carry a longer
        // rdata. Keep scanning.
        if id.rdata != rdata {
            return Ok(Flow::Continue(()));
        }
        if !accepts(&query.sensor_id, id.sensor_id) || !accepts(&query.rrtype, id.rrtype) {
            return Ok(Flow::Continue(()));
        }

        if let Err(e) = key::forward_key(forward, &id) {
            error!("Skipping inverted key {}: {}", k.escape_ascii(), e);
            return Ok(Flow::Continue(()));
        }
        let aggregate = match lookup.get_aggregate(forward)? {
            Some(Some(aggregate)) => aggregate,
            Some(None) => {
                error!("Skipping undecodable value under key {}", forward.escape_ascii());
                return Ok(Flow::Continue(()));
            }
            None => {
                orphans.record(k);
                return Ok(Flow::Continue(()));
            }
        };
        push(sink, &entry_ref(&id, aggregate))?;
        hits += 1;
        Ok(if hits < query.limit {
            Flow::Continue(())
        } else {
            Flow::Break(())
        })
    })?;
    Ok(hits)
}

fn entry_ref<'a>(id: &Identity<'a>, aggregate: Aggregate) -> EntryRef<'a> {
    EntryRef::from_parts(id.rrname, id.sensor_id, id.rrtype, id.rdata, aggregate)
}

////////////////////////////////////////////////////////////////////////
// DUMP                                                               //
////////////////////////////////////////////////////////////////////////

/// Pushes every forward-key observation into `sink` in key order.
pub(super) fn dump(store: &dyn Store, sink: &mut dyn Sink) -> Result<u64> {
    let mut count = 0;
    store.scan(&[FORWARD_TAG], &mut |k, value, _| {
        if k.first() != Some(&FORWARD_TAG) {
            return Ok(Flow::Break(()));
        }
        let id = match key::split_forward(k) {
            Some(id) => id,
            None => {
                error!("Skipping invalid forward key {}", k.escape_ascii());
                return Ok(Flow::Continue(()));
            }
        };
        let aggregate = match Aggregate::decode(value) {
            Some(aggregate) => aggregate,
            None => {
                error!("Skipping undecodable value under key {}", k.escape_ascii());
                return Ok(Flow::Continue(()));
            }
        };
        push(sink, &entry_ref(&id, aggregate))?;
        count += 1;
        Ok(Flow::Continue(()))
    })?;
    Ok(count)
}

////////////////////////////////////////////////////////////////////////
// INPUT                                                              //
////////////////////////////////////////////////////////////////////////

/// Builds both keys of `entry` into `keys`.
pub(super) fn build_keys(keys: &mut KeyBuffers, entry: &Entry) -> Result<()> {
    let id = Identity {
        rrname: &entry.rrname,
        sensor_id: &entry.sensor_id,
        rrtype: &entry.rrtype,
        rdata: &entry.rdata,
    };
    key::forward_key(&mut keys.forward, &id)?;
    key::inverted_key(&mut keys.inverted, &id)
}

////////////////////////////////////////////////////////////////////////
// ORPHANS                                                            //
////////////////////////////////////////////////////////////////////////

/// Counts inverted keys whose forward counterpart is missing.
#[derive(Debug, Default)]
pub(super) struct Orphans {
    policy: OrphanPolicy,
    count: AtomicU64,
}

impl Orphans {
    pub fn new(policy: OrphanPolicy) -> Self {
        Self {
            policy,
            count: AtomicU64::new(0),
        }
    }

    fn record(&self, inverted_key: &[u8]) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if self.policy == OrphanPolicy::Warn {
            warn!(
                "Inverted key {} has no forward key; skipping",
                inverted_key.escape_ascii()
            );
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

/// Behavior every backend must show. Each backend's test module runs
/// these against a fresh instance.
#[cfg(test)]
pub(super) mod tests {
    use std::net::SocketAddr;
    use std::path::Path;

    use super::super::{Backend, Error, MemoryBackend, OrphanPolicy};
    use super::*;

    pub fn peer() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    pub fn observation(count: u32, first_seen: u32, last_seen: u32) -> Entry {
        entry(b"example.com", b"A", b"1.2.3.4", b"s1", count, first_seen, last_seen)
    }

    fn entry(
        rrname: &[u8],
        rrtype: &[u8],
        rdata: &[u8],
        sensor_id: &[u8],
        count: u32,
        first_seen: u32,
        last_seen: u32,
    ) -> Entry {
        Entry {
            rrname: rrname.to_vec(),
            rrtype: rrtype.to_vec(),
            rdata: rdata.to_vec(),
            sensor_id: sensor_id.to_vec(),
            count,
            first_seen,
            last_seen,
        }
    }

    fn run<B: Backend>(backend: &B, conn: &mut B::Conn, query: QueryRequest) -> Vec<Entry> {
        let mut results = Vec::new();
        let n = backend.query(conn, &query, &mut results).unwrap();
        assert_eq!(n, results.len());
        results
    }

    pub fn by_name<B: Backend>(backend: &B, conn: &mut B::Conn, rrname: &[u8]) -> Vec<Entry> {
        run(
            backend,
            conn,
            QueryRequest {
                rrname: Some(rrname.to_vec()),
                limit: 100,
                ..QueryRequest::default()
            },
        )
    }

    fn by_rdata<B: Backend>(backend: &B, conn: &mut B::Conn, rdata: &[u8]) -> Vec<Entry> {
        run(
            backend,
            conn,
            QueryRequest {
                rdata: Some(rdata.to_vec()),
                limit: 100,
                ..QueryRequest::default()
            },
        )
    }

    fn input_all<B: Backend>(backend: &B, conn: &mut B::Conn, entries: &[Entry]) {
        for entry in entries {
            backend.input(conn, entry).unwrap();
        }
    }

    pub fn aggregates_repeated_input<B: Backend>(backend: &B) {
        let mut conn = backend.conn_init(peer()).unwrap();
        input_all(
            backend,
            &mut conn,
            &[observation(1, 100, 100), observation(1, 100, 200), observation(2, 90, 150)],
        );
        let results = by_name(backend, &mut conn, b"example.com");
        assert_eq!(results, vec![observation(4, 90, 200)]);
        backend.conn_deinit(&mut conn);
    }

    pub fn both_directions_agree<B: Backend>(backend: &B) {
        let mut conn = backend.conn_init(peer()).unwrap();
        input_all(
            backend,
            &mut conn,
            &[
                observation(1, 100, 100),
                entry(b"example.com", b"A", b"1.2.3.4", b"s2", 3, 10, 20),
                entry(b"example.com", b"A", b"5.6.7.8", b"s1", 1, 100, 100),
                entry(b"other.example", b"A", b"1.2.3.4", b"s1", 1, 100, 100),
            ],
        );

        let forward: Vec<Entry> = by_name(backend, &mut conn, b"example.com")
            .into_iter()
            .filter(|e| e.rdata == b"1.2.3.4")
            .collect();
        let mut inverted: Vec<Entry> = by_rdata(backend, &mut conn, b"1.2.3.4")
            .into_iter()
            .filter(|e| e.rrname == b"example.com")
            .collect();
        inverted.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        assert_eq!(forward.len(), 2);
        assert_eq!(forward, inverted);
        assert_eq!(by_rdata(backend, &mut conn, b"1.2.3.4").len(), 3);
    }

    pub fn name_scan_stops_at_longer_names<B: Backend>(backend: &B) {
        let mut conn = backend.conn_init(peer()).unwrap();
        input_all(
            backend,
            &mut conn,
            &[
                entry(b"a", b"A", b"1.1.1.1", b"s1", 1, 1, 1),
                entry(b"ab", b"A", b"2.2.2.2", b"s1", 1, 1, 1),
                entry(b"b", b"A", b"3.3.3.3", b"s1", 1, 1, 1),
            ],
        );
        let results = by_name(backend, &mut conn, b"a");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rdata, b"1.1.1.1");
        assert!(by_name(backend, &mut conn, b"c").is_empty());
    }

    pub fn rdata_with_delimiters_is_found<B: Backend>(backend: &B) {
        let mut conn = backend.conn_init(peer()).unwrap();
        let spf = entry(b"example.com", b"TXT", b"\x1fv=spf1\x1f", b"s1", 1, 5, 5);
        let longer = entry(b"example.com", b"TXT", b"\x1fv=spf1\x1f\x1fmore", b"s1", 1, 6, 6);
        input_all(backend, &mut conn, &[spf.clone(), longer.clone()]);

        assert_eq!(by_rdata(backend, &mut conn, b"\x1fv=spf1\x1f"), vec![spf.clone()]);
        assert_eq!(by_rdata(backend, &mut conn, b"\x1fv=spf1\x1f\x1fmore"), vec![longer.clone()]);
        assert_eq!(by_name(backend, &mut conn, b"example.com"), vec![spf, longer]);
    }

    pub fn limit_is_enforced<B: Backend>(backend: &B) {
        let mut conn = backend.conn_init(peer()).unwrap();
        for i in 0..5u8 {
            let rdata = [b'1', b'.', b'0' + i];
            backend
                .input(&mut conn, &entry(b"example.com", b"A", &rdata, b"s1", 1, 1, 1))
                .unwrap();
            backend
                .input(&mut conn, &entry(b"host.example", b"A", b"9.9.9.9", &[b'a' + i], 1, 1, 1))
                .unwrap();
        }

        let mut query = QueryRequest {
            rrname: Some(b"example.com".to_vec()),
            limit: 3,
            ..QueryRequest::default()
        };
        let results = run(backend, &mut conn, query.clone());
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].rdata, b"1.0");

        query.limit = 1;
        assert_eq!(run(backend, &mut conn, query.clone()).len(), 1);
        query.limit = 0;
        assert!(run(backend, &mut conn, query).is_empty());

        let query = QueryRequest {
            rdata: Some(b"9.9.9.9".to_vec()),
            limit: 2,
            ..QueryRequest::default()
        };
        assert_eq!(run(backend, &mut conn, query).len(), 2);
    }

    pub fn filters_apply<B: Backend>(backend: &B) {
        let mut conn = backend.conn_init(peer()).unwrap();
        input_all(
            backend,
            &mut conn,
            &[
                entry(b"example.com", b"A", b"1.2.3.4", b"s1", 1, 1, 1),
                entry(b"example.com", b"AAAA", b"::1", b"s1", 1, 1, 1),
                entry(b"example.com", b"A", b"1.2.3.4", b"s2", 1, 1, 1),
                entry(b"example.com", b"A", b"5.6.7.8", b"s2", 1, 1, 1),
                entry(b"other.example", b"A", b"1.2.3.4", b"s2", 1, 1, 1),
            ],
        );

        let name = |rrtype: Option<&[u8]>, rdata: Option<&[u8]>, sensor_id: Option<&[u8]>| {
            QueryRequest {
                rrname: Some(b"example.com".to_vec()),
                rrtype: rrtype.map(<[u8]>::to_vec),
                rdata: rdata.map(<[u8]>::to_vec),
                sensor_id: sensor_id.map(<[u8]>::to_vec),
                limit: 100,
            }
        };
        assert_eq!(run(backend, &mut conn, name(None, None, None)).len(), 4);
        let aaaa = run(backend, &mut conn, name(Some(&b"AAAA"[..]), None, None));
        assert_eq!(aaaa.len(), 1);
        assert_eq!(aaaa[0].rdata, b"::1");
        assert_eq!(run(backend, &mut conn, name(None, None, Some(&b"s2"[..]))).len(), 2);
        assert_eq!(run(backend, &mut conn, name(None, Some(&b"1.2.3.4"[..]), None)).len(), 2);
        assert_eq!(
            run(backend, &mut conn, name(Some(&b"A"[..]), Some(&b"5.6.7.8"[..]), Some(&b"s2"[..]))).len(),
            1
        );
        assert!(run(backend, &mut conn, name(Some(&b"MX"[..]), None, None)).is_empty());

        let rdata = QueryRequest {
            rdata: Some(b"1.2.3.4".to_vec()),
            rrname: Some(b"other.example".to_vec()),
            limit: 100,
            ..QueryRequest::default()
        };
        // With both given, the query runs by name.
        let results = run(backend, &mut conn, rdata);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].sensor_id, b"s2");

        let rdata = QueryRequest {
            rdata: Some(b"1.2.3.4".to_vec()),
            sensor_id: Some(b"s1".to_vec()),
            limit: 100,
            ..QueryRequest::default()
        };
        assert_eq!(run(backend, &mut conn, rdata).len(), 1);

        let rdata = |rdata: &[u8], rrtype: &[u8]| QueryRequest {
            rdata: Some(rdata.to_vec()),
            rrtype: Some(rrtype.to_vec()),
            limit: 100,
            ..QueryRequest::default()
        };
        assert!(run(backend, &mut conn, rdata(b"1.2.3.4", b"AAAA")).is_empty());
        assert_eq!(run(backend, &mut conn, rdata(b"1.2.3.4", b"A")).len(), 3);
        let aaaa = run(backend, &mut conn, rdata(b"::1", b"AAAA"));
        assert_eq!(aaaa.len(), 1);
        assert_eq!(aaaa[0].rrname, b"example.com");
        assert!(run(backend, &mut conn, rdata(b"::1", b"A")).is_empty());
    }

    pub fn dump_lists_forward_keys_in_order<B: Backend>(backend: &B) {
        let mut conn = backend.conn_init(peer()).unwrap();
        let b = entry(b"b.example", b"A", b"1.1.1.1", b"s1", 2, 10, 20);
        let a = entry(b"a.example", b"NS", b"ns.b.example", b"s1", 1, 30, 30);
        input_all(backend, &mut conn, &[b.clone(), a.clone()]);

        let mut results = Vec::new();
        let count = backend
            .dump(&mut conn, Path::new("/tmp/unused"), &mut results)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(results, vec![a, b]);
    }

    pub fn oversized_input_is_rejected<B: Backend>(backend: &B) {
        let mut conn = backend.conn_init(peer()).unwrap();
        let rdata = vec![b'x'; crate::db::key::MAX_KEY_LEN];
        let result = backend.input(&mut conn, &entry(b"example.com", b"TXT", &rdata, b"s1", 1, 1, 1));
        assert!(matches!(result, Err(Error::KeyTooLong(_))));
        assert!(by_name(backend, &mut conn, b"example.com").is_empty());
    }

    #[test]
    fn empty_queries_yield_nothing() {
        let backend = MemoryBackend::new(OrphanPolicy::Skip);
        let mut conn = backend.conn_init(peer()).unwrap();
        backend.input(&mut conn, &observation(1, 1, 1)).unwrap();
        let query = QueryRequest {
            rrtype: Some(b"A".to_vec()),
            sensor_id: Some(b"s1".to_vec()),
            limit: 10,
            ..QueryRequest::default()
        };
        assert!(run(&backend, &mut conn, query).is_empty());
    }

    #[test]
    fn failing_sink_aborts_the_scan() {
        struct Broken;
        impl Sink for Broken {
            fn push(&mut self, _: &EntryRef) -> std::io::Result<()> {
                Err(std::io::ErrorKind::BrokenPipe.into())
            }
        }

        let backend = MemoryBackend::new(OrphanPolicy::Skip);
        let mut conn = backend.conn_init(peer()).unwrap();
        backend.input(&mut conn, &observation(1, 1, 1)).unwrap();
        let query = QueryRequest {
            rrname: Some(b"example.com".to_vec()),
            limit: 10,
            ..QueryRequest::default()
        };
        let err = backend.query(&mut conn, &query, &mut Broken).unwrap_err();
        assert!(err.is_sink());
    }
}
