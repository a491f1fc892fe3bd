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

//! The in-memory backend.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::ops::Bound;
use std::path::Path;
use std::sync::RwLock;

use log::{debug, info};

use super::key::KeyBuffers;
use super::merge::merge_values;
use super::query::{self, Flow, Lookup, Orphans, Store};
use super::{Backend, Error, OrphanPolicy, Result, Sink};
use crate::entry::{Aggregate, Entry, EntryRef};
use crate::protocol::{write_dump_entry, QueryRequest};

/// The name of the file a [`MemoryBackend`] backup is written to,
/// inside the requested directory.
pub const BACKUP_FILE_NAME: &str = "memory.dump";

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// A [`Backend`] keeping observations in an ordered in-memory map.
///
/// This uses the same key spaces and merge rule as the
/// [`RocksBackend`](super::RocksBackend), so it answers queries
/// identically. Its contents are lost when it is dropped; a backup
/// writes a dump file that can be replayed into another store.
#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<Map>,
    orphans: Orphans,
}

/// Per-connection state of the [`MemoryBackend`].
pub struct MemoryConn {
    peer: SocketAddr,
    keys: KeyBuffers,
}

impl MemoryBackend {
    /// Creates a new, empty `MemoryBackend`.
    pub fn new(orphan_policy: OrphanPolicy) -> Self {
        Self {
            map: RwLock::new(Map::new()),
            orphans: Orphans::new(orphan_policy),
        }
    }

    /// Returns the number of orphaned inverted keys skipped by queries
    /// so far.
    pub fn orphans(&self) -> u64 {
        self.orphans.count()
    }

    /// Returns the number of stored keys in both key spaces.
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// Returns whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Backend for MemoryBackend {
    type Conn = MemoryConn;

    fn conn_init(&self, peer: SocketAddr) -> Result<Self::Conn> {
        Ok(MemoryConn {
            peer,
            keys: KeyBuffers::new(),
        })
    }

    fn conn_deinit(&self, conn: &mut Self::Conn) {
        debug!("Released in-memory state for {}", conn.peer);
    }

    fn teardown(&self) {
        info!("Discarding {} in-memory keys", self.len());
    }

    fn query(&self, conn: &mut Self::Conn, query: &QueryRequest, sink: &mut dyn Sink) -> Result<usize> {
        query::query(self, &mut conn.keys, query, &self.orphans, sink)
    }

    fn input(&self, conn: &mut Self::Conn, entry: &Entry) -> Result<()> {
        query::build_keys(&mut conn.keys, entry)?;
        let operand = entry.aggregate().encode();
        let mut map = self.map.write().unwrap();

        // The forward key always has a recognized tag, so the merge
        // cannot fail unless the stored value is corrupt, which cannot
        // happen here.
        let existing = map.get(conn.keys.forward.as_slice()).map(Vec::as_slice);
        if let Some(merged) = merge_values(&conn.keys.forward, existing, [&operand[..]]) {
            map.insert(conn.keys.forward.clone(), merged);
        }
        map.insert(conn.keys.inverted.clone(), Vec::new());
        Ok(())
    }

    fn backup(&self, conn: &mut Self::Conn, path: &Path) -> Result<()> {
        info!("Backup to {} requested by {}", path.display(), conn.peer);
        fs::create_dir_all(path)?;
        let mut file = BufWriter::new(File::create(path.join(BACKUP_FILE_NAME))?);
        let mut sink = FileSink(&mut file);
        let count = query::dump(self, &mut sink).map_err(|e| match e {
            Error::Sink(e) => Error::Io(e),
            other => other,
        })?;
        file.flush()?;
        info!("Backed up {} entries to {}", count, path.display());
        Ok(())
    }

    fn dump(&self, conn: &mut Self::Conn, hint: &Path, sink: &mut dyn Sink) -> Result<u64> {
        info!("Dump ({}) requested by {}", hint.display(), conn.peer);
        let count = query::dump(self, sink)?;
        info!("Dumped {} entries", count);
        Ok(count)
    }
}

/// A [`Sink`] writing dump records to a file.
struct FileSink<'a, W>(&'a mut W);

impl<W: Write> Sink for FileSink<'_, W> {
    fn push(&mut self, entry: &EntryRef) -> std::io::Result<()> {
        write_dump_entry(self.0, entry)
    }
}

/// The number of entries copied out of the map per lock acquisition
/// during a scan.
const SCAN_BATCH: usize = 256;

impl Store for MemoryBackend {
    /// Scans in batches. The map is only locked while a batch is copied
    /// out, so a slow sink never holds up writers on other connections.
    /// Like a RocksDB iterator, the scan may observe writes made while
    /// it runs.
    fn scan(
        &self,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8], &dyn Lookup) -> Result<Flow>,
    ) -> Result<()> {
        let lookup = LockingLookup(&self.map);
        let mut resume: Option<Vec<u8>> = None;
        loop {
            let mut batch: Vec<(Vec<u8>, Vec<u8>)> = {
                let map = self.map.read().unwrap();
                let lower = match &resume {
                    Some(last) => Bound::Excluded(last.as_slice()),
                    None => Bound::Included(start),
                };
                map.range::<[u8], _>((lower, Bound::Unbounded))
                    .take(SCAN_BATCH)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            };

            for (key, value) in &batch {
                if visit(key.as_slice(), value.as_slice(), &lookup)?.is_break() {
                    return Ok(());
                }
            }
            if batch.len() < SCAN_BATCH {
                return Ok(());
            }
            resume = batch.pop().map(|(key, _)| key);
        }
    }
}

/// Point lookups that take the map's read lock for each call.
struct LockingLookup<'a>(&'a RwLock<Map>);

impl Lookup for LockingLookup<'_> {
    fn get_aggregate(&self, key: &[u8]) -> Result<Option<Option<Aggregate>>> {
        Ok(self.0.read().unwrap().get(key).map(|v| Aggregate::decode(v)))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::db::query::tests as scenarios;
    use crate::protocol::{DumpReader, Limits};

    fn backend() -> MemoryBackend {
        MemoryBackend::new(OrphanPolicy::Warn)
    }

    #[test]
    fn aggregates_repeated_input() {
        scenarios::aggregates_repeated_input(&backend());
    }

    #[test]
    fn both_directions_agree() {
        scenarios::both_directions_agree(&backend());
    }

    #[test]
    fn name_scan_stops_at_longer_names() {
        scenarios::name_scan_stops_at_longer_names(&backend());
    }

    #[test]
    fn rdata_with_delimiters_is_found() {
        scenarios::rdata_with_delimiters_is_found(&backend());
    }

    #[test]
    fn limit_is_enforced() {
        scenarios::limit_is_enforced(&backend());
    }

    #[test]
    fn filters_apply() {
        scenarios::filters_apply(&backend());
    }

    #[test]
    fn dump_lists_forward_keys_in_order() {
        scenarios::dump_lists_forward_keys_in_order(&backend());
    }

    #[test]
    fn oversized_input_is_rejected() {
        let backend = backend();
        scenarios::oversized_input_is_rejected(&backend);
        assert!(backend.is_empty());
    }

    #[test]
    fn stores_both_keys_per_identity() {
        let backend = backend();
        let mut conn = backend.conn_init(scenarios::peer()).unwrap();
        backend.input(&mut conn, &scenarios::observation(1, 1, 1)).unwrap();
        backend.input(&mut conn, &scenarios::observation(1, 2, 2)).unwrap();
        assert_eq!(backend.len(), 2);
    }

    #[test]
    fn orphans_are_skipped_and_counted() {
        let backend = backend();
        backend
            .map
            .write()
            .unwrap()
            .insert(b"i\x1f1.2.3.4\x1fs1\x1fgone.example\x1fA".to_vec(), Vec::new());
        let mut conn = backend.conn_init(scenarios::peer()).unwrap();
        backend.input(&mut conn, &scenarios::observation(1, 100, 100)).unwrap();

        let query = QueryRequest {
            rdata: Some(b"1.2.3.4".to_vec()),
            limit: 10,
            ..QueryRequest::default()
        };
        let mut results = Vec::new();
        assert_eq!(backend.query(&mut conn, &query, &mut results).unwrap(), 1);
        assert_eq!(results[0].rrname, b"example.com");
        assert_eq!(backend.orphans(), 1);
    }

    #[test]
    fn scans_span_several_batches() {
        let backend = backend();
        let mut conn = backend.conn_init(scenarios::peer()).unwrap();
        let total = SCAN_BATCH * 2 + 3;
        for i in 0..total {
            let mut entry = scenarios::observation(1, 1, 1);
            entry.rdata = format!("10.0.{}.{}", i / 256, i % 256).into_bytes();
            backend.input(&mut conn, &entry).unwrap();
        }

        let mut results = Vec::new();
        let count = backend.dump(&mut conn, Path::new("unused"), &mut results).unwrap();
        assert_eq!(count as usize, total);
        assert!(results.windows(2).all(|w| w[0].rdata < w[1].rdata));

        let query = QueryRequest {
            rrname: Some(b"example.com".to_vec()),
            limit: total + 1,
            ..QueryRequest::default()
        };
        let mut results = Vec::new();
        assert_eq!(backend.query(&mut conn, &query, &mut results).unwrap(), total);
    }

    #[test]
    fn slow_sinks_do_not_hold_up_input() {
        struct Slow;
        impl Sink for Slow {
            fn push(&mut self, _: &EntryRef) -> std::io::Result<()> {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            }
        }

        let backend = Arc::new(backend());
        let mut conn = backend.conn_init(scenarios::peer()).unwrap();
        for rrname in ["a.example", "b.example", "c.example"] {
            let mut entry = scenarios::observation(1, 1, 1);
            entry.rrname = rrname.as_bytes().to_vec();
            backend.input(&mut conn, &entry).unwrap();
        }

        let dumper = {
            let backend = backend.clone();
            thread::spawn(move || {
                let mut conn = backend.conn_init(scenarios::peer()).unwrap();
                backend.dump(&mut conn, Path::new("unused"), &mut Slow).unwrap()
            })
        };
        thread::sleep(Duration::from_millis(100));

        let mut entry = scenarios::observation(1, 2, 2);
        entry.rrname = b"b.example".to_vec();
        let start = Instant::now();
        backend.input(&mut conn, &entry).unwrap();
        assert!(start.elapsed() < Duration::from_millis(250));
        assert_eq!(dumper.join().unwrap(), 3);
    }

    #[test]
    fn backup_writes_replayable_dump() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend();
        let mut conn = backend.conn_init(scenarios::peer()).unwrap();
        backend.input(&mut conn, &scenarios::observation(2, 100, 300)).unwrap();
        backend.backup(&mut conn, dir.path()).unwrap();

        let file = File::open(dir.path().join(BACKUP_FILE_NAME)).unwrap();
        let entries: Vec<Entry> = DumpReader::new(file, Limits::default())
            .collect::<crate::protocol::Result<_>>()
            .unwrap();
        assert_eq!(entries, vec![scenarios::observation(2, 100, 300)]);
    }
}
