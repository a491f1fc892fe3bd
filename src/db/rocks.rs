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

//! The RocksDB backend.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use log::{debug, error, info};
use rocksdb::backup::{BackupEngine, BackupEngineOptions};
use rocksdb::{DBCompressionType, DBWithThreadMode, Direction, Env, IteratorMode, MultiThreaded, Options};

use super::key::KeyBuffers;
use super::merge::{full_merge, partial_merge, MergeFn, MERGE_OPERATOR_NAME};
use super::query::{self, Flow, Lookup, Orphans, Store};
use super::{Backend, OrphanPolicy, Result, Sink};
use crate::entry::{Aggregate, Entry};
use crate::protocol::QueryRequest;

/// Configuration for opening a [`RocksBackend`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RocksConfig {
    /// The database directory. It is created if missing.
    pub path: PathBuf,

    /// The memory budget for level-style compaction, in octets.
    pub membudget: usize,

    /// The number of background threads.
    pub parallelism: i32,

    pub max_log_file_size: usize,
    pub max_open_files: i32,
    pub keep_log_file_num: usize,
    pub orphan_policy: OrphanPolicy,
}

impl Default for RocksConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/balboa-rocksdb"),
            membudget: 128 * 1024 * 1024,
            parallelism: 8,
            max_log_file_size: 10 * 1024 * 1024,
            max_open_files: 300,
            keep_log_file_num: 2,
            orphan_policy: OrphanPolicy::Skip,
        }
    }
}

/// A [`Backend`] storing observations in RocksDB.
pub struct RocksBackend {
    db: DBWithThreadMode<MultiThreaded>,
    orphans: Orphans,
}

/// Per-connection state of the [`RocksBackend`].
pub struct RocksConn {
    peer: SocketAddr,
    keys: KeyBuffers,
}

impl RocksBackend {
    /// Opens (creating if necessary) the database described by
    /// `config`.
    pub fn open(config: &RocksConfig) -> Result<Self> {
        info!("Opening RocksDB database at {}", config.path.display());
        info!(
            "parallelism {} membudget {} max_log_file_size {} keep_log_file_num {} max_open_files {}",
            config.parallelism,
            config.membudget,
            config.max_log_file_size,
            config.keep_log_file_num,
            config.max_open_files,
        );

        let mut options = Options::default();
        options.increase_parallelism(config.parallelism);
        options.optimize_level_style_compaction(config.membudget);
        options.create_if_missing(true);
        options.set_max_log_file_size(config.max_log_file_size);
        options.set_keep_log_file_num(config.keep_log_file_num);
        options.set_max_open_files(config.max_open_files);
        options.set_merge_operator(
            MERGE_OPERATOR_NAME,
            full_merge as MergeFn,
            partial_merge as MergeFn,
        );
        options.set_compression_per_level(&[DBCompressionType::Lz4; 5]);

        let db = DBWithThreadMode::<MultiThreaded>::open(&options, &config.path)?;
        Ok(Self {
            db,
            orphans: Orphans::new(config.orphan_policy),
        })
    }

    /// Returns the number of orphaned inverted keys skipped by queries
    /// so far.
    pub fn orphans(&self) -> u64 {
        self.orphans.count()
    }
}

impl Backend for RocksBackend {
    type Conn = RocksConn;

    fn conn_init(&self, peer: SocketAddr) -> Result<Self::Conn> {
        Ok(RocksConn {
            peer,
            keys: KeyBuffers::new(),
        })
    }

    fn conn_deinit(&self, conn: &mut Self::Conn) {
        debug!("Released RocksDB state for {}", conn.peer);
    }

    fn teardown(&self) {
        info!("Flushing RocksDB database");
        if let Err(e) = self.db.flush() {
            error!("Failed to flush RocksDB database: {}", e);
        }
    }

    fn query(&self, conn: &mut Self::Conn, query: &QueryRequest, sink: &mut dyn Sink) -> Result<usize> {
        query::query(self, &mut conn.keys, query, &self.orphans, sink)
    }

    fn input(&self, conn: &mut Self::Conn, entry: &Entry) -> Result<()> {
        query::build_keys(&mut conn.keys, entry)?;
        self.db.merge(&conn.keys.forward, entry.aggregate().encode())?;
        self.db.put(&conn.keys.inverted, b"")?;
        Ok(())
    }

    fn backup(&self, conn: &mut Self::Conn, path: &Path) -> Result<()> {
        info!("Backup to {} requested by {}", path.display(), conn.peer);
        let options = BackupEngineOptions::new(path)?;
        let env = Env::new()?;
        let mut engine = BackupEngine::open(&options, &env)?;
        engine.create_new_backup(&self.db)?;
        info!("Backup to {} complete", path.display());
        Ok(())
    }

    fn dump(&self, conn: &mut Self::Conn, hint: &Path, sink: &mut dyn Sink) -> Result<u64> {
        info!("Dump ({}) requested by {}", hint.display(), conn.peer);
        let count = query::dump(self, sink)?;
        info!("Dumped {} entries", count);
        Ok(count)
    }
}

impl Store for RocksBackend {
    fn scan(
        &self,
        start: &[u8],
        visit: &mut dyn FnMut(&[u8], &[u8], &dyn Lookup) -> Result<Flow>,
    ) -> Result<()> {
        let iter = self.db.iterator(IteratorMode::From(start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if visit(&key, &value, self)?.is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl Lookup for RocksBackend {
    fn get_aggregate(&self, key: &[u8]) -> Result<Option<Option<Aggregate>>> {
        let value = self.db.get_pinned(key)?;
        Ok(value.map(|v| Aggregate::decode(&v)))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::query::tests as scenarios;

    fn open(dir: &Path) -> RocksBackend {
        RocksBackend::open(&RocksConfig {
            path: dir.to_owned(),
            parallelism: 2,
            membudget: 8 * 1024 * 1024,
            ..RocksConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn aggregates_repeated_input() {
        let dir = tempfile::tempdir().unwrap();
        scenarios::aggregates_repeated_input(&open(dir.path()));
    }

    #[test]
    fn both_directions_agree() {
        let dir = tempfile::tempdir().unwrap();
        scenarios::both_directions_agree(&open(dir.path()));
    }

    #[test]
    fn name_scan_stops_at_longer_names() {
        let dir = tempfile::tempdir().unwrap();
        scenarios::name_scan_stops_at_longer_names(&open(dir.path()));
    }

    #[test]
    fn rdata_with_delimiters_is_found() {
        let dir = tempfile::tempdir().unwrap();
        scenarios::rdata_with_delimiters_is_found(&open(dir.path()));
    }

    #[test]
    fn limit_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        scenarios::limit_is_enforced(&open(dir.path()));
    }

    #[test]
    fn filters_apply() {
        let dir = tempfile::tempdir().unwrap();
        scenarios::filters_apply(&open(dir.path()));
    }

    #[test]
    fn dump_lists_forward_keys_in_order() {
        let dir = tempfile::tempdir().unwrap();
        scenarios::dump_lists_forward_keys_in_order(&open(dir.path()));
    }

    #[test]
    fn oversized_input_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        scenarios::oversized_input_is_rejected(&open(dir.path()));
    }

    #[test]
    fn orphans_are_skipped_and_counted() {
        let dir = tempfile::tempdir().unwrap();
        let backend = open(dir.path());
        backend.db.put(b"i\x1f1.2.3.4\x1fs1\x1fgone.example\x1fA", b"").unwrap();
        let mut conn = backend.conn_init(scenarios::peer()).unwrap();
        let query = QueryRequest {
            rdata: Some(b"1.2.3.4".to_vec()),
            limit: 10,
            ..QueryRequest::default()
        };
        let mut results = Vec::new();
        assert_eq!(backend.query(&mut conn, &query, &mut results).unwrap(), 0);
        assert_eq!(backend.orphans(), 1);
    }

    #[test]
    fn aggregates_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let backend = open(dir.path());
            let mut conn = backend.conn_init(scenarios::peer()).unwrap();
            backend.input(&mut conn, &scenarios::observation(1, 100, 100)).unwrap();
            backend.input(&mut conn, &scenarios::observation(1, 100, 200)).unwrap();
            backend.conn_deinit(&mut conn);
            backend.teardown();
        }
        let backend = open(dir.path());
        backend.db.compact_range::<&[u8], &[u8]>(None, None);
        let mut conn = backend.conn_init(scenarios::peer()).unwrap();
        backend.input(&mut conn, &scenarios::observation(3, 50, 150)).unwrap();
        let results = scenarios::by_name(&backend, &mut conn, b"example.com");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].count, 5);
        assert_eq!(results[0].first_seen, 50);
        assert_eq!(results[0].last_seen, 200);
    }

    #[test]
    fn backup_creates_restorable_backup() {
        let dir = tempfile::tempdir().unwrap();
        let backup_dir = tempfile::tempdir().unwrap();
        let backend = open(dir.path());
        let mut conn = backend.conn_init(scenarios::peer()).unwrap();
        backend.input(&mut conn, &scenarios::observation(1, 100, 100)).unwrap();
        backend.backup(&mut conn, backup_dir.path()).unwrap();

        let options = BackupEngineOptions::new(backup_dir.path()).unwrap();
        let env = Env::new().unwrap();
        let engine = BackupEngine::open(&options, &env).unwrap();
        assert_eq!(engine.get_backup_info().len(), 1);
    }
}
