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

//! Implements the daemon configuration file.

use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use log::Level::Debug;
use log::{debug, log_enabled};
use serde::{de, Deserialize};

use pdnsstore::db::{OrphanPolicy, RocksConfig};
use pdnsstore::engine::EngineConfig;
use pdnsstore::protocol::Limits;

use crate::args::Args;

////////////////////////////////////////////////////////////////////////
// CONFIGURATION LOADING                                              //
////////////////////////////////////////////////////////////////////////

/// Loads the daemon configuration from the file given by `path`.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let raw_config = fs::read(path.as_ref()).context("failed to read the configuration file")?;
    let config: Config =
        toml::from_slice(&raw_config).context("failed to parse the configuration file")?;
    log_config_summary(&config);
    Ok(config)
}

/// Loads the daemon configuration from the parsed command line
/// arguments given by `args`.
pub fn load_from_args(args: &Args) -> Config {
    let bind = args.bind.unwrap_or_else(|| {
        let ip = args.ip.unwrap_or(DEFAULT_BIND_IP);
        let port = args.port.unwrap_or(DEFAULT_BIND_PORT);
        SocketAddr::new(ip, port)
    });
    let orphan_policy = ConfigOrphanPolicy(args.orphan_policy.unwrap_or_default());

    let backend = if args.memory {
        BackendConfig::Memory(MemoryBackendConfig { orphan_policy })
    } else {
        let defaults = RocksBackendConfig::default();
        BackendConfig::RocksDb(RocksBackendConfig {
            path: args.database_path.clone().unwrap_or(defaults.path),
            membudget: args.membudget.unwrap_or(defaults.membudget),
            parallelism: args.parallelism.unwrap_or(defaults.parallelism),
            max_log_file_size: args.max_log_file_size.unwrap_or(defaults.max_log_file_size),
            max_open_files: args.max_open_files.unwrap_or(defaults.max_open_files),
            keep_log_file_num: args.keep_log_file_num.unwrap_or(defaults.keep_log_file_num),
            orphan_policy,
        })
    };

    let config = Config {
        bind,
        throttle: args.throttle.unwrap_or_else(default_throttle),
        stats_interval: args.stats_interval.unwrap_or_else(default_stats_interval),
        engine: EngineSection::default(),
        backend,
    };
    log_config_summary(&config);
    config
}

/// Summarizes the configuration in the log, if the debug log level is
/// enabled.
fn log_config_summary(config: &Config) {
    if !log_enabled!(Debug) {
        return;
    }
    debug!(
        "Configuration loaded:\n\
         Bind address:   {}\n\
         Throttle:       {}\n\
         Stats interval: {}\n\
         Backend:        {}",
        config.bind, config.throttle, config.stats_interval, config.backend,
    );
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION FILE STRUCTURE                                       //
////////////////////////////////////////////////////////////////////////

/// The complete configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_throttle")]
    pub throttle: usize,
    #[serde(default = "default_stats_interval")]
    pub stats_interval: u64,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default = "default_backend")]
    pub backend: BackendConfig,
}

impl Config {
    /// Builds the engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            throttle: self.throttle,
            accept_timeout: Duration::from_secs(self.engine.accept_timeout),
            read_timeout: Duration::from_secs(self.engine.read_timeout),
            write_timeout: Duration::from_secs(self.engine.write_timeout),
            throttle_backoff: Duration::from_secs(self.engine.throttle_backoff),
            limits: Limits {
                max_size: self.engine.max_message_size,
                max_nodes: self.engine.max_nodes,
            },
        }
    }
}

const DEFAULT_BIND_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const DEFAULT_BIND_PORT: u16 = 4242;

fn default_bind() -> SocketAddr {
    SocketAddr::new(DEFAULT_BIND_IP, DEFAULT_BIND_PORT)
}

fn default_throttle() -> usize {
    64
}

fn default_stats_interval() -> u64 {
    60
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: ENGINE                                      //
////////////////////////////////////////////////////////////////////////

/// Engine tuning. Timeouts are in seconds.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineSection {
    #[serde(default = "default_accept_timeout")]
    accept_timeout: u64,
    #[serde(default = "default_read_timeout")]
    read_timeout: u64,
    #[serde(default = "default_write_timeout")]
    write_timeout: u64,
    #[serde(default = "default_throttle_backoff")]
    throttle_backoff: u64,
    #[serde(default = "default_max_message_size")]
    max_message_size: usize,
    #[serde(default = "default_max_nodes")]
    max_nodes: usize,
}

fn default_accept_timeout() -> u64 {
    5
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    30
}

fn default_throttle_backoff() -> u64 {
    1
}

fn default_max_message_size() -> usize {
    Limits::DEFAULT_MAX_SIZE
}

fn default_max_nodes() -> usize {
    Limits::DEFAULT_MAX_NODES
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            accept_timeout: default_accept_timeout(),
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
            throttle_backoff: default_throttle_backoff(),
            max_message_size: default_max_message_size(),
            max_nodes: default_max_nodes(),
        }
    }
}

////////////////////////////////////////////////////////////////////////
// CONFIGURATION SECTION: BACKENDS                                    //
////////////////////////////////////////////////////////////////////////

/// The selection of storage backend and its configuration.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum BackendConfig {
    #[serde(rename = "rocksdb")]
    RocksDb(RocksBackendConfig),
    #[serde(rename = "memory")]
    Memory(MemoryBackendConfig),
}

impl fmt::Display for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::RocksDb(c) => write!(
                f,
                "rocksdb at {} (orphans: {})",
                c.path.display(),
                c.orphan_policy.0
            ),
            Self::Memory(c) => write!(f, "memory (orphans: {})", c.orphan_policy.0),
        }
    }
}

fn default_backend() -> BackendConfig {
    BackendConfig::RocksDb(RocksBackendConfig::default())
}

/// Backend configuration for the
/// [`RocksBackend`](pdnsstore::db::RocksBackend). This mirrors
/// [`RocksConfig`] and can be converted into one.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RocksBackendConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,
    #[serde(default = "default_membudget")]
    pub membudget: usize,
    #[serde(default = "default_parallelism")]
    pub parallelism: i32,
    #[serde(default = "default_max_log_file_size")]
    pub max_log_file_size: usize,
    #[serde(default = "default_max_open_files")]
    pub max_open_files: i32,
    #[serde(default = "default_keep_log_file_num")]
    pub keep_log_file_num: usize,
    #[serde(default)]
    pub orphan_policy: ConfigOrphanPolicy,
}

fn default_path() -> PathBuf {
    RocksConfig::default().path
}

fn default_membudget() -> usize {
    RocksConfig::default().membudget
}

fn default_parallelism() -> i32 {
    RocksConfig::default().parallelism
}

fn default_max_log_file_size() -> usize {
    RocksConfig::default().max_log_file_size
}

fn default_max_open_files() -> i32 {
    RocksConfig::default().max_open_files
}

fn default_keep_log_file_num() -> usize {
    RocksConfig::default().keep_log_file_num
}

impl Default for RocksBackendConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            membudget: default_membudget(),
            parallelism: default_parallelism(),
            max_log_file_size: default_max_log_file_size(),
            max_open_files: default_max_open_files(),
            keep_log_file_num: default_keep_log_file_num(),
            orphan_policy: ConfigOrphanPolicy::default(),
        }
    }
}

impl From<&RocksBackendConfig> for RocksConfig {
    fn from(toml_config: &RocksBackendConfig) -> Self {
        Self {
            path: toml_config.path.clone(),
            membudget: toml_config.membudget,
            parallelism: toml_config.parallelism,
            max_log_file_size: toml_config.max_log_file_size,
            max_open_files: toml_config.max_open_files,
            keep_log_file_num: toml_config.keep_log_file_num,
            orphan_policy: toml_config.orphan_policy.0,
        }
    }
}

/// Backend configuration for the
/// [`MemoryBackend`](pdnsstore::db::MemoryBackend).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryBackendConfig {
    #[serde(default)]
    pub orphan_policy: ConfigOrphanPolicy,
}

////////////////////////////////////////////////////////////////////////
// WRAPPERS OVER PDNSSTORE TYPES FOR SERDE                            //
////////////////////////////////////////////////////////////////////////

/// A deserializable wrapper over [`OrphanPolicy`], using its
/// [`FromStr`](std::str::FromStr) implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigOrphanPolicy(pub OrphanPolicy);

impl<'de> Deserialize<'de> for ConfigOrphanPolicy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_str(ConfigOrphanPolicyVisitor)
    }
}

struct ConfigOrphanPolicyVisitor;

impl<'de> de::Visitor<'de> for ConfigOrphanPolicyVisitor {
    type Value = ConfigOrphanPolicy;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("orphan policy")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        value
            .parse()
            .map(ConfigOrphanPolicy)
            .map_err(|e| E::custom(format!("invalid orphan policy: {}", e)))
    }
}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////
