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

//! A passive-DNS observation store.
//!
//! Sensors submit DNS resolution events (name, type, answer data,
//! sensor identifier, occurrence count and first/last seen times) over
//! a small typed binary protocol. Repeated observations of the same
//! fact are aggregated by the storage engine, and analysts query the
//! aggregates either by name or by answer data.
//!
//! The crate is organized in layers:
//!
//! * [`protocol`] implements the MessagePack-based wire protocol and
//!   the flat dump file format;
//! * [`db`] defines the [`Backend`](db::Backend) capability trait that
//!   storage engines implement, the two sorted key spaces, the merge
//!   operator, and the provided RocksDB and in-memory backends;
//! * [`engine`] accepts TCP connections and runs one worker thread per
//!   connection that decodes messages and dispatches them to the
//!   backend;
//! * [`client`] is a blocking client for the same protocol.

pub mod client;
pub mod db;
pub mod engine;
pub mod entry;
pub mod protocol;
pub mod thread;

pub use entry::{Aggregate, Entry, EntryRef};
