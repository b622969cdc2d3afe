// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Connection-local execution core for a QUIC transport.
//!
//! A QUIC connection is touched by many threads: application API calls,
//! timers, datapath receive callbacks and path migration events all want to
//! mutate its protocol state. This crate serializes all of them into
//! [`Operation`]s pushed onto a per-connection [`OperationQueue`], which a
//! single [`Worker`] thread drains. Only the worker ever runs protocol logic
//! for a given connection, so that logic needs no locking of its own.
//!
//! The second piece is the multipath admission bookkeeping: every connection
//! owns a [`PathIdSet`] that counts open path identifiers per initiator type,
//! tracks the limits advertised by both endpoints, and flags identifiers that
//! the peer has not allowed yet.
//!
//! ## Setting up a worker
//!
//! ```
//! let config = conn_exec::Config::new();
//! let mut worker = conn_exec::Worker::new(&config);
//!
//! let conn = worker.add_connection(false, Box::new(conn_exec::NoopHandler));
//!
//! // Producers on any thread can now queue work.
//! conn.call_api(conn_exec::ApiKind::ConnShutdown { error_code: 0 })?;
//!
//! // The worker thread drains it.
//! while worker.process_ready() {}
//! # Ok::<(), conn_exec::Error>(())
//! ```
//!
//! ## Blocking calls
//!
//! [`ConnectionHandle::call_blocking()`] queues an API call and parks the
//! calling thread until the worker has processed it. If the connection is
//! torn down first, the call returns [`Error::InvalidState`] instead of
//! hanging.

#![allow(clippy::upper_case_acronyms)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

/// The default number of operations a worker processes for one connection
/// before moving on to the next one.
pub const DEFAULT_MAX_OPERATIONS_PER_DRAIN: usize = 16;

const DEFAULT_OPER_POOL_CAPACITY: usize = 1 << 16;

const DEFAULT_API_CONTEXT_POOL_CAPACITY: usize = 1 << 16;

const DEFAULT_PATH_ID_POOL_CAPACITY: usize = 1 << 12;

// The number of paths a connection can open when nothing else was
// configured. Matches the implicit initial path.
const DEFAULT_LOCAL_MAX_PATHS: u64 = 1;

/// Stores configuration shared between multiple connections of a worker.
#[derive(Clone, Debug)]
pub struct Config {
    max_operations_per_drain: usize,

    oper_pool_capacity: usize,
    api_context_pool_capacity: usize,
    path_id_pool_capacity: usize,

    local_max_client_paths: u64,
    local_max_server_paths: u64,

    multipath: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_operations_per_drain: DEFAULT_MAX_OPERATIONS_PER_DRAIN,

            oper_pool_capacity: DEFAULT_OPER_POOL_CAPACITY,
            api_context_pool_capacity: DEFAULT_API_CONTEXT_POOL_CAPACITY,
            path_id_pool_capacity: DEFAULT_PATH_ID_POOL_CAPACITY,

            local_max_client_paths: DEFAULT_LOCAL_MAX_PATHS,
            local_max_server_paths: 0,

            multipath: true,
        }
    }
}

impl Config {
    /// Creates a config object with default values.
    pub fn new() -> Config {
        Config::default()
    }

    /// Sets how many operations are processed for a connection in one pass
    /// before the worker yields to other connections.
    ///
    /// Values lower than 1 are treated as 1.
    ///
    /// The default value is `16`.
    pub fn set_max_operations_per_drain(&mut self, v: usize) {
        self.max_operations_per_drain = v.max(1);
    }

    /// Sets the max number of operations that can be outstanding on a
    /// worker. Allocations beyond that fail with [`Error::OutOfMemory`].
    ///
    /// The default value is `65536`.
    pub fn set_oper_pool_capacity(&mut self, v: usize) {
        self.oper_pool_capacity = v;
    }

    /// Sets the max number of API call contexts that can be outstanding on a
    /// worker.
    ///
    /// The default value is `65536`.
    pub fn set_api_context_pool_capacity(&mut self, v: usize) {
        self.api_context_pool_capacity = v;
    }

    /// Sets the max number of path identifiers that can exist on a worker.
    ///
    /// The default value is `4096`.
    pub fn set_path_id_pool_capacity(&mut self, v: usize) {
        self.path_id_pool_capacity = v;
    }

    /// Sets the `max_client_paths` value advertised to the peer.
    ///
    /// The default value is `1`.
    pub fn set_local_max_client_paths(&mut self, v: u64) {
        self.local_max_client_paths = v;
    }

    /// Sets the `max_server_paths` value advertised to the peer.
    ///
    /// The default value is `0`, meaning server initiated paths are not
    /// offered.
    pub fn set_local_max_server_paths(&mut self, v: u64) {
        self.local_max_server_paths = v;
    }

    /// Configures whether the multipath extension is honored when the peer
    /// offers it.
    ///
    /// The default value is `true`.
    pub fn enable_multipath(&mut self, v: bool) {
        self.multipath = v;
    }
}

pub use crate::connection::Connection;
pub use crate::connection::ConnectionHandle;
pub use crate::connection::ConnectionHandler;
pub use crate::connection::ConnectionState;
pub use crate::connection::DrainResult;
pub use crate::connection::NoopHandler;
pub use crate::error::Error;
pub use crate::error::Result;
pub use crate::operation::queue::OperationQueue;
pub use crate::operation::ApiContext;
pub use crate::operation::ApiKind;
pub use crate::operation::Completion;
pub use crate::operation::Operation;
pub use crate::operation::StatelessContext;
pub use crate::operation::StatelessKind;
pub use crate::operation::TimerType;
pub use crate::path_id::set::PathIdSet;
pub use crate::path_id::set::PathIdSetFlags;
pub use crate::path_id::set::PathIdTypeInfo;
pub use crate::path_id::set::Rejected;
pub use crate::path_id::PathId;
pub use crate::path_id::PathIdFlags;
pub use crate::path_id::PathIdType;
pub use crate::perf::PerfCounter;
pub use crate::perf::PerfCounters;
pub use crate::stream::ShutdownFlags;
pub use crate::stream::StartFlags;
pub use crate::stream::Stream;
pub use crate::worker::Worker;
pub use crate::worker::WorkerHandle;
pub use worker_pool::Pooled;

mod connection;
mod error;
mod operation;
pub mod path_id;
mod perf;
mod stream;
mod worker;

#[cfg(test)]
mod testing;
