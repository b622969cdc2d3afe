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

//! Multipath path identifiers.
//!
//! The low bit of an identifier tells which side initiated it (`0` for the
//! client, `1` for the server). The bit above it is reserved, and the
//! remaining bits hold the per-type sequence number.

use worker_pool::Pooled;

use crate::connection::ConnectionHandle;
use crate::path_id::set::PathIdSet;
use crate::Error;
use crate::Result;

pub mod set;

/// The identifier of a path id that was not assigned by its set yet.
pub const UNASSIGNED: u32 = u32::MAX;

const TYPE_MASK: u32 = 0b1;

const SEQUENCE_SHIFT: u32 = 2;

/// Which endpoint initiated a path id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PathIdType {
    /// Opened by the client.
    Client = 0,

    /// Opened by the server.
    Server = 1,
}

impl PathIdType {
    /// Both types, in index order.
    pub const ALL: [PathIdType; 2] = [PathIdType::Client, PathIdType::Server];

    /// Returns the initiator type encoded in `id`.
    pub fn of(id: u32) -> PathIdType {
        if id & TYPE_MASK == 0 {
            PathIdType::Client
        } else {
            PathIdType::Server
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Returns true if `id` was initiated by the client.
pub fn is_client(id: u32) -> bool {
    PathIdType::of(id) == PathIdType::Client
}

/// Returns true if `id` was initiated by the server.
pub fn is_server(id: u32) -> bool {
    PathIdType::of(id) == PathIdType::Server
}

/// Builds the identifier with the given type and sequence number.
///
/// Returns `None` if it does not fit, or collides with [`UNASSIGNED`].
pub fn encode(ty: PathIdType, sequence: u64) -> Option<u32> {
    let id = sequence
        .checked_mul(1 << SEQUENCE_SHIFT)?
        .checked_add(ty as u64)?;

    u32::try_from(id).ok().filter(|&id| id != UNASSIGNED)
}

/// Returns the sequence number of `id` within its type.
pub fn sequence(id: u32) -> u64 {
    u64::from(id >> SEQUENCE_SHIFT)
}

/// The state flags of a path id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PathIdFlags {
    /// The path id is for a server initiated path.
    pub server_initiating: bool,

    /// The path id is currently in its connection's set.
    pub in_table: bool,

    /// The path id has been started.
    pub started: bool,

    /// The path id exceeds a local limit.
    pub local_blocked: bool,

    /// The path id exceeds the limit advertised by the peer, and must not be
    /// used on the wire until the peer raises it.
    pub peer_blocked: bool,
}

/// The identity of one multipath path on a connection.
///
/// A path id keeps a reference on its connection for as long as it exists,
/// and is charged against the connection's worker pool. Dropping it gives
/// both back.
pub struct PathId {
    conn: ConnectionHandle,

    pub(crate) id: u32,

    pub(crate) flags: PathIdFlags,
}

impl PathId {
    /// Allocates a new, unassigned path id for `conn`.
    pub fn new(
        conn: &ConnectionHandle, server_initiating: bool,
    ) -> Result<Pooled<PathId>> {
        let path_id = PathId {
            conn: conn.clone(),
            id: UNASSIGNED,
            flags: PathIdFlags {
                server_initiating,
                ..Default::default()
            },
        };

        let pool = &conn.worker().path_ids;

        pool.alloc(path_id).map_err(|_| {
            warn!(
                "{} {} pool exhausted at {}",
                conn.trace_id(),
                pool.name(),
                pool.capacity()
            );

            Error::OutOfMemory
        })
    }

    /// Allocates a path id carrying the identifier the peer assigned.
    pub fn with_remote_id(
        conn: &ConnectionHandle, id: u32,
    ) -> Result<Pooled<PathId>> {
        if id == UNASSIGNED {
            return Err(Error::InvalidParameter);
        }

        let mut path_id = PathId::new(conn, is_server(id))?;
        path_id.id = id;

        Ok(path_id)
    }

    /// Starts `path_id` and hands it over to `set`.
    ///
    /// A locally initiated path id gets its identifier from the set. A remote
    /// one already carries the peer's identifier and is only registered. On
    /// failure the path id is freed.
    ///
    /// Returns the path id's identifier.
    pub fn start(
        mut path_id: Pooled<PathId>, set: &mut PathIdSet, is_remote: bool,
    ) -> Result<u32> {
        path_id.flags.started = true;

        if is_remote {
            return set.register_remote_path_id(path_id);
        }

        let ty = path_id.initiator();

        set.new_local_path_id(ty, path_id).map_err(|rejected| {
            debug!(
                "{} failed to start path id: {:?}",
                rejected.path_id.conn.trace_id(),
                rejected.error
            );

            rejected.error
        })
    }

    /// The identifier, or [`UNASSIGNED`].
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The initiator type the path id was created for.
    pub fn initiator(&self) -> PathIdType {
        if self.flags.server_initiating {
            PathIdType::Server
        } else {
            PathIdType::Client
        }
    }

    /// The path id's flags.
    pub fn flags(&self) -> PathIdFlags {
        self.flags
    }

    /// Whether the identifier is beyond what the peer allows.
    pub fn is_peer_blocked(&self) -> bool {
        self.flags.peer_blocked
    }

    /// The owning connection.
    pub fn connection(&self) -> &ConnectionHandle {
        &self.conn
    }
}

impl Drop for PathId {
    fn drop(&mut self) {
        debug_assert!(
            !self.flags.in_table,
            "path id {} freed while still in its set",
            self.id
        );

        trace!("{} path id {} freed", self.conn.trace_id(), self.id);
    }
}

impl std::fmt::Debug for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PathId")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .finish()
    }
}
