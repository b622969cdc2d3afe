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

//! Per-connection path id bookkeeping and admission.

use std::cmp;
use std::collections::HashMap;

use worker_pool::Pooled;

use crate::path_id;
use crate::path_id::PathId;
use crate::path_id::PathIdType;
use crate::path_id::UNASSIGNED;
use crate::Error;
use crate::Result;

// Initial capacity of the lookup table once a second path id shows up.
const MIN_TABLE_CAPACITY: usize = 8;

/// A simple no-op hasher for path identifiers.
///
/// Identifiers are unique within a set, so there is no point in mixing them.
#[derive(Default)]
pub struct PathIdHasher {
    id: u64,
}

impl std::hash::Hasher for PathIdHasher {
    #[inline]
    fn finish(&self) -> u64 {
        self.id
    }

    #[inline]
    fn write_u32(&mut self, id: u32) {
        self.id = u64::from(id);
    }

    #[inline]
    fn write(&mut self, _: &[u8]) {
        // We need a default write() for the trait but path IDs will always
        // be a u32 so we just delegate to write_u32.
        unimplemented!()
    }
}

type BuildPathIdHasher = std::hash::BuildHasherDefault<PathIdHasher>;

type PathIdHashMap<V> = HashMap<u32, V, BuildPathIdHasher>;

/// Bookkeeping for one initiator type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PathIdTypeInfo {
    /// The largest `max_paths` value advertised to the peer. Never decreases.
    pub max_paths: u64,

    /// The largest `max_paths` value advertised by the peer. Never decreases.
    pub peer_max_paths: u64,

    /// The total number of path ids ever opened, including retired ones.
    pub total_count: u32,

    /// The largest number of simultaneously open path ids seen so far.
    pub max_current_count: u32,

    /// The number of currently open path ids.
    pub current_count: u32,
}

/// Connection-wide multipath switches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PathIdSetFlags {
    /// The peer offered the multipath extension.
    pub multipath_enabled: bool,

    /// The peer allows server initiated paths.
    pub server_initiated_enabled: bool,
}

/// A path id [`PathIdSet::new_local_path_id()`] refused, handed back.
#[derive(Debug)]
pub struct Rejected {
    /// Why it was refused.
    pub error: Error,

    /// The path id, with its identifier reset to [`UNASSIGNED`].
    pub path_id: Pooled<PathId>,
}

/// How path ids are looked up.
///
/// Most connections only ever have one path id, so the table is only
/// allocated once a second one is inserted. After that it is kept, even if
/// retirements bring the count back down.
enum Lookup {
    Empty,

    Single(Pooled<PathId>),

    Table(PathIdHashMap<Pooled<PathId>>),
}

/// Keeps track of a connection's path ids and enforces path limits.
///
/// Only the connection's worker touches the set, so it needs no locking.
pub struct PathIdSet {
    types: [PathIdTypeInfo; 2],

    flags: PathIdSetFlags,

    /// The number of path ids in `lookup`.
    count: u32,

    lookup: Lookup,

    /// Number of single slot to table transitions. At most one.
    promotions: u32,

    transport_params_applied: bool,

    #[cfg(test)]
    fail_table_alloc: bool,
}

impl Default for PathIdSet {
    fn default() -> PathIdSet {
        PathIdSet::new()
    }
}

impl PathIdSet {
    /// Creates a set for a new connection.
    ///
    /// The client type starts with one open slot accounted for, standing
    /// for the connection's initial path.
    pub fn new() -> PathIdSet {
        let mut types = [PathIdTypeInfo::default(); 2];
        types[PathIdType::Client.index()].max_current_count = 1;

        PathIdSet {
            types,
            flags: PathIdSetFlags::default(),
            count: 0,
            lookup: Lookup::Empty,
            promotions: 0,
            transport_params_applied: false,

            #[cfg(test)]
            fail_table_alloc: false,
        }
    }

    /// Applies the path limits from the peer's transport parameters.
    ///
    /// A zero value means the peer does not offer that type of path, and
    /// leaves the current value alone. This is expected to run once per
    /// connection. If it runs again, values lower than the ones already
    /// recorded are ignored.
    pub fn initialize_transport_parameters(
        &mut self, max_client_paths: u32, max_server_paths: u32,
    ) {
        if self.transport_params_applied {
            warn!(
                "path limits from transport parameters applied more than once"
            );
        }

        self.transport_params_applied = true;

        if max_client_paths != 0 {
            self.flags.multipath_enabled = true;
            self.raise_peer_max_paths(
                PathIdType::Client,
                u64::from(max_client_paths),
            );
        }

        if max_server_paths != 0 {
            self.flags.multipath_enabled = true;
            self.flags.server_initiated_enabled = true;
            self.raise_peer_max_paths(
                PathIdType::Server,
                u64::from(max_server_paths),
            );
        }
    }

    /// Applies a `MAX_PATHS` update from the peer.
    ///
    /// Path ids that now fit under the new limit are no longer peer blocked.
    /// Returns how many were unblocked.
    pub fn update_max_paths(&mut self, ty: PathIdType, max_paths: u64) -> usize {
        if !self.raise_peer_max_paths(ty, max_paths) {
            return 0;
        }

        self.unblock(ty)
    }

    /// Raises the `max_paths` value advertised to the peer.
    ///
    /// Returns false, leaving the limit untouched, if `max_paths` is not
    /// larger than the current one.
    pub fn set_local_max_paths(&mut self, ty: PathIdType, max_paths: u64) -> bool {
        let info = &mut self.types[ty.index()];

        if max_paths <= info.max_paths {
            if max_paths < info.max_paths {
                debug!(
                    "ignoring local max paths decrease for {:?}: {} -> {}",
                    ty, info.max_paths, max_paths
                );
            }

            return false;
        }

        debug!(
            "local max paths for {:?}: {} -> {}",
            ty, info.max_paths, max_paths
        );

        info.max_paths = max_paths;

        true
    }

    /// Registers a path id in the lookup structure.
    ///
    /// The first path id sits in a direct slot. The second one allocates the
    /// hash table and both move there. If that allocation fails, the set is
    /// left as it was and the path id is handed back. Path ids without an
    /// identifier, or with one already present, are handed back as well.
    pub fn insert(
        &mut self, mut path_id: Pooled<PathId>,
    ) -> std::result::Result<(), Pooled<PathId>> {
        if path_id.id == UNASSIGNED || self.contains(path_id.id) {
            return Err(path_id);
        }

        self.lookup = match std::mem::replace(&mut self.lookup, Lookup::Empty) {
            Lookup::Empty => {
                path_id.flags.in_table = true;

                Lookup::Single(path_id)
            },

            Lookup::Single(existing) => {
                let mut table = PathIdHashMap::default();

                if !self.reserve(&mut table, MIN_TABLE_CAPACITY) {
                    error!(
                        "{} allocation of path id hash table failed",
                        path_id.connection().trace_id()
                    );

                    self.lookup = Lookup::Single(existing);
                    return Err(path_id);
                }

                table.insert(existing.id, existing);

                path_id.flags.in_table = true;
                table.insert(path_id.id, path_id);

                self.promotions += 1;

                Lookup::Table(table)
            },

            Lookup::Table(mut table) => {
                if !self.reserve(&mut table, 1) {
                    error!(
                        "{} growing path id hash table failed",
                        path_id.connection().trace_id()
                    );

                    self.lookup = Lookup::Table(table);
                    return Err(path_id);
                }

                path_id.flags.in_table = true;
                table.insert(path_id.id, path_id);

                Lookup::Table(table)
            },
        };

        self.count += 1;

        Ok(())
    }

    /// Assigns the next identifier of type `ty` to `path_id` and registers
    /// it.
    ///
    /// An identifier beyond the peer's limit is still assigned, but the path
    /// id is flagged as peer blocked until the peer raises the limit.
    ///
    /// Returns the new identifier.
    pub fn new_local_path_id(
        &mut self, ty: PathIdType, mut path_id: Pooled<PathId>,
    ) -> std::result::Result<u32, Rejected> {
        let info = self.types[ty.index()];

        let sequence = u64::from(info.total_count);

        let id = match path_id::encode(ty, sequence) {
            Some(v) => v,

            None =>
                return Err(Rejected {
                    error: Error::OutOfIdentifiers,
                    path_id,
                }),
        };

        let peer_blocked = sequence >= info.peer_max_paths;

        path_id.id = id;
        path_id.flags.peer_blocked = peer_blocked;

        if let Err(mut path_id) = self.insert(path_id) {
            path_id.id = UNASSIGNED;
            path_id.flags.peer_blocked = false;

            return Err(Rejected {
                error: Error::OutOfMemory,
                path_id,
            });
        }

        let info = &mut self.types[ty.index()];

        info.total_count += 1;
        Self::open(info);

        if peer_blocked {
            debug!(
                "path id {} blocked by peer limit {}",
                id, info.peer_max_paths
            );
        }

        Ok(id)
    }

    /// Registers a path id opened by the peer. It must already carry the
    /// peer's identifier.
    ///
    /// A path id beyond the limit advertised to the peer is registered but
    /// flagged as locally blocked.
    pub fn register_remote_path_id(
        &mut self, mut path_id: Pooled<PathId>,
    ) -> Result<u32> {
        let id = path_id.id;

        if id == UNASSIGNED {
            return Err(Error::InvalidParameter);
        }

        if self.contains(id) {
            return Err(Error::InvalidState);
        }

        let ty = PathIdType::of(id);
        let sequence = path_id::sequence(id);

        path_id.flags.local_blocked = sequence >= self.types[ty.index()].max_paths;

        self.insert(path_id).map_err(|_| Error::OutOfMemory)?;

        let info = &mut self.types[ty.index()];

        // Identifiers are 32 bits wide, so the sequence always fits.
        let opened = u32::try_from(sequence + 1).unwrap_or(u32::MAX);
        info.total_count = cmp::max(info.total_count, opened);
        Self::open(info);

        Ok(id)
    }

    /// Removes a path id from the set and returns it.
    ///
    /// The lookup table, once allocated, is kept.
    pub fn retire_path_id(&mut self, id: u32) -> Option<Pooled<PathId>> {
        let in_single =
            matches!(&self.lookup, Lookup::Single(p) if p.id == id);

        let mut path_id = if in_single {
            match std::mem::replace(&mut self.lookup, Lookup::Empty) {
                Lookup::Single(p) => p,

                other => {
                    self.lookup = other;
                    return None;
                },
            }
        } else if let Lookup::Table(table) = &mut self.lookup {
            table.remove(&id)?
        } else {
            return None;
        };

        path_id.flags.in_table = false;
        self.count -= 1;

        let info = &mut self.types[PathIdType::of(id).index()];
        info.current_count = info.current_count.saturating_sub(1);

        Some(path_id)
    }

    /// Returns the path id with the given identifier.
    pub fn get(&self, id: u32) -> Option<&PathId> {
        match &self.lookup {
            Lookup::Empty => None,

            Lookup::Single(p) => (p.id == id).then_some(&**p),

            Lookup::Table(table) => table.get(&id).map(|p| &**p),
        }
    }

    /// Returns the mutable path id with the given identifier.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut PathId> {
        match &mut self.lookup {
            Lookup::Empty => None,

            Lookup::Single(p) => (p.id == id).then_some(&mut **p),

            Lookup::Table(table) => table.get_mut(&id).map(|p| &mut **p),
        }
    }

    /// Returns true if a path id with the given identifier is registered.
    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// Iterates over the registered path ids, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &PathId> {
        let (single, table) = match &self.lookup {
            Lookup::Empty => (None, None),
            Lookup::Single(p) => (Some(&**p), None),
            Lookup::Table(t) => (None, Some(t)),
        };

        single
            .into_iter()
            .chain(table.into_iter().flat_map(|t| t.values().map(|p| &**p)))
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut PathId> {
        let (single, table) = match &mut self.lookup {
            Lookup::Empty => (None, None),
            Lookup::Single(p) => (Some(&mut **p), None),
            Lookup::Table(t) => (None, Some(t)),
        };

        single.into_iter().chain(
            table
                .into_iter()
                .flat_map(|t| t.values_mut().map(|p| &mut **p)),
        )
    }

    /// The number of registered path ids.
    pub fn len(&self) -> usize {
        self.count as usize
    }

    /// Returns true if no path ids are registered.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Returns true once the lookup table has been allocated.
    pub fn is_promoted(&self) -> bool {
        matches!(self.lookup, Lookup::Table(_))
    }

    /// The bookkeeping for the given initiator type.
    pub fn info(&self, ty: PathIdType) -> &PathIdTypeInfo {
        &self.types[ty.index()]
    }

    /// The connection-wide multipath switches.
    pub fn flags(&self) -> PathIdSetFlags {
        self.flags
    }

    /// The number of path ids of type `ty` that can still be opened before
    /// hitting the peer's limit.
    pub fn count_available(&self, ty: PathIdType) -> u64 {
        let info = &self.types[ty.index()];

        info.peer_max_paths
            .saturating_sub(u64::from(info.total_count))
    }

    /// The `max_paths` values advertised to the peer, indexed by type.
    pub fn max_path_ids(&self) -> [u64; 2] {
        [
            self.types[PathIdType::Client.index()].max_paths,
            self.types[PathIdType::Server.index()].max_paths,
        ]
    }

    /// The largest identifier of type `ty` the peer currently allows, if
    /// any.
    ///
    /// Path ids above it are peer blocked.
    pub fn peer_max_path_id(&self, ty: PathIdType) -> Option<u32> {
        let max_paths = self.types[ty.index()].peer_max_paths;

        max_paths
            .checked_sub(1)
            .and_then(|sequence| path_id::encode(ty, sequence))
    }

    /// Logs the full state of the set.
    pub fn trace_rundown(&self) {
        for ty in PathIdType::ALL {
            trace!("path ids {:?}: {:?}", ty, self.types[ty.index()]);
        }

        trace!(
            "path ids: count={} promoted={} flags={:?}",
            self.count,
            self.is_promoted(),
            self.flags
        );

        for p in self.iter() {
            trace!("path id {:?}", p);
        }
    }

    fn open(info: &mut PathIdTypeInfo) {
        info.current_count = info.current_count.saturating_add(1);
        info.max_current_count =
            cmp::max(info.max_current_count, info.current_count);
    }

    fn raise_peer_max_paths(&mut self, ty: PathIdType, max_paths: u64) -> bool {
        let info = &mut self.types[ty.index()];

        if max_paths <= info.peer_max_paths {
            if max_paths < info.peer_max_paths {
                debug!(
                    "ignoring peer max paths decrease for {:?}: {} -> {}",
                    ty, info.peer_max_paths, max_paths
                );
            }

            return false;
        }

        debug!(
            "peer max paths for {:?}: {} -> {}",
            ty, info.peer_max_paths, max_paths
        );

        info.peer_max_paths = max_paths;

        true
    }

    fn unblock(&mut self, ty: PathIdType) -> usize {
        let peer_max_paths = self.types[ty.index()].peer_max_paths;

        let mut unblocked = 0;

        for p in self.iter_mut() {
            if p.flags.peer_blocked &&
                PathIdType::of(p.id) == ty &&
                path_id::sequence(p.id) < peer_max_paths
            {
                p.flags.peer_blocked = false;
                unblocked += 1;
            }
        }

        unblocked
    }

    fn reserve(&self, table: &mut PathIdHashMap<Pooled<PathId>>, n: usize) -> bool {
        #[cfg(test)]
        if self.fail_table_alloc {
            return false;
        }

        table.try_reserve(n).is_ok()
    }
}

impl Drop for PathIdSet {
    fn drop(&mut self) {
        // Unlink everything so the path ids can be freed with the lookup.
        for p in self.iter_mut() {
            p.flags.in_table = false;
        }
    }
}
