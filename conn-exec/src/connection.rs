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

//! Connections and their drain loop.
//!
//! A connection is split in two. The [`ConnectionHandle`] side is shared
//! with every producer thread and only holds the operation queue. The
//! [`Connection`] side is owned by the worker and holds the protocol state,
//! which only the worker thread ever touches.

use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use worker_pool::Pooled;

use crate::operation::queue::OperationQueue;
use crate::operation::ApiContext;
use crate::operation::ApiKind;
use crate::operation::Completion;
use crate::operation::Operation;
use crate::operation::StatelessContext;
use crate::operation::StatelessKind;
use crate::operation::TimerType;
use crate::path_id::set::PathIdSet;
use crate::path_id::PathId;
use crate::path_id::PathIdType;
use crate::perf::PerfCounter;
use crate::stream::ShutdownFlags;
use crate::stream::Stream;
use crate::worker::WorkerShared;
use crate::Error;
use crate::Result;

/// The part of a connection producers share.
pub(crate) struct ConnShared {
    /// The connection's slot in its worker.
    pub(crate) key: usize,

    pub(crate) trace_id: String,

    pub(crate) oper_q: OperationQueue,

    /// Set once the worker dropped the connection. Operations queued after
    /// that are cancelled right away.
    pub(crate) closed: AtomicBool,

    pub(crate) worker: Arc<WorkerShared>,
}

impl Drop for ConnShared {
    fn drop(&mut self) {
        let discarded = self.oper_q.clear(&self.worker.counters);

        if discarded > 0 {
            trace!("{} discarded {} late opers", self.trace_id, discarded);
        }

        self.oper_q.uninitialize();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Lane {
    Normal,
    Priority,
    Front,
}

/// The thread-safe producer side of a connection.
///
/// Handles are cheap to clone. Every clone, including the one each
/// [`PathId`] keeps, is a reference on the connection's shared state.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnShared>,
}

impl ConnectionHandle {
    pub(crate) fn new(shared: Arc<ConnShared>) -> ConnectionHandle {
        ConnectionHandle { shared }
    }

    /// The connection's slot in its worker.
    pub fn id(&self) -> usize {
        self.shared.key
    }

    /// Returns a string uniquely representing the connection.
    ///
    /// This can be used for logging purposes to differentiate between
    /// multiple connections.
    pub fn trace_id(&self) -> &str {
        &self.shared.trace_id
    }

    /// Returns true once the worker dropped the connection.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// The number of operations waiting to be processed.
    pub fn queue_len(&self) -> usize {
        self.shared.oper_q.len()
    }

    /// The number of references on the connection's shared state.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    pub(crate) fn worker(&self) -> &WorkerShared {
        &self.shared.worker
    }

    pub(crate) fn shares(&self, shared: &Arc<ConnShared>) -> bool {
        Arc::ptr_eq(&self.shared, shared)
    }

    /// Charges `oper` to the worker's operation pool.
    pub fn alloc_oper(&self, oper: Operation) -> Result<Pooled<Operation>> {
        let pool = &self.worker().opers;

        pool.alloc(oper).map_err(|oper| {
            warn!(
                "{} {} pool exhausted at {}, dropping {:?}",
                self.trace_id(),
                pool.name(),
                pool.capacity(),
                oper
            );

            Error::OutOfMemory
        })
    }

    /// Charges an API call to the worker's pools.
    pub fn alloc_api_call(&self, ctx: ApiContext) -> Result<Pooled<Operation>> {
        let pool = &self.worker().api_contexts;

        let ctx = pool.alloc(ctx).map_err(|ctx| {
            warn!(
                "{} {} pool exhausted at {}, dropping {:?}",
                self.trace_id(),
                pool.name(),
                pool.capacity(),
                ctx
            );

            Error::OutOfMemory
        })?;

        self.alloc_oper(Operation::ApiCall(ctx))
    }

    /// Queues `oper` behind every pending operation.
    pub fn queue_oper(&self, oper: Pooled<Operation>) {
        self.queue(oper, Lane::Normal);
    }

    /// Queues `oper` behind pending priority operations, ahead of normal
    /// ones.
    pub fn queue_priority_oper(&self, oper: Pooled<Operation>) {
        self.queue(oper, Lane::Priority);
    }

    /// Queues `oper` ahead of every pending operation.
    pub fn queue_highest_priority_oper(&self, oper: Pooled<Operation>) {
        self.queue(oper, Lane::Front);
    }

    /// Queues a fire-and-forget API call.
    pub fn call_api(&self, kind: ApiKind) -> Result<()> {
        let oper = self.alloc_api_call(ApiContext::new(kind))?;

        self.queue_oper(oper);

        Ok(())
    }

    /// Queues an API call and blocks until the worker has processed it.
    ///
    /// Returns the call's status, or [`Error::InvalidState`] if the
    /// connection went away before the call could run. Calling this from the
    /// worker thread itself would deadlock, so it fails with
    /// [`Error::InvalidState`] there.
    pub fn call_blocking(&self, kind: ApiKind) -> Result<()> {
        if self.worker().is_worker_thread() {
            error!(
                "{} blocking {} call on the worker thread",
                self.trace_id(),
                kind.name()
            );

            return Err(Error::InvalidState);
        }

        let completion = Completion::new();

        let oper = self.alloc_api_call(ApiContext::with_completion(
            kind,
            Arc::clone(&completion),
        ))?;

        self.queue_oper(oper);

        completion.wait()
    }

    fn queue(&self, oper: Pooled<Operation>, lane: Lane) {
        let shared = &self.shared;
        let counters = &shared.worker.counters;

        if shared.closed.load(Ordering::Acquire) {
            trace!("{} connection closed, cancelling {:?}", shared.trace_id, oper);

            Operation::cancel(oper);
            return;
        }

        trace!("{} queueing {:?}", shared.trace_id, oper);

        let start_processing = match lane {
            Lane::Normal => shared.oper_q.enqueue(oper, counters),
            Lane::Priority => shared.oper_q.enqueue_priority(oper, counters),
            Lane::Front => shared.oper_q.enqueue_front(oper, counters),
        };

        // The worker may have dropped the connection while we were
        // enqueueing, after its own sweep.
        if shared.closed.load(Ordering::Acquire) {
            shared.oper_q.clear(counters);
            return;
        }

        if !start_processing {
            return;
        }

        match lane {
            Lane::Normal => shared.worker.queue_connection(shared),
            Lane::Priority | Lane::Front =>
                shared.worker.queue_priority_connection(shared),
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("trace_id", &self.trace_id())
            .finish()
    }
}

/// The protocol state of a connection as far as this crate is concerned.
pub struct ConnectionState {
    trace_id: String,

    is_server: bool,

    path_ids: PathIdSet,

    handle_closed: bool,

    shutdown_complete: bool,

    shutdown_error_code: Option<u64>,

    opers_processed: u64,
}

impl ConnectionState {
    fn new(trace_id: String, is_server: bool) -> ConnectionState {
        ConnectionState {
            trace_id,
            is_server,
            path_ids: PathIdSet::new(),
            handle_closed: false,
            shutdown_complete: false,
            shutdown_error_code: None,
            opers_processed: 0,
        }
    }

    /// Returns a string uniquely representing the connection.
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Returns true if the connection is a server-side connection.
    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// The connection's path ids.
    pub fn path_ids(&self) -> &PathIdSet {
        &self.path_ids
    }

    /// The connection's path ids, mutably.
    pub fn path_ids_mut(&mut self) -> &mut PathIdSet {
        &mut self.path_ids
    }

    /// Returns true once the application closed its handle.
    pub fn is_handle_closed(&self) -> bool {
        self.handle_closed
    }

    /// Returns true once the connection was shut down.
    pub fn is_shutdown_complete(&self) -> bool {
        self.shutdown_complete
    }

    /// The error code the connection was shut down with, if it was shut
    /// down by the application.
    pub fn shutdown_error_code(&self) -> Option<u64> {
        self.shutdown_error_code
    }

    /// Returns true once the connection can be dropped by its worker.
    pub fn is_closed(&self) -> bool {
        self.handle_closed && self.shutdown_complete
    }

    /// The number of operations processed so far.
    pub fn opers_processed(&self) -> u64 {
        self.opers_processed
    }

    /// Applies the multipath limits of the peer's transport parameters.
    pub fn on_peer_transport_params(
        &mut self, max_client_paths: u32, max_server_paths: u32,
    ) {
        trace!(
            "{} peer path limits client={} server={}",
            self.trace_id,
            max_client_paths,
            max_server_paths
        );

        self.path_ids
            .initialize_transport_parameters(max_client_paths, max_server_paths);
    }

    /// Applies a `MAX_PATHS` frame. Returns the number of path ids it
    /// unblocked.
    pub fn on_max_paths(&mut self, ty: PathIdType, max_paths: u64) -> usize {
        let unblocked = self.path_ids.update_max_paths(ty, max_paths);

        if unblocked > 0 {
            debug!(
                "{} {} {:?} path ids unblocked",
                self.trace_id, unblocked, ty
            );
        }

        unblocked
    }

    fn shutdown(&mut self, error_code: Option<u64>) {
        if self.shutdown_complete {
            return;
        }

        debug!("{} shutdown error_code={:?}", self.trace_id, error_code);

        self.shutdown_complete = true;
        self.shutdown_error_code = error_code;
    }

    fn trace_rundown(&self) {
        trace!(
            "{} rundown: server={} handle_closed={} shutdown={} processed={}",
            self.trace_id,
            self.is_server,
            self.handle_closed,
            self.shutdown_complete,
            self.opers_processed
        );

        self.path_ids.trace_rundown();
    }
}

/// The connection's protocol logic, driven by its worker.
///
/// Every method has a no-op default, so implementations only override what
/// they care about. Methods are only ever called on the worker thread.
#[allow(unused_variables)]
pub trait ConnectionHandler: Send {
    /// An API call is being processed.
    ///
    /// Runs before the built-in handling of the call, which is skipped
    /// (apart from completing stream starts) if this returns an error. The
    /// status is reported to synchronous callers.
    fn on_api_call(
        &mut self, state: &mut ConnectionState, kind: &ApiKind,
    ) -> Result<()> {
        Ok(())
    }

    /// A path was opened by a [`ApiKind::PathOpen`] call.
    fn on_path_opened(&mut self, state: &mut ConnectionState, path_id: u32) {}

    /// Queued received packets should be processed.
    ///
    /// Returns true if there is more to do, in which case the flush is
    /// queued again.
    fn on_flush_recv(&mut self, state: &mut ConnectionState) -> bool {
        false
    }

    /// Pending data should be sent.
    ///
    /// Returns true if there is more to send, in which case the flush is
    /// queued again.
    fn on_flush_send(&mut self, state: &mut ConnectionState) -> bool {
        false
    }

    /// Buffered received data should be delivered on `stream`.
    fn on_flush_stream_recv(
        &mut self, state: &mut ConnectionState, stream: &Arc<dyn Stream>,
    ) {
    }

    /// A datagram to `remote_addr` could not be delivered.
    fn on_unreachable(
        &mut self, state: &mut ConnectionState, remote_addr: SocketAddr,
    ) {
    }

    /// A connection timer fired.
    fn on_timer_expired(&mut self, state: &mut ConnectionState, timer: TimerType) {
    }

    /// A route resolution finished.
    fn on_route_completion(
        &mut self, state: &mut ConnectionState, physical_addr: [u8; 6],
        path_id: u8, succeeded: bool,
    ) {
    }

    /// A stateless response should be sent.
    fn on_stateless(
        &mut self, state: &mut ConnectionState, kind: StatelessKind,
        context: Option<&dyn StatelessContext>,
    ) {
    }
}

/// A [`ConnectionHandler`] that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

/// The outcome of one [`Connection::drain_operations()`] pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainResult {
    /// The pass stopped before the queue ran dry.
    pub has_more_work: bool,

    /// Priority operations are still queued.
    pub still_has_priority_work: bool,
}

/// The worker-owned side of a connection.
pub struct Connection {
    shared: Arc<ConnShared>,

    state: ConnectionState,

    handler: Box<dyn ConnectionHandler>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<ConnShared>, is_server: bool,
        handler: Box<dyn ConnectionHandler>,
    ) -> Connection {
        let state = ConnectionState::new(shared.trace_id.clone(), is_server);

        Connection {
            shared,
            state,
            handler,
        }
    }

    /// A new producer handle on this connection.
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(Arc::clone(&self.shared))
    }

    /// The connection's state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The connection's state, mutably.
    pub fn state_mut(&mut self) -> &mut ConnectionState {
        &mut self.state
    }

    pub(crate) fn shared(&self) -> &Arc<ConnShared> {
        &self.shared
    }

    /// Processes queued operations, up to the worker's per-pass limit.
    ///
    /// The pass also ends early once the connection is closed.
    pub fn drain_operations(&mut self) -> DrainResult {
        let shared = Arc::clone(&self.shared);
        let counters = &shared.worker.counters;
        let max_opers = shared.worker.max_operations_per_drain;

        let mut has_more_work = true;
        let mut processed = 0;

        while processed < max_opers && !self.state.is_closed() {
            let oper = match shared.oper_q.dequeue(counters) {
                Some(v) => v,

                None => {
                    has_more_work = false;
                    break;
                },
            };

            processed += 1;

            trace!("{} processing {:?}", self.state.trace_id, oper);

            let requeue = self.process_oper(&oper);

            self.state.opers_processed += 1;
            counters.increment(PerfCounter::ConnOperCompleted);

            if requeue {
                shared.oper_q.enqueue(oper, counters);
            } else if !oper.free_after_process() {
                trace!("{} sync call done", self.state.trace_id);
            }
        }

        // A closed connection is dropped by its worker, which sweeps what is
        // left.
        if self.state.is_closed() {
            has_more_work = false;
        }

        DrainResult {
            has_more_work,
            still_has_priority_work: shared.oper_q.has_priority(),
        }
    }

    fn process_oper(&mut self, oper: &Operation) -> bool {
        let handler = &mut self.handler;
        let state = &mut self.state;

        match oper {
            Operation::ApiCall(ctx) => {
                let status = self.process_api_call(&ctx.kind);

                if let Err(e) = status {
                    trace!(
                        "{} {} failed: {:?}",
                        self.state.trace_id,
                        ctx.kind.name(),
                        e
                    );
                }

                ctx.complete(status);
            },

            Operation::FlushRecv => return handler.on_flush_recv(state),

            Operation::FlushSend => return handler.on_flush_send(state),

            Operation::Unreachable { remote_addr } =>
                handler.on_unreachable(state, *remote_addr),

            Operation::FlushStreamRecv { stream } =>
                handler.on_flush_stream_recv(state, stream),

            Operation::TimerExpired(timer) =>
                handler.on_timer_expired(state, *timer),

            Operation::TraceRundown => state.trace_rundown(),

            Operation::RouteCompletion {
                physical_addr,
                path_id,
                succeeded,
            } => handler.on_route_completion(
                state,
                *physical_addr,
                *path_id,
                *succeeded,
            ),

            Operation::Stateless { kind, context } =>
                handler.on_stateless(state, *kind, context.as_deref()),
        }

        false
    }

    fn process_api_call(&mut self, kind: &ApiKind) -> Result<()> {
        let status = self.handler.on_api_call(&mut self.state, kind);

        match kind {
            ApiKind::ConnClose => {
                self.state.handle_closed = true;
                self.state.shutdown(None);

                Ok(())
            },

            ApiKind::ConnShutdown { error_code } => {
                status?;

                self.state.shutdown(Some(*error_code));

                Ok(())
            },

            ApiKind::StreamStart { stream, flags } => {
                stream.indicate_start_complete(status);

                if status.is_err() && flags.shutdown_on_fail {
                    stream.shutdown(
                        ShutdownFlags::ABORT | ShutdownFlags::IMMEDIATE,
                        0,
                    );
                }

                status
            },

            ApiKind::PathOpen { server_initiating } => {
                status?;

                self.open_path(*server_initiating)
            },

            ApiKind::PeerTransportParams {
                max_client_paths,
                max_server_paths,
            } => {
                status?;

                if !self.shared.worker.multipath {
                    debug!(
                        "{} multipath disabled, ignoring peer path limits",
                        self.state.trace_id
                    );

                    return Ok(());
                }

                self.state
                    .on_peer_transport_params(*max_client_paths, *max_server_paths);

                Ok(())
            },

            ApiKind::PeerMaxPaths { ty, max_paths } => {
                status?;

                self.state.on_max_paths(*ty, *max_paths);

                Ok(())
            },

            _ => status,
        }
    }

    fn open_path(&mut self, server_initiating: bool) -> Result<()> {
        if server_initiating != self.state.is_server {
            return Err(Error::InvalidParameter);
        }

        let flags = self.state.path_ids.flags();

        if self.state.shutdown_complete ||
            !flags.multipath_enabled ||
            (server_initiating && !flags.server_initiated_enabled)
        {
            return Err(Error::InvalidState);
        }

        let path_id = PathId::new(&self.handle(), server_initiating)?;

        let id = PathId::start(path_id, &mut self.state.path_ids, false)?;

        debug!("{} opened path id {}", self.state.trace_id, id);

        self.handler.on_path_opened(&mut self.state, id);

        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);

        let discarded = self.shared.oper_q.clear(&self.shared.worker.counters);

        trace!(
            "{} connection dropped, {} opers discarded",
            self.state.trace_id,
            discarded
        );
    }
}
