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

//! The thread that runs connections.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::ThreadId;

use parking_lot::Condvar;
use parking_lot::Mutex;

use slab::Slab;

use worker_pool::Pool;

use crate::connection::ConnShared;
use crate::connection::Connection;
use crate::connection::ConnectionHandle;
use crate::connection::ConnectionHandler;
use crate::operation::queue::OperationQueue;
use crate::operation::ApiContext;
use crate::operation::Operation;
use crate::path_id::PathId;
use crate::path_id::PathIdType;
use crate::perf::PerfCounters;
use crate::Config;

/// Connections with queued operations, in processing order.
///
/// Uses the same two lanes as the operation queue: connections with
/// priority work go out first.
#[derive(Default)]
struct ReadyList {
    priority: VecDeque<Arc<ConnShared>>,

    normal: VecDeque<Arc<ConnShared>>,

    /// Set once the worker is gone. Entries hold the worker's shared state
    /// through their connection, so nothing may be added after that.
    closed: bool,
}

impl ReadyList {
    fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    fn clear(&mut self) {
        self.priority.clear();
        self.normal.clear();
    }
}

/// The part of a worker producers share.
pub(crate) struct WorkerShared {
    pub(crate) opers: Pool<Operation>,

    pub(crate) api_contexts: Pool<ApiContext>,

    pub(crate) path_ids: Pool<PathId>,

    pub(crate) counters: PerfCounters,

    pub(crate) max_operations_per_drain: usize,

    pub(crate) multipath: bool,

    ready: Mutex<ReadyList>,

    cond: Condvar,

    thread: Mutex<Option<ThreadId>>,

    shutdown: AtomicBool,
}

impl WorkerShared {
    /// Schedules `conn` behind every ready connection.
    pub(crate) fn queue_connection(&self, conn: &Arc<ConnShared>) {
        self.push_ready(conn, false);
    }

    /// Schedules `conn` behind other connections with priority work, ahead
    /// of the rest.
    pub(crate) fn queue_priority_connection(&self, conn: &Arc<ConnShared>) {
        self.push_ready(conn, true);
    }

    fn push_ready(&self, conn: &Arc<ConnShared>, priority: bool) {
        {
            let mut ready = self.ready.lock();

            if ready.closed {
                trace!("{} worker gone, not scheduling", conn.trace_id);
                return;
            }

            if priority {
                ready.priority.push_back(Arc::clone(conn));
            } else {
                ready.normal.push_back(Arc::clone(conn));
            }
        }

        self.cond.notify_one();
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        *self.thread.lock() == Some(thread::current().id())
    }

    fn pop_ready(&self) -> Option<Arc<ConnShared>> {
        let mut ready = self.ready.lock();

        match ready.priority.pop_front() {
            Some(v) => Some(v),

            None => ready.normal.pop_front(),
        }
    }

    fn wait_for_work(&self) {
        let mut ready = self.ready.lock();

        while ready.is_empty() && !self.shutdown.load(Ordering::Acquire) {
            self.cond.wait(&mut ready);
        }
    }
}

/// A handle to stop a running [`Worker`] from another thread.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Asks the worker to stop.
    ///
    /// [`Worker::run()`] returns once the current connection is processed.
    /// Every connection is dropped on the way out, failing their pending
    /// operations.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);

        // Taken so the worker cannot miss the wakeup between its check and
        // its wait.
        let _ready = self.shared.ready.lock();
        self.shared.cond.notify_all();
    }

    /// Returns true once a shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }
}

/// Runs a set of connections, one operation at a time.
pub struct Worker {
    shared: Arc<WorkerShared>,

    connections: Slab<Connection>,

    local_max_paths: [u64; 2],

    next_serial: u64,
}

impl Worker {
    /// Creates a worker with pools sized from `config`.
    pub fn new(config: &Config) -> Worker {
        let shared = WorkerShared {
            opers: Pool::new("oper", config.oper_pool_capacity),
            api_contexts: Pool::new("api", config.api_context_pool_capacity),
            path_ids: Pool::new("path_id", config.path_id_pool_capacity),
            counters: PerfCounters::default(),
            max_operations_per_drain: config.max_operations_per_drain,
            multipath: config.multipath,
            ready: Mutex::new(ReadyList::default()),
            cond: Condvar::new(),
            thread: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        };

        let mut local_max_paths = [0; 2];

        if config.multipath {
            local_max_paths[PathIdType::Client.index()] =
                config.local_max_client_paths;
            local_max_paths[PathIdType::Server.index()] =
                config.local_max_server_paths;
        }

        Worker {
            shared: Arc::new(shared),
            connections: Slab::new(),
            local_max_paths,
            next_serial: 0,
        }
    }

    /// A handle to stop the worker.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Adds a connection and returns its producer handle.
    pub fn add_connection(
        &mut self, is_server: bool, handler: Box<dyn ConnectionHandler>,
    ) -> ConnectionHandle {
        let entry = self.connections.vacant_entry();
        let key = entry.key();

        let serial = self.next_serial;
        self.next_serial += 1;

        let shared = Arc::new(ConnShared {
            key,
            trace_id: format!("{serial:016x}"),
            oper_q: OperationQueue::new(),
            closed: AtomicBool::new(false),
            worker: Arc::clone(&self.shared),
        });

        let mut conn = Connection::new(Arc::clone(&shared), is_server, handler);

        for ty in PathIdType::ALL {
            conn.state_mut()
                .path_ids_mut()
                .set_local_max_paths(ty, self.local_max_paths[ty.index()]);
        }

        trace!(
            "{} connection added at slot {} server={}",
            shared.trace_id,
            key,
            is_server
        );

        entry.insert(conn);

        ConnectionHandle::new(shared)
    }

    /// Returns the connection `handle` refers to, if it is still alive.
    pub fn connection(&self, handle: &ConnectionHandle) -> Option<&Connection> {
        self.connections
            .get(handle.id())
            .filter(|c| handle.shares(c.shared()))
    }

    /// Like [`Worker::connection()`], but mutable.
    pub fn connection_mut(
        &mut self, handle: &ConnectionHandle,
    ) -> Option<&mut Connection> {
        self.connections
            .get_mut(handle.id())
            .filter(|c| handle.shares(c.shared()))
    }

    /// Drops a connection, failing its pending operations.
    ///
    /// Returns false if the connection was already gone.
    pub fn remove_connection(&mut self, handle: &ConnectionHandle) -> bool {
        if self.connection(handle).is_none() {
            return false;
        }

        self.connections.remove(handle.id());

        true
    }

    /// The number of live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// The worker's counters.
    pub fn perf_counters(&self) -> &PerfCounters {
        &self.shared.counters
    }

    /// The pool path ids are charged to.
    pub fn path_id_pool(&self) -> &Pool<PathId> {
        &self.shared.path_ids
    }

    /// The pool operations are charged to.
    pub fn oper_pool(&self) -> &Pool<Operation> {
        &self.shared.opers
    }

    /// Processes the next ready connection.
    ///
    /// Returns false if no connection was ready.
    pub fn process_ready(&mut self) -> bool {
        let ready = match self.shared.pop_ready() {
            Some(v) => v,

            None => return false,
        };

        let key = ready.key;

        let conn = match self.connections.get_mut(key) {
            Some(c) if Arc::ptr_eq(c.shared(), &ready) => c,

            // Dropped after it was scheduled.
            _ => return true,
        };

        let res = conn.drain_operations();

        if conn.state().is_closed() {
            trace!("{} connection closed", ready.trace_id);

            self.connections.remove(key);
        } else if res.still_has_priority_work {
            self.shared.queue_priority_connection(&ready);
        } else if res.has_more_work {
            self.shared.queue_connection(&ready);
        }

        true
    }

    /// Processes connections on the current thread until
    /// [`WorkerHandle::shutdown()`] is called, then drops every connection.
    pub fn run(&mut self) {
        *self.shared.thread.lock() = Some(thread::current().id());

        debug!("worker started");

        while !self.shared.shutdown.load(Ordering::Acquire) {
            if !self.process_ready() {
                self.shared.wait_for_work();
            }
        }

        self.drop_connections();

        *self.shared.thread.lock() = None;

        debug!("worker stopped");
    }

    fn drop_connections(&mut self) {
        let dropped = self.connections.len();

        // Each drop sweeps the connection's queue.
        self.connections.clear();

        self.shared.ready.lock().clear();

        if dropped > 0 {
            debug!("dropped {} connections", dropped);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // The ready list holds references back to connections.
        self.shared.ready.lock().closed = true;
        self.drop_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::connection::NoopHandler;
    use crate::operation::ApiKind;
    use crate::operation::TimerType;
    use crate::perf::PerfCounter;
    use crate::Error;

    #[test]
    fn ready_list_priority() {
        let mut worker = Worker::new(&Config::new());

        let a = worker.add_connection(false, Box::new(NoopHandler));
        let b = worker.add_connection(false, Box::new(NoopHandler));
        let c = worker.add_connection(false, Box::new(NoopHandler));

        a.queue_oper(a.alloc_oper(Operation::FlushRecv).unwrap());
        b.queue_priority_oper(b.alloc_oper(Operation::FlushRecv).unwrap());
        c.queue_highest_priority_oper(c.alloc_oper(Operation::FlushRecv).unwrap());

        let order = std::iter::from_fn(|| worker.shared.pop_ready())
            .map(|conn| conn.key)
            .collect::<Vec<_>>();

        assert_eq!(order, vec![b.id(), c.id(), a.id()]);
    }

    #[test]
    fn ready_lanes_stay_ordered_when_deep() {
        const COUNT: usize = 1_000;

        let mut worker = Worker::new(&Config::new());

        let conns = (0..COUNT * 2)
            .map(|_| worker.add_connection(false, Box::new(NoopHandler)))
            .collect::<Vec<_>>();

        for pair in conns.chunks(2) {
            pair[0].queue_oper(pair[0].alloc_oper(Operation::FlushRecv).unwrap());
            pair[1].queue_priority_oper(
                pair[1].alloc_oper(Operation::FlushRecv).unwrap(),
            );
        }

        let order = std::iter::from_fn(|| worker.shared.pop_ready())
            .map(|conn| conn.key)
            .collect::<Vec<_>>();

        let expected = conns
            .iter()
            .skip(1)
            .step_by(2)
            .chain(conns.iter().step_by(2))
            .map(|conn| conn.id())
            .collect::<Vec<_>>();

        assert_eq!(order, expected);
    }

    #[test]
    fn nothing_scheduled_after_worker_dropped() {
        let mut worker = Worker::new(&Config::new());
        let conn = worker.add_connection(false, Box::new(NoopHandler));

        conn.queue_oper(conn.alloc_oper(Operation::FlushRecv).unwrap());

        let conn_shared = worker.shared.pop_ready().unwrap();
        let shared = Arc::clone(&worker.shared);

        drop(worker);

        // A producer that raced with the worker going away.
        shared.queue_connection(&conn_shared);
        shared.queue_priority_connection(&conn_shared);

        assert!(shared.ready.lock().is_empty());
    }

    #[test]
    fn connection_is_scheduled_once() {
        let mut worker = Worker::new(&Config::new());
        let conn = worker.add_connection(true, Box::new(NoopHandler));

        for _ in 0..3 {
            conn.queue_oper(
                conn.alloc_oper(Operation::TimerExpired(TimerType::Pacing))
                    .unwrap(),
            );
        }

        assert_eq!(worker.shared.ready.lock().normal.len(), 1);

        assert!(worker.process_ready());
        assert!(!worker.process_ready());
        assert_eq!(
            worker.perf_counters().get(PerfCounter::ConnOperCompleted),
            3
        );
        assert_eq!(worker.oper_pool().in_use(), 0);
    }

    #[test]
    fn slots_are_reused_safely() {
        let mut worker = Worker::new(&Config::new());

        let old = worker.add_connection(false, Box::new(NoopHandler));
        old.call_api(ApiKind::ConnShutdown { error_code: 0 }).unwrap();

        assert!(worker.remove_connection(&old));
        assert!(!worker.remove_connection(&old));

        let new = worker.add_connection(false, Box::new(NoopHandler));
        assert_eq!(new.id(), old.id());
        assert_ne!(new.trace_id(), old.trace_id());

        // The stale ready entry for the old connection is skipped.
        assert!(worker.process_ready());
        assert!(worker.connection(&old).is_none());
        assert!(worker.connection(&new).is_some());
    }

    #[test]
    fn local_limits_from_config() {
        let mut config = Config::new();
        config.set_local_max_client_paths(4);
        config.set_local_max_server_paths(2);

        let mut worker = Worker::new(&config);
        let conn = worker.add_connection(true, Box::new(NoopHandler));

        let set = worker.connection(&conn).unwrap().state().path_ids();
        assert_eq!(set.max_path_ids(), [4, 2]);

        config.enable_multipath(false);

        let mut worker = Worker::new(&config);
        let conn = worker.add_connection(true, Box::new(NoopHandler));

        let set = worker.connection(&conn).unwrap().state().path_ids();
        assert_eq!(set.max_path_ids(), [0, 0]);
    }

    #[test]
    fn drop_fails_pending_calls() {
        let mut worker = Worker::new(&Config::new());
        let conn = worker.add_connection(false, Box::new(NoopHandler));

        let completion = crate::operation::Completion::new();
        let oper = conn
            .alloc_api_call(ApiContext::with_completion(
                ApiKind::ConnShutdown { error_code: 0 },
                Arc::clone(&completion),
            ))
            .unwrap();
        conn.queue_oper(oper);

        drop(worker);

        assert_eq!(completion.status(), Some(Err(Error::InvalidState)));
        assert!(conn.is_closed());
        assert_eq!(conn.ref_count(), 1);
    }
}
