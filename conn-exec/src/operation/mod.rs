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

//! Units of deferred connection work.
//!
//! An operation is anything that needs to touch a connection's protocol
//! state: an application API call, a timer that fired, received data that
//! must be flushed, a flight of data to send, and so on. Producers build one,
//! charge it to the worker's operation pool and push it onto the connection's
//! [`OperationQueue`](queue::OperationQueue). The worker pops and processes
//! it.
//!
//! Every payload owns whatever it references. Dropping an operation releases
//! its stream references, its API context slot and its stateless context.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Condvar;
use parking_lot::Mutex;

use worker_pool::Pooled;

use crate::path_id::PathIdType;
use crate::stream::ShutdownFlags;
use crate::stream::StartFlags;
use crate::stream::Stream;
use crate::Error;
use crate::Result;

pub mod queue;

/// Connection timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerType {
    /// Pacing timer.
    Pacing,

    /// Delayed ACK timer.
    AckDelay,

    /// Loss detection timer.
    LossDetection,

    /// Keep-alive timer.
    KeepAlive,

    /// Idle timeout timer.
    Idle,

    /// Shutdown (draining) timer.
    Shutdown,
}

/// The kinds of stateless operations a binding can hand to a connection's
/// worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatelessKind {
    /// Send a version negotiation packet.
    VersionNegotiation,

    /// Send a stateless reset.
    StatelessReset,

    /// Send a retry packet.
    Retry,
}

/// Per-packet state of a stateless operation, owned by the binding that
/// created it.
///
/// Dropping the context hands it back to the binding.
pub trait StatelessContext: Send {
    /// The address the stateless response goes to.
    fn remote_addr(&self) -> SocketAddr;
}

/// The completion signal of a synchronous API call.
///
/// The caller keeps one reference and waits on it; the operation carries the
/// other. The status is written exactly once, either by the worker after
/// processing the call or by the queue's cancellation sweep.
#[derive(Debug, Default)]
pub struct Completion {
    status: Mutex<Option<Result<()>>>,
    cond: Condvar,
}

impl Completion {
    /// Creates a new, unsignaled completion.
    pub fn new() -> Arc<Completion> {
        Arc::new(Completion::default())
    }

    /// Stores the status and wakes every waiter.
    ///
    /// Only the first status is kept.
    pub fn complete(&self, status: Result<()>) {
        let mut slot = self.status.lock();

        if slot.is_none() {
            *slot = Some(status);
        }

        self.cond.notify_all();
    }

    /// Returns the status, if the call was completed.
    pub fn status(&self) -> Option<Result<()>> {
        *self.status.lock()
    }

    /// Returns true if the call was completed.
    pub fn is_complete(&self) -> bool {
        self.status.lock().is_some()
    }

    /// Blocks until the call is completed and returns its status.
    pub fn wait(&self) -> Result<()> {
        let mut slot = self.status.lock();

        loop {
            if let Some(status) = *slot {
                return status;
            }

            self.cond.wait(&mut slot);
        }
    }

    /// Like [`Completion::wait()`] but gives up after `timeout`, returning
    /// `None`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let mut slot = self.status.lock();

        if slot.is_none() {
            self.cond.wait_while_for(&mut slot, |s| s.is_none(), timeout);
        }

        *slot
    }
}

/// The call-specific arguments of an API call operation.
pub enum ApiKind {
    /// Close the connection handle.
    ConnClose,

    /// Shut the connection down.
    ConnShutdown {
        /// The application error code sent to the peer.
        error_code: u64,
    },

    /// Start a stream.
    StreamStart {
        /// The stream to start.
        stream: Arc<dyn Stream>,

        /// How to start it.
        flags: StartFlags,
    },

    /// Shut a stream down.
    StreamShutdown {
        /// The stream to shut down.
        stream: Arc<dyn Stream>,

        /// How to shut it down.
        flags: ShutdownFlags,

        /// The application error code.
        error_code: u64,
    },

    /// Flush data queued on a stream.
    StreamSend {
        /// The stream with data to send.
        stream: Arc<dyn Stream>,
    },

    /// The application finished consuming received stream data.
    StreamRecvComplete {
        /// The stream, if it is still referenced.
        stream: Option<Arc<dyn Stream>>,

        /// The number of bytes consumed.
        len: u64,
    },

    /// Enable or disable receive callbacks on a stream.
    StreamRecvSetEnabled {
        /// The stream.
        stream: Arc<dyn Stream>,

        /// Whether receiving is enabled.
        enabled: bool,
    },

    /// Open a new path identifier.
    PathOpen {
        /// Whether the path is opened for the server side.
        server_initiating: bool,
    },

    /// The peer's transport parameters were decoded.
    PeerTransportParams {
        /// The peer's `max_client_paths`, zero if absent.
        max_client_paths: u32,

        /// The peer's `max_server_paths`, zero if absent.
        max_server_paths: u32,
    },

    /// A `MAX_PATHS` frame was received.
    PeerMaxPaths {
        /// The path type the frame applies to.
        ty: PathIdType,

        /// The new limit.
        max_paths: u64,
    },
}

impl ApiKind {
    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ApiKind::ConnClose => "CONN_CLOSE",
            ApiKind::ConnShutdown { .. } => "CONN_SHUTDOWN",
            ApiKind::StreamStart { .. } => "STRM_START",
            ApiKind::StreamShutdown { .. } => "STRM_SHUTDOWN",
            ApiKind::StreamSend { .. } => "STRM_SEND",
            ApiKind::StreamRecvComplete { .. } => "STRM_RECV_COMPLETE",
            ApiKind::StreamRecvSetEnabled { .. } => "STRM_RECV_SET_ENABLED",
            ApiKind::PathOpen { .. } => "PATH_OPEN",
            ApiKind::PeerTransportParams { .. } => "PEER_TP",
            ApiKind::PeerMaxPaths { .. } => "PEER_MAX_PATHS",
        }
    }

    /// The stream the call acts on, if any.
    pub fn stream(&self) -> Option<&Arc<dyn Stream>> {
        match self {
            ApiKind::StreamStart { stream, .. } |
            ApiKind::StreamShutdown { stream, .. } |
            ApiKind::StreamSend { stream } |
            ApiKind::StreamRecvSetEnabled { stream, .. } => Some(stream),

            ApiKind::StreamRecvComplete { stream, .. } => stream.as_ref(),

            _ => None,
        }
    }
}

impl fmt::Debug for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.stream() {
            Some(stream) => write!(f, "{}(stream={})", self.name(), stream.id()),
            None => f.write_str(self.name()),
        }
    }
}

/// The context of an API call operation, allocated from its own pool.
pub struct ApiContext {
    /// What to do.
    pub kind: ApiKind,

    /// Set for synchronous calls: the caller is blocked on it.
    completion: Option<Arc<Completion>>,
}

impl ApiContext {
    /// Creates the context of a fire-and-forget call.
    pub fn new(kind: ApiKind) -> ApiContext {
        ApiContext {
            kind,
            completion: None,
        }
    }

    /// Creates the context of a call whose caller waits on `completion`.
    pub fn with_completion(
        kind: ApiKind, completion: Arc<Completion>,
    ) -> ApiContext {
        ApiContext {
            kind,
            completion: Some(completion),
        }
    }

    /// The completion of a synchronous call.
    pub fn completion(&self) -> Option<&Arc<Completion>> {
        self.completion.as_ref()
    }

    /// Signals the synchronous caller, if any.
    pub(crate) fn complete(&self, status: Result<()>) {
        if let Some(completion) = &self.completion {
            completion.complete(status);
        }
    }
}

impl fmt::Debug for ApiContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ApiContext")
            .field("kind", &self.kind)
            .field("sync", &self.completion.is_some())
            .finish()
    }
}

/// A unit of work for a connection.
pub enum Operation {
    /// An application API call.
    ApiCall(Pooled<ApiContext>),

    /// Process the connection's queued received packets.
    FlushRecv,

    /// A datagram to the given address could not be delivered.
    Unreachable {
        /// The unreachable peer address.
        remote_addr: SocketAddr,
    },

    /// Deliver buffered received data on a stream.
    FlushStreamRecv {
        /// The stream with pending received data.
        stream: Arc<dyn Stream>,
    },

    /// Send pending data.
    FlushSend,

    /// A connection timer fired.
    TimerExpired(TimerType),

    /// Log the connection's current state.
    TraceRundown,

    /// A route resolution for one of the connection's paths finished.
    RouteCompletion {
        /// The resolved next-hop hardware address.
        physical_addr: [u8; 6],

        /// The path the route belongs to.
        path_id: u8,

        /// Whether the resolution succeeded.
        succeeded: bool,
    },

    /// A stateless response to send on behalf of a binding.
    Stateless {
        /// Which response.
        kind: StatelessKind,

        /// The binding's per-packet state.
        context: Option<Box<dyn StatelessContext>>,
    },
}

impl Operation {
    /// Whether the worker drops the operation once processed.
    ///
    /// This is false only for synchronous API calls, whose caller is waiting
    /// on the completion.
    pub fn free_after_process(&self) -> bool {
        match self {
            Operation::ApiCall(ctx) => ctx.completion.is_none(),
            _ => true,
        }
    }

    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::ApiCall(..) => "API_CALL",
            Operation::FlushRecv => "FLUSH_RECV",
            Operation::Unreachable { .. } => "UNREACHABLE",
            Operation::FlushStreamRecv { .. } => "FLUSH_STREAM_RECV",
            Operation::FlushSend => "FLUSH_SEND",
            Operation::TimerExpired(..) => "TIMER_EXPIRED",
            Operation::TraceRundown => "TRACE_RUNDOWN",
            Operation::RouteCompletion { .. } => "ROUTE_COMPLETION",
            Operation::Stateless { kind, .. } => match kind {
                StatelessKind::VersionNegotiation => "VERSION_NEGOTIATION",
                StatelessKind::StatelessReset => "STATELESS_RESET",
                StatelessKind::Retry => "RETRY",
            },
        }
    }

    /// Discards an operation that will never be processed.
    ///
    /// A stream whose start or first send is dropped here would otherwise be
    /// left half-open, so it is aborted. A blocked synchronous caller is
    /// woken with [`Error::InvalidState`].
    pub(crate) fn cancel(oper: Pooled<Operation>) {
        if let Operation::ApiCall(ctx) = &*oper {
            match &ctx.kind {
                ApiKind::StreamStart { stream, flags } => {
                    stream.indicate_start_complete(Err(Error::Aborted));

                    if flags.shutdown_on_fail {
                        stream.shutdown(
                            ShutdownFlags::ABORT | ShutdownFlags::IMMEDIATE,
                            0,
                        );
                    }
                },

                ApiKind::StreamSend { stream } if !stream.is_started() => {
                    stream.shutdown(
                        ShutdownFlags::ABORT | ShutdownFlags::IMMEDIATE,
                        0,
                    );
                },

                _ => (),
            }

            ctx.complete(Err(Error::InvalidState));
        }

        // Dropping releases the stream references and pool slots.
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Operation::ApiCall(ctx) => write!(f, "API_CALL({:?})", ctx.kind),
            Operation::TimerExpired(t) => write!(f, "TIMER_EXPIRED({t:?})"),
            _ => f.write_str(self.name()),
        }
    }
}
