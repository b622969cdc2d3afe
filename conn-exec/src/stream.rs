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

//! The stream subsystem as seen from the operation queue.
//!
//! Streams live outside this crate. Operations only hold a reference to the
//! stream they act on, and the queue's cancellation sweep needs to be able to
//! abort a stream whose start or send never got processed.

use std::ops::BitOr;

use crate::Result;

/// Flags for [`Stream::shutdown()`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownFlags(u32);

impl ShutdownFlags {
    /// No flags.
    pub const NONE: ShutdownFlags = ShutdownFlags(0);

    /// Cleanly close the send direction.
    pub const GRACEFUL: ShutdownFlags = ShutdownFlags(0x1);

    /// Abruptly close the send direction.
    pub const ABORT_SEND: ShutdownFlags = ShutdownFlags(0x2);

    /// Abruptly close the receive direction.
    pub const ABORT_RECEIVE: ShutdownFlags = ShutdownFlags(0x4);

    /// Abruptly close both directions.
    pub const ABORT: ShutdownFlags = ShutdownFlags(0x6);

    /// Do not wait for the peer to acknowledge the shutdown.
    pub const IMMEDIATE: ShutdownFlags = ShutdownFlags(0x8);

    /// Returns true if all of `other`'s flags are set.
    pub fn contains(self, other: ShutdownFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ShutdownFlags {
    type Output = ShutdownFlags;

    fn bitor(self, rhs: ShutdownFlags) -> ShutdownFlags {
        ShutdownFlags(self.0 | rhs.0)
    }
}

/// Flags for a stream start API call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StartFlags {
    /// Start the stream even if the peer's stream limit would block it.
    pub immediate: bool,

    /// Shut the stream down if it could not be started.
    pub shutdown_on_fail: bool,
}

/// A stream object owned by the stream subsystem.
pub trait Stream: Send + Sync {
    /// The stream ID.
    fn id(&self) -> u64;

    /// Whether the stream has been started.
    fn is_started(&self) -> bool;

    /// Reports the outcome of a start request to the stream's owner.
    fn indicate_start_complete(&self, status: Result<()>);

    /// Shuts the stream down.
    fn shutdown(&self, flags: ShutdownFlags, error_code: u64);
}
