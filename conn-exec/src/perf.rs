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

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;

/// The counters a worker keeps for the connections it drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PerfCounter {
    /// Total number of operations ever queued.
    ConnOperQueued,

    /// Number of operations currently sitting in queues.
    ConnOperQueueDepth,

    /// Total number of operations processed.
    ConnOperCompleted,
}

const PERF_COUNTER_COUNT: usize = 3;

/// Per-worker performance counters.
///
/// Updated from producer threads as well as from the worker, so every counter
/// is atomic. Values are signed so that an accounting bug shows up as a
/// negative depth rather than a wrapped one.
#[derive(Debug, Default)]
pub struct PerfCounters {
    counters: [AtomicI64; PERF_COUNTER_COUNT],
}

impl PerfCounters {
    /// Adds `v` to the counter (which may be negative).
    pub fn add(&self, counter: PerfCounter, v: i64) {
        self.counters[counter as usize].fetch_add(v, Ordering::Relaxed);
    }

    /// Adds one to the counter.
    pub fn increment(&self, counter: PerfCounter) {
        self.add(counter, 1);
    }

    /// Returns the current value of the counter.
    pub fn get(&self, counter: PerfCounter) -> i64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }
}
