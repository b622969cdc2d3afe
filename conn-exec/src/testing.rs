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

//! Test helpers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::ConnectionHandle;
use crate::connection::NoopHandler;
use crate::stream::ShutdownFlags;
use crate::stream::Stream;
use crate::Config;
use crate::Result;
use crate::Worker;

/// A stream that records what was done to it.
#[derive(Default)]
pub struct TestStream {
    id: u64,

    state: Mutex<TestStreamState>,
}

#[derive(Default)]
struct TestStreamState {
    started: bool,
    start_completions: Vec<Result<()>>,
    shutdowns: Vec<(ShutdownFlags, u64)>,
}

impl TestStream {
    pub fn new(id: u64, started: bool) -> Arc<TestStream> {
        Arc::new(TestStream {
            id,
            state: Mutex::new(TestStreamState {
                started,
                ..Default::default()
            }),
        })
    }

    pub fn start_completions(&self) -> Vec<Result<()>> {
        self.state.lock().start_completions.clone()
    }

    pub fn shutdowns(&self) -> Vec<(ShutdownFlags, u64)> {
        self.state.lock().shutdowns.clone()
    }
}

impl Stream for TestStream {
    fn id(&self) -> u64 {
        self.id
    }

    fn is_started(&self) -> bool {
        self.state.lock().started
    }

    fn indicate_start_complete(&self, status: Result<()>) {
        let mut state = self.state.lock();

        state.started |= status.is_ok();
        state.start_completions.push(status);
    }

    fn shutdown(&self, flags: ShutdownFlags, error_code: u64) {
        self.state.lock().shutdowns.push((flags, error_code));
    }
}

pub fn worker_and_connection() -> (Worker, ConnectionHandle) {
    worker_and_connection_with(&Config::new())
}

pub fn worker_and_connection_with(config: &Config) -> (Worker, ConnectionHandle) {
    let mut worker = Worker::new(config);
    let conn = worker.add_connection(false, Box::new(NoopHandler));

    (worker, conn)
}
