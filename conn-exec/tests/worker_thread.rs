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

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use conn_exec::ApiKind;
use conn_exec::Config;
use conn_exec::ConnectionHandler;
use conn_exec::ConnectionState;
use conn_exec::Error;
use conn_exec::NoopHandler;
use conn_exec::Operation;
use conn_exec::PathIdType;
use conn_exec::PerfCounter;
use conn_exec::Result;
use conn_exec::TimerType;
use conn_exec::Worker;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn spawn_worker(mut worker: Worker) -> thread::JoinHandle<Worker> {
    thread::spawn(move || {
        worker.run();
        worker
    })
}

#[test]
fn blocking_calls_from_many_threads() {
    init_logging();

    let mut worker = Worker::new(&Config::new());
    let conn = worker.add_connection(false, Box::new(NoopHandler));
    let handle = worker.handle();

    let worker = spawn_worker(worker);

    conn.call_blocking(ApiKind::PeerTransportParams {
        max_client_paths: 8,
        max_server_paths: 0,
    })
    .unwrap();

    let callers = (0..4)
        .map(|_| {
            let conn = conn.clone();

            thread::spawn(move || {
                conn.call_blocking(ApiKind::PathOpen {
                    server_initiating: false,
                })
            })
        })
        .collect::<Vec<_>>();

    for caller in callers {
        assert_eq!(caller.join().unwrap(), Ok(()));
    }

    // A client cannot open server paths.
    assert_eq!(
        conn.call_blocking(ApiKind::PathOpen {
            server_initiating: true,
        }),
        Err(Error::InvalidParameter)
    );

    handle.shutdown();
    let worker = worker.join().unwrap();

    assert_eq!(worker.connection_count(), 0);
    assert!(conn.is_closed());

    let counters = worker.perf_counters();
    assert_eq!(counters.get(PerfCounter::ConnOperQueued), 6);
    assert_eq!(counters.get(PerfCounter::ConnOperCompleted), 6);
    assert_eq!(counters.get(PerfCounter::ConnOperQueueDepth), 0);

    // The four path ids went down with the connection.
    assert_eq!(worker.path_id_pool().in_use(), 0);
    assert_eq!(worker.path_id_pool().high_water(), 4);
}

#[test]
fn path_limits_seen_by_protocol_logic() {
    struct Opener {
        blocked: mpsc::Sender<Vec<bool>>,
    }

    impl ConnectionHandler for Opener {
        fn on_timer_expired(
            &mut self, state: &mut ConnectionState, _timer: TimerType,
        ) {
            let mut ids = state.path_ids().iter().collect::<Vec<_>>();
            ids.sort_by_key(|p| p.id());

            let blocked = ids.iter().map(|p| p.is_peer_blocked()).collect();
            self.blocked.send(blocked).unwrap();
        }
    }

    init_logging();

    let (tx, rx) = mpsc::channel();

    let mut worker = Worker::new(&Config::new());
    let conn = worker.add_connection(false, Box::new(Opener { blocked: tx }));
    let handle = worker.handle();

    let worker = spawn_worker(worker);

    conn.call_blocking(ApiKind::PeerTransportParams {
        max_client_paths: 4,
        max_server_paths: 0,
    })
    .unwrap();

    for _ in 0..5 {
        conn.call_blocking(ApiKind::PathOpen {
            server_initiating: false,
        })
        .unwrap();
    }

    let blocked_flags = || {
        let oper = conn
            .alloc_oper(Operation::TimerExpired(TimerType::KeepAlive))
            .unwrap();
        conn.queue_oper(oper);

        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    };

    assert_eq!(blocked_flags(), vec![false, false, false, false, true]);

    conn.call_api(ApiKind::PeerMaxPaths {
        ty: PathIdType::Client,
        max_paths: 5,
    })
    .unwrap();

    assert_eq!(blocked_flags(), vec![false; 5]);

    handle.shutdown();
    worker.join().unwrap();
}

#[test]
fn shutdown_fails_pending_blocking_call() {
    struct Stall {
        entered: mpsc::Sender<()>,
        release: mpsc::Receiver<()>,
    }

    impl ConnectionHandler for Stall {
        fn on_timer_expired(
            &mut self, _state: &mut ConnectionState, _timer: TimerType,
        ) {
            self.entered.send(()).unwrap();
            self.release.recv().unwrap();
        }

        fn on_api_call(
            &mut self, _state: &mut ConnectionState, _kind: &ApiKind,
        ) -> Result<()> {
            panic!("call should have been cancelled");
        }
    }

    init_logging();

    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();

    let mut config = Config::new();
    config.set_max_operations_per_drain(1);

    let mut worker = Worker::new(&config);
    let conn = worker.add_connection(
        true,
        Box::new(Stall {
            entered: entered_tx,
            release: release_rx,
        }),
    );
    let handle = worker.handle();

    let worker = spawn_worker(worker);

    let oper = conn
        .alloc_oper(Operation::TimerExpired(TimerType::Idle))
        .unwrap();
    conn.queue_oper(oper);

    entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let caller = {
        let conn = conn.clone();

        thread::spawn(move || {
            conn.call_blocking(ApiKind::ConnShutdown { error_code: 1 })
        })
    };

    while conn.queue_len() == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    handle.shutdown();
    release_tx.send(()).unwrap();

    assert_eq!(caller.join().unwrap(), Err(Error::InvalidState));

    let worker = worker.join().unwrap();

    assert!(conn.is_closed());
    assert_eq!(
        worker.perf_counters().get(PerfCounter::ConnOperCompleted),
        1
    );
    assert_eq!(
        worker.perf_counters().get(PerfCounter::ConnOperQueueDepth),
        0
    );
}
