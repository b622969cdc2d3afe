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

//! The per-connection operation queue.
//!
//! Many producers push, one worker pops. The queue is made of two lanes that
//! are drained in order: every priority entry goes out before any normal
//! one.
//!
//! - [`OperationQueue::enqueue()`] appends at the end of the normal lane.
//! - [`OperationQueue::enqueue_priority()`] appends at the end of the
//!   priority lane, behind earlier priority entries but ahead of every
//!   normal entry.
//! - [`OperationQueue::enqueue_front()`] inserts ahead of everything. The new
//!   entry heads the priority lane, so a later priority insert lands behind
//!   it.
//!
//! Every insert and pop is a constant-time deque operation. The lock only
//! ever covers that and the flag next to it; no operation is processed
//! while it is held.

use std::collections::VecDeque;

use parking_lot::Mutex;

use worker_pool::Pooled;

use crate::operation::Operation;
use crate::perf::PerfCounter;
use crate::perf::PerfCounters;

#[derive(Default)]
struct Inner {
    priority: VecDeque<Pooled<Operation>>,

    normal: VecDeque<Pooled<Operation>>,

    /// True while the worker is draining the queue in the current pass.
    actively_processing: bool,
}

impl Inner {
    fn is_empty(&self) -> bool {
        self.priority.is_empty() && self.normal.is_empty()
    }

    fn len(&self) -> usize {
        self.priority.len() + self.normal.len()
    }

    /// Whether a producer must schedule the worker for this queue.
    fn needs_worker(&self) -> bool {
        self.is_empty() && !self.actively_processing
    }
}

/// A multi-producer, single-consumer queue of connection operations.
#[derive(Default)]
pub struct OperationQueue {
    inner: Mutex<Inner>,
}

impl OperationQueue {
    /// Creates an empty queue.
    pub fn new() -> OperationQueue {
        OperationQueue::default()
    }

    /// Appends `oper` after every queued operation.
    ///
    /// Returns true if the queue went from idle to non-empty, in which case
    /// the caller must schedule the worker.
    pub fn enqueue(
        &self, oper: Pooled<Operation>, counters: &PerfCounters,
    ) -> bool {
        let start_processing = {
            let mut inner = self.inner.lock();

            let start_processing = inner.needs_worker();
            inner.normal.push_back(oper);

            start_processing
        };

        Self::count_enqueue(counters);

        start_processing
    }

    /// Appends `oper` at the end of the priority lane.
    ///
    /// Returns true if the caller must schedule the worker.
    pub fn enqueue_priority(
        &self, oper: Pooled<Operation>, counters: &PerfCounters,
    ) -> bool {
        let start_processing = {
            let mut inner = self.inner.lock();

            let start_processing = inner.needs_worker();
            inner.priority.push_back(oper);

            start_processing
        };

        Self::count_enqueue(counters);

        start_processing
    }

    /// Inserts `oper` at the head of the queue, ahead of both lanes.
    ///
    /// Returns true if the caller must schedule the worker.
    pub fn enqueue_front(
        &self, oper: Pooled<Operation>, counters: &PerfCounters,
    ) -> bool {
        let start_processing = {
            let mut inner = self.inner.lock();

            let start_processing = inner.needs_worker();
            inner.priority.push_front(oper);

            start_processing
        };

        Self::count_enqueue(counters);

        start_processing
    }

    /// Pops the head of the queue.
    ///
    /// Returns `None` once the queue is empty, which also ends the worker's
    /// current drain pass: the next enqueue will ask for the worker again.
    pub fn dequeue(&self, counters: &PerfCounters) -> Option<Pooled<Operation>> {
        let oper = {
            let mut inner = self.inner.lock();

            let oper = match inner.priority.pop_front() {
                Some(v) => Some(v),

                None => inner.normal.pop_front(),
            };

            inner.actively_processing = oper.is_some();

            oper
        };

        if oper.is_some() {
            counters.add(PerfCounter::ConnOperQueueDepth, -1);
        }

        oper
    }

    /// Discards every queued operation.
    ///
    /// Both lanes are detached under the lock and swept outside of it, in
    /// processing order. Streams whose start or send was pending are
    /// aborted, and blocked synchronous callers are woken with
    /// [`Error::InvalidState`](crate::Error).
    ///
    /// Returns the number of operations discarded.
    pub fn clear(&self, counters: &PerfCounters) -> usize {
        let (priority, normal) = {
            let mut inner = self.inner.lock();

            inner.actively_processing = false;

            (
                std::mem::take(&mut inner.priority),
                std::mem::take(&mut inner.normal),
            )
        };

        let drained = priority.len() + normal.len();

        for oper in priority.into_iter().chain(normal) {
            trace!("discarding queued oper {oper:?}");

            Operation::cancel(oper);
        }

        if drained > 0 {
            counters.add(PerfCounter::ConnOperQueueDepth, -(drained as i64));
        }

        drained
    }

    /// Returns true if priority operations are still queued.
    pub fn has_priority(&self) -> bool {
        !self.inner.lock().priority.is_empty()
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns true if no operations are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Returns true while the worker is in the middle of a drain pass.
    pub fn is_actively_processing(&self) -> bool {
        self.inner.lock().actively_processing
    }

    /// Checks the queue is fit for teardown: [`OperationQueue::clear()`]
    /// must have run if anything was left.
    pub fn uninitialize(&self) {
        let inner = self.inner.lock();

        debug_assert!(inner.priority.is_empty());
        debug_assert!(inner.normal.is_empty());
    }

    fn count_enqueue(counters: &PerfCounters) {
        counters.increment(PerfCounter::ConnOperQueued);
        counters.increment(PerfCounter::ConnOperQueueDepth);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use rstest::rstest;
    use worker_pool::Pool;

    use crate::operation::ApiContext;
    use crate::operation::ApiKind;
    use crate::operation::Completion;
    use crate::operation::TimerType;
    use crate::stream::ShutdownFlags;
    use crate::stream::StartFlags;
    use crate::testing::TestStream;
    use crate::Error;

    struct Harness {
        opers: Pool<Operation>,
        contexts: Pool<ApiContext>,
        counters: PerfCounters,
        queue: OperationQueue,
    }

    impl Harness {
        fn new() -> Harness {
            Harness {
                opers: Pool::unbounded("oper"),
                contexts: Pool::unbounded("api"),
                counters: PerfCounters::default(),
                queue: OperationQueue::new(),
            }
        }

        // Timers make convenient tags for checking order.
        fn timer(&self, t: TimerType) -> Pooled<Operation> {
            self.opers.alloc(Operation::TimerExpired(t)).unwrap()
        }

        fn api(&self, ctx: ApiContext) -> Pooled<Operation> {
            let ctx = self.contexts.alloc(ctx).unwrap();
            self.opers.alloc(Operation::ApiCall(ctx)).unwrap()
        }

        fn drain(&self) -> Vec<TimerType> {
            let mut order = Vec::new();

            while let Some(oper) = self.queue.dequeue(&self.counters) {
                match *oper {
                    Operation::TimerExpired(t) => order.push(t),
                    _ => panic!("unexpected oper {oper:?}"),
                }
            }

            order
        }

        fn depth(&self) -> i64 {
            self.counters.get(PerfCounter::ConnOperQueueDepth)
        }
    }

    use TimerType::*;

    #[test]
    fn fifo() {
        let h = Harness::new();

        for t in [Pacing, AckDelay, LossDetection, KeepAlive] {
            h.queue.enqueue(h.timer(t), &h.counters);
        }

        assert_eq!(h.drain(), vec![Pacing, AckDelay, LossDetection, KeepAlive]);
    }

    #[test]
    fn priority_lands_ahead_of_normal() {
        let h = Harness::new();

        h.queue.enqueue(h.timer(Pacing), &h.counters);
        h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);
        h.queue.enqueue(h.timer(LossDetection), &h.counters);

        assert!(h.queue.has_priority());
        assert_eq!(h.drain(), vec![AckDelay, Pacing, LossDetection]);
        assert!(!h.queue.has_priority());
    }

    #[test]
    fn priority_lane_is_fifo() {
        let h = Harness::new();

        h.queue.enqueue(h.timer(Pacing), &h.counters);
        h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);
        h.queue.enqueue_priority(h.timer(LossDetection), &h.counters);
        h.queue.enqueue(h.timer(KeepAlive), &h.counters);
        h.queue.enqueue_priority(h.timer(Idle), &h.counters);

        assert_eq!(h.drain(), vec![
            AckDelay,
            LossDetection,
            Idle,
            Pacing,
            KeepAlive
        ]);
    }

    #[test]
    fn front_overrides_all() {
        let h = Harness::new();

        h.queue.enqueue(h.timer(Pacing), &h.counters);
        h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);
        h.queue.enqueue_front(h.timer(Shutdown), &h.counters);

        assert_eq!(h.drain(), vec![Shutdown, AckDelay, Pacing]);
    }

    #[test]
    fn front_starts_priority_lane() {
        let h = Harness::new();

        h.queue.enqueue(h.timer(Pacing), &h.counters);
        h.queue.enqueue_front(h.timer(Shutdown), &h.counters);
        assert!(h.queue.has_priority());

        // Lands behind the front entry, ahead of the normal one.
        h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);

        assert_eq!(h.drain(), vec![Shutdown, AckDelay, Pacing]);
    }

    #[test]
    fn front_inside_priority_lane() {
        let h = Harness::new();

        h.queue.enqueue(h.timer(Pacing), &h.counters);
        h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);
        h.queue.enqueue_front(h.timer(Shutdown), &h.counters);
        h.queue.enqueue_priority(h.timer(LossDetection), &h.counters);

        assert_eq!(h.drain(), vec![Shutdown, AckDelay, LossDetection, Pacing]);
    }

    #[test]
    fn boundary_resets_once_priority_lane_drained() {
        let h = Harness::new();

        h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);
        h.queue.enqueue(h.timer(Pacing), &h.counters);

        let first = h.queue.dequeue(&h.counters).unwrap();
        assert!(matches!(*first, Operation::TimerExpired(AckDelay)));
        assert!(!h.queue.has_priority());

        // The priority lane starts over ahead of the normal one.
        h.queue.enqueue_priority(h.timer(Idle), &h.counters);

        assert_eq!(h.drain(), vec![Idle, Pacing]);
    }

    #[test]
    fn lanes_stay_ordered_when_deep() {
        const DEPTH: usize = 10_000;

        let h = Harness::new();

        for _ in 0..DEPTH {
            h.queue.enqueue(h.timer(Pacing), &h.counters);
            h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);
        }

        // Interleave front and priority inserts on top of both deep lanes.
        for _ in 0..3 {
            h.queue.enqueue_front(h.timer(Shutdown), &h.counters);
            h.queue.enqueue_priority(h.timer(Idle), &h.counters);
        }

        assert_eq!(h.queue.len(), 2 * DEPTH + 6);

        let order = h.drain();

        let mut expected = vec![Shutdown; 3];
        expected.extend(std::iter::repeat(AckDelay).take(DEPTH));
        expected.extend([Idle, Idle, Idle]);
        expected.extend(std::iter::repeat(Pacing).take(DEPTH));

        assert_eq!(order, expected);
        assert_eq!(h.depth(), 0);
    }

    #[rstest]
    #[case::normal(0)]
    #[case::priority(1)]
    #[case::front(2)]
    fn wake_signal(#[case] lane: u8) {
        let h = Harness::new();

        let push = |t| match lane {
            0 => h.queue.enqueue(h.timer(t), &h.counters),
            1 => h.queue.enqueue_priority(h.timer(t), &h.counters),
            _ => h.queue.enqueue_front(h.timer(t), &h.counters),
        };

        // Idle and empty: the worker must be scheduled.
        assert!(push(Pacing));
        // Already non-empty.
        assert!(!push(AckDelay));

        // The worker starts draining.
        assert!(h.queue.dequeue(&h.counters).is_some());
        assert!(h.queue.dequeue(&h.counters).is_some());
        assert!(h.queue.is_actively_processing());

        // Empty but mid-drain: the worker will pick it up on its own.
        assert!(!push(Idle));
        assert!(h.queue.dequeue(&h.counters).is_some());

        // The drain pass ends.
        assert!(h.queue.dequeue(&h.counters).is_none());
        assert!(!h.queue.is_actively_processing());

        assert!(push(KeepAlive));
    }

    #[test]
    fn depth_accounting() {
        let h = Harness::new();

        for _ in 0..5 {
            h.queue.enqueue(h.timer(Pacing), &h.counters);
        }
        h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);
        h.queue.enqueue_front(h.timer(Idle), &h.counters);

        assert_eq!(h.depth(), 7);
        assert_eq!(h.counters.get(PerfCounter::ConnOperQueued), 7);

        for _ in 0..3 {
            h.queue.dequeue(&h.counters).unwrap();
        }
        assert_eq!(h.depth(), 4);

        // An empty dequeue does not touch the counter.
        assert_eq!(h.queue.clear(&h.counters), 4);
        assert_eq!(h.depth(), 0);
        assert!(h.queue.dequeue(&h.counters).is_none());
        assert_eq!(h.depth(), 0);

        assert_eq!(h.counters.get(PerfCounter::ConnOperQueued), 7);
        h.queue.uninitialize();
    }

    #[test]
    fn clear_resets_state() {
        let h = Harness::new();

        h.queue.enqueue(h.timer(Pacing), &h.counters);
        h.queue.enqueue_priority(h.timer(AckDelay), &h.counters);
        h.queue.dequeue(&h.counters).unwrap();
        assert!(h.queue.is_actively_processing());

        h.queue.clear(&h.counters);

        assert!(h.queue.is_empty());
        assert!(!h.queue.has_priority());
        assert!(!h.queue.is_actively_processing());
        assert!(h.queue.enqueue(h.timer(Idle), &h.counters));

        h.queue.clear(&h.counters);
        h.queue.uninitialize();
        assert_eq!(h.opers.in_use(), 0);
    }

    #[test]
    fn clear_aborts_unstarted_sync_send() {
        let h = Harness::new();
        let stream = TestStream::new(0, false);
        let completion = Completion::new();

        h.queue.enqueue(
            h.api(ApiContext::with_completion(
                ApiKind::StreamSend {
                    stream: stream.clone(),
                },
                Arc::clone(&completion),
            )),
            &h.counters,
        );

        h.queue.clear(&h.counters);

        assert_eq!(
            stream.shutdowns(),
            vec![(ShutdownFlags::ABORT | ShutdownFlags::IMMEDIATE, 0)]
        );
        assert_eq!(completion.status(), Some(Err(Error::InvalidState)));

        // The operation's stream reference is gone.
        assert_eq!(Arc::strong_count(&stream), 1);
        assert_eq!(h.contexts.in_use(), 0);
    }

    #[test]
    fn clear_leaves_started_stream_alone() {
        let h = Harness::new();
        let stream = TestStream::new(0, true);

        h.queue.enqueue(
            h.api(ApiContext::new(ApiKind::StreamSend {
                stream: stream.clone(),
            })),
            &h.counters,
        );

        h.queue.clear(&h.counters);

        assert!(stream.shutdowns().is_empty());
        assert_eq!(Arc::strong_count(&stream), 1);
    }

    #[rstest]
    #[case::plain(false)]
    #[case::shutdown_on_fail(true)]
    fn clear_aborts_pending_start(#[case] shutdown_on_fail: bool) {
        let h = Harness::new();
        let stream = TestStream::new(0, false);

        h.queue.enqueue(
            h.api(ApiContext::new(ApiKind::StreamStart {
                stream: stream.clone(),
                flags: StartFlags {
                    immediate: false,
                    shutdown_on_fail,
                },
            })),
            &h.counters,
        );

        h.queue.clear(&h.counters);

        assert_eq!(stream.start_completions(), vec![Err(Error::Aborted)]);

        if shutdown_on_fail {
            assert_eq!(
                stream.shutdowns(),
                vec![(ShutdownFlags::ABORT | ShutdownFlags::IMMEDIATE, 0)]
            );
        } else {
            assert!(stream.shutdowns().is_empty());
        }
    }

    #[test]
    fn clear_wakes_blocked_caller() {
        let h = Arc::new(Harness::new());
        let completion = Completion::new();

        h.queue.enqueue(
            h.api(ApiContext::with_completion(
                ApiKind::ConnClose,
                Arc::clone(&completion),
            )),
            &h.counters,
        );

        let waiter = {
            let completion = Arc::clone(&completion);
            std::thread::spawn(move || completion.wait())
        };

        h.queue.clear(&h.counters);

        assert_eq!(waiter.join().unwrap(), Err(Error::InvalidState));
    }

    #[test]
    fn concurrent_producers() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 250;

        let h = Arc::new(Harness::new());

        let producers = (0..PRODUCERS)
            .map(|i| {
                let h = Arc::clone(&h);

                std::thread::spawn(move || {
                    let mut wakes = 0;

                    for _ in 0..PER_PRODUCER {
                        let oper = h.timer(Pacing);

                        let wake = if i % 2 == 0 {
                            h.queue.enqueue(oper, &h.counters)
                        } else {
                            h.queue.enqueue_priority(oper, &h.counters)
                        };

                        wakes += wake as usize;
                    }

                    wakes
                })
            })
            .collect::<Vec<_>>();

        let wakes: usize = producers.into_iter().map(|p| p.join().unwrap()).sum();

        // Nobody drained, so exactly one producer saw the idle queue.
        assert_eq!(wakes, 1);
        assert_eq!(h.queue.len(), PRODUCERS * PER_PRODUCER);
        assert_eq!(h.drain().len(), PRODUCERS * PER_PRODUCER);
        assert_eq!(h.depth(), 0);
    }
}
