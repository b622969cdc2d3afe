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

//! Bounded object pools owned by a worker.
//!
//! Every object a worker hands to producers (operations, API call contexts,
//! path identifiers) is charged against one of these pools. A pool has a hard
//! capacity: once that many objects are outstanding, further allocations fail
//! and the caller is expected to report an out-of-memory condition. Objects
//! give their slot back automatically when the [`Pooled`] wrapper is dropped,
//! so there is no explicit free call to forget.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam::utils::CachePadded;

/// A bounded pool of `T` values.
///
/// Cloning a pool is cheap and yields another handle onto the same slots.
pub struct Pool<T> {
    shared: Arc<Shared>,
    _marker: PhantomData<fn() -> T>,
}

struct Shared {
    /// Name used in diagnostics.
    name: &'static str,
    /// Number of slots currently handed out. Touched by every producer
    /// thread, so keep it on its own cache line.
    in_use: CachePadded<AtomicUsize>,
    /// The max number of slots that can be outstanding at once.
    max: usize,
    /// The largest value `in_use` ever reached.
    high_water: AtomicUsize,
    /// Total number of successful allocations.
    allocated: AtomicU64,
    /// Number of allocations refused because the pool was exhausted.
    failures: AtomicU64,
}

impl Shared {
    fn try_acquire(&self) -> bool {
        let res = self.in_use.fetch_update(
            Ordering::AcqRel,
            Ordering::Relaxed,
            |cur| if cur < self.max { Some(cur + 1) } else { None },
        );

        match res {
            Ok(prev) => {
                self.high_water.fetch_max(prev + 1, Ordering::Relaxed);
                self.allocated.fetch_add(1, Ordering::Relaxed);
                true
            },

            Err(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                false
            },
        }
    }

    fn release(&self) {
        let prev = self.in_use.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "{} pool slot released twice", self.name);
    }
}

impl<T> Pool<T> {
    /// Creates a pool that allows at most `max` outstanding values.
    pub fn new(name: &'static str, max: usize) -> Self {
        Pool {
            shared: Arc::new(Shared {
                name,
                in_use: CachePadded::new(AtomicUsize::new(0)),
                max,
                high_water: AtomicUsize::new(0),
                allocated: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
            _marker: PhantomData,
        }
    }

    /// Creates a pool without a practical capacity limit.
    pub fn unbounded(name: &'static str) -> Self {
        Self::new(name, usize::MAX)
    }

    /// Moves `value` into a pool slot.
    ///
    /// If the pool is exhausted the value is handed back in the `Err`
    /// variant, untouched, so the caller decides how to dispose of it.
    pub fn alloc(&self, value: T) -> Result<Pooled<T>, T> {
        if !self.shared.try_acquire() {
            return Err(value);
        }

        Ok(Pooled {
            inner: value,
            slot: Slot {
                shared: Arc::clone(&self.shared),
            },
        })
    }

    /// Like [`Pool::alloc`], but only builds the value once a slot has been
    /// secured.
    pub fn alloc_with(&self, f: impl FnOnce() -> T) -> Option<Pooled<T>> {
        if !self.shared.try_acquire() {
            return None;
        }

        Some(Pooled {
            inner: f(),
            slot: Slot {
                shared: Arc::clone(&self.shared),
            },
        })
    }

    /// The pool's diagnostic name.
    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// The number of values currently outstanding.
    pub fn in_use(&self) -> usize {
        self.shared.in_use.load(Ordering::Acquire)
    }

    /// The max number of values that can be outstanding.
    pub fn capacity(&self) -> usize {
        self.shared.max
    }

    /// The largest number of values that were ever outstanding at once.
    pub fn high_water(&self) -> usize {
        self.shared.high_water.load(Ordering::Relaxed)
    }

    /// The total number of successful allocations.
    pub fn allocated(&self) -> u64 {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// The number of allocations refused because the pool was full.
    pub fn alloc_failures(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            shared: Arc::clone(&self.shared),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name)
            .field("in_use", &self.in_use())
            .field("capacity", &self.shared.max)
            .finish()
    }
}

/// Gives a slot back to its pool when dropped.
struct Slot {
    shared: Arc<Shared>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// A value charged against a [`Pool`] that can be dereferenced to `T`.
pub struct Pooled<T> {
    inner: T,
    slot: Slot,
}

impl<T> Pooled<T> {
    /// Takes the value out of the pool, releasing its slot.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// The name of the pool the value was allocated from.
    pub fn pool_name(&self) -> &'static str {
        self.slot.shared.name
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhaustion() {
        let pool = Pool::<u32>::new("test", 2);
        assert_eq!(pool.capacity(), 2);

        let a = pool.alloc(1).unwrap();
        let b = pool.alloc(2).unwrap();
        assert_eq!(pool.in_use(), 2);
        assert_eq!(a.pool_name(), "test");

        assert_eq!(pool.alloc(3).unwrap_err(), 3);
        assert!(pool.alloc_with(|| 4).is_none());
        assert_eq!(pool.alloc_failures(), 2);

        assert_eq!(*a + *b, 3);

        drop(a);
        assert_eq!(pool.in_use(), 1);

        let c = pool.alloc(5).unwrap();
        assert_eq!(*c, 5);
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.high_water(), 2);
        assert_eq!(pool.allocated(), 3);
    }

    #[test]
    fn into_inner_releases_slot() {
        let pool = Pool::new("test", 1);

        let v = pool.alloc(vec![1, 2, 3]).unwrap();
        assert!(pool.alloc(vec![]).is_err());

        let v = v.into_inner();
        assert_eq!(v, vec![1, 2, 3]);
        assert_eq!(pool.in_use(), 0);

        assert!(pool.alloc(vec![]).is_ok());
    }

    #[test]
    fn clones_share_slots() {
        let pool = Pool::new("test", 1);
        let other = pool.clone();

        let _v = pool.alloc(()).unwrap();
        assert!(other.alloc(()).is_err());
        assert_eq!(other.in_use(), 1);
    }

    #[test]
    fn contended() {
        const THREADS: usize = 8;
        const MAX: usize = 5;

        let pool = Pool::<usize>::new("test", MAX);

        let handles = (0..THREADS)
            .map(|i| {
                let pool = pool.clone();

                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Ok(v) = pool.alloc(i) {
                            assert!(pool.in_use() <= MAX);
                            drop(v);
                        }
                    }
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(pool.in_use(), 0);
        assert!(pool.high_water() <= MAX);
    }
}
