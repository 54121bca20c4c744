// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

/*!
C1: Shared Array Pool.

A process-wide registry of large numeric arrays with stable handles and
per-array mutexes, so worker tasks can mutate disjoint slices of the same
logical array without re-serialising the whole thing through a channel.

Grounded on the Design Notes in SPEC_FULL.md ("Process-wide shared mutable
arrays... Replaces with an explicit Shared Array Pool keyed by handles"),
and in idiom on the teacher's `Arc<Mutex<_>>`-around-`ndarray` pattern in
`calibrate::mod::di_cal`. Unlike the source's Python shared-memory manager
(pickled handles shipped to worker processes), this is in-process: workers
are threads, so a handle is just an index into a `Vec` behind one `Mutex`
per array, and `rayon`/`crossbeam` scoped threads borrow directly.
*/

use std::sync::{Mutex, MutexGuard};

use ndarray::{Array1, Array2};

/// An opaque, `Copy` handle to an array owned by a `SharedArrayPool`.
/// Handles are never valid across two different pools and do not outlive
/// the pool that created them (enforced by construction, not by the type
/// system, matching the source's "handles are process-wide opaque
/// identifiers" contract).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayHandle1(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArrayHandle2(usize);

/// Registry of 1-D and 2-D `f64` arrays. Kept as two parallel `Vec`s
/// rather than one dynamically typed one: every array in this fitting
/// engine is `f64`, and splitting by rank lets `get`/`lock` return a
/// concretely-shaped `ndarray` view instead of a boxed `dyn Any`.
#[derive(Default)]
pub struct SharedArrayPool {
    arrays_1d: Vec<Mutex<Array1<f64>>>,
    arrays_2d: Vec<Mutex<Array2<f64>>>,
}

impl SharedArrayPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new 1-D array, returning a stable handle.
    pub fn create_1d(&mut self, len: usize, fill: f64) -> ArrayHandle1 {
        self.arrays_1d.push(Mutex::new(Array1::from_elem(len, fill)));
        ArrayHandle1(self.arrays_1d.len() - 1)
    }

    /// Register a new 2-D array, returning a stable handle.
    pub fn create_2d(&mut self, shape: (usize, usize), fill: f64) -> ArrayHandle2 {
        self.arrays_2d.push(Mutex::new(Array2::from_elem(shape, fill)));
        ArrayHandle2(self.arrays_2d.len() - 1)
    }

    /// Acquire the scoped lock for a 1-D array. Only required when two
    /// workers may write into overlapping index ranges of the *same*
    /// array; per-worker partial-sum arrays created fresh per task never
    /// need this (spec.md §4.1).
    pub fn lock_1d(&self, handle: ArrayHandle1) -> MutexGuard<'_, Array1<f64>> {
        self.arrays_1d[handle.0].lock().expect("array pool mutex poisoned")
    }

    pub fn lock_2d(&self, handle: ArrayHandle2) -> MutexGuard<'_, Array2<f64>> {
        self.arrays_2d[handle.0].lock().expect("array pool mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_round_trip() {
        let mut pool = SharedArrayPool::new();
        let h1 = pool.create_1d(4, 99.0);
        let h2 = pool.create_2d((2, 3), 0.0);

        {
            let mut a = pool.lock_1d(h1);
            a[1] = 5.0;
        }
        assert_eq!(pool.lock_1d(h1)[1], 5.0);
        assert_eq!(pool.lock_1d(h1)[0], 99.0);
        assert_eq!(pool.lock_2d(h2).shape(), &[2, 3]);
    }

    #[test]
    fn disjoint_writers_do_not_clobber_each_other() {
        let mut pool = SharedArrayPool::new();
        let h = pool.create_1d(8, 0.0);
        crossbeam_utils::thread::scope(|scope| {
            for i in 0..8 {
                let pool = &pool;
                scope.spawn(move |_| {
                    let mut a = pool.lock_1d(h);
                    a[i] = i as f64;
                });
            }
        })
        .unwrap();
        let a = pool.lock_1d(h);
        for i in 0..8 {
            assert_eq!(a[i], i as f64);
        }
    }
}
