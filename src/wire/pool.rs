// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The process-global, size-classed buffer pool behind pooled payloads.
//!
//! Buckets span 128 B to 1 MiB in quarter-doubling steps (53 buckets). Each
//! bucket has a thread-local L1 stack and a mutexed global L2 stack; oversize
//! requests bypass the pool entirely.

use lazy_static::lazy_static;
use std::{
    cell::RefCell,
    sync::Mutex,
    time::{Duration, Instant},
};

/// The smallest bucket size.
const MIN_BUCKET: usize = 128;
/// The largest pooled buffer size; anything bigger bypasses the pool.
const MAX_POOLED: usize = 1024 * 1024;
/// Buffers kept per bucket on each thread before spilling to the global stack.
const L1_CAP: usize = 64;
/// Buffers kept per bucket in the global stack before returns are dropped.
const L2_CAP: usize = 512;

/// The 53 bucket sizes: four linear steps per doubling from 128 B to 1 MiB.
fn bucket_sizes() -> Vec<usize> {
    let mut sizes = Vec::with_capacity(53);
    let mut base = MIN_BUCKET;
    while base < MAX_POOLED {
        for step in 0..4 {
            sizes.push(base + base / 4 * step);
        }
        base *= 2;
    }
    sizes.push(MAX_POOLED);
    sizes
}

/// The smallest bucket index whose size is >= `size`, or `None` for oversize.
fn bucket_index(size: usize) -> Option<usize> {
    if size > MAX_POOLED {
        return None;
    }
    let idx = BUCKETS.partition_point(|&b| b < size);
    Some(idx.min(BUCKETS.len() - 1))
}

struct Shelf {
    bufs: Vec<Vec<u8>>,
    last_used: Instant,
}

impl Shelf {
    fn new() -> Self {
        Self {
            bufs: Vec::new(),
            last_used: Instant::now(),
        }
    }
}

lazy_static! {
    static ref BUCKETS: Vec<usize> = bucket_sizes();
    static ref L2: Vec<Mutex<Shelf>> = (0..BUCKETS.len()).map(|_| Mutex::new(Shelf::new())).collect();
}

thread_local! {
    static L1: RefCell<Vec<Vec<Vec<u8>>>> = RefCell::new((0..BUCKETS.len()).map(|_| Vec::new()).collect());
}

/// Rent a cleared buffer whose capacity is at least `size`, rounded up to the
/// owning bucket. Oversize requests get a plain allocation.
pub fn rent(size: usize) -> Vec<u8> {
    let idx = match bucket_index(size) {
        Some(idx) => idx,
        None => return Vec::with_capacity(size),
    };
    let reused = L1.with(|l1| l1.borrow_mut()[idx].pop());
    if let Some(buf) = reused {
        return buf;
    }
    let reused = {
        let mut shelf = L2[idx].lock().unwrap_or_else(|e| e.into_inner());
        shelf.last_used = Instant::now();
        shelf.bufs.pop()
    };
    reused.unwrap_or_else(|| Vec::with_capacity(BUCKETS[idx]))
}

/// Return a rented buffer. Buffers whose capacity no longer matches a bucket
/// (the renter grew them) are dropped instead of pooled.
pub fn give_back(mut buf: Vec<u8>) {
    let idx = match bucket_index(buf.capacity()) {
        Some(idx) if BUCKETS[idx] == buf.capacity() => idx,
        _ => return,
    };
    buf.clear();
    let spill = L1.with(|l1| {
        let mut l1 = l1.borrow_mut();
        if l1[idx].len() < L1_CAP {
            l1[idx].push(buf);
            None
        } else {
            Some(buf)
        }
    });
    if let Some(buf) = spill {
        let mut shelf = L2[idx].lock().unwrap_or_else(|e| e.into_inner());
        if shelf.bufs.len() < L2_CAP {
            shelf.bufs.push(buf);
        }
    }
}

/// Drop the global stacks of every bucket idle for longer than `window`.
pub fn trim_idle(window: Duration) -> usize {
    let now = Instant::now();
    let mut dropped = 0;
    for shelf in L2.iter() {
        let mut shelf = shelf.lock().unwrap_or_else(|e| e.into_inner());
        if now.duration_since(shelf.last_used) >= window && !shelf.bufs.is_empty() {
            dropped += shelf.bufs.len();
            shelf.bufs.clear();
        }
    }
    dropped
}

/// A point-in-time count of buffers held by the global stacks.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    /// Buffers resting in the global L2 stacks.
    pub pooled: usize,
}

impl PoolStats {
    /// Collect the current pool stats.
    pub fn collect() -> Self {
        let pooled = L2
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).bufs.len())
            .sum();
        Self { pooled }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifty_three_buckets() {
        assert_eq!(BUCKETS.len(), 53);
        assert_eq!(BUCKETS[0], 128);
        assert_eq!(*BUCKETS.last().unwrap(), MAX_POOLED);
        assert!(BUCKETS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn rounds_up_to_bucket() {
        assert_eq!(BUCKETS[bucket_index(1).unwrap()], 128);
        assert_eq!(BUCKETS[bucket_index(128).unwrap()], 128);
        assert_eq!(BUCKETS[bucket_index(129).unwrap()], 160);
        assert_eq!(BUCKETS[bucket_index(600).unwrap()], 640);
        assert_eq!(BUCKETS[bucket_index(MAX_POOLED).unwrap()], MAX_POOLED);
        assert!(bucket_index(MAX_POOLED + 1).is_none());
    }

    #[test]
    fn rent_reuses_returned_buffers() {
        let buf = rent(200);
        assert!(buf.capacity() >= 200);
        assert!(buf.is_empty());
        let cap = buf.capacity();
        give_back(buf);
        let again = rent(200);
        assert_eq!(again.capacity(), cap);
    }

    #[test]
    fn oversize_bypasses_the_pool() {
        let buf = rent(MAX_POOLED + 1);
        assert!(buf.capacity() >= MAX_POOLED + 1);
        // Returning it is a no-op rather than an error.
        give_back(buf);
    }
}
