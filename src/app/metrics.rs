// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The read-only stats surface: process-wide atomic counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters bumped on the hot paths. Cheap to share, cheap to read.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Client sessions accepted.
    pub sessions_opened: AtomicU64,
    /// Client sessions torn down.
    pub sessions_closed: AtomicU64,
    /// Client frames successfully decoded.
    pub frames_decoded: AtomicU64,
    /// Work items dispatched into stages or api handlers.
    pub dispatched: AtomicU64,
    /// Replies written back to clients or peers.
    pub replies_sent: AtomicU64,
    /// Requests completed by the timeout sweeper.
    pub requests_timed_out: AtomicU64,
    /// Mesh frames received.
    pub mesh_in: AtomicU64,
    /// Mesh frames sent.
    pub mesh_out: AtomicU64,
    /// Stages created.
    pub stages_created: AtomicU64,
    /// Stages destroyed.
    pub stages_destroyed: AtomicU64,
}

impl Metrics {
    /// Bump a counter by one.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: self.sessions_closed.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            mesh_in: self.mesh_in.load(Ordering::Relaxed),
            mesh_out: self.mesh_out.load(Ordering::Relaxed),
            stages_created: self.stages_created.load(Ordering::Relaxed),
            stages_destroyed: self.stages_destroyed.load(Ordering::Relaxed),
        }
    }
}

/// A frozen view of [`Metrics`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub frames_decoded: u64,
    pub dispatched: u64,
    pub replies_sent: u64,
    pub requests_timed_out: u64,
    pub mesh_in: u64,
    pub mesh_out: u64,
    pub stages_created: u64,
    pub stages_destroyed: u64,
}
