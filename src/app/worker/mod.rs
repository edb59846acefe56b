// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Outstanding-request bookkeeping.
//!
//! Every inter-server request parks a completion target here under its
//! `msg_seq`. Exactly one of three things later claims it: the matching
//! reply, the 100 ms expiry sweep, or a bulk cancel on disconnect/shutdown.

use crate::wire::{ErrorCode, RoutePacket};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU16, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

/// How often the expiry sweep runs.
pub const EXPIRY_TICK: Duration = Duration::from_millis(100);

/// A completion target for one outstanding request.
pub trait Worker: Send {
    /// Deliver the reply packet.
    fn handle_response(self: Box<Self>, packet: RoutePacket);
    /// Deliver a synthesized failure for request `msg_seq`. The reply id is
    /// `@Timeout@` for timeouts and the original request id otherwise.
    fn handle_error(self: Box<Self>, msg_seq: u16, code: ErrorCode);
}

/// The oneshot-backed completion used by awaitable requests.
pub struct RespondWorker {
    msg_id: String,
    handle: tokio::sync::oneshot::Sender<RoutePacket>,
}

impl RespondWorker {
    /// Pair a completion with its inbox.
    pub fn channel(msg_id: impl Into<String>) -> (Self, tokio::sync::oneshot::Receiver<RoutePacket>) {
        let (handle, inbox) = tokio::sync::oneshot::channel();
        (
            Self {
                msg_id: msg_id.into(),
                handle,
            },
            inbox,
        )
    }
}

impl Worker for RespondWorker {
    fn handle_response(self: Box<Self>, packet: RoutePacket) {
        self.handle.send(packet).unwrap_or_else(|_| log::warn!("Response receiver dropped"));
    }

    fn handle_error(self: Box<Self>, msg_seq: u16, code: ErrorCode) {
        let packet = match code {
            ErrorCode::RequestTimeout => RoutePacket::timeout(msg_seq),
            code => RoutePacket::canceled(msg_seq, &self.msg_id, code),
        };
        self.handle.send(packet).unwrap_or_else(|_| log::warn!("Response receiver dropped"));
    }
}

struct Entry {
    deadline: Instant,
    origin_stage: Option<i64>,
    msg_seq: u16,
    completion: Box<dyn Worker>,
}

/// The concurrent map of outstanding requests.
pub struct RequestCache {
    seq: AtomicU16,
    entries: Mutex<HashMap<u16, Entry>>,
}

impl RequestCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self {
            seq: AtomicU16::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The next correlation seq; monotone, wraps, never zero.
    pub fn next_seq(&self) -> u16 {
        loop {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if seq != 0 {
                return seq;
            }
        }
    }

    /// Park a completion until `deadline`. `origin_stage` ties the request to
    /// the stage that issued it so stage destruction can cancel it.
    pub fn add(&self, msg_seq: u16, deadline: Instant, origin_stage: Option<i64>, completion: Box<dyn Worker>) {
        let stale = self.entries.lock().unwrap_or_else(|e| e.into_inner()).insert(
            msg_seq,
            Entry {
                deadline,
                origin_stage,
                msg_seq,
                completion,
            },
        );
        if let Some(stale) = stale {
            // Seq wrap over a still-outstanding request; fail the old one.
            log::warn!("Correlation seq {} reused while outstanding", msg_seq);
            stale.completion.handle_error(msg_seq, ErrorCode::InvalidResponse);
        }
    }

    /// Atomically remove and return the completion for `msg_seq`. Absent for
    /// late replies that already timed out.
    pub fn resolve(&self, msg_seq: u16) -> Option<Box<dyn Worker>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&msg_seq)
            .map(|entry| entry.completion)
    }

    /// Number of outstanding requests.
    pub fn outstanding(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Remove every entry past its deadline and fail it with `RequestTimeout`.
    /// Returns how many were expired.
    pub fn expire(&self, now: Instant) -> usize {
        let expired: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let seqs: Vec<u16> = entries
                .values()
                .filter(|entry| entry.deadline <= now)
                .map(|entry| entry.msg_seq)
                .collect();
            seqs.into_iter().filter_map(|seq| entries.remove(&seq)).collect()
        };
        let count = expired.len();
        for entry in expired {
            entry.completion.handle_error(entry.msg_seq, ErrorCode::RequestTimeout);
        }
        count
    }

    /// Fail every request issued by `stage_id`.
    pub fn cancel_stage(&self, stage_id: i64, code: ErrorCode) {
        let canceled: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let seqs: Vec<u16> = entries
                .values()
                .filter(|entry| entry.origin_stage == Some(stage_id))
                .map(|entry| entry.msg_seq)
                .collect();
            seqs.into_iter().filter_map(|seq| entries.remove(&seq)).collect()
        };
        for entry in canceled {
            entry.completion.handle_error(entry.msg_seq, code);
        }
    }

    /// Fail every outstanding request; used at shutdown and on lost peers.
    pub fn cancel_all(&self, code: ErrorCode) {
        let drained: Vec<Entry> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.completion.handle_error(entry.msg_seq, code);
        }
    }
}

impl Default for RequestCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::TIMEOUT_MSG_ID;

    #[test]
    fn seq_skips_zero_across_wrap() {
        let cache = RequestCache::new();
        let mut last = 0u16;
        for _ in 0..70_000 {
            let seq = cache.next_seq();
            assert_ne!(seq, 0);
            last = seq;
        }
        assert_ne!(last, 0);
    }

    #[tokio::test]
    async fn resolve_claims_an_entry_exactly_once() {
        let cache = RequestCache::new();
        let (worker, inbox) = RespondWorker::channel("Req");
        let seq = cache.next_seq();
        cache.add(seq, Instant::now() + Duration::from_secs(5), None, Box::new(worker));
        let completion = cache.resolve(seq).expect("first resolve hits");
        assert!(cache.resolve(seq).is_none());
        completion.handle_response(RoutePacket::canceled(seq, "Req", ErrorCode::Success));
        let reply = inbox.await.unwrap();
        assert_eq!(reply.header.msg_id, "Req");
    }

    #[tokio::test]
    async fn expiry_synthesizes_timeout_replies() {
        let cache = RequestCache::new();
        let (worker, inbox) = RespondWorker::channel("SlowRequest");
        let seq = cache.next_seq();
        cache.add(seq, Instant::now(), None, Box::new(worker));
        assert_eq!(cache.expire(Instant::now() + Duration::from_millis(1)), 1);
        assert_eq!(cache.outstanding(), 0);
        let reply = inbox.await.unwrap();
        assert_eq!(reply.header.msg_id, TIMEOUT_MSG_ID);
        assert_eq!(reply.header.error_code, u16::from(ErrorCode::RequestTimeout));
    }

    #[tokio::test]
    async fn stage_cancel_only_touches_its_own_requests() {
        let cache = RequestCache::new();
        let (mine, my_inbox) = RespondWorker::channel("Mine");
        let (other, other_inbox) = RespondWorker::channel("Other");
        let deadline = Instant::now() + Duration::from_secs(5);
        let seq_mine = cache.next_seq();
        let seq_other = cache.next_seq();
        cache.add(seq_mine, deadline, Some(7), Box::new(mine));
        cache.add(seq_other, deadline, Some(8), Box::new(other));
        cache.cancel_stage(7, ErrorCode::ConnectionClosed);
        let reply = my_inbox.await.unwrap();
        assert_eq!(reply.header.error_code, u16::from(ErrorCode::ConnectionClosed));
        assert_eq!(reply.header.msg_id, "Mine");
        assert_eq!(cache.outstanding(), 1);
        drop(other_inbox);
    }
}
