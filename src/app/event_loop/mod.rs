// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The stage event-loop pool.
//!
//! A fixed set of worker threads, each owning a FIFO mailbox. A stage is
//! bound to the worker at `hash(stage_id) % pool_size` for its whole life, so
//! all of its work runs single-threaded and in arrival order without a lock.
//! A worker drains its mailbox in batches, grouping consecutive items for the
//! same stage so the stage's dispatch bookkeeping is set up once per group.

mod work;

pub use work::WorkItem;

use crate::app::{
    stage::{StageHost, StageRegistry},
    ServerCore,
};
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::sync::mpsc;

/// The worker a stage is bound to.
pub(crate) fn worker_index(stage_id: i64, pool_size: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    stage_id.hash(&mut hasher);
    (hasher.finish() % pool_size as u64) as usize
}

/// Posts work into the pool. Cheap to clone; owns nothing but senders.
#[derive(Clone)]
pub struct PoolHandle {
    txs: Arc<Vec<mpsc::UnboundedSender<WorkItem>>>,
}

impl PoolHandle {
    /// Number of workers.
    pub fn size(&self) -> usize {
        self.txs.len()
    }

    /// Post `item` to the worker owning `stage_id`.
    pub fn post(&self, stage_id: i64, item: WorkItem) {
        let index = worker_index(stage_id, self.txs.len());
        if self.txs[index].send(item).is_err() {
            log::warn!("Worker {} mailbox is closed; dropping work", index);
        }
    }

    /// The raw sender for the worker owning `stage_id`; continuation wakers
    /// hold one of these.
    pub(crate) fn sender_for(&self, stage_id: i64) -> mpsc::UnboundedSender<WorkItem> {
        self.txs[worker_index(stage_id, self.txs.len())].clone()
    }

    /// Post a shutdown item to every worker.
    pub(crate) fn shutdown(&self) {
        for tx in self.txs.iter() {
            tx.send(WorkItem::Shutdown).ok();
        }
    }
}

/// Create the pool's mailboxes without starting any thread yet; the handle
/// can be wired into the rest of the server before the workers spin up.
pub(crate) fn mailboxes(pool_size: usize) -> (PoolHandle, Vec<mpsc::UnboundedReceiver<WorkItem>>) {
    let mut txs = Vec::with_capacity(pool_size);
    let mut rxs = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        let (tx, rx) = mpsc::unbounded_channel();
        txs.push(tx);
        rxs.push(rx);
    }
    (PoolHandle { txs: Arc::new(txs) }, rxs)
}

/// Spin up one OS thread per mailbox.
pub(crate) fn spawn_workers(
    receivers: Vec<mpsc::UnboundedReceiver<WorkItem>>,
    handle: &PoolHandle,
    core: Arc<ServerCore>,
    registry: Arc<StageRegistry>,
) -> Vec<std::thread::JoinHandle<()>> {
    receivers
        .into_iter()
        .enumerate()
        .map(|(index, rx)| {
            let tx = handle.txs[index].clone();
            let core = core.clone();
            let registry = registry.clone();
            std::thread::Builder::new()
                .name(format!("stage-worker-{}", index))
                .spawn(move || run_worker(index, rx, StageHost::new(core, registry, tx)))
                .expect("failed to spawn a stage worker")
        })
        .collect()
}

fn run_worker(index: usize, mut rx: mpsc::UnboundedReceiver<WorkItem>, mut host: StageHost) {
    log::debug!("Stage worker {} up", index);
    'outer: loop {
        let first = match rx.blocking_recv() {
            Some(item) => item,
            None => break,
        };
        let mut batch = std::collections::VecDeque::new();
        batch.push_back(first);
        while let Ok(item) = rx.try_recv() {
            batch.push_back(item);
        }
        while let Some(item) = batch.pop_front() {
            if let WorkItem::Shutdown = item {
                break 'outer;
            }
            let stage_id = match item.stage_id() {
                Some(stage_id) => stage_id,
                None => continue,
            };
            let mut group = vec![item];
            while let Some(next) = batch.front() {
                if next.stage_id() == Some(stage_id) {
                    group.push(batch.pop_front().expect("peeked item"));
                } else {
                    break;
                }
            }
            host.execute_batch(stage_id, group);
        }
    }
    host.shutdown();
    log::debug!("Stage worker {} down", index);
}
