// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The stage runtime: the user-facing `Stage`/`Actor` traits, the per-stage
//! execution engine and the link handed to application handlers.
//!
//! A stage is a logically single-threaded container for one room or match.
//! All of its work arrives through its worker's mailbox; handlers are async
//! and may await replies, but two messages for the same stage never overlap.

mod base;
mod link;

pub(crate) use base::StageHost;
pub use link::StageLink;

use crate::wire::{ErrorCode, Packet};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
    time::Duration,
};

/// Where a stage is in its life. Work is accepted only while `Active`
/// (plus the create message that starts `Creating`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StageState {
    /// Constructed, create hook not yet run.
    Uncreated,
    /// The create hook is in flight.
    Creating,
    /// Accepting work.
    Active,
    /// Tearing down; external work is refused.
    Destroying,
    /// Gone; further work items are dropped.
    Destroyed,
}

/// Server-side room logic, implemented by the application.
///
/// Every hook runs on the stage's worker; `&mut self` is safe because the
/// runtime never overlaps two hooks for one stage.
#[async_trait]
pub trait Stage: Send + 'static {
    /// The stage received its create message. The returned packet becomes
    /// the reply; refusing with an error code discards the stage.
    async fn on_create(&mut self, _link: &StageLink, packet: &Packet) -> Result<Packet, ErrorCode> {
        Ok(Packet::new(packet.msg_id.clone(), Default::default()))
    }

    /// The create reply has been sent; the stage is about to go active.
    async fn on_post_create(&mut self, _link: &StageLink) {}

    /// An authenticated actor asks to join. Refusing destroys the actor.
    async fn on_join_stage(&mut self, _link: &StageLink, _actor: &mut ActorContext) -> bool {
        true
    }

    /// The actor joined and its reply has been sent.
    async fn on_post_join_stage(&mut self, _link: &StageLink, _actor: &mut ActorContext) {}

    /// The actor's client connection came (true) or went (false). Grace
    /// periods for reconnection are this stage's policy; kick the actor to
    /// end it now.
    async fn on_connection_changed(&mut self, _link: &StageLink, _actor: &mut ActorContext, _connected: bool) {}

    /// A message arrived for a joined actor.
    async fn on_actor_dispatch(&mut self, link: &StageLink, actor: &mut ActorContext, packet: Packet);

    /// A message arrived that is not bound to an actor.
    async fn on_dispatch(&mut self, link: &StageLink, packet: Packet);

    /// A timer added through the link fired.
    async fn on_timer(&mut self, _link: &StageLink, _timer_id: crate::app::timer::TimerId) {}

    /// A game-loop tick. `delta` is always the configured fixed timestep.
    async fn on_tick(&mut self, _link: &StageLink, _delta: Duration, _elapsed: Duration) {}

    /// The stage is going away. Actors have already been destroyed.
    async fn on_destroy(&mut self) {}
}

/// A client's presence inside a stage, implemented by the application.
#[async_trait]
pub trait Actor: Send + 'static {
    /// The actor object exists but is not yet authenticated.
    async fn on_create(&mut self, _link: &StageLink) {}

    /// Decode the auth payload and produce the account id, plus an optional
    /// reply packet for the client. Failing destroys the actor and answers
    /// the client with the error code.
    async fn on_authenticate(
        &mut self,
        link: &StageLink,
        packet: &Packet,
    ) -> Result<(String, Option<Packet>), ErrorCode>;

    /// Authentication succeeded and the session is bound.
    async fn on_post_authenticate(&mut self, _link: &StageLink) {}

    /// The actor is going away.
    async fn on_destroy(&mut self) {}
}

/// A joined actor plus its session bookkeeping, as handed to stage hooks.
pub struct ActorContext {
    /// The authenticated account.
    pub account_id: String,
    /// The bound client session, zero if detached.
    pub sid: u64,
    /// Whether a client connection is currently attached.
    pub connected: bool,
    kicked: bool,
    actor: Box<dyn Actor>,
}

impl ActorContext {
    pub(crate) fn new(actor: Box<dyn Actor>, sid: u64) -> Self {
        Self {
            account_id: String::new(),
            sid,
            connected: true,
            kicked: false,
            actor,
        }
    }

    /// Remove this actor from the stage once the current hook returns.
    pub fn kick(&mut self) {
        self.kicked = true;
    }

    pub(crate) fn kicked(&self) -> bool {
        self.kicked
    }
}

impl Deref for ActorContext {
    type Target = dyn Actor;

    fn deref(&self) -> &Self::Target {
        &*self.actor
    }
}

impl DerefMut for ActorContext {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.actor
    }
}

pub(crate) type ActorFactory = Arc<dyn Fn() -> Box<dyn Actor> + Send + Sync>;
pub(crate) type StageFactory = Arc<dyn Fn(i64) -> Box<dyn Stage> + Send + Sync>;

struct StageEntry {
    stage: StageFactory,
    actor: ActorFactory,
}

/// The stage types a Play server can instantiate, fixed at startup.
#[derive(Default)]
pub struct StageRegistry {
    entries: HashMap<String, StageEntry>,
}

impl StageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stage type with its stage and actor factories.
    pub fn register<FS, FA>(mut self, stage_type: impl Into<String>, stage: FS, actor: FA) -> Self
    where
        FS: Fn(i64) -> Box<dyn Stage> + Send + Sync + 'static,
        FA: Fn() -> Box<dyn Actor> + Send + Sync + 'static,
    {
        self.entries.insert(
            stage_type.into(),
            StageEntry {
                stage: Arc::new(stage),
                actor: Arc::new(actor),
            },
        );
        self
    }

    /// Whether `stage_type` is registered.
    pub fn contains(&self, stage_type: &str) -> bool {
        self.entries.contains_key(stage_type)
    }

    pub(crate) fn create(&self, stage_type: &str, stage_id: i64) -> Option<(Box<dyn Stage>, ActorFactory)> {
        self.entries
            .get(stage_type)
            .map(|entry| ((entry.stage)(stage_id), entry.actor.clone()))
    }
}

/// The concurrent stage-id -> stage-type map the dispatcher consults before
/// routing. Workers are the only writers.
#[derive(Default)]
pub(crate) struct StageDirectory {
    inner: Mutex<HashMap<i64, String>>,
}

impl StageDirectory {
    pub(crate) fn insert(&self, stage_id: i64, stage_type: String) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).insert(stage_id, stage_type);
    }

    pub(crate) fn remove(&self, stage_id: i64) {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).remove(&stage_id);
    }

    pub(crate) fn contains(&self, stage_id: i64) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&stage_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
