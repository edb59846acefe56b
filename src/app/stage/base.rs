// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The per-stage execution engine.
//!
//! Handlers are async, but a stage never overlaps two of them: a dispatched
//! hook becomes an owned future that carries the stage's user state and actor
//! directory with it and hands them back on completion. While one is in
//! flight, further work for that stage queues inside the stage; the worker
//! stays free to run its other stages. Wake-ups come back as `Continuation`
//! work items through the owning worker's own mailbox.

use super::{ActorContext, ActorFactory, Stage, StageLink, StageRegistry, StageState};
use crate::{
    app::{event_loop::WorkItem, timer::GameLoop, Metrics, ServerCore},
    wire::{ErrorCode, Packet, Payload, RouteHeader},
};
use futures::{future::BoxFuture, task, task::ArcWake, FutureExt};
use std::{
    collections::{HashMap, VecDeque},
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};
use tokio::sync::mpsc::UnboundedSender;

/// What a completed handler tells the stage about itself.
enum Transition {
    None,
    Activated,
    CreateFailed,
    Destroyed,
}

/// The actor directory and per-stage bookkeeping that travels through
/// handler futures alongside the user stage state.
pub(crate) struct StageContext {
    actors: HashMap<String, ActorContext>,
    actor_factory: ActorFactory,
    actor_count: Arc<AtomicUsize>,
}

impl StageContext {
    fn new(actor_factory: ActorFactory, actor_count: Arc<AtomicUsize>) -> Self {
        Self {
            actors: HashMap::new(),
            actor_factory,
            actor_count,
        }
    }

    fn insert_actor(&mut self, account_id: String, actor: ActorContext) {
        self.actors.insert(account_id, actor);
        self.actor_count.store(self.actors.len(), Ordering::Relaxed);
    }

    fn remove_actor(&mut self, account_id: &str) -> Option<ActorContext> {
        let actor = self.actors.remove(account_id);
        self.actor_count.store(self.actors.len(), Ordering::Relaxed);
        actor
    }

    fn drain_actors(&mut self) -> Vec<(String, ActorContext)> {
        let drained = self.actors.drain().collect();
        self.actor_count.store(0, Ordering::Relaxed);
        drained
    }
}

type FlightResult = (Box<dyn Stage>, StageContext, Transition);

/// Posts a `Continuation` back to the stage's worker when an awaited
/// handler is ready to make progress.
struct StageWaker {
    stage_id: i64,
    tx: UnboundedSender<WorkItem>,
}

impl ArcWake for StageWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.tx.send(WorkItem::Continuation(arc_self.stage_id)).ok();
    }
}

/// One stage's runtime state, owned by its worker thread.
pub(crate) struct BaseStage {
    stage_id: i64,
    state: StageState,
    core: Arc<ServerCore>,
    tx: UnboundedSender<WorkItem>,
    user: Option<Box<dyn Stage>>,
    ctx: Option<StageContext>,
    inflight: Option<BoxFuture<'static, FlightResult>>,
    backlog: VecDeque<WorkItem>,
    alive: Arc<AtomicBool>,
    actor_count: Arc<AtomicUsize>,
    game_loop: Arc<Mutex<Option<GameLoop>>>,
}

impl BaseStage {
    pub(crate) fn new(
        stage_id: i64,
        user: Box<dyn Stage>,
        actor_factory: ActorFactory,
        core: Arc<ServerCore>,
        tx: UnboundedSender<WorkItem>,
    ) -> Self {
        let actor_count = Arc::new(AtomicUsize::new(0));
        Self {
            stage_id,
            state: StageState::Uncreated,
            core,
            tx,
            user: Some(user),
            ctx: Some(StageContext::new(actor_factory, actor_count.clone())),
            inflight: None,
            backlog: VecDeque::new(),
            alive: Arc::new(AtomicBool::new(true)),
            actor_count,
            game_loop: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state == StageState::Destroyed
    }

    /// Feed one work item in. Continuations poll; everything else either
    /// starts immediately or queues behind the in-flight handler.
    pub(crate) fn handle(&mut self, item: WorkItem) {
        match self.state {
            StageState::Destroyed => return,
            StageState::Destroying => {
                if !matches!(item, WorkItem::Continuation(_)) {
                    log::debug!("Stage {} is destroying; dropped {:?}", self.stage_id, item);
                    return;
                }
            }
            _ => {}
        }
        if let WorkItem::Continuation(_) = item {
            self.poll_inflight();
            return;
        }
        if self.inflight.is_some() {
            self.backlog.push_back(item);
            return;
        }
        self.start(item);
        self.poll_inflight();
    }

    /// Construct the handler future for `item` without polling it.
    fn start(&mut self, item: WorkItem) {
        let (mut user, mut ctx) = match (self.user.take(), self.ctx.take()) {
            (Some(user), Some(ctx)) => (user, ctx),
            _ => {
                log::error!("Stage {} lost its state; dropping {:?}", self.stage_id, item);
                return;
            }
        };
        match item {
            WorkItem::Create { .. } => self.state = StageState::Creating,
            WorkItem::Destroy(_) => self.state = StageState::Destroying,
            _ => {}
        }
        let header = item_header(&item, self.stage_id);
        let link = StageLink::new(
            self.core.clone(),
            self.stage_id,
            header.clone(),
            self.alive.clone(),
            self.actor_count.clone(),
            self.game_loop.clone(),
        );
        let core = self.core.clone();
        let stage_id = self.stage_id;
        let fallback = match &item {
            WorkItem::Create { .. } => Transition::CreateFailed,
            WorkItem::Destroy(_) => Transition::Destroyed,
            _ => Transition::None,
        };
        self.inflight = Some(
            async move {
                let outcome = AssertUnwindSafe(run_item(item, &mut user, &mut ctx, &link, &core))
                    .catch_unwind()
                    .await;
                let transition = match outcome {
                    Ok(transition) => transition,
                    Err(_) => {
                        log::error!("Stage {} handler panicked on {}", stage_id, header.msg_id);
                        core.reply_error(&header, ErrorCode::InvalidResponse);
                        fallback
                    }
                };
                (user, ctx, transition)
            }
            .boxed(),
        );
    }

    /// Drive the in-flight handler as far as it will go, then start backlog
    /// work until something suspends or the stage dies.
    pub(crate) fn poll_inflight(&mut self) {
        loop {
            let fut = match self.inflight.as_mut() {
                Some(fut) => fut,
                None => break,
            };
            let waker = task::waker(Arc::new(StageWaker {
                stage_id: self.stage_id,
                tx: self.tx.clone(),
            }));
            let mut cx = Context::from_waker(&waker);
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready((user, ctx, transition)) => {
                    self.inflight = None;
                    self.user = Some(user);
                    self.ctx = Some(ctx);
                    match transition {
                        Transition::Activated => {
                            if self.state == StageState::Creating {
                                self.state = StageState::Active;
                            }
                        }
                        Transition::CreateFailed | Transition::Destroyed => {
                            self.state = StageState::Destroyed;
                            self.alive.store(false, Ordering::Relaxed);
                            self.game_loop.lock().unwrap_or_else(|e| e.into_inner()).take();
                            self.backlog.clear();
                            return;
                        }
                        Transition::None => {}
                    }
                    match self.backlog.pop_front() {
                        Some(item) => self.start(item),
                        None => break,
                    }
                }
                Poll::Pending => break,
            }
        }
    }
}

impl Drop for BaseStage {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.game_loop.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// The routing header a handler's link snapshots. Synthetic work (timers,
/// ticks, destruction) carries a bare header that cannot be replied to.
fn item_header(item: &WorkItem, stage_id: i64) -> RouteHeader {
    match item {
        WorkItem::Message(packet) | WorkItem::Auth(packet) | WorkItem::Create { packet, .. } => {
            packet.header.clone()
        }
        WorkItem::ConnectionChanged { account_id, .. } => RouteHeader {
            stage_id,
            account_id: account_id.clone(),
            ..Default::default()
        },
        _ => RouteHeader {
            stage_id,
            ..Default::default()
        },
    }
}

async fn run_item(
    item: WorkItem,
    user: &mut Box<dyn Stage>,
    ctx: &mut StageContext,
    link: &StageLink,
    core: &Arc<ServerCore>,
) -> Transition {
    match item {
        WorkItem::Create { packet, .. } => {
            let header = packet.header.clone();
            let request = packet.into_packet();
            match user.on_create(link, &request).await {
                Ok(mut reply) => {
                    // The reply body is prefixed with an is-created marker so
                    // get-or-create callers can tell a fresh stage from a hit.
                    let mut body = Vec::with_capacity(1 + reply.payload.len());
                    body.push(1);
                    body.extend_from_slice(reply.payload.as_slice());
                    reply.payload.dispose();
                    core.reply_route(
                        &header,
                        Packet {
                            msg_id: reply.msg_id,
                            error_code: reply.error_code,
                            payload: Payload::from(body),
                            ..Default::default()
                        },
                    );
                    user.on_post_create(link).await;
                    Transition::Activated
                }
                Err(code) => {
                    core.reply_error(&header, code);
                    Transition::CreateFailed
                }
            }
        }
        WorkItem::Auth(packet) => {
            run_auth(packet, user, ctx, link, core).await;
            Transition::None
        }
        WorkItem::Message(packet) => {
            let account_id = packet.header.account_id.clone();
            let request = packet.into_packet();
            if !account_id.is_empty() {
                if let Some(mut actor) = ctx.remove_actor(&account_id) {
                    user.on_actor_dispatch(link, &mut actor, request).await;
                    if actor.kicked() {
                        actor.on_destroy().await;
                    } else {
                        ctx.insert_actor(account_id, actor);
                    }
                    return Transition::None;
                }
            }
            user.on_dispatch(link, request).await;
            Transition::None
        }
        WorkItem::ConnectionChanged {
            account_id, connected, ..
        } => {
            if let Some(mut actor) = ctx.remove_actor(&account_id) {
                actor.connected = connected;
                if !connected {
                    actor.sid = 0;
                }
                user.on_connection_changed(link, &mut actor, connected).await;
                if actor.kicked() {
                    actor.on_destroy().await;
                } else {
                    ctx.insert_actor(account_id, actor);
                }
            }
            Transition::None
        }
        WorkItem::Timer { timer_id, .. } => {
            user.on_timer(link, timer_id).await;
            Transition::None
        }
        WorkItem::Tick { delta, elapsed, .. } => {
            user.on_tick(link, delta, elapsed).await;
            Transition::None
        }
        WorkItem::Destroy(_) => {
            for (_, mut actor) in ctx.drain_actors() {
                actor.on_destroy().await;
            }
            user.on_destroy().await;
            Transition::Destroyed
        }
        WorkItem::Continuation(_) | WorkItem::Shutdown => Transition::None,
    }
}

async fn run_auth(
    packet: crate::wire::RoutePacket,
    user: &mut Box<dyn Stage>,
    ctx: &mut StageContext,
    link: &StageLink,
    core: &Arc<ServerCore>,
) {
    let header = packet.header.clone();
    let request = packet.into_packet();
    let mut actor = ActorContext::new((ctx.actor_factory)(), header.sid);
    actor.on_create(link).await;
    match actor.on_authenticate(link, &request).await {
        Ok((account_id, maybe_reply)) => {
            actor.account_id = account_id.clone();
            let reply = maybe_reply.unwrap_or_else(|| Packet::new(header.msg_id.clone(), Payload::Empty));
            if let Some(mut existing) = ctx.remove_actor(&account_id) {
                // Re-authentication under a known account rebinds the session
                // to the surviving actor; the fresh one is discarded.
                existing.sid = header.sid;
                existing.connected = true;
                core.sessions.bind(header.sid, &account_id, header.stage_id);
                core.reply_route(&header, reply);
                user.on_connection_changed(link, &mut existing, true).await;
                if existing.kicked() {
                    existing.on_destroy().await;
                } else {
                    ctx.insert_actor(account_id, existing);
                }
                return;
            }
            actor.on_post_authenticate(link).await;
            if user.on_join_stage(link, &mut actor).await {
                core.sessions.bind(header.sid, &account_id, header.stage_id);
                core.reply_route(&header, reply);
                user.on_post_join_stage(link, &mut actor).await;
                ctx.insert_actor(account_id, actor);
            } else {
                core.reply_error(&header, ErrorCode::Unauthorized);
                actor.on_destroy().await;
            }
        }
        Err(code) => {
            core.reply_error(&header, code);
            actor.on_destroy().await;
        }
    }
}

/// Every stage bound to one worker thread, plus the machinery to create and
/// retire them.
pub(crate) struct StageHost {
    core: Arc<ServerCore>,
    registry: Arc<StageRegistry>,
    tx: UnboundedSender<WorkItem>,
    stages: HashMap<i64, BaseStage>,
}

impl StageHost {
    pub(crate) fn new(core: Arc<ServerCore>, registry: Arc<StageRegistry>, tx: UnboundedSender<WorkItem>) -> Self {
        Self {
            core,
            registry,
            tx,
            stages: HashMap::new(),
        }
    }

    /// Run a group of consecutive items bound for one stage.
    pub(crate) fn execute_batch(&mut self, stage_id: i64, items: Vec<WorkItem>) {
        for item in items {
            self.execute(stage_id, item);
        }
        if self.stages.get(&stage_id).map(BaseStage::is_destroyed).unwrap_or(false) {
            self.retire(stage_id);
        }
    }

    fn execute(&mut self, stage_id: i64, item: WorkItem) {
        match item {
            WorkItem::Create { stage_type, packet } => {
                if self.stages.contains_key(&stage_id) {
                    // Get-or-create: answer with the is-created marker unset.
                    self.core.reply_route(
                        &packet.header,
                        Packet {
                            msg_id: packet.header.msg_id.clone(),
                            payload: Payload::from(vec![0u8]),
                            ..Default::default()
                        },
                    );
                    return;
                }
                let stage_type = if stage_type.is_empty() {
                    self.core.options.default_stage_type.clone()
                } else {
                    stage_type
                };
                let (user, actor_factory) = match self.registry.create(&stage_type, stage_id) {
                    Some(created) => created,
                    None => {
                        log::warn!("No registered stage type {:?} for stage {}", stage_type, stage_id);
                        // The dispatcher recorded the stage optimistically.
                        self.core.stages.remove(stage_id);
                        self.core.reply_error(&packet.header, ErrorCode::StageNotFound);
                        return;
                    }
                };
                Metrics::incr(&self.core.metrics.dispatched);
                Metrics::incr(&self.core.metrics.stages_created);
                self.core.stages.insert(stage_id, stage_type.clone());
                let mut base = BaseStage::new(stage_id, user, actor_factory, self.core.clone(), self.tx.clone());
                base.handle(WorkItem::Create { stage_type, packet });
                self.stages.insert(stage_id, base);
            }
            WorkItem::Continuation(_) => {
                if let Some(base) = self.stages.get_mut(&stage_id) {
                    base.poll_inflight();
                }
            }
            item => match self.stages.get_mut(&stage_id) {
                Some(base) => {
                    if matches!(item, WorkItem::Message(_) | WorkItem::Auth(_)) {
                        Metrics::incr(&self.core.metrics.dispatched);
                    }
                    base.handle(item);
                }
                None => self.missing_stage(item),
            },
        }
    }

    fn missing_stage(&self, item: WorkItem) {
        match item {
            WorkItem::Message(packet) | WorkItem::Auth(packet) => {
                if packet.header.msg_seq != 0 {
                    self.core.reply_error(&packet.header, ErrorCode::StageNotFound);
                } else {
                    log::debug!(
                        "Dropped {} for missing stage {}",
                        packet.header.msg_id,
                        packet.header.stage_id
                    );
                }
            }
            item => log::debug!("Dropped {:?} for a missing stage", item),
        }
    }

    fn retire(&mut self, stage_id: i64) {
        self.stages.remove(&stage_id);
        self.core.stages.remove(stage_id);
        if let Some(timers) = self.core.timers.as_ref() {
            timers.cancel_stage(stage_id);
        }
        self.core.cache.cancel_stage(stage_id, ErrorCode::ConnectionClosed);
        Metrics::incr(&self.core.metrics.stages_destroyed);
    }

    /// Worker shutdown: drop every stage. Pending handler futures are
    /// abandoned; outstanding requests get cancelled by the server teardown.
    pub(crate) fn shutdown(mut self) {
        let count = self.stages.len();
        self.stages.clear();
        if count > 0 {
            log::debug!("Worker dropped {} stages at shutdown", count);
        }
    }
}
