// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The server runtime: stage event loops, timers, client sessions, the
//! inter-server mesh and the dispatchers, wired together by
//! [`PlayServer`](application::PlayServer) and
//! [`ApiServer`](application::ApiServer).

pub mod application;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event_loop;
pub mod listener;
pub mod metrics;
pub mod session;
pub mod stage;
pub mod timer;
pub mod websocket;
pub mod worker;

pub use application::{ApiServer, PlayServer};
pub use cluster::{SelectionPolicy, ServerInfo, SystemController};
pub use config::ServerOptions;
pub use dispatcher::{ApiController, ApiLink, ApiRegistry, CreateStageResult, HandlerRegistrar};
pub use error::{MeshError, StageError};
pub use event_loop::PoolHandle;
pub use metrics::{Metrics, MetricsSnapshot};
pub use stage::{Actor, ActorContext, Stage, StageLink, StageRegistry};
pub use timer::{GameLoop, TimerHandle, TimerId};

use crate::wire::{ErrorCode, Packet, Payload, RouteHeader, RoutePacket};
use cluster::{MeshHandle, ServerRing};
use session::SessionRegistry;
use stage::StageDirectory;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use worker::{RequestCache, RespondWorker};

/// What the dispatcher task consumes: routed packets from the mesh and local
/// sessions, plus session lifecycle edges.
#[derive(Debug)]
pub(crate) enum DispatchEvent {
    /// An inbound routed packet.
    Route(RoutePacket),
    /// A client session went away.
    SessionClosed {
        sid: u64,
        account_id: String,
        stage_id: i64,
    },
}

/// The shared handles every component hangs off. One per server process.
pub(crate) struct ServerCore {
    pub(crate) options: ServerOptions,
    pub(crate) metrics: Arc<Metrics>,
    pub(crate) cache: Arc<RequestCache>,
    pub(crate) ring: Arc<ServerRing>,
    pub(crate) mesh: MeshHandle,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) stages: StageDirectory,
    /// Present on Play servers only.
    pub(crate) pool: Option<PoolHandle>,
    /// Present on Play servers only.
    pub(crate) timers: Option<TimerHandle>,
}

impl ServerCore {
    /// This process's membership record, as handed to service discovery.
    pub(crate) fn self_info(&self) -> ServerInfo {
        ServerInfo {
            server_type: self.options.server_type,
            service_id: self.options.service_id,
            server_id: self.options.server_id.clone(),
            address: self.options.bind_endpoint.clone(),
            state: crate::wire::ServerState::Running,
            weight: 0,
        }
    }

    /// A header stamped with this process's service identity.
    pub(crate) fn new_header(&self, msg_id: &str, stage_id: i64) -> RouteHeader {
        RouteHeader {
            service_id: self.options.service_id,
            server_type: self.options.server_type,
            msg_id: msg_id.to_string(),
            stage_id,
            ..Default::default()
        }
    }

    /// The worker pool; callers are Play-only paths.
    pub(crate) fn pool(&self) -> &PoolHandle {
        self.pool.as_ref().expect("stage work posted on a server without a pool")
    }

    /// Fire-and-forget a routed packet at a peer.
    pub(crate) fn send_route(&self, target: &str, packet: RoutePacket) -> Result<(), MeshError> {
        self.mesh.send(target, packet)
    }

    /// Answer an inbound packet with `reply` (its `msg_seq` and `stage_id`
    /// are taken from the inbound header). Local-client requests (empty
    /// `from`, nonzero `sid`) are answered on the session; everything else
    /// goes back over the mesh to the sender. Fire-and-forget packets are
    /// never answered.
    pub(crate) fn reply_route(&self, inbound: &RouteHeader, mut reply: Packet) {
        if inbound.msg_seq == 0 {
            return;
        }
        if inbound.from.is_empty() && inbound.sid != 0 {
            let packet = Packet {
                msg_id: reply.msg_id,
                msg_seq: inbound.msg_seq,
                stage_id: inbound.stage_id,
                error_code: reply.error_code,
                payload: reply.payload.take(),
            };
            if self.sessions.send_packet(inbound.sid, packet, self.options.compression_threshold) {
                Metrics::incr(&self.metrics.replies_sent);
            }
            return;
        }
        if inbound.from.is_empty() {
            log::warn!("Reply to {} has no reply target; dropped", inbound.msg_id);
            return;
        }
        let mut header = inbound.reply(ErrorCode::Success);
        header.error_code = reply.error_code;
        header.msg_id = reply.msg_id;
        header.service_id = self.options.service_id;
        header.server_type = self.options.server_type;
        match self.mesh.send(&inbound.from, RoutePacket::new(header, reply.payload.take())) {
            Ok(()) => Metrics::incr(&self.metrics.replies_sent),
            Err(e) => log::warn!("Reply to {} failed: {}", inbound.from, e),
        }
    }

    /// Answer an inbound packet with a bare error code.
    pub(crate) fn reply_error(&self, inbound: &RouteHeader, code: ErrorCode) {
        self.reply_route(
            inbound,
            Packet {
                msg_id: inbound.msg_id.clone(),
                error_code: code.into(),
                ..Default::default()
            },
        );
    }

    /// Issue a request and wait for its outcome. The returned packet is
    /// always one of: the matching reply, a synthesized `@Timeout@`, or a
    /// synthesized connection-closed reply. Never an absence.
    pub(crate) async fn request_route(
        &self,
        target: &str,
        mut header: RouteHeader,
        payload: Payload,
        origin_stage: Option<i64>,
    ) -> Packet {
        let msg_seq = self.cache.next_seq();
        header.msg_seq = msg_seq;
        let msg_id = header.msg_id.clone();
        let (completion, inbox) = RespondWorker::channel(msg_id.clone());
        let deadline = Instant::now() + Duration::from_millis(self.options.request_timeout_ms);
        self.cache.add(msg_seq, deadline, origin_stage, Box::new(completion));
        if let Err(e) = self.mesh.send(target, RoutePacket::new(header, payload)) {
            log::warn!("Request {} to {} failed: {}", msg_id, target, e);
            if let Some(parked) = self.cache.resolve(msg_seq) {
                parked.handle_error(msg_seq, e.error_code());
            }
        }
        match inbox.await {
            Ok(reply) => reply.into_packet(),
            Err(_) => RoutePacket::canceled(msg_seq, &msg_id, ErrorCode::ConnectionClosed).into_packet(),
        }
    }
}
