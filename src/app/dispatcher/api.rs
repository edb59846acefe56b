// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The stateless handler surface of an Api server.
//!
//! Controllers describe their routes once at startup through a recording
//! registrar; at dispatch time every request gets a freshly built controller
//! from the registered factory, which is dropped when the handler settles.
//! Duplicate msg-id registrations abort startup.

use crate::{
    app::{
        cluster::{SelectionPolicy, ServerInfo},
        error::MeshError,
        ServerCore,
    },
    wire::{
        ErrorCode, Packet, Payload, RouteHeader, RoutePacket, ServerType, CREATE_STAGE_MSG_ID,
        DESTROY_STAGE_MSG_ID,
    },
};
use futures::{future::BoxFuture, FutureExt};
use std::{collections::HashMap, future::Future, sync::Arc};

/// A stateless request handler set, instantiated per request.
pub trait ApiController: Send + Sized + 'static {
    /// Record every `msg_id -> handler` this controller serves.
    fn handles(registrar: &mut HandlerRegistrar<Self>);
}

type MethodFn<C> = Arc<dyn Fn(C, Packet, ApiLink) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Records a controller's routes during startup introspection.
pub struct HandlerRegistrar<C> {
    entries: Vec<(String, MethodFn<C>)>,
}

impl<C: 'static> HandlerRegistrar<C> {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Route `msg_id` to `method`. The method consumes the per-request
    /// controller instance.
    pub fn add<F, Fut>(&mut self, msg_id: impl Into<String>, method: F)
    where
        F: Fn(C, Packet, ApiLink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.entries
            .push((msg_id.into(), Arc::new(move |controller, packet, link| {
                method(controller, packet, link).boxed()
            })));
    }
}

pub(crate) type DispatchFn = Arc<dyn Fn(Packet, ApiLink) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// The startup-frozen `msg_id -> handler` table.
#[derive(Default)]
pub(crate) struct HandlerTable {
    entries: HashMap<String, DispatchFn>,
}

impl HandlerTable {
    pub(crate) fn get(&self, msg_id: &str) -> Option<DispatchFn> {
        self.entries.get(msg_id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Collects controllers at startup and checks their routes for conflicts.
#[derive(Default)]
pub struct ApiRegistry {
    table: HandlerTable,
}

impl ApiRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a controller type with the factory that builds one instance
    /// per request. Fails on duplicate msg ids.
    pub fn register<C, F>(mut self, factory: F) -> anyhow::Result<Self>
    where
        C: ApiController,
        F: Fn() -> C + Send + Sync + 'static,
    {
        let mut registrar = HandlerRegistrar::new();
        C::handles(&mut registrar);
        anyhow::ensure!(
            !registrar.entries.is_empty(),
            "controller registered no handlers"
        );
        let factory = Arc::new(factory);
        for (msg_id, method) in registrar.entries {
            anyhow::ensure!(
                !self.table.entries.contains_key(&msg_id),
                "duplicate handler registration for {:?}",
                msg_id
            );
            let factory = factory.clone();
            self.table.entries.insert(
                msg_id,
                Arc::new(move |packet, link| {
                    let controller = (factory)();
                    method(controller, packet, link)
                }),
            );
        }
        Ok(self)
    }

    pub(crate) fn into_table(self) -> HandlerTable {
        self.table
    }
}

/// The capability handle api and system handlers receive.
#[derive(Clone)]
pub struct ApiLink {
    core: Arc<ServerCore>,
    header: RouteHeader,
}

impl ApiLink {
    pub(crate) fn new(core: Arc<ServerCore>, header: RouteHeader) -> Self {
        Self { core, header }
    }

    /// This process's identity.
    pub fn server_id(&self) -> &str {
        &self.core.options.server_id
    }

    /// The account the triggering packet was sent on behalf of.
    pub fn account_id(&self) -> &str {
        &self.header.account_id
    }

    /// The client session behind the triggering packet, zero if none.
    pub fn sid(&self) -> u64 {
        self.header.sid
    }

    /// The sender of the triggering packet.
    pub fn from_server(&self) -> &str {
        &self.header.from
    }

    /// Answer the triggering packet. A fire-and-forget trigger makes this a
    /// logged no-op.
    pub fn reply(&self, packet: Packet) {
        if self.header.msg_seq == 0 {
            log::debug!("Reply to fire-and-forget {} dropped", self.header.msg_id);
            return;
        }
        self.core.reply_route(&self.header, packet);
    }

    /// Answer the triggering packet with a bare error code.
    pub fn reply_error(&self, code: ErrorCode) {
        self.reply(Packet {
            msg_id: self.header.msg_id.clone(),
            error_code: code.into(),
            ..Default::default()
        });
    }

    /// Fire-and-forget to a stage on a Play server.
    pub fn send_to_stage(&self, server_id: &str, stage_id: i64, mut packet: Packet) -> Result<(), MeshError> {
        let mut header = self.core.new_header(&packet.msg_id, stage_id);
        header.account_id = self.header.account_id.clone();
        self.core.send_route(server_id, RoutePacket::new(header, packet.payload.take()))
    }

    /// Ask a stage and await the outcome packet.
    pub async fn request_to_stage(&self, server_id: &str, stage_id: i64, mut packet: Packet) -> Packet {
        let mut header = self.core.new_header(&packet.msg_id, stage_id);
        header.account_id = self.header.account_id.clone();
        self.core
            .request_route(server_id, header, packet.payload.take(), None)
            .await
    }

    /// Fire-and-forget to a peer of `(server_type, service_id)` chosen by
    /// `policy`.
    pub fn send_to_api_service(
        &self,
        service_id: u16,
        policy: SelectionPolicy,
        mut packet: Packet,
    ) -> Result<(), MeshError> {
        let target = self.core.ring.select(ServerType::Api, service_id, policy)?;
        let header = self.core.new_header(&packet.msg_id, 0);
        self.core
            .send_route(&target.server_id, RoutePacket::new(header, packet.payload.take()))
    }

    /// Ask a round-robin-chosen Api peer and await the outcome packet.
    pub async fn request_to_api(&self, service_id: u16, mut packet: Packet) -> Packet {
        let target = match self
            .core
            .ring
            .select(ServerType::Api, service_id, SelectionPolicy::RoundRobin)
        {
            Ok(target) => target,
            Err(e) => {
                return Packet {
                    msg_id: packet.msg_id,
                    error_code: e.error_code().into(),
                    ..Default::default()
                }
            }
        };
        let header = self.core.new_header(&packet.msg_id, 0);
        self.core
            .request_route(&target.server_id, header, packet.payload.take(), None)
            .await
    }

    /// Fire-and-forget to a server's system handler.
    pub fn send_to_system(&self, server_id: &str, mut packet: Packet) -> Result<(), MeshError> {
        let header = self.core.new_header(&packet.msg_id, 0);
        self.core.send_route(server_id, RoutePacket::new(header, packet.payload.take()))
    }

    /// Ask a server's system handler and await the outcome packet.
    pub async fn request_to_system(&self, server_id: &str, mut packet: Packet) -> Packet {
        let header = self.core.new_header(&packet.msg_id, 0);
        self.core
            .request_route(server_id, header, packet.payload.take(), None)
            .await
    }

    /// Get-or-create a stage on a Play server and await the outcome.
    pub async fn create_stage(
        &self,
        play_server_id: &str,
        stage_type: &str,
        stage_id: i64,
        payload: Payload,
    ) -> CreateStageResult {
        let mut body = Vec::with_capacity(1 + stage_type.len() + payload.len());
        body.push(stage_type.len() as u8);
        body.extend_from_slice(stage_type.as_bytes());
        body.extend_from_slice(payload.as_slice());
        let header = self.core.new_header(CREATE_STAGE_MSG_ID, stage_id);
        let mut reply = self
            .core
            .request_route(play_server_id, header, Payload::from(body), None)
            .await;
        let raw = reply.payload.as_slice();
        let is_created = raw.first().copied() == Some(1);
        let body = if raw.len() > 1 { raw[1..].to_vec() } else { Vec::new() };
        CreateStageResult {
            error_code: reply.error_code,
            is_created,
            payload: Payload::from(body),
        }
    }

    /// Tear a stage down on a Play server.
    pub async fn destroy_stage(&self, play_server_id: &str, stage_id: i64) -> Packet {
        let header = self.core.new_header(DESTROY_STAGE_MSG_ID, stage_id);
        self.core
            .request_route(play_server_id, header, Payload::Empty, None)
            .await
    }

    /// The current membership snapshot.
    pub fn servers(&self) -> Vec<ServerInfo> {
        self.core.ring.servers()
    }
}

/// The outcome of [`ApiLink::create_stage`].
#[derive(Debug)]
pub struct CreateStageResult {
    /// Zero when the stage exists (created now or earlier).
    pub error_code: u16,
    /// True when this call created the stage.
    pub is_created: bool,
    /// The stage's create-reply payload.
    pub payload: Payload,
}
