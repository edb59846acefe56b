// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The capability handle stage hooks receive.
//!
//! A link snapshots the triggering message's routing header, so `reply` knows
//! where to go without the handler threading anything through. Links cloned
//! into long-lived tasks go stale once the stage is destroyed; every
//! operation on a stale link fails synchronously.

use crate::{
    app::{
        cluster::SelectionPolicy,
        error::StageError,
        event_loop::WorkItem,
        timer::{GameLoop, TimerId},
        ServerCore,
    },
    wire::{ErrorCode, Packet, RouteHeader, ServerType},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

/// The stage's window on the rest of the server.
#[derive(Clone)]
pub struct StageLink {
    core: Arc<ServerCore>,
    stage_id: i64,
    header: RouteHeader,
    alive: Arc<AtomicBool>,
    actor_count: Arc<AtomicUsize>,
    game_loop: Arc<Mutex<Option<GameLoop>>>,
}

impl StageLink {
    pub(crate) fn new(
        core: Arc<ServerCore>,
        stage_id: i64,
        header: RouteHeader,
        alive: Arc<AtomicBool>,
        actor_count: Arc<AtomicUsize>,
        game_loop: Arc<Mutex<Option<GameLoop>>>,
    ) -> Self {
        Self {
            core,
            stage_id,
            header,
            alive,
            actor_count,
            game_loop,
        }
    }

    /// The owning stage.
    pub fn stage_id(&self) -> i64 {
        self.stage_id
    }

    /// The account the triggering message was sent on behalf of, empty for
    /// system and timer work.
    pub fn account_id(&self) -> &str {
        &self.header.account_id
    }

    /// The client session behind the triggering message, zero if none.
    pub fn sid(&self) -> u64 {
        self.header.sid
    }

    /// The msg id of the triggering message.
    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    /// Joined actors on this stage.
    pub fn actor_count(&self) -> usize {
        self.actor_count.load(Ordering::Relaxed)
    }

    /// Stages alive on this server.
    pub fn stage_count(&self) -> usize {
        self.core.stages.len()
    }

    fn check(&self) -> Result<(), StageError> {
        if self.alive.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(StageError::Gone(self.stage_id))
        }
    }

    /// Answer the triggering message with `packet`. Fails when the message
    /// was fire-and-forget.
    pub fn reply(&self, packet: Packet) -> Result<(), StageError> {
        self.check()?;
        if self.header.msg_seq == 0 {
            return Err(StageError::NoReplyTarget);
        }
        self.core.reply_route(&self.header, packet);
        Ok(())
    }

    /// Answer the triggering message with a bare error code.
    pub fn reply_error(&self, code: ErrorCode) -> Result<(), StageError> {
        self.reply(Packet {
            msg_id: self.header.msg_id.clone(),
            error_code: code.into(),
            ..Default::default()
        })
    }

    /// Push a packet to a client session on this server.
    pub fn send_to_client(&self, sid: u64, packet: Packet) -> Result<(), StageError> {
        self.check()?;
        if !self
            .core
            .sessions
            .send_packet(sid, packet, self.core.options.compression_threshold)
        {
            log::debug!("Send to missing session {} dropped", sid);
        }
        Ok(())
    }

    /// Fire-and-forget to a stage anywhere on the mesh (including this
    /// server, which routes through its self-connection).
    pub fn send_to_stage(&self, server_id: &str, stage_id: i64, mut packet: Packet) -> Result<(), StageError> {
        self.check()?;
        let header = self.core.new_header(&packet.msg_id, stage_id);
        self.core.send_route(server_id, crate::wire::RoutePacket::new(header, packet.payload.take()))?;
        Ok(())
    }

    /// Fire-and-forget to a round-robin-chosen Api server of `service_id`.
    pub fn send_to_api(&self, service_id: u16, packet: Packet) -> Result<(), StageError> {
        self.send_to_api_service(service_id, SelectionPolicy::RoundRobin, packet)
    }

    /// Fire-and-forget to an Api server of `service_id` chosen by `policy`.
    pub fn send_to_api_service(
        &self,
        service_id: u16,
        policy: SelectionPolicy,
        mut packet: Packet,
    ) -> Result<(), StageError> {
        self.check()?;
        let target = self.core.ring.select(ServerType::Api, service_id, policy)?;
        let header = self.core.new_header(&packet.msg_id, 0);
        self.core
            .send_route(&target.server_id, crate::wire::RoutePacket::new(header, packet.payload.take()))?;
        Ok(())
    }

    /// Fire-and-forget to a server's system handler.
    pub fn send_to_system(&self, server_id: &str, mut packet: Packet) -> Result<(), StageError> {
        self.check()?;
        let header = self.core.new_header(&packet.msg_id, 0);
        self.core
            .send_route(server_id, crate::wire::RoutePacket::new(header, packet.payload.take()))?;
        Ok(())
    }

    /// Ask a round-robin-chosen Api server and await the outcome. The
    /// returned packet is the reply, a synthesized timeout, or a synthesized
    /// connection-closed failure; its `error_code` says which.
    pub async fn request_to_api(&self, service_id: u16, mut packet: Packet) -> Result<Packet, StageError> {
        self.check()?;
        let target = match self.core.ring.select(ServerType::Api, service_id, SelectionPolicy::RoundRobin) {
            Ok(target) => target,
            Err(e) => {
                return Ok(Packet {
                    msg_id: packet.msg_id,
                    error_code: e.error_code().into(),
                    ..Default::default()
                })
            }
        };
        let header = self.core.new_header(&packet.msg_id, 0);
        Ok(self
            .core
            .request_route(&target.server_id, header, packet.payload.take(), Some(self.stage_id))
            .await)
    }

    /// Ask another stage and await the outcome.
    pub async fn request_to_stage(
        &self,
        server_id: &str,
        stage_id: i64,
        mut packet: Packet,
    ) -> Result<Packet, StageError> {
        self.check()?;
        let header = self.core.new_header(&packet.msg_id, stage_id);
        Ok(self
            .core
            .request_route(server_id, header, packet.payload.take(), Some(self.stage_id))
            .await)
    }

    /// Ask a server's system handler and await the outcome.
    pub async fn request_to_system(&self, server_id: &str, mut packet: Packet) -> Result<Packet, StageError> {
        self.check()?;
        let header = self.core.new_header(&packet.msg_id, 0);
        Ok(self
            .core
            .request_route(server_id, header, packet.payload.take(), Some(self.stage_id))
            .await)
    }

    /// Fire `on_timer` at `now + delay`, then every `period`, until cancelled.
    pub fn add_repeat_timer(&self, delay: Duration, period: Duration) -> Result<TimerId, StageError> {
        self.check()?;
        Ok(self.timers()?.add_repeat(self.stage_id, delay, period))
    }

    /// Like `add_repeat_timer`, auto-cancelling after `count` firings.
    pub fn add_count_timer(&self, delay: Duration, period: Duration, count: u32) -> Result<TimerId, StageError> {
        self.check()?;
        Ok(self.timers()?.add_count(self.stage_id, delay, period, count))
    }

    /// Cancel a timer. Unknown ids are a no-op.
    pub fn cancel_timer(&self, timer_id: TimerId) -> Result<(), StageError> {
        self.check()?;
        self.timers()?.cancel(timer_id);
        Ok(())
    }

    /// Start the fixed-timestep ticker for this stage. Fails if it is
    /// already running.
    pub fn start_game_loop(&self, fixed_timestep: Duration, cap: Option<Duration>) -> Result<(), StageError> {
        self.check()?;
        let mut slot = self.game_loop.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return Err(StageError::GameLoopRunning(self.stage_id));
        }
        *slot = Some(GameLoop::start(
            self.stage_id,
            fixed_timestep,
            cap,
            self.core.pool().clone(),
        ));
        Ok(())
    }

    /// Stop the ticker. Stopping a stopped loop is a no-op.
    pub fn stop_game_loop(&self) -> Result<(), StageError> {
        self.check()?;
        let mut slot = self.game_loop.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut game_loop) = slot.take() {
            game_loop.stop();
        }
        Ok(())
    }

    /// Tear this stage down once the current work completes.
    pub fn destroy_stage(&self) -> Result<(), StageError> {
        self.check()?;
        self.core.pool().post(self.stage_id, WorkItem::Destroy(self.stage_id));
        Ok(())
    }

    fn timers(&self) -> Result<&crate::app::timer::TimerHandle, StageError> {
        self.core.timers.as_ref().ok_or(StageError::Gone(self.stage_id))
    }
}
