// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the end-to-end tests: a static-membership system
//! controller, an echoing room stage, and a minimal TCP client speaking the
//! wire protocol.

#![allow(dead_code)]

use async_trait::async_trait;
use playhouse::{
    app::{
        Actor, ActorContext, ServerInfo, Stage, StageLink, StageRegistry, SystemController,
    },
    wire::{
        decode_response, encode_request, ErrorCode, Packet, Payload, ServerState, ServerType,
    },
};
use std::{convert::TryInto, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

/// Route server logs through env_logger. Safe to call from every test; only
/// the first call in the process wins.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A system controller backed by a fixed membership list.
pub struct StaticMesh {
    pub servers: Vec<ServerInfo>,
}

#[async_trait]
impl SystemController for StaticMesh {
    async fn update_server_info(&self, _self_info: ServerInfo) -> anyhow::Result<Vec<ServerInfo>> {
        Ok(self.servers.clone())
    }
}

/// A running membership record on loopback.
pub fn info(server_type: ServerType, service_id: u16, server_id: &str, mesh_port: u16) -> ServerInfo {
    ServerInfo {
        server_type,
        service_id,
        server_id: server_id.to_string(),
        address: format!("tcp://127.0.0.1:{}", mesh_port),
        state: ServerState::Running,
        weight: 1,
    }
}

/// The test room: echoes, counts fire-and-forgets, relays to the api tier.
#[derive(Default)]
pub struct EchoStage {
    fnf_count: u64,
    last_sid: u64,
}

#[async_trait]
impl Stage for EchoStage {
    async fn on_actor_dispatch(&mut self, link: &StageLink, actor: &mut ActorContext, packet: Packet) {
        self.last_sid = actor.sid;
        let mut packet = packet;
        match packet.msg_id.as_str() {
            "EchoRequest" => {
                link.reply(Packet::new("EchoReply", packet.payload.take())).ok();
            }
            "CountRequest" => {
                let body = self.fnf_count.to_le_bytes().to_vec();
                link.reply(Packet::new("CountReply", Payload::from(body))).ok();
            }
            "SlowRequest" => {
                let reply = link
                    .request_to_api(1, Packet::new("SlowApi", Payload::Empty))
                    .await
                    .expect("link is alive");
                let mut out = Packet::new(reply.msg_id.clone(), Payload::Empty);
                out.error_code = reply.error_code;
                link.reply(out).ok();
            }
            "MakeRoom" => {
                let mut reply = link
                    .request_to_api(1, Packet::new("CreateRoom", packet.payload.take()))
                    .await
                    .expect("link is alive");
                let mut out = Packet::new("MakeRoomReply", reply.payload.take());
                out.error_code = reply.error_code;
                link.reply(out).ok();
            }
            "StartTimer" => {
                link.add_count_timer(Duration::from_millis(20), Duration::from_millis(20), 1)
                    .expect("timer registered");
                link.reply(Packet::new("TimerStarted", Payload::Empty)).ok();
            }
            _ => {
                self.fnf_count += 1;
            }
        }
    }

    async fn on_dispatch(&mut self, _link: &StageLink, _packet: Packet) {}

    async fn on_timer(&mut self, link: &StageLink, _timer_id: u64) {
        link.send_to_client(self.last_sid, Packet::new("TimerFired", Payload::Empty))
            .ok();
    }
}

/// The test actor: the auth payload is the UTF-8 account id.
pub struct EchoActor;

#[async_trait]
impl Actor for EchoActor {
    async fn on_authenticate(
        &mut self,
        _link: &StageLink,
        packet: &Packet,
    ) -> Result<(String, Option<Packet>), ErrorCode> {
        let account = String::from_utf8(packet.payload.to_vec()).map_err(|_| ErrorCode::Unauthorized)?;
        if account.is_empty() {
            return Err(ErrorCode::Unauthorized);
        }
        Ok((account, Some(Packet::new("AuthReply", Payload::Empty))))
    }
}

/// The registry every test Play server uses.
pub fn room_registry() -> StageRegistry {
    StageRegistry::new().register(
        "room",
        |_| Box::new(EchoStage::default()) as Box<dyn Stage>,
        || Box::new(EchoActor) as Box<dyn Actor>,
    )
}

/// A minimal TCP client speaking the length-prefixed client protocol.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(tcp_port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", tcp_port))
            .await
            .expect("client connects");
        stream.set_nodelay(true).ok();
        Self { stream }
    }

    pub async fn send(&mut self, packet: &Packet) {
        let frame = encode_request(packet, true).expect("encodes");
        self.stream.write_all(&frame).await.expect("writes");
    }

    /// Read one raw response frame (without the size prefix); `None` on EOF.
    pub async fn recv_raw(&mut self) -> Option<Vec<u8>> {
        let mut size = [0u8; 4];
        if self.stream.read_exact(&mut size).await.is_err() {
            return None;
        }
        let content = i32::from_le_bytes(size[..].try_into().unwrap()) as usize;
        let mut frame = vec![0u8; content];
        if self.stream.read_exact(&mut frame).await.is_err() {
            return None;
        }
        Some(frame)
    }

    /// Read and decode one response. Panics on EOF.
    pub async fn recv(&mut self) -> (Packet, i32) {
        let frame = self.recv_raw().await.expect("a response frame");
        decode_response(frame).expect("decodes")
    }

    /// Authenticate into `stage_id` as `account`.
    pub async fn authenticate(&mut self, stage_id: i64, account: &str) {
        self.send(&Packet::request(
            "AuthenticateRequest",
            999,
            stage_id,
            Payload::from(account.as_bytes().to_vec()),
        ))
        .await;
        let (reply, _) = self.recv().await;
        assert_eq!(reply.msg_id, "AuthReply");
        assert_eq!(reply.msg_seq, 999);
        assert_eq!(reply.error_code, 0);
    }
}

/// A free loopback port.
pub fn open_port() -> u16 {
    port_scanner::request_open_port().expect("a free port")
}
