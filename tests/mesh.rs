// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Cross-tier scenarios over the mesh: stage creation through an Api server
//! (get-or-create semantics) and request timeouts surfacing as synthesized
//! `@Timeout@` replies without dropping the connection.

mod common;

use common::*;
use playhouse::{
    app::{
        ApiController, ApiLink, ApiRegistry, ApiServer, HandlerRegistrar, PlayServer,
        ServerOptions,
    },
    wire::{Packet, Payload, ServerType, TIMEOUT_MSG_ID},
};
use std::{convert::TryInto, sync::Arc, time::Duration};

struct RoomController;

impl ApiController for RoomController {
    fn handles(registrar: &mut HandlerRegistrar<Self>) {
        registrar.add("CreateRoom", RoomController::create_room);
        registrar.add("SlowApi", RoomController::slow);
    }
}

impl RoomController {
    async fn create_room(self, packet: Packet, link: ApiLink) -> anyhow::Result<()> {
        let stage_id = i64::from_le_bytes(packet.payload.as_slice()[..8].try_into()?);
        let play = link
            .servers()
            .into_iter()
            .find(|info| info.server_type == ServerType::Play)
            .ok_or_else(|| anyhow::anyhow!("no play server in the mesh"))?;
        let result = link
            .create_stage(&play.server_id, "room", stage_id, Payload::Empty)
            .await;
        let mut reply = Packet::new("CreateRoomReply", Payload::from(vec![result.is_created as u8]));
        reply.error_code = result.error_code;
        link.reply(reply);
        Ok(())
    }

    async fn slow(self, _packet: Packet, _link: ApiLink) -> anyhow::Result<()> {
        // Never answers; the caller's deadline does the talking.
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

async fn start_pair() -> (PlayServer, ApiServer, u16) {
    init_logs();
    let play_mesh = open_port();
    let api_mesh = open_port();
    let tcp_port = open_port();
    let servers = vec![
        info(ServerType::Play, 1, "play-1", play_mesh),
        info(ServerType::Api, 1, "api-1", api_mesh),
    ];

    let play_options = ServerOptions::play("play-1")
        .with_bind_endpoint(format!("tcp://127.0.0.1:{}", play_mesh))
        .with_tcp_port(tcp_port)
        .with_resolver_period_ms(200)
        .with_request_timeout_ms(500);
    let play = PlayServer::start(
        play_options,
        room_registry(),
        Arc::new(StaticMesh { servers: servers.clone() }),
    )
    .await
    .expect("play server starts");

    let api_options = ServerOptions::api("api-1")
        .with_bind_endpoint(format!("tcp://127.0.0.1:{}", api_mesh))
        .with_resolver_period_ms(200);
    let registry = ApiRegistry::new()
        .register(|| RoomController)
        .expect("handlers register");
    let api = ApiServer::start(api_options, registry, Arc::new(StaticMesh { servers }))
        .await
        .expect("api server starts");

    // Let both resolvers build the full mesh before driving traffic.
    tokio::time::sleep(Duration::from_millis(600)).await;
    (play, api, tcp_port)
}

#[tokio::test]
async fn stages_are_created_through_the_api_tier_once() {
    let (play, api, tcp_port) = start_pair().await;
    play.create_stage("room", 1, Payload::Empty).await;

    let mut client = TestClient::connect(tcp_port).await;
    client.authenticate(1, "acc-1").await;

    // The lobby stage relays to the api tier, which get-or-creates stage 100
    // back on the play server.
    let target = 100i64.to_le_bytes().to_vec();
    client
        .send(&Packet::request("MakeRoom", 1, 1, Payload::from(target.clone())))
        .await;
    let (reply, _) = client.recv().await;
    assert_eq!(reply.msg_id, "MakeRoomReply");
    assert_eq!(reply.error_code, 0);
    assert_eq!(reply.payload.as_slice(), &[1u8], "first create reports is_created");

    // Creating the same stage again succeeds but reports a hit.
    client
        .send(&Packet::request("MakeRoom", 2, 1, Payload::from(target)))
        .await;
    let (reply, _) = client.recv().await;
    assert_eq!(reply.error_code, 0);
    assert_eq!(reply.payload.as_slice(), &[0u8], "second create reports a hit");

    assert_eq!(play.stage_count(), 2);
    play.shutdown().await;
    api.shutdown().await;
}

#[tokio::test]
async fn unanswered_requests_surface_as_timeout_replies() {
    let (play, api, tcp_port) = start_pair().await;
    play.create_stage("room", 5, Payload::Empty).await;

    let mut client = TestClient::connect(tcp_port).await;
    client.authenticate(5, "acc-2").await;

    // The stage asks the api tier; the handler never answers; after the
    // 500 ms deadline the stage observes a synthesized timeout and relays it.
    client
        .send(&Packet::request("SlowRequest", 3, 5, Payload::Empty))
        .await;
    let (reply, _) = client.recv().await;
    assert_eq!(reply.msg_id, TIMEOUT_MSG_ID);
    assert_eq!(reply.msg_seq, 3);
    assert_eq!(reply.error_code, 5);
    assert!(play.metrics().requests_timed_out >= 1);

    // The connection stays open and useful.
    client
        .send(&Packet::request("EchoRequest", 4, 5, Payload::from(vec![7u8; 8])))
        .await;
    let (reply, _) = client.recv().await;
    assert_eq!(reply.msg_id, "EchoReply");
    assert_eq!(reply.payload.as_slice(), &[7u8; 8][..]);

    play.shutdown().await;
    api.shutdown().await;
}
