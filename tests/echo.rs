// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Client-boundary end-to-end scenarios over TCP: echo with and without
//! compression, fire-and-forget accounting, the pre-auth gate, heartbeats
//! and timer pushes.

mod common;

use common::*;
use playhouse::{
    app::{PlayServer, ServerOptions},
    wire::{Packet, Payload, ServerType, HEARTBEAT_MSG_ID},
};
use std::{convert::TryInto, sync::Arc, time::Duration};

async fn start_play(mesh_port: u16, tcp_port: u16) -> PlayServer {
    init_logs();
    let options = ServerOptions::play("play-1")
        .with_bind_endpoint(format!("tcp://127.0.0.1:{}", mesh_port))
        .with_tcp_port(tcp_port)
        .with_resolver_period_ms(200);
    let system = Arc::new(StaticMesh {
        servers: vec![info(ServerType::Play, 1, "play-1", mesh_port)],
    });
    PlayServer::start(options, room_registry(), system)
        .await
        .expect("play server starts")
}

#[tokio::test]
async fn echo_round_trips_plain_and_compressed() {
    let tcp_port = open_port();
    let server = start_play(open_port(), tcp_port).await;
    let created = server.create_stage("room", 42, Payload::Empty).await;
    assert_eq!(created.error_code, 0);
    assert!(created.is_created);

    let mut client = TestClient::connect(tcp_port).await;
    client.authenticate(42, "acc-1").await;

    // A 64-byte body stays uncompressed.
    client
        .send(&Packet::request("EchoRequest", 1, 42, Payload::from(vec![0u8; 64])))
        .await;
    let (reply, original_size) = client.recv().await;
    assert_eq!(reply.msg_id, "EchoReply");
    assert_eq!(reply.msg_seq, 1);
    assert_eq!(reply.stage_id, 42);
    assert_eq!(reply.error_code, 0);
    assert_eq!(original_size, 0);
    assert_eq!(reply.payload.as_slice(), &[0u8; 64][..]);

    // 8 KiB of 0xAA compresses; the wire frame must be materially smaller
    // and decompress back to the original body.
    client
        .send(&Packet::request("EchoRequest", 2, 42, Payload::from(vec![0xAA; 8192])))
        .await;
    let frame = client.recv_raw().await.expect("a compressed reply");
    assert!(frame.len() < 8192, "frame was {} bytes", frame.len());
    let (reply, original_size) = playhouse::wire::decode_response(frame).expect("decodes");
    assert_eq!(original_size, 8192);
    assert_eq!(reply.payload.len(), 8192);
    assert!(reply.payload.as_slice().iter().all(|&b| b == 0xAA));

    server.shutdown().await;
}

#[tokio::test]
async fn fire_and_forget_is_dispatched_exactly_once() {
    let tcp_port = open_port();
    let server = start_play(open_port(), tcp_port).await;
    server.create_stage("room", 7, Payload::Empty).await;

    let mut client = TestClient::connect(tcp_port).await;
    client.authenticate(7, "acc-1").await;

    // msg_seq 0: no reply may ever arrive for this.
    client
        .send(&Packet {
            msg_id: "Nudge".to_string(),
            msg_seq: 0,
            stage_id: 7,
            error_code: 0,
            payload: Payload::Empty,
        })
        .await;
    // The counter request rides the same mailbox, so it observes the nudge.
    client
        .send(&Packet::request("CountRequest", 3, 7, Payload::Empty))
        .await;
    let (reply, _) = client.recv().await;
    assert_eq!(reply.msg_id, "CountReply");
    let count = u64::from_le_bytes(reply.payload.as_slice()[..8].try_into().unwrap());
    assert_eq!(count, 1);

    server.shutdown().await;
}

#[tokio::test]
async fn pre_auth_gate_closes_on_anything_but_auth() {
    let tcp_port = open_port();
    let server = start_play(open_port(), tcp_port).await;
    server.create_stage("room", 7, Payload::Empty).await;

    // Heartbeats are fine before auth and never answered.
    let mut client = TestClient::connect(tcp_port).await;
    client
        .send(&Packet::new(HEARTBEAT_MSG_ID, Payload::Empty))
        .await;
    client.authenticate(7, "acc-2").await;

    // A second session skipping auth is answered with Unauthorized, then
    // dropped.
    let mut rogue = TestClient::connect(tcp_port).await;
    rogue
        .send(&Packet::request("EchoRequest", 1, 7, Payload::Empty))
        .await;
    let (refusal, _) = rogue.recv().await;
    assert_eq!(refusal.error_code, 9);
    assert!(rogue.recv_raw().await.is_none(), "rogue session must be closed");

    server.shutdown().await;
}

#[tokio::test]
async fn stage_timers_push_to_the_client() {
    let tcp_port = open_port();
    let server = start_play(open_port(), tcp_port).await;
    server.create_stage("room", 9, Payload::Empty).await;

    let mut client = TestClient::connect(tcp_port).await;
    client.authenticate(9, "acc-3").await;
    client
        .send(&Packet::request("StartTimer", 5, 9, Payload::Empty))
        .await;
    let (reply, _) = client.recv().await;
    assert_eq!(reply.msg_id, "TimerStarted");

    let pushed = tokio::time::timeout(Duration::from_secs(2), client.recv())
        .await
        .expect("timer fires in time");
    assert_eq!(pushed.0.msg_id, "TimerFired");
    assert_eq!(pushed.0.msg_seq, 0);

    server.shutdown().await;
}
