// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! WebSocket transport scenarios: the same payload layout as TCP minus the
//! length prefix, carried in self-delimited binary frames.

mod common;

use common::*;
use futures::{SinkExt, StreamExt};
use playhouse::{
    app::{PlayServer, ServerOptions},
    wire::{decode_response, encode_request, Packet, Payload, ServerType},
};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn websocket_clients_authenticate_and_echo() {
    init_logs();
    let mesh_port = open_port();
    let ws_port = open_port();
    let options = ServerOptions::play("play-1")
        .with_bind_endpoint(format!("tcp://127.0.0.1:{}", mesh_port))
        .with_ws_port(ws_port, "/ws")
        .with_resolver_period_ms(200);
    let system = Arc::new(StaticMesh {
        servers: vec![info(ServerType::Play, 1, "play-1", mesh_port)],
    });
    let server = PlayServer::start(options, room_registry(), system)
        .await
        .expect("play server starts");
    server.create_stage("room", 11, Payload::Empty).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", ws_port))
        .await
        .expect("websocket connects");

    // Authenticate; WS frames omit the length prefix.
    let auth = Packet::request(
        "AuthenticateRequest",
        1,
        11,
        Payload::from(b"acc-ws".to_vec()),
    );
    ws.send(Message::Binary(encode_request(&auth, false).unwrap()))
        .await
        .unwrap();
    let frame = match ws.next().await {
        Some(Ok(Message::Binary(frame))) => frame,
        other => panic!("expected a binary auth reply, got {:?}", other),
    };
    let (reply, _) = decode_response(frame).expect("decodes");
    assert_eq!(reply.msg_id, "AuthReply");
    assert_eq!(reply.error_code, 0);

    // Echo.
    let echo = Packet::request("EchoRequest", 2, 11, Payload::from(vec![5u8; 32]));
    ws.send(Message::Binary(encode_request(&echo, false).unwrap()))
        .await
        .unwrap();
    let frame = match ws.next().await {
        Some(Ok(Message::Binary(frame))) => frame,
        other => panic!("expected a binary echo reply, got {:?}", other),
    };
    let (reply, original_size) = decode_response(frame).expect("decodes");
    assert_eq!(reply.msg_id, "EchoReply");
    assert_eq!(reply.msg_seq, 2);
    assert_eq!(original_size, 0);
    assert_eq!(reply.payload.as_slice(), &[5u8; 32][..]);

    ws.close(None).await.ok();
    server.shutdown().await;
}

#[tokio::test]
async fn websocket_rejects_unknown_paths() {
    init_logs();
    let mesh_port = open_port();
    let ws_port = open_port();
    let options = ServerOptions::play("play-1")
        .with_bind_endpoint(format!("tcp://127.0.0.1:{}", mesh_port))
        .with_ws_port(ws_port, "/ws")
        .with_resolver_period_ms(200);
    let system = Arc::new(StaticMesh {
        servers: vec![info(ServerType::Play, 1, "play-1", mesh_port)],
    });
    let server = PlayServer::start(options, room_registry(), system)
        .await
        .expect("play server starts");

    let refused = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/nope", ws_port)).await;
    assert!(refused.is_err(), "handshake on a wrong path must fail");

    server.shutdown().await;
}
