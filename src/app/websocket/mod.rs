// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The client WebSocket transport. Frames are binary and self-delimited, so
//! the payload layout matches TCP minus the length prefix; tungstenite
//! reassembles fragmented frames before we ever see them.

use crate::{
    app::{
        session::{ingest, EchoMode, SendCmd, SessionShared, TransportKind},
        ServerCore,
    },
    wire::{decode_request, encode_response, DEBUG_MSG_ID, MAX_BODY_SIZE, MAX_FRAME_OVERHEAD},
};
use futures::{SinkExt, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        Message,
    },
    WebSocketStream,
};

/// Accept WebSocket clients until the server shuts down.
pub(crate) async fn run_accept(core: Arc<ServerCore>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("WebSocket client connecting from {}", peer);
                let core = core.clone();
                tokio::spawn(async move {
                    let path = core.options.web_socket_path.clone();
                    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                        if request.uri().path() == path {
                            Ok(response)
                        } else {
                            Err(ErrorResponse::new(Some("unknown path".to_string())))
                        }
                    };
                    match accept_hdr_async(stream, check_path).await {
                        Ok(ws) => run_session(core, ws).await,
                        Err(e) => log::debug!("WebSocket handshake from {} failed: {}", peer, e),
                    }
                });
            }
            Err(e) => {
                log::warn!("WebSocket accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn run_session(core: Arc<ServerCore>, ws: WebSocketStream<TcpStream>) {
    let (shared, out_tx, out_rx) = core.sessions.open(TransportKind::WebSocket);
    let sid = shared.sid;
    let (ws_tx, ws_rx) = ws.split();
    let writer = tokio::spawn(run_send(ws_tx, out_rx));
    run_receive(&core, &shared, &out_tx, ws_rx).await;
    core.sessions.close(sid);
    writer.await.ok();
    log::debug!("WebSocket session {} closed", sid);
}

async fn run_send(
    mut ws_tx: futures::stream::SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<SendCmd>,
) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SendCmd::Frame(buffer) => {
                if ws_tx.send(Message::Binary(buffer)).await.is_err() {
                    break;
                }
            }
            SendCmd::Close => {
                ws_tx.send(Message::Close(None)).await.ok();
                break;
            }
        }
    }
}

async fn run_receive(
    core: &Arc<ServerCore>,
    shared: &Arc<SessionShared>,
    out_tx: &mpsc::UnboundedSender<SendCmd>,
    mut ws_rx: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
) {
    let idle = Duration::from_millis(core.options.connection_idle_timeout_ms);
    let mut echo = EchoMode::None;
    loop {
        let message = match tokio::time::timeout(idle, ws_rx.next()).await {
            Err(_) => {
                log::info!("WebSocket session {} idle for {:?}; closing", shared.sid, idle);
                break;
            }
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                log::debug!("WebSocket session {} read failed: {}", shared.sid, e);
                break;
            }
            Ok(None) => break,
        };
        let data = match message {
            Message::Binary(data) => data,
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; text has no place here.
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Text(_) => {
                log::warn!("WebSocket session {} sent text; closing", shared.sid);
                break;
            }
        };
        if data.len() > MAX_BODY_SIZE + MAX_FRAME_OVERHEAD {
            log::warn!("WebSocket session {} framed {} bytes; closing", shared.sid, data.len());
            break;
        }
        if echo == EchoMode::Raw {
            out_tx.send(SendCmd::Frame(data)).ok();
            continue;
        }
        let packet = match decode_request(data) {
            Ok(packet) => packet,
            Err(e) => {
                log::warn!("WebSocket session {} sent a bad frame: {}; closing", shared.sid, e);
                break;
            }
        };
        if packet.msg_id == DEBUG_MSG_ID {
            if core.options.debug_echo {
                echo = EchoMode::from_control(packet.payload.as_slice());
                log::info!("WebSocket session {} echo mode: {:?}", shared.sid, echo);
            }
            continue;
        }
        if echo == EchoMode::Parsed {
            match encode_response(&packet, core.options.compression_threshold, false) {
                Ok(out) => {
                    out_tx.send(SendCmd::Frame(out)).ok();
                }
                Err(e) => log::warn!("WebSocket session {} parsed-echo encode failed: {}", shared.sid, e),
            }
            continue;
        }
        if let Err(code) = ingest(core, shared, packet) {
            log::warn!("WebSocket session {} closed: {:?}", shared.sid, code);
            break;
        }
    }
}
