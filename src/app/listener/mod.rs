// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The client TCP transport: one accept loop, then one receive loop and one
//! send loop per session. The receive path runs bytes through the session's
//! ring buffer and extracts length-prefixed frames; a frame that does not
//! decode, or a write the ring refuses, closes the connection.

use crate::{
    app::{
        session::{ingest, EchoMode, SendCmd, SessionShared, TransportKind},
        ServerCore,
    },
    wire::{
        decode_request, encode_response, give_back, rent, RingBuffer, DEBUG_MSG_ID, MAX_BODY_SIZE,
        MAX_FRAME_OVERHEAD,
    },
};
use std::{convert::TryInto, sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
};

/// Accept client connections until the server shuts down.
pub(crate) async fn run_accept(core: Arc<ServerCore>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::debug!("Client connected from {}", peer);
                let core = core.clone();
                tokio::spawn(run_session(core, stream));
            }
            Err(e) => {
                log::warn!("Client accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn run_session(core: Arc<ServerCore>, stream: TcpStream) {
    stream.set_nodelay(true).ok();
    let (shared, out_tx, out_rx) = core.sessions.open(TransportKind::Tcp);
    let sid = shared.sid;
    let (read_half, write_half) = stream.into_split();
    let writer = tokio::spawn(run_send(write_half, out_rx));
    run_receive(&core, &shared, &out_tx, read_half).await;
    core.sessions.close(sid);
    writer.await.ok();
    log::debug!("Session {} closed", sid);
}

async fn run_send(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<SendCmd>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            SendCmd::Frame(buffer) => {
                if write_half.write_all(&buffer).await.is_err() {
                    break;
                }
                give_back(buffer);
            }
            SendCmd::Close => break,
        }
    }
    write_half.shutdown().await.ok();
}

async fn run_receive(
    core: &Arc<ServerCore>,
    shared: &Arc<SessionShared>,
    out_tx: &mpsc::UnboundedSender<SendCmd>,
    mut read_half: OwnedReadHalf,
) {
    let mut ring = RingBuffer::new(core.options.session_buffer_size);
    let mut chunk = vec![0u8; 16 * 1024];
    let idle = Duration::from_millis(core.options.connection_idle_timeout_ms);
    let mut echo = EchoMode::None;
    'session: loop {
        let read = match tokio::time::timeout(idle, read_half.read(&mut chunk)).await {
            Err(_) => {
                log::info!("Session {} idle for {:?}; closing", shared.sid, idle);
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                log::debug!("Session {} read failed: {}", shared.sid, e);
                break;
            }
        };
        if !ring.write(&chunk[..read]) {
            log::warn!("Session {} overflowed its receive buffer; closing", shared.sid);
            break;
        }
        // Extract every complete frame the ring now holds.
        loop {
            if ring.count() < 4 {
                break;
            }
            let mut size = [0u8; 4];
            ring.peek(0, &mut size);
            let content = i32::from_le_bytes(size[..].try_into().expect("four bytes"));
            if content <= 0 || content as usize > MAX_BODY_SIZE + MAX_FRAME_OVERHEAD {
                log::warn!("Session {} framed {} bytes; closing", shared.sid, content);
                break 'session;
            }
            let content = content as usize;
            if content + 4 > ring.capacity() {
                log::warn!(
                    "Session {} framed {} bytes against a {} byte buffer; closing",
                    shared.sid,
                    content,
                    ring.capacity()
                );
                break 'session;
            }
            if ring.count() < 4 + content {
                break;
            }
            ring.consume(4);
            let mut frame = rent(content);
            frame.resize(content, 0);
            ring.read(&mut frame);
            if echo == EchoMode::Raw {
                let mut out = rent(4 + content);
                out.extend_from_slice(&(content as i32).to_le_bytes());
                out.extend_from_slice(&frame);
                out_tx.send(SendCmd::Frame(out)).ok();
                give_back(frame);
                continue;
            }
            // The decoder consumes the rented buffer; the payload rides on
            // in it as a pooled payload.
            let packet = match decode_request(frame) {
                Ok(packet) => packet,
                Err(e) => {
                    log::warn!("Session {} sent a bad frame: {}; closing", shared.sid, e);
                    break 'session;
                }
            };
            if packet.msg_id == DEBUG_MSG_ID {
                if core.options.debug_echo {
                    echo = EchoMode::from_control(packet.payload.as_slice());
                    log::info!("Session {} echo mode: {:?}", shared.sid, echo);
                }
                continue;
            }
            if echo == EchoMode::Parsed {
                match encode_response(&packet, core.options.compression_threshold, true) {
                    Ok(out) => {
                        out_tx.send(SendCmd::Frame(out)).ok();
                    }
                    Err(e) => log::warn!("Session {} parsed-echo encode failed: {}", shared.sid, e),
                }
                continue;
            }
            if let Err(code) = ingest(core, shared, packet) {
                log::warn!("Session {} closed: {:?}", shared.sid, code);
                break 'session;
            }
        }
    }
}
