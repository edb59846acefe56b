// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Per-client session state.
//!
//! A session is one live client connection: a monotone id, an auth gate, a
//! single-reader send queue and a receive path owned by its transport task
//! (TCP in `listener`, WebSocket in `websocket`). Until authenticated, only
//! the configured authenticate msg id and the heartbeat are accepted.

use crate::{
    app::{metrics::Metrics, DispatchEvent, ServerCore},
    wire::{encode_response, ErrorCode, Packet, Payload, RouteHeader, RoutePacket, HEARTBEAT_MSG_ID},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

/// Which transport a session arrived on; decides response framing.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum TransportKind {
    /// Length-prefixed frames.
    Tcp,
    /// Self-delimited binary frames.
    WebSocket,
}

/// A command for a session's send loop.
#[derive(Debug)]
pub(crate) enum SendCmd {
    /// Write this pre-encoded frame.
    Frame(Vec<u8>),
    /// Stop writing and close the connection.
    Close,
}

/// The session state shared between its transport task and the rest of the
/// server.
pub(crate) struct SessionShared {
    pub(crate) sid: u64,
    pub(crate) transport: TransportKind,
    pub(crate) authenticated: AtomicBool,
    pub(crate) account_id: Mutex<String>,
    pub(crate) stage_id: AtomicI64,
}

impl SessionShared {
    pub(crate) fn account(&self) -> String {
        self.account_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

struct SessionHandle {
    shared: Arc<SessionShared>,
    tx: mpsc::UnboundedSender<SendCmd>,
}

/// Every live session, keyed by sid.
pub(crate) struct SessionRegistry {
    next_sid: AtomicU64,
    metrics: Arc<Metrics>,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
}

impl SessionRegistry {
    pub(crate) fn new(metrics: Arc<Metrics>, dispatch_tx: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        Self {
            next_sid: AtomicU64::new(1),
            metrics,
            dispatch_tx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Register a fresh session and hand back its shared state plus both
    /// ends of its send queue (the sender is what echo modes write to).
    pub(crate) fn open(
        &self,
        transport: TransportKind,
    ) -> (
        Arc<SessionShared>,
        mpsc::UnboundedSender<SendCmd>,
        mpsc::UnboundedReceiver<SendCmd>,
    ) {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(SessionShared {
            sid,
            transport,
            authenticated: AtomicBool::new(false),
            account_id: Mutex::new(String::new()),
            stage_id: AtomicI64::new(0),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).insert(
            sid,
            SessionHandle {
                shared: shared.clone(),
                tx: tx.clone(),
            },
        );
        Metrics::incr(&self.metrics.sessions_opened);
        (shared, tx, rx)
    }

    /// Tear a session down and tell the dispatcher, so the actor's stage
    /// observes the disconnect and the session's requests get cancelled.
    pub(crate) fn close(&self, sid: u64) {
        let removed = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(&sid);
        if let Some(handle) = removed {
            Metrics::incr(&self.metrics.sessions_closed);
            handle.tx.send(SendCmd::Close).ok();
            self.dispatch_tx
                .send(DispatchEvent::SessionClosed {
                    sid,
                    account_id: handle.shared.account(),
                    stage_id: handle.shared.stage_id.load(Ordering::Relaxed),
                })
                .ok();
        }
    }

    /// Bind an authenticated account to a session.
    pub(crate) fn bind(&self, sid: u64, account_id: &str, stage_id: i64) {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = sessions.get(&sid) {
            handle.shared.authenticated.store(true, Ordering::Relaxed);
            *handle.shared.account_id.lock().unwrap_or_else(|e| e.into_inner()) = account_id.to_string();
            handle.shared.stage_id.store(stage_id, Ordering::Relaxed);
        }
    }

    /// Encode `packet` for the session's transport and queue it. Returns
    /// false when the session is gone.
    pub(crate) fn send_packet(&self, sid: u64, packet: Packet, compression_threshold: usize) -> bool {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        let handle = match sessions.get(&sid) {
            Some(handle) => handle,
            None => return false,
        };
        let with_prefix = handle.shared.transport == TransportKind::Tcp;
        match encode_response(&packet, compression_threshold, with_prefix) {
            Ok(frame) => handle.tx.send(SendCmd::Frame(frame)).is_ok(),
            Err(e) => {
                log::error!("Failed to encode a reply for session {}: {}", sid, e);
                false
            }
        }
    }

    /// Live session count.
    pub(crate) fn count(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Gate and forward one decoded client packet. Heartbeats are absorbed here;
/// an error means the connection must close with that code.
pub(crate) fn ingest(core: &Arc<ServerCore>, shared: &SessionShared, packet: Packet) -> Result<(), ErrorCode> {
    if packet.msg_id == HEARTBEAT_MSG_ID {
        // Keepalive: the bytes already reset the idle deadline; no reply.
        return Ok(());
    }
    Metrics::incr(&core.metrics.frames_decoded);
    let authenticated = shared.authenticated.load(Ordering::Relaxed);
    if !authenticated && packet.msg_id != core.options.authenticate_message_id {
        log::warn!(
            "Session {} sent {} before authenticating",
            shared.sid,
            packet.msg_id
        );
        reject(core, shared, &packet, ErrorCode::Unauthorized);
        return Err(ErrorCode::Unauthorized);
    }
    if packet.is_reserved() && packet.msg_id != core.options.authenticate_message_id {
        // Framework msg ids never come from clients.
        reject(core, shared, &packet, ErrorCode::Unauthorized);
        return Err(ErrorCode::Unauthorized);
    }
    let stage_id = if packet.stage_id != 0 {
        packet.stage_id
    } else {
        shared.stage_id.load(Ordering::Relaxed)
    };
    let mut packet = packet;
    let header = RouteHeader {
        msg_seq: packet.msg_seq,
        service_id: core.options.service_id,
        server_type: core.options.server_type,
        msg_id: std::mem::take(&mut packet.msg_id),
        from: String::new(),
        stage_id,
        account_id: shared.account(),
        sid: shared.sid,
        error_code: 0,
        is_reply: false,
    };
    core.sessions
        .dispatch_tx
        .send(DispatchEvent::Route(RoutePacket::new(header, packet.payload.take())))
        .map_err(|_| ErrorCode::ConnectionClosed)?;
    Ok(())
}

/// Answer a refused request with its error code; the close follows, so the
/// client sees why before the socket goes away.
fn reject(core: &Arc<ServerCore>, shared: &SessionShared, packet: &Packet, code: ErrorCode) {
    if packet.msg_seq == 0 {
        return;
    }
    let reply = Packet {
        msg_id: packet.msg_id.clone(),
        msg_seq: packet.msg_seq,
        stage_id: packet.stage_id,
        error_code: code.into(),
        payload: Payload::Empty,
    };
    core.sessions
        .send_packet(shared.sid, reply, core.options.compression_threshold);
}

/// The per-session diagnostic echo mode, selectable through `@Debug@` when
/// the server allows it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum EchoMode {
    /// Normal dispatch.
    None,
    /// Write received frames back verbatim, skipping the decoder.
    Raw,
    /// Decode, re-encode as a response, write back.
    Parsed,
}

impl EchoMode {
    /// Interpret a `@Debug@` control payload.
    pub(crate) fn from_control(payload: &[u8]) -> Self {
        match payload.first() {
            Some(1) => EchoMode::Raw,
            Some(2) => EchoMode::Parsed,
            _ => EchoMode::None,
        }
    }
}
