// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The inter-server message envelope and the mesh membership records.

use super::{
    error::ErrorCode,
    packet::{Packet, TIMEOUT_MSG_ID},
    payload::Payload,
};
use serde::{Deserialize, Serialize};

/// The role of a server process in the mesh.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerType {
    /// Stateful; hosts stages.
    Play,
    /// Stateless request handlers.
    Api,
}

impl ServerType {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            ServerType::Play => 0,
            ServerType::Api => 1,
        }
    }

    pub(crate) fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ServerType::Play),
            1 => Some(ServerType::Api),
            _ => None,
        }
    }
}

/// Whether a server currently takes traffic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerState {
    /// Eligible for selection and routing.
    Running,
    /// Draining; edges to it are torn down.
    Disabled,
}

/// The routing metadata of a [`RoutePacket`].
#[derive(Clone, Debug, PartialEq)]
pub struct RouteHeader {
    /// Request correlation; zero for fire-and-forget.
    pub msg_seq: u16,
    /// The service group of the sender.
    pub service_id: u16,
    /// The role of the sender.
    pub server_type: ServerType,
    /// The message identifier.
    pub msg_id: String,
    /// The sender id. Rewritten on receive with the socket-supplied identity;
    /// empty for packets originating from a local client session.
    pub from: String,
    /// The target stage, or zero.
    pub stage_id: i64,
    /// The originating account, empty if unauthenticated.
    pub account_id: String,
    /// The originating client session, or zero.
    pub sid: u64,
    /// Zero on success.
    pub error_code: u16,
    /// Whether this packet answers an earlier request.
    pub is_reply: bool,
}

impl Default for RouteHeader {
    fn default() -> Self {
        Self {
            msg_seq: 0,
            service_id: 0,
            server_type: ServerType::Play,
            msg_id: String::new(),
            from: String::new(),
            stage_id: 0,
            account_id: String::new(),
            sid: 0,
            error_code: 0,
            is_reply: false,
        }
    }
}

impl RouteHeader {
    /// Build the reply envelope for this header, carrying the same
    /// correlation seq back toward the sender.
    pub fn reply(&self, error_code: ErrorCode) -> RouteHeader {
        RouteHeader {
            msg_seq: self.msg_seq,
            service_id: self.service_id,
            server_type: self.server_type,
            msg_id: self.msg_id.clone(),
            from: String::new(),
            stage_id: self.stage_id,
            account_id: self.account_id.clone(),
            sid: self.sid,
            error_code: error_code.into(),
            is_reply: true,
        }
    }
}

/// The inter-server message envelope.
#[derive(Debug, Default)]
pub struct RoutePacket {
    /// Routing metadata.
    pub header: RouteHeader,
    /// The opaque body. Single-owner; see [`Payload`].
    pub payload: Payload,
}

impl RoutePacket {
    /// Wrap a header and payload.
    pub fn new(header: RouteHeader, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// The reply synthesized when a request passes its deadline.
    pub fn timeout(msg_seq: u16) -> Self {
        Self {
            header: RouteHeader {
                msg_seq,
                msg_id: TIMEOUT_MSG_ID.to_string(),
                error_code: ErrorCode::RequestTimeout.into(),
                is_reply: true,
                ..Default::default()
            },
            payload: Payload::Empty,
        }
    }

    /// The reply synthesized when a request can no longer be answered
    /// (connection drop, shutdown). Keeps the original msg id.
    pub fn canceled(msg_seq: u16, msg_id: &str, code: ErrorCode) -> Self {
        Self {
            header: RouteHeader {
                msg_seq,
                msg_id: msg_id.to_string(),
                error_code: code.into(),
                is_reply: true,
                ..Default::default()
            },
            payload: Payload::Empty,
        }
    }

    /// Flatten into a client-facing packet, moving the payload.
    pub fn into_packet(mut self) -> Packet {
        Packet {
            msg_id: std::mem::take(&mut self.header.msg_id),
            msg_seq: self.header.msg_seq,
            stage_id: self.header.stage_id,
            error_code: self.header.error_code,
            payload: self.payload.take(),
        }
    }
}
