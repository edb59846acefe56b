// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The client-facing packet value and the reserved msg ids.

use super::payload::Payload;

/// Maximum frame body accepted on decode (and enforced on encode).
pub const MAX_BODY_SIZE: usize = 2 * 1024 * 1024;
/// Maximum msg id length; its length is framed as a single byte.
pub const MAX_MSG_ID_LEN: usize = 255;
/// Worst-case framing bytes around a payload, so a payload of exactly
/// `MAX_BODY_SIZE` still fits its frame.
pub(crate) const MAX_FRAME_OVERHEAD: usize = 1 + MAX_MSG_ID_LEN + 2 + 8 + 2 + 4;

/// The idle keepalive msg id. Zero payload, never answered.
pub const HEARTBEAT_MSG_ID: &str = "@Heart@Beat@";
/// The diagnostic echo-mode control msg id.
pub const DEBUG_MSG_ID: &str = "@Debug@";
/// The msg id of replies synthesized for timed-out requests.
pub const TIMEOUT_MSG_ID: &str = "@Timeout@";
/// The mesh-internal create-stage msg id. Never accepted from a client.
pub const CREATE_STAGE_MSG_ID: &str = "@Create@Stage@";
/// The mesh-internal destroy-stage msg id. Never accepted from a client.
pub const DESTROY_STAGE_MSG_ID: &str = "@Destroy@Stage@";

/// A message crossing the client boundary.
#[derive(Debug, Default, PartialEq)]
pub struct Packet {
    /// The message identifier, 1..=255 UTF-8 bytes.
    pub msg_id: String,
    /// Zero for fire-and-forget, nonzero for a request expecting a reply.
    pub msg_seq: u16,
    /// The target stage, or zero when not bound to a stage.
    pub stage_id: i64,
    /// Zero on success; responses only.
    pub error_code: u16,
    /// The opaque body.
    pub payload: Payload,
}

impl Packet {
    /// A fire-and-forget packet.
    pub fn new(msg_id: impl Into<String>, payload: Payload) -> Self {
        Self {
            msg_id: msg_id.into(),
            payload,
            ..Default::default()
        }
    }

    /// A request packet expecting a reply correlated by `msg_seq`.
    pub fn request(msg_id: impl Into<String>, msg_seq: u16, stage_id: i64, payload: Payload) -> Self {
        Self {
            msg_id: msg_id.into(),
            msg_seq,
            stage_id,
            error_code: 0,
            payload,
        }
    }

    /// Whether the sender expects a reply.
    pub fn is_request(&self) -> bool {
        self.msg_seq != 0
    }

    /// Whether this packet carries a reserved (framework) msg id.
    pub fn is_reserved(&self) -> bool {
        self.msg_id.starts_with('@')
    }
}
