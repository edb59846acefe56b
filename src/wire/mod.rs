// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The wire protocol layer: client and mesh framing, payload containers,
//! buffer pooling and LZ4 payload compression.

pub(crate) mod compression;
mod decoder;
mod encoder;
mod error;
mod packet;
mod payload;
mod pool;
mod ring;
mod route;

pub use compression::{Compression, Lz4, Uncompressed, COMPRESSION_THRESHOLD};
pub use decoder::{decode_request, decode_response, decode_route};
pub use encoder::{encode_request, encode_response, encode_route};
pub use error::{CodecError, ErrorCode};
pub use packet::{
    Packet, CREATE_STAGE_MSG_ID, DEBUG_MSG_ID, DESTROY_STAGE_MSG_ID, HEARTBEAT_MSG_ID,
    MAX_BODY_SIZE, MAX_MSG_ID_LEN, TIMEOUT_MSG_ID,
};
pub(crate) use packet::MAX_FRAME_OVERHEAD;
pub use payload::{Payload, PooledBuf, SharedView};
pub use pool::{give_back, rent, trim_idle, PoolStats};
pub use ring::RingBuffer;
pub use route::{RouteHeader, RoutePacket, ServerState, ServerType};
