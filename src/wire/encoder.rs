// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the frame encoders.
//!
//! Client frames are length-prefixed on TCP and bare on WebSocket (WS frames
//! are self-delimited). All integers are little-endian.
//!
//! Client request: `[ContentSize:i32]? [MsgIdLen:u8][MsgId][MsgSeq:u16][StageId:i64][Payload]`
//!
//! Client response: the request layout plus `[ErrorCode:u16][OriginalSize:i32]`
//! between `StageId` and the payload. A nonzero `OriginalSize` marks an
//! LZ4-compressed payload.
//!
//! Mesh frame: `[FrameSize:i32][HeaderSize:i32][HeaderBytes][PayloadBytes]`.

use super::{
    compression::maybe_compress,
    error::CodecError,
    packet::{Packet, MAX_BODY_SIZE, MAX_MSG_ID_LEN},
    pool,
    route::RoutePacket,
};

fn check_msg_id(msg_id: &str) -> Result<(), CodecError> {
    if msg_id.is_empty() || msg_id.len() > MAX_MSG_ID_LEN {
        return Err(CodecError::InvalidMsgIdLen(msg_id.len()));
    }
    Ok(())
}

fn check_body(len: usize) -> Result<(), CodecError> {
    if len > MAX_BODY_SIZE {
        return Err(CodecError::BodyTooLarge(len, MAX_BODY_SIZE));
    }
    Ok(())
}

fn put_common(buffer: &mut Vec<u8>, packet: &Packet) {
    buffer.push(packet.msg_id.len() as u8);
    buffer.extend_from_slice(packet.msg_id.as_bytes());
    buffer.extend_from_slice(&packet.msg_seq.to_le_bytes());
    buffer.extend_from_slice(&packet.stage_id.to_le_bytes());
}

/// Encode a client request frame. `with_size_prefix` is true on TCP.
pub fn encode_request(packet: &Packet, with_size_prefix: bool) -> Result<Vec<u8>, CodecError> {
    check_msg_id(&packet.msg_id)?;
    check_body(packet.payload.len())?;
    let content = 1 + packet.msg_id.len() + 2 + 8 + packet.payload.len();
    let mut buffer = pool::rent(content + 4);
    if with_size_prefix {
        buffer.extend_from_slice(&(content as i32).to_le_bytes());
    }
    put_common(&mut buffer, packet);
    buffer.extend_from_slice(packet.payload.as_slice());
    Ok(buffer)
}

/// Encode a server response frame, compressing the payload when it clears
/// `compression_threshold` and actually shrinks. The returned buffer is
/// rented from the pool; give it back once written.
pub fn encode_response(
    packet: &Packet,
    compression_threshold: usize,
    with_size_prefix: bool,
) -> Result<Vec<u8>, CodecError> {
    check_msg_id(&packet.msg_id)?;
    check_body(packet.payload.len())?;
    let body = packet.payload.as_slice();
    let compressed = maybe_compress(body, compression_threshold);
    let (original_size, body): (i32, &[u8]) = match compressed.as_deref() {
        Some(smaller) => (body.len() as i32, smaller),
        None => (0, body),
    };
    let content = 1 + packet.msg_id.len() + 2 + 8 + 2 + 4 + body.len();
    let mut buffer = pool::rent(content + 4);
    if with_size_prefix {
        buffer.extend_from_slice(&(content as i32).to_le_bytes());
    }
    put_common(&mut buffer, packet);
    buffer.extend_from_slice(&packet.error_code.to_le_bytes());
    buffer.extend_from_slice(&original_size.to_le_bytes());
    buffer.extend_from_slice(body);
    Ok(buffer)
}

/// Encode a mesh frame. The sender identity travels in the connection's
/// identity handshake, never in the header, so `header.from` is not trusted
/// on the receiving side.
pub fn encode_route(packet: &RoutePacket) -> Result<Vec<u8>, CodecError> {
    let header = &packet.header;
    check_msg_id(&header.msg_id)?;
    check_body(packet.payload.len())?;
    if header.from.len() > MAX_MSG_ID_LEN || header.account_id.len() > MAX_MSG_ID_LEN {
        return Err(CodecError::InvalidMsgIdLen(header.from.len().max(header.account_id.len())));
    }
    let header_size = 2 + 2 + 1 + 1 + 2 + 8 + 8
        + 1 + header.msg_id.len()
        + 1 + header.from.len()
        + 1 + header.account_id.len();
    let frame_size = 4 + header_size + packet.payload.len();
    let mut buffer = pool::rent(frame_size + 4);
    buffer.extend_from_slice(&(frame_size as i32).to_le_bytes());
    buffer.extend_from_slice(&(header_size as i32).to_le_bytes());
    buffer.extend_from_slice(&header.msg_seq.to_le_bytes());
    buffer.extend_from_slice(&header.service_id.to_le_bytes());
    buffer.push(header.server_type.to_wire());
    buffer.push(header.is_reply as u8);
    buffer.extend_from_slice(&header.error_code.to_le_bytes());
    buffer.extend_from_slice(&header.stage_id.to_le_bytes());
    buffer.extend_from_slice(&header.sid.to_le_bytes());
    for field in &[&header.msg_id, &header.from, &header.account_id] {
        buffer.push(field.len() as u8);
        buffer.extend_from_slice(field.as_bytes());
    }
    buffer.extend_from_slice(packet.payload.as_slice());
    Ok(buffer)
}
