// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module implements the frame decoders. See the encoder module for the
//! frame layouts. Every length field is validated before use; a frame whose
//! declared sizes overrun the buffer fails with a codec error, and the
//! session layer closes the connection on the first offense.
//!
//! Decoders consume the receive buffer they are handed. The payload bytes are
//! never copied out: the header prefix is drained in place and the (usually
//! pool-rented) buffer travels on as the packet's pooled payload, which is
//! what keeps the receive -> dispatcher -> stage path allocation-free.

use super::{
    compression::{Compression, Lz4},
    error::CodecError,
    packet::{Packet, MAX_BODY_SIZE, MAX_FRAME_OVERHEAD},
    payload::Payload,
    pool,
    route::{RouteHeader, RoutePacket, ServerType},
};
use std::convert::TryInto;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn need(&self, n: usize) -> Result<(), CodecError> {
        if self.pos + n > self.buf.len() {
            return Err(CodecError::Truncated {
                needed: self.pos + n,
                had: self.buf.len(),
            });
        }
        Ok(())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.need(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.bytes(4)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.bytes(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let len = self.u8()? as usize;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::BadUtf8)
    }
}

fn msg_id(reader: &mut Reader<'_>) -> Result<String, CodecError> {
    let len = reader.buf.get(reader.pos).copied().unwrap_or(0) as usize;
    if len == 0 {
        return Err(CodecError::InvalidMsgIdLen(0));
    }
    reader.string()
}

/// Shift the parsed header prefix out of the frame and keep the rest as the
/// payload, in the same buffer. Empty tails hand the buffer straight back.
fn tail_payload(mut frame: Vec<u8>, start: usize) -> Payload {
    if frame.len() <= start {
        pool::give_back(frame);
        return Payload::Empty;
    }
    frame.drain(..start);
    Payload::pooled(frame)
}

/// Decode a client request frame (without the `ContentSize` prefix),
/// consuming the buffer; the payload stays in it.
pub fn decode_request(frame: Vec<u8>) -> Result<Packet, CodecError> {
    if frame.len() > MAX_BODY_SIZE + MAX_FRAME_OVERHEAD {
        return Err(CodecError::BodyTooLarge(frame.len(), MAX_BODY_SIZE));
    }
    let (msg_id, msg_seq, stage_id, payload_start) = {
        let mut reader = Reader::new(&frame);
        let msg_id = msg_id(&mut reader)?;
        let msg_seq = reader.u16()?;
        let stage_id = reader.i64()?;
        (msg_id, msg_seq, stage_id, reader.pos)
    };
    Ok(Packet {
        msg_id,
        msg_seq,
        stage_id,
        error_code: 0,
        payload: tail_payload(frame, payload_start),
    })
}

/// Decode a server response frame (without the `ContentSize` prefix),
/// consuming the buffer and decompressing the payload when `OriginalSize` is
/// nonzero. Returns the packet and the on-wire `OriginalSize`.
pub fn decode_response(frame: Vec<u8>) -> Result<(Packet, i32), CodecError> {
    let (msg_id, msg_seq, stage_id, error_code, original_size, body_start) = {
        let mut reader = Reader::new(&frame);
        let msg_id = msg_id(&mut reader)?;
        let msg_seq = reader.u16()?;
        let stage_id = reader.i64()?;
        let error_code = reader.u16()?;
        let original_size = reader.i32()?;
        (msg_id, msg_seq, stage_id, error_code, original_size, reader.pos)
    };
    if original_size < 0 {
        return Err(CodecError::NegativeSize);
    }
    if original_size as usize > MAX_BODY_SIZE {
        return Err(CodecError::BodyTooLarge(original_size as usize, MAX_BODY_SIZE));
    }
    let payload = if original_size > 0 {
        let body = Lz4::decompress_body(&frame[body_start..], original_size as usize)?;
        pool::give_back(frame);
        Payload::from(body)
    } else {
        tail_payload(frame, body_start)
    };
    Ok((
        Packet {
            msg_id,
            msg_seq,
            stage_id,
            error_code,
            payload,
        },
        original_size,
    ))
}

/// Decode a mesh frame (without the outer `FrameSize` prefix), consuming the
/// buffer. The caller must overwrite `header.from` with the connection
/// identity afterwards.
pub fn decode_route(frame: Vec<u8>) -> Result<RoutePacket, CodecError> {
    let (header, payload_start) = {
        let mut reader = Reader::new(&frame);
        let header_size = reader.i32()?;
        if header_size < 0 {
            return Err(CodecError::NegativeSize);
        }
        let header_size = header_size as usize;
        if header_size > MAX_BODY_SIZE {
            return Err(CodecError::BodyTooLarge(header_size, MAX_BODY_SIZE));
        }
        let header_bytes = reader.bytes(header_size)?;
        let payload_len = frame.len() - reader.pos;
        if payload_len > MAX_BODY_SIZE {
            return Err(CodecError::BodyTooLarge(payload_len, MAX_BODY_SIZE));
        }

        let mut header = Reader::new(header_bytes);
        let msg_seq = header.u16()?;
        let service_id = header.u16()?;
        let server_type = header.u8()?;
        let server_type =
            ServerType::from_wire(server_type).ok_or(CodecError::UnknownServerType(server_type))?;
        let is_reply = header.u8()? != 0;
        let error_code = header.u16()?;
        let stage_id = header.i64()?;
        let sid = header.u64()?;
        let msg_id = msg_id(&mut header)?;
        let from = header.string()?;
        let account_id = header.string()?;
        (
            RouteHeader {
                msg_seq,
                service_id,
                server_type,
                msg_id,
                from,
                stage_id,
                account_id,
                sid,
                error_code,
                is_reply,
            },
            reader.pos,
        )
    };
    Ok(RoutePacket {
        header,
        payload: tail_payload(frame, payload_start),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{encode_request, encode_response, encode_route};

    #[test]
    fn request_round_trip_keeps_the_payload_in_the_buffer() {
        let packet = Packet::request("EchoRequest", 1, 42, Payload::from(vec![0u8; 64]));
        let frame = encode_request(&packet, true).unwrap();
        // Strip the TCP size prefix before decoding.
        let content = i32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(content, frame.len() - 4);
        let decoded = decode_request(frame[4..].to_vec()).unwrap();
        assert_eq!(decoded, packet);
        // The tail rides on as a pooled payload, not a fresh allocation.
        assert!(matches!(decoded.payload, Payload::Pooled(_)));
    }

    #[test]
    fn response_round_trip_uncompressed() {
        let packet = Packet {
            msg_id: "EchoReply".into(),
            msg_seq: 1,
            stage_id: 42,
            error_code: 0,
            payload: Payload::from(vec![0u8; 64]),
        };
        let frame = encode_response(&packet, 512, false).unwrap();
        let (decoded, original_size) = decode_response(frame).unwrap();
        assert_eq!(original_size, 0);
        assert_eq!(decoded, packet);
        assert!(matches!(decoded.payload, Payload::Pooled(_)));
    }

    #[test]
    fn response_round_trip_compressed() {
        let packet = Packet {
            msg_id: "EchoReply".into(),
            msg_seq: 2,
            stage_id: 42,
            error_code: 0,
            payload: Payload::from(vec![0xAA; 8192]),
        };
        let frame = encode_response(&packet, 512, false).unwrap();
        // The frame must be materially smaller than the body it carries.
        assert!(frame.len() < 8192);
        let (decoded, original_size) = decode_response(frame).unwrap();
        assert_eq!(original_size, 8192);
        assert_eq!(decoded, packet);
    }

    #[test]
    fn route_round_trip() {
        let packet = RoutePacket {
            header: RouteHeader {
                msg_seq: 7,
                service_id: 2,
                server_type: ServerType::Api,
                msg_id: "JoinRoom".into(),
                from: "play-1".into(),
                stage_id: 100,
                account_id: "acc-9".into(),
                sid: 33,
                error_code: 0,
                is_reply: false,
            },
            payload: Payload::from(vec![9u8; 16]),
        };
        let frame = encode_route(&packet).unwrap();
        let frame_size = i32::from_le_bytes(frame[..4].try_into().unwrap()) as usize;
        assert_eq!(frame_size, frame.len() - 4);
        let decoded = decode_route(frame[4..].to_vec()).unwrap();
        assert_eq!(decoded.header, packet.header);
        assert_eq!(decoded.payload, packet.payload);
        assert!(matches!(decoded.payload, Payload::Pooled(_)));
    }

    #[test]
    fn empty_tails_decode_as_empty_payloads() {
        let packet = Packet::request("Ping", 4, 1, Payload::Empty);
        let frame = encode_request(&packet, false).unwrap();
        let decoded = decode_request(frame).unwrap();
        assert!(matches!(decoded.payload, Payload::Empty));
    }

    #[test]
    fn empty_msg_id_is_rejected() {
        // MsgIdLen of zero, then a plausible tail.
        let frame = vec![0u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(matches!(
            decode_request(frame),
            Err(CodecError::InvalidMsgIdLen(0))
        ));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let packet = Packet::request("EchoRequest", 1, 42, Payload::Empty);
        let frame = encode_request(&packet, false).unwrap();
        assert!(decode_request(frame[..frame.len() - 4].to_vec()).is_err());
    }

    #[test]
    fn negative_original_size_is_rejected() {
        let packet = Packet {
            msg_id: "R".into(),
            msg_seq: 1,
            stage_id: 0,
            error_code: 0,
            payload: Payload::Empty,
        };
        let mut frame = encode_response(&packet, 512, false).unwrap();
        // OriginalSize sits after [len][id][seq][stage][err].
        let at = 1 + 1 + 2 + 8 + 2;
        frame[at..at + 4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(matches!(decode_response(frame), Err(CodecError::NegativeSize)));
    }

    #[test]
    fn fragmented_stream_reassembles_in_order() {
        use crate::wire::RingBuffer;
        let packets: Vec<Packet> = (1..=5)
            .map(|i| {
                Packet::request(
                    format!("Msg{}", i),
                    i as u16,
                    7,
                    Payload::from(vec![i as u8; 100 * i as usize]),
                )
            })
            .collect();
        let mut stream = Vec::new();
        for packet in &packets {
            stream.extend_from_slice(&encode_request(packet, true).unwrap());
        }
        // Feed the byte stream in 33-byte slivers, extracting frames the way
        // the session receive loop does.
        let mut ring = RingBuffer::new(4096);
        let mut decoded = Vec::new();
        for chunk in stream.chunks(33) {
            assert!(ring.write(chunk));
            loop {
                if ring.count() < 4 {
                    break;
                }
                let mut size = [0u8; 4];
                ring.peek(0, &mut size);
                let content = i32::from_le_bytes(size) as usize;
                if ring.count() < 4 + content {
                    break;
                }
                ring.consume(4);
                let mut frame = vec![0u8; content];
                ring.read(&mut frame);
                decoded.push(decode_request(frame).unwrap());
            }
        }
        assert_eq!(decoded, packets);
    }

    #[test]
    fn body_at_the_limit_is_accepted() {
        let packet = Packet::new("Blob", Payload::from(vec![1u8; MAX_BODY_SIZE]));
        let frame = encode_request(&packet, false).unwrap();
        assert!(decode_request(frame).is_ok());
        let over = Packet::new("Blob", Payload::from(vec![1u8; MAX_BODY_SIZE + 1]));
        assert!(matches!(
            encode_request(&over, true),
            Err(CodecError::BodyTooLarge(_, _))
        ));
    }
}
