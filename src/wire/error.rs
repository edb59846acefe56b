// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! This module defines the wire error code table and the codec error type.

use num_derive::{FromPrimitive, ToPrimitive};
use thiserror::Error;

/// The error codes carried on the wire, shared by the mesh and the client
/// boundary. `Success` is zero; everything else is a failure a caller can
/// observe in a reply packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u16)]
pub enum ErrorCode {
    /// The operation succeeded.
    Success = 0,
    /// Peer unreachable, or cancellation of pending requests.
    ConnectionClosed = 1,
    /// Could not establish a mesh edge.
    ConnectionFailed = 2,
    /// Header or payload serialization failed.
    EncodeFailed = 3,
    /// Bad frame on receive.
    DecodeFailed = 4,
    /// Request exceeded its deadline.
    RequestTimeout = 5,
    /// Frame violated protocol invariants.
    InvalidResponse = 6,
    /// No stage matching the stage id.
    StageNotFound = 7,
    /// No handler for the msg id.
    HandlerNotFound = 8,
    /// Pre-auth message other than the authenticate request.
    Unauthorized = 9,
    /// Ring buffer or pool cap exceeded.
    BufferOverflow = 10,
    /// Peer marked `Disabled`.
    Disabled = 11,
}

impl ErrorCode {
    /// Map an on-wire `u16` back to a known code, `InvalidResponse` otherwise.
    pub fn from_wire(code: u16) -> Self {
        num_traits::FromPrimitive::from_u16(code).unwrap_or(ErrorCode::InvalidResponse)
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> u16 {
        code as u16
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid msg id length: {0}")]
    InvalidMsgIdLen(usize),
    #[error("Declared size {0} exceeds the body limit of {1} bytes")]
    BodyTooLarge(usize, usize),
    #[error("Frame is truncated: needed {needed} bytes, had {had}")]
    Truncated { needed: usize, had: usize },
    #[error("Negative size field in frame")]
    NegativeSize,
    #[error("Frame field is not valid UTF-8")]
    BadUtf8,
    #[error("Unknown server type: {0}")]
    UnknownServerType(u8),
    #[error("Failed to decompress the payload: {0}")]
    BadCompression(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for code in 0u16..=11 {
            assert_eq!(u16::from(ErrorCode::from_wire(code)), code);
        }
        assert_eq!(ErrorCode::from_wire(999), ErrorCode::InvalidResponse);
    }
}
