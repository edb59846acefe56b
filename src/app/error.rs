// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Server-side error types. Everything that crosses a process boundary is
//! expressed as a wire [`ErrorCode`](crate::wire::ErrorCode); these types
//! cover the in-process seams.

use crate::wire::ErrorCode;
use thiserror::Error;

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("No connection to server {0}")]
    NotConnected(String),
    #[error("Failed to connect to {0}: {1}")]
    Connect(String, String),
    #[error("Send queue to server {0} is full")]
    BufferFull(String),
    #[error("Failed to encode the mesh frame: {0}")]
    Encode(#[from] crate::wire::CodecError),
    #[error("No running server for service group ({0:?}, {1})")]
    NoCandidate(crate::wire::ServerType, u16),
    #[error("Server {0} is disabled")]
    Disabled(String),
}

impl MeshError {
    /// The wire code a caller sees for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            MeshError::NotConnected(_) | MeshError::NoCandidate(_, _) => ErrorCode::ConnectionClosed,
            MeshError::Connect(_, _) => ErrorCode::ConnectionFailed,
            MeshError::BufferFull(_) => ErrorCode::BufferOverflow,
            MeshError::Encode(_) => ErrorCode::EncodeFailed,
            MeshError::Disabled(_) => ErrorCode::Disabled,
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Stage {0} is gone")]
    Gone(i64),
    #[error("Stage {0} has no game loop configuration")]
    GameLoopMissing(i64),
    #[error("Game loop for stage {0} is already running")]
    GameLoopRunning(i64),
    #[error("No registered stage type {0:?}")]
    UnknownStageType(String),
    #[error("Reply target is missing: the triggering packet was fire-and-forget")]
    NoReplyTarget,
    #[error(transparent)]
    Mesh(#[from] MeshError),
}
