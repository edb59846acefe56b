// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The unit of stage work.

use crate::wire::RoutePacket;
use std::time::Duration;

/// One item in a worker mailbox. Everything a stage does arrives as one of
/// these, in FIFO order per stage.
#[derive(Debug)]
pub enum WorkItem {
    /// A routed message for an existing stage.
    Message(RoutePacket),
    /// Create the stage (or find it) and run its create hook.
    Create {
        /// The registered stage type to instantiate.
        stage_type: String,
        /// The triggering packet; its payload goes to the create hook.
        packet: RoutePacket,
    },
    /// Run the authenticate flow for a client-origin packet.
    Auth(RoutePacket),
    /// A client session attached to or detached from an actor.
    ConnectionChanged {
        /// The stage hosting the actor.
        stage_id: i64,
        /// The actor's account.
        account_id: String,
        /// True on attach, false on detach.
        connected: bool,
    },
    /// A timer fired.
    Timer {
        /// The owning stage.
        stage_id: i64,
        /// The timer that fired.
        timer_id: u64,
    },
    /// A fixed-timestep game-loop tick.
    Tick {
        /// The owning stage.
        stage_id: i64,
        /// Always the configured fixed timestep, exactly.
        delta: Duration,
        /// Monotone total of delivered steps.
        elapsed: Duration,
    },
    /// Resume a stage whose handler future was woken.
    Continuation(i64),
    /// Tear the stage down.
    Destroy(i64),
    /// Stop the worker thread.
    Shutdown,
}

impl WorkItem {
    /// The stage this item is bound to, if any.
    pub fn stage_id(&self) -> Option<i64> {
        match self {
            WorkItem::Message(packet) | WorkItem::Auth(packet) => Some(packet.header.stage_id),
            WorkItem::Create { packet, .. } => Some(packet.header.stage_id),
            WorkItem::ConnectionChanged { stage_id, .. }
            | WorkItem::Timer { stage_id, .. }
            | WorkItem::Tick { stage_id, .. }
            | WorkItem::Continuation(stage_id)
            | WorkItem::Destroy(stage_id) => Some(*stage_id),
            WorkItem::Shutdown => None,
        }
    }
}
