// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Inbound packet routing.
//!
//! Both server roles share the reply short-circuit: a reply packet resolves
//! its completion in the request cache and goes no further. Past that, the
//! Play dispatcher posts work into stage mailboxes (creating stages on
//! demand), and the Api dispatcher spawns one concurrent handler task per
//! packet with a freshly instantiated controller.

mod api;

pub(crate) use api::HandlerTable;
pub use api::{ApiController, ApiLink, ApiRegistry, CreateStageResult, HandlerRegistrar};

use crate::{
    app::{
        cluster::SystemController, event_loop::WorkItem, metrics::Metrics, DispatchEvent, ServerCore,
    },
    wire::{
        ErrorCode, Payload, RoutePacket, CREATE_STAGE_MSG_ID, DESTROY_STAGE_MSG_ID,
    },
};
use futures::FutureExt;
use std::{panic::AssertUnwindSafe, sync::Arc};
use tokio::sync::mpsc;

/// Resolve a reply against the request cache. True when the packet was a
/// reply (hit or late).
fn try_resolve_reply(core: &Arc<ServerCore>, packet: &mut Option<RoutePacket>) -> bool {
    let header = &packet.as_ref().expect("packet present").header;
    if !header.is_reply || header.msg_seq == 0 {
        return false;
    }
    let msg_seq = header.msg_seq;
    match core.cache.resolve(msg_seq) {
        Some(completion) => completion.handle_response(packet.take().expect("packet present")),
        None => log::debug!("Late reply {} dropped", msg_seq),
    }
    true
}

/// The Play server's dispatch loop.
pub(crate) async fn run_play(
    core: Arc<ServerCore>,
    mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
    system: Arc<dyn SystemController>,
) {
    while let Some(event) = rx.recv().await {
        match event {
            DispatchEvent::Route(packet) => dispatch_play(&core, packet, &system),
            DispatchEvent::SessionClosed {
                account_id, stage_id, ..
            } => {
                if !account_id.is_empty() && stage_id != 0 {
                    core.pool().post(
                        stage_id,
                        WorkItem::ConnectionChanged {
                            stage_id,
                            account_id,
                            connected: false,
                        },
                    );
                }
            }
        }
    }
}

fn dispatch_play(core: &Arc<ServerCore>, packet: RoutePacket, system: &Arc<dyn SystemController>) {
    let mut packet = Some(packet);
    if try_resolve_reply(core, &mut packet) {
        return;
    }
    let mut packet = packet.expect("non-reply packet");
    let stage_id = packet.header.stage_id;
    let msg_id = packet.header.msg_id.clone();
    match msg_id.as_str() {
        CREATE_STAGE_MSG_ID => {
            if stage_id == 0 {
                core.reply_error(&packet.header, ErrorCode::DecodeFailed);
                return;
            }
            let (stage_type, body) = match split_create_payload(packet.payload.as_slice()) {
                Some(parts) => parts,
                None => {
                    core.reply_error(&packet.header, ErrorCode::DecodeFailed);
                    return;
                }
            };
            packet.payload = Payload::from(body);
            // Record the stage before the worker runs so messages racing the
            // create land in the same mailbox behind it instead of bouncing.
            core.stages.insert(stage_id, stage_type.clone());
            core.pool().post(stage_id, WorkItem::Create { stage_type, packet });
        }
        DESTROY_STAGE_MSG_ID => {
            if core.stages.contains(stage_id) {
                core.pool().post(stage_id, WorkItem::Destroy(stage_id));
                core.reply_error(&packet.header, ErrorCode::Success);
            } else {
                core.reply_error(&packet.header, ErrorCode::StageNotFound);
            }
        }
        _ if stage_id == 0 => {
            // Not bound to a stage: the server's own system handler.
            let link = ApiLink::new(core.clone(), packet.header.clone());
            let system = system.clone();
            Metrics::incr(&core.metrics.dispatched);
            tokio::spawn(async move {
                let header = packet.header.clone();
                let outcome = AssertUnwindSafe(system.on_dispatch(link, packet.into_packet()))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::error!("System handler for {} failed: {}", header.msg_id, e),
                    Err(_) => log::error!("System handler for {} panicked", header.msg_id),
                }
            });
        }
        auth if auth == core.options.authenticate_message_id
            && packet.header.sid != 0
            && packet.header.from.is_empty() =>
        {
            if core.stages.contains(stage_id) {
                core.pool().post(stage_id, WorkItem::Auth(packet));
            } else {
                core.reply_error(&packet.header, ErrorCode::StageNotFound);
            }
        }
        _ => {
            if core.stages.contains(stage_id) {
                core.pool().post(stage_id, WorkItem::Message(packet));
            } else if packet.header.msg_seq != 0 {
                core.reply_error(&packet.header, ErrorCode::StageNotFound);
            } else {
                log::debug!("Dropped {} for unknown stage {}", msg_id, stage_id);
            }
        }
    }
}

fn split_create_payload(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let type_len = *payload.first()? as usize;
    if payload.len() < 1 + type_len {
        return None;
    }
    let stage_type = String::from_utf8(payload[1..1 + type_len].to_vec()).ok()?;
    Some((stage_type, payload[1 + type_len..].to_vec()))
}

/// The Api server's dispatch loop. Handlers run concurrently; any
/// serialization is the application's business.
pub(crate) async fn run_api(
    core: Arc<ServerCore>,
    mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
    handlers: Arc<HandlerTable>,
    system: Arc<dyn SystemController>,
) {
    while let Some(event) = rx.recv().await {
        let packet = match event {
            DispatchEvent::Route(packet) => packet,
            DispatchEvent::SessionClosed { .. } => continue,
        };
        let mut packet = Some(packet);
        if try_resolve_reply(&core, &mut packet) {
            continue;
        }
        let packet = packet.expect("non-reply packet");
        Metrics::incr(&core.metrics.dispatched);
        let link = ApiLink::new(core.clone(), packet.header.clone());
        match handlers.get(&packet.header.msg_id) {
            Some(handler) => {
                let msg_id = packet.header.msg_id.clone();
                let error_link = link.clone();
                let fut = handler(packet.into_packet(), link);
                tokio::spawn(async move {
                    match AssertUnwindSafe(fut).catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            log::error!("Handler for {} failed: {}", msg_id, e);
                            error_link.reply_error(ErrorCode::InvalidResponse);
                        }
                        Err(_) => {
                            log::error!("Handler for {} panicked", msg_id);
                            error_link.reply_error(ErrorCode::InvalidResponse);
                        }
                    }
                });
            }
            None => {
                // No registered handler; give the system controller its shot
                // (its default answers HandlerNotFound).
                let system = system.clone();
                tokio::spawn(async move {
                    let msg_id = packet.header.msg_id.clone();
                    let outcome = AssertUnwindSafe(system.on_dispatch(link, packet.into_packet()))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => log::error!("System handler for {} failed: {}", msg_id, e),
                        Err(_) => log::error!("System handler for {} panicked", msg_id),
                    }
                });
            }
        }
    }
}
