// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The address resolver: a periodic service-discovery refresh that keeps the
//! mesh edges and the server-info ring in step with the membership the
//! system controller reports.

use super::ServerInfo;
use crate::{
    app::{dispatcher::ApiLink, ServerCore},
    wire::{Packet, ServerState},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

/// The user-supplied source of truth for mesh membership, and the handler
/// for system-addressed messages.
#[async_trait]
pub trait SystemController: Send + Sync + 'static {
    /// Called periodically with this process's own record; the returned list
    /// fully describes the mesh, including this process.
    async fn update_server_info(&self, self_info: ServerInfo) -> anyhow::Result<Vec<ServerInfo>>;

    /// A packet addressed at this server rather than a stage or an api
    /// handler. The default answers requests with `HandlerNotFound`.
    async fn on_dispatch(&self, link: ApiLink, packet: Packet) -> anyhow::Result<()> {
        log::debug!("Unhandled system message {}", packet.msg_id);
        link.reply_error(crate::wire::ErrorCode::HandlerNotFound);
        Ok(())
    }
}

/// Drive discovery until the server shuts down.
pub(crate) async fn run_resolver(core: Arc<ServerCore>, system: Arc<dyn SystemController>) {
    let period = Duration::from_millis(core.options.address_resolver_period_ms.max(100));
    // Peers absent from this many consecutive replies get their edge torn down.
    const ABSENT_LIMIT: u32 = 2;
    let mut absent: HashMap<String, u32> = HashMap::new();
    loop {
        match system.update_server_info(core.self_info()).await {
            Ok(servers) => reconcile(&core, &servers, &mut absent, ABSENT_LIMIT).await,
            Err(e) => log::warn!("Service discovery failed: {}", e),
        }
        tokio::time::sleep(period).await;
    }
}

async fn reconcile(core: &Arc<ServerCore>, servers: &[ServerInfo], absent: &mut HashMap<String, u32>, limit: u32) {
    core.ring.update(servers);
    let listed: HashSet<&str> = servers.iter().map(|info| info.server_id.as_str()).collect();
    for info in servers {
        match info.state {
            ServerState::Running => {
                if let Err(e) = core.mesh.connect(&info.server_id, &info.address).await {
                    log::warn!("Mesh edge to {} not established: {}", info.server_id, e);
                }
            }
            ServerState::Disabled => core.mesh.disconnect(&info.server_id),
        }
    }
    for peer in core.mesh.peers() {
        if listed.contains(peer.as_str()) {
            absent.remove(&peer);
            continue;
        }
        let misses = absent.entry(peer.clone()).or_insert(0);
        *misses += 1;
        if *misses >= limit {
            core.mesh.disconnect(&peer);
            absent.remove(&peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        app::{
            cluster::{MeshHandle, ServerRing},
            config::ServerOptions,
            metrics::Metrics,
            session::SessionRegistry,
            stage::StageDirectory,
            worker::RequestCache,
        },
        wire::ServerType,
    };
    use tokio::sync::mpsc;

    fn core_with_mesh(server_id: &str) -> Arc<ServerCore> {
        let (dispatch_tx, _dispatch_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(Metrics::default());
        Arc::new(ServerCore {
            options: ServerOptions::play(server_id),
            metrics: metrics.clone(),
            cache: Arc::new(RequestCache::new()),
            ring: Arc::new(ServerRing::new()),
            mesh: MeshHandle::new(server_id.to_string(), dispatch_tx.clone(), metrics),
            sessions: Arc::new(SessionRegistry::new(Arc::new(Metrics::default()), dispatch_tx)),
            stages: StageDirectory::default(),
            pool: None,
            timers: None,
        })
    }

    fn peer_info(server_id: &str, port: u16, state: ServerState) -> ServerInfo {
        ServerInfo {
            server_type: ServerType::Api,
            service_id: 1,
            server_id: server_id.to_string(),
            address: format!("tcp://127.0.0.1:{}", port),
            state,
            weight: 1,
        }
    }

    #[tokio::test]
    async fn disabled_and_absent_peers_lose_their_edges() {
        let core = core_with_mesh("a");
        // A real peer to dial.
        let peer_port = port_scanner::request_open_port().expect("a free port");
        let (peer_tx, _peer_rx) = mpsc::unbounded_channel();
        let peer_mesh = MeshHandle::new("b".to_string(), peer_tx, Arc::new(Metrics::default()));
        let _accepting = peer_mesh
            .bind(&format!("tcp://127.0.0.1:{}", peer_port))
            .await
            .expect("peer binds");

        let mut absent = HashMap::new();
        reconcile(&core, &[peer_info("b", peer_port, ServerState::Running)], &mut absent, 2).await;
        assert_eq!(core.mesh.peers(), vec!["b".to_string()]);

        // Marked disabled: the edge goes down on the next refresh.
        reconcile(&core, &[peer_info("b", peer_port, ServerState::Disabled)], &mut absent, 2).await;
        assert!(core.mesh.peers().is_empty());

        // Back, then silently absent: the edge survives one missing reply
        // and is torn down on the second.
        reconcile(&core, &[peer_info("b", peer_port, ServerState::Running)], &mut absent, 2).await;
        assert_eq!(core.mesh.peers(), vec!["b".to_string()]);
        reconcile(&core, &[], &mut absent, 2).await;
        assert_eq!(core.mesh.peers(), vec!["b".to_string()]);
        reconcile(&core, &[], &mut absent, 2).await;
        assert!(core.mesh.peers().is_empty());
    }
}
