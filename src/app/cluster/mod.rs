// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The inter-server mesh.
//!
//! Every process binds one listening socket at its configured endpoint and
//! connects out to each peer it learns about from service discovery,
//! announcing its own `server_id` in an identity frame. Outbound connections
//! carry sends; inbound connections carry receives, and the receive loop
//! stamps each packet's `from` with the identity the connection announced,
//! so a peer cannot spoof another sender. A server also connects to itself,
//! which is what lets same-server stage-to-stage sends use the one path.

mod resolver;
mod ring;

pub(crate) use resolver::run_resolver;
pub use resolver::SystemController;
pub(crate) use ring::ServerRing;
pub use ring::{SelectionPolicy, ServerInfo};

use crate::{
    app::{error::MeshError, metrics::Metrics, DispatchEvent},
    wire::{decode_route, encode_route, give_back, RoutePacket, MAX_BODY_SIZE},
};
use socket2::{SockRef, TcpKeepalive};
use std::{
    collections::HashMap,
    convert::TryInto,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::mpsc,
};

/// Per-peer send queue depth; the router high-watermark.
const SEND_HIGH_WATERMARK: usize = 1000;

/// Parse a `tcp://host:port` endpoint.
pub(crate) fn parse_endpoint(endpoint: &str) -> anyhow::Result<SocketAddr> {
    let url = url::Url::parse(endpoint)?;
    anyhow::ensure!(url.scheme() == "tcp", "unsupported mesh scheme {:?}", url.scheme());
    let host = url.host_str().ok_or_else(|| anyhow::anyhow!("mesh endpoint has no host"))?;
    let port = url.port().ok_or_else(|| anyhow::anyhow!("mesh endpoint has no port"))?;
    let addr = format!("{}:{}", host, port).parse()?;
    Ok(addr)
}

struct Peer {
    endpoint: String,
    tx: mpsc::Sender<Vec<u8>>,
}

struct MeshInner {
    server_id: String,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    metrics: Arc<Metrics>,
    peers: Mutex<HashMap<String, Peer>>,
}

/// The identity-routed mesh socket. Cheap to clone.
#[derive(Clone)]
pub(crate) struct MeshHandle {
    inner: Arc<MeshInner>,
}

impl MeshHandle {
    pub(crate) fn new(
        server_id: String,
        dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner: Arc::new(MeshInner {
                server_id,
                dispatch_tx,
                metrics,
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Bind the listening side and start accepting peers.
    pub(crate) async fn bind(&self, endpoint: &str) -> anyhow::Result<tokio::task::JoinHandle<()>> {
        let addr = parse_endpoint(endpoint)?;
        let listener = TcpListener::bind(addr).await?;
        log::info!("Mesh socket {} bound at {}", self.inner.server_id, addr);
        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let inner = inner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = run_receive(inner, stream).await {
                                log::debug!("Mesh receive from {} ended: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("Mesh accept failed: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }))
    }

    /// Ensure an outbound edge to `peer_id` at `endpoint`. Reconnecting under
    /// the same identity replaces the previous edge (router handover).
    pub(crate) async fn connect(&self, peer_id: &str, endpoint: &str) -> Result<(), MeshError> {
        {
            let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(peer) = peers.get(peer_id) {
                if peer.endpoint == endpoint && !peer.tx.is_closed() {
                    return Ok(());
                }
            }
        }
        let addr = parse_endpoint(endpoint).map_err(|e| MeshError::Connect(peer_id.to_string(), e.to_string()))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MeshError::Connect(peer_id.to_string(), e.to_string()))?;
        stream.set_nodelay(true).ok();
        let keepalive = TcpKeepalive::new().with_time(std::time::Duration::from_secs(30));
        SockRef::from(&stream).set_tcp_keepalive(&keepalive).ok();
        let (_, mut write_half) = stream.into_split();
        // Announce who is sending on this edge.
        let mut identity = Vec::with_capacity(1 + self.inner.server_id.len());
        identity.push(self.inner.server_id.len() as u8);
        identity.extend_from_slice(self.inner.server_id.as_bytes());
        write_half
            .write_all(&identity)
            .await
            .map_err(|e| MeshError::Connect(peer_id.to_string(), e.to_string()))?;
        let (tx, rx) = mpsc::channel(SEND_HIGH_WATERMARK);
        let replaced = self
            .inner
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                peer_id.to_string(),
                Peer {
                    endpoint: endpoint.to_string(),
                    tx,
                },
            );
        if replaced.is_some() {
            log::info!("Mesh edge to {} replaced", peer_id);
        } else {
            log::info!("Mesh edge to {} up ({})", peer_id, endpoint);
        }
        tokio::spawn(run_send(peer_id.to_string(), write_half, rx));
        Ok(())
    }

    /// Frame and queue a packet toward `target`.
    pub(crate) fn send(&self, target: &str, packet: RoutePacket) -> Result<(), MeshError> {
        let buffer = encode_route(&packet)?;
        let peers = self.inner.peers.lock().unwrap_or_else(|e| e.into_inner());
        let peer = peers.get(target).ok_or_else(|| MeshError::NotConnected(target.to_string()))?;
        match peer.tx.try_send(buffer) {
            Ok(()) => {
                Metrics::incr(&self.inner.metrics.mesh_out);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(MeshError::BufferFull(target.to_string())),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MeshError::NotConnected(target.to_string())),
        }
    }

    /// Tear down the outbound edge to `peer_id`.
    pub(crate) fn disconnect(&self, peer_id: &str) {
        if self
            .inner
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(peer_id)
            .is_some()
        {
            log::info!("Mesh edge to {} down", peer_id);
        }
    }

    /// The peers with live outbound edges.
    pub(crate) fn peers(&self) -> Vec<String> {
        self.inner
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Drop every edge.
    pub(crate) fn close_all(&self) {
        self.inner.peers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

async fn run_send(peer_id: String, mut write_half: OwnedWriteHalf, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(buffer) = rx.recv().await {
        if let Err(e) = write_half.write_all(&buffer).await {
            log::warn!("Mesh send to {} failed: {}", peer_id, e);
            break;
        }
        give_back(buffer);
    }
    // Channel gone (handover or disconnect) or the socket broke.
}

async fn run_receive(inner: Arc<MeshInner>, stream: TcpStream) -> anyhow::Result<()> {
    stream.set_nodelay(true).ok();
    let (mut read_half, _) = stream.into_split();
    let identity = read_identity(&mut read_half).await?;
    log::debug!("Mesh peer {} attached to {}", identity, inner.server_id);
    loop {
        let frame = match read_frame(&mut read_half).await? {
            Some(frame) => frame,
            None => break,
        };
        // The decoder consumes the rented buffer; the payload rides on in it.
        match decode_route(frame) {
            Ok(mut packet) => {
                // The socket's identity wins over whatever the frame claims.
                packet.header.from = identity.clone();
                Metrics::incr(&inner.metrics.mesh_in);
                if inner.dispatch_tx.send(DispatchEvent::Route(packet)).is_err() {
                    break;
                }
            }
            Err(e) => {
                log::warn!("Bad mesh frame from {}: {}", identity, e);
                anyhow::bail!("bad frame from {}: {}", identity, e);
            }
        }
    }
    log::debug!("Mesh peer {} detached", identity);
    Ok(())
}

async fn read_identity(read_half: &mut OwnedReadHalf) -> anyhow::Result<String> {
    let mut len = [0u8; 1];
    read_half.read_exact(&mut len).await?;
    anyhow::ensure!(len[0] > 0, "empty mesh identity");
    let mut name = vec![0u8; len[0] as usize];
    read_half.read_exact(&mut name).await?;
    Ok(String::from_utf8(name)?)
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> anyhow::Result<Option<Vec<u8>>> {
    let mut size = [0u8; 4];
    match read_half.read_exact(&mut size).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let frame_size = i32::from_le_bytes(size[..].try_into().expect("four bytes"));
    anyhow::ensure!(frame_size > 0, "non-positive mesh frame size");
    let frame_size = frame_size as usize;
    anyhow::ensure!(
        frame_size <= MAX_BODY_SIZE + 4096,
        "mesh frame of {} bytes exceeds the body limit",
        frame_size
    );
    let mut frame = crate::wire::rent(frame_size);
    frame.resize(frame_size, 0);
    read_half.read_exact(&mut frame).await?;
    Ok(Some(frame))
}
