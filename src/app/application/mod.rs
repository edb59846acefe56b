// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Process bootstrap for the two server roles.
//!
//! `start` wires the shared plumbing (mesh socket, request cache, ring,
//! dispatcher), then the role-specific parts: a Play server gets the stage
//! worker pool, the timer task and the client transports; an Api server gets
//! the handler table. `shutdown` tears it down in the reverse order and
//! cancels every outstanding request.

use crate::{
    app::{
        cluster::{self, MeshHandle, ServerRing, SystemController},
        config::ServerOptions,
        dispatcher::{self, ApiRegistry},
        event_loop,
        listener,
        metrics::{Metrics, MetricsSnapshot},
        session::SessionRegistry,
        stage::{StageDirectory, StageRegistry},
        timer::TimerHandle,
        websocket,
        worker::{RequestCache, EXPIRY_TICK},
        DispatchEvent, ServerCore,
    },
    wire::{ErrorCode, ServerType},
};
use anyhow::{ensure, Context};
use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};

/// How long pooled buffers may sit idle before the trim job drops them.
const POOL_TRIM_WINDOW: Duration = Duration::from_secs(30);

fn validate(options: &ServerOptions, expected: ServerType) -> anyhow::Result<()> {
    ensure!(!options.server_id.is_empty(), "server_id must be set");
    ensure!(
        options.server_type == expected,
        "options are for {:?}, not {:?}",
        options.server_type,
        expected
    );
    cluster::parse_endpoint(&options.bind_endpoint).context("bad bind_endpoint")?;
    Ok(())
}

/// A mesh endpoint a process can dial itself on; wildcard binds loop back.
fn self_endpoint(endpoint: &str) -> String {
    endpoint.replace("0.0.0.0", "127.0.0.1").replace("[::]", "[::1]")
}

async fn run_expiry(core: Arc<ServerCore>) {
    let mut ticker = tokio::time::interval(EXPIRY_TICK);
    loop {
        ticker.tick().await;
        let expired = core.cache.expire(Instant::now());
        if expired > 0 {
            core.metrics.requests_timed_out.fetch_add(expired as u64, Ordering::Relaxed);
        }
    }
}

async fn run_pool_trim() {
    loop {
        tokio::time::sleep(POOL_TRIM_WINDOW).await;
        let dropped = crate::wire::trim_idle(POOL_TRIM_WINDOW);
        if dropped > 0 {
            log::debug!("Pool trim dropped {} idle buffers", dropped);
        }
    }
}

/// A running Play server.
pub struct PlayServer {
    core: Arc<ServerCore>,
    tasks: Vec<JoinHandle<()>>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl PlayServer {
    /// Boot a Play server. Fails on bad configuration or unusable bindings.
    pub async fn start(
        options: ServerOptions,
        registry: StageRegistry,
        system: Arc<dyn SystemController>,
    ) -> anyhow::Result<Self> {
        validate(&options, ServerType::Play)?;
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel::<DispatchEvent>();
        let metrics = Arc::new(Metrics::default());
        let cache = Arc::new(RequestCache::new());
        let ring = Arc::new(ServerRing::new());
        let sessions = Arc::new(SessionRegistry::new(metrics.clone(), dispatch_tx.clone()));
        let mesh = MeshHandle::new(options.server_id.clone(), dispatch_tx.clone(), metrics.clone());
        let (pool, mailboxes) = event_loop::mailboxes(options.worker_count());
        let (timers, timer_task) = TimerHandle::start(pool.clone());
        let core = Arc::new(ServerCore {
            options,
            metrics,
            cache,
            ring,
            mesh,
            sessions,
            stages: StageDirectory::default(),
            pool: Some(pool.clone()),
            timers: Some(timers),
        });
        let workers = event_loop::spawn_workers(mailboxes, &pool, core.clone(), Arc::new(registry));

        let mut tasks = vec![timer_task];
        tasks.push(core.mesh.bind(&core.options.bind_endpoint).await?);
        core.mesh
            .connect(&core.options.server_id, &self_endpoint(&core.options.bind_endpoint))
            .await
            .context("self-connection failed")?;
        tasks.push(tokio::spawn(dispatcher::run_play(core.clone(), dispatch_rx, system.clone())));
        tasks.push(tokio::spawn(cluster::run_resolver(core.clone(), system)));
        tasks.push(tokio::spawn(run_expiry(core.clone())));
        tasks.push(tokio::spawn(run_pool_trim()));

        if core.options.tcp_port != 0 {
            let listener = TcpListener::bind(("0.0.0.0", core.options.tcp_port))
                .await
                .context("client TCP listener bind failed")?;
            log::info!("Client TCP listener on port {}", core.options.tcp_port);
            tasks.push(tokio::spawn(listener::run_accept(core.clone(), listener)));
        }
        if core.options.ws_port != 0 {
            let listener = TcpListener::bind(("0.0.0.0", core.options.ws_port))
                .await
                .context("client WebSocket listener bind failed")?;
            log::info!(
                "Client WebSocket listener on port {} path {}",
                core.options.ws_port,
                core.options.web_socket_path
            );
            tasks.push(tokio::spawn(websocket::run_accept(core.clone(), listener)));
        }
        log::info!("Play server {} up", core.options.server_id);
        Ok(Self { core, tasks, workers })
    }

    /// This process's identity.
    pub fn server_id(&self) -> &str {
        &self.core.options.server_id
    }

    /// A point-in-time copy of the stats counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Live stages on this server.
    pub fn stage_count(&self) -> usize {
        self.core.stages.len()
    }

    /// Get-or-create a stage on this server, the local admin path. Remote
    /// creates go through [`ApiLink::create_stage`](crate::app::ApiLink).
    pub async fn create_stage(
        &self,
        stage_type: &str,
        stage_id: i64,
        payload: crate::wire::Payload,
    ) -> dispatcher::CreateStageResult {
        let link = dispatcher::ApiLink::new(self.core.clone(), self.core.new_header("", 0));
        link.create_stage(&self.core.options.server_id, stage_type, stage_id, payload)
            .await
    }

    /// Live client sessions on this server.
    pub fn session_count(&self) -> usize {
        self.core.sessions.count()
    }

    /// Stop everything: cancel outstanding requests, stop the workers and
    /// drop the mesh edges.
    pub async fn shutdown(mut self) {
        log::info!("Play server {} shutting down", self.core.options.server_id);
        self.core.cache.cancel_all(ErrorCode::ConnectionClosed);
        if let Some(timers) = self.core.timers.as_ref() {
            timers.shutdown();
        }
        if let Some(pool) = self.core.pool.as_ref() {
            pool.shutdown();
        }
        let workers = std::mem::take(&mut self.workers);
        tokio::task::spawn_blocking(move || {
            for worker in workers {
                worker.join().ok();
            }
        })
        .await
        .ok();
        self.core.mesh.close_all();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// A running Api server.
pub struct ApiServer {
    core: Arc<ServerCore>,
    tasks: Vec<JoinHandle<()>>,
}

impl ApiServer {
    /// Boot an Api server. Fails on bad configuration, unusable bindings or
    /// handler registration conflicts (the registry already enforces those).
    pub async fn start(
        options: ServerOptions,
        registry: ApiRegistry,
        system: Arc<dyn SystemController>,
    ) -> anyhow::Result<Self> {
        validate(&options, ServerType::Api)?;
        let handlers = Arc::new(registry.into_table());
        log::info!("Api server {} serves {} handlers", options.server_id, handlers.len());
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel::<DispatchEvent>();
        let metrics = Arc::new(Metrics::default());
        let cache = Arc::new(RequestCache::new());
        let ring = Arc::new(ServerRing::new());
        let sessions = Arc::new(SessionRegistry::new(metrics.clone(), dispatch_tx.clone()));
        let mesh = MeshHandle::new(options.server_id.clone(), dispatch_tx.clone(), metrics.clone());
        let core = Arc::new(ServerCore {
            options,
            metrics,
            cache,
            ring,
            mesh,
            sessions,
            stages: StageDirectory::default(),
            pool: None,
            timers: None,
        });

        let mut tasks = Vec::new();
        tasks.push(core.mesh.bind(&core.options.bind_endpoint).await?);
        core.mesh
            .connect(&core.options.server_id, &self_endpoint(&core.options.bind_endpoint))
            .await
            .context("self-connection failed")?;
        tasks.push(tokio::spawn(dispatcher::run_api(
            core.clone(),
            dispatch_rx,
            handlers,
            system.clone(),
        )));
        tasks.push(tokio::spawn(cluster::run_resolver(core.clone(), system)));
        tasks.push(tokio::spawn(run_expiry(core.clone())));
        tasks.push(tokio::spawn(run_pool_trim()));
        log::info!("Api server {} up", core.options.server_id);
        Ok(Self { core, tasks })
    }

    /// This process's identity.
    pub fn server_id(&self) -> &str {
        &self.core.options.server_id
    }

    /// A point-in-time copy of the stats counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Stop everything and cancel outstanding requests.
    pub async fn shutdown(mut self) {
        log::info!("Api server {} shutting down", self.core.options.server_id);
        self.core.cache.cancel_all(ErrorCode::ConnectionClosed);
        self.core.mesh.close_all();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
