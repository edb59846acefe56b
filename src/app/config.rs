// Copyright 2021 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Process startup configuration.
//!
//! Options are a plain record with chaining setters, and serialize to JSON so
//! deployments can load them from a config file.

use crate::wire::ServerType;
use serde::{Deserialize, Serialize};

/// Everything a server process is told at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerOptions {
    /// The role of this process.
    pub server_type: ServerType,
    /// Mesh-unique identity; the routing identity on the mesh socket.
    pub server_id: String,
    /// Service group within the type.
    pub service_id: u16,
    /// Where the mesh socket binds, e.g. `tcp://0.0.0.0:16000`.
    pub bind_endpoint: String,
    /// Client TCP listener port; `0` disables it.
    pub tcp_port: u16,
    /// Client WebSocket listener port; `0` disables it.
    pub ws_port: u16,
    /// Path the WebSocket upgrade must request.
    pub web_socket_path: String,
    /// Enable TLS on the client transports.
    pub use_ssl: bool,
    /// Certificate path when `use_ssl` is set.
    pub certificate: Option<String>,
    /// Expected client keepalive cadence.
    pub heartbeat_interval_ms: u64,
    /// Sessions silent for this long are dropped.
    pub connection_idle_timeout_ms: u64,
    /// Deadline for inter-server requests.
    pub request_timeout_ms: u64,
    /// Stage worker threads; `0` means one per CPU.
    pub stage_worker_pool_size: usize,
    /// Stage type used when a create-stage message names none.
    pub default_stage_type: String,
    /// The only msg id accepted on an unauthenticated session.
    pub authenticate_message_id: String,
    /// Service-discovery refresh period.
    pub address_resolver_period_ms: u64,
    /// Response bodies longer than this are considered for compression.
    pub compression_threshold: usize,
    /// Per-session receive ring capacity in bytes.
    pub session_buffer_size: usize,
    /// Allow `@Debug@` to switch a session into an echo mode.
    pub debug_echo: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            server_type: ServerType::Play,
            server_id: String::new(),
            service_id: 1,
            bind_endpoint: "tcp://127.0.0.1:16000".to_string(),
            tcp_port: 0,
            ws_port: 0,
            web_socket_path: "/ws".to_string(),
            use_ssl: false,
            certificate: None,
            heartbeat_interval_ms: 10_000,
            connection_idle_timeout_ms: 30_000,
            request_timeout_ms: 5_000,
            stage_worker_pool_size: 0,
            default_stage_type: String::new(),
            authenticate_message_id: "AuthenticateRequest".to_string(),
            address_resolver_period_ms: 3_000,
            compression_threshold: crate::wire::COMPRESSION_THRESHOLD,
            session_buffer_size: 256 * 1024,
            debug_echo: false,
        }
    }
}

impl ServerOptions {
    /// Options for a Play server with the given identity.
    pub fn play(server_id: impl Into<String>) -> Self {
        Self {
            server_type: ServerType::Play,
            server_id: server_id.into(),
            ..Default::default()
        }
    }

    /// Options for an Api server with the given identity.
    pub fn api(server_id: impl Into<String>) -> Self {
        Self {
            server_type: ServerType::Api,
            server_id: server_id.into(),
            ..Default::default()
        }
    }

    /// Set the service group.
    pub fn with_service_id(mut self, service_id: u16) -> Self {
        self.service_id = service_id;
        self
    }

    /// Set the mesh bind endpoint.
    pub fn with_bind_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.bind_endpoint = endpoint.into();
        self
    }

    /// Enable the client TCP listener.
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Enable the client WebSocket listener.
    pub fn with_ws_port(mut self, port: u16, path: impl Into<String>) -> Self {
        self.ws_port = port;
        self.web_socket_path = path.into();
        self
    }

    /// Set the inter-server request deadline.
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Set the idle-session deadline.
    pub fn with_idle_timeout_ms(mut self, ms: u64) -> Self {
        self.connection_idle_timeout_ms = ms;
        self
    }

    /// Set the worker pool size explicitly.
    pub fn with_stage_workers(mut self, workers: usize) -> Self {
        self.stage_worker_pool_size = workers;
        self
    }

    /// Set the fallback stage type.
    pub fn with_default_stage_type(mut self, stage_type: impl Into<String>) -> Self {
        self.default_stage_type = stage_type.into();
        self
    }

    /// Set the authenticate msg id.
    pub fn with_authenticate_message_id(mut self, msg_id: impl Into<String>) -> Self {
        self.authenticate_message_id = msg_id.into();
        self
    }

    /// Set the service-discovery refresh period.
    pub fn with_resolver_period_ms(mut self, ms: u64) -> Self {
        self.address_resolver_period_ms = ms;
        self
    }

    /// Allow diagnostic echo modes on sessions.
    pub fn with_debug_echo(mut self, enabled: bool) -> Self {
        self.debug_echo = enabled;
        self
    }

    /// The effective worker count.
    pub fn worker_count(&self) -> usize {
        if self.stage_worker_pool_size == 0 {
            num_cpus::get()
        } else {
            self.stage_worker_pool_size
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_contract() {
        let options = ServerOptions::play("play-1");
        assert_eq!(options.service_id, 1);
        assert_eq!(options.heartbeat_interval_ms, 10_000);
        assert_eq!(options.connection_idle_timeout_ms, 30_000);
        assert_eq!(options.authenticate_message_id, "AuthenticateRequest");
        assert!(options.worker_count() >= 1);
    }

    #[test]
    fn options_round_trip_through_json() {
        let options = ServerOptions::api("api-1").with_service_id(3).with_tcp_port(7000);
        let json = serde_json::to_string(&options).unwrap();
        let back: ServerOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.server_id, "api-1");
        assert_eq!(back.service_id, 3);
        assert_eq!(back.tcp_port, 7000);
    }
}
