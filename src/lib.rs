//! Sidecar IPC Library
//!
//! This library provides both halves of a JSON Lines protocol spoken over the
//! stdio of a spawned child process:
//!
//! - `ipc` - wire types, line framing, request registry and the host-side client
//! - `service` - the peer that answers requests on stdin/stdout
//! - `config` - client and service settings
//!
//! # Client
//!
//! ```ignore
//! use sidecar_ipc::config::ClientConfig;
//! use sidecar_ipc::ipc::SidecarClient;
//! use serde_json::json;
//!
//! let mut client = SidecarClient::new(ClientConfig::new("sidecar-mock"));
//! client.start()?;
//! let response = client.send_request("health", None, None).await?;
//! client.stop().await;
//! ```

pub mod config;
pub mod ipc;
pub mod service;
