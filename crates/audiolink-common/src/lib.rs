//! Audiolink Common Types and Transport
//!
//! This crate provides the shared infrastructure used by the audiolink node
//! pool:
//!
//! - **Protocol Layer**: the messages a node pushes over its WebSocket
//!   (`ready`, `stats`), the load-penalty model derived from them, and the
//!   REST payloads used for node discovery.
//! - **Transport Layer**: the authenticated, persistent WebSocket connection
//!   to a single node.
//! - **Configuration**: the persisted node configuration format and the
//!   store it lives in.
//!
//! # Components
//!
//! - [`protocol`] - Node wire messages and the penalty model
//! - [`transport`] - Per-node WebSocket transport
//! - [`config`] - Node configuration and the configuration store
//! - [`error`] - Error taxonomy shared across the workspace

pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use config::{NodeConfig, NodeConfigStore, NodeId};
pub use error::{AudiolinkError, Result};
