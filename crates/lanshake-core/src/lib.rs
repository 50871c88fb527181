//! # Lanshake Core Library
//!
//! `lanshake-core` lets two devices on the same network identify each other,
//! keep a record of who they have met, and negotiate a transfer (a set of
//! files or a piece of clipboard text) before any bytes move.
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`connection`] - Outbound handshakes and the request transport
//! - [`error`] - Unified error type
//! - [`hotspot`] - Optional access point capability
//! - [`identity`] - Local device self-description
//! - [`index`] - File index construction
//! - [`interfaces`] - Local network adapter matching
//! - [`node`] - Wiring of all components into a running peer
//! - [`protocol`] - Keyed JSON wire vocabulary and framing
//! - [`registry`] - Device and connection bookkeeping
//! - [`sequence`] - Unique id generation
//! - [`server`] - Inbound request handling
//! - [`store`] - Persistence contract and implementations
//! - [`transfer`] - Transfer group negotiation and data phase
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanshake_core::{config::Config, node::Node};
//!
//! let node = Node::start(Config::load()?).await?;
//! let registration = node.handler().connect("192.168.1.42".parse()?).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::unused_async)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod config;
pub mod connection;
pub mod error;
pub mod hotspot;
pub mod identity;
pub mod index;
pub mod interfaces;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod sequence;
pub mod server;
pub mod store;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port of the communication server (TCP)
pub const DEFAULT_COMMUNICATION_PORT: u16 = 1128;

/// Default data-phase port range start
pub const DEFAULT_TRANSFER_PORT_START: u16 = 1129;

/// Default data-phase port range end
pub const DEFAULT_TRANSFER_PORT_END: u16 = 1139;

/// Default socket timeout for connect and read operations, in milliseconds
pub const DEFAULT_SOCKET_TIMEOUT_MS: u64 = 5000;

/// Default maximum nickname length
pub const DEFAULT_NICKNAME_MAX_LENGTH: usize = 32;

/// Default chunk size for the data phase (64 KB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Adapter name used when a peer address matches no local interface
pub const UNKNOWN_ADAPTER: &str = "unk0";

/// Current time as milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
