//! Tool Relay
//!
//! An HTTP relay that brokers JSON-RPC 2.0 tool-call traffic between
//! browser-embedded tool providers and agent callers, grouped into named
//! sessions.
//!
//! # Features
//!
//! - **Session-scoped routing**: one provider, many callers, per session
//! - **Id-rewriting correlation**: the relay owns its own internal id space
//! - **SSE push channels**: keep-alive heartbeats, disconnect-on-drop cleanup
//! - **Peer multiplexer**: a request/response client library for both roles
//!
//! # Example
//!
//! ```no_run
//! use tool_relay::config::RelayConfig;
//! use tool_relay::relay::{transport, Relay};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RelayConfig::from_env()?;
//!     let (host, port) = (config.host.clone(), config.port);
//!     let relay = Relay::new(config);
//!     let router = transport::create_router(relay);
//!     let listener = tokio::net::TcpListener::bind((host.as_str(), port)).await?;
//!     axum::serve(listener, router).await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod relay;

pub use config::{PeerConfig, RelayConfig};
pub use error::{ErrorKind, PeerError, RelayError};
pub use peer::PeerMultiplexer;
pub use relay::Relay;
