//! The aggregation core of the gate4.ai gateway.
//!
//! The gateway multiplexes one downstream MCP session onto many upstream MCP
//! servers. This crate implements the engine behind that: the upstream client
//! session (SSE read side, POST request channel, `initialize` handshake and
//! request correlation), the per-client session pool, generic fan-out with
//! deterministic name-collision resolution, the downstream method dispatcher,
//! and the subscription bridge that translates `resources/updated`
//! notifications back into the downstream namespace.
//!
//! The HTTP server, TLS, CLI and the configuration store are collaborators:
//! embedders implement [`config::ConfigSource`] and
//! [`downstream::DownstreamSession`], then route parsed MCP requests through
//! [`Gateway::handle`].

mod error;
pub use error::{ServiceError, SessionError};

/// MCP schema subset and JSON-RPC envelope used on the upstream wire.
pub mod model;

pub mod aggregate;
pub mod config;
pub mod downstream;
pub mod headers;
pub mod timeouts;
pub mod upstream;

mod gateway;
mod pool;

pub use gateway::Gateway;
pub use upstream::{SessionStatus, UpstreamSession};
