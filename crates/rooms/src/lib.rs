//! Room server: lets Secure Scuttlebutt peers behind NATs reach each other
//! through tunnels relayed over their sessions with the room.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Post-handshake admission policy.
pub mod admission;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for room server operations.
pub mod error;
/// Muxrpc methods exposed to peers.
pub mod handlers;
/// Loading and creating the room's long-term keypair.
pub mod keypair;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Collaborator interfaces to the room's stores.
pub mod roomdb;
/// Online peers and update fan-out.
pub mod roomstate;
/// Accept loops and shared server state.
pub mod server;
/// Last-wins session tracking.
pub mod tracker;
/// WebSocket ingress.
pub mod websocket;

pub use connection::handle_connection;
pub use server::{run_tcp, run_websocket, ServerState};
