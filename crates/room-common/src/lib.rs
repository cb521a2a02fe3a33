//! Protocol building blocks shared by the room server and its clients.
//!
//! This crate provides:
//! - The secret handshake that authenticates both peers ([`handshake`])
//! - The encrypted boxstream transport that follows it ([`boxstream`])
//! - Muxrpc packet framing ([`frame`]) and sessions ([`muxrpc`])
//! - Alias signatures and clock helpers ([`crypto`])
//! - Feed references and network constants ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod boxstream;
pub mod crypto;
pub mod frame;
pub mod handshake;
pub mod muxrpc;
pub mod types;

pub use types::{FeedAlgo, FeedRef, Pubkey, RefError, DEFAULT_NETWORK_CAP};
