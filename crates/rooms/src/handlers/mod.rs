//! Muxrpc methods the room exposes.
//!
//! The table is built once per server and shared by every session. Each
//! handler holds the [`RoomContext`] and learns who is calling from the
//! request's endpoint.

mod alias;
mod connect;
mod meta;
mod tunnel;

pub use alias::is_valid_alias;

use crate::config::PrivacyMode;
use crate::roomdb::RoomDb;
use crate::roomstate::RoomState;
use async_trait::async_trait;
use room_common::muxrpc::{Authorizer, CallError, HandlerMux, Request};
use room_common::FeedRef;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Everything a handler may consult.
pub struct RoomContext {
    /// The room's own identity.
    pub room: FeedRef,
    /// Online peers.
    pub state: RoomState,
    /// Persistent stores.
    pub db: RoomDb,
    /// Public domain, used for alias URLs and metadata.
    pub domain: String,
    /// Serve aliases as subdomains instead of paths.
    pub alias_subdomains: bool,
    last_ping: AtomicU64,
}

impl RoomContext {
    /// Context for a room identified by `room`.
    #[must_use]
    pub fn new(
        room: FeedRef,
        state: RoomState,
        db: RoomDb,
        domain: String,
        alias_subdomains: bool,
    ) -> Self {
        Self {
            room,
            state,
            db,
            domain,
            alias_subdomains,
            last_ping: AtomicU64::new(0),
        }
    }

    /// Public URL of alias `name`.
    #[must_use]
    pub fn alias_url(&self, name: &str) -> String {
        if self.alias_subdomains {
            format!("https://{name}.{}", self.domain)
        } else {
            format!("https://{}/alias/{name}", self.domain)
        }
    }

    async fn privacy_mode(&self) -> Result<PrivacyMode, CallError> {
        self.db
            .config
            .privacy_mode()
            .await
            .map_err(|_| CallError::Failed("running with unknown privacy mode".to_string()))
    }

    async fn is_member(&self, feed: &FeedRef) -> Result<bool, CallError> {
        self.db
            .is_member(feed)
            .await
            .map_err(|e| CallError::Failed(format!("members directory: {e}")))
    }
}

/// Build the method table for a room.
#[must_use]
pub fn build_mux(ctx: Arc<RoomContext>) -> HandlerMux {
    let mut mux = HandlerMux::new();

    let is_room = Arc::new(tunnel::IsRoom);
    mux.register_async("tunnel.isRoom", is_room.clone());
    mux.register_async("room.isRoom", is_room);

    let ping = Arc::new(tunnel::Ping(ctx.clone()));
    mux.register_async("tunnel.ping", ping.clone());
    mux.register_async("room.ping", ping);

    let announce = Arc::new(tunnel::Announce(ctx.clone()));
    mux.register_async("tunnel.announce", announce.clone());
    mux.register_async("room.announce", announce);

    let leave = Arc::new(tunnel::Leave(ctx.clone()));
    mux.register_async("tunnel.leave", leave.clone());
    mux.register_async("room.leave", leave);

    mux.register_source("tunnel.endpoints", Arc::new(tunnel::Endpoints(ctx.clone())));
    mux.register_source("room.attendants", Arc::new(tunnel::Attendants(ctx.clone())));
    mux.register_source("room.members", Arc::new(tunnel::Members(ctx.clone())));

    let connect = Arc::new(connect::Connect(ctx.clone()));
    mux.register_duplex("tunnel.connect", connect.clone());
    mux.register_duplex("room.connect", connect);

    mux.register_async("room.registerAlias", Arc::new(alias::Register(ctx.clone())));
    mux.register_async("room.revokeAlias", Arc::new(alias::Revoke(ctx.clone())));
    mux.register_async("room.listAliases", Arc::new(alias::List(ctx.clone())));

    mux.register_async("whoami", Arc::new(meta::WhoAmI(ctx.clone())));
    mux.register_async("room.metadata", Arc::new(meta::Metadata(ctx.clone())));
    mux.register_duplex("gossip.ping", Arc::new(meta::GossipPing));

    let gate = Arc::new(ListingGate {
        ctx: ctx.clone(),
        message: "external users are not allowed to list members",
    });
    mux.set_authorizer("room.members", gate.clone());
    mux.set_authorizer("tunnel.endpoints", gate.clone());
    let attendants_gate = Arc::new(ListingGate {
        ctx: ctx.clone(),
        message: "external users are not allowed to enumerate members",
    });
    mux.set_authorizer("room.attendants", attendants_gate);
    mux.set_authorizer("room.registerAlias", Arc::new(MembersOnly(ctx)));

    // The manifest lists itself, so register a placeholder first.
    mux.register_async("manifest", Arc::new(meta::Manifest(serde_json::Value::Null)));
    let manifest = mux.manifest();
    mux.register_async("manifest", Arc::new(meta::Manifest(manifest)));

    mux
}

/// Lets anyone list peers in open mode, only members otherwise.
struct ListingGate {
    ctx: Arc<RoomContext>,
    message: &'static str,
}

#[async_trait]
impl Authorizer for ListingGate {
    async fn authorize(&self, req: &Request) -> Result<(), CallError> {
        if self.ctx.privacy_mode().await? == PrivacyMode::Open || *req.remote() == self.ctx.room {
            return Ok(());
        }
        if self.ctx.is_member(req.remote()).await? {
            Ok(())
        } else {
            Err(CallError::Unauthorized(self.message.to_string()))
        }
    }
}

struct MembersOnly(Arc<RoomContext>);

#[async_trait]
impl Authorizer for MembersOnly {
    async fn authorize(&self, req: &Request) -> Result<(), CallError> {
        if self.0.is_member(req.remote()).await? {
            Ok(())
        } else {
            Err(CallError::Unauthorized(format!(
                "{}: only members may use this method",
                req.method
            )))
        }
    }
}
