use super::RoomContext;
use crate::config::PrivacyMode;
use crate::metrics::counters;
use async_trait::async_trait;
use room_common::crypto::unix_now_millis;
use room_common::muxrpc::{
    AsyncHandler, ByteSink, ByteSource, CallError, DuplexHandler, Request,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub(super) struct Manifest(pub(super) Value);

#[async_trait]
impl AsyncHandler for Manifest {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        Ok(self.0.clone())
    }
}

pub(super) struct WhoAmI(pub(super) Arc<RoomContext>);

#[async_trait]
impl AsyncHandler for WhoAmI {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        Ok(json!({ "id": self.0.room }))
    }
}

pub(super) struct Metadata(pub(super) Arc<RoomContext>);

#[async_trait]
impl AsyncHandler for Metadata {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        let mode = self.0.privacy_mode().await?;
        let membership = self.0.is_member(req.remote()).await?;

        let mut features = vec!["tunnel", "httpAuth", "httpInvite"];
        if mode == PrivacyMode::Open {
            features.push("room1");
        }
        if matches!(mode, PrivacyMode::Open | PrivacyMode::Community) {
            features.push("alias");
        }
        Ok(json!({
            "name": self.0.domain,
            "membership": membership,
            "features": features,
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct PingArgs {
    /// Milliseconds to wait between pings.
    timeout: Option<u64>,
}

/// Answers every timestamp with our own, until the peer goes quiet.
pub(super) struct GossipPing;

#[async_trait]
impl DuplexHandler for GossipPing {
    async fn handle_duplex(
        &self,
        req: &Request,
        mut source: ByteSource,
        mut sink: ByteSink,
    ) -> Result<(), CallError> {
        counters::calls_total(req.call_type.as_str());
        let has_arg = req.args.as_array().is_some_and(|a| !a.is_empty());
        let args: PingArgs = if has_arg {
            req.first_arg()?
        } else {
            PingArgs::default()
        };
        let timeout = args
            .timeout
            .map_or(DEFAULT_PING_TIMEOUT, Duration::from_millis);

        loop {
            let next = tokio::select! {
                _ = req.context().cancelled() => return Ok(()),
                next = tokio::time::timeout(timeout, source.next()) => next,
            };
            match next {
                Err(_elapsed) => return Ok(()),
                Ok(Ok(None)) => return Ok(()),
                Ok(Ok(Some(_ping))) => sink.write_json(&unix_now_millis()).await?,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}
