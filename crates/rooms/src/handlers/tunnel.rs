use super::RoomContext;
use crate::metrics::counters;
use async_trait::async_trait;
use room_common::crypto::unix_now_micros;
use room_common::muxrpc::{AsyncHandler, ByteSink, CallError, Request, SourceHandler};
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

pub(super) struct IsRoom;

#[async_trait]
impl AsyncHandler for IsRoom {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        Ok(Value::Bool(true))
    }
}

/// Microseconds since the epoch, never smaller than an earlier reply.
pub(super) struct Ping(pub(super) Arc<RoomContext>);

#[async_trait]
impl AsyncHandler for Ping {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        let now = unix_now_micros();
        let prev = self.0.last_ping.fetch_max(now, Ordering::AcqRel);
        Ok(json!(now.max(prev)))
    }
}

pub(super) struct Announce(pub(super) Arc<RoomContext>);

#[async_trait]
impl AsyncHandler for Announce {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        debug!(peer = %req.remote().short(), "announced");
        self.0
            .state
            .add_endpoint(*req.remote(), req.endpoint().clone());
        Ok(Value::Bool(false))
    }
}

pub(super) struct Leave(pub(super) Arc<RoomContext>);

#[async_trait]
impl AsyncHandler for Leave {
    async fn handle_async(&self, req: &Request) -> Result<Value, CallError> {
        counters::calls_total(req.call_type.as_str());
        let caller = req.endpoint().id();
        self.0
            .state
            .remove_if(req.remote(), |session| session.id() == caller);
        Ok(Value::Bool(false))
    }
}

const FELL_BEHIND: &str = "subscriber fell behind room updates";

/// Legacy snapshots. Subscribing counts as announcing.
pub(super) struct Endpoints(pub(super) Arc<RoomContext>);

#[async_trait]
impl SourceHandler for Endpoints {
    async fn handle_source(&self, req: &Request, mut sink: ByteSink) -> Result<(), CallError> {
        counters::calls_total(req.call_type.as_str());
        self.0
            .state
            .already_added(*req.remote(), req.endpoint().clone());
        let mut sub = self.0.state.register_legacy();
        loop {
            let snapshot = tokio::select! {
                _ = req.context().cancelled() => return Ok(()),
                next = sub.recv() => match next {
                    Some(snapshot) => snapshot,
                    None => return Err(CallError::Unavailable(FELL_BEHIND.to_string())),
                },
            };
            if sink.write_json(&snapshot).await.is_err() {
                debug!(peer = %req.remote().short(), "endpoints subscriber went away");
                return Ok(());
            }
        }
    }
}

/// Typed join/leave deltas after an initial state.
pub(super) struct Attendants(pub(super) Arc<RoomContext>);

#[async_trait]
impl SourceHandler for Attendants {
    async fn handle_source(&self, req: &Request, mut sink: ByteSink) -> Result<(), CallError> {
        counters::calls_total(req.call_type.as_str());
        self.0
            .state
            .add_endpoint(*req.remote(), req.endpoint().clone());
        let mut sub = self.0.state.register_attendants();
        loop {
            let event = tokio::select! {
                _ = req.context().cancelled() => return Ok(()),
                next = sub.recv() => match next {
                    Some(event) => event,
                    None => return Err(CallError::Unavailable(FELL_BEHIND.to_string())),
                },
            };
            if sink.write_json(&event).await.is_err() {
                debug!(peer = %req.remote().short(), "attendants subscriber went away");
                return Ok(());
            }
        }
    }
}

/// One `[{"id": feed}]` packet per stored member.
pub(super) struct Members(pub(super) Arc<RoomContext>);

#[async_trait]
impl SourceHandler for Members {
    async fn handle_source(&self, req: &Request, mut sink: ByteSink) -> Result<(), CallError> {
        counters::calls_total(req.call_type.as_str());
        let members = self
            .0
            .db
            .members
            .list()
            .await
            .map_err(|e| CallError::Failed(format!("failed to list members: {e}")))?;
        for member in members {
            sink.write_json(&json!([{ "id": member.feed }])).await?;
        }
        Ok(())
    }
}
