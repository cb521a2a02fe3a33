//! `tunnel.connect`: splice the caller's duplex onto a fresh duplex on the
//! target's session.

use super::RoomContext;
use crate::metrics::counters;
use async_trait::async_trait;
use room_common::muxrpc::{
    ByteSink, ByteSource, CallError, DuplexHandler, Method, Request, StreamError,
};
use room_common::FeedRef;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ConnectArgs {
    portal: FeedRef,
    target: FeedRef,
}

pub(super) struct Connect(pub(super) Arc<RoomContext>);

#[async_trait]
impl DuplexHandler for Connect {
    async fn handle_duplex(
        &self,
        req: &Request,
        mut caller_src: ByteSource,
        mut caller_sink: ByteSink,
    ) -> Result<(), CallError> {
        counters::calls_total(req.call_type.as_str());
        let args: ConnectArgs = req.first_arg()?;
        let caller = *req.remote();

        if args.portal != self.0.room {
            return Err(CallError::Invalid(
                "talking to the wrong room".to_string(),
            ));
        }
        if args.target == caller {
            return Err(CallError::Invalid("can't connect to self".to_string()));
        }
        let Some(target) = self.0.state.has(&args.target) else {
            return Err(CallError::Unavailable(format!(
                "could not connect to:{}",
                args.target
            )));
        };

        let (mut target_src, mut target_sink) = target
            .duplex(
                Method::new(&["tunnel", "connect"]),
                json!([{ "portal": args.portal, "target": args.target, "origin": caller }]),
            )
            .await?;
        counters::tunnels_total();
        debug!(origin = %caller.short(), target = %args.target.short(), "tunnel open");

        // Whichever direction finishes first decides how both sinks end.
        let outcome = tokio::select! {
            res = forward(&mut target_src, &mut caller_sink) => res,
            res = forward(&mut caller_src, &mut target_sink) => res,
            _ = req.context().cancelled() => Err(StreamError::Cancelled),
            _ = target.context().cancelled() => Err(StreamError::SessionEnded),
        };
        debug!(origin = %caller.short(), target = %args.target.short(), "tunnel closed");

        match outcome {
            Ok(()) => {
                let _ = target_sink.close().await;
                Ok(())
            }
            Err(err) => {
                let err = CallError::from(err);
                let _ = target_sink.close_with_error(&err).await;
                Err(err)
            }
        }
    }
}

/// Copy packets from `src` to `sink` one for one until `src` ends.
async fn forward(src: &mut ByteSource, sink: &mut ByteSink) -> Result<(), StreamError> {
    while let Some(body) = src.next().await? {
        sink.set_body_type(body.body_type);
        sink.write(&body.data).await?;
        counters::tunnel_bytes_total(body.data.len() as u64);
    }
    Ok(())
}
