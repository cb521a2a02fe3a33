//! Per-connection pipeline shared by the TCP and WebSocket listeners:
//! handshake, admission, tracking, then a muxrpc session until either side
//! hangs up.

use crate::admission::admit;
use crate::error::RoomsError;
use crate::metrics::{counters, gauges, histograms};
use crate::server::ServerState;
use room_common::boxstream;
use room_common::handshake::server_handshake;
use room_common::muxrpc::start_session;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;

/// Serve one accepted transport until its session ends.
///
/// # Errors
///
/// Returns why the connection was dropped. Handshake failures are only
/// logged by the caller; the peer is never told the reason.
pub async fn handle_connection<S>(mut stream: S, state: Arc<ServerState>) -> Result<(), RoomsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let handshake = timeout(
        state.config.handshake_timeout(),
        server_handshake(&mut stream, &state.cap, &state.keypair),
    )
    .await;
    let outcome = match handshake {
        Ok(Ok(outcome)) => {
            counters::handshakes_total("ok");
            outcome
        }
        Ok(Err(e)) => {
            counters::handshakes_total("rejected");
            return Err(e.into());
        }
        Err(_) => {
            counters::handshakes_total("timeout");
            return Err(RoomsError::HandshakeTimeout);
        }
    };
    let remote = outcome.remote;

    if let Err(e) = admit(&state.db, &state.room, &remote).await {
        counters::handshakes_total("refused");
        return Err(e);
    }

    let admitted = state.tracker.on_accept(&state.root, remote).await?;
    debug!(peer = %remote.short(), conn = admitted.conn_id, "session admitted");
    gauges::inc_sessions_active();

    let (reader, writer) = boxstream::split(stream, &outcome.keys);
    let (endpoint, serve) = start_session(
        reader,
        writer,
        remote,
        Arc::clone(&state.mux),
        admitted.cancel.clone(),
    );
    let result = serve.await;

    let session_id = endpoint.id();
    if state
        .room_state
        .remove_if(&remote, |session| session.id() == session_id)
    {
        debug!(peer = %remote.short(), "left the room");
    }
    let lasted = state.tracker.on_close(&admitted);
    gauges::dec_sessions_active();
    histograms::session_duration_seconds(lasted.as_secs_f64());
    debug!(peer = %remote.short(), conn = admitted.conn_id, ?lasted, "session closed");

    result.map_err(RoomsError::from)
}
