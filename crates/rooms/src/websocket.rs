//! WebSocket ingress.
//!
//! After the upgrade the socket is bridged into an in-memory byte pipe:
//! every binary message is appended to the read side, and every chunk
//! written is sent as one binary message. The secret handshake then runs
//! over the pipe exactly as it does over TCP.

use crate::error::RoomsError;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const BRIDGE_BUFFER: usize = 64 * 1024;
/// Largest boxstream frame plus slack for batching.
const MAX_MESSAGE: usize = 1024 * 1024;

/// Complete the HTTP upgrade on `path` and return the bridged byte pipe.
///
/// # Errors
///
/// Fails when the upgrade is malformed or targets another path.
pub async fn accept<S>(stream: S, path: &str) -> Result<DuplexStream, RoomsError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let expected = path.to_string();
    let check_path = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == expected {
            Ok(resp)
        } else {
            let mut refused = ErrorResponse::new(Some("not found".to_string()));
            *refused.status_mut() = StatusCode::NOT_FOUND;
            Err(refused)
        }
    };
    let config = WebSocketConfig {
        max_message_size: Some(MAX_MESSAGE),
        max_frame_size: Some(MAX_MESSAGE),
        ..Default::default()
    };
    let ws =
        tokio_tungstenite::accept_hdr_async_with_config(stream, check_path, Some(config)).await?;
    Ok(bridge(ws))
}

/// Bridge an established WebSocket into a byte pipe. Works for either side
/// of the connection.
pub fn bridge<S>(ws: WebSocketStream<S>) -> DuplexStream
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (local, remote) = tokio::io::duplex(BRIDGE_BUFFER);
    tokio::spawn(async move {
        if let Err(e) = pump(ws, remote).await {
            tracing::debug!("websocket bridge closed: {}", e);
        }
    });
    local
}

async fn pump<S>(ws: WebSocketStream<S>, pipe: DuplexStream) -> Result<(), RoomsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (mut pipe_rx, mut pipe_tx) = tokio::io::split(pipe);

    let inbound = async {
        while let Some(msg) = ws_rx.next().await {
            match msg? {
                Message::Binary(data) => pipe_tx.write_all(&data).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        pipe_tx.shutdown().await?;
        Ok::<(), RoomsError>(())
    };

    let outbound = async {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            let n = pipe_rx.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            ws_tx.send(Message::Binary(buf[..n].to_vec())).await?;
        }
        let _ = ws_tx.close().await;
        Ok::<(), RoomsError>(())
    };

    tokio::select! {
        res = inbound => res,
        res = outbound => res,
    }
}
