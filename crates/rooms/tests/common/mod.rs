#![allow(dead_code)]

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use room_common::boxstream;
use room_common::handshake::{client_handshake, HandshakeError};
use room_common::muxrpc::{
    start_session, ByteSink, ByteSource, CallError, DuplexHandler, Endpoint, HandlerMux, Method,
    Request,
};
use room_common::{FeedRef, DEFAULT_NETWORK_CAP};
use rooms::config::{PrivacyMode, ServerConfig};
use rooms::roomdb::{MemoryStores, RoomDb};
use rooms::{run_tcp, run_websocket, ServerState};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const WAIT: Duration = Duration::from_secs(5);

/// Fail the test instead of hanging.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("timed out waiting")
}

pub fn test_config(listen: SocketAddr, mode: PrivacyMode) -> ServerConfig {
    ServerConfig {
        listen,
        ws_listen: None,
        ws_path: "/".to_string(),
        debug_addr: "127.0.0.1:0".parse().unwrap(),
        shscap: None,
        domain: "room.test".to_string(),
        alias_subdomains: false,
        privacy_mode: mode,
        handshake_timeout: 5,
        max_conns: 1000,
        drain_timeout: 5,
    }
}

pub struct TestRoom {
    pub addr: SocketAddr,
    pub ws_addr: SocketAddr,
    pub state: Arc<ServerState>,
    pub stores: MemoryStores,
}

impl TestRoom {
    pub fn feed(&self) -> FeedRef {
        self.state.room
    }
}

/// Start a room with both listeners on ephemeral ports.
pub async fn start_server(mode: PrivacyMode) -> TestRoom {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let ws_addr = ws_listener.local_addr().unwrap();

    let mut config = test_config(addr, mode);
    config.ws_listen = Some(ws_addr);
    let (db, stores) = RoomDb::in_memory(mode);
    let state = ServerState::new(config, SigningKey::generate(&mut OsRng), db).unwrap();

    tokio::spawn(run_tcp(listener, state.clone()));
    tokio::spawn(run_websocket(ws_listener, state.clone()));

    TestRoom {
        addr,
        ws_addr,
        state,
        stores,
    }
}

/// A tunnel the room opened towards a test peer.
pub struct IncomingTunnel {
    pub args: Value,
    pub source: ByteSource,
    pub sink: ByteSink,
    _keep_open: oneshot::Sender<()>,
}

struct AcceptTunnels(mpsc::UnboundedSender<IncomingTunnel>);

#[async_trait]
impl DuplexHandler for AcceptTunnels {
    async fn handle_duplex(
        &self,
        req: &Request,
        source: ByteSource,
        sink: ByteSink,
    ) -> Result<(), CallError> {
        let (keep_open, released) = oneshot::channel();
        let tunnel = IncomingTunnel {
            args: req.args.clone(),
            source,
            sink,
            _keep_open: keep_open,
        };
        if self.0.send(tunnel).is_err() {
            return Err(CallError::Unavailable("peer is not accepting tunnels".to_string()));
        }
        let _ = released.await;
        Ok(())
    }
}

/// A client session with the room.
pub struct TestPeer {
    pub key: SigningKey,
    pub feed: FeedRef,
    pub endpoint: Endpoint,
    pub session: JoinHandle<()>,
    tunnels: mpsc::UnboundedReceiver<IncomingTunnel>,
}

impl TestPeer {
    pub async fn connect(room: &TestRoom, key: &SigningKey) -> Self {
        Self::try_connect(room, key, &DEFAULT_NETWORK_CAP)
            .await
            .expect("handshake failed")
    }

    pub async fn connect_new(room: &TestRoom) -> Self {
        Self::connect(room, &SigningKey::generate(&mut OsRng)).await
    }

    pub async fn try_connect(
        room: &TestRoom,
        key: &SigningKey,
        cap: &[u8; 32],
    ) -> Result<Self, HandshakeError> {
        let stream = TcpStream::connect(room.addr).await.unwrap();
        Self::over(stream, room, key, cap).await
    }

    pub async fn connect_ws(room: &TestRoom, key: &SigningKey) -> Self {
        let stream = TcpStream::connect(room.ws_addr).await.unwrap();
        let url = format!("ws://{}/", room.ws_addr);
        let (ws, _) = tokio_tungstenite::client_async(url, stream).await.unwrap();
        let pipe = rooms::websocket::bridge(ws);
        Self::over(pipe, room, key, &DEFAULT_NETWORK_CAP)
            .await
            .expect("handshake failed")
    }

    async fn over<S>(
        mut stream: S,
        room: &TestRoom,
        key: &SigningKey,
        cap: &[u8; 32],
    ) -> Result<Self, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let outcome = within(client_handshake(&mut stream, cap, key, room.feed().key())).await?;

        let (tx, tunnels) = mpsc::unbounded_channel();
        let mut mux = HandlerMux::new();
        mux.register_duplex("tunnel.connect", Arc::new(AcceptTunnels(tx)));

        let (reader, writer) = boxstream::split(stream, &outcome.keys);
        let (endpoint, serve) = start_session(
            reader,
            writer,
            outcome.remote,
            Arc::new(mux),
            CancellationToken::new(),
        );
        let session = tokio::spawn(async move {
            let _ = serve.await;
        });

        Ok(Self {
            key: key.clone(),
            feed: FeedRef::ed25519(key.verifying_key().to_bytes()),
            endpoint,
            session,
            tunnels,
        })
    }

    pub async fn call(&self, method: &str, args: Value) -> Result<Value, CallError> {
        let body = within(self.endpoint.call_async(Method::from(method), args)).await?;
        body.json().map_err(CallError::from)
    }

    pub async fn source(&self, method: &str, args: Value) -> ByteSource {
        within(self.endpoint.source(Method::from(method), args))
            .await
            .unwrap()
    }

    pub async fn announce(&self) {
        assert_eq!(
            self.call("room.announce", Value::Null).await.unwrap(),
            Value::Bool(false)
        );
    }

    pub async fn incoming_tunnel(&mut self) -> IncomingTunnel {
        within(self.tunnels.recv()).await.expect("tunnel queue closed")
    }

    /// Say goodbye and wait for the session to wind down.
    pub async fn disconnect(self) {
        self.endpoint.terminate();
        within(self.session).await.unwrap();
    }
}

/// Next JSON value on a source, failing on end or error.
pub async fn next_json<T: DeserializeOwned>(source: &mut ByteSource) -> T {
    within(source.next_json())
        .await
        .expect("stream failed")
        .expect("stream ended")
}
