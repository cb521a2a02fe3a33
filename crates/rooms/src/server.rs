use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RoomsError;
use crate::handlers::{build_mux, RoomContext};
use crate::roomdb::RoomDb;
use crate::roomstate::RoomState;
use crate::tracker::Tracker;
use crate::websocket;
use ed25519_dalek::SigningKey;
use room_common::muxrpc::HandlerMux;
use room_common::FeedRef;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Shared state for the room server.
pub struct ServerState {
    /// Runtime configuration.
    pub config: ServerConfig,
    /// Long-term identity of the room.
    pub keypair: SigningKey,
    /// The room's feed, derived from `keypair`.
    pub room: FeedRef,
    /// Network capability both sides must share.
    pub cap: [u8; 32],
    /// Admitted sessions by remote feed.
    pub tracker: Tracker,
    /// Announced peers.
    pub room_state: RoomState,
    /// Persistent stores.
    pub db: RoomDb,
    /// Method table shared by every session.
    pub mux: Arc<HandlerMux>,
    /// Cancelling this stops the listeners and every session.
    pub root: CancellationToken,
    /// Connection tasks, waited on during shutdown.
    pub tasks: TaskTracker,
    conn_limit: Arc<Semaphore>,
}

impl ServerState {
    /// Assemble the server around `keypair` and `db`.
    ///
    /// # Errors
    ///
    /// Fails when the network capability does not decode.
    pub fn new(
        config: ServerConfig,
        keypair: SigningKey,
        db: RoomDb,
    ) -> Result<Arc<Self>, RoomsError> {
        let cap = config.network_cap().map_err(RoomsError::Config)?;
        let room = FeedRef::ed25519(keypair.verifying_key().to_bytes());
        let room_state = RoomState::new();
        let ctx = Arc::new(RoomContext::new(
            room,
            room_state.clone(),
            db.clone(),
            config.domain.clone(),
            config.alias_subdomains,
        ));
        let mux = Arc::new(build_mux(ctx));
        let conn_limit = Arc::new(Semaphore::new(config.max_conns));
        Ok(Arc::new(Self {
            config,
            keypair,
            room,
            cap,
            tracker: Tracker::new(),
            room_state,
            db,
            mux,
            root: CancellationToken::new(),
            tasks: TaskTracker::new(),
            conn_limit,
        }))
    }

    /// Stop accepting, end every session and wait for them to finish.
    /// Returns false if some were still running at the drain deadline.
    pub async fn shutdown(&self) -> bool {
        self.root.cancel();
        self.tracker.close_all();
        self.tasks.close();
        let drained = tokio::time::timeout(self.config.drain_timeout(), self.tasks.wait())
            .await
            .is_ok();
        if drained {
            info!("all sessions drained");
        } else {
            warn!(
                remaining = self.tracker.count(),
                "drain timeout reached with sessions still active"
            );
        }
        drained
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Ingress {
    Tcp,
    WebSocket,
}

/// Accept raw TCP connections until the root token is cancelled.
///
/// # Errors
///
/// Returns an error if the listener's address cannot be read.
pub async fn run_tcp(listener: TcpListener, state: Arc<ServerState>) -> Result<(), RoomsError> {
    accept_loop(listener, state, Ingress::Tcp).await
}

/// Accept WebSocket upgrades on the configured path until the root token is
/// cancelled.
///
/// # Errors
///
/// Returns an error if the listener's address cannot be read.
pub async fn run_websocket(
    listener: TcpListener,
    state: Arc<ServerState>,
) -> Result<(), RoomsError> {
    accept_loop(listener, state, Ingress::WebSocket).await
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<ServerState>,
    ingress: Ingress,
) -> Result<(), RoomsError> {
    let local_addr = listener.local_addr()?;
    info!(?ingress, "listening on {}", local_addr);

    loop {
        let (stream, addr) = tokio::select! {
            _ = state.root.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    continue;
                }
            },
        };

        let Ok(permit) = Arc::clone(&state.conn_limit).try_acquire_owned() else {
            warn!("max connections reached, rejecting {}", addr);
            drop(stream);
            continue;
        };
        let state = Arc::clone(&state);
        state.tasks.clone().spawn(async move {
            let res = serve(stream, addr, Arc::clone(&state), ingress).await;
            if let Err(e) = res {
                match e {
                    RoomsError::WouldGhost => warn!("connection from {} refused: {}", addr, e),
                    other => debug!("connection from {} closed: {}", addr, other),
                }
            }
            drop(permit);
        });
    }

    info!(?ingress, "listener on {} stopped", local_addr);
    Ok(())
}

async fn serve(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<ServerState>,
    ingress: Ingress,
) -> Result<(), RoomsError> {
    let _ = stream.set_nodelay(true);
    debug!(?ingress, "accepted {}", addr);
    match ingress {
        Ingress::Tcp => handle_connection(stream, state).await,
        Ingress::WebSocket => {
            let upgraded = tokio::time::timeout(
                state.config.handshake_timeout(),
                websocket::accept(stream, &state.config.ws_path),
            )
            .await
            .map_err(|_| RoomsError::HandshakeTimeout)??;
            handle_connection(upgraded, state).await
        }
    }
}
