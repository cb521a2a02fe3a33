#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use rooms::config::{Args, ServerConfig};
use rooms::keypair::load_or_generate_keypair;
use rooms::metrics::{start_metrics_server, HealthState};
use rooms::roomdb::{RoomDb, Role};
use rooms::{run_tcp, run_websocket, ServerState};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(verbose: u8) {
    let default = if verbose > 0 { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let keypair_path = args.keypair_path();
    let config: ServerConfig = args.clone().into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let keypair = load_or_generate_keypair(&keypair_path)?;

    let (db, stores) = RoomDb::in_memory(config.privacy_mode);
    for member in &args.members {
        stores.members.add(*member, Role::Member);
    }
    for denied in &args.denied {
        stores.denied.add(*denied);
    }

    let state = ServerState::new(config.clone(), keypair, db)?;
    info!(
        room = %state.room,
        mode = config.privacy_mode.as_str(),
        members = args.members.len(),
        "room identity loaded"
    );

    let tcp = TcpListener::bind(config.listen).await?;
    let ws = match config.ws_listen {
        Some(addr) => Some(TcpListener::bind(addr).await?),
        None => None,
    };

    let health_state = HealthState::new();
    tokio::spawn({
        let health_state = health_state.clone();
        let shutdown = state.root.clone();
        async move {
            if let Err(e) = start_metrics_server(config.debug_addr, health_state, shutdown).await {
                warn!("metrics server error: {}", e);
            }
        }
    });

    let tcp_task = tokio::spawn(run_tcp(tcp, state.clone()));
    let ws_task = ws.map(|listener| tokio::spawn(run_websocket(listener, state.clone())));

    shutdown_signal().await;
    info!("received shutdown signal");
    health_state.set_ready(false);

    let drained = state.shutdown().await;
    for task in std::iter::once(tcp_task).chain(ws_task) {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("listener error: {}", e),
            Err(e) => warn!("listener task failed: {}", e),
        }
    }

    if !drained {
        warn!("exiting with sessions still open");
    }
    info!("server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
