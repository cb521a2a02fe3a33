use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, ValueEnum};
use room_common::{FeedRef, DEFAULT_NETWORK_CAP};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Who may connect and who may list the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum PrivacyMode {
    /// Anyone may join and list.
    Open,
    /// Anyone may join, members may list.
    Community,
    /// Only members may connect.
    Restricted,
}

impl PrivacyMode {
    /// Lowercase name used in logs and flags.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Community => "community",
            Self::Restricted => "restricted",
        }
    }
}

/// CLI arguments for the room server.
#[derive(Parser, Debug, Clone)]
#[command(name = "rooms")]
#[command(about = "Tunneling room server for Secure Scuttlebutt peers")]
#[command(version)]
pub struct Args {
    /// Socket address for raw TCP connections.
    #[arg(long, default_value = "0.0.0.0:8008", env = "ROOMS_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for WebSocket connections. Disabled when unset.
    #[arg(long, env = "ROOMS_WS_LISTEN")]
    pub ws_listen: Option<SocketAddr>,
    /// HTTP path the WebSocket upgrade is served on.
    #[arg(long, default_value = "/", env = "ROOMS_WS_PATH")]
    pub ws_path: String,
    /// Repository directory holding the secret and other state.
    /// Defaults to `~/.ssb-go`.
    #[arg(long, env = "ROOMS_REPO")]
    pub repo: Option<PathBuf>,
    /// Network capability key as base64. Defaults to the main SSB network.
    #[arg(long, env = "ROOMS_SHSCAP")]
    pub shscap: Option<String>,
    /// Path to the keypair file. Defaults to `<repo>/secret`.
    #[arg(long, env = "ROOMS_KEYPAIR")]
    pub keypair: Option<PathBuf>,
    /// Socket address for `/metrics`, `/health` and `/ready`.
    #[arg(long, default_value = "127.0.0.1:6078", env = "ROOMS_DEBUG_ADDR")]
    pub debug_addr: SocketAddr,
    /// Domain the room is reachable under; used in alias URLs.
    #[arg(long, default_value = "localhost", env = "ROOMS_DOMAIN")]
    pub domain: String,
    /// Serve aliases as `https://<alias>.<domain>` instead of a path.
    #[arg(long, env = "ROOMS_ALIAS_SUBDOMAINS")]
    pub alias_subdomains: bool,
    /// Privacy mode of the room.
    #[arg(long, value_enum, default_value = "community", env = "ROOMS_PRIVACY_MODE")]
    pub privacy_mode: PrivacyMode,
    /// Feed to register as a member. May be repeated.
    #[arg(long = "member", value_name = "FEED")]
    pub members: Vec<FeedRef>,
    /// Feed to refuse at the door. May be repeated.
    #[arg(long = "deny", value_name = "FEED")]
    pub denied: Vec<FeedRef>,
    /// Seconds a peer has to complete the secret handshake.
    #[arg(long, default_value = "10", env = "ROOMS_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Maximum concurrent connections, authenticated or not.
    #[arg(long, default_value = "10000", env = "ROOMS_MAX_CONNS")]
    pub max_conns: usize,
    /// Seconds to wait for sessions to finish on shutdown.
    #[arg(long, default_value = "30", env = "ROOMS_DRAIN_TIMEOUT")]
    pub drain_timeout: u64,
    /// Raise log verbosity (`-v` debug, `-vv` trace). `RUST_LOG` wins.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Repository directory after applying the default.
    #[must_use]
    pub fn repo_dir(&self) -> PathBuf {
        self.repo.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".ssb-go")
        })
    }

    /// Keypair path after applying the default.
    #[must_use]
    pub fn keypair_path(&self) -> PathBuf {
        self.keypair
            .clone()
            .unwrap_or_else(|| self.repo_dir().join("secret"))
    }
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen address.
    pub listen: SocketAddr,
    /// WebSocket listen address, if enabled.
    pub ws_listen: Option<SocketAddr>,
    /// WebSocket upgrade path.
    pub ws_path: String,
    /// Debug HTTP address.
    pub debug_addr: SocketAddr,
    /// Network capability key, still encoded. See [`ServerConfig::network_cap`].
    pub shscap: Option<String>,
    /// Public domain of the room.
    pub domain: String,
    /// Alias URL style.
    pub alias_subdomains: bool,
    /// Initial privacy mode.
    pub privacy_mode: PrivacyMode,
    /// Handshake deadline in seconds.
    pub handshake_timeout: u64,
    /// Connection cap.
    pub max_conns: usize,
    /// Shutdown drain deadline in seconds.
    pub drain_timeout: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.drain_timeout > 3600 {
            return Err("drain_timeout exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.domain.trim().is_empty() {
            return Err("domain must not be empty".to_string());
        }

        if !self.ws_path.starts_with('/') {
            return Err("ws_path must start with '/'".to_string());
        }

        self.network_cap()?;
        Ok(())
    }

    /// Decoded network capability.
    ///
    /// # Errors
    ///
    /// Returns a description when the override is not 32 bytes of base64.
    pub fn network_cap(&self) -> Result<[u8; 32], String> {
        let Some(encoded) = &self.shscap else {
            return Ok(DEFAULT_NETWORK_CAP);
        };
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| format!("shscap is not valid base64: {e}"))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| format!("shscap must decode to 32 bytes, got {}", bytes.len()))
    }

    /// Handshake deadline.
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Shutdown drain deadline.
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            ws_listen: args.ws_listen,
            ws_path: args.ws_path,
            debug_addr: args.debug_addr,
            shscap: args.shscap,
            domain: args.domain,
            alias_subdomains: args.alias_subdomains,
            privacy_mode: args.privacy_mode,
            handshake_timeout: args.handshake_timeout,
            max_conns: args.max_conns,
            drain_timeout: args.drain_timeout,
        }
    }
}
