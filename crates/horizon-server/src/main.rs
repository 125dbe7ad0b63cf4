//! Horizon relay server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate (development)
//! horizon-server --bind 0.0.0.0:4433
//!
//! # Start with TLS certificate (production)
//! horizon-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem
//! ```
//!
//! Every flag can also be set through its `HORIZON_*` environment variable.

use std::time::Duration;

use clap::Parser;
use horizon_core::{CredentialConfig, RegistryConfig, RelayConfig};
use horizon_server::{Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Horizon relay server
#[derive(Parser, Debug)]
#[command(name = "horizon-server")]
#[command(about = "End-to-end encrypted messenger relay")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, env = "HORIZON_BIND", default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long, env = "HORIZON_CERT")]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long, env = "HORIZON_KEY")]
    key: Option<String>,

    /// Maximum concurrent connections
    #[arg(long, env = "HORIZON_MAX_CONNECTIONS", default_value = "10000")]
    max_connections: usize,

    /// Seconds a client has to send its connect request
    #[arg(long, env = "HORIZON_HANDSHAKE_TIMEOUT_SECS", default_value = "10")]
    handshake_timeout_secs: u64,

    /// Seconds between heartbeat broadcasts
    #[arg(long, env = "HORIZON_HEARTBEAT_INTERVAL_SECS", default_value = "30")]
    heartbeat_interval_secs: u64,

    /// Seconds without a client heartbeat before eviction
    #[arg(long, env = "HORIZON_LIVENESS_TIMEOUT_SECS", default_value = "90")]
    liveness_timeout_secs: u64,

    /// Access token lifetime in minutes
    #[arg(long, env = "HORIZON_TOKEN_TTL_MINUTES", default_value = "30")]
    token_ttl_minutes: u64,

    /// Hours between signing key rotations
    #[arg(long, env = "HORIZON_KEY_ROTATION_HOURS", default_value = "24")]
    key_rotation_hours: u64,

    /// Retired signing keys kept for verification
    #[arg(long, env = "HORIZON_MAX_PREVIOUS_KEYS", default_value = "3")]
    max_previous_keys: usize,

    /// Admit connections without credentials (development only)
    #[arg(long, env = "HORIZON_ALLOW_UNAUTHENTICATED")]
    allow_unauthenticated: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HORIZON_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> ServerRuntimeConfig {
        ServerRuntimeConfig {
            bind_address: self.bind,
            cert_path: self.cert,
            key_path: self.key,
            max_connections: self.max_connections,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            relay: RelayConfig {
                registry: RegistryConfig {
                    heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
                    liveness_timeout: Duration::from_secs(self.liveness_timeout_secs),
                    ..RegistryConfig::default()
                },
                credentials: CredentialConfig {
                    token_ttl: Duration::from_secs(self.token_ttl_minutes * 60),
                    rotation_interval: Duration::from_secs(self.key_rotation_hours * 60 * 60),
                    max_previous_keys: self.max_previous_keys,
                    allow_unauthenticated: self.allow_unauthenticated,
                    ..CredentialConfig::default()
                },
            },
            ..ServerRuntimeConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(bind = %args.bind, "Horizon server starting");

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("This is NOT suitable for production use!");
    }
    if args.allow_unauthenticated {
        tracing::warn!("Unauthenticated connections are allowed - development only!");
    }

    let server = Server::bind(args.into_config())?;

    tracing::info!(addr = %server.local_addr()?, "server listening");

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
