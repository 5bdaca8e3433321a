//! browser-bridge host binary.
//!
//! stdout carries protocol traffic in both modes, so logs go to stderr.
//!
//! ```text
//! browser-bridge serve          # stdio JSON-RPC + WebSocket server
//! browser-bridge native-host    # length-prefixed stdio relayed to the server
//! ```

use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use browser_bridge::{Bridge, BridgeConfig, EventBus, NativeRelay};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// CLI
// ============================================================================

#[derive(Parser)]
#[command(name = "browser-bridge", version, about = "JSON-RPC bridge to live browser tabs")]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve JSON-RPC on stdio and accept extension peers (default)
    Serve {
        /// Do not start the WebSocket server
        #[arg(long)]
        no_socket: bool,
    },
    /// Relay native messaging on stdio to a running bridge
    NativeHost,
}

/// Flags layered over the environment.
#[derive(Args)]
struct Overrides {
    /// Socket server bind address
    #[arg(long, global = true, env = "BROWSER_BRIDGE_BIND")]
    bind: Option<IpAddr>,

    /// Socket server port (0 picks a free port)
    #[arg(long, global = true, env = "BROWSER_BRIDGE_PORT")]
    port: Option<u16>,

    /// Correlated request timeout in milliseconds
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,

    /// Reconnect attempts before the native host gives up
    #[arg(long, global = true)]
    max_reconnect_attempts: Option<u32>,

    /// Maximum reconnect delay in milliseconds; enables exponential backoff
    #[arg(long, global = true)]
    max_reconnect_delay_ms: Option<u64>,
}

impl Overrides {
    fn apply(self, mut config: BridgeConfig) -> BridgeConfig {
        if let Some(bind) = self.bind {
            config = config.with_bind_address(bind);
        }
        if let Some(port) = self.port {
            config = config.with_socket_port(port);
        }
        if let Some(ms) = self.request_timeout_ms {
            config = config.with_request_timeout(Duration::from_millis(ms));
        }
        if let Some(attempts) = self.max_reconnect_attempts {
            config = config.with_max_reconnect_attempts(Some(attempts));
        }
        if let Some(ms) = self.max_reconnect_delay_ms {
            config = config.with_exponential_backoff(Duration::from_millis(ms));
        }
        config
    }
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli
        .overrides
        .apply(BridgeConfig::from_env().context("reading BROWSER_BRIDGE_* environment")?);

    match cli.command.unwrap_or(Command::Serve { no_socket: false }) {
        Command::Serve { no_socket } => serve(config, no_socket).await,
        Command::NativeHost => native_host(config).await,
    }
}

/// Installs the stderr subscriber; `RUST_LOG` wins unless `--verbose`.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("browser_bridge=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("browser_bridge=info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// ============================================================================
// Modes
// ============================================================================

async fn serve(config: BridgeConfig, no_socket: bool) -> anyhow::Result<()> {
    let addr = config.socket_addr();
    let bridge = Bridge::builder()
        .config(config)
        .build()
        .context("invalid configuration")?;

    if !no_socket {
        let server = bridge
            .start_socket_server()
            .await
            .with_context(|| format!("binding socket server on {addr}"))?;
        info!(url = %server.ws_url(), "Accepting extension peers");
    }

    tokio::select! {
        () = bridge.serve_stdio() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Signal handler failed");
            }
        }
    }

    bridge.shutdown();
    Ok(())
}

async fn native_host(config: BridgeConfig) -> anyhow::Result<()> {
    config.validate().context("invalid configuration")?;
    info!(url = %config.socket_url(), "Starting native host relay");

    let relay = NativeRelay::stdio(&config, EventBus::new());
    relay.run().await;
    Ok(())
}
