use anyhow::{Context, Result};
use clap::Parser;
use skiff_relay::config::Config;
use skiff_relay::{RelayState, StunServer};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "skiff-relay", about = "Bootstrap relay for skiff peers")]
struct Cli {
    #[arg(long, env = "SKIFF_RELAY_BIND")]
    bind: Option<String>,

    #[arg(long, env = "SKIFF_RELAY_PORT")]
    port: Option<u16>,

    #[arg(long, env = "SKIFF_STUN_PORT", help = "STUN binding port (default 3478), 0 disables")]
    stun_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(stun_port) = cli.stun_port {
        config.stun_port = stun_port;
    }

    let _stun = match config.stun_addr() {
        Some(addr) => Some(
            StunServer::bind(&addr)
                .await
                .with_context(|| format!("failed to bind stun server on {addr}"))?,
        ),
        None => {
            info!("stun server disabled");
            None
        }
    };

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("skiff relay listening on {}", listener.local_addr()?);

    skiff_relay::serve(listener, RelayState::new())
        .await
        .context("relay server failed")
}
