use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser};
use skiff::config::{AddressingPolicy, Config, keepalive_from_secs, normalize_host, parse_stun_urls};
use skiff::telemetry::logging::{self as logctl, LogConfig, LogLevel};
use skiff::transport::webrtc::WebRtcTransportFactory;
use skiff::{Peer, PeerEvent, PeerId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(
    name = "skiff",
    about = "Chat over a direct data channel negotiated through a relay",
    version
)]
struct Cli {
    #[arg(long, env = "SKIFF_RELAY_HOST", help = "Relay host (default 127.0.0.1)")]
    relay_host: Option<String>,

    #[arg(long, env = "SKIFF_RELAY_PORT", help = "Relay port (default 3012)")]
    relay_port: Option<u16>,

    #[arg(
        long = "stun",
        value_name = "URLS",
        env = "SKIFF_STUN_URLS",
        help = "Comma-separated STUN URLs; empty disables STUN"
    )]
    stun_urls: Option<String>,

    #[arg(long, env = "SKIFF_CHANNEL_LABEL")]
    channel_label: Option<String>,

    #[arg(
        long,
        value_enum,
        env = "SKIFF_MISADDRESSED",
        help = "What to do with frames addressed to another peer"
    )]
    misaddressed: Option<AddressingPolicy>,

    #[arg(long, env = "SKIFF_KEEPALIVE_SECS", help = "Relay ping interval, 0 disables")]
    keepalive_secs: Option<u64>,

    #[arg(long, value_name = "PEER", help = "Connect to this peer once the relay assigns us an id")]
    connect: Option<PeerId>,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "SKIFF_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "SKIFF_LOG_FILE",
        help = "Write logs to the specified file instead of stderr"
    )]
    file: Option<PathBuf>,
}

impl LoggingArgs {
    fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

impl Cli {
    /// Flags win over the environment, which wins over defaults.
    fn to_config(&self) -> Config {
        let mut config = Config::from_env();
        if let Some(host) = &self.relay_host {
            config.relay_host = normalize_host(host.clone());
            if self.stun_urls.is_none() {
                config.stun_urls = skiff::config::default_stun_urls(&config.relay_host);
            }
        }
        if let Some(port) = self.relay_port {
            config.relay_port = port;
        }
        if let Some(urls) = &self.stun_urls {
            config.stun_urls = parse_stun_urls(urls);
        }
        if let Some(label) = &self.channel_label {
            config.channel_label = label.clone();
        }
        if let Some(policy) = self.misaddressed {
            config.addressing = policy;
        }
        if let Some(secs) = self.keepalive_secs {
            config.keepalive = keepalive_from_secs(secs);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logctl::init(&log_config).context("logging initialization failed")?;
    let config = cli.to_config();
    debug!(?config, "configuration resolved");

    let factory = Arc::new(
        WebRtcTransportFactory::new(&config.stun_urls).context("webrtc setup failed")?,
    );
    let url = config.relay_url().context("invalid relay address")?;
    let (peer, mut events) = Peer::open(&config, factory)
        .await
        .with_context(|| format!("could not reach relay at {url}"))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending_connect = cli.connect;
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    break;
                };
                match event {
                    PeerEvent::Open { identity } => {
                        println!("* your id: {identity}");
                        if let Some(target) = pending_connect.take() {
                            report(peer.connect(&target).await);
                        }
                    }
                    PeerEvent::Connected { remote } => println!("* connected to {remote}"),
                    PeerEvent::Message { remote, payload } => {
                        println!("{remote}: {}", String::from_utf8_lossy(&payload));
                    }
                    PeerEvent::Closed { remote } => println!("* {remote} closed the channel"),
                    PeerEvent::NegotiationError { remote, reason } => {
                        println!("! negotiation with {remote} failed: {reason}");
                    }
                    PeerEvent::LinkFailed { reason } => println!("! relay link lost: {reason}"),
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else {
                    break;
                };
                handle_line(&peer, line.trim()).await;
            }
        }
    }
    Ok(())
}

/// `/connect ID`, `/close ID` and `/to ID TEXT` are commands; any other line
/// is sent to the single connected peer.
async fn handle_line(peer: &Peer, line: &str) {
    if line.is_empty() {
        return;
    }
    let mut parts = line.splitn(3, ' ');
    let result = match (parts.next(), parts.next(), parts.next()) {
        (Some("/connect"), Some(id), None) => match id.parse::<PeerId>() {
            Ok(target) => peer.connect(&target).await,
            Err(err) => Err(err.into()),
        },
        (Some("/close"), Some(id), None) => match id.parse::<PeerId>() {
            Ok(target) => peer.close(&target).await,
            Err(err) => Err(err.into()),
        },
        (Some("/to"), Some(id), Some(text)) => match id.parse::<PeerId>() {
            Ok(target) => peer.send_to(&target, text.to_string()).await,
            Err(err) => Err(err.into()),
        },
        _ => peer.send(line.to_string()).await,
    };
    report(result);
}

fn report(result: skiff::Result<()>) {
    if let Err(err) = result {
        println!("! {err}");
    }
}
