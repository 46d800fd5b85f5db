use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::ValueEnum;
use url::Url;

use crate::negotiation::EngineOptions;

pub const DEFAULT_RELAY_HOST: &str = "127.0.0.1";
pub const DEFAULT_RELAY_PORT: u16 = 3012;
pub const DEFAULT_STUN_PORT: u16 = 3478;
pub const DEFAULT_CHANNEL_LABEL: &str = "DATACHANNEL";
pub const DEFAULT_KEEPALIVE_SECS: u64 = 30;

/// What to do with a relay frame whose `dest` is not our identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum AddressingPolicy {
    /// Log and discard the frame.
    #[default]
    Drop,
    /// Treat it as a protocol violation and stop reading from the relay.
    Fatal,
}

impl AddressingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressingPolicy::Drop => "drop",
            AddressingPolicy::Fatal => "fatal",
        }
    }
}

impl fmt::Display for AddressingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AddressingPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(AddressingPolicy::Drop),
            "fatal" => Ok(AddressingPolicy::Fatal),
            other => Err(format!("unknown addressing policy {other:?}")),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub relay_host: String,
    pub relay_port: u16,
    /// Empty means host candidates only.
    pub stun_urls: Vec<String>,
    pub channel_label: String,
    pub addressing: AddressingPolicy,
    /// `None` disables relay pings.
    pub keepalive: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables. Unparseable values
    /// fall back to the default.
    pub fn from_env() -> Self {
        let relay_host = normalize_host(
            env::var("SKIFF_RELAY_HOST").unwrap_or_else(|_| DEFAULT_RELAY_HOST.to_string()),
        );
        let relay_port = env::var("SKIFF_RELAY_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(DEFAULT_RELAY_PORT);
        let stun_urls = match env::var("SKIFF_STUN_URLS") {
            Ok(urls) => parse_stun_urls(&urls),
            Err(_) => default_stun_urls(&relay_host),
        };
        let channel_label = env::var("SKIFF_CHANNEL_LABEL")
            .ok()
            .filter(|label| !label.is_empty())
            .unwrap_or_else(|| DEFAULT_CHANNEL_LABEL.to_string());
        let addressing = env::var("SKIFF_MISADDRESSED")
            .ok()
            .and_then(|policy| policy.parse().ok())
            .unwrap_or_default();
        let keepalive_secs = env::var("SKIFF_KEEPALIVE_SECS")
            .ok()
            .and_then(|secs| secs.parse().ok())
            .unwrap_or(DEFAULT_KEEPALIVE_SECS);

        Self {
            relay_host,
            relay_port,
            stun_urls,
            channel_label,
            addressing,
            keepalive: keepalive_from_secs(keepalive_secs),
        }
    }

    pub fn relay_url(&self) -> Result<Url, url::ParseError> {
        Url::parse(&format!("ws://{}:{}/", self.relay_host, self.relay_port))
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            channel_label: self.channel_label.clone(),
            addressing: self.addressing,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_host: DEFAULT_RELAY_HOST.to_string(),
            relay_port: DEFAULT_RELAY_PORT,
            stun_urls: default_stun_urls(DEFAULT_RELAY_HOST),
            channel_label: DEFAULT_CHANNEL_LABEL.to_string(),
            addressing: AddressingPolicy::Drop,
            keepalive: keepalive_from_secs(DEFAULT_KEEPALIVE_SECS),
        }
    }
}

/// `localhost` resolves to `::1` first on some systems while the relay
/// usually listens on IPv4 only.
pub fn normalize_host(host: String) -> String {
    if host.eq_ignore_ascii_case("localhost") {
        DEFAULT_RELAY_HOST.to_string()
    } else {
        host
    }
}

pub fn default_stun_urls(host: &str) -> Vec<String> {
    vec![format!("stun:{host}:{DEFAULT_STUN_PORT}")]
}

pub fn parse_stun_urls(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn keepalive_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "SKIFF_RELAY_HOST",
        "SKIFF_RELAY_PORT",
        "SKIFF_STUN_URLS",
        "SKIFF_CHANNEL_LABEL",
        "SKIFF_MISADDRESSED",
        "SKIFF_KEEPALIVE_SECS",
    ];

    fn clear_env() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn defaults_match_the_stock_deployment() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();

        let config = Config::from_env();
        assert_eq!(config, Config::default());
        assert_eq!(config.stun_urls, vec!["stun:127.0.0.1:3478".to_string()]);
        assert_eq!(config.relay_url().unwrap().as_str(), "ws://127.0.0.1:3012/");
        assert_eq!(config.keepalive, Some(Duration::from_secs(30)));
    }

    #[test]
    fn env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("SKIFF_RELAY_HOST", "localhost");
            env::set_var("SKIFF_RELAY_PORT", "4000");
            env::set_var("SKIFF_STUN_URLS", "stun:a.example:3478, stun:b.example:3478");
            env::set_var("SKIFF_MISADDRESSED", "FATAL");
            env::set_var("SKIFF_KEEPALIVE_SECS", "0");
        }

        let config = Config::from_env();
        assert_eq!(config.relay_host, "127.0.0.1");
        assert_eq!(config.relay_port, 4000);
        assert_eq!(
            config.stun_urls,
            vec![
                "stun:a.example:3478".to_string(),
                "stun:b.example:3478".to_string()
            ]
        );
        assert_eq!(config.addressing, AddressingPolicy::Fatal);
        assert_eq!(config.keepalive, None);

        clear_env();
    }

    #[test]
    fn empty_stun_list_disables_stun() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var("SKIFF_STUN_URLS", "");
            env::set_var("SKIFF_RELAY_PORT", "not-a-port");
        }

        let config = Config::from_env();
        assert!(config.stun_urls.is_empty());
        assert_eq!(config.relay_port, DEFAULT_RELAY_PORT);

        clear_env();
    }

    #[test]
    fn addressing_policy_parses() {
        assert_eq!("drop".parse(), Ok(AddressingPolicy::Drop));
        assert_eq!(" Fatal ".parse(), Ok(AddressingPolicy::Fatal));
        assert!("ignore".parse::<AddressingPolicy>().is_err());
    }
}
