use std::env;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3012;
pub const DEFAULT_STUN_PORT: u16 = 3478;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// UDP port for the STUN binding server; 0 disables it.
    pub stun_port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind: env::var("SKIFF_RELAY_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string()),
            port: env::var("SKIFF_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            stun_port: env::var("SKIFF_STUN_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_STUN_PORT),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn stun_addr(&self) -> Option<String> {
        (self.stun_port != 0).then(|| format!("{}:{}", self.bind, self.stun_port))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            stun_port: DEFAULT_STUN_PORT,
        }
    }
}
