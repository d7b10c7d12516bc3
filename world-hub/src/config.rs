use std::net::SocketAddr;
use std::path::PathBuf;

pub const DEFAULT_ADDR: &str = "127.0.0.1:3000";
pub const DEFAULT_SECRET: &str = "world-hub-dev-secret";

/// Server settings, read from the environment and overridden by CLI flags.
#[derive(Clone, Debug)]
pub struct Config {
    pub addr: SocketAddr,
    pub secret: String,
    /// JSON file listing the world's users. Without one, a single GM
    /// named `gm` is created.
    pub users: Option<PathBuf>,
    pub system_id: Option<String>,
    pub modules: Vec<String>,
    /// Accept an unauthenticated `X-User-Id` header in place of a token.
    pub allow_user_header: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            addr: std::env::var("WORLD_HUB_ADDR")
                .unwrap_or_else(|_| DEFAULT_ADDR.to_string())
                .parse()?,
            secret: std::env::var("WORLD_HUB_SECRET")
                .unwrap_or_else(|_| DEFAULT_SECRET.to_string()),
            users: std::env::var("WORLD_HUB_USERS").ok().map(PathBuf::from),
            system_id: std::env::var("WORLD_HUB_SYSTEM").ok(),
            modules: std::env::var("WORLD_HUB_MODULES")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            allow_user_header: std::env::var("WORLD_HUB_ALLOW_USER_HEADER")
                .is_ok_and(|raw| matches!(raw.trim(), "1" | "true" | "yes")),
        })
    }
}
