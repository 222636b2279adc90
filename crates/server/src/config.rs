//! Environment-backed server configuration, read once at startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default bind address when `COLLAB_BIND_ADDR` is unset.
const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_SESSION_TTL_HOURS: u64 = 24;
const DEFAULT_PRESENCE_TTL_SECS: u64 = 3600;
const DEFAULT_PRESENCE_OFFLINE_AFTER_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    /// Inactive collaboration sessions older than this are purged (§3).
    pub session_ttl: Duration,
    /// Presence cache entry lifetime, refreshed on activity (§6).
    pub presence_ttl: Duration,
    /// A user online longer than this without activity is flipped offline.
    pub presence_offline_after: Duration,
}

impl Config {
    /// Reads `COLLAB_BIND_ADDR`, `COLLAB_DB_PATH`, `COLLAB_SESSION_TTL_HOURS`,
    /// `COLLAB_PRESENCE_TTL_SECS`, `COLLAB_PRESENCE_OFFLINE_AFTER_SECS` from
    /// the environment, falling back to spec-mandated defaults.
    pub fn from_env() -> Self {
        let bind_addr = std::env::var("COLLAB_BIND_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.parse().expect("valid default bind addr"));

        let db_path = std::env::var("COLLAB_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_db_path());

        let session_ttl_hours = env_u64("COLLAB_SESSION_TTL_HOURS", DEFAULT_SESSION_TTL_HOURS);
        let presence_ttl_secs = env_u64("COLLAB_PRESENCE_TTL_SECS", DEFAULT_PRESENCE_TTL_SECS);
        let presence_offline_after_secs =
            env_u64("COLLAB_PRESENCE_OFFLINE_AFTER_SECS", DEFAULT_PRESENCE_OFFLINE_AFTER_SECS);

        Self {
            bind_addr,
            db_path,
            session_ttl: Duration::from_secs(session_ttl_hours * 3600),
            presence_ttl: Duration::from_secs(presence_ttl_secs),
            presence_offline_after: Duration::from_secs(presence_offline_after_secs),
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("collabgraph")
        .join("collab.db")
}
