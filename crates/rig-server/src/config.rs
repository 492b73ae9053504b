//! Server configuration, loaded from the environment (spec §6.5).

use std::time::Duration;

use anyhow::{Context, Result};

/// Every tunable the server reads from the environment at startup.
/// Loaded once in `main` and handed around as `Arc<ServerConfig>`.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory for the artifact cache and JSONL logs.
    pub rig_dir: std::path::PathBuf,
    pub bind_addr: String,
    /// `"compact"` or `"json"`.
    pub log_format: String,
    pub port_range_min: u16,
    pub port_range_max: u16,
    pub watchdog_stall: Duration,
    pub refresh_interval: Duration,
    pub callback_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            rig_dir: env_or("RIG_DIR", "/var/lib/rig").into(),
            bind_addr: env_or("RIG_BIND_ADDR", "0.0.0.0:7777"),
            log_format: env_or("RIG_LOG_FORMAT", "compact"),
            port_range_min: parse_env("RIG_PORT_RANGE_MIN", rig_ports::DEFAULT_MIN_PORT)?,
            port_range_max: parse_env("RIG_PORT_RANGE_MAX", rig_ports::DEFAULT_MAX_PORT)?,
            watchdog_stall: Duration::from_secs(parse_env("RIG_WATCHDOG_STALL_SECS", 30)?),
            refresh_interval: Duration::from_secs(parse_env("RIG_REFRESH_INTERVAL_SECS", 3600)?),
            callback_timeout: Duration::from_secs(parse_env("RIG_CALLBACK_TIMEOUT_SECS", 30)?),
            shutdown_grace: Duration::from_secs(parse_env("RIG_SHUTDOWN_GRACE_SECS", 10)?),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("failed to parse {key}: {e}"))
            .context(format!("parsing {key}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        // SAFETY: test-only, single-threaded within this process's test harness.
        unsafe {
            std::env::remove_var("RIG_SHUTDOWN_GRACE_SECS");
        }
        let secs: u64 = parse_env("RIG_SHUTDOWN_GRACE_SECS", 10).unwrap();
        assert_eq!(secs, 10);
    }
}
