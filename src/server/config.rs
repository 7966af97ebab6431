use std::env;
use std::time::Duration;

/// Runtime configuration, read from the environment with defaults suitable
/// for a single-process deployment.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: String,
    /// How often the reaper sweeps the connection registry.
    pub reap_interval: Duration,
    /// A connection silent for longer than this is considered dead; three
    /// missed heartbeat cycles by default.
    pub stale_threshold: Duration,
    /// Per-node cap on retained hashrate samples.
    pub hashrate_retention: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, String> {
        let listen_addr =
            env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let reap_interval = Duration::from_secs(parse_var("REAP_INTERVAL_SECS", 30)?);
        let stale_threshold = Duration::from_secs(parse_var("STALE_THRESHOLD_SECS", 90)?);
        let hashrate_retention = parse_var("HASHRATE_RETENTION", 1000)? as usize;

        if stale_threshold < reap_interval {
            return Err("STALE_THRESHOLD_SECS must be >= REAP_INTERVAL_SECS".to_string());
        }

        Ok(ServerConfig {
            listen_addr,
            reap_interval,
            stale_threshold,
            hashrate_retention,
        })
    }
}

fn parse_var(name: &str, default: u64) -> Result<u64, String> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .map_err(|_| format!("{name} must be a positive integer")),
        Err(_) => Ok(default),
    }
}
