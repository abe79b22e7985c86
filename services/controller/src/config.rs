use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::handler::HandlerConfig;
use crate::migration::CoordinatorConfig;
use crate::reconciler::ReconcilerConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// Back instances with the in-memory simulated runtime.
    pub dev_mode: bool,
    /// Host inventory.
    pub nodes: Vec<String>,
    pub loops: LoopConfig,
}

/// Tuning of the three control loops.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Period of the fallback re-evaluation tick. Loops also run on every
    /// store change.
    pub interval: Duration,
    pub reconciler: ReconcilerConfig,
    pub handler: HandlerConfig,
    pub coordinator: CoordinatorConfig,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: vmctl_reconcile::DEFAULT_RECONCILE_INTERVAL,
            reconciler: ReconcilerConfig::default(),
            handler: HandlerConfig::default(),
            coordinator: CoordinatorConfig::default(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {name}: {value:?}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let default_addr = SocketAddr::from(([127, 0, 0, 1], 8080));
        let listen_addr = parse_var(&lookup, "VMCTL_LISTEN_ADDR", default_addr)?;

        let log_level = lookup("VMCTL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = lookup("VMCTL_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let nodes: Vec<String> = lookup("VMCTL_NODES")
            .unwrap_or_else(|| "node-a,node-b".to_string())
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if nodes.is_empty() {
            anyhow::bail!("VMCTL_NODES must name at least one host");
        }

        let interval_ms = parse_var(&lookup, "VMCTL_RECONCILE_INTERVAL_MS", 500u64)?;
        if interval_ms == 0 {
            anyhow::bail!("VMCTL_RECONCILE_INTERVAL_MS must be positive");
        }
        let progress_timeout_secs =
            parse_var(&lookup, "VMCTL_MIGRATION_PROGRESS_TIMEOUT_SECS", 150u64)?;
        let completion_per_gib_secs =
            parse_var(&lookup, "VMCTL_MIGRATION_COMPLETION_TIMEOUT_PER_GIB_SECS", 800u64)?;
        let start_retries = parse_var(
            &lookup,
            "VMCTL_START_RETRIES",
            vmctl_reconcile::DEFAULT_MAX_RETRIES,
        )?;

        let interval = Duration::from_millis(interval_ms);
        let loops = LoopConfig {
            interval,
            reconciler: ReconcilerConfig::default(),
            handler: HandlerConfig {
                start_retries,
                ..HandlerConfig::default()
            },
            coordinator: CoordinatorConfig {
                progress_timeout: Duration::from_secs(progress_timeout_secs),
                completion_timeout_per_gib: Duration::from_secs(completion_per_gib_secs),
                progress_poll_interval: interval,
                ..CoordinatorConfig::default()
            },
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            nodes,
            loops,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.listen_addr.to_string(), "127.0.0.1:8080");
        assert_eq!(config.log_level, "info");
        assert!(!config.dev_mode);
        assert_eq!(config.nodes, ["node-a", "node-b"]);
        assert_eq!(config.loops.interval, Duration::from_millis(500));
        assert_eq!(config.loops.coordinator.progress_timeout, Duration::from_secs(150));
        assert_eq!(config.loops.handler.start_retries, 3);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("VMCTL_DEV", "true"),
            ("VMCTL_NODES", "h1, h2 ,,h3"),
            ("VMCTL_MIGRATION_PROGRESS_TIMEOUT_SECS", "5"),
            ("VMCTL_START_RETRIES", "7"),
            ("VMCTL_RECONCILE_INTERVAL_MS", "2000"),
        ])
        .unwrap();
        assert_eq!(config.loops.interval, Duration::from_secs(2));
        assert_eq!(config.loops.coordinator.progress_poll_interval, Duration::from_secs(2));
        assert!(config.dev_mode);
        assert_eq!(config.nodes, ["h1", "h2", "h3"]);
        assert_eq!(config.loops.coordinator.progress_timeout, Duration::from_secs(5));
        assert_eq!(config.loops.handler.start_retries, 7);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(config(&[("VMCTL_LISTEN_ADDR", "nowhere")]).is_err());
        assert!(config(&[("VMCTL_RECONCILE_INTERVAL_MS", "0")]).is_err());
        assert!(config(&[("VMCTL_NODES", " , ")]).is_err());
    }
}
