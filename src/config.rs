//! Engine configuration: kubeconfig resolution inputs, bind address, history
//! limits and timeline storage variant. Populated from CLI flags via `clap`
//! and environment overrides, generalizing the donor's `ConfigLoader`/
//! `KideConfig`/`Environment` preset pattern.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::errors::{ConfigError, ConfigResult};

/// Timeline storage backend selection (§6 CLI surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lowercase")]
pub enum TimelineStorageKind {
    Memory,
    Sqlite,
}

/// CLI surface (§6): thin shell around the core.
#[derive(Debug, Parser, Clone)]
#[command(name = "kordon", about = "Local-first Kubernetes observability core")]
pub struct CliArgs {
    /// Explicit kubeconfig file path.
    #[arg(long, env = "KORDON_KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Comma-separated directory of kubeconfig files.
    #[arg(long, env = "KORDON_KUBECONFIG_DIR")]
    pub kubeconfig_dir: Option<String>,

    /// Namespace to pin to when cluster-scoped listing is denied.
    #[arg(long, env = "KORDON_NAMESPACE")]
    pub namespace: Option<String>,

    /// HTTP bind port for the read/subscription/control API.
    #[arg(long, default_value_t = 7777, env = "KORDON_PORT")]
    pub port: u16,

    /// Skip opening a browser window (the core never does this itself; kept
    /// for CLI-surface parity with collaborators that do).
    #[arg(long)]
    pub no_browser: bool,

    /// Maximum number of timeline events retained in memory.
    #[arg(long, default_value_t = 5000, env = "KORDON_HISTORY_LIMIT")]
    pub history_limit: usize,

    /// Timeline storage backend.
    #[arg(long, value_enum, default_value_t = TimelineStorageKind::Memory, env = "KORDON_TIMELINE_STORAGE")]
    pub timeline_storage: TimelineStorageKind,

    /// Path to the durable timeline file, required when `--timeline-storage sqlite`.
    #[arg(long, env = "KORDON_TIMELINE_DB_PATH")]
    pub timeline_db_path: Option<PathBuf>,

    /// Trace every change notification at `trace` level instead of just drops.
    #[arg(long)]
    pub debug_events: bool,
}

/// Resolved, validated engine configuration. Distinct from `CliArgs` so that
/// tests and embedders can construct one without going through `clap`.
#[derive(Debug, Clone)]
pub struct Config {
    pub kubeconfig: Option<PathBuf>,
    pub kubeconfig_dir: Vec<PathBuf>,
    pub namespace: Option<String>,
    pub port: u16,
    pub history_limit: usize,
    pub timeline_storage: TimelineStorageKind,
    pub timeline_db_path: Option<PathBuf>,
    pub debug_events: bool,

    /// How long a capability-prober verdict is cached before re-probing (§4.1: 60s).
    pub capability_cache_ttl: Duration,
    /// Sync-replay threshold for classifying an `add` as historical (§3: 30s).
    pub sync_replay_threshold: Duration,
    /// Bound on `ensure_watching`'s wait for an in-flight CRD discovery (§4.4: 45s).
    pub crd_discovery_wait: Duration,
    /// Bound on an informer's initial-sync wait (§4.4 step 6 / §5: 30s).
    pub initial_sync_timeout: Duration,
    /// Concurrency cap for `warmup_parallel` access probes (§4.4: 50).
    pub warmup_concurrency: usize,
    /// Change channel capacity (§4.5: ~10 000).
    pub change_channel_capacity: usize,
    /// Per-subscriber buffer capacity (§4.8).
    pub subscriber_buffer_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            kubeconfig_dir: Vec::new(),
            namespace: None,
            port: 7777,
            history_limit: 5000,
            timeline_storage: TimelineStorageKind::Memory,
            timeline_db_path: None,
            debug_events: false,
            capability_cache_ttl: Duration::from_secs(60),
            sync_replay_threshold: Duration::from_secs(30),
            crd_discovery_wait: Duration::from_secs(45),
            initial_sync_timeout: Duration::from_secs(30),
            warmup_concurrency: 50,
            change_channel_capacity: 10_000,
            subscriber_buffer_capacity: 1_000,
        }
    }
}

impl Config {
    /// Preset tuned for interactive development: shorter timeouts, smaller history.
    pub fn development() -> Self {
        Self {
            initial_sync_timeout: Duration::from_secs(10),
            history_limit: 500,
            ..Default::default()
        }
    }

    /// Preset tuned for long-running deployments: larger history, same timeouts.
    pub fn production() -> Self {
        Self {
            history_limit: 20_000,
            change_channel_capacity: 20_000,
            ..Default::default()
        }
    }

    /// Preset used by the integration test suite: tight timeouts, tiny buffers
    /// so backpressure/eviction properties (P4, P9) are reachable quickly.
    pub fn testing() -> Self {
        Self {
            capability_cache_ttl: Duration::from_millis(50),
            sync_replay_threshold: Duration::from_millis(50),
            crd_discovery_wait: Duration::from_millis(500),
            initial_sync_timeout: Duration::from_millis(500),
            warmup_concurrency: 4,
            change_channel_capacity: 16,
            subscriber_buffer_capacity: 4,
            history_limit: 100,
            ..Default::default()
        }
    }

    pub fn from_cli(args: CliArgs) -> ConfigResult<Self> {
        let kubeconfig_dir = args
            .kubeconfig_dir
            .as_deref()
            .map(|csv| csv.split(',').map(PathBuf::from).collect())
            .unwrap_or_default();

        if args.timeline_storage == TimelineStorageKind::Sqlite && args.timeline_db_path.is_none()
        {
            return Err(ConfigError::ValidationFailed {
                field: "timeline_db_path".to_string(),
                message: "required when --timeline-storage=sqlite".to_string(),
            });
        }

        let config = Self {
            kubeconfig: args.kubeconfig,
            kubeconfig_dir,
            namespace: args.namespace,
            port: args.port,
            history_limit: args.history_limit,
            timeline_storage: args.timeline_storage,
            timeline_db_path: args.timeline_db_path,
            debug_events: args.debug_events,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.history_limit == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "history_limit".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.change_channel_capacity == 0 {
            return Err(ConfigError::ValidationFailed {
                field: "change_channel_capacity".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn zero_history_limit_rejected() {
        let config = Config {
            history_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sqlite_without_path_rejected() {
        let args = CliArgs {
            kubeconfig: None,
            kubeconfig_dir: None,
            namespace: None,
            port: 7777,
            no_browser: false,
            history_limit: 100,
            timeline_storage: TimelineStorageKind::Sqlite,
            timeline_db_path: None,
            debug_events: false,
        };
        assert!(Config::from_cli(args).is_err());
    }

    #[test]
    fn testing_preset_has_tiny_buffers() {
        let config = Config::testing();
        assert_eq!(config.change_channel_capacity, 16);
        assert!(config.validate().is_ok());
    }
}
