use crate::engine::EngineSettings;
use crate::errors::ClusterViewError;
use crate::logging::{JsonlLogger, DEFAULT_DISK_BUDGET_BYTES, DEFAULT_MAX_PAYLOAD_BYTES};
use crate::operations::{OperationPolicies, WaitPolicy};
use crate::runtime::FileSystem;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub profile: Option<String>,
    pub refresh_interval: Option<u32>,
    pub no_auto_refresh: bool,
    pub log_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub refresh: RefreshConfig,
    pub operations: OperationsConfig,
    pub console: ConsoleConfig,
    pub logging: LoggingConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshConfig {
    pub interval_secs: u32,
    pub auto_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationsConfig {
    pub poll_interval_secs: u64,
    pub max_wait_secs: u64,
    pub migrate_poll_interval_secs: u64,
    pub migrate_max_wait_secs: u64,
    pub restart_uptime_slack_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleConfig {
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub path: Option<PathBuf>,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfig {
    pub profile: String,
    /// TOML inventory loaded into the simulated cluster instead of the demo.
    pub inventory: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            refresh: RefreshConfig {
                interval_secs: crate::refresh::DEFAULT_INTERVAL_SECS,
                auto_start: true,
            },
            operations: OperationsConfig {
                poll_interval_secs: 2,
                max_wait_secs: 120,
                migrate_poll_interval_secs: 3,
                migrate_max_wait_secs: 300,
                restart_uptime_slack_secs: 10,
            },
            console: ConsoleConfig {
                poll_interval_secs: 5,
            },
            logging: LoggingConfig {
                path: None,
                max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
                budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
            },
            cluster: ClusterConfig {
                profile: "default".to_string(),
                inventory: None,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    refresh: Option<PartialRefreshConfig>,
    operations: Option<PartialOperationsConfig>,
    console: Option<PartialConsoleConfig>,
    logging: Option<PartialLoggingConfig>,
    cluster: Option<PartialClusterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialRefreshConfig {
    interval_secs: Option<u32>,
    auto_start: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialOperationsConfig {
    poll_interval_secs: Option<u64>,
    max_wait_secs: Option<u64>,
    migrate_poll_interval_secs: Option<u64>,
    migrate_max_wait_secs: Option<u64>,
    restart_uptime_slack_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialConsoleConfig {
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    path: Option<PathBuf>,
    max_payload_bytes: Option<usize>,
    budget_bytes: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialClusterConfig {
    profile: Option<String>,
    inventory: Option<PathBuf>,
}

pub fn load_config(
    overrides: &CliOverrides,
    fs: &dyn FileSystem,
) -> Result<AppConfig, ClusterViewError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        cfg = parse_config_str(&file_contents)?;
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Merges a TOML document over the defaults without validating it.
pub fn parse_config_str(text: &str) -> Result<AppConfig, ClusterViewError> {
    let partial: PartialAppConfig =
        toml::from_str(text).map_err(|e| ClusterViewError::ConfigParse(e.to_string()))?;
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, partial);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(refresh) = partial.refresh {
        if let Some(value) = refresh.interval_secs {
            cfg.refresh.interval_secs = value;
        }
        if let Some(value) = refresh.auto_start {
            cfg.refresh.auto_start = value;
        }
    }

    if let Some(operations) = partial.operations {
        if let Some(value) = operations.poll_interval_secs {
            cfg.operations.poll_interval_secs = value;
        }
        if let Some(value) = operations.max_wait_secs {
            cfg.operations.max_wait_secs = value;
        }
        if let Some(value) = operations.migrate_poll_interval_secs {
            cfg.operations.migrate_poll_interval_secs = value;
        }
        if let Some(value) = operations.migrate_max_wait_secs {
            cfg.operations.migrate_max_wait_secs = value;
        }
        if let Some(value) = operations.restart_uptime_slack_secs {
            cfg.operations.restart_uptime_slack_secs = value;
        }
    }

    if let Some(console) = partial.console {
        if let Some(value) = console.poll_interval_secs {
            cfg.console.poll_interval_secs = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(path) = logging.path {
            cfg.logging.path = Some(path);
        }
        if let Some(value) = logging.max_payload_bytes {
            cfg.logging.max_payload_bytes = value;
        }
        if let Some(value) = logging.budget_bytes {
            cfg.logging.budget_bytes = value;
        }
    }

    if let Some(cluster) = partial.cluster {
        if let Some(profile) = cluster.profile {
            cfg.cluster.profile = profile;
        }
        if let Some(inventory) = cluster.inventory {
            cfg.cluster.inventory = Some(inventory);
        }
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if let Some(profile) = &overrides.profile {
        cfg.cluster.profile = profile.clone();
    }
    if let Some(interval) = overrides.refresh_interval {
        cfg.refresh.interval_secs = interval;
    }
    if overrides.no_auto_refresh {
        cfg.refresh.auto_start = false;
    }
    if let Some(path) = &overrides.log_path {
        cfg.logging.path = Some(path.clone());
    }
}

pub fn validate_config(cfg: &AppConfig) -> Result<(), ClusterViewError> {
    if cfg.refresh.interval_secs == 0 {
        return Err(ClusterViewError::InvalidConfig(
            "refresh.interval_secs must be greater than zero".to_string(),
        ));
    }

    let ops = &cfg.operations;
    if ops.poll_interval_secs == 0 || ops.migrate_poll_interval_secs == 0 {
        return Err(ClusterViewError::InvalidConfig(
            "operations poll intervals must be greater than zero".to_string(),
        ));
    }
    if ops.max_wait_secs < ops.poll_interval_secs
        || ops.migrate_max_wait_secs < ops.migrate_poll_interval_secs
    {
        return Err(ClusterViewError::InvalidConfig(
            "operations max wait must be at least one poll interval".to_string(),
        ));
    }

    if cfg.console.poll_interval_secs == 0 {
        return Err(ClusterViewError::InvalidConfig(
            "console.poll_interval_secs must be greater than zero".to_string(),
        ));
    }

    if cfg.cluster.profile.trim().is_empty() {
        return Err(ClusterViewError::InvalidConfig(
            "cluster.profile must not be empty".to_string(),
        ));
    }

    Ok(())
}

impl AppConfig {
    pub fn operation_policies(&self) -> OperationPolicies {
        let ops = &self.operations;
        OperationPolicies {
            default_wait: WaitPolicy {
                poll_interval: Duration::from_secs(ops.poll_interval_secs),
                max_wait: Duration::from_secs(ops.max_wait_secs),
            },
            migrate_wait: WaitPolicy {
                poll_interval: Duration::from_secs(ops.migrate_poll_interval_secs),
                max_wait: Duration::from_secs(ops.migrate_max_wait_secs),
            },
            restart_slack_secs: ops.restart_uptime_slack_secs,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            refresh_interval_secs: self.refresh.interval_secs,
            auto_refresh: self.refresh.auto_start,
            console_poll: Duration::from_secs(self.console.poll_interval_secs),
            policies: self.operation_policies(),
            ..EngineSettings::default()
        }
    }

    pub fn run_logger(&self) -> Option<JsonlLogger> {
        self.logging.path.as_ref().map(|path| JsonlLogger {
            path: path.clone(),
            max_payload_bytes: self.logging.max_payload_bytes,
            budget_bytes: self.logging.budget_bytes,
        })
    }
}
