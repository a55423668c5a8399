//! Configuration loading and validation.
//!
//! Settings are layered: built-in defaults < user config < explicit config
//! file < command-line overrides. [`ResolvedConfig::resolve`] turns the merged
//! layers into the typed configuration consumed by each component. Invalid
//! values never abort startup: they fall back to defaults and surface as
//! [`SettingsEvent`] warnings.

pub mod settings;
pub mod timing;
pub mod user;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub use settings::{
    BridgeSettings, CacheSettings, OracleSettings, SchedulerSettings, Settings, merge_all,
    merge_settings,
};
pub use timing::DebounceInterval;
pub use user::{load_settings_file, load_user_config, user_config_path};

use crate::bridge::BridgeConfig;
use crate::health::RestartPolicy;
use crate::scheduler::{SchedulerConfig, default_max_in_flight};
use crate::transport::TransportConfig;

const LOG_TARGET: &str = "oracle_ls::config";

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Default compilation cache capacity (artifacts).
pub const DEFAULT_COMPILATION_CAPACITY: usize = 30;
/// Upper bound accepted for the compilation cache capacity.
pub const MAX_COMPILATION_CAPACITY: usize = 1024;
/// Default reference library budget (20 MiB).
pub const DEFAULT_REFERENCE_BUDGET_BYTES: usize = 20 * 1024 * 1024;
/// Default symbol database budget (50 MiB).
pub const DEFAULT_SYMBOL_BUDGET_BYTES: usize = 50 * 1024 * 1024;
/// Default aging factor: a ready request older than `factor × debounce` is
/// served ahead of fresher higher-priority work.
pub const DEFAULT_AGING_FACTOR: u32 = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{name} = {value} is out of range (expected {expected})")]
    OutOfRange {
        name: &'static str,
        value: String,
        expected: String,
    },

    #[error("no oracle command configured (set [oracle].command or pass --oracle)")]
    MissingOracleCommand,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsEventKind {
    Info,
    Warning,
}

/// Something worth telling the user about while loading settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SettingsEvent {
    pub kind: SettingsEventKind,
    pub message: String,
}

impl SettingsEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            kind: SettingsEventKind::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            kind: SettingsEventKind::Warning,
            message: message.into(),
        }
    }

    /// Forward the event to the logger.
    pub fn log(&self) {
        match self.kind {
            SettingsEventKind::Info => log::info!(target: LOG_TARGET, "{}", self.message),
            SettingsEventKind::Warning => log::warn!(target: LOG_TARGET, "{}", self.message),
        }
    }
}

#[derive(Debug, Default)]
pub struct SettingsLoadOutcome {
    pub settings: Settings,
    pub events: Vec<SettingsEvent>,
}

/// Load and merge all settings layers.
///
/// A broken user config is reported as a warning and skipped; a broken
/// explicitly requested file is an error, since the user asked for it.
pub fn load_settings(
    explicit: Option<&Path>,
    overrides: Settings,
) -> Result<SettingsLoadOutcome, ConfigError> {
    let mut events = Vec::new();

    let user = match load_user_config() {
        Ok(Some(settings)) => {
            events.push(SettingsEvent::info("Loaded user config"));
            Some(settings)
        }
        Ok(None) => None,
        Err(err) => {
            events.push(SettingsEvent::warning(format!(
                "Failed to load user config: {}",
                crate::error::error_chain(&err)
            )));
            None
        }
    };

    let file = match explicit {
        Some(path) => {
            let settings = load_settings_file(path)?;
            events.push(SettingsEvent::info(format!(
                "Loaded config file {}",
                path.display()
            )));
            Some(settings)
        }
        None => None,
    };

    let settings = merge_all(&[user, file, Some(overrides)]);
    Ok(SettingsLoadOutcome { settings, events })
}

/// Cache sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub compilation_capacity: usize,
    pub reference_budget_bytes: usize,
    pub symbol_budget_bytes: usize,
    pub preload_modules: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            compilation_capacity: DEFAULT_COMPILATION_CAPACITY,
            reference_budget_bytes: DEFAULT_REFERENCE_BUDGET_BYTES,
            symbol_budget_bytes: DEFAULT_SYMBOL_BUDGET_BYTES,
            preload_modules: Vec::new(),
        }
    }
}

/// Fully validated configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub bridge: BridgeConfig,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
}

impl ResolvedConfig {
    /// Validate merged settings.
    ///
    /// Only a missing oracle command is fatal; every other invalid value is
    /// replaced by its default and reported as a warning event.
    pub fn resolve(settings: &Settings) -> Result<(Self, Vec<SettingsEvent>), ConfigError> {
        let mut events = Vec::new();

        let command = settings
            .oracle
            .command
            .clone()
            .filter(|c| !c.trim().is_empty())
            .ok_or(ConfigError::MissingOracleCommand)?;
        let transport = TransportConfig {
            command,
            args: settings.oracle.args.clone().unwrap_or_default(),
            env: settings.oracle.env.clone().unwrap_or_default(),
            cwd: settings.oracle.cwd.clone(),
        };

        let call_timeout = match settings.bridge.call_timeout_ms {
            None => DEFAULT_CALL_TIMEOUT,
            Some(0) => {
                events.push(out_of_range_warning(
                    "bridge.call_timeout_ms",
                    0,
                    DEFAULT_CALL_TIMEOUT.as_millis(),
                ));
                DEFAULT_CALL_TIMEOUT
            }
            Some(ms) => Duration::from_millis(ms),
        };

        let defaults = RestartPolicy::default();
        let max_consecutive_timeouts = match settings.bridge.max_consecutive_timeouts {
            None => defaults.max_consecutive_timeouts,
            Some(0) => {
                events.push(out_of_range_warning(
                    "bridge.max_consecutive_timeouts",
                    0,
                    defaults.max_consecutive_timeouts,
                ));
                defaults.max_consecutive_timeouts
            }
            Some(n) => n,
        };
        let restart = RestartPolicy {
            max_restarts: settings.bridge.max_restarts.unwrap_or(defaults.max_restarts),
            window: settings
                .bridge
                .restart_window_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.window),
            backoff: settings
                .bridge
                .restart_backoff_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff),
            max_consecutive_timeouts,
        };

        let debounce = match settings.scheduler.debounce_ms {
            None => DebounceInterval::default(),
            Some(ms) => match DebounceInterval::from_millis(ms) {
                Ok(interval) => interval,
                Err(err) => {
                    events.push(SettingsEvent::warning(format!(
                        "{}; using default {}ms",
                        err,
                        DebounceInterval::default().as_duration().as_millis()
                    )));
                    DebounceInterval::default()
                }
            },
        };

        let max_in_flight = match settings.scheduler.max_in_flight {
            None => default_max_in_flight(),
            Some(0) => {
                events.push(out_of_range_warning(
                    "scheduler.max_in_flight",
                    0,
                    default_max_in_flight(),
                ));
                default_max_in_flight()
            }
            Some(n) => n,
        };

        let aging_factor = match settings.scheduler.aging_factor {
            None => DEFAULT_AGING_FACTOR,
            Some(0) => {
                events.push(out_of_range_warning(
                    "scheduler.aging_factor",
                    0,
                    DEFAULT_AGING_FACTOR,
                ));
                DEFAULT_AGING_FACTOR
            }
            Some(n) => n,
        };

        let compilation_capacity = match settings.cache.compilation_capacity {
            None => DEFAULT_COMPILATION_CAPACITY,
            Some(n) if (1..=MAX_COMPILATION_CAPACITY).contains(&n) => n,
            Some(n) => {
                events.push(out_of_range_warning(
                    "cache.compilation_capacity",
                    n,
                    DEFAULT_COMPILATION_CAPACITY,
                ));
                DEFAULT_COMPILATION_CAPACITY
            }
        };

        let reference_budget_bytes = nonzero_or_default(
            settings.cache.reference_budget_bytes,
            DEFAULT_REFERENCE_BUDGET_BYTES,
            "cache.reference_budget_bytes",
            &mut events,
        );
        let symbol_budget_bytes = nonzero_or_default(
            settings.cache.symbol_budget_bytes,
            DEFAULT_SYMBOL_BUDGET_BYTES,
            "cache.symbol_budget_bytes",
            &mut events,
        );

        let resolved = ResolvedConfig {
            bridge: BridgeConfig {
                transport,
                call_timeout,
                restart,
            },
            scheduler: SchedulerConfig {
                debounce,
                max_in_flight,
                aging: debounce.as_duration() * aging_factor,
            },
            cache: CacheConfig {
                compilation_capacity,
                reference_budget_bytes,
                symbol_budget_bytes,
                preload_modules: settings.cache.preload_modules.clone().unwrap_or_default(),
            },
        };
        Ok((resolved, events))
    }
}

fn nonzero_or_default(
    value: Option<usize>,
    default: usize,
    name: &str,
    events: &mut Vec<SettingsEvent>,
) -> usize {
    match value {
        None => default,
        Some(0) => {
            events.push(out_of_range_warning(name, 0, default));
            default
        }
        Some(n) => n,
    }
}

fn out_of_range_warning(
    name: &str,
    value: impl std::fmt::Display,
    default: impl std::fmt::Display,
) -> SettingsEvent {
    SettingsEvent::warning(format!(
        "{} = {} is invalid; using default {}",
        name, value, default
    ))
}
