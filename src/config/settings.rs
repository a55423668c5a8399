//! Raw, layered settings as read from TOML.
//!
//! Every field is optional so that layers (defaults, user config, explicit
//! config file, command line) can be merged with later layers taking
//! precedence. Validation happens later in [`super::ResolvedConfig`].

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub oracle: OracleSettings,
    pub bridge: BridgeSettings,
    pub scheduler: SchedulerSettings,
    pub cache: CacheSettings,
}

/// How to launch the analysis oracle.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct OracleSettings {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BridgeSettings {
    pub call_timeout_ms: Option<u64>,
    pub max_consecutive_timeouts: Option<u32>,
    pub max_restarts: Option<u32>,
    pub restart_window_secs: Option<u64>,
    pub restart_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub debounce_ms: Option<u64>,
    pub max_in_flight: Option<usize>,
    pub aging_factor: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub compilation_capacity: Option<usize>,
    pub reference_budget_bytes: Option<usize>,
    pub symbol_budget_bytes: Option<usize>,
    pub preload_modules: Option<Vec<String>>,
}

/// Merge settings layers in order; later layers take precedence.
pub fn merge_all(layers: &[Option<Settings>]) -> Settings {
    layers
        .iter()
        .flatten()
        .cloned()
        .fold(Settings::default(), merge_settings)
}

/// Merge two layers, preferring values from `primary` over `fallback`.
pub fn merge_settings(fallback: Settings, primary: Settings) -> Settings {
    Settings {
        oracle: OracleSettings {
            command: primary.oracle.command.or(fallback.oracle.command),
            args: primary.oracle.args.or(fallback.oracle.args),
            env: merge_env(fallback.oracle.env, primary.oracle.env),
            cwd: primary.oracle.cwd.or(fallback.oracle.cwd),
        },
        bridge: BridgeSettings {
            call_timeout_ms: primary
                .bridge
                .call_timeout_ms
                .or(fallback.bridge.call_timeout_ms),
            max_consecutive_timeouts: primary
                .bridge
                .max_consecutive_timeouts
                .or(fallback.bridge.max_consecutive_timeouts),
            max_restarts: primary.bridge.max_restarts.or(fallback.bridge.max_restarts),
            restart_window_secs: primary
                .bridge
                .restart_window_secs
                .or(fallback.bridge.restart_window_secs),
            restart_backoff_ms: primary
                .bridge
                .restart_backoff_ms
                .or(fallback.bridge.restart_backoff_ms),
        },
        scheduler: SchedulerSettings {
            debounce_ms: primary.scheduler.debounce_ms.or(fallback.scheduler.debounce_ms),
            max_in_flight: primary
                .scheduler
                .max_in_flight
                .or(fallback.scheduler.max_in_flight),
            aging_factor: primary
                .scheduler
                .aging_factor
                .or(fallback.scheduler.aging_factor),
        },
        cache: CacheSettings {
            compilation_capacity: primary
                .cache
                .compilation_capacity
                .or(fallback.cache.compilation_capacity),
            reference_budget_bytes: primary
                .cache
                .reference_budget_bytes
                .or(fallback.cache.reference_budget_bytes),
            symbol_budget_bytes: primary
                .cache
                .symbol_budget_bytes
                .or(fallback.cache.symbol_budget_bytes),
            preload_modules: primary
                .cache
                .preload_modules
                .or(fallback.cache.preload_modules),
        },
    }
}

/// Environment maps merge key by key so a project layer can add one variable
/// without restating the user's.
fn merge_env(
    fallback: Option<BTreeMap<String, String>>,
    primary: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (fallback, primary) {
        (None, None) => None,
        (Some(env), None) | (None, Some(env)) => Some(env),
        (Some(mut fallback), Some(primary)) => {
            fallback.extend(primary);
            Some(fallback)
        }
    }
}
