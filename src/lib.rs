//! Language-intelligence host for an external analysis oracle.
//!
//! The oracle is a long-lived subprocess speaking line-delimited JSON-RPC on
//! its stdio. This crate manages its lifecycle ([`transport`], [`bridge`],
//! [`health`]), coalesces bursty edits ([`scheduler`]) and caches what it
//! computes ([`cache`]). [`service`] ties these together and [`server`]
//! exposes them as a small line-delimited JSON front end.

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod scheduler;
pub mod server;
pub mod service;
pub mod transport;

pub use bridge::{Bridge, BridgeConfig, Oracle};
pub use config::{ResolvedConfig, Settings};
pub use error::{ErrorKind, OracleError, OracleResult, TransportError};
pub use health::{HealthStatus, RestartPolicy};
pub use scheduler::{Priority, Scheduled, Scheduler, SchedulerConfig};
pub use service::{AnalyzeParams, AnalyzeResponse, Facet, Service};
pub use transport::TransportConfig;
