//! Request/response correlation over the oracle transport.
//!
//! # Architecture
//!
//! One [`Bridge`] owns at most one live [`Connection`] (transport + pending
//! table), swapped atomically with `ArcSwapOption` so callers never hold a
//! lock while awaiting a response:
//!
//! ```text
//! call() ──register──► ResponseRouter ◄──route── event loop ◄── events
//!    │                                               │
//!    └──send frame──► Transport (stdin)              └── exit/unresponsive
//!                                                          ──► recover()
//! ```
//!
//! Each connection has its own event loop task. When the oracle exits (or is
//! declared unresponsive after consecutive timeouts) the loop fails every
//! pending call with connection-lost and asks the health monitor whether to
//! restart. Every restart bumps the generation, published on a `watch`
//! channel so cache owners can drop artifacts that died with the old process.

pub mod protocol;
mod router;

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use log::{debug, error, info, warn};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

pub use protocol::RequestId;

use crate::error::{OracleError, OracleResult, TransportError, error_chain};
use crate::health::{HealthMonitor, HealthStatus, RestartDecision, RestartPolicy};
use crate::transport::{Transport, TransportConfig, TransportEvent};
use protocol::{DedupKey, Inbound, decode_inbound, encode_request};
use router::{Registration, ResponseRouter, RouteOutcome};

const LOG_TARGET: &str = "oracle_ls::bridge";
const ORACLE_LOG_TARGET: &str = "oracle_ls::oracle";

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub transport: TransportConfig,
    pub call_timeout: Duration,
    pub restart: RestartPolicy,
}

impl BridgeConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            call_timeout: crate::config::DEFAULT_CALL_TIMEOUT,
            restart: RestartPolicy::default(),
        }
    }
}

/// Anything that answers oracle method calls.
///
/// Implemented by [`Bridge`]; caches take `&impl Oracle` so they can be
/// exercised without a subprocess.
pub trait Oracle: Send + Sync {
    fn call(&self, method: &str, params: Value)
    -> impl Future<Output = OracleResult<Value>> + Send;
}

struct Connection {
    transport: Transport,
    router: Arc<ResponseRouter>,
    generation: u64,
    /// Cancelled when consecutive timeouts reach the escalation threshold.
    unresponsive: CancellationToken,
}

impl Connection {
    fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }
}

#[derive(Default)]
struct Lifecycle {
    stopped: bool,
}

pub struct Bridge {
    config: BridgeConfig,
    connection: ArcSwapOption<Connection>,
    health: Arc<HealthMonitor>,
    generation_tx: watch::Sender<u64>,
    /// Serializes start, stop and recovery.
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    this: Weak<Bridge>,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            health: Arc::new(HealthMonitor::new(config.restart)),
            config,
            connection: ArcSwapOption::empty(),
            generation_tx: watch::channel(0).0,
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Spawn the oracle if it is not already running, then ask it for its
    /// version (best effort).
    pub async fn start(&self) -> OracleResult<()> {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            lifecycle.stopped = false;
            if self.connection.load_full().is_some_and(|c| c.is_alive()) {
                return Ok(());
            }
            self.spawn_connection()?;
        }
        self.refresh_version().await;
        Ok(())
    }

    /// Fail every pending call with connection-closed, then stop the oracle.
    ///
    /// No restart follows a stop.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        lifecycle.stopped = true;
        if let Some(connection) = self.connection.swap(None) {
            let failed = connection.router.fail_all(RouteOutcome::ConnectionClosed);
            if failed > 0 {
                debug!(target: LOG_TARGET, "Closed {} pending call(s) on stop", failed);
            }
            connection.transport.stop().await;
            self.health.record_exit("stopped");
        }
    }

    /// Call with the configured default timeout.
    pub async fn call(&self, method: &str, params: Value) -> OracleResult<Value> {
        self.call_with_timeout(method, params, self.config.call_timeout)
            .await
    }

    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> OracleResult<Value> {
        let connection = self.connection.load_full().ok_or(OracleError::NotStarted)?;
        let dedup = DedupKey::new(method, &params).map_err(OracleError::Encode)?;

        let (id, rx, owner) = match connection.router.register(method, dedup) {
            Registration::New { id, rx } => (id, rx, true),
            Registration::Joined { id, rx } => {
                debug!(target: LOG_TARGET, "{} joins pending request #{}", method, id);
                (id, rx, false)
            }
        };

        // Writing and waiting share one deadline; an oracle that stops
        // reading its input blocks the write once the pipe is full.
        let deadline = tokio::time::Instant::now() + timeout;

        if owner {
            let sent = tokio::time::timeout_at(
                deadline,
                self.send(&connection, id, method, &params),
            )
            .await;
            match sent {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    connection.router.fail(
                        id,
                        RouteOutcome::ConnectionLost(format!("failed to send `{}`", method)),
                    );
                    self.health.record_error(error_chain(&e));
                    return Err(e);
                }
                Err(_) => {
                    connection.router.fail(id, RouteOutcome::TimedOut);
                    warn!(
                        target: LOG_TARGET,
                        "Request #{} `{}` could not be written within {:?}; oracle is not reading",
                        id,
                        method,
                        timeout
                    );
                    self.health.record_error(format!(
                        "`{}` write timed out after {:?}",
                        method, timeout
                    ));
                    self.health.record_timeout();
                    // The frame may be half written, so nothing after it can be
                    // framed correctly on this connection.
                    connection.unresponsive.cancel();
                    return Err(OracleError::Timeout {
                        method: method.to_string(),
                        timeout,
                    });
                }
            }
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome_to_result(method, timeout, outcome),
            Ok(Err(_)) => Err(OracleError::ConnectionClosed),
            Err(_) => {
                if owner {
                    connection.router.fail(id, RouteOutcome::TimedOut);
                }
                warn!(
                    target: LOG_TARGET,
                    "Request #{} `{}` timed out after {:?}",
                    id,
                    method,
                    timeout
                );
                self.health
                    .record_error(format!("`{}` timed out after {:?}", method, timeout));
                if self.health.record_timeout() {
                    connection.unresponsive.cancel();
                }
                Err(OracleError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn send(
        &self,
        connection: &Connection,
        id: RequestId,
        method: &str,
        params: &Value,
    ) -> OracleResult<()> {
        let frame = encode_request(id, method, params).map_err(OracleError::Encode)?;
        debug!(target: LOG_TARGET, "→ #{} {}", id, method);
        connection.transport.send(&frame).await?;
        Ok(())
    }

    pub fn health(&self) -> HealthStatus {
        self.health.snapshot(self.is_connected(), self.pending_count())
    }

    pub fn is_connected(&self) -> bool {
        self.connection.load_full().is_some_and(|c| c.is_alive())
    }

    pub fn pending_count(&self) -> usize {
        self.connection
            .load_full()
            .map(|c| c.router.pending_count())
            .unwrap_or(0)
    }

    /// Number of oracle processes started so far; 0 before the first start.
    pub fn generation(&self) -> u64 {
        *self.generation_tx.borrow()
    }

    pub fn subscribe_generation(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.connection.load_full().and_then(|c| c.transport.pid())
    }

    /// Must be called with the lifecycle lock held.
    fn spawn_connection(&self) -> Result<(), TransportError> {
        let generation = self.generation() + 1;
        let (transport, events) = Transport::start(&self.config.transport)?;
        let pid = transport.pid();
        let router = Arc::new(ResponseRouter::new());
        let unresponsive = CancellationToken::new();

        self.connection.store(Some(Arc::new(Connection {
            transport,
            router: Arc::clone(&router),
            generation,
            unresponsive: unresponsive.clone(),
        })));
        self.health.record_start(pid, generation);
        self.generation_tx.send_replace(generation);

        tokio::spawn(run_event_loop(
            events,
            router,
            Arc::clone(&self.health),
            self.this.clone(),
            generation,
            unresponsive,
        ));

        info!(
            target: LOG_TARGET,
            "Started oracle `{}` (pid {:?}, generation {})",
            self.config.transport.command,
            pid,
            generation
        );
        Ok(())
    }

    /// Tear down a lost connection and restart according to policy.
    ///
    /// Ignored when the bridge was stopped or the connection of `generation`
    /// has already been replaced.
    async fn recover(&self, generation: u64, reason: String) {
        let lifecycle = self.lifecycle.lock().await;
        if lifecycle.stopped {
            return;
        }
        let Some(current) = self.connection.load_full() else {
            return;
        };
        if current.generation != generation {
            return;
        }

        self.connection.store(None);
        current
            .router
            .fail_all(RouteOutcome::ConnectionLost(reason.clone()));
        current.transport.stop().await;
        self.health.record_exit(&reason);
        self.health.record_error(format!("oracle lost: {}", reason));

        loop {
            match self.health.restart_decision() {
                RestartDecision::Restart { delay, attempt } => {
                    warn!(
                        target: LOG_TARGET,
                        "Oracle lost ({}); restarting in {:?} (attempt {})",
                        reason,
                        delay,
                        attempt
                    );
                    tokio::time::sleep(delay).await;
                    match self.spawn_connection() {
                        Ok(()) => break,
                        Err(e) => {
                            let message = error_chain(&e);
                            error!(target: LOG_TARGET, "Restart failed: {}", message);
                            self.health.record_error(message);
                        }
                    }
                }
                RestartDecision::GiveUp { restarts_in_window } => {
                    error!(
                        target: LOG_TARGET,
                        "Oracle restarted {} times within {:?}; giving up",
                        restarts_in_window,
                        self.health.policy().window
                    );
                    self.health.record_error("restart limit reached");
                    return;
                }
            }
        }

        drop(lifecycle);
        self.refresh_version().await;
    }

    async fn refresh_version(&self) {
        match self.call("get_version", json!({})).await {
            Ok(Value::Null) => {}
            Ok(value) => {
                let version = match &value {
                    Value::String(s) => s.clone(),
                    other => other
                        .get("version")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| other.to_string()),
                };
                info!(target: LOG_TARGET, "Oracle version: {}", version);
                self.health.record_version(version);
            }
            Err(e) => {
                debug!(target: LOG_TARGET, "get_version failed: {}", error_chain(&e));
            }
        }
    }
}

impl Oracle for Bridge {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = OracleResult<Value>> + Send {
        self.call_with_timeout(method, params, self.config.call_timeout)
    }
}

fn outcome_to_result(
    method: &str,
    timeout: Duration,
    outcome: RouteOutcome,
) -> OracleResult<Value> {
    match outcome {
        RouteOutcome::Response(Ok(value)) => Ok(value),
        RouteOutcome::Response(Err(error)) => Err(OracleError::Oracle(error)),
        RouteOutcome::TimedOut => Err(OracleError::Timeout {
            method: method.to_string(),
            timeout,
        }),
        RouteOutcome::ConnectionLost(reason) => Err(OracleError::ConnectionLost { reason }),
        RouteOutcome::ConnectionClosed => Err(OracleError::ConnectionClosed),
    }
}

/// Per-connection event loop: routes responses until the process goes away,
/// then hands over to [`Bridge::recover`].
async fn run_event_loop(
    mut events: mpsc::Receiver<TransportEvent>,
    router: Arc<ResponseRouter>,
    health: Arc<HealthMonitor>,
    bridge: Weak<Bridge>,
    generation: u64,
    unresponsive: CancellationToken,
) {
    let reason = loop {
        tokio::select! {
            _ = unresponsive.cancelled() => {
                break "oracle unresponsive after consecutive timeouts".to_string();
            }
            event = events.recv() => match event {
                Some(TransportEvent::Message(line)) => handle_line(&line, &router, &health),
                Some(TransportEvent::Stderr(line)) => {
                    debug!(target: ORACLE_LOG_TARGET, "{}", line);
                }
                Some(TransportEvent::Error(message)) => {
                    warn!(target: LOG_TARGET, "{}", message);
                    health.record_error(message);
                }
                Some(TransportEvent::Closed) => {
                    let failed = router.fail_all(RouteOutcome::ConnectionLost(
                        "oracle closed its output stream".to_string(),
                    ));
                    if failed > 0 {
                        warn!(
                            target: LOG_TARGET,
                            "Oracle stdout closed with {} pending call(s)",
                            failed
                        );
                    }
                }
                Some(TransportEvent::Exit(code)) => {
                    break format!("oracle exited (code {:?})", code);
                }
                None => break "oracle event stream ended".to_string(),
            }
        }
    };

    // Nobody drains the channel from here on; the transport must not block on it.
    drop(events);

    let failed = router.fail_all(RouteOutcome::ConnectionLost(reason.clone()));
    if failed > 0 {
        warn!(target: LOG_TARGET, "Failed {} pending call(s): {}", failed, reason);
    }
    if let Some(bridge) = bridge.upgrade() {
        bridge.recover(generation, reason).await;
    }
}

fn handle_line(line: &str, router: &ResponseRouter, health: &HealthMonitor) {
    match decode_inbound(line) {
        Ok(Inbound::Response { id, outcome }) => {
            health.record_success();
            match router.route(id, outcome) {
                Some((method, elapsed)) => {
                    debug!(target: LOG_TARGET, "← #{} {} ({:?})", id, method, elapsed);
                }
                None => {
                    debug!(target: LOG_TARGET, "Discarding response for unknown request #{}", id);
                }
            }
        }
        Ok(Inbound::Notification { method }) => {
            debug!(target: LOG_TARGET, "Ignoring oracle notification {:?}", method);
        }
        Err(e) => {
            warn!(target: LOG_TARGET, "Discarding malformed line from oracle: {}", e);
            health.record_error(format!("malformed response: {}", e));
        }
    }
}
