//! Response routing for pending oracle calls.
//!
//! The router owns the pending table for one oracle connection:
//! - A caller registers before sending and gets a oneshot receiver
//! - The event loop calls `route()` for each response line
//! - Timeouts, write failures and process exit remove entries with an outcome
//!
//! Identical `(method, params)` calls issued while one is pending join the
//! existing entry instead of sending a second frame. Every joined waiter gets
//! a clone of the single outcome.
//!
//! The mutex is held only for map operations, never across an await.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use super::protocol::{DedupKey, RequestId};
use crate::error::{LockResultExt, ResponseError};

/// How a pending call ended.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RouteOutcome {
    Response(Result<Value, ResponseError>),
    TimedOut,
    ConnectionLost(String),
    ConnectionClosed,
}

/// Result of registering a call.
pub(crate) enum Registration {
    /// First caller for this key: it must send the frame.
    New {
        id: RequestId,
        rx: oneshot::Receiver<RouteOutcome>,
    },
    /// An identical call is already pending; wait on its outcome.
    Joined {
        id: RequestId,
        rx: oneshot::Receiver<RouteOutcome>,
    },
}

struct PendingRequest {
    method: String,
    sent_at: Instant,
    dedup: DedupKey,
    waiters: Vec<oneshot::Sender<RouteOutcome>>,
}

#[derive(Default)]
struct RouterState {
    pending: HashMap<RequestId, PendingRequest>,
    in_flight: HashMap<DedupKey, RequestId>,
}

pub(crate) struct ResponseRouter {
    next_id: AtomicU64,
    state: Mutex<RouterState>,
}

impl ResponseRouter {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::new(RouterState::default()),
        }
    }

    /// Register a call, joining an identical pending one if present.
    pub(crate) fn register(&self, method: &str, dedup: DedupKey) -> Registration {
        let (tx, rx) = oneshot::channel();
        let mut guard = self.state.lock().recover_poison("ResponseRouter::register");
        let state = &mut *guard;

        if let Some(&id) = state.in_flight.get(&dedup)
            && let Some(entry) = state.pending.get_mut(&id)
        {
            entry.waiters.push(tx);
            return Registration::Joined { id, rx };
        }

        let id = RequestId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.in_flight.insert(dedup.clone(), id);
        state.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                sent_at: Instant::now(),
                dedup,
                waiters: vec![tx],
            },
        );
        Registration::New { id, rx }
    }

    /// Deliver a response. Returns the method and round-trip time when the id
    /// was pending, `None` for unknown (late or duplicate) ids.
    pub(crate) fn route(
        &self,
        id: RequestId,
        response: Result<Value, ResponseError>,
    ) -> Option<(String, Duration)> {
        let entry = self.take(id)?;
        let elapsed = entry.sent_at.elapsed();
        let method = entry.method.clone();
        Self::notify(entry, RouteOutcome::Response(response));
        Some((method, elapsed))
    }

    /// End one pending call with a non-response outcome.
    pub(crate) fn fail(&self, id: RequestId, outcome: RouteOutcome) -> bool {
        match self.take(id) {
            Some(entry) => {
                Self::notify(entry, outcome);
                true
            }
            None => false,
        }
    }

    /// End every pending call with the same outcome. Returns how many entries
    /// were failed.
    pub(crate) fn fail_all(&self, outcome: RouteOutcome) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut state = self.state.lock().recover_poison("ResponseRouter::fail_all");
            state.in_flight.clear();
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            Self::notify(entry, outcome.clone());
        }
        count
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.state
            .lock()
            .recover_poison("ResponseRouter::pending_count")
            .pending
            .len()
    }

    fn take(&self, id: RequestId) -> Option<PendingRequest> {
        let mut state = self.state.lock().recover_poison("ResponseRouter::take");
        let entry = state.pending.remove(&id)?;
        if state.in_flight.get(&entry.dedup) == Some(&id) {
            state.in_flight.remove(&entry.dedup);
        }
        Some(entry)
    }

    fn notify(entry: PendingRequest, outcome: RouteOutcome) {
        for waiter in entry.waiters {
            // A waiter that already gave up has dropped its receiver.
            let _ = waiter.send(outcome.clone());
        }
    }
}
