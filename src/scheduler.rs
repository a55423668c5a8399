//! Per-document request scheduling: debounce, latest-revision-wins,
//! priorities and backpressure.
//!
//! # Architecture
//!
//! All scheduler state is owned by a single actor task; handles talk to it
//! through an unbounded command channel. Per document:
//!
//! ```text
//! IDLE ──submit──► DEBOUNCING ──submit──► DEBOUNCING
//!                      │ timer
//!                      ▼
//!                    READY ──slot free──► DISPATCHED ──complete──► IDLE
//! ```
//!
//! - Every submit bumps the document revision and re-arms the debounce timer.
//! - At most one dispatch per document is outstanding; a document that
//!   becomes ready meanwhile waits for the running call to finish.
//! - A ticket whose revision is overtaken resolves to
//!   [`Scheduled::Superseded`] right away. If its call is already running,
//!   the eventual result is discarded.
//! - Ready documents are served by priority class, FIFO within a class. Work
//!   that has been ready for longer than the aging threshold goes first
//!   regardless of class.
//! - No more than `max_in_flight` dispatches run at once.
//!
//! The oracle cannot cancel work, so cancellation here only ever means
//! discarding a result.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{debug, error};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use url::Url;

use crate::config::{DEFAULT_AGING_FACTOR, DebounceInterval};

const LOG_TARGET: &str = "oracle_ls::scheduler";

/// Upper bound for the default dispatch concurrency.
const MAX_DEFAULT_IN_FLIGHT: usize = 16;

/// Twice the available cores, clamped to `2..=16`.
pub fn default_max_in_flight() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_mul(2)
        .clamp(2, MAX_DEFAULT_IN_FLIGHT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub debounce: DebounceInterval,
    pub max_in_flight: usize,
    /// Ready work older than this is served before fresher higher-priority
    /// work.
    pub aging: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let debounce = DebounceInterval::default();
        Self {
            debounce,
            max_in_flight: default_max_in_flight(),
            aging: debounce.as_duration() * DEFAULT_AGING_FACTOR,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// A user is waiting on the result.
    #[default]
    Interactive,
    Background,
}

impl Priority {
    /// Highest class first.
    const CLASSES: [Priority; 2] = [Priority::Interactive, Priority::Background];

    fn index(self) -> usize {
        match self {
            Priority::Interactive => 0,
            Priority::Background => 1,
        }
    }
}

/// Performs the actual work for a ready document.
pub trait Dispatcher: Send + Sync + 'static {
    type Request: Send + 'static;
    type Output: Send + 'static;

    fn dispatch(
        &self,
        document: &Url,
        revision: u64,
        request: Self::Request,
    ) -> impl Future<Output = Self::Output> + Send;
}

/// How a submitted request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduled<T> {
    /// The request was the latest revision when its dispatch completed.
    Delivered { revision: u64, output: T },
    /// A newer revision of the document arrived; no result is delivered.
    Superseded { revision: u64 },
    /// The document was closed, the scheduler shut down, or the dispatch
    /// was abandoned.
    Closed { revision: u64 },
}

impl<T> Scheduled<T> {
    pub fn revision(&self) -> u64 {
        match self {
            Scheduled::Delivered { revision, .. }
            | Scheduled::Superseded { revision }
            | Scheduled::Closed { revision } => *revision,
        }
    }

    pub fn into_output(self) -> Option<T> {
        match self {
            Scheduled::Delivered { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Handle to one submitted revision.
#[derive(Debug)]
pub struct Ticket<T> {
    revision: u64,
    rx: oneshot::Receiver<Scheduled<T>>,
}

impl<T> Ticket<T> {
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Wait for the outcome. Never hangs: a vanished scheduler resolves the
    /// ticket as closed.
    pub async fn wait(self) -> Scheduled<T> {
        let revision = self.revision;
        self.rx.await.unwrap_or(Scheduled::Closed { revision })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStats {
    pub documents: usize,
    /// Requests waiting for their debounce timer or a free slot.
    pub queued: usize,
    pub in_flight: usize,
    pub dispatched: u64,
    pub delivered: u64,
    pub superseded: u64,
    /// Results that arrived for an overtaken or closed revision.
    pub discarded: u64,
}

type Waiter<T> = oneshot::Sender<Scheduled<T>>;

enum Command<D: Dispatcher> {
    Submit {
        document: Url,
        revision: u64,
        request: D::Request,
        priority: Priority,
        waiter: Waiter<D::Output>,
    },
    TimerFired {
        document: Url,
        revision: u64,
    },
    Completed {
        document: Url,
        revision: u64,
        /// `None` when the dispatch task panicked.
        output: Option<D::Output>,
    },
    Close {
        document: Url,
    },
    Stats {
        reply: oneshot::Sender<SchedulerStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the scheduler actor.
pub struct Scheduler<D: Dispatcher> {
    commands: mpsc::UnboundedSender<Command<D>>,
    /// Revision counters, monotonic per document for the whole session.
    revisions: Arc<DashMap<Url, u64>>,
    config: SchedulerConfig,
}

impl<D: Dispatcher> Clone for Scheduler<D> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            revisions: Arc::clone(&self.revisions),
            config: self.config,
        }
    }
}

impl<D: Dispatcher> Scheduler<D> {
    /// Spawn the actor. Must be called from within a tokio runtime.
    pub fn new(dispatcher: Arc<D>, config: SchedulerConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = Actor {
            dispatcher,
            config,
            commands: tx.downgrade(),
            documents: HashMap::new(),
            ready: [VecDeque::new(), VecDeque::new()],
            in_flight: 0,
            counters: SchedulerStats::default(),
        };
        tokio::spawn(actor.run(rx));
        Self {
            commands: tx,
            revisions: Arc::new(DashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submit a new revision of `document`, superseding any earlier one.
    pub fn submit(
        &self,
        document: Url,
        request: D::Request,
        priority: Priority,
    ) -> Ticket<D::Output> {
        let revision = {
            let mut counter = self.revisions.entry(document.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        let (waiter, rx) = oneshot::channel();
        // If the actor is gone the waiter is dropped and the ticket reads
        // as closed.
        let _ = self.commands.send(Command::Submit {
            document,
            revision,
            request,
            priority,
            waiter,
        });
        Ticket { revision, rx }
    }

    /// Latest revision submitted for `document`.
    pub fn revision(&self, document: &Url) -> Option<u64> {
        self.revisions.get(document).map(|r| *r)
    }

    /// Forget a document: cancel its timer, resolve its tickets as closed and
    /// discard any running dispatch's result.
    pub fn close(&self, document: &Url) {
        let _ = self.commands.send(Command::Close {
            document: document.clone(),
        });
    }

    pub async fn stats(&self) -> SchedulerStats {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stats { reply }).is_err() {
            return SchedulerStats::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Resolve every outstanding ticket as closed and stop the actor.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

struct PendingRequest<D: Dispatcher> {
    revision: u64,
    request: D::Request,
    priority: Priority,
    waiter: Waiter<D::Output>,
    /// Set when the debounce timer fired.
    ready_at: Option<Instant>,
}

struct Dispatched<T> {
    revision: u64,
    /// Taken when the revision is superseded or closed.
    waiter: Option<Waiter<T>>,
}

struct DocumentState<D: Dispatcher> {
    revision: u64,
    pending: Option<PendingRequest<D>>,
    timer: Option<AbortHandle>,
    dispatched: Option<Dispatched<D::Output>>,
    /// Closed while a dispatch was still running. The state lingers until
    /// that dispatch completes so a reopened document cannot start a second
    /// one alongside it.
    closed: bool,
}

impl<D: Dispatcher> DocumentState<D> {
    fn new() -> Self {
        Self {
            revision: 0,
            pending: None,
            timer: None,
            dispatched: None,
            closed: false,
        }
    }
}

struct ReadyEntry {
    document: Url,
    revision: u64,
    ready_at: Instant,
}

struct Actor<D: Dispatcher> {
    dispatcher: Arc<D>,
    config: SchedulerConfig,
    /// Weak so the actor ends once every handle is dropped.
    commands: mpsc::WeakUnboundedSender<Command<D>>,
    documents: HashMap<Url, DocumentState<D>>,
    /// Ready queues indexed by [`Priority::index`]. Entries may be stale and
    /// are validated when popped.
    ready: [VecDeque<ReadyEntry>; 2],
    in_flight: usize,
    counters: SchedulerStats,
}

impl<D: Dispatcher> Actor<D> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<D>>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Submit {
                    document,
                    revision,
                    request,
                    priority,
                    waiter,
                } => self.on_submit(document, revision, request, priority, waiter),
                Command::TimerFired { document, revision } => self.on_timer(document, revision),
                Command::Completed {
                    document,
                    revision,
                    output,
                } => self.on_completed(document, revision, output),
                Command::Close { document } => self.on_close(&document),
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats());
                }
                Command::Shutdown { reply } => {
                    self.close_all();
                    let _ = reply.send(());
                    debug!(target: LOG_TARGET, "Scheduler shut down");
                    return;
                }
            }
        }
        self.close_all();
    }

    fn on_submit(
        &mut self,
        document: Url,
        revision: u64,
        request: D::Request,
        priority: Priority,
        waiter: Waiter<D::Output>,
    ) {
        let state = self
            .documents
            .entry(document.clone())
            .or_insert_with(DocumentState::new);

        // A concurrent submit overtook this one on the way in.
        if revision <= state.revision {
            let _ = waiter.send(Scheduled::Superseded { revision });
            self.counters.superseded += 1;
            return;
        }
        state.revision = revision;
        state.closed = false;

        if let Some(old) = state.pending.take() {
            debug!(
                target: LOG_TARGET,
                "{} revision {} superseded by {}",
                document,
                old.revision,
                revision
            );
            let _ = old.waiter.send(Scheduled::Superseded {
                revision: old.revision,
            });
            self.counters.superseded += 1;
        }
        if let Some(dispatched) = state.dispatched.as_mut()
            && let Some(waiter) = dispatched.waiter.take()
        {
            let _ = waiter.send(Scheduled::Superseded {
                revision: dispatched.revision,
            });
            self.counters.superseded += 1;
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }

        state.timer = Some(arm_timer(
            &self.commands,
            self.config.debounce.as_duration(),
            document,
            revision,
        ));
        state.pending = Some(PendingRequest {
            revision,
            request,
            priority,
            waiter,
            ready_at: None,
        });
    }

    fn on_timer(&mut self, document: Url, revision: u64) {
        let now = Instant::now();
        let Some(state) = self.documents.get_mut(&document) else {
            return;
        };
        let Some(pending) = state.pending.as_mut() else {
            return;
        };
        if pending.revision != revision || pending.ready_at.is_some() {
            return;
        }
        state.timer = None;
        pending.ready_at = Some(now);

        if state.dispatched.is_some() {
            debug!(
                target: LOG_TARGET,
                "{} revision {} ready; waiting for running dispatch",
                document,
                revision
            );
            return;
        }
        self.ready[pending.priority.index()].push_back(ReadyEntry {
            document,
            revision,
            ready_at: now,
        });
        self.pump();
    }

    fn on_completed(&mut self, document: Url, revision: u64, output: Option<D::Output>) {
        self.in_flight = self.in_flight.saturating_sub(1);

        match self.documents.get_mut(&document) {
            Some(state) if state.dispatched.as_ref().map(|d| d.revision) == Some(revision) => {
                let waiter = state.dispatched.take().and_then(|d| d.waiter);
                match (waiter, output) {
                    (Some(waiter), Some(output)) => {
                        let _ = waiter.send(Scheduled::Delivered { revision, output });
                        self.counters.delivered += 1;
                    }
                    (Some(waiter), None) => {
                        let _ = waiter.send(Scheduled::Closed { revision });
                    }
                    (None, _) => {
                        debug!(
                            target: LOG_TARGET,
                            "Discarding result of {} revision {} (superseded or closed)",
                            document,
                            revision
                        );
                        self.counters.discarded += 1;
                    }
                }

                if state.closed && state.pending.is_none() {
                    self.documents.remove(&document);
                } else if let Some(pending) = &state.pending
                    && let Some(ready_at) = pending.ready_at
                {
                    self.ready[pending.priority.index()].push_back(ReadyEntry {
                        document,
                        revision: pending.revision,
                        ready_at,
                    });
                }
            }
            _ => {
                debug!(
                    target: LOG_TARGET,
                    "Discarding result of {} revision {} (closed)",
                    document,
                    revision
                );
                self.counters.discarded += 1;
            }
        }
        self.pump();
    }

    fn on_close(&mut self, document: &Url) {
        let Some(state) = self.documents.get_mut(document) else {
            return;
        };
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(pending) = state.pending.take() {
            let _ = pending.waiter.send(Scheduled::Closed {
                revision: pending.revision,
            });
        }
        match state.dispatched.as_mut() {
            Some(dispatched) => {
                if let Some(waiter) = dispatched.waiter.take() {
                    let _ = waiter.send(Scheduled::Closed {
                        revision: dispatched.revision,
                    });
                }
                state.closed = true;
            }
            None => {
                self.documents.remove(document);
            }
        }
        debug!(target: LOG_TARGET, "Closed {}", document);
    }

    fn close_all(&mut self) {
        let documents: Vec<Url> = self.documents.keys().cloned().collect();
        for document in documents {
            self.on_close(&document);
        }
        for queue in &mut self.ready {
            queue.clear();
        }
    }

    /// Dispatch ready work while slots are free.
    fn pump(&mut self) {
        while self.in_flight < self.config.max_in_flight.max(1) {
            let Some(entry) = self.next_ready() else {
                break;
            };
            self.dispatch(entry);
        }
    }

    /// Oldest aged entry if any, else the head of the highest non-empty
    /// class.
    fn next_ready(&mut self) -> Option<ReadyEntry> {
        let now = Instant::now();
        let aging = self.config.aging;
        let aged = self
            .ready
            .iter()
            .enumerate()
            .flat_map(|(class, queue)| {
                queue
                    .iter()
                    .enumerate()
                    .map(move |(position, entry)| (class, position, entry.ready_at))
            })
            .filter(|(_, _, ready_at)| now.saturating_duration_since(*ready_at) >= aging)
            .min_by_key(|(_, _, ready_at)| *ready_at);
        if let Some((class, position, _)) = aged {
            return self.ready[class].remove(position);
        }

        Priority::CLASSES
            .iter()
            .find_map(|class| self.ready[class.index()].pop_front())
    }

    fn dispatch(&mut self, entry: ReadyEntry) {
        let Some(state) = self.documents.get_mut(&entry.document) else {
            return;
        };
        if state.dispatched.is_some() {
            return;
        }
        let is_current = state
            .pending
            .as_ref()
            .is_some_and(|p| p.revision == entry.revision && p.ready_at.is_some());
        if !is_current {
            return;
        }
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let Some(pending) = state.pending.take() else {
            return;
        };

        let revision = pending.revision;
        state.dispatched = Some(Dispatched {
            revision,
            waiter: Some(pending.waiter),
        });
        self.in_flight += 1;
        self.counters.dispatched += 1;
        debug!(
            target: LOG_TARGET,
            "Dispatching {} revision {} ({} in flight)",
            entry.document,
            revision,
            self.in_flight
        );

        let dispatcher = Arc::clone(&self.dispatcher);
        let document = entry.document;
        let request = pending.request;
        tokio::spawn(async move {
            let task = {
                let document = document.clone();
                tokio::spawn(async move { dispatcher.dispatch(&document, revision, request).await })
            };
            let output = match task.await {
                Ok(output) => Some(output),
                Err(e) => {
                    error!(
                        target: LOG_TARGET,
                        "Dispatch of {} revision {} failed: {}",
                        document,
                        revision,
                        e
                    );
                    None
                }
            };
            let _ = commands.send(Command::Completed {
                document,
                revision,
                output,
            });
        });
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            documents: self
                .documents
                .values()
                .filter(|state| !state.closed)
                .count(),
            queued: self
                .documents
                .values()
                .filter(|state| state.pending.is_some())
                .count(),
            in_flight: self.in_flight,
            ..self.counters
        }
    }
}

fn arm_timer<D: Dispatcher>(
    commands: &mpsc::WeakUnboundedSender<Command<D>>,
    delay: Duration,
    document: Url,
    revision: u64,
) -> AbortHandle {
    let commands = commands.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Some(commands) = commands.upgrade() {
            let _ = commands.send(Command::TimerFired { document, revision });
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records dispatches; each request carries a label and how long the
    /// dispatch takes.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, u64, String)>>,
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl Recorder {
        fn calls(&self) -> Vec<(String, u64, String)> {
            self.calls.lock().unwrap().clone()
        }

        fn labels(&self) -> Vec<String> {
            self.calls().into_iter().map(|(_, _, label)| label).collect()
        }
    }

    impl Dispatcher for Recorder {
        type Request = (String, u64);
        type Output = String;

        async fn dispatch(&self, document: &Url, revision: u64, request: (String, u64)) -> String {
            let (label, delay_ms) = request;
            self.calls.lock().unwrap().push((
                document.path().trim_start_matches('/').to_string(),
                revision,
                label.clone(),
            ));
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            label
        }
    }

    fn doc(name: &str) -> Url {
        Url::parse(&format!("file:///{}", name)).unwrap()
    }

    fn config(debounce_ms: u64, max_in_flight: usize, aging: Duration) -> SchedulerConfig {
        SchedulerConfig {
            debounce: DebounceInterval::from_millis(debounce_ms).unwrap(),
            max_in_flight,
            aging,
        }
    }

    fn job(label: &str, delay_ms: u64) -> (String, u64) {
        (label.to_string(), delay_ms)
    }

    fn setup(config: SchedulerConfig) -> (Scheduler<Recorder>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (Scheduler::new(Arc::clone(&recorder), config), recorder)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_dispatch_only_latest_revision() {
        let (scheduler, recorder) = setup(config(250, 4, Duration::from_secs(1)));

        let mut tickets = Vec::new();
        for i in 1..=10 {
            tickets.push(scheduler.submit(
                doc("a"),
                job(&format!("edit {}", i), 0),
                Priority::Interactive,
            ));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let last = tickets.pop().unwrap();
        assert_eq!(
            last.wait().await,
            Scheduled::Delivered {
                revision: 10,
                output: "edit 10".to_string()
            }
        );
        for (i, ticket) in tickets.into_iter().enumerate() {
            assert_eq!(
                ticket.wait().await,
                Scheduled::Superseded {
                    revision: i as u64 + 1
                }
            );
        }
        assert_eq!(
            recorder.calls(),
            vec![("a".to_string(), 10, "edit 10".to_string())]
        );

        let stats = scheduler.stats().await;
        assert_eq!(stats.dispatched, 1);
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.superseded, 9);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_revision_waits_for_running_dispatch() {
        let (scheduler, recorder) = setup(config(50, 4, Duration::from_secs(1)));

        let first = scheduler.submit(doc("a"), job("one", 300), Priority::Interactive);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = scheduler.submit(doc("a"), job("two", 0), Priority::Interactive);

        // Superseded immediately, without waiting for the running call.
        assert_eq!(first.wait().await, Scheduled::Superseded { revision: 1 });
        assert_eq!(
            second.wait().await,
            Scheduled::Delivered {
                revision: 2,
                output: "two".to_string()
            }
        );
        assert_eq!(recorder.labels(), vec!["one", "two"]);
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.stats().await.discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_dispatches_are_bounded() {
        let (scheduler, recorder) = setup(config(50, 2, Duration::from_secs(10)));

        let tickets: Vec<_> = (0..5)
            .map(|i| {
                let name = format!("d{}", i);
                scheduler.submit(doc(&name), job(&name, 100), Priority::Interactive)
            })
            .collect();
        for ticket in tickets {
            assert!(matches!(ticket.wait().await, Scheduled::Delivered { .. }));
        }

        assert_eq!(recorder.calls().len(), 5);
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_work_is_served_before_background() {
        let (scheduler, recorder) = setup(config(50, 1, Duration::from_secs(10)));

        let busy = scheduler.submit(doc("busy"), job("busy", 500), Priority::Interactive);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let background = scheduler.submit(doc("bg"), job("bg", 0), Priority::Background);
        let interactive = scheduler.submit(doc("ui"), job("ui", 0), Priority::Interactive);

        busy.wait().await;
        background.wait().await;
        interactive.wait().await;
        assert_eq!(recorder.labels(), vec!["busy", "ui", "bg"]);
    }

    #[tokio::test(start_paused = true)]
    async fn aged_background_work_is_not_starved() {
        let (scheduler, recorder) = setup(config(50, 1, Duration::from_millis(100)));

        let busy = scheduler.submit(doc("busy"), job("busy", 500), Priority::Interactive);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let background = scheduler.submit(doc("bg"), job("bg", 0), Priority::Background);
        tokio::time::sleep(Duration::from_millis(470)).await;
        let interactive = scheduler.submit(doc("ui"), job("ui", 0), Priority::Interactive);

        busy.wait().await;
        background.wait().await;
        interactive.wait().await;
        assert_eq!(recorder.labels(), vec!["busy", "bg", "ui"]);
    }

    #[tokio::test(start_paused = true)]
    async fn close_before_dispatch_resolves_closed() {
        let (scheduler, recorder) = setup(config(250, 4, Duration::from_secs(1)));

        let ticket = scheduler.submit(doc("a"), job("x", 0), Priority::Interactive);
        scheduler.close(&doc("a"));

        assert_eq!(ticket.wait().await, Scheduled::Closed { revision: 1 });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn close_during_dispatch_discards_result() {
        let (scheduler, recorder) = setup(config(50, 4, Duration::from_secs(1)));

        let ticket = scheduler.submit(doc("a"), job("x", 500), Priority::Interactive);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.calls().len(), 1);
        scheduler.close(&doc("a"));

        assert_eq!(ticket.wait().await, Scheduled::Closed { revision: 1 });
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = scheduler.stats().await;
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.documents, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reopened_document_waits_for_dispatch_started_before_close() {
        let (scheduler, recorder) = setup(config(50, 4, Duration::from_secs(10)));

        let before = scheduler.submit(doc("a"), job("before", 1000), Priority::Interactive);
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.close(&doc("a"));
        assert_eq!(before.wait().await, Scheduled::Closed { revision: 1 });
        assert_eq!(scheduler.stats().await.documents, 0);

        let reopened = scheduler.submit(doc("a"), job("after", 0), Priority::Interactive);
        assert_eq!(
            reopened.wait().await,
            Scheduled::Delivered {
                revision: 2,
                output: "after".to_string()
            }
        );

        assert_eq!(recorder.labels(), vec!["before", "after"]);
        assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
        let stats = scheduler.stats().await;
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.documents, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn revisions_keep_increasing_after_close() {
        let (scheduler, _recorder) = setup(config(50, 4, Duration::from_secs(1)));

        scheduler.submit(doc("a"), job("x", 0), Priority::Interactive).wait().await;
        scheduler.close(&doc("a"));
        let reopened = scheduler.submit(doc("a"), job("y", 0), Priority::Interactive);

        assert_eq!(reopened.revision(), 2);
        assert_eq!(
            reopened.wait().await,
            Scheduled::Delivered {
                revision: 2,
                output: "y".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_closes_outstanding_tickets() {
        let (scheduler, recorder) = setup(config(250, 4, Duration::from_secs(1)));

        let a = scheduler.submit(doc("a"), job("a", 0), Priority::Interactive);
        let b = scheduler.submit(doc("b"), job("b", 0), Priority::Background);
        scheduler.shutdown().await;

        assert_eq!(a.wait().await, Scheduled::Closed { revision: 1 });
        assert_eq!(b.wait().await, Scheduled::Closed { revision: 1 });
        let late = scheduler.submit(doc("a"), job("late", 0), Priority::Interactive);
        assert_eq!(late.wait().await, Scheduled::Closed { revision: 2 });
        assert!(recorder.calls().is_empty());
        assert_eq!(scheduler.stats().await, SchedulerStats::default());
    }

    #[test]
    fn default_concurrency_is_clamped() {
        let n = default_max_in_flight();
        assert!((2..=16).contains(&n));
    }
}
