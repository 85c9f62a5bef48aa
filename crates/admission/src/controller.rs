//! Admission controller.
//!
//! Every call to the shared reasoning service goes through one
//! controller. Requests wait in a priority queue and are released by a
//! background dispatcher that enforces a concurrency cap and a minimum
//! spacing between admissions. Requests sharing a batch key are collapsed
//! into a single execution whose result is handed to every caller.

use crate::error::AdmissionError;
use crate::pacing::AdaptiveDelay;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use taskpilot_config::AdmissionConfig;
use taskpilot_core::CollaboratorError;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const UNBOUNDED_WAIT: Duration = Duration::from_secs(86_400 * 365 * 30);

type SharedValue = Arc<dyn Any + Send + Sync>;
type Outcome = Result<SharedValue, AdmissionError>;
type WorkFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<SharedValue, CollaboratorError>> + Send + Sync>;

/// Per-request admission options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Higher is dispatched first.
    pub priority: i32,
    /// Requests with the same key share one execution.
    pub batch_key: Option<String>,
    /// Maximum wait before dispatch. Defaults to the configured timeout.
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_batch_key(mut self, key: impl Into<String>) -> Self {
        self.batch_key = Some(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Counters and gauges exposed by [`AdmissionController::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub deduplicated: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub current_delay_ms: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
}

struct Waiter {
    tx: oneshot::Sender<Outcome>,
    enqueued_at: Instant,
    deadline: Instant,
}

struct Request {
    /// Arrival order, also the request's identity.
    seq: u64,
    priority: i32,
    batch_key: Option<String>,
    work: WorkFn,
    waiters: Vec<Waiter>,
    /// Retries already spent.
    retries: u32,
}

impl Request {
    fn slot(&self) -> Slot {
        Slot {
            priority: Reverse(self.priority),
            seq: self.seq,
        }
    }

    fn accepts(&self, key: &str, batch_size: usize) -> bool {
        self.batch_key.as_deref() == Some(key) && self.waiters.len() < batch_size
    }

    /// Fail waiters past their deadline and drop those whose caller is
    /// gone. Returns how many timed out.
    fn expire(&mut self, now: Instant) -> u64 {
        let mut expired = 0;
        for waiter in std::mem::take(&mut self.waiters) {
            if waiter.tx.is_closed() {
                continue;
            }
            if waiter.deadline <= now {
                let waited_ms = now.duration_since(waiter.enqueued_at).as_millis() as u64;
                warn!(
                    batch_key = ?self.batch_key,
                    waited_ms,
                    "Request timed out waiting for admission"
                );
                let _ = waiter.tx.send(Err(AdmissionError::Timeout { waited_ms }));
                expired += 1;
            } else {
                self.waiters.push(waiter);
            }
        }
        expired
    }

    fn resolve(self, outcome: &Outcome) {
        for waiter in self.waiters {
            let _ = waiter.tx.send(outcome.clone());
        }
    }
}

/// Queue order: highest priority first, then arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    priority: Reverse<i32>,
    seq: u64,
}

/// A keyed request held back so later requests can join it.
struct BatchWindow {
    request: Request,
    flush_at: Instant,
}

struct State {
    queue: BTreeMap<Slot, Request>,
    windows: HashMap<String, BatchWindow>,
    in_flight: HashMap<u64, Request>,
    delay: AdaptiveDelay,
    last_admission: Option<Instant>,
    next_seq: u64,
    stats: AdmissionStats,
}

impl State {
    /// Requests not yet dispatched.
    fn waiting(&self) -> usize {
        self.queue.len() + self.windows.len()
    }

    fn new_request(
        &mut self,
        priority: i32,
        batch_key: Option<String>,
        work: WorkFn,
        waiter: Waiter,
    ) -> Request {
        let seq = self.next_seq;
        self.next_seq += 1;
        Request {
            seq,
            priority,
            batch_key,
            work,
            waiters: vec![waiter],
            retries: 0,
        }
    }

    fn push(&mut self, request: Request) {
        self.queue.insert(request.slot(), request);
    }

    /// Attach a waiter to a batch with room under `key`, wherever it is.
    /// Gives the waiter back if no such batch exists.
    fn join(
        &mut self,
        key: &str,
        priority: i32,
        waiter: Waiter,
        batch_size: usize,
    ) -> Result<(), Waiter> {
        if let Some(window) = self.windows.get_mut(key)
            && window.request.waiters.len() < batch_size
        {
            window.request.priority = window.request.priority.max(priority);
            window.request.waiters.push(waiter);
            let full = window.request.waiters.len() >= batch_size;
            if full && let Some(window) = self.windows.remove(key) {
                self.push(window.request);
            }
            return Ok(());
        }

        let queued = self
            .queue
            .iter()
            .find(|(_, request)| request.accepts(key, batch_size))
            .map(|(slot, _)| *slot);
        if let Some(slot) = queued
            && let Some(mut request) = self.queue.remove(&slot)
        {
            // Re-slot so the batch runs at its most urgent member's priority
            request.priority = request.priority.max(priority);
            request.waiters.push(waiter);
            self.push(request);
            return Ok(());
        }

        if let Some(request) = self
            .in_flight
            .values_mut()
            .find(|request| request.accepts(key, batch_size))
        {
            request.waiters.push(waiter);
            return Ok(());
        }

        Err(waiter)
    }

    fn expire(&mut self, now: Instant) {
        let mut timed_out = 0;
        for request in self.queue.values_mut() {
            timed_out += request.expire(now);
        }
        for window in self.windows.values_mut() {
            timed_out += window.request.expire(now);
        }
        self.queue.retain(|_, request| !request.waiters.is_empty());
        self.windows
            .retain(|_, window| !window.request.waiters.is_empty());
        self.stats.timed_out += timed_out;
    }

    fn flush_due_windows(&mut self, now: Instant) {
        let due: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, window)| window.flush_at <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in due {
            if let Some(window) = self.windows.remove(&key) {
                debug!(
                    batch_key = %key,
                    members = window.request.waiters.len(),
                    "Batch window closed"
                );
                self.push(window.request);
            }
        }
    }

    /// Next instant the dispatcher has something to do, if any.
    fn next_wake(&self, max_concurrent: usize) -> Option<Instant> {
        let mut wake: Option<Instant> = None;
        let mut consider = |at: Instant| {
            wake = Some(wake.map_or(at, |current| current.min(at)));
        };

        for window in self.windows.values() {
            consider(window.flush_at);
            window
                .request
                .waiters
                .iter()
                .for_each(|w| consider(w.deadline));
        }
        for request in self.queue.values() {
            request.waiters.iter().for_each(|w| consider(w.deadline));
        }
        if !self.queue.is_empty()
            && self.in_flight.len() < max_concurrent
            && let Some(last) = self.last_admission
        {
            consider(last + self.delay.current());
        }

        wake
    }
}

struct Shared {
    config: AdmissionConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(
        &self,
        options: SubmitOptions,
        work: WorkFn,
    ) -> Result<oneshot::Receiver<Outcome>, AdmissionError> {
        let now = Instant::now();
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.config.default_timeout());
        let (tx, rx) = oneshot::channel();
        let waiter = Waiter {
            tx,
            enqueued_at: now,
            deadline: now
                .checked_add(timeout)
                .unwrap_or_else(|| now + UNBOUNDED_WAIT),
        };
        let batch_size = self.config.batch_size.max(1);

        let mut state = self.lock();
        state.stats.submitted += 1;

        if state.waiting() >= self.config.max_queue_size {
            state.stats.rejected += 1;
            warn!(
                capacity = self.config.max_queue_size,
                batch_key = ?options.batch_key,
                "Admission queue full, rejecting request"
            );
            return Err(AdmissionError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }

        match options.batch_key {
            Some(key) => match state.join(&key, options.priority, waiter, batch_size) {
                Ok(()) => {
                    state.stats.deduplicated += 1;
                    debug!(batch_key = %key, "Request joined an existing batch");
                }
                Err(waiter) => {
                    let request =
                        state.new_request(options.priority, Some(key.clone()), work, waiter);
                    if batch_size == 1 {
                        state.push(request);
                    } else {
                        let flush_at = now + self.config.batch_window();
                        state.windows.insert(key, BatchWindow { request, flush_at });
                    }
                }
            },
            None => {
                let request = state.new_request(options.priority, None, work, waiter);
                state.push(request);
            }
        }

        drop(state);
        self.notify.notify_one();
        Ok(rx)
    }

    /// One dispatcher pass: expire, flush windows, admit what pacing
    /// allows. Returns when to wake up next.
    fn tick(self: &Arc<Self>) -> Option<Instant> {
        let now = Instant::now();
        let max_concurrent = self.config.max_concurrent.max(1);
        let mut started = Vec::new();

        let wake = {
            let mut state = self.lock();
            state.expire(now);
            state.flush_due_windows(now);

            while state.in_flight.len() < max_concurrent {
                if let Some(last) = state.last_admission
                    && now < last + state.delay.current()
                {
                    break;
                }
                let Some((_, request)) = state.queue.pop_first() else {
                    break;
                };

                state.last_admission = Some(now);
                state.stats.dispatched += 1;
                debug!(
                    seq = request.seq,
                    priority = request.priority,
                    batch_key = ?request.batch_key,
                    members = request.waiters.len(),
                    delay_ms = state.delay.current().as_millis() as u64,
                    queue_depth = state.queue.len(),
                    "Admitting request"
                );
                started.push((request.seq, Arc::clone(&request.work)));
                state.in_flight.insert(request.seq, request);
            }

            state.next_wake(max_concurrent)
        };

        for (seq, work) in started {
            let shared = Arc::clone(self);
            let work_timeout = self.config.work_timeout();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(
                    work_timeout,
                    AssertUnwindSafe(work()).catch_unwind(),
                )
                .await
                {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(CollaboratorError::Rejected("work panicked".into())),
                    Err(_) => Err(CollaboratorError::Timeout(format!(
                        "no result within {}ms",
                        work_timeout.as_millis()
                    ))),
                };
                shared.complete(seq, result);
            });
        }

        wake
    }

    fn complete(&self, seq: u64, result: Result<SharedValue, CollaboratorError>) {
        let mut state = self.lock();
        let Some(mut request) = state.in_flight.remove(&seq) else {
            return;
        };

        match result {
            Ok(value) => {
                let depth = state.queue.len();
                let delay = state.delay.on_success(depth);
                state.stats.succeeded += 1;
                debug!(
                    seq,
                    members = request.waiters.len(),
                    delay_ms = delay.as_millis() as u64,
                    "Request succeeded"
                );
                request.resolve(&Ok(value));
            }
            Err(error) => {
                let delay = state.delay.on_failure();
                state.stats.failed += 1;

                if error.is_retryable() && request.retries < self.config.max_retries {
                    request.retries += 1;
                    state.stats.retried += 1;
                    warn!(
                        seq,
                        retry = request.retries,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Retryable failure, re-queueing"
                    );
                    state.push(request);
                } else {
                    let outcome = if error.is_retryable() {
                        AdmissionError::BackoffExhausted {
                            attempts: request.retries + 1,
                            last: error,
                        }
                    } else {
                        AdmissionError::Work(error)
                    };
                    warn!(
                        seq,
                        delay_ms = delay.as_millis() as u64,
                        error = %outcome,
                        "Request failed"
                    );
                    request.resolve(&Err(outcome));
                }
            }
        }

        drop(state);
        self.notify.notify_one();
    }

    fn close(&self) {
        let mut state = self.lock();
        let queued = std::mem::take(&mut state.queue);
        let windows = std::mem::take(&mut state.windows);
        drop(state);

        let closed = Err(AdmissionError::Closed);
        for request in queued.into_values() {
            request.resolve(&closed);
        }
        for window in windows.into_values() {
            window.request.resolve(&closed);
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>) {
    loop {
        match shared.tick() {
            Some(at) => {
                tokio::select! {
                    _ = shared.notify.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => shared.notify.notified().await,
        }
    }
}

/// Paces, prioritizes and deduplicates calls to a shared service.
///
/// One controller is shared by every work item of a workflow.
pub struct AdmissionController {
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
}

impl AdmissionController {
    /// Create a controller and start its dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: AdmissionConfig) -> Self {
        let state = State {
            queue: BTreeMap::new(),
            windows: HashMap::new(),
            in_flight: HashMap::new(),
            delay: AdaptiveDelay::new(&config),
            last_admission: None,
            next_seq: 0,
            stats: AdmissionStats::default(),
        };
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(state),
            notify: Notify::new(),
        });
        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared)));
        Self { shared, dispatcher }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.config
    }

    /// Submit work and wait for its result.
    ///
    /// `work` may be invoked more than once when a retryable failure is
    /// retried. When the request joins an existing batch, `work` is never
    /// invoked and the batch's result is returned instead.
    pub async fn submit<T, F, Fut>(
        &self,
        options: SubmitOptions,
        work: F,
    ) -> Result<T, AdmissionError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send + 'static,
    {
        let batch_key = options.batch_key.clone();
        let work: WorkFn = Arc::new(move || {
            let fut = work();
            async move { fut.await.map(|value| Arc::new(value) as SharedValue) }.boxed()
        });

        let rx = self.shared.enqueue(options, work)?;
        let value = rx.await.map_err(|_| AdmissionError::Closed)??;

        (*value)
            .downcast_ref::<T>()
            .cloned()
            .ok_or_else(|| AdmissionError::TypeMismatch {
                batch_key: batch_key.unwrap_or_default(),
            })
    }

    pub fn current_delay(&self) -> Duration {
        self.shared.lock().delay.current()
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.shared.lock();
        AdmissionStats {
            current_delay_ms: state.delay.current().as_millis() as u64,
            queue_depth: state.waiting(),
            in_flight: state.in_flight.len(),
            ..state.stats.clone()
        }
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.shared.close();
    }
}
