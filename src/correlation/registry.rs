//! Correlation registry: map locally issued request ids to their eventual
//! outcome, exactly once.
//!
//! Ids start at 2 (1 is reserved) and only ever grow. An entry is removed
//! the moment it resolves, is rejected or times out; later completions for
//! the same id are silent no-ops.
//!
//! A reply may be a "checksum promise": a JSON object carrying a `checksum`
//! and no `payload`. Its data arrives separately as a binary frame, possibly
//! before the promise. Whichever half arrives second completes the request.
//!
//! Checksum matching takes the lowest pending id that declared the checksum.
//! Callers must not keep two requests in flight whose payloads hash the same.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use imgwire::correlation::{Checksum, CorrelationRegistry, Reply};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = CorrelationRegistry::new();
//! let (id, reply) = registry.register_request("loadImage");
//!
//! let data = Bytes::from_static(b"voxels");
//! registry.resolve(id, json!({"checksum": Checksum::of(&data).as_str()}));
//! registry.resolve_binary_data(data.clone());
//!
//! assert_eq!(reply.await, Ok(Reply::Binary(data)));
//! assert_eq!(registry.pending_count(), 0);
//! # }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::{BinaryStaging, Checksum};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Ids at or below this value are never issued.
pub const RESERVED_ID_FLOOR: u64 = 1;

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Json(Value),
    Binary(Bytes),
}

impl Reply {
    /// Binary data, if this reply carries any.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Reply::Binary(bytes) => Some(bytes),
            Reply::Json(_) => None,
        }
    }
}

/// Failed outcome of a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Failure {
    /// No reply within the attached timeout.
    #[error("timeout")]
    Timeout,
    /// Error reported by the remote side, passed through verbatim.
    #[error("remote error: {0}")]
    Remote(Value),
    /// The registry was closed or dropped with the request still pending.
    #[error("closed: {0}")]
    Closed(String),
}

/// What [`CorrelationRegistry::resolve_binary_data`] did with a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryDisposition {
    /// Handed to the pending request with this id.
    Delivered(u64),
    /// No request wanted it yet; held under this checksum.
    Staged(Checksum),
}

type SuccessFn = Box<dyn FnOnce(Reply) + Send>;
type FailureFn = Box<dyn FnOnce(Failure) + Send>;

enum Continuation {
    Callbacks {
        on_success: SuccessFn,
        on_failure: FailureFn,
    },
    Channel(oneshot::Sender<Result<Reply, Failure>>),
}

struct Entry {
    name: String,
    continuation: Continuation,
    checksum: Option<Checksum>,
    timeout: Option<JoinHandle<()>>,
}

impl Entry {
    fn complete(mut self, outcome: Result<Reply, Failure>) {
        if let Some(timer) = self.timeout.take() {
            timer.abort();
        }
        match self.continuation {
            Continuation::Callbacks {
                on_success,
                on_failure,
            } => match outcome {
                Ok(reply) => on_success(reply),
                Err(failure) => on_failure(failure),
            },
            Continuation::Channel(tx) => {
                // Receiver gone means the caller stopped waiting.
                let _ = tx.send(outcome);
            }
        }
    }
}

struct Inner {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
    staging: BinaryStaging,
    /// Set by `close`; later registrations fail immediately with this reason.
    closed: Option<String>,
}

impl Inner {
    fn insert(&mut self, name: &str, continuation: Continuation) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            Entry {
                name: name.to_string(),
                continuation,
                checksum: None,
                timeout: None,
            },
        );
        tracing::debug!(id, name, pending = self.entries.len(), "registered request");
        id
    }
}

/// Pending-request table plus binary staging area for one channel.
///
/// Cheap to clone; clones share state. Continuations run outside the
/// internal lock, so they may call back into the registry.
#[derive(Clone)]
pub struct CorrelationRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl CorrelationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                next_id: RESERVED_ID_FLOOR,
                entries: BTreeMap::new(),
                staging: BinaryStaging::new(),
                closed: None,
            })),
        }
    }

    /// Register a request with callback continuations and return its id.
    ///
    /// Exactly one of `on_success` / `on_failure` runs, unless the registry
    /// is dropped first.
    pub fn register<S, F>(&self, name: &str, on_success: S, on_failure: F) -> u64
    where
        S: FnOnce(Reply) + Send + 'static,
        F: FnOnce(Failure) + Send + 'static,
    {
        self.admit(
            name,
            Continuation::Callbacks {
                on_success: Box::new(on_success),
                on_failure: Box::new(on_failure),
            },
        )
    }

    /// Register a request and get a future for its outcome.
    pub fn register_request(&self, name: &str) -> (u64, PendingReply) {
        let (tx, rx) = oneshot::channel();
        let id = self.admit(name, Continuation::Channel(tx));
        (id, PendingReply { id, rx })
    }

    /// Insert a new entry, or fail it right away once the registry is closed.
    /// Ids are consumed either way.
    fn admit(&self, name: &str, continuation: Continuation) -> u64 {
        let mut inner = self.inner.lock();
        let Some(reason) = inner.closed.clone() else {
            return inner.insert(name, continuation);
        };
        inner.next_id += 1;
        let id = inner.next_id;
        drop(inner);

        tracing::debug!(id, name, %reason, "registry closed, failing new request");
        let entry = Entry {
            name: name.to_string(),
            continuation,
            checksum: None,
            timeout: None,
        };
        entry.complete(Err(Failure::Closed(reason)));
        id
    }

    /// Complete request `id` with `result`.
    ///
    /// A binary promise (object with a string `checksum` and no `payload`)
    /// completes immediately if matching data is staged; otherwise the
    /// checksum is recorded and the request keeps waiting. Unknown ids are
    /// ignored.
    pub fn resolve(&self, id: u64, result: Value) {
        let entry = {
            let mut inner = self.inner.lock();
            if !inner.entries.contains_key(&id) {
                tracing::debug!(id, "resolve for unknown request ignored");
                return;
            }

            match binary_promise(&result) {
                Some(checksum) => match inner.staging.claim(&checksum) {
                    Some(bytes) => inner
                        .entries
                        .remove(&id)
                        .map(|entry| (entry, Reply::Binary(bytes))),
                    None => {
                        if let Some(entry) = inner.entries.get_mut(&id) {
                            tracing::debug!(id, %checksum, "awaiting binary payload");
                            entry.checksum = Some(checksum);
                        }
                        None
                    }
                },
                None => inner
                    .entries
                    .remove(&id)
                    .map(|entry| (entry, Reply::Json(result))),
            }
        };

        if let Some((entry, reply)) = entry {
            tracing::debug!(id, name = %entry.name, "request resolved");
            entry.complete(Ok(reply));
        }
    }

    /// Fail request `id` with the remote error. Unknown ids are ignored.
    pub fn reject(&self, id: u64, error: Value) {
        self.fail(id, Failure::Remote(error));
    }

    fn fail(&self, id: u64, failure: Failure) {
        let entry = self.inner.lock().entries.remove(&id);
        match entry {
            Some(entry) => {
                tracing::debug!(id, name = %entry.name, %failure, "request failed");
                entry.complete(Err(failure));
            }
            None => tracing::debug!(id, "reject for unknown request ignored"),
        }
    }

    /// Fail request `id` with [`Failure::Timeout`] unless it completes within
    /// `timeout`.
    ///
    /// Replaces a previously attached timeout. Returns `false` (and schedules
    /// nothing) if the id is unknown or no tokio runtime is running.
    pub fn attach_timeout(&self, id: u64, timeout: Duration) -> bool {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(id, "no tokio runtime, timeout not scheduled");
                return false;
            }
        };

        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&id) else {
            return false;
        };

        let weak = Arc::downgrade(&self.inner);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            expire(weak, id);
        });
        if let Some(previous) = entry.timeout.replace(timer) {
            previous.abort();
        }
        true
    }

    /// Deliver a binary payload.
    ///
    /// Goes to the first pending request (lowest id) that announced its
    /// checksum, or is staged until such a request shows up.
    pub fn resolve_binary_data(&self, data: Bytes) -> BinaryDisposition {
        let checksum = Checksum::of(&data);
        let entry = {
            let mut inner = self.inner.lock();
            let waiting = inner
                .entries
                .iter()
                .find(|(_, entry)| entry.checksum.as_ref() == Some(&checksum))
                .map(|(&id, _)| id);

            match waiting.and_then(|id| inner.entries.remove(&id).map(|e| (id, e))) {
                Some(found) => found,
                None => {
                    inner.staging.stage(checksum.clone(), data);
                    tracing::debug!(
                        %checksum,
                        staged = inner.staging.len(),
                        staged_bytes = inner.staging.staged_bytes(),
                        "staging binary payload"
                    );
                    return BinaryDisposition::Staged(checksum);
                }
            }
        };

        let (id, entry) = entry;
        tracing::debug!(id, name = %entry.name, "binary payload delivered");
        entry.complete(Ok(Reply::Binary(data)));
        BinaryDisposition::Delivered(id)
    }

    /// Fail every pending request with [`Failure::Closed`] and drop all
    /// staged payloads.
    ///
    /// The registry stays closed: requests registered afterwards fail
    /// immediately. Only the first reason is kept.
    pub fn close(&self, reason: &str) {
        let entries = {
            let mut inner = self.inner.lock();
            if inner.closed.is_none() {
                inner.closed = Some(reason.to_string());
            }
            inner.staging.clear();
            std::mem::take(&mut inner.entries)
        };
        if !entries.is_empty() {
            tracing::debug!(pending = entries.len(), reason, "closing registry");
        }
        for (_, entry) in entries {
            entry.complete(Err(Failure::Closed(reason.to_string())));
        }
    }

    /// Number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Number of staged binary payloads.
    pub fn staged_count(&self) -> usize {
        self.inner.lock().staging.len()
    }

    /// Total size of staged binary payloads.
    pub fn staged_bytes(&self) -> usize {
        self.inner.lock().staging.staged_bytes()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed.is_some()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.inner.lock().entries.contains_key(&id)
    }

    pub fn is_staged(&self, checksum: &Checksum) -> bool {
        self.inner.lock().staging.contains(checksum)
    }

    /// `(id, name)` of every pending request, ascending by id.
    pub fn pending_names(&self) -> Vec<(u64, String)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(&id, entry)| (id, entry.name.clone()))
            .collect()
    }
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CorrelationRegistry")
            .field("next_id", &inner.next_id)
            .field("pending", &inner.entries.len())
            .field("staged", &inner.staging.len())
            .field("staged_bytes", &inner.staging.staged_bytes())
            .field("closed", &inner.closed)
            .finish()
    }
}

fn expire(registry: Weak<Mutex<Inner>>, id: u64) {
    let Some(inner) = registry.upgrade() else {
        return;
    };
    let entry = inner.lock().entries.remove(&id);
    if let Some(mut entry) = entry {
        // Running inside the timer task; don't abort ourselves.
        entry.timeout = None;
        tracing::warn!(id, name = %entry.name, "request timed out");
        entry.complete(Err(Failure::Timeout));
    }
}

/// Extract the checksum of a binary promise.
fn binary_promise(result: &Value) -> Option<Checksum> {
    let object = result.as_object()?;
    let checksum = object.get("checksum")?.as_str()?;
    match object.get("payload") {
        None | Some(Value::Null) => Some(Checksum::from_hex(checksum)),
        Some(_) => None,
    }
}

/// Future for the outcome of a request registered with
/// [`CorrelationRegistry::register_request`].
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Result<Reply, Failure>>,
}

impl PendingReply {
    /// The request's correlation id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Reply, Failure>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Failure::Closed(
                "registry dropped".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callbacks(
        registry: &CorrelationRegistry,
        name: &str,
    ) -> (u64, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let successes = Arc::new(AtomicUsize::new(0));
        let failures = Arc::new(AtomicUsize::new(0));
        let s = successes.clone();
        let f = failures.clone();
        let id = registry.register(
            name,
            move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        (id, successes, failures)
    }

    #[test]
    fn test_ids_start_above_floor_and_increase() {
        let registry = CorrelationRegistry::new();
        let ids: Vec<u64> = (0..5)
            .map(|_| registry.register_request("job").0)
            .collect();

        assert_eq!(ids, vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_ids_never_reused_after_removal() {
        let registry = CorrelationRegistry::new();
        let (first, _) = registry.register_request("a");
        registry.resolve(first, json!(null));
        let (second, _) = registry.register_request("b");

        assert!(second > first);
    }

    #[test]
    fn test_resolve_exactly_once() {
        let registry = CorrelationRegistry::new();
        let (id, successes, failures) = counting_callbacks(&registry, "job");

        registry.resolve(id, json!({"ok": true}));
        registry.resolve(id, json!({"ok": true}));
        registry.reject(id, json!("late"));

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(!registry.is_pending(id));
    }

    #[test]
    fn test_reject_passes_error_verbatim() {
        let registry = CorrelationRegistry::new();
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let id = registry.register(
            "job",
            |_| panic!("should not succeed"),
            move |failure| *sink.lock() = Some(failure),
        );

        registry.reject(id, json!({"code": 3, "message": "kernel failed"}));

        assert_eq!(
            *seen.lock(),
            Some(Failure::Remote(json!({"code": 3, "message": "kernel failed"})))
        );
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_unknown_id_is_noop() {
        let registry = CorrelationRegistry::new();
        registry.resolve(42, json!(1));
        registry.reject(42, json!(1));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_promise_then_binary() {
        let registry = CorrelationRegistry::new();
        let (id, successes, _) = counting_callbacks(&registry, "loadImage");
        let data = Bytes::from_static(b"slice data");
        let checksum = Checksum::of(&data);

        registry.resolve(id, json!({"checksum": checksum.as_str()}));
        assert!(registry.is_pending(id));
        assert_eq!(successes.load(Ordering::SeqCst), 0);

        assert_eq!(
            registry.resolve_binary_data(data),
            BinaryDisposition::Delivered(id)
        );
        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(registry.staged_count(), 0);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_binary_then_promise() {
        let registry = CorrelationRegistry::new();
        let data = Bytes::from_static(b"early bytes");
        let checksum = Checksum::of(&data);

        assert_eq!(
            registry.resolve_binary_data(data.clone()),
            BinaryDisposition::Staged(checksum.clone())
        );
        assert!(registry.is_staged(&checksum));

        let received = Arc::new(Mutex::new(None));
        let sink = received.clone();
        let id = registry.register("loadImage", move |reply| *sink.lock() = Some(reply), |_| {});
        registry.resolve(id, json!({"checksum": checksum.as_str()}));

        assert_eq!(*received.lock(), Some(Reply::Binary(data)));
        assert!(!registry.is_staged(&checksum));
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_checksum_with_payload_is_plain_result() {
        let registry = CorrelationRegistry::new();
        let (id, successes, _) = counting_callbacks(&registry, "job");

        registry.resolve(id, json!({"checksum": "abc123", "payload": [1, 2, 3]}));

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert!(!registry.is_pending(id));
    }

    #[test]
    fn test_first_pending_checksum_wins() {
        let registry = CorrelationRegistry::new();
        let data = Bytes::from_static(b"shared");
        let checksum = Checksum::of(&data);

        let (first, first_hits, _) = counting_callbacks(&registry, "first");
        let (second, second_hits, _) = counting_callbacks(&registry, "second");
        registry.resolve(second, json!({"checksum": checksum.as_str()}));
        registry.resolve(first, json!({"checksum": checksum.as_str()}));

        assert_eq!(
            registry.resolve_binary_data(data),
            BinaryDisposition::Delivered(first)
        );
        assert_eq!(first_hits.load(Ordering::SeqCst), 1);
        assert_eq!(second_hits.load(Ordering::SeqCst), 0);
        assert!(registry.is_pending(second));
    }

    #[test]
    fn test_continuation_may_reenter_registry() {
        let registry = CorrelationRegistry::new();
        let inner = registry.clone();
        let id = registry.register(
            "outer",
            move |_| {
                inner.register_request("follow-up");
            },
            |_| {},
        );

        registry.resolve(id, json!(null));
        assert_eq!(registry.pending_names(), vec![(3, "follow-up".to_string())]);
    }

    #[tokio::test]
    async fn test_pending_reply_receives_json() {
        let registry = CorrelationRegistry::new();
        let (id, reply) = registry.register_request("status");
        assert_eq!(reply.id(), id);

        registry.resolve(id, json!({"ready": true}));
        assert_eq!(reply.await, Ok(Reply::Json(json!({"ready": true}))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_rejects_and_late_resolve_is_noop() {
        let registry = CorrelationRegistry::new();
        let (id, reply) = registry.register_request("slow");
        assert!(registry.attach_timeout(id, Duration::from_millis(50)));

        assert_eq!(reply.await, Err(Failure::Timeout));
        assert!(!registry.is_pending(id));

        registry.resolve(id, json!("too late"));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolution_cancels_timeout() {
        let registry = CorrelationRegistry::new();
        let (id, successes, failures) = counting_callbacks(&registry, "fast");
        registry.attach_timeout(id, Duration::from_millis(50));

        registry.resolve(id, json!(1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(successes.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_affects_its_request() {
        let registry = CorrelationRegistry::new();
        let (slow, _slow_reply) = registry.register_request("slow");
        let (other, _other_reply) = registry.register_request("other");
        registry.attach_timeout(slow, Duration::from_millis(10));

        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!registry.is_pending(slow));
        assert!(registry.is_pending(other));
    }

    #[tokio::test]
    async fn test_attach_timeout_unknown_id() {
        let registry = CorrelationRegistry::new();
        assert!(!registry.attach_timeout(99, Duration::from_millis(1)));
    }

    #[test]
    fn test_attach_timeout_without_runtime() {
        let registry = CorrelationRegistry::new();
        let (id, _reply) = registry.register_request("job");
        assert!(!registry.attach_timeout(id, Duration::from_millis(1)));
        assert!(registry.is_pending(id));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_clears_staging() {
        let registry = CorrelationRegistry::new();
        let (_, reply) = registry.register_request("job");
        registry.resolve_binary_data(Bytes::from_static(b"orphan"));

        registry.close("connection lost");

        assert_eq!(
            reply.await,
            Err(Failure::Closed("connection lost".to_string()))
        );
        assert_eq!(registry.staged_count(), 0);
    }

    #[tokio::test]
    async fn test_register_after_close_fails_immediately() {
        let registry = CorrelationRegistry::new();
        let (before, _) = registry.register_request("job");
        registry.close("connection closed");
        registry.close("second reason");
        assert!(registry.is_closed());

        let (after, reply) = registry.register_request("late");
        assert!(after > before);
        assert_eq!(
            reply.await,
            Err(Failure::Closed("connection closed".to_string()))
        );

        let (id, successes, failures) = counting_callbacks(&registry, "late-callback");
        assert!(id > after);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn test_staged_bytes_reported() {
        let registry = CorrelationRegistry::new();
        registry.resolve_binary_data(Bytes::from_static(b"abcd"));
        registry.resolve_binary_data(Bytes::from_static(b"efghij"));

        assert_eq!(registry.staged_count(), 2);
        assert_eq!(registry.staged_bytes(), 10);

        registry.close("done");
        assert_eq!(registry.staged_bytes(), 0);
    }

    #[tokio::test]
    async fn test_dropped_registry_closes_reply() {
        let registry = CorrelationRegistry::new();
        let (_, reply) = registry.register_request("job");
        drop(registry);

        assert!(matches!(reply.await, Err(Failure::Closed(_))));
    }

    #[test]
    fn test_failure_display() {
        assert_eq!(Failure::Timeout.to_string(), "timeout");
    }
}
