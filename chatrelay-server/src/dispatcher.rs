//! Single-worker dispatcher and queue notifier.
//!
//! # Architecture
//!
//! ```text
//!   conn A ─┐                      ┌──────────────┐
//!   conn B ─┼─ submit ──► queue ──►│  processing  │──► StreamRelay ──► owner
//!   conn C ─┘     │                │   (0 or 1)   │         │
//!                 ▼                └──────▲───────┘         │
//!        position broadcast               └── finish ◄──────┘
//!                                          (retry delay, dispatch next)
//! ```
//!
//! The queue and the processing marker live behind one `parking_lot` mutex.
//! Every mutation and the position broadcast that follows it happen under that
//! lock; broadcasting only pushes onto unbounded channels, so the lock is never
//! held across an await point.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chatrelay_core::error::STREAMING_FAILED_MESSAGE;
use chatrelay_core::{ConnectionId, QueuedRequest, RelayError, RequestQueue, ServerMessage, Submission};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info};

use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::relay::StreamRelay;
use crate::upstream::ChatBackend;

/// State guarded by the dispatcher lock
struct Shared {
    queue: RequestQueue,
    /// Correlation id of the in-flight request
    processing: Option<String>,
}

/// Point-in-time view of the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherSnapshot {
    pub queue_length: usize,
    /// Queue bound, 0 when unbounded
    pub max_queue: usize,
    pub processing: Option<String>,
    /// Waiting correlation ids, head first
    pub waiting: Vec<String>,
}

/// Serializes access to the upstream: at most one request streams at a time
pub struct Dispatcher<B> {
    shared: Mutex<Shared>,
    registry: Arc<ConnectionRegistry>,
    relay: StreamRelay<B>,
    retry_delay: Duration,
}

impl<B: ChatBackend> Dispatcher<B> {
    /// Create a dispatcher. `max_queue` of 0 leaves the queue unbounded.
    pub fn new(
        relay: StreamRelay<B>,
        registry: Arc<ConnectionRegistry>,
        max_queue: usize,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            shared: Mutex::new(Shared { queue: RequestQueue::new(max_queue), processing: None }),
            registry,
            relay,
            retry_delay,
        })
    }

    pub fn relay(&self) -> &StreamRelay<B> {
        &self.relay
    }

    /// Admit a validated submission from `connection`.
    ///
    /// Returns the zero-based queue position it was given. The request may
    /// already be dispatched by the time this returns.
    pub fn submit(
        self: &Arc<Self>,
        connection: ConnectionId,
        submission: Submission,
    ) -> Result<usize, RelayError> {
        let request = QueuedRequest::new(connection, submission);
        let correlation_id = request.correlation_id.clone();
        let model = request.model.clone();

        let (position, length) = {
            let mut shared = self.shared.lock();
            let position = shared.queue.push(request)?;
            self.broadcast(&shared);
            (position, shared.queue.len())
        };

        info!(
            correlation_id = %correlation_id,
            connection = %connection,
            model = %model,
            position,
            length,
            "Request queued"
        );

        self.try_dispatch();
        Ok(position)
    }

    /// Drop every waiting request owned by `connection`.
    ///
    /// A request that is already streaming is left alone; the relay stops
    /// on its own once the connection is gone. Returns how many were removed.
    pub fn disconnect(&self, connection: &ConnectionId) -> usize {
        let mut shared = self.shared.lock();
        let removed = shared.queue.remove_connection(connection);
        if !removed.is_empty() {
            self.broadcast(&shared);
            debug!(
                connection = %connection,
                removed = removed.len(),
                remaining = shared.queue.len(),
                "Removed queued requests of closed connection"
            );
        }
        removed.len()
    }

    /// Cleanup for a connection that closed or was terminated.
    ///
    /// Waiting requests are dropped before the connection leaves the
    /// registry, so none of them can be dispatched in between.
    pub fn connection_closed(&self, connection: &ConnectionId) -> usize {
        let removed = self.disconnect(connection);
        self.registry.unregister(connection);
        removed
    }

    /// Start the head of the queue if nothing is processing.
    ///
    /// Returns `true` if a request was dispatched.
    pub fn try_dispatch(self: &Arc<Self>) -> bool {
        let request = {
            let mut shared = self.shared.lock();
            if shared.processing.is_some() {
                return false;
            }
            let Some(request) = shared.queue.pop() else {
                return false;
            };
            shared.processing = Some(request.correlation_id.clone());
            self.broadcast(&shared);
            request
        };

        metrics::record_queue_wait(request.queue_wait().as_secs_f64());
        metrics::set_streaming(true);

        tokio::spawn(Arc::clone(self).process(request));
        true
    }

    async fn process(self: Arc<Self>, request: QueuedRequest) {
        let started = Instant::now();
        info!(
            correlation_id = %request.correlation_id,
            model = %request.model,
            waited_ms = request.queue_wait().as_millis() as u64,
            "Processing request"
        );

        let label = match AssertUnwindSafe(self.relay.relay(&request)).catch_unwind().await {
            Ok(outcome) => outcome.label(),
            Err(_) => {
                error!(correlation_id = %request.correlation_id, "Relay task panicked");
                self.registry
                    .send_message(&request.connection, &ServerMessage::error(STREAMING_FAILED_MESSAGE));
                "panicked"
            }
        };
        metrics::record_request(&request.model, label, started.elapsed().as_secs_f64());

        self.finish().await;
    }

    /// Release the gate, then pull the next request after the retry delay
    async fn finish(self: &Arc<Self>) {
        {
            let mut shared = self.shared.lock();
            shared.processing = None;
            self.broadcast(&shared);
        }
        metrics::set_streaming(false);

        tokio::time::sleep(self.retry_delay).await;
        self.try_dispatch();
    }

    /// Tell every waiting connection where it stands. Caller holds the lock.
    fn broadcast(&self, shared: &Shared) {
        let is_someone_processing = shared.processing.is_some();
        for slot in shared.queue.positions() {
            let message = ServerMessage::Queue {
                position: slot.position,
                length: slot.length,
                is_someone_processing,
            };
            // Closed connections are skipped; their entries go on disconnect.
            self.registry.send_message(&slot.connection, &message);
        }
        metrics::set_queue_size(shared.queue.len());
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        let shared = self.shared.lock();
        DispatcherSnapshot {
            queue_length: shared.queue.len(),
            max_queue: shared.queue.capacity_limit(),
            processing: shared.processing.clone(),
            waiting: shared.queue.correlation_ids(),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.shared.lock().processing.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionHandle;
    use crate::relay::tests::{drain, ScriptedBackend};
    use crate::upstream::{ByteStream, ChatRequest};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chatrelay_core::ChatMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;

    /// Backend that holds every call until the test hands out a permit
    struct GatedBackend {
        gate: Semaphore,
        active: AtomicUsize,
        max_active: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl GatedBackend {
        fn new() -> Self {
            Self {
                gate: Semaphore::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatBackend for GatedBackend {
        async fn chat_stream(&self, request: &ChatRequest) -> Result<ByteStream, RelayError> {
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            let prompt = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.prompts.lock().push(prompt.clone());

            let permit = self.gate.acquire().await.unwrap();
            permit.forget();
            self.active.fetch_sub(1, Ordering::SeqCst);

            let chunks: Vec<Result<Bytes, RelayError>> = vec![
                Ok(Bytes::from(format!("{{\"message\":{{\"content\":\"re: {}\"}}}}\n", prompt))),
                Ok(Bytes::from_static(b"{\"done\":true}")),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }
    }

    struct PanickingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChatBackend for PanickingBackend {
        async fn chat_stream(&self, _request: &ChatRequest) -> Result<ByteStream, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("backend blew up");
        }
    }

    fn setup<B: ChatBackend>(backend: B) -> (Arc<Dispatcher<B>>, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = StreamRelay::new(backend, Arc::clone(&registry), "system");
        let dispatcher = Dispatcher::new(relay, Arc::clone(&registry), 100, Duration::from_millis(1));
        (dispatcher, registry)
    }

    fn submission(id: &str) -> Submission {
        Submission {
            id: id.to_string(),
            model: "llama3.2:3b".to_string(),
            messages: vec![ChatMessage::user(id)],
        }
    }

    fn queue_json(position: usize, length: usize, processing: bool) -> String {
        ServerMessage::Queue { position, length, is_someone_processing: processing }.to_json()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn idle<B: ChatBackend>(dispatcher: &Dispatcher<B>) -> bool {
        !dispatcher.is_processing() && dispatcher.queue_len() == 0
    }

    #[tokio::test]
    async fn test_only_one_request_in_flight() {
        let (dispatcher, registry) = setup(GatedBackend::new());
        let handles: Vec<ConnectionHandle> = (0..6).map(|_| registry.register()).collect();

        for (i, handle) in handles.iter().enumerate() {
            dispatcher.submit(handle.id, submission(&format!("r{}", i))).unwrap();
        }
        let backend = dispatcher.relay().backend();
        backend.gate.add_permits(6);

        wait_until(|| backend.prompts.lock().len() == 6 && idle(&dispatcher)).await;
        assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(*backend.prompts.lock(), vec!["r0", "r1", "r2", "r3", "r4", "r5"]);
    }

    #[tokio::test]
    async fn test_second_caller_waits_for_first() {
        let (dispatcher, registry) = setup(GatedBackend::new());
        let mut a = registry.register();
        let mut b = registry.register();
        let backend = dispatcher.relay().backend();

        assert_eq!(dispatcher.submit(a.id, submission("A")).unwrap(), 0);
        wait_until(|| backend.prompts.lock().len() == 1).await;

        assert_eq!(dispatcher.submit(b.id, submission("B")).unwrap(), 0);
        assert_eq!(drain(&mut b), vec![queue_json(0, 1, true)]);
        assert_eq!(
            dispatcher.snapshot(),
            DispatcherSnapshot {
                queue_length: 1,
                max_queue: 100,
                processing: Some("A".to_string()),
                waiting: vec!["B".to_string()],
            }
        );

        // A completes, B takes over
        backend.gate.add_permits(1);
        wait_until(|| backend.prompts.lock().len() == 2).await;
        assert_eq!(
            drain(&mut a),
            vec![
                queue_json(0, 1, false),
                r#"{"message":{"content":"re: A"}}"#.to_string(),
                r#"{"type":"done"}"#.to_string(),
            ]
        );
        drain(&mut b);

        // No further queue updates once B is streaming
        backend.gate.add_permits(1);
        wait_until(|| idle(&dispatcher)).await;
        let out = drain(&mut b);
        assert!(out.iter().all(|m| !m.contains(r#""type":"queue""#)));
        assert_eq!(out.last().map(String::as_str), Some(r#"{"type":"done"}"#));
    }

    #[tokio::test]
    async fn test_disconnected_while_queued_is_never_dispatched() {
        let (dispatcher, registry) = setup(GatedBackend::new());
        let a = registry.register();
        let mut b = registry.register();
        let mut c = registry.register();
        let backend = dispatcher.relay().backend();

        dispatcher.submit(a.id, submission("A")).unwrap();
        wait_until(|| backend.prompts.lock().len() == 1).await;
        dispatcher.submit(b.id, submission("B")).unwrap();
        dispatcher.submit(c.id, submission("C")).unwrap();
        assert_eq!(drain(&mut c), vec![queue_json(1, 2, true)]);

        assert_eq!(dispatcher.connection_closed(&b.id), 1);
        assert_eq!(dispatcher.connection_closed(&b.id), 0);
        assert_eq!(drain(&mut c), vec![queue_json(0, 1, true)]);

        backend.gate.add_permits(2);
        wait_until(|| backend.prompts.lock().len() == 2 && idle(&dispatcher)).await;
        assert_eq!(*backend.prompts.lock(), vec!["A", "C"]);
        // Nothing reached B after it left
        assert_eq!(drain(&mut b), vec![queue_json(0, 1, true), queue_json(0, 2, true)]);
    }

    #[tokio::test]
    async fn test_closed_connection_is_skipped_at_dispatch() {
        let (dispatcher, registry) = setup(GatedBackend::new());
        let a = registry.register();
        let b = registry.register();
        let backend = dispatcher.relay().backend();

        dispatcher.submit(a.id, submission("A")).unwrap();
        wait_until(|| backend.prompts.lock().len() == 1).await;
        dispatcher.submit(b.id, submission("B")).unwrap();

        // B is gone from the registry but its request is still queued
        registry.unregister(&b.id);
        backend.gate.add_permits(1);
        wait_until(|| idle(&dispatcher)).await;

        assert_eq!(*backend.prompts.lock(), vec!["A"]);
        assert_eq!(backend.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_terminated_connection_leaves_queue() {
        let (dispatcher, registry) = setup(GatedBackend::new());
        let a = registry.register();
        let b = registry.register();
        let mut c = registry.register();
        let backend = dispatcher.relay().backend();

        dispatcher.submit(a.id, submission("A")).unwrap();
        wait_until(|| backend.prompts.lock().len() == 1).await;
        dispatcher.submit(b.id, submission("B")).unwrap();
        dispatcher.submit(c.id, submission("C")).unwrap();
        assert_eq!(drain(&mut c), vec![queue_json(1, 2, true)]);

        // Same wake-up and cleanup as the socket task
        let terminated = Arc::clone(&b.terminated);
        let closing = Arc::clone(&dispatcher);
        let b_id = b.id;
        let socket_task = tokio::spawn(async move {
            terminated.notified().await;
            closing.connection_closed(&b_id)
        });

        // Two heartbeat rounds; B never answers
        assert!(registry.sweep().is_empty());
        registry.mark_alive(&a.id);
        registry.mark_alive(&c.id);
        assert_eq!(registry.sweep(), vec![b.id]);

        assert_eq!(socket_task.await.unwrap(), 1);
        assert_eq!(dispatcher.queue_len(), 1);
        assert!(!registry.is_open(&b.id));
        assert_eq!(drain(&mut c), vec![queue_json(0, 1, true)]);

        backend.gate.add_permits(2);
        wait_until(|| backend.prompts.lock().len() == 2 && idle(&dispatcher)).await;
        assert_eq!(*backend.prompts.lock(), vec!["A", "C"]);
    }

    #[tokio::test]
    async fn test_positions_follow_fifo() {
        let (dispatcher, registry) = setup(GatedBackend::new());
        let mut handles: Vec<ConnectionHandle> = (0..4).map(|_| registry.register()).collect();
        let backend = dispatcher.relay().backend();

        dispatcher.submit(handles[0].id, submission("0")).unwrap();
        wait_until(|| backend.prompts.lock().len() == 1).await;
        for (i, handle) in handles.iter().enumerate().skip(1) {
            assert_eq!(dispatcher.submit(handle.id, submission(&i.to_string())).unwrap(), i - 1);
        }

        assert_eq!(drain(&mut handles[3]), vec![queue_json(2, 3, true)]);
        assert_eq!(
            drain(&mut handles[1]),
            vec![queue_json(0, 1, true), queue_json(0, 2, true), queue_json(0, 3, true)]
        );

        dispatcher.disconnect(&handles[1].id);
        assert_eq!(drain(&mut handles[2]).last(), Some(&queue_json(0, 2, true)));
        assert_eq!(drain(&mut handles[3]), vec![queue_json(1, 2, true)]);

        backend.gate.add_permits(3);
        wait_until(|| idle(&dispatcher)).await;
    }

    #[tokio::test]
    async fn test_upstream_error_moves_on_to_next() {
        let (dispatcher, registry) =
            setup(ScriptedBackend::new(Err(RelayError::rejected(500, "overloaded"))));
        let mut a = registry.register();
        let mut b = registry.register();

        dispatcher.submit(a.id, submission("A")).unwrap();
        dispatcher.submit(b.id, submission("B")).unwrap();

        let backend = dispatcher.relay().backend();
        wait_until(|| backend.calls.lock().len() == 2 && idle(&dispatcher)).await;

        let error = r#"{"type":"error","message":"Ollama API error (500): overloaded"}"#;
        let out_a = drain(&mut a);
        assert_eq!(out_a.iter().filter(|m| m.as_str() == error).count(), 1);
        assert_eq!(drain(&mut b).last().map(String::as_str), Some(error));
    }

    #[tokio::test]
    async fn test_panicking_relay_releases_gate() {
        let (dispatcher, registry) = setup(PanickingBackend { calls: AtomicUsize::new(0) });
        let mut a = registry.register();
        let b = registry.register();

        dispatcher.submit(a.id, submission("A")).unwrap();
        dispatcher.submit(b.id, submission("B")).unwrap();

        let backend = dispatcher.relay().backend();
        wait_until(|| backend.calls.load(Ordering::SeqCst) == 2 && idle(&dispatcher)).await;

        let out = drain(&mut a);
        assert_eq!(
            out.last().map(String::as_str),
            Some(r#"{"type":"error","message":"Error occurred during streaming"}"#)
        );
    }

    #[tokio::test]
    async fn test_queue_full_is_rejected() {
        let registry = Arc::new(ConnectionRegistry::new());
        let relay = StreamRelay::new(GatedBackend::new(), Arc::clone(&registry), "system");
        let dispatcher = Dispatcher::new(relay, Arc::clone(&registry), 1, Duration::from_millis(1));
        let backend = dispatcher.relay().backend();
        let conn = registry.register();

        dispatcher.submit(conn.id, submission("A")).unwrap();
        wait_until(|| backend.prompts.lock().len() == 1).await;
        dispatcher.submit(conn.id, submission("B")).unwrap();

        let err = dispatcher.submit(conn.id, submission("C")).unwrap_err();
        assert_eq!(err, RelayError::QueueFull { max: 1 });
        let snapshot = dispatcher.snapshot();
        assert_eq!(snapshot.waiting, vec!["B".to_string()]);
        assert_eq!(snapshot.max_queue, 1);

        backend.gate.add_permits(2);
        wait_until(|| idle(&dispatcher)).await;
    }
}
