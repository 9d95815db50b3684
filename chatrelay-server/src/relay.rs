//! Stream relay: one upstream call, forwarded line by line to its caller.
//!
//! ```text
//! Idle ──► Calling ──► Streaming ──► Completed
//!  │          │            │
//!  └──────────┴────────────┴───────► Failed
//! ```
//!
//! Content lines are forwarded as UTF-8 text: byte-identical to the upstream
//! line when it is valid UTF-8, with invalid sequences replaced by U+FFFD
//! otherwise. A request whose connection has already closed is never sent
//! upstream. Once streaming, the relay stops without further output as soon
//! as the owning connection is no longer open; the upstream call itself is
//! not cancelled before that point.

use std::sync::Arc;
use std::time::Instant;

use chatrelay_core::{
    Line, LineDecoder, QueuedRequest, RelayError, ServerMessage, UpstreamFrame,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::registry::{ConnectionRegistry, Outbound};
use crate::upstream::{ChatBackend, ChatRequest};

/// Where a stream session currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Calling,
    Streaming,
    Completed,
    Failed,
}

/// How a stream session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// `done` was delivered
    Completed,
    /// The session failed; the client was told unless the error is `TransportGone`
    Failed(RelayError),
    /// Upstream closed the body without `done` or `error`
    Ended,
}

impl RelayOutcome {
    /// Label used for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed(err) => err.kind(),
            Self::Ended => "ended",
        }
    }
}

/// Bookkeeping for the single in-flight upstream call
struct StreamSession<'a> {
    request: &'a QueuedRequest,
    decoder: LineDecoder,
    state: RelayState,
    lines_forwarded: usize,
}

impl<'a> StreamSession<'a> {
    fn new(request: &'a QueuedRequest) -> Self {
        Self { request, decoder: LineDecoder::new(), state: RelayState::Idle, lines_forwarded: 0 }
    }
}

/// Performs upstream calls and forwards their output
pub struct StreamRelay<B> {
    backend: B,
    registry: Arc<ConnectionRegistry>,
    system_prompt: String,
}

impl<B: ChatBackend> StreamRelay<B> {
    pub fn new(backend: B, registry: Arc<ConnectionRegistry>, system_prompt: impl Into<String>) -> Self {
        Self { backend, registry, system_prompt: system_prompt.into() }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Run one request to a terminal outcome. Never panics on upstream input.
    pub async fn relay(&self, request: &QueuedRequest) -> RelayOutcome {
        let started = Instant::now();
        let mut session = StreamSession::new(request);
        let outcome = self.run(&mut session).await;

        info!(
            correlation_id = %request.correlation_id,
            connection = %request.connection,
            outcome = outcome.label(),
            state = ?session.state,
            lines = session.lines_forwarded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished processing request"
        );
        outcome
    }

    async fn run(&self, session: &mut StreamSession<'_>) -> RelayOutcome {
        let request = session.request;
        if !self.registry.is_open(&request.connection) {
            return self.fail(session, RelayError::TransportGone);
        }
        session.state = RelayState::Calling;

        let upstream =
            ChatRequest::with_system_prompt(&request.model, &self.system_prompt, &request.messages);
        let mut body = match self.backend.chat_stream(&upstream).await {
            Ok(body) => body,
            Err(err) => return self.fail(session, err),
        };

        session.state = RelayState::Streaming;
        debug!(correlation_id = %request.correlation_id, "Upstream accepted, streaming");

        while let Some(chunk) = body.next().await {
            if !self.registry.is_open(&request.connection) {
                return self.fail(session, RelayError::TransportGone);
            }

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => return self.fail(session, err),
            };

            for line in session.decoder.push(&chunk) {
                if let Some(outcome) = self.handle_line(session, &line) {
                    return outcome;
                }
            }
        }

        // A final object sent without a trailing newline still counts.
        let decoder = std::mem::take(&mut session.decoder);
        if let Some(tail) = decoder.finish() {
            if !self.registry.is_open(&request.connection) {
                return self.fail(session, RelayError::TransportGone);
            }
            debug!(bytes = tail.raw().len(), "Parsing trailing fragment");
            if let Some(outcome) = self.handle_line(session, &tail) {
                return outcome;
            }
        }

        session.state = RelayState::Completed;
        RelayOutcome::Ended
    }

    /// Apply one complete upstream line; `Some` means the session is over.
    fn handle_line(&self, session: &mut StreamSession<'_>, line: &Line) -> Option<RelayOutcome> {
        if line.is_blank() {
            return None;
        }

        let text = line.text();
        let frame = match UpstreamFrame::parse(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "JSON parsing error (likely incomplete chunk)");
                return None;
            }
        };

        let connection = session.request.connection;

        if frame.has_content {
            if !self.registry.send(&connection, Outbound::Text(text.into_owned())) {
                return Some(self.fail(session, RelayError::TransportGone));
            }
            session.lines_forwarded += 1;
            metrics::record_line_forwarded();
        }

        if frame.done {
            if !self.registry.send_message(&connection, &ServerMessage::Done) {
                return Some(self.fail(session, RelayError::TransportGone));
            }
            session.state = RelayState::Completed;
            return Some(RelayOutcome::Completed);
        }

        if let Some(message) = frame.error {
            return Some(self.fail(session, RelayError::UpstreamReported(message)));
        }

        None
    }

    /// Report `err` to the client (if possible) and end the session
    fn fail(&self, session: &mut StreamSession<'_>, err: RelayError) -> RelayOutcome {
        let request = session.request;
        session.state = RelayState::Failed;

        match &err {
            RelayError::TransportGone => {
                debug!(correlation_id = %request.correlation_id, "Client gone, dropping output");
            }
            other => {
                warn!(correlation_id = %request.correlation_id, error = %other, "Request failed");
            }
        }

        if let Some(message) = ServerMessage::from_error(&err) {
            self.registry.send_message(&request.connection, &message);
        }
        RelayOutcome::Failed(err)
    }
}
