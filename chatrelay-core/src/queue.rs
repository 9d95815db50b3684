//! FIFO waiting list of admitted chat requests.
//!
//! The queue itself is plain data; the server wraps it together with the
//! "currently processing" marker behind a single lock so that every mutation
//! and the position broadcast that follows it are atomic.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::RelayError;
use crate::protocol::{ChatMessage, Submission};

/// Identity of one accepted client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A request waiting for (or holding) the upstream
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    /// Caller-supplied correlation id
    pub correlation_id: String,
    /// Owning connection, resolved against the registry at send time
    pub connection: ConnectionId,
    /// Target model identifier
    pub model: String,
    /// Conversation history
    pub messages: Vec<ChatMessage>,
    /// When the request entered the queue
    pub enqueued_at: Instant,
}

impl QueuedRequest {
    pub fn new(connection: ConnectionId, submission: Submission) -> Self {
        Self {
            correlation_id: submission.id,
            connection,
            model: submission.model,
            messages: submission.messages,
            enqueued_at: Instant::now(),
        }
    }

    /// Time spent waiting so far
    pub fn queue_wait(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Position report for one waiting request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePosition {
    pub connection: ConnectionId,
    pub position: usize,
    pub length: usize,
}

/// Strict FIFO queue with an optional capacity
#[derive(Debug, Default)]
pub struct RequestQueue {
    waiting: VecDeque<QueuedRequest>,
    /// 0 means unbounded
    max_len: usize,
}

impl RequestQueue {
    /// Create a queue holding at most `max_len` requests (0 = unbounded)
    pub fn new(max_len: usize) -> Self {
        Self { waiting: VecDeque::new(), max_len }
    }

    /// Append a request at the tail, returning its zero-based position
    pub fn push(&mut self, request: QueuedRequest) -> Result<usize, RelayError> {
        if self.max_len > 0 && self.waiting.len() >= self.max_len {
            return Err(RelayError::QueueFull { max: self.max_len });
        }
        self.waiting.push_back(request);
        Ok(self.waiting.len() - 1)
    }

    /// Remove and return the head of the queue
    pub fn pop(&mut self) -> Option<QueuedRequest> {
        self.waiting.pop_front()
    }

    /// Remove every request owned by `connection`, wherever it sits.
    ///
    /// Returns the removed requests in their original order.
    pub fn remove_connection(&mut self, connection: &ConnectionId) -> Vec<QueuedRequest> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.waiting.len());
        for request in self.waiting.drain(..) {
            if request.connection == *connection {
                removed.push(request);
            } else {
                kept.push_back(request);
            }
        }
        self.waiting = kept;
        removed
    }

    /// Current position of every waiting request, head first
    pub fn positions(&self) -> impl Iterator<Item = QueuePosition> + '_ {
        let length = self.waiting.len();
        self.waiting.iter().enumerate().map(move |(position, request)| QueuePosition {
            connection: request.connection,
            position,
            length,
        })
    }

    /// Correlation ids of waiting requests, head first
    pub fn correlation_ids(&self) -> Vec<String> {
        self.waiting.iter().map(|r| r.correlation_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn capacity_limit(&self) -> usize {
        self.max_len
    }
}
