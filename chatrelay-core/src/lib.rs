//! chatrelay core library
//!
//! Runtime-free building blocks of the single-worker chat relay: the client
//! protocol, the FIFO request queue, incremental NDJSON decoding of the
//! upstream body and the error taxonomy shared by every stage.

pub mod decoder;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod queue;

pub use decoder::{Line, LineDecoder};
pub use error::RelayError;
pub use frame::UpstreamFrame;
pub use protocol::{ChatMessage, Role, ServerMessage, Submission};
pub use queue::{ConnectionId, QueuePosition, QueuedRequest, RequestQueue};
