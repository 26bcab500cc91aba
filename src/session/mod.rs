//! Session lifecycle: the per-session actor, its mailbox/backpressure
//! handle, reconnect outbox, and periodic checkpointing.

pub mod actor;
pub mod checkpoint;
pub mod handle;
pub mod outbox;
pub mod types;

pub use actor::SessionActorDeps;
pub use checkpoint::{SessionCheckpoint, SessionCheckpointStore};
pub use handle::{SendOutcome, SessionHandle};
pub use outbox::Outbox;
pub use types::{OutboundEvent, SequencedEvent, SessionCommand, SessionId, SessionStatus, VideoContext};
