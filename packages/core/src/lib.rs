//! Core domain types for the job runtime.
//!
//! This crate contains the pure, synchronous parts shared by every package:
//! - Queue references and the per-consumer cursor book
//! - Event references, sessions and the lock table
//! - Boolean operations over event history and handler definitions
//! - Job definitions and lifecycle states
//! - The error taxonomy

mod error;
mod events;
mod job;
mod operation;
mod queue;

pub use error::{JobError, RuntimeError, RuntimeResult};
pub use events::{Event, EventReference, Lock, LockTable, MAX_LOCK_TTL_MS, SessionId, SessionMap};
pub use job::{JobDefinition, JobState, ReplicaId, ReplicationMode};
pub use operation::{EventHistory, HandlerDefinition, HandlerId, HistoryView, Operation, Predicate};
pub use queue::{ANONYMOUS_PRODUCER, DEFAULT_CONSUMER, QueueBook, QueueReference, QueueStats};
