//! Actor system for the job/queue/event runtime.
//!
//! This crate provides the Ractor-based actors hosting queues, the event
//! store and job controllers, together with the handles other processes use
//! to reach them.
//!
//! # Architecture
//!
//! - `Supervisor` - Top-level actor that hosts queue actors
//! - `QueueActor` - Owns one queue's items and consumer cursors
//! - `EventStoreActor` - Owns handlers, event history and the lock table
//! - `JobControllerActor` - Owns the replicas of one job definition
//!
//! Every handle method is a request/response round-trip returning
//! `RuntimeResult`; delivery failures surface as `RuntimeError::Remote`.
//!
//! # Usage
//!
//! ```ignore
//! use actors::{Runtime, RuntimeConfig};
//!
//! let mut runtime = Runtime::start(RuntimeConfig::from_env()?).await?;
//! let numbers = runtime.create_queue::<u64>("numbers").await?;
//! let job = runtime.deploy(definition, factory).await?;
//! job.start(None).await?;
//! ```

mod combined_events;
mod config;
mod controller;
mod event_store;
mod event_store_actor;
mod handler;
mod local_queue;
mod managed_job;
mod messages;
mod queue_actor;
mod queue_map;
mod rpc;
mod runtime;
mod supervisor;

pub use combined_events::CombinedEvents;
pub use config::{ConfigError, RuntimeConfig};
pub use controller::{JobController, JobControllerActor, spawn_controller};
pub use event_store::{EVENT_RECORDED, EventStore, LOCK_RELEASED, ProcessReport};
pub use event_store_actor::{EventStoreActor, EventStoreArgs, EventStoreHandle, start_event_store};
pub use handler::{CallbackFuture, CallbackResult, FnCallback, Handler, HandlerCallback};
pub use local_queue::LocalQueue;
pub use managed_job::{JobContext, JobControl, JobFactory, JobRunner, ManagedJob};
pub use messages::{EventStoreMessage, JobControllerMessage, QueueMessage, SupervisorMessage};
pub use queue_actor::{QueueActor, QueueHandle, start_queue};
pub use queue_map::{QueueBindings, QueueMap};
pub use runtime::Runtime;
pub use supervisor::{Supervisor, SupervisorHandle, start_supervisor};

pub use runtime_core::{
    Event, EventReference, HandlerDefinition, JobDefinition, JobError, JobState, MAX_LOCK_TTL_MS,
    Operation, Predicate, QueueReference, ReplicationMode, RuntimeError, RuntimeResult, SessionId,
    SessionMap,
};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
