//! Message types for actor communication.

use runtime_core::{
    Event, EventReference, HandlerDefinition, JobDefinition, JobError, JobState, QueueReference,
    QueueStats, ReplicaId, RuntimeResult, SessionId, SessionMap,
};
use ractor::RpcReplyPort;
use serde_json::Value;

use crate::combined_events::CombinedEvents;
use crate::event_store::ProcessReport;
use crate::handler::Handler;
use crate::queue_actor::QueueHandle;
use crate::queue_map::QueueMap;

/// Messages for the QueueActor.
#[derive(Debug)]
pub enum QueueMessage {
    /// Append one item.
    Put {
        item: Value,
        producer: Option<String>,
        reply: RpcReplyPort<RuntimeResult<()>>,
    },

    /// Append items in order.
    PutIter {
        items: Vec<Value>,
        producer: Option<String>,
        reply: RpcReplyPort<RuntimeResult<usize>>,
    },

    /// Read the next item for a consumer; parked until data arrives when `wait` is set.
    Get {
        consumer: Option<String>,
        wait: bool,
        reply: RpcReplyPort<RuntimeResult<Value>>,
    },

    /// Read up to `count` items; parked until at least one is available.
    GetBatch {
        consumer: Option<String>,
        count: usize,
        reply: RpcReplyPort<RuntimeResult<Vec<Value>>>,
    },

    /// Items not yet consumed by the slowest consumer.
    QSize { reply: RpcReplyPort<usize> },

    /// Register a consumer cursor.
    Register {
        consumer: String,
        reply: RpcReplyPort<u64>,
    },

    /// Drop a consumer cursor.
    Unregister {
        consumer: String,
        reply: RpcReplyPort<bool>,
    },

    /// Parked until any consumer has data; answers false when the queue is finished and drained.
    Wait { reply: RpcReplyPort<bool> },

    /// Mark completion for a consumer or the whole queue.
    Finish {
        consumer: Option<String>,
        reply: RpcReplyPort<RuntimeResult<()>>,
    },

    /// Whether a consumer has nothing left and never will.
    IsExhausted {
        consumer: Option<String>,
        reply: RpcReplyPort<bool>,
    },

    /// Get the queue reference.
    GetInfo { reply: RpcReplyPort<QueueReference> },

    /// Get queue stats.
    GetStats { reply: RpcReplyPort<QueueStats> },

    /// Shutdown the queue; parked callers observe a dropped reply.
    Shutdown,
}

/// Messages for the EventStoreActor.
#[derive(Debug)]
pub enum EventStoreMessage {
    /// Register handlers; already known handler IDs are skipped.
    RegisterHandlers {
        handlers: Vec<Handler>,
        reply: RpcReplyPort<usize>,
    },

    /// Route an event through lock, evaluate, callback and unlock.
    Publish {
        event: Event,
        reply: RpcReplyPort<RuntimeResult<ProcessReport>>,
    },

    /// Append an event to the global history or a session overlay.
    Record {
        event: Event,
        session: Option<SessionId>,
        reply: RpcReplyPort<RuntimeResult<()>>,
    },

    SetLock {
        reference: EventReference,
        ttl_ms: Option<u64>,
        reply: RpcReplyPort<RuntimeResult<SessionId>>,
    },

    GetSessionLock {
        reference: EventReference,
        reply: RpcReplyPort<Option<SessionId>>,
    },

    Unlock {
        session: SessionId,
        reply: RpcReplyPort<bool>,
    },

    IsLocked {
        reference: EventReference,
        owned: SessionMap,
        reply: RpcReplyPort<bool>,
    },

    HandlersByEventType {
        event_type: String,
        reply: RpcReplyPort<Vec<HandlerDefinition>>,
    },

    HandlerByLastEvent {
        event: Event,
        session: Option<SessionId>,
        reply: RpcReplyPort<Option<HandlerDefinition>>,
    },

    HandlersByLastEvents {
        events: Vec<Event>,
        session: Option<SessionId>,
        reply: RpcReplyPort<Vec<Option<HandlerDefinition>>>,
    },

    /// Get the change notification flags (in-process subscribers only).
    Subscribe { reply: RpcReplyPort<CombinedEvents> },

    /// Periodic tick for housekeeping.
    Tick,

    /// Shutdown the store.
    Shutdown,
}

/// Messages for the JobControllerActor.
#[derive(Debug)]
pub enum JobControllerMessage {
    /// Bind the definition's queue references to concrete queues.
    EvaluateQueues {
        queue_map: QueueMap,
        reply: RpcReplyPort<RuntimeResult<()>>,
    },

    /// Start replicas, defaulting to the definition's count.
    Start {
        replicas: Option<usize>,
        reply: RpcReplyPort<RuntimeResult<usize>>,
    },

    /// Add or retire replicas to reach the target count.
    Scale {
        replicas: usize,
        reply: RpcReplyPort<RuntimeResult<usize>>,
    },

    Pause { reply: RpcReplyPort<()> },

    Resume { reply: RpcReplyPort<()> },

    /// Ask every replica to shut down gracefully.
    Finish { reply: RpcReplyPort<()> },

    GetState { reply: RpcReplyPort<JobState> },

    GetReplicas { reply: RpcReplyPort<usize> },

    GetDefinition { reply: RpcReplyPort<JobDefinition> },

    /// Parked until no replica is alive; answers with the final state.
    WaitFinished { reply: RpcReplyPort<JobState> },

    Successful { reply: RpcReplyPort<bool> },

    Failed { reply: RpcReplyPort<bool> },

    Exceptions { reply: RpcReplyPort<Vec<String>> },

    /// Sent by a replica task when its job loop returns.
    ReplicaExited {
        replica_id: ReplicaId,
        outcome: Result<(), JobError>,
    },

    /// Tear the controller down, aborting replicas still running.
    Shutdown,
}

/// Messages for the Supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Create and host a new queue.
    CreateQueue {
        reference: QueueReference,
        reply: RpcReplyPort<RuntimeResult<QueueHandle>>,
    },

    /// Get a queue by name.
    GetQueue {
        name: String,
        reply: RpcReplyPort<Option<QueueHandle>>,
    },

    /// List all hosted queues.
    ListQueues {
        reply: RpcReplyPort<Vec<QueueReference>>,
    },

    /// Stop and forget a queue.
    DeleteQueue {
        name: String,
        reply: RpcReplyPort<RuntimeResult<()>>,
    },

    /// Snapshot of every hosted queue, for binding job definitions.
    QueueMap { reply: RpcReplyPort<QueueMap> },

    /// Shutdown all queues.
    Shutdown,
}
