//! Job definitions and lifecycle states.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

use crate::error::{RuntimeError, RuntimeResult};
use crate::queue::QueueReference;

/// Unique identifier for a job replica, using ULID for chronological sorting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub Ulid);

impl ReplicaId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How replicas of one job share the input queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationMode {
    /// Every replica reads the whole input stream with its own cursor.
    #[default]
    Independent,
    /// Replicas share one cursor, so each item reaches a single replica.
    SharedCursor,
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::Independent => write!(f, "independent"),
            ReplicationMode::SharedCursor => write!(f, "shared_cursor"),
        }
    }
}

/// Lifecycle state of a managed job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Constructed but not started.
    #[default]
    Idle,
    Running,
    Paused,
    /// Shutdown requested, running the shutdown hook.
    Finishing,
    /// Stopped normally.
    Terminated,
    /// Stopped by an error escaping the job body.
    Failed { error: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Terminated | JobState::Failed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Paused => "paused",
            JobState::Finishing => "finishing",
            JobState::Terminated => "terminated",
            JobState::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative description of a job and its queue wiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_queue: Option<QueueReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_queues: Vec<QueueReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_queues: Vec<QueueReference>,
    /// Pause between recurring iterations.
    pub wait_time: Duration,
    pub single_run: bool,
    pub replicas: usize,
    pub replication_mode: ReplicationMode,
    /// Logical placement hint, also used to name the controller.
    pub group_path: String,
    /// Passed to every job construction.
    #[serde(default)]
    pub parameters: Value,
    /// Passed to each replica.
    #[serde(default)]
    pub instance_parameters: Value,
}

impl JobDefinition {
    /// Create a recurring single-replica definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            input_queue: None,
            extra_queues: Vec::new(),
            output_queues: Vec::new(),
            wait_time: Duration::from_secs(1),
            single_run: false,
            replicas: 1,
            replication_mode: ReplicationMode::default(),
            group_path: String::new(),
            parameters: Value::Null,
            instance_parameters: Value::Null,
        }
    }

    pub fn with_input(mut self, queue: QueueReference) -> Self {
        self.input_queue = Some(queue);
        self
    }

    pub fn with_extra_queue(mut self, queue: QueueReference) -> Self {
        self.extra_queues.push(queue);
        self
    }

    pub fn with_output(mut self, queue: QueueReference) -> Self {
        self.output_queues.push(queue);
        self
    }

    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = wait_time;
        self
    }

    pub fn with_single_run(mut self, single_run: bool) -> Self {
        self.single_run = single_run;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_replication_mode(mut self, mode: ReplicationMode) -> Self {
        self.replication_mode = mode;
        self
    }

    pub fn with_group_path(mut self, group_path: impl Into<String>) -> Self {
        self.group_path = group_path.into();
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_instance_parameters(mut self, parameters: Value) -> Self {
        self.instance_parameters = parameters;
        self
    }

    /// Reject definitions that can never run.
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.name.trim().is_empty() {
            return Err(RuntimeError::Configuration(
                "job name must not be empty".into(),
            ));
        }
        if self.replicas == 0 {
            return Err(RuntimeError::Configuration(format!(
                "job '{}' needs at least one replica",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for queue in self.queue_references() {
            if !seen.insert(&queue.name) {
                return Err(RuntimeError::Configuration(format!(
                    "job '{}' references queue '{}' twice",
                    self.name, queue.name
                )));
            }
        }
        Ok(())
    }

    /// Input, extra and output references in that order.
    pub fn queue_references(&self) -> impl Iterator<Item = &QueueReference> {
        self.input_queue
            .iter()
            .chain(self.extra_queues.iter())
            .chain(self.output_queues.iter())
    }

    /// Name the controller is registered under.
    pub fn qualified_name(&self) -> String {
        if self.group_path.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.group_path.trim_end_matches('/'), self.name)
        }
    }

    /// Input-queue consumer name for a replica.
    pub fn consumer_name(&self, replica_index: usize) -> String {
        match self.replication_mode {
            ReplicationMode::Independent => format!("{}-{}", self.name, replica_index),
            ReplicationMode::SharedCursor => self.name.clone(),
        }
    }
}
