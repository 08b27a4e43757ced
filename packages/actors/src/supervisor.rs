//! Supervisor actor hosting the queues of one process.

use std::collections::HashMap;
use std::time::Duration;

use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, SupervisionEvent};
use runtime_core::{QueueReference, RuntimeError, RuntimeResult};

use crate::config::RuntimeConfig;
use crate::messages::SupervisorMessage;
use crate::queue_actor::{QueueActor, QueueActorState, QueueHandle};
use crate::queue_map::QueueMap;
use crate::rpc;

/// State for the supervisor actor.
pub struct SupervisorState {
    /// Hosted queues by name.
    pub queues: HashMap<String, QueueHandle>,
    call_timeout: Option<Duration>,
}

impl SupervisorState {
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            queues: HashMap::new(),
            call_timeout: config.call_timeout,
        }
    }

    fn forget_child(&mut self, cell: &ActorCell) -> Option<String> {
        let name = self
            .queues
            .iter()
            .find(|(_, queue)| queue.actor().get_id() == cell.get_id())
            .map(|(name, _)| name.clone())?;
        self.queues.remove(&name);
        Some(name)
    }
}

async fn spawn_queue_actor(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut SupervisorState,
    reference: QueueReference,
) -> Result<QueueHandle, ActorProcessingErr> {
    let (actor, _handle) = Actor::spawn_linked(
        None,
        QueueActor,
        QueueActorState::new(reference.clone()),
        myself.get_cell(),
    )
    .await
    .map_err(|e| ActorProcessingErr::from(format!("Failed to spawn queue: {}", e)))?;

    let queue = QueueHandle::new(actor, reference.clone(), state.call_timeout);
    state.queues.insert(reference.name, queue.clone());
    Ok(queue)
}

/// Supervisor actor that manages all queues.
pub struct Supervisor;

impl Actor for Supervisor {
    type Msg = SupervisorMessage;
    type State = SupervisorState;
    type Arguments = RuntimeConfig;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting runtime supervisor");
        Ok(SupervisorState::new(&args))
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::CreateQueue { reference, reply } => {
                // Creating a queue that already exists with the same type is a no-op
                if let Some(existing) = state.queues.get(&reference.name) {
                    let result = reference
                        .ensure_compatible(existing.reference())
                        .map(|_| existing.clone());
                    let _ = reply.send(result);
                    return Ok(());
                }

                match spawn_queue_actor(&myself, state, reference).await {
                    Ok(queue) => {
                        let _ = reply.send(Ok(queue));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(RuntimeError::Remote(e.to_string())));
                    }
                }
            }

            SupervisorMessage::GetQueue { name, reply } => {
                let _ = reply.send(state.queues.get(&name).cloned());
            }

            SupervisorMessage::ListQueues { reply } => {
                let mut queues: Vec<QueueReference> = state
                    .queues
                    .values()
                    .map(|queue| queue.reference().clone())
                    .collect();
                queues.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = reply.send(queues);
            }

            SupervisorMessage::DeleteQueue { name, reply } => {
                if let Some(queue) = state.queues.remove(&name) {
                    let _ = queue.shutdown();
                    tracing::info!("Deleted queue: {}", name);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(RuntimeError::NotFound(format!("queue '{}'", name))));
                }
            }

            SupervisorMessage::QueueMap { reply } => {
                let _ = reply.send(state.queues.values().cloned().collect());
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down supervisor");
                for queue in state.queues.values() {
                    let _ = queue.shutdown();
                }
                myself.stop(None);
                return Ok(());
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                let queue = state.forget_child(&cell);
                tracing::info!(
                    "Child actor {} terminated{}: {:?}",
                    cell.get_id(),
                    queue.map(|name| format!(" (queue {})", name)).unwrap_or_default(),
                    reason
                );
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                let queue = state.forget_child(&cell);
                tracing::warn!(
                    "Child actor {} failed{}: {}",
                    cell.get_id(),
                    queue.map(|name| format!(" (queue {})", name)).unwrap_or_default(),
                    error
                );
            }
            _ => {}
        }
        Ok(())
    }
}

/// Start a supervisor.
pub async fn start_supervisor(
    config: &RuntimeConfig,
) -> RuntimeResult<(SupervisorHandle, tokio::task::JoinHandle<()>)> {
    let (actor, handle) = Actor::spawn(None, Supervisor, config.clone())
        .await
        .map_err(|e| RuntimeError::Remote(format!("Failed to spawn supervisor: {}", e)))?;

    Ok((SupervisorHandle::new(actor, config.call_timeout), handle))
}

/// Proxy to a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    actor: ActorRef<SupervisorMessage>,
    call_timeout: Option<Duration>,
}

impl SupervisorHandle {
    pub fn new(actor: ActorRef<SupervisorMessage>, call_timeout: Option<Duration>) -> Self {
        Self {
            actor,
            call_timeout,
        }
    }

    pub fn actor(&self) -> &ActorRef<SupervisorMessage> {
        &self.actor
    }

    /// Host a queue, or return the existing one when its type matches.
    pub async fn create_queue(&self, reference: QueueReference) -> RuntimeResult<QueueHandle> {
        rpc::call(
            &self.actor,
            |reply| SupervisorMessage::CreateQueue { reference, reply },
            self.call_timeout,
            "create_queue",
        )
        .await?
    }

    /// Host a queue carrying items of type `T`.
    pub async fn create_queue_of<T>(&self, name: impl Into<String>) -> RuntimeResult<QueueHandle> {
        self.create_queue(QueueReference::of::<T>(name)).await
    }

    pub async fn get_queue(&self, name: &str) -> RuntimeResult<Option<QueueHandle>> {
        let name = name.to_string();
        rpc::call(
            &self.actor,
            |reply| SupervisorMessage::GetQueue { name, reply },
            self.call_timeout,
            "get_queue",
        )
        .await
    }

    pub async fn list_queues(&self) -> RuntimeResult<Vec<QueueReference>> {
        rpc::call(
            &self.actor,
            |reply| SupervisorMessage::ListQueues { reply },
            self.call_timeout,
            "list_queues",
        )
        .await
    }

    /// Stop a queue; its parked readers observe a remote error.
    pub async fn delete_queue(&self, name: &str) -> RuntimeResult<()> {
        let name = name.to_string();
        rpc::call(
            &self.actor,
            |reply| SupervisorMessage::DeleteQueue { name, reply },
            self.call_timeout,
            "delete_queue",
        )
        .await?
    }

    /// Snapshot of every hosted queue.
    pub async fn queue_map(&self) -> RuntimeResult<QueueMap> {
        rpc::call(
            &self.actor,
            |reply| SupervisorMessage::QueueMap { reply },
            self.call_timeout,
            "queue_map",
        )
        .await
    }

    pub fn shutdown(&self) -> RuntimeResult<()> {
        self.actor
            .send_message(SupervisorMessage::Shutdown)
            .map_err(|_| RuntimeError::Remote("supervisor unreachable".into()))
    }
}
