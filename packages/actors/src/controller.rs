//! Job controller actor: owns the replicas of one job definition.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use ractor::{Actor, ActorCell, ActorProcessingErr, ActorRef, RpcReplyPort};
use runtime_core::{
    JobDefinition, JobError, JobState, ReplicaId, ReplicationMode, RuntimeError, RuntimeResult,
};
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::managed_job::{JobContext, JobControl, JobFactory, JobRunner};
use crate::messages::JobControllerMessage;
use crate::queue_map::{QueueBindings, QueueMap};
use crate::rpc;

/// One running job instance.
struct Replica {
    id: ReplicaId,
    consumer: String,
    control: JobControl,
    task: JoinHandle<()>,
}

/// State for the job controller actor.
pub struct JobControllerState<F> {
    definition: JobDefinition,
    factory: Arc<F>,
    queues: Option<QueueBindings>,
    /// Replicas counted by `get_replicas`.
    replicas: Vec<Replica>,
    /// Replicas asked to finish by a scale down, still winding down.
    retiring: Vec<Replica>,
    exceptions: Vec<String>,
    next_index: usize,
    started: bool,
    paused: bool,
    finishing: bool,
    waiters: Vec<RpcReplyPort<JobState>>,
}

impl<F: JobFactory> JobControllerState<F> {
    fn new(definition: JobDefinition, factory: Arc<F>) -> Self {
        Self {
            definition,
            factory,
            queues: None,
            replicas: Vec::new(),
            retiring: Vec::new(),
            exceptions: Vec::new(),
            next_index: 0,
            started: false,
            paused: false,
            finishing: false,
            waiters: Vec::new(),
        }
    }

    fn all_done(&self) -> bool {
        self.replicas.is_empty() && self.retiring.is_empty()
    }

    fn state(&self) -> JobState {
        if !self.started {
            return JobState::Idle;
        }
        if !self.all_done() {
            if self.finishing || self.replicas.is_empty() {
                return JobState::Finishing;
            }
            if self.paused {
                return JobState::Paused;
            }
            return JobState::Running;
        }
        match self.exceptions.first() {
            Some(error) => JobState::Failed {
                error: error.clone(),
            },
            None => JobState::Terminated,
        }
    }

    fn ensure_bound(&self) -> RuntimeResult<()> {
        if self.queues.is_none() && self.definition.queue_references().next().is_some() {
            return Err(RuntimeError::Configuration(format!(
                "queues of job '{}' are not bound",
                self.definition.name
            )));
        }
        Ok(())
    }

    async fn spawn_replica(&mut self, myself: &ActorRef<JobControllerMessage>) -> RuntimeResult<()> {
        let index = self.next_index;
        self.next_index += 1;
        let consumer = self.definition.consumer_name(index);
        let queues = self.queues.clone().unwrap_or_default();
        let input = queues.input.clone();

        let job = self.factory.create(JobContext {
            definition: self.definition.clone(),
            replica_index: index,
            consumer_name: consumer.clone(),
            instance_parameters: self.definition.instance_parameters.clone(),
            queues,
        })?;
        if let Some(input) = &input {
            input.register(&consumer).await?;
        }

        let control = JobControl::new();
        if self.paused {
            control.pause();
        }
        let id = ReplicaId::new();
        let name = format!("{}#{}", self.definition.qualified_name(), index);
        let (runner, _state) =
            JobRunner::from_definition(&self.definition, name.clone(), job, control.clone());

        let controller = myself.clone();
        let task = tokio::spawn(async move {
            let outcome = runner.run().await;
            let _ = controller.send_message(JobControllerMessage::ReplicaExited {
                replica_id: id,
                outcome,
            });
        });
        tracing::info!("Started replica {} ({})", name, id);

        self.replicas.push(Replica {
            id,
            consumer,
            control,
            task,
        });
        Ok(())
    }

    async fn scale_to(
        &mut self,
        myself: &ActorRef<JobControllerMessage>,
        target: usize,
    ) -> RuntimeResult<usize> {
        while self.replicas.len() < target {
            self.spawn_replica(myself).await?;
        }
        while self.replicas.len() > target {
            if let Some(replica) = self.replicas.pop() {
                tracing::info!("Retiring replica {} of {}", replica.id, self.definition.name);
                replica.control.finish();
                self.retiring.push(replica);
            }
        }
        Ok(self.replicas.len())
    }

    async fn release_consumer(&mut self, consumer: &str) {
        let Some(input) = self.queues.as_ref().and_then(|queues| queues.input.as_ref()) else {
            return;
        };
        let shared_still_used = self.definition.replication_mode == ReplicationMode::SharedCursor
            && !self.all_done();
        if shared_still_used {
            return;
        }
        if let Err(e) = input.unregister(consumer).await {
            tracing::debug!("Could not unregister {}: {}", consumer, e);
        }
    }

    fn answer_waiters(&mut self) {
        let state = self.state();
        for reply in self.waiters.drain(..) {
            let _ = reply.send(state.clone());
        }
    }
}

/// Arguments for starting a job controller.
pub struct JobControllerArgs<F> {
    pub definition: JobDefinition,
    pub factory: Arc<F>,
}

/// Controller actor for one job definition.
pub struct JobControllerActor<F>(PhantomData<fn() -> F>);

impl<F> Default for JobControllerActor<F> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<F: JobFactory> Actor for JobControllerActor<F> {
    type Msg = JobControllerMessage;
    type State = JobControllerState<F>;
    type Arguments = JobControllerArgs<F>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting job controller: {}", args.definition.qualified_name());
        Ok(JobControllerState::new(args.definition, args.factory))
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for replica in state.replicas.drain(..).chain(state.retiring.drain(..)) {
            replica.task.abort();
        }
        tracing::info!("Job controller stopped: {}", state.definition.qualified_name());
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            JobControllerMessage::EvaluateQueues { queue_map, reply } => {
                let result = if state.started {
                    Err(RuntimeError::Configuration(format!(
                        "job '{}' is already started",
                        state.definition.name
                    )))
                } else {
                    queue_map.bind(&state.definition).map(|bindings| {
                        state.queues = Some(bindings);
                    })
                };
                let _ = reply.send(result);
            }

            JobControllerMessage::Start { replicas, reply } => {
                let target = replicas.unwrap_or(state.definition.replicas);
                let result = if state.started {
                    Err(RuntimeError::Configuration(format!(
                        "job '{}' is already started",
                        state.definition.name
                    )))
                } else if target == 0 {
                    Err(RuntimeError::Configuration(format!(
                        "job '{}' needs at least one replica",
                        state.definition.name
                    )))
                } else {
                    match state.ensure_bound() {
                        Ok(()) => {
                            state.started = true;
                            let result = state.scale_to(&myself, target).await;
                            // Nothing runs, so the job may be started again.
                            if result.is_err() && state.replicas.is_empty() {
                                state.started = false;
                            }
                            result
                        }
                        Err(e) => Err(e),
                    }
                };
                let _ = reply.send(result);
            }

            JobControllerMessage::Scale { replicas, reply } => {
                let result = if !state.started {
                    Err(RuntimeError::Configuration(format!(
                        "job '{}' is not started",
                        state.definition.name
                    )))
                } else if state.finishing {
                    Err(RuntimeError::Configuration(format!(
                        "job '{}' is finishing",
                        state.definition.name
                    )))
                } else {
                    state.scale_to(&myself, replicas).await
                };
                let _ = reply.send(result);
            }

            JobControllerMessage::Pause { reply } => {
                state.paused = true;
                for replica in &state.replicas {
                    replica.control.pause();
                }
                let _ = reply.send(());
            }

            JobControllerMessage::Resume { reply } => {
                state.paused = false;
                for replica in &state.replicas {
                    replica.control.resume();
                }
                let _ = reply.send(());
            }

            JobControllerMessage::Finish { reply } => {
                state.finishing = true;
                for replica in &state.replicas {
                    replica.control.finish();
                }
                tracing::info!("Finishing job: {}", state.definition.qualified_name());
                let _ = reply.send(());
            }

            JobControllerMessage::GetState { reply } => {
                let _ = reply.send(state.state());
            }

            JobControllerMessage::GetReplicas { reply } => {
                let _ = reply.send(state.replicas.len());
            }

            JobControllerMessage::GetDefinition { reply } => {
                let _ = reply.send(state.definition.clone());
            }

            JobControllerMessage::WaitFinished { reply } => {
                if state.all_done() {
                    let _ = reply.send(state.state());
                } else {
                    state.waiters.push(reply);
                }
            }

            JobControllerMessage::Successful { reply } => {
                let _ = reply.send(
                    state.started && state.all_done() && state.exceptions.is_empty(),
                );
            }

            JobControllerMessage::Failed { reply } => {
                let _ = reply.send(!state.exceptions.is_empty());
            }

            JobControllerMessage::Exceptions { reply } => {
                let _ = reply.send(state.exceptions.clone());
            }

            JobControllerMessage::ReplicaExited {
                replica_id,
                outcome,
            } => {
                let exited = match state.replicas.iter().position(|r| r.id == replica_id) {
                    Some(index) => Some(state.replicas.remove(index)),
                    None => state
                        .retiring
                        .iter()
                        .position(|r| r.id == replica_id)
                        .map(|index| state.retiring.remove(index)),
                };
                let Some(replica) = exited else {
                    return Ok(());
                };

                match outcome {
                    Ok(()) => tracing::info!(
                        "Replica {} of {} terminated",
                        replica.id,
                        state.definition.name
                    ),
                    Err(JobError { message }) => {
                        tracing::warn!(
                            "Replica {} of {} failed: {}",
                            replica.id,
                            state.definition.name,
                            message
                        );
                        state.exceptions.push(message);
                    }
                }
                state.release_consumer(&replica.consumer).await;

                if state.all_done() {
                    state.answer_waiters();
                }
            }

            JobControllerMessage::Shutdown => {
                tracing::info!("Shutting down job controller: {}", state.definition.qualified_name());
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Validate a definition and spawn its controller, linked to `supervisor` when given.
pub async fn spawn_controller<F: JobFactory>(
    definition: JobDefinition,
    factory: F,
    config: &RuntimeConfig,
    supervisor: Option<ActorCell>,
) -> RuntimeResult<(JobController, JoinHandle<()>)> {
    definition.validate()?;
    let name = definition.qualified_name();
    let args = JobControllerArgs {
        definition,
        factory: Arc::new(factory),
    };
    let spawned = match supervisor {
        Some(supervisor) => {
            Actor::spawn_linked(None, JobControllerActor::<F>::default(), args, supervisor).await
        }
        None => Actor::spawn(None, JobControllerActor::<F>::default(), args).await,
    };
    let (actor, handle) = spawned
        .map_err(|e| RuntimeError::Remote(format!("Failed to spawn controller {}: {}", name, e)))?;
    Ok((JobController::new(actor, name, config.call_timeout), handle))
}

/// Remotely controllable handle to a deployed job.
#[derive(Debug, Clone)]
pub struct JobController {
    actor: ActorRef<JobControllerMessage>,
    name: String,
    call_timeout: Option<Duration>,
}

impl JobController {
    pub fn new(
        actor: ActorRef<JobControllerMessage>,
        name: impl Into<String>,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            actor,
            name: name.into(),
            call_timeout,
        }
    }

    /// Qualified name, `<group_path>/<name>`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn actor(&self) -> &ActorRef<JobControllerMessage> {
        &self.actor
    }

    /// Bind the definition's queue references against `queue_map`.
    pub async fn evaluate_queues(&self, queue_map: &QueueMap) -> RuntimeResult<()> {
        let queue_map = queue_map.clone();
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::EvaluateQueues { queue_map, reply },
            self.call_timeout,
            "evaluate_queues",
        )
        .await?
    }

    /// Start replicas, defaulting to the definition's count. Returns the live count.
    pub async fn start(&self, replicas: Option<usize>) -> RuntimeResult<usize> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::Start { replicas, reply },
            self.call_timeout,
            "start",
        )
        .await?
    }

    /// Add or gracefully retire replicas until `replicas` are live.
    pub async fn scale(&self, replicas: usize) -> RuntimeResult<usize> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::Scale { replicas, reply },
            self.call_timeout,
            "scale",
        )
        .await?
    }

    pub async fn pause(&self) -> RuntimeResult<()> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::Pause { reply },
            self.call_timeout,
            "pause",
        )
        .await
    }

    pub async fn resume(&self) -> RuntimeResult<()> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::Resume { reply },
            self.call_timeout,
            "resume",
        )
        .await
    }

    /// Ask every replica to shut down after its current iteration.
    pub async fn finish(&self) -> RuntimeResult<()> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::Finish { reply },
            self.call_timeout,
            "finish",
        )
        .await
    }

    pub async fn get_state(&self) -> RuntimeResult<JobState> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::GetState { reply },
            self.call_timeout,
            "get_state",
        )
        .await
    }

    pub async fn get_replicas(&self) -> RuntimeResult<usize> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::GetReplicas { reply },
            self.call_timeout,
            "get_replicas",
        )
        .await
    }

    pub async fn definition(&self) -> RuntimeResult<JobDefinition> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::GetDefinition { reply },
            self.call_timeout,
            "definition",
        )
        .await
    }

    /// Suspend until no replica is alive and return the final state.
    pub async fn wait_finished(&self) -> RuntimeResult<JobState> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::WaitFinished { reply },
            None,
            "wait_finished",
        )
        .await
    }

    pub async fn successful(&self) -> RuntimeResult<bool> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::Successful { reply },
            self.call_timeout,
            "successful",
        )
        .await
    }

    pub async fn failed(&self) -> RuntimeResult<bool> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::Failed { reply },
            self.call_timeout,
            "failed",
        )
        .await
    }

    /// Error messages of every replica that failed.
    pub async fn exceptions(&self) -> RuntimeResult<Vec<String>> {
        rpc::call(
            &self.actor,
            |reply| JobControllerMessage::Exceptions { reply },
            self.call_timeout,
            "exceptions",
        )
        .await
    }

    /// Tear the controller down, aborting replicas still running.
    pub fn stop(&self) -> RuntimeResult<()> {
        self.actor
            .send_message(JobControllerMessage::Shutdown)
            .map_err(|_| RuntimeError::Remote(format!("controller {} unreachable", self.name)))
    }
}
