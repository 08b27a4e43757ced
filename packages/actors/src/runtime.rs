//! Process-level facade: supervisor, event store and deployed jobs.

use std::time::Duration;

use futures_util::future::join_all;
use ractor::Actor;
use runtime_core::{JobDefinition, JobState, RuntimeError, RuntimeResult};
use tokio::task::JoinHandle;

use crate::config::RuntimeConfig;
use crate::controller::{JobController, spawn_controller};
use crate::event_store_actor::{EventStoreActor, EventStoreArgs, EventStoreHandle};
use crate::managed_job::JobFactory;
use crate::queue_actor::QueueHandle;
use crate::supervisor::{SupervisorHandle, start_supervisor};

/// Everything one runtime process hosts.
pub struct Runtime {
    config: RuntimeConfig,
    supervisor: SupervisorHandle,
    event_store: EventStoreHandle,
    controllers: Vec<JobController>,
    handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Start the supervisor and the authoritative event store.
    pub async fn start(config: RuntimeConfig) -> RuntimeResult<Self> {
        let (supervisor, supervisor_handle) = start_supervisor(&config).await?;
        let (store, store_handle) = Actor::spawn_linked(
            None,
            EventStoreActor,
            EventStoreArgs::from(&config),
            supervisor.actor().get_cell(),
        )
        .await
        .map_err(|e| RuntimeError::Remote(format!("Failed to spawn event store: {}", e)))?;

        tracing::info!("Runtime started");
        Ok(Self {
            event_store: EventStoreHandle::new(store, config.call_timeout),
            supervisor,
            controllers: Vec::new(),
            handles: vec![supervisor_handle, store_handle],
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn event_store(&self) -> &EventStoreHandle {
        &self.event_store
    }

    /// Host a queue carrying items of type `T`.
    pub async fn create_queue<T>(&self, name: impl Into<String>) -> RuntimeResult<QueueHandle> {
        self.supervisor.create_queue_of::<T>(name).await
    }

    /// Spawn a controller for `definition` and bind it to the hosted queues.
    ///
    /// The job is not started; call `JobController::start`.
    pub async fn deploy<F: JobFactory>(
        &mut self,
        definition: JobDefinition,
        factory: F,
    ) -> RuntimeResult<JobController> {
        let (controller, handle) = spawn_controller(
            definition,
            factory,
            &self.config,
            Some(self.supervisor.actor().get_cell()),
        )
        .await?;
        self.handles.push(handle);

        let queue_map = self.supervisor.queue_map().await?;
        if let Err(e) = controller.evaluate_queues(&queue_map).await {
            let _ = controller.stop();
            return Err(e);
        }

        tracing::info!("Deployed job: {}", controller.name());
        self.controllers.push(controller.clone());
        Ok(controller)
    }

    pub fn controllers(&self) -> &[JobController] {
        &self.controllers
    }

    pub fn controller(&self, name: &str) -> Option<&JobController> {
        self.controllers.iter().find(|c| c.name() == name)
    }

    /// Wait until every deployed job has no live replica.
    pub async fn wait_all(&self) -> RuntimeResult<Vec<JobState>> {
        join_all(self.controllers.iter().map(|c| c.wait_finished()))
            .await
            .into_iter()
            .collect()
    }

    /// Finish every job, give replicas `grace` to wind down, then stop all actors.
    pub async fn shutdown(self, grace: Duration) -> RuntimeResult<()> {
        tracing::info!("Shutting down runtime");
        for controller in &self.controllers {
            if let Err(e) = controller.finish().await {
                tracing::warn!("Could not finish {}: {}", controller.name(), e);
            }
        }
        if tokio::time::timeout(grace, self.wait_all()).await.is_err() {
            tracing::warn!("Jobs still running after {:?}; stopping them", grace);
        }

        for controller in &self.controllers {
            let _ = controller.stop();
        }
        let _ = self.event_store.shutdown();
        self.supervisor.shutdown()?;
        for handle in self.handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
