//! Demo jobs wired into a small pipeline.

use actors::{EventStoreHandle, JobContext, ManagedJob, QueueHandle};
use runtime_core::{Event, JobError, RuntimeError, RuntimeResult};

/// Puts `1..=count` on its output, then finishes the queue.
pub struct Producer {
    output: QueueHandle,
    count: u64,
}

impl Producer {
    pub fn create(context: JobContext) -> RuntimeResult<Self> {
        let count = context
            .parameters()
            .get("count")
            .and_then(|v| v.as_u64())
            .unwrap_or(10);
        Ok(Self {
            output: context.queues.first_output()?.clone(),
            count,
        })
    }
}

impl ManagedJob for Producer {
    async fn run_defined_job(&mut self) -> Result<(), JobError> {
        let numbers: Vec<u64> = (1..=self.count).collect();
        let sent = self.output.put_iter(numbers).await?;
        tracing::info!("Produced {} numbers", sent);
        self.output.finish(None).await?;
        Ok(())
    }

    async fn can_run(&mut self) -> bool {
        true
    }
}

/// Squares numbers and reports each result to the event store.
pub struct Squarer {
    input: QueueHandle,
    output: QueueHandle,
    events: EventStoreHandle,
    consumer: String,
    threshold: u64,
    done: bool,
}

impl Squarer {
    pub fn factory(
        events: EventStoreHandle,
    ) -> impl Fn(JobContext) -> RuntimeResult<Squarer> + Send + Sync + 'static {
        move |context| {
            let threshold = context
                .parameters()
                .get("threshold")
                .and_then(|v| v.as_u64())
                .unwrap_or(50);
            Ok(Squarer {
                input: context.queues.input()?.clone(),
                output: context.queues.first_output()?.clone(),
                events: events.clone(),
                consumer: context.consumer_name,
                threshold,
                done: false,
            })
        }
    }
}

impl ManagedJob for Squarer {
    async fn run_defined_job(&mut self) -> Result<(), JobError> {
        let n = match self.input.get::<u64>(Some(&self.consumer), true).await {
            Ok(n) => n,
            Err(RuntimeError::QueueFinished { .. }) => {
                self.done = true;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let square = n * n;
        self.output.put(&square, Some(&self.consumer)).await?;
        let event = Event::new("square")
            .with_identificator("n", n)
            .with_property("value", square)
            .with_property("big", square > self.threshold);
        self.events.publish(event).await?;
        Ok(())
    }

    async fn can_run(&mut self) -> bool {
        !self.done
    }
}

/// Sums everything on its input until the queue is finished.
pub struct Summer {
    input: QueueHandle,
    consumer: String,
    total: u64,
    done: bool,
}

impl Summer {
    pub fn create(context: JobContext) -> RuntimeResult<Self> {
        Ok(Self {
            input: context.queues.input()?.clone(),
            consumer: context.consumer_name,
            total: 0,
            done: false,
        })
    }
}

impl ManagedJob for Summer {
    async fn run_defined_job(&mut self) -> Result<(), JobError> {
        match self.input.get_iter::<u64>(16, Some(&self.consumer)).await {
            Ok(batch) => {
                self.total += batch.iter().sum::<u64>();
                Ok(())
            }
            Err(RuntimeError::QueueFinished { .. }) => {
                tracing::info!("Sum of squares: {}", self.total);
                self.done = true;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn can_run(&mut self) -> bool {
        !self.done
    }

    async fn graceful_shutdown(&mut self) {
        tracing::info!("Summer stopped early at {}", self.total);
    }

    async fn on_job_execution_exception(&mut self, error: &JobError) {
        tracing::error!("Summer failed at {}: {}", self.total, error);
    }
}
