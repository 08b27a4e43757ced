//! Lifecycle of a single unit of recurring work.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use runtime_core::{JobDefinition, JobError, JobState, RuntimeResult};
use serde_json::Value;
use tokio::sync::watch;

use crate::combined_events::CombinedEvents;
use crate::queue_map::QueueBindings;

const RUNNING: &str = "running";
const FINISHED: &str = "finished";

/// A unit of work driven by a `JobRunner`.
///
/// Implementations may use `async fn` for every method.
pub trait ManagedJob: Send + 'static {
    /// One iteration of the job's work.
    fn run_defined_job(&mut self) -> impl Future<Output = Result<(), JobError>> + Send;

    /// Whether the loop should keep iterating.
    fn can_run(&mut self) -> impl Future<Output = bool> + Send;

    /// Called once when the job is asked to finish.
    fn graceful_shutdown(&mut self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called with the error that ended the job, before it is reported as failed.
    fn on_job_execution_exception(
        &mut self,
        _error: &JobError,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }
}

/// Pause, resume and finish gate shared between a runner and its controller.
///
/// The `running` flag is set while the job may run; `finished` is set once
/// when shutdown is requested. Both are levels, so a `resume` issued right
/// after `pause` is never missed.
#[derive(Debug, Clone)]
pub struct JobControl {
    events: CombinedEvents,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        let events = CombinedEvents::new([RUNNING, FINISHED]);
        events.set(RUNNING);
        Self { events }
    }

    pub fn pause(&self) {
        self.events.clear(RUNNING);
    }

    pub fn resume(&self) {
        self.events.set(RUNNING);
    }

    /// Request a graceful stop after the current iteration.
    pub fn finish(&self) {
        self.events.set(FINISHED);
    }

    pub fn is_running(&self) -> bool {
        self.events.is_set(RUNNING)
    }

    pub fn is_finished(&self) -> bool {
        self.events.is_set(FINISHED)
    }

    /// Suspend until resumed or finished.
    pub async fn wait_resumed_or_finished(&self) {
        self.events.wait_any_set(&[RUNNING, FINISHED], None).await;
    }

    /// Suspend until finished. Returns false when the timeout elapses first.
    pub async fn wait_finished(&self, timeout: Option<Duration>) -> bool {
        self.events.wait(FINISHED, timeout).await
    }
}

/// Drives a `ManagedJob` through its states.
pub struct JobRunner<J> {
    name: String,
    single_run: bool,
    wait_time: Duration,
    job: J,
    control: JobControl,
    state: watch::Sender<JobState>,
}

impl<J: ManagedJob> JobRunner<J> {
    /// Create a runner and a receiver observing its state.
    pub fn new(
        name: impl Into<String>,
        single_run: bool,
        wait_time: Duration,
        job: J,
        control: JobControl,
    ) -> (Self, watch::Receiver<JobState>) {
        let (state, rx) = watch::channel(JobState::Idle);
        let runner = Self {
            name: name.into(),
            single_run,
            wait_time,
            job,
            control,
            state,
        };
        (runner, rx)
    }

    /// Runner configured from a job definition.
    pub fn from_definition(
        definition: &JobDefinition,
        name: impl Into<String>,
        job: J,
        control: JobControl,
    ) -> (Self, watch::Receiver<JobState>) {
        Self::new(
            name,
            definition.single_run,
            definition.wait_time,
            job,
            control,
        )
    }

    fn set_state(&self, state: JobState) {
        tracing::debug!("Job {} is {}", self.name, state);
        self.state.send_replace(state);
    }

    /// Run the job to completion.
    ///
    /// An error out of `run_defined_job` is handed to
    /// `on_job_execution_exception`, recorded as `Failed` and returned.
    ///
    /// A panic inside the job is caught and treated as a failed iteration.
    pub async fn run(mut self) -> Result<(), JobError> {
        let outcome = match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(JobError::new(format!(
                "job panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        match outcome {
            Ok(()) => {
                self.set_state(JobState::Terminated);
                Ok(())
            }
            Err(error) => {
                tracing::warn!("Job {} failed: {}", self.name, error);
                self.job.on_job_execution_exception(&error).await;
                self.set_state(JobState::Failed {
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), JobError> {
        self.set_state(JobState::Running);
        if self.single_run {
            return self.job.run_defined_job().await;
        }

        loop {
            if self.control.is_finished() {
                self.shutdown().await;
                break;
            }

            if !self.control.is_running() {
                self.set_state(JobState::Paused);
                self.control.wait_resumed_or_finished().await;
                if self.control.is_finished() {
                    continue;
                }
                self.set_state(JobState::Running);
            }

            if !self.job.can_run().await {
                break;
            }
            // Paused or finished while `can_run` was pending.
            if !self.control.is_running() || self.control.is_finished() {
                continue;
            }

            self.job.run_defined_job().await?;

            if self.control.wait_finished(Some(self.wait_time)).await {
                self.shutdown().await;
                break;
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        self.set_state(JobState::Finishing);
        self.job.graceful_shutdown().await;
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Everything a factory needs to build one replica.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub definition: JobDefinition,
    pub replica_index: usize,
    /// Consumer name this replica reads the input queue with.
    pub consumer_name: String,
    pub instance_parameters: Value,
    pub queues: QueueBindings,
}

impl JobContext {
    pub fn parameters(&self) -> &Value {
        &self.definition.parameters
    }
}

/// Builds the job instance of each replica.
pub trait JobFactory: Send + Sync + 'static {
    type Job: ManagedJob;

    fn create(&self, context: JobContext) -> RuntimeResult<Self::Job>;
}

impl<F, J> JobFactory for F
where
    F: Fn(JobContext) -> RuntimeResult<J> + Send + Sync + 'static,
    J: ManagedJob,
{
    type Job = J;

    fn create(&self, context: JobContext) -> RuntimeResult<J> {
        self(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        runs: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        limit: usize,
        fail_at: Option<usize>,
    }

    impl Counting {
        fn new(limit: usize) -> Self {
            Self {
                runs: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                limit,
                fail_at: None,
            }
        }
    }

    impl ManagedJob for Counting {
        async fn run_defined_job(&mut self) -> Result<(), JobError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_at == Some(run) {
                return Err(JobError::new("boom"));
            }
            Ok(())
        }

        async fn can_run(&mut self) -> bool {
            self.runs.load(Ordering::SeqCst) < self.limit
        }

        async fn graceful_shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn single_run_runs_once() {
        let job = Counting::new(usize::MAX);
        let runs = job.runs.clone();
        let (runner, state) =
            JobRunner::new("once", true, Duration::from_millis(1), job, JobControl::new());

        runner.run().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(*state.borrow(), JobState::Terminated);
    }

    #[tokio::test]
    async fn stops_when_can_run_is_false() {
        let job = Counting::new(3);
        let runs = job.runs.clone();
        let shutdowns = job.shutdowns.clone();
        let (runner, _) =
            JobRunner::new("three", false, Duration::from_millis(1), job, JobControl::new());

        runner.run().await.unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn finish_shuts_down_once() {
        let job = Counting::new(usize::MAX);
        let shutdowns = job.shutdowns.clone();
        let control = JobControl::new();
        let (runner, mut state) =
            JobRunner::new("loop", false, Duration::from_millis(5), job, control.clone());
        let task = tokio::spawn(runner.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        control.finish();
        task.await.unwrap().unwrap();

        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        state.wait_for(|s| s.is_terminal()).await.unwrap();
        assert_eq!(*state.borrow(), JobState::Terminated);
    }

    #[tokio::test]
    async fn failure_reaches_failed_state() {
        let mut job = Counting::new(usize::MAX);
        job.fail_at = Some(2);
        let (runner, state) =
            JobRunner::new("fails", false, Duration::from_millis(1), job, JobControl::new());

        let err = runner.run().await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(matches!(&*state.borrow(), JobState::Failed { error } if error == "boom"));
    }

    #[tokio::test]
    async fn finish_while_paused_stops() {
        let job = Counting::new(usize::MAX);
        let shutdowns = job.shutdowns.clone();
        let control = JobControl::new();
        control.pause();
        let (runner, mut state) =
            JobRunner::new("paused", false, Duration::from_millis(1), job, control.clone());
        let task = tokio::spawn(runner.run());

        state.wait_for(|s| *s == JobState::Paused).await.unwrap();
        control.finish();
        task.await.unwrap().unwrap();
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    struct Panicking;

    impl ManagedJob for Panicking {
        async fn run_defined_job(&mut self) -> Result<(), JobError> {
            panic!("kaboom");
        }

        async fn can_run(&mut self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn panic_reaches_failed_state() {
        let (runner, state) =
            JobRunner::new("panics", false, Duration::from_millis(1), Panicking, JobControl::new());

        let err = runner.run().await.unwrap_err();
        assert_eq!(err.to_string(), "job panicked: kaboom");
        assert!(matches!(&*state.borrow(), JobState::Failed { .. }));
    }

    /// Pauses its own control from inside `can_run`.
    struct PausedDuringCheck {
        control: JobControl,
        runs: Arc<AtomicUsize>,
    }

    impl ManagedJob for PausedDuringCheck {
        async fn run_defined_job(&mut self) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn can_run(&mut self) -> bool {
            self.control.pause();
            true
        }
    }

    #[tokio::test]
    async fn pause_during_can_run_skips_iteration() {
        let control = JobControl::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let job = PausedDuringCheck {
            control: control.clone(),
            runs: runs.clone(),
        };
        let (runner, mut state) =
            JobRunner::new("gated", false, Duration::from_millis(1), job, control.clone());
        let task = tokio::spawn(runner.run());

        state.wait_for(|s| *s == JobState::Paused).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        control.finish();
        task.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
