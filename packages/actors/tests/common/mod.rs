#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use actors::{JobContext, JobError, ManagedJob, RuntimeConfig, RuntimeResult};

/// Configuration with short timeouts for tests.
pub fn test_config() -> RuntimeConfig {
    RuntimeConfig::default()
        .with_lock_ttl_ms(Some(1_000))
        .with_call_timeout(Some(Duration::from_secs(2)))
        .with_housekeeping_interval(Duration::from_millis(50))
}

/// Poll `check` until it returns true or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Counters shared between a test and the jobs it deploys.
#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub runs: Arc<AtomicUsize>,
    pub shutdowns: Arc<AtomicUsize>,
}

impl Counters {
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

/// Recurring job that only counts its iterations.
pub struct CountingJob {
    counters: Counters,
    fail_at: Option<usize>,
}

impl ManagedJob for CountingJob {
    async fn run_defined_job(&mut self) -> Result<(), JobError> {
        let run = self.counters.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_at == Some(run) {
            return Err(JobError::new("boom"));
        }
        Ok(())
    }

    async fn can_run(&mut self) -> bool {
        true
    }

    async fn graceful_shutdown(&mut self) {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory for `CountingJob`s sharing `counters`.
pub fn counting_factory(
    counters: Counters,
    fail_at: Option<usize>,
) -> impl Fn(JobContext) -> RuntimeResult<CountingJob> + Send + Sync + 'static {
    move |_context| {
        Ok(CountingJob {
            counters: counters.clone(),
            fail_at,
        })
    }
}
