//! Demo host: a producer, a replicated squarer and a summer joined by queues,
//! with an event handler watching for large squares.

mod jobs;

use std::error::Error;
use std::time::Duration;

use actors::{Handler, Runtime, RuntimeConfig};
use runtime_core::{
    HandlerDefinition, JobDefinition, Operation, Predicate, QueueReference, ReplicationMode,
};
use serde_json::json;

use jobs::{Producer, Squarer, Summer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = RuntimeConfig::from_env()?;
    tracing_subscriber::fmt()
        .with_max_level(config.log_level.parse::<tracing::Level>()?)
        .init();

    tracing::info!("Initializing runtime node...");
    let mut runtime = Runtime::start(config).await?;

    let numbers = QueueReference::of::<u64>("numbers");
    let squares = QueueReference::of::<u64>("squares");
    runtime.supervisor().create_queue(numbers.clone()).await?;
    let squares_queue = runtime.supervisor().create_queue(squares.clone()).await?;

    let big = Operation::matches(
        "square",
        Predicate::PropertyEquals {
            key: "big".into(),
            value: json!(true),
        },
    );
    runtime
        .event_store()
        .register_handler(Handler::from_fn(
            HandlerDefinition::new("big-square", big),
            |fired, handler, session| {
                if fired {
                    tracing::info!("{} fired in session {}", handler.handler_id, session);
                }
                Box::pin(async { Ok(()) })
            },
        ))
        .await?;

    let summer = runtime
        .deploy(
            JobDefinition::new("summer")
                .with_group_path("demo")
                .with_input(squares.clone())
                .with_wait_time(Duration::from_millis(10)),
            Summer::create,
        )
        .await?;
    let squarer = runtime
        .deploy(
            JobDefinition::new("squarer")
                .with_group_path("demo")
                .with_input(numbers.clone())
                .with_output(squares)
                .with_wait_time(Duration::from_millis(10))
                .with_replicas(2)
                .with_replication_mode(ReplicationMode::SharedCursor)
                .with_parameters(json!({ "threshold": 50 })),
            Squarer::factory(runtime.event_store().clone()),
        )
        .await?;
    let producer = runtime
        .deploy(
            JobDefinition::new("producer")
                .with_group_path("demo")
                .with_output(numbers)
                .with_single_run(true)
                .with_parameters(json!({ "count": 20 })),
            Producer::create,
        )
        .await?;

    // Consumers first so their cursors exist before anything is produced.
    summer.start(None).await?;
    squarer.start(None).await?;
    producer.start(None).await?;

    tracing::info!("producer: {}", producer.wait_finished().await?);
    tracing::info!("squarer: {}", squarer.wait_finished().await?);
    squares_queue.finish(None).await?;
    tracing::info!("summer: {}", summer.wait_finished().await?);

    runtime.shutdown(Duration::from_secs(5)).await?;
    tracing::info!("Runtime node stopped");
    Ok(())
}
