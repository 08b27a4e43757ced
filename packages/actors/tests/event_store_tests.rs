#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use actors::{
    CallbackFuture, CallbackResult, EVENT_RECORDED, Event, Handler, HandlerDefinition, Operation,
    MAX_LOCK_TTL_MS, Predicate, RuntimeError, SessionMap, start_event_store,
};
use serde_json::json;

#[tokio::test]
async fn test_lock_mutual_exclusion() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    let event = Event::new("payment").with_identificator("id", 42);

    let (a, b) = tokio::join!(
        store.set_lock_for_event(&event, None),
        store.set_lock_for_event(&event, None)
    );
    let (winner, loser) = match (a, b) {
        (Ok(session), Err(err)) | (Err(err), Ok(session)) => (session, err),
        other => panic!("expected exactly one lock, got {:?}", other),
    };
    assert!(matches!(loser, RuntimeError::LockHeld { .. }));
    assert!(loser.is_contention());
    assert_eq!(store.get_session_lock_for_event(&event).await?, Some(winner));

    // Still held until the winner unlocks.
    assert!(store.set_lock_for_event(&event, None).await.is_err());
    assert!(store.unlock(winner).await?);
    assert!(store.set_lock_for_event(&event, None).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_lock_ttl_expiry() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    let event = Event::new("tick");

    let first = store.set_lock_for_event(&event, Some(50)).await?;
    assert!(store.set_lock_for_event(&event, Some(50)).await.is_err());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let second = store.set_lock_for_event(&event, Some(50)).await?;
    assert_ne!(first, second);
    // Unlocking the expired session does not release the new lock.
    assert!(!store.unlock(first).await?);
    assert_eq!(store.get_session_lock_for_event(&event).await?, Some(second));
    Ok(())
}

#[tokio::test]
async fn test_oversized_ttl_is_rejected() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    let event = Event::new("tick");

    assert!(matches!(
        store.set_lock_for_event(&event, Some(u64::MAX)).await,
        Err(RuntimeError::Configuration(_))
    ));
    let held = store.set_lock_for_event(&event, Some(MAX_LOCK_TTL_MS)).await?;
    assert!(store.set_lock_for_event(&event, Some(u64::MAX)).await.is_err());
    assert!(matches!(
        store.set_lock_for_event(&event, None).await,
        Err(RuntimeError::LockHeld { .. })
    ));
    assert!(store.unlock(held).await?);
    Ok(())
}

#[tokio::test]
async fn test_locked_by_me_is_not_locked() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    let event = Event::new("order").with_identificator("id", 1);
    let session = store.set_lock_for_event(&event, None).await?;

    assert!(store.is_event_locked(&event, &SessionMap::new()).await?);
    let mut owned = SessionMap::new();
    owned.insert(event.reference()?.reference().to_string(), session);
    assert!(!store.is_event_locked(&event, &owned).await?);
    Ok(())
}

#[tokio::test]
async fn test_publish_runs_handlers_once() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let hot = Operation::matches(
        "temperature",
        Predicate::PropertyEquals {
            key: "level".into(),
            value: json!("high"),
        },
    );
    let handler = Handler::from_fn(HandlerDefinition::new("cooler", hot), move |result, _, _| {
        if result {
            seen.fetch_add(1, Ordering::SeqCst);
        }
        Box::pin(async { Ok(()) })
    });
    assert!(store.register_handler(handler.clone()).await?);
    assert!(!store.register_handler(handler).await?);
    assert_eq!(store.get_handler_by_event_type("temperature").await?.len(), 1);

    let report = store
        .publish(Event::new("temperature").with_property("level", "high"))
        .await?;
    assert!(report.fired_true("cooler"));
    assert!(report.skipped.is_empty());

    let report = store
        .publish(Event::new("temperature").with_property("level", "low"))
        .await?;
    assert_eq!(report.fired.get("cooler"), Some(&false));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn test_publish_skips_occurrence_locked_elsewhere() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    store
        .register_handler(Handler::noop(HandlerDefinition::new(
            "ship",
            Operation::seen("order"),
        )))
        .await?;

    let order = Event::new("order").with_identificator("id", 9);
    let other = store.set_lock_for_event(&order, None).await?;

    let report = store.publish(order.clone()).await?;
    assert_eq!(report.skipped, vec!["ship".to_string()]);

    store.unlock(other).await?;
    let report = store.publish(order).await?;
    assert!(report.fired_true("ship"));
    Ok(())
}

#[tokio::test]
async fn test_session_scoped_lookup() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    let alarm = Operation::and(vec![Operation::seen("door"), Operation::seen("motion")]);
    store
        .register_handler(Handler::noop(HandlerDefinition::new("alarm", alarm)))
        .await?;

    let door = Event::new("door");
    let session = store.set_lock_for_event(&door, None).await?;
    store.record(door, Some(session)).await?;

    let motion = Event::new("motion");
    let found = store
        .get_handler_by_last_event(motion.clone(), Some(session))
        .await?;
    assert_eq!(found.map(|h| h.handler_id).as_deref(), Some("alarm"));
    assert!(store.get_handler_by_last_event(motion, None).await?.is_none());

    let batch = store
        .get_handler_by_last_events(vec![Event::new("door"), Event::new("motion")], None)
        .await?;
    assert!(batch[0].is_none());
    assert!(batch[1].is_some());

    store.unlock(session).await?;
    assert!(matches!(
        store.record(Event::new("door"), Some(session)).await,
        Err(RuntimeError::NotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_change_notification() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    let changes = store.changes().await?;
    assert!(!changes.is_set(EVENT_RECORDED));

    let publisher = store.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = publisher.publish(Event::new("anything")).await;
    });

    assert!(changes.wait(EVENT_RECORDED, Some(Duration::from_secs(2))).await);
    Ok(())
}

async fn crash() -> CallbackResult {
    panic!("handler crashed")
}

#[tokio::test]
async fn test_store_survives_panicking_callback() -> Result<(), Box<dyn Error>> {
    let (store, _handle) = start_event_store(&common::test_config()).await?;
    store
        .register_handler(Handler::from_fn(
            HandlerDefinition::new("volatile", Operation::seen("spike")),
            |_, _, _| -> CallbackFuture { Box::pin(crash()) },
        ))
        .await?;

    let spike = Event::new("spike").with_identificator("id", 1);
    let report = store.publish(spike.clone()).await?;
    assert_eq!(report.failed, vec!["volatile".to_string()]);

    // The store keeps serving and the occurrence is not left locked.
    assert!(!store.is_event_locked(&spike, &SessionMap::new()).await?);
    assert!(store.set_lock_for_event(&spike, None).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn test_identificators_required() -> Result<(), Box<dyn Error>> {
    let err = actors::EventReference::by_identificators("order", Vec::new()).unwrap_err();
    assert!(matches!(err, RuntimeError::Configuration(_)));
    Ok(())
}
