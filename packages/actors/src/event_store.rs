//! Handler registry, event history and lock table.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;

use chrono::Utc;
use futures_util::FutureExt;
use runtime_core::{
    Event, EventHistory, EventReference, HandlerDefinition, HandlerId, HistoryView, LockTable,
    RuntimeError, RuntimeResult, SessionId, SessionMap,
};
use serde::{Deserialize, Serialize};

use crate::combined_events::CombinedEvents;
use crate::handler::Handler;
use crate::managed_job::panic_message;

/// Flag set whenever an event reaches the global history.
pub const EVENT_RECORDED: &str = "event_recorded";
/// Flag set whenever a lock is released or expires.
pub const LOCK_RELEASED: &str = "lock_released";

/// Outcome of routing one event through its candidate handlers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub event_reference: String,
    /// Handlers whose callback completed, with the evaluated result.
    pub fired: BTreeMap<HandlerId, bool>,
    /// Handlers skipped because the occurrence was locked by another session.
    pub skipped: Vec<HandlerId>,
    /// Handlers whose callback returned an error.
    pub failed: Vec<HandlerId>,
}

impl ProcessReport {
    pub fn new(event_reference: impl Into<String>) -> Self {
        Self {
            event_reference: event_reference.into(),
            ..Default::default()
        }
    }

    /// Whether the handler's callback ran and its operation evaluated to true.
    pub fn fired_true(&self, handler_id: &str) -> bool {
        self.fired.get(handler_id).copied().unwrap_or(false)
    }
}

/// The authoritative event store.
///
/// Lives inside a single `EventStoreActor`, so every mutation is serialized
/// by the actor mailbox.
#[derive(Debug)]
pub struct EventStore {
    locks: LockTable,
    handlers: Vec<Handler>,
    type_index: HashMap<String, Vec<usize>>,
    history: EventHistory,
    sessions: HashMap<SessionId, EventHistory>,
    lock_ttl_ms: Option<u64>,
    changes: CombinedEvents,
}

impl EventStore {
    pub fn new(lock_ttl_ms: Option<u64>) -> Self {
        Self {
            locks: LockTable::new(),
            handlers: Vec::new(),
            type_index: HashMap::new(),
            history: EventHistory::new(),
            sessions: HashMap::new(),
            lock_ttl_ms,
            changes: CombinedEvents::new([EVENT_RECORDED, LOCK_RELEASED]),
        }
    }

    /// Change notification flags.
    pub fn changes(&self) -> CombinedEvents {
        self.changes.clone()
    }

    /// Register a handler. Returns false when its ID is already known.
    pub fn register_handler(&mut self, handler: Handler) -> bool {
        if self.handlers.iter().any(|h| h.id() == handler.id()) {
            return false;
        }
        let index = self.handlers.len();
        for event_type in &handler.definition.subscribed_event_types {
            let slots = self.type_index.entry(event_type.clone()).or_default();
            if !slots.contains(&index) {
                slots.push(index);
            }
        }
        tracing::info!("Registered handler: {}", handler.id());
        self.handlers.push(handler);
        true
    }

    /// Register handlers and return how many were new.
    pub fn register_handlers(&mut self, handlers: impl IntoIterator<Item = Handler>) -> usize {
        handlers
            .into_iter()
            .map(|handler| self.register_handler(handler))
            .filter(|added| *added)
            .count()
    }

    fn candidates(&self, event_type: &str) -> impl Iterator<Item = &Handler> {
        self.type_index
            .get(event_type)
            .into_iter()
            .flatten()
            .map(|index| &self.handlers[*index])
    }

    /// Every handler subscribed to `event_type`, in registration order.
    pub fn get_handler_by_event_type(&self, event_type: &str) -> Vec<HandlerDefinition> {
        self.candidates(event_type)
            .map(|handler| handler.definition.clone())
            .collect()
    }

    /// Lock an event occurrence and return the new session.
    pub fn set_lock_for_event(
        &mut self,
        reference: &EventReference,
        ttl_ms: Option<u64>,
    ) -> RuntimeResult<SessionId> {
        let session = self.locks.acquire(reference, ttl_ms, Utc::now())?;
        self.changes.clear(LOCK_RELEASED);
        tracing::debug!("Locked {} for session {}", reference, session);
        Ok(session)
    }

    pub fn get_session_lock_for_event(&self, reference: &EventReference) -> Option<SessionId> {
        self.locks.session_for(reference, Utc::now())
    }

    /// Release the lock held by `session`; anything else is a no-op.
    pub fn unlock(&mut self, session: SessionId) -> bool {
        self.sessions.remove(&session);
        match self.locks.release(session, Utc::now()) {
            Some(reference) => {
                tracing::debug!("Unlocked {} for session {}", reference, session);
                self.changes.set(LOCK_RELEASED);
                true
            }
            None => false,
        }
    }

    pub fn is_event_locked(&self, reference: &EventReference, owned: &SessionMap) -> bool {
        self.locks.is_locked(reference, owned, Utc::now())
    }

    /// Append an event to the global history or, with a session, to that session's overlay.
    pub fn record(&mut self, event: Event, session: Option<SessionId>) -> RuntimeResult<()> {
        match session {
            Some(session) => {
                if self.locks.reference_for(session, Utc::now()).is_none() {
                    return Err(RuntimeError::NotFound(format!(
                        "session {} holds no live lock",
                        session
                    )));
                }
                self.sessions.entry(session).or_default().record(event);
            }
            None => {
                self.history.record(event);
                self.changes.set(EVENT_RECORDED);
            }
        }
        Ok(())
    }

    fn first_true(
        &self,
        event: &Event,
        overlay: Option<&EventHistory>,
    ) -> Option<HandlerDefinition> {
        let view = HistoryView::new(&self.history)
            .with_overlay(overlay)
            .with_newest(event);
        self.candidates(&event.event_type)
            .find(|handler| handler.definition.operation.evaluate(&view))
            .map(|handler| handler.definition.clone())
    }

    /// First subscribed handler whose operation holds with `event` as the newest fact.
    pub fn get_handler_by_last_event(
        &self,
        event: &Event,
        session: Option<SessionId>,
    ) -> Option<HandlerDefinition> {
        let overlay = session.and_then(|session| self.sessions.get(&session));
        self.first_true(event, overlay)
    }

    /// Evaluate a sequence of events, each seeing the ones before it.
    ///
    /// Earlier events are folded into a scratch copy of the session overlay,
    /// so neither the global history nor the session is modified.
    pub fn get_handler_by_last_events(
        &self,
        events: &[Event],
        session: Option<SessionId>,
    ) -> Vec<Option<HandlerDefinition>> {
        let mut scratch = session
            .and_then(|session| self.sessions.get(&session))
            .cloned()
            .unwrap_or_default();
        events
            .iter()
            .map(|event| {
                let found = self.first_true(event, Some(&scratch));
                scratch.record(event.clone());
                found
            })
            .collect()
    }

    /// Route `event` through every subscribed handler.
    ///
    /// Per candidate: lock the occurrence, evaluate the operation against the
    /// session view, run the callback, unlock. A lock held elsewhere skips the
    /// candidate. Callback errors and panics are logged and never keep the lock.
    pub async fn publish(&mut self, event: Event) -> RuntimeResult<ProcessReport> {
        let reference = event.reference()?;
        let mut report = ProcessReport::new(reference.reference());
        let candidates: Vec<Handler> = self.candidates(&event.event_type).cloned().collect();

        for handler in candidates {
            let session = match self.set_lock_for_event(&reference, self.lock_ttl_ms) {
                Ok(session) => session,
                Err(e) if e.is_contention() => {
                    tracing::debug!("Skipping {} for {}: {}", handler.id(), reference, e);
                    report.skipped.push(handler.id().clone());
                    continue;
                }
                Err(e) => return Err(e),
            };

            self.sessions
                .entry(session)
                .or_default()
                .record(event.clone());
            let view = HistoryView::new(&self.history).with_overlay(self.sessions.get(&session));
            let result = handler.definition.operation.evaluate(&view);

            let outcome = AssertUnwindSafe(async { handler.execute(result, session).await })
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {
                    report.fired.insert(handler.id().clone(), result);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Handler {} failed on {}: {}", handler.id(), reference, e);
                    report.failed.push(handler.id().clone());
                }
                Err(panic) => {
                    tracing::warn!(
                        "Handler {} panicked on {}: {}",
                        handler.id(),
                        reference,
                        panic_message(panic.as_ref())
                    );
                    report.failed.push(handler.id().clone());
                }
            }
            self.unlock(session);
        }

        self.history.record(event);
        self.changes.set(EVENT_RECORDED);
        Ok(report)
    }

    /// Drop expired locks and their session overlays.
    pub fn purge_expired(&mut self) -> usize {
        let now = Utc::now();
        let purged = self.locks.purge_expired(now);
        self.sessions
            .retain(|session, _| self.locks.reference_for(*session, now).is_some());
        if purged > 0 {
            tracing::debug!("Purged {} expired locks", purged);
            self.changes.set(LOCK_RELEASED);
        }
        purged
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::CallbackFuture;
    use runtime_core::{Operation, Predicate};
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reference(event_type: &str) -> EventReference {
        EventReference::generic(event_type, Vec::new())
    }

    #[test]
    fn registration_is_idempotent() {
        let mut store = EventStore::new(None);
        let definition = HandlerDefinition::new("h", Operation::seen("a"));
        assert!(store.register_handler(Handler::noop(definition.clone())));
        assert!(!store.register_handler(Handler::noop(definition)));
        assert_eq!(store.get_handler_by_event_type("a").len(), 1);
        assert!(store.get_handler_by_event_type("b").is_empty());
    }

    #[test]
    fn unlock_only_matching_session() {
        let mut store = EventStore::new(None);
        let session = store.set_lock_for_event(&reference("a"), None).unwrap();
        assert!(!store.unlock(SessionId::new()));
        assert_eq!(store.get_session_lock_for_event(&reference("a")), Some(session));
        assert!(store.unlock(session));
        assert!(!store.unlock(session));
        assert!(store.changes().is_set(LOCK_RELEASED));
    }

    #[test]
    fn record_needs_a_live_session() {
        let mut store = EventStore::new(None);
        assert!(matches!(
            store.record(Event::new("a"), Some(SessionId::new())),
            Err(RuntimeError::NotFound(_))
        ));
        let session = store.set_lock_for_event(&reference("a"), None).unwrap();
        store.record(Event::new("a"), Some(session)).unwrap();
    }

    #[test]
    fn last_event_lookup_sees_session_overlay() {
        let mut store = EventStore::new(None);
        let both = Operation::and(vec![Operation::seen("door"), Operation::seen("motion")]);
        store.register_handler(Handler::noop(HandlerDefinition::new("alarm", both)));

        let motion = Event::new("motion");
        assert!(store.get_handler_by_last_event(&motion, None).is_none());

        let session = store.set_lock_for_event(&reference("door"), None).unwrap();
        store.record(Event::new("door"), Some(session)).unwrap();
        let found = store.get_handler_by_last_event(&motion, Some(session));
        assert_eq!(found.map(|h| h.handler_id).as_deref(), Some("alarm"));
        // Other sessions do not see the overlay.
        assert!(store.get_handler_by_last_event(&motion, None).is_none());
    }

    #[test]
    fn batched_lookup_folds_earlier_events() {
        let mut store = EventStore::new(None);
        let both = Operation::and(vec![Operation::seen("door"), Operation::seen("motion")]);
        store.register_handler(Handler::noop(HandlerDefinition::new("alarm", both)));

        let found = store.get_handler_by_last_events(
            &[Event::new("door"), Event::new("motion")],
            None,
        );
        assert!(found[0].is_none());
        assert_eq!(found[1].as_ref().map(|h| h.handler_id.as_str()), Some("alarm"));
        assert!(store.get_handler_by_last_event(&Event::new("motion"), None).is_none());
    }

    #[tokio::test]
    async fn publish_fires_and_releases_lock() {
        let mut store = EventStore::new(Some(1_000));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let hot = Operation::matches(
            "temp",
            Predicate::PropertyEquals {
                key: "level".into(),
                value: json!("high"),
            },
        );
        store.register_handler(Handler::from_fn(
            HandlerDefinition::new("cooler", hot),
            move |_, _, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            },
        ));

        let report = store
            .publish(Event::new("temp").with_property("level", "high"))
            .await
            .unwrap();
        assert!(report.fired_true("cooler"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.lock_count(), 0);

        let report = store
            .publish(Event::new("temp").with_property("level", "low"))
            .await
            .unwrap();
        assert_eq!(report.fired.get("cooler"), Some(&false));
    }

    #[tokio::test]
    async fn publish_skips_locked_occurrence() {
        let mut store = EventStore::new(None);
        store.register_handler(Handler::noop(HandlerDefinition::new(
            "h",
            Operation::seen("job"),
        )));
        let event = Event::new("job").with_identificator("id", 7);
        let held = store.set_lock_for_event(&event.reference().unwrap(), None).unwrap();

        let report = store.publish(event.clone()).await.unwrap();
        assert_eq!(report.skipped, vec!["h".to_string()]);
        assert!(report.fired.is_empty());

        store.unlock(held);
        let report = store.publish(event).await.unwrap();
        assert!(report.fired_true("h"));
    }

    #[tokio::test]
    async fn failing_callback_still_unlocks() {
        let mut store = EventStore::new(None);
        store.register_handler(Handler::from_fn(
            HandlerDefinition::new("broken", Operation::seen("x")),
            |_, _, _| Box::pin(async { Err("boom".to_string()) }),
        ));

        let report = store.publish(Event::new("x")).await.unwrap();
        assert_eq!(report.failed, vec!["broken".to_string()]);
        assert_eq!(store.lock_count(), 0);
        assert!(store.changes().is_set(EVENT_RECORDED));
    }

    #[tokio::test]
    async fn panicking_callback_still_unlocks() {
        let mut store = EventStore::new(None);
        store.register_handler(Handler::from_fn(
            HandlerDefinition::new("explodes", Operation::seen("x")),
            |_, _, _| -> CallbackFuture { panic!("callback blew up") },
        ));
        store.register_handler(Handler::noop(HandlerDefinition::new(
            "steady",
            Operation::seen("x"),
        )));

        let report = store.publish(Event::new("x")).await.unwrap();
        assert_eq!(report.failed, vec!["explodes".to_string()]);
        assert!(report.fired_true("steady"));
        assert_eq!(store.lock_count(), 0);
    }

    #[test]
    fn purge_drops_expired_locks() {
        let mut store = EventStore::new(None);
        store.set_lock_for_event(&reference("a"), Some(0)).unwrap();
        store.set_lock_for_event(&reference("b"), None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.lock_count(), 1);
    }
}
