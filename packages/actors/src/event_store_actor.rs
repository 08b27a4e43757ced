//! Actor hosting the authoritative event store.

use std::time::Duration;

use ractor::{Actor, ActorProcessingErr, ActorRef};
use runtime_core::{
    Event, HandlerDefinition, RuntimeError, RuntimeResult, SessionId, SessionMap,
};

use crate::combined_events::CombinedEvents;
use crate::config::RuntimeConfig;
use crate::event_store::{EventStore, ProcessReport};
use crate::handler::Handler;
use crate::messages::EventStoreMessage;
use crate::rpc;

/// Arguments for starting the event store actor.
#[derive(Debug, Clone)]
pub struct EventStoreArgs {
    pub lock_ttl_ms: Option<u64>,
    pub housekeeping_interval: Duration,
}

impl From<&RuntimeConfig> for EventStoreArgs {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            lock_ttl_ms: config.lock_ttl_ms,
            housekeeping_interval: config.housekeeping_interval,
        }
    }
}

/// Event store actor. Exactly one instance holds the lock table.
pub struct EventStoreActor;

impl Actor for EventStoreActor {
    type Msg = EventStoreMessage;
    type State = EventStore;
    type Arguments = EventStoreArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting event store");

        // Start periodic tick
        let myself_clone = myself.clone();
        let period = args.housekeeping_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if myself_clone.send_message(EventStoreMessage::Tick).is_err() {
                    break;
                }
            }
        });

        Ok(EventStore::new(args.lock_ttl_ms))
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            "Event store stopped with {} handlers and {} live locks",
            state.handler_count(),
            state.lock_count()
        );
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventStoreMessage::RegisterHandlers { handlers, reply } => {
                let _ = reply.send(state.register_handlers(handlers));
            }

            EventStoreMessage::Publish { event, reply } => {
                let _ = reply.send(state.publish(event).await);
            }

            EventStoreMessage::Record {
                event,
                session,
                reply,
            } => {
                let _ = reply.send(state.record(event, session));
            }

            EventStoreMessage::SetLock {
                reference,
                ttl_ms,
                reply,
            } => {
                let _ = reply.send(state.set_lock_for_event(&reference, ttl_ms));
            }

            EventStoreMessage::GetSessionLock { reference, reply } => {
                let _ = reply.send(state.get_session_lock_for_event(&reference));
            }

            EventStoreMessage::Unlock { session, reply } => {
                let _ = reply.send(state.unlock(session));
            }

            EventStoreMessage::IsLocked {
                reference,
                owned,
                reply,
            } => {
                let _ = reply.send(state.is_event_locked(&reference, &owned));
            }

            EventStoreMessage::HandlersByEventType { event_type, reply } => {
                let _ = reply.send(state.get_handler_by_event_type(&event_type));
            }

            EventStoreMessage::HandlerByLastEvent {
                event,
                session,
                reply,
            } => {
                let _ = reply.send(state.get_handler_by_last_event(&event, session));
            }

            EventStoreMessage::HandlersByLastEvents {
                events,
                session,
                reply,
            } => {
                let _ = reply.send(state.get_handler_by_last_events(&events, session));
            }

            EventStoreMessage::Subscribe { reply } => {
                let _ = reply.send(state.changes());
            }

            EventStoreMessage::Tick => {
                state.purge_expired();
            }

            EventStoreMessage::Shutdown => {
                tracing::info!("Shutting down event store");
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Start a standalone event store actor.
pub async fn start_event_store(
    config: &RuntimeConfig,
) -> RuntimeResult<(EventStoreHandle, tokio::task::JoinHandle<()>)> {
    let (actor, handle) = Actor::spawn(None, EventStoreActor, EventStoreArgs::from(config))
        .await
        .map_err(|e| RuntimeError::Remote(format!("Failed to spawn event store: {}", e)))?;
    Ok((EventStoreHandle::new(actor, config.call_timeout), handle))
}

/// Proxy to the event store actor.
///
/// Handler callbacks run inside the store, so a callback must not await a
/// call on the store that is running it.
#[derive(Debug, Clone)]
pub struct EventStoreHandle {
    actor: ActorRef<EventStoreMessage>,
    call_timeout: Option<Duration>,
}

impl EventStoreHandle {
    pub fn new(actor: ActorRef<EventStoreMessage>, call_timeout: Option<Duration>) -> Self {
        Self {
            actor,
            call_timeout,
        }
    }

    pub fn actor(&self) -> &ActorRef<EventStoreMessage> {
        &self.actor
    }

    /// Register one handler. Returns false when its ID was already registered.
    pub async fn register_handler(&self, handler: Handler) -> RuntimeResult<bool> {
        Ok(self.register_handlers(vec![handler]).await? == 1)
    }

    pub async fn register_handlers(&self, handlers: Vec<Handler>) -> RuntimeResult<usize> {
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::RegisterHandlers { handlers, reply },
            self.call_timeout,
            "register_handlers",
        )
        .await
    }

    /// Route an event through lock, evaluate, callback and unlock.
    ///
    /// Sent without a call timeout since callbacks may take arbitrarily long.
    pub async fn publish(&self, event: Event) -> RuntimeResult<ProcessReport> {
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::Publish { event, reply },
            None,
            "publish",
        )
        .await?
    }

    pub async fn record(&self, event: Event, session: Option<SessionId>) -> RuntimeResult<()> {
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::Record {
                event,
                session,
                reply,
            },
            self.call_timeout,
            "record",
        )
        .await?
    }

    /// Lock the occurrence `event` designates. Fails with `LockHeld` while another session holds it.
    pub async fn set_lock_for_event(
        &self,
        event: &Event,
        ttl_ms: Option<u64>,
    ) -> RuntimeResult<SessionId> {
        let reference = event.reference()?;
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::SetLock {
                reference,
                ttl_ms,
                reply,
            },
            self.call_timeout,
            "set_lock_for_event",
        )
        .await?
    }

    pub async fn get_session_lock_for_event(&self, event: &Event) -> RuntimeResult<Option<SessionId>> {
        let reference = event.reference()?;
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::GetSessionLock { reference, reply },
            self.call_timeout,
            "get_session_lock_for_event",
        )
        .await
    }

    pub async fn unlock(&self, session: SessionId) -> RuntimeResult<bool> {
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::Unlock { session, reply },
            self.call_timeout,
            "unlock",
        )
        .await
    }

    /// Whether `event` is locked by a session not listed in `owned`.
    pub async fn is_event_locked(&self, event: &Event, owned: &SessionMap) -> RuntimeResult<bool> {
        let reference = event.reference()?;
        let owned = owned.clone();
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::IsLocked {
                reference,
                owned,
                reply,
            },
            self.call_timeout,
            "is_event_locked",
        )
        .await
    }

    pub async fn get_handler_by_event_type(
        &self,
        event_type: &str,
    ) -> RuntimeResult<Vec<HandlerDefinition>> {
        let event_type = event_type.to_string();
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::HandlersByEventType { event_type, reply },
            self.call_timeout,
            "get_handler_by_event_type",
        )
        .await
    }

    pub async fn get_handler_by_last_event(
        &self,
        event: Event,
        session: Option<SessionId>,
    ) -> RuntimeResult<Option<HandlerDefinition>> {
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::HandlerByLastEvent {
                event,
                session,
                reply,
            },
            self.call_timeout,
            "get_handler_by_last_event",
        )
        .await
    }

    pub async fn get_handler_by_last_events(
        &self,
        events: Vec<Event>,
        session: Option<SessionId>,
    ) -> RuntimeResult<Vec<Option<HandlerDefinition>>> {
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::HandlersByLastEvents {
                events,
                session,
                reply,
            },
            self.call_timeout,
            "get_handler_by_last_events",
        )
        .await
    }

    /// Change flags of the store. Only meaningful in the hosting process.
    pub async fn changes(&self) -> RuntimeResult<CombinedEvents> {
        rpc::call(
            &self.actor,
            |reply| EventStoreMessage::Subscribe { reply },
            self.call_timeout,
            "changes",
        )
        .await
    }

    pub fn shutdown(&self) -> RuntimeResult<()> {
        self.actor
            .send_message(EventStoreMessage::Shutdown)
            .map_err(|_| RuntimeError::Remote("event store unreachable".into()))
    }
}
