//! Queue actor hosting a single queue, and the handle other processes use to reach it.

use std::collections::VecDeque;
use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use runtime_core::{QueueBook, QueueReference, QueueStats, RuntimeError, RuntimeResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::messages::QueueMessage;
use crate::rpc;

/// Reply port of a read that could not be answered yet.
#[derive(Debug)]
enum ParkedReply {
    One(RpcReplyPort<RuntimeResult<Value>>),
    Batch(usize, RpcReplyPort<RuntimeResult<Vec<Value>>>),
}

#[derive(Debug)]
struct ParkedGet {
    consumer: Option<String>,
    reply: ParkedReply,
}

impl ParkedGet {
    fn is_closed(&self) -> bool {
        match &self.reply {
            ParkedReply::One(reply) => reply.is_closed(),
            ParkedReply::Batch(_, reply) => reply.is_closed(),
        }
    }
}

/// State for the queue actor.
pub struct QueueActorState {
    /// Queue reference.
    pub reference: QueueReference,
    /// Shared sequence and consumer cursors.
    book: QueueBook<Value>,
    /// Blocking reads in arrival order.
    parked_gets: VecDeque<ParkedGet>,
    /// Callers waiting for any data.
    parked_waits: Vec<RpcReplyPort<bool>>,
}

impl QueueActorState {
    /// Create a new queue actor state.
    pub fn new(reference: QueueReference) -> Self {
        Self {
            book: QueueBook::new(reference.name.clone()),
            reference,
            parked_gets: VecDeque::new(),
            parked_waits: Vec::new(),
        }
    }

    /// Park a blocking read, dropping callers that already gave up.
    fn park_get(&mut self, parked: ParkedGet) {
        self.prune_closed();
        self.parked_gets.push_back(parked);
    }

    fn park_wait(&mut self, reply: RpcReplyPort<bool>) {
        self.prune_closed();
        self.parked_waits.push(reply);
    }

    fn prune_closed(&mut self) {
        self.parked_gets.retain(|parked| !parked.is_closed());
        self.parked_waits.retain(|reply| !reply.is_closed());
    }

    /// Answer every parked caller whose condition now holds.
    fn serve_parked(&mut self) {
        let mut still_parked = VecDeque::new();
        while let Some(parked) = self.parked_gets.pop_front() {
            if parked.is_closed() {
                continue;
            }
            let consumer = parked.consumer;
            match parked.reply {
                ParkedReply::One(reply) => match self.book.try_get(consumer.as_deref()) {
                    Err(RuntimeError::QueueEmpty { .. }) => still_parked.push_back(ParkedGet {
                        consumer,
                        reply: ParkedReply::One(reply),
                    }),
                    result => {
                        let _ = reply.send(result);
                    }
                },
                ParkedReply::Batch(count, reply) => {
                    match self.book.try_get_batch(consumer.as_deref(), count) {
                        Err(RuntimeError::QueueEmpty { .. }) => still_parked.push_back(ParkedGet {
                            consumer,
                            reply: ParkedReply::Batch(count, reply),
                        }),
                        result => {
                            let _ = reply.send(result);
                        }
                    }
                }
            }
        }
        self.parked_gets = still_parked;

        let ready = self.book.has_pending();
        if ready || self.book.is_finished() {
            for reply in self.parked_waits.drain(..) {
                let _ = reply.send(ready);
            }
        } else {
            self.parked_waits.retain(|reply| !reply.is_closed());
        }
    }
}

/// Queue actor that owns one queue's contents.
pub struct QueueActor;

impl Actor for QueueActor {
    type Msg = QueueMessage;
    type State = QueueActorState;
    type Arguments = QueueActorState;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting queue actor: {}", args.reference);
        Ok(args)
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if !state.parked_gets.is_empty() || !state.parked_waits.is_empty() {
            tracing::warn!(
                "Queue {} stopped with {} parked readers",
                state.reference,
                state.parked_gets.len() + state.parked_waits.len()
            );
        }
        // Dropping the parked ports makes every waiting caller observe a remote error.
        state.parked_gets.clear();
        state.parked_waits.clear();
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            QueueMessage::Put {
                item,
                producer,
                reply,
            } => {
                let result = state.book.put(item, producer.as_deref());
                if result.is_ok() {
                    state.serve_parked();
                }
                let _ = reply.send(result);
            }

            QueueMessage::PutIter {
                items,
                producer,
                reply,
            } => {
                let result = state.book.put_iter(items, producer.as_deref());
                if matches!(result, Ok(count) if count > 0) {
                    state.serve_parked();
                }
                let _ = reply.send(result);
            }

            QueueMessage::Get {
                consumer,
                wait,
                reply,
            } => match state.book.try_get(consumer.as_deref()) {
                Err(RuntimeError::QueueEmpty { .. }) if wait => {
                    state.park_get(ParkedGet {
                        consumer,
                        reply: ParkedReply::One(reply),
                    });
                }
                result => {
                    let _ = reply.send(result);
                }
            },

            QueueMessage::GetBatch {
                consumer,
                count,
                reply,
            } => {
                if count == 0 {
                    let _ = reply.send(Ok(Vec::new()));
                    return Ok(());
                }
                match state.book.try_get_batch(consumer.as_deref(), count) {
                    Err(RuntimeError::QueueEmpty { .. }) => {
                        state.park_get(ParkedGet {
                            consumer,
                            reply: ParkedReply::Batch(count, reply),
                        });
                    }
                    result => {
                        let _ = reply.send(result);
                    }
                }
            }

            QueueMessage::QSize { reply } => {
                let _ = reply.send(state.book.qsize());
            }

            QueueMessage::Register { consumer, reply } => {
                let position = state.book.register(&consumer);
                tracing::debug!("Queue {}: consumer {} registered", state.reference, consumer);
                let _ = reply.send(position);
            }

            QueueMessage::Unregister { consumer, reply } => {
                let existed = state.book.unregister(&consumer);
                if existed {
                    tracing::debug!(
                        "Queue {}: consumer {} unregistered",
                        state.reference,
                        consumer
                    );
                }
                // Parked reads for the dropped cursor are answered with the rejection.
                state.serve_parked();
                let _ = reply.send(existed);
            }

            QueueMessage::Wait { reply } => {
                if state.book.has_pending() {
                    let _ = reply.send(true);
                } else if state.book.is_finished() {
                    let _ = reply.send(false);
                } else {
                    state.park_wait(reply);
                }
            }

            QueueMessage::Finish { consumer, reply } => {
                let result = state.book.finish(consumer.as_deref());
                if result.is_ok() {
                    tracing::info!(
                        "Queue {} finished for {}",
                        state.reference,
                        consumer.as_deref().unwrap_or("all consumers")
                    );
                    state.serve_parked();
                }
                let _ = reply.send(result);
            }

            QueueMessage::IsExhausted { consumer, reply } => {
                let _ = reply.send(state.book.is_exhausted(consumer.as_deref()));
            }

            QueueMessage::GetInfo { reply } => {
                let _ = reply.send(state.reference.clone());
            }

            QueueMessage::GetStats { reply } => {
                let _ = reply.send(state.book.stats());
            }

            QueueMessage::Shutdown => {
                tracing::info!("Shutting down queue: {}", state.reference);
                myself.stop(None);
                return Ok(());
            }
        }

        Ok(())
    }
}

/// Start a standalone queue actor.
pub async fn start_queue(
    reference: QueueReference,
    config: &RuntimeConfig,
) -> RuntimeResult<(QueueHandle, tokio::task::JoinHandle<()>)> {
    let (actor, handle) = Actor::spawn(None, QueueActor, QueueActorState::new(reference.clone()))
        .await
        .map_err(|e| RuntimeError::Remote(format!("Failed to spawn queue {}: {}", reference, e)))?;
    Ok((QueueHandle::new(actor, reference, config.call_timeout), handle))
}

/// Typed proxy to a queue hosted by a `QueueActor`.
///
/// Every method is a request/response round-trip. Blocking reads are sent
/// without a call timeout; everything else uses the configured one.
#[derive(Debug, Clone)]
pub struct QueueHandle {
    actor: ActorRef<QueueMessage>,
    reference: QueueReference,
    call_timeout: Option<Duration>,
}

impl QueueHandle {
    pub fn new(
        actor: ActorRef<QueueMessage>,
        reference: QueueReference,
        call_timeout: Option<Duration>,
    ) -> Self {
        Self {
            actor,
            reference,
            call_timeout,
        }
    }

    pub fn reference(&self) -> &QueueReference {
        &self.reference
    }

    pub fn name(&self) -> &str {
        &self.reference.name
    }

    pub fn actor(&self) -> &ActorRef<QueueMessage> {
        &self.actor
    }

    /// Append one item, tagged with an optional producer name.
    pub async fn put<T: Serialize>(&self, item: &T, producer: Option<&str>) -> RuntimeResult<()> {
        let item = serde_json::to_value(item)?;
        let producer = producer.map(str::to_string);
        rpc::call(
            &self.actor,
            |reply| QueueMessage::Put {
                item,
                producer,
                reply,
            },
            self.call_timeout,
            "queue put",
        )
        .await?
    }

    /// Append items in order and return how many were appended.
    pub async fn put_iter<T: Serialize>(&self, items: Vec<T>) -> RuntimeResult<usize> {
        let items = items
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        rpc::call(
            &self.actor,
            |reply| QueueMessage::PutIter {
                items,
                producer: None,
                reply,
            },
            self.call_timeout,
            "queue put_iter",
        )
        .await?
    }

    /// Read the next item for `consumer`, suspending while empty when `wait` is set.
    pub async fn get<T: DeserializeOwned>(
        &self,
        consumer: Option<&str>,
        wait: bool,
    ) -> RuntimeResult<T> {
        let consumer = consumer.map(str::to_string);
        let timeout = if wait { None } else { self.call_timeout };
        let value = rpc::call(
            &self.actor,
            |reply| QueueMessage::Get {
                consumer,
                wait,
                reply,
            },
            timeout,
            "queue get",
        )
        .await??;
        Ok(serde_json::from_value(value)?)
    }

    /// Read up to `count` items, suspending until at least one is available.
    pub async fn get_iter<T: DeserializeOwned>(
        &self,
        count: usize,
        consumer: Option<&str>,
    ) -> RuntimeResult<Vec<T>> {
        let consumer = consumer.map(str::to_string);
        let values = rpc::call(
            &self.actor,
            |reply| QueueMessage::GetBatch {
                consumer,
                count,
                reply,
            },
            None,
            "queue get_iter",
        )
        .await??;
        values
            .into_iter()
            .map(|value| serde_json::from_value(value).map_err(RuntimeError::from))
            .collect()
    }

    pub async fn qsize(&self) -> RuntimeResult<usize> {
        rpc::call(
            &self.actor,
            |reply| QueueMessage::QSize { reply },
            self.call_timeout,
            "queue qsize",
        )
        .await
    }

    /// Register a consumer at the tail; an existing cursor is kept.
    pub async fn register(&self, consumer: &str) -> RuntimeResult<u64> {
        let consumer = consumer.to_string();
        rpc::call(
            &self.actor,
            |reply| QueueMessage::Register { consumer, reply },
            self.call_timeout,
            "queue register",
        )
        .await
    }

    pub async fn unregister(&self, consumer: &str) -> RuntimeResult<bool> {
        let consumer = consumer.to_string();
        rpc::call(
            &self.actor,
            |reply| QueueMessage::Unregister { consumer, reply },
            self.call_timeout,
            "queue unregister",
        )
        .await
    }

    /// Wait until data is available. Returns `Ok(false)` on timeout.
    pub async fn wait(&self, timeout: Option<Duration>) -> RuntimeResult<bool> {
        match ractor::rpc::call(&self.actor, |reply| QueueMessage::Wait { reply }, timeout).await {
            Ok(CallResult::Success(ready)) => Ok(ready),
            Ok(CallResult::Timeout) => Ok(false),
            Ok(CallResult::SenderError) => Err(RuntimeError::Remote(
                "queue wait: reply dropped by remote actor".into(),
            )),
            Err(_) => Err(RuntimeError::Remote("queue wait: actor unreachable".into())),
        }
    }

    /// Mark completion for a consumer or, without a name, for the whole queue.
    pub async fn finish(&self, consumer: Option<&str>) -> RuntimeResult<()> {
        let consumer = consumer.map(str::to_string);
        rpc::call(
            &self.actor,
            |reply| QueueMessage::Finish { consumer, reply },
            self.call_timeout,
            "queue finish",
        )
        .await?
    }

    pub async fn is_exhausted(&self, consumer: Option<&str>) -> RuntimeResult<bool> {
        let consumer = consumer.map(str::to_string);
        rpc::call(
            &self.actor,
            |reply| QueueMessage::IsExhausted { consumer, reply },
            self.call_timeout,
            "queue is_exhausted",
        )
        .await
    }

    pub async fn stats(&self) -> RuntimeResult<QueueStats> {
        rpc::call(
            &self.actor,
            |reply| QueueMessage::GetStats { reply },
            self.call_timeout,
            "queue stats",
        )
        .await
    }

    /// Ask the hosting actor which queue it serves.
    pub async fn info(&self) -> RuntimeResult<QueueReference> {
        rpc::call(
            &self.actor,
            |reply| QueueMessage::GetInfo { reply },
            self.call_timeout,
            "queue info",
        )
        .await
    }

    /// Stop the hosting actor.
    pub fn shutdown(&self) -> RuntimeResult<()> {
        self.actor
            .send_message(QueueMessage::Shutdown)
            .map_err(|_| RuntimeError::Remote(format!("queue {} unreachable", self.reference)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ractor::concurrency::OneshotReceiver;

    fn port<T: Send + 'static>() -> (RpcReplyPort<T>, OneshotReceiver<T>) {
        let (tx, rx) = ractor::concurrency::oneshot();
        (RpcReplyPort::from(tx), rx)
    }

    #[test]
    fn abandoned_callers_are_pruned_when_parking() {
        let mut state = QueueActorState::new(QueueReference::of::<u32>("numbers"));
        for _ in 0..3 {
            let (wait, _) = port::<bool>();
            state.park_wait(wait);
            let (get, _) = port::<RuntimeResult<Value>>();
            state.park_get(ParkedGet {
                consumer: None,
                reply: ParkedReply::One(get),
            });
        }

        let (live_wait, _wait_rx) = port::<bool>();
        state.park_wait(live_wait);
        let (live_get, _get_rx) = port::<RuntimeResult<Value>>();
        state.park_get(ParkedGet {
            consumer: None,
            reply: ParkedReply::One(live_get),
        });

        assert_eq!(state.parked_waits.len(), 1);
        assert_eq!(state.parked_gets.len(), 1);
    }
}
