//! Event handler callbacks.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use runtime_core::{HandlerDefinition, HandlerId, SessionId};

/// Result type for handler callbacks.
pub type CallbackResult = Result<(), String>;

/// Future type for async handler callbacks.
pub type CallbackFuture = Pin<Box<dyn Future<Output = CallbackResult> + Send>>;

/// Code run when a handler's operation has been evaluated for an event.
///
/// The callback runs while the event's lock is held under `session`; it is
/// released right after the returned future completes.
pub trait HandlerCallback: Send + Sync + 'static {
    fn on_execution(
        &self,
        result: bool,
        handler: &HandlerDefinition,
        session: SessionId,
    ) -> CallbackFuture;
}

/// A simple function-based callback.
pub struct FnCallback<F>
where
    F: Fn(bool, &HandlerDefinition, SessionId) -> CallbackFuture + Send + Sync + 'static,
{
    callback: F,
}

impl<F> FnCallback<F>
where
    F: Fn(bool, &HandlerDefinition, SessionId) -> CallbackFuture + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> HandlerCallback for FnCallback<F>
where
    F: Fn(bool, &HandlerDefinition, SessionId) -> CallbackFuture + Send + Sync + 'static,
{
    fn on_execution(
        &self,
        result: bool,
        handler: &HandlerDefinition,
        session: SessionId,
    ) -> CallbackFuture {
        (self.callback)(result, handler, session)
    }
}

/// A handler definition bound to the callback that executes it.
///
/// Definitions travel between processes; callbacks stay with the store that
/// registered them.
#[derive(Clone)]
pub struct Handler {
    pub definition: HandlerDefinition,
    callback: Arc<dyn HandlerCallback>,
}

impl Handler {
    pub fn new<C: HandlerCallback>(definition: HandlerDefinition, callback: C) -> Self {
        Self {
            definition,
            callback: Arc::new(callback),
        }
    }

    /// Build a handler from a closure.
    pub fn from_fn<F>(definition: HandlerDefinition, callback: F) -> Self
    where
        F: Fn(bool, &HandlerDefinition, SessionId) -> CallbackFuture + Send + Sync + 'static,
    {
        Self::new(definition, FnCallback::new(callback))
    }

    /// A handler whose callback does nothing.
    pub fn noop(definition: HandlerDefinition) -> Self {
        Self::from_fn(definition, |_, _, _| Box::pin(async { Ok(()) }))
    }

    pub fn id(&self) -> &HandlerId {
        &self.definition.handler_id
    }

    pub(crate) fn execute(&self, result: bool, session: SessionId) -> CallbackFuture {
        self.callback.on_execution(result, &self.definition, session)
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

/// Helper macro for creating handlers from async closures.
#[macro_export]
macro_rules! event_handler {
    ($definition:expr, |$result:ident, $handler:ident, $session:ident| $body:expr) => {
        $crate::Handler::from_fn(
            $definition,
            |$result: bool, $handler: &$crate::HandlerDefinition, $session: $crate::SessionId| {
                let $handler = $handler.clone();
                Box::pin(async move { $body })
            },
        )
    };
}
