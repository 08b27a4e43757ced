//! Request/response helper shared by every actor handle.

use std::time::Duration;

use ractor::rpc::CallResult;
use ractor::{ActorRef, Message, RpcReplyPort};
use runtime_core::{RuntimeError, RuntimeResult};

/// Send a request built around a reply port and await the answer.
///
/// Delivery failures, dropped reply ports and timeouts all surface as
/// `RuntimeError::Remote`, never as an error of the remote object itself.
pub(crate) async fn call<TMessage, TReply, TBuilder>(
    actor: &ActorRef<TMessage>,
    build: TBuilder,
    timeout: Option<Duration>,
    operation: &str,
) -> RuntimeResult<TReply>
where
    TMessage: Message,
    TReply: Send + 'static,
    TBuilder: FnOnce(RpcReplyPort<TReply>) -> TMessage,
{
    match ractor::rpc::call(actor, build, timeout).await {
        Ok(CallResult::Success(reply)) => Ok(reply),
        Ok(CallResult::Timeout) => Err(RuntimeError::Remote(format!("{}: timed out", operation))),
        Ok(CallResult::SenderError) => Err(RuntimeError::Remote(format!(
            "{}: reply dropped by remote actor",
            operation
        ))),
        Err(_) => Err(RuntimeError::Remote(format!(
            "{}: actor unreachable",
            operation
        ))),
    }
}
