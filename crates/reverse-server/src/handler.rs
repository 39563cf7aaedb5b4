//! Message handler contract.

use tokio_tungstenite::tungstenite::Message;

use crate::control::ServerHandle;
use crate::types::{ConnectionId, ReplyMode};

/// Application callback invoked once per incoming request frame.
///
/// Runs on the event-loop task. Reading from the connection is paused
/// from the moment the handler is invoked until its reply completes, so
/// at most one request is ever in flight per connection. The payload is
/// opaque to the server; how a reply is computed is entirely the
/// handler's business.
///
/// Blocking the loop task inside the handler degrades this agent's
/// throughput but cannot corrupt the machine.
pub trait MessageHandler: Send + 'static {
    /// Handles one request frame.
    ///
    /// Return [`ReplyMode::Finished`] when the reply was already written
    /// (typically via [`ServerHandle::reply`]). Return
    /// [`ReplyMode::Pending`] to produce the reply from another task,
    /// which must then call [`ServerHandle::done_replying`] with the same
    /// connection id exactly once.
    fn on_message(
        &mut self,
        server: &ServerHandle,
        conn: ConnectionId,
        message: Message,
    ) -> ReplyMode;
}

impl<F> MessageHandler for F
where
    F: FnMut(&ServerHandle, ConnectionId, Message) -> ReplyMode + Send + 'static,
{
    fn on_message(
        &mut self,
        server: &ServerHandle,
        conn: ConnectionId,
        message: Message,
    ) -> ReplyMode {
        self(server, conn, message)
    }
}
