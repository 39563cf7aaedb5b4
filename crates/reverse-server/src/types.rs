//! Public types for the reverse command server.

use std::fmt;

use serde_json::Value;

use tether_config::ConfigError;

/// Lifecycle state of the connection state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed but not yet initialized.
    Uninitialized,
    /// No connection; a redial is scheduled (or shutdown is imminent).
    NotConnected,
    /// A dial, including the WebSocket open handshake, is in flight.
    Connecting,
    /// Connected and reading, waiting for the next request frame.
    WaitingForRequest,
    /// A request is being answered; reading is paused.
    Replying,
    /// A close handshake is in progress.
    Closing,
    /// The event loop has exited.
    ShutDown,
}

impl State {
    /// Wire name, as reported by `inspect_state`.
    pub fn as_str(self) -> &'static str {
        match self {
            State::Uninitialized => "UNINITIALIZED",
            State::NotConnected => "NOT_CONNECTED",
            State::Connecting => "CONNECTING",
            State::WaitingForRequest => "WAITING_FOR_REQUEST",
            State::Replying => "REPLYING",
            State::Closing => "CLOSING",
            State::ShutDown => "SHUT_DOWN",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one WebSocket session.
///
/// Connections are numbered; control operations carry the id they were
/// issued for, and anything referencing a connection that has since been
/// torn down is dropped silently. This keeps late completions, such as a
/// `done_replying` for a connection that was reset mid-reply, from
/// corrupting the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(pub(crate) u64);

/// How the message handler produced (or will produce) its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// The reply was already written; the server may resume reading.
    Finished,
    /// The reply is produced asynchronously. The handler must later call
    /// [`ServerHandle::done_replying`](crate::ServerHandle::done_replying)
    /// with the same connection id.
    Pending,
}

/// Receives an update preview (or configuration dump) and any validation
/// errors, on the event-loop task.
pub type ConfigCallback = Box<dyn FnOnce(Value, Vec<ConfigError>) + Send + 'static>;

/// Receives the `inspect_state` document, on the event-loop task.
pub type StateCallback = Box<dyn FnOnce(Value) + Send + 'static>;

/// Runs after the event loop has exited, in the context that called
/// [`ReverseServer::run`](crate::ReverseServer::run).
pub type ShutdownCallback = Box<dyn FnOnce() + Send + 'static>;
