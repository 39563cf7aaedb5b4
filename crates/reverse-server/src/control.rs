//! Thread-safe control surface.
//!
//! Every operation posts a command onto the event loop's queue and runs
//! there, in FIFO order relative to other posts, atomically with respect
//! to socket and timer events. The lifecycle state is additionally
//! mirrored behind a mutex so other threads can read it directly.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::types::{
    ConfigCallback, ConnectionId, ShutdownCallback, State, StateCallback,
};

pub(crate) enum Command {
    Configure {
        updates: Value,
        callback: Option<ConfigCallback>,
    },
    InspectConfig {
        callback: ConfigCallback,
    },
    InspectState {
        callback: StateCallback,
    },
    Shutdown {
        callback: Option<ShutdownCallback>,
    },
    DoneReplying {
        conn: ConnectionId,
    },
    Reply {
        conn: ConnectionId,
        message: Message,
    },
}

pub(crate) struct Shared {
    state: Mutex<State>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Shared {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            state: Mutex::new(State::Uninitialized),
            commands,
        }
    }

    pub(crate) fn state(&self) -> State {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: State) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

/// Cloneable, thread-safe handle to a [`ReverseServer`](crate::ReverseServer).
///
/// Operations taking a callback run it on the event-loop task; once the
/// loop has exited, posted operations (and their callbacks) are dropped.
#[derive(Clone)]
pub struct ServerHandle {
    pub(crate) shared: Arc<Shared>,
}

impl ServerHandle {
    fn post(&self, command: Command) {
        let _ = self.shared.commands.send(command);
    }

    /// Applies a partial configuration update.
    ///
    /// The callback receives the update preview and any validation
    /// errors. With errors present the store is left untouched; otherwise
    /// the update is committed, and a changed `url` or `proxy_url`
    /// triggers a reconnect (deferred past any in-flight reply).
    pub fn configure(&self, updates: Value, callback: Option<ConfigCallback>) {
        self.post(Command::Configure { updates, callback });
    }

    /// Reports the configuration dump, as a consistent snapshot taken on
    /// the event loop.
    pub fn inspect_config(&self, callback: ConfigCallback) {
        self.post(Command::InspectConfig { callback });
    }

    /// Reports `{ "state": "<STATE>" }`, extended with
    /// `"reconnect_planned": true` while a reconnect is deferred behind a
    /// reply and `"shutting_down": true` once shutdown has begun.
    pub fn inspect_state(&self, callback: StateCallback) {
        self.post(Command::InspectState { callback });
    }

    /// Begins a graceful shutdown: the connection closes with a
    /// going-away code and the event loop exits once the close handshake
    /// finishes. The callback runs in the context that called
    /// [`ReverseServer::run`](crate::ReverseServer::run), after the loop
    /// has returned.
    pub fn shutdown(&self, callback: Option<ShutdownCallback>) {
        self.post(Command::Shutdown { callback });
    }

    /// Signals that the reply for `conn` is complete and reading may
    /// resume. Must be called exactly once per [`ReplyMode::Pending`]
    /// dispatch; calls referencing a torn-down connection are ignored.
    ///
    /// [`ReplyMode::Pending`]: crate::ReplyMode::Pending
    pub fn done_replying(&self, conn: ConnectionId) {
        self.post(Command::DoneReplying { conn });
    }

    /// Writes a frame on the given connection, dropped silently when the
    /// connection has been replaced. There is deliberately no write-side
    /// backpressure; the remote is responsible for not pipelining
    /// requests.
    pub fn reply(&self, conn: ConnectionId, message: Message) {
        self.post(Command::Reply { conn, message });
    }

    /// Current lifecycle state.
    pub fn current_state(&self) -> State {
        self.shared.state()
    }

    /// Whether `initialize()` has run. Remains true after shutdown.
    pub fn is_initialized(&self) -> bool {
        self.shared.state() != State::Uninitialized
    }

    /// Whether the server has finished shutting down.
    pub fn is_shut_down(&self) -> bool {
        self.shared.state() == State::ShutDown
    }
}
