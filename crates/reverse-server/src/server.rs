//! The reverse command server: dialing, request/reply sequencing,
//! keep-alive, reconfiguration and shutdown, all driven by one event
//! loop that owns the socket, the timer, and the configuration store.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

use tether_config::{ConfigStore, ConfigType, Requirement, join_errors, static_default};

use crate::control::{Command, ServerHandle, Shared};
use crate::dial::{self, DialConfig, WsStream};
use crate::error::{DialError, ServerError};
use crate::handler::MessageHandler;
use crate::types::{ConfigCallback, ConnectionId, ReplyMode, ShutdownCallback, State};

const PONG_TIMEOUT_REASON: &str = "reconnecting because of pong timeout";
const CONFIG_RECONNECT_REASON: &str = "reconnecting because of configuration change";
const SHUTDOWN_REASON: &str = "shutting down";

type DialFuture = Pin<Box<dyn Future<Output = Result<WsStream, DialError>> + Send>>;

/// What the single reusable timer is currently armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerPurpose {
    /// Waiting to redial (NOT_CONNECTED).
    Reconnect,
    /// Waiting to send the next keep-alive ping.
    Ping,
    /// Waiting for the pong that answers a sent ping.
    PongWait,
    /// Waiting for the peer to finish the close handshake.
    CloseWait,
}

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    purpose: TimerPurpose,
}

struct Connection {
    id: ConnectionId,
    ws: WsStream,
}

enum LoopEvent {
    Command(Option<Command>),
    DialFinished(Result<WsStream, DialError>),
    TimerFired,
    Socket(Option<Result<Message, tungstenite::Error>>),
}

/// A long-lived WebSocket client that serves commands.
///
/// Construct with an initial configuration document (validated against
/// the schema below), call [`initialize`](Self::initialize) once, then
/// drive [`run`](Self::run); control it from anywhere through the
/// [`ServerHandle`] returned by [`handle`](Self::handle).
///
/// Configuration keys, all durations in seconds:
///
/// | key | type | default |
/// |---|---|---|
/// | `url` | string | required |
/// | `log_prefix` | string | `""` |
/// | `proxy_url` | string | unset |
/// | `proxy_username`, `proxy_password` | string | unset |
/// | `proxy_timeout` | float | 30.0 |
/// | `connect_timeout` | float | 30.0 |
/// | `ping_interval` | float | 30.0 |
/// | `ping_timeout` | float | 30.0 |
/// | `close_timeout` | float | 50.0 |
/// | `reconnect_timeout` | float | 5.0 |
pub struct ReverseServer {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedReceiver<Command>,
    store: ConfigStore,
    handler: Box<dyn MessageHandler>,
    log_prefix: String,
    conn: Option<Connection>,
    dial: Option<DialFuture>,
    next_connection: u64,
    deadline: Option<Deadline>,
    reconnect_after_reply: bool,
    shutting_down: bool,
    shutdown_callback: Option<ShutdownCallback>,
    exit: bool,
}

impl ReverseServer {
    /// Creates a server from an initial configuration document.
    pub fn new(
        initial_config: Value,
        handler: impl MessageHandler,
    ) -> Result<Self, ServerError> {
        let mut store = ConfigStore::new();
        register_schema(&mut store);
        if let Err(errors) = store.update(&initial_config) {
            return Err(ServerError::InvalidConfig(errors));
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let log_prefix = dial::string_key(&store, "log_prefix");

        Ok(Self {
            shared: Arc::new(Shared::new(commands_tx)),
            commands: commands_rx,
            store,
            handler: Box::new(handler),
            log_prefix,
            conn: None,
            dial: None,
            next_connection: 0,
            deadline: None,
            reconnect_after_reply: false,
            shutting_down: false,
            shutdown_callback: None,
            exit: false,
        })
    }

    /// Returns the control surface for this server.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    fn state(&self) -> State {
        self.shared.state()
    }

    fn set_state(&self, state: State) {
        self.shared.set_state(state);
    }

    /// Moves the machine out of UNINITIALIZED and starts the first dial.
    /// Must be called exactly once, before [`run`](Self::run).
    pub fn initialize(&mut self) {
        assert_eq!(
            self.state(),
            State::Uninitialized,
            "initialize() may only be called once"
        );
        self.set_state(State::NotConnected);
        self.start_connect();
    }

    /// Runs the event loop until shutdown completes, then invokes the
    /// shutdown callback (if one was given) before returning.
    pub async fn run(mut self) {
        assert!(
            self.state() != State::Uninitialized,
            "run() requires initialize() to have been called"
        );

        while !self.exit {
            let event = self.next_event().await;
            self.handle_event(event).await;
        }

        self.set_state(State::ShutDown);
        info!("{}event loop finished", self.log_prefix);
        if let Some(callback) = self.shutdown_callback.take() {
            callback();
        }
    }

    async fn next_event(&mut self) -> LoopEvent {
        // Reading is paused while a reply is in flight; commands, the
        // dial, and the timer stay live in every state.
        let reading = self.conn.is_some() && self.state() != State::Replying;
        let dialing = self.dial.is_some();
        let timer_at = self.deadline.map(|deadline| deadline.at);

        tokio::select! {
            biased;
            command = self.commands.recv() => LoopEvent::Command(command),
            result = poll_dial(&mut self.dial), if dialing => LoopEvent::DialFinished(result),
            _ = tokio::time::sleep_until(timer_at.unwrap_or_else(Instant::now)), if timer_at.is_some() => {
                LoopEvent::TimerFired
            }
            frame = poll_socket(&mut self.conn), if reading => LoopEvent::Socket(frame),
        }
    }

    async fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Command(Some(command)) => self.handle_command(command).await,
            LoopEvent::Command(None) => {
                unreachable!("command channel closed while the loop holds a sender")
            }
            LoopEvent::DialFinished(result) => {
                self.dial = None;
                self.on_dial_finished(result);
            }
            LoopEvent::TimerFired => {
                if let Some(deadline) = self.deadline.take() {
                    self.on_timer(deadline.purpose).await;
                }
            }
            LoopEvent::Socket(frame) => self.on_socket_event(frame).await,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Configure { updates, callback } => {
                self.internal_configure(updates, callback).await;
            }
            Command::InspectConfig { callback } => callback(self.store.dump(), Vec::new()),
            Command::InspectState { callback } => callback(self.state_doc()),
            Command::Shutdown { callback } => self.internal_shutdown(callback).await,
            Command::DoneReplying { conn } => self.internal_done_replying(conn).await,
            Command::Reply { conn, message } => self.internal_reply(conn, message).await,
        }
    }

    fn state_doc(&self) -> Value {
        let mut doc = json!({ "state": self.state().as_str() });
        if self.reconnect_after_reply {
            doc["reconnect_planned"] = Value::Bool(true);
        }
        if self.shutting_down {
            doc["shutting_down"] = Value::Bool(true);
        }
        doc
    }

    async fn internal_configure(&mut self, updates: Value, callback: Option<ConfigCallback>) {
        let (preview, errors) = self.store.preview_update(&updates);
        if !errors.is_empty() {
            warn!(
                "{}rejecting configuration update: {}",
                self.log_prefix,
                join_errors(&errors)
            );
            if let Some(callback) = callback {
                callback(preview, errors);
            }
            return;
        }

        let old_url = self.store.get("url");
        let old_proxy_url = self.store.get("proxy_url");
        self.store.force_apply_preview(&preview);
        self.log_prefix = dial::string_key(&self.store, "log_prefix");

        let target_changed =
            self.store.get("url") != old_url || self.store.get("proxy_url") != old_proxy_url;
        if target_changed {
            info!(
                "{}configuration changed the connection target, reconnecting",
                self.log_prefix
            );
            self.internal_reconnect().await;
        }

        if let Some(callback) = callback {
            callback(preview, errors);
        }
    }

    async fn internal_reconnect(&mut self) {
        match self.state() {
            State::NotConnected => {}
            State::Connecting => {
                // Abandon the half-open dial; the rescheduled one reads
                // the fresh configuration.
                self.dial = None;
                self.set_state(State::NotConnected);
                self.schedule_reconnect();
            }
            State::WaitingForRequest => {
                self.close_connection(CloseCode::Restart, CONFIG_RECONNECT_REASON)
                    .await;
            }
            State::Replying => {
                debug!("{}deferring reconnect until the reply completes", self.log_prefix);
                self.reconnect_after_reply = true;
            }
            // A teardown is already in progress; the next dial picks up
            // the new target anyway.
            State::Closing | State::ShutDown | State::Uninitialized => {}
        }
    }

    async fn internal_shutdown(&mut self, callback: Option<ShutdownCallback>) {
        if let Some(callback) = callback {
            self.shutdown_callback = Some(callback);
        }
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("{}shutting down", self.log_prefix);
        self.close_connection(CloseCode::Away, SHUTDOWN_REASON).await;
    }

    async fn internal_done_replying(&mut self, conn: ConnectionId) {
        if !self.is_current_connection(conn) {
            debug!("{}ignoring done_replying for a stale connection", self.log_prefix);
            return;
        }
        let state = self.state();
        // A shutdown (or a failed ping write) may already be closing the
        // connection out from under an in-flight reply; the reply's
        // completion no longer matters then.
        if state == State::Closing {
            return;
        }
        assert!(
            state == State::Replying,
            "done_replying called in state {state}"
        );
        self.set_state(State::WaitingForRequest);
        self.arm_ping();
        if self.reconnect_after_reply {
            self.reconnect_after_reply = false;
            self.internal_reconnect().await;
        }
    }

    async fn internal_reply(&mut self, conn: ConnectionId, message: Message) {
        if !self.is_current_connection(conn) {
            debug!("{}dropping reply for a stale connection", self.log_prefix);
            return;
        }
        let result = match self.conn.as_mut() {
            Some(connection) => connection.ws.send(message).await,
            None => return,
        };
        if let Err(e) = result {
            warn!("{}error writing reply: {e}", self.log_prefix);
            self.teardown_connection();
        }
    }

    fn is_current_connection(&self, conn: ConnectionId) -> bool {
        self.conn
            .as_ref()
            .is_some_and(|connection| connection.id == conn)
    }

    fn start_connect(&mut self) {
        let config = DialConfig::from_store(&self.store);
        info!("{}connecting to {}", self.log_prefix, config.url);
        self.set_state(State::Connecting);
        self.deadline = None;
        self.dial = Some(Box::pin(dial::dial(config)));
    }

    fn on_dial_finished(&mut self, result: Result<WsStream, DialError>) {
        match result {
            Ok(ws) => {
                self.next_connection += 1;
                self.conn = Some(Connection {
                    id: ConnectionId(self.next_connection),
                    ws,
                });
                self.set_state(State::WaitingForRequest);
                info!("{}connected", self.log_prefix);
                self.arm_ping();
            }
            Err(e) => {
                error!(
                    "{}error connecting to {}: {e}",
                    self.log_prefix,
                    dial::string_key(&self.store, "url")
                );
                self.set_state(State::NotConnected);
                self.schedule_reconnect();
            }
        }
    }

    async fn on_timer(&mut self, purpose: TimerPurpose) {
        match purpose {
            TimerPurpose::Reconnect => match self.state() {
                State::NotConnected => self.start_connect(),
                state => unreachable!("reconnect timer fired in state {state}"),
            },
            TimerPurpose::Ping => self.send_ping().await,
            TimerPurpose::PongWait => self.on_pong_timeout().await,
            TimerPurpose::CloseWait => {
                warn!(
                    "{}peer did not finish the close handshake in time",
                    self.log_prefix
                );
                self.teardown_connection();
            }
        }
    }

    async fn send_ping(&mut self) {
        match self.state() {
            State::WaitingForRequest | State::Replying => {}
            state => unreachable!("ping timer fired in state {state}"),
        }
        debug!("{}pinging", self.log_prefix);
        let result = match self.conn.as_mut() {
            Some(connection) => connection.ws.send(Message::Ping(b"ping".to_vec().into())).await,
            None => return,
        };
        match result {
            Ok(()) => {
                let timeout = dial::seconds_key(&self.store, "ping_timeout");
                self.arm_timer(TimerPurpose::PongWait, timeout);
            }
            Err(e) => {
                warn!("{}error sending ping: {e}", self.log_prefix);
                self.close_connection(CloseCode::Normal, "error sending ping")
                    .await;
            }
        }
    }

    async fn on_pong_timeout(&mut self) {
        match self.state() {
            State::Replying => {
                // Reading is paused while replying, so no pong could have
                // been observed; the ping cycle restarts after the reply.
                debug!("{}ignoring pong timeout while replying", self.log_prefix);
            }
            _ => {
                warn!("{}pong timeout", self.log_prefix);
                self.close_connection(CloseCode::Normal, PONG_TIMEOUT_REASON)
                    .await;
            }
        }
    }

    async fn on_socket_event(&mut self, frame: Option<Result<Message, tungstenite::Error>>) {
        match frame {
            Some(Ok(message)) => self.on_frame(message).await,
            Some(Err(e)) => {
                if self.state() == State::Closing {
                    debug!("{}connection finished closing: {e}", self.log_prefix);
                } else {
                    warn!("{}connection error: {e}", self.log_prefix);
                }
                self.teardown_connection();
            }
            None => {
                if self.state() != State::Closing {
                    warn!("{}connection closed by peer", self.log_prefix);
                }
                self.teardown_connection();
            }
        }
    }

    async fn on_frame(&mut self, message: Message) {
        match message {
            // tungstenite answers pings at the protocol layer.
            Message::Ping(_) | Message::Frame(_) => {}
            Message::Pong(_) => self.on_pong(),
            Message::Close(_) => self.on_close_frame(),
            Message::Text(_) | Message::Binary(_) => self.on_request(message).await,
        }
    }

    fn on_pong(&mut self) {
        if self.state() == State::WaitingForRequest {
            debug!("{}pong received", self.log_prefix);
            self.arm_ping();
        }
    }

    fn on_close_frame(&mut self) {
        match self.state() {
            State::Closing => {
                // The peer acknowledged our close; the stream ends on the
                // next poll.
            }
            _ => {
                info!("{}close requested by peer", self.log_prefix);
                // tungstenite echoes the close frame; keep draining until
                // the stream ends, bounded like any other close.
                self.set_state(State::Closing);
                self.reconnect_after_reply = false;
                let close_timeout = dial::seconds_key(&self.store, "close_timeout");
                self.arm_timer(TimerPurpose::CloseWait, close_timeout);
            }
        }
    }

    async fn on_request(&mut self, message: Message) {
        match self.state() {
            State::WaitingForRequest => {
                let Some(conn_id) = self.conn.as_ref().map(|connection| connection.id) else {
                    return;
                };
                self.set_state(State::Replying);
                let handle = self.handle();
                // Reading stays paused until the reply completes.
                if self.handler.on_message(&handle, conn_id, message) == ReplyMode::Finished {
                    self.internal_done_replying(conn_id).await;
                }
            }
            State::Closing => {
                // Discard anything racing with the close handshake.
            }
            state => unreachable!("request frame received in state {state}"),
        }
    }

    /// Starts a close handshake with the given code and reason, bounded
    /// by `close_timeout`.
    async fn close_connection(&mut self, code: CloseCode, reason: &str) {
        self.set_state(State::Closing);
        self.reconnect_after_reply = false;
        self.deadline = None;

        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        let result = match self.conn.as_mut() {
            Some(connection) => {
                info!("{}closing connection: {reason}", self.log_prefix);
                connection.ws.close(Some(frame)).await
            }
            None => {
                // Nothing on the wire; the close is already complete.
                self.teardown_connection();
                return;
            }
        };

        match result {
            Ok(()) => {
                let close_timeout = dial::seconds_key(&self.store, "close_timeout");
                self.arm_timer(TimerPurpose::CloseWait, close_timeout);
            }
            Err(e) => {
                // A close that fails to send is as final as a dead socket.
                warn!("{}error closing connection: {e}", self.log_prefix);
                self.teardown_connection();
            }
        }
    }

    /// Drops the connection (and any in-flight dial). Unless shutting
    /// down, returns to NOT_CONNECTED with a redial scheduled.
    fn teardown_connection(&mut self) {
        self.conn = None;
        self.dial = None;
        self.deadline = None;
        self.reconnect_after_reply = false;
        if self.shutting_down {
            self.exit = true;
        } else {
            self.set_state(State::NotConnected);
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&mut self) {
        let delay = dial::seconds_key(&self.store, "reconnect_timeout");
        debug!(
            "{}reconnecting in {:.1}s",
            self.log_prefix,
            delay.as_secs_f64()
        );
        self.arm_timer(TimerPurpose::Reconnect, delay);
    }

    fn arm_ping(&mut self) {
        let interval = dial::seconds_key(&self.store, "ping_interval");
        self.arm_timer(TimerPurpose::Ping, interval);
    }

    fn arm_timer(&mut self, purpose: TimerPurpose, after: Duration) {
        self.deadline = Some(Deadline {
            at: Instant::now() + after,
            purpose,
        });
    }
}

async fn poll_dial(dial: &mut Option<DialFuture>) -> Result<WsStream, DialError> {
    match dial {
        Some(future) => future.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn poll_socket(
    conn: &mut Option<Connection>,
) -> Option<Result<Message, tungstenite::Error>> {
    match conn {
        Some(connection) => connection.ws.next().await,
        None => std::future::pending().await,
    }
}

fn register_schema(store: &mut ConfigStore) {
    store.register_key("url", ConfigType::String, Requirement::Required, None);
    store.register_key(
        "log_prefix",
        ConfigType::String,
        Requirement::Optional,
        Some(static_default("")),
    );
    store.register_key("proxy_url", ConfigType::String, Requirement::Optional, None);
    store.register_key("proxy_username", ConfigType::String, Requirement::Optional, None);
    store.register_key("proxy_password", ConfigType::String, Requirement::Optional, None);
    store.register_key(
        "proxy_timeout",
        ConfigType::Float,
        Requirement::Optional,
        Some(static_default(30.0)),
    );
    store.register_key(
        "connect_timeout",
        ConfigType::Float,
        Requirement::Optional,
        Some(static_default(30.0)),
    );
    store.register_key(
        "ping_interval",
        ConfigType::Float,
        Requirement::Optional,
        Some(static_default(30.0)),
    );
    store.register_key(
        "ping_timeout",
        ConfigType::Float,
        Requirement::Optional,
        Some(static_default(30.0)),
    );
    store.register_key(
        "close_timeout",
        ConfigType::Float,
        Requirement::Optional,
        Some(static_default(50.0)),
    );
    store.register_key(
        "reconnect_timeout",
        ConfigType::Float,
        Requirement::Optional,
        Some(static_default(5.0)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler()
    -> impl FnMut(&ServerHandle, ConnectionId, Message) -> ReplyMode + Send + 'static {
        |_server: &ServerHandle, _conn: ConnectionId, _message: Message| ReplyMode::Finished
    }

    #[test]
    fn construction_requires_url() {
        let result = ReverseServer::new(json!({}), noop_handler());
        match result {
            Err(ServerError::InvalidConfig(errors)) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].full_message(), "'url' is required");
            }
            Ok(_) => panic!("construction should fail without a url"),
        }
    }

    #[test]
    fn construction_rejects_bad_types() {
        let result = ReverseServer::new(
            json!({"url": "ws://controller/", "ping_timeout": "soon"}),
            noop_handler(),
        );
        match result {
            Err(ServerError::InvalidConfig(errors)) => {
                assert_eq!(errors[0].full_message(), "'ping_timeout' must be a number");
            }
            Ok(_) => panic!("construction should fail on a type mismatch"),
        }
    }

    #[test]
    fn schema_defaults() {
        let server =
            ReverseServer::new(json!({"url": "ws://controller/"}), noop_handler()).unwrap();

        assert_eq!(server.store.get("log_prefix"), json!(""));
        assert_eq!(server.store.get("proxy_timeout"), json!(30.0));
        assert_eq!(server.store.get("connect_timeout"), json!(30.0));
        assert_eq!(server.store.get("ping_interval"), json!(30.0));
        assert_eq!(server.store.get("ping_timeout"), json!(30.0));
        assert_eq!(server.store.get("close_timeout"), json!(50.0));
        assert_eq!(server.store.get("reconnect_timeout"), json!(5.0));
        assert!(server.store.get("proxy_url").is_null());
    }

    #[test]
    fn log_prefix_is_cached_at_construction() {
        let server = ReverseServer::new(
            json!({"url": "ws://controller/", "log_prefix": "[agent-7] "}),
            noop_handler(),
        )
        .unwrap();
        assert_eq!(server.log_prefix, "[agent-7] ");
    }

    #[test]
    fn state_doc_reports_flags_only_when_set() {
        let mut server =
            ReverseServer::new(json!({"url": "ws://controller/"}), noop_handler()).unwrap();

        let doc = server.state_doc();
        assert_eq!(doc["state"], json!("UNINITIALIZED"));
        assert!(doc.get("reconnect_planned").is_none());
        assert!(doc.get("shutting_down").is_none());

        server.reconnect_after_reply = true;
        server.shutting_down = true;
        let doc = server.state_doc();
        assert_eq!(doc["reconnect_planned"], json!(true));
        assert_eq!(doc["shutting_down"], json!(true));
    }

    #[test]
    fn initialize_starts_dialing() {
        let mut server =
            ReverseServer::new(json!({"url": "ws://controller/"}), noop_handler()).unwrap();
        assert_eq!(server.state(), State::Uninitialized);

        server.initialize();
        assert_eq!(server.state(), State::Connecting);
        assert!(server.dial.is_some());
    }

    #[test]
    #[should_panic(expected = "initialize() may only be called once")]
    fn initialize_twice_panics() {
        let mut server =
            ReverseServer::new(json!({"url": "ws://controller/"}), noop_handler()).unwrap();
        server.initialize();
        server.initialize();
    }

    #[test]
    fn handle_observes_state() {
        let mut server =
            ReverseServer::new(json!({"url": "ws://controller/"}), noop_handler()).unwrap();
        let handle = server.handle();
        assert!(!handle.is_initialized());

        server.initialize();
        assert!(handle.is_initialized());
        assert_eq!(handle.current_state(), State::Connecting);
        assert!(!handle.is_shut_down());
    }
}
