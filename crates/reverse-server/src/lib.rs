//! Reverse WebSocket command server.
//!
//! Dials out to a command-dispatching control plane, then serves an
//! application-level request/reply protocol over the established
//! connection: a *client* at the transport layer, a *server* at the
//! protocol layer. Built for agents behind NAT or without a reachable
//! port that still need to be commanded from a central control plane.
//!
//! The connection self-heals: dial failures, dead links (detected by an
//! application-level ping/pong cycle), and peer-initiated closes all lead
//! back to a delayed redial. Configuration changes arrive at runtime
//! through [`ServerHandle::configure`]; changing the target or proxy URL
//! reconnects, deferred until any in-flight reply completes.
//!
//! One task, the one driving [`ReverseServer::run`], owns the socket,
//! the timer, and the configuration store. Every other thread talks to it
//! through a [`ServerHandle`], whose operations post onto the loop's
//! command queue and run there in FIFO order.

mod control;
mod dial;
mod error;
mod handler;
mod server;
mod types;

pub use control::ServerHandle;
pub use error::ServerError;
pub use handler::MessageHandler;
pub use server::ReverseServer;
pub use types::{
    ConfigCallback, ConnectionId, ReplyMode, ShutdownCallback, State, StateCallback,
};

pub use tokio_tungstenite::tungstenite::Message;
