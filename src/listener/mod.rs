//! Platform listeners: where connections come from and where responses go.
//!
//! The dispatch loop only sees the [`Listener`] trait: a configurable set of
//! bind addresses, `start`/`stop`, and an `accept` that yields one parsed
//! [`Connection`] at a time. Two implementations ship with the crate:
//!
//! - [`TcpListener`]: HTTP/1.1 over tokio TCP sockets, one request per connection.
//! - [`MemoryListener`]: an in-process channel pair for tests and embedding.

mod memory;
mod tcp;

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::http::{Request, Response};

pub use memory::{MemoryClient, MemoryListener, MemorySink};
pub use tcp::{TcpListener, TcpSink};
pub(crate) use tcp::{DEFAULT_MAX_REQUEST_SIZE, DEFAULT_READ_TIMEOUT};

/// Errors raised by a [`Listener`].
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("listener has no bind addresses")]
    NoAddresses,

    #[error("listener is not started")]
    NotStarted,

    #[error("listener is already started")]
    AlreadyStarted,

    #[error("listener closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// One accepted request together with the means to answer it.
#[derive(Debug)]
pub struct Connection<S> {
    /// The parsed inbound request.
    pub request: Request,
    /// The remote peer, when the transport has one.
    pub peer: Option<SocketAddr>,
    /// Where the response is written.
    pub sink: S,
}

/// The write half of a [`Connection`].
///
/// A response is sent exactly once: `send` consumes the sink, serializes the
/// status, headers, content encoding and body, then closes the output.
pub trait ResponseSink: Send + 'static {
    /// Writes `response` and finalizes the connection's output.
    fn send(self, response: Response) -> impl Future<Output = io::Result<()>> + Send;
}

/// A source of inbound connections.
///
/// Addresses are configured with [`add_address`](Self::add_address) before
/// [`start`](Self::start). After `start`, [`accept`](Self::accept) is called
/// repeatedly by a single driver.
///
/// # Contract
///
/// `accept` **must** be cancel-safe: the dispatch loop races it against the
/// shutdown signal, and dropping an unfinished `accept` future must not lose a
/// connection. Any `Err` from `accept` is treated as fatal.
pub trait Listener: Send + 'static {
    /// The response side of accepted connections.
    type Sink: ResponseSink;

    /// Adds an address to bind on the next `start`.
    fn add_address(&mut self, address: &str);

    /// The bound addresses once started (with ephemeral ports resolved),
    /// otherwise the configured ones.
    fn addresses(&self) -> Vec<String>;

    /// Binds the configured addresses and begins accepting.
    fn start(&mut self) -> impl Future<Output = Result<(), ListenerError>> + Send;

    /// Stops accepting. Connections already handed out are unaffected.
    fn stop(&mut self) -> impl Future<Output = ()> + Send;

    /// Waits for the next connection.
    fn accept(&mut self) -> impl Future<Output = Result<Connection<Self::Sink>, ListenerError>> + Send;
}
