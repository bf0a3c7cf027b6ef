//! An in-process listener.
//!
//! [`MemoryListener::new`] returns the listener and a cloneable
//! [`MemoryClient`]. Requests submitted by the client arrive at
//! [`accept`](Listener::accept) in submission order, and each response comes
//! back over its own oneshot channel. No sockets, no parsing.

use std::io;

use tokio::sync::{mpsc, oneshot};

use super::{Connection, Listener, ListenerError, ResponseSink};
use crate::http::{Request, Response};

enum Incoming {
    Request {
        request: Request,
        reply: oneshot::Sender<Response>,
    },
    Fail(io::Error),
}

/// A [`Listener`] fed by [`MemoryClient`]s.
///
/// Once every client has been dropped, `accept` waits forever rather than
/// failing, so a server over a `MemoryListener` only stops on its shutdown
/// signal.
///
/// # Examples
///
/// ```rust
/// use switchyard::http::{Method, Request, Headers, Response};
/// use switchyard::listener::{Listener, MemoryListener, ResponseSink};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let (mut listener, client) = MemoryListener::new();
/// listener.start().await.unwrap();
///
/// let pending = client
///     .submit(Request::from_parts(Method::Get, "/", Headers::new(), ""))
///     .unwrap();
/// let conn = listener.accept().await.unwrap();
/// conn.sink.send(Response::text("hi")).await.unwrap();
///
/// assert_eq!(pending.await.unwrap().bytes(), Some(&b"hi"[..]));
/// # }
/// ```
pub struct MemoryListener {
    addresses: Vec<String>,
    queue: mpsc::UnboundedReceiver<Incoming>,
    started: bool,
}

impl MemoryListener {
    /// Creates a listener and the first client connected to it.
    pub fn new() -> (Self, MemoryClient) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Self {
            addresses: vec!["memory://local".to_owned()],
            queue: rx,
            started: false,
        };
        (listener, MemoryClient { tx })
    }
}

impl Listener for MemoryListener {
    type Sink = MemorySink;

    fn add_address(&mut self, address: &str) {
        self.addresses.push(address.to_owned());
    }

    fn addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }

    async fn start(&mut self) -> Result<(), ListenerError> {
        if self.started {
            return Err(ListenerError::AlreadyStarted);
        }
        self.started = true;
        Ok(())
    }

    async fn stop(&mut self) {
        self.queue.close();
    }

    async fn accept(&mut self) -> Result<Connection<MemorySink>, ListenerError> {
        if !self.started {
            return Err(ListenerError::NotStarted);
        }
        match self.queue.recv().await {
            Some(Incoming::Request { request, reply }) => Ok(Connection {
                request,
                peer: None,
                sink: MemorySink { reply },
            }),
            Some(Incoming::Fail(e)) => Err(ListenerError::Io(e)),
            None => std::future::pending().await,
        }
    }
}

/// The submitting side of a [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryClient {
    tx: mpsc::UnboundedSender<Incoming>,
}

impl MemoryClient {
    /// Queues `request` and returns the channel its response will arrive on.
    ///
    /// The receiver resolves to an error if the connection is dropped without
    /// a response, e.g. when the server faults.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Closed`] if the listener was stopped or dropped.
    pub fn submit(&self, request: Request) -> Result<oneshot::Receiver<Response>, ListenerError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Incoming::Request { request, reply })
            .map_err(|_| ListenerError::Closed)?;
        Ok(response)
    }

    /// Submits `request` and waits for its response.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Closed`] if the listener is gone or the
    /// connection was dropped without a response.
    pub async fn send(&self, request: Request) -> Result<Response, ListenerError> {
        self.submit(request)?
            .await
            .map_err(|_| ListenerError::Closed)
    }

    /// Makes the listener's next `accept` fail with `error`.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError::Closed`] if the listener is gone.
    pub fn fail(&self, error: io::Error) -> Result<(), ListenerError> {
        self.tx
            .send(Incoming::Fail(error))
            .map_err(|_| ListenerError::Closed)
    }
}

impl std::fmt::Debug for Incoming {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Request { request, .. } => f.debug_tuple("Request").field(request).finish(),
            Self::Fail(e) => f.debug_tuple("Fail").field(e).finish(),
        }
    }
}

/// Delivers the response to the waiting [`MemoryClient`].
#[derive(Debug)]
pub struct MemorySink {
    reply: oneshot::Sender<Response>,
}

impl ResponseSink for MemorySink {
    async fn send(self, response: Response) -> io::Result<()> {
        self.reply
            .send(response)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client dropped the response channel"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{Headers, Method, StatusCode};

    fn get(path: &str) -> Request {
        Request::from_parts(Method::Get, path, Headers::new(), "")
    }

    #[tokio::test]
    async fn requests_arrive_in_submission_order() {
        let (mut listener, client) = MemoryListener::new();
        listener.start().await.unwrap();

        let first = client.submit(get("/1")).unwrap();
        let second = client.submit(get("/2")).unwrap();

        let a = listener.accept().await.unwrap();
        let b = listener.accept().await.unwrap();
        assert_eq!(a.request.path(), "/1");
        assert_eq!(b.request.path(), "/2");
        assert!(a.peer.is_none());

        b.sink.send(Response::new(StatusCode::Accepted)).await.unwrap();
        a.sink.send(Response::new(StatusCode::Created)).await.unwrap();
        assert_eq!(first.await.unwrap().status(), StatusCode::Created);
        assert_eq!(second.await.unwrap().status(), StatusCode::Accepted);
    }

    #[tokio::test]
    async fn injected_failure_surfaces_from_accept() {
        let (mut listener, client) = MemoryListener::new();
        listener.start().await.unwrap();
        client.fail(io::Error::other("boom")).unwrap();
        assert!(matches!(listener.accept().await, Err(ListenerError::Io(_))));
    }

    #[tokio::test]
    async fn accept_requires_start() {
        let (mut listener, _client) = MemoryListener::new();
        assert!(matches!(listener.accept().await, Err(ListenerError::NotStarted)));
        listener.start().await.unwrap();
        assert!(matches!(listener.start().await, Err(ListenerError::AlreadyStarted)));
    }

    #[tokio::test]
    async fn stopped_listener_refuses_submissions() {
        let (mut listener, client) = MemoryListener::new();
        listener.start().await.unwrap();
        listener.stop().await;
        assert!(matches!(client.submit(get("/")), Err(ListenerError::Closed)));
    }

    #[tokio::test]
    async fn dropped_connection_fails_the_client() {
        let (mut listener, client) = MemoryListener::new();
        listener.start().await.unwrap();
        let pending = tokio::spawn({
            let client = client.clone();
            async move { client.send(get("/")).await }
        });
        drop(listener.accept().await.unwrap());
        assert!(matches!(pending.await.unwrap(), Err(ListenerError::Closed)));
    }

    #[tokio::test]
    async fn accept_waits_after_all_clients_drop() {
        let (mut listener, client) = MemoryListener::new();
        listener.start().await.unwrap();
        drop(client);
        let waited = tokio::time::timeout(std::time::Duration::from_millis(20), listener.accept()).await;
        assert!(waited.is_err());
    }
}
