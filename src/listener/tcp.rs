//! HTTP/1.1 over tokio TCP sockets.
//!
//! Each bound socket gets a background acceptor task. Every accepted stream
//! is read on its own task until one complete request (headers plus
//! `Content-Length` body) is buffered, then handed to [`TcpListener::accept`]
//! through a bounded channel. Malformed requests are answered with `400`,
//! oversized ones with `413` and clients that do not finish their request
//! within the read timeout with `408`; the dispatch loop never sees them.
//!
//! Reader tasks belong to the acceptor that spawned them, so
//! [`stop`](Listener::stop) closes connections still waiting on a request.
//!
//! Accept errors that only concern one connection (reset or aborted before
//! it was accepted, interrupted calls) are logged and retried after a short
//! pause. Any other accept error is passed to [`accept`](Listener::accept)
//! as [`ListenerError::Io`] and ends that socket's acceptor.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{Connection, Listener, ListenerError, ResponseSink};
use crate::http::{Request, RequestError, Response, StatusCode};

/// Default maximum size of a complete HTTP request (8 MiB).
pub(crate) const DEFAULT_MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Default time a client gets to send one complete request.
pub(crate) const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Parsed connections waiting for `accept`.
const QUEUE_DEPTH: usize = 128;

/// Pause after a retried `accept(2)` failure.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

type Queue = mpsc::Receiver<Result<Connection<TcpSink>, ListenerError>>;
type QueueTx = mpsc::Sender<Result<Connection<TcpSink>, ListenerError>>;

/// A [`Listener`] over one or more TCP sockets.
///
/// # Examples
///
/// ```rust,no_run
/// use switchyard::listener::{Listener, TcpListener};
///
/// # async fn demo() -> Result<(), switchyard::listener::ListenerError> {
/// let mut listener = TcpListener::bind("127.0.0.1:0").max_request_size(1024 * 1024);
/// listener.add_address("[::1]:0");
/// listener.start().await?;
/// println!("listening on {:?}", listener.addresses());
/// # Ok(())
/// # }
/// ```
pub struct TcpListener {
    addresses: Vec<String>,
    bound: Vec<SocketAddr>,
    max_request_size: usize,
    read_timeout: Duration,
    queue: Option<Queue>,
    acceptors: JoinSet<()>,
}

impl Default for TcpListener {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpListener {
    /// Creates a listener with no addresses.
    pub fn new() -> Self {
        Self {
            addresses: Vec::new(),
            bound: Vec::new(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            read_timeout: DEFAULT_READ_TIMEOUT,
            queue: None,
            acceptors: JoinSet::new(),
        }
    }

    /// Creates a listener for a single address.
    pub fn bind(address: impl Into<String>) -> Self {
        let mut listener = Self::new();
        listener.addresses.push(address.into());
        listener
    }

    /// Sets the largest request (head plus body) accepted before replying `413`.
    #[must_use]
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    /// Sets how long a client may take to send one complete request before
    /// it is answered with `408` and disconnected.
    #[must_use]
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// The sockets bound by [`start`](Listener::start).
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.bound
    }
}

impl Listener for TcpListener {
    type Sink = TcpSink;

    fn add_address(&mut self, address: &str) {
        self.addresses.push(address.to_owned());
    }

    fn addresses(&self) -> Vec<String> {
        if self.bound.is_empty() {
            self.addresses.clone()
        } else {
            self.bound.iter().map(SocketAddr::to_string).collect()
        }
    }

    async fn start(&mut self) -> Result<(), ListenerError> {
        if self.queue.is_some() {
            return Err(ListenerError::AlreadyStarted);
        }
        if self.addresses.is_empty() {
            return Err(ListenerError::NoAddresses);
        }

        // Bind everything before spawning anything, so a bad address leaves
        // no half-started listener behind.
        let mut sockets = Vec::with_capacity(self.addresses.len());
        for addr in &self.addresses {
            let socket = tokio::net::TcpListener::bind(addr.as_str())
                .await
                .map_err(|source| ListenerError::Bind {
                    addr: addr.clone(),
                    source,
                })?;
            let local = socket.local_addr()?;
            sockets.push((socket, local));
        }

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let limits = ReadLimits {
            max_request_size: self.max_request_size,
            timeout: self.read_timeout,
        };
        for (socket, local) in sockets {
            info!(address = %local, "listening");
            self.bound.push(local);
            self.acceptors.spawn(accept_loop(socket, local, tx.clone(), limits));
        }
        self.queue = Some(rx);
        Ok(())
    }

    async fn stop(&mut self) {
        self.acceptors.abort_all();
        while self.acceptors.join_next().await.is_some() {}
        if let Some(queue) = &mut self.queue {
            queue.close();
        }
        debug!(addresses = ?self.bound, "listener stopped");
    }

    async fn accept(&mut self) -> Result<Connection<TcpSink>, ListenerError> {
        let queue = self.queue.as_mut().ok_or(ListenerError::NotStarted)?;
        queue.recv().await.unwrap_or(Err(ListenerError::Closed))
    }
}

#[derive(Debug, Clone, Copy)]
struct ReadLimits {
    max_request_size: usize,
    timeout: Duration,
}

/// `true` for accept errors caused by a single connection rather than the
/// listening socket.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

async fn accept_loop(
    socket: tokio::net::TcpListener,
    local: SocketAddr,
    tx: QueueTx,
    limits: ReadLimits,
) {
    // Dropped with this task, which aborts every reader still running.
    let mut readers = JoinSet::new();

    loop {
        let accepted = tokio::select! {
            () = tx.closed() => break,
            Some(_) = readers.join_next(), if !readers.is_empty() => continue,
            accepted = socket.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) if is_transient(&e) => {
                warn!(address = %local, error = %e, "failed to accept connection");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
            Err(e) => {
                error!(address = %local, error = %e, "listening socket failed");
                let _ = tx.send(Err(ListenerError::Io(e))).await;
                break;
            }
        };

        debug!(peer = %peer, "connection accepted");
        let tx = tx.clone();
        readers.spawn(async move {
            match read_request(stream, peer, limits).await {
                Ok(Some(connection)) => {
                    if tx.send(Ok(connection)).await.is_err() {
                        debug!(peer = %peer, "listener stopped, dropping connection");
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(peer = %peer, error = %e, "connection closed with error"),
            }
        });
    }
}

/// Reads exactly one request from `stream` within `limits.timeout`.
///
/// Returns `Ok(None)` when the peer closed early or the request was rejected
/// (the rejection has already been written).
async fn read_request(
    mut stream: TcpStream,
    peer: SocketAddr,
    limits: ReadLimits,
) -> io::Result<Option<Connection<TcpSink>>> {
    let read = tokio::time::timeout(
        limits.timeout,
        read_head_and_body(&mut stream, peer, limits.max_request_size),
    )
    .await;

    match read {
        Ok(Ok(Some(request))) => Ok(Some(Connection {
            request,
            peer: Some(peer),
            sink: TcpSink { stream, peer },
        })),
        Ok(Ok(None)) => Ok(None),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            reject(&mut stream, peer, StatusCode::RequestTimeout, &"request not received in time").await?;
            Ok(None)
        }
    }
}

async fn read_head_and_body(
    stream: &mut TcpStream,
    peer: SocketAddr,
    max_request_size: usize,
) -> io::Result<Option<Request>> {
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        let bytes_read = stream.read_buf(&mut buf).await?;
        if bytes_read == 0 {
            debug!(peer = %peer, "connection closed by peer before a full request");
            return Ok(None);
        }

        if buf.len() > max_request_size {
            let e = RequestError::BodyTooLarge {
                max_bytes: max_request_size,
            };
            reject(stream, peer, StatusCode::PayloadTooLarge, &e).await?;
            return Ok(None);
        }

        let (request, body_offset) = match Request::parse(&buf) {
            Ok(pair) => pair,
            // Headers not yet fully received.
            Err(RequestError::Incomplete) => continue,
            Err(e) => {
                reject(stream, peer, StatusCode::BadRequest, &e).await?;
                return Ok(None);
            }
        };

        let total_needed = body_offset + request.content_length().unwrap_or(0);
        if total_needed > max_request_size {
            let e = RequestError::BodyTooLarge {
                max_bytes: max_request_size,
            };
            reject(stream, peer, StatusCode::PayloadTooLarge, &e).await?;
            return Ok(None);
        }
        if buf.len() < total_needed {
            continue;
        }

        // Re-parse over exactly head + body so pipelined bytes are ignored.
        buf.truncate(total_needed);
        let request = match Request::parse(&buf) {
            Ok((request, _)) => request,
            Err(e) => {
                reject(stream, peer, StatusCode::BadRequest, &e).await?;
                return Ok(None);
            }
        };

        debug!(
            peer = %peer,
            method = %request.method(),
            path = %request.path(),
            "request read"
        );
        return Ok(Some(request));
    }
}

async fn reject(
    stream: &mut TcpStream,
    peer: SocketAddr,
    status: StatusCode,
    error: &(dyn std::fmt::Display + Sync),
) -> io::Result<()> {
    warn!(peer = %peer, status = status.as_u16(), error = %error, "rejecting request");
    let body = match status {
        StatusCode::PayloadTooLarge => "Request entity too large".to_owned(),
        StatusCode::RequestTimeout => "Request Timeout".to_owned(),
        _ => format!("Bad Request: {error}"),
    };
    Response::new(status).body(body).write_to(stream).await?;
    stream.shutdown().await
}

/// Writes the response onto the TCP stream and closes it.
#[derive(Debug)]
pub struct TcpSink {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpSink {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl ResponseSink for TcpSink {
    async fn send(mut self, response: Response) -> std::io::Result<()> {
        response.write_to(&mut self.stream).await?;
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn started(max: usize) -> (TcpListener, SocketAddr) {
        let mut listener = TcpListener::bind("127.0.0.1:0").max_request_size(max);
        listener.start().await.unwrap();
        let addr = listener.local_addrs()[0];
        (listener, addr)
    }

    async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(raw).await.unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn accept_yields_parsed_request_and_sink_writes_response() {
        let (mut listener, addr) = started(DEFAULT_MAX_REQUEST_SIZE).await;

        let client = tokio::spawn(exchange(
            addr,
            b"POST /echo?x=1 HTTP/1.1\r\nHost: t\r\nContent-Length: 5\r\n\r\nhello",
        ));

        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.request.path(), "/echo");
        assert_eq!(conn.request.query_param("x"), Some("1"));
        assert_eq!(&conn.request.body()[..], b"hello");
        assert!(conn.peer.is_some());

        conn.sink.send(Response::text("world")).await.unwrap();
        let raw = client.await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("Connection: close\r\n"));
        assert!(raw.ends_with("\r\n\r\nworld"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let (_listener, addr) = started(DEFAULT_MAX_REQUEST_SIZE).await;
        let raw = exchange(addr, b"GET\x00/ HTTP/1.1\r\n\r\n").await;
        assert!(raw.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{raw}");
    }

    #[tokio::test]
    async fn oversized_body_gets_413() {
        let (_listener, addr) = started(256).await;
        let raw = exchange(addr, b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n").await;
        assert!(raw.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{raw}");
    }

    #[tokio::test]
    async fn slow_client_gets_408() {
        let mut listener = TcpListener::bind("127.0.0.1:0").read_timeout(Duration::from_millis(100));
        listener.start().await.unwrap();
        let addr = listener.local_addrs()[0];

        let raw = exchange(addr, b"GET / HTTP/1.1\r\nHost: t\r\n").await;
        assert!(raw.starts_with("HTTP/1.1 408 Request Timeout\r\n"), "{raw}");
        listener.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_connections_waiting_for_a_request() {
        let (mut listener, addr) = started(DEFAULT_MAX_REQUEST_SIZE).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        listener.stop().await;

        let mut buf = [0u8; 64];
        let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("connection left open after stop");
        // A clean EOF or a reset both mean the server side is gone.
        assert!(matches!(read, Ok(0) | Err(_)), "{read:?}");
    }

    #[test]
    fn only_per_connection_accept_errors_are_retried() {
        for kind in [
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::Interrupted,
            io::ErrorKind::WouldBlock,
        ] {
            assert!(is_transient(&io::Error::from(kind)), "{kind:?}");
        }
        for kind in [
            io::ErrorKind::PermissionDenied,
            io::ErrorKind::InvalidInput,
            io::ErrorKind::OutOfMemory,
            io::ErrorKind::Other,
        ] {
            assert!(!is_transient(&io::Error::from(kind)), "{kind:?}");
        }
    }

    #[tokio::test]
    async fn start_twice_and_accept_before_start() {
        let mut idle = TcpListener::bind("127.0.0.1:0");
        assert!(matches!(idle.accept().await, Err(ListenerError::NotStarted)));

        let (mut listener, _) = started(DEFAULT_MAX_REQUEST_SIZE).await;
        assert!(matches!(listener.start().await, Err(ListenerError::AlreadyStarted)));
        assert!(matches!(TcpListener::new().start().await, Err(ListenerError::NoAddresses)));
    }

    #[tokio::test]
    async fn bind_failure_names_the_address() {
        let mut listener = TcpListener::bind("127.0.0.1:99999");
        match listener.start().await {
            Err(ListenerError::Bind { addr, .. }) => assert_eq!(addr, "127.0.0.1:99999"),
            other => panic!("expected bind error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn addresses_report_resolved_ports() {
        let (mut listener, addr) = started(DEFAULT_MAX_REQUEST_SIZE).await;
        assert_eq!(listener.addresses(), vec![addr.to_string()]);
        listener.stop().await;
    }
}
