use std::fmt;

/// The state of a [`Server`](super::Server), observable through
/// [`Server::lifecycle`](super::Server::lifecycle).
///
/// ```text
/// Created ─▶ Starting ─▶ Listening ─▶ Draining ─▶ Stopped
///               │            │
///               └────────────┴─▶ Faulted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Built but not yet running.
    Created,
    /// Running startup hooks and starting the listener.
    Starting,
    /// Accepting and dispatching requests.
    Listening,
    /// Shutdown requested; no new requests, in-flight ones finishing.
    Draining,
    /// Drained and shutdown hooks run.
    Stopped,
    /// A startup hook, the listener start, or `accept` failed.
    Faulted,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Listening => "listening",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
            Self::Faulted => "faulted",
        }
    }

    /// `Stopped` and `Faulted` are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Faulted)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
