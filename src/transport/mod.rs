//! Transports deliver batches of serialized points to the backend. A
//! transport owns a bounded ingestion channel and exactly one background
//! sender thread that drains it; the channel's capacity is the pipeline's
//! backpressure valve. Two implementations exist: `LineTransport` speaks
//! the telnet-style `put` protocol over a persistent TCP connection and
//! `HttpTransport` POSTs JSON batches on a timer.

use metric::Point;
use std::error;
use std::fmt;
use std::sync::mpsc;

mod http;
mod line;

pub use self::http::{HttpConfig, HttpTransport};
pub use self::line::{LineConfig, LineTransport};

/// The remote time-series ingestion endpoint.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Backend {
    /// Hostname or address of the backend.
    pub host: String,
    /// TCP port of the backend.
    pub port: u16,
}

impl Backend {
    /// Make a new Backend.
    pub fn new<S>(host: S, port: u16) -> Backend
    where
        S: Into<String>,
    {
        Backend {
            host: host.into(),
            port: port,
        }
    }
}

/// Things that can go wrong inside a transport, other than the network
/// faults the transports absorb themselves.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportError {
    /// The transport's configuration failed validation. The transport was
    /// never started.
    Config(String),
    /// An operation needing a backend arrived before `configure_backend`.
    NotConfigured,
    /// The transport has been closed; no further points are accepted.
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TransportError::Config(ref what) => write!(f, "invalid configuration: {}", what),
            TransportError::NotConfigured => write!(f, "no backend configured"),
            TransportError::Closed => write!(f, "transport is closed"),
        }
    }
}

impl error::Error for TransportError {
    fn description(&self) -> &str {
        "transport error"
    }
}

/// A 'transport' is a delivery vehicle for points.
///
/// Lifecycle: construct with a validated config, `configure_backend` once
/// to aim it and start its sender thread, `enqueue` from as many producer
/// threads as you like, `close` exactly once when done. `close` is
/// idempotent and a closed transport rejects further points.
pub trait Transport: Send {
    /// Aim the transport at a backend and start its sender thread. For the
    /// line transport this blocks until a first connection is established.
    fn configure_backend(&mut self, backend: &Backend) -> Result<(), TransportError>;

    /// A handle on the bounded ingestion channel. The flattener holds one
    /// of these to forward reduced points.
    fn sender(&self) -> Result<mpsc::SyncSender<Point>, TransportError>;

    /// Queue a point for delivery. Blocks while the ingestion channel is
    /// full: backpressure, not loss.
    fn enqueue(&self, point: Point) -> Result<(), TransportError> {
        let tx = self.sender()?;
        tx.send(point).map_err(|_| TransportError::Closed)
    }

    /// Stop accepting points, let the sender thread drain what is buffered
    /// and join it.
    fn close(&mut self);
}
