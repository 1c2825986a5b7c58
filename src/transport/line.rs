//! The line transport speaks the telnet-style `put` protocol over one
//! persistent TCP connection:
//!
//! ```text
//! put <metric> <unix-seconds> <value> <tag1>=<val1> <tag2>=<val2>\n
//! ```
//!
//! Delivery is at-least-once: a payload is retried, across reconnects,
//! until a write succeeds or the transport is closed while the connection
//! is broken. Duplicates are possible when a write reaches the backend but
//! the connection is judged dead anyway; dedupe downstream if that matters
//! to you.

use metric::Point;
use std::cmp;
use std::io;
use std::io::{Read, Write as IoWrite};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::string;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use transport::{Backend, Transport, TransportError};

/// Configuration for `LineTransport`.
#[derive(Clone, Debug, Deserialize)]
pub struct LineConfig {
    /// Capacity of the bounded ingestion channel. Producers block when it
    /// is full.
    pub buffer_size: usize,
    /// Write deadline per payload, in milliseconds.
    pub request_timeout_ms: u64,
    /// Read deadline of the pre-write liveness probe, in milliseconds.
    /// Keep this short; it is paid before every write.
    pub max_read_timeout_ms: u64,
    /// Sleep between connection attempts, in milliseconds.
    pub reconnection_timeout_ms: u64,
}

impl Default for LineConfig {
    fn default() -> LineConfig {
        LineConfig {
            buffer_size: 1_024,
            request_timeout_ms: 5_000,
            max_read_timeout_ms: 100,
            reconnection_timeout_ms: 3_000,
        }
    }
}

impl LineConfig {
    fn validate(&self) -> Result<(), TransportError> {
        if self.buffer_size == 0 {
            return Err(TransportError::Config(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        for &(name, ms) in &[
            ("request_timeout_ms", self.request_timeout_ms),
            ("max_read_timeout_ms", self.max_read_timeout_ms),
            ("reconnection_timeout_ms", self.reconnection_timeout_ms),
        ] {
            if ms == 0 {
                return Err(TransportError::Config(format!(
                    "{} must be a positive duration",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// The telnet/TCP transport. See the module docs for the wire format and
/// delivery guarantee.
pub struct LineTransport {
    config: LineConfig,
    tx: Option<mpsc::SyncSender<Point>>,
    stop: Option<Arc<AtomicBool>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[inline]
fn fmt_tags(tags: &::metric::TagMap, s: &mut String) {
    let mut iter = tags.iter();
    if let Some(&(ref fk, ref fv)) = iter.next() {
        s.push_str(fk);
        s.push_str("=");
        s.push_str(fv);
        for &(ref k, ref v) in iter {
            s.push_str(" ");
            s.push_str(k);
            s.push_str("=");
            s.push_str(v);
        }
    }
}

#[inline]
fn get_from_cache<T>(cache: &mut Vec<(T, String)>, val: T) -> &str
where
    T: cmp::PartialOrd + string::ToString + Copy,
{
    match cache.binary_search_by(|probe| probe.0.partial_cmp(&val).unwrap()) {
        Ok(idx) => &cache[idx].1,
        Err(idx) => {
            let str_val = val.to_string();
            cache.insert(idx, (val, str_val));
            get_from_cache(cache, val)
        }
    }
}

/// Serialize a batch into `put` lines. Text points have no expression in
/// this protocol and neither do non-finite values; both are logged and
/// skipped.
fn format_batch(batch: &[Point]) -> String {
    let mut time_cache: Vec<(i64, String)> = Vec::with_capacity(128);
    let mut value_cache: Vec<(f64, String)> = Vec::with_capacity(128);
    let mut tag_buf = String::with_capacity(1_024);
    let mut payload = String::with_capacity(8_192);
    for point in batch {
        match *point {
            Point::Number(ref p) => {
                // NaN would also panic the value cache's ordering.
                if !p.value.is_finite() {
                    error!(
                        "non-finite value {} for {}, dropping",
                        p.value, p.metric
                    );
                    continue;
                }
                payload.push_str("put ");
                payload.push_str(&p.metric);
                payload.push_str(" ");
                payload.push_str(get_from_cache(&mut time_cache, p.timestamp));
                payload.push_str(" ");
                payload.push_str(get_from_cache(&mut value_cache, p.value));
                if !p.tags.is_empty() {
                    payload.push_str(" ");
                    fmt_tags(&p.tags, &mut tag_buf);
                    payload.push_str(&tag_buf);
                    tag_buf.clear();
                }
                payload.push_str("\n");
            }
            Point::Text(ref p) => {
                error!(
                    "line protocol cannot carry text point {}, dropping",
                    p.metric
                );
            }
        }
    }
    payload
}

fn connect(host: &str, port: u16) -> Option<TcpStream> {
    let addrs = (host, port).to_socket_addrs();
    match addrs {
        Ok(srv) => {
            let ips: Vec<_> = srv.collect();
            for ip in ips {
                match TcpStream::connect(ip) {
                    Ok(stream) => return Some(stream),
                    Err(e) => info!(
                        "Unable to connect to backend at {} using addr {} with error {}",
                        host, ip, e
                    ),
                }
            }
            None
        }
        Err(e) => {
            info!(
                "Unable to perform DNS lookup on host {} with error {}",
                host, e
            );
            None
        }
    }
}

/// Loop on `connect` until it succeeds or `stop` is raised, sleeping
/// `reconnection_timeout` between rounds. `None` means the transport is
/// closing and the caller should give up.
fn retry_connect(
    host: &str,
    port: u16,
    reconnection_timeout: Duration,
    stop: &AtomicBool,
) -> Option<TcpStream> {
    while !stop.load(Ordering::Relaxed) {
        debug!("connecting to {}:{}", host, port);
        if let Some(stream) = connect(host, port) {
            info!("connected to {}:{}", host, port);
            return Some(stream);
        }
        thread::sleep(reconnection_timeout);
    }
    None
}

/// One write attempt, preceded by a liveness probe.
///
/// The probe is a short-deadline read: against a healthy, quiet connection
/// it times out, a peer FIN reads `Ok(0)` and a RST surfaces as an error.
/// It is a best-effort heuristic for catching half-closed connections
/// before wasting a write on them, not a correctness guarantee: a write
/// that already reached the backend may be retried after a misclassified
/// probe.
fn write_payload(
    stream: &mut TcpStream,
    payload: &[u8],
    max_read_timeout: Duration,
    request_timeout: Duration,
) -> io::Result<()> {
    stream.set_read_timeout(Some(max_read_timeout))?;
    let mut probe = [0u8; 64];
    match stream.read(&mut probe) {
        Ok(0) => {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "peer closed connection",
            ))
        }
        // Unsolicited chatter from the backend, ignored.
        Ok(_) => {}
        Err(ref e)
            if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {}
        Err(e) => return Err(e),
    }
    stream.set_write_timeout(Some(request_timeout))?;
    stream.write_all(payload)
}

struct LineSender {
    stream: TcpStream,
    host: String,
    port: u16,
    request_timeout: Duration,
    max_read_timeout: Duration,
    reconnection_timeout: Duration,
    stop: Arc<AtomicBool>,
}

impl LineSender {
    /// Drain the ingestion channel until it closes, shipping each batch
    /// with `transfer_data`. Exactly one of these runs per transport, so
    /// the socket never sees concurrent writers.
    fn run(mut self, rx: mpsc::Receiver<Point>) {
        loop {
            let point = match rx.recv() {
                Ok(point) => point,
                // Channel closed and empty: drained, we are done.
                Err(_) => break,
            };
            let mut batch = vec![point];
            while let Ok(point) = rx.try_recv() {
                batch.push(point);
            }
            let payload = format_batch(&batch);
            if payload.is_empty() {
                continue;
            }
            self.transfer_data(payload.as_bytes());
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        debug!("line sender for {}:{} exiting", self.host, self.port);
    }

    /// Deliver one payload, retrying across reconnects until a write
    /// succeeds. At-least-once, with one exception: a close that arrives
    /// while the connection is broken abandons the payload rather than
    /// holding shutdown hostage to an unreachable backend. A healthy
    /// connection always gets its write attempt, so a normal close still
    /// drains everything buffered.
    fn transfer_data(&mut self, payload: &[u8]) {
        let mut attempts: u32 = 0;
        loop {
            match write_payload(
                &mut self.stream,
                payload,
                self.max_read_timeout,
                self.request_timeout,
            ) {
                Ok(()) => {
                    if attempts > 0 {
                        info!(
                            "payload delivered to {}:{} after {} failed attempts",
                            self.host, self.port, attempts
                        );
                    }
                    return;
                }
                Err(e) => {
                    error!(
                        "connection to {}:{} broken with error {}, reconnecting",
                        self.host, self.port, e
                    );
                    let _ = self.stream.shutdown(Shutdown::Both);
                    attempts = attempts.saturating_add(1);
                    self.stream = match retry_connect(
                        &self.host,
                        self.port,
                        self.reconnection_timeout,
                        &self.stop,
                    ) {
                        Some(stream) => stream,
                        None => {
                            error!(
                                "transport closing, abandoning payload for {}:{}",
                                self.host, self.port
                            );
                            return;
                        }
                    };
                }
            }
        }
    }
}

impl LineTransport {
    /// Make a new LineTransport
    ///
    /// Validates the configuration; the transport is inert until
    /// `configure_backend` aims it.
    pub fn new(config: LineConfig) -> Result<LineTransport, TransportError> {
        config.validate()?;
        Ok(LineTransport {
            config: config,
            tx: None,
            stop: None,
            handle: None,
        })
    }
}

impl Transport for LineTransport {
    /// Establish the first connection, blocking and retrying forever, then
    /// start the sender thread.
    fn configure_backend(&mut self, backend: &Backend) -> Result<(), TransportError> {
        if self.tx.is_some() {
            return Err(TransportError::Config(
                "backend already configured".to_string(),
            ));
        }
        if backend.host.is_empty() {
            return Err(TransportError::Config("host can not be empty".to_string()));
        }
        let reconnection_timeout = Duration::from_millis(self.config.reconnection_timeout_ms);
        let stop = Arc::new(AtomicBool::new(false));
        // The stop flag is freshly lowered, so this cannot come back None.
        let stream = retry_connect(&backend.host, backend.port, reconnection_timeout, &stop)
            .ok_or(TransportError::Closed)?;
        let (tx, rx) = mpsc::sync_channel(self.config.buffer_size);
        let sender = LineSender {
            stream: stream,
            host: backend.host.clone(),
            port: backend.port,
            request_timeout: Duration::from_millis(self.config.request_timeout_ms),
            max_read_timeout: Duration::from_millis(self.config.max_read_timeout_ms),
            reconnection_timeout: reconnection_timeout,
            stop: Arc::clone(&stop),
        };
        self.handle = Some(thread::spawn(move || sender.run(rx)));
        self.tx = Some(tx);
        self.stop = Some(stop);
        Ok(())
    }

    fn sender(&self) -> Result<mpsc::SyncSender<Point>, TransportError> {
        match self.tx {
            Some(ref tx) => Ok(tx.clone()),
            None => Err(TransportError::NotConfigured),
        }
    }

    fn close(&mut self) {
        self.tx = None;
        // Raised before the join so a sender stuck reconnecting gives up
        // instead of holding the join forever.
        if let Some(stop) = self.stop.take() {
            stop.store(true, Ordering::Relaxed);
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("line sender thread panicked during shutdown");
            }
        }
    }
}

impl Drop for LineTransport {
    fn drop(&mut self) {
        self.close();
    }
}
