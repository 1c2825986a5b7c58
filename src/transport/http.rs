//! The batch-HTTP transport buffers points and, once per interval, ships
//! everything buffered as a single JSON array in one HTTP request.
//!
//! Delivery is at-most-once: a request that fails or comes back with an
//! unexpected status is logged and the batch is discarded. The opposite
//! guarantee from the line transport: data loss is possible here and by
//! design.

use hyper;
use hyper::header::ContentType;
use metric::Point;
use serde_json;
use std::io::Read;
use std::str::FromStr;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use transport::{Backend, Transport, TransportError};

/// Configuration for `HttpTransport`.
#[derive(Clone, Debug, Deserialize)]
pub struct HttpConfig {
    /// Capacity of the bounded ingestion channel. Producers block when it
    /// is full.
    pub buffer_size: usize,
    /// Interval between batch requests, in milliseconds.
    pub batch_interval_ms: u64,
    /// Per-request read/write deadline, in milliseconds.
    pub request_timeout_ms: u64,
    /// HTTP method for the batch request.
    pub method: String,
    /// Path on the backend the batch is sent to.
    pub endpoint: String,
    /// The status code counting as a successful delivery.
    pub expected_status: u16,
}

impl Default for HttpConfig {
    fn default() -> HttpConfig {
        HttpConfig {
            buffer_size: 1_024,
            batch_interval_ms: 10_000,
            request_timeout_ms: 5_000,
            method: "POST".to_string(),
            endpoint: "api/put".to_string(),
            expected_status: 204,
        }
    }
}

impl HttpConfig {
    fn validate(&self) -> Result<hyper::method::Method, TransportError> {
        if self.buffer_size == 0 {
            return Err(TransportError::Config(
                "buffer_size must be greater than zero".to_string(),
            ));
        }
        if self.batch_interval_ms == 0 {
            return Err(TransportError::Config(
                "batch_interval_ms must be a positive duration".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(TransportError::Config(
                "request_timeout_ms must be a positive duration".to_string(),
            ));
        }
        if self.expected_status < 100 || self.expected_status >= 600 {
            return Err(TransportError::Config(format!(
                "expected_status {} is not a status code",
                self.expected_status
            )));
        }
        hyper::method::Method::from_str(&self.method)
            .map_err(|_| TransportError::Config(format!("invalid method {:?}", self.method)))
    }
}

/// The batched HTTP/JSON transport. See the module docs for the delivery
/// guarantee.
pub struct HttpTransport {
    config: HttpConfig,
    tx: Option<mpsc::SyncSender<Point>>,
    handle: Option<thread::JoinHandle<()>>,
}

struct HttpSender {
    url: String,
    method: hyper::method::Method,
    expected_status: u16,
    batch_interval: Duration,
    client: hyper::Client,
}

impl HttpSender {
    /// Accumulate arrivals between ticks; on each tick drain whatever else
    /// is immediately available and ship the lot as one request. Channel
    /// closure triggers one final drain-and-ship before exit.
    fn run(self, rx: mpsc::Receiver<Point>) {
        let mut pending: Vec<Point> = Vec::new();
        let mut deadline = Instant::now() + self.batch_interval;
        let mut closed = false;
        loop {
            let now = Instant::now();
            if !closed && now < deadline {
                match rx.recv_timeout(deadline - now) {
                    Ok(point) => {
                        pending.push(point);
                        continue;
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => {
                        closed = true;
                    }
                }
            }
            // Tick. Non-blocking drain: never wait for new arrivals here.
            while let Ok(point) = rx.try_recv() {
                pending.push(point);
            }
            if !pending.is_empty() {
                self.transfer_data(&pending);
                pending.clear();
            }
            if closed {
                break;
            }
            deadline = Instant::now() + self.batch_interval;
        }
        debug!("http sender for {} exiting", self.url);
    }

    /// One request, one chance. Failures are logged and the batch dropped.
    fn transfer_data(&self, batch: &[Point]) {
        let body = match serde_json::to_string(batch) {
            Ok(body) => body,
            Err(e) => {
                error!("unable to serialize batch of {} points: {}", batch.len(), e);
                return;
            }
        };
        let res = self.client
            .request(self.method.clone(), self.url.as_str())
            .header(ContentType::json())
            .body(body.as_str())
            .send();
        match res {
            Ok(mut resp) => {
                let status = resp.status.to_u16();
                if status == self.expected_status {
                    debug!("delivered {} points to {}", batch.len(), self.url);
                } else {
                    let mut resp_body = String::new();
                    let _ = resp.read_to_string(&mut resp_body);
                    error!(
                        "backend {} answered status {} (expected {}), dropping {} points: {}",
                        self.url,
                        status,
                        self.expected_status,
                        batch.len(),
                        resp_body
                    );
                }
            }
            Err(e) => {
                error!(
                    "request to {} failed, dropping {} points: {}",
                    self.url,
                    batch.len(),
                    e
                );
            }
        }
    }
}

impl HttpTransport {
    /// Make a new HttpTransport
    ///
    /// Validates the configuration; the transport is inert until
    /// `configure_backend` aims it.
    pub fn new(config: HttpConfig) -> Result<HttpTransport, TransportError> {
        config.validate()?;
        Ok(HttpTransport {
            config: config,
            tx: None,
            handle: None,
        })
    }
}

impl Transport for HttpTransport {
    fn configure_backend(&mut self, backend: &Backend) -> Result<(), TransportError> {
        if self.tx.is_some() {
            return Err(TransportError::Config(
                "backend already configured".to_string(),
            ));
        }
        if backend.host.is_empty() {
            return Err(TransportError::Config("host can not be empty".to_string()));
        }
        let method = self.config.validate()?;
        let url = format!(
            "http://{}:{}/{}",
            backend.host,
            backend.port,
            self.config.endpoint.trim_left_matches('/')
        );
        let mut client = hyper::Client::new();
        let request_timeout = Duration::from_millis(self.config.request_timeout_ms);
        client.set_read_timeout(Some(request_timeout));
        client.set_write_timeout(Some(request_timeout));
        let sender = HttpSender {
            url: url,
            method: method,
            expected_status: self.config.expected_status,
            batch_interval: Duration::from_millis(self.config.batch_interval_ms),
            client: client,
        };
        let (tx, rx) = mpsc::sync_channel(self.config.buffer_size);
        self.handle = Some(thread::spawn(move || sender.run(rx)));
        self.tx = Some(tx);
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
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("http sender thread panicked during shutdown");
            }
        }
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.close();
    }
}
