//! The flattener reduces bursts of same-identity measurements to one value
//! per cycle, bounding the volume of data pushed at the transport. Identity
//! is the fingerprint of (operation, metric, tags); every cycle each
//! fingerprint's buffered values collapse to a single number according to
//! the fingerprint's operation.

use fingerprint::{hex_digest, HashError, HashParam, KeyHasher};
use metric::{NumberPoint, Point};
use std::collections::HashMap;
use std::error;
use std::fmt;
use std::mem;
use std::str::FromStr;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How a fingerprint's buffered values reduce to one number per cycle.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Operation {
    /// Arithmetic mean of the buffered values.
    Avg,
    /// Running total of the buffered values.
    Sum,
    /// Number of buffered occurrences; the values themselves are ignored.
    Count,
    /// Largest buffered value; ties keep the first seen.
    Max,
    /// Smallest buffered value; ties keep the first seen.
    Min,
}

impl Operation {
    /// The identifier used in fingerprints and configuration.
    pub fn id(&self) -> &'static str {
        match *self {
            Operation::Avg => "avg",
            Operation::Sum => "sum",
            Operation::Count => "count",
            Operation::Max => "max",
            Operation::Min => "min",
        }
    }

    fn reduce(&self, values: &[f64]) -> Result<f64, FlattenError> {
        let first = match values.first() {
            Some(first) => *first,
            None => return Err(FlattenError::EmptyEntry),
        };
        let res = match *self {
            Operation::Avg => values.iter().sum::<f64>() / (values.len() as f64),
            Operation::Sum => values.iter().sum(),
            Operation::Count => values.len() as f64,
            Operation::Max => values[1..]
                .iter()
                .fold(first, |acc, &v| if v > acc { v } else { acc }),
            Operation::Min => values[1..]
                .iter()
                .fold(first, |acc, &v| if v < acc { v } else { acc }),
        };
        Ok(res)
    }
}

impl FromStr for Operation {
    type Err = FlattenError;

    /// Parse an operation identifier. This is the edge where unsupported
    /// operation codes are rejected.
    fn from_str(s: &str) -> Result<Operation, FlattenError> {
        match s {
            "avg" => Ok(Operation::Avg),
            "sum" => Ok(Operation::Sum),
            "count" => Ok(Operation::Count),
            "max" => Ok(Operation::Max),
            "min" => Ok(Operation::Min),
            _ => Err(FlattenError::UnsupportedOperation(s.to_string())),
        }
    }
}

/// Things that can go wrong while flattening.
#[derive(Clone, Debug, PartialEq)]
pub enum FlattenError {
    /// The flattener's configuration failed validation.
    Config(String),
    /// An operation identifier named no known operation.
    UnsupportedOperation(String),
    /// The injected hasher rejected the point's identity parameters.
    Hash(HashError),
    /// An aggregation entry held no values. Cannot happen through `add`;
    /// if seen the entry is dropped and the flush continues.
    EmptyEntry,
    /// The flattener has been closed; no further points are accepted.
    Closed,
}

impl fmt::Display for FlattenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            FlattenError::Config(ref what) => write!(f, "invalid configuration: {}", what),
            FlattenError::UnsupportedOperation(ref op) => {
                write!(f, "unsupported operation: {}", op)
            }
            FlattenError::Hash(ref e) => write!(f, "unable to fingerprint point: {}", e),
            FlattenError::EmptyEntry => write!(f, "aggregation entry held no values"),
            FlattenError::Closed => write!(f, "flattener is closed"),
        }
    }
}

impl error::Error for FlattenError {
    fn description(&self) -> &str {
        "flatten error"
    }
}

impl From<HashError> for FlattenError {
    fn from(e: HashError) -> FlattenError {
        FlattenError::Hash(e)
    }
}

/// A point pending aggregation: the operation to reduce under plus the
/// NumberPoint that carries the identity fields and the value. The point
/// rides through aggregation as opaque payload; the first one seen for a
/// fingerprint supplies the metadata on the flushed output.
#[derive(Clone, Debug, PartialEq)]
pub struct FlattenerPoint {
    /// The reduction operation for this point's fingerprint.
    pub operation: Operation,
    /// The measurement itself.
    pub point: NumberPoint,
}

impl FlattenerPoint {
    /// Make a new FlattenerPoint.
    pub fn new(operation: Operation, point: NumberPoint) -> FlattenerPoint {
        FlattenerPoint {
            operation: operation,
            point: point,
        }
    }

    fn fingerprint(&self, hasher: &KeyHasher) -> Result<String, HashError> {
        let mut params = Vec::with_capacity(2 + self.point.tags.len() * 2);
        params.push(HashParam::Str(self.operation.id()));
        params.push(HashParam::Str(&self.point.metric));
        // TagMap iterates in key order, so fingerprints are insensitive to
        // tag insertion order.
        for &(ref k, ref v) in self.point.tags.iter() {
            params.push(HashParam::Str(k));
            params.push(HashParam::Str(v));
        }
        let digest = hasher.digest(&params)?;
        Ok(hex_digest(&digest))
    }
}

/// One fingerprint's buffered state within the current cycle.
#[derive(Clone, Debug)]
struct AggregationEntry {
    operation: Operation,
    point: NumberPoint,
    values: Vec<f64>,
}

/// Configuration for `Flattener`.
#[derive(Clone, Debug, Deserialize)]
pub struct FlattenerConfig {
    /// Length of the aggregation window, in milliseconds.
    pub cycle_ms: u64,
}

impl Default for FlattenerConfig {
    fn default() -> FlattenerConfig {
        FlattenerConfig { cycle_ms: 1_000 }
    }
}

type Table = HashMap<String, AggregationEntry>;

/// The aggregation engine. One background loop flushes the table every
/// cycle; `add` may be called from arbitrarily many threads.
pub struct Flattener {
    table: Arc<Mutex<Table>>,
    hasher: Arc<KeyHasher + Send + Sync>,
    stop: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

/// Swap the table for a fresh one, reduce every drained entry and forward
/// the results. Forwarding blocks while the transport's channel is full, so
/// backpressure propagates from the transport to this loop, never to `add`.
fn flush(table: &Mutex<Table>, tx: &mpsc::SyncSender<Point>) {
    let drained = {
        let mut guard = match table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        mem::replace(&mut *guard, Table::new())
    };
    for (fingerprint, entry) in drained {
        match entry.operation.reduce(&entry.values) {
            Ok(value) => {
                let mut point = entry.point;
                point.value = value;
                if tx.send(Point::Number(point)).is_err() {
                    error!("transport channel closed, dropping flushed points");
                    return;
                }
            }
            Err(e) => {
                // Drop the one bad entry, keep flushing the rest.
                error!("unable to reduce entry {}: {}", fingerprint, e);
            }
        }
    }
}

impl Flattener {
    /// Make a new Flattener
    ///
    /// Validates the configuration and starts the flush loop. `tx` is the
    /// downstream transport's ingestion handle.
    pub fn new(
        config: FlattenerConfig,
        hasher: Arc<KeyHasher + Send + Sync>,
        tx: mpsc::SyncSender<Point>,
    ) -> Result<Flattener, FlattenError> {
        if config.cycle_ms == 0 {
            return Err(FlattenError::Config(
                "cycle_ms must be a positive duration".to_string(),
            ));
        }
        let cycle = Duration::from_millis(config.cycle_ms);
        let table: Arc<Mutex<Table>> = Arc::new(Mutex::new(Table::new()));
        let loop_table = Arc::clone(&table);
        let (stop_tx, stop_rx) = mpsc::channel();
        let handle = thread::spawn(move || loop {
            match stop_rx.recv_timeout(cycle) {
                Err(mpsc::RecvTimeoutError::Timeout) => flush(&loop_table, &tx),
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    // Final flush so nothing buffered is stranded.
                    flush(&loop_table, &tx);
                    break;
                }
            }
        });
        Ok(Flattener {
            table: table,
            hasher: hasher,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Buffer a point into the current cycle.
    ///
    /// The first point seen for a fingerprint seeds the entry; later points
    /// append their values. Never blocks on I/O or channel space, the only
    /// synchronization being a short critical section on the table, and is
    /// safe to call from arbitrarily many producer threads concurrently.
    pub fn add(&self, point: FlattenerPoint) -> Result<(), FlattenError> {
        if self.stop.is_none() {
            return Err(FlattenError::Closed);
        }
        let fingerprint = point.fingerprint(&*self.hasher)?;
        let mut guard = match self.table.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let value = point.point.value;
        let entry = guard.entry(fingerprint).or_insert_with(|| AggregationEntry {
            operation: point.operation,
            point: point.point,
            values: Vec::new(),
        });
        entry.values.push(value);
        Ok(())
    }

    /// Stop the flush loop after one final flush. Idempotent. Does not
    /// close the transport; the manager owns that ordering.
    pub fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            // An Err means the loop already exited; either way it is down.
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("flattener flush loop panicked during shutdown");
            }
        }
    }
}

impl Drop for Flattener {
    fn drop(&mut self) {
        self.close();
    }
}
