//! The manager is the producer-facing façade over the pipeline. It
//! validates points, applies the configured default tags and routes each
//! point either straight to the transport or through the flattener when the
//! caller asks for aggregation. It also owns lifecycle: one `shutdown` call
//! winds down the flattener first, so its final flush still reaches the
//! transport, and the transport second.

use fingerprint::{KeyHasher, SeaKeyHasher};
use flattener::{FlattenError, Flattener, FlattenerConfig, FlattenerPoint, Operation};
use metric::{NumberPoint, Point, TagMap};
use std::error;
use std::fmt;
use std::sync::Arc;
use transport::{Backend, Transport, TransportError};

/// Configuration for `Manager`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ManagerConfig {
    /// The backend the transport is aimed at.
    pub backend: Option<Backend>,
    /// Tags overlaid onto every point before send. On a key collision the
    /// default wins: last-write-wins, with defaults applied last.
    pub default_tags: TagMap,
    /// Aggregation window configuration. `None` disables the flattener and
    /// with it `send_aggregated`.
    pub flattener: Option<FlattenerConfig>,
}

/// Things that can go wrong at the manager's edge.
#[derive(Clone, Debug, PartialEq)]
pub enum ManagerError {
    /// Constructed without a transport.
    NoTransport,
    /// Constructed without a backend address.
    NoBackend,
    /// `send_aggregated` was called but no flattener was configured.
    NoFlattener,
    /// The point had no metric name.
    EmptyPoint,
    /// A transport-level failure.
    Transport(TransportError),
    /// A flattener-level failure.
    Flatten(FlattenError),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ManagerError::NoTransport => write!(f, "no transport configured"),
            ManagerError::NoBackend => write!(f, "no backend configured"),
            ManagerError::NoFlattener => write!(f, "no flattener configured"),
            ManagerError::EmptyPoint => write!(f, "point has no metric name"),
            ManagerError::Transport(ref e) => write!(f, "transport: {}", e),
            ManagerError::Flatten(ref e) => write!(f, "flattener: {}", e),
        }
    }
}

impl error::Error for ManagerError {
    fn description(&self) -> &str {
        "manager error"
    }
}

impl From<TransportError> for ManagerError {
    fn from(e: TransportError) -> ManagerError {
        ManagerError::Transport(e)
    }
}

impl From<FlattenError> for ManagerError {
    fn from(e: FlattenError) -> ManagerError {
        ManagerError::Flatten(e)
    }
}

/// The pipeline façade. See the module docs.
pub struct Manager {
    // Field order matters: on a plain drop the flattener must go down
    // before the transport, or the transport would wait on a sender thread
    // whose channel the flattener still holds open.
    flattener: Option<Flattener>,
    transport: Box<Transport>,
    default_tags: TagMap,
}

impl Manager {
    /// Make a new Manager with the default seahash fingerprinting.
    ///
    /// The transport is handed over un-aimed; the manager configures it
    /// against `config.backend`. For a line transport this blocks until a
    /// first connection is up. Fails with `ManagerError::NoTransport` when
    /// handed `None`.
    pub fn new(
        config: ManagerConfig,
        transport: Option<Box<Transport>>,
    ) -> Result<Manager, ManagerError> {
        Manager::with_hasher(config, transport, Arc::new(SeaKeyHasher))
    }

    /// Make a new Manager with a caller-supplied hash capability.
    pub fn with_hasher(
        config: ManagerConfig,
        transport: Option<Box<Transport>>,
        hasher: Arc<KeyHasher + Send + Sync>,
    ) -> Result<Manager, ManagerError> {
        let mut transport = match transport {
            Some(transport) => transport,
            None => return Err(ManagerError::NoTransport),
        };
        let backend = match config.backend {
            Some(ref backend) => backend,
            None => return Err(ManagerError::NoBackend),
        };
        transport.configure_backend(backend)?;
        let flattener = match config.flattener {
            Some(flattener_config) => {
                let tx = transport.sender()?;
                Some(Flattener::new(flattener_config, hasher, tx)?)
            }
            None => None,
        };
        info!(
            "manager up against {}:{}, flattening {}",
            backend.host,
            backend.port,
            if flattener.is_some() { "on" } else { "off" }
        );
        Ok(Manager {
            transport: transport,
            flattener: flattener,
            default_tags: config.default_tags,
        })
    }

    fn prepare(&self, point: &mut Point) -> Result<(), ManagerError> {
        if point.metric().is_empty() {
            return Err(ManagerError::EmptyPoint);
        }
        point.overlay_tags_from_map(&self.default_tags);
        Ok(())
    }

    /// Send a point straight to the transport, no aggregation. Blocks while
    /// the transport's ingestion channel is full.
    pub fn send<P>(&self, point: P) -> Result<(), ManagerError>
    where
        P: Into<Point>,
    {
        let mut point = point.into();
        self.prepare(&mut point)?;
        self.transport.enqueue(point)?;
        Ok(())
    }

    /// Send a numeric point through the flattener: it is buffered under its
    /// fingerprint and emerges once per cycle reduced per `operation`.
    /// Never blocks on the transport.
    pub fn send_aggregated(
        &self,
        operation: Operation,
        point: NumberPoint,
    ) -> Result<(), ManagerError> {
        let flattener = match self.flattener {
            Some(ref flattener) => flattener,
            None => return Err(ManagerError::NoFlattener),
        };
        let mut point = Point::Number(point);
        self.prepare(&mut point)?;
        let point = match point {
            Point::Number(p) => p,
            Point::Text(_) => unreachable!(),
        };
        flattener.add(FlattenerPoint::new(operation, point))?;
        Ok(())
    }

    /// Wind the pipeline down: flattener first, so its final flush reaches
    /// the transport, then the transport itself. Buffered points are
    /// drained before the transport's sender thread exits.
    pub fn shutdown(mut self) {
        if let Some(ref mut flattener) = self.flattener {
            flattener.close();
        }
        self.transport.close();
        info!("manager shut down");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use metric::TextPoint;
    use std::sync::mpsc;
    use std::time::Duration;

    /// A transport that hands everything it is asked to deliver out a side
    /// channel created before the manager takes ownership.
    struct MockTransport {
        backend: Option<Backend>,
        tx: mpsc::SyncSender<Point>,
        configured: bool,
    }

    impl MockTransport {
        fn new() -> (MockTransport, mpsc::Receiver<Point>) {
            let (tx, rx) = mpsc::sync_channel(64);
            let mock = MockTransport {
                backend: None,
                tx: tx,
                configured: false,
            };
            (mock, rx)
        }
    }

    impl Transport for MockTransport {
        fn configure_backend(&mut self, backend: &Backend) -> Result<(), TransportError> {
            self.backend = Some(backend.clone());
            self.configured = true;
            Ok(())
        }

        fn sender(&self) -> Result<mpsc::SyncSender<Point>, TransportError> {
            if self.configured {
                Ok(self.tx.clone())
            } else {
                Err(TransportError::NotConfigured)
            }
        }

        fn close(&mut self) {
            self.configured = false;
        }
    }

    fn config() -> ManagerConfig {
        let mut default_tags = TagMap::new();
        default_tags.insert("env", "prod");
        ManagerConfig {
            backend: Some(Backend::new("127.0.0.1", 4242)),
            default_tags: default_tags,
            flattener: None,
        }
    }

    fn manager(cfg: ManagerConfig) -> (Manager, mpsc::Receiver<Point>) {
        let (mock, rx) = MockTransport::new();
        let manager = Manager::new(cfg, Some(Box::new(mock))).unwrap();
        (manager, rx)
    }

    #[test]
    fn no_transport_is_an_error() {
        assert!(match Manager::new(config(), None) {
            Err(ManagerError::NoTransport) => true,
            _ => false,
        });
    }

    #[test]
    fn no_backend_is_an_error() {
        let mut cfg = config();
        cfg.backend = None;
        let (mock, _rx) = MockTransport::new();
        assert!(match Manager::new(cfg, Some(Box::new(mock))) {
            Err(ManagerError::NoBackend) => true,
            _ => false,
        });
    }

    #[test]
    fn empty_metric_is_an_error() {
        let (manager, _rx) = manager(config());
        assert_eq!(
            Err(ManagerError::EmptyPoint),
            manager.send(NumberPoint::new("", 1.0))
        );
    }

    #[test]
    fn passthrough_points_reach_the_transport() {
        let (manager, rx) = manager(config());
        manager
            .send(NumberPoint::new("cpu.idle", 98.5).timestamp(10))
            .unwrap();
        manager
            .send(TextPoint::new("deploy.note", "shipped").timestamp(11))
            .unwrap();
        match rx.try_recv().unwrap() {
            Point::Number(p) => assert_eq!("cpu.idle", p.metric),
            Point::Text(_) => panic!("expected the number point first"),
        }
        match rx.try_recv().unwrap() {
            Point::Text(p) => assert_eq!("shipped", p.text),
            Point::Number(_) => panic!("expected the text point second"),
        }
    }

    #[test]
    fn default_tags_override_caller_tags() {
        let (manager, rx) = manager(config());
        manager
            .send(NumberPoint::new("m", 1.0).overlay_tag("env", "dev"))
            .unwrap();
        let point = rx.try_recv().unwrap();
        assert_eq!(Some("prod"), point.tags().get("env"));
    }

    #[test]
    fn aggregation_without_flattener_is_an_error() {
        let (manager, _rx) = manager(config());
        assert_eq!(
            Err(ManagerError::NoFlattener),
            manager.send_aggregated(Operation::Sum, NumberPoint::new("m", 5.0))
        );
    }

    #[test]
    fn aggregated_points_emerge_reduced() {
        let mut cfg = config();
        // A cycle too long to fire mid-test; shutdown's final flush is the
        // only flush, so both adds land in the same cycle deterministically.
        cfg.flattener = Some(FlattenerConfig { cycle_ms: 3_600_000 });
        let (manager, rx) = manager(cfg);
        let a = NumberPoint::new("m", 5.0).timestamp(10).overlay_tag("a", "1");
        let b = NumberPoint::new("m", 3.0).timestamp(10).overlay_tag("a", "1");
        manager.send_aggregated(Operation::Sum, a).unwrap();
        manager.send_aggregated(Operation::Sum, b).unwrap();
        manager.shutdown();
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Point::Number(p) => {
                assert_eq!(8.0, p.value);
                // default tags were applied before aggregation
                assert_eq!(Some("prod"), p.tags.get("env"));
            }
            Point::Text(_) => panic!("flattener emitted a text point"),
        }
    }

    #[test]
    fn shutdown_flushes_the_flattener() {
        let mut cfg = config();
        cfg.flattener = Some(FlattenerConfig { cycle_ms: 3_600_000 });
        let (manager, rx) = manager(cfg);
        for _ in 0..4 {
            manager
                .send_aggregated(Operation::Count, NumberPoint::new("hits", 1.0).timestamp(7))
                .unwrap();
        }
        manager.shutdown();
        match rx.try_recv().unwrap() {
            Point::Number(p) => assert_eq!(4.0, p.value),
            Point::Text(_) => panic!("flattener emitted a text point"),
        }
    }
}
