//! Emissary is a telemetry emission pipeline. It accepts individual
//! measurement points from many concurrent producers, optionally flattens
//! points that share an identity within a time window down to a single
//! aggregate value and delivers batches of points to a remote time-series
//! backend. Two wire protocols are supported: a line-oriented telnet `put`
//! protocol over a persistent TCP connection and a batched JSON protocol
//! over HTTP.
//!
//! The pieces, leaves first:
//!
//!  * `fingerprint`: the hash capability used to group points by identity.
//!  * `metric`: the point model and its tag map.
//!  * `transport`: delivery of serialized batches, line or batch-HTTP.
//!  * `flattener`: per-cycle reduction of same-identity points.
//!  * `manager`: the producer-facing façade that ties the above together.
//!
//! Delivery guarantees differ by transport. The line transport reconnects
//! and resends forever, giving at-least-once delivery with the possibility
//! of duplicates. The batch-HTTP transport discards a batch on any delivery
//! failure, giving at-most-once. Callers pick their poison.
#![deny(trivial_numeric_casts, missing_docs, unstable_features, unused_import_braces)]
extern crate byteorder;
extern crate chrono;
extern crate hyper;
extern crate seahash;
extern crate serde;
extern crate serde_json;

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

#[cfg(test)]
extern crate quickcheck;

pub mod fingerprint;
pub mod flattener;
pub mod manager;
pub mod metric;
pub mod time;
pub mod transport;
