//! A buffered client for sending metrics to a [StatsD][statsd]-compatible server.
//!
//! [statsd]: https://github.com/statsd/statsd/blob/master/docs/metric_types.md
//!
//! # Usage
//!
//! ```no_run
//! # use std::time::Duration;
//! # use metrics_statsd_client::{StatsdBuilder, TagFormat};
//! // First, create a builder.
//! //
//! // The builder configures where metrics are sent to, how they are batched, and what is sent along with every
//! // metric, such as a prefix or a set of tags.
//! let client = StatsdBuilder::default()
//!     .with_remote_address("udp://127.0.0.1:8125")
//!     .expect("address should be valid")
//!     .with_prefix("app")
//!     .with_tag_format(TagFormat::Datadog)
//!     .with_tags([("env", "production")])
//!     .build()
//!     .expect("failed to build client");
//!
//! // Sending a metric only encodes it into a buffer. Buffers are written out in the background.
//! client.increment("requests");
//! client.gauge("queue_depth", 42);
//! client.timing("request_time", 12);
//!
//! let timing = client.new_timing();
//! // ...
//! timing.send("work_time");
//!
//! // Clients can be cloned and derived cheaply. They all share the same buffer and connection.
//! let db = client.with_prefix("db").with_tags([("pool", "primary")]);
//! db.count("rows_read", 128);
//!
//! // Closing the client writes out whatever is still buffered.
//! client.close().expect("failed to flush metrics");
//! ```
//!
//! The client can also be installed as the global recorder for the [`metrics`] crate, which sends everything recorded
//! through its macros to the StatsD server:
//!
//! ```no_run
//! # use metrics_statsd_client::StatsdBuilder;
//! let client = StatsdBuilder::default().install().expect("failed to install recorder");
//!
//! metrics::counter!("requests", "method" => "GET").increment(1);
//! ```
//!
//! # Features
//!
//! ## Batching
//!
//! Metrics are encoded into one of two buffers as they are sent. Once a buffer holds more than the configured maximum
//! packet size, writers switch over to the other buffer while the full one is written out in a single payload. A
//! background thread also writes out both buffers at a fixed interval, so that metrics are never held back for long.
//!
//! Sending a metric never takes a lock: writers claim a buffer through an atomic state transition, and a metric is
//! always written to a single buffer in full, so payloads only ever contain complete lines.
//!
//! ## Transports
//!
//! Metrics can be sent over UDP or TCP, and on Unix, over Unix domain sockets in either `SOCK_DGRAM` or `SOCK_STREAM`
//! mode. Connections are reopened after write failures, and stream connections retry a failed write once on a fresh
//! connection. A custom [`Dialer`] can be provided to send metrics through some other channel entirely.
//!
//! ## Tags
//!
//! Tags can be sent in either the InfluxDB or the Datadog format. See [`TagFormat`].
//!
//! ## Sampling
//!
//! A sample rate can be configured to only send a fraction of metrics. Counts, timings and histograms are annotated with
//! the sample rate so that the server can scale them back up.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

mod buffer;

mod builder;
pub use self::builder::{BuildError, OverflowPolicy, StatsdBuilder};

mod client;
pub use self::client::{Client, Timing};

mod encoder;
pub use self::encoder::{join_tags, Number, TagFormat};

mod error;
pub use self::error::{Error, ErrorHandler};

mod forwarder;
pub use self::forwarder::{
    transport::{Connection, Dialer, SocketDialer},
    RemoteAddr,
};

mod recorder;
pub use self::recorder::StatsdRecorder;

mod state;
mod storage;

#[cfg(test)]
mod test_util;
