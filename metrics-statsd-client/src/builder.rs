use std::{net::SocketAddr, sync::Arc, time::Duration};

use crossbeam_channel::bounded;
use thiserror::Error;
use tracing::debug;

use crate::{
    client::{Client, Forwarding, Shared},
    error::{default_error_handler, Error, ErrorHandler},
    forwarder::{
        scheduler::Forwarder,
        transport::{Dialer, SocketDialer},
        ForwarderConfiguration, RemoteAddr,
    },
    recorder::StatsdRecorder,
    state::{State, StateConfiguration},
    TagFormat,
};

const DEFAULT_MAX_PACKET_SIZE: usize = 1440;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

// Enough room for both slots to be waiting on the forwarder, plus a few flush requests.
const REQUEST_QUEUE_CAPACITY: usize = 8;

/// Errors that could occur while building or installing a StatsD client.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Failed to parse the remote address.
    #[error("invalid remote address: {reason}")]
    InvalidRemoteAddress {
        /// Details about the parsing failure.
        reason: String,
    },

    /// The maximum packet size is zero.
    #[error("maximum packet size must be greater than zero")]
    InvalidPacketSize,

    /// The sample rate is not within `(0, 1]`.
    #[error("invalid sample rate {rate} (expected a value greater than 0 and at most 1)")]
    InvalidSampleRate {
        /// The rejected sample rate.
        rate: f32,
    },

    /// Failed to spawn the background thread.
    #[error("failed to spawn background thread for forwarder")]
    Backend,

    /// Failed to install the recorder due to an existing global recorder already being installed.
    #[error("failed to install client as global recorder")]
    FailedToInstall,
}

/// What writers do when both buffers are waiting on the network.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait until a buffer frees up.
    #[default]
    Block,

    /// Drop the metric.
    ///
    /// Dropped metrics are counted, see [`Client::dropped_metrics`].
    Drop,
}

/// Builder for a StatsD client.
pub struct StatsdBuilder {
    remote_addr: RemoteAddr,
    max_packet_size: usize,
    flush_interval: Duration,
    timeout: Duration,
    tag_format: TagFormat,
    error_handler: ErrorHandler,
    sample_rate: f32,
    prefix: String,
    tags: Vec<(String, String)>,
    muted: bool,
    overflow: OverflowPolicy,
    dialer: Arc<dyn Dialer>,
    histograms_as_timings: bool,
    clock: quanta::Clock,
}

impl StatsdBuilder {
    /// Set the remote address to forward metrics to.
    ///
    /// The address is in the format of `<scheme>://<address>`. The scheme is one of `udp` or `tcp`, in which case the
    /// address is `<host>:<port>`, or on Unix, one of `unixgram` or `unix`, in which case the address is the path to a
    /// Unix domain socket in `SOCK_DGRAM` or `SOCK_STREAM` mode, respectively.
    ///
    /// Without a scheme, the address is sent to over UDP. A host can be left out, as in `:8125`, to mean the local
    /// host.
    ///
    /// Defaults to sending to `127.0.0.1:8125` over UDP.
    ///
    /// # Errors
    ///
    /// If the given address is not able to be parsed as a valid address, an error will be returned indicating the
    /// reason.
    pub fn with_remote_address<A>(mut self, addr: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        self.remote_addr = RemoteAddr::try_from(addr.as_ref())
            .map_err(|reason| BuildError::InvalidRemoteAddress { reason })?;
        Ok(self)
    }

    /// Set the maximum packet size.
    ///
    /// Metrics are buffered until they add up to more than this many bytes, and are then sent in a single write. The
    /// metric that pushes a buffer over the limit goes out with the next write, so writes stay within the limit unless
    /// a single metric is larger than it.
    ///
    /// For UDP, this should be kept below the MTU of the path to the server. The default is sized for an Ethernet MTU.
    ///
    /// Defaults to 1440 bytes.
    #[must_use]
    pub fn with_maximum_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Set the flush interval.
    ///
    /// Buffered metrics are sent at least this often, even if the buffer is not full. When set to zero, no background
    /// thread is spawned: full buffers are then sent by the thread that filled them, and everything else is only sent
    /// by [`Client::flush`] and [`Client::close`].
    ///
    /// Defaults to 100 milliseconds.
    #[must_use]
    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// Set the connect and write timeout.
    ///
    /// When a write times out, the payload being sent is dropped, and the error is passed to the error handler. A zero
    /// timeout disables write timeouts.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the tag format.
    ///
    /// Defaults to [`TagFormat::None`], where tags are never sent.
    #[must_use]
    pub fn with_tag_format(mut self, tag_format: TagFormat) -> Self {
        self.tag_format = tag_format;
        self
    }

    /// Set the error handler.
    ///
    /// Metrics are sent in the background, so failures to send them cannot be returned to the caller. Instead, they
    /// are passed to the error handler.
    ///
    /// Defaults to logging the error.
    #[must_use]
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Set the sample rate.
    ///
    /// Only this fraction of metrics is sent, picked at random. Counts, timings and histograms are annotated with the
    /// sample rate so that the server can scale them back up.
    ///
    /// Defaults to 1, where every metric is sent.
    #[must_use]
    pub fn with_sample_rate(mut self, rate: f32) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the prefix for every bucket name.
    ///
    /// A `.` separator is added after the prefix if it doesn't end with one.
    #[must_use]
    pub fn with_prefix<P>(mut self, prefix: P) -> Self
    where
        P: AsRef<str>,
    {
        self.prefix = normalize_prefix(prefix.as_ref());
        self
    }

    /// Set the tags sent with every metric.
    ///
    /// Tags are only sent when a tag format is configured.
    #[must_use]
    pub fn with_tags<I, K, V>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        merge_tags(&mut self.tags, tags);
        self
    }

    /// Set whether or not the client is muted.
    ///
    /// A muted client never connects to the remote server and does nothing when sending metrics, which makes it
    /// possible to turn metrics off without touching the code that sends them.
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    /// Set the overflow policy.
    ///
    /// See [`OverflowPolicy`] for more details.
    ///
    /// Defaults to [`OverflowPolicy::Block`].
    #[must_use]
    pub fn with_overflow_policy(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Set the dialer used to connect to the remote server.
    ///
    /// Defaults to [`SocketDialer`].
    #[must_use]
    pub fn with_dialer<D>(mut self, dialer: D) -> Self
    where
        D: Dialer + 'static,
    {
        self.dialer = Arc::new(dialer);
        self
    }

    /// Sets whether or not to send histograms as timings.
    ///
    /// Only affects histograms recorded through the [`metrics`] macros, see [`StatsdBuilder::install`].
    ///
    /// Defaults to `false`.
    #[must_use]
    pub fn send_histograms_as_timings(mut self, histograms_as_timings: bool) -> Self {
        self.histograms_as_timings = histograms_as_timings;
        self
    }

    #[cfg(test)]
    pub(crate) fn with_clock(mut self, clock: quanta::Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the client.
    ///
    /// Unless the client is muted, a connection to the remote server is opened right away. Failing to connect is not
    /// fatal: the error is passed to the error handler, and connecting is tried again when metrics are next sent.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or if the background thread could not be spawned, an error will be returned.
    pub fn build(self) -> Result<Client, BuildError> {
        if self.max_packet_size == 0 {
            return Err(BuildError::InvalidPacketSize);
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err(BuildError::InvalidSampleRate { rate: self.sample_rate });
        }

        let state_config = StateConfiguration {
            remote_addr: self.remote_addr.clone(),
            timeout: self.timeout,
            dialer: self.dialer,
            max_packet_size: self.max_packet_size,
            overflow: self.overflow,
            tag_format: self.tag_format,
            known_rates: vec![1.0, self.sample_rate],
            error_handler: self.error_handler,
        };
        let state = Arc::new(State::new(state_config));

        let forwarder_config = ForwarderConfiguration {
            remote_addr: self.remote_addr,
            flush_interval: self.flush_interval,
        };

        let forwarding = if self.muted {
            debug!("Client is muted, metrics will not be sent.");
            Forwarding::Inline
        } else {
            state.report_result(state.connect());
            spawn_forwarder(&state, &forwarder_config)?
        };

        let shared = Shared::new(state, forwarding, self.clock, self.histograms_as_timings);
        Ok(Client::new(shared, self.prefix, self.tags, self.sample_rate, self.muted))
    }

    /// Builds the client and installs it as the global recorder.
    ///
    /// Metrics recorded through the [`metrics`] macros are then sent through the returned client, which can still be
    /// used directly, and has to be used to flush or close the connection.
    ///
    /// # Errors
    ///
    /// If the client could not be built, or if a global recorder is already installed, an error will be returned.
    pub fn install(self) -> Result<Client, BuildError> {
        let client = self.build()?;
        let recorder = StatsdRecorder::new(client.clone());

        metrics::set_global_recorder(recorder).map_err(|_| BuildError::FailedToInstall)?;
        Ok(client)
    }
}

fn spawn_forwarder(state: &Arc<State>, config: &ForwarderConfiguration) -> Result<Forwarding, BuildError> {
    if config.flush_interval.is_zero() {
        debug!(remote_addr = %config.remote_addr, "Flush interval is zero, flushing inline.");
        return Ok(Forwarding::Inline);
    }

    let (requests_tx, requests_rx) = bounded(REQUEST_QUEUE_CAPACITY);
    let forwarder = Forwarder::new(Arc::clone(state), requests_rx, config.flush_interval);

    let handle = std::thread::Builder::new()
        .name("metrics-statsd-client-forwarder".to_string())
        .spawn(move || forwarder.run())
        .map_err(|_| BuildError::Backend)?;

    debug!(
        remote_addr = %config.remote_addr,
        transport = config.remote_addr.transport_id(),
        flush_interval = ?config.flush_interval,
        "Spawned forwarder."
    );
    Ok(Forwarding::Background { requests: requests_tx, handle })
}

/// Appends the `.` separator to a non-empty prefix.
pub(crate) fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_end_matches('.');
    if prefix.is_empty() {
        String::new()
    } else {
        format!("{prefix}.")
    }
}

/// Adds tags to `existing`, replacing the value of any tag that is already present.
pub(crate) fn merge_tags<I, K, V>(existing: &mut Vec<(String, String)>, tags: I)
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    for (key, value) in tags {
        let (key, value) = (key.into(), value.into());
        match existing.iter_mut().find(|(k, _)| *k == key) {
            Some(tag) => tag.1 = value,
            None => existing.push((key, value)),
        }
    }
}

impl Default for StatsdBuilder {
    fn default() -> Self {
        StatsdBuilder {
            remote_addr: RemoteAddr::Udp(vec![SocketAddr::from(([127, 0, 0, 1], 8125))]),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            tag_format: TagFormat::None,
            error_handler: default_error_handler(),
            sample_rate: 1.0,
            prefix: String::new(),
            tags: Vec::new(),
            muted: false,
            overflow: OverflowPolicy::Block,
            dialer: Arc::new(SocketDialer),
            histograms_as_timings: false,
            clock: quanta::Clock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering::Relaxed},
            Arc,
        },
        time::Duration,
    };

    use super::{merge_tags, normalize_prefix, BuildError, StatsdBuilder};
    use crate::test_util::RecordingDialer;

    #[test]
    fn invalid_configuration() {
        let result = StatsdBuilder::default().with_remote_address("ftp://127.0.0.1:8125");
        assert!(matches!(result, Err(BuildError::InvalidRemoteAddress { .. })));

        let result = StatsdBuilder::default().with_maximum_packet_size(0).build();
        assert!(matches!(result, Err(BuildError::InvalidPacketSize)));

        for rate in [0.0, -0.5, 1.5, f32::NAN] {
            let result = StatsdBuilder::default().muted(true).with_sample_rate(rate).build();
            assert!(matches!(result, Err(BuildError::InvalidSampleRate { .. })), "rate {rate} should be rejected");
        }
    }

    #[test]
    fn build_dials_once() {
        let dialer = RecordingDialer::new();
        let client = StatsdBuilder::default()
            .with_flush_interval(Duration::ZERO)
            .with_dialer(dialer.clone())
            .build()
            .unwrap();
        assert_eq!(dialer.dials(), 1);
        assert_eq!(dialer.probes(), 2);

        client.close().unwrap();
        assert_eq!(dialer.closes(), 1);
    }

    #[test]
    fn build_survives_dial_failure() {
        let dialer = RecordingDialer::new();
        dialer.fail_dials(1);

        let errors = Arc::new(AtomicUsize::new(0));
        let errors2 = Arc::clone(&errors);
        let client = StatsdBuilder::default()
            .with_flush_interval(Duration::ZERO)
            .with_dialer(dialer.clone())
            .with_error_handler(move |_| {
                errors2.fetch_add(1, Relaxed);
            })
            .build()
            .unwrap();
        assert_eq!(errors.load(Relaxed), 1);

        client.increment("a");
        client.flush().unwrap();
        assert_eq!(dialer.dials(), 2);
        assert_eq!(dialer.payloads(), vec![b"a:1|c".to_vec()]);
    }

    #[test]
    fn muted_client_never_dials() {
        let dialer = RecordingDialer::new();
        let client = StatsdBuilder::default().muted(true).with_dialer(dialer.clone()).build().unwrap();

        client.increment("a");
        client.flush().unwrap();
        client.close().unwrap();
        assert_eq!(dialer.dials(), 0);
    }

    #[test]
    fn prefixes() {
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(normalize_prefix("."), "");
        assert_eq!(normalize_prefix("app"), "app.");
        assert_eq!(normalize_prefix("app."), "app.");
    }

    #[test]
    fn tags_replace_same_named_keys() {
        let mut tags = vec![("host".to_string(), "a".to_string())];
        merge_tags(&mut tags, [("region", "eu"), ("host", "b")]);
        assert_eq!(
            tags,
            vec![("host".to_string(), "b".to_string()), ("region".to_string(), "eu".to_string())]
        );
    }
}
