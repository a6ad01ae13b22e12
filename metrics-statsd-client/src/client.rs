use std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering::{AcqRel, Acquire},
        },
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use crossbeam_channel::{bounded, SendError, Sender};
use parking_lot::Mutex;
use quanta::{Clock, Instant};
use tracing::debug;

use crate::{
    buffer::FlushToken,
    builder::{merge_tags, normalize_prefix},
    encoder::{join_tags, Metric, MetricKind, MetricValue, Number},
    error::Error,
    forwarder::FlushRequest,
    state::State,
};

/// Where full buffers are flushed.
pub(crate) enum Forwarding {
    /// On the thread that filled them up.
    Inline,

    /// On the forwarder thread.
    Background { requests: Sender<FlushRequest>, handle: JoinHandle<()> },
}

/// Everything shared by a client and the clients derived from it.
pub(crate) struct Shared {
    state: Arc<State>,
    requests: Option<Sender<FlushRequest>>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    clock: Clock,
    histograms_as_timings: bool,
}

impl Shared {
    pub fn new(state: Arc<State>, forwarding: Forwarding, clock: Clock, histograms_as_timings: bool) -> Self {
        let (requests, forwarder) = match forwarding {
            Forwarding::Inline => (None, None),
            Forwarding::Background { requests, handle } => (Some(requests), Some(handle)),
        };

        Shared {
            state,
            requests,
            forwarder: Mutex::new(forwarder),
            closed: AtomicBool::new(false),
            clock,
            histograms_as_timings,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Acquire)
    }

    fn record(&self, metric: &Metric<'_>) {
        if let Some(token) = self.state.record(metric) {
            self.dispatch(token);
        }
    }

    fn dispatch(&self, token: FlushToken) {
        let token = match &self.requests {
            Some(requests) => match requests.send(FlushRequest::BufferFull(token)) {
                Ok(()) => return,
                // The forwarder is gone, so flush here instead.
                Err(SendError(FlushRequest::BufferFull(token))) => token,
                Err(SendError(_)) => return,
            },
            None => token,
        };

        self.state.report_result(self.state.flush_slot(token));
    }

    fn flush(&self) -> Result<(), Error> {
        let Some(requests) = &self.requests else {
            return self.state.drain();
        };

        let (reply_tx, reply_rx) = bounded(1);
        if requests.send(FlushRequest::Flush(reply_tx)).is_err() {
            return self.state.drain();
        }
        reply_rx.recv().unwrap_or_else(|_| self.state.drain())
    }

    fn close(&self) -> Result<(), Error> {
        if self.closed.swap(true, AcqRel) {
            return Ok(());
        }

        let result = match &self.requests {
            Some(requests) => {
                let (reply_tx, reply_rx) = bounded(1);
                match requests.send(FlushRequest::Close(reply_tx)) {
                    Ok(()) => reply_rx.recv().unwrap_or_else(|_| self.state.shutdown()),
                    Err(_) => self.state.shutdown(),
                }
            }
            None => self.state.shutdown(),
        };

        if let Some(handle) = self.forwarder.lock().take() {
            if handle.join().is_err() {
                debug!("Forwarder thread panicked.");
            }
        }

        debug!("Client closed.");
        result
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // With a forwarder, dropping the request sender is what tells it to drain and close.
        if self.requests.is_none() && !self.is_closed() {
            self.state.report_result(self.state.shutdown());
        }
    }
}

/// A StatsD client.
///
/// Metrics are encoded into a buffer as they are sent, and the buffer is written out once it is full, or once the flush
/// interval has passed. None of the methods for sending metrics wait on the network, nor do they fail: errors that
/// happen while flushing are passed to the error handler configured on [`StatsdBuilder`][crate::StatsdBuilder].
///
/// Clients are cheap to clone. Clones, as well as clients derived through [`Client::with_prefix`] and friends, all share
/// the same buffer and connection. Once every one of them is dropped, whatever is still buffered is flushed and the
/// connection is closed.
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
    prefix: Arc<str>,
    tags: Arc<[(String, String)]>,
    joined_tags: Arc<str>,
    rate: f32,
    muted: bool,
}

impl Client {
    pub(crate) fn new(shared: Shared, prefix: String, tags: Vec<(String, String)>, rate: f32, muted: bool) -> Self {
        let joined_tags = join_tags(shared.state.tag_format(), &tags);
        Client {
            shared: Arc::new(shared),
            prefix: prefix.into(),
            tags: tags.into(),
            joined_tags: joined_tags.into(),
            rate,
            muted,
        }
    }

    /// Adds `n` to a counter.
    pub fn count<N>(&self, bucket: &str, n: N)
    where
        N: Into<Number>,
    {
        self.send(MetricKind::Count, bucket, MetricValue::Number(n.into()));
    }

    /// Adds one to a counter.
    pub fn increment(&self, bucket: &str) {
        self.count(bucket, 1u8);
    }

    /// Sets a gauge to `n`.
    pub fn gauge<N>(&self, bucket: &str, n: N)
    where
        N: Into<Number>,
    {
        self.send(MetricKind::Gauge, bucket, MetricValue::Number(n.into()));
    }

    /// Records a timing, in milliseconds.
    pub fn timing<N>(&self, bucket: &str, n: N)
    where
        N: Into<Number>,
    {
        self.send(MetricKind::Timing, bucket, MetricValue::Number(n.into()));
    }

    /// Records a value in a histogram.
    pub fn histogram<N>(&self, bucket: &str, n: N)
    where
        N: Into<Number>,
    {
        self.send(MetricKind::Histogram, bucket, MetricValue::Number(n.into()));
    }

    /// Adds `value` to a set of unique values.
    pub fn unique(&self, bucket: &str, value: &str) {
        self.send(MetricKind::Set, bucket, MetricValue::Text(value));
    }

    /// Starts a timing.
    ///
    /// The returned [`Timing`] sends the time elapsed since this call.
    pub fn new_timing(&self) -> Timing {
        Timing { client: self.clone(), start: self.shared.clock.now() }
    }

    fn send(&self, kind: MetricKind, bucket: &str, value: MetricValue<'_>) {
        if self.muted || self.shared.is_closed() {
            return;
        }
        if self.rate < 1.0 && rand::random::<f32>() > self.rate {
            return;
        }

        let metric = Metric { kind, prefix: &self.prefix, bucket, value, rate: self.rate, tags: &self.joined_tags };
        self.shared.record(&metric);
    }

    /// Returns a client that adds `prefix` to every bucket name, after the prefix of this client.
    ///
    /// A `.` separator is added after the prefix if it doesn't end with one.
    #[must_use]
    pub fn with_prefix(&self, prefix: &str) -> Client {
        let mut client = self.clone();
        client.prefix = format!("{}{}", self.prefix, normalize_prefix(prefix)).into();
        client
    }

    /// Returns a client that sends at the given sample rate.
    ///
    /// Rates outside of `[0, 1]` are clamped, and a NaN rate is ignored.
    #[must_use]
    pub fn with_sample_rate(&self, rate: f32) -> Client {
        let mut client = self.clone();
        if !rate.is_nan() {
            client.rate = rate.clamp(0.0, 1.0);
        }
        client
    }

    /// Returns a client that sends the given tags on top of the tags of this client.
    ///
    /// A tag that this client already sends has its value replaced.
    #[must_use]
    pub fn with_tags<I, K, V>(&self, tags: I) -> Client
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = self.tags.to_vec();
        merge_tags(&mut merged, tags);

        let mut client = self.clone();
        client.joined_tags = join_tags(self.shared.state.tag_format(), &merged).into();
        client.tags = merged.into();
        client
    }

    /// Returns a client that does nothing.
    ///
    /// Flushing or closing a muted client does nothing either, even though it shares the connection of this client.
    #[must_use]
    pub fn muted(&self) -> Client {
        let mut client = self.clone();
        client.muted = true;
        client
    }

    /// Writes out everything that is buffered, and waits for the writes to complete.
    ///
    /// # Errors
    ///
    /// If the connection could not be opened, or a write failed, an error is returned. Whatever was being written at
    /// the time is lost.
    pub fn flush(&self) -> Result<(), Error> {
        if self.muted || self.shared.is_closed() {
            return Ok(());
        }
        self.shared.flush()
    }

    /// Writes out everything that is buffered, and closes the connection.
    ///
    /// Afterwards, sending metrics through this client, or any client sharing its connection, does nothing. Closing
    /// again does nothing either, and returns `Ok(())`.
    ///
    /// # Errors
    ///
    /// If writing out the buffers failed, or if the connection could not be closed cleanly, an error is returned.
    pub fn close(&self) -> Result<(), Error> {
        if self.muted {
            return Ok(());
        }
        self.shared.close()
    }

    /// Returns the number of metrics dropped because both buffers were waiting on the network.
    ///
    /// Metrics are only ever dropped under [`OverflowPolicy::Drop`][crate::OverflowPolicy::Drop].
    pub fn dropped_metrics(&self) -> u64 {
        self.shared.state.dropped_metrics()
    }

    pub(crate) fn histograms_as_timings(&self) -> bool {
        self.shared.histograms_as_timings
    }
}

/// A running timing, started by [`Client::new_timing`].
pub struct Timing {
    client: Client,
    start: Instant,
}

impl Timing {
    /// Sends the time elapsed since the timing started, in whole milliseconds.
    pub fn send(&self, bucket: &str) {
        let millis = u64::try_from(self.duration().as_millis()).unwrap_or(u64::MAX);
        self.client.timing(bucket, millis);
    }

    /// Returns the time elapsed since the timing started.
    pub fn duration(&self) -> Duration {
        self.client.shared.clock.now().duration_since(self.start)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread, time::Duration};

    use quanta::Clock;

    use super::Client;
    use crate::{
        builder::OverflowPolicy,
        encoder::{Metric, MetricKind, MetricValue, Number},
        test_util::RecordingDialer,
        StatsdBuilder, TagFormat,
    };

    fn builder(dialer: &RecordingDialer) -> StatsdBuilder {
        StatsdBuilder::default()
            .with_remote_address("tcp://127.0.0.1:8125")
            .unwrap()
            .with_flush_interval(Duration::ZERO)
            .with_dialer(dialer.clone())
    }

    fn sent(client: &Client, dialer: &RecordingDialer) -> String {
        client.flush().unwrap();
        String::from_utf8(dialer.bytes()).unwrap()
    }

    #[test]
    fn count_with_prefix() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).with_prefix("app").build().unwrap();

        client.count("requests", 5);
        assert_eq!(sent(&client, &dialer), "app.requests:5|c\n");
    }

    #[test]
    fn negative_gauge() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).with_prefix("app.").build().unwrap();

        client.gauge("mem", -3);
        assert_eq!(sent(&client, &dialer), "app.mem:0|g\napp.mem:-3|g\n");
    }

    #[test]
    fn every_kind() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).with_prefix("app").build().unwrap();

        client.increment("hits");
        client.gauge("temp", 21.5);
        client.timing("lat", 120u32);
        client.histogram("size", 4096u64);
        client.unique("users", "42");
        assert_eq!(
            sent(&client, &dialer),
            "app.hits:1|c\napp.temp:21.5|g\napp.lat:120|ms\napp.size:4096|h\napp.users:42|s\n"
        );
    }

    #[test]
    fn tags() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer)
            .with_prefix("app")
            .with_tag_format(TagFormat::InfluxDb)
            .with_tags([("host", "a")])
            .build()
            .unwrap();

        client.timing("lat", 120);
        client.with_tags([("host", "b"), ("region", "eu")]).timing("lat", 80);
        assert_eq!(sent(&client, &dialer), "app.lat,host=a:120|ms\napp.lat,host=b,region=eu:80|ms\n");
    }

    #[test]
    fn nested_prefixes() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).with_prefix("app").build().unwrap();

        client.with_prefix("db").with_prefix("pool.").increment("acquired");
        client.increment("started");
        assert_eq!(sent(&client, &dialer), "app.db.pool.acquired:1|c\napp.started:1|c\n");
    }

    #[test]
    fn sampling() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).with_sample_rate(0.5).build().unwrap();

        for _ in 0..1000 {
            client.increment("sampled");
        }
        let payload = sent(&client, &dialer);
        let lines: Vec<&str> = payload.lines().collect();
        assert!(lines.iter().all(|line| *line == "sampled:1|c|@0.5"));

        // Fewer than 1 in 10^29 runs fall outside of these bounds.
        assert!(lines.len() > 300 && lines.len() < 700, "sent {} out of 1000", lines.len());

        // A zero rate never sends, a rate of one always does.
        let before = dialer.bytes().len();
        for _ in 0..100 {
            client.with_sample_rate(0.0).increment("never");
        }
        client.with_sample_rate(1.0).increment("always");
        assert_eq!(&sent(&client, &dialer)[before..], "always:1|c\n");
    }

    #[test]
    fn muted_derived_client() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).build().unwrap();

        let muted = client.muted();
        muted.increment("ignored");
        muted.close().unwrap();

        client.increment("kept");
        assert_eq!(sent(&client, &dialer), "kept:1|c\n");
    }

    #[test]
    fn timing_helper() {
        let dialer = RecordingDialer::new();
        let (clock, mock) = Clock::mock();
        let client = builder(&dialer).with_prefix("app").with_clock(clock).build().unwrap();

        let timing = client.new_timing();
        mock.increment(Duration::from_micros(120_700));
        assert_eq!(timing.duration(), Duration::from_micros(120_700));

        timing.send("lat");
        assert_eq!(sent(&client, &dialer), "app.lat:120|ms\n");
    }

    #[test]
    fn full_buffer_is_flushed_inline() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).with_maximum_packet_size(40).build().unwrap();

        for i in 0..5 {
            client.count(&format!("metric{i}"), 1);
        }

        // Lines are 12 bytes long, so the fourth one takes the buffer past 40 bytes and the first three go out.
        assert_eq!(dialer.payloads(), vec![b"metric0:1|c\nmetric1:1|c\nmetric2:1|c\n".to_vec()]);
        assert_eq!(sent(&client, &dialer).lines().count(), 5);
    }

    #[test]
    fn close_flushes_and_mutes_every_clone() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).with_flush_interval(Duration::from_secs(3600)).build().unwrap();
        let clone = client.with_prefix("other");

        client.increment("a");
        clone.increment("b");
        client.close().unwrap();
        assert_eq!(String::from_utf8(dialer.bytes()).unwrap(), "a:1|c\nother.b:1|c\n");
        assert_eq!(dialer.closes(), 1);

        clone.increment("c");
        clone.flush().unwrap();
        clone.close().unwrap();
        client.close().unwrap();
        assert_eq!(dialer.payloads().len(), 1);
        assert_eq!(dialer.closes(), 1);
    }

    #[test]
    fn dropping_every_client_flushes() {
        let dialer = RecordingDialer::new();
        let client = builder(&dialer).build().unwrap();
        let clone = client.clone();

        client.increment("a");
        drop(client);
        assert!(dialer.payloads().is_empty());

        drop(clone);
        assert_eq!(dialer.bytes(), b"a:1|c\n");
        assert_eq!(dialer.closes(), 1);
    }

    #[test]
    fn concurrent_clients() {
        const THREADS: usize = 8;
        const METRICS_PER_THREAD: usize = 1_000;

        let dialer = RecordingDialer::new();
        let client = builder(&dialer)
            .with_flush_interval(Duration::from_millis(5))
            .with_maximum_packet_size(512)
            .build()
            .unwrap();

        thread::scope(|s| {
            for t in 0..THREADS {
                let client = client.with_prefix(&format!("thread{t}"));
                s.spawn(move || {
                    for i in 0..METRICS_PER_THREAD {
                        client.count("metric", i);
                    }
                });
            }
        });
        client.close().unwrap();

        let payload = String::from_utf8(dialer.bytes()).unwrap();
        let lines: HashSet<&str> = payload.lines().collect();
        assert_eq!(payload.lines().count(), THREADS * METRICS_PER_THREAD);
        for t in 0..THREADS {
            for i in 0..METRICS_PER_THREAD {
                assert!(lines.contains(format!("thread{t}.metric:{i}|c").as_str()));
            }
        }
    }

    #[test]
    fn drop_policy_counts_shed_metrics() {
        fn count(bucket: &str) -> Metric<'_> {
            Metric {
                kind: MetricKind::Count,
                prefix: "",
                bucket,
                value: MetricValue::Number(Number::from(1u8)),
                rate: 1.0,
                tags: "",
            }
        }

        let dialer = RecordingDialer::new();
        let client =
            builder(&dialer).with_maximum_packet_size(12).with_overflow_policy(OverflowPolicy::Drop).build().unwrap();

        // Fill both slots up, and hold on to them as if they were still being written out.
        let state = &client.shared.state;
        assert!(state.record(&count("aaaa")).is_none());
        let first = state.record(&count("bbbb")).expect("second metric should overflow the slot");
        assert!(state.record(&count("cccc")).is_none());
        let second = state.record(&count("dddd")).expect("fourth metric should overflow the other slot");

        client.increment("shed");
        client.with_prefix("app").gauge("shed", 1);
        assert_eq!(client.dropped_metrics(), 2);

        state.flush_slot(first).unwrap();
        state.flush_slot(second).unwrap();
        client.increment("kept");
        assert_eq!(sent(&client, &dialer), "aaaa:1|c\ncccc:1|c\nbbbb:1|c\ndddd:1|c\nkept:1|c\n");
        assert_eq!(client.dropped_metrics(), 2);
    }
}
