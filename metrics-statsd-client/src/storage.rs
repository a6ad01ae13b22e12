use std::sync::{
    atomic::{
        AtomicBool, AtomicU64,
        Ordering::{AcqRel, Acquire, Release},
    },
    Arc,
};

use metrics::{CounterFn, GaugeFn, HistogramFn, Key};
use metrics_util::registry::Storage;

use crate::client::Client;

/// A counter that sends every update as it happens.
pub(crate) struct ForwardingCounter {
    client: Client,
    bucket: String,
    is_absolute: AtomicBool,
    last: AtomicU64,
}

impl CounterFn for ForwardingCounter {
    fn increment(&self, value: u64) {
        self.client.count(&self.bucket, value);
    }

    fn absolute(&self, value: u64) {
        // StatsD counters only take increments, so absolute values are sent as the delta from the previous one. The
        // first absolute value only sets the baseline.
        if !self.is_absolute.swap(true, AcqRel) {
            self.last.store(value, Release);
            return;
        }

        let last = self.last.swap(value, AcqRel);

        // A counter going backwards was reset, and its new value is just the next baseline.
        if let Some(delta) = value.checked_sub(last).filter(|delta| *delta > 0) {
            self.client.count(&self.bucket, delta);
        }
    }
}

/// A gauge that sends its new value after every update.
pub(crate) struct ForwardingGauge {
    client: Client,
    bucket: String,
    value: AtomicU64,
}

impl ForwardingGauge {
    fn update<F>(&self, op: F)
    where
        F: Fn(f64) -> f64,
    {
        let mut current = self.value.load(Acquire);
        loop {
            let new = op(f64::from_bits(current));
            match self.value.compare_exchange_weak(current, new.to_bits(), AcqRel, Acquire) {
                Ok(_) => {
                    self.client.gauge(&self.bucket, new);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl GaugeFn for ForwardingGauge {
    fn increment(&self, value: f64) {
        self.update(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.update(|_| value);
    }
}

/// A histogram that sends every value as it is recorded.
pub(crate) struct ForwardingHistogram {
    client: Client,
    bucket: String,
    as_timing: bool,
}

impl HistogramFn for ForwardingHistogram {
    fn record(&self, value: f64) {
        if self.as_timing {
            self.client.timing(&self.bucket, value);
        } else {
            self.client.histogram(&self.bucket, value);
        }
    }
}

/// Storage that sends metric updates straight through a [`Client`].
///
/// Nothing is aggregated: every update turns into a line in the client's buffer, which is then flushed with everything
/// else. Each metric is bound to a client derived from the one given here, carrying the labels of the metric key as
/// tags.
pub(crate) struct ForwardingStorage {
    client: Client,
}

impl ForwardingStorage {
    /// Creates a new `ForwardingStorage`.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn client_for(&self, key: &Key) -> (Client, String) {
        let client = self.client.with_tags(key.labels().map(|label| (label.key(), label.value())));
        (client, key.name().to_string())
    }
}

impl Storage<Key> for ForwardingStorage {
    type Counter = Arc<ForwardingCounter>;
    type Gauge = Arc<ForwardingGauge>;
    type Histogram = Arc<ForwardingHistogram>;

    fn counter(&self, key: &Key) -> Self::Counter {
        let (client, bucket) = self.client_for(key);
        Arc::new(ForwardingCounter { client, bucket, is_absolute: AtomicBool::new(false), last: AtomicU64::new(0) })
    }

    fn gauge(&self, key: &Key) -> Self::Gauge {
        let (client, bucket) = self.client_for(key);
        Arc::new(ForwardingGauge { client, bucket, value: AtomicU64::new(0.0f64.to_bits()) })
    }

    fn histogram(&self, key: &Key) -> Self::Histogram {
        let (client, bucket) = self.client_for(key);
        let as_timing = client.histograms_as_timings();
        Arc::new(ForwardingHistogram { client, bucket, as_timing })
    }
}
