use std::sync::Arc;

use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_util::registry::Registry;

use crate::{client::Client, storage::ForwardingStorage};

/// A recorder that sends metrics through a StatsD [`Client`].
///
/// Metric names are used as bucket names, and labels are sent as tags in the tag format of the client. Descriptions
/// and units have no place in the StatsD protocol and are ignored.
pub struct StatsdRecorder {
    registry: Registry<Key, ForwardingStorage>,
}

impl StatsdRecorder {
    /// Creates a new `StatsdRecorder` sending through `client`.
    ///
    /// The prefix, tags and sample rate of the client apply to every metric recorded.
    pub fn new(client: Client) -> Self {
        StatsdRecorder { registry: Registry::new(ForwardingStorage::new(client)) }
    }
}

impl Recorder for StatsdRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        self.registry.get_or_create_counter(key, |existing| Counter::from_arc(Arc::clone(existing)))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        self.registry.get_or_create_gauge(key, |existing| Gauge::from_arc(Arc::clone(existing)))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        self.registry.get_or_create_histogram(key, |existing| Histogram::from_arc(Arc::clone(existing)))
    }
}
