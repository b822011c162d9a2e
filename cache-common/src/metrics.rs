use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use cadence::{Counted, NopMetricSink, StatsdClient, Timed};

pub use cadence::MetricError;

/// The cache's statsd namespace, per the telemetry requirement in
/// `spec.md` §6 ("the namespace should be a single identifier").
pub const NAMESPACE: &str = "sqliteStorage";

/// A thin wrapper over a `cadence::StatsdClient`, mirroring
/// `syncserver_common::metrics::Metrics` — a cheap, cloneable handle
/// passed down to whatever needs to emit a counter or timer, defaulting
/// to a no-op sink when statsd isn't configured.
#[derive(Debug, Clone)]
pub struct Metrics {
    client: Arc<StatsdClient>,
    tags: HashMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::noop()
    }
}

impl Metrics {
    pub fn noop() -> Self {
        Metrics {
            client: Arc::new(StatsdClient::builder(NAMESPACE, NopMetricSink).build()),
            tags: HashMap::default(),
        }
    }

    pub fn new(client: StatsdClient) -> Self {
        Metrics {
            client: Arc::new(client),
            tags: HashMap::default(),
        }
    }

    pub fn incr(&self, label: &str) {
        self.count(label, 1);
    }

    pub fn count(&self, label: &str, count: i64) {
        let mut tagged = self.client.count_with_tags(label, count);
        for (key, value) in &self.tags {
            tagged = tagged.with_tag(key, value);
        }
        if let Err(e) = tagged.try_send() {
            warn!("metric {} error: {:?}", label, e);
        }
    }

    /// Runs `f`, then records its wall-clock duration under `label`.
    pub fn time<T>(&self, label: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        let elapsed = Instant::now().duration_since(start).as_millis() as u64;
        let mut tagged = self.client.time_with_tags(label, elapsed);
        for (key, value) in &self.tags {
            tagged = tagged.with_tag(key, value);
        }
        if let Err(e) = tagged.try_send() {
            warn!("metric {} error: {:?}", label, e);
        }
        result
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_owned(), value.to_owned());
        self
    }
}
