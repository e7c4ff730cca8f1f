use std::sync::{Arc, LazyLock};

use opentelemetry::{
    global,
    metrics::{Gauge, Histogram},
    Key, KeyValue, StringValue, Value,
};

/// Central metrics singleton for pool metrics.
pub(crate) static POOL_METRICS: LazyLock<Arc<Metrics>> = LazyLock::new(|| Arc::new(Metrics::new()));

const KEY_POOL_NAME: Key = Key::from_static_str("workpool.pool.name");
const KEY_STATE: Key = Key::from_static_str("workpool.resource.state");

/// Storage for pool metrics.
pub(crate) struct Metrics {
    /// The number of resources that are currently in state described by the state attribute.
    pub(crate) resource_count: Gauge<u64>,
    /// The maximum number of resources allowed.
    pub(crate) resource_max: Gauge<u64>,
    /// The number of callers currently waiting for a resource.
    pub(crate) pending_requests: Gauge<u64>,
    /// The time it took to obtain a resource from the pool.
    pub(crate) wait_time: Histogram<f64>,
    /// The time between borrowing a resource and returning it to the pool.
    pub(crate) use_time: Histogram<f64>,
    /// Duration of jobs run through the pool.
    pub(crate) job_duration: Histogram<f64>,
}

impl Metrics {
    /// Register pool instruments with the global meter provider.
    pub(crate) fn new() -> Self {
        let meter = global::meter("workpool");
        // workpool.pool.name (string)
        // workpool.resource.state (idle / leased / pending)
        let resource_count = meter
            .u64_gauge("workpool.resource.count")
            .with_description("The number of resources that are currently in state described by the state attribute.")
            .build();
        // workpool.pool.name (string)
        let resource_max = meter
            .u64_gauge("workpool.resource.max")
            .with_description("The maximum number of resources allowed.")
            .build();
        // workpool.pool.name (string)
        let pending_requests = meter
            .u64_gauge("workpool.pending_requests")
            .with_description("The number of callers currently waiting for a resource.")
            .build();
        // workpool.pool.name (string)
        let wait_time = meter
            .f64_histogram("workpool.wait_time")
            .with_unit("s")
            .with_description("The time it took to obtain a resource from the pool.")
            .build();
        // workpool.pool.name (string)
        let use_time = meter
            .f64_histogram("workpool.use_time")
            .with_unit("s")
            .with_description("The time between borrowing a resource and returning it to the pool.")
            .build();
        // workpool.pool.name (string)
        let job_duration = meter
            .f64_histogram("workpool.job.duration")
            .with_unit("s")
            .with_description("Duration of jobs run through the pool.")
            .build();
        Metrics {
            resource_count,
            resource_max,
            pending_requests,
            wait_time,
            use_time,
            job_duration,
        }
    }

    pub(crate) fn record_state(&self, label: &[KeyValue; 1], state: &PoolState) {
        self.resource_max.record(state.capacity as u64, label);
        let idle_label = status_kv(label[0].clone(), "idle");
        self.resource_count.record(state.idle as u64, &idle_label);
        let leased_label = status_kv(label[0].clone(), "leased");
        self.resource_count.record(state.leased as u64, &leased_label);
        let pending_label = status_kv(label[0].clone(), "pending");
        self.resource_count.record(state.pending as u64, &pending_label);
        self.pending_requests.record(state.waiting as u64, label);
    }
}

pub(crate) fn pool_kv(name: &str) -> [KeyValue; 1] {
    [KeyValue::new(KEY_POOL_NAME, name.to_owned())]
}

pub(crate) fn status_kv(name: KeyValue, status: &'static str) -> [KeyValue; 2] {
    [
        name,
        KeyValue::new(KEY_STATE, Value::String(StringValue::from(status))),
    ]
}

/// Snapshot of pool occupancy.
///
/// All counts are taken under the pool lock at a single instant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolState {
    /// Maximum total number of resources the pool will ever create.
    pub capacity: usize,
    /// Current number of idle (not acquired) resources.
    pub idle: usize,
    /// Current number of leased (acquired) resources.
    pub leased: usize,
    /// Capacity slots reserved for resources under construction.
    pub pending: usize,
    /// Callers currently queued for a resource.
    pub waiting: usize,
}

impl PoolState {
    /// Number of resources created so far (`idle` + `leased`).
    #[must_use]
    pub fn size(&self) -> usize {
        self.idle + self.leased
    }

    /// Number of resources that could still be created (or handed out right away).
    #[must_use]
    pub fn available(&self) -> usize {
        self.idle + (self.capacity - self.size() - self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_arithmetic() {
        let state = PoolState {
            capacity: 5,
            idle: 1,
            leased: 2,
            pending: 1,
            waiting: 0,
        };
        assert_eq!(state.size(), 3);
        assert_eq!(state.available(), 2);
    }

    #[test]
    fn status_label_carries_pool_name() {
        let label = pool_kv("workers");
        let [name, state] = status_kv(label[0].clone(), "idle");
        assert_eq!(name.value.as_str(), "workers");
        assert_eq!(state.value.as_str(), "idle");
    }
}
