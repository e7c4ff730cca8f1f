//! Pool internals common to blocking and async flavours.

use std::{
    ops::Deref,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{
    config::{ExhaustionPolicy, PoolConfig},
    error::ReleaseError,
    inventory::{Checkout, Claim, Grant, Inventory, Waiter},
    metrics::{pool_kv, Metrics, PoolState, POOL_METRICS},
    resource::{Lease, Recycle, ResourceFactory, ResourceId},
};

/// How long an acquisition is allowed to wait.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Patience {
    /// Fail right away when exhausted.
    None,
    /// Wait until a resource becomes available.
    Forever,
    /// Wait until the deadline.
    Until(Instant),
}

impl Patience {
    /// Patience prescribed by pool configuration, counting from `start`.
    pub(crate) fn from_config(config: &PoolConfig, start: Instant) -> Self {
        match (config.on_exhausted, config.wait_timeout) {
            (ExhaustionPolicy::Reject, _) => Self::None,
            (ExhaustionPolicy::Wait, None) => Self::Forever,
            (ExhaustionPolicy::Wait, Some(timeout)) => Self::after(start, timeout),
        }
    }

    /// Wait for `timeout` counting from `start`.
    ///
    /// Timeouts too long to represent as an instant mean waiting forever.
    pub(crate) fn after(start: Instant, timeout: Duration) -> Self {
        start.checked_add(timeout).map_or(Self::Forever, Self::Until)
    }

    pub(crate) fn waits(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Outcome of a single acquisition attempt.
pub(crate) enum Attempt<R> {
    /// Got a resource.
    Leased(Lease<R>),
    /// Waiter was queued under this ticket.
    Queued(u64),
    /// Pool is exhausted and no waiter was offered.
    Exhausted,
}

/// State shared between pool handles and outstanding leases.
pub(crate) struct Shared<R, W> {
    /// Pool configuration.
    config: PoolConfig,
    /// Copy of inventory pool identifier, for checks outside the lock.
    pool_id: u64,
    /// Resources, reservations and waiters.
    inventory: Mutex<Inventory<R, W>>,
    /// Source of new resources.
    factory: Box<dyn ResourceFactory<R>>,
    /// Pool label.
    label: [KeyValue; 1],
    /// Linked metrics storage.
    metrics: Arc<Metrics>,
    /// Time of last gathering of pool state metrics.
    last_gathered_at: Mutex<Instant>,
}

impl<R, W> Shared<R, W>
where
    R: Send + 'static,
    W: Waiter<R> + Send + 'static,
{
    pub(crate) fn new<F>(config: PoolConfig, factory: F) -> Arc<Self>
    where
        F: ResourceFactory<R> + 'static,
    {
        if let Err(err) = config.validate() {
            warn!(pool = config.name(), %err, "wait timeout has no effect without waiting");
        }
        let inventory = Inventory::new(config.capacity);
        let shared = Arc::new(Self {
            label: pool_kv(config.name()),
            pool_id: inventory.pool_id(),
            inventory: Mutex::new(inventory),
            factory: Box::new(factory),
            metrics: POOL_METRICS.deref().clone(),
            last_gathered_at: Mutex::new(Instant::now()),
            config,
        });
        shared.metrics.record_state(&shared.label, &shared.state());
        shared
    }

    pub(crate) fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub(crate) fn name(&self) -> &str {
        self.config.name()
    }

    /// Return path for leases and grants issued by this pool.
    pub(crate) fn home(self: &Arc<Self>) -> Weak<dyn Recycle<R>> {
        let weak: Weak<Self> = Arc::downgrade(self);
        weak
    }

    /// Take an idle resource, create a new one, or queue `waiter` if given.
    pub(crate) fn attempt(self: &Arc<Self>, waiter: Option<W>) -> Attempt<R> {
        let mut inventory = self.inventory.lock();
        let grant = match inventory.checkout() {
            Checkout::Idle(id, resource) => Grant::Resource(id, resource),
            Checkout::Reserved(id) => Grant::Reservation(id),
            Checkout::Exhausted => {
                return match waiter {
                    Some(waiter) => Attempt::Queued(inventory.enqueue(waiter)),
                    None => Attempt::Exhausted,
                };
            }
        };
        drop(inventory);
        Attempt::Leased(self.claim(grant))
    }

    /// Turn a grant into a lease, creating the resource if needed.
    pub(crate) fn claim(self: &Arc<Self>, grant: Grant<R>) -> Lease<R> {
        match grant {
            Grant::Resource(id, resource) => self.lease(id, resource),
            Grant::Reservation(id) => self.create(id),
        }
    }

    /// Run the factory outside the lock, then register the result.
    fn create(self: &Arc<Self>, id: ResourceId) -> Lease<R> {
        // Unwinding out of the factory hands the reservation back.
        let reservation = Claim::new(Grant::Reservation(id), self.home());
        let resource = self.factory.create();
        reservation.disarm();
        self.inventory.lock().register(id);
        trace!(pool = self.name(), resource = %id, "created pooled resource");
        self.lease(id, resource)
    }

    fn lease(self: &Arc<Self>, id: ResourceId, resource: R) -> Lease<R> {
        Lease::new(
            id,
            resource,
            self.home(),
            self.metrics.clone(),
            self.label.clone(),
        )
    }

    /// Withdraw a queued waiter; `false` if it has been woken already.
    pub(crate) fn cancel(&self, ticket: u64) -> bool {
        self.inventory.lock().cancel(ticket)
    }

    /// Explicitly return a lease.
    pub(crate) fn release(&self, lease: Lease<R>) -> Result<(), ReleaseError<R>> {
        if lease.id().pool_id() != self.pool_id {
            return Err(ReleaseError::new(lease));
        }
        let mut inventory = self.inventory.lock();
        if !inventory.is_leased(lease.id()) {
            drop(inventory);
            return Err(ReleaseError::new(lease));
        }
        lease.record_use();
        let (id, resource) = lease.into_parts();
        let checked_in = inventory.check_in(id, resource);
        debug_assert!(checked_in.is_ok(), "lease {id} vanished under the lock");
        Ok(())
    }

    /// Consistent snapshot of pool occupancy.
    pub(crate) fn state(&self) -> PoolState {
        self.inventory.lock().state()
    }

    /// Record metrics after resource acquisition.
    pub(crate) fn measure_acquire(&self, before: Instant) {
        self.metrics
            .wait_time
            .record(before.elapsed().as_secs_f64(), &self.label);
        self.update_metrics();
    }

    /// Record duration of a job run through the pool.
    pub(crate) fn measure_job(&self, started: Instant) {
        self.metrics
            .job_duration
            .record(started.elapsed().as_secs_f64(), &self.label);
    }

    /// Refresh pool state gauges, at most once per configured interval.
    pub(crate) fn update_metrics(&self) {
        let mut last_gathered_at = self.last_gathered_at.lock();
        if last_gathered_at.elapsed() > self.config.metrics_interval {
            *last_gathered_at = Instant::now();
            drop(last_gathered_at);
            self.metrics.record_state(&self.label, &self.state());
        }
    }
}

impl<R, W> Recycle<R> for Shared<R, W>
where
    R: Send + 'static,
    W: Waiter<R> + Send + 'static,
{
    fn recycle(&self, id: ResourceId, resource: R) {
        // Leases only ever point back at the pool that issued them.
        let checked_in = self.inventory.lock().check_in(id, resource);
        debug_assert!(checked_in.is_ok(), "recycled unknown resource {id}");
    }

    fn abandon(&self, id: ResourceId) {
        self.inventory.lock().abandon(id);
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;

    #[test]
    fn overlong_timeout_means_forever() {
        let now = Instant::now();
        assert!(matches!(Patience::after(now, Duration::MAX), Patience::Forever));
        let config = PoolConfig::new(NonZeroUsize::MIN).waiting(Some(Duration::MAX));
        assert!(matches!(Patience::from_config(&config, now), Patience::Forever));
    }

    #[test]
    fn timeout_sets_deadline() {
        let now = Instant::now();
        let timeout = Duration::from_millis(250);
        assert!(matches!(
            Patience::after(now, timeout),
            Patience::Until(deadline) if deadline == now + timeout
        ));
        assert!(!Patience::from_config(&PoolConfig::new(NonZeroUsize::MIN), now).waits());
    }
}
