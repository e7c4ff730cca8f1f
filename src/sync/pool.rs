use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::debug_span;

use crate::{
    config::PoolConfig,
    error::{Error, ReleaseError},
    inventory::{Grant, Waiter},
    metrics::PoolState,
    resource::{Lease, Resource, ResourceFactory},
    shared::{Attempt, Patience, Shared},
};

/// Mailbox a parked thread waits on.
struct Handoff<R> {
    /// Delivered grant, if any.
    slot: Mutex<Option<Grant<R>>>,
    /// Signalled on delivery.
    ready: Condvar,
}

/// Parked thread waiting for a resource.
pub(crate) struct ThreadWaiter<R>(Arc<Handoff<R>>);

impl<R> Waiter<R> for ThreadWaiter<R> {
    fn wake(self, grant: Grant<R>) -> Result<(), Grant<R>> {
        // Threads withdraw from the queue before giving up, so a queued waiter always listens.
        *self.0.slot.lock() = Some(grant);
        self.0.ready.notify_one();
        Ok(())
    }
}

/// Bounded pool of resources for use from multiple threads.
///
/// Resources are created lazily by the factory, up to the configured capacity, and are
/// never destroyed while the pool is alive. Cloning the pool yields another handle to
/// the same set of resources.
pub struct Pool<R> {
    shared: Arc<Shared<R, ThreadWaiter<R>>>,
}

impl<R: Send + 'static> Pool<R> {
    /// Create an empty pool.
    ///
    /// No resources are created until first requested.
    ///
    /// The configuration is used as given. Unlike [`PoolConfigLoader`], this does not
    /// fail on inconsistent settings: a `wait_timeout` under the reject policy is
    /// ignored with a warning.
    ///
    /// [`PoolConfigLoader`]: crate::PoolConfigLoader
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: ResourceFactory<R> + 'static,
    {
        Self {
            shared: Shared::new(config, factory),
        }
    }

    /// Pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        self.shared.config()
    }

    /// Acquire a resource, following the configured exhaustion policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if the pool is exhausted and configured to reject,
    /// or [`Error::AcquireTimeout`] if the configured wait timeout has elapsed.
    pub fn get(&self) -> Result<Lease<R>, Error> {
        let now = Instant::now();
        let _span = debug_span!("pool_acquire", name = self.shared.name()).entered();
        let lease = self.acquire(Patience::from_config(self.shared.config(), now))?;
        self.shared.measure_acquire(now);
        Ok(lease)
    }

    /// Instantly acquire a resource, never waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if no resource is available right away.
    pub fn try_get(&self) -> Result<Lease<R>, Error> {
        let now = Instant::now();
        let _span = debug_span!("pool_try_acquire", name = self.shared.name()).entered();
        let lease = self.acquire(Patience::None)?;
        self.shared.measure_acquire(now);
        Ok(lease)
    }

    /// Acquire a resource, waiting for a bounded time regardless of configured policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AcquireTimeout`] if waiting time was exhausted.
    pub fn get_timeout(&self, timeout: Duration) -> Result<Lease<R>, Error> {
        let now = Instant::now();
        let _span = debug_span!("pool_timed_acquire", name = self.shared.name()).entered();
        let lease = self.acquire(Patience::after(now, timeout))?;
        self.shared.measure_acquire(now);
        Ok(lease)
    }

    fn acquire(&self, patience: Patience) -> Result<Lease<R>, Error> {
        let handoff = Arc::new(Handoff {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        });
        let waiter = patience.waits().then(|| ThreadWaiter(handoff.clone()));
        let ticket = match self.shared.attempt(waiter) {
            Attempt::Leased(lease) => return Ok(lease),
            Attempt::Exhausted => return Err(Error::PoolExhausted),
            Attempt::Queued(ticket) => ticket,
        };
        let deadline = match patience {
            Patience::Until(deadline) => Some(deadline),
            _ => None,
        };
        let mut slot = handoff.slot.lock();
        loop {
            if let Some(grant) = slot.take() {
                drop(slot);
                return Ok(self.shared.claim(grant));
            }
            match deadline {
                Some(deadline) => {
                    if handoff.ready.wait_until(&mut slot, deadline).timed_out() {
                        break;
                    }
                }
                None => handoff.ready.wait(&mut slot),
            }
        }
        drop(slot);
        if self.shared.cancel(ticket) {
            return Err(Error::AcquireTimeout);
        }
        // Woken under the pool lock just before we withdrew, so the grant is in the slot.
        let grant = handoff.slot.lock().take().ok_or(Error::AcquireTimeout)?;
        Ok(self.shared.claim(grant))
    }

    /// Return a resource to the pool.
    ///
    /// Dropping the lease has the same effect; this method additionally reports leases
    /// that do not belong here.
    ///
    /// # Errors
    ///
    /// Returns `Err` with the lease handed back if it was not leased from this pool.
    pub fn release(&self, lease: Lease<R>) -> Result<(), ReleaseError<R>> {
        self.shared.release(lease)
    }

    /// Consistent snapshot of pool occupancy.
    #[must_use]
    pub fn stats(&self) -> PoolState {
        self.shared.state()
    }

    /// Manually update pool metrics.
    ///
    /// Normally you wouldn't need to call this directly, as metrics collection occurs
    /// automatically as you use the pool.
    pub fn update_metrics(&self) {
        self.shared.update_metrics();
    }
}

impl<R> Pool<R>
where
    R: Resource + Send + 'static,
{
    /// Run a job on a pooled resource.
    ///
    /// The resource goes back to the pool whether the job succeeds or fails.
    ///
    /// # Errors
    ///
    /// Returns acquisition errors as for [`Pool::get`], and failures of the job itself
    /// as [`Error::Execution`].
    pub fn execute(&self, job: R::Job) -> Result<R::Output, Error<R::Error>> {
        let mut lease = self.get().map_err(Error::cast)?;
        let started = Instant::now();
        let res = lease.process(job).map_err(Error::Execution);
        self.shared.measure_job(started);
        drop(lease);
        res
    }
}

impl<R> Clone for Pool<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: Send + 'static> fmt::Debug for Pool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.shared.name())
            .field("state", &self.stats())
            .finish()
    }
}
