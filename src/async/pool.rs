use std::{
    fmt,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use tokio::sync::oneshot;
use tracing::{debug_span, Instrument};

use crate::{
    config::PoolConfig,
    error::{Error, ReleaseError},
    inventory::{Claim, Grant, Waiter},
    metrics::PoolState,
    resource::{Lease, Recycle, Resource, ResourceFactory},
    shared::{Attempt, Patience, Shared},
};

/// Suspended task waiting for a resource.
pub(crate) struct TaskWaiter<R> {
    /// Delivery channel to the waiting task.
    tx: oneshot::Sender<Claim<R>>,
    /// Return path for grants the task never picks up.
    home: Weak<dyn Recycle<R>>,
}

impl<R> Waiter<R> for TaskWaiter<R> {
    fn wake(self, grant: Grant<R>) -> Result<(), Grant<R>> {
        self.tx
            .send(Claim::new(grant, self.home))
            .map_err(Claim::into_grant)
    }
}

/// Withdraws a queued waiter when its acquisition future goes away.
struct QueueGuard<'a, R: Send + 'static> {
    shared: &'a Shared<R, TaskWaiter<R>>,
    ticket: u64,
}

impl<R: Send + 'static> Drop for QueueGuard<'_, R> {
    fn drop(&mut self) {
        self.shared.cancel(self.ticket);
    }
}

/// Bounded pool of resources for use from async tasks.
///
/// Resources are created lazily by the factory, up to the configured capacity, and are
/// never destroyed while the pool is alive. Cloning the pool yields another handle to
/// the same set of resources.
pub struct Pool<R> {
    shared: Arc<Shared<R, TaskWaiter<R>>>,
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
    pub async fn get(&self) -> Result<Lease<R>, Error> {
        let now = Instant::now();
        let span = debug_span!("pool_acquire", name = self.shared.name());
        let lease = self
            .acquire(Patience::from_config(self.shared.config(), now))
            .instrument(span)
            .await?;
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
        let lease = match self.shared.attempt(None) {
            Attempt::Leased(lease) => lease,
            Attempt::Exhausted | Attempt::Queued(_) => return Err(Error::PoolExhausted),
        };
        self.shared.measure_acquire(now);
        Ok(lease)
    }

    /// Acquire a resource, waiting for a bounded time regardless of configured policy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AcquireTimeout`] if waiting time was exhausted.
    pub async fn get_timeout(&self, timeout: Duration) -> Result<Lease<R>, Error> {
        let now = Instant::now();
        let span = debug_span!("pool_timed_acquire", name = self.shared.name());
        let lease = self
            .acquire(Patience::after(now, timeout))
            .instrument(span)
            .await?;
        self.shared.measure_acquire(now);
        Ok(lease)
    }

    async fn acquire(&self, patience: Patience) -> Result<Lease<R>, Error> {
        let (tx, rx) = oneshot::channel();
        let waiter = patience.waits().then(|| TaskWaiter {
            tx,
            home: self.shared.home(),
        });
        let ticket = match self.shared.attempt(waiter) {
            Attempt::Leased(lease) => return Ok(lease),
            Attempt::Exhausted => return Err(Error::PoolExhausted),
            Attempt::Queued(ticket) => ticket,
        };
        let _queued = QueueGuard {
            shared: &self.shared,
            ticket,
        };
        let received = match patience {
            Patience::Until(deadline) => {
                tokio::time::timeout_at(deadline.into(), rx)
                    .await
                    .map_err(|_| Error::AcquireTimeout)?
            }
            _ => rx.await,
        };
        // The sender only goes away unused together with the pool, which we hold on to.
        let claim = received.map_err(|_| Error::PoolExhausted)?;
        Ok(self.shared.claim(claim.into_grant()))
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
    pub async fn execute(&self, job: R::Job) -> Result<R::Output, Error<R::Error>> {
        let mut lease = self.get().await.map_err(Error::cast)?;
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

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
    };

    use parking_lot::Mutex;
    use tokio::task::yield_now;

    use super::*;

    /// Test worker echoing jobs back.
    #[derive(Debug)]
    struct Echo;

    #[derive(Debug, thiserror::Error)]
    #[error("empty job")]
    struct EmptyJob;

    impl Resource for Echo {
        type Job = String;
        type Output = String;
        type Error = EmptyJob;

        fn process(&mut self, job: Self::Job) -> Result<Self::Output, Self::Error> {
            if job.is_empty() {
                return Err(EmptyJob);
            }
            Ok(job)
        }
    }

    fn config(capacity: usize) -> PoolConfig {
        PoolConfig::new(NonZeroUsize::new(capacity).unwrap())
    }

    fn echo_pool(config: PoolConfig) -> (Pool<Echo>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = Pool::new(config, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Echo
        });
        (pool, created)
    }

    /// Poll pool state until `ready` holds.
    async fn wait_for(pool: &Pool<Echo>, ready: impl Fn(&PoolState) -> bool) {
        for _ in 0..5_000 {
            if ready(&pool.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("pool never reached expected state");
    }

    /// Wait until `n` callers are queued.
    async fn wait_for_waiters(pool: &Pool<Echo>, n: usize) {
        wait_for(pool, |state| state.waiting >= n).await;
    }

    #[tokio::test]
    async fn reject_policy() {
        let (pool, created) = echo_pool(config(1));
        let _held = pool.get().await.unwrap();
        assert!(matches!(pool.get().await, Err(Error::PoolExhausted)));
        assert!(matches!(pool.try_get(), Err(Error::PoolExhausted)));
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn wait_policy_unblocks_one_waiter() {
        let (pool, _) = echo_pool(config(1).waiting(None));
        let held = pool.get().await.unwrap();
        let held_id = held.id();
        let first = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get().await.map(|lease| lease.id()) }
        });
        wait_for_waiters(&pool, 1).await;
        pool.release(held).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), held_id);
        let state = pool.stats();
        assert_eq!((state.idle, state.leased, state.waiting), (1, 0, 0));
    }

    #[tokio::test]
    async fn wait_timeout() {
        let (pool, _) = echo_pool(config(1).waiting(Some(Duration::from_millis(100))));
        let _held = pool.get().await.unwrap();
        let start = Instant::now();
        assert!(matches!(pool.get().await, Err(Error::AcquireTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(pool.stats().waiting, 0);
    }

    #[tokio::test]
    async fn huge_timeout_waits_forever() {
        let (pool, created) = echo_pool(config(1).waiting(Some(Duration::MAX)));
        let held = pool.get().await.unwrap();
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get().await.map(drop) }
        });
        let timed = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get_timeout(Duration::MAX).await.map(drop) }
        });
        wait_for_waiters(&pool, 2).await;
        drop(held);
        waiter.await.unwrap().unwrap();
        timed.await.unwrap().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn fairness() {
        let (pool, _) = echo_pool(config(1).waiting(None));
        let held = pool.get().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (i, name) in ["A", "B", "C"].into_iter().enumerate() {
            let pool2 = pool.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                let lease = pool2.get().await.unwrap();
                order.lock().push(name);
                yield_now().await;
                drop(lease);
            }));
            wait_for_waiters(&pool, i + 1).await;
        }
        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), ["A", "B", "C"]);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_slot() {
        let (pool, _) = echo_pool(config(1).waiting(None));
        let held = pool.get().await.unwrap();
        let res = tokio::time::timeout(Duration::from_millis(20), pool.get()).await;
        assert!(res.is_err());
        assert_eq!(pool.stats().waiting, 0);
        drop(held);
        let state = pool.stats();
        assert_eq!((state.idle, state.leased), (1, 0));
    }

    #[tokio::test]
    async fn grant_in_flight_to_cancelled_waiter_is_reassigned() {
        let (pool, _) = echo_pool(config(1).waiting(None));
        let held = pool.get().await.unwrap();
        let mut first = Box::pin(pool.get());
        let mut second = Box::pin(pool.get());
        // Poll both once so they queue up, without dropping them.
        assert!(tokio::time::timeout(Duration::from_millis(5), first.as_mut())
            .await
            .is_err());
        assert!(tokio::time::timeout(Duration::from_millis(5), second.as_mut())
            .await
            .is_err());
        assert_eq!(pool.stats().waiting, 2);
        // Handed to the first waiter, which never picks it up.
        drop(held);
        drop(first);
        let lease = second.await.unwrap();
        let state = pool.stats();
        assert_eq!((state.idle, state.leased, state.waiting), (0, 1, 0));
        drop(lease);
    }

    #[tokio::test]
    async fn grant_in_flight_returns_to_idle() {
        let (pool, _) = echo_pool(config(1).waiting(None));
        let held = pool.get().await.unwrap();
        let mut waiting = Box::pin(pool.get());
        assert!(tokio::time::timeout(Duration::from_millis(5), waiting.as_mut())
            .await
            .is_err());
        drop(held);
        drop(waiting);
        let state = pool.stats();
        assert_eq!((state.idle, state.leased, state.waiting), (1, 0, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_factory_hands_slot_to_waiter() {
        let gate = Arc::new(Barrier::new(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let pool = Pool::new(config(2).waiting(None), {
            let gate = gate.clone();
            let calls = calls.clone();
            move || {
                if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                    gate.wait();
                    panic!("second worker fails to start");
                }
                Echo
            }
        });
        let held = pool.get().await.unwrap();
        let doomed = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get().await.map(drop) }
        });
        // Second creation is under way, so the next caller has to queue.
        wait_for(&pool, |state| state.pending == 1).await;
        let waiter = tokio::spawn({
            let pool = pool.clone();
            async move { pool.get().await.map(|lease| lease.id()) }
        });
        wait_for_waiters(&pool, 1).await;
        tokio::task::spawn_blocking(move || {
            gate.wait();
        })
        .await
        .unwrap();
        assert!(doomed.await.unwrap_err().is_panic());
        let id = waiter.await.unwrap().unwrap();
        assert_ne!(id, held.id());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let state = pool.stats();
        assert_eq!(
            (state.idle, state.leased, state.pending, state.waiting),
            (1, 1, 0, 0)
        );
    }

    #[tokio::test]
    async fn execute_passes_errors_through() {
        let (pool, _) = echo_pool(config(1));
        assert_eq!(pool.execute("GET /api/data".into()).await.unwrap(), "GET /api/data");
        assert!(matches!(
            pool.execute(String::new()).await,
            Err(Error::Execution(EmptyJob))
        ));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tasks_respect_capacity() {
        const CAPACITY: usize = 2;
        let (pool, created) = echo_pool(config(CAPACITY).waiting(None));
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    for j in 0..50 {
                        let out = pool.execute(format!("job {i}/{j}")).await.unwrap();
                        assert_eq!(out, format!("job {i}/{j}"));
                        let state = pool.stats();
                        assert!(state.idle + state.leased + state.pending <= CAPACITY);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert!(created.load(Ordering::SeqCst) <= CAPACITY);
        assert_eq!(pool.stats().leased, 0);
    }
}
