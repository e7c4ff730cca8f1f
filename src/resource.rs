//! Pooled resources and leases used to borrow them.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use opentelemetry::KeyValue;

use crate::metrics::Metrics;

/// Reusable unit of work capacity.
///
/// Resources know nothing about the pool that owns them. A failed [`Resource::process`]
/// call must leave the resource fit for reuse.
pub trait Resource {
    /// Unit of work accepted by the resource.
    type Job;
    /// Result of successfully processing a job.
    type Output;
    /// Error raised when the underlying work fails.
    type Error;

    /// Process a single job.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the work itself failed. Input validation is the caller's job.
    fn process(&mut self, job: Self::Job) -> Result<Self::Output, Self::Error>;
}

/// Source of new resources for a pool.
///
/// Implemented for any `Fn() -> R` closure.
pub trait ResourceFactory<R>: Send + Sync {
    /// Construct a fresh resource.
    ///
    /// Called outside of the pool lock, at most once per capacity slot.
    fn create(&self) -> R;
}

impl<R, F> ResourceFactory<R> for F
where
    F: Fn() -> R + Send + Sync,
{
    fn create(&self) -> R {
        self()
    }
}

/// Opaque resource identifier, unique for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    /// Identifier of the pool that created the resource.
    pool: u64,
    /// Per-pool sequence number.
    seq: u64,
}

impl ResourceId {
    pub(crate) fn new(pool: u64, seq: u64) -> Self {
        Self { pool, seq }
    }

    /// Identifier of the pool that created this resource.
    #[must_use]
    pub fn pool_id(&self) -> u64 {
        self.pool
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pool, self.seq)
    }
}

/// Return path from a lease or a grant back to its pool.
pub(crate) trait Recycle<R>: Send + Sync {
    /// Put a leased resource back.
    fn recycle(&self, id: ResourceId, resource: R);
    /// Give up a capacity reservation without creating a resource.
    fn abandon(&self, id: ResourceId);
}

/// Exclusive borrow of a pooled resource.
///
/// Dropping the lease returns the resource to its pool. If the pool itself is gone by
/// then, the resource is dropped.
#[must_use]
pub struct Lease<R> {
    /// Resource identifier.
    id: ResourceId,
    /// Borrowed resource, only `None` after being handed back.
    resource: Option<R>,
    /// Pool to return the resource to.
    home: Weak<dyn Recycle<R>>,
    /// Linked metrics storage.
    metrics: Arc<Metrics>,
    /// Premade label used to record metrics.
    label: [KeyValue; 1],
    /// Checkout time.
    time: Instant,
}

impl<R> Lease<R> {
    pub(crate) fn new(
        id: ResourceId,
        resource: R,
        home: Weak<dyn Recycle<R>>,
        metrics: Arc<Metrics>,
        label: [KeyValue; 1],
    ) -> Self {
        Self {
            id,
            resource: Some(resource),
            home,
            metrics,
            label,
            time: Instant::now(),
        }
    }

    /// Identifier of the leased resource.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    /// Time elapsed since the resource was checked out.
    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.time.elapsed()
    }

    /// Record time spent outside the pool.
    pub(crate) fn record_use(&self) {
        self.metrics
            .use_time
            .record(self.time.elapsed().as_secs_f64(), &self.label);
    }

    /// Disassemble the lease without returning the resource anywhere.
    pub(crate) fn into_parts(mut self) -> (ResourceId, R) {
        let resource = self.resource.take().expect("lease holds its resource");
        (self.id, resource)
    }
}

impl<R> Deref for Lease<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect("lease holds its resource")
    }
}

impl<R> DerefMut for Lease<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect("lease holds its resource")
    }
}

impl<R> AsRef<R> for Lease<R> {
    fn as_ref(&self) -> &R {
        self
    }
}

impl<R> AsMut<R> for Lease<R> {
    fn as_mut(&mut self) -> &mut R {
        self
    }
}

impl<R: fmt::Debug> fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl<R> Drop for Lease<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.record_use();
            if let Some(home) = self.home.upgrade() {
                home.recycle(self.id, resource);
            }
        }
    }
}
