//! Error types and error support code.

use std::{convert::Infallible, fmt};

use crate::resource::{Lease, ResourceId};

/// Generalized error type used by both pool flavours.
///
/// Type parameter `E` is the error type of [`Resource::process`], and is only ever
/// produced by the `execute` family of methods. Plain acquisition uses the default
/// [`Infallible`].
///
/// [`Resource::process`]: crate::Resource::process
#[derive(Debug, thiserror::Error)]
pub enum Error<E = Infallible> {
    /// No capacity left in the pool, and waiting was not requested.
    #[error("pool is exhausted")]
    PoolExhausted,
    /// Resource acquisition took longer than the allowed waiting time.
    #[error("resource acquisition timeout")]
    AcquireTimeout,
    /// Released handle is not currently leased from this pool.
    #[error("unknown resource: {0}")]
    UnknownResource(ResourceId),
    /// Resource failed to process a job.
    #[error("job execution failed: {0}")]
    Execution(#[source] E),
}

impl Error {
    /// Convert a pool-level error into an error carrying execution failures of type `E`.
    #[must_use]
    pub fn cast<E>(self) -> Error<E> {
        match self {
            Self::PoolExhausted => Error::PoolExhausted,
            Self::AcquireTimeout => Error::AcquireTimeout,
            Self::UnknownResource(id) => Error::UnknownResource(id),
            Self::Execution(never) => match never {},
        }
    }
}

impl<E> Error<E> {
    /// Whether the caller can reasonably retry the operation later.
    ///
    /// Exhaustion and timeouts are backpressure signals. Releasing an unknown resource is
    /// a programming error, and execution failures are up to the resource to classify.
    #[must_use]
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Self::PoolExhausted | Self::AcquireTimeout)
    }
}

/// Error returned when releasing a lease that is not checked out from the pool.
///
/// The rejected lease is handed back intact, so the resource stays where it was.
/// Dropping the error drops the lease, which returns it to the pool it came from.
pub struct ReleaseError<R> {
    lease: Lease<R>,
}

impl<R> ReleaseError<R> {
    pub(crate) fn new(lease: Lease<R>) -> Self {
        Self { lease }
    }

    /// Identifier of the rejected resource.
    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.lease.id()
    }

    /// Take back the rejected lease.
    #[must_use]
    pub fn into_lease(self) -> Lease<R> {
        self.lease
    }
}

impl<R> fmt::Debug for ReleaseError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReleaseError")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl<R> fmt::Display for ReleaseError<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown resource: {}", self.id())
    }
}

impl<R> std::error::Error for ReleaseError<R> {}

impl<R, E> From<ReleaseError<R>> for Error<E> {
    fn from(err: ReleaseError<R>) -> Self {
        Self::UnknownResource(err.id())
    }
}
