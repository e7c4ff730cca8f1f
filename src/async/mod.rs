//! Pool for asynchronous code.
//!
//! Waiting callers suspend their task rather than a thread. A waiting acquisition is
//! cancelled by dropping its future, e.g. from `tokio::time::timeout` or `tokio::select!`.

mod pool;

pub use crate::{error::Error, metrics::PoolState, r#async::pool::Pool, resource::Lease};
