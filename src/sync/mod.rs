//! Pool for synchronous code.
//!
//! Waiting callers park their thread. They are woken one at a time, in arrival order.

mod pool;

pub use crate::{error::Error, metrics::PoolState, resource::Lease, sync::pool::Pool};
