#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]
#![deny(elided_lifetimes_in_paths, unreachable_pub)]
#![warn(
    missing_docs,
    clippy::doc_link_with_quotes,
    clippy::doc_markdown,
    clippy::missing_errors_doc
)]

#[cfg(feature = "async")]
pub mod r#async;
pub mod config;
pub mod error;
mod inventory;
mod metrics;
mod resource;
mod shared;
pub mod sync;

pub use crate::{
    config::{ConfigError, ExhaustionPolicy, PoolConfig, PoolConfigLoader},
    error::{Error, ReleaseError},
    metrics::PoolState,
    resource::{Lease, Resource, ResourceFactory, ResourceId},
};
