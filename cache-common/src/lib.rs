//! Shared error, metrics and pool-state types used by the blob cache crates.
//!
//! This mirrors the split `syncserver-common`/`syncserver-db-common` carry in
//! the wider sync storage family: one place for the error hierarchy, one for
//! the metrics wrapper, kept free of anything SQLite-specific so it can be
//! depended on by future pool implementations beyond `cache-sqlite`.

#[macro_use]
extern crate slog_scope;

pub mod error;
pub mod metrics;

pub use error::{StorageError, StorageErrorIntrospect, StorageErrorKind};
pub use metrics::Metrics;

/// A mockable snapshot of a connection pool's occupancy.
///
/// Mirrors `syncserver_db_common::PoolState`, generalized away from
/// `diesel::r2d2::State` since `cache-sqlite` drives its own pool
/// abstraction rather than diesel's.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub connections: u32,
    pub idle_connections: u32,
}

impl From<r2d2::State> for PoolState {
    fn from(state: r2d2::State) -> PoolState {
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }
}

/// Implemented by pool data structures so callers and tests can inspect
/// occupancy without depending on the concrete pool type.
pub trait GetPoolState {
    fn state(&self) -> PoolState;
}
