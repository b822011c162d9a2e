//! A persistent, capacity-bounded SQLite blob cache: a durable
//! key→blob table with trigger-enforced LRU eviction, a write-batching
//! coordinator, and a random-access blob interface for callers that
//! assemble a file from named chunks.

#[macro_use]
extern crate slog_scope;

mod batch;
pub mod init;
mod instance;
mod pool;
pub mod provider;
pub mod schema;

pub use instance::{BlobReader, FileInfo, Instance, ReadAt, Resource};
pub use pool::{ConnPool, MultiConnPool, PooledConn, SingleConnPool};
pub use provider::Provider;

pub use cache_common::{StorageError, StorageErrorIntrospect, StorageErrorKind};
pub use cache_settings::{ConstructionOptions, ProviderOptions};
