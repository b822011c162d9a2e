//! Construction and provider options for the blob cache.
//!
//! Shaped like `syncstorage_settings::Settings` — a plain `serde`-deserializable
//! struct with a `Default` impl callers can layer a config file or env source
//! on top of. This crate does not itself read files or environment
//! variables; that loading step is left to the embedding application, the
//! same way `spec.md` scopes configuration parsing out of the core.

use serde_derive::Deserialize;

/// How a [`cache_sqlite::Provider`] should open (or create) its database,
/// per `spec.md` §6's "Construction options".
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ConstructionOptions {
    /// Filesystem path to the database file. Ignored when `memory` is set.
    pub path: Option<String>,

    /// Forces an in-memory database, ignoring `path`.
    pub memory: bool,

    /// Number of pooled connections. Defaults to the host's CPU count.
    pub num_conns: u32,

    /// When true, WAL mode is used and the shared cache is disabled, so
    /// multiple readers can proceed concurrently with a writer.
    pub concurrent_blob_reads: bool,

    /// Skip schema initialization; the caller guarantees the schema
    /// already exists (e.g. a previously-initialized database file).
    pub dont_init_schema: bool,

    /// Nonzero overrides the persisted `capacity` setting at construction
    /// time.
    pub capacity: u64,
}

impl Default for ConstructionOptions {
    fn default() -> Self {
        ConstructionOptions {
            path: None,
            memory: false,
            num_conns: num_cpus::get() as u32,
            concurrent_blob_reads: false,
            dont_init_schema: false,
            capacity: 0,
        }
    }
}

impl ConstructionOptions {
    /// `true` when the options request a single dedicated connection
    /// rather than a pool — see `spec.md` §4.2's "Single-connection
    /// serializer."
    pub fn wants_single_connection(&self) -> bool {
        self.num_conns <= 1
    }
}

/// The subset of [`ConstructionOptions`] the `Provider` itself consumes,
/// per `spec.md` §6's "Provider options."
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ProviderOptions {
    pub num_conns: u32,
    pub concurrent_blob_read: bool,
    /// Coalesce concurrent writers into single transactions via the write
    /// batcher. Disabling this routes every write directly through the
    /// pool instead.
    pub batch_writes: bool,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        ProviderOptions {
            num_conns: num_cpus::get() as u32,
            concurrent_blob_read: false,
            batch_writes: true,
        }
    }
}

impl From<&ConstructionOptions> for ProviderOptions {
    fn from(opts: &ConstructionOptions) -> Self {
        ProviderOptions {
            num_conns: opts.num_conns,
            concurrent_blob_read: opts.concurrent_blob_reads,
            batch_writes: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_num_conns_matches_host_cpus() {
        let opts = ConstructionOptions::default();
        assert_eq!(opts.num_conns, num_cpus::get() as u32);
        assert!(!opts.wants_single_connection() || num_cpus::get() == 1);
    }

    #[test]
    fn single_connection_detected() {
        let mut opts = ConstructionOptions::default();
        opts.num_conns = 1;
        assert!(opts.wants_single_connection());
        opts.num_conns = 0;
        assert!(opts.wants_single_connection());
    }
}
