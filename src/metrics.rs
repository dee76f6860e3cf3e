//! Backbone metrics.

use metriken::{Counter, Gauge, metric};

/// Resource contexts constructed.
#[metric(name = "backbone_contexts_opened")]
pub static CONTEXTS_OPENED: Counter = Counter::new();

/// Context scopes currently entered on any thread.
#[metric(name = "backbone_context_scopes")]
pub static CONTEXT_SCOPES: Gauge = Gauge::new();

/// Hash rings built (memo misses).
#[metric(name = "backbone_ring_builds")]
pub static RING_BUILDS: Counter = Counter::new();

/// Cache connections opened.
#[metric(name = "backbone_cache_connects")]
pub static CACHE_CONNECTS: Counter = Counter::new();

/// Cache connection attempts that failed.
#[metric(name = "backbone_cache_connect_errors")]
pub static CACHE_CONNECT_ERRORS: Counter = Counter::new();

/// Cache connections currently open.
#[metric(name = "backbone_cache_connections")]
pub static CACHE_CONNECTIONS: Gauge = Gauge::new();

/// Single requests sent to cache servers.
#[metric(name = "backbone_cache_requests")]
pub static CACHE_REQUESTS: Counter = Counter::new();

/// Atomic batches sent to cache servers.
#[metric(name = "backbone_cache_batches")]
pub static CACHE_BATCHES: Counter = Counter::new();

/// Atomic batches that were not applied.
#[metric(name = "backbone_cache_batch_failures")]
pub static CACHE_BATCH_FAILURES: Counter = Counter::new();

/// Document store connections opened.
#[metric(name = "backbone_store_connects")]
pub static STORE_CONNECTS: Counter = Counter::new();

/// Files written to the file store.
#[metric(name = "backbone_files_put")]
pub static FILES_PUT: Counter = Counter::new();

/// Files read from the file store.
#[metric(name = "backbone_files_get")]
pub static FILES_GET: Counter = Counter::new();

/// Files removed from the file store.
#[metric(name = "backbone_files_deleted")]
pub static FILES_DELETED: Counter = Counter::new();
