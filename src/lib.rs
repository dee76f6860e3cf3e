//! Context-scoped access to a pool of cache servers and a chunked file store.
//!
//! Keys are spread over the configured cache hosts with a consistent hash
//! ring. A unit of work opens a [`ResourceContext`], enters it, and calls the
//! free functions in [`cache`] and [`filestore`]; they find the current
//! context on this thread and borrow its lazily opened connections. Leaving
//! the outermost scope closes everything the context opened.
//!
//! # Example
//!
//! ```no_run
//! use backbone::{Config, ResourceContext, cache, filestore};
//! use std::time::Duration;
//!
//! let config = Config::load("backbone.toml".as_ref())?;
//! backbone::logging::init(&config.logging);
//!
//! let ctx = ResourceContext::new(&config)?;
//! ctx.scope(|| {
//!     cache::write_list(
//!         b"recent",
//!         ["a", "b", "c"],
//!         cache::WriteOptions::default().expire(Duration::from_secs(60)),
//!     )?;
//!     let recent = cache::read(b"recent", cache::Read::ALL, None)?.into_items();
//!     assert_eq!(recent.len(), 3);
//!
//!     let id = filestore::put("hello.txt", b"hello", true, Default::default())?;
//!     let (data, _info) = filestore::get(id)?;
//!     assert_eq!(data, b"hello");
//!     Ok(())
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod filestore;
pub mod logging;
pub mod metrics;
pub mod resp;
pub mod ring;
pub mod store;

pub use config::{Config, ConfigError};
pub use context::{CacheHandle, ContextGuard, ResourceContext};
pub use error::{Error, Result};
pub use filestore::{FileId, FileInfo, IntoFileId, Metadata};
pub use ring::HashRing;
pub use store::DocumentStore;
