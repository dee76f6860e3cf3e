//! Embedded document store.
//!
//! A store is rooted at the configured host: either a directory holding one
//! SQLite file per database name, or `:memory:`. Databases are opened on
//! first use and kept until the owning context closes the store.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::metrics::STORE_CONNECTS;
use ahash::AHashMap;
use rusqlite::Connection;
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Store host value selecting a non-persistent store.
pub const MEMORY_HOST: &str = ":memory:";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Root {
    Memory,
    Dir(PathBuf),
}

/// Lazily opened connections to the databases of one store.
pub struct DocumentStore {
    root: Root,
    config: StoreConfig,
    databases: RefCell<AHashMap<String, Rc<Connection>>>,
    closed: Cell<bool>,
}

impl DocumentStore {
    /// Prepare a store for `host`. Nothing is opened until a database is
    /// requested.
    pub fn new(host: &str, config: StoreConfig) -> Result<Self> {
        let host = host.trim();
        let root = match host {
            "" => return Err(Error::InvalidConfig("store host is empty".to_string())),
            MEMORY_HOST => Root::Memory,
            dir => Root::Dir(PathBuf::from(dir)),
        };
        validate_name(&config.database)?;
        validate_name(&config.files_database)?;
        if config.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "chunk size must be positive".to_string(),
            ));
        }

        Ok(Self {
            root,
            config,
            databases: RefCell::new(AHashMap::new()),
            closed: Cell::new(false),
        })
    }

    /// Directory holding the database files, `None` for an in-memory store.
    pub fn root(&self) -> Option<&Path> {
        match &self.root {
            Root::Memory => None,
            Root::Dir(dir) => Some(dir),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The named database, opened on first use.
    pub fn database(&self, name: &str) -> Result<Rc<Connection>> {
        if self.closed.get() {
            return Err(Error::ContextClosed);
        }
        if let Some(conn) = self.databases.borrow().get(name) {
            return Ok(conn.clone());
        }

        validate_name(name)?;
        let conn = match &self.root {
            Root::Memory => Connection::open_in_memory()?,
            Root::Dir(dir) => {
                std::fs::create_dir_all(dir)?;
                Connection::open(dir.join(format!("{name}.db")))?
            }
        };
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        STORE_CONNECTS.increment();
        tracing::debug!(database = name, root = ?self.root(), "opened document database");

        let conn = Rc::new(conn);
        self.databases
            .borrow_mut()
            .insert(name.to_string(), conn.clone());
        Ok(conn)
    }

    /// The configured default database.
    pub fn default_database(&self) -> Result<Rc<Connection>> {
        self.database(&self.config.database)
    }

    /// The database holding the file store.
    pub fn files_database(&self) -> Result<Rc<Connection>> {
        self.database(&self.config.files_database)
    }

    /// Number of databases currently open.
    pub fn open_databases(&self) -> usize {
        self.databases.borrow().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Drop every open database. Later requests fail with
    /// [`Error::ContextClosed`].
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        for (name, _) in self.databases.borrow_mut().drain() {
            tracing::trace!(database = %name, "closed document database");
        }
    }
}

/// Database names become file names, so keep them to a safe alphabet.
fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidConfig(format!(
            "invalid database name {name:?}"
        )))
    }
}
