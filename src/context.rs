//! Scoped, per-thread resource contexts.
//!
//! A [`ResourceContext`] owns every connection a unit of work opens: one
//! cache connection per host it touched and, if used, the document store.
//! Entering a context pushes it onto this thread's stack and returns a
//! [`ContextGuard`]; dropping the guard pops it. When the outermost guard of
//! a context drops, all of its connections are closed, whether the scope
//! ended normally, with an error, or by unwinding.
//!
//! Contexts hold `Rc`s and are therefore neither `Send` nor `Sync`: each
//! thread builds its own.
//!
//! ```no_run
//! use backbone::{Config, ResourceContext, cache};
//!
//! let ctx = ResourceContext::new(&Config::default())?;
//! ctx.scope(|| {
//!     cache::write(b"greeting", "hello", Default::default())?;
//!     cache::read(b"greeting", cache::Read::Get, None)
//! })?;
//! # Ok::<(), backbone::Error>(())
//! ```

use crate::backend::{
    ConnectionPool, Connector, HostAddr, SharedConnection, TcpConnector,
};
use crate::config::{Config, StoreConfig};
use crate::error::{Error, Result};
use crate::metrics::{CONTEXT_SCOPES, CONTEXTS_OPENED};
use crate::resp::{Request, Value};
use crate::ring::HashRing;
use crate::store::DocumentStore;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static STACK: RefCell<Vec<ResourceContext>> = const { RefCell::new(Vec::new()) };
}

/// A reentrant scope owning lazily opened connections.
///
/// Cloning yields another handle onto the same context.
#[derive(Clone)]
pub struct ResourceContext {
    inner: Rc<Inner>,
}

struct Inner {
    id: u64,
    ring: Arc<HashRing>,
    store_host: String,
    store_config: StoreConfig,
    timeout: Duration,
    state: RefCell<State>,
}

struct State {
    depth: usize,
    closed: bool,
    pool: ConnectionPool,
    store: Option<Rc<DocumentStore>>,
}

impl ResourceContext {
    /// Build a context from configuration alone.
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(config, None, None)
    }

    /// Build a context, overriding the configured cache hosts and store
    /// location. Hosts are validated here; nothing is connected until a
    /// handle is requested.
    pub fn open(
        config: &Config,
        cache_hosts: Option<&[String]>,
        store_host: Option<&str>,
    ) -> Result<Self> {
        let hosts = cache_hosts.unwrap_or(config.cache.servers.as_slice());
        for host in hosts {
            host.parse::<HostAddr>()?;
        }
        let ring = HashRing::get_or_build(hosts, config.cache.replicas)?;

        let store_host = store_host.unwrap_or(config.store.host.as_str()).trim();
        if store_host.is_empty() {
            return Err(Error::InvalidConfig("store host is empty".to_string()));
        }
        if config.store.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "chunk size must be positive".to_string(),
            ));
        }

        let timeout = config.cache.socket_timeout();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        CONTEXTS_OPENED.increment();
        tracing::debug!(context = id, hosts = hosts.len(), store = store_host, "created resource context");

        Ok(Self {
            inner: Rc::new(Inner {
                id,
                ring,
                store_host: store_host.to_string(),
                store_config: config.store.clone(),
                timeout,
                state: RefCell::new(State {
                    depth: 0,
                    closed: false,
                    pool: ConnectionPool::new(Arc::new(TcpConnector), timeout),
                    store: None,
                }),
            }),
        })
    }

    /// Use `connector` for cache connections instead of TCP.
    ///
    /// Connections already opened through the previous connector are closed.
    pub fn with_connector(self, connector: impl Connector + 'static) -> Self {
        {
            let mut state = self.inner.state.borrow_mut();
            state.pool.close_all();
            state.pool = ConnectionPool::new(Arc::new(connector), self.inner.timeout);
        }
        self
    }

    /// The innermost context entered on this thread.
    pub fn current() -> Option<ResourceContext> {
        STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// Like [`current`](Self::current), failing with
    /// [`Error::NoActiveContext`] when none is entered.
    pub fn require() -> Result<ResourceContext> {
        Self::current().ok_or(Error::NoActiveContext)
    }

    /// Make this the current context until the returned guard drops.
    ///
    /// A context may be entered again while already entered; its
    /// connections are released only when the outermost guard drops.
    pub fn enter(&self) -> Result<ContextGuard> {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return Err(Error::ContextClosed);
            }
            state.depth += 1;
            tracing::trace!(context = self.inner.id, depth = state.depth, "entered resource context");
        }
        STACK.with(|stack| stack.borrow_mut().push(self.clone()));
        CONTEXT_SCOPES.increment();
        Ok(ContextGuard {
            context: self.clone(),
        })
    }

    /// Run `f` with this context entered.
    pub fn scope<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let _guard = self.enter()?;
        f()
    }

    /// A connection to the cache host owning `key`, opened on first use.
    pub fn cache_handle(&self, key: &[u8]) -> Result<CacheHandle> {
        let host = self.inner.ring.locate(key);
        let mut state = self.inner.state.borrow_mut();
        if state.closed {
            return Err(Error::ContextClosed);
        }
        let conn = state.pool.get_or_connect(host)?;
        Ok(CacheHandle {
            host: host.to_string(),
            conn,
        })
    }

    /// The document store, opened on first use.
    pub fn store_handle(&self) -> Result<Rc<DocumentStore>> {
        let mut state = self.inner.state.borrow_mut();
        if state.closed {
            return Err(Error::ContextClosed);
        }
        if let Some(store) = &state.store {
            return Ok(store.clone());
        }
        let store = Rc::new(DocumentStore::new(
            &self.inner.store_host,
            self.inner.store_config.clone(),
        )?);
        state.store = Some(store.clone());
        Ok(store)
    }

    /// Run `f` against a database of the document store; `None` selects the
    /// configured default database.
    pub fn with_database<T>(
        &self,
        name: Option<&str>,
        f: impl FnOnce(&rusqlite::Connection) -> Result<T>,
    ) -> Result<T> {
        let store = self.store_handle()?;
        let conn = match name {
            Some(name) => store.database(name)?,
            None => store.default_database()?,
        };
        f(&conn)
    }

    /// The ring routing keys for this context.
    pub fn ring(&self) -> &HashRing {
        &self.inner.ring
    }

    pub fn store_config(&self) -> &StoreConfig {
        &self.inner.store_config
    }

    /// Number of guards currently holding this context entered.
    pub fn depth(&self) -> usize {
        self.inner.state.borrow().depth
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// Cache connections currently open.
    pub fn connection_count(&self) -> usize {
        self.inner.state.borrow().pool.connection_count()
    }

    /// Whether two handles refer to the same context.
    pub fn same(&self, other: &ResourceContext) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn exit(&self) {
        // Guards normally drop in reverse order; if not, remove this
        // context's most recent entry wherever it is.
        let _ = STACK.try_with(|stack| {
            let mut stack = stack.borrow_mut();
            if let Some(pos) = stack.iter().rposition(|ctx| ctx.same(self)) {
                stack.remove(pos);
            }
        });
        CONTEXT_SCOPES.decrement();

        let Ok(mut state) = self.inner.state.try_borrow_mut() else {
            return;
        };
        state.depth = state.depth.saturating_sub(1);
        tracing::trace!(context = self.inner.id, depth = state.depth, "left resource context");
        if state.depth == 0 {
            state.closed = true;
            let connections = state.pool.connection_count();
            state.pool.close_all();
            if let Some(store) = state.store.take() {
                store.close();
            }
            tracing::debug!(context = self.inner.id, connections, "released resource context");
        }
    }
}

impl fmt::Debug for ResourceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("ResourceContext");
        out.field("id", &self.inner.id)
            .field("hosts", &self.inner.ring.hosts())
            .field("store", &self.inner.store_host);
        if let Ok(state) = self.inner.state.try_borrow() {
            out.field("depth", &state.depth)
                .field("closed", &state.closed)
                .field("connections", &state.pool.connection_count());
        }
        out.finish()
    }
}

/// Keeps a context entered; dropping it leaves the context.
#[must_use = "the context is left as soon as the guard is dropped"]
pub struct ContextGuard {
    context: ResourceContext,
}

impl ContextGuard {
    pub fn context(&self) -> &ResourceContext {
        &self.context
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.context.exit();
    }
}

/// A cache connection lent out by a context.
///
/// Handles stay valid while the context is open. Once it closes, requests
/// through an old handle fail with a connection error.
pub struct CacheHandle {
    host: String,
    conn: SharedConnection,
}

impl CacheHandle {
    /// The ring host this handle talks to.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn execute(&self, request: &Request) -> Result<Value> {
        self.conn.borrow_mut().execute(request)
    }

    pub fn execute_atomic(&self, requests: &[Request]) -> Result<Vec<Value>> {
        self.conn.borrow_mut().execute_atomic(requests)
    }

    pub fn is_open(&self) -> bool {
        self.conn.borrow().is_open()
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHandle")
            .field("host", &self.host)
            .field("open", &self.is_open())
            .finish()
    }
}
