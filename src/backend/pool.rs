//! Per-context cache connection pool.

use super::{Connection, Connector, HostAddr};
use crate::error::Result;
use crate::metrics::{CACHE_CONNECT_ERRORS, CACHE_CONNECTIONS, CACHE_CONNECTS};
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

/// A connection shared between its pool and the handles lent out from it.
pub(crate) type SharedConnection = Rc<RefCell<Box<dyn Connection>>>;

/// One lazily opened connection per cache host.
///
/// Owned by a single context; never shared across threads.
pub struct ConnectionPool {
    connector: Arc<dyn Connector>,

    /// Socket timeout for new connections.
    timeout: Duration,

    /// Connections indexed by the host string used on the ring.
    connections: AHashMap<String, SharedConnection>,
}

impl ConnectionPool {
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self {
            connector,
            timeout,
            connections: AHashMap::new(),
        }
    }

    /// Get the connection for `host`, opening it on first use.
    pub(crate) fn get_or_connect(&mut self, host: &str) -> Result<SharedConnection> {
        if let Some(conn) = self.connections.get(host) {
            return Ok(conn.clone());
        }

        let addr: HostAddr = host.parse()?;
        let conn = match self.connector.connect(&addr, self.timeout) {
            Ok(conn) => conn,
            Err(e) => {
                CACHE_CONNECT_ERRORS.increment();
                return Err(e);
            }
        };
        CACHE_CONNECTS.increment();
        CACHE_CONNECTIONS.increment();

        let conn = Rc::new(RefCell::new(conn));
        self.connections.insert(host.to_string(), conn.clone());
        Ok(conn)
    }

    /// Get current number of connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Hosts with an open connection.
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.connections.keys().map(String::as_str)
    }

    /// Close and forget every connection.
    pub fn close_all(&mut self) {
        for (host, conn) in self.connections.drain() {
            conn.borrow_mut().close();
            CACHE_CONNECTIONS.decrement();
            tracing::trace!(%host, "released cache connection");
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryConnector;
    use crate::error::Error;

    #[test]
    fn connects_once_per_host() {
        let connector = MemoryConnector::new();
        let mut pool = ConnectionPool::new(Arc::new(connector.clone()), Duration::from_secs(1));

        let a = pool.get_or_connect("a:1").unwrap();
        let b = pool.get_or_connect("a:1").unwrap();
        assert!(Rc::ptr_eq(&a, &b));
        pool.get_or_connect("b:1").unwrap();

        assert_eq!(pool.connection_count(), 2);
        assert_eq!(connector.open_connections(), 2);

        pool.close_all();
        assert_eq!(pool.connection_count(), 0);
        assert_eq!(connector.open_connections(), 0);
        assert!(!a.borrow().is_open());
    }

    #[test]
    fn connect_failure_propagates() {
        let connector = MemoryConnector::new();
        connector.refuse("down:1");
        let mut pool = ConnectionPool::new(Arc::new(connector.clone()), Duration::from_secs(1));

        assert!(matches!(
            pool.get_or_connect("down:1"),
            Err(Error::Connection(_))
        ));
        assert_eq!(pool.connection_count(), 0);
    }

    #[test]
    fn drop_closes() {
        let connector = MemoryConnector::new();
        {
            let mut pool =
                ConnectionPool::new(Arc::new(connector.clone()), Duration::from_secs(1));
            pool.get_or_connect("a:1").unwrap();
            assert_eq!(connector.open_connections(), 1);
        }
        assert_eq!(connector.open_connections(), 0);
    }
}
