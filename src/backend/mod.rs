//! Cache server connections.
//!
//! A [`Connector`] opens one [`Connection`] per cache host. The context keeps
//! those connections in a [`ConnectionPool`] and closes them on scope exit.
//! [`TcpConnector`] speaks RESP to real servers; [`MemoryConnector`] serves
//! the same commands from in-process maps.

mod addr;
mod connection;
mod memory;
mod pool;

pub use addr::{DEFAULT_CACHE_PORT, HostAddr};
pub use connection::{TcpConnection, TcpConnector};
pub use memory::{MemoryConnection, MemoryConnector, MemoryServer};
pub use pool::ConnectionPool;

pub(crate) use pool::SharedConnection;

use crate::error::Result;
use crate::resp::{Request, Value};
use std::time::Duration;

/// An open connection to one cache host.
pub trait Connection {
    /// The host this connection talks to.
    fn addr(&self) -> &HostAddr;

    /// Send one request and wait for its reply.
    ///
    /// An error reply from the server is returned as
    /// [`Error::Server`](crate::Error::Server).
    fn execute(&mut self, request: &Request) -> Result<Value>;

    /// Apply `requests` as one transaction, returning one reply per request.
    ///
    /// No other client's command runs between the steps. If any step fails
    /// the call fails with [`Error::BatchFailure`](crate::Error::BatchFailure);
    /// a remote server does not undo the steps that ran before it, so
    /// callers rule out such failures before sending (see
    /// [`cache::write`](crate::cache::write)).
    fn execute_atomic(&mut self, requests: &[Request]) -> Result<Vec<Value>>;

    /// False once closed or broken by an I/O failure.
    fn is_open(&self) -> bool;

    /// Close the connection. Later calls fail with a connection error.
    fn close(&mut self);
}

/// Opens connections to cache hosts.
pub trait Connector: Send + Sync {
    fn connect(&self, addr: &HostAddr, timeout: Duration) -> Result<Box<dyn Connection>>;
}
