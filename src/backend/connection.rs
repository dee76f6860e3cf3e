//! Blocking RESP connection over TCP.

use super::{Connection, Connector, HostAddr};
use crate::error::{Error, Result};
use crate::metrics::{CACHE_BATCH_FAILURES, CACHE_BATCHES, CACHE_REQUESTS};
use crate::resp::{ParseError, Request, Value};
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

const READ_CHUNK: usize = 16 * 1024;

/// Opens [`TcpConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, addr: &HostAddr, timeout: Duration) -> Result<Box<dyn Connection>> {
        Ok(Box::new(TcpConnection::connect(addr, timeout)?))
    }
}

/// A single connection to a cache server.
///
/// Requests are written in full, then replies are read back in order. Any
/// I/O or protocol failure leaves the stream in an unknown state, so the
/// connection is dropped and every later call fails.
pub struct TcpConnection {
    addr: HostAddr,
    stream: Option<TcpStream>,
    send_buf: Vec<u8>,
    recv_buf: BytesMut,
}

impl TcpConnection {
    /// Connect with `timeout` applied to connect, read and write. A zero
    /// timeout means block indefinitely.
    pub fn connect(addr: &HostAddr, timeout: Duration) -> Result<Self> {
        let candidates = (addr.host(), addr.port())
            .to_socket_addrs()
            .map_err(|e| Error::Connection(format!("cannot resolve {addr}: {e}")))?;

        let mut last_err = None;
        let mut stream = None;
        for candidate in candidates {
            let attempt = if timeout.is_zero() {
                TcpStream::connect(candidate)
            } else {
                TcpStream::connect_timeout(&candidate, timeout)
            };
            match attempt {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        let stream = stream.ok_or_else(|| match last_err {
            Some(e) => Error::Connection(format!("cannot connect to {addr}: {e}")),
            None => Error::Connection(format!("no addresses for {addr}")),
        })?;

        let socket_timeout = (!timeout.is_zero()).then_some(timeout);
        stream
            .set_read_timeout(socket_timeout)
            .and_then(|_| stream.set_write_timeout(socket_timeout))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| Error::Connection(format!("cannot configure socket for {addr}: {e}")))?;

        tracing::debug!(%addr, "connected to cache server");

        Ok(Self {
            addr: addr.clone(),
            stream: Some(stream),
            send_buf: Vec::with_capacity(4096),
            recv_buf: BytesMut::with_capacity(4096),
        })
    }

    /// Write `requests` and read `replies` values back.
    fn exchange(&mut self, requests: &[Request], replies: usize) -> Result<Vec<Value>> {
        self.send_buf.clear();
        for request in requests {
            request.encode(&mut self.send_buf);
        }

        let stream = self.stream.as_mut().ok_or_else(|| closed(&self.addr))?;
        stream.write_all(&self.send_buf).map_err(Error::from_socket)?;

        let mut values = Vec::with_capacity(replies);
        for _ in 0..replies {
            values.push(self.read_value()?);
        }
        Ok(values)
    }

    fn read_value(&mut self) -> Result<Value> {
        loop {
            if !self.recv_buf.is_empty() {
                match Value::parse(&self.recv_buf) {
                    Ok((value, consumed)) => {
                        self.recv_buf.advance(consumed);
                        return Ok(value);
                    }
                    Err(ParseError::Incomplete) => {}
                    Err(e) => return Err(Error::Protocol(e.to_string())),
                }
            }

            let stream = self.stream.as_mut().ok_or_else(|| closed(&self.addr))?;
            let mut chunk = [0u8; READ_CHUNK];
            let n = match stream.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from_socket(e)),
            };
            if n == 0 {
                return Err(Error::Connection(format!(
                    "connection to {} closed by server",
                    self.addr
                )));
            }
            self.recv_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Run an exchange, dropping the stream if it fails.
    fn guarded(&mut self, requests: &[Request], replies: usize) -> Result<Vec<Value>> {
        let result = self.exchange(requests, replies);
        if let Err(e) = &result {
            tracing::debug!(addr = %self.addr, error = %e, "dropping broken connection");
            self.close();
        }
        result
    }
}

impl Connection for TcpConnection {
    fn addr(&self) -> &HostAddr {
        &self.addr
    }

    fn execute(&mut self, request: &Request) -> Result<Value> {
        CACHE_REQUESTS.increment();
        let value = self
            .guarded(std::slice::from_ref(request), 1)?
            .pop()
            .ok_or_else(|| Error::Protocol("missing reply".to_string()))?;
        match value {
            Value::Error(_) => Err(Error::Server(value.error_message().unwrap_or_default())),
            value => Ok(value),
        }
    }

    fn execute_atomic(&mut self, requests: &[Request]) -> Result<Vec<Value>> {
        CACHE_BATCHES.increment();

        let mut batch = Vec::with_capacity(requests.len() + 2);
        batch.push(Request::multi());
        batch.extend_from_slice(requests);
        batch.push(Request::exec());

        let mut replies = self.guarded(&batch, batch.len())?;
        let exec = replies.pop().unwrap_or(Value::Null);

        let failure = match exec {
            Value::Array(results) if results.len() == requests.len() => {
                match results.iter().find_map(Value::error_message) {
                    None => return Ok(results),
                    Some(msg) => msg,
                }
            }
            Value::Array(_) => "transaction reply length mismatch".to_string(),
            Value::Error(msg) => {
                // EXECABORT: report the queueing error that caused it.
                replies
                    .iter()
                    .find_map(Value::error_message)
                    .unwrap_or_else(|| String::from_utf8_lossy(&msg).into_owned())
            }
            Value::Null => "transaction aborted".to_string(),
            other => format!("unexpected EXEC reply: {other:?}"),
        };

        CACHE_BATCH_FAILURES.increment();
        tracing::debug!(addr = %self.addr, %failure, "batch failed");
        Err(Error::BatchFailure(failure))
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            tracing::debug!(addr = %self.addr, "closed cache connection");
        }
        self.recv_buf.clear();
    }
}

fn closed(addr: &HostAddr) -> Error {
    Error::Connection(format!("connection to {addr} is closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufRead;
    use std::net::TcpListener;
    use std::thread;

    /// Accept one client and answer each request line-group with the next
    /// canned reply. Requests are consumed by counting RESP array headers.
    fn scripted_server(replies: Vec<&'static [u8]>) -> (HostAddr, thread::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = io::BufReader::new(stream.try_clone().unwrap());
            let mut writer = stream;
            let mut seen = Vec::new();
            for reply in replies {
                // Read one request: "*N" then N bulk strings (2 lines each).
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                seen.extend_from_slice(line.as_bytes());
                let n: usize = line.trim_end()[1..].parse().unwrap();
                for _ in 0..n * 2 {
                    line.clear();
                    reader.read_line(&mut line).unwrap();
                    seen.extend_from_slice(line.as_bytes());
                }
                writer.write_all(reply).unwrap();
            }
            seen
        });
        (HostAddr::new("127.0.0.1", port), handle)
    }

    #[test]
    fn execute_roundtrip() {
        let (addr, server) = scripted_server(vec![b"$5\r\nworld\r\n"]);
        let mut conn = TcpConnection::connect(&addr, Duration::from_secs(5)).unwrap();
        let value = conn.execute(&Request::get(b"hello")).unwrap();
        assert_eq!(value, Value::bulk("world"));
        assert!(conn.is_open());
        conn.close();
        assert!(!conn.is_open());

        let seen = server.join().unwrap();
        assert_eq!(&seen, b"*2\r\n$3\r\nGET\r\n$5\r\nhello\r\n");
    }

    #[test]
    fn server_error_reply() {
        let (addr, _server) = scripted_server(vec![b"-WRONGTYPE bad\r\n"]);
        let mut conn = TcpConnection::connect(&addr, Duration::from_secs(5)).unwrap();
        match conn.execute(&Request::get(b"k")) {
            Err(Error::Server(msg)) => assert_eq!(msg, "WRONGTYPE bad"),
            other => panic!("unexpected: {other:?}"),
        }
        // An error reply does not break the stream.
        assert!(conn.is_open());
    }

    #[test]
    fn atomic_batch_returns_results() {
        let (addr, _server) = scripted_server(vec![
            b"+OK\r\n",
            b"+QUEUED\r\n",
            b"+QUEUED\r\n",
            b"*2\r\n:1\r\n:1\r\n",
        ]);
        let mut conn = TcpConnection::connect(&addr, Duration::from_secs(5)).unwrap();
        let results = conn
            .execute_atomic(&[
                Request::rpush(b"k", "a".into()),
                Request::pexpire(b"k", 1000),
            ])
            .unwrap();
        assert_eq!(results, vec![Value::Integer(1), Value::Integer(1)]);
    }

    #[test]
    fn aborted_batch_is_batch_failure() {
        let (addr, _server) = scripted_server(vec![
            b"+OK\r\n",
            b"-ERR wrong number of arguments\r\n",
            b"-EXECABORT Transaction discarded\r\n",
        ]);
        let mut conn = TcpConnection::connect(&addr, Duration::from_secs(5)).unwrap();
        match conn.execute_atomic(&[Request::cmd("RPUSH")]) {
            Err(Error::BatchFailure(msg)) => assert!(msg.contains("wrong number")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn read_timeout_is_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            // Accept and never answer.
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_millis(500));
            drop(stream);
        });

        let addr = HostAddr::new("127.0.0.1", port);
        let mut conn = TcpConnection::connect(&addr, Duration::from_millis(50)).unwrap();
        assert!(matches!(conn.execute(&Request::ping()), Err(Error::Timeout)));
        assert!(!conn.is_open());
        assert!(matches!(
            conn.execute(&Request::ping()),
            Err(Error::Connection(_))
        ));
        server.join().unwrap();
    }

    #[test]
    fn refused_connect_is_connection_error() {
        // Bind then drop to find a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let addr = HostAddr::new("127.0.0.1", port);
        assert!(matches!(
            TcpConnection::connect(&addr, Duration::from_secs(1)),
            Err(Error::Connection(_))
        ));
    }
}
