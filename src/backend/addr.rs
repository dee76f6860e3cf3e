//! Cache host addresses.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Port used when a cache host string omits one.
pub const DEFAULT_CACHE_PORT: u16 = 6379;

/// A parsed `address[:port]` host string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddr {
    host: String,
    port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `"host"`, `"host:port"` or `"[v6]:port"`, falling back to
    /// `default_port`.
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid(s, "empty host"));
        }

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| invalid(s, "unterminated '['"))?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(invalid(s, "garbage after ']'")),
                },
            }
        } else if s.matches(':').count() == 1 {
            let (host, port) = s.split_once(':').ok_or_else(|| invalid(s, "bad port"))?;
            (host, Some(port))
        } else {
            // Bare IPv6 literal or a plain host name.
            (s, None)
        };

        if host.is_empty() {
            return Err(invalid(s, "empty host"));
        }
        if host.chars().any(char::is_whitespace) {
            return Err(invalid(s, "whitespace in host"));
        }

        let port = match port {
            None => default_port,
            Some(p) => match p.parse::<u16>() {
                Ok(0) | Err(_) => return Err(invalid(s, "bad port")),
                Ok(port) => port,
            },
        };

        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for HostAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s, DEFAULT_CACHE_PORT)
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

fn invalid(s: &str, reason: &str) -> Error {
    Error::InvalidConfig(format!("malformed host {s:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port() {
        let addr: HostAddr = "localhost".parse().unwrap();
        assert_eq!(addr.host(), "localhost");
        assert_eq!(addr.port(), DEFAULT_CACHE_PORT);
        assert_eq!(addr.to_string(), "localhost:6379");
    }

    #[test]
    fn explicit_port() {
        let addr: HostAddr = "192.168.1.8:9000".parse().unwrap();
        assert_eq!(addr.host(), "192.168.1.8");
        assert_eq!(addr.port(), 9000);
    }

    #[test]
    fn ipv6() {
        let addr: HostAddr = "[::1]:7000".parse().unwrap();
        assert_eq!(addr.host(), "::1");
        assert_eq!(addr.port(), 7000);
        assert_eq!(addr.to_string(), "[::1]:7000");

        let addr: HostAddr = "::1".parse().unwrap();
        assert_eq!(addr.port(), DEFAULT_CACHE_PORT);

        let addr = HostAddr::parse("[fe80::2]", 1234).unwrap();
        assert_eq!(addr.host(), "fe80::2");
        assert_eq!(addr.port(), 1234);
    }

    #[test]
    fn malformed() {
        for bad in ["", "   ", ":6379", "host:", "host:abc", "host:0", "host:70000", "[::1", "[::1]x", "a b:1"] {
            assert!(
                matches!(bad.parse::<HostAddr>(), Err(Error::InvalidConfig(_))),
                "accepted {bad:?}"
            );
        }
    }
}
