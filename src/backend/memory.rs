//! In-process cache servers.
//!
//! [`MemoryConnector`] keeps one [`MemoryServer`] per host address and hands
//! out connections to it, so several contexts (and threads) observe the same
//! data exactly as they would against a real server. Only the commands the
//! cache layer issues are understood.

use super::{Connection, Connector, HostAddr};
use crate::error::{Error, Result};
use crate::metrics::{CACHE_BATCH_FAILURES, CACHE_BATCHES, CACHE_REQUESTS};
use crate::resp::{Request, Value};
use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const WRONGTYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Connects to in-process servers, creating each server on first use.
///
/// Clones share the same servers.
#[derive(Clone, Default)]
pub struct MemoryConnector {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    servers: Mutex<AHashMap<HostAddr, Arc<Mutex<MemoryServer>>>>,
    refused: Mutex<AHashSet<HostAddr>>,
    open: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections currently open across all servers.
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Make future connects to `host` fail, as if the server were down.
    pub fn refuse(&self, host: &str) {
        match host.parse::<HostAddr>() {
            Ok(addr) => {
                self.inner.refused.lock().insert(addr);
            }
            Err(e) => tracing::warn!(%host, error = %e, "ignoring malformed host"),
        }
    }

    /// Whether the server at `host` currently holds `key`.
    pub fn contains_key(&self, host: &str, key: &[u8]) -> bool {
        let Ok(addr) = host.parse::<HostAddr>() else {
            return false;
        };
        let server = self.inner.servers.lock().get(&addr).cloned();
        match server {
            Some(server) => server.lock().exists(key, Instant::now()),
            None => false,
        }
    }

    fn server(&self, addr: &HostAddr) -> Arc<Mutex<MemoryServer>> {
        self.inner
            .servers
            .lock()
            .entry(addr.clone())
            .or_default()
            .clone()
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, addr: &HostAddr, _timeout: Duration) -> Result<Box<dyn Connection>> {
        if self.inner.refused.lock().contains(addr) {
            return Err(Error::Connection(format!(
                "cannot connect to {addr}: connection refused"
            )));
        }
        let server = self.server(addr);
        self.inner.open.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MemoryConnection {
            addr: addr.clone(),
            server,
            shared: self.inner.clone(),
            open: true,
        }))
    }
}

/// A connection to a [`MemoryServer`].
pub struct MemoryConnection {
    addr: HostAddr,
    server: Arc<Mutex<MemoryServer>>,
    shared: Arc<Shared>,
    open: bool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Connection(format!(
                "connection to {} is closed",
                self.addr
            )))
        }
    }
}

impl Connection for MemoryConnection {
    fn addr(&self) -> &HostAddr {
        &self.addr
    }

    fn execute(&mut self, request: &Request) -> Result<Value> {
        self.check_open()?;
        CACHE_REQUESTS.increment();
        let value = self.server.lock().apply(request, Instant::now());
        match value.error_message() {
            Some(msg) => Err(Error::Server(msg)),
            None => Ok(value),
        }
    }

    fn execute_atomic(&mut self, requests: &[Request]) -> Result<Vec<Value>> {
        self.check_open()?;
        CACHE_BATCHES.increment();

        // Apply to a copy of the touched keys while holding the server lock;
        // publish only if every step succeeded.
        let mut server = self.server.lock();
        let mut staged = server.stage(requests);
        let now = Instant::now();
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let value = staged.apply(request, now);
            if let Some(msg) = value.error_message() {
                CACHE_BATCH_FAILURES.increment();
                return Err(Error::BatchFailure(msg));
            }
            results.push(value);
        }
        server.commit(staged, requests);
        Ok(results)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.shared.open.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug, Clone)]
enum Data {
    Str(Bytes),
    Hash(BTreeMap<Bytes, Bytes>),
    List(Vec<Bytes>),
    Set(BTreeSet<Bytes>),
    /// Kept sorted by (score, member).
    SortedSet(Vec<(f64, Bytes)>),
}

impl Data {
    /// The name TYPE reports.
    fn type_name(&self) -> &'static str {
        match self {
            Data::Str(_) => "string",
            Data::Hash(_) => "hash",
            Data::List(_) => "list",
            Data::Set(_) => "set",
            Data::SortedSet(_) => "zset",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Data::Str(_) => false,
            Data::Hash(h) => h.is_empty(),
            Data::List(l) => l.is_empty(),
            Data::Set(s) => s.is_empty(),
            Data::SortedSet(z) => z.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

/// The keyspace of one in-process cache server.
///
/// WATCH and UNWATCH are accepted and ignored: connections apply whole
/// batches under the server lock, so nothing can change in between.
#[derive(Debug, Clone, Default)]
pub struct MemoryServer {
    entries: AHashMap<Bytes, Entry>,
}

type Reply = std::result::Result<Value, Value>;

impl MemoryServer {
    /// Execute one request, returning the reply a server would send.
    pub fn apply(&mut self, request: &Request, now: Instant) -> Value {
        let name = String::from_utf8_lossy(request.command()).to_ascii_uppercase();
        self.dispatch(&name, request.args(), now)
            .unwrap_or_else(|err| err)
    }

    fn exists(&mut self, key: &[u8], now: Instant) -> bool {
        self.live(key, now).is_some()
    }

    /// A server holding copies of just the entries `requests` touch.
    fn stage(&self, requests: &[Request]) -> MemoryServer {
        let entries = requests
            .iter()
            .flat_map(touched_keys)
            .filter_map(|key| self.entries.get_key_value(key))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        MemoryServer { entries }
    }

    /// Replace the entries `requests` touch with their staged state.
    fn commit(&mut self, staged: MemoryServer, requests: &[Request]) {
        for key in requests.iter().flat_map(touched_keys) {
            self.entries.remove(key);
        }
        self.entries.extend(staged.entries);
    }

    /// The entry for `key`, evicting it first if it has expired.
    fn live(&mut self, key: &[u8], now: Instant) -> Option<&mut Entry> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires_at.is_some_and(|at| at <= now),
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    /// The live entry for `key`, created with `init` if missing.
    fn entry_or(&mut self, key: &Bytes, now: Instant, init: fn() -> Data) -> &mut Entry {
        self.live(key, now);
        self.entries.entry(key.clone()).or_insert_with(|| Entry {
            data: init(),
            expires_at: None,
        })
    }

    fn remove_if_empty(&mut self, key: &[u8]) {
        if self.entries.get(key).is_some_and(|e| e.data.is_empty()) {
            self.entries.remove(key);
        }
    }

    fn dispatch(&mut self, name: &str, args: &[Bytes], now: Instant) -> Reply {
        match name {
            "PING" => Ok(Value::SimpleString(Bytes::from_static(b"PONG"))),
            "WATCH" => {
                arity(name, args, 1, None)?;
                Ok(Value::ok())
            }
            "UNWATCH" => Ok(Value::ok()),
            "TYPE" => {
                arity(name, args, 1, Some(1))?;
                let kind = self
                    .live(&args[0], now)
                    .map_or("none", |entry| entry.data.type_name());
                Ok(Value::SimpleString(Bytes::from_static(kind.as_bytes())))
            }
            "GET" => {
                arity(name, args, 1, Some(1))?;
                match self.live(&args[0], now) {
                    None => Ok(Value::Null),
                    Some(Entry {
                        data: Data::Str(v), ..
                    }) => Ok(Value::BulkString(v.clone())),
                    Some(_) => Err(Value::error(WRONGTYPE)),
                }
            }
            "GETRANGE" => {
                arity(name, args, 3, Some(3))?;
                let start = int_arg(&args[1])?;
                let end = int_arg(&args[2])?;
                match self.live(&args[0], now) {
                    None => Ok(Value::bulk("")),
                    Some(Entry {
                        data: Data::Str(v), ..
                    }) => Ok(match clamp_range(v.len(), start, end) {
                        Some((from, to)) => Value::BulkString(v.slice(from..=to)),
                        None => Value::bulk(""),
                    }),
                    Some(_) => Err(Value::error(WRONGTYPE)),
                }
            }
            "SET" => {
                arity(name, args, 2, Some(2))?;
                self.entries.insert(
                    args[0].clone(),
                    Entry {
                        data: Data::Str(args[1].clone()),
                        expires_at: None,
                    },
                );
                Ok(Value::ok())
            }
            "DEL" | "EXISTS" => {
                arity(name, args, 1, None)?;
                let mut count = 0;
                for key in args {
                    if self.live(key, now).is_some() {
                        count += 1;
                        if name == "DEL" {
                            self.entries.remove(key);
                        }
                    }
                }
                Ok(Value::Integer(count))
            }
            "EXPIRE" | "PEXPIRE" => {
                arity(name, args, 2, Some(2))?;
                let amount = int_arg(&args[1])?;
                if self.live(&args[0], now).is_none() {
                    return Ok(Value::Integer(0));
                }
                if amount <= 0 {
                    self.entries.remove(&args[0]);
                } else {
                    let amount = amount as u64;
                    let ttl = if name == "EXPIRE" {
                        Duration::from_secs(amount)
                    } else {
                        Duration::from_millis(amount)
                    };
                    let at = now.checked_add(ttl).ok_or_else(|| {
                        Value::error(format!(
                            "ERR invalid expire time in '{}' command",
                            name.to_ascii_lowercase()
                        ))
                    })?;
                    if let Some(entry) = self.live(&args[0], now) {
                        entry.expires_at = Some(at);
                    }
                }
                Ok(Value::Integer(1))
            }
            "PERSIST" => {
                arity(name, args, 1, Some(1))?;
                match self.live(&args[0], now) {
                    Some(entry) if entry.expires_at.is_some() => {
                        entry.expires_at = None;
                        Ok(Value::Integer(1))
                    }
                    _ => Ok(Value::Integer(0)),
                }
            }
            "TTL" | "PTTL" => {
                arity(name, args, 1, Some(1))?;
                Ok(Value::Integer(match self.live(&args[0], now) {
                    None => -2,
                    Some(Entry {
                        expires_at: None, ..
                    }) => -1,
                    Some(Entry {
                        expires_at: Some(at),
                        ..
                    }) => {
                        let ms = at.saturating_duration_since(now).as_millis() as i64;
                        if name == "TTL" { (ms + 500) / 1000 } else { ms }
                    }
                }))
            }
            "HSET" => {
                arity(name, args, 3, None)?;
                if args.len() % 2 != 1 {
                    return Err(wrong_arity(name));
                }
                let entry = self.entry_or(&args[0], now, || Data::Hash(BTreeMap::new()));
                let Data::Hash(hash) = &mut entry.data else {
                    return Err(Value::error(WRONGTYPE));
                };
                let mut added = 0;
                for pair in args[1..].chunks(2) {
                    if hash.insert(pair[0].clone(), pair[1].clone()).is_none() {
                        added += 1;
                    }
                }
                Ok(Value::Integer(added))
            }
            "HGET" => {
                arity(name, args, 2, Some(2))?;
                match self.live(&args[0], now) {
                    None => Ok(Value::Null),
                    Some(Entry {
                        data: Data::Hash(hash),
                        ..
                    }) => Ok(hash
                        .get(&args[1])
                        .map(|v| Value::BulkString(v.clone()))
                        .unwrap_or(Value::Null)),
                    Some(_) => Err(Value::error(WRONGTYPE)),
                }
            }
            "HGETALL" => {
                arity(name, args, 1, Some(1))?;
                match self.live(&args[0], now) {
                    None => Ok(Value::Array(Vec::new())),
                    Some(Entry {
                        data: Data::Hash(hash),
                        ..
                    }) => Ok(Value::Array(
                        hash.iter()
                            .flat_map(|(k, v)| {
                                [Value::BulkString(k.clone()), Value::BulkString(v.clone())]
                            })
                            .collect(),
                    )),
                    Some(_) => Err(Value::error(WRONGTYPE)),
                }
            }
            "HDEL" => {
                arity(name, args, 2, None)?;
                let removed = match self.live(&args[0], now) {
                    None => 0,
                    Some(Entry {
                        data: Data::Hash(hash),
                        ..
                    }) => args[1..]
                        .iter()
                        .filter(|field| hash.remove(*field).is_some())
                        .count() as i64,
                    Some(_) => return Err(Value::error(WRONGTYPE)),
                };
                self.remove_if_empty(&args[0]);
                Ok(Value::Integer(removed))
            }
            "RPUSH" => {
                arity(name, args, 2, None)?;
                let entry = self.entry_or(&args[0], now, || Data::List(Vec::new()));
                let Data::List(list) = &mut entry.data else {
                    return Err(Value::error(WRONGTYPE));
                };
                list.extend(args[1..].iter().cloned());
                Ok(Value::Integer(list.len() as i64))
            }
            "LRANGE" => {
                arity(name, args, 3, Some(3))?;
                let start = int_arg(&args[1])?;
                let stop = int_arg(&args[2])?;
                match self.live(&args[0], now) {
                    None => Ok(Value::Array(Vec::new())),
                    Some(Entry {
                        data: Data::List(list),
                        ..
                    }) => Ok(Value::Array(match clamp_range(list.len(), start, stop) {
                        Some((from, to)) => list[from..=to]
                            .iter()
                            .map(|v| Value::BulkString(v.clone()))
                            .collect(),
                        None => Vec::new(),
                    })),
                    Some(_) => Err(Value::error(WRONGTYPE)),
                }
            }
            "SADD" => {
                arity(name, args, 2, None)?;
                let entry = self.entry_or(&args[0], now, || Data::Set(BTreeSet::new()));
                let Data::Set(set) = &mut entry.data else {
                    return Err(Value::error(WRONGTYPE));
                };
                let added = args[1..]
                    .iter()
                    .filter(|m| set.insert((*m).clone()))
                    .count();
                Ok(Value::Integer(added as i64))
            }
            "SMEMBERS" => {
                arity(name, args, 1, Some(1))?;
                match self.live(&args[0], now) {
                    None => Ok(Value::Array(Vec::new())),
                    Some(Entry {
                        data: Data::Set(set),
                        ..
                    }) => Ok(Value::Array(
                        set.iter().map(|m| Value::BulkString(m.clone())).collect(),
                    )),
                    Some(_) => Err(Value::error(WRONGTYPE)),
                }
            }
            "ZADD" => {
                arity(name, args, 3, None)?;
                if args.len() % 2 != 1 {
                    return Err(wrong_arity(name));
                }
                let mut pairs = Vec::with_capacity(args.len() / 2);
                for pair in args[1..].chunks(2) {
                    pairs.push((float_arg(&pair[0])?, pair[1].clone()));
                }
                let entry = self.entry_or(&args[0], now, || Data::SortedSet(Vec::new()));
                let Data::SortedSet(zset) = &mut entry.data else {
                    return Err(Value::error(WRONGTYPE));
                };
                let mut added = 0;
                for (score, member) in pairs {
                    match zset.iter().position(|(_, m)| *m == member) {
                        Some(idx) => zset[idx].0 = score,
                        None => {
                            zset.push((score, member));
                            added += 1;
                        }
                    }
                }
                zset.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                Ok(Value::Integer(added))
            }
            "ZRANGEBYSCORE" => {
                arity(name, args, 3, Some(4))?;
                let min = score_bound(&args[1])?;
                let max = score_bound(&args[2])?;
                let with_scores = match args.get(3) {
                    None => false,
                    Some(opt) if opt.eq_ignore_ascii_case(b"WITHSCORES") => true,
                    Some(_) => return Err(Value::error("ERR syntax error")),
                };
                match self.live(&args[0], now) {
                    None => Ok(Value::Array(Vec::new())),
                    Some(Entry {
                        data: Data::SortedSet(zset),
                        ..
                    }) => {
                        let mut out = Vec::new();
                        for (score, member) in zset.iter() {
                            if min.admits_above(*score) && max.admits_below(*score) {
                                out.push(Value::BulkString(member.clone()));
                                if with_scores {
                                    out.push(Value::BulkString(Bytes::from(score.to_string())));
                                }
                            }
                        }
                        Ok(Value::Array(out))
                    }
                    Some(_) => Err(Value::error(WRONGTYPE)),
                }
            }
            other => Err(Value::error(format!("ERR unknown command '{other}'"))),
        }
    }
}

/// The keys `request` reads or writes.
fn touched_keys(request: &Request) -> &[Bytes] {
    let command = request.command();
    let args = request.args();
    if [&b"DEL"[..], b"EXISTS", b"WATCH"]
        .iter()
        .any(|multi| command.eq_ignore_ascii_case(multi))
    {
        args
    } else if command.eq_ignore_ascii_case(b"PING") || command.eq_ignore_ascii_case(b"UNWATCH") {
        &[]
    } else {
        args.get(..1).unwrap_or(&[])
    }
}

fn wrong_arity(name: &str) -> Value {
    Value::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name.to_ascii_lowercase()
    ))
}

fn arity(name: &str, args: &[Bytes], min: usize, max: Option<usize>) -> std::result::Result<(), Value> {
    if args.len() < min || max.is_some_and(|max| args.len() > max) {
        return Err(wrong_arity(name));
    }
    Ok(())
}

fn int_arg(arg: &[u8]) -> std::result::Result<i64, Value> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Value::error("ERR value is not an integer or out of range"))
}

fn float_arg(arg: &[u8]) -> std::result::Result<f64, Value> {
    let s = std::str::from_utf8(arg).unwrap_or("");
    let parsed = match s.to_ascii_lowercase().as_str() {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        other => other.parse::<f64>().ok().filter(|f| !f.is_nan()),
    };
    parsed.ok_or_else(|| Value::error("ERR value is not a valid float"))
}

/// A ZRANGEBYSCORE bound; a leading `(` makes it exclusive.
struct Bound {
    value: f64,
    exclusive: bool,
}

impl Bound {
    fn admits_above(&self, score: f64) -> bool {
        if self.exclusive {
            score > self.value
        } else {
            score >= self.value
        }
    }

    fn admits_below(&self, score: f64) -> bool {
        if self.exclusive {
            score < self.value
        } else {
            score <= self.value
        }
    }
}

fn score_bound(arg: &[u8]) -> std::result::Result<Bound, Value> {
    let (exclusive, raw) = match arg.strip_prefix(b"(") {
        Some(rest) => (true, rest),
        None => (false, arg),
    };
    float_arg(raw)
        .map(|value| Bound { value, exclusive })
        .map_err(|_| Value::error("ERR min or max is not a float"))
}

/// Resolve inclusive, possibly negative, indices against `len`.
fn clamp_range(len: usize, start: i64, end: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if len == 0 || start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize))
}
