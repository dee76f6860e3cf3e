//! Typed cache operations routed through the current context.
//!
//! Every call resolves the owning host of its key on the current
//! [`ResourceContext`] ring and runs there. Writes that need more than one
//! primitive, and any write or read carrying an expiry, run as one atomic
//! batch. A batch that would fail on a value of the wrong type is refused
//! with [`Error::BatchFailure`] before anything is sent, so a failed write
//! never leaves its expiry behind.
//!
//! An expiry of zero clears the key's expiry; it never expires the key
//! immediately.

use crate::context::{CacheHandle, ResourceContext};
use crate::error::{Error, Result};
use crate::resp::{Request, Value};
use bytes::Bytes;
use std::time::Duration;

/// Longest expiry sent to a server. Anything longer is capped here so the
/// server's own deadline arithmetic cannot overflow.
pub const MAX_EXPIRE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The shape of a cached value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Scalar,
    Hash,
    List,
    Set,
    SortedSet,
}

impl Mode {
    /// Composite modes are written one element at a time.
    pub fn is_composite(self) -> bool {
        matches!(self, Mode::List | Mode::Set | Mode::SortedSet)
    }

    /// The name a server's TYPE command reports for this mode.
    pub fn type_name(self) -> &'static str {
        match self {
            Mode::Scalar => "string",
            Mode::Hash => "hash",
            Mode::List => "list",
            Mode::Set => "set",
            Mode::SortedSet => "zset",
        }
    }

    /// The mode a command operates on, if it is tied to one.
    fn of_command(command: &[u8]) -> Option<Mode> {
        let command = command.to_ascii_uppercase();
        Some(match command.as_slice() {
            b"GET" | b"GETRANGE" | b"SET" => Mode::Scalar,
            b"HSET" | b"HGET" | b"HGETALL" | b"HDEL" => Mode::Hash,
            b"RPUSH" | b"LRANGE" => Mode::List,
            b"SADD" | b"SMEMBERS" => Mode::Set,
            b"ZADD" | b"ZRANGEBYSCORE" => Mode::SortedSet,
            _ => return None,
        })
    }
}

/// A value to write, tagged with its mode.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    Scalar(Bytes),
    Hash(Vec<(Bytes, Bytes)>),
    /// Elements are appended in order.
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    /// (score, member) pairs.
    SortedSet(Vec<(f64, Bytes)>),
}

impl CacheValue {
    pub fn mode(&self) -> Mode {
        match self {
            CacheValue::Scalar(_) => Mode::Scalar,
            CacheValue::Hash(_) => Mode::Hash,
            CacheValue::List(_) => Mode::List,
            CacheValue::Set(_) => Mode::Set,
            CacheValue::SortedSet(_) => Mode::SortedSet,
        }
    }

    /// The primitive writes for this value, in order.
    fn requests(&self, key: &[u8]) -> Vec<Request> {
        match self {
            CacheValue::Scalar(v) => vec![Request::set(key, v.clone())],
            CacheValue::Hash(pairs) if pairs.is_empty() => Vec::new(),
            CacheValue::Hash(pairs) => vec![Request::hset(key, pairs.iter().map(|(f, v)| (f, v)))],
            CacheValue::List(items) => items
                .iter()
                .map(|v| Request::rpush(key, v.clone()))
                .collect(),
            CacheValue::Set(members) => members
                .iter()
                .map(|m| Request::sadd(key, m.clone()))
                .collect(),
            CacheValue::SortedSet(members) => members
                .iter()
                .map(|(score, m)| Request::zadd(key, *score, m.clone()))
                .collect(),
        }
    }
}

impl From<Bytes> for CacheValue {
    fn from(value: Bytes) -> Self {
        CacheValue::Scalar(value)
    }
}

impl From<&'static str> for CacheValue {
    fn from(value: &'static str) -> Self {
        CacheValue::Scalar(Bytes::from_static(value.as_bytes()))
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        CacheValue::Scalar(Bytes::from(value))
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        CacheValue::Scalar(Bytes::from(value))
    }
}

impl From<&[u8]> for CacheValue {
    fn from(value: &[u8]) -> Self {
        CacheValue::Scalar(Bytes::copy_from_slice(value))
    }
}

/// Options for [`write`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Expiry to set after the payload; zero clears any existing expiry.
    pub expire: Option<Duration>,
    /// Delete the existing value first.
    pub replace: bool,
}

impl WriteOptions {
    pub fn expire(mut self, expire: Duration) -> Self {
        self.expire = Some(expire);
        self
    }

    pub fn replace(mut self) -> Self {
        self.replace = true;
        self
    }
}

/// A read accessor.
#[derive(Debug, Clone, PartialEq)]
pub enum Read {
    /// Scalar value.
    Get,
    /// Inclusive byte range of a scalar; negative offsets count from the end.
    GetRange { start: i64, end: i64 },
    /// Inclusive element range of a list; negative offsets count from the end.
    Range { start: i64, stop: i64 },
    /// Members of a set.
    Members,
    /// Sorted set members with `min <= score <= max`, in score order.
    ScoreRange { min: f64, max: f64, with_scores: bool },
    /// One field of a hash.
    HashGet(Bytes),
    /// All fields of a hash.
    HashGetAll,
    /// Remaining time to live.
    Ttl,
    Exists,
}

impl Read {
    /// The whole list.
    pub const ALL: Read = Read::Range { start: 0, stop: -1 };

    pub fn hash_get(field: impl AsRef<[u8]>) -> Self {
        Read::HashGet(Bytes::copy_from_slice(field.as_ref()))
    }

    fn request(&self, key: &[u8]) -> Request {
        match self {
            Read::Get => Request::get(key),
            Read::GetRange { start, end } => Request::getrange(key, *start, *end),
            Read::Range { start, stop } => Request::lrange(key, *start, *stop),
            Read::Members => Request::smembers(key),
            Read::ScoreRange {
                min,
                max,
                with_scores,
            } => Request::zrangebyscore(key, *min, *max, *with_scores),
            Read::HashGet(field) => Request::hget(key, field),
            Read::HashGetAll => Request::hgetall(key),
            Read::Ttl => Request::pttl(key),
            Read::Exists => Request::exists(key),
        }
    }

    fn decode(&self, value: Value) -> Result<Reply> {
        let reply = match self {
            Read::Get | Read::GetRange { .. } | Read::HashGet(_) => match value {
                Value::Null => Some(Reply::Value(None)),
                value => value.into_bytes().map(|b| Reply::Value(Some(b))),
            },
            Read::Range { .. } | Read::Members | Read::ScoreRange { with_scores: false, .. } => {
                value.into_array().and_then(|items| {
                    items
                        .into_iter()
                        .map(Value::into_bytes)
                        .collect::<Option<Vec<_>>>()
                        .map(Reply::Items)
                })
            }
            Read::ScoreRange {
                with_scores: true, ..
            } => value.into_pairs().and_then(|pairs| {
                pairs
                    .into_iter()
                    .map(|(member, score)| Some((member, parse_score(&score)?)))
                    .collect::<Option<Vec<_>>>()
                    .map(Reply::Scored)
            }),
            Read::HashGetAll => value.into_pairs().map(Reply::Pairs),
            Read::Ttl => value.as_integer().map(|ms| {
                Reply::Ttl(match ms {
                    -2 => Ttl::Missing,
                    ms if ms < 0 => Ttl::Persistent,
                    ms => Ttl::Expires(Duration::from_millis(ms as u64)),
                })
            }),
            Read::Exists => value.as_integer().map(|n| Reply::Exists(n > 0)),
        };
        reply.ok_or_else(|| Error::Protocol(format!("unexpected reply to {self:?}")))
    }
}

/// Remaining lifetime of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Missing,
    /// The key exists and never expires.
    Persistent,
    Expires(Duration),
}

/// Decoded result of a [`Read`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `Get`, `GetRange` and `HashGet`; `None` when absent.
    Value(Option<Bytes>),
    /// `Range`, `Members` and `ScoreRange` without scores.
    Items(Vec<Bytes>),
    /// `ScoreRange` with scores.
    Scored(Vec<(Bytes, f64)>),
    /// `HashGetAll`, in field order.
    Pairs(Vec<(Bytes, Bytes)>),
    Ttl(Ttl),
    Exists(bool),
}

impl Reply {
    pub fn into_value(self) -> Option<Bytes> {
        match self {
            Reply::Value(v) => v,
            _ => None,
        }
    }

    pub fn into_items(self) -> Vec<Bytes> {
        match self {
            Reply::Items(items) => items,
            Reply::Scored(scored) => scored.into_iter().map(|(m, _)| m).collect(),
            _ => Vec::new(),
        }
    }

    pub fn into_pairs(self) -> Vec<(Bytes, Bytes)> {
        match self {
            Reply::Pairs(pairs) => pairs,
            _ => Vec::new(),
        }
    }
}

fn parse_score(raw: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(raw).ok()?;
    match s {
        "inf" | "+inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        s => s.parse().ok(),
    }
}

/// The directive applying `expire` to `key`.
fn expiry(key: &[u8], expire: Duration) -> Request {
    if expire.is_zero() {
        Request::persist(key)
    } else {
        let millis = i64::try_from(expire.min(MAX_EXPIRE).as_millis())
            .unwrap_or(i64::MAX)
            .max(1);
        Request::pexpire(key, millis)
    }
}

/// Run `requests` against `key` as one batch.
///
/// A transaction keeps the steps that ran before a failing one, so a batch
/// whose mode does not match the type stored at `key` is refused before it
/// is sent. `key` stays watched until EXEC. Batches starting with DEL skip
/// the check.
fn atomic(handle: &CacheHandle, key: &[u8], requests: &[Request]) -> Result<Vec<Value>> {
    let clears_key = requests
        .first()
        .is_some_and(|first| first.command().eq_ignore_ascii_case(b"DEL"));
    let mode = requests
        .iter()
        .find_map(|request| Mode::of_command(request.command()));
    let Some(mode) = mode.filter(|_| !clears_key) else {
        return handle.execute_atomic(requests);
    };

    handle.execute(&Request::watch(key))?;
    let found = handle.execute(&Request::key_type(key))?;
    let found = found
        .into_bytes()
        .ok_or_else(|| Error::Protocol("unexpected reply to TYPE".to_string()))?;
    if found.as_ref() != b"none" && found.as_ref() != mode.type_name().as_bytes() {
        handle.execute(&Request::unwatch())?;
        tracing::debug!(
            host = handle.host(),
            expected = mode.type_name(),
            found = %String::from_utf8_lossy(&found),
            "batch rejected before sending"
        );
        return Err(Error::BatchFailure(format!(
            "WRONGTYPE key holds a {} value, batch needs a {}",
            String::from_utf8_lossy(&found),
            mode.type_name()
        )));
    }
    handle.execute_atomic(requests)
}

/// Write `value` to `key`.
pub fn write(key: &[u8], value: impl Into<CacheValue>, options: WriteOptions) -> Result<()> {
    let value = value.into();
    if let CacheValue::SortedSet(members) = &value {
        if members.iter().any(|(score, _)| score.is_nan()) {
            return Err(Error::BatchFailure("sorted set score is NaN".to_string()));
        }
    }
    let ctx = ResourceContext::require()?;
    let handle = ctx.cache_handle(key)?;

    let mut requests = Vec::new();
    if options.replace {
        requests.push(Request::del(key));
    }
    requests.extend(value.requests(key));
    if let Some(expire) = options.expire {
        requests.push(expiry(key, expire));
    }

    let batch = options.replace || options.expire.is_some() || value.mode().is_composite();
    tracing::trace!(host = handle.host(), mode = ?value.mode(), steps = requests.len(), batch, "cache write");

    match requests.as_slice() {
        [] => Ok(()),
        [request] if !batch => handle.execute(request).map(drop),
        requests => atomic(&handle, key, requests).map(drop),
    }
}

/// Write a hash of `(field, value)` pairs.
pub fn write_hash<F, V>(
    key: &[u8],
    pairs: impl IntoIterator<Item = (F, V)>,
    options: WriteOptions,
) -> Result<()>
where
    F: AsRef<[u8]>,
    V: AsRef<[u8]>,
{
    let pairs = pairs
        .into_iter()
        .map(|(f, v)| (Bytes::copy_from_slice(f.as_ref()), Bytes::copy_from_slice(v.as_ref())))
        .collect();
    write(key, CacheValue::Hash(pairs), options)
}

/// Append `items` to the list at `key`.
pub fn write_list<T: AsRef<[u8]>>(
    key: &[u8],
    items: impl IntoIterator<Item = T>,
    options: WriteOptions,
) -> Result<()> {
    let items = items
        .into_iter()
        .map(|v| Bytes::copy_from_slice(v.as_ref()))
        .collect();
    write(key, CacheValue::List(items), options)
}

/// Add `members` to the set at `key`.
pub fn write_set<T: AsRef<[u8]>>(
    key: &[u8],
    members: impl IntoIterator<Item = T>,
    options: WriteOptions,
) -> Result<()> {
    let members = members
        .into_iter()
        .map(|m| Bytes::copy_from_slice(m.as_ref()))
        .collect();
    write(key, CacheValue::Set(members), options)
}

/// Add `(score, member)` pairs to the sorted set at `key`.
pub fn write_sorted_set<T: AsRef<[u8]>>(
    key: &[u8],
    members: impl IntoIterator<Item = (f64, T)>,
    options: WriteOptions,
) -> Result<()> {
    let members = members
        .into_iter()
        .map(|(score, m)| (score, Bytes::copy_from_slice(m.as_ref())))
        .collect();
    write(key, CacheValue::SortedSet(members), options)
}

/// Read `key` with `accessor`, optionally applying `expire` in the same
/// batch.
pub fn read(key: &[u8], accessor: Read, expire: Option<Duration>) -> Result<Reply> {
    let value = op(key, accessor.request(key), expire)?;
    accessor.decode(value)
}

/// Run `request` on the host owning `key` and return its raw reply.
///
/// With `expire`, the request and the expiry directive run as one batch and
/// the request's own reply is returned.
pub fn op(key: &[u8], request: Request, expire: Option<Duration>) -> Result<Value> {
    let ctx = ResourceContext::require()?;
    let handle = ctx.cache_handle(key)?;
    match expire {
        None => handle.execute(&request),
        Some(expire) => {
            let mut replies = atomic(&handle, key, &[request, expiry(key, expire)])?;
            replies.truncate(1);
            replies
                .pop()
                .ok_or_else(|| Error::Protocol("empty batch reply".to_string()))
        }
    }
}

/// Delete `keys`, each on its own host. Returns how many existed.
pub fn delete<K: AsRef<[u8]>>(keys: &[K]) -> Result<u64> {
    let ctx = ResourceContext::require()?;
    let mut deleted = 0;
    for key in keys {
        let key = key.as_ref();
        let reply = ctx.cache_handle(key)?.execute(&Request::del(key))?;
        let count = reply
            .as_integer()
            .ok_or_else(|| Error::Protocol(format!("unexpected reply to DEL: {reply:?}")))?;
        deleted += count.max(0) as u64;
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Connection, Connector, HostAddr, MemoryConnector};
    use crate::config::Config;
    use crate::store::MEMORY_HOST;

    fn with_cache<T>(f: impl FnOnce() -> Result<T>) -> T {
        let mut config = Config::default();
        config.cache.servers = vec!["cache-a:1".to_string(), "cache-b:1".to_string()];
        config.store.host = MEMORY_HOST.to_string();
        let ctx = ResourceContext::new(&config)
            .unwrap()
            .with_connector(MemoryConnector::new());
        ctx.scope(f).unwrap()
    }

    fn ttl(key: &[u8]) -> Result<Ttl> {
        match read(key, Read::Ttl, None)? {
            Reply::Ttl(ttl) => Ok(ttl),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn requires_context() {
        assert!(matches!(
            write(b"k", "v", WriteOptions::default()),
            Err(Error::NoActiveContext)
        ));
        assert!(matches!(read(b"k", Read::Get, None), Err(Error::NoActiveContext)));
        assert!(matches!(delete(&[b"k"]), Err(Error::NoActiveContext)));
    }

    #[test]
    fn scalar_roundtrip() {
        with_cache(|| {
            write(b"greeting", "hello world", WriteOptions::default())?;
            assert_eq!(
                read(b"greeting", Read::Get, None)?.into_value(),
                Some(Bytes::from_static(b"hello world"))
            );
            assert_eq!(
                read(b"greeting", Read::GetRange { start: 0, end: 4 }, None)?.into_value(),
                Some(Bytes::from_static(b"hello"))
            );
            assert_eq!(read(b"missing", Read::Get, None)?, Reply::Value(None));
            Ok(())
        });
    }

    #[test]
    fn list_preserves_order() {
        with_cache(|| {
            write_list(b"l", ["1", "2", "3"], WriteOptions::default())?;
            write_list(b"l", ["4"], WriteOptions::default())?;
            assert_eq!(
                read(b"l", Read::ALL, None)?.into_items(),
                vec![
                    Bytes::from_static(b"1"),
                    Bytes::from_static(b"2"),
                    Bytes::from_static(b"3"),
                    Bytes::from_static(b"4"),
                ]
            );
            Ok(())
        });
    }

    #[test]
    fn replace_discards_previous_value() {
        with_cache(|| {
            write_list(b"l", ["a", "b"], WriteOptions::default())?;
            write_list(b"l", ["c"], WriteOptions::default().replace())?;
            assert_eq!(
                read(b"l", Read::ALL, None)?.into_items(),
                vec![Bytes::from_static(b"c")]
            );
            Ok(())
        });
    }

    #[test]
    fn sets_and_sorted_sets() {
        with_cache(|| {
            write_set(b"s", ["x", "y", "x"], WriteOptions::default())?;
            let mut members = read(b"s", Read::Members, None)?.into_items();
            members.sort();
            assert_eq!(members, vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]);

            write_sorted_set(
                b"z",
                (0..10).map(|i| (i as f64 / 10.0, format!("m{i}"))),
                WriteOptions::default(),
            )?;
            let scored = read(
                b"z",
                Read::ScoreRange {
                    min: 0.0,
                    max: 0.2,
                    with_scores: true,
                },
                None,
            )?;
            assert_eq!(
                scored,
                Reply::Scored(vec![
                    (Bytes::from_static(b"m0"), 0.0),
                    (Bytes::from_static(b"m1"), 0.1),
                    (Bytes::from_static(b"m2"), 0.2),
                ])
            );
            Ok(())
        });
    }

    #[test]
    fn hashes() {
        with_cache(|| {
            write_hash(b"h", [("a", "1"), ("b", "2")], WriteOptions::default())?;
            assert_eq!(
                read(b"h", Read::hash_get("b"), None)?.into_value(),
                Some(Bytes::from_static(b"2"))
            );
            assert_eq!(read(b"h", Read::HashGetAll, None)?.into_pairs().len(), 2);
            Ok(())
        });
    }

    #[test]
    fn expiry_zero_clears_expiry() {
        with_cache(|| {
            write(b"k", "v", WriteOptions::default().expire(Duration::from_secs(60)))?;
            assert!(matches!(ttl(b"k")?, Ttl::Expires(d) if d > Duration::from_secs(50)));

            // Zero must persist the key, not delete it.
            let reply = read(b"k", Read::Get, Some(Duration::ZERO))?;
            assert_eq!(reply.into_value(), Some(Bytes::from_static(b"v")));
            assert_eq!(ttl(b"k")?, Ttl::Persistent);
            Ok(())
        });
    }

    #[test]
    fn read_refreshes_expiry() {
        with_cache(|| {
            write(b"k", "v", WriteOptions::default())?;
            assert_eq!(ttl(b"k")?, Ttl::Persistent);
            read(b"k", Read::Get, Some(Duration::from_secs(30)))?;
            assert!(matches!(ttl(b"k")?, Ttl::Expires(_)));
            assert_eq!(ttl(b"nope")?, Ttl::Missing);
            Ok(())
        });
    }

    #[test]
    fn composite_write_with_expiry() {
        with_cache(|| {
            write_list(b"k", ["1", "2", "3"], WriteOptions::default().expire(Duration::from_secs(60)))?;
            assert_eq!(read(b"k", Read::ALL, None)?.into_items().len(), 3);
            assert!(matches!(ttl(b"k")?, Ttl::Expires(d) if d <= Duration::from_secs(60)));
            Ok(())
        });
    }

    #[test]
    fn failed_batch_applies_nothing() {
        with_cache(|| {
            write(b"k", "scalar", WriteOptions::default())?;
            // RPUSH onto a string fails inside the batch; the expiry must not land.
            let err = write_list(b"k", ["x"], WriteOptions::default().expire(Duration::from_secs(5)))
                .unwrap_err();
            assert!(matches!(err, Error::BatchFailure(_)));
            assert_eq!(ttl(b"k")?, Ttl::Persistent);
            Ok(())
        });
    }

    #[test]
    fn delete_counts_existing_keys() {
        with_cache(|| {
            for i in 0..10 {
                write(format!("d{i}").as_bytes(), "v", WriteOptions::default())?;
            }
            let keys: Vec<String> = (0..12).map(|i| format!("d{i}")).collect();
            assert_eq!(delete(&keys)?, 10);
            assert_eq!(read(b"d0", Read::Exists, None)?, Reply::Exists(false));
            Ok(())
        });
    }

    #[test]
    fn op_runs_arbitrary_requests() {
        with_cache(|| {
            write_hash(b"session", [("user", "1")], WriteOptions::default())?;
            let removed = op(
                b"session",
                Request::hdel(b"session", b"user"),
                Some(Duration::from_secs(600)),
            )?;
            assert_eq!(removed, Value::Integer(1));
            Ok(())
        });
    }

    #[test]
    fn sub_millisecond_expiry_rounds_up() {
        assert_eq!(
            expiry(b"k", Duration::from_micros(10)),
            Request::pexpire(b"k", 1)
        );
        assert_eq!(expiry(b"k", Duration::ZERO), Request::persist(b"k"));
    }

    #[test]
    fn huge_expiry_is_capped() {
        let capped = Request::pexpire(b"k", MAX_EXPIRE.as_millis() as i64);
        assert_eq!(expiry(b"k", Duration::MAX), capped);
        assert_eq!(expiry(b"k", Duration::from_secs(u64::MAX / 2)), capped);
    }

    #[test]
    fn huge_expiry_keeps_the_key() {
        with_cache(|| {
            write(b"k", "v", WriteOptions::default().expire(Duration::MAX))?;
            assert_eq!(read(b"k", Read::Get, None)?.into_value(), Some(Bytes::from_static(b"v")));
            assert!(matches!(ttl(b"k")?, Ttl::Expires(d) if d > Duration::from_secs(86_400 * 365)));

            read(b"k", Read::Get, Some(Duration::MAX))?;
            assert!(matches!(ttl(b"k")?, Ttl::Expires(_)));
            Ok(())
        });
    }

    #[test]
    fn wrong_type_read_with_expiry_leaves_ttl() {
        with_cache(|| {
            write_set(b"s", ["m"], WriteOptions::default())?;
            let err = read(b"s", Read::Get, Some(Duration::from_secs(5))).unwrap_err();
            assert!(matches!(err, Error::BatchFailure(msg) if msg.starts_with("WRONGTYPE")));
            assert_eq!(ttl(b"s")?, Ttl::Persistent);
            Ok(())
        });
    }

    #[test]
    fn nan_scores_are_refused() {
        with_cache(|| {
            let err = write_sorted_set(
                b"z",
                [(1.0, "a"), (f64::NAN, "b")],
                WriteOptions::default().expire(Duration::from_secs(5)),
            )
            .unwrap_err();
            assert!(matches!(err, Error::BatchFailure(_)));
            assert_eq!(read(b"z", Read::Exists, None)?, Reply::Exists(false));
            Ok(())
        });
    }

    /// Answers every request with the same reply.
    struct Canned(HostAddr, Value);

    impl Connection for Canned {
        fn addr(&self) -> &HostAddr {
            &self.0
        }

        fn execute(&mut self, _: &Request) -> Result<Value> {
            Ok(self.1.clone())
        }

        fn execute_atomic(&mut self, requests: &[Request]) -> Result<Vec<Value>> {
            Ok(vec![self.1.clone(); requests.len()])
        }

        fn is_open(&self) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    struct CannedConnector(Value);

    impl Connector for CannedConnector {
        fn connect(&self, addr: &HostAddr, _: Duration) -> Result<Box<dyn Connection>> {
            Ok(Box::new(Canned(addr.clone(), self.0.clone())))
        }
    }

    #[test]
    fn delete_rejects_non_integer_replies() {
        let mut config = Config::default();
        config.cache.servers = vec!["cache-a:1".to_string()];
        config.store.host = MEMORY_HOST.to_string();
        let ctx = ResourceContext::new(&config)
            .unwrap()
            .with_connector(CannedConnector(Value::ok()));
        let result = ctx.scope(|| delete(&[b"k"]));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
