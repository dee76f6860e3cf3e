//! RESP2 request encoding and reply parsing.
//!
//! Requests are always sent as arrays of bulk strings. Replies are parsed
//! from a byte buffer; the parser reports how many bytes a complete value
//! consumed so the caller can keep reading into the same buffer.

use bytes::Bytes;

/// Maximum bulk string size: 512MB (matches the RESP protocol limit).
pub const MAX_BULK_STRING_LEN: usize = 512 * 1024 * 1024;

/// Reject unreasonably large arrays to prevent OOM on garbage input.
const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Arrays nested deeper than this are treated as garbage.
const MAX_DEPTH: usize = 8;

/// A command sent to a cache server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    parts: Vec<Bytes>,
}

impl Request {
    /// Start a request for the given command name.
    pub fn cmd(name: &'static str) -> Self {
        Self {
            parts: vec![Bytes::from_static(name.as_bytes())],
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.parts.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    /// Append an argument without copying.
    pub fn arg_bytes(mut self, arg: Bytes) -> Self {
        self.parts.push(arg);
        self
    }

    /// Append a numeric argument in its decimal form.
    pub fn arg_int(mut self, n: i64) -> Self {
        self.parts.push(Bytes::from(n.to_string()));
        self
    }

    /// Append a floating point argument. Infinities encode as `inf`/`-inf`.
    pub fn arg_float(mut self, f: f64) -> Self {
        self.parts.push(Bytes::from(f.to_string()));
        self
    }

    /// Rebuild a request from a decoded array of bulk strings, as a server
    /// would receive it.
    pub fn from_value(value: Value) -> Option<Self> {
        let parts = value
            .into_array()?
            .into_iter()
            .map(Value::into_bytes)
            .collect::<Option<Vec<_>>>()?;
        (!parts.is_empty()).then_some(Self { parts })
    }

    /// The command name.
    pub fn command(&self) -> &[u8] {
        &self.parts[0]
    }

    /// Arguments after the command name.
    pub fn args(&self) -> &[Bytes] {
        &self.parts[1..]
    }

    pub fn ping() -> Self {
        Self::cmd("PING")
    }

    pub fn get(key: &[u8]) -> Self {
        Self::cmd("GET").arg(key)
    }

    pub fn getrange(key: &[u8], start: i64, end: i64) -> Self {
        Self::cmd("GETRANGE").arg(key).arg_int(start).arg_int(end)
    }

    pub fn set(key: &[u8], value: Bytes) -> Self {
        Self::cmd("SET").arg(key).arg_bytes(value)
    }

    pub fn del(key: &[u8]) -> Self {
        Self::cmd("DEL").arg(key)
    }

    pub fn exists(key: &[u8]) -> Self {
        Self::cmd("EXISTS").arg(key)
    }

    /// Expire `key` after `millis` milliseconds.
    pub fn pexpire(key: &[u8], millis: i64) -> Self {
        Self::cmd("PEXPIRE").arg(key).arg_int(millis)
    }

    pub fn persist(key: &[u8]) -> Self {
        Self::cmd("PERSIST").arg(key)
    }

    /// Remaining time to live in seconds, `-1` without expiry, `-2` if missing.
    pub fn ttl(key: &[u8]) -> Self {
        Self::cmd("TTL").arg(key)
    }

    pub fn pttl(key: &[u8]) -> Self {
        Self::cmd("PTTL").arg(key)
    }

    /// HSET with any number of field/value pairs.
    pub fn hset<'a>(key: &[u8], pairs: impl IntoIterator<Item = (&'a Bytes, &'a Bytes)>) -> Self {
        let mut req = Self::cmd("HSET").arg(key);
        for (field, value) in pairs {
            req = req.arg_bytes(field.clone()).arg_bytes(value.clone());
        }
        req
    }

    pub fn hget(key: &[u8], field: &[u8]) -> Self {
        Self::cmd("HGET").arg(key).arg(field)
    }

    pub fn hgetall(key: &[u8]) -> Self {
        Self::cmd("HGETALL").arg(key)
    }

    pub fn hdel(key: &[u8], field: &[u8]) -> Self {
        Self::cmd("HDEL").arg(key).arg(field)
    }

    pub fn rpush(key: &[u8], value: Bytes) -> Self {
        Self::cmd("RPUSH").arg(key).arg_bytes(value)
    }

    pub fn lrange(key: &[u8], start: i64, stop: i64) -> Self {
        Self::cmd("LRANGE").arg(key).arg_int(start).arg_int(stop)
    }

    pub fn sadd(key: &[u8], member: Bytes) -> Self {
        Self::cmd("SADD").arg(key).arg_bytes(member)
    }

    pub fn smembers(key: &[u8]) -> Self {
        Self::cmd("SMEMBERS").arg(key)
    }

    pub fn zadd(key: &[u8], score: f64, member: Bytes) -> Self {
        Self::cmd("ZADD").arg(key).arg_float(score).arg_bytes(member)
    }

    pub fn zrangebyscore(key: &[u8], min: f64, max: f64, with_scores: bool) -> Self {
        let req = Self::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg_float(min)
            .arg_float(max);
        if with_scores {
            req.arg("WITHSCORES")
        } else {
            req
        }
    }

    /// Name of the type stored at `key`, `none` if missing.
    pub fn key_type(key: &[u8]) -> Self {
        Self::cmd("TYPE").arg(key)
    }

    /// Abort the next EXEC on this connection if `key` changes first.
    pub fn watch(key: &[u8]) -> Self {
        Self::cmd("WATCH").arg(key)
    }

    pub fn unwatch() -> Self {
        Self::cmd("UNWATCH")
    }

    pub fn multi() -> Self {
        Self::cmd("MULTI")
    }

    pub fn exec() -> Self {
        Self::cmd("EXEC")
    }

    /// Number of bytes [`Request::encode`] will append.
    pub fn encoded_len(&self) -> usize {
        let mut len = 1 + decimal_len(self.parts.len() as u64) + 2;
        for part in &self.parts {
            len += 1 + decimal_len(part.len() as u64) + 2 + part.len() + 2;
        }
        len
    }

    /// Encode as a RESP array of bulk strings, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        buf.push(b'*');
        push_decimal(buf, self.parts.len() as u64);
        buf.extend_from_slice(b"\r\n");
        for part in &self.parts {
            buf.push(b'$');
            push_decimal(buf, part.len() as u64);
            buf.extend_from_slice(b"\r\n");
            buf.extend_from_slice(part);
            buf.extend_from_slice(b"\r\n");
        }
    }
}

/// A reply from a cache server.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    SimpleString(Bytes),
    Error(Bytes),
    Integer(i64),
    BulkString(Bytes),
    /// Null bulk string or null array.
    Null,
    Array(Vec<Value>),
}

/// Errors from [`Value::parse`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// More bytes are needed to complete the value.
    #[error("incomplete value")]
    Incomplete,
    #[error("bulk string too long")]
    BulkStringTooLong,
    #[error("{0}")]
    Protocol(String),
}

impl Value {
    /// `+OK`.
    pub fn ok() -> Self {
        Value::SimpleString(Bytes::from_static(b"OK"))
    }

    /// Build an error reply from a message.
    pub fn error(msg: impl Into<String>) -> Self {
        Value::Error(Bytes::from(msg.into()))
    }

    /// Build a bulk string reply.
    pub fn bulk(data: impl AsRef<[u8]>) -> Self {
        Value::BulkString(Bytes::copy_from_slice(data.as_ref()))
    }

    /// Parse one value from the front of `buffer`.
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn parse(buffer: &[u8]) -> Result<(Self, usize), ParseError> {
        let mut cursor = Cursor::new(buffer);
        let value = cursor.read_value(0)?;
        Ok((value, cursor.pos))
    }

    /// True for an error reply.
    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// True for a `+OK` reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Value::SimpleString(s) if s.as_ref() == b"OK")
    }

    /// The message of an error reply.
    pub fn error_message(&self) -> Option<String> {
        match self {
            Value::Error(msg) => Some(String::from_utf8_lossy(msg).into_owned()),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Payload of a bulk or simple string. `None` for null and other types.
    pub fn into_bytes(self) -> Option<Bytes> {
        match self {
            Value::BulkString(b) | Value::SimpleString(b) => Some(b),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Interpret a flat array as consecutive pairs, as returned by HGETALL or
    /// ZRANGEBYSCORE ... WITHSCORES.
    pub fn into_pairs(self) -> Option<Vec<(Bytes, Bytes)>> {
        let items = self.into_array()?;
        if items.len() % 2 != 0 {
            return None;
        }
        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
            pairs.push((k.into_bytes()?, v.into_bytes()?));
        }
        Some(pairs)
    }

    /// Encode this value, appending to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Value::SimpleString(s) => {
                buf.push(b'+');
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            Value::Error(s) => {
                buf.push(b'-');
                buf.extend_from_slice(s);
                buf.extend_from_slice(b"\r\n");
            }
            Value::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
            Value::BulkString(data) => {
                buf.push(b'$');
                push_decimal(buf, data.len() as u64);
                buf.extend_from_slice(b"\r\n");
                buf.extend_from_slice(data);
                buf.extend_from_slice(b"\r\n");
            }
            Value::Null => buf.extend_from_slice(b"$-1\r\n"),
            Value::Array(items) => {
                buf.push(b'*');
                push_decimal(buf, items.len() as u64);
                buf.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, ParseError> {
        if depth > MAX_DEPTH {
            return Err(ParseError::Protocol("nesting too deep".to_string()));
        }
        if self.remaining() < 1 {
            return Err(ParseError::Incomplete);
        }
        let tag = self.buf[self.pos];
        self.pos += 1;

        match tag {
            b'+' => Ok(Value::SimpleString(Bytes::copy_from_slice(self.read_line()?))),
            b'-' => Ok(Value::Error(Bytes::copy_from_slice(self.read_line()?))),
            b':' => Ok(Value::Integer(self.read_signed()?)),
            b'$' => {
                let len = self.read_signed()?;
                if len < 0 {
                    return Ok(Value::Null);
                }
                let len = len as usize;
                if len > MAX_BULK_STRING_LEN {
                    return Err(ParseError::BulkStringTooLong);
                }
                if self.remaining() < len + 2 {
                    return Err(ParseError::Incomplete);
                }
                let data = &self.buf[self.pos..self.pos + len];
                if &self.buf[self.pos + len..self.pos + len + 2] != b"\r\n" {
                    return Err(ParseError::Protocol(
                        "bulk string missing terminator".to_string(),
                    ));
                }
                self.pos += len + 2;
                Ok(Value::BulkString(Bytes::copy_from_slice(data)))
            }
            b'*' => {
                let count = self.read_signed()?;
                if count < 0 {
                    return Ok(Value::Null);
                }
                let count = count as usize;
                if count > MAX_ARRAY_LEN {
                    return Err(ParseError::Protocol("array too large".to_string()));
                }
                // Every element takes at least three bytes on the wire.
                let mut items = Vec::with_capacity(count.min(self.remaining() / 3));
                for _ in 0..count {
                    items.push(self.read_value(depth + 1)?);
                }
                Ok(Value::Array(items))
            }
            other => Err(ParseError::Protocol(format!(
                "unexpected type byte: 0x{other:02x}"
            ))),
        }
    }

    /// Read up to the next CRLF, returning the line without it.
    fn read_line(&mut self) -> Result<&'a [u8], ParseError> {
        let buf = self.buf;
        let rest = &buf[self.pos..];
        let end = rest
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or(ParseError::Incomplete)?;
        self.pos += end + 2;
        Ok(&rest[..end])
    }

    fn read_signed(&mut self) -> Result<i64, ParseError> {
        let line = self.read_line()?;
        std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| ParseError::Protocol("invalid integer".to_string()))
    }
}

/// Write a u64 as decimal digits into a Vec.
fn push_decimal(buf: &mut Vec<u8>, n: u64) {
    if n == 0 {
        buf.push(b'0');
        return;
    }
    let start = buf.len();
    let mut val = n;
    while val > 0 {
        buf.push(b'0' + (val % 10) as u8);
        val /= 10;
    }
    buf[start..].reverse();
}

fn decimal_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}
