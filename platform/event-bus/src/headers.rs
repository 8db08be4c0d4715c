//! Transport headers and the retry-count codec.
//!
//! Headers are operational metadata and change between hops; the envelope does not.
//! Brokers and client libraries disagree on how integers travel, so the retry count
//! is accepted as any integer width or as a decimal string.
//!
//! Values the fabric does not interpret (timestamps, floats, arrays such as the
//! broker's `x-death`, nested tables) travel as [`HeaderValue::Amqp`] and are
//! written back exactly as they arrived.

use std::collections::BTreeMap;

use lapin::types::AMQPValue;

/// Retry counter, absent on first delivery
pub const RETRY_HEADER: &str = "x-retry-count";
/// Exchange the message was consumed from before it was dead-lettered
pub const ORIGINAL_EXCHANGE_HEADER: &str = "x-original-exchange";
/// Routing key the message carried before it was dead-lettered
pub const ORIGINAL_ROUTING_KEY_HEADER: &str = "x-original-routing-key";
/// Why the message was parked
pub const DEATH_REASON_HEADER: &str = "x-death-reason";
/// Last handler error text, truncated
pub const LAST_ERROR_HEADER: &str = "x-last-error";

/// A single header value
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Int(i64),
    Text(String),
    Bool(bool),
    /// Any other AMQP value, carried through unchanged
    Amqp(AMQPValue),
}

impl HeaderValue {
    /// Integer view; narrower AMQP integer widths are widened
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(n) => Some(*n),
            HeaderValue::Amqp(value) => match value {
                AMQPValue::ShortShortInt(n) => Some(i64::from(*n)),
                AMQPValue::ShortShortUInt(n) => Some(i64::from(*n)),
                AMQPValue::ShortInt(n) => Some(i64::from(*n)),
                AMQPValue::ShortUInt(n) => Some(i64::from(*n)),
                AMQPValue::LongInt(n) => Some(i64::from(*n)),
                AMQPValue::LongUInt(n) => Some(i64::from(*n)),
                AMQPValue::LongLongInt(n) => Some(*n),
                _ => None,
            },
            _ => None,
        }
    }

    /// Text view; AMQP short strings and UTF-8 long strings included
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(s) => Some(s.as_str()),
            HeaderValue::Amqp(AMQPValue::ShortString(s)) => Some(s.as_str()),
            HeaderValue::Amqp(AMQPValue::LongString(s)) => std::str::from_utf8(s.as_bytes()).ok(),
            _ => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<u32> for HeaderValue {
    fn from(v: u32) -> Self {
        HeaderValue::Int(i64::from(v))
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Text(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Text(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

/// Message headers keyed by name
pub type Headers = BTreeMap<String, HeaderValue>;

/// Read the retry count; zero if absent, negative or unparseable
pub fn read_retry_count(headers: &Headers) -> u32 {
    let Some(value) = headers.get(RETRY_HEADER) else {
        return 0;
    };
    if let Some(n) = value.as_int() {
        return u32::try_from(n).unwrap_or(if n < 0 { 0 } else { u32::MAX });
    }
    value
        .as_str()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .unwrap_or(0)
}

/// Shallow copy of `headers` with the retry count incremented
pub fn with_incremented_retry_count(headers: &Headers) -> Headers {
    let next = read_retry_count(headers).saturating_add(1);
    let mut out = headers.clone();
    out.insert(RETRY_HEADER.to_string(), HeaderValue::from(next));
    out
}

/// Read a text header, if present
pub fn header_str<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(HeaderValue::as_str)
}
