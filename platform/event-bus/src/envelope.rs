//! # Event Envelope
//!
//! Fleet-wide envelope carried on every message published to `app.events`.
//!
//! ## Design Principles
//!
//! 1. **Typed outer shell**: every field but `data` is strongly typed and validated
//! 2. **Opaque payload**: `data` is a JSON object owned by the event type; handlers
//!    deserialize it into their own shape at entry
//! 3. **Stable identity**: `client_generated_id` survives every retry and is the only
//!    deduplication key
//!
//! ## Envelope Fields
//!
//! - `schema_version`: dotted version of the envelope schema (currently `1.0.0`)
//! - `event_type`: routing key and handler selector
//! - `client_generated_id`: idempotency key for the logical event
//! - `user_id`: subject of the event, or `"system"`
//! - `timestamp`: RFC-3339 UTC generation time
//! - `source_service`: service that produced the event
//! - `data`: event-specific payload
//!
//! Transport metadata (retry count, dead-letter reasons) never lives here; see
//! [`crate::headers`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Envelope schema version stamped on newly built envelopes
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Wire value of [`UserId::System`]
pub const SYSTEM_USER: &str = "system";

/// Subject of an event: a user, or the system itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserId {
    User(Uuid),
    System,
}

impl UserId {
    /// UUID form used by the idempotency table; `System` maps to the nil UUID
    pub fn as_uuid(&self) -> Uuid {
        match self {
            UserId::User(id) => *id,
            UserId::System => Uuid::nil(),
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, UserId::System)
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        UserId::User(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserId::User(id) => write!(f, "{}", id),
            UserId::System => f.write_str(SYSTEM_USER),
        }
    }
}

impl FromStr for UserId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == SYSTEM_USER {
            return Ok(UserId::System);
        }
        Uuid::parse_str(s).map(UserId::User)
    }
}

impl Serialize for UserId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for UserId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Envelope could not be parsed from a message body.
///
/// Always a poison failure: the message goes to the DLQ without retry.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid envelope field `{field}`: {reason}")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

/// Envelope could not be serialized
#[derive(Debug, thiserror::Error)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Standard event envelope
///
/// # Examples
///
/// ```rust
/// use event_bus::{EventEnvelope, UserId};
/// use serde_json::json;
///
/// let envelope = EventEnvelope::new(
///     "user.registered",
///     UserId::System,
///     "auth-service",
///     json!({"email": "lifter@example.com"}),
/// );
/// let bytes = envelope.encode().unwrap();
/// let decoded = EventEnvelope::decode(&bytes).unwrap();
/// assert_eq!(decoded.client_generated_id, envelope.client_generated_id);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub schema_version: String,
    pub event_type: String,
    pub client_generated_id: Uuid,
    pub user_id: UserId,
    pub timestamp: DateTime<Utc>,
    pub source_service: String,
    pub data: Map<String, Value>,
}

impl EventEnvelope {
    /// Build a new envelope with a fresh `client_generated_id` and the current time.
    ///
    /// A `data` value that is not a JSON object is wrapped as `{"value": data}`
    /// so the payload is always a mapping.
    pub fn new(
        event_type: impl Into<String>,
        user_id: impl Into<UserId>,
        source_service: impl Into<String>,
        data: Value,
    ) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            event_type: event_type.into(),
            client_generated_id: Uuid::new_v4(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            source_service: source_service.into(),
            data,
        }
    }

    /// Pin the idempotency key (replays, tests, deterministic producers)
    pub fn with_client_generated_id(mut self, id: Uuid) -> Self {
        self.client_generated_id = id;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize to canonical JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate an envelope from a message body
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let envelope: EventEnvelope = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check the non-empty constraints serde cannot express
    pub fn validate(&self) -> Result<(), DecodeError> {
        if self.schema_version.trim().is_empty() {
            return Err(DecodeError::InvalidField {
                field: "schema_version",
                reason: "cannot be empty",
            });
        }
        if self.event_type.trim().is_empty() {
            return Err(DecodeError::InvalidField {
                field: "event_type",
                reason: "cannot be empty",
            });
        }
        if self.source_service.trim().is_empty() {
            return Err(DecodeError::InvalidField {
                field: "source_service",
                reason: "cannot be empty",
            });
        }
        Ok(())
    }

    /// Deserialize `data` into the handler's own payload type
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&Value::Object(self.data.clone()))
    }
}
