//! Decoding of publish payloads into [`Event`] values.
//!
//! The publish endpoint accepts a logical event description plus the name
//! of the target stream. Timestamps may be given as epoch milliseconds or
//! as an RFC 3339 string; a missing timestamp means "now".

use chrono::DateTime;
use serde::Deserialize;
use thiserror::Error;

use super::{Attributes, Event, EventTime};

/// Errors that can occur while decoding a publish payload.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("event key must not be empty")]
    EmptyKey,

    #[error("stream name must not be empty")]
    EmptyStream,

    #[error("invalid timestamp {raw:?}: {reason}")]
    InvalidTimestamp { raw: String, reason: String },
}

/// Timestamp as accepted on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Millis(i64),
    Text(String),
}

impl WireTimestamp {
    fn to_millis(&self) -> Result<EventTime, ParseError> {
        match self {
            Self::Millis(ms) => Ok(*ms),
            Self::Text(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| ParseError::InvalidTimestamp {
                    raw: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }
}

/// Body of `POST /publish`.
#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    /// Target stream name. Only used for routing and logging.
    pub stream: String,
    pub key: String,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default)]
    pub attributes: Attributes,
}

impl PublishRequest {
    /// Builds the immutable event, using `now` when no timestamp was given.
    pub fn into_event(self, now: EventTime) -> Result<(String, Event), ParseError> {
        if self.stream.trim().is_empty() {
            return Err(ParseError::EmptyStream);
        }
        if self.key.is_empty() {
            return Err(ParseError::EmptyKey);
        }

        let timestamp = match &self.timestamp {
            Some(ts) => ts.to_millis()?,
            None => now,
        };

        Ok((self.stream, Event::new(self.key, timestamp, self.attributes)))
    }
}

/// Decode a raw publish payload.
pub fn parse_publish(data: &[u8], now: EventTime) -> Result<(String, Event), ParseError> {
    let req: PublishRequest = serde_json::from_slice(data)?;
    req.into_event(now)
}
