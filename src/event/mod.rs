pub mod parse;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Event time in milliseconds since the Unix epoch.
pub type EventTime = i64;

/// Free-form event attributes as decoded from the publish payload.
pub type Attributes = HashMap<String, serde_json::Value>;

/// Immutable timestamped event record.
///
/// `key` is the record key assigned by the producer (e.g. a user or
/// session id). The aggregation key is derived separately from one of the
/// attributes by the topology's key extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    key: String,
    timestamp: EventTime,
    #[serde(default)]
    attributes: Attributes,
}

impl Event {
    /// Creates a new event.
    pub fn new(key: impl Into<String>, timestamp: EventTime, attributes: Attributes) -> Self {
        Self {
            key: key.into(),
            timestamp,
            attributes,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn timestamp(&self) -> EventTime {
        self.timestamp
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// Returns a single attribute, if present and not null.
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event(key={}, ts={})", self.key, self.timestamp)
    }
}
