//! The canonical event envelope.
//!
//! Every event that crosses the pipeline is carried in an [`Envelope`]:
//! classification (`namespace` + `event-type`), provenance (`source-type` +
//! `source-id`) and an opaque payload. The JSON field names are the wire
//! contract shared by drivers, the sidecar and the Kafka backend.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope format version. Any other value fails validation.
pub const ENVELOPE_VERSION: &str = "0.1";

/// A single event with its routing and provenance metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub namespace: String,

    #[serde(rename = "event-type", default)]
    pub event_type: String,

    #[serde(
        rename = "event-type-version",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub event_type_version: Option<String>,

    #[serde(rename = "cloud-events-version", default)]
    pub envelope_version: String,

    #[serde(rename = "source-type", default)]
    pub source_type: String,

    #[serde(rename = "source-id", default)]
    pub source_id: String,

    #[serde(rename = "event-id", default)]
    pub event_id: String,

    #[serde(rename = "event-time", default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,

    #[serde(rename = "schema-url", default, skip_serializing_if = "Option::is_none")]
    pub schema_url: Option<String>,

    #[serde(
        rename = "content-type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_type: Option<String>,

    /// Free-form string attributes. Also carries propagated trace context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extensions: HashMap<String, String>,

    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Create an envelope with a fresh event ID and the current envelope version.
    pub fn new(
        namespace: impl Into<String>,
        event_type: impl Into<String>,
        source_type: impl Into<String>,
        source_id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            event_type: event_type.into(),
            event_type_version: None,
            envelope_version: ENVELOPE_VERSION.to_string(),
            source_type: source_type.into(),
            source_id: source_id.into(),
            event_id: new_event_id(),
            event_time: None,
            schema_url: None,
            content_type: None,
            extensions: HashMap::new(),
            data,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = Some(event_time);
        self
    }

    pub fn with_event_type_version(mut self, version: impl Into<String>) -> Self {
        self.event_type_version = Some(version.into());
        self
    }

    pub fn with_schema_url(mut self, url: impl Into<String>) -> Self {
        self.schema_url = Some(url.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    /// Routing key used when the caller does not name a topic.
    ///
    /// `"{source_type}.{event_type}"`, e.g. `"vcenter.vm.created"`.
    pub fn default_topic(&self) -> String {
        format!("{}.{}", self.source_type, self.event_type)
    }

    /// Payload bytes as they travel in a raw message body.
    ///
    /// String payloads are sent verbatim; anything else is JSON encoded.
    pub fn data_bytes(&self) -> Vec<u8> {
        match &self.data {
            Value::String(s) => s.as_bytes().to_vec(),
            Value::Null => Vec::new(),
            other => other.to_string().into_bytes(),
        }
    }

    /// Whether [`data_bytes`](Self::data_bytes) produced raw string bytes.
    pub fn data_is_string(&self) -> bool {
        matches!(self.data, Value::String(_))
    }
}

/// Generate a new event ID.
pub fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}
