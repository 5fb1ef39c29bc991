//! Structural and semantic validation for envelopes.
//!
//! Rules are declared once as a table of field constraints; the validator
//! walks the table and reports every failing field, not just the first.
//!
//! # Example
//!
//! ```rust,ignore
//! use dispatch_client::validation::validate;
//!
//! validate(&envelope)?; // ValidationError lists each bad field
//! ```

use std::fmt;
use std::sync::LazyLock;

use reqwest::Url;

use crate::envelope::{Envelope, ENVELOPE_VERSION};

/// Length limits for validated fields.
pub mod limits {
    /// Maximum event type length (e.g., "vm.created").
    pub const MAX_EVENT_TYPE_LENGTH: usize = 128;
    /// Maximum source type length (e.g., "vcenter").
    pub const MAX_SOURCE_TYPE_LENGTH: usize = 32;
    /// Maximum source ID length.
    pub const MAX_SOURCE_ID_LENGTH: usize = 64;
}

/// Error constants for validation failures.
pub mod errmsg {
    pub const REQUIRED: &str = "is required";
    pub const TOO_LONG: &str = "exceeds maximum length";
    pub const TOO_SHORT: &str = "must not be empty when present";
    pub const UNSUPPORTED_VERSION: &str = "unsupported envelope version";
    pub const INVALID_URI: &str = "must be a well-formed absolute URI";
    pub const INVALID_EVENT_TYPE: &str =
        "contains invalid characters (allowed: a-zA-Z, 0-9, _, -, .)";
}

/// A single failing field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every constraint an envelope violated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub errors: Vec<FieldError>,
}

impl ValidationError {
    /// Whether the named field is among the failures.
    pub fn has_field(&self, field: &str) -> bool {
        self.errors.iter().any(|e| e.field == field)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "invalid envelope: {}", parts.join("; "))
    }
}

impl std::error::Error for ValidationError {}

/// Validation failure within a batch, tagged with the envelope's position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event {index} (ID {event_id}): {source}")]
pub struct BatchValidationError {
    pub index: usize,
    pub event_id: String,
    #[source]
    pub source: ValidationError,
}

#[derive(Debug, Clone, Copy)]
enum Constraint {
    /// Present and non-empty.
    Required,
    /// At least one character when present.
    NonEmptyIfPresent,
    MaxLen(usize),
    Equals(&'static str),
    Uri,
    EventTypeToken,
}

type Getter = fn(&Envelope) -> Option<&str>;

struct FieldRule {
    field: &'static str,
    get: Getter,
    constraints: &'static [Constraint],
}

/// Immutable rule table. Safe to share across threads without locking.
pub struct Validator {
    rules: Vec<FieldRule>,
}

impl Validator {
    /// Build the envelope rule table.
    pub fn new() -> Self {
        use Constraint::*;

        let rules = vec![
            FieldRule {
                field: "Namespace",
                get: |e| Some(e.namespace.as_str()),
                constraints: &[Required],
            },
            FieldRule {
                field: "EventType",
                get: |e| Some(e.event_type.as_str()),
                constraints: &[
                    Required,
                    MaxLen(limits::MAX_EVENT_TYPE_LENGTH),
                    EventTypeToken,
                ],
            },
            FieldRule {
                field: "EventTypeVersion",
                get: |e| e.event_type_version.as_deref(),
                constraints: &[NonEmptyIfPresent],
            },
            FieldRule {
                field: "CloudEventsVersion",
                get: |e| Some(e.envelope_version.as_str()),
                constraints: &[Required, Equals(ENVELOPE_VERSION)],
            },
            FieldRule {
                field: "SourceType",
                get: |e| Some(e.source_type.as_str()),
                constraints: &[Required, MaxLen(limits::MAX_SOURCE_TYPE_LENGTH)],
            },
            FieldRule {
                field: "SourceID",
                get: |e| Some(e.source_id.as_str()),
                constraints: &[Required, MaxLen(limits::MAX_SOURCE_ID_LENGTH)],
            },
            FieldRule {
                field: "EventID",
                get: |e| Some(e.event_id.as_str()),
                constraints: &[Required],
            },
            FieldRule {
                field: "SchemaURL",
                get: |e| e.schema_url.as_deref(),
                constraints: &[Uri],
            },
            FieldRule {
                field: "ContentType",
                get: |e| e.content_type.as_deref(),
                constraints: &[NonEmptyIfPresent],
            },
        ];

        Self { rules }
    }

    /// Check one envelope against every rule.
    pub fn validate(&self, envelope: &Envelope) -> Result<(), ValidationError> {
        let mut errors = Vec::new();

        for rule in &self.rules {
            let value = (rule.get)(envelope);
            // Stop at the first broken constraint per field.
            for constraint in rule.constraints {
                if let Some(message) = check(*constraint, value) {
                    errors.push(FieldError {
                        field: rule.field,
                        message,
                    });
                    break;
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { errors })
        }
    }

    /// Check a batch, stopping at the first invalid envelope.
    pub fn validate_all(&self, envelopes: &[Envelope]) -> Result<(), BatchValidationError> {
        for (index, envelope) in envelopes.iter().enumerate() {
            self.validate(envelope)
                .map_err(|source| BatchValidationError {
                    index,
                    event_id: envelope.event_id.clone(),
                    source,
                })?;
        }
        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

fn check(constraint: Constraint, value: Option<&str>) -> Option<String> {
    match (constraint, value) {
        (Constraint::Required, None) => Some(errmsg::REQUIRED.to_string()),
        (Constraint::Required, Some(v)) if v.is_empty() => Some(errmsg::REQUIRED.to_string()),
        (Constraint::Required, Some(_)) => None,

        // Remaining constraints only apply to values that are present.
        (_, None) => None,

        (Constraint::NonEmptyIfPresent, Some(v)) if v.is_empty() => {
            Some(errmsg::TOO_SHORT.to_string())
        }
        (Constraint::NonEmptyIfPresent, Some(_)) => None,

        (Constraint::MaxLen(max), Some(v)) => {
            let len = v.chars().count();
            (len > max).then(|| format!("{} (max: {}, got: {})", errmsg::TOO_LONG, max, len))
        }

        (Constraint::Equals(expected), Some(v)) => (v != expected).then(|| {
            format!(
                "{} (expected: {}, got: {})",
                errmsg::UNSUPPORTED_VERSION,
                expected,
                v
            )
        }),

        (Constraint::Uri, Some(v)) => Url::parse(v)
            .is_err()
            .then(|| errmsg::INVALID_URI.to_string()),

        (Constraint::EventTypeToken, Some(v)) => (!is_event_type_token(v))
            .then(|| errmsg::INVALID_EVENT_TYPE.to_string()),
    }
}

/// Event types are dot-separated tokens: `[A-Za-z0-9_.-]+`.
pub fn is_event_type_token(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

static DEFAULT_VALIDATOR: LazyLock<Validator> = LazyLock::new(Validator::new);

/// Shared validator instance.
pub fn default_validator() -> &'static Validator {
    &DEFAULT_VALIDATOR
}

/// Validate one envelope with the shared validator.
pub fn validate(envelope: &Envelope) -> Result<(), ValidationError> {
    default_validator().validate(envelope)
}

/// Validate a batch with the shared validator.
pub fn validate_all(envelopes: &[Envelope]) -> Result<(), BatchValidationError> {
    default_validator().validate_all(envelopes)
}
