//! `POST /` handler: parse, validate, publish.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn, Instrument};

use dispatch_client::trace::{carrier_from_pairs, set_parent};
use dispatch_client::{validate, ParseError, ValidationError};

use crate::bus::BusError;

use super::SidecarState;

/// Why a request was not fully accepted.
///
/// Events before the failing one have already been published and are not
/// rolled back.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Error parsing input: {0}")]
    Parse(#[from] ParseError),

    #[error("No events parsed")]
    Empty,

    #[error("Error validating event with ID {event_id}: {source}")]
    Validation {
        event_id: String,
        #[source]
        source: ValidationError,
    },

    #[error("Error publishing event with ID {event_id}: {source}")]
    Publish {
        event_id: String,
        #[source]
        source: BusError,
    },
}

impl IngestError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Parse(_) | Self::Empty | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::Publish { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Liveness probe.
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// HEAD would otherwise be answered by the GET route.
pub async fn method_not_allowed() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, [(header::ALLOW, "GET,POST")])
}

pub async fn ingest(
    State(state): State<SidecarState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, IngestError> {
    let span = tracing::info_span!(
        "sidecar.ingest",
        tenant = %state.tenant,
        bytes = body.len(),
        events = tracing::field::Empty,
    );
    // Absent trace headers just leave the span as a root.
    let carrier = carrier_from_pairs(
        headers
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v))),
    );
    set_parent(&span, &carrier);

    let result = process(&state, &body).instrument(span).await;
    if let Err(e) = &result {
        warn!(error = %e, status = e.status().as_u16(), "Rejected ingest request");
    }
    result
}

async fn process(state: &SidecarState, body: &[u8]) -> Result<StatusCode, IngestError> {
    let mut reader = body;
    let events = state.parser.parse(&mut reader)?;
    if events.is_empty() {
        return Err(IngestError::Empty);
    }
    tracing::Span::current().record("events", events.len());

    for event in &events {
        validate(event).map_err(|source| IngestError::Validation {
            event_id: event.event_id.clone(),
            source,
        })?;

        let topic = event.default_topic();
        state
            .transport
            .publish(event, &topic, &state.tenant)
            .await
            .map_err(|source| IngestError::Publish {
                event_id: event.event_id.clone(),
                source,
            })?;
        debug!(event_id = %event.event_id, topic = %topic, "Published event");
    }

    Ok(StatusCode::CREATED)
}
