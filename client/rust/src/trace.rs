//! Distributed trace context propagation.
//!
//! Trace context travels as W3C `traceparent`/`tracestate` pairs in a plain
//! string map: HTTP headers, broker message headers, or an envelope's
//! `extensions`. With the `otel` feature disabled every function here is a
//! no-op, so call sites never need their own feature gates.

use std::collections::HashMap;

use crate::envelope::Envelope;

/// String map carrying propagated trace context.
pub type TraceCarrier = HashMap<String, String>;

/// Build a carrier from arbitrary key/value pairs (headers, message properties).
pub fn carrier_from_pairs<'a, I>(pairs: I) -> TraceCarrier
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
        .collect()
}

#[cfg(feature = "otel")]
mod imp {
    use opentelemetry::propagation::{Extractor, Injector};
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    use super::TraceCarrier;

    struct MapInjector<'a>(&'a mut TraceCarrier);

    impl Injector for MapInjector<'_> {
        fn set(&mut self, key: &str, value: String) {
            self.0.insert(key.to_string(), value);
        }
    }

    struct MapExtractor<'a>(&'a TraceCarrier);

    impl Extractor for MapExtractor<'_> {
        fn get(&self, key: &str) -> Option<&str> {
            self.0.get(key).map(String::as_str)
        }

        fn keys(&self) -> Vec<&str> {
            self.0.keys().map(String::as_str).collect()
        }
    }

    fn extract(carrier: &TraceCarrier) -> opentelemetry::Context {
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.extract(&MapExtractor(carrier))
        })
    }

    pub fn inject_context(carrier: &mut TraceCarrier) {
        let cx = tracing::Span::current().context();
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut MapInjector(carrier));
        });
    }

    pub fn set_parent(span: &tracing::Span, carrier: &TraceCarrier) {
        let cx = extract(carrier);
        if cx.span().span_context().is_valid() {
            span.set_parent(cx);
        }
    }

    pub fn link_remote(span: &tracing::Span, carrier: &TraceCarrier) {
        let cx = extract(carrier);
        let remote = cx.span().span_context().clone();
        if remote.is_valid() {
            span.add_link(remote);
        }
    }
}

#[cfg(not(feature = "otel"))]
mod imp {
    use super::TraceCarrier;

    pub fn inject_context(_carrier: &mut TraceCarrier) {}

    pub fn set_parent(_span: &tracing::Span, _carrier: &TraceCarrier) {}

    pub fn link_remote(_span: &tracing::Span, _carrier: &TraceCarrier) {}
}

/// Write the current span's context into `carrier`.
pub fn inject_context(carrier: &mut TraceCarrier) {
    imp::inject_context(carrier);
}

/// Make the remote context in `carrier` the parent of `span`.
///
/// Used where the remote caller is waiting on us (inbound HTTP).
pub fn set_parent(span: &tracing::Span, carrier: &TraceCarrier) {
    imp::set_parent(span, carrier);
}

/// Link `span` to the remote context in `carrier` as follows-from.
///
/// Used on the consume side of a broker, where the publisher has already
/// moved on.
pub fn link_remote(span: &tracing::Span, carrier: &TraceCarrier) {
    imp::link_remote(span, carrier);
}

impl Envelope {
    /// Store the current span's context in `extensions`.
    pub fn inject_trace(&mut self) {
        inject_context(&mut self.extensions);
    }

    /// Link `span` to the context stored in `extensions`.
    pub fn follow_trace(&self, span: &tracing::Span) {
        link_remote(span, &self.extensions);
    }
}
